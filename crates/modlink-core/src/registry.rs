//! Module registry and lifecycle.
//!
//! Each entry pairs a module instance with a readiness flag. `init` runs the
//! module's hook and then marks it ready; `destroy` marks it not ready and then
//! runs the hook. Hook errors are reported to the error sink and never block
//! the readiness transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::errors::ChannelError;
use crate::module::{Module, ModuleDescriptor};
use crate::sink::ErrorSink;

/// A registered module and its readiness.
pub struct RegistryEntry {
    module: Arc<dyn Module>,
    ready: Arc<AtomicBool>,
}

impl RegistryEntry {
    fn new(module: Arc<dyn Module>) -> Self {
        Self {
            module,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Module instance.
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// Module descriptor.
    pub fn descriptor(&self) -> &ModuleDescriptor {
        self.module.descriptor()
    }

    /// Module name.
    pub fn name(&self) -> &str {
        self.descriptor().name()
    }

    /// Whether `init` has completed and `destroy` has not started.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Shared readiness flag, handed to routing providers.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Name → module map.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` under its descriptor name, replacing any previous
    /// entry. The new entry starts not ready.
    pub fn insert(&self, module: Arc<dyn Module>) -> Arc<RegistryEntry> {
        let entry = Arc::new(RegistryEntry::new(module));
        let name = entry.name().to_owned();
        debug!(module = %name, "registering module");
        let _ = self.entries.write().insert(name, Arc::clone(&entry));
        entry
    }

    /// Remove the entry for `name`.
    pub fn remove(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.write().remove(name)
    }

    /// Look up the entry for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.read().get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Run `init` and mark the entry ready. No-op when already ready.
pub async fn init_module(entry: &RegistryEntry, sink: &ErrorSink) {
    if entry.is_ready() {
        return;
    }
    if let Err(err) = entry.module.init().await {
        sink.report(&ChannelError::Remote(err));
    }
    entry.ready.store(true, Ordering::Release);
    info!(module = entry.name(), "module ready");
}

/// Mark the entry not ready and run `destroy`. No-op when not ready.
pub async fn destroy_module(entry: &RegistryEntry, sink: &ErrorSink) {
    if !entry.ready.swap(false, Ordering::AcqRel) {
        return;
    }
    if let Err(err) = entry.module.destroy().await {
        sink.report(&ChannelError::Remote(err));
    }
    info!(module = entry.name(), "module destroyed");
}

// ── Tests ───────────────────────────────────────────────────────────

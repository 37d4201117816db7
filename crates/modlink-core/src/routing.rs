//! Routing table and provider selection.
//!
//! Every module name maps to an ordered list of providers. A provider is a
//! call target tagged with its key (the owning server id) and a live
//! readiness flag. Selection for a call:
//!
//! 1. A string first argument equal to a provider key pins that provider.
//! 2. Otherwise only ready providers are considered: one is picked directly,
//!    several are picked by `route_id(first_arg) % count`, none is an
//!    availability error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::call::{Call, CallRequest};
use crate::errors::{ChannelError, Result};

/// Something that can execute a call.
pub trait CallTarget: Send + Sync {
    /// Dispatch `request` and return a handle to it.
    fn invoke(&self, request: CallRequest) -> Call;
}

/// One provider of a module.
#[derive(Clone)]
pub struct Provider {
    key: String,
    target: Arc<dyn CallTarget>,
    ready: Arc<AtomicBool>,
}

impl Provider {
    /// Provider under `key`, ready while `ready` is set.
    pub fn new(key: impl Into<String>, target: Arc<dyn CallTarget>, ready: Arc<AtomicBool>) -> Self {
        Self {
            key: key.into(),
            target,
            ready,
        }
    }

    /// Provider key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the provider accepts calls.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Dispatch a call to this provider.
    pub fn invoke(&self, request: CallRequest) -> Call {
        self.target.invoke(request)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("key", &self.key)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Module name → providers.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<String, Vec<Provider>>>,
}

impl RoutingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider, replacing the one with the same key in place.
    pub fn insert(&self, module: &str, provider: Provider) {
        let mut routes = self.routes.write();
        let providers = routes.entry(module.to_owned()).or_default();
        if let Some(slot) = providers.iter_mut().find(|p| p.key == provider.key) {
            *slot = provider;
        } else {
            debug!(module, key = %provider.key, "adding provider");
            providers.push(provider);
        }
    }

    /// Remove the provider `key` of `module`.
    pub fn remove(&self, module: &str, key: &str) -> bool {
        let mut routes = self.routes.write();
        let Some(providers) = routes.get_mut(module) else {
            return false;
        };
        let before = providers.len();
        providers.retain(|p| p.key != key);
        let removed = providers.len() != before;
        if providers.is_empty() {
            let _ = routes.remove(module);
        }
        removed
    }

    /// Remove every provider registered under `key`. Returns how many.
    pub fn remove_key(&self, key: &str) -> usize {
        let mut routes = self.routes.write();
        let mut removed = 0;
        for providers in routes.values_mut() {
            let before = providers.len();
            providers.retain(|p| p.key != key);
            removed += before - providers.len();
        }
        routes.retain(|_, providers| !providers.is_empty());
        removed
    }

    /// Re-key the provider `old` of `module` as `new`, dropping any other
    /// provider already holding `new`.
    pub fn rename(&self, module: &str, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut routes = self.routes.write();
        let Some(providers) = routes.get_mut(module) else {
            return;
        };
        if !providers.iter().any(|p| p.key == old) {
            return;
        }
        providers.retain(|p| p.key != new);
        if let Some(slot) = providers.iter_mut().find(|p| p.key == old) {
            new.clone_into(&mut slot.key);
        }
    }

    /// Whether `module` has any provider.
    pub fn has_route(&self, module: &str) -> bool {
        self.routes.read().contains_key(module)
    }

    /// Providers of `module`, in registration order.
    pub fn providers(&self, module: &str) -> Vec<Provider> {
        self.routes.read().get(module).cloned().unwrap_or_default()
    }

    /// Module names with at least one provider, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick the provider for a call on `module` whose first argument is
    /// `route`.
    ///
    /// A missing or null first argument routes like the empty string.
    pub fn select(&self, module: &str, route: Option<&Value>) -> Result<Provider> {
        let providers = self.providers(module);
        let empty = Value::String(String::new());
        let route = match route {
            None | Some(Value::Null) => &empty,
            Some(value) => value,
        };

        if let Value::String(key) = route {
            if let Some(pinned) = providers.iter().find(|p| p.key == *key) {
                return Ok(pinned.clone());
            }
        }

        let mut ready: Vec<Provider> = providers.into_iter().filter(Provider::is_ready).collect();
        match ready.len() {
            0 => Err(ChannelError::unavailable(module)),
            1 => Ok(ready.swap_remove(0)),
            count => {
                let index = route_id(Some(route)) % count as u64;
                let index = usize::try_from(index).unwrap_or_default();
                Ok(ready.swap_remove(index))
            }
        }
    }
}

/// Map a routing argument to a number.
///
/// Numbers use their integral magnitude, booleans 0/1, strings their
/// [`string_hash`], arrays their length, objects the hash of their sorted key
/// names (`{a,b}`), null or a missing argument 0.
///
/// Negative and fractional numbers map to their truncated absolute value, so
/// they still select a provider. JavaScript peers computing `n % count` on
/// such keys select none and report the module as unavailable.
pub fn route_id(value: Option<&Value>) -> u64 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(b)) => u64::from(*b),
        Some(Value::Number(n)) => number_magnitude(n),
        Some(Value::String(s)) => u64::from(string_hash(s)),
        Some(Value::Array(items)) => items.len() as u64,
        Some(Value::Object(map)) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            u64::from(string_hash(&format!("{{{}}}", keys.join(","))))
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn number_magnitude(n: &serde_json::Number) -> u64 {
    if let Some(u) = n.as_u64() {
        u
    } else if let Some(i) = n.as_i64() {
        i.unsigned_abs()
    } else {
        n.as_f64().map_or(0, |f| f.abs().trunc() as u64)
    }
}

/// djb2-xor hash over UTF-16 code units, iterated from the last unit.
#[allow(clippy::cast_sign_loss)]
pub fn string_hash(s: &str) -> u32 {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut hash: i32 = 5381;
    for unit in units.iter().rev() {
        hash = hash.wrapping_mul(33) ^ i32::from(*unit);
    }
    hash as u32
}

// ── Tests ───────────────────────────────────────────────────────────

//! Endpoint error sink.
//!
//! Errors that happen outside of any call continuation (malformed frames,
//! socket failures, lifecycle hook errors, subscriber failures) are handed to
//! the sink. The default sink logs them; embedders can install their own.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::ChannelError;

type Handler = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Replaceable error handler shared by an endpoint and its tasks.
#[derive(Clone)]
pub struct ErrorSink {
    handler: Arc<RwLock<Handler>>,
}

impl ErrorSink {
    /// Sink that logs through `tracing::error!`.
    pub fn new() -> Self {
        Self {
            handler: Arc::new(RwLock::new(Arc::new(log_error))),
        }
    }

    /// Replace the handler.
    pub fn set(&self, handler: impl Fn(&ChannelError) + Send + Sync + 'static) {
        *self.handler.write() = Arc::new(handler);
    }

    /// Restore the logging handler.
    pub fn reset(&self) {
        *self.handler.write() = Arc::new(log_error);
    }

    /// Deliver an error to the current handler.
    pub fn report(&self, error: &ChannelError) {
        let handler = self.handler.read().clone();
        handler(error);
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}

fn log_error(error: &ChannelError) {
    tracing::error!(code = error.code(), error = %error, "channel error");
}

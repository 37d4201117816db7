//! Operations applied to a call and how a closed call answers them.

use serde_json::Value;

use crate::errors::{ChannelError, RemoteError, Result};
use crate::protocol::{Event, IterResult};

/// A single operation on a call handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Await the call's own result.
    Invoke,
    /// Generator `next(input)`.
    Next(Value),
    /// Generator `return(value)`.
    Return(Value),
    /// Generator `throw(error)`.
    Throw(RemoteError),
}

impl Operation {
    /// Wire event for the operation.
    pub fn event(&self) -> Event {
        match self {
            Self::Invoke => Event::Invoke,
            Self::Next(_) => Event::Yield,
            Self::Return(_) => Event::Return,
            Self::Throw(_) => Event::Throw,
        }
    }

    /// Input value carried in the request's argument slot.
    pub fn input(&self) -> Value {
        match self {
            Self::Invoke => Value::Null,
            Self::Next(v) | Self::Return(v) => v.clone(),
            Self::Throw(err) => err.to_value(),
        }
    }

    /// Rebuild a generator operation from a request frame.
    pub fn from_request(event: Event, input: Value) -> Option<Self> {
        match event {
            Event::Yield => Some(Self::Next(input)),
            Event::Return => Some(Self::Return(input)),
            Event::Throw => Some(Self::Throw(RemoteError::from_value(input))),
            _ => None,
        }
    }

    /// Answer for a call that has already closed. `stored` is what awaiting
    /// the call settled with.
    pub fn settle_closed(&self, stored: Result<Value>) -> Result<Value> {
        match self {
            Self::Invoke => stored,
            Self::Next(_) => Ok(IterResult::done(Value::Null).to_value()),
            Self::Return(v) => Ok(IterResult::done(v.clone()).to_value()),
            Self::Throw(err) => Err(ChannelError::Remote(err.clone())),
        }
    }
}

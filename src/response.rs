//! Immutable unit results.
//!
//! A [`Response`] is produced every time a [`Session`](crate::Session) settles.
//! Successful responses carry a type-erased [`Payload`]; failed ones carry the
//! [`Error`] that ended the unit.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A type-erased, cheaply cloneable value delivered by `Session::done`.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether the value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// The [`TypeId`] of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.type_name)
            .finish()
    }
}

/// Links a response to the step and unit that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId {
    /// Identifier of the session that settled.
    pub session: u64,
    /// Step position in the engine's sequence.
    pub step: usize,
    /// Unit position inside the step.
    pub unit: usize,
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} (step {}, unit {})", self.session, self.step, self.unit)
    }
}

#[derive(Debug, Clone)]
enum Body {
    Data(Payload),
    Error(Arc<Error>),
}

/// The immutable outcome of one unit invocation.
#[derive(Debug, Clone)]
pub struct Response {
    id: ResponseId,
    body: Body,
}

impl Response {
    pub(crate) fn success(id: ResponseId, payload: Payload) -> Self {
        Self {
            id,
            body: Body::Data(payload),
        }
    }

    pub(crate) fn failure(id: ResponseId, error: Error) -> Self {
        Self {
            id,
            body: Body::Error(Arc::new(error)),
        }
    }

    /// Which session, step and unit produced this response.
    pub fn id(&self) -> ResponseId {
        self.id
    }

    /// `true` for responses created by `Session::done`.
    pub fn is_success(&self) -> bool {
        matches!(self.body, Body::Data(_))
    }

    /// The payload of a successful response.
    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            Body::Data(payload) => Some(payload),
            Body::Error(_) => None,
        }
    }

    /// Borrow the payload if this response succeeded with a `T`.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.payload().and_then(Payload::downcast_ref::<T>)
    }

    /// The error of a failed response.
    pub fn error(&self) -> Option<&Error> {
        match &self.body {
            Body::Data(_) => None,
            Body::Error(error) => Some(error),
        }
    }
}

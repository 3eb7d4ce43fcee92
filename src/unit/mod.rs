//! The work unit abstraction and its fundamental implementations.
//!
//! This module defines the [`Unit`] trait, the capability a caller implements
//! to perform one asynchronous action, along with [`FnUnit`] for
//! closure-based units and [`UnitExt`] for decorating units fluently.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::{Payload, Response, Session};

pub mod lambda;
pub mod nested;
pub mod retry;
pub mod switch;

/// One asynchronous action inside a flow.
///
/// `on_call` must return promptly and eventually report exactly one outcome
/// through [`Session::done`] or [`Session::fail`], from any thread. The two
/// hooks are observers: the engine calls them, and they must not settle the
/// session themselves.
///
/// # Example
///
/// ```rust
/// use reqflow::{Session, Unit};
///
/// struct Ping;
///
/// impl Unit for Ping {
///     fn on_call(&self, session: Session) {
///         session.done("pong".to_string());
///     }
/// }
/// ```
pub trait Unit: Send + Sync {
    /// Start the work and arrange for the session to be settled.
    fn on_call(&self, session: Session);

    /// Called after a successful `done`, before the step can complete.
    fn on_next(&self, _session: &Session, _data: &Payload) {}

    /// Called when this unit fails, before the failure propagates.
    fn on_failure(&self, _session: &Session, _error: &Response) {}

    /// The payload type `done` must deliver. `None` disables validation.
    fn expected_type(&self) -> Option<ExpectedType> {
        None
    }

    /// Returns a human-readable name for this unit. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A shareable, type-erased unit as stored in a flow.
pub type SharedUnit = Arc<dyn Unit>;

impl<U: Unit + ?Sized> Unit for Arc<U> {
    fn on_call(&self, session: Session) {
        (**self).on_call(session)
    }

    fn on_next(&self, session: &Session, data: &Payload) {
        (**self).on_next(session, data)
    }

    fn on_failure(&self, session: &Session, error: &Response) {
        (**self).on_failure(session, error)
    }

    fn expected_type(&self) -> Option<ExpectedType> {
        (**self).expected_type()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A runtime type declaration checked against every successful payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedType {
    id: TypeId,
    name: &'static str,
}

impl ExpectedType {
    /// Expect payloads of type `T`.
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Whether `payload` holds the expected type.
    pub fn matches(&self, payload: &Payload) -> bool {
        payload.type_id() == self.id
    }

    /// The expected type's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

type CallFn = Box<dyn Fn(Session) + Send + Sync>;
type NextFn = Box<dyn Fn(&Session, &Payload) + Send + Sync>;
type FailureFn = Box<dyn Fn(&Session, &Response) + Send + Sync>;

/// A unit constructed from closures.
///
/// # Example
///
/// ```rust
/// use reqflow::FnUnit;
///
/// let unit = FnUnit::new(|session| session.done(42i64))
///     .expecting::<i64>()
///     .named("answer");
/// ```
pub struct FnUnit {
    call: CallFn,
    next: Option<NextFn>,
    failure: Option<FailureFn>,
    expected: Option<ExpectedType>,
    name: String,
}

impl FnUnit {
    /// Create a unit whose `on_call` runs `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        Self {
            call: Box::new(f),
            next: None,
            failure: None,
            expected: None,
            name: "fn_unit".to_string(),
        }
    }

    /// Require successful payloads to be of type `T`.
    pub fn expecting<T: Any>(mut self) -> Self {
        self.expected = Some(ExpectedType::of::<T>());
        self
    }

    /// Install an `on_next` hook.
    pub fn with_on_next<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &Payload) + Send + Sync + 'static,
    {
        self.next = Some(Box::new(f));
        self
    }

    /// Install an `on_failure` hook.
    pub fn with_on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session, &Response) + Send + Sync + 'static,
    {
        self.failure = Some(Box::new(f));
        self
    }

    /// Set a human-readable name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Unit for FnUnit {
    fn on_call(&self, session: Session) {
        (self.call)(session)
    }

    fn on_next(&self, session: &Session, data: &Payload) {
        if let Some(next) = &self.next {
            next(session, data);
        }
    }

    fn on_failure(&self, session: &Session, error: &Response) {
        if let Some(failure) = &self.failure {
            failure(session, error);
        }
    }

    fn expected_type(&self) -> Option<ExpectedType> {
        self.expected
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Extension trait providing decoration methods for all [`Unit`] implementors.
pub trait UnitExt: Unit + Sized + 'static {
    /// Re-run this unit up to `max_retries` more times after a failure.
    ///
    /// Retries run inside a private engine and are not gated by pausing the
    /// enclosing flow.
    fn retry(self, max_retries: u32) -> retry::Retry {
        retry::Retry::new(self, max_retries)
    }

    /// Erase the concrete unit type.
    fn shared(self) -> SharedUnit {
        Arc::new(self)
    }
}

impl<T: Unit + Sized + 'static> UnitExt for T {}

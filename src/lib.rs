//! # reqflow
//!
//! In-process orchestration of callback-style asynchronous work.
//!
//! A [`Flow`] describes an ordered sequence of steps. Each step is a fan-out
//! group of [`Unit`]s that run concurrently and are joined before the next
//! step starts. Units report through a [`Session`] whenever their underlying
//! I/O finishes, from any thread or runtime. The resulting [`FlowEngine`]
//! aggregates every [`Response`] into a [`History`], and supports pause,
//! resume, cancellation, retries, runtime branch selection and nested flows.
//!
//! ## Core Concepts
//!
//! - **Unit**: one asynchronous action (`on_call` plus optional hooks)
//! - **Session**: the handle a unit settles with `done` or `fail`
//! - **Response**: immutable outcome of a unit
//! - **Flow**: cloneable blueprint and builder
//! - **FlowEngine**: a single run of a flow, driven by a state machine
//! - **Retry**: decorator re-running a unit in a private engine
//! - **FlowUnit**: a whole flow used as one unit
//! - **ExecutionContext**: shared metrics and structured trace
//!
//! ## Example
//!
//! ```rust
//! use reqflow::{Flow, FlowState, FnUnit, UnitExt};
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//!
//! let engine = Flow::new()
//!     .then(FnUnit::new(|session| session.done(1i32)))
//!     .then_all(vec![
//!         FnUnit::new(|session| session.done(2i32)).shared(),
//!         FnUnit::new(|session| session.done(3i32)).shared(),
//!     ])
//!     .on_success(move |_engine, history| {
//!         sink.lock().unwrap().extend(history.data_list::<i32>().into_iter().copied());
//!     })
//!     .build();
//!
//! engine.start().unwrap();
//! assert_eq!(engine.state(), FlowState::Done);
//! assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod history;
pub mod metrics;
pub mod response;
pub mod session;
pub mod unit;

pub use context::ExecutionContext;
pub use engine::{FlowEngine, FlowState};
pub use error::{Error, Result};
pub use events::{FlowEvent, TraceEntry};
pub use flow::Flow;
pub use history::History;
pub use metrics::FlowMetrics;
pub use response::{Payload, Response, ResponseId};
pub use session::Session;

// Re-export unit types
pub use unit::lambda::{AsyncUnit, LambdaUnit, Spawned};
pub use unit::nested::FlowUnit;
pub use unit::retry::Retry;
pub use unit::switch::{select, MissingBranch, Selector};
pub use unit::{ExpectedType, FnUnit, SharedUnit, Unit, UnitExt};

//! Async units executed on the tokio runtime.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::Unit;
use crate::{Error, Result, Session};

/// A unit whose work is an `async fn` returning its result.
///
/// Wrap it in [`Spawned`] to use it in a flow: each call is spawned onto the
/// current tokio runtime and its result reported through the session.
///
/// # Example
///
/// ```rust
/// use reqflow::{AsyncUnit, Session, Spawned};
///
/// struct Fetch;
///
/// #[async_trait::async_trait]
/// impl AsyncUnit for Fetch {
///     type Output = String;
///
///     async fn call(&self, _session: &Session) -> reqflow::Result<String> {
///         Ok("body".to_string())
///     }
/// }
///
/// let unit = Spawned::new(Fetch);
/// ```
#[async_trait]
pub trait AsyncUnit: Send + Sync + 'static {
    /// The payload delivered on success.
    type Output: Any + Send + Sync;

    /// Perform the work.
    async fn call(&self, session: &Session) -> Result<Self::Output>;
}

/// Adapts an [`AsyncUnit`] into a [`Unit`].
pub struct Spawned<U> {
    unit: Arc<U>,
}

impl<U: AsyncUnit> Spawned<U> {
    /// Wrap an async unit.
    pub fn new(unit: U) -> Self {
        Self {
            unit: Arc::new(unit),
        }
    }
}

impl<U: AsyncUnit> Unit for Spawned<U> {
    fn on_call(&self, session: Session) {
        let unit = Arc::clone(&self.unit);
        let caller = session.clone();
        spawn_reporting(session, async move { unit.call(&caller).await });
    }

    fn name(&self) -> &str {
        std::any::type_name::<U>()
    }
}

/// A unit constructed from an async closure.
///
/// The closure receives a clone of the session, so it can inspect the engine
/// history or the retry count before doing its work.
///
/// # Example
///
/// ```rust
/// use reqflow::LambdaUnit;
///
/// let unit = LambdaUnit::new(|session| async move {
///     Ok::<u32, reqflow::Error>(session.retry_count() + 1)
/// });
/// ```
pub struct LambdaUnit<O, F> {
    f: F,
    _phantom: PhantomData<fn() -> O>,
}

impl<O, F, Fut> LambdaUnit<O, F>
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: Any + Send + Sync,
{
    /// Create a new `LambdaUnit` from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

impl<O, F, Fut> Unit for LambdaUnit<O, F>
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: Any + Send + Sync,
{
    fn on_call(&self, session: Session) {
        let work = (self.f)(session.clone());
        spawn_reporting(session, work);
    }
}

fn spawn_reporting<T, Fut>(session: Session, work: Fut)
where
    T: Any + Send + Sync,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match work.await {
                    Ok(data) => session.done(data),
                    Err(err) => session.fail(err),
                }
            });
        }
        Err(err) => {
            error!(session = session.id(), "no tokio runtime to run unit: {err}");
            session.fail(Error::Execution(format!("no tokio runtime: {err}")));
        }
    }
}

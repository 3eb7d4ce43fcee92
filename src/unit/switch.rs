//! Runtime branch selection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SharedUnit, Unit};
use crate::{Error, FlowEngine, Session};

/// Picks the unit for one branch of a switch step when that step starts.
pub type Selector = Arc<dyn Fn(&FlowEngine) -> Option<SharedUnit> + Send + Sync>;

/// Wrap a closure as a [`Selector`].
///
/// # Example
///
/// ```rust
/// use reqflow::{select, Flow, FnUnit, UnitExt};
///
/// let flow = Flow::new()
///     .then(FnUnit::new(|session| session.done(3u32)))
///     .switch([
///         select(|engine| {
///             let big = engine.last_data::<u32>().unwrap_or_default() > 2;
///             let unit = FnUnit::new(move |session| {
///                 session.done(if big { "happy" } else { "sad" })
///             });
///             Some(unit.shared())
///         }),
///         select(|_| None),
///     ]);
/// ```
pub fn select<F>(f: F) -> Selector
where
    F: Fn(&FlowEngine) -> Option<SharedUnit> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a switch branch does when its selector returns `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingBranch {
    /// The branch succeeds immediately with a `()` payload.
    #[default]
    Skip,
    /// The branch fails with [`Error::NoBranchSelected`].
    Fail,
}

struct Skip;

impl Unit for Skip {
    fn on_call(&self, session: Session) {
        session.done(());
    }

    fn name(&self) -> &str {
        "skip"
    }
}

struct NoBranch {
    branch: usize,
}

impl Unit for NoBranch {
    fn on_call(&self, session: Session) {
        session.fail(Error::NoBranchSelected {
            branch: self.branch,
        });
    }

    fn name(&self) -> &str {
        "no_branch"
    }
}

/// Ask every selector for its unit, substituting per `policy`.
pub(crate) fn resolve(
    selectors: &[Selector],
    engine: &FlowEngine,
    policy: MissingBranch,
) -> Vec<SharedUnit> {
    selectors
        .iter()
        .enumerate()
        .map(|(branch, selector)| {
            selector(engine).unwrap_or_else(|| {
                debug!(flow = %engine.name(), branch, ?policy, "selector picked no unit");
                match policy {
                    MissingBranch::Skip => Arc::new(Skip) as SharedUnit,
                    MissingBranch::Fail => Arc::new(NoBranch { branch }),
                }
            })
        })
        .collect()
}

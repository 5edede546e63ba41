use anyhow::{Result, bail};

use crate::engine::AnalysisContext;
use crate::report::Finding;
use crate::summary::{Diagnostic, SummaryRun};

// One module per checker directory, generated by build.rs.
include!(concat!(env!("OUT_DIR"), "/checker_modules.rs"));

/// Identity of a checker as listed in the SARIF driver.
#[derive(Clone, Debug)]
pub(crate) struct RuleMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
}

/// Findings and driver diagnostics of one checker run.
#[derive(Default)]
pub(crate) struct RuleOutput {
    pub(crate) findings: Vec<Finding>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl<S> From<SummaryRun<S>> for RuleOutput {
    fn from(run: SummaryRun<S>) -> Self {
        Self {
            findings: run.findings,
            diagnostics: run.diagnostics,
        }
    }
}

/// A checker over the whole program. Checkers are stateless; everything they
/// need lives in the shared [`AnalysisContext`].
pub(crate) trait Rule: Sync {
    fn metadata(&self) -> RuleMetadata;
    fn run(&self, context: &AnalysisContext) -> Result<RuleOutput>;
}

pub(crate) struct CheckerRegistration {
    pub(crate) build: fn() -> Box<dyn Rule>,
}

inventory::collect!(CheckerRegistration);

/// Register a `Default` checker type; it is picked up by [`select_checkers`].
#[macro_export]
macro_rules! register_checker {
    ($checker:ty) => {
        inventory::submit! {
            $crate::rules::CheckerRegistration {
                build: || Box::new(<$checker>::default()),
            }
        }
    };
}

/// Registered checkers ordered by id, narrowed to `requested` unless it is empty.
/// Ids match case-insensitively; an id no checker carries is an error.
pub(crate) fn select_checkers(requested: &[String]) -> Result<Vec<Box<dyn Rule>>> {
    let mut checkers: Vec<Box<dyn Rule>> = inventory::iter::<CheckerRegistration>
        .into_iter()
        .map(|registration| (registration.build)())
        .collect();
    checkers.sort_by_key(|checker| checker.metadata().id);

    let matches = |checker: &dyn Rule, id: &str| checker.metadata().id.eq_ignore_ascii_case(id);
    if let Some(unknown) = requested
        .iter()
        .find(|id| !checkers.iter().any(|checker| matches(checker.as_ref(), id.as_str())))
    {
        bail!("unknown checker: {unknown}");
    }
    if !requested.is_empty() {
        checkers.retain(|checker| requested.iter().any(|id| matches(checker.as_ref(), id.as_str())));
    }
    Ok(checkers)
}

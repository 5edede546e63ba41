use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use opentelemetry::{Context as OtelContext, KeyValue};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::callgraph::{MethodId, Scc};
use crate::engine::AnalysisContext;
use crate::ir::{Class, Method};
use crate::report::Finding;
use crate::telemetry::{method_attribute, record_event, scc_attributes};

/// Outcome class of an exposed diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum DiagnosticCategory {
    InternalSkip,
    SoundnessFallback,
    Success,
}

impl DiagnosticCategory {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DiagnosticCategory::InternalSkip => "internal-skip",
            DiagnosticCategory::SoundnessFallback => "soundness-fallback",
            DiagnosticCategory::Success => "success",
        }
    }
}

/// Driver-level message about one method or one checker run.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Diagnostic {
    pub(crate) category: DiagnosticCategory,
    pub(crate) checker: &'static str,
    pub(crate) method: Option<MethodId>,
    pub(crate) message: String,
}

/// Publish-once summary cache for one checker.
pub(crate) struct SummaryStore<S> {
    entries: DashMap<MethodId, Arc<S>>,
}

impl<S> SummaryStore<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Publish a final summary; a second publish for the same method is rejected.
    pub(crate) fn publish(&self, method: MethodId, summary: S) -> bool {
        match self.entries.entry(method) {
            Entry::Occupied(entry) => {
                warn!(method = %entry.key(), "summary already published, keeping the first one");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(summary));
                true
            }
        }
    }

    pub(crate) fn get(&self, method: &MethodId) -> Option<Arc<S>> {
        self.entries
            .get(method)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Method handed to a checker together with its declaration.
pub(crate) struct MethodTarget<'a> {
    pub(crate) id: &'a MethodId,
    pub(crate) class: &'a Class,
    pub(crate) method: &'a Method,
}

/// Summary and findings computed for one method.
pub(crate) struct MethodOutcome<S> {
    pub(crate) summary: S,
    pub(crate) findings: Vec<Finding>,
    /// Worklist block visits spent reaching the fixpoint.
    pub(crate) block_visits: usize,
}

/// Per-checker domain plugged into the bottom-up driver.
pub(crate) trait SummaryAnalysis: Sync {
    type Summary: Clone + Debug + Eq + Send + Sync;

    fn checker_id(&self) -> &'static str;

    /// Worst-case summary used for unknown callees, failures, and non-convergence.
    fn unknown_summary(&self, context: &AnalysisContext, method: &MethodId) -> Self::Summary;

    fn analyze_method(
        &self,
        context: &AnalysisContext,
        target: &MethodTarget<'_>,
        callees: &SummaryView<'_, Self>,
    ) -> Result<MethodOutcome<Self::Summary>>;
}

/// Callee summaries visible while analyzing one SCC member.
pub(crate) struct SummaryView<'a, A: SummaryAnalysis + ?Sized> {
    context: &'a AnalysisContext,
    analysis: &'a A,
    store: &'a SummaryStore<A::Summary>,
    pending: &'a BTreeMap<MethodId, A::Summary>,
}

impl<A: SummaryAnalysis + ?Sized> SummaryView<'_, A> {
    /// Latest summary for `method`; SCC members not yet computed read as unknown.
    pub(crate) fn summary(&self, method: &MethodId) -> A::Summary {
        if let Some(summary) = self.pending.get(method) {
            return summary.clone();
        }
        if let Some(summary) = self.store.get(method) {
            return summary.as_ref().clone();
        }
        self.analysis.unknown_summary(self.context, method)
    }
}

/// Everything one checker produced over the whole call graph.
pub(crate) struct SummaryRun<S> {
    pub(crate) store: SummaryStore<S>,
    pub(crate) findings: Vec<Finding>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

struct SccOutcome {
    findings: Vec<Finding>,
    diagnostics: Vec<Diagnostic>,
    block_visits: usize,
}

/// Compute summaries bottom-up, one dependency wave at a time on the worker pool.
pub(crate) fn compute_summaries<A: SummaryAnalysis>(
    context: &AnalysisContext,
    analysis: &A,
) -> Result<SummaryRun<A::Summary>> {
    let store = SummaryStore::new();
    let mut findings = Vec::new();
    let mut diagnostics = Vec::new();
    let mut block_visits = 0;
    let waves = context.call_graph.waves();
    let checker = analysis.checker_id();

    for (index, wave) in waves.iter().enumerate() {
        let attributes = [
            KeyValue::new("summa.checker", checker),
            KeyValue::new("summa.wave", index as i64),
            KeyValue::new("summa.scc_count", wave.len() as i64),
        ];
        let outcomes: Vec<SccOutcome> = context.with_span("wave", &attributes, || {
            let wave_cx = OtelContext::current();
            context.pool().install(|| {
                wave.par_iter()
                    .map(|scc| {
                        context.with_span_under(&wave_cx, "scc", &scc_attributes(checker, scc), || {
                            analyze_scc(context, analysis, &store, scc)
                        })
                    })
                    .collect()
            })
        });
        for outcome in outcomes {
            findings.extend(outcome.findings);
            diagnostics.extend(outcome.diagnostics);
            block_visits += outcome.block_visits;
        }
        debug!(checker, wave = index, sccs = wave.len(), "wave finished");
    }

    diagnostics.sort();
    diagnostics.push(Diagnostic {
        category: DiagnosticCategory::Success,
        checker,
        method: None,
        message: format!(
            "summarized {} methods in {} waves, {} block visits",
            store.len(),
            waves.len(),
            block_visits
        ),
    });
    Ok(SummaryRun {
        store,
        findings,
        diagnostics,
    })
}

fn analyze_scc<A: SummaryAnalysis>(
    context: &AnalysisContext,
    analysis: &A,
    store: &SummaryStore<A::Summary>,
    scc: &Scc,
) -> SccOutcome {
    let checker = analysis.checker_id();
    let max_passes = if scc.recursive {
        context.config.max_scc_passes.max(1)
    } else {
        1
    };

    let mut current: BTreeMap<MethodId, A::Summary> = BTreeMap::new();
    let mut findings = Vec::new();
    let mut diagnostics = Vec::new();
    let mut converged = false;
    let mut block_visits = 0;
    for pass in 1..=max_passes {
        let previous = current;
        let view = SummaryView {
            context,
            analysis,
            store,
            pending: &previous,
        };
        let mut next = BTreeMap::new();
        findings = Vec::new();
        diagnostics = Vec::new();
        for member in &scc.members {
            let (summary, member_findings) = match analyze_member(context, analysis, member, &view)
            {
                Ok(outcome) => {
                    block_visits += outcome.block_visits;
                    (outcome.summary, outcome.findings)
                }
                Err(error) => {
                    warn!(checker, method = %member, "skipping method: {error:#}");
                    diagnostics.push(Diagnostic {
                        category: DiagnosticCategory::InternalSkip,
                        checker,
                        method: Some(member.clone()),
                        message: format!("{error:#}"),
                    });
                    (analysis.unknown_summary(context, member), Vec::new())
                }
            };
            next.insert(member.clone(), summary);
            findings.extend(member_findings);
        }

        let stable = !scc.recursive || next == previous;
        current = next;
        if stable {
            debug!(checker, passes = pass, members = scc.members.len(), "SCC converged");
            record_event("converged", vec![KeyValue::new("summa.passes", pass as i64)]);
            converged = true;
            break;
        }
    }

    if converged {
        for (method, summary) in current {
            store.publish(method, summary);
        }
        return SccOutcome {
            findings,
            diagnostics,
            block_visits,
        };
    }

    warn!(
        checker,
        members = scc.members.len(),
        max_passes,
        "SCC did not converge, falling back to worst-case summaries"
    );
    for member in &scc.members {
        record_event(
            "soundness_fallback",
            vec![
                method_attribute(member),
                KeyValue::new("summa.max_passes", max_passes as i64),
            ],
        );
        store.publish(member.clone(), analysis.unknown_summary(context, member));
        diagnostics.push(Diagnostic {
            category: DiagnosticCategory::SoundnessFallback,
            checker,
            method: Some(member.clone()),
            message: format!("recursive summaries did not converge within {max_passes} passes"),
        });
    }
    SccOutcome {
        findings: Vec::new(),
        diagnostics,
        block_visits,
    }
}

fn analyze_member<A: SummaryAnalysis>(
    context: &AnalysisContext,
    analysis: &A,
    member: &MethodId,
    view: &SummaryView<'_, A>,
) -> Result<MethodOutcome<A::Summary>> {
    let class = context
        .classpath
        .class(&member.class_name)
        .ok_or_else(|| anyhow::anyhow!("class {} is not indexed", member.class_name))?;
    let method = class
        .method(&member.name, &member.descriptor)
        .ok_or_else(|| anyhow::anyhow!("method {member} is not indexed"))?;
    let target = MethodTarget {
        id: member,
        class,
        method,
    };
    analysis.analyze_method(context, &target, view)
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::{Context as OtelContext, KeyValue};
use serde_sarif::sarif::{
    Artifact, MultiformatMessageString, ReportingDescriptor, Result as SarifResult,
};
use tracing::info;

use crate::callgraph::{CallGraph, MethodId, build_call_graph};
use crate::classpath::{ClasspathIndex, resolve_classpath};
use crate::dataflow::worklist::InstructionRef;
use crate::ir::{CallSite, Program};
use crate::models::MethodModel;
use crate::report::{Finding, apply_suppressions, sarif_result, surface};
use crate::rules::{Rule, RuleMetadata, select_checkers};
use crate::summary::Diagnostic;
use crate::telemetry::{Telemetry, with_span};

/// Default cap on fixpoint passes over one recursive SCC.
pub(crate) const DEFAULT_MAX_SCC_PASSES: usize = 8;

/// Knobs shared by every checker run.
#[derive(Clone, Debug)]
pub(crate) struct AnalysisConfig {
    /// Worker threads; 0 lets rayon pick.
    pub(crate) jobs: usize,
    pub(crate) max_scc_passes: usize,
    pub(crate) include_suppressed: bool,
    /// Checker ids to run, case-insensitive; empty runs all of them.
    pub(crate) checkers: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            max_scc_passes: DEFAULT_MAX_SCC_PASSES,
            include_suppressed: false,
            checkers: Vec::new(),
        }
    }
}

/// Inputs shared by analysis rules.
pub(crate) struct AnalysisContext {
    pub(crate) classpath: ClasspathIndex,
    pub(crate) call_graph: CallGraph,
    pub(crate) config: AnalysisConfig,
    pool: rayon::ThreadPool,
    artifact_uris: BTreeMap<i64, String>,
    telemetry: Option<Arc<Telemetry>>,
}

/// Timing breakdown for context construction.
pub(crate) struct ContextTimings {
    pub(crate) classpath_duration_ms: u128,
    pub(crate) call_graph_duration_ms: u128,
}

/// Analysis engine that executes configured rules.
pub(crate) struct Engine {
    rules: Vec<Box<dyn Rule>>,
}

impl Engine {
    pub(crate) fn new(config: &AnalysisConfig) -> Result<Self> {
        Ok(Self {
            rules: select_checkers(&config.checkers)?,
        })
    }

    pub(crate) fn analyze(&self, context: &AnalysisContext) -> Result<EngineOutput> {
        let mut rules = Vec::new();
        let mut findings = Vec::new();
        let mut diagnostics = Vec::new();

        for rule in &self.rules {
            let metadata = rule.metadata();
            rules.push(rule_descriptor(&metadata));
            let started_at = Instant::now();
            let output = context.with_span(
                "checker",
                &[KeyValue::new("summa.checker", metadata.id)],
                || rule.run(context),
            )?;
            info!(
                checker = metadata.id,
                findings = output.findings.len(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "checker finished"
            );
            findings.extend(output.findings);
            diagnostics.extend(output.diagnostics);
        }

        apply_suppressions(&context.classpath, &mut findings);
        let findings = surface(findings, context.config.include_suppressed);
        let results = findings.iter().map(sarif_result).collect();

        Ok(EngineOutput {
            rules,
            results,
            findings,
            diagnostics,
        })
    }
}

/// Aggregated SARIF payload from rule execution.
pub(crate) struct EngineOutput {
    pub(crate) rules: Vec<ReportingDescriptor>,
    pub(crate) results: Vec<SarifResult>,
    pub(crate) findings: Vec<Finding>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

#[cfg(test)]
pub(crate) fn build_context(program: Program, config: AnalysisConfig) -> Result<AnalysisContext> {
    let (context, _) = build_context_with_timings(program, &[], config, None)?;
    Ok(context)
}

pub(crate) fn build_context_with_timings(
    program: Program,
    artifacts: &[Artifact],
    config: AnalysisConfig,
    telemetry: Option<Arc<Telemetry>>,
) -> Result<(AnalysisContext, ContextTimings)> {
    let classpath_started_at = Instant::now();
    let classpath = resolve_classpath(program)?;
    let classpath_duration_ms = classpath_started_at.elapsed().as_millis();

    let call_graph_started_at = Instant::now();
    let call_graph = with_span(
        telemetry.as_deref(),
        "call_graph",
        &[KeyValue::new("summa.phase", "call_graph")],
        || build_call_graph(&classpath),
    );
    let call_graph_duration_ms = call_graph_started_at.elapsed().as_millis();
    info!(
        methods = call_graph.methods.len(),
        edges = call_graph.edges.len(),
        "call graph built"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.jobs)
        .thread_name(|index| format!("summa-worker-{index}"))
        .build()
        .context("build worker pool")?;

    let context = AnalysisContext {
        classpath,
        call_graph,
        config,
        pool,
        artifact_uris: artifact_uris(artifacts),
        telemetry,
    };
    let timings = ContextTimings {
        classpath_duration_ms,
        call_graph_duration_ms,
    };
    Ok((context, timings))
}

fn rule_descriptor(metadata: &RuleMetadata) -> ReportingDescriptor {
    ReportingDescriptor::builder()
        .id(metadata.id)
        .name(metadata.name)
        .short_description(
            MultiformatMessageString::builder()
                .text(metadata.description)
                .build(),
        )
        .build()
}

impl AnalysisContext {
    pub(crate) fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_deref()
    }

    pub(crate) fn with_span<T, F>(&self, name: &str, attributes: &[KeyValue], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        with_span(self.telemetry(), name, attributes, f)
    }

    /// Like `with_span`, parented on a context captured on another thread.
    pub(crate) fn with_span_under<T, F>(
        &self,
        parent: &OtelContext,
        name: &str,
        attributes: &[KeyValue],
        f: F,
    ) -> T
    where
        F: FnOnce() -> T,
    {
        match self.telemetry() {
            Some(telemetry) => telemetry.span_under(parent, name, attributes, f),
            None => f(),
        }
    }

    /// Model governing a call site. Wildcard-owner models only stand in for
    /// callees without an analyzed body.
    pub(crate) fn call_model(
        &self,
        caller: &MethodId,
        at: InstructionRef,
        call: &CallSite,
    ) -> Option<&MethodModel> {
        let model = self.classpath.models.lookup(
            &self.classpath,
            &call.owner,
            &call.name,
            &call.descriptor,
        )?;
        if model.is_wildcard() && !self.call_graph.targets(caller, at).is_empty() {
            return None;
        }
        Some(model)
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn artifact_uri(&self, index: i64) -> Option<&str> {
        self.artifact_uris.get(&index).map(|value| value.as_str())
    }
}

fn artifact_uris(artifacts: &[Artifact]) -> BTreeMap<i64, String> {
    let mut uris = BTreeMap::new();
    for (index, artifact) in artifacts.iter().enumerate() {
        if let Some(uri) = artifact
            .location
            .as_ref()
            .and_then(|location| location.uri.as_ref())
        {
            uris.insert(index as i64, uri.clone());
        }
    }
    uris
}

mod callgraph;
mod cfg;
mod classpath;
mod dataflow;
mod descriptor;
mod engine;
mod ir;
mod models;
mod report;
mod rules;
mod scan;
mod summary;
mod telemetry;
#[cfg(test)]
mod test_harness;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use serde_sarif::sarif::{
    Artifact, Invocation, PropertyBag, ReportingDescriptor, Result as SarifResult, Run, SCHEMA_URL,
    Sarif, Tool, ToolComponent,
};
use tracing::{info, warn};

use crate::engine::{AnalysisConfig, DEFAULT_MAX_SCC_PASSES, Engine, build_context_with_timings};
use crate::scan::scan_inputs;
use crate::summary::{Diagnostic, DiagnosticCategory};
use crate::telemetry::{Telemetry, active_trace_id, init_logging, with_span};

/// CLI arguments for summa execution.
#[derive(Parser, Debug)]
#[command(
    name = "summa",
    about = "Summary-based interprocedural analysis of JVM program models with SARIF output.",
    version
)]
struct Cli {
    /// Program model `.json` file or a directory of them.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// SARIF destination; `-` or absent writes to stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Run only these checkers (repeatable, case-insensitive).
    #[arg(long = "checker", value_name = "ID")]
    checkers: Vec<String>,
    /// Worker threads; 0 picks one per core.
    #[arg(long, default_value_t = 0)]
    jobs: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_SCC_PASSES)]
    max_scc_passes: usize,
    /// Also emit suppressed findings, marked as suppressed.
    #[arg(long)]
    include_suppressed: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    /// OTLP HTTP endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

impl Cli {
    fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            jobs: self.jobs,
            max_scc_passes: self.max_scc_passes,
            include_suppressed: self.include_suppressed,
            checkers: self.checkers.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    let telemetry = match cli.otel.as_deref() {
        Some(endpoint) => Some(Arc::new(Telemetry::connect(endpoint)?)),
        None => None,
    };
    let result = with_span(
        telemetry.as_deref(),
        "summa.run",
        &[KeyValue::new("summa.input", cli.input.display().to_string())],
        || run(&cli, telemetry.clone()),
    );
    if let Some(telemetry) = telemetry {
        if let Err(error) = telemetry.shutdown() {
            warn!("{error:#}");
        }
    }
    result
}

fn run(cli: &Cli, telemetry: Option<Arc<Telemetry>>) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let started_at = Instant::now();
    let scan_started_at = Instant::now();
    let scan = scan_inputs(&cli.input)?;
    let scan_duration_ms = scan_started_at.elapsed().as_millis();
    let artifact_count = scan.artifacts.len();
    let class_count = scan.class_count;

    let config = cli.analysis_config();
    let engine = Engine::new(&config)?;
    let (context, timings) =
        build_context_with_timings(scan.program, &scan.artifacts, config, telemetry)?;

    let analysis_started_at = Instant::now();
    let output = engine.analyze(&context)?;
    let analysis_duration_ms = analysis_started_at.elapsed().as_millis();
    info!(
        findings = output.findings.len(),
        diagnostics = output.diagnostics.len(),
        "analysis finished"
    );

    let invocation_stats = InvocationStats {
        scan_duration_ms,
        classpath_duration_ms: timings.classpath_duration_ms,
        call_graph_duration_ms: timings.call_graph_duration_ms,
        analysis_duration_ms,
        class_count,
        artifact_count,
        method_count: context.call_graph.methods.len(),
        finding_count: output.findings.len(),
        trace_id: active_trace_id(),
    };
    let invocation = build_invocation(&invocation_stats, &output.diagnostics);
    let sarif = build_sarif(scan.artifacts, invocation, output.rules, output.results);

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;
    writer.flush().context("failed to flush SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} classpath_ms={} call_graph_ms={} analysis_ms={} classes={} methods={} findings={}",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            timings.classpath_duration_ms,
            timings.call_graph_duration_ms,
            analysis_duration_ms,
            class_count,
            invocation_stats.method_count,
            invocation_stats.finding_count
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

/// Metadata captured for SARIF invocation properties.
struct InvocationStats {
    scan_duration_ms: u128,
    classpath_duration_ms: u128,
    call_graph_duration_ms: u128,
    analysis_duration_ms: u128,
    class_count: usize,
    artifact_count: usize,
    method_count: usize,
    finding_count: usize,
    trace_id: Option<String>,
}

fn build_invocation(stats: &InvocationStats, diagnostics: &[Diagnostic]) -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");
    let mut properties = BTreeMap::new();
    properties.insert("summa.scan_ms".to_string(), json!(stats.scan_duration_ms));
    properties.insert(
        "summa.classpath_ms".to_string(),
        json!(stats.classpath_duration_ms),
    );
    properties.insert(
        "summa.call_graph_ms".to_string(),
        json!(stats.call_graph_duration_ms),
    );
    properties.insert(
        "summa.analysis_ms".to_string(),
        json!(stats.analysis_duration_ms),
    );
    properties.insert("summa.class_count".to_string(), json!(stats.class_count));
    properties.insert(
        "summa.artifact_count".to_string(),
        json!(stats.artifact_count),
    );
    properties.insert("summa.method_count".to_string(), json!(stats.method_count));
    properties.insert("summa.finding_count".to_string(), json!(stats.finding_count));
    if let Some(trace_id) = &stats.trace_id {
        properties.insert("summa.trace_id".to_string(), json!(trace_id));
    }
    properties.insert("summa.diagnostics".to_string(), diagnostics_json(diagnostics));

    let successful = !diagnostics
        .iter()
        .any(|diagnostic| diagnostic.category == DiagnosticCategory::InternalSkip);
    Invocation::builder()
        .execution_successful(successful)
        .arguments(arguments)
        .command_line(command_line)
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build()
}

fn diagnostics_json(diagnostics: &[Diagnostic]) -> Value {
    Value::Array(
        diagnostics
            .iter()
            .map(|diagnostic| {
                json!({
                    "category": diagnostic.category.as_str(),
                    "checker": diagnostic.checker,
                    "method": diagnostic.method.as_ref().map(|method| method.to_string()),
                    "message": diagnostic.message,
                })
            })
            .collect(),
    )
}

fn build_sarif(
    artifacts: Vec<Artifact>,
    invocation: Invocation,
    rules: Vec<ReportingDescriptor>,
    results: Vec<SarifResult>,
) -> Sarif {
    let driver = if rules.is_empty() {
        ToolComponent::builder()
            .name("summa")
            .version(env!("CARGO_PKG_VERSION"))
            .build()
    } else {
        ToolComponent::builder()
            .name("summa")
            .version(env!("CARGO_PKG_VERSION"))
            .rules(rules)
            .build()
    };
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = if artifacts.is_empty() {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .build()
    } else {
        Run::builder()
            .tool(tool)
            .invocations(vec![invocation])
            .results(results)
            .artifacts(artifacts)
            .build()
    };

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

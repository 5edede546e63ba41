use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;

use crate::callgraph::MethodId;
use crate::dataflow::access_path::{AccessPath, FieldKey};
use crate::dataflow::lattice::{Lattice, MapLattice, MaySet};
use crate::dataflow::worklist::{InstructionRef, InstructionStep, WorklistSemantics, analyze_method};
use crate::descriptor::method_param_count;
use crate::engine::AnalysisContext;
use crate::ir::{CallSite, Instruction, InstructionKind, Method, Operand, simple_name};
use crate::models::ModelEffect;
use crate::report::Finding;
use crate::rules::{Rule, RuleMetadata, RuleOutput};
use crate::summary::{
    MethodOutcome, MethodTarget, SummaryAnalysis, SummaryView, compute_summaries,
};

const CHECKER_ID: &str = "QUANDARY";
const RECEIVER: &str = "this";

/// Rule that reports flows from privacy-sensitive sources into sinks.
#[derive(Default)]
pub(crate) struct QuandaryRule;

crate::register_checker!(QuandaryRule);

impl Rule for QuandaryRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: CHECKER_ID,
            name: "Taint flow",
            description: "Values from modeled source APIs reaching modeled sink APIs",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<RuleOutput> {
        Ok(compute_summaries(context, &Quandary)?.into())
    }
}

/// Call returning sensitive data.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Source {
    kind: String,
    api: String,
}

/// Sink call inside some analyzed method.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct SinkSite {
    kind: String,
    api: String,
    method: String,
    line: u32,
}

impl fmt::Display for SinkSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink `{}` of kind `{}`", self.api, self.kind)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Label {
    Source(Source),
    Param(usize),
}

type Taint = MaySet<Label>;

#[derive(Clone, Debug, Eq, PartialEq)]
struct TaintState {
    locals: MapLattice<String, Taint>,
    paths: MapLattice<AccessPath, Taint>,
    returned: Taint,
}

impl Lattice for TaintState {
    fn join_with(&mut self, other: &Self) -> bool {
        let locals = self.locals.join_with(&other.locals);
        let paths = self.paths.join_with(&other.paths);
        let returned = self.returned.join_with(&other.returned);
        locals || paths || returned
    }
}

/// How a method moves taint between its parameters, its return value, and sinks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TaintSummary {
    return_sources: BTreeSet<Source>,
    return_params: BTreeSet<usize>,
    param_sinks: BTreeSet<(usize, SinkSite)>,
    /// Fields written on exit, rooted at `this`, a [`formal`] parameter, or a static.
    field_effects: BTreeMap<AccessPath, BTreeSet<Label>>,
}

/// Summary-side root of parameter `index`, independent of its local name.
fn formal(index: usize) -> AccessPath {
    AccessPath::local(&format!("#{index}"))
}

enum TaintEvent {
    Leak {
        source: Source,
        sink: SinkSite,
        line: u32,
    },
    ParamSink {
        param: usize,
        sink: SinkSite,
    },
}

struct Quandary;

impl SummaryAnalysis for Quandary {
    type Summary = TaintSummary;

    fn checker_id(&self) -> &'static str {
        CHECKER_ID
    }

    /// Every argument may flow to the result.
    fn unknown_summary(&self, _context: &AnalysisContext, method: &MethodId) -> TaintSummary {
        let count = method_param_count(&method.descriptor).unwrap_or(0);
        TaintSummary {
            return_sources: BTreeSet::new(),
            return_params: (0..count).collect(),
            param_sinks: BTreeSet::new(),
            field_effects: BTreeMap::new(),
        }
    }

    fn analyze_method(
        &self,
        context: &AnalysisContext,
        target: &MethodTarget<'_>,
        callees: &SummaryView<'_, Self>,
    ) -> Result<MethodOutcome<TaintSummary>> {
        let semantics = TaintSemantics {
            context,
            target,
            callees,
        };
        let analysis = analyze_method(target.method, &semantics)?;

        let mut leaks: BTreeMap<(Source, SinkSite), u32> = BTreeMap::new();
        let mut param_sinks = BTreeSet::new();
        for event in analysis.findings {
            match event {
                TaintEvent::Leak { source, sink, line } => {
                    let first = leaks.entry((source, sink)).or_insert(line);
                    *first = (*first).min(line);
                }
                TaintEvent::ParamSink { param, sink } => {
                    param_sinks.insert((param, sink));
                }
            }
        }

        let here = semantics.method_name();
        let findings = leaks
            .into_iter()
            .map(|((source, sink), line)| {
                let location = if sink.method == here {
                    format!("at line {}", sink.line)
                } else {
                    format!("in `{}` at line {}", sink.method, sink.line)
                };
                Finding::at(
                    context,
                    CHECKER_ID,
                    "QUANDARY_TAINT_ERROR",
                    target.class,
                    target.method,
                    Some(line),
                    format!(
                        "source `{}` of kind `{}` flows into {sink} {location}",
                        source.api, source.kind
                    ),
                )
            })
            .collect();

        let fixpoint = analysis.fixpoint;
        let mut field_effects: BTreeMap<AccessPath, BTreeSet<Label>> = BTreeMap::new();
        for exit in [&fixpoint.normal_exit, &fixpoint.exceptional_exit]
            .into_iter()
            .flatten()
        {
            for (path, taint) in exit.paths.iter() {
                if let Some(path) = semantics.summary_path(path) {
                    field_effects
                        .entry(path)
                        .or_default()
                        .extend(taint.0.iter().cloned());
                }
            }
        }

        let mut return_sources = BTreeSet::new();
        let mut return_params = BTreeSet::new();
        if let Some(exit) = fixpoint.normal_exit {
            for label in exit.returned.0 {
                match label {
                    Label::Source(source) => {
                        return_sources.insert(source);
                    }
                    Label::Param(index) => {
                        return_params.insert(index);
                    }
                }
            }
        }

        Ok(MethodOutcome {
            summary: TaintSummary {
                return_sources,
                return_params,
                param_sinks,
                field_effects,
            },
            findings,
            block_visits: fixpoint.block_visits,
        })
    }
}

struct TaintSemantics<'a> {
    context: &'a AnalysisContext,
    target: &'a MethodTarget<'a>,
    callees: &'a SummaryView<'a, Quandary>,
}

impl TaintSemantics<'_> {
    fn method_name(&self) -> String {
        format!(
            "{}.{}()",
            simple_name(&self.target.class.name),
            self.target.method.name
        )
    }

    fn operand(&self, state: &TaintState, operand: &Operand) -> Taint {
        match operand {
            Operand::Var(local) => state.locals.get(local).cloned().unwrap_or_else(Taint::new),
            Operand::Null | Operand::Literal(_) | Operand::Condition(_) => Taint::new(),
        }
    }

    fn bind(&self, state: &mut TaintState, target: &str, taint: Taint) {
        state
            .paths
            .retain(|path, _| path.root_local() != Some(target));
        state.locals.insert(target.to_string(), taint);
    }

    /// Exit path re-rooted for the summary; paths through other locals die with the frame.
    fn summary_path(&self, path: &AccessPath) -> Option<AccessPath> {
        let method = self.target.method;
        match path.root_local() {
            None => Some(path.clone()),
            Some(RECEIVER) if !method.access.is_static => Some(path.clone()),
            Some(local) => {
                let count =
                    method_param_count(&method.descriptor).unwrap_or(method.parameters.len());
                let index = (0..count).find(|index| method.parameter_name(*index) == local)?;
                path.rebase(&AccessPath::local(local), &formal(index))
            }
        }
    }

    /// Replay a callee's field writes on the caller's paths, joining with what is already there.
    fn apply_field_effects(
        &self,
        state: &mut TaintState,
        call: &CallSite,
        args: &[Taint],
        summary: &TaintSummary,
    ) {
        for (path, labels) in &summary.field_effects {
            let actual = match path.root_local() {
                None => Some(path.clone()),
                Some(RECEIVER) => call.receiver.as_deref().and_then(|receiver| {
                    path.rebase(&AccessPath::local(RECEIVER), &AccessPath::local(receiver))
                }),
                Some(_) => call.args.iter().enumerate().find_map(|(index, arg)| {
                    let Operand::Var(local) = arg else {
                        return None;
                    };
                    path.rebase(&formal(index), &AccessPath::local(local))
                }),
            };
            let Some(actual) = actual else {
                continue;
            };
            let mut taint = state.paths.get(&actual).cloned().unwrap_or_else(Taint::new);
            for label in labels {
                match label {
                    Label::Source(_) => {
                        taint.0.insert(label.clone());
                    }
                    Label::Param(index) => {
                        if let Some(arg) = args.get(*index) {
                            taint.join_with(arg);
                        }
                    }
                }
            }
            if !taint.0.is_empty() {
                state.paths.insert(actual, taint);
            }
        }
    }

    fn field_path(&self, base: Option<&str>, field: FieldKey) -> Option<AccessPath> {
        match base {
            Some(base) => AccessPath::local(base).with_field(field),
            None => Some(AccessPath::static_field(field)),
        }
    }

    /// Labels flowing into a sink: sources leak here, parameters become part of the summary.
    fn reach_sink(&self, taint: &Taint, sink: &SinkSite, line: u32, events: &mut Vec<TaintEvent>) {
        for label in &taint.0 {
            events.push(match label {
                Label::Source(source) => TaintEvent::Leak {
                    source: source.clone(),
                    sink: sink.clone(),
                    line,
                },
                Label::Param(param) => TaintEvent::ParamSink {
                    param: *param,
                    sink: sink.clone(),
                },
            });
        }
    }

    fn invoke(
        &self,
        state: &mut TaintState,
        at: InstructionRef,
        line: u32,
        target: Option<&str>,
        call: &CallSite,
    ) -> Vec<TaintEvent> {
        let receiver = call
            .receiver
            .as_deref()
            .and_then(|receiver| state.locals.get(receiver).cloned())
            .unwrap_or_else(Taint::new);
        let args: Vec<Taint> = call.args.iter().map(|arg| self.operand(state, arg)).collect();
        let mut incoming = receiver.clone();
        for arg in &args {
            incoming.join_with(arg);
        }

        let api = format!("{}.{}()", simple_name(&call.owner), call.name);
        let mut events = Vec::new();
        let result = if let Some(model) = self.context.call_model(self.target.id, at, call) {
            for effect in &model.effects {
                if let ModelEffect::TaintSink { kind } = effect {
                    let sink = SinkSite {
                        kind: kind.clone(),
                        api: api.clone(),
                        method: self.method_name(),
                        line,
                    };
                    self.reach_sink(&incoming, &sink, line, &mut events);
                }
            }
            let sources: BTreeSet<Label> = model
                .effects
                .iter()
                .filter_map(|effect| match effect {
                    ModelEffect::TaintSource { kind } => Some(Label::Source(Source {
                        kind: kind.clone(),
                        api: api.clone(),
                    })),
                    _ => None,
                })
                .collect();
            if !sources.is_empty() {
                MaySet(sources)
            } else if model.has_effect(&ModelEffect::Sanitizer) {
                Taint::new()
            } else {
                incoming
            }
        } else {
            let targets = self.context.call_graph.targets(self.target.id, at);
            if targets.is_empty() {
                incoming
            } else {
                let mut result = Taint::new();
                for callee in targets {
                    let summary = self.callees.summary(callee);
                    result.0.extend(summary.return_sources.iter().cloned().map(Label::Source));
                    for index in &summary.return_params {
                        if let Some(arg) = args.get(*index) {
                            result.join_with(arg);
                        }
                    }
                    for (index, sink) in &summary.param_sinks {
                        if let Some(arg) = args.get(*index) {
                            self.reach_sink(arg, sink, line, &mut events);
                        }
                    }
                    self.apply_field_effects(state, call, &args, &summary);
                }
                result
            }
        };

        if let Some(target) = target {
            self.bind(state, target, result);
        }
        events
    }
}

impl WorklistSemantics for TaintSemantics<'_> {
    type State = TaintState;
    type Finding = TaintEvent;

    fn initial_state(&self, method: &Method) -> TaintState {
        let mut locals = MapLattice::new();
        let count = method_param_count(&method.descriptor).unwrap_or(method.parameters.len());
        for index in 0..count {
            locals.insert(
                method.parameter_name(index),
                MaySet(BTreeSet::from([Label::Param(index)])),
            );
        }
        TaintState {
            locals,
            paths: MapLattice::new(),
            returned: Taint::new(),
        }
    }

    fn transfer_instruction(
        &self,
        _method: &Method,
        at: InstructionRef,
        instruction: &Instruction,
        state: &mut TaintState,
    ) -> Result<InstructionStep<TaintEvent>> {
        let line = instruction.line;
        let mut events = Vec::new();
        match &instruction.kind {
            InstructionKind::Assign { target, value } => {
                let taint = self.operand(state, value);
                self.bind(state, target, taint);
            }
            InstructionKind::New { target, .. } => self.bind(state, target, Taint::new()),
            InstructionKind::LoadField {
                target,
                base,
                field,
            } => {
                let key = FieldKey::resolve(&self.context.classpath, field);
                let taint = self
                    .field_path(base.as_deref(), key)
                    .and_then(|path| state.paths.get(&path).cloned())
                    .unwrap_or_else(Taint::new);
                self.bind(state, target, taint);
            }
            InstructionKind::StoreField { base, field, value } => {
                let key = FieldKey::resolve(&self.context.classpath, field);
                let taint = self.operand(state, value);
                if let Some(path) = self.field_path(base.as_deref(), key) {
                    state.paths.retain(|existing, _| !existing.starts_with(&path));
                    if !taint.0.is_empty() {
                        state.paths.insert(path, taint);
                    }
                }
            }
            InstructionKind::Invoke { target, call } => {
                events = self.invoke(state, at, line, target.as_deref(), call);
            }
            InstructionKind::Return { value } => {
                if let Some(value) = value {
                    let taint = self.operand(state, value);
                    state.returned.join_with(&taint);
                }
            }
            InstructionKind::Branch { .. }
            | InstructionKind::Throw { .. }
            | InstructionKind::MonitorEnter { .. }
            | InstructionKind::MonitorExit { .. } => {}
        }
        Ok(InstructionStep::continue_path().with_findings(events))
    }
}

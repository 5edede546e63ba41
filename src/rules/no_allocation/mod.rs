use std::collections::BTreeSet;

use anyhow::Result;

use crate::callgraph::MethodId;
use crate::dataflow::lattice::{Lattice, MustSet};
use crate::dataflow::worklist::{InstructionRef, InstructionStep, WorklistSemantics, analyze_method};
use crate::engine::AnalysisContext;
use crate::ir::{
    AnnotationKind, BasicBlock, CallSite, Condition, EdgeKind, FlowEdge, Instruction,
    InstructionKind, Method, simple_name,
};
use crate::models::ModelEffect;
use crate::report::Finding;
use crate::rules::{Rule, RuleMetadata, RuleOutput};
use crate::summary::{MethodOutcome, MethodTarget, SummaryAnalysis, SummaryView, compute_summaries};

const CHECKER_ID: &str = "NO_ALLOCATION";

/// Rule that rejects allocations reachable from `@NoAllocation` methods.
#[derive(Default)]
pub(crate) struct NoAllocationRule;

crate::register_checker!(NoAllocationRule);

impl Rule for NoAllocationRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: CHECKER_ID,
            name: "No allocation",
            description: "Methods annotated no-allocation that may allocate on a likely path",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<RuleOutput> {
        Ok(compute_summaries(context, &NoAllocation)?.into())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum AllocationSummary {
    MayNotAllocate,
    MayAllocate,
}

/// Branch edge taken to reach a point.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Guard {
    block: u32,
    truth: bool,
    unlikely: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct GuardState {
    /// Edges dominating the current point.
    guards: MustSet<Guard>,
    /// Locals holding the result of an unlikely marker.
    markers: MustSet<String>,
}

impl Lattice for GuardState {
    fn join_with(&mut self, other: &Self) -> bool {
        let guards = self.guards.join_with(&other.guards);
        let markers = self.markers.join_with(&other.markers);
        guards || markers
    }
}

impl GuardState {
    fn excuses_allocation(&self) -> bool {
        !self.guards.0.is_empty() && self.guards.0.iter().all(|guard| guard.unlikely)
    }

    fn rebind(&mut self, local: &str, marker: bool) {
        if marker {
            self.markers.0.insert(local.to_string());
        } else {
            self.markers.0.remove(local);
        }
    }
}

/// Allocating instruction seen by the reporting pass.
#[derive(Clone, Debug)]
struct Allocation {
    line: u32,
    description: String,
    excused: bool,
}

struct NoAllocation;

impl SummaryAnalysis for NoAllocation {
    type Summary = AllocationSummary;

    fn checker_id(&self) -> &'static str {
        CHECKER_ID
    }

    fn unknown_summary(&self, _context: &AnalysisContext, _method: &MethodId) -> AllocationSummary {
        AllocationSummary::MayAllocate
    }

    fn analyze_method(
        &self,
        context: &AnalysisContext,
        target: &MethodTarget<'_>,
        callees: &SummaryView<'_, Self>,
    ) -> Result<MethodOutcome<AllocationSummary>> {
        let method = target.method;
        let semantics = AllocationSemantics {
            context,
            target,
            callees,
            thrown: thrown_allocations(method),
        };
        let analysis = analyze_method(method, &semantics)?;
        let block_visits = analysis.fixpoint.block_visits;
        let first = analysis
            .findings
            .into_iter()
            .filter(|allocation| !allocation.excused)
            .min_by_key(|allocation| allocation.line);

        if method.has_annotation(AnnotationKind::IgnoreAllocations) {
            return Ok(MethodOutcome {
                summary: AllocationSummary::MayNotAllocate,
                findings: Vec::new(),
                block_visits,
            });
        }
        let Some(first) = first else {
            return Ok(MethodOutcome {
                summary: AllocationSummary::MayNotAllocate,
                findings: Vec::new(),
                block_visits,
            });
        };

        let mut findings = Vec::new();
        if method.has_annotation(AnnotationKind::NoAllocation) {
            findings.push(Finding::at(
                context,
                CHECKER_ID,
                "CHECKERS_ALLOCATES_MEMORY",
                target.class,
                method,
                Some(first.line),
                format!(
                    "method `{}()` is annotated `@NoAllocation` but allocates memory via {} at line {}",
                    method.name, first.description, first.line
                ),
            ));
        }
        Ok(MethodOutcome {
            summary: AllocationSummary::MayAllocate,
            findings,
            block_visits,
        })
    }
}

struct AllocationSemantics<'a> {
    context: &'a AnalysisContext,
    target: &'a MethodTarget<'a>,
    callees: &'a SummaryView<'a, NoAllocation>,
    /// Locals holding objects that are only constructed and thrown.
    thrown: BTreeSet<String>,
}

impl AllocationSemantics<'_> {
    fn call_allocates(&self, at: InstructionRef, call: &CallSite) -> bool {
        let model = self.context.call_model(self.target.id, at, call);
        if model.is_some_and(|model| model.has_effect(&ModelEffect::Functional)) {
            return false;
        }
        let targets = self.context.call_graph.targets(self.target.id, at);
        if !targets.is_empty() {
            return targets
                .iter()
                .any(|callee| self.callees.summary(callee) == AllocationSummary::MayAllocate);
        }
        if model.is_some() {
            return true;
        }
        match self
            .context
            .classpath
            .method(&call.owner, &call.name, &call.descriptor)
        {
            Some(declared) => {
                !(declared.has_annotation(AnnotationKind::Functional)
                    || declared.has_annotation(AnnotationKind::NoAllocation)
                    || declared.has_annotation(AnnotationKind::IgnoreAllocations))
            }
            None => true,
        }
    }

    fn has_effect(&self, at: InstructionRef, call: &CallSite, effect: &ModelEffect) -> bool {
        self.context
            .call_model(self.target.id, at, call)
            .is_some_and(|model| model.has_effect(effect))
    }
}

/// Whether `condition` tests a local holding an unlikely marker, under any polarity.
fn reads_unlikely_marker(condition: &Condition, markers: &MustSet<String>) -> bool {
    match condition {
        Condition::Value { value } => markers.0.contains(value),
        Condition::Not { inner } => reads_unlikely_marker(inner, markers),
        Condition::And { operands } | Condition::Or { operands } => operands
            .iter()
            .any(|operand| reads_unlikely_marker(operand, markers)),
        Condition::Compare { left, right, .. } => [left, right].into_iter().any(|operand| {
            operand
                .var()
                .is_some_and(|value| markers.0.contains(value))
        }),
        Condition::InstanceOf { .. } => false,
    }
}

impl WorklistSemantics for AllocationSemantics<'_> {
    type State = GuardState;
    type Finding = Allocation;

    fn initial_state(&self, _method: &Method) -> GuardState {
        GuardState {
            guards: MustSet::new(),
            markers: MustSet::new(),
        }
    }

    fn transfer_instruction(
        &self,
        _method: &Method,
        at: InstructionRef,
        instruction: &Instruction,
        state: &mut GuardState,
    ) -> Result<InstructionStep<Allocation>> {
        let line = instruction.line;
        let mut allocation = None;
        match &instruction.kind {
            InstructionKind::New { target, class } => {
                if !self.thrown.contains(target) {
                    allocation = Some(format!("`new {}`", simple_name(class)));
                }
                state.rebind(target, false);
            }
            InstructionKind::Invoke { target, call } => {
                let constructs_thrown = call.name == "<init>"
                    && call
                        .receiver
                        .as_ref()
                        .is_some_and(|receiver| self.thrown.contains(receiver));
                if !constructs_thrown && self.call_allocates(at, call) {
                    allocation = Some(format!("call to `{}()`", call.qualified_name()));
                }
                let no_return = self.has_effect(at, call, &ModelEffect::NoReturn);
                if let Some(target) = target {
                    state.rebind(target, self.has_effect(at, call, &ModelEffect::UnlikelyMarker));
                }
                if no_return {
                    let step = InstructionStep::terminate_path();
                    return Ok(match allocation {
                        Some(description) => step.with_finding(Allocation {
                            line,
                            description,
                            excused: state.excuses_allocation(),
                        }),
                        None => step,
                    });
                }
            }
            InstructionKind::Assign { target, value } => {
                let marker = value
                    .var()
                    .is_some_and(|source| state.markers.0.contains(source));
                state.rebind(target, marker);
            }
            InstructionKind::LoadField { target, .. } => state.rebind(target, false),
            InstructionKind::StoreField { .. }
            | InstructionKind::Branch { .. }
            | InstructionKind::Throw { .. }
            | InstructionKind::Return { .. }
            | InstructionKind::MonitorEnter { .. }
            | InstructionKind::MonitorExit { .. } => {}
        }
        let step = InstructionStep::continue_path();
        Ok(match allocation {
            Some(description) => step.with_finding(Allocation {
                line,
                description,
                excused: state.excuses_allocation(),
            }),
            None => step,
        })
    }

    fn transfer_edge(
        &self,
        _method: &Method,
        block: &BasicBlock,
        edge: &FlowEdge,
        state: &GuardState,
    ) -> Option<GuardState> {
        let truth = match edge.kind {
            EdgeKind::True => true,
            EdgeKind::False => false,
            EdgeKind::FallThrough | EdgeKind::Exception => return Some(state.clone()),
        };
        let mut refined = state.clone();
        if let Some(InstructionKind::Branch { condition }) =
            block.instructions.last().map(|instruction| &instruction.kind)
        {
            let unlikely = reads_unlikely_marker(condition, &state.markers);
            refined.guards.0.insert(Guard {
                block: block.id,
                truth,
                unlikely,
            });
        }
        Some(refined)
    }
}

/// Locals whose fresh object is only passed to its constructor and thrown.
fn thrown_allocations(method: &Method) -> BTreeSet<String> {
    let Some(cfg) = &method.cfg else {
        return BTreeSet::new();
    };
    let mut allocated = BTreeSet::new();
    let mut thrown = BTreeSet::new();
    let mut escaping = BTreeSet::new();
    for instruction in cfg.blocks.iter().flat_map(|block| block.instructions.iter()) {
        match &instruction.kind {
            InstructionKind::New { target, .. } => {
                allocated.insert(target.clone());
            }
            InstructionKind::Throw { value } => {
                if let Some(local) = value.var() {
                    thrown.insert(local.to_string());
                }
            }
            InstructionKind::Invoke { call, .. } => {
                if call.name != "<init>" {
                    escaping.extend(call.receiver.iter().cloned());
                }
                escaping.extend(call.args.iter().filter_map(|arg| arg.var()).map(str::to_string));
            }
            InstructionKind::Assign { value, .. } | InstructionKind::Return { value: Some(value) } => {
                escaping.extend(value.var().map(str::to_string));
            }
            InstructionKind::StoreField { base, value, .. } => {
                escaping.extend(base.iter().cloned());
                escaping.extend(value.var().map(str::to_string));
            }
            InstructionKind::LoadField { base, .. } => {
                escaping.extend(base.iter().cloned());
            }
            InstructionKind::MonitorEnter { lock } | InstructionKind::MonitorExit { lock } => {
                escaping.insert(lock.clone());
            }
            InstructionKind::Branch { .. } | InstructionKind::Return { value: None } => {}
        }
    }

    allocated
        .into_iter()
        .filter(|local| thrown.contains(local) && !escaping.contains(local))
        .collect()
}

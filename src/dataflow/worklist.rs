use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::cfg::MethodGraph;
use crate::dataflow::lattice::Lattice;
use crate::ir::{BasicBlock, EdgeKind, FlowEdge, Instruction, InstructionKind, Method};

/// Position of an instruction inside a method body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct InstructionRef {
    pub(crate) block: u32,
    pub(crate) index: usize,
}

/// Outcome produced after executing transfer for one instruction.
pub(crate) struct InstructionStep<F> {
    findings: Vec<F>,
    terminate_path: bool,
}

impl<F> InstructionStep<F> {
    pub(crate) fn continue_path() -> Self {
        Self {
            findings: Vec::new(),
            terminate_path: false,
        }
    }

    pub(crate) fn terminate_path() -> Self {
        Self {
            findings: Vec::new(),
            terminate_path: true,
        }
    }

    pub(crate) fn with_finding(mut self, finding: F) -> Self {
        self.findings.push(finding);
        self
    }

    pub(crate) fn with_findings(mut self, findings: impl IntoIterator<Item = F>) -> Self {
        self.findings.extend(findings);
        self
    }
}

/// Domain callbacks required by the generic fixpoint engine.
pub(crate) trait WorklistSemantics {
    type State: Lattice;
    type Finding;

    fn initial_state(&self, method: &Method) -> Self::State;

    fn transfer_instruction(
        &self,
        method: &Method,
        at: InstructionRef,
        instruction: &Instruction,
        state: &mut Self::State,
    ) -> Result<InstructionStep<Self::Finding>>;

    /// Refine the state flowing along `edge`; `None` marks the edge infeasible.
    fn transfer_edge(
        &self,
        _method: &Method,
        _block: &BasicBlock,
        _edge: &FlowEdge,
        state: &Self::State,
    ) -> Option<Self::State> {
        Some(state.clone())
    }

    /// Upper bound on strict increases of one block's entry state.
    fn height_bound(&self) -> usize {
        64
    }
}

/// Stabilized states of one method.
#[derive(Debug)]
pub(crate) struct FixpointResult<S> {
    /// Join of the states reaching a `return`.
    pub(crate) normal_exit: Option<S>,
    /// Join of the states escaping through an uncaught exception.
    pub(crate) exceptional_exit: Option<S>,
    /// Block transfers executed before stabilization.
    pub(crate) block_visits: usize,
}

/// Fixpoint plus findings from the reporting pass.
pub(crate) struct MethodAnalysis<S, F> {
    pub(crate) fixpoint: FixpointResult<S>,
    pub(crate) findings: Vec<F>,
}

/// Deterministic worklist solver over reverse postorder.
pub(crate) fn analyze_method<S>(
    method: &Method,
    semantics: &S,
) -> Result<MethodAnalysis<S::State, S::Finding>>
where
    S: WorklistSemantics,
{
    let graph = MethodGraph::new(method)?;
    let order: BTreeMap<u32, usize> = graph
        .reverse_postorder()
        .iter()
        .enumerate()
        .map(|(position, block)| (*block, position))
        .collect();
    let budget = semantics
        .height_bound()
        .saturating_mul(graph.block_count())
        .saturating_add(graph.block_count());

    let mut entry_states: BTreeMap<u32, S::State> = BTreeMap::new();
    let mut worklist: BTreeSet<(usize, u32)> = BTreeSet::new();
    entry_states.insert(graph.entry, semantics.initial_state(method));
    worklist.insert((order[&graph.entry], graph.entry));

    let mut block_visits = 0usize;
    while let Some((_, block_id)) = worklist.pop_first() {
        block_visits += 1;
        if block_visits > budget {
            anyhow::bail!(
                "fixpoint for {}{} did not converge within {budget} block visits",
                method.name,
                method.descriptor
            );
        }
        let Some(block) = graph.block(block_id) else {
            continue;
        };
        let Some(state) = entry_states.get(&block_id).cloned() else {
            continue;
        };

        let outcome = run_block(method, semantics, block_id, block, state, None)?;
        for edge in graph.successors_for(block_id) {
            let Some(incoming) = outcome.state_for(edge) else {
                continue;
            };
            let Some(refined) = semantics.transfer_edge(method, block, edge, incoming) else {
                continue;
            };
            let changed = match entry_states.get_mut(&edge.to) {
                Some(existing) => {
                    let changed = existing.join_with(&refined);
                    debug_assert!(refined.leq(existing), "join must bound its operands");
                    changed
                }
                None => {
                    entry_states.insert(edge.to, refined);
                    true
                }
            };
            if changed {
                if let Some(position) = order.get(&edge.to) {
                    worklist.insert((*position, edge.to));
                }
            }
        }
    }

    // Reporting pass over the stabilized entry states.
    let mut findings = Vec::new();
    let mut normal_exit: Option<S::State> = None;
    let mut exceptional_exit: Option<S::State> = None;
    for block_id in graph.reverse_postorder() {
        let (Some(block), Some(state)) = (graph.block(*block_id), entry_states.get(block_id))
        else {
            continue;
        };
        let outcome = run_block(
            method,
            semantics,
            *block_id,
            block,
            state.clone(),
            Some(&mut findings),
        )?;
        if let Some(returned) = outcome.returned {
            join_into(&mut normal_exit, returned);
        }
        if !graph.has_exception_edge(*block_id) {
            if let Some(escaped) = outcome.exceptional {
                join_into(&mut exceptional_exit, escaped);
            }
        }
    }

    Ok(MethodAnalysis {
        fixpoint: FixpointResult {
            normal_exit,
            exceptional_exit,
            block_visits,
        },
        findings,
    })
}

/// States leaving one block.
struct BlockOutcome<S> {
    /// State after the last instruction, if control falls off the block.
    out: Option<S>,
    /// Join of states before each potentially throwing instruction.
    exceptional: Option<S>,
    returned: Option<S>,
}

impl<S> BlockOutcome<S> {
    fn state_for(&self, edge: &FlowEdge) -> Option<&S> {
        match edge.kind {
            EdgeKind::Exception => self.exceptional.as_ref(),
            _ => self.out.as_ref(),
        }
    }
}

fn run_block<S>(
    method: &Method,
    semantics: &S,
    block_id: u32,
    block: &BasicBlock,
    mut state: S::State,
    mut findings: Option<&mut Vec<S::Finding>>,
) -> Result<BlockOutcome<S::State>>
where
    S: WorklistSemantics,
{
    let mut exceptional: Option<S::State> = None;
    for (index, instruction) in block.instructions.iter().enumerate() {
        if instruction.may_throw() {
            join_into(&mut exceptional, state.clone());
        }
        let at = InstructionRef {
            block: block_id,
            index,
        };
        let step = semantics.transfer_instruction(method, at, instruction, &mut state)?;
        if let Some(findings) = findings.as_deref_mut() {
            findings.extend(step.findings);
        }
        if step.terminate_path {
            return Ok(BlockOutcome {
                out: None,
                exceptional,
                returned: None,
            });
        }
        match &instruction.kind {
            InstructionKind::Return { .. } => {
                return Ok(BlockOutcome {
                    out: None,
                    exceptional,
                    returned: Some(state),
                });
            }
            InstructionKind::Throw { .. } => {
                return Ok(BlockOutcome {
                    out: None,
                    exceptional,
                    returned: None,
                });
            }
            _ => {}
        }
    }
    Ok(BlockOutcome {
        out: Some(state),
        exceptional,
        returned: None,
    })
}

fn join_into<S: Lattice>(target: &mut Option<S>, value: S) {
    match target {
        Some(existing) => {
            existing.join_with(&value);
        }
        None => *target = Some(value),
    }
}

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::ir::{BasicBlock, ControlFlowGraph, EdgeKind, FlowEdge, InstructionKind, Method};

/// Validated CFG lookup tables over the blocks reachable from entry.
pub(crate) struct MethodGraph<'a> {
    pub(crate) entry: u32,
    blocks: BTreeMap<u32, &'a BasicBlock>,
    successors: BTreeMap<u32, Vec<FlowEdge>>,
    reverse_postorder: Vec<u32>,
}

impl<'a> MethodGraph<'a> {
    /// Validate the method body and prune unreachable blocks.
    pub(crate) fn new(method: &'a Method) -> Result<Self> {
        let cfg = method
            .cfg
            .as_ref()
            .with_context(|| format!("method {}{} has no body", method.name, method.descriptor))?;
        Self::from_cfg(cfg)
            .with_context(|| format!("malformed CFG in {}{}", method.name, method.descriptor))
    }

    fn from_cfg(cfg: &'a ControlFlowGraph) -> Result<Self> {
        let mut all_blocks = BTreeMap::new();
        for block in &cfg.blocks {
            if all_blocks.insert(block.id, block).is_some() {
                anyhow::bail!("duplicate block id {}", block.id);
            }
        }
        if !all_blocks.contains_key(&cfg.entry) {
            anyhow::bail!("entry block {} does not exist", cfg.entry);
        }

        let mut all_successors: BTreeMap<u32, Vec<FlowEdge>> = BTreeMap::new();
        for edge in &cfg.edges {
            if !all_blocks.contains_key(&edge.from) || !all_blocks.contains_key(&edge.to) {
                anyhow::bail!("edge {} -> {} references a missing block", edge.from, edge.to);
            }
            all_successors.entry(edge.from).or_default().push(*edge);
        }
        for edges in all_successors.values_mut() {
            edges.sort();
            edges.dedup();
        }

        let reverse_postorder = reverse_postorder(cfg.entry, &all_successors);
        let reachable: BTreeSet<u32> = reverse_postorder.iter().copied().collect();

        let blocks: BTreeMap<u32, &BasicBlock> = all_blocks
            .into_iter()
            .filter(|(id, _)| reachable.contains(id))
            .collect();
        let successors: BTreeMap<u32, Vec<FlowEdge>> = all_successors
            .into_iter()
            .filter(|(id, _)| reachable.contains(id))
            .collect();

        let graph = Self {
            entry: cfg.entry,
            blocks,
            successors,
            reverse_postorder,
        };
        graph.check_shape()?;
        Ok(graph)
    }

    fn check_shape(&self) -> Result<()> {
        let mut has_exit = false;
        for (id, block) in &self.blocks {
            let edges = self.successors_for(*id);
            for (index, instruction) in block.instructions.iter().enumerate() {
                match &instruction.kind {
                    InstructionKind::Branch { .. } => {
                        if index + 1 != block.instructions.len() {
                            anyhow::bail!("branch is not the last instruction of block {id}");
                        }
                        let has_true = edges.iter().any(|edge| edge.kind == EdgeKind::True);
                        let has_false = edges.iter().any(|edge| edge.kind == EdgeKind::False);
                        if !has_true || !has_false {
                            anyhow::bail!("branch in block {id} lacks a true or false edge");
                        }
                    }
                    InstructionKind::Return { .. } | InstructionKind::Throw { .. } => {
                        has_exit = true;
                    }
                    _ => {}
                }
            }
            let normal_successors = edges
                .iter()
                .filter(|edge| edge.kind != EdgeKind::Exception)
                .count();
            let ends_path = matches!(
                block.instructions.last().map(|instruction| &instruction.kind),
                Some(
                    InstructionKind::Return { .. }
                        | InstructionKind::Throw { .. }
                        | InstructionKind::Invoke { .. }
                )
            );
            if normal_successors == 0 && !ends_path {
                anyhow::bail!("block {id} has no successors and does not exit");
            }
        }
        if !has_exit {
            anyhow::bail!("no reachable return or throw");
        }
        Ok(())
    }

    pub(crate) fn block(&self, id: u32) -> Option<&'a BasicBlock> {
        self.blocks.get(&id).copied()
    }

    pub(crate) fn successors_for(&self, id: u32) -> &[FlowEdge] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reachable block ids in reverse postorder from entry.
    pub(crate) fn reverse_postorder(&self) -> &[u32] {
        &self.reverse_postorder
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn has_exception_edge(&self, id: u32) -> bool {
        self.successors_for(id)
            .iter()
            .any(|edge| edge.kind == EdgeKind::Exception)
    }
}

fn reverse_postorder(entry: u32, successors: &BTreeMap<u32, Vec<FlowEdge>>) -> Vec<u32> {
    let mut visited = BTreeSet::new();
    let mut postorder = Vec::new();
    // Iterative DFS: (block, index of the next successor to visit).
    let mut stack = vec![(entry, 0usize)];
    visited.insert(entry);
    while let Some((block, next)) = stack.pop() {
        let edges = successors.get(&block).map(Vec::as_slice).unwrap_or(&[]);
        if let Some(edge) = edges.get(next) {
            stack.push((block, next + 1));
            if visited.insert(edge.to) {
                stack.push((edge.to, 0));
            }
        } else {
            postorder.push(block);
        }
    }
    postorder.reverse();
    postorder
}

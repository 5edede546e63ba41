use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::classpath::ClasspathIndex;
use crate::dataflow::worklist::InstructionRef;
use crate::ir::{CallKind, CallSite, Class, InstructionKind, Method};

/// Unique identifier for a method in the classpath.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct MethodId {
    pub(crate) class_name: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MethodId {
    pub(crate) fn of(class: &Class, method: &Method) -> Self {
        Self {
            class_name: class.name.clone(),
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Directed call edge between caller and callee.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct CallEdge {
    pub(crate) caller: MethodId,
    pub(crate) callee: MethodId,
    pub(crate) kind: CallKind,
    pub(crate) site: InstructionRef,
}

/// Strongly connected component of analyzable methods.
#[derive(Clone, Debug)]
pub(crate) struct Scc {
    pub(crate) members: Vec<MethodId>,
    /// Whether some member calls a member of the same component.
    pub(crate) recursive: bool,
}

/// Call graph built from CHA on the resolved classpath.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallGraph {
    /// Methods with a body; only these get analyzed.
    pub(crate) methods: BTreeSet<MethodId>,
    pub(crate) edges: BTreeSet<CallEdge>,
    sites: BTreeMap<(MethodId, InstructionRef), Vec<MethodId>>,
}

impl CallGraph {
    /// Candidate callees of a call instruction; empty means unknown.
    pub(crate) fn targets(&self, caller: &MethodId, site: InstructionRef) -> &[MethodId] {
        self.sites
            .get(&(caller.clone(), site))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct callees of every caller, built in one pass over the edges.
    fn adjacency(&self) -> BTreeMap<&MethodId, BTreeSet<&MethodId>> {
        let mut adjacency: BTreeMap<&MethodId, BTreeSet<&MethodId>> = BTreeMap::new();
        for edge in &self.edges {
            adjacency.entry(&edge.caller).or_default().insert(&edge.callee);
        }
        adjacency
    }

    /// Components in bottom-up order: every component follows the components it calls.
    pub(crate) fn sccs(&self) -> Vec<Scc> {
        let mut graph: DiGraph<MethodId, ()> = DiGraph::new();
        let mut nodes: BTreeMap<&MethodId, NodeIndex> = BTreeMap::new();
        for method in &self.methods {
            nodes.insert(method, graph.add_node(method.clone()));
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (nodes.get(&edge.caller), nodes.get(&edge.callee)) {
                graph.update_edge(*from, *to, ());
            }
        }

        // tarjan_scc yields components in reverse topological order, callees first.
        tarjan_scc(&graph)
            .into_iter()
            .map(|component| {
                let mut members: Vec<MethodId> =
                    component.iter().map(|node| graph[*node].clone()).collect();
                members.sort();
                let recursive = component.len() > 1
                    || component
                        .first()
                        .is_some_and(|node| graph.contains_edge(*node, *node));
                Scc { members, recursive }
            })
            .collect()
    }

    /// Group bottom-up components into waves whose callees all sit in earlier waves.
    pub(crate) fn waves(&self) -> Vec<Vec<Scc>> {
        let sccs = self.sccs();
        let mut component_of: BTreeMap<&MethodId, usize> = BTreeMap::new();
        for (index, scc) in sccs.iter().enumerate() {
            for member in &scc.members {
                component_of.insert(member, index);
            }
        }

        let adjacency = self.adjacency();
        let mut level = vec![0usize; sccs.len()];
        for (index, scc) in sccs.iter().enumerate() {
            let mut wave = 0;
            for member in &scc.members {
                for callee in adjacency.get(member).into_iter().flatten() {
                    if let Some(callee_index) = component_of.get(callee) {
                        if *callee_index != index {
                            wave = wave.max(level[*callee_index] + 1);
                        }
                    }
                }
            }
            level[index] = wave;
        }

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut waves: Vec<Vec<Scc>> = vec![Vec::new(); depth];
        for (scc, wave) in sccs.into_iter().zip(level) {
            waves[wave].push(scc);
        }
        waves
    }
}

/// Build a call graph using a CHA baseline.
pub(crate) fn build_call_graph(classpath: &ClasspathIndex) -> CallGraph {
    let mut graph = CallGraph::default();
    for class in &classpath.classes {
        for method in &class.methods {
            if method.has_body() {
                graph.methods.insert(MethodId::of(class, method));
            }
        }
    }

    for class in &classpath.classes {
        for method in &class.methods {
            let Some(cfg) = method.cfg.as_ref().filter(|_| method.has_body()) else {
                continue;
            };
            let caller = MethodId::of(class, method);
            for block in &cfg.blocks {
                for (index, instruction) in block.instructions.iter().enumerate() {
                    let InstructionKind::Invoke { call, .. } = &instruction.kind else {
                        continue;
                    };
                    let site = InstructionRef {
                        block: block.id,
                        index,
                    };
                    let targets = resolve_targets(call, classpath);
                    for callee in &targets {
                        graph.edges.insert(CallEdge {
                            caller: caller.clone(),
                            callee: callee.clone(),
                            kind: call.kind,
                            site,
                        });
                    }
                    graph.sites.insert((caller.clone(), site), targets);
                }
            }
        }
    }
    graph
}

fn resolve_targets(call: &CallSite, classpath: &ClasspathIndex) -> Vec<MethodId> {
    // Receivers typed by a library class may be bound to code we never see.
    if classpath.class(&call.owner).is_none() {
        return Vec::new();
    }
    let mut targets = BTreeSet::new();
    if let Some(target) = resolve_inherited(call, &call.owner, classpath) {
        targets.insert(target);
    }
    if matches!(call.kind, CallKind::Virtual | CallKind::Interface) {
        for class_name in classpath.descendants(&call.owner) {
            let declared = classpath
                .class(&class_name)
                .and_then(|class| class.method(&call.name, &call.descriptor));
            if declared.is_some_and(Method::has_body) {
                targets.insert(MethodId {
                    class_name,
                    name: call.name.clone(),
                    descriptor: call.descriptor.clone(),
                });
            }
        }
    }
    targets.into_iter().collect()
}

/// Implementation visible from `owner`, walking superclasses.
fn resolve_inherited(call: &CallSite, owner: &str, classpath: &ClasspathIndex) -> Option<MethodId> {
    let mut current = Some(owner.to_string());
    let mut seen = BTreeSet::new();
    while let Some(class_name) = current {
        if !seen.insert(class_name.clone()) {
            return None;
        }
        let class = classpath.class(&class_name)?;
        if let Some(method) = class.method(&call.name, &call.descriptor) {
            return method.has_body().then(|| MethodId::of(class, method));
        }
        current = class.super_name.clone();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classpath::resolve_classpath;
    use crate::ir::Program;
    use crate::test_harness::{
        ClassBuilder, MethodBuilder, interface_call, invoke, ret_void, static_call, virtual_call,
    };

    fn calling(name: &str, calls: Vec<CallSite>) -> Method {
        let mut instructions: Vec<_> = calls
            .into_iter()
            .enumerate()
            .map(|(line, call)| invoke(line as u32 + 1, None, call))
            .collect();
        instructions.push(ret_void(99));
        MethodBuilder::new(name, "()V").block(0, instructions).build()
    }

    fn graph_for(classes: Vec<Class>) -> CallGraph {
        let index = resolve_classpath(Program {
            classes,
            models: Vec::new(),
        })
        .expect("index");
        build_call_graph(&index)
    }

    fn id(class_name: &str, name: &str) -> MethodId {
        MethodId {
            class_name: class_name.to_string(),
            name: name.to_string(),
            descriptor: "()V".to_string(),
        }
    }

    #[test]
    fn call_graph_includes_virtual_targets() {
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/Caller")
                .method(calling(
                    "caller",
                    vec![virtual_call("com/example/Base", "target", "()V", "p0", vec![])],
                ))
                .build(),
            ClassBuilder::new("com/example/Base")
                .method(calling("target", vec![]))
                .build(),
            ClassBuilder::new("com/example/Sub")
                .super_name("com/example/Base")
                .method(calling("target", vec![]))
                .build(),
        ]);

        let site = InstructionRef { block: 0, index: 0 };
        let targets = graph.targets(&id("com/example/Caller", "caller"), site);

        assert_eq!(
            targets,
            &[id("com/example/Base", "target"), id("com/example/Sub", "target")]
        );
    }

    #[test]
    fn inherited_implementation_is_resolved() {
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/SuperFld")
                .method(calling("get", vec![]))
                .build(),
            ClassBuilder::new("com/example/SubFld")
                .super_name("com/example/SuperFld")
                .method(calling(
                    "caller",
                    vec![virtual_call("com/example/SubFld", "get", "()V", "this", vec![])],
                ))
                .build(),
        ]);

        let site = InstructionRef { block: 0, index: 0 };
        let targets = graph.targets(&id("com/example/SubFld", "caller"), site);

        assert_eq!(targets, &[id("com/example/SuperFld", "get")]);
    }

    #[test]
    fn interface_calls_reach_implementations_only() {
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/Caller")
                .method(calling(
                    "caller",
                    vec![interface_call("com/example/Shape", "area", "()V", "p0", vec![])],
                ))
                .build(),
            ClassBuilder::new("com/example/Shape")
                .method(MethodBuilder::new("area", "()V").build())
                .build(),
            ClassBuilder::new("com/example/Circle")
                .interface("com/example/Shape")
                .method(calling("area", vec![]))
                .build(),
        ]);

        let site = InstructionRef { block: 0, index: 0 };
        let targets = graph.targets(&id("com/example/Caller", "caller"), site);

        assert_eq!(targets, &[id("com/example/Circle", "area")]);
    }

    #[test]
    fn library_receivers_are_unknown() {
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/Caller")
                .method(calling(
                    "caller",
                    vec![static_call("java/lang/System", "gc", "()V", vec![])],
                ))
                .build(),
        ]);

        let site = InstructionRef { block: 0, index: 0 };

        assert!(graph.targets(&id("com/example/Caller", "caller"), site).is_empty());
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn sccs_are_bottom_up_and_group_recursion() {
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/ClassA")
                .method(calling(
                    "top",
                    vec![static_call("com/example/ClassA", "even", "()V", vec![])],
                ))
                .method(calling(
                    "even",
                    vec![static_call("com/example/ClassA", "odd", "()V", vec![])],
                ))
                .method(calling(
                    "odd",
                    vec![
                        static_call("com/example/ClassA", "even", "()V", vec![]),
                        static_call("com/example/ClassA", "leaf", "()V", vec![]),
                    ],
                ))
                .method(calling("leaf", vec![]))
                .build(),
        ]);

        let sccs = graph.sccs();
        let position = |name: &str| {
            sccs.iter()
                .position(|scc| scc.members.contains(&id("com/example/ClassA", name)))
                .expect("member")
        };

        assert_eq!(sccs.len(), 3);
        assert_eq!(position("even"), position("odd"));
        assert!(sccs[position("even")].recursive);
        assert!(!sccs[position("leaf")].recursive);
        assert!(position("leaf") < position("even"));
        assert!(position("even") < position("top"));

        let waves = graph.waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0][0].members, vec![id("com/example/ClassA", "leaf")]);
    }

    #[test]
    fn independent_callers_share_a_wave() {
        let call = |name: &str| static_call("com/example/ClassA", name, "()V", vec![]);
        let graph = graph_for(vec![
            ClassBuilder::new("com/example/ClassA")
                .method(calling("top", vec![call("left"), call("right"), call("leaf")]))
                .method(calling("left", vec![call("leaf")]))
                .method(calling("right", vec![call("leaf"), call("leaf")]))
                .method(calling("leaf", vec![]))
                .build(),
        ]);

        let waves: Vec<Vec<Vec<String>>> = graph
            .waves()
            .iter()
            .map(|wave| {
                let mut members: Vec<Vec<String>> = wave
                    .iter()
                    .map(|scc| scc.members.iter().map(|member| member.name.clone()).collect())
                    .collect();
                members.sort();
                members
            })
            .collect();

        assert_eq!(
            waves,
            vec![
                vec![vec!["leaf".to_string()]],
                vec![vec!["left".to_string()], vec!["right".to_string()]],
                vec![vec!["top".to_string()]],
            ]
        );
    }
}

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::callgraph::MethodId;
use crate::dataflow::access_path::{AccessPath, FieldKey};
use crate::dataflow::lattice::{Lattice, MapLattice, MustSet};
use crate::dataflow::worklist::{InstructionRef, InstructionStep, WorklistSemantics, analyze_method};
use crate::descriptor::{ReturnKind, is_reference_field, method_param_count, method_return_kind};
use crate::engine::AnalysisContext;
use crate::ir::{
    AnnotationKind, BasicBlock, CallKind, CallSite, Condition, EdgeKind, FieldRef, FlowEdge,
    Instruction, InstructionKind, Method, Operand, Visibility,
};
use crate::models::ModelEffect;
use crate::report::Finding;
use crate::rules::{Rule, RuleMetadata, RuleOutput};
use crate::summary::{
    MethodOutcome, MethodTarget, SummaryAnalysis, SummaryView, compute_summaries,
};

const CHECKER_ID: &str = "ERADICATE";

/// Rule that checks nullability annotations against the values that reach them.
#[derive(Default)]
pub(crate) struct EradicateRule;

crate::register_checker!(EradicateRule);

impl Rule for EradicateRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: CHECKER_ID,
            name: "Eradicate nullability",
            description: "Null dereferences, null returned from non-nullable methods, and uninitialized non-nullable fields",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<RuleOutput> {
        Ok(compute_summaries(context, &Eradicate)?.into())
    }
}

/// Abstract nullness of one value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Nullness {
    Bottom,
    Null,
    NotNull,
    /// Nullable or unknown.
    Top,
}

impl Nullness {
    fn may_be_null(self) -> bool {
        matches!(self, Nullness::Null | Nullness::Top)
    }

    fn declared(nullable: bool) -> Self {
        if nullable {
            Nullness::Top
        } else {
            Nullness::NotNull
        }
    }
}

impl Lattice for Nullness {
    fn join_with(&mut self, other: &Self) -> bool {
        let joined = match (*self, *other) {
            (left, right) if left == right => left,
            (Nullness::Bottom, right) => right,
            (left, Nullness::Bottom) => left,
            _ => Nullness::Top,
        };
        let changed = joined != *self;
        *self = joined;
        changed
    }
}

/// Where a local's current value was read from.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Origin {
    Field(AccessPath),
    Call(String),
}

/// Refined value of a field path next to the nullness its declaration promises.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PathFact {
    value: Nullness,
    declared: Nullness,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct NullState {
    locals: MapLattice<String, Nullness>,
    paths: BTreeMap<AccessPath, PathFact>,
    origins: BTreeMap<String, Origin>,
    /// `this` fields assigned on every path so far.
    assigned: MustSet<FieldKey>,
    returned: Nullness,
}

impl Lattice for NullState {
    fn join_with(&mut self, other: &Self) -> bool {
        let before = self.clone();
        self.locals.join_with(&other.locals);

        // A path missing on one side still holds its declared nullness there.
        let keys: BTreeSet<AccessPath> = self
            .paths
            .keys()
            .chain(other.paths.keys())
            .cloned()
            .collect();
        for key in keys {
            let fact = match (self.paths.get(&key), other.paths.get(&key)) {
                (Some(left), Some(right)) => PathFact {
                    value: left.value.join(&right.value),
                    declared: left.declared,
                },
                (Some(only), None) | (None, Some(only)) => PathFact {
                    value: only.value.join(&only.declared),
                    declared: only.declared,
                },
                (None, None) => continue,
            };
            self.paths.insert(key, fact);
        }

        self.origins
            .retain(|local, origin| other.origins.get(local) == Some(origin));
        self.assigned.join_with(&other.assigned);
        self.returned.join_with(&other.returned);
        *self != before
    }
}

/// What callers learn about a method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct NullSummary {
    returns: Nullness,
    /// `this` fields assigned on every normal exit.
    assigned_fields: BTreeSet<FieldKey>,
    returns_normally: bool,
}

struct Eradicate;

impl SummaryAnalysis for Eradicate {
    type Summary = NullSummary;

    fn checker_id(&self) -> &'static str {
        CHECKER_ID
    }

    fn unknown_summary(&self, _context: &AnalysisContext, method: &MethodId) -> NullSummary {
        NullSummary {
            returns: unknown_return(&method.descriptor),
            assigned_fields: BTreeSet::new(),
            returns_normally: true,
        }
    }

    fn analyze_method(
        &self,
        context: &AnalysisContext,
        target: &MethodTarget<'_>,
        callees: &SummaryView<'_, Self>,
    ) -> Result<MethodOutcome<NullSummary>> {
        let method = target.method;
        let checks_return = !method.has_annotation(AnnotationKind::Nullable)
            && method_return_kind(&method.descriptor)? == ReturnKind::Reference;
        let semantics = NullSemantics {
            context,
            target,
            callees,
            checks_return,
        };
        let analysis = analyze_method(method, &semantics)?;
        let block_visits = analysis.fixpoint.block_visits;
        let mut findings = analysis.findings;
        let exit = analysis.fixpoint.normal_exit;

        if method.is_constructor() {
            if let Some(exit) = &exit {
                findings.extend(semantics.uninitialized_fields(exit)?);
            }
        }

        let returns = if method.has_annotation(AnnotationKind::Nullable) {
            Nullness::Top
        } else if method.has_annotation(AnnotationKind::NonNull) {
            Nullness::NotNull
        } else if method_return_kind(&method.descriptor)? != ReturnKind::Reference {
            Nullness::NotNull
        } else {
            exit.as_ref()
                .map(|state| state.returned)
                .unwrap_or(Nullness::Bottom)
        };
        let summary = NullSummary {
            returns,
            assigned_fields: exit
                .as_ref()
                .map(|state| state.assigned.0.clone())
                .unwrap_or_default(),
            returns_normally: exit.is_some(),
        };
        Ok(MethodOutcome {
            summary,
            findings,
            block_visits,
        })
    }
}

/// Declared contract of a bodyless program method; native code is as unknown as a library.
fn declared_return(method: &Method) -> Nullness {
    if method.has_annotation(AnnotationKind::Nullable) {
        Nullness::Top
    } else if method.has_annotation(AnnotationKind::NonNull) {
        Nullness::NotNull
    } else if method.access.is_native {
        unknown_return(&method.descriptor)
    } else {
        Nullness::NotNull
    }
}

fn unknown_return(descriptor: &str) -> Nullness {
    match method_return_kind(descriptor) {
        Ok(ReturnKind::Reference) | Err(_) => Nullness::Top,
        Ok(_) => Nullness::NotNull,
    }
}

struct NullSemantics<'a> {
    context: &'a AnalysisContext,
    target: &'a MethodTarget<'a>,
    callees: &'a SummaryView<'a, Eradicate>,
    checks_return: bool,
}

impl NullSemantics<'_> {
    fn finding(&self, issue_type: &'static str, line: Option<u32>, message: String) -> Finding {
        Finding::at(
            self.context,
            CHECKER_ID,
            issue_type,
            self.target.class,
            self.target.method,
            line,
            message,
        )
    }

    fn local(&self, state: &NullState, name: &str) -> Nullness {
        // Locals never written in the body (handler exceptions) are non-null.
        state.locals.get(name).copied().unwrap_or(Nullness::NotNull)
    }

    fn operand(&self, state: &NullState, operand: &Operand) -> Nullness {
        match operand {
            Operand::Var(name) => self.local(state, name),
            Operand::Null => Nullness::Null,
            Operand::Literal(_) | Operand::Condition(_) => Nullness::NotNull,
        }
    }

    fn declared_field(&self, field: &FieldKey) -> Nullness {
        let nullable = self
            .context
            .classpath
            .class(&field.class_name)
            .and_then(|class| class.field(&field.name))
            .is_some_and(|declared| declared.has_annotation(AnnotationKind::Nullable));
        Nullness::declared(nullable)
    }

    /// Refinements survive only for fields the reading code encapsulates.
    fn keeps_refinement(&self, field: &FieldKey) -> bool {
        let classpath = &self.context.classpath;
        let reader = self.target.class.name.as_str();
        if reader == field.class_name {
            return true;
        }
        let Some(resolved) = classpath.resolve_field(&field.class_name, &field.name) else {
            return false;
        };
        resolved.field.visibility == Visibility::Private
            && classpath.top_level_class(reader) == classpath.top_level_class(&field.class_name)
    }

    fn describe(&self, state: &NullState, local: &str) -> String {
        match state.origins.get(local) {
            Some(Origin::Field(path)) => format!("object `{path}`"),
            Some(Origin::Call(callee)) => format!("object returned by `{callee}`"),
            None => format!("object `{local}`"),
        }
    }

    /// Rebind `target`, dropping every fact reached through its old value.
    fn bind(&self, state: &mut NullState, target: &str, value: Nullness, origin: Option<Origin>) {
        let root = AccessPath::local(target);
        state.paths.retain(|path, _| !path.starts_with(&root));
        state
            .origins
            .retain(|_, origin| !matches!(origin, Origin::Field(path) if path.starts_with(&root)));
        state.locals.insert(target.to_string(), value);
        match origin {
            Some(Origin::Field(path)) if path.starts_with(&root) => {
                state.origins.remove(target);
            }
            Some(origin) => {
                state.origins.insert(target.to_string(), origin);
            }
            None => {
                state.origins.remove(target);
            }
        }
    }

    /// Set a local and, through its origin, the field path and its other readers.
    fn refine(&self, state: &mut NullState, local: &str, value: Nullness) {
        state.locals.insert(local.to_string(), value);
        let Some(Origin::Field(path)) = state.origins.get(local).cloned() else {
            return;
        };
        let aliases: Vec<String> = state
            .origins
            .iter()
            .filter(|(_, origin)| matches!(origin, Origin::Field(other) if *other == path))
            .map(|(alias, _)| alias.clone())
            .collect();
        for alias in aliases {
            state.locals.insert(alias, value);
        }
        let declared = match state.paths.get(&path) {
            Some(fact) => fact.declared,
            None => path
                .last_field()
                .map(|field| self.declared_field(field))
                .unwrap_or(Nullness::NotNull),
        };
        state.paths.insert(path, PathFact { value, declared });
    }

    fn check_dereference(
        &self,
        state: &mut NullState,
        local: &str,
        line: u32,
        findings: &mut Vec<Finding>,
    ) {
        if self.local(state, local).may_be_null() {
            findings.push(self.finding(
                "NULL_DEREFERENCE",
                Some(line),
                format!(
                    "{} could be null and is dereferenced at line {line}",
                    self.describe(state, local)
                ),
            ));
        }
        self.refine(state, local, Nullness::NotNull);
    }

    fn field_path(&self, base: Option<&str>, field: &FieldKey) -> Option<AccessPath> {
        match base {
            Some(base) => AccessPath::local(base).with_field(field.clone()),
            None => Some(AccessPath::static_field(field.clone())),
        }
    }

    fn load_field(
        &self,
        state: &mut NullState,
        target: &str,
        base: Option<&str>,
        field: &FieldRef,
        line: u32,
        findings: &mut Vec<Finding>,
    ) {
        if let Some(base) = base {
            self.check_dereference(state, base, line, findings);
        }
        let key = FieldKey::resolve(&self.context.classpath, field);
        let declared = self.declared_field(&key);
        let path = self.field_path(base, &key);
        let value = match &path {
            Some(path) if self.keeps_refinement(&key) => state
                .paths
                .get(path)
                .map(|fact| fact.value)
                .unwrap_or(declared),
            _ => declared,
        };
        self.bind(state, target, value, path.map(Origin::Field));
    }

    fn store_field(
        &self,
        state: &mut NullState,
        base: Option<&str>,
        field: &FieldRef,
        value: &Operand,
        line: u32,
        findings: &mut Vec<Finding>,
    ) {
        if let Some(base) = base {
            self.check_dereference(state, base, line, findings);
        }
        let key = FieldKey::resolve(&self.context.classpath, field);
        let stored = self.operand(state, value);
        if let Some(path) = self.field_path(base, &key) {
            state
                .origins
                .retain(|_, origin| !matches!(origin, Origin::Field(other) if other.starts_with(&path)));
            state
                .paths
                .retain(|other, _| !other.starts_with(&path) || *other == path);
            let declared = self.declared_field(&key);
            state.paths.insert(
                path,
                PathFact {
                    value: stored,
                    declared,
                },
            );
        }
        if base == Some("this") && key.class_name == self.target.class.name {
            state.assigned.0.insert(key);
        }
    }

    fn invoke(
        &self,
        state: &mut NullState,
        at: InstructionRef,
        line: u32,
        target: Option<&str>,
        call: &CallSite,
    ) -> Result<InstructionStep<Finding>> {
        let mut findings = Vec::new();
        if call.kind != CallKind::Static {
            if let Some(receiver) = &call.receiver {
                self.check_dereference(state, receiver, line, &mut findings);
            }
        }

        let classpath = &self.context.classpath;
        let model = self.context.call_model(self.target.id, at, call);
        let targets = self.context.call_graph.targets(self.target.id, at);
        let declared = classpath.method(&call.owner, &call.name, &call.descriptor);

        let assumes = declared.is_some_and(|method| method.has_annotation(AnnotationKind::Assume))
            || targets.iter().any(|callee| {
                classpath
                    .method(&callee.class_name, &callee.name, &callee.descriptor)
                    .is_some_and(|method| method.has_annotation(AnnotationKind::Assume))
            });
        let mut asserted: Vec<&Condition> = Vec::new();
        if assumes {
            asserted.extend(call.args.iter().filter_map(|arg| match arg {
                Operand::Condition(condition) => Some(condition.as_ref()),
                _ => None,
            }));
        }

        let effects = model.map(|model| model.effects.as_slice()).unwrap_or(&[]);
        for effect in effects {
            match effect {
                ModelEffect::AssertsNonNull {
                    parameter: Some(index),
                } => {
                    if let Some(Operand::Var(local)) = call.args.get(*index) {
                        self.refine(state, local, Nullness::NotNull);
                    }
                }
                ModelEffect::AssertsNonNull { parameter: None } => {
                    for arg in &call.args {
                        if let Operand::Var(local) = arg {
                            self.refine(state, local, Nullness::NotNull);
                        }
                    }
                }
                ModelEffect::AssertsCondition { parameter } => {
                    if let Some(Operand::Condition(condition)) = call.args.get(*parameter) {
                        asserted.push(condition.as_ref());
                    }
                }
                _ => {}
            }
        }
        for condition in asserted {
            match self.assume(state, condition, true) {
                Some(refined) => *state = refined,
                None => return Ok(InstructionStep::terminate_path().with_findings(findings)),
            }
        }

        let (returns, returns_normally) = if let Some(model) = model {
            let returns = if model.has_effect(&ModelEffect::ReturnsNullable) {
                Nullness::Top
            } else if model.has_effect(&ModelEffect::ReturnsNonNull) {
                Nullness::NotNull
            } else {
                unknown_return(&call.descriptor)
            };
            (returns, !model.has_effect(&ModelEffect::NoReturn))
        } else if !targets.is_empty() {
            let mut returns = Nullness::Bottom;
            let mut returns_normally = false;
            let mut assigned: Option<BTreeSet<FieldKey>> = None;
            for callee in targets {
                let summary = self.callees.summary(callee);
                returns.join_with(&summary.returns);
                returns_normally |= summary.returns_normally;
                assigned = Some(match assigned {
                    Some(fields) => fields
                        .intersection(&summary.assigned_fields)
                        .cloned()
                        .collect(),
                    None => summary.assigned_fields,
                });
            }
            if call.receiver.as_deref() == Some("this") {
                state.assigned.0.extend(assigned.unwrap_or_default());
            }
            (returns, returns_normally)
        } else {
            let returns = match declared {
                Some(method) => declared_return(method),
                None => unknown_return(&call.descriptor),
            };
            (returns, true)
        };

        if !returns_normally {
            return Ok(InstructionStep::terminate_path().with_findings(findings));
        }
        if let Some(target) = target {
            let returns = if method_return_kind(&call.descriptor)? == ReturnKind::Reference {
                returns
            } else {
                Nullness::NotNull
            };
            let origin = Origin::Call(format!("{}()", call.qualified_name()));
            self.bind(state, target, returns, Some(origin));
        }
        Ok(InstructionStep::continue_path().with_findings(findings))
    }

    /// State on the edge where `condition` evaluates to `truth`; `None` when impossible.
    fn assume(&self, state: &NullState, condition: &Condition, truth: bool) -> Option<NullState> {
        match condition {
            Condition::Compare {
                left,
                right,
                equal,
            } => {
                let subject = match (left, right) {
                    (Operand::Var(name), other) if self.operand(state, other) == Nullness::Null => {
                        Some(name)
                    }
                    (other, Operand::Var(name)) if self.operand(state, other) == Nullness::Null => {
                        Some(name)
                    }
                    _ => None,
                };
                let Some(subject) = subject else {
                    return Some(state.clone());
                };
                let is_null = *equal == truth;
                if !is_null && self.local(state, subject) == Nullness::Null {
                    return None;
                }
                let mut refined = state.clone();
                let value = if is_null {
                    Nullness::Null
                } else {
                    Nullness::NotNull
                };
                self.refine(&mut refined, subject, value);
                Some(refined)
            }
            Condition::InstanceOf { value, .. } => {
                let mut refined = state.clone();
                if truth {
                    self.refine(&mut refined, value, Nullness::NotNull);
                }
                Some(refined)
            }
            Condition::Value { .. } => Some(state.clone()),
            Condition::Not { inner } => self.assume(state, inner, !truth),
            Condition::And { operands } if truth => self.assume_all(state, operands, true),
            Condition::And { operands } => self.assume_any(state, operands, false),
            Condition::Or { operands } if truth => self.assume_any(state, operands, true),
            Condition::Or { operands } => self.assume_all(state, operands, false),
        }
    }

    fn assume_all(&self, state: &NullState, operands: &[Condition], truth: bool) -> Option<NullState> {
        let mut current = state.clone();
        for operand in operands {
            current = self.assume(&current, operand, truth)?;
        }
        Some(current)
    }

    fn assume_any(&self, state: &NullState, operands: &[Condition], truth: bool) -> Option<NullState> {
        let mut joined: Option<NullState> = None;
        for operand in operands {
            let Some(refined) = self.assume(state, operand, truth) else {
                continue;
            };
            match &mut joined {
                Some(existing) => {
                    existing.join_with(&refined);
                }
                None => joined = Some(refined),
            }
        }
        joined
    }

    fn uninitialized_fields(&self, exit: &NullState) -> Result<Vec<Finding>> {
        let class = self.target.class;
        let mut findings = Vec::new();
        for field in &class.fields {
            if field.is_static
                || field.has_annotation(AnnotationKind::Nullable)
                || !is_reference_field(&field.descriptor)?
            {
                continue;
            }
            let key = FieldKey {
                class_name: class.name.clone(),
                name: field.name.clone(),
            };
            if exit.assigned.0.contains(&key) {
                continue;
            }
            findings.push(
                self.finding(
                    "FIELD_NOT_INITIALIZED",
                    None,
                    format!(
                        "field `{key}` is not initialized in the constructor and is not annotated `@Nullable`"
                    ),
                )
                .with_field(key),
            );
        }
        Ok(findings)
    }
}

impl WorklistSemantics for NullSemantics<'_> {
    type State = NullState;
    type Finding = Finding;

    fn initial_state(&self, method: &Method) -> NullState {
        let mut locals = MapLattice::new();
        if !method.access.is_static {
            locals.insert("this".to_string(), Nullness::NotNull);
        }
        let count = method_param_count(&method.descriptor).unwrap_or(method.parameters.len());
        for index in 0..count {
            let nullable = method.parameter_has_annotation(index, AnnotationKind::Nullable);
            locals.insert(method.parameter_name(index), Nullness::declared(nullable));
        }
        NullState {
            locals,
            paths: BTreeMap::new(),
            origins: BTreeMap::new(),
            assigned: MustSet::new(),
            returned: Nullness::Bottom,
        }
    }

    fn transfer_instruction(
        &self,
        _method: &Method,
        at: InstructionRef,
        instruction: &Instruction,
        state: &mut NullState,
    ) -> Result<InstructionStep<Finding>> {
        let line = instruction.line;
        let mut findings = Vec::new();
        match &instruction.kind {
            InstructionKind::Assign { target, value } => {
                let nullness = self.operand(state, value);
                let origin = value
                    .var()
                    .and_then(|source| state.origins.get(source).cloned());
                self.bind(state, target, nullness, origin);
            }
            InstructionKind::New { target, .. } => {
                self.bind(state, target, Nullness::NotNull, None);
            }
            InstructionKind::LoadField {
                target,
                base,
                field,
            } => {
                self.load_field(state, target, base.as_deref(), field, line, &mut findings);
            }
            InstructionKind::StoreField { base, field, value } => {
                self.store_field(state, base.as_deref(), field, value, line, &mut findings);
            }
            InstructionKind::Invoke { target, call } => {
                return self.invoke(state, at, line, target.as_deref(), call);
            }
            InstructionKind::Return { value } => {
                let returned = value
                    .as_ref()
                    .map(|value| self.operand(state, value))
                    .unwrap_or(Nullness::NotNull);
                if self.checks_return && returned.may_be_null() {
                    findings.push(self.finding(
                        "RETURN_NOT_NULLABLE",
                        Some(line),
                        format!(
                            "method `{}()` may return null but it is not annotated with `@Nullable`",
                            self.target.method.name
                        ),
                    ));
                }
                state.returned = returned;
            }
            InstructionKind::Branch { .. }
            | InstructionKind::Throw { .. }
            | InstructionKind::MonitorEnter { .. }
            | InstructionKind::MonitorExit { .. } => {}
        }
        Ok(InstructionStep::continue_path().with_findings(findings))
    }

    fn transfer_edge(
        &self,
        _method: &Method,
        block: &BasicBlock,
        edge: &FlowEdge,
        state: &NullState,
    ) -> Option<NullState> {
        let truth = match edge.kind {
            EdgeKind::True => true,
            EdgeKind::False => false,
            EdgeKind::FallThrough | EdgeKind::Exception => return Some(state.clone()),
        };
        match block.instructions.last().map(|instruction| &instruction.kind) {
            Some(InstructionKind::Branch { condition }) => self.assume(state, condition, truth),
            _ => Some(state.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{Annotation, Condition, EdgeKind, Operand, Visibility};
    use crate::test_harness::{
        ClassBuilder, FieldBuilder, MethodBuilder, branch, edge, findings_for, invoke,
        load_field, not_null, ret, ret_void, special_call, static_call, store_field, throw_var,
        var, virtual_call,
    };

    fn length_of(line: u32, local: &str) -> crate::ir::Instruction {
        invoke(
            line,
            Some("n"),
            virtual_call("java/lang/String", "length", "()I", local, Vec::new()),
        )
    }

    fn nullable_param_method(name: &str) -> MethodBuilder {
        MethodBuilder::new(name, "(Ljava/lang/String;)V")
            .parameter_with("s", vec![Annotation::Nullable])
    }

    #[test]
    fn dereference_of_nullable_parameter_is_reported() {
        let class = ClassBuilder::new("com/example/ClassA")
            .method(
                nullable_param_method("methodBad")
                    .block(0, vec![length_of(2, "s"), ret_void(3)])
                    .build(),
            )
            .build();

        let findings = findings_for("ERADICATE", vec![class]);

        assert_eq!(
            findings,
            vec![
                "NULL_DEREFERENCE methodBad: object `s` could be null and is dereferenced at line 2"
                    .to_string()
            ]
        );
    }

    #[test]
    fn null_check_guards_dereference() {
        let class = ClassBuilder::new("com/example/ClassA")
            .method(
                nullable_param_method("methodOk")
                    .block(0, vec![branch(2, not_null("s"))])
                    .block(1, vec![length_of(3, "s"), ret_void(4)])
                    .block(2, vec![ret_void(5)])
                    .edges(vec![edge(0, 1, EdgeKind::True), edge(0, 2, EdgeKind::False)])
                    .build(),
            )
            .build();

        assert!(findings_for("ERADICATE", vec![class]).is_empty());
    }

    #[test]
    fn preconditions_hold_in_either_operand_order() {
        let reversed = Condition::Compare {
            left: Operand::Null,
            right: var("s"),
            equal: false,
        };
        let check_state = |line: u32, condition: Condition| {
            invoke(
                line,
                None,
                static_call(
                    "com/google/common/base/Preconditions",
                    "checkState",
                    "(Z)V",
                    vec![Operand::Condition(Box::new(condition))],
                ),
            )
        };
        let class = ClassBuilder::new("com/example/ClassA")
            .method(
                nullable_param_method("checkStateOk")
                    .block(
                        0,
                        vec![check_state(2, not_null("s")), length_of(3, "s"), ret_void(4)],
                    )
                    .build(),
            )
            .method(
                nullable_param_method("checkStateReversedOk")
                    .block(
                        0,
                        vec![check_state(6, reversed), length_of(7, "s"), ret_void(8)],
                    )
                    .build(),
            )
            .method(
                nullable_param_method("checkNotNullOk")
                    .block(
                        0,
                        vec![
                            invoke(
                                10,
                                None,
                                static_call(
                                    "com/google/common/base/Preconditions",
                                    "checkNotNull",
                                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                                    vec![var("s")],
                                ),
                            ),
                            length_of(11, "s"),
                            ret_void(12),
                        ],
                    )
                    .build(),
            )
            .method(
                nullable_param_method("uncheckedBad")
                    .block(0, vec![length_of(14, "s"), ret_void(15)])
                    .build(),
            )
            .build();

        let findings = findings_for("ERADICATE", vec![class]);

        assert_eq!(
            findings,
            vec![
                "NULL_DEREFERENCE uncheckedBad: object `s` could be null and is dereferenced at line 14"
                    .to_string()
            ]
        );
    }

    #[test]
    fn field_refinement_survives_only_inside_declaring_class() {
        let holder = ClassBuilder::new("com/example/Holder")
            .field(
                FieldBuilder::new("name", "Ljava/lang/String;")
                    .visibility(Visibility::Public)
                    .annotation(Annotation::Nullable)
                    .build(),
            )
            .method(
                MethodBuilder::new("ownReadOk", "()V")
                    .block(
                        0,
                        vec![
                            load_field(2, "t1", "this", "com/example/Holder", "name"),
                            branch(2, not_null("t1")),
                        ],
                    )
                    .block(
                        1,
                        vec![
                            load_field(3, "t2", "this", "com/example/Holder", "name"),
                            length_of(3, "t2"),
                            ret_void(4),
                        ],
                    )
                    .block(2, vec![ret_void(5)])
                    .edges(vec![edge(0, 1, EdgeKind::True), edge(0, 2, EdgeKind::False)])
                    .build(),
            )
            .build();
        let reader = ClassBuilder::new("com/example/Reader")
            .method(
                MethodBuilder::new("foreignReadBad", "(Lcom/example/Holder;)V")
                    .parameter("h")
                    .block(
                        0,
                        vec![
                            load_field(8, "t1", "h", "com/example/Holder", "name"),
                            branch(8, not_null("t1")),
                        ],
                    )
                    .block(
                        1,
                        vec![
                            load_field(9, "t2", "h", "com/example/Holder", "name"),
                            length_of(9, "t2"),
                            ret_void(10),
                        ],
                    )
                    .block(2, vec![ret_void(11)])
                    .edges(vec![edge(0, 1, EdgeKind::True), edge(0, 2, EdgeKind::False)])
                    .build(),
            )
            .build();

        let findings = findings_for("ERADICATE", vec![holder, reader]);

        assert_eq!(
            findings,
            vec![
                "NULL_DEREFERENCE foreignReadBad: object `h.name` could be null and is dereferenced at line 9"
                    .to_string()
            ]
        );
    }

    #[test]
    fn nullable_return_flows_to_callers() {
        let class = ClassBuilder::new("com/example/Source")
            .method(
                MethodBuilder::new("find", "()Ljava/lang/String;")
                    .annotation(Annotation::Nullable)
                    .block(0, vec![ret(2, Operand::Null)])
                    .build(),
            )
            .method(
                MethodBuilder::new("plain", "()Ljava/lang/String;")
                    .block(0, vec![ret(4, Operand::Null)])
                    .build(),
            )
            .method(
                MethodBuilder::new("useBad", "()V")
                    .block(
                        0,
                        vec![
                            invoke(
                                6,
                                Some("s"),
                                virtual_call(
                                    "com/example/Source",
                                    "find",
                                    "()Ljava/lang/String;",
                                    "this",
                                    Vec::new(),
                                ),
                            ),
                            length_of(7, "s"),
                            ret_void(8),
                        ],
                    )
                    .build(),
            )
            .build();

        let findings = findings_for("ERADICATE", vec![class]);

        assert_eq!(
            findings,
            vec![
                "RETURN_NOT_NULLABLE plain: method `plain()` may return null but it is not annotated with `@Nullable`"
                    .to_string(),
                "NULL_DEREFERENCE useBad: object returned by `Source.find()` could be null and is dereferenced at line 7"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn native_returns_are_unknown_unless_declared_non_null() {
        let call = |line: u32, target: &str, name: &str| {
            invoke(
                line,
                Some(target),
                virtual_call(
                    "com/example/Native",
                    name,
                    "()Ljava/lang/String;",
                    "this",
                    Vec::new(),
                ),
            )
        };
        let class = ClassBuilder::new("com/example/Native")
            .method(MethodBuilder::new("lookup", "()Ljava/lang/String;").native().build())
            .method(
                MethodBuilder::new("fetch", "()Ljava/lang/String;")
                    .native()
                    .annotation(Annotation::NonNull)
                    .build(),
            )
            .method(
                MethodBuilder::new("declared", "()Ljava/lang/String;")
                    .annotation(Annotation::NonNull)
                    .block(0, vec![ret(4, Operand::Null)])
                    .build(),
            )
            .method(
                MethodBuilder::new("useBoth", "()V")
                    .block(
                        0,
                        vec![
                            call(10, "a", "lookup"),
                            length_of(11, "a"),
                            call(12, "b", "fetch"),
                            length_of(13, "b"),
                            call(14, "c", "declared"),
                            length_of(15, "c"),
                            ret_void(16),
                        ],
                    )
                    .build(),
            )
            .build();

        let findings = findings_for("ERADICATE", vec![class]);

        assert_eq!(
            findings,
            vec![
                "RETURN_NOT_NULLABLE declared: method `declared()` may return null but it is not annotated with `@Nullable`"
                    .to_string(),
                "NULL_DEREFERENCE useBoth: object returned by `Native.lookup()` could be null and is dereferenced at line 11"
                    .to_string(),
            ]
        );
    }

    fn holder_constructor(handler: Vec<crate::ir::Instruction>) -> ClassBuilder {
        ClassBuilder::new("com/example/Holder")
            .field(FieldBuilder::new("value", "Ljava/lang/String;").build())
            .method(
                MethodBuilder::new("<init>", "()V")
                    .block(
                        0,
                        vec![
                            invoke(
                                3,
                                None,
                                special_call("java/lang/Object", "<init>", "()V", "this", Vec::new()),
                            ),
                            invoke(
                                4,
                                Some("t"),
                                static_call(
                                    "com/example/Factory",
                                    "compute",
                                    "()Ljava/lang/String;",
                                    Vec::new(),
                                ),
                            ),
                            store_field(4, "this", "com/example/Holder", "value", var("t")),
                            ret_void(5),
                        ],
                    )
                    .block(1, handler)
                    .edges(vec![edge(0, 1, EdgeKind::Exception)])
                    .build(),
            )
    }

    #[test]
    fn handler_read_before_escaping_exception_is_not_an_initialization_error() {
        let class = holder_constructor(vec![
            load_field(6, "v", "this", "com/example/Holder", "value"),
            length_of(6, "v"),
            throw_var(7, "e"),
        ])
        .build();

        assert!(findings_for("ERADICATE", vec![class]).is_empty());
    }

    #[test]
    fn handler_returning_normally_leaves_field_uninitialized() {
        let class = holder_constructor(vec![
            load_field(6, "v", "this", "com/example/Holder", "value"),
            ret_void(7),
        ])
        .build();

        let findings = findings_for("ERADICATE", vec![class]);

        assert_eq!(
            findings,
            vec![
                "FIELD_NOT_INITIALIZED <init>: field `Holder.value` is not initialized in the constructor and is not annotated `@Nullable`"
                    .to_string()
            ]
        );
    }

    #[test]
    fn suppressed_method_reports_nothing() {
        let class = ClassBuilder::new("com/example/ClassA")
            .method(
                nullable_param_method("methodQuiet")
                    .annotation(Annotation::Suppress {
                        checkers: vec!["eradicate".to_string()],
                    })
                    .block(0, vec![length_of(2, "s"), ret_void(3)])
                    .build(),
            )
            .build();

        assert!(findings_for("ERADICATE", vec![class]).is_empty());
    }
}

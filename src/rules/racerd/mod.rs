use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;
use tracing::debug;

use crate::callgraph::MethodId;
use crate::dataflow::access_path::{FieldKey, MAX_DEPTH};
use crate::dataflow::lattice::{Lattice, MaySet, MustSet};
use crate::dataflow::worklist::{InstructionRef, InstructionStep, WorklistSemantics, analyze_method};
use crate::descriptor::method_param_count;
use crate::engine::AnalysisContext;
use crate::ir::{
    CallSite, Class, Instruction, InstructionKind, Method, Operand, Visibility, simple_name,
};
use crate::models::ModelEffect;
use crate::report::Finding;
use crate::rules::{Rule, RuleMetadata, RuleOutput};
use crate::summary::{
    MethodOutcome, MethodTarget, SummaryAnalysis, SummaryStore, SummaryView, compute_summaries,
};

const CHECKER_ID: &str = "RACERD";

/// Rule that reports data races on fields of thread-safe classes.
#[derive(Default)]
pub(crate) struct RacerDRule;

crate::register_checker!(RacerDRule);

impl Rule for RacerDRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: CHECKER_ID,
            name: "Thread safety",
            description: "Unprotected writes and read/write races in classes annotated thread-safe",
        }
    }

    fn run(&self, context: &AnalysisContext) -> Result<RuleOutput> {
        let run = compute_summaries(context, &RacerD)?;
        let findings = report_races(context, &run.store);
        Ok(RuleOutput {
            findings,
            diagnostics: run.diagnostics,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Root {
    This,
    Param(usize),
    Static,
    /// Object of unknown provenance, such as an unmodeled call result.
    Unowned,
}

/// Object reached from a root through up to [`MAX_DEPTH`] fields.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct ObjectPath {
    root: Root,
    fields: Vec<FieldKey>,
}

impl ObjectPath {
    fn root(root: Root) -> Self {
        Self {
            root,
            fields: Vec::new(),
        }
    }

    fn unowned() -> Self {
        Self::root(Root::Unowned)
    }

    /// Extend by `field`; paths past the depth limit keep their prefix.
    fn field(&self, field: &FieldKey) -> Self {
        let mut extended = self.clone();
        if extended.fields.len() < MAX_DEPTH {
            extended.fields.push(field.clone());
        }
        extended
    }

    fn rebase(&self, prefix: &ObjectPath) -> Self {
        self.fields
            .iter()
            .fold(prefix.clone(), |path, field| path.field(field))
    }

    fn is_reportable(&self) -> bool {
        matches!(self.root, Root::This | Root::Static | Root::Unowned)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Root::This => write!(f, "this")?,
            Root::Param(index) => write!(f, "p{index}")?,
            Root::Static => {
                let Some((first, rest)) = self.fields.split_first() else {
                    return write!(f, "<static>");
                };
                write!(f, "{first}")?;
                for field in rest {
                    write!(f, ".{}", field.name)?;
                }
                return Ok(());
            }
            Root::Unowned => write!(f, "<unknown>")?,
        }
        for field in &self.fields {
            write!(f, ".{}", field.name)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Lock {
    Object(ObjectPath),
    /// Monitor of a class object, held by static synchronized methods.
    Class(String),
}

/// Who may reach the value held by a local.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Ownership {
    /// Freshly allocated by this method.
    Owned,
    /// Result of a call without side effects.
    Functional,
    Shared(ObjectPath),
}

impl Lattice for Ownership {
    fn join_with(&mut self, other: &Self) -> bool {
        let joined = match (&*self, other) {
            (left, right) if left == right => left.clone(),
            (Ownership::Functional, right) => right.clone(),
            (left, Ownership::Functional) => left.clone(),
            (Ownership::Owned, Ownership::Shared(path)) | (Ownership::Shared(path), Ownership::Owned) => {
                Ownership::Shared(path.clone())
            }
            _ => Ownership::Shared(ObjectPath::unowned()),
        };
        let changed = joined != *self;
        *self = joined;
        changed
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum AccessKind {
    Read,
    Write,
}

/// Field access performed by a method or one of its callees.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Access {
    field: FieldKey,
    path: ObjectPath,
    kind: AccessKind,
    locks: BTreeSet<Lock>,
    /// Locks the method gave up before the access without having taken them itself.
    released: BTreeSet<Lock>,
    /// Line in the summarized method; a call line for accesses made by callees.
    line: u32,
    /// Method performing the access when reached through calls.
    via: Option<String>,
}

impl Access {
    fn describe(&self) -> String {
        let target = if self.path.root == Root::Static && self.path.fields.is_empty() {
            self.field.to_string()
        } else {
            format!("{}.{}", self.path, self.field.name)
        };
        match &self.via {
            Some(via) => format!("`{target}` via call to `{via}`"),
            None => format!("`{target}`"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct RaceState {
    ownership: BTreeMap<String, Ownership>,
    locks: MustSet<Lock>,
    /// Caller-held locks released here and not re-acquired.
    released: MaySet<Lock>,
    returned: Option<Ownership>,
}

impl Lattice for RaceState {
    fn join_with(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (local, value) in &other.ownership {
            match self.ownership.get_mut(local) {
                Some(existing) => changed |= existing.join_with(value),
                None => {
                    self.ownership.insert(local.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed |= self.locks.join_with(&other.locks);
        changed |= self.released.join_with(&other.released);
        match (&mut self.returned, &other.returned) {
            (Some(existing), Some(value)) => changed |= existing.join_with(value),
            (None, Some(value)) => {
                self.returned = Some(value.clone());
                changed = true;
            }
            _ => {}
        }
        changed
    }
}

/// Accesses and lock effects callers inherit from a method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RaceSummary {
    accesses: BTreeSet<Access>,
    /// Locks acquired and still held on return.
    held_at_exit: BTreeSet<Lock>,
    /// Locks the caller holds that are no longer held on return.
    released: BTreeSet<Lock>,
    returns: Ownership,
}

struct RacerD;

impl SummaryAnalysis for RacerD {
    type Summary = RaceSummary;

    fn checker_id(&self) -> &'static str {
        CHECKER_ID
    }

    fn unknown_summary(&self, _context: &AnalysisContext, _method: &MethodId) -> RaceSummary {
        RaceSummary {
            accesses: BTreeSet::new(),
            held_at_exit: BTreeSet::new(),
            released: BTreeSet::new(),
            returns: Ownership::Shared(ObjectPath::unowned()),
        }
    }

    fn analyze_method(
        &self,
        context: &AnalysisContext,
        target: &MethodTarget<'_>,
        callees: &SummaryView<'_, Self>,
    ) -> Result<MethodOutcome<RaceSummary>> {
        let semantics = RaceSemantics {
            context,
            target,
            callees,
        };
        let analysis = analyze_method(target.method, &semantics)?;
        let entry_locks = semantics.initial_state(target.method).locks;
        let (held_at_exit, released, returns) = match analysis.fixpoint.normal_exit {
            Some(exit) => (
                exit.locks
                    .0
                    .difference(&entry_locks.0)
                    .cloned()
                    .collect(),
                exit.released.0,
                exit.returned.unwrap_or(Ownership::Owned),
            ),
            None => (BTreeSet::new(), BTreeSet::new(), Ownership::Owned),
        };
        Ok(MethodOutcome {
            summary: RaceSummary {
                accesses: analysis.findings.into_iter().collect(),
                held_at_exit,
                released,
                returns,
            },
            findings: Vec::new(),
            block_visits: analysis.fixpoint.block_visits,
        })
    }
}

struct RaceSemantics<'a> {
    context: &'a AnalysisContext,
    target: &'a MethodTarget<'a>,
    callees: &'a SummaryView<'a, RacerD>,
}

impl RaceSemantics<'_> {
    fn ownership(&self, state: &RaceState, local: &str) -> Ownership {
        state
            .ownership
            .get(local)
            .cloned()
            .unwrap_or_else(|| Ownership::Shared(ObjectPath::unowned()))
    }

    fn operand_ownership(&self, state: &RaceState, operand: &Operand) -> Ownership {
        match operand {
            Operand::Var(local) => self.ownership(state, local),
            Operand::Null | Operand::Literal(_) | Operand::Condition(_) => Ownership::Owned,
        }
    }

    fn access(
        &self,
        state: &RaceState,
        path: ObjectPath,
        field: FieldKey,
        kind: AccessKind,
        line: u32,
    ) -> Access {
        Access {
            field,
            path,
            kind,
            locks: state.locks.0.clone(),
            released: state.released.0.clone(),
            line,
            via: None,
        }
    }

    fn acquire(&self, state: &mut RaceState, lock: Lock) {
        state.released.0.remove(&lock);
        state.locks.0.insert(lock);
    }

    /// Releasing a lock not taken here gives up one the caller holds.
    fn release(&self, state: &mut RaceState, lock: Lock) {
        if !state.locks.0.remove(&lock) {
            state.released.0.insert(lock);
        }
    }

    fn lock_of(&self, state: &RaceState, local: &str) -> Lock {
        match self.ownership(state, local) {
            Ownership::Shared(path) => Lock::Object(path),
            Ownership::Owned | Ownership::Functional => Lock::Object(ObjectPath::unowned()),
        }
    }

    fn invoke(
        &self,
        state: &mut RaceState,
        at: InstructionRef,
        line: u32,
        target: Option<&str>,
        call: &CallSite,
    ) -> Vec<Access> {
        let receiver = call
            .receiver
            .as_deref()
            .map(|receiver| self.ownership(state, receiver));
        let model = self.context.call_model(self.target.id, at, call);

        let mut accesses = Vec::new();
        let result = if let Some(model) = model {
            if let Some(receiver) = call.receiver.as_deref() {
                if model.has_effect(&ModelEffect::LockAcquire) {
                    let lock = self.lock_of(state, receiver);
                    self.acquire(state, lock);
                }
                if model.has_effect(&ModelEffect::LockRelease) {
                    let lock = self.lock_of(state, receiver);
                    self.release(state, lock);
                }
            }
            if model.has_effect(&ModelEffect::Functional) {
                Ownership::Functional
            } else if model.has_effect(&ModelEffect::ReturnsReceiverSubobject) {
                receiver.clone().unwrap_or(Ownership::Shared(ObjectPath::unowned()))
            } else {
                Ownership::Shared(ObjectPath::unowned())
            }
        } else {
            let targets = self.context.call_graph.targets(self.target.id, at);
            if targets.is_empty() {
                Ownership::Shared(ObjectPath::unowned())
            } else {
                let actuals = Actuals {
                    receiver: receiver.clone(),
                    args: call
                        .args
                        .iter()
                        .map(|arg| self.operand_ownership(state, arg))
                        .collect(),
                };
                let mut result: Option<Ownership> = None;
                let mut held: Option<BTreeSet<Lock>> = None;
                let mut released = BTreeSet::new();
                for callee in targets {
                    let summary = self.callees.summary(callee);
                    let via = format!("{}.{}()", simple_name(&callee.class_name), callee.name);
                    for access in &summary.accesses {
                        if let Some(rebased) = actuals.rebase_access(access, state, line, &via) {
                            accesses.push(rebased);
                        }
                    }
                    released.extend(summary.released.iter().map(|lock| actuals.rebase_lock(lock)));
                    let locks: BTreeSet<Lock> = summary
                        .held_at_exit
                        .iter()
                        .map(|lock| actuals.rebase_lock(lock))
                        .collect();
                    held = Some(match held {
                        Some(existing) => existing.intersection(&locks).cloned().collect(),
                        None => locks,
                    });
                    let returns = actuals.rebase_ownership(&summary.returns);
                    match &mut result {
                        Some(existing) => {
                            existing.join_with(&returns);
                        }
                        None => result = Some(returns),
                    }
                }
                for lock in released {
                    self.release(state, lock);
                }
                state.locks.0.extend(held.unwrap_or_default());
                result.unwrap_or(Ownership::Shared(ObjectPath::unowned()))
            }
        };

        if let Some(target) = target {
            state.ownership.insert(target.to_string(), result);
        }
        accesses
    }
}

/// Caller-side values bound to a callee's receiver and parameters.
struct Actuals {
    receiver: Option<Ownership>,
    args: Vec<Ownership>,
}

impl Actuals {
    fn actual(&self, root: &Root) -> Option<Ownership> {
        match root {
            Root::This => self.receiver.clone(),
            Root::Param(index) => self.args.get(*index).cloned(),
            Root::Static | Root::Unowned => None,
        }
    }

    /// Path in the caller; `None` when the callee object is owned by the caller.
    fn rebase_path(&self, path: &ObjectPath) -> Option<ObjectPath> {
        match self.actual(&path.root) {
            None if matches!(path.root, Root::Static | Root::Unowned) => Some(path.clone()),
            None => Some(path.rebase(&ObjectPath::unowned())),
            Some(Ownership::Shared(prefix)) => Some(path.rebase(&prefix)),
            Some(Ownership::Owned | Ownership::Functional) => None,
        }
    }

    fn rebase_lock(&self, lock: &Lock) -> Lock {
        match lock {
            Lock::Object(path) => Lock::Object(
                self.rebase_path(path)
                    .unwrap_or_else(ObjectPath::unowned),
            ),
            Lock::Class(name) => Lock::Class(name.clone()),
        }
    }

    fn rebase_ownership(&self, ownership: &Ownership) -> Ownership {
        match ownership {
            Ownership::Shared(path) => match self.rebase_path(path) {
                Some(path) => Ownership::Shared(path),
                None => Ownership::Owned,
            },
            other => other.clone(),
        }
    }

    /// Callee access as seen at the call: caller locks count unless the callee released them first.
    fn rebase_access(
        &self,
        access: &Access,
        caller: &RaceState,
        line: u32,
        via: &str,
    ) -> Option<Access> {
        let path = self.rebase_path(&access.path)?;
        let mut locks: BTreeSet<Lock> = access
            .locks
            .iter()
            .map(|lock| self.rebase_lock(lock))
            .collect();
        let mut released: BTreeSet<Lock> = access
            .released
            .iter()
            .map(|lock| self.rebase_lock(lock))
            .collect();
        locks.extend(
            caller
                .locks
                .0
                .iter()
                .filter(|lock| !released.contains(*lock))
                .cloned(),
        );
        released.extend(caller.released.0.iter().cloned());
        Some(Access {
            field: access.field.clone(),
            path,
            kind: access.kind,
            locks,
            released,
            line,
            via: Some(access.via.clone().unwrap_or_else(|| via.to_string())),
        })
    }
}

impl WorklistSemantics for RaceSemantics<'_> {
    type State = RaceState;
    type Finding = Access;

    fn initial_state(&self, method: &Method) -> RaceState {
        let mut ownership = BTreeMap::new();
        let mut locks = MustSet::new();
        if method.access.is_static {
            if method.access.is_synchronized {
                locks.0.insert(Lock::Class(self.target.class.name.clone()));
            }
        } else {
            ownership.insert(
                "this".to_string(),
                Ownership::Shared(ObjectPath::root(Root::This)),
            );
            if method.access.is_synchronized {
                locks.0.insert(Lock::Object(ObjectPath::root(Root::This)));
            }
        }
        let count = method_param_count(&method.descriptor).unwrap_or(method.parameters.len());
        for index in 0..count {
            ownership.insert(
                method.parameter_name(index),
                Ownership::Shared(ObjectPath::root(Root::Param(index))),
            );
        }
        RaceState {
            ownership,
            locks,
            released: MaySet::new(),
            returned: None,
        }
    }

    fn transfer_instruction(
        &self,
        _method: &Method,
        at: InstructionRef,
        instruction: &Instruction,
        state: &mut RaceState,
    ) -> Result<InstructionStep<Access>> {
        let line = instruction.line;
        let mut accesses = Vec::new();
        match &instruction.kind {
            InstructionKind::Assign { target, value } => {
                let ownership = self.operand_ownership(state, value);
                state.ownership.insert(target.clone(), ownership);
            }
            InstructionKind::New { target, .. } => {
                state.ownership.insert(target.clone(), Ownership::Owned);
            }
            InstructionKind::LoadField {
                target,
                base,
                field,
            } => {
                let key = FieldKey::resolve(&self.context.classpath, field);
                let object = match base {
                    Some(base) => self.ownership(state, base),
                    None => Ownership::Shared(ObjectPath::root(Root::Static)),
                };
                let loaded = match object {
                    Ownership::Shared(path) => {
                        accesses.push(self.access(
                            state,
                            path.clone(),
                            key.clone(),
                            AccessKind::Read,
                            line,
                        ));
                        Ownership::Shared(path.field(&key))
                    }
                    owned => owned,
                };
                state.ownership.insert(target.clone(), loaded);
            }
            InstructionKind::StoreField { base, field, value } => {
                let key = FieldKey::resolve(&self.context.classpath, field);
                let object = match base {
                    Some(base) => self.ownership(state, base),
                    None => Ownership::Shared(ObjectPath::root(Root::Static)),
                };
                let benign = self.operand_ownership(state, value) == Ownership::Functional;
                if let (Ownership::Shared(path), false) = (object, benign) {
                    accesses.push(self.access(state, path, key, AccessKind::Write, line));
                }
            }
            InstructionKind::Invoke { target, call } => {
                accesses = self.invoke(state, at, line, target.as_deref(), call);
            }
            InstructionKind::MonitorEnter { lock } => {
                let lock = self.lock_of(state, lock);
                self.acquire(state, lock);
            }
            InstructionKind::MonitorExit { lock } => {
                let lock = self.lock_of(state, lock);
                self.release(state, lock);
            }
            InstructionKind::Return { value } => {
                let returned = value
                    .as_ref()
                    .map(|value| self.operand_ownership(state, value))
                    .unwrap_or(Ownership::Owned);
                state.returned = Some(returned);
            }
            InstructionKind::Branch { .. } | InstructionKind::Throw { .. } => {}
        }
        Ok(InstructionStep::continue_path().with_findings(accesses))
    }
}

/// Access reached from a public entry point of a thread-safe class.
struct EntryAccess<'a> {
    class: &'a Class,
    method: &'a Method,
    access: Access,
}

impl EntryAccess<'_> {
    fn method_name(&self) -> String {
        format!("{}.{}()", simple_name(&self.class.name), self.method.name)
    }
}

fn is_entry_point(method: &Method) -> bool {
    method.has_body()
        && method.access.visibility != Visibility::Private
        && !method.is_constructor()
        && method.name != "<clinit>"
}

/// Pair up accesses of all entry points and report conflicting ones.
fn report_races(context: &AnalysisContext, store: &SummaryStore<RaceSummary>) -> Vec<Finding> {
    let classpath = &context.classpath;
    let mut by_field: BTreeMap<FieldKey, Vec<EntryAccess<'_>>> = BTreeMap::new();
    for class in &classpath.classes {
        if !classpath.is_thread_safe(&class.name) {
            continue;
        }
        for method in class.methods.iter().filter(|method| is_entry_point(method)) {
            let Some(summary) = store.get(&MethodId::of(class, method)) else {
                continue;
            };
            for access in summary.accesses.iter().filter(|access| access.path.is_reportable()) {
                by_field
                    .entry(access.field.clone())
                    .or_default()
                    .push(EntryAccess {
                        class,
                        method,
                        access: access.clone(),
                    });
            }
        }
    }

    let mut findings = Vec::new();
    for (field, accesses) in &by_field {
        for (index, first) in accesses.iter().enumerate() {
            for second in &accesses[index..] {
                let writes = [first, second]
                    .iter()
                    .filter(|entry| entry.access.kind == AccessKind::Write)
                    .count();
                if writes == 0 || !first.access.locks.is_disjoint(&second.access.locks) {
                    continue;
                }
                findings.push(race_finding(context, field, first, second));
            }
        }
        debug!(field = %field, accesses = accesses.len(), "checked field accesses");
    }
    findings
}

fn race_finding(
    context: &AnalysisContext,
    field: &FieldKey,
    first: &EntryAccess<'_>,
    second: &EntryAccess<'_>,
) -> Finding {
    let (reported, other) = if first.access.kind == AccessKind::Read {
        (first, second)
    } else if second.access.kind == AccessKind::Read {
        (second, first)
    } else {
        (first, second)
    };

    let message = if reported.access.kind == AccessKind::Read {
        let how = if reported.access.locks.is_empty() {
            "without synchronization"
        } else {
            "under a lock the writer does not hold"
        };
        format!(
            "Read/Write race. Non-private method `{}` reads {how} from {}. Potentially races with write in method `{}`.",
            reported.method_name(),
            reported.access.describe(),
            other.method_name()
        )
    } else if std::ptr::eq(reported, other) {
        format!(
            "Unprotected write. Non-private method `{}` writes to field {} outside of synchronization.",
            reported.method_name(),
            reported.access.describe()
        )
    } else {
        format!(
            "Unprotected write. Non-private method `{}` writes to field {} outside of synchronization. Potentially races with write in method `{}`.",
            reported.method_name(),
            reported.access.describe(),
            other.method_name()
        )
    };

    Finding::at(
        context,
        CHECKER_ID,
        "THREAD_SAFETY_VIOLATION",
        reported.class,
        reported.method,
        Some(reported.access.line),
        message,
    )
    .with_field(field.clone())
}

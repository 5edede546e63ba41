use serde::{Deserialize, Serialize};

use crate::models::MethodModel;

/// Program model handed over by an external front-end.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct Program {
    #[serde(default)]
    pub(crate) classes: Vec<Class>,
    #[serde(default)]
    pub(crate) models: Vec<MethodModel>,
}

/// Class declaration with its fields and methods.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Class {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) super_name: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    /// Enclosing class for inner classes.
    #[serde(default)]
    pub(crate) outer_class: Option<String>,
    #[serde(default)]
    pub(crate) source_file: Option<String>,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    #[serde(default)]
    pub(crate) fields: Vec<Field>,
    #[serde(default)]
    pub(crate) methods: Vec<Method>,
    #[serde(skip)]
    pub(crate) artifact_index: i64,
}

impl Class {
    pub(crate) fn has_annotation(&self, kind: AnnotationKind) -> bool {
        has_annotation(&self.annotations, kind)
    }

    pub(crate) fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }
}

/// Field declaration. The declaring class is the class that lists it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) visibility: Visibility,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
}

impl Field {
    pub(crate) fn has_annotation(&self, kind: AnnotationKind) -> bool {
        has_annotation(&self.annotations, kind)
    }
}

/// Declared accessibility of a member.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Visibility {
    Public,
    Protected,
    #[default]
    Package,
    Private,
}

/// Method declaration with an optional body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    #[serde(default)]
    pub(crate) access: MethodAccess,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
    /// Formal parameters, excluding the receiver.
    #[serde(default)]
    pub(crate) parameters: Vec<Parameter>,
    #[serde(default)]
    pub(crate) cfg: Option<ControlFlowGraph>,
}

impl Method {
    pub(crate) fn has_annotation(&self, kind: AnnotationKind) -> bool {
        has_annotation(&self.annotations, kind)
    }

    /// Whether the method carries a body the checkers can analyze.
    pub(crate) fn has_body(&self) -> bool {
        self.cfg.is_some() && !self.access.is_abstract && !self.access.is_native
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Local variable name bound to the parameter at `index`.
    pub(crate) fn parameter_name(&self, index: usize) -> String {
        self.parameters
            .get(index)
            .map(|parameter| parameter.name.clone())
            .unwrap_or_else(|| format!("p{index}"))
    }

    pub(crate) fn parameter_has_annotation(&self, index: usize, kind: AnnotationKind) -> bool {
        self.parameters
            .get(index)
            .is_some_and(|parameter| has_annotation(&parameter.annotations, kind))
    }

    /// Line of the first instruction, used when a finding has no better anchor.
    pub(crate) fn first_line(&self) -> Option<u32> {
        let cfg = self.cfg.as_ref()?;
        let entry = cfg.blocks.iter().find(|block| block.id == cfg.entry)?;
        entry.instructions.first().map(|instruction| instruction.line)
    }
}

/// Method flags relevant to the checkers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub(crate) struct MethodAccess {
    #[serde(default)]
    pub(crate) visibility: Visibility,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_abstract: bool,
    #[serde(default)]
    pub(crate) is_native: bool,
    #[serde(default)]
    pub(crate) is_synchronized: bool,
}

/// Formal parameter of a method.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Parameter {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) annotations: Vec<Annotation>,
}

/// Annotation attached to a program entity.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Annotation {
    Nullable,
    NonNull,
    ThreadSafe,
    NoAllocation,
    IgnoreAllocations,
    Functional,
    Assume,
    Suppress {
        #[serde(default)]
        checkers: Vec<String>,
    },
}

/// Payload-free annotation discriminant for lookups.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum AnnotationKind {
    Nullable,
    NonNull,
    ThreadSafe,
    NoAllocation,
    IgnoreAllocations,
    Functional,
    Assume,
    Suppress,
}

impl Annotation {
    pub(crate) fn kind(&self) -> AnnotationKind {
        match self {
            Annotation::Nullable => AnnotationKind::Nullable,
            Annotation::NonNull => AnnotationKind::NonNull,
            Annotation::ThreadSafe => AnnotationKind::ThreadSafe,
            Annotation::NoAllocation => AnnotationKind::NoAllocation,
            Annotation::IgnoreAllocations => AnnotationKind::IgnoreAllocations,
            Annotation::Functional => AnnotationKind::Functional,
            Annotation::Assume => AnnotationKind::Assume,
            Annotation::Suppress { .. } => AnnotationKind::Suppress,
        }
    }

    /// Whether a suppress annotation silences the given checker id.
    pub(crate) fn suppresses(&self, checker_id: &str) -> bool {
        match self {
            Annotation::Suppress { checkers } => {
                checkers.is_empty()
                    || checkers
                        .iter()
                        .any(|checker| checker.eq_ignore_ascii_case(checker_id))
            }
            _ => false,
        }
    }
}

fn has_annotation(annotations: &[Annotation], kind: AnnotationKind) -> bool {
    annotations.iter().any(|annotation| annotation.kind() == kind)
}

/// Control-flow graph of a method body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ControlFlowGraph {
    pub(crate) entry: u32,
    pub(crate) blocks: Vec<BasicBlock>,
    #[serde(default)]
    pub(crate) edges: Vec<FlowEdge>,
}

/// Basic block of straight-line instructions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct BasicBlock {
    pub(crate) id: u32,
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
}

/// Directed control-flow edge between blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub(crate) struct FlowEdge {
    pub(crate) from: u32,
    pub(crate) to: u32,
    #[serde(default)]
    pub(crate) kind: EdgeKind,
}

/// Edge classification; `True`/`False` leave a block ending in a branch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EdgeKind {
    #[default]
    FallThrough,
    True,
    False,
    Exception,
}

/// One statement with its source line.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Instruction {
    pub(crate) line: u32,
    #[serde(flatten)]
    pub(crate) kind: InstructionKind,
}

impl Instruction {
    /// Whether the instruction has an implicit edge to the exception handler.
    pub(crate) fn may_throw(&self) -> bool {
        match &self.kind {
            InstructionKind::Invoke { .. } | InstructionKind::Throw { .. } => true,
            InstructionKind::LoadField { base, .. } | InstructionKind::StoreField { base, .. } => {
                base.is_some()
            }
            _ => false,
        }
    }
}

/// Statement kinds understood by the checkers.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum InstructionKind {
    Assign {
        target: String,
        value: Operand,
    },
    New {
        target: String,
        class: String,
    },
    LoadField {
        target: String,
        /// Receiver local; `None` for static fields.
        #[serde(default)]
        base: Option<String>,
        field: FieldRef,
    },
    StoreField {
        #[serde(default)]
        base: Option<String>,
        field: FieldRef,
        value: Operand,
    },
    Invoke {
        #[serde(default)]
        target: Option<String>,
        call: CallSite,
    },
    Branch {
        condition: Condition,
    },
    Throw {
        value: Operand,
    },
    Return {
        #[serde(default)]
        value: Option<Operand>,
    },
    MonitorEnter {
        lock: String,
    },
    MonitorExit {
        lock: String,
    },
}

/// Value read by an instruction.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub(crate) enum Operand {
    Var(String),
    Null,
    /// Non-null compile-time constant.
    Literal(String),
    Condition(Box<Condition>),
}

impl Operand {
    pub(crate) fn var(&self) -> Option<&str> {
        match self {
            Operand::Var(name) => Some(name),
            _ => None,
        }
    }
}

/// Boolean condition of a branch or precondition argument.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Condition {
    Compare {
        left: Operand,
        right: Operand,
        /// `true` for `==`, `false` for `!=`.
        equal: bool,
    },
    InstanceOf {
        value: String,
        class: String,
    },
    Value {
        value: String,
    },
    Not {
        inner: Box<Condition>,
    },
    And {
        operands: Vec<Condition>,
    },
    Or {
        operands: Vec<Condition>,
    },
}

/// Field reference as written at the access; `owner` may be a subclass of the declarer.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
}

/// Call site extracted from a method body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    #[serde(default)]
    pub(crate) receiver: Option<String>,
    #[serde(default)]
    pub(crate) args: Vec<Operand>,
}

impl CallSite {
    pub(crate) fn qualified_name(&self) -> String {
        format!("{}.{}", simple_name(&self.owner), self.name)
    }
}

/// Dispatch classification used by CHA.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Last path segment of an internal class name.
pub(crate) fn simple_name(class_name: &str) -> &str {
    class_name.rsplit('/').next().unwrap_or(class_name)
}

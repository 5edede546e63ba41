use std::fs;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::engine::{AnalysisConfig, Engine, EngineOutput, build_context_with_timings};
use crate::ir::{
    Annotation, BasicBlock, CallKind, CallSite, Class, Condition, ControlFlowGraph, EdgeKind,
    Field, FieldRef, FlowEdge, Instruction, InstructionKind, Method, MethodAccess, Operand,
    Parameter, Program, Visibility,
};
use crate::models::MethodModel;
use crate::scan::scan_inputs;

/// Builder for test classes.
pub(crate) struct ClassBuilder {
    class: Class,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            class: Class {
                name: name.to_string(),
                super_name: None,
                interfaces: Vec::new(),
                outer_class: None,
                source_file: None,
                annotations: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                artifact_index: 0,
            },
        }
    }

    pub(crate) fn super_name(mut self, name: &str) -> Self {
        self.class.super_name = Some(name.to_string());
        self
    }

    pub(crate) fn interface(mut self, name: &str) -> Self {
        self.class.interfaces.push(name.to_string());
        self
    }

    pub(crate) fn outer_class(mut self, name: &str) -> Self {
        self.class.outer_class = Some(name.to_string());
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.class.annotations.push(annotation);
        self
    }

    pub(crate) fn field(mut self, field: Field) -> Self {
        self.class.fields.push(field);
        self
    }

    pub(crate) fn method(mut self, method: Method) -> Self {
        self.class.methods.push(method);
        self
    }

    pub(crate) fn build(self) -> Class {
        self.class
    }
}

/// Builder for test fields.
pub(crate) struct FieldBuilder {
    field: Field,
}

impl FieldBuilder {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            field: Field {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                visibility: Visibility::Package,
                is_static: false,
                annotations: Vec::new(),
            },
        }
    }

    pub(crate) fn visibility(mut self, visibility: Visibility) -> Self {
        self.field.visibility = visibility;
        self
    }

    pub(crate) fn is_static(mut self) -> Self {
        self.field.is_static = true;
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.field.annotations.push(annotation);
        self
    }

    pub(crate) fn build(self) -> Field {
        self.field
    }
}

/// Builder for test methods; the first block added is the entry.
pub(crate) struct MethodBuilder {
    method: Method,
    blocks: Vec<BasicBlock>,
    edges: Vec<FlowEdge>,
}

impl MethodBuilder {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            method: Method {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                access: MethodAccess {
                    visibility: Visibility::Public,
                    ..MethodAccess::default()
                },
                annotations: Vec::new(),
                parameters: Vec::new(),
                cfg: None,
            },
            blocks: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub(crate) fn visibility(mut self, visibility: Visibility) -> Self {
        self.method.access.visibility = visibility;
        self
    }

    pub(crate) fn is_static(mut self) -> Self {
        self.method.access.is_static = true;
        self
    }

    pub(crate) fn native(mut self) -> Self {
        self.method.access.is_native = true;
        self
    }

    pub(crate) fn synchronized(mut self) -> Self {
        self.method.access.is_synchronized = true;
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.method.annotations.push(annotation);
        self
    }

    pub(crate) fn parameter(self, name: &str) -> Self {
        self.parameter_with(name, Vec::new())
    }

    pub(crate) fn parameter_with(mut self, name: &str, annotations: Vec<Annotation>) -> Self {
        self.method.parameters.push(Parameter {
            name: name.to_string(),
            annotations,
        });
        self
    }

    pub(crate) fn block(mut self, id: u32, instructions: Vec<Instruction>) -> Self {
        self.blocks.push(BasicBlock { id, instructions });
        self
    }

    pub(crate) fn edges(mut self, edges: Vec<FlowEdge>) -> Self {
        self.edges.extend(edges);
        self
    }

    pub(crate) fn build(mut self) -> Method {
        if let Some(entry) = self.blocks.first().map(|block| block.id) {
            self.method.cfg = Some(ControlFlowGraph {
                entry,
                blocks: self.blocks,
                edges: self.edges,
            });
        }
        self.method
    }
}

pub(crate) fn edge(from: u32, to: u32, kind: EdgeKind) -> FlowEdge {
    FlowEdge { from, to, kind }
}

pub(crate) fn var(name: &str) -> Operand {
    Operand::Var(name.to_string())
}

pub(crate) fn literal(value: &str) -> Operand {
    Operand::Literal(value.to_string())
}

fn at(line: u32, kind: InstructionKind) -> Instruction {
    Instruction { line, kind }
}

pub(crate) fn ret_void(line: u32) -> Instruction {
    at(line, InstructionKind::Return { value: None })
}

pub(crate) fn ret(line: u32, value: Operand) -> Instruction {
    at(line, InstructionKind::Return { value: Some(value) })
}

pub(crate) fn assign(line: u32, target: &str, value: Operand) -> Instruction {
    at(
        line,
        InstructionKind::Assign {
            target: target.to_string(),
            value,
        },
    )
}

pub(crate) fn assign_literal(line: u32, target: &str) -> Instruction {
    assign(line, target, literal("tmpValue"))
}

pub(crate) fn new_object(line: u32, target: &str, class: &str) -> Instruction {
    at(
        line,
        InstructionKind::New {
            target: target.to_string(),
            class: class.to_string(),
        },
    )
}

fn field_ref(owner: &str, name: &str) -> FieldRef {
    FieldRef {
        owner: owner.to_string(),
        name: name.to_string(),
    }
}

pub(crate) fn load_field(line: u32, target: &str, base: &str, owner: &str, name: &str) -> Instruction {
    at(
        line,
        InstructionKind::LoadField {
            target: target.to_string(),
            base: Some(base.to_string()),
            field: field_ref(owner, name),
        },
    )
}

pub(crate) fn load_static(line: u32, target: &str, owner: &str, name: &str) -> Instruction {
    at(
        line,
        InstructionKind::LoadField {
            target: target.to_string(),
            base: None,
            field: field_ref(owner, name),
        },
    )
}

pub(crate) fn store_field(
    line: u32,
    base: &str,
    owner: &str,
    name: &str,
    value: Operand,
) -> Instruction {
    at(
        line,
        InstructionKind::StoreField {
            base: Some(base.to_string()),
            field: field_ref(owner, name),
            value,
        },
    )
}

pub(crate) fn store_static(line: u32, owner: &str, name: &str, value: Operand) -> Instruction {
    at(
        line,
        InstructionKind::StoreField {
            base: None,
            field: field_ref(owner, name),
            value,
        },
    )
}

pub(crate) fn invoke(line: u32, target: Option<&str>, call: CallSite) -> Instruction {
    at(
        line,
        InstructionKind::Invoke {
            target: target.map(str::to_string),
            call,
        },
    )
}

fn call_site(
    kind: CallKind,
    owner: &str,
    name: &str,
    descriptor: &str,
    receiver: Option<&str>,
    args: Vec<Operand>,
) -> CallSite {
    CallSite {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        kind,
        receiver: receiver.map(str::to_string),
        args,
    }
}

pub(crate) fn virtual_call(
    owner: &str,
    name: &str,
    descriptor: &str,
    receiver: &str,
    args: Vec<Operand>,
) -> CallSite {
    call_site(CallKind::Virtual, owner, name, descriptor, Some(receiver), args)
}

pub(crate) fn interface_call(
    owner: &str,
    name: &str,
    descriptor: &str,
    receiver: &str,
    args: Vec<Operand>,
) -> CallSite {
    call_site(CallKind::Interface, owner, name, descriptor, Some(receiver), args)
}

pub(crate) fn special_call(
    owner: &str,
    name: &str,
    descriptor: &str,
    receiver: &str,
    args: Vec<Operand>,
) -> CallSite {
    call_site(CallKind::Special, owner, name, descriptor, Some(receiver), args)
}

pub(crate) fn static_call(owner: &str, name: &str, descriptor: &str, args: Vec<Operand>) -> CallSite {
    call_site(CallKind::Static, owner, name, descriptor, None, args)
}

pub(crate) fn branch(line: u32, condition: Condition) -> Instruction {
    at(line, InstructionKind::Branch { condition })
}

pub(crate) fn branch_on(line: u32, value: &str) -> Instruction {
    branch(
        line,
        Condition::Value {
            value: value.to_string(),
        },
    )
}

/// `value != null`
pub(crate) fn not_null(value: &str) -> Condition {
    Condition::Compare {
        left: var(value),
        right: Operand::Null,
        equal: false,
    }
}

pub(crate) fn throw_var(line: u32, value: &str) -> Instruction {
    at(line, InstructionKind::Throw { value: var(value) })
}

pub(crate) fn monitor_enter(line: u32, lock: &str) -> Instruction {
    at(
        line,
        InstructionKind::MonitorEnter {
            lock: lock.to_string(),
        },
    )
}

pub(crate) fn monitor_exit(line: u32, lock: &str) -> Instruction {
    at(
        line,
        InstructionKind::MonitorExit {
            lock: lock.to_string(),
        },
    )
}

/// Writes program models to a scratch directory and runs the full pipeline on them.
pub(crate) struct ProgramHarness {
    temp_dir: TempDir,
    config: AnalysisConfig,
}

impl ProgramHarness {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: tempfile::tempdir().context("create temp dir")?,
            config: AnalysisConfig::default(),
        })
    }

    pub(crate) fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn analyze(&self, classes: Vec<Class>, models: Vec<MethodModel>) -> Result<EngineOutput> {
        let program = Program { classes, models };
        let path = self.temp_dir.path().join("program.json");
        let json = serde_json::to_string_pretty(&program).context("serialize program")?;
        fs::write(&path, json).context("write program")?;

        let scan = scan_inputs(self.temp_dir.path()).context("scan program")?;
        let (context, _) =
            build_context_with_timings(scan.program, &scan.artifacts, self.config.clone(), None)?;
        let engine = Engine::new(&self.config)?;
        engine.analyze(&context).context("run analysis")
    }
}

/// Run one checker over `classes` and return surfaced findings as `ISSUE_TYPE method: message` lines.
pub(crate) fn findings_for(checker: &str, classes: Vec<Class>) -> Vec<String> {
    let config = AnalysisConfig {
        checkers: vec![checker.to_string()],
        ..AnalysisConfig::default()
    };
    let output = ProgramHarness::new()
        .map(|harness| harness.with_config(config))
        .and_then(|harness| harness.analyze(classes, Vec::new()))
        .expect("analysis");
    output
        .findings
        .iter()
        .map(|finding| {
            format!(
                "{} {}: {}",
                finding.issue_type, finding.method.name, finding.message
            )
        })
        .collect()
}

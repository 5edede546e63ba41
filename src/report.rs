use std::collections::BTreeMap;

use serde_json::json;
use serde_sarif::sarif::{
    ArtifactLocation, Location, LogicalLocation, Message, PhysicalLocation, PropertyBag, Region,
    Result as SarifResult,
};

use crate::callgraph::MethodId;
use crate::classpath::ClasspathIndex;
use crate::dataflow::access_path::FieldKey;
use crate::engine::AnalysisContext;
use crate::ir::{Annotation, Class, Method};

/// Potential defect reported by a checker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Finding {
    pub(crate) checker: &'static str,
    pub(crate) issue_type: &'static str,
    pub(crate) method: MethodId,
    /// Field the finding is about, consulted for field-level suppression.
    pub(crate) field: Option<FieldKey>,
    pub(crate) file: Option<String>,
    pub(crate) line: Option<u32>,
    pub(crate) message: String,
    pub(crate) suppressed: bool,
}

impl Finding {
    pub(crate) fn at(
        context: &AnalysisContext,
        checker: &'static str,
        issue_type: &'static str,
        class: &Class,
        method: &Method,
        line: Option<u32>,
        message: impl Into<String>,
    ) -> Self {
        let file = class
            .source_file
            .clone()
            .or_else(|| context.artifact_uri(class.artifact_index).map(str::to_string));
        Self {
            checker,
            issue_type,
            method: MethodId::of(class, method),
            field: None,
            file,
            line: line.or_else(|| method.first_line()),
            message: message.into(),
            suppressed: false,
        }
    }

    pub(crate) fn with_field(mut self, field: FieldKey) -> Self {
        self.field = Some(field);
        self
    }

    fn sort_key(&self) -> (&str, u32, &str, &str) {
        (
            self.file.as_deref().unwrap_or(""),
            self.line.unwrap_or(0),
            self.checker,
            &self.message,
        )
    }
}

/// Mark findings whose method, enclosing classes, or field carry a matching suppress annotation.
pub(crate) fn apply_suppressions(classpath: &ClasspathIndex, findings: &mut [Finding]) {
    for finding in findings {
        finding.suppressed = is_suppressed(classpath, finding);
    }
}

fn is_suppressed(classpath: &ClasspathIndex, finding: &Finding) -> bool {
    let suppresses = |annotations: &[Annotation]| {
        annotations
            .iter()
            .any(|annotation| annotation.suppresses(finding.checker))
    };

    if let Some(method) = classpath.method(
        &finding.method.class_name,
        &finding.method.name,
        &finding.method.descriptor,
    ) {
        if suppresses(&method.annotations) {
            return true;
        }
    }

    let mut current = classpath.class(&finding.method.class_name);
    let mut hops = 0;
    while let Some(class) = current {
        if suppresses(&class.annotations) {
            return true;
        }
        hops += 1;
        if hops > classpath.classes.len() {
            break;
        }
        current = class
            .outer_class
            .as_deref()
            .and_then(|outer| classpath.class(outer));
    }

    finding.field.as_ref().is_some_and(|field| {
        classpath
            .class(&field.class_name)
            .and_then(|class| class.field(&field.name))
            .is_some_and(|declared| suppresses(&declared.annotations))
    })
}

/// Drop suppressed findings (unless requested) and sort by file, line, checker, message.
pub(crate) fn surface(mut findings: Vec<Finding>, include_suppressed: bool) -> Vec<Finding> {
    if !include_suppressed {
        findings.retain(|finding| !finding.suppressed);
    }
    findings.sort_by(|left, right| {
        left.sort_key()
            .cmp(&right.sort_key())
            .then_with(|| left.method.cmp(&right.method))
    });
    findings
}

pub(crate) fn sarif_result(finding: &Finding) -> SarifResult {
    let location = method_location_with_line(
        &finding.method,
        finding.file.as_deref(),
        finding.line,
    );
    let mut properties = BTreeMap::new();
    properties.insert("summa.issue_type".to_string(), json!(finding.issue_type));
    if finding.suppressed {
        properties.insert("summa.suppressed".to_string(), json!(true));
    }
    let mut result = SarifResult::builder()
        .message(result_message(&finding.message))
        .locations(vec![location])
        .properties(PropertyBag::builder().additional_properties(properties).build())
        .build();
    result.rule_id = Some(finding.checker.to_string());
    result
}

pub(crate) fn method_location_with_line(
    method: &MethodId,
    artifact_uri: Option<&str>,
    line: Option<u32>,
) -> Location {
    let logical = method_logical_location(method);
    let Some(uri) = artifact_uri else {
        return Location::builder().logical_locations(vec![logical]).build();
    };
    let artifact_location = ArtifactLocation::builder().uri(uri.to_string()).build();
    let physical = if let Some(line) = line {
        let region = Region::builder().start_line(line as i64).build();
        PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .region(region)
            .build()
    } else {
        PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .build()
    };
    Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build()
}

pub(crate) fn method_logical_location(method: &MethodId) -> LogicalLocation {
    LogicalLocation::builder()
        .name(method.to_string())
        .kind("function")
        .build()
}

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

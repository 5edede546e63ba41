use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Count parameters in a JVM method descriptor.
pub(crate) fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReturnKind {
    Void,
    Primitive,
    Reference,
}

/// Determine the return kind from a JVM method descriptor.
pub(crate) fn method_return_kind(descriptor: &str) -> Result<ReturnKind> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let kind = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(kind)
}

/// Whether a JVM field descriptor names a reference type.
pub(crate) fn is_reference_field(descriptor: &str) -> Result<bool> {
    // A field type parses as the return type of a nullary method descriptor.
    let descriptor = MethodDescriptor::from_str(&format!("(){descriptor}"))
        .context("parse field descriptor")?;
    Ok(matches!(
        descriptor.return_type(),
        TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_parameters() {
        assert_eq!(
            method_param_count("(Ljava/lang/String;I)V").expect("descriptor"),
            2
        );
        assert_eq!(method_param_count("()V").expect("descriptor"), 0);
    }

    #[test]
    fn classifies_return_kind() {
        assert_eq!(
            method_return_kind("()Ljava/lang/String;").expect("descriptor"),
            ReturnKind::Reference
        );
        assert_eq!(
            method_return_kind("()I").expect("descriptor"),
            ReturnKind::Primitive
        );
        assert_eq!(
            method_return_kind("()V").expect("descriptor"),
            ReturnKind::Void
        );
    }

    #[test]
    fn classifies_field_descriptor() {
        assert!(is_reference_field("Ljava/lang/String;").expect("descriptor"));
        assert!(is_reference_field("[I").expect("descriptor"));
        assert!(!is_reference_field("Z").expect("descriptor"));
    }
}

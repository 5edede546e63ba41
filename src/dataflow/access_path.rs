use std::fmt;

use crate::classpath::ClasspathIndex;
use crate::ir::{FieldRef, simple_name};

/// Maximum number of field selectors kept on a path.
pub(crate) const MAX_DEPTH: usize = 2;

/// Field identity after declaring-class resolution.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FieldKey {
    pub(crate) class_name: String,
    pub(crate) name: String,
}

impl FieldKey {
    /// Attribute the access to the class declaring the field; unknown owners keep the written owner.
    pub(crate) fn resolve(classpath: &ClasspathIndex, field: &FieldRef) -> Self {
        let class_name = classpath
            .resolve_field(&field.owner, &field.name)
            .map(|resolved| resolved.declaring_class.name.clone())
            .unwrap_or_else(|| field.owner.clone());
        Self {
            class_name,
            name: field.name.clone(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", simple_name(&self.class_name), self.name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum PathRoot {
    Local(String),
    Static,
}

/// Local or static root followed by up to [`MAX_DEPTH`] field selectors.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct AccessPath {
    pub(crate) root: PathRoot,
    pub(crate) fields: Vec<FieldKey>,
}

impl AccessPath {
    pub(crate) fn local(name: &str) -> Self {
        Self {
            root: PathRoot::Local(name.to_string()),
            fields: Vec::new(),
        }
    }

    pub(crate) fn static_field(field: FieldKey) -> Self {
        Self {
            root: PathRoot::Static,
            fields: vec![field],
        }
    }

    /// Extend by one field; `None` once the depth limit is reached.
    pub(crate) fn with_field(&self, field: FieldKey) -> Option<Self> {
        if self.fields.len() >= MAX_DEPTH {
            return None;
        }
        let mut fields = self.fields.clone();
        fields.push(field);
        Some(Self {
            root: self.root.clone(),
            fields,
        })
    }

    pub(crate) fn root_local(&self) -> Option<&str> {
        match &self.root {
            PathRoot::Local(name) => Some(name),
            PathRoot::Static => None,
        }
    }

    pub(crate) fn last_field(&self) -> Option<&FieldKey> {
        self.fields.last()
    }

    /// Whether `self` is `prefix` or a path reached through it.
    pub(crate) fn starts_with(&self, prefix: &AccessPath) -> bool {
        self.root == prefix.root
            && self.fields.len() >= prefix.fields.len()
            && self.fields[..prefix.fields.len()] == prefix.fields[..]
    }

    /// Replace the `from` prefix with `to`, respecting the depth limit.
    pub(crate) fn rebase(&self, from: &AccessPath, to: &AccessPath) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let mut rebased = to.clone();
        for field in &self.fields[from.fields.len()..] {
            rebased = rebased.with_field(field.clone())?;
        }
        Some(rebased)
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            PathRoot::Local(name) => {
                write!(f, "{name}")?;
                for field in &self.fields {
                    write!(f, ".{}", field.name)?;
                }
            }
            PathRoot::Static => {
                let mut first = true;
                for field in &self.fields {
                    if first {
                        write!(f, "{field}")?;
                        first = false;
                    } else {
                        write!(f, ".{}", field.name)?;
                    }
                }
            }
        }
        Ok(())
    }
}

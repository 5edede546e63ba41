use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::Result;

use crate::ir::{AnnotationKind, Class, Field, Method, Program};
use crate::models::ModelTable;

/// Supertypes of common library classes that never appear in a program model.
const LIBRARY_SUPERTYPES: &[(&str, &[&str])] = &[
    ("java/lang/String", &["java/lang/Object"]),
    ("java/lang/StringBuilder", &["java/lang/Object"]),
    ("java/util/HashMap", &["java/util/AbstractMap", "java/util/Map"]),
    ("java/util/TreeMap", &["java/util/AbstractMap", "java/util/Map"]),
    ("java/util/LinkedHashMap", &["java/util/HashMap"]),
    ("java/util/AbstractMap", &["java/util/Map"]),
    (
        "java/util/concurrent/ConcurrentHashMap",
        &["java/util/AbstractMap", "java/util/concurrent/ConcurrentMap"],
    ),
    ("java/util/concurrent/ConcurrentMap", &["java/util/Map"]),
    (
        "java/util/concurrent/locks/ReentrantLock",
        &["java/util/concurrent/locks/Lock"],
    ),
    ("android/app/Activity", &["android/content/Context"]),
    ("android/view/ViewGroup", &["android/view/View"]),
];

/// Resolved program index keyed by class name.
pub(crate) struct ClasspathIndex {
    pub(crate) classes: Vec<Class>,
    pub(crate) models: ModelTable,
    by_name: BTreeMap<String, usize>,
    subclasses: BTreeMap<String, Vec<String>>,
}

/// Field after resolving the class that declares it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolvedField<'a> {
    pub(crate) declaring_class: &'a Class,
    pub(crate) field: &'a Field,
}

pub(crate) fn resolve_classpath(program: Program) -> Result<ClasspathIndex> {
    let mut class_map: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for class in &program.classes {
        class_map
            .entry(class.name.clone())
            .or_default()
            .push(class.artifact_index);
    }

    let mut duplicates = Vec::new();
    for (name, indices) in &class_map {
        if indices.len() > 1 {
            duplicates.push(format!("{name}: {indices:?}"));
        }
    }
    if !duplicates.is_empty() {
        anyhow::bail!("duplicate classes found: {}", duplicates.join(", "));
    }

    let mut by_name = BTreeMap::new();
    let mut subclasses: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (index, class) in program.classes.iter().enumerate() {
        by_name.insert(class.name.clone(), index);
        let parents = class.super_name.iter().chain(class.interfaces.iter());
        for parent in parents {
            subclasses
                .entry(parent.clone())
                .or_default()
                .push(class.name.clone());
        }
    }
    for descendants in subclasses.values_mut() {
        descendants.sort();
        descendants.dedup();
    }

    Ok(ClasspathIndex {
        classes: program.classes,
        models: ModelTable::new(program.models),
        by_name,
        subclasses,
    })
}

impl ClasspathIndex {
    pub(crate) fn class(&self, name: &str) -> Option<&Class> {
        self.by_name.get(name).map(|index| &self.classes[*index])
    }

    pub(crate) fn method(&self, class_name: &str, name: &str, descriptor: &str) -> Option<&Method> {
        self.class(class_name)?.method(name, descriptor)
    }

    /// Direct supertypes, falling back to the builtin library table.
    pub(crate) fn direct_supertypes(&self, name: &str) -> Vec<String> {
        if let Some(class) = self.class(name) {
            return class
                .super_name
                .iter()
                .chain(class.interfaces.iter())
                .cloned()
                .collect();
        }
        LIBRARY_SUPERTYPES
            .iter()
            .find(|(class_name, _)| *class_name == name)
            .map(|(_, supertypes)| supertypes.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }

    /// The class itself followed by all transitive supertypes, breadth first.
    pub(crate) fn type_and_supertypes(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            queue.extend(self.direct_supertypes(&current));
            order.push(current);
        }
        order
    }

    /// All program classes that transitively extend or implement `name`.
    pub(crate) fn descendants(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self
            .subclasses
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.subclasses.get(&current) {
                queue.extend(children.iter().cloned());
            }
        }
        seen.into_iter().collect()
    }

    /// Walk superclasses from `owner` to the class that declares `field_name`.
    pub(crate) fn resolve_field(&self, owner: &str, field_name: &str) -> Option<ResolvedField<'_>> {
        let mut current = Some(owner.to_string());
        let mut seen = BTreeSet::new();
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            let class = self.class(&name)?;
            if let Some(field) = class.field(field_name) {
                return Some(ResolvedField {
                    declaring_class: class,
                    field,
                });
            }
            current = class.super_name.clone();
        }
        None
    }

    /// Outermost enclosing class; inner classes share it with their outer class.
    pub(crate) fn top_level_class<'a>(&'a self, name: &'a str) -> &'a str {
        let mut current = name;
        let mut hops = 0;
        while let Some(outer) = self
            .class(current)
            .and_then(|class| class.outer_class.as_deref())
        {
            current = outer;
            hops += 1;
            if hops > self.classes.len() {
                break;
            }
        }
        current
    }

    /// Whether the class or one of its superclasses is annotated thread-safe.
    pub(crate) fn is_thread_safe(&self, name: &str) -> bool {
        self.type_and_supertypes(name).iter().any(|candidate| {
            self.class(candidate)
                .is_some_and(|class| class.has_annotation(AnnotationKind::ThreadSafe))
        })
    }
}

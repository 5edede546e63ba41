use serde::{Deserialize, Serialize};

use crate::classpath::ClasspathIndex;
use crate::ir::simple_name;

/// Behavioral model for a method that is not (or should not be) analyzed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct MethodModel {
    /// Exact internal name, `*/Simple` for any class with that simple name, or `*`.
    pub(crate) owner: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) descriptor: Option<String>,
    pub(crate) effects: Vec<ModelEffect>,
}

/// Pre-classified effect of a modeled method.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub(crate) enum ModelEffect {
    /// No field mutation, no allocation visible to the caller.
    Functional,
    NoReturn,
    ReturnsNullable,
    ReturnsNonNull,
    /// `None` asserts every reference argument.
    AssertsNonNull {
        #[serde(default)]
        parameter: Option<usize>,
    },
    AssertsCondition {
        parameter: usize,
    },
    UnlikelyMarker,
    TaintSource {
        kind: String,
    },
    TaintSink {
        kind: String,
    },
    Sanitizer,
    LockAcquire,
    LockRelease,
    ReturnsReceiverSubobject,
}

/// Model lookup table; user models shadow builtin ones.
pub(crate) struct ModelTable {
    user: Vec<MethodModel>,
    builtin: Vec<MethodModel>,
}

impl ModelTable {
    pub(crate) fn new(user: Vec<MethodModel>) -> Self {
        Self {
            user,
            builtin: builtin_models(),
        }
    }

    /// Resolve the model for a call, walking the owner's supertypes.
    pub(crate) fn lookup<'a>(
        &'a self,
        classpath: &ClasspathIndex,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Option<&'a MethodModel> {
        for class_name in classpath.type_and_supertypes(owner) {
            for table in [&self.user, &self.builtin] {
                if let Some(model) = table.iter().find(|model| {
                    !model.is_wildcard() && model.matches(&class_name, name, descriptor)
                }) {
                    return Some(model);
                }
            }
        }
        [&self.user, &self.builtin]
            .into_iter()
            .flat_map(|table| table.iter())
            .find(|model| model.is_wildcard() && model.matches(owner, name, descriptor))
    }
}

impl MethodModel {
    fn matches(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        if self.name != name {
            return false;
        }
        if let Some(expected) = &self.descriptor {
            if expected != descriptor {
                return false;
            }
        }
        if self.owner == "*" {
            return true;
        }
        if let Some(simple) = self.owner.strip_prefix("*/") {
            return simple_name(owner) == simple;
        }
        self.owner == owner
    }

    /// Whether the owner pattern is `*`, matching any class.
    pub(crate) fn is_wildcard(&self) -> bool {
        self.owner == "*"
    }

    pub(crate) fn has_effect(&self, effect: &ModelEffect) -> bool {
        self.effects.contains(effect)
    }
}

fn model(owner: &str, name: &str, effects: Vec<ModelEffect>) -> MethodModel {
    MethodModel {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: None,
        effects,
    }
}

fn builtin_models() -> Vec<MethodModel> {
    use ModelEffect::*;

    let mut models = vec![
        model(
            "com/google/common/base/Preconditions",
            "checkNotNull",
            vec![AssertsNonNull { parameter: Some(0) }, ReturnsNonNull],
        ),
        model(
            "com/google/common/base/Preconditions",
            "checkState",
            vec![AssertsCondition { parameter: 0 }],
        ),
        model(
            "com/google/common/base/Preconditions",
            "checkArgument",
            vec![AssertsCondition { parameter: 0 }],
        ),
        model(
            "com/facebook/infer/annotation/Assertions",
            "assertNotNull",
            vec![AssertsNonNull { parameter: Some(0) }, ReturnsNonNull],
        ),
        model(
            "com/facebook/infer/annotation/Assertions",
            "assumeNotNull",
            vec![AssertsNonNull { parameter: Some(0) }, ReturnsNonNull],
        ),
        model(
            "com/facebook/infer/annotation/Assertions",
            "assertCondition",
            vec![AssertsCondition { parameter: 0 }],
        ),
        model(
            "com/facebook/infer/annotation/Assertions",
            "assumeCondition",
            vec![AssertsCondition { parameter: 0 }],
        ),
        model(
            "java/util/Objects",
            "requireNonNull",
            vec![AssertsNonNull { parameter: Some(0) }, ReturnsNonNull],
        ),
        // Any other method named checkNotNull asserts all of its arguments.
        model("*", "checkNotNull", vec![AssertsNonNull { parameter: None }]),
        model("java/lang/Object", "<init>", vec![Functional]),
        model("java/lang/System", "exit", vec![NoReturn]),
        model("java/lang/Runtime", "exit", vec![NoReturn]),
        model("java/lang/Runtime", "halt", vec![NoReturn]),
        model("java/lang/System", "getProperty", vec![ReturnsNullable]),
        model("java/lang/System", "getenv", vec![ReturnsNullable]),
        model("java/util/Map", "get", vec![ReturnsNullable]),
        model("java/util/Map", "remove", vec![ReturnsNullable]),
        model("java/lang/String", "valueOf", vec![ReturnsNonNull]),
        model("*", "toString", vec![ReturnsNonNull]),
        model("*/Branch", "unlikely", vec![UnlikelyMarker, Functional]),
        model("java/util/concurrent/locks/Lock", "lock", vec![LockAcquire]),
        model("java/util/concurrent/locks/Lock", "unlock", vec![LockRelease]),
        model(
            "android/view/View",
            "findViewById",
            vec![ReturnsReceiverSubobject],
        ),
        model(
            "android/app/Activity",
            "findViewById",
            vec![ReturnsReceiverSubobject],
        ),
    ];

    for name in [
        "getBoolean",
        "getColor",
        "getDimension",
        "getDimensionPixelSize",
        "getDrawable",
        "getInteger",
        "getString",
        "getText",
    ] {
        models.push(model("android/content/res/Resources", name, vec![Functional]));
    }

    for name in [
        "getAltitude",
        "getBearing",
        "getLatitude",
        "getLongitude",
        "getSpeed",
    ] {
        models.push(model(
            "android/location/Location",
            name,
            vec![TaintSource {
                kind: "PrivateData".to_string(),
            }],
        ));
    }
    for name in [
        "getDeviceId",
        "getLine1Number",
        "getSimSerialNumber",
        "getSubscriberId",
        "getVoiceMailNumber",
    ] {
        models.push(model(
            "android/telephony/TelephonyManager",
            name,
            vec![TaintSource {
                kind: "PrivateData".to_string(),
            }],
        ));
    }
    models.push(model(
        "android/content/SharedPreferences",
        "getString",
        vec![TaintSource {
            kind: "PrivateData".to_string(),
        }],
    ));

    for name in ["d", "e", "i", "v", "w", "wtf", "println"] {
        models.push(model(
            "android/util/Log",
            name,
            vec![TaintSink {
                kind: "Logging".to_string(),
            }],
        ));
    }

    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classpath::resolve_classpath;
    use crate::ir::Program;
    use crate::test_harness::ClassBuilder;

    fn effects<'a>(
        index: &'a ClasspathIndex,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> &'a [ModelEffect] {
        index
            .models
            .lookup(index, owner, name, descriptor)
            .map(|model| model.effects.as_slice())
            .unwrap_or(&[])
    }

    #[test]
    fn lookup_falls_back_to_library_supertype() {
        let index = resolve_classpath(Program::default()).expect("index");

        let effects = effects(
            &index,
            "java/util/concurrent/ConcurrentHashMap",
            "get",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
        );

        assert_eq!(effects, &[ModelEffect::ReturnsNullable]);
    }

    #[test]
    fn lookup_walks_program_superclasses() {
        let program = Program {
            classes: vec![ClassBuilder::new("com/example/MyResources")
                .super_name("android/content/res/Resources")
                .build()],
            models: Vec::new(),
        };
        let index = resolve_classpath(program).expect("index");

        let functional = effects(
            &index,
            "com/example/MyResources",
            "getString",
            "(I)Ljava/lang/String;",
        );
        let configuration = effects(
            &index,
            "com/example/MyResources",
            "getConfiguration",
            "()Landroid/content/res/Configuration;",
        );

        assert_eq!(functional, &[ModelEffect::Functional]);
        assert!(configuration.is_empty());
    }

    #[test]
    fn user_models_shadow_builtin_models() {
        let program = Program {
            classes: Vec::new(),
            models: vec![MethodModel {
                owner: "java/lang/System".to_string(),
                name: "getenv".to_string(),
                descriptor: None,
                effects: vec![ModelEffect::ReturnsNonNull],
            }],
        };
        let index = resolve_classpath(program).expect("index");

        let effects = effects(
            &index,
            "java/lang/System",
            "getenv",
            "(Ljava/lang/String;)Ljava/lang/String;",
        );

        assert_eq!(effects, &[ModelEffect::ReturnsNonNull]);
    }

    #[test]
    fn simple_name_pattern_matches_any_package() {
        let index = resolve_classpath(Program::default()).expect("index");

        let effects = effects(&index, "codetoanalyze/java/checkers/Branch", "unlikely", "(Z)Z");

        assert!(effects.contains(&ModelEffect::UnlikelyMarker));
    }

    #[test]
    fn exact_owner_wins_over_wildcard() {
        let index = resolve_classpath(Program::default()).expect("index");

        let effects = effects(
            &index,
            "com/google/common/base/Preconditions",
            "checkNotNull",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
        );

        assert!(effects.contains(&ModelEffect::AssertsNonNull { parameter: Some(0) }));
    }

    #[test]
    fn user_taint_models_load_from_json() {
        let program: Program = serde_json::from_str(
            r#"{"models": [
                {"owner": "com/example/Vault", "name": "secret",
                 "effects": [{"effect": "taint_source", "kind": "Secret"}]},
                {"owner": "*/Uploader", "name": "send", "descriptor": "(Ljava/lang/String;)V",
                 "effects": [{"effect": "taint_sink", "kind": "Network"}]}
            ]}"#,
        )
        .expect("parse models");
        let index = resolve_classpath(program).expect("index");

        let source = effects(&index, "com/example/Vault", "secret", "()Ljava/lang/String;");
        let sink = effects(&index, "org/acme/Uploader", "send", "(Ljava/lang/String;)V");

        assert_eq!(
            source,
            &[ModelEffect::TaintSource {
                kind: "Secret".to_string()
            }]
        );
        assert_eq!(
            sink,
            &[ModelEffect::TaintSink {
                kind: "Network".to_string()
            }]
        );
        let round_trip = serde_json::to_value(&index.models.lookup(
            &index,
            "com/example/Vault",
            "secret",
            "()Ljava/lang/String;",
        ))
        .expect("serialize model");
        assert_eq!(round_trip["effects"][0]["effect"], "taint_source");
        assert_eq!(round_trip["effects"][0]["kind"], "Secret");
    }
}

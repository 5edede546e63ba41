use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/program.json");
const RECURSIVE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/recursive.json");

fn run_summa(output: &Path, extra: &[&str]) -> Value {
    run_summa_on(FIXTURE, output, extra)
}

fn run_summa_on(input: &str, output: &Path, extra: &[&str]) -> Value {
    let status = Command::new(env!("CARGO_BIN_EXE_summa"))
        .arg("--input")
        .arg(input)
        .arg("--output")
        .arg(output)
        .arg("--quiet")
        .args(extra)
        .status()
        .expect("run summa");
    assert!(status.success());
    let text = fs::read_to_string(output).expect("read SARIF");
    serde_json::from_str(&text).expect("parse SARIF")
}

fn rule_ids(sarif: &Value, key: &str, pointer: &str) -> Vec<String> {
    sarif["runs"][0][key]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.pointer(pointer).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn every_checker_reports_into_one_run() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let sarif = run_summa(&temp_dir.path().join("out.sarif"), &[]);

    assert_eq!(sarif["version"], "2.1.0");
    let run = &sarif["runs"][0];
    assert_eq!(run["tool"]["driver"]["name"], "summa");
    let rules: Vec<_> = run["tool"]["driver"]["rules"]
        .as_array()
        .expect("rules")
        .iter()
        .filter_map(|rule| rule["id"].as_str())
        .collect();
    assert_eq!(rules, vec!["ERADICATE", "NO_ALLOCATION", "QUANDARY", "RACERD"]);

    // Counter.java sorts before Greeter.java.
    assert_eq!(rule_ids(&sarif, "results", "/ruleId"), vec!["RACERD", "ERADICATE"]);
    let deref = &run["results"][1];
    assert_eq!(
        deref["message"]["text"],
        "object `name` could be null and is dereferenced at line 5"
    );
    assert_eq!(
        deref["locations"][0]["physicalLocation"]["region"]["startLine"],
        5
    );
    assert_eq!(run["artifacts"][0]["roles"][0], "analysisTarget");
    assert_eq!(run["invocations"][0]["executionSuccessful"], true);
    assert_eq!(run["invocations"][0]["properties"]["summa.class_count"], 2);
}

#[test]
fn checker_filter_limits_rules_and_results() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let sarif = run_summa(&temp_dir.path().join("out.sarif"), &["--checker", "racerd"]);

    assert_eq!(
        rule_ids(&sarif, "results", "/ruleId"),
        vec!["RACERD".to_string()]
    );
    let rules = sarif["runs"][0]["tool"]["driver"]["rules"]
        .as_array()
        .expect("rules")
        .len();
    assert_eq!(rules, 1);
}

fn diagnostics_of(sarif: &Value, category: &str) -> Vec<String> {
    sarif["runs"][0]["invocations"][0]["properties"]["summa.diagnostics"]
        .as_array()
        .expect("diagnostics")
        .iter()
        .filter(|diagnostic| diagnostic["category"] == category)
        .filter_map(|diagnostic| diagnostic["method"].as_str())
        .map(str::to_string)
        .collect()
}

#[test]
fn recursion_converges_with_default_pass_cap() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let sarif = run_summa_on(
        RECURSIVE,
        &temp_dir.path().join("out.sarif"),
        &["--checker", "racerd"],
    );

    assert!(diagnostics_of(&sarif, "soundness-fallback").is_empty());
    let results = sarif["runs"][0]["results"].as_array().expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0]["message"]["text"],
        "Unprotected write. Non-private method `Cycle.ping()` writes to field `this.count` via call to `Cycle.pong()` outside of synchronization."
    );
}

#[test]
fn pass_cap_of_one_reports_soundness_fallback() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let sarif = run_summa_on(
        RECURSIVE,
        &temp_dir.path().join("out.sarif"),
        &["--checker", "racerd", "--max-scc-passes", "1"],
    );

    assert_eq!(
        diagnostics_of(&sarif, "soundness-fallback"),
        vec![
            "com/example/Cycle.ping()V".to_string(),
            "com/example/Cycle.pong()V".to_string(),
        ]
    );
    assert!(
        sarif["runs"][0]["results"]
            .as_array()
            .is_none_or(Vec::is_empty)
    );
    assert_eq!(sarif["runs"][0]["invocations"][0]["executionSuccessful"], true);
}

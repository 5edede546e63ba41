use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::debug;

use crate::ir::Program;

/// Snapshot of parsed artifacts, the merged program, and counts for a scan.
pub(crate) struct ScanOutput {
    pub(crate) artifacts: Vec<Artifact>,
    pub(crate) class_count: usize,
    pub(crate) program: Program,
}

/// Load a program model from a `.json` file or every `.json` file under a directory.
pub(crate) fn scan_inputs(input: &Path) -> Result<ScanOutput> {
    let mut files = Vec::new();
    if input.is_dir() {
        collect_json_files(input, &mut files)?;
    } else {
        let extension = input.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        if extension != "json" {
            anyhow::bail!("unsupported input file: {}", input.display());
        }
        files.push(input.to_path_buf());
    }

    let mut artifacts = Vec::new();
    let mut program = Program::default();
    for path in files {
        let data =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let mut deserializer = serde_json::Deserializer::from_slice(&data);
        let mut part: Program = serde_path_to_error::deserialize(&mut deserializer)
            .with_context(|| format!("failed to parse program model {}", path.display()))?;
        let artifact_index = push_path_artifact(&path, data.len() as u64, &mut artifacts)?;
        for class in &mut part.classes {
            class.artifact_index = artifact_index;
        }
        debug!(
            path = %path.display(),
            classes = part.classes.len(),
            models = part.models.len(),
            "loaded program model"
        );
        program.classes.extend(part.classes);
        program.models.extend(part.models);
    }

    Ok(ScanOutput {
        artifacts,
        class_count: program.classes.len(),
        program,
    })
}

fn collect_json_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    // Keep deterministic ordering by sorting directory listings.
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            collect_json_files(&entry, files)?;
        } else if entry.extension().and_then(|ext| ext.to_str()) == Some("json") {
            files.push(entry);
        }
    }
    Ok(())
}

/// Push an analysis-target artifact and return its index.
fn push_path_artifact(path: &Path, len: u64, artifacts: &mut Vec<Artifact>) -> Result<i64> {
    let role: Value =
        serde_json::to_value(ArtifactRoles::AnalysisTarget).context("serialize artifact role")?;
    let location = ArtifactLocation::builder().uri(path_to_uri(path)).build();
    let artifact = Artifact::builder()
        .location(location)
        .length(len as i64)
        .roles(vec![role])
        .build();
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    Ok(index)
}

fn path_to_uri(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("file://{}", absolute.to_string_lossy())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_merges_files_in_sorted_order() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let nested = temp_dir.path().join("nested");
        fs::create_dir_all(&nested).expect("nested dir");
        fs::write(
            temp_dir.path().join("b.json"),
            r#"{"classes": [{"name": "com/example/ClassB"}]}"#,
        )
        .expect("write b");
        fs::write(
            nested.join("a.json"),
            r#"{"classes": [{"name": "com/example/ClassA"}]}"#,
        )
        .expect("write a");
        fs::write(temp_dir.path().join("notes.txt"), "ignored").expect("write notes");

        let scan = scan_inputs(temp_dir.path()).expect("scan");

        let names: Vec<_> = scan
            .program
            .classes
            .iter()
            .map(|class| (class.name.as_str(), class.artifact_index))
            .collect();
        assert_eq!(
            names,
            vec![("com/example/ClassB", 0), ("com/example/ClassA", 1)]
        );
        assert_eq!(scan.artifacts.len(), 2);
        assert_eq!(scan.class_count, 2);
        let roles = serde_json::to_value(&scan.artifacts[0].roles).expect("roles");
        assert_eq!(roles[0], "analysisTarget");
    }

    #[test]
    fn scan_reports_json_path_of_bad_field() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("broken.json");
        fs::write(
            &path,
            r#"{"classes": [{"name": "com/example/ClassA", "fields": [{"name": 3}]}]}"#,
        )
        .expect("write");

        let error = scan_inputs(&path).err().expect("parse error");

        let message = format!("{error:#}");
        assert!(message.contains("classes[0].fields[0].name"), "{message}");
    }

    #[test]
    fn scan_rejects_non_json_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("Foo.class");
        fs::write(&path, b"cafebabe").expect("write");

        let error = scan_inputs(&path).err().expect("unsupported");

        assert!(error.to_string().contains("unsupported input file"));
    }
}

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Checker directories under `src/rules/`, one `mod.rs` each, sorted by name.
fn checker_dirs(rules: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut checkers = Vec::new();
    for entry in fs::read_dir(rules)? {
        let entry = entry?;
        let module = entry.path().join("mod.rs");
        if module.is_file() {
            checkers.push((entry.file_name().to_string_lossy().into_owned(), module));
        }
    }
    checkers.sort();
    Ok(checkers)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rules = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("src/rules");
    println!("cargo:rerun-if-changed={}", rules.display());

    let checkers = checker_dirs(&rules)?;
    let mut generated = String::new();
    for (name, module) in &checkers {
        println!("cargo:rerun-if-changed={}", module.display());
        writeln!(generated, "#[path = {module:?}]\npub(crate) mod {name};")?;
    }
    let names: Vec<String> = checkers.iter().map(|(name, _)| format!("{name:?}")).collect();
    writeln!(
        generated,
        "#[cfg(test)]\npub(crate) const CHECKER_MODULES: &[&str] = &[{}];",
        names.join(", ")
    )?;

    fs::write(
        PathBuf::from(env::var("OUT_DIR")?).join("checker_modules.rs"),
        generated,
    )?;
    Ok(())
}

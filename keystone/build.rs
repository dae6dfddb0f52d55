// Rejects lint suppressions and placeholder macros in keystone sources.
// Set KEYSTONE_SOURCE_GUARD=0 to skip the scan (for example while bisecting).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED_ROOTS: [&str; 2] = ["src", "tests"];
const SKIPPED_DIRS: [&str; 3] = ["target", ".git", "vendor"];

struct Finding {
    file: PathBuf,
    line: usize,
    text: String,
    rule: &'static str,
}

fn main() {
    println!("cargo:rerun-if-env-changed=KEYSTONE_SOURCE_GUARD");
    if env::var("KEYSTONE_SOURCE_GUARD").is_ok_and(|v| v == "0") {
        return;
    }

    let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let manifest_dir = PathBuf::from(manifest_dir);

    let mut findings = Vec::new();
    for root in SCANNED_ROOTS {
        let path = manifest_dir.join(root);
        println!("cargo:rerun-if-changed={}", path.display());
        collect(&path, &mut findings);
    }

    if findings.is_empty() {
        return;
    }

    eprintln!("keystone source guard found {} problem(s):", findings.len());
    for finding in &findings {
        eprintln!(
            "  {}:{} [{}] {}",
            finding.file.display(),
            finding.line,
            finding.rule,
            finding.text.trim()
        );
    }
    panic!("keystone source guard failed");
}

fn collect(path: &Path, findings: &mut Vec<Finding>) {
    if path.is_dir() {
        if SKIPPED_DIRS.iter().any(|dir| path.ends_with(dir)) {
            return;
        }
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            collect(&entry.path(), findings);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    let allow_attr = ["#", "[allow"].concat();
    let inner_allow_attr = ["#!", "[allow"].concat();
    let todo_macro = ["todo", "!("].concat();
    let unimplemented_macro = ["unimplemented", "!("].concat();

    for (idx, line) in content.lines().enumerate() {
        let rule = if line.contains(&allow_attr) || line.contains(&inner_allow_attr) {
            Some("lint-suppression")
        } else if line.contains(&todo_macro) || line.contains(&unimplemented_macro) {
            Some("placeholder")
        } else {
            None
        };

        if let Some(rule) = rule {
            findings.push(Finding {
                file: path.to_path_buf(),
                line: idx + 1,
                text: line.to_string(),
                rule,
            });
        }
    }
}

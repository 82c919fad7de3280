//! Check Command
//!
//! Parses and validates scenario files without spawning anything.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use formprobe_harness::ScenarioSpec;
use serde::Serialize;
use walkdir::WalkDir;

use crate::output::{print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Scenario files or directories of scenarios
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

/// Validation result for one file
#[derive(Serialize, Clone)]
pub struct CheckedScenario {
    pub file: String,
    pub name: Option<String>,
    pub valid: bool,
    pub problem: Option<String>,
}

impl TableDisplay for CheckedScenario {
    fn headers() -> Vec<&'static str> {
        vec!["File", "Scenario", "Status", "Problem"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.file.clone(),
            self.name.clone().unwrap_or_else(|| "-".to_string()),
            if self.valid {
                "✓ valid".green().to_string()
            } else {
                "✗ invalid".red().to_string()
            },
            self.problem.clone().unwrap_or_default(),
        ]
    }
}

pub async fn execute(args: CheckArgs, format: OutputFormat) -> Result<bool> {
    let mut checked = Vec::new();
    for path in &args.paths {
        if !path.exists() {
            anyhow::bail!("{} does not exist", path.display());
        }
        for file in scenario_files(path) {
            checked.push(check_file(&file));
        }
    }

    print_list(&checked, format);

    let invalid = checked.iter().filter(|c| !c.valid).count();
    if invalid == 0 {
        print_success(&format!("{} scenario(s) valid", checked.len()));
        Ok(true)
    } else {
        print_error(&format!("{} of {} scenario(s) invalid", invalid, checked.len()));
        Ok(false)
    }
}

fn check_file(path: &Path) -> CheckedScenario {
    let file = path.display().to_string();
    match ScenarioSpec::from_file(path) {
        Ok(spec) => {
            let problem = spec.validate().err().map(|e| e.to_string());
            CheckedScenario {
                file,
                name: Some(spec.name),
                valid: problem.is_none(),
                problem,
            }
        }
        Err(e) => CheckedScenario {
            file,
            name: None,
            valid: false,
            problem: Some(e.to_string()),
        },
    }
}

/// YAML files under `path`, or `path` itself if it is a file
fn scenario_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matches!(e.path().extension().and_then(|ext| ext.to_str()), Some("yaml" | "yml")))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

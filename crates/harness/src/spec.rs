//! Declarative YAML scenario specification

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::form::FormTestConfig;
use crate::server::ServerConfig;

/// One end-to-end scenario parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Unique name for this scenario
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Where the server's project comes from (overridable from the CLI)
    #[serde(default)]
    pub project: Option<ProjectSource>,

    /// How to launch the server
    #[serde(default)]
    pub server: ServerConfig,

    /// The form to drive once the server is up
    pub form: FormTestConfig,

    #[serde(default)]
    pub expect: Expectations,

    /// File the scenario was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Where the project directory for a scenario comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectSource {
    /// An existing directory, relative to the scenario file
    Directory(PathBuf),

    /// Output of an external scaffolding command run in a fresh temp dir
    Scaffold(ScaffoldCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldCommand {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Subdirectory of the temp dir holding the server entrypoint
    #[serde(default)]
    pub subdir: Option<PathBuf>,

    #[serde(default = "default_scaffold_timeout_ms")]
    pub timeout_ms: u64,

    /// Leave the temp dir in place after the run
    #[serde(default)]
    pub keep_workspace: bool,
}

fn default_scaffold_timeout_ms() -> u64 {
    120_000
}

/// Assertions on the form result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    /// Expected value of `success`; `false` asserts a failure
    #[serde(default = "default_success")]
    pub success: bool,

    /// Exact expected result text, compared after trimming
    #[serde(default)]
    pub retrieved_text: Option<String>,
}

fn default_success() -> bool {
    true
}

impl Default for Expectations {
    fn default() -> Self {
        Self {
            success: true,
            retrieved_text: None,
        }
    }
}

impl ScenarioSpec {
    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, SpecError> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        Ok(spec)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, SpecError> {
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut spec = Self::from_yaml(&content).map_err(|e| SpecError::Invalid {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        spec.source = Some(path.to_path_buf());
        Ok(spec)
    }

    /// Load all scenarios from a directory tree, sorted by path
    pub fn load_all(dir: &Path) -> Result<Vec<Self>, SpecError> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        paths.sort();

        paths.iter().map(|path| Self::from_file(path)).collect()
    }

    /// Load scenarios from a mix of files and directories
    pub fn load_paths(paths: &[PathBuf]) -> Result<Vec<Self>, SpecError> {
        let mut specs = Vec::new();
        for path in paths {
            if path.is_dir() {
                specs.extend(Self::load_all(path)?);
            } else if path.is_file() {
                specs.push(Self::from_file(path)?);
            } else {
                return Err(SpecError::NotFound(path.display().to_string()));
            }
        }
        Ok(specs)
    }

    /// Filter specs by tag
    pub fn filter_by_tag<'a>(specs: &'a [Self], tag: &str) -> Vec<&'a Self> {
        specs.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Directory relative project paths are resolved against
    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Reject scenarios that could only fail at run time.
    pub fn validate(&self) -> Result<(), SpecError> {
        let invalid = |reason: String| SpecError::Invalid {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        self.server.validate().map_err(|e| invalid(format!("server: {}", e)))?;

        let form = &self.form;
        if form.url.trim().is_empty() {
            return Err(invalid("form.url is empty".to_string()));
        }
        if form.submit_selector.trim().is_empty() {
            return Err(invalid("form.submit_selector is empty".to_string()));
        }
        if form.success_indicator.value().trim().is_empty() {
            return Err(invalid("form.success_indicator is empty".to_string()));
        }
        if form.timeout_ms == 0 {
            return Err(invalid("form.timeout_ms must be positive".to_string()));
        }

        let mut seen = HashSet::new();
        for field in &form.fields {
            if field.selector.trim().is_empty() {
                return Err(invalid("form field with an empty selector".to_string()));
            }
            if !seen.insert(field.selector.as_str()) {
                return Err(invalid(format!("duplicate field selector {}", field.selector)));
            }
        }

        if self.expect.retrieved_text.is_some() && form.result_selector.is_none() {
            return Err(invalid("expect.retrieved_text needs form.result_selector".to_string()));
        }

        if let Some(ProjectSource::Scaffold(scaffold)) = &self.project {
            if scaffold.program.trim().is_empty() {
                return Err(invalid("project.scaffold.program is empty".to_string()));
            }
        }

        Ok(())
    }
}

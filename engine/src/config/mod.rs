//! Suite, test, and routine configuration loaded from YAML.
//!
//! The loader keeps both the typed view and the raw value tree: the typed
//! structs drive scheduling and isolation, while the raw tree backs
//! `${config.…}` interpolation for keys the schema does not model.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// `suite:` section of config.yaml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SuiteSection {
    #[serde(default)]
    pub name: String,
    /// Execution mode: "docker" or "standalone"
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "standalone".to_string()
}

/// `packages:` section — where handlers find SDK/CLI packages
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackagesSection {
    /// "local", "published", or "auto"
    #[serde(default = "default_packages_mode")]
    pub mode: String,
    #[serde(default)]
    pub cli_version: Option<String>,
    #[serde(default)]
    pub sdk_python_version: Option<String>,
    #[serde(default)]
    pub sdk_typescript_version: Option<String>,
    #[serde(default)]
    pub local: LocalPackages,
}

fn default_packages_mode() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalPackages {
    #[serde(default)]
    pub wheels_dir: Option<String>,
    #[serde(default)]
    pub packages_dir: Option<String>,
}

/// `docker:` section — container isolation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default)]
    pub network: Option<String>,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            network: None,
        }
    }
}

fn default_base_image() -> String {
    "python:3.11-slim".to_string()
}

/// `execution:` section — scheduling knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-test timeout in seconds
    #[serde(default = "default_test_timeout")]
    pub timeout: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout: default_test_timeout(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_test_timeout() -> u64 {
    600
}

/// `defaults:` section — per-step fallbacks.
///
/// `parallel` is deprecated: the scheduler reads only
/// `execution.max_workers`. The field is still parsed so older suites load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefaultsSection {
    /// Per-step timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub parallel: Option<usize>,
    #[serde(default)]
    pub retry: Option<u32>,
}

/// `reports:` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportsSection {
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub keep_last: Option<u32>,
}

/// Parsed suite configuration (config.yaml) with the raw tree retained
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub suite: SuiteSection,
    pub packages: PackagesSection,
    pub docker: DockerSection,
    pub execution: ExecutionSection,
    pub defaults: DefaultsSection,
    pub reports: ReportsSection,
    pub aliases: BTreeMap<String, String>,
    /// Raw config tree for `${config.…}` interpolation
    raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SuiteConfigYaml {
    #[serde(default)]
    suite: SuiteSection,
    #[serde(default)]
    packages: PackagesSection,
    #[serde(default)]
    docker: DockerSection,
    #[serde(default)]
    execution: ExecutionSection,
    #[serde(default)]
    defaults: DefaultsSection,
    #[serde(default)]
    reports: ReportsSection,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self::from_parts(SuiteConfigYaml::default(), Value::Null)
    }
}

impl SuiteConfig {
    /// Load `config.yaml` from a suite directory.
    pub fn load(suite_path: &Path) -> ConfigResult<Self> {
        let path = suite_path.join("config.yaml");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, &path)
    }

    /// Parse config.yaml text.
    pub fn parse(text: &str, path: &Path) -> ConfigResult<Self> {
        let typed: SuiteConfigYaml =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        let raw: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_parts(typed, yaml_to_json(raw)))
    }

    fn from_parts(typed: SuiteConfigYaml, raw: Value) -> Self {
        Self {
            suite: typed.suite,
            packages: typed.packages,
            docker: typed.docker,
            execution: typed.execution,
            defaults: typed.defaults,
            reports: typed.reports,
            aliases: typed.aliases,
            raw,
        }
    }

    /// Raw config tree for interpolation (`config.a.b` dot-paths).
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// True when the suite runs tests in ephemeral containers.
    pub fn is_docker(&self) -> bool {
        self.suite.mode == "docker"
    }
}

/// One step of a test or routine.
///
/// Either a handler call (`handler:` plus kind-specific fields) or a routine
/// call (`routine:` plus `params:`). Kind-specific fields stay in `fields`
/// so each handler can deserialize its own argument shape after
/// interpolation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,

    /// Routine call arguments, interpolated at call time
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, Value>,

    /// Store this step's result under the given name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Per-step timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub ignore_errors: bool,

    /// Handler-specific fields (command, url, dest, …)
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Discriminated view of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind<'a> {
    Handler(&'a str),
    Routine(&'a str),
}

impl StepSpec {
    /// Classify the step; `None` when neither `handler` nor `routine` is set.
    pub fn kind(&self) -> Option<StepKind<'_>> {
        if let Some(routine) = self.routine.as_deref() {
            Some(StepKind::Routine(routine))
        } else {
            self.handler.as_deref().map(StepKind::Handler)
        }
    }

    /// Human-readable label for logs and step records.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.kind() {
            Some(StepKind::Handler(h)) => h.to_string(),
            Some(StepKind::Routine(r)) => format!("routine {r}"),
            None => "step".to_string(),
        }
    }

    /// The full step as a JSON map, for interpolation before dispatch.
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let mut map = self.fields.clone();
        if let Some(name) = &self.name {
            map.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(workdir) = &self.workdir {
            map.insert("workdir".into(), Value::String(workdir.clone()));
        }
        if let Some(timeout) = self.timeout {
            map.insert("timeout".into(), Value::Number(timeout.into()));
        }
        map
    }
}

/// One assertion, evaluated after the test phase
#[derive(Debug, Clone, Serialize)]
pub struct AssertionSpec {
    pub expression: String,
    pub message: Option<String>,
}

// Assertions may be written as bare strings or `{expression, message}` maps.
impl<'de> Deserialize<'de> for AssertionSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bare(String),
            Full {
                expression: String,
                #[serde(default)]
                message: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Bare(expression) => AssertionSpec {
                expression,
                message: None,
            },
            Repr::Full {
                expression,
                message,
            } => AssertionSpec {
                expression,
                message,
            },
        })
    }
}

/// Parsed test.yaml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Per-test timeout in seconds (overrides `execution.timeout`)
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub pre_run: Vec<StepSpec>,
    #[serde(default)]
    pub test: Vec<StepSpec>,
    #[serde(default)]
    pub post_run: Vec<StepSpec>,
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
}

impl TestSpec {
    /// Load a test.yaml file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Steps of one phase, in file order.
    pub fn phase_steps(&self, phase: Phase) -> &[StepSpec] {
        match phase {
            Phase::PreRun => &self.pre_run,
            Phase::Test => &self.test,
            Phase::PostRun => &self.post_run,
        }
    }
}

/// Ordered test phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreRun,
    Test,
    PostRun,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::PreRun, Phase::Test, Phase::PostRun];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreRun => "pre_run",
            Phase::Test => "test",
            Phase::PostRun => "post_run",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, parameterized sequence of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// Routine library parsed from a routines.yaml file
#[derive(Debug, Clone, Default)]
pub struct RoutineFile {
    pub routines: BTreeMap<String, Routine>,
}

#[derive(Debug, Deserialize)]
struct RoutineFileYaml {
    #[serde(default)]
    routines: BTreeMap<String, Routine>,
}

impl RoutineFile {
    /// Load a routines.yaml file. A missing file is an empty library.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let parsed: RoutineFileYaml =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            routines: parsed.routines,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Routine> {
        self.routines.get(name)
    }
}

/// Convert a YAML value to a JSON value, stringifying non-string keys.
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Number(u.into())
            } else {
                serde_json::Number::from_f64(n.as_f64().unwrap_or(0.0))
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(seq) => {
            Value::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                out.insert(key, yaml_to_json(v));
            }
            Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::coverage::CoverageFormat;
use crate::hook::HookVariant;

pub const PROJECT_CONFIG_FILE: &str = ".motive.project.yml";
pub const DEFAULT_CATALOG: &str = ".motive/catalog.json";
pub const DEFAULT_INDEX: &str = ".motive/index.json";
pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSpec {
    pub format: CoverageFormat,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    pub variant: HookVariant,
    pub timeout_ms: u64,
    pub exclude: Vec<String>,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            variant: HookVariant::Standard,
            timeout_ms: DEFAULT_HOOK_TIMEOUT_MS,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub catalog: String,
    pub index: String,
    pub coverage: Option<CoverageSpec>,
    pub results: Option<String>,
    pub test_command: Option<String>,
    pub test_timeout_secs: u64,
    pub hook: HookConfig,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            catalog: DEFAULT_CATALOG.to_string(),
            index: DEFAULT_INDEX.to_string(),
            coverage: None,
            results: None,
            test_command: None,
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            hook: HookConfig::default(),
        }
    }
}

impl EffectiveConfig {
    /// Resolves a configured path against the workspace root, expanding `~`.
    pub fn resolve(&self, raw: &str, root: &Path, home: &Path) -> PathBuf {
        let expanded = expand_tilde(raw.trim(), home);
        if expanded.is_absolute() {
            expanded
        } else {
            root.join(expanded)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    catalog: Option<String>,
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    coverage: Option<RawCoverage>,
    #[serde(default)]
    results: Option<String>,
    #[serde(default)]
    test_command: Option<String>,
    #[serde(default)]
    test_timeout_secs: Option<u64>,
    #[serde(default)]
    hook: Option<RawHook>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCoverage {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHook {
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    exclude: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// One parsed file; `None` fields defer to earlier layers.
#[derive(Debug, Default)]
struct ConfigLayer {
    catalog: Option<String>,
    index: Option<String>,
    coverage_format: Option<CoverageFormat>,
    coverage_path: Option<String>,
    results: Option<String>,
    test_command: Option<String>,
    test_timeout_secs: Option<u64>,
    hook_variant: Option<HookVariant>,
    hook_timeout_ms: Option<u64>,
    hook_exclude: Option<Vec<String>>,
}

/// Merges user, nearest project and workspace config, later layers winning
/// per field.
pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut layers = Vec::new();
    if let Some(path) = user_config.filter(|path| path.exists()) {
        layers.push(load_config_layer(path)?);
    }
    if let Some(path) = find_nearest_project_config(cwd) {
        layers.push(load_config_layer(&path)?);
    }
    if let Some(path) = repo_config.filter(|path| path.exists()) {
        layers.push(load_config_layer(path)?);
    }
    Ok(merge_layers(layers))
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn merge_layers(layers: Vec<ConfigLayer>) -> EffectiveConfig {
    let mut merged = ConfigLayer::default();
    for layer in layers {
        merged.catalog = layer.catalog.or(merged.catalog);
        merged.index = layer.index.or(merged.index);
        merged.coverage_format = layer.coverage_format.or(merged.coverage_format);
        merged.coverage_path = layer.coverage_path.or(merged.coverage_path);
        merged.results = layer.results.or(merged.results);
        merged.test_command = layer.test_command.or(merged.test_command);
        merged.test_timeout_secs = layer.test_timeout_secs.or(merged.test_timeout_secs);
        merged.hook_variant = layer.hook_variant.or(merged.hook_variant);
        merged.hook_timeout_ms = layer.hook_timeout_ms.or(merged.hook_timeout_ms);
        merged.hook_exclude = layer.hook_exclude.or(merged.hook_exclude);
    }

    let coverage = match (merged.coverage_format, merged.coverage_path) {
        (None, None) => None,
        (format, path) => {
            let format = format.unwrap_or(CoverageFormat::Cobertura);
            let path = path.unwrap_or_else(|| default_report_path(format).to_string());
            Some(CoverageSpec { format, path })
        }
    };

    let defaults = EffectiveConfig::default();
    EffectiveConfig {
        catalog: merged.catalog.unwrap_or(defaults.catalog),
        index: merged.index.unwrap_or(defaults.index),
        coverage,
        results: merged.results,
        test_command: merged.test_command,
        test_timeout_secs: merged
            .test_timeout_secs
            .unwrap_or(defaults.test_timeout_secs),
        hook: HookConfig {
            variant: merged.hook_variant.unwrap_or(defaults.hook.variant),
            timeout_ms: merged.hook_timeout_ms.unwrap_or(defaults.hook.timeout_ms),
            exclude: merged.hook_exclude.unwrap_or_default(),
        },
    }
}

fn default_report_path(format: CoverageFormat) -> &'static str {
    match format {
        CoverageFormat::Junit => "junit.xml",
        CoverageFormat::Cobertura => "coverage.xml",
        CoverageFormat::CoverageJson => "coverage.json",
    }
}

fn load_config_layer(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_layer(&content).map_err(|err| match err {
        LayerError::Yaml(source) => ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        },
        LayerError::Invalid(err) => err,
    })
}

enum LayerError {
    Yaml(serde_yaml::Error),
    Invalid(ConfigError),
}

fn parse_config_layer(content: &str) -> Result<ConfigLayer, LayerError> {
    if content.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    let raw: RawConfig = serde_yaml::from_str(content).map_err(LayerError::Yaml)?;
    let coverage = raw.coverage.unwrap_or_default();
    let hook = raw.hook.unwrap_or_default();

    let coverage_format = coverage
        .format
        .map(|raw| raw.parse::<CoverageFormat>())
        .transpose()
        .map_err(|message| invalid("coverage.format", message))?;
    let hook_variant = hook
        .variant
        .map(|raw| raw.parse::<HookVariant>())
        .transpose()
        .map_err(|message| invalid("hook.variant", message))?;
    if raw.test_timeout_secs == Some(0) {
        return Err(invalid("test_timeout_secs", "must be greater than zero"));
    }
    if hook.timeout_ms == Some(0) {
        return Err(invalid("hook.timeout_ms", "must be greater than zero"));
    }

    Ok(ConfigLayer {
        catalog: non_empty(raw.catalog),
        index: non_empty(raw.index),
        coverage_format,
        coverage_path: non_empty(coverage.path),
        results: non_empty(raw.results),
        test_command: non_empty(raw.test_command),
        test_timeout_secs: raw.test_timeout_secs,
        hook_variant,
        hook_timeout_ms: hook.timeout_ms,
        hook_exclude: hook.exclude,
    })
}

fn invalid(field: &'static str, message: impl Into<String>) -> LayerError {
    LayerError::Invalid(ConfigError::InvalidValue {
        field,
        message: message.into(),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn default_repo_config_yaml() -> String {
    r#"catalog: .motive/catalog.json
index: .motive/index.json
coverage:
  format: cobertura
  path: coverage.xml
results: junit.xml
test_command: "pytest --junitxml=junit.xml --cov --cov-report=xml"
test_timeout_secs: 600
hook:
  variant: standard
  timeout_ms: 3000
  exclude: []
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

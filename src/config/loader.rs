/// Engine configuration loading from JSON
use crate::config::types::{CodeboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "CODEBOX_CONFIG";
pub const WORKSPACE_ROOT_ENV: &str = "CODEBOX_WORKSPACE_ROOT";
pub const MAX_CONCURRENT_ENV: &str = "CODEBOX_MAX_CONCURRENT";
pub const DEFAULT_CONFIG_FILE: &str = "codebox.json";

/// What happens to a request that arrives while the ceiling is reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait in FIFO order for a slot
    Queue,
    /// Fail immediately with an engine fault
    Reject,
}

/// Limits applied to the process sandbox
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_source_chars: usize,
    pub compile_timeout_ms: u64,
    pub run_timeout_ms: u64,
    /// Combined stdout+stderr ceiling per stage, also applied to script sessions
    pub output_limit_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_source_chars: 20_000,
            compile_timeout_ms: 10_000,
            run_timeout_ms: 5_000,
            output_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

impl LimitsConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// A WASI interpreter module used by the script sandbox
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptRuntimeConfig {
    /// Path to the `.wasm` interpreter
    pub module: PathBuf,
    /// Guest argv; `{script}` expands to the guest path of the host document
    pub argv: Vec<String>,
    /// Extra read-only preopens `(host_dir, guest_dir)`, e.g. a stdlib tree
    #[serde(default)]
    pub lib_dirs: Vec<(PathBuf, String)>,
}

/// Script sandbox configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub javascript: Option<ScriptRuntimeConfig>,
    pub python: Option<ScriptRuntimeConfig>,
    /// Hard wall-clock cap for a session; `None` means stop-only
    pub session_timeout_ms: Option<u64>,
}

/// Top-level engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root under which per-request workspaces are created
    pub workspace_root: PathBuf,
    pub max_concurrent: usize,
    pub admission: AdmissionPolicy,
    pub limits: LimitsConfig,
    pub script: ScriptConfig,
}

impl EngineConfig {
    /// Workspace root scoped by effective UID so different users never share it.
    pub fn default_workspace_root() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("codebox-uid-{}", euid))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CodeboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            CodeboxError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Resolve configuration: explicit path, then `$CODEBOX_CONFIG`, then
    /// `./codebox.json` when present, then defaults. Environment overrides
    /// are applied last and the result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::load_from_file(path)?
        } else if let Ok(path) = std::env::var(CONFIG_ENV) {
            Self::load_from_file(path)?
        } else {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            if local.is_file() {
                log::info!("Loading configuration from {}", local.display());
                Self::load_from_file(local)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var(WORKSPACE_ROOT_ENV) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Ok(raw) = std::env::var(MAX_CONCURRENT_ENV) {
            self.max_concurrent = raw.trim().parse().map_err(|_| {
                CodeboxError::Config(format!("{MAX_CONCURRENT_ENV} must be a positive integer, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    /// Reject configurations the executor cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CodeboxError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.limits.max_source_chars == 0 {
            return Err(CodeboxError::Config(
                "limits.max_source_chars must be positive".to_string(),
            ));
        }
        if self.limits.output_limit_bytes == 0 {
            return Err(CodeboxError::Config(
                "limits.output_limit_bytes must be positive".to_string(),
            ));
        }
        if self.limits.run_timeout_ms == 0 {
            return Err(CodeboxError::Config(
                "limits.run_timeout_ms must be positive".to_string(),
            ));
        }
        if self.limits.run_timeout_ms >= self.limits.compile_timeout_ms {
            return Err(CodeboxError::Config(format!(
                "run timeout ({} ms) must be shorter than compile timeout ({} ms)",
                self.limits.run_timeout_ms, self.limits.compile_timeout_ms
            )));
        }
        for (name, runtime) in [
            ("javascript", &self.script.javascript),
            ("python", &self.script.python),
        ] {
            if let Some(runtime) = runtime {
                if runtime.argv.is_empty() {
                    return Err(CodeboxError::Config(format!(
                        "script.{name}.argv must contain at least the program name"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::default_workspace_root(),
            max_concurrent: 4,
            admission: AdmissionPolicy::Queue,
            limits: LimitsConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_source_chars, 20_000);
        assert_eq!(config.limits.compile_timeout(), Duration::from_secs(10));
        assert_eq!(config.limits.run_timeout(), Duration::from_secs(5));
        assert_eq!(config.limits.output_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.admission, AdmissionPolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn run_timeout_must_be_shorter_than_compile() {
        let mut config = EngineConfig::default();
        config.limits.run_timeout_ms = 10_000;
        assert!(matches!(config.validate(), Err(CodeboxError::Config(_))));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = EngineConfig::default();
        config.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codebox.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent": 2, "admission": "reject", "limits": {"run_timeout_ms": 1000}}"#,
        )
        .unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.admission, AdmissionPolicy::Reject);
        assert_eq!(config.limits.run_timeout_ms, 1000);
        assert_eq!(config.limits.compile_timeout_ms, 10_000);
        assert!(config.script.python.is_none());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::load_from_file(&path),
            Err(CodeboxError::Config(_))
        ));
    }
}

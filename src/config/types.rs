/// Core types shared by the registry, executor, script sandbox and coordinator
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Closed set of languages the engine knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageId {
    C,
    Cpp,
    Java,
    Python,
    Javascript,
}

impl LanguageId {
    pub const ALL: [LanguageId; 5] = [
        LanguageId::C,
        LanguageId::Cpp,
        LanguageId::Java,
        LanguageId::Python,
        LanguageId::Javascript,
    ];

    /// Canonical wire name
    pub fn as_str(self) -> &'static str {
        match self {
            LanguageId::C => "c",
            LanguageId::Cpp => "cpp",
            LanguageId::Java => "java",
            LanguageId::Python => "python",
            LanguageId::Javascript => "javascript",
        }
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LanguageId {
    type Err = CodeboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" => Ok(LanguageId::C),
            "cpp" | "c++" | "cxx" => Ok(LanguageId::Cpp),
            "java" => Ok(LanguageId::Java),
            "python" | "py" | "python3" => Ok(LanguageId::Python),
            "javascript" | "js" | "node" => Ok(LanguageId::Javascript),
            _ => Err(CodeboxError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// Inbound execution request. The language stays a raw string so that the
/// coordinator decides how unknown languages are reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default, alias = "sourceCode")]
    pub code: String,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
        }
    }
}

/// Outcome taxonomy. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Program ran and exited 0
    #[serde(rename = "OK")]
    Ok,
    /// Request rejected before any resource was allocated
    #[serde(rename = "VE")]
    ValidationError,
    /// Compiler rejected the source
    #[serde(rename = "CE")]
    CompileError,
    /// Program exited non-zero or was killed by a signal
    #[serde(rename = "RE")]
    RuntimeError,
    /// A stage exceeded its deadline
    #[serde(rename = "TLE")]
    TimeLimit,
    /// The engine itself could not proceed
    #[serde(rename = "IE")]
    EngineFault,
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Ok
    }
}

/// Pipeline stage that produced a result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => f.write_str("compile"),
            Stage::Run => f.write_str("run"),
        }
    }
}

/// Whether captured output is complete
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIntegrity {
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
}

impl fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
        }
    }
}

impl Default for OutputIntegrity {
    fn default() -> Self {
        OutputIntegrity::Complete
    }
}

/// Exit code reported when a stage is killed for exceeding its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Normalized result of one server-side execution request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub output_integrity: OutputIntegrity,
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    /// Request rejected before dispatch
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(message.into()),
            outcome: Outcome::ValidationError,
            ..Self::default()
        }
    }

    /// Engine could not proceed; partial stdout/stderr may be attached by the caller
    pub fn engine_fault(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(message.into()),
            outcome: Outcome::EngineFault,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

/// Kind of a script-sandbox output event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Log,
    Error,
}

/// One entry of a script session's output buffer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub kind: EventKind,
    pub text: String,
}

impl OutputEvent {
    pub fn log(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Log,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            text: text.into(),
        }
    }
}

/// Error type for codebox operations
#[derive(Error, Debug)]
pub enum CodeboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Script runtime error: {0}")]
    Runtime(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution capacity exhausted ({0} in flight)")]
    Capacity(usize),
}

impl From<nix::errno::Errno> for CodeboxError {
    fn from(err: nix::errno::Errno) -> Self {
        CodeboxError::Process(err.to_string())
    }
}

/// Result type alias for codebox operations
pub type Result<T> = std::result::Result<T, CodeboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases_parse() {
        assert_eq!("C++".parse::<LanguageId>().unwrap(), LanguageId::Cpp);
        assert_eq!(" py ".parse::<LanguageId>().unwrap(), LanguageId::Python);
        assert_eq!("node".parse::<LanguageId>().unwrap(), LanguageId::Javascript);
        assert!(matches!(
            "ruby".parse::<LanguageId>(),
            Err(CodeboxError::UnsupportedLanguage(lang)) if lang == "ruby"
        ));
    }

    #[test]
    fn language_serializes_lowercase() {
        let json = serde_json::to_string(&LanguageId::Javascript).unwrap();
        assert_eq!(json, "\"javascript\"");
    }

    #[test]
    fn result_wire_shape_is_camel_case() {
        let result = ExecutionResult {
            stdout: "hello\n".to_string(),
            stage: Some(Stage::Run),
            ..ExecutionResult::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["stdout"], "hello\n");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["timedOut"], false);
        assert_eq!(value["outcome"], "OK");
        assert_eq!(value["stage"], "run");
        assert_eq!(value["outputIntegrity"], "complete");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn request_accepts_source_code_alias() {
        let req: ExecutionRequest =
            serde_json::from_str(r#"{"language":"c","sourceCode":"int main(){}"}"#).unwrap();
        assert_eq!(req.code, "int main(){}");
    }

    #[test]
    fn validation_result_carries_error() {
        let result = ExecutionResult::validation("Code too long");
        assert_eq!(result.outcome, Outcome::ValidationError);
        assert_eq!(result.error.as_deref(), Some("Code too long"));
        assert!(!result.is_success());
    }
}

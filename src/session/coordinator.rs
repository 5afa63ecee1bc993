/// Front door for both execution paths
use crate::config::loader::EngineConfig;
use crate::config::types::{ExecutionRequest, ExecutionResult, LanguageId, Outcome, Result};
use crate::exec::executor::ProcessSandbox;
use crate::judge::adapter::LanguagePipeline;
use crate::judge::registry;
use crate::safety::workspace::WorkspaceManager;
use crate::script::sandbox::ScriptSandbox;
use crate::script::session::SandboxSession;
use crate::session::admission::AdmissionGate;
use std::time::Instant;

pub const MISSING_INPUT: &str = "Missing language or code";
pub const CODE_TOO_LONG: &str = "Code too long";
pub const UNSUPPORTED_LANGUAGE: &str = "Language not supported by server runner";
pub const CAPACITY_EXHAUSTED: &str = "Execution capacity exhausted";

/// Validates, admits and dispatches requests. `Send + Sync`; share it
/// behind an `Arc` and call `execute` from as many threads as needed.
pub struct Coordinator {
    config: EngineConfig,
    workspaces: WorkspaceManager,
    sandbox: ProcessSandbox,
    scripts: ScriptSandbox,
    gate: AdmissionGate,
}

impl Coordinator {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let scripts = ScriptSandbox::new(&config)?;
        Self::with_script_sandbox(config, scripts)
    }

    /// Coordinator with a caller-provided script sandbox
    pub fn with_script_sandbox(config: EngineConfig, scripts: ScriptSandbox) -> Result<Self> {
        config.validate()?;
        let workspaces = WorkspaceManager::new(config.workspace_root.clone())?;
        let sandbox = ProcessSandbox::new(config.limits.clone());
        let gate = AdmissionGate::new(config.max_concurrent, config.admission);

        log::info!(
            "Coordinator ready: root={}, max_concurrent={}, admission={:?}",
            workspaces.root().display(),
            config.max_concurrent,
            config.admission
        );

        Ok(Self {
            config,
            workspaces,
            sandbox,
            scripts,
            gate,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Requests currently executing
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Check a request without touching the filesystem
    pub fn validate(&self, request: &ExecutionRequest) -> std::result::Result<&'static LanguagePipeline, ExecutionResult> {
        let language = request.language.trim();
        if language.is_empty() || request.code.is_empty() {
            return Err(ExecutionResult::validation(MISSING_INPUT));
        }
        if request.code.chars().count() > self.config.limits.max_source_chars {
            return Err(ExecutionResult::validation(CODE_TOO_LONG));
        }
        language
            .parse::<LanguageId>()
            .map(registry::resolve)
            .map_err(|_| ExecutionResult::validation(UNSUPPORTED_LANGUAGE))
    }

    /// Run one request to completion on the calling thread
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();

        let pipeline = match self.validate(request) {
            Ok(pipeline) => pipeline,
            Err(rejected) => {
                log::debug!("Rejected request: {}", rejected.error.as_deref().unwrap_or(""));
                return rejected;
            }
        };

        let _permit = match self.gate.admit() {
            Ok(permit) => permit,
            Err(e) => {
                log::error!("{}", e);
                return ExecutionResult::engine_fault(CAPACITY_EXHAUSTED);
            }
        };

        let workspace = match self.workspaces.acquire() {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to acquire workspace: {}", e);
                return ExecutionResult::engine_fault(e.to_string());
            }
        };

        let mut result = self.sandbox.run(pipeline, &workspace, &request.code);
        let run_id = workspace.run_id().to_string();
        workspace.release();

        match result.outcome {
            Outcome::Ok => log::debug!("[{}] {} finished OK", run_id, pipeline.id),
            Outcome::EngineFault => log::error!(
                "[{}] {} engine fault: {}",
                run_id,
                pipeline.id,
                result.error.as_deref().unwrap_or("unknown")
            ),
            other => log::debug!("[{}] {} finished with {:?}", run_id, pipeline.id, other),
        }

        result.wall_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Run requests concurrently; results come back in input order.
    pub fn execute_batch(&self, requests: &[ExecutionRequest]) -> Vec<ExecutionResult> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = requests
                .iter()
                .map(|request| scope.spawn(move || self.execute(request)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| ExecutionResult::engine_fault("execution thread panicked"))
                })
                .collect()
        })
    }

    /// Start a client-side script session
    pub fn run_in_browser(&self, language: &str, code: &str) -> SandboxSession {
        self.scripts.start(language, code)
    }
}

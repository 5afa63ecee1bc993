/// Compile-then-run execution of one request inside its workspace
use crate::config::loader::LimitsConfig;
use crate::config::types::{ExecutionResult, LanguageId, Outcome, OutputIntegrity, Stage};
use crate::exec::process::{run_stage, StageCommand, StageOutcome};
use crate::judge::adapter::{CommandTemplate, LanguagePipeline};
use crate::judge::languages::java;
use crate::safety::workspace::Workspace;
use std::time::{Duration, Instant};

/// Runs language pipelines as host processes
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    limits: LimitsConfig,
}

impl ProcessSandbox {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Write the source, compile if the pipeline has a compile step, then run.
    ///
    /// Never panics and never returns an error: engine-side failures come
    /// back as `Outcome::EngineFault` with `error` set.
    pub fn run(&self, pipeline: &LanguagePipeline, workspace: &Workspace, source: &str) -> ExecutionResult {
        let started = Instant::now();

        if let Err(e) = workspace.write_file(pipeline.file_name, source.as_bytes()) {
            return finish(ExecutionResult::engine_fault(e.to_string()), started);
        }

        if let Some(compile) = &pipeline.compile {
            let outcome = match self.stage(pipeline, compile, workspace, self.limits.compile_timeout()) {
                Ok(outcome) => outcome,
                Err(result) => return finish(result.with_stage(Stage::Compile), started),
            };

            if outcome.timed_out {
                log::debug!("[{}] compile timed out", workspace.run_id());
                return finish(
                    ExecutionResult {
                        stdout: String::new(),
                        stderr: outcome.stderr,
                        exit_code: outcome.exit_code,
                        timed_out: true,
                        outcome: Outcome::TimeLimit,
                        stage: Some(Stage::Compile),
                        output_integrity: outcome.integrity,
                        ..ExecutionResult::default()
                    },
                    started,
                );
            }

            // Some compilers exit 0 without producing anything useful.
            let missing_artifact = pipeline
                .artifact
                .map(|artifact| !workspace.contains(artifact))
                .unwrap_or(false);

            if outcome.exit_code != 0 || missing_artifact {
                log::debug!(
                    "[{}] compile failed with exit code {}",
                    workspace.run_id(),
                    outcome.exit_code
                );
                let mut diagnostics = outcome.stderr;
                if diagnostics.is_empty() {
                    // javac and friends sometimes report on stdout.
                    diagnostics = outcome.stdout;
                }
                if pipeline.id == LanguageId::Java && !java::declares_entry_class(source) {
                    diagnostics.push_str(&format!(
                        "\nhint: the program must declare `public class {}`\n",
                        java::ENTRY_CLASS
                    ));
                }
                return finish(
                    ExecutionResult {
                        stdout: String::new(),
                        stderr: diagnostics,
                        exit_code: if outcome.exit_code == 0 { 1 } else { outcome.exit_code },
                        timed_out: false,
                        outcome: Outcome::CompileError,
                        stage: Some(Stage::Compile),
                        output_integrity: outcome.integrity,
                        ..ExecutionResult::default()
                    },
                    started,
                );
            }
        }

        let outcome = match self.stage(pipeline, &pipeline.run, workspace, self.limits.run_timeout()) {
            Ok(outcome) => outcome,
            Err(result) => return finish(result.with_stage(Stage::Run), started),
        };

        let classified = classify_run(&outcome);
        if classified != Outcome::Ok {
            log::debug!(
                "[{}] run finished with {:?} (exit code {})",
                workspace.run_id(),
                classified,
                outcome.exit_code
            );
        }

        finish(
            ExecutionResult {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                error: None,
                outcome: classified,
                stage: Some(Stage::Run),
                output_integrity: outcome.integrity,
                wall_time_ms: 0,
            },
            started,
        )
    }

    fn stage(
        &self,
        pipeline: &LanguagePipeline,
        template: &CommandTemplate,
        workspace: &Workspace,
        timeout: Duration,
    ) -> std::result::Result<StageOutcome, ExecutionResult> {
        let cmd = StageCommand {
            argv: template.expand(pipeline, workspace.path()),
            workdir: workspace.path(),
            environment: pipeline.environment,
            timeout,
            output_limit: self.limits.output_limit_bytes,
        };
        log::debug!("[{}] {}", workspace.run_id(), template.display(pipeline));

        run_stage(&cmd).map_err(|e| {
            log::error!("[{}] {}", workspace.run_id(), e);
            ExecutionResult::engine_fault(e.to_string())
        })
    }
}

/// Classify a finished run stage
pub fn classify_run(outcome: &StageOutcome) -> Outcome {
    if outcome.timed_out {
        Outcome::TimeLimit
    } else if outcome.exit_code != 0 {
        Outcome::RuntimeError
    } else if outcome.integrity == OutputIntegrity::TruncatedByLimit {
        // Exited cleanly before the kill landed; still not a full answer.
        Outcome::RuntimeError
    } else {
        Outcome::Ok
    }
}

impl ExecutionResult {
    fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}

fn finish(mut result: ExecutionResult, started: Instant) -> ExecutionResult {
    result.wall_time_ms = started.elapsed().as_millis() as u64;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::adapter::CommandTemplate;
    use crate::safety::workspace::WorkspaceManager;

    const SH_OK: LanguagePipeline = LanguagePipeline {
        id: LanguageId::Python,
        file_name: "prog.sh",
        artifact: None,
        compile: None,
        run: CommandTemplate::new("sh", &["{source}"]),
        environment: &[],
    };

    const SH_COMPILED: LanguagePipeline = LanguagePipeline {
        id: LanguageId::C,
        file_name: "prog.sh",
        artifact: Some("built"),
        compile: Some(CommandTemplate::new("sh", &["-c", "sh {source} > {artifact}"])),
        run: CommandTemplate::new("cat", &["{artifact}"]),
        environment: &[],
    };

    fn setup() -> (tempfile::TempDir, WorkspaceManager) {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf()).unwrap();
        (root, manager)
    }

    fn sandbox(run_timeout_ms: u64) -> ProcessSandbox {
        ProcessSandbox::new(LimitsConfig {
            run_timeout_ms,
            compile_timeout_ms: run_timeout_ms * 2,
            ..LimitsConfig::default()
        })
    }

    #[test]
    fn interpreted_success() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&SH_OK, &ws, "echo hello");
        assert_eq!(result.outcome, Outcome::Ok);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stage, Some(Stage::Run));
        assert!(result.error.is_none());
    }

    #[test]
    fn runtime_error_keeps_output() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&SH_OK, &ws, "echo partial; echo boom >&2; exit 2");
        assert_eq!(result.outcome, Outcome::RuntimeError);
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.stderr, "boom\n");
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn compile_failure_skips_run() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&SH_COMPILED, &ws, "echo 'syntax error' >&2; exit 1");
        assert_eq!(result.outcome, Outcome::CompileError);
        assert_eq!(result.stage, Some(Stage::Compile));
        assert_eq!(result.stdout, "");
        assert!(result.stderr.contains("syntax error"));
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn java_compile_error_hints_at_entry_class() {
        const FAKE_JAVAC: LanguagePipeline = LanguagePipeline {
            id: LanguageId::Java,
            file_name: "Main.java",
            artifact: Some("Main.class"),
            compile: Some(CommandTemplate::new("sh", &["-c", "echo 'class Foo is public' >&2; exit 1"])),
            run: CommandTemplate::new("true", &[]),
            environment: &[],
        };
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&FAKE_JAVAC, &ws, "public class Foo {}");
        assert_eq!(result.outcome, Outcome::CompileError);
        assert!(result.stderr.contains("public class Main"));
    }

    #[test]
    fn compiled_pipeline_runs_artifact() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&SH_COMPILED, &ws, "echo built-output");
        assert_eq!(result.outcome, Outcome::Ok);
        assert_eq!(result.stdout, "built-output\n");
    }

    #[test]
    fn run_timeout_is_tle() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(300).run(&SH_OK, &ws, "while :; do :; done");
        assert_eq!(result.outcome, Outcome::TimeLimit);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, crate::config::types::TIMEOUT_EXIT_CODE);
        assert_eq!(result.stage, Some(Stage::Run));
    }

    #[test]
    fn missing_interpreter_is_engine_fault() {
        const MISSING: LanguagePipeline = LanguagePipeline {
            id: LanguageId::Python,
            file_name: "prog.txt",
            artifact: None,
            compile: None,
            run: CommandTemplate::new("no-such-interpreter-xyz", &["{source}"]),
            environment: &[],
        };
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let result = sandbox(5_000).run(&MISSING, &ws, "anything");
        assert_eq!(result.outcome, Outcome::EngineFault);
        assert!(result.error.as_deref().unwrap().contains("no-such-interpreter-xyz"));
    }

    #[test]
    fn output_ceiling_is_enforced() {
        let (_root, manager) = setup();
        let ws = manager.acquire().unwrap();
        let sandbox = ProcessSandbox::new(LimitsConfig {
            output_limit_bytes: 1024,
            ..LimitsConfig::default()
        });
        let result = sandbox.run(&SH_OK, &ws, "yes");
        assert_eq!(result.output_integrity, OutputIntegrity::TruncatedByLimit);
        assert_eq!(result.outcome, Outcome::RuntimeError);
        assert!(result.stdout.ends_with("[output truncated after 1024 bytes]\n"));
    }
}

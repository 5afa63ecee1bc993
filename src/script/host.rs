/// Script hosts: the seam between session bookkeeping and the engine
use crate::config::loader::{ScriptConfig, ScriptRuntimeConfig};
use crate::config::types::{LanguageId, OutputEvent};
use crate::safety::workspace::WorkspaceManager;
use crate::script::javascript;
use crate::script::python;
use crate::script::runtime::{GuestExit, GuestSpec, GuestStream, PipeForwarder, WasmRuntime};
use crate::script::session::{CancelToken, EventSink};
use std::time::Instant;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;

/// Guest directory the session document is mounted at
pub const GUEST_DIR: &str = "/sandbox";
/// Placeholder in a runtime's argv for the document's guest path
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

const PIPE_SLACK: usize = 64 * 1024;

/// One script to run
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub session_id: String,
    pub language: LanguageId,
    pub code: String,
    pub deadline: Option<Instant>,
}

/// Runs scripts on behalf of sessions.
///
/// `run` is called on the session's worker thread and returns when the
/// script is done, cancelled or out of time. Everything the user should see
/// goes through `sink`.
pub trait ScriptHost: Send + Sync {
    fn supports(&self, language: LanguageId) -> bool;

    fn run(&self, job: &ScriptJob, sink: &EventSink, cancel: &CancelToken);
}

/// Runs JavaScript and Python through WASI interpreter modules
pub struct WasiScriptHost {
    config: ScriptConfig,
    workspaces: WorkspaceManager,
    output_limit: usize,
}

impl WasiScriptHost {
    pub fn new(config: ScriptConfig, workspaces: WorkspaceManager, output_limit: usize) -> Self {
        Self {
            config,
            workspaces,
            output_limit,
        }
    }

    fn runtime_config(&self, language: LanguageId) -> Option<&ScriptRuntimeConfig> {
        match language {
            LanguageId::Javascript => self.config.javascript.as_ref(),
            LanguageId::Python => self.config.python.as_ref(),
            _ => None,
        }
    }

    fn execute(&self, job: &ScriptJob, sink: &EventSink, cancel: &CancelToken) -> Result<(), String> {
        let runtime_config = self
            .runtime_config(job.language)
            .ok_or_else(|| format!("runtime unavailable: no {} interpreter configured", job.language))?;

        let runtime = WasmRuntime::shared().map_err(|e| e.to_string())?;
        let module = runtime.module(&runtime_config.module).map_err(|e| {
            log::warn!("[{}] {}", job.session_id, e);
            e.to_string()
        })?;

        let (document_name, document) = match job.language {
            LanguageId::Javascript => (javascript::DOCUMENT_NAME, javascript::host_document(&job.code)),
            LanguageId::Python => (python::DOCUMENT_NAME, python::wrapper_document(&job.code)),
            other => return Err(unsupported_message(other.as_str())),
        };

        let workspace = self.workspaces.acquire().map_err(|e| e.to_string())?;
        workspace
            .write_file(document_name, document.as_bytes())
            .map_err(|e| e.to_string())?;

        let guest_path = format!("{GUEST_DIR}/{document_name}");
        let argv = runtime_config
            .argv
            .iter()
            .map(|arg| arg.replace(SCRIPT_PLACEHOLDER, &guest_path))
            .collect();
        let mut preopens = vec![(workspace.path().to_path_buf(), GUEST_DIR.to_string())];
        preopens.extend(runtime_config.lib_dirs.iter().cloned());

        let stdout = MemoryOutputPipe::new(self.output_limit + PIPE_SLACK);
        let stderr = MemoryOutputPipe::new(self.output_limit + PIPE_SLACK);

        let forwarder = match job.language {
            LanguageId::Javascript => {
                let sink = sink.clone();
                let cancel = cancel.clone();
                Some(PipeForwarder::spawn(stdout.clone(), stderr.clone(), move |stream, line| {
                    let event = match stream {
                        GuestStream::Stdout => javascript::parse_stdout_line(&line),
                        GuestStream::Stderr => OutputEvent::error(line),
                    };
                    if sink.post(event) {
                        true
                    } else {
                        // Ceiling hit or session gone: stop the guest too.
                        cancel.cancel();
                        false
                    }
                }))
            }
            _ => None,
        };

        log::debug!("[{}] starting {} guest", job.session_id, job.language);
        let exit = runtime.run(GuestSpec {
            module: &module,
            argv,
            preopens,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            cancel: cancel.clone(),
            deadline: job.deadline,
        });

        match forwarder {
            Some(forwarder) => forwarder.finish(),
            None => {
                if !cancel.is_cancelled() {
                    for event in python::events_from_output(&stdout.contents(), &stderr.contents()) {
                        if !sink.post(event) {
                            break;
                        }
                    }
                }
            }
        }

        match exit.map_err(|e| e.to_string())? {
            GuestExit::Exited(code) => {
                log::debug!("[{}] guest exited with {}", job.session_id, code);
                Ok(())
            }
            GuestExit::Cancelled => {
                log::debug!("[{}] guest cancelled", job.session_id);
                Ok(())
            }
            GuestExit::TimedOut => Err("Execution timed out".to_string()),
            GuestExit::Trapped(message) => Err(message),
        }
    }
}

impl ScriptHost for WasiScriptHost {
    fn supports(&self, language: LanguageId) -> bool {
        matches!(language, LanguageId::Javascript | LanguageId::Python)
    }

    fn run(&self, job: &ScriptJob, sink: &EventSink, cancel: &CancelToken) {
        if let Err(message) = self.execute(job, sink, cancel) {
            sink.post(OutputEvent::error(message));
        }
    }
}

/// Error text for a language the script sandbox does not run
pub fn unsupported_message(language: &str) -> String {
    format!("Run not supported for {} in the script sandbox", language)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn host(config: ScriptConfig) -> (tempfile::TempDir, WasiScriptHost) {
        let root = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(root.path().to_path_buf()).unwrap();
        (root, WasiScriptHost::new(config, workspaces, 1024))
    }

    fn job(language: LanguageId) -> ScriptJob {
        ScriptJob {
            session_id: "t".to_string(),
            language,
            code: "1".to_string(),
            deadline: None,
        }
    }

    #[test]
    fn only_script_languages_supported() {
        let (_root, host) = host(ScriptConfig::default());
        assert!(host.supports(LanguageId::Javascript));
        assert!(host.supports(LanguageId::Python));
        assert!(!host.supports(LanguageId::Java));
    }

    #[test]
    fn unconfigured_runtime_reports_single_error() {
        let (_root, host) = host(ScriptConfig::default());
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, 1024);
        host.run(&job(LanguageId::Python), &sink, &CancelToken::new());
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].text.starts_with("runtime unavailable"));
    }

    #[test]
    fn missing_module_reports_single_error_and_leaves_no_workspace() {
        let (root, host) = host(ScriptConfig {
            javascript: Some(ScriptRuntimeConfig {
                module: root_missing(),
                argv: vec!["qjs".to_string(), SCRIPT_PLACEHOLDER.to_string()],
                lib_dirs: Vec::new(),
            }),
            ..ScriptConfig::default()
        });
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, 1024);
        host.run(&job(LanguageId::Javascript), &sink, &CancelToken::new());
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].text.contains("runtime unavailable"));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    fn root_missing() -> std::path::PathBuf {
        std::path::PathBuf::from("/nonexistent/codebox/qjs.wasm")
    }
}

/// Starts client script sessions on worker threads
use crate::config::loader::EngineConfig;
use crate::config::types::{LanguageId, OutputEvent, Result};
use crate::safety::workspace::{WorkspaceManager, SESSION_DIR_PREFIX};
use crate::script::host::{unsupported_message, ScriptHost, ScriptJob, WasiScriptHost};
use crate::script::session::{CancelToken, EventSink, SandboxSession};
use crossbeam_channel::unbounded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// In-process sandbox for JavaScript and Python snippets
#[derive(Clone)]
pub struct ScriptSandbox {
    host: Arc<dyn ScriptHost>,
    output_limit: usize,
    session_timeout: Option<Duration>,
}

impl ScriptSandbox {
    /// Sandbox backed by WASI interpreter modules from `config.script`
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let workspaces = WorkspaceManager::with_prefix(config.workspace_root.clone(), SESSION_DIR_PREFIX)?;
        let host = WasiScriptHost::new(
            config.script.clone(),
            workspaces,
            config.limits.output_limit_bytes,
        );
        Ok(Self::with_host(
            Arc::new(host),
            config.limits.output_limit_bytes,
            config.script.session_timeout_ms.map(Duration::from_millis),
        ))
    }

    pub fn with_host(
        host: Arc<dyn ScriptHost>,
        output_limit: usize,
        session_timeout: Option<Duration>,
    ) -> Self {
        Self {
            host,
            output_limit,
            session_timeout,
        }
    }

    /// Start running `code`. Unsupported languages produce a finished
    /// session holding a single error event; no thread is started.
    pub fn start(&self, language: &str, code: &str) -> SandboxSession {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        let token = Uuid::new_v4().simple().to_string();
        let id = format!("session-{}-{}", seq, &token[..8]);
        let name = language.trim().to_string();

        let parsed = match name.parse::<LanguageId>() {
            Ok(parsed) if self.host.supports(parsed) => parsed,
            _ => {
                log::debug!("[{}] script sandbox does not run '{}'", id, name);
                let message = unsupported_message(&name);
                return SandboxSession::finished(id, name, vec![OutputEvent::error(message)]);
            }
        };

        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, self.output_limit);
        let cancel = CancelToken::new();
        let job = ScriptJob {
            session_id: id.clone(),
            language: parsed,
            code: code.to_string(),
            deadline: self.session_timeout.map(|timeout| Instant::now() + timeout),
        };

        let host = self.host.clone();
        let worker_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("codebox-{}", id))
            .spawn(move || host.run(&job, &sink, &worker_cancel));

        match spawned {
            Ok(worker) => SandboxSession::running(id, name, rx, cancel, worker),
            Err(e) => {
                log::error!("[{}] failed to start script worker: {}", id, e);
                SandboxSession::finished(
                    id,
                    name,
                    vec![OutputEvent::error(format!("Failed to start script worker: {}", e))],
                )
            }
        }
    }
}

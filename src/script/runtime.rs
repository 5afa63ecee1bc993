/// Shared wasmtime engine for WASI guests
///
/// One engine per process with epoch interruption enabled. A background
/// ticker bumps the epoch every `EPOCH_TICK`; each store re-arms its deadline
/// one tick ahead and its callback decides whether the guest keeps running,
/// so cancellation is observed within a tick.
use crate::config::types::{CodeboxError, Result};
use crate::script::session::CancelToken;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wasmtime::{Config, Engine, Linker, Module, Store, UpdateDeadline};
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit};

pub const EPOCH_TICK: Duration = Duration::from_millis(10);

const FORWARD_INTERVAL: Duration = Duration::from_millis(10);

static SHARED: Mutex<Option<Arc<WasmRuntime>>> = Mutex::new(None);

/// Engine plus a cache of compiled interpreter modules
pub struct WasmRuntime {
    engine: Engine,
    modules: Mutex<HashMap<PathBuf, Module>>,
}

/// How a guest run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// `_start` returned or the guest called `proc_exit`
    Exited(i32),
    Cancelled,
    TimedOut,
    /// Any other trap
    Trapped(String),
}

/// Everything a single guest instance is allowed to see
pub struct GuestSpec<'a> {
    pub module: &'a Module,
    pub argv: Vec<String>,
    /// Read-only `(host_dir, guest_dir)` preopens
    pub preopens: Vec<(PathBuf, String)>,
    pub stdout: MemoryOutputPipe,
    pub stderr: MemoryOutputPipe,
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
}

impl WasmRuntime {
    fn new() -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = Engine::new(&config)
            .map_err(|e| CodeboxError::Runtime(format!("Failed to create wasmtime engine: {e}")))?;

        let ticker = engine.clone();
        thread::Builder::new()
            .name("codebox-epoch".to_string())
            .spawn(move || loop {
                thread::sleep(EPOCH_TICK);
                ticker.increment_epoch();
            })
            .map_err(|e| CodeboxError::Runtime(format!("Failed to start epoch ticker: {e}")))?;

        Ok(Self {
            engine,
            modules: Mutex::new(HashMap::new()),
        })
    }

    /// Process-wide runtime, created on first use. A failed creation is not
    /// remembered.
    pub fn shared() -> Result<Arc<Self>> {
        let mut slot = SHARED
            .lock()
            .map_err(|_| CodeboxError::Runtime("runtime lock poisoned".to_string()))?;
        if let Some(runtime) = slot.as_ref() {
            return Ok(runtime.clone());
        }
        let runtime = Arc::new(Self::new()?);
        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// Compile an interpreter module, or return the cached one. Compilation
    /// happens under the cache lock so concurrent first sessions compile once.
    pub fn module(&self, path: &Path) -> Result<Module> {
        let mut modules = self
            .modules
            .lock()
            .map_err(|_| CodeboxError::Runtime("module cache lock poisoned".to_string()))?;
        if let Some(module) = modules.get(path) {
            return Ok(module.clone());
        }

        if !path.is_file() {
            return Err(CodeboxError::Runtime(format!(
                "runtime unavailable: {} not found",
                path.display()
            )));
        }

        let started = Instant::now();
        let module = Module::from_file(&self.engine, path).map_err(|e| {
            CodeboxError::Runtime(format!("runtime unavailable: {}: {e}", path.display()))
        })?;
        log::info!(
            "Compiled script runtime {} in {} ms",
            path.display(),
            started.elapsed().as_millis()
        );
        modules.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }

    /// Instantiate a fresh store and run `_start` to completion.
    pub fn run(&self, spec: GuestSpec<'_>) -> Result<GuestExit> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&spec.argv)
            .stdout(spec.stdout)
            .stderr(spec.stderr);
        for (host, guest) in &spec.preopens {
            builder
                .preopened_dir(host, guest, DirPerms::READ, FilePerms::READ)
                .map_err(|e| {
                    CodeboxError::Runtime(format!("Failed to preopen {}: {e}", host.display()))
                })?;
        }

        let mut store = Store::new(&self.engine, builder.build_p1());
        store.set_epoch_deadline(1);
        let cancel = spec.cancel.clone();
        let deadline = spec.deadline;
        store.epoch_deadline_callback(move |_| {
            let expired = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
            if cancel.is_cancelled() || expired {
                return Err(anyhow::anyhow!("guest interrupted"));
            }
            Ok(UpdateDeadline::Continue(1))
        });

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            .map_err(|e| CodeboxError::Runtime(format!("Failed to link WASI: {e}")))?;

        let instance = linker
            .instantiate(&mut store, spec.module)
            .map_err(|e| CodeboxError::Runtime(format!("Failed to instantiate module: {e}")))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| CodeboxError::Runtime(format!("No _start entry point: {e}")))?;

        let exit = match start.call(&mut store, ()) {
            Ok(()) => GuestExit::Exited(0),
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    GuestExit::Exited(exit.0)
                } else if spec.cancel.is_cancelled() {
                    GuestExit::Cancelled
                } else if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                    GuestExit::TimedOut
                } else {
                    GuestExit::Trapped(format!("{e:#}"))
                }
            }
        };
        Ok(exit)
    }
}

/// Which guest pipe a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestStream {
    Stdout,
    Stderr,
}

/// Polls guest pipes on a helper thread and hands over complete lines
pub struct PipeForwarder {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PipeForwarder {
    /// `on_line` returns `false` to stop forwarding.
    pub fn spawn<F>(stdout: MemoryOutputPipe, stderr: MemoryOutputPipe, mut on_line: F) -> Self
    where
        F: FnMut(GuestStream, String) -> bool + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = thread::spawn(move || {
            let mut out = LineCursor::default();
            let mut err = LineCursor::default();
            loop {
                // Read the flag first so the last pass sees everything written.
                let finishing = flag.load(Ordering::Acquire);
                let mut open = true;
                for line in out.take_lines(&stdout.contents(), finishing) {
                    if !on_line(GuestStream::Stdout, line) {
                        open = false;
                        break;
                    }
                }
                if open {
                    for line in err.take_lines(&stderr.contents(), finishing) {
                        if !on_line(GuestStream::Stderr, line) {
                            open = false;
                            break;
                        }
                    }
                }
                if finishing || !open {
                    break;
                }
                thread::sleep(FORWARD_INTERVAL);
            }
        });

        Self {
            done,
            handle: Some(handle),
        }
    }

    /// Flush remaining output and stop the helper thread
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tracks how much of a growing buffer has been consumed
#[derive(Debug, Default)]
struct LineCursor {
    offset: usize,
}

impl LineCursor {
    /// Complete lines appended since the last call. With `flush`, a trailing
    /// unterminated line is returned as well.
    fn take_lines(&mut self, buffer: &[u8], flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let fresh = &buffer[self.offset.min(buffer.len())..];
        let mut consumed = 0;
        for (i, byte) in fresh.iter().enumerate() {
            if *byte == b'\n' {
                let line = &fresh[consumed..i];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                lines.push(String::from_utf8_lossy(line).into_owned());
                consumed = i + 1;
            }
        }
        if flush && consumed < fresh.len() {
            lines.push(String::from_utf8_lossy(&fresh[consumed..]).into_owned());
            consumed = fresh.len();
        }
        self.offset += consumed;
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_returns_only_complete_lines() {
        let mut cursor = LineCursor::default();
        assert_eq!(cursor.take_lines(b"one\ntw", false), vec!["one"]);
        assert_eq!(cursor.take_lines(b"one\ntwo\r\nthr", false), vec!["two"]);
        assert!(cursor.take_lines(b"one\ntwo\r\nthr", false).is_empty());
        assert_eq!(cursor.take_lines(b"one\ntwo\r\nthree", true), vec!["three"]);
        assert!(cursor.take_lines(b"one\ntwo\r\nthree", true).is_empty());
    }

    #[test]
    fn forwarder_on_silent_guest_yields_nothing() {
        let stdout = MemoryOutputPipe::new(1024);
        let stderr = MemoryOutputPipe::new(1024);
        let (tx, rx) = crossbeam_channel::unbounded();
        let forwarder = PipeForwarder::spawn(stdout, stderr, move |stream, line| {
            tx.send((stream, line)).is_ok()
        });
        forwarder.finish();
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn missing_module_is_runtime_unavailable() {
        let runtime = WasmRuntime::shared().unwrap();
        let err = runtime.module(Path::new("/nonexistent/interp.wasm")).unwrap_err();
        assert!(err.to_string().contains("runtime unavailable"));
    }

    #[test]
    fn shared_runtime_is_memoized() {
        let a = WasmRuntime::shared().unwrap();
        let b = WasmRuntime::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    const SPIN_WAT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start") (loop br 0)))"#;

    const EXIT_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))"#;

    const RETURN_WAT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")))"#;

    fn compile(wat: &str) -> (tempfile::TempDir, Module) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.wat");
        std::fs::write(&path, wat).unwrap();
        let module = WasmRuntime::shared().unwrap().module(&path).unwrap();
        (dir, module)
    }

    fn guest(module: &Module, cancel: CancelToken, deadline: Option<Instant>) -> GuestSpec<'_> {
        GuestSpec {
            module,
            argv: vec!["guest".to_string()],
            preopens: Vec::new(),
            stdout: MemoryOutputPipe::new(1024),
            stderr: MemoryOutputPipe::new(1024),
            cancel,
            deadline,
        }
    }

    #[test]
    fn cancelled_guest_is_interrupted() {
        let (_dir, module) = compile(SPIN_WAT);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = WasmRuntime::shared().unwrap().run(guest(&module, cancel, None)).unwrap();
        canceller.join().unwrap();
        assert_eq!(exit, GuestExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn guest_past_deadline_times_out() {
        let (_dir, module) = compile(SPIN_WAT);
        let deadline = Instant::now() + Duration::from_millis(100);
        let exit = WasmRuntime::shared()
            .unwrap()
            .run(guest(&module, CancelToken::new(), Some(deadline)))
            .unwrap();
        assert_eq!(exit, GuestExit::TimedOut);
        assert!(Instant::now() < deadline + Duration::from_secs(5));
    }

    #[test]
    fn proc_exit_code_is_reported() {
        let (_dir, module) = compile(EXIT_WAT);
        let exit = WasmRuntime::shared()
            .unwrap()
            .run(guest(&module, CancelToken::new(), None))
            .unwrap();
        assert_eq!(exit, GuestExit::Exited(3));
    }

    #[test]
    fn returning_start_exits_zero() {
        let (_dir, module) = compile(RETURN_WAT);
        let exit = WasmRuntime::shared()
            .unwrap()
            .run(guest(&module, CancelToken::new(), None))
            .unwrap();
        assert_eq!(exit, GuestExit::Exited(0));
    }

    #[test]
    fn modules_are_cached_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.wat");
        std::fs::write(&path, RETURN_WAT).unwrap();
        let runtime = WasmRuntime::shared().unwrap();
        runtime.module(&path).unwrap();

        // A cached module survives its source disappearing.
        std::fs::remove_file(&path).unwrap();
        assert!(runtime.module(&path).is_ok());
    }
}

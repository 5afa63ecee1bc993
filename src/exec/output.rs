/// Bounded output collection
///
/// One reader thread per stream. Both readers draw from a shared byte budget,
/// so the ceiling applies to stdout and stderr combined. Once the budget is
/// spent the reader that crossed it keeps the bytes that fit, marks its stream
/// truncated and stops reading; the stage supervisor sees `exceeded()` and
/// kills the process group.
use crate::config::types::OutputIntegrity;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// How long `finish` waits for readers after the process is gone. A reader
/// only outlives this if a descendant escaped the stage kill while still
/// holding the pipe.
pub const READER_GRACE: Duration = Duration::from_millis(500);

const CHUNK_SIZE: usize = 8192;

/// Marker appended to a stream that hit the ceiling
pub fn truncation_marker(limit: usize) -> String {
    format!("\n[output truncated after {} bytes]\n", limit)
}

/// Combined byte ceiling shared by all readers of one stage
#[derive(Debug)]
pub struct OutputBudget {
    limit: usize,
    used: AtomicUsize,
    exceeded: AtomicBool,
}

impl OutputBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
            exceeded: AtomicBool::new(false),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    /// Reserve up to `wanted` bytes; returns how many may be kept.
    pub fn reserve(&self, wanted: usize) -> usize {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let granted = wanted.min(self.limit.saturating_sub(current));
            match self.used.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    if granted < wanted {
                        self.exceeded.store(true, Ordering::Release);
                    }
                    return granted;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
    finished: bool,
    abandoned: bool,
}

type SharedStream = Arc<Mutex<CapturedStream>>;

fn lock(stream: &SharedStream) -> MutexGuard<'_, CapturedStream> {
    stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Text captured from one stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedOutput {
    pub stdout: String,
    pub stderr: String,
    pub integrity: OutputIntegrity,
}

/// Reader threads for a running child
pub struct OutputCollector {
    budget: Arc<OutputBudget>,
    stdout: Option<SharedStream>,
    stderr: Option<SharedStream>,
    done: Receiver<()>,
}

impl OutputCollector {
    /// Start reading both streams. Either may be absent.
    pub fn spawn<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let budget = OutputBudget::new(limit);
        let (tx, done) = unbounded();

        let stdout = stdout.map(|stream| spawn_reader(stream, budget.clone(), tx.clone()));
        let stderr = stderr.map(|stream| spawn_reader(stream, budget.clone(), tx));

        Self {
            budget,
            stdout,
            stderr,
            done,
        }
    }

    /// Whether the combined ceiling has been crossed
    pub fn exceeded(&self) -> bool {
        self.budget.exceeded()
    }

    /// Wait for the readers and assemble the captured text. Call after the
    /// process group has been reaped.
    ///
    /// A reader still blocked after `READER_GRACE` is abandoned: the bytes it
    /// already read are kept and its stream is marked incomplete.
    pub fn finish(self) -> CollectedOutput {
        let pending = self.stdout.iter().chain(self.stderr.iter()).count();
        let deadline = Instant::now() + READER_GRACE;

        for _ in 0..pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("Output reader did not finish within {:?}; pipe still held open", READER_GRACE);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let limit = self.budget.limit();
        let (stdout, stdout_cut) = drain(self.stdout.as_ref(), limit);
        let (stderr, stderr_cut) = drain(self.stderr.as_ref(), limit);

        CollectedOutput {
            stdout,
            stderr,
            integrity: if stdout_cut || stderr_cut {
                OutputIntegrity::TruncatedByLimit
            } else {
                OutputIntegrity::Complete
            },
        }
    }
}

/// Marker appended to a stream whose writer outlived the stage
pub fn held_open_marker() -> String {
    "\n[output incomplete: stream still open after the process exited]\n".to_string()
}

/// Take what a reader has captured so far. Returns the text and whether it
/// is short of the full stream.
fn drain(stream: Option<&SharedStream>, limit: usize) -> (String, bool) {
    let Some(stream) = stream else {
        return (String::new(), false);
    };
    let mut captured = lock(stream);
    let held_open = !captured.finished;
    captured.abandoned = true;

    let mut text = String::from_utf8_lossy(&std::mem::take(&mut captured.bytes)).into_owned();
    if captured.truncated {
        text.push_str(&truncation_marker(limit));
    } else if held_open {
        text.push_str(&held_open_marker());
    }
    (text, captured.truncated || held_open)
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, budget: Arc<OutputBudget>, done: Sender<()>) -> SharedStream {
    let shared = SharedStream::default();
    let captured = shared.clone();
    thread::spawn(move || {
        collect_stream(stream, &budget, &captured);
        lock(&captured).finished = true;
        let _ = done.send(());
    });
    shared
}

fn collect_stream<R: Read>(mut stream: R, budget: &OutputBudget, captured: &SharedStream) {
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let granted = budget.reserve(n);
                let mut captured = lock(captured);
                if captured.abandoned {
                    break;
                }
                captured.bytes.extend_from_slice(&chunk[..granted]);
                if granted < n {
                    captured.truncated = true;
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Output stream closed with error: {}", e);
                break;
            }
        }
        // The other stream may have spent the budget.
        if budget.exceeded() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn budget_grants_until_limit() {
        let budget = OutputBudget::new(10);
        assert_eq!(budget.reserve(4), 4);
        assert!(!budget.exceeded());
        assert_eq!(budget.reserve(10), 6);
        assert!(budget.exceeded());
        assert_eq!(budget.reserve(1), 0);
    }

    #[test]
    fn small_output_is_complete() {
        let collector = OutputCollector::spawn(
            Some(Cursor::new(b"hello\n".to_vec())),
            Some(Cursor::new(b"warn\n".to_vec())),
            1024,
        );
        let output = collector.finish();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn overflow_is_marked() {
        let collector = OutputCollector::spawn(
            Some(Cursor::new(vec![b'x'; 100])),
            None::<Cursor<Vec<u8>>>,
            16,
        );
        let output = collector.finish();
        assert!(output.stdout.starts_with(&"x".repeat(16)));
        assert!(output.stdout.contains("[output truncated after 16 bytes]"));
        assert_eq!(output.integrity, OutputIntegrity::TruncatedByLimit);
    }

    #[test]
    fn no_streams_yields_empty_output() {
        let collector =
            OutputCollector::spawn(None::<Cursor<Vec<u8>>>, None::<Cursor<Vec<u8>>>, 16);
        assert_eq!(collector.finish(), CollectedOutput::default());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let collector = OutputCollector::spawn(
            Some(Cursor::new(vec![0xff, b'a'])),
            None::<Cursor<Vec<u8>>>,
            16,
        );
        assert_eq!(collector.finish().stdout, "\u{fffd}a");
    }

    /// Writes one line, then blocks as if another process still held the pipe.
    struct HeldOpen {
        sent: bool,
    }

    impl Read for HeldOpen {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                thread::sleep(Duration::from_secs(30));
                return Ok(0);
            }
            self.sent = true;
            let line = b"parent done\n";
            buf[..line.len()].copy_from_slice(line);
            Ok(line.len())
        }
    }

    #[test]
    fn held_open_stream_keeps_captured_bytes() {
        let collector = OutputCollector::spawn(
            Some(HeldOpen { sent: false }),
            Some(Cursor::new(b"err\n".to_vec())),
            1024,
        );
        // Let the reader pick up the first line before giving up on it.
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let output = collector.finish();
        assert!(started.elapsed() < READER_GRACE + Duration::from_secs(1));
        assert!(output.stdout.starts_with("parent done\n"));
        assert!(output.stdout.ends_with(&held_open_marker()));
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.integrity, OutputIntegrity::TruncatedByLimit);
    }
}

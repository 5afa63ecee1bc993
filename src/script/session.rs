/// Client-side script sessions
///
/// A session owns the receiving end of a single-producer channel. The worker
/// thread running the guest is the only producer; when it exits the channel
/// disconnects and the session becomes `Finished`. `stop` drops the receiver,
/// so nothing can be appended afterwards.
use crate::config::types::OutputEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long `stop` waits for the worker to observe cancellation
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Finished,
    Stopped,
}

/// Shared cancellation flag between a session and its worker
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Producer side handed to a script host.
///
/// Applies the combined output ceiling: the event that crosses it is cut,
/// followed by one truncation error, and the sink closes.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<OutputEvent>,
    used: Arc<AtomicUsize>,
    limit: usize,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: Sender<OutputEvent>, limit: usize) -> Self {
        Self {
            tx,
            used: Arc::new(AtomicUsize::new(0)),
            limit,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Post an event. Returns `false` once nobody is listening or the output
    /// ceiling has been hit; the host should stop the guest then.
    pub fn post(&self, event: OutputEvent) -> bool {
        if self.is_closed() {
            return false;
        }

        let len = event.text.len();
        let before = self.used.fetch_add(len, Ordering::AcqRel);
        if before + len > self.limit {
            self.closed.store(true, Ordering::Release);
            let keep = self.limit.saturating_sub(before);
            if keep > 0 {
                let mut cut = keep;
                while !event.text.is_char_boundary(cut) {
                    cut -= 1;
                }
                let _ = self.tx.send(OutputEvent {
                    kind: event.kind,
                    text: event.text[..cut].to_string(),
                });
            }
            let _ = self.tx.send(OutputEvent::error(format!(
                "[output truncated after {} bytes]",
                self.limit
            )));
            return false;
        }

        if self.tx.send(event).is_err() {
            self.closed.store(true, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One in-process script execution and its output buffer
#[derive(Debug)]
pub struct SandboxSession {
    id: String,
    language: String,
    output: Vec<OutputEvent>,
    rx: Option<Receiver<OutputEvent>>,
    cancel: CancelToken,
    state: SessionState,
    worker: Option<JoinHandle<()>>,
}

impl SandboxSession {
    /// Session backed by a worker thread producing into `rx`
    pub fn running(
        id: String,
        language: String,
        rx: Receiver<OutputEvent>,
        cancel: CancelToken,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            language,
            output: Vec::new(),
            rx: Some(rx),
            cancel,
            state: SessionState::Running,
            worker: Some(worker),
        }
    }

    /// Session that is already over, e.g. an unsupported language
    pub fn finished(id: String, language: String, output: Vec<OutputEvent>) -> Self {
        Self {
            id,
            language,
            output,
            rx: None,
            cancel: CancelToken::new(),
            state: SessionState::Finished,
            worker: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Language name as requested
    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state != SessionState::Running
    }

    /// Events received so far, in arrival order
    pub fn output(&self) -> &[OutputEvent] {
        &self.output
    }

    /// Drain whatever has arrived; returns the newly appended events.
    pub fn poll(&mut self) -> &[OutputEvent] {
        let start = self.output.len();
        if let Some(rx) = &self.rx {
            loop {
                match rx.try_recv() {
                    Ok(event) => self.output.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.mark_finished();
                        break;
                    }
                }
            }
        }
        &self.output[start..]
    }

    /// Block until the worker finishes or `timeout` elapses, collecting
    /// events as they arrive.
    pub fn wait(&mut self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        while let Some(rx) = &self.rx {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(event) => self.output.push(event),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => self.mark_finished(),
            }
        }
        self.state
    }

    /// Cancel the guest and close the channel. Events already delivered stay
    /// in `output`; nothing is appended after this returns.
    pub fn stop(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Stopped;
            log::debug!("Stopping script session {}", self.id);
        }
        self.cancel.cancel();
        self.rx = None;

        if let Some(worker) = self.worker.take() {
            let deadline = Instant::now() + STOP_GRACE;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                log::warn!("Script session {} did not stop within {:?}", self.id, STOP_GRACE);
            }
        }
    }

    fn mark_finished(&mut self) {
        self.rx = None;
        if self.state == SessionState::Running {
            self.state = SessionState::Finished;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.rx.is_some() || self.worker.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn spawn_session<F>(body: F) -> SandboxSession
    where
        F: FnOnce(EventSink, CancelToken) + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let cancel = CancelToken::new();
        let sink = EventSink::new(tx, 1024);
        let worker_cancel = cancel.clone();
        let worker = std::thread::spawn(move || body(sink, worker_cancel));
        SandboxSession::running(
            "s-1".to_string(),
            "javascript".to_string(),
            rx,
            cancel,
            worker,
        )
    }

    #[test]
    fn events_arrive_in_order_then_finish() {
        let mut session = spawn_session(|sink, _| {
            sink.post(OutputEvent::log("one"));
            sink.post(OutputEvent::error("two"));
            sink.post(OutputEvent::log("three"));
        });

        assert_eq!(session.wait(Duration::from_secs(5)), SessionState::Finished);
        let texts: Vec<_> = session.output().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(session.is_finished());
    }

    #[test]
    fn stop_cancels_and_freezes_output() {
        let mut session = spawn_session(|sink, cancel| {
            sink.post(OutputEvent::log("started"));
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            sink.post(OutputEvent::log("after stop"));
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.output().is_empty() && Instant::now() < deadline {
            session.poll();
        }
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.output(), &[OutputEvent::log("started")]);

        session.poll();
        assert_eq!(session.wait(Duration::from_millis(50)), SessionState::Stopped);
        assert_eq!(session.output().len(), 1);
    }

    #[test]
    fn finished_session_has_no_worker() {
        let mut session = SandboxSession::finished(
            "s-2".to_string(),
            "c".to_string(),
            vec![OutputEvent::error("nope")],
        );
        assert_eq!(session.state(), SessionState::Finished);
        assert!(session.poll().is_empty());
        session.stop();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.output().len(), 1);
    }

    #[test]
    fn sink_enforces_ceiling() {
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, 8);
        assert!(sink.post(OutputEvent::log("12345")));
        assert!(!sink.post(OutputEvent::log("67890")));
        assert!(!sink.post(OutputEvent::log("more")));
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events[0].text, "12345");
        assert_eq!(events[1].text, "678");
        assert_eq!(events[2], OutputEvent::error("[output truncated after 8 bytes]"));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn sink_closes_when_receiver_dropped() {
        let (tx, rx) = unbounded();
        let sink = EventSink::new(tx, 1024);
        drop(rx);
        assert!(!sink.post(OutputEvent::log("lost")));
        assert!(sink.is_closed());
    }
}

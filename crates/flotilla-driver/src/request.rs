use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Message severity reported by a request's message callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug)]
struct SinkState<R> {
    responses: Vec<R>,
    error: Option<String>,
    done: bool,
}

/// Accumulator for one asynchronous cluster request.
///
/// The client's callbacks record messages and responses here; `done` fires a
/// single-shot signal. The caller waits on that signal with a deadline and
/// then reads the accumulated error and responses. A timed-out request's
/// partial results are simply never read.
#[derive(Debug)]
pub struct RequestSink<R> {
    state: Mutex<SinkState<R>>,
    done: Notify,
}

impl<R> RequestSink<R> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(RequestSink {
            state: Mutex::new(SinkState { responses: Vec::new(), error: None, done: false }),
            done: Notify::new(),
        })
    }

    pub fn on_message(&self, severity: Severity, msg: &str) {
        if severity == Severity::Error {
            let mut state = self.state.lock().unwrap();
            state.error = Some(msg.to_string());
        }
    }

    pub fn on_response(&self, response: R) {
        let mut state = self.state.lock().unwrap();
        state.responses.push(response);
    }

    pub fn done(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.done = true;
        }
        self.done.notify_waiters();
        self.done.notify_one();
    }

    /// Wait up to `timeout` for the done signal. Returns `false` on deadline.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.done.notified();
            if self.state.lock().unwrap().done {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn take_responses(&self) -> Vec<R> {
        std::mem::take(&mut self.state.lock().unwrap().responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_after_done() {
        let sink: Arc<RequestSink<u32>> = RequestSink::new();
        sink.on_response(1);
        sink.on_response(2);
        sink.done();
        assert!(sink.wait(Duration::from_millis(10)).await);
        assert_eq!(sink.take_responses(), vec![1, 2]);
        assert!(sink.error().is_none());
    }

    #[tokio::test]
    async fn wait_times_out_without_done() {
        let sink: Arc<RequestSink<()>> = RequestSink::new();
        assert!(!sink.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn done_signal_wakes_a_parked_waiter() {
        let sink: Arc<RequestSink<()>> = RequestSink::new();
        let waiter = sink.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink.done();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn error_messages_land_in_the_error_slot() {
        let sink: Arc<RequestSink<()>> = RequestSink::new();
        sink.on_message(Severity::Info, "progress");
        sink.on_message(Severity::Error, "boom");
        sink.done();
        sink.wait(Duration::from_millis(10)).await;
        assert_eq!(sink.error().as_deref(), Some("boom"));
    }
}

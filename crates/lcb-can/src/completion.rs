//! One-shot completion handles for asynchronous requests.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::error::{IfError, IfResult};

type Callback = Box<dyn FnOnce(IfResult<()>) + Send>;

/// Reports the outcome of one request exactly once.
///
/// Dropping a completion that was never fired reports
/// [`IfError::Abandoned`], so a caller always hears back.
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    pub fn new(callback: impl FnOnce(IfResult<()>) + Send + 'static) -> Self {
        Completion {
            callback: Some(Box::new(callback)),
        }
    }

    /// A completion whose outcome nobody observes.
    pub fn ignore() -> Self {
        Completion { callback: None }
    }

    /// A completion paired with a receiver for its outcome.
    pub fn channel() -> (Completion, CompletionReceiver) {
        let (tx, rx) = bounded(1);
        let completion = Completion::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, CompletionReceiver { rx })
    }

    pub fn complete(mut self, result: IfResult<()>) {
        self.fire(result);
    }

    fn fire(&mut self, result: IfResult<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire(Err(IfError::Abandoned));
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Receiving side of [`Completion::channel`].
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: Receiver<IfResult<()>>,
}

impl CompletionReceiver {
    /// The outcome, if the completion has fired.
    pub fn try_result(&self) -> Option<IfResult<()>> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the outcome.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<IfResult<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

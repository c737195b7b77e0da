use std::future::Future;
use std::ops::Deref;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::storage::{Result, StorageError};

pub type Sink<'a> = dyn AsyncWrite + Unpin + Send + 'a;
pub type Source<'a> = dyn AsyncRead + Unpin + Send + 'a;

/// A key addressed blob store used by the cache layer.
///
/// Implementations are shared across concurrent callers. Every operation takes the
/// caller's cancellation token and returns [`StorageError::Cancelled`] as soon as it
/// fires, abandoning whatever transfer is in flight.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Streams the object stored under `key` into `sink`.
    ///
    /// A missing object is reported as [`StorageError::NotFound`]. When the call fails
    /// or is cancelled, whatever was already written to `sink` must be discarded.
    async fn fetch(&self, cancel: &CancellationToken, key: &str, sink: &mut Sink<'_>) -> Result<()>;

    /// Uploads everything `source` yields under `key`, replacing any existing object.
    async fn store(&self, cancel: &CancellationToken, key: &str, source: &mut Source<'_>) -> Result<()>;

    /// Probes for `key` without transferring its content. Absence is `Ok(false)`.
    async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool>;
}

/// Drives `operation` to completion unless `cancel` fires first.
///
/// The token is polled first, so an already cancelled token never starts the
/// operation. Losing the race drops `operation`, which releases everything it owns.
pub(crate) async fn cancellable<T, F>(
    cancel: &CancellationToken,
    context: &'static str,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::debug!("{} cancelled by caller", context);
            Err(StorageError::Cancelled(context))
        }
        result = operation => result,
    }
}

/// A cancellation token that also fires once its timeout elapses.
///
/// Dereferences to the token, so it can be passed wherever a `&CancellationToken` is
/// expected. Dropping it stops the timer; clones of the token taken before the drop
/// then only follow the parent.
#[derive(Debug)]
pub struct Deadline {
    token: CancellationToken,
    timer: JoinHandle<()>,
}

impl Deadline {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Deref for Deadline {
    type Target = CancellationToken;

    fn deref(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Returns a child of `parent` that is also cancelled once `timeout` elapses.
///
/// Must be called from within a Tokio runtime.
pub fn cancel_after(parent: &CancellationToken, timeout: Duration) -> Deadline {
    let token = parent.child_token();
    let expired = token.clone();

    let timer = tokio::spawn(async move {
        tokio::select! {
            _ = expired.cancelled() => {}
            _ = tokio::time::sleep(timeout) => expired.cancel(),
        }
    });

    Deadline { token, timer }
}

//! Suspension, cancellation and deadlines for exchange work
//!
//! Requests that talk to exchanges run under a [`RequestScope`]: every
//! exchange call made on behalf of the request observes the scope's
//! cancellation token and its overall deadline. When the deadline passes
//! the scope cancels itself, so all outstanding calls under the request
//! stop together and the request resumes with an `ExchangeTimeout`.
//!
//! Background work (the `/keys` loaders) is spawned as a
//! [`PendingOperation`], which can be cancelled synchronously: once
//! [`PendingOperation::cancel`] returns, the task's result is never
//! observed.

use crate::types::MerchantError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default overall timeout of a request that waits on exchanges
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancellation and deadline shared by all exchange calls of one request
#[derive(Debug, Clone)]
pub struct RequestScope {
    token: CancellationToken,
    deadline: Instant,
}

impl RequestScope {
    /// Open a scope that expires `timeout` from now
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every call running under this scope
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drive `work` until it completes, the scope is cancelled, or the deadline passes
    ///
    /// On expiry the whole scope is cancelled, so sibling calls stop too.
    ///
    /// # Errors
    ///
    /// `ExchangeTimeout` for `exchange_url` on cancellation or expiry,
    /// otherwise whatever `work` returned.
    pub async fn run<T, F>(&self, exchange_url: &str, work: F) -> Result<T, MerchantError>
    where
        F: Future<Output = Result<T, MerchantError>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MerchantError::exchange_timeout(exchange_url)),
            _ = tokio::time::sleep_until(self.deadline) => {
                debug!(exchange = exchange_url, "Request deadline passed; cancelling outstanding exchange calls");
                self.token.cancel();
                Err(MerchantError::exchange_timeout(exchange_url))
            }
            result = work => result,
        }
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

/// A spawned task that can be cancelled or awaited
#[derive(Debug)]
pub struct PendingOperation<T> {
    token: CancellationToken,
    handle: JoinHandle<Option<T>>,
}

impl<T: Send + 'static> PendingOperation<T> {
    /// Spawn `work` on the current runtime under a child of `parent`
    ///
    /// Cancelling `parent` cancels the operation as well.
    pub fn spawn<F>(parent: &CancellationToken, work: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let token = parent.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => None,
                value = work => Some(value),
            }
        });
        Self { token, handle }
    }

    /// Stop the operation; its result will never be delivered
    pub fn cancel(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result, `None` if the operation was cancelled
    pub async fn join(self) -> Option<T> {
        if self.token.is_cancelled() {
            self.handle.abort();
            return None;
        }
        self.handle.await.ok().flatten()
    }
}

//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Background scheduler for long-lived pump loops."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

/// Runs fan-out pumps, relays and update loops off the caller's request path.
///
/// Every task receives a child of the dispatcher's root token, so
/// [`BackgroundDispatcher::shutdown`] stops all of them.
#[derive(Debug, Clone)]
pub struct BackgroundDispatcher {
    tracker: TaskTracker,
    root: CancellationToken,
}

impl Default for BackgroundDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundDispatcher {
    /// Create a dispatcher with a fresh root token.
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
        }
    }

    /// Spawn a named background task. The closure receives the task's shutdown token.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = self.root.child_token();
        let span = info_span!("background_task", task = %name);
        debug!(task = %name, "spawning background task");
        self.tracker.spawn(task(token).instrument(span))
    }

    /// Token cancelled when the dispatcher shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Whether [`BackgroundDispatcher::shutdown`] has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Number of tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Like [`BackgroundDispatcher::shutdown`] but gives up after `timeout`.
    /// Returns `false` when tasks were still running.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        self.root.cancel();
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "background tasks did not stop before timeout"
                );
                false
            }
        }
    }
}

//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Receiver and control halves of a push subscription."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Span};

use super::channel::{OutputReceiver, Received};
use super::manager::ManagerInner;
use super::{SubscriptionId, SubscriptionState, SubscriptionUpdate, Topic, TopicItem};
use crate::error::{AdapterError, AdapterResult};

/// State shared between the receiver, every handle and the manager's table.
pub(crate) struct SubscriptionShared {
    pub(crate) id: SubscriptionId,
    pub(crate) connection_id: Option<String>,
    state: Mutex<SubscriptionState>,
    fault: Mutex<Option<AdapterError>>,
    released: AtomicBool,
    closed: CancellationToken,
    delivered: AtomicU64,
    // Open from creation until dispose.
    span: Mutex<Option<Span>>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: SubscriptionId, connection_id: Option<String>, span: Span) -> Self {
        Self {
            id,
            connection_id,
            state: Mutex::new(SubscriptionState::Created),
            fault: Mutex::new(None),
            released: AtomicBool::new(false),
            closed: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            span: Mutex::new(Some(span)),
        }
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Record the delivered item count and close the subscription span.
    pub(crate) fn close_span(&self) {
        if let Some(span) = self.span.lock().take() {
            span.record("items", self.delivered());
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub(crate) fn activate(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Created {
            *state = SubscriptionState::Active;
        }
    }

    /// Move into a terminal state. Only the first terminal transition wins.
    fn terminate(&self, next: SubscriptionState, fault: Option<AdapterError>) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        if let Some(fault) = fault {
            *self.fault.lock() = Some(fault);
        }
        true
    }

    /// Claim the one-time cleanup. Returns `false` if it already ran or is running.
    pub(crate) fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disposed(&self) {
        *self.state.lock() = SubscriptionState::Disposed;
        self.closed.cancel();
    }

    fn take_fault(&self) -> Option<AdapterError> {
        self.fault.lock().take()
    }
}

/// Cloneable control side of a subscription.
pub struct SubscriptionHandle<T: TopicItem> {
    manager: Arc<ManagerInner<T>>,
    shared: Arc<SubscriptionShared>,
}

impl<T: TopicItem> Clone for SubscriptionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: TopicItem> std::fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl<T: TopicItem> SubscriptionHandle<T> {
    pub(crate) fn new(manager: Arc<ManagerInner<T>>, shared: Arc<SubscriptionShared>) -> Self {
        Self { manager, shared }
    }

    /// Subscription identifier.
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Connection that created the subscription.
    pub fn connection_id(&self) -> Option<&str> {
        self.shared.connection_id.as_deref()
    }

    /// Topics the subscription is currently interested in.
    pub fn topics(&self) -> Vec<Topic> {
        self.manager.subscription_topics(self.shared.id)
    }

    /// Items handed to the receiver so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered()
    }

    /// Whether cleanup has finished.
    pub fn is_disposed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Token cancelled once the subscription has been disposed.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Add interest in topics. Topics already held by this subscription are ignored.
    pub async fn add_topics<I, S>(&self, topics: I) -> AdapterResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Topic>,
    {
        let topics: Vec<Topic> = topics.into_iter().map(Into::into).collect();
        if self.shared.is_released() || self.shared.state().is_terminal() {
            return Err(AdapterError::SubscriptionNotFound(self.shared.id));
        }
        self.manager.add_topics(self.shared.id, topics).await?;
        self.shared.activate();
        Ok(())
    }

    /// Drop interest in topics. Topics not held by this subscription are ignored.
    pub async fn remove_topics<I, S>(&self, topics: I) -> AdapterResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Topic>,
    {
        let topics: Vec<Topic> = topics.into_iter().map(Into::into).collect();
        self.manager.remove_topics(self.shared.id, topics).await
    }

    /// Apply one message from the update channel.
    pub async fn apply_update(&self, update: SubscriptionUpdate) -> AdapterResult<()> {
        match update {
            SubscriptionUpdate::Add(topics) => self.add_topics(topics).await,
            SubscriptionUpdate::Remove(topics) => self.remove_topics(topics).await,
        }
    }

    /// End the subscription silently.
    pub async fn cancel(&self) {
        self.finish(SubscriptionState::Cancelled, None).await;
    }

    /// End the subscription with a fault delivered to its receiver.
    pub async fn fault(&self, error: AdapterError) {
        self.finish(SubscriptionState::Faulted, Some(error)).await;
    }

    /// End the subscription normally.
    pub async fn complete(&self) {
        self.finish(SubscriptionState::Completed, None).await;
    }

    /// Release every topic and close the output. Safe to call any number of times.
    pub async fn dispose(&self) {
        self.manager.release(&self.shared).await;
    }

    async fn finish(&self, state: SubscriptionState, fault: Option<AdapterError>) {
        self.shared.terminate(state, fault);
        self.dispose().await;
    }

    /// Hand disposal to the manager's pump; used where no `.await` is possible.
    ///
    /// Once the pump has stopped the release runs on the current runtime instead.
    pub(crate) fn dispose_detached(&self) {
        if self.shared.is_released() || self.manager.request_release(self.shared.id) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                let shared = self.shared.clone();
                runtime.spawn(async move {
                    manager.release_now(&shared).await;
                });
            }
            Err(_) => {
                warn!(subscription = %self.shared.id, "dropped outside a runtime; topics not released")
            }
        }
    }
}

/// Receiver side of a subscription. Dropping it disposes the subscription.
pub struct Subscription<T: TopicItem> {
    handle: SubscriptionHandle<T>,
    output: OutputReceiver<T>,
    finished: bool,
}

impl<T: TopicItem> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.handle.id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: TopicItem> Subscription<T> {
    pub(crate) fn new(handle: SubscriptionHandle<T>, output: OutputReceiver<T>) -> Self {
        Self {
            handle,
            output,
            finished: false,
        }
    }

    /// Subscription identifier.
    pub fn id(&self) -> SubscriptionId {
        self.handle.id()
    }

    /// Control handle for topic updates and disposal.
    pub fn handle(&self) -> SubscriptionHandle<T> {
        self.handle.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.handle.state()
    }

    /// Next routed item.
    ///
    /// Returns `None` once the subscription has ended. A faulted subscription yields its
    /// fault once before ending.
    pub async fn next(&mut self) -> Option<AdapterResult<T>> {
        if self.finished {
            return None;
        }
        loop {
            match self.output.recv().await {
                Received::Item(item) => {
                    self.handle.shared.delivered.fetch_add(1, Ordering::Relaxed);
                    return Some(Ok(item));
                }
                Received::Lagged(skipped) => {
                    self.handle.manager.record_lag(self.handle.id(), skipped);
                }
                Received::Closed => {
                    self.finished = true;
                    return self.handle.shared.take_fault().map(Err);
                }
            }
        }
    }

    /// Convert into a boxed stream. The subscription is disposed when the stream is dropped.
    pub fn into_stream(self) -> BoxStream<'static, AdapterResult<T>> {
        stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
        .boxed()
    }
}

impl<T: TopicItem> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.dispose_detached();
    }
}

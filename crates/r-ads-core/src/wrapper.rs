//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Validation, tracing, relay and error normalisation around feature calls."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Every resolved feature call runs through a [`FeatureCall`].
//!
//! The wrapper validates the request before adapter code sees it, opens a span for the
//! call, converts adapter errors and panics into [`AdapterError`]s and relays streamed
//! results through a bounded channel owned by the SDK.
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info_span, warn, Instrument, Span};
use validator::Validate;

use crate::context::CallContext;
use crate::dispatch::BackgroundDispatcher;
use crate::error::{AdapterError, AdapterResult};
use crate::features::{FeatureDescriptor, ItemStream};
use crate::metrics::SdkMetrics;
use crate::subscriptions::SubscriptionId;
use crate::tracker::CancellableSubscription;

/// A resolved and authorized feature, ready to be invoked.
pub struct FeatureCall<F: ?Sized> {
    adapter_id: String,
    descriptor: FeatureDescriptor,
    feature: Arc<F>,
    dispatcher: BackgroundDispatcher,
    relay_capacity: usize,
    metrics: Option<SdkMetrics>,
}

impl<F: ?Sized> Clone for FeatureCall<F> {
    fn clone(&self) -> Self {
        Self {
            adapter_id: self.adapter_id.clone(),
            descriptor: self.descriptor.clone(),
            feature: self.feature.clone(),
            dispatcher: self.dispatcher.clone(),
            relay_capacity: self.relay_capacity,
            metrics: self.metrics.clone(),
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for FeatureCall<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureCall")
            .field("adapter", &self.adapter_id)
            .field("feature", &self.descriptor.uri)
            .finish_non_exhaustive()
    }
}

impl<F: ?Sized + Send + Sync + 'static> FeatureCall<F> {
    /// Wrap a feature implementation.
    pub fn new(
        adapter_id: impl Into<String>,
        descriptor: FeatureDescriptor,
        feature: Arc<F>,
        dispatcher: BackgroundDispatcher,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            descriptor,
            feature,
            dispatcher,
            relay_capacity: 16,
            metrics: None,
        }
    }

    /// Capacity of the relay channel used for streamed results.
    pub fn with_relay_capacity(mut self, capacity: usize) -> Self {
        self.relay_capacity = capacity.max(1);
        self
    }

    /// Record outcomes in `metrics`.
    pub fn with_metrics(mut self, metrics: Option<SdkMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Owning adapter id.
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    /// Feature descriptor.
    pub fn descriptor(&self) -> &FeatureDescriptor {
        &self.descriptor
    }

    /// Wrapped implementation.
    pub fn feature(&self) -> Arc<F> {
        self.feature.clone()
    }

    /// Validate `request` and run a call that returns one response.
    pub async fn unary<Req, Resp, C, Fut>(
        &self,
        ctx: &CallContext,
        request: Req,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<Resp>
    where
        Req: Validate + Send + 'static,
        C: FnOnce(Arc<F>, CallContext, Req, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        self.rejected("unary", &request)?;
        self.execute("unary", ctx, cancel, move |feature, ctx, cancel| {
            call(feature, ctx, request, cancel)
        })
        .await
    }

    /// Validate `request` and open a push subscription.
    ///
    /// Opening is not raced against `cancel`: the adapter receives the token and a
    /// subscription cancelled while it opens ends silently through its update loop.
    pub async fn subscribe<Req, Resp, C, Fut>(
        &self,
        ctx: &CallContext,
        request: Req,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<Resp>
    where
        Req: Validate + Send + 'static,
        C: FnOnce(Arc<F>, CallContext, Req, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        self.rejected("subscribe", &request)?;
        self.run(
            "subscribe",
            ctx,
            cancel,
            false,
            move |feature, ctx, cancel| call(feature, ctx, request, cancel),
        )
        .await
    }

    /// Validate `request` and relay the streamed results.
    pub async fn stream<Req, T, C, Fut>(
        &self,
        ctx: &CallContext,
        request: Req,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<FeatureStream<T>>
    where
        Req: Validate + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Arc<F>, CallContext, Req, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<ItemStream<T>>> + Send,
    {
        self.rejected("server_stream", &request)?;
        self.open_stream("server_stream", ctx, cancel, move |feature, ctx, cancel| {
            call(feature, ctx, request, cancel)
        })
        .await
    }

    /// Feed `input` to the adapter and return one response.
    pub async fn client_stream<In, Resp, C, Fut>(
        &self,
        ctx: &CallContext,
        input: BoxStream<'static, In>,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<Resp>
    where
        In: Send + 'static,
        C: FnOnce(Arc<F>, CallContext, BoxStream<'static, In>, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        self.execute("client_stream", ctx, cancel, move |feature, ctx, cancel| {
            call(feature, ctx, input, cancel)
        })
        .await
    }

    /// Feed `input` to the adapter and relay its streamed results. Output does not wait
    /// for the input to finish.
    pub async fn duplex<In, T, C, Fut>(
        &self,
        ctx: &CallContext,
        input: BoxStream<'static, In>,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<FeatureStream<T>>
    where
        In: Send + 'static,
        T: Send + 'static,
        C: FnOnce(Arc<F>, CallContext, BoxStream<'static, In>, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<ItemStream<T>>> + Send,
    {
        self.open_stream("duplex_stream", ctx, cancel, move |feature, ctx, cancel| {
            call(feature, ctx, input, cancel)
        })
        .await
    }

    /// Run a call without request validation. Cancellation ends it with
    /// [`AdapterError::OperationCancelled`].
    pub async fn execute<Resp, C, Fut>(
        &self,
        shape: &'static str,
        ctx: &CallContext,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<Resp>
    where
        C: FnOnce(Arc<F>, CallContext, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        self.run(shape, ctx, cancel, true, call).await
    }

    async fn run<Resp, C, Fut>(
        &self,
        shape: &'static str,
        ctx: &CallContext,
        cancel: CancellationToken,
        abortable: bool,
        call: C,
    ) -> AdapterResult<Resp>
    where
        C: FnOnce(Arc<F>, CallContext, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>> + Send,
    {
        let started = Instant::now();
        let span = info_span!(
            "feature_call",
            adapter = %self.adapter_id,
            feature = %self.descriptor.uri,
            shape,
            correlation_id = %ctx.correlation_id(),
            outcome = field::Empty,
        );
        let future = call(self.feature.clone(), ctx.clone(), cancel.clone());
        let result = async {
            let outcome = AssertUnwindSafe(future).catch_unwind();
            if !abortable {
                return self.settle(outcome.await);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AdapterError::OperationCancelled),
                outcome = outcome => self.settle(outcome),
            }
        }
        .instrument(span.clone())
        .await;
        self.record(&span, shape, &result, started);
        result
    }

    async fn open_stream<T, C, Fut>(
        &self,
        shape: &'static str,
        ctx: &CallContext,
        cancel: CancellationToken,
        call: C,
    ) -> AdapterResult<FeatureStream<T>>
    where
        T: Send + 'static,
        C: FnOnce(Arc<F>, CallContext, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<ItemStream<T>>> + Send,
    {
        let relay_cancel = cancel.child_token();
        let source = match self.execute(shape, ctx, relay_cancel.clone(), call).await {
            Ok(source) => source,
            // A stream cancelled while it opens is returned already finished.
            Err(AdapterError::OperationCancelled) => return Ok(FeatureStream::finished(relay_cancel)),
            Err(error) => return Err(error),
        };

        let (tx, rx) = mpsc::channel(self.relay_capacity);
        let relay_span = info_span!(
            "feature_relay",
            adapter = %self.adapter_id,
            feature = %self.descriptor.uri,
            shape,
            correlation_id = %ctx.correlation_id(),
            items = field::Empty,
        );
        let feature_uri = self.descriptor.uri.clone();
        let metrics = self.metrics.clone();
        let task_cancel = relay_cancel.clone();
        self.dispatcher
            .spawn(format!("relay:{}", feature_uri), move |shutdown| {
                let span = relay_span.clone();
                async move {
                    let items = relay(source, tx, task_cancel, shutdown).await;
                    span.record("items", items);
                    debug!(items, "relay finished");
                    if let Some(metrics) = metrics {
                        metrics.observe_items(&feature_uri, items);
                    }
                }
                .instrument(relay_span)
            });
        Ok(FeatureStream::new(rx, relay_cancel))
    }

    fn rejected<Req: Validate>(&self, shape: &'static str, request: &Req) -> AdapterResult<()> {
        if let Err(errors) = request.validate() {
            let error = AdapterError::from(errors);
            debug!(
                adapter = %self.adapter_id,
                feature = %self.descriptor.uri,
                shape,
                error = %error,
                "request rejected before dispatch"
            );
            if let Some(metrics) = &self.metrics {
                metrics.observe_call(&self.descriptor.uri, error.label());
            }
            return Err(error);
        }
        Ok(())
    }

    fn settle<R>(&self, outcome: Result<anyhow::Result<R>, Box<dyn Any + Send>>) -> AdapterResult<R> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.attribute(AdapterError::classify(err))),
            Err(panic) => Err(AdapterError::from_panic(panic)),
        }
    }

    /// Fill in the adapter id on errors raised by feature code that cannot know it.
    fn attribute(&self, error: AdapterError) -> AdapterError {
        match error {
            AdapterError::FeatureNotSupported { adapter, feature } if adapter.is_empty() => {
                AdapterError::FeatureNotSupported {
                    adapter: self.adapter_id.clone(),
                    feature,
                }
            }
            other => other,
        }
    }

    fn record<R>(&self, span: &Span, shape: &'static str, result: &AdapterResult<R>, started: Instant) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(error) => error.label(),
        };
        span.record("outcome", outcome);
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(&self.descriptor.uri, outcome);
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Err(error @ AdapterError::UpstreamFault(_)) => warn!(
                adapter = %self.adapter_id,
                feature = %self.descriptor.uri,
                shape,
                elapsed_ms,
                error = %error,
                "feature call failed"
            ),
            _ => debug!(
                adapter = %self.adapter_id,
                feature = %self.descriptor.uri,
                shape,
                elapsed_ms,
                outcome,
                "feature call finished"
            ),
        }
    }
}

/// Copy items from the adapter's stream into the relay channel until either side ends.
async fn relay<T: Send + 'static>(
    source: ItemStream<T>,
    tx: mpsc::Sender<AdapterResult<T>>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) -> u64 {
    let mut source = Box::pin(AssertUnwindSafe(source).catch_unwind());
    let mut items = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            _ = tx.closed() => break,
            next = source.next() => next,
        };
        let outcome = match next {
            None => break,
            Some(Ok(Ok(item))) => Ok(item),
            Some(Ok(Err(err))) => Err(AdapterError::classify(err)),
            Some(Err(panic)) => Err(AdapterError::from_panic(panic)),
        };
        let failed = outcome.is_err();
        if !failed {
            items += 1;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(outcome) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if failed {
            break;
        }
    }
    items
}

/// Receiver of a relayed result stream. Dropping it cancels the relay and the adapter's
/// production.
pub struct FeatureStream<T> {
    receiver: mpsc::Receiver<AdapterResult<T>>,
    cancel: CancellationToken,
}

impl<T> Unpin for FeatureStream<T> {}

impl<T> std::fmt::Debug for FeatureStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T> FeatureStream<T> {
    fn new(receiver: mpsc::Receiver<AdapterResult<T>>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// A stream that has already ended.
    pub(crate) fn finished(cancel: CancellationToken) -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self::new(receiver, cancel)
    }

    /// Next item, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<AdapterResult<T>> {
        self.receiver.recv().await
    }

    /// Stop the relay. Items already buffered are still delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the relay when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adapter for the connection tracker; disposing it cancels this stream.
    pub fn tracked(&self) -> CancellableSubscription {
        CancellableSubscription::new(SubscriptionId::next(), self.cancel.clone())
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> AdapterResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T> Stream for FeatureStream<T> {
    type Item = AdapterResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl<T> Drop for FeatureStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

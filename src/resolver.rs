//! Per-target resolver: keeps a consumer's address list in sync with one
//! `Endpoints` object.
//!
//! # How It Works
//!
//! 1. Subscribes to the target's resource through a [`ChangeSource`]
//! 2. Resolves each snapshot into ready `ip:port` addresses
//! 3. Publishes the complete address list whenever it changes
//! 4. Resubscribes with backoff when the subscription ends, keeping the
//!    last known addresses until a fresh snapshot replaces them
//!
//! One background task per target owns the address set, so snapshots are
//! applied and published strictly in the order the source delivers them.

use std::any::Any;
use std::future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffConfig};
use crate::consumer::{AddressSink, ConsumerClosed};
use crate::diff::{MaterializedSet, diff};
use crate::error::TargetError;
use crate::metrics::{Metrics, TargetGauges};
use crate::model::{ChangeEvent, Snapshot};
use crate::source::{ChangeSource, EventStream};
use crate::target::{ResourceKey, TargetDescriptor};

/// Lifecycle state of a resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverState {
    /// Opening the first subscription.
    Starting,
    /// Consuming change events.
    Watching,
    /// Waiting to reopen a subscription that ended.
    Resyncing,
    /// Stopped; no further publishes occur.
    Closed,
}

/// What to do when the watched resource is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Clear the address set and publish an empty list.
    #[default]
    Clear,
    /// Keep the last known addresses until the resource reappears.
    Retain,
}

/// Tuning for a resolver.
#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Backoff between resubscription attempts.
    pub backoff: BackoffConfig,

    /// How long a publish may wait for the consumer before it is abandoned.
    /// An abandoned list is retried with the resubscription backoff until the
    /// consumer takes it.
    pub publish_timeout: Duration,

    /// Handling of proven resource deletion.
    pub delete_policy: DeletePolicy,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            publish_timeout: Duration::from_secs(5),
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl ResolverOptions {
    /// Sets the resubscription backoff.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the publish timeout.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the delete policy.
    #[must_use]
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }
}

/// Handle to a running resolver.
///
/// Dropping the handle stops the resolver without waiting for it; use
/// [`ResolverHandle::close`] to wait until it has exited.
pub struct ResolverHandle {
    target: TargetDescriptor,
    cancel: CancellationToken,
    resync: Arc<Notify>,
    state: watch::Receiver<ResolverState>,
    addresses: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl ResolverHandle {
    /// The target being resolved.
    #[must_use]
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Asks the resolver to resubscribe immediately.
    ///
    /// Ignored unless the resolver is currently watching.
    pub fn resolve_now(&self) {
        if *self.state.borrow() == ResolverState::Watching {
            self.resync.notify_one();
        }
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// A receiver that observes lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ResolverState> {
        self.state.clone()
    }

    /// Returns `true` if the consumer was last handed at least one address.
    #[must_use]
    pub fn has_addresses(&self) -> bool {
        self.addresses.load(Ordering::Relaxed) > 0
    }

    /// Stops the resolver and waits for its task to exit.
    ///
    /// Once this returns, the consumer receives no further updates.
    pub async fn close(mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!("Kubernetes resolver for {} failed: {e}", self.target);
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts resolving `target` in a background task.
///
/// The task subscribes to the target's `Endpoints` through `source` and
/// publishes complete address lists to `sink`. Must be called from within a
/// Tokio runtime.
///
/// # Errors
///
/// Returns a [`TargetError`] if the target names no service or namespace.
pub fn start<S, C>(
    target: TargetDescriptor,
    source: Arc<S>,
    sink: C,
    options: ResolverOptions,
    metrics: &Metrics,
) -> Result<ResolverHandle, TargetError>
where
    S: ChangeSource,
    C: AddressSink,
{
    if target.service_name.is_empty() {
        return Err(TargetError::MissingService(target.to_string()));
    }

    if target.namespace.is_empty() {
        return Err(TargetError::MissingNamespace(target.to_string()));
    }

    let cancel = CancellationToken::new();
    let resync = Arc::new(Notify::new());
    let (state_sender, state) = watch::channel(ResolverState::Starting);
    let addresses = Arc::new(AtomicUsize::new(0));

    let resolver = Resolver {
        key: target.resource_key(),
        gauges: metrics.for_target(&target.to_string()),
        target: target.clone(),
        source,
        sink,
        options,
        cancel: cancel.clone(),
        resync: Arc::clone(&resync),
        state: state_sender,
        addresses: Arc::clone(&addresses),
        current: MaterializedSet::new(),
        stale: false,
    };

    let task = tokio::spawn(resolver.run());

    Ok(ResolverHandle {
        target,
        cancel,
        resync,
        state,
        addresses,
        task: Some(task),
    })
}

/// Work picked by one turn of the watch loop.
enum Step {
    /// Apply an event from the subscription.
    Apply(ChangeEvent),
    /// Retry handing the current list to the consumer.
    Retry,
}

/// How a subscription ended.
enum Outcome {
    /// Stop requested or consumer gone.
    Closed,
    /// Resubscribe immediately.
    Resync,
    /// Subscription died; resubscribe after backoff.
    Lost,
}

struct Resolver<S, C> {
    target: TargetDescriptor,
    key: ResourceKey,
    source: Arc<S>,
    sink: C,
    options: ResolverOptions,
    gauges: TargetGauges,
    cancel: CancellationToken,
    resync: Arc<Notify>,
    state: watch::Sender<ResolverState>,
    addresses: Arc<AtomicUsize>,
    current: MaterializedSet,
    // The consumer has not seen `current` yet.
    stale: bool,
}

impl<S, C> Resolver<S, C>
where
    S: ChangeSource,
    C: AddressSink,
{
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.options.backoff.clone());
        let mut delay = None;

        tracing::debug!(
            "Starting Kubernetes resolver for {} on port {:?}",
            self.key,
            self.target.port
        );

        loop {
            if let Some(delay) = delay.take() {
                tracing::debug!("resubscribing to {} in {delay:?}", self.key);

                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let subscription = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = AssertUnwindSafe(self.source.subscribe(&self.key)).catch_unwind() => result,
            };

            let mut events = match subscription {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    tracing::warn!("failed to watch endpoints for {}: {e}", self.key);
                    self.set_state(ResolverState::Resyncing);
                    delay = Some(backoff.next_delay());
                    continue;
                }

                Err(panic) => {
                    tracing::error!(
                        "recovered from panic while subscribing to {}: {}",
                        self.key,
                        panic_message(&*panic)
                    );
                    self.set_state(ResolverState::Resyncing);
                    delay = Some(backoff.next_delay());
                    continue;
                }
            };

            self.set_state(ResolverState::Watching);

            let outcome = self.watch(&mut events, &mut backoff).await;
            drop(events);

            match outcome {
                Outcome::Closed => break,
                Outcome::Resync => self.set_state(ResolverState::Resyncing),
                Outcome::Lost => {
                    self.set_state(ResolverState::Resyncing);
                    delay = Some(backoff.next_delay());
                }
            }
        }

        self.set_state(ResolverState::Closed);
        tracing::debug!("Kubernetes resolver for {} stopped", self.key);
    }

    /// Consumes one subscription until it ends or the resolver stops.
    async fn watch(&mut self, events: &mut EventStream, backoff: &mut Backoff) -> Outcome {
        let cancel = self.cancel.clone();
        let mut retry = Backoff::new(self.options.backoff.clone());
        let mut retry_at = None;

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Closed,
                () = self.resync.notified() => {
                    tracing::debug!("resync requested for {}", self.key);
                    return Outcome::Resync;
                }
                () = sleep_until(retry_at) => Step::Retry,
                next = AssertUnwindSafe(events.next()).catch_unwind() => match next {
                    Ok(Some(ChangeEvent::Error(e))) => {
                        tracing::warn!("endpoints watch for {} failed: {e}", self.key);
                        continue;
                    }

                    Ok(Some(event)) => Step::Apply(event),
                    Ok(None) => {
                        tracing::debug!("endpoints watch for {} ended", self.key);
                        return Outcome::Lost;
                    }

                    Err(panic) => {
                        tracing::error!(
                            "recovered from panic while watching endpoints for {}: {}",
                            self.key,
                            panic_message(&*panic)
                        );
                        return Outcome::Lost;
                    }
                },
            };

            let applied = matches!(step, Step::Apply(_));
            let handled = tokio::select! {
                biased;
                () = cancel.cancelled() => return Outcome::Closed,
                result = AssertUnwindSafe(self.handle(step)).catch_unwind() => result,
            };

            match handled {
                Ok(Ok(())) => {
                    if applied {
                        backoff.reset();
                    }
                }

                Ok(Err(ConsumerClosed)) => {
                    tracing::warn!("consumer closed, stopping Kubernetes resolver for {}", self.key);
                    return Outcome::Closed;
                }

                Err(panic) => {
                    tracing::error!(
                        "recovered from panic while handling endpoints for {}: {}",
                        self.key,
                        panic_message(&*panic)
                    );
                    return Outcome::Lost;
                }
            }

            retry_at = if self.stale {
                let delay = retry.next_delay();
                tracing::debug!("retrying publish for {} in {delay:?}", self.key);
                Some(Instant::now() + delay)
            } else {
                retry.reset();
                None
            };
        }
    }

    async fn handle(&mut self, step: Step) -> Result<(), ConsumerClosed> {
        match step {
            Step::Apply(event) => self.apply(event).await,
            Step::Retry => self.publish().await,
        }
    }

    /// Applies one snapshot event and publishes the result if it changed.
    async fn apply(&mut self, event: ChangeEvent) -> Result<(), ConsumerClosed> {
        let snapshot = match event {
            ChangeEvent::Added(snapshot) | ChangeEvent::Modified(snapshot) => snapshot,
            ChangeEvent::Deleted(_) if self.options.delete_policy == DeletePolicy::Retain => {
                tracing::debug!("endpoints for {} deleted, keeping last addresses", self.key);
                return Ok(());
            }
            ChangeEvent::Deleted(snapshot) => {
                tracing::debug!("endpoints for {} deleted", self.key);
                Snapshot {
                    resource_version: snapshot.resource_version,
                    groups: Vec::new(),
                }
            }
            ChangeEvent::Error(_) => return Ok(()),
        };

        let delta = diff(&self.current, &snapshot, &self.target);

        for address in &delta.added {
            tracing::debug!("adding endpoint: {}", address.addr);
        }

        for addr in &delta.removed {
            tracing::debug!("removing endpoint: {addr}");
        }

        if delta.skipped_groups > 0 {
            tracing::warn!(
                "{} endpoint group(s) of {} have no usable port",
                delta.skipped_groups,
                self.key
            );
        }

        self.gauges.endpoints.set(snapshot.groups.len());
        self.gauges.addresses.set(delta.next.len());
        self.gauges.skipped_groups.set(delta.skipped_groups);

        self.stale |= delta.is_changed();
        self.current = delta.next;

        if self.stale {
            self.publish().await?;
        }

        tracing::debug!(
            "Kubernetes discovery: {} endpoints for {} at version {:?}",
            self.current.len(),
            self.key,
            snapshot.resource_version
        );

        Ok(())
    }

    /// Hands the complete current list to the consumer.
    async fn publish(&mut self) -> Result<(), ConsumerClosed> {
        let addresses = self.current.values().cloned().collect();

        match tokio::time::timeout(self.options.publish_timeout, self.sink.publish(addresses)).await
        {
            Ok(Ok(())) => {
                self.stale = false;
                self.addresses.store(self.current.len(), Ordering::Relaxed);
                Ok(())
            }

            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    "consumer did not accept addresses for {} within {:?}",
                    self.key,
                    self.options.publish_timeout
                );
                Ok(())
            }
        }
    }

    fn set_state(&self, state: ResolverState) {
        self.state.send_replace(state);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    } else {
        future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

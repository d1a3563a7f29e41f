//! Sliding-window throttle rules.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::request::Parts;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::classify::Classifier;
use super::clock::{Clock, SystemClock};
use super::store::EventStore;
use crate::error::{Result, TurnstileError};

/// Default delay between eviction passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A single admission rule evaluated by a [`ThrottleChain`](super::ThrottleChain).
#[async_trait]
pub trait ThrottleRule: Send + Sync + Debug {
    /// Storage key this rule counts events under.
    fn prefix(&self) -> &str;

    /// Whether the request should be rejected.
    ///
    /// Requests the rule does not classify are never throttled. Storage
    /// errors are returned as-is; the caller decides the failure policy.
    async fn should_throttle(&self, request: &Parts) -> Result<bool>;

    /// Record an event for this rule's key.
    ///
    /// The classifier is not consulted: every request handed to this method
    /// is recorded.
    async fn append_event(&self, request: &Parts) -> Result<()>;

    /// Stop any background work owned by the rule.
    async fn shutdown(&self) {}
}

/// Handle to a running eviction loop.
struct CleanupTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Rejects classified requests once more than `threshold` events were
/// recorded under `prefix` within the trailing `window`.
///
/// Owns a background task that periodically evicts events older than the
/// window. The task stops on [`ThrottleRule::shutdown`], or is aborted when
/// the rule is dropped.
pub struct WindowRule {
    prefix: String,
    window: Duration,
    threshold: u64,
    classify: Classifier,
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    cleanup_interval: Duration,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl Debug for WindowRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowRule")
            .field("prefix", &self.prefix)
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("classify", &self.classify)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

/// Builder for [`WindowRule`].
pub struct WindowRuleBuilder {
    prefix: String,
    window: Duration,
    threshold: u64,
    store: Arc<dyn EventStore>,
    classify: Classifier,
    clock: Arc<dyn Clock>,
    cleanup_interval: Duration,
}

impl WindowRuleBuilder {
    /// Restrict the rule to requests matching `classify`.
    pub fn classify(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    /// Clock used to stamp events and compute eviction cutoffs. Must be the
    /// clock the store evaluates windows with.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delay between eviction passes.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Validate the settings and start the rule's eviction task.
    ///
    /// Fails if called outside a tokio runtime.
    pub fn build(self) -> Result<WindowRule> {
        if self.prefix.is_empty() {
            return Err(TurnstileError::Config("rule prefix must not be empty".to_string()));
        }
        if self.window.is_zero() {
            return Err(TurnstileError::Config(format!(
                "rule '{}' window must be greater than 0",
                self.prefix
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(TurnstileError::Config(format!(
                "rule '{}' cleanup interval must be greater than 0",
                self.prefix
            )));
        }

        let runtime = Handle::try_current().map_err(|_| {
            TurnstileError::Config(format!(
                "rule '{}' must be built inside a tokio runtime",
                self.prefix
            ))
        })?;

        let rule = WindowRule {
            prefix: self.prefix,
            window: self.window,
            threshold: self.threshold,
            classify: self.classify,
            store: self.store,
            clock: self.clock,
            cleanup_interval: self.cleanup_interval,
            cleanup: Mutex::new(None),
        };
        rule.start_cleanup(&runtime);

        info!(
            prefix = %rule.prefix,
            window = ?rule.window,
            threshold = rule.threshold,
            classify = %rule.classify.description(),
            "Throttle rule started"
        );
        Ok(rule)
    }
}

impl WindowRule {
    /// Start building a rule. Defaults: matches every request, system clock,
    /// one-minute eviction interval.
    pub fn builder(
        prefix: impl Into<String>,
        window: Duration,
        threshold: u64,
        store: Arc<dyn EventStore>,
    ) -> WindowRuleBuilder {
        WindowRuleBuilder {
            prefix: prefix.into(),
            window,
            threshold,
            store,
            classify: Classifier::always(),
            clock: SystemClock::shared(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Shorthand for a rule with a classifier and otherwise default settings.
    pub fn new(
        prefix: impl Into<String>,
        window: Duration,
        threshold: u64,
        classify: Classifier,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        Self::builder(prefix, window, threshold, store)
            .classify(classify)
            .build()
    }

    /// Trailing window the rule counts events over.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Events tolerated within the window before requests are rejected.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether the eviction task is still attached to this rule.
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    fn start_cleanup(&self, runtime: &Handle) {
        let (stop, mut stopped) = watch::channel(false);
        let prefix = self.prefix.clone();
        let window = self.window;
        let interval = self.cleanup_interval;
        let store = self.store.clone();
        let clock = self.clock.clone();

        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    // Also fires if the sender is gone.
                    _ = stopped.changed() => break,
                }

                // Nothing can be older than the window yet.
                let Some(cutoff) = clock.now().checked_sub(window) else {
                    continue;
                };

                match store.clean(&prefix, cutoff).await {
                    Ok(()) => trace!(prefix = %prefix, "Evicted stale events"),
                    Err(e) => warn!(prefix = %prefix, error = %e, "Failed to evict stale events"),
                }
            }
        });

        *self.cleanup.lock() = Some(CleanupTask { stop, handle });
    }
}

impl Drop for WindowRule {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.handle.abort();
        }
    }
}

#[async_trait]
impl ThrottleRule for WindowRule {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn should_throttle(&self, request: &Parts) -> Result<bool> {
        if !self.classify.matches(request) {
            trace!(prefix = %self.prefix, path = %request.uri.path(), "Request not classified");
            return Ok(false);
        }

        let count = self.store.events_in_duration(&self.prefix, self.window).await?;
        let throttle = count > self.threshold;

        trace!(
            prefix = %self.prefix,
            count = count,
            threshold = self.threshold,
            throttle = throttle,
            "Evaluated throttle rule"
        );
        Ok(throttle)
    }

    async fn append_event(&self, _request: &Parts) -> Result<()> {
        self.store.append_event(&self.prefix, self.clock.now()).await
    }

    /// Stop the eviction task and wait for it to exit.
    async fn shutdown(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(prefix = %self.prefix, error = %e, "Eviction task panicked");
                }
            }
            debug!(prefix = %self.prefix, "Eviction task stopped");
        }
    }
}

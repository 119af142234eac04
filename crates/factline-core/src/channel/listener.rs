//! The long-lived notification listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::NotificationConfig;
use crate::signal::{channel_names, ChangeBus, ChangeSignal, RawNotification};

use super::compaction::compact;
use super::metrics::ChannelMetrics;
use super::pubsub::{PubSubConnection, PubSubConnector};
use super::ChannelError;

/// Listens on the store's publish/subscribe primitive and republishes
/// decoded, compacted signals on a [`ChangeBus`].
///
/// Exactly one background task per instance owns the connection.
///
/// # Example
///
/// ```rust,ignore
/// let channel = NotificationChannel::new(connector, bus, config.notification);
/// channel.start().await?;
/// // ...
/// channel.stop().await;
/// ```
pub struct NotificationChannel {
    connector: Arc<dyn PubSubConnector>,
    bus: Arc<dyn ChangeBus>,
    config: NotificationConfig,
    metrics: Arc<ChannelMetrics>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    subscribed: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationChannel {
    /// Creates a stopped channel.
    #[must_use]
    pub fn new(
        connector: Arc<dyn PubSubConnector>,
        bus: Arc<dyn ChangeBus>,
        config: NotificationConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (subscribed, _) = watch::channel(false);
        Self {
            connector,
            bus,
            config,
            metrics: Arc::new(ChannelMetrics::new()),
            running: AtomicBool::new(false),
            shutdown,
            subscribed: Arc::new(subscribed),
            task: Mutex::new(None),
        }
    }

    /// Returns the channel's counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    /// Returns `true` between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns `true` while a connection is established and subscribed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Spawns the listener task and waits up to `startup_grace` for the
    /// first successful subscription. Not being subscribed by then is
    /// logged; the task keeps retrying in the background.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::AlreadyStarted` if the channel is running.
    pub async fn start(&self) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyStarted);
        }
        self.shutdown.send_replace(false);

        let worker = Listener {
            connector: Arc::clone(&self.connector),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.subscribe(),
            subscribed: Arc::clone(&self.subscribed),
        };
        let mut subscribed = self.subscribed.subscribe();
        *self.task.lock() = Some(tokio::spawn(worker.run()));

        match tokio::time::timeout(self.config.startup_grace, subscribed.wait_for(|s| *s)).await {
            Ok(Ok(_)) => tracing::info!("notification channel started"),
            _ => tracing::warn!(
                grace = ?self.config.startup_grace,
                "notification channel not subscribed within grace period, retrying in background"
            ),
        }
        Ok(())
    }

    /// Stops the listener and waits for its task to finish. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "notification listener task failed");
            }
        }
        self.subscribed.send_replace(false);
        tracing::info!("notification channel stopped");
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationChannel")
            .field("running", &self.is_running())
            .field("subscribed", &self.is_subscribed())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Listener task
// ---------------------------------------------------------------------------

struct Listener {
    connector: Arc<dyn PubSubConnector>,
    bus: Arc<dyn ChangeBus>,
    config: NotificationConfig,
    metrics: Arc<ChannelMetrics>,
    shutdown: watch::Receiver<bool>,
    subscribed: Arc<watch::Sender<bool>>,
}

impl Listener {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // A session only ends without error on shutdown.
            let result = self.session().await;
            match result {
                Ok(()) => break,
                Err(e) if !self.session_failed(&e) => break,
                Err(_) => {}
            }
            self.subscribed.send_replace(false);

            let backoff = self.config.reconnect_backoff;
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.subscribed.send_replace(false);
        tracing::debug!("notification listener exiting");
    }

    /// Records a failed session. Returns `false` if shutdown was already
    /// requested, in which case the error is swallowed.
    fn session_failed(&self, e: &ChannelError) -> bool {
        if *self.shutdown.borrow() {
            tracing::debug!(error = %e, "ignoring notification error after stop");
            return false;
        }
        self.metrics.record_connection_error();
        tracing::warn!(
            error = %e,
            backoff = ?self.config.reconnect_backoff,
            "notification connection lost, reconnecting"
        );
        true
    }

    async fn session(&mut self) -> Result<(), ChannelError> {
        let mut conn = tokio::select! {
            conn = self.connector.connect() => conn?,
            _ = self.shutdown.changed() => return Ok(()),
        };
        let result = self.listen(conn.as_mut()).await;
        conn.close().await;
        result
    }

    async fn listen(
        &mut self,
        conn: &mut dyn PubSubConnection,
    ) -> Result<(), ChannelError> {
        conn.subscribe(&channel_names::ALL).await?;
        self.metrics.record_connected();
        tracing::info!(
            channels = channel_names::ALL.len(),
            "listening for store notifications"
        );

        // Anything may have happened while disconnected.
        for signal in [
            ChangeSignal::catch_up(),
            ChangeSignal::BlacklistChanged,
            ChangeSignal::any_schema_changed(),
        ] {
            self.bus.publish(signal);
        }
        self.metrics.record_published(3);
        self.subscribed.send_replace(true);

        let receive_timeout = self.config.receive_timeout;
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                batch = conn.receive(receive_timeout) => batch?,
            };

            if batch.is_empty() {
                self.health_check(conn).await?;
            } else {
                self.dispatch(batch);
            }
        }
    }

    /// Sends a round-trip probe and waits for its echo, dispatching any
    /// other notifications that arrive meanwhile.
    async fn health_check(&mut self, conn: &mut dyn PubSubConnection) -> Result<(), ChannelError> {
        let bound = self.config.roundtrip_timeout;
        conn.notify(channel_names::ROUNDTRIP, None).await?;

        let deadline = Instant::now() + bound;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                self.metrics.record_health_check(false);
                return Err(ChannelError::HealthCheck(bound));
            }
            let batch = conn.receive(remaining).await?;
            if self.dispatch(batch) {
                self.metrics.record_health_check(true);
                tracing::trace!("round-trip probe echoed");
                return Ok(());
            }
        }
    }

    /// Decodes, compacts and publishes one batch. Returns `true` if it
    /// contained a round-trip echo.
    fn dispatch(&self, batch: Vec<RawNotification>) -> bool {
        if batch.is_empty() {
            return false;
        }
        let received = batch.len();
        let mut echoed = false;
        let mut dropped = 0;
        let mut signals = Vec::with_capacity(received);

        for raw in &batch {
            match ChangeSignal::from_notification(raw) {
                Some(ChangeSignal::RoundTrip) => echoed = true,
                Some(signal) => signals.push(signal),
                None => {
                    dropped += 1;
                    tracing::warn!(
                        channel = %raw.channel,
                        payload = ?raw.payload,
                        "dropping undecodable notification"
                    );
                }
            }
        }
        self.metrics.record_batch(received, dropped);

        let signals = compact(signals);
        tracing::debug!(received, published = signals.len(), "dispatching notification batch");
        self.metrics.record_published(signals.len());
        for signal in signals {
            tracing::trace!(signal = %signal, "publishing change signal");
            self.bus.publish(signal);
        }
        echoed
    }
}

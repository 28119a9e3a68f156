//! Channel-driven background loops.
//!
//! Queue listeners, task schedulers and task consumers all share one shape:
//! subscribe to a pub/sub channel, do a catch-up pass once subscribed, react
//! to each message, and wake up at the nearest known deadline. [`Driver`]
//! owns that loop; a [`ChannelHandler`] supplies the behavior.
//!
//! # Features
//!
//! - One pending wake-up per loop, kept at the earliest requested deadline
//! - Automatic resubscription after a lost subscription
//! - Graceful stop through a broadcast channel (also on handle drop)

use std::future::pending;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::Subscription;
use crate::utils::{deadline_after, now_millis};

/// Deadlines this close to now fire immediately instead of sleeping.
pub const IMMEDIATE_WINDOW_MS: i64 = 10;

/// Wait before retrying a failed subscription.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Wait before retrying a sweep that failed.
pub const SWEEP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Single pending wake-up of a driver loop.
///
/// Arming with a later deadline than the pending one is a no-op, so a burst
/// of notifications can never push a due sweep into the future.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WakeTimer {
    deadline: Option<i64>,
}

impl WakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a wake-up at `at` (epoch millis).
    ///
    /// Returns `true` if this replaced the pending deadline.
    pub fn arm(&mut self, at: i64) -> bool {
        match self.deadline {
            Some(current) if current <= at => false,
            _ => {
                self.deadline = Some(at);
                true
            }
        }
    }

    /// Requests a wake-up `after` from now.
    pub fn arm_after(&mut self, after: Duration) -> bool {
        self.arm(deadline_after(after))
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// Resolves when the pending deadline is reached; never resolves while
    /// nothing is armed.
    pub async fn wait(&self) {
        let Some(at) = self.deadline else {
            return pending().await;
        };
        let delay = at.saturating_sub(now_millis());
        if delay > IMMEDIATE_WINDOW_MS {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
    }
}

/// Behavior plugged into a [`Driver`].
#[async_trait]
pub trait ChannelHandler: Send + 'static {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Opens the subscription this handler listens on.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;

    /// Catch-up pass, run after every (re)subscription.
    async fn on_subscribe(&mut self, timer: &mut WakeTimer);

    async fn on_message(&mut self, payload: &str, timer: &mut WakeTimer);

    /// Runs when the armed deadline is reached. The timer is already cleared.
    async fn on_wake(&mut self, timer: &mut WakeTimer);
}

/// A channel loop that has not been started yet.
pub struct Driver {
    handler: Box<dyn ChannelHandler>,
}

impl Driver {
    pub fn new(handler: impl ChannelHandler) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Spawns the loop onto the current Tokio runtime.
    pub fn start(self) -> DriverHandle {
        let name = self.handler.name().to_string();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(self.handler, shutdown_rx));
        DriverHandle {
            name,
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running [`Driver`]. Dropping it stops the loop.
#[derive(Debug)]
pub struct DriverHandle {
    name: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl DriverHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the loop to stop. It exits at its next await point and drops
    /// its subscription.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(driver = %self.name, error = %e, "Driver task ended abnormally");
        }
    }
}

async fn run(mut handler: Box<dyn ChannelHandler>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut timer = WakeTimer::new();
    info!(driver = %handler.name(), "Driver started");

    loop {
        let subscribed = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = handler.subscribe() => result,
        };

        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(
                    driver = %handler.name(),
                    error = %e,
                    "Subscription failed, retrying in {:?}",
                    RESUBSCRIBE_DELAY
                );
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                }
            }
        };

        debug!(
            driver = %handler.name(),
            channel = %subscription.channel(),
            "Subscribed"
        );
        handler.on_subscribe(&mut timer).await;

        let stopped = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break true,
                message = subscription.recv() => match message {
                    Some(payload) => handler.on_message(&payload, &mut timer).await,
                    None => {
                        warn!(driver = %handler.name(), "Subscription lost, resubscribing");
                        break false;
                    }
                },
                _ = timer.wait() => {
                    timer.clear();
                    handler.on_wake(&mut timer).await;
                }
            }
        };

        if stopped {
            break;
        }
    }

    info!(driver = %handler.name(), "Driver stopped");
}

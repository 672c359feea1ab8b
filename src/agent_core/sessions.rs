//! Stream lifecycle registry.
//!
//! Tracks every in-flight stream by channel id with its cancellation token and
//! activity timestamps. Cancelling, re-registering, or sweeping an entry
//! triggers its token, which the orchestration loop observes before the next
//! token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default age after which an idle stream is swept.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct StreamSession {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    last_activity: Instant,
    cycle_count: u32,
}

/// Table of in-flight streams keyed by channel id.
#[derive(Default)]
pub struct StreamRegistry {
    sessions: Mutex<HashMap<String, StreamSession>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a stream and return its cancellation token.
    ///
    /// An existing entry with the same id is cancelled and replaced.
    pub fn register(&self, channel_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let previous = self.lock().insert(
            channel_id.to_string(),
            StreamSession {
                cancel: cancel.clone(),
                started_at: Utc::now(),
                last_activity: Instant::now(),
                cycle_count: 0,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(channel_id = channel_id, "replacing active stream");
            previous.cancel.cancel();
        }
        cancel
    }

    /// Bump the last-activity time.
    pub fn touch(&self, channel_id: &str) {
        if let Some(session) = self.lock().get_mut(channel_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Count one tool cycle and return the new total (0 if not registered).
    pub fn record_cycle(&self, channel_id: &str) -> u32 {
        match self.lock().get_mut(channel_id) {
            Some(session) => {
                session.cycle_count += 1;
                session.last_activity = Instant::now();
                session.cycle_count
            }
            None => 0,
        }
    }

    /// Cancel and remove a stream. Returns whether one existed.
    pub fn cancel(&self, channel_id: &str) -> bool {
        match self.lock().remove(channel_id) {
            Some(session) => {
                session.cancel.cancel();
                tracing::info!(channel_id = channel_id, "stream cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel and remove every stream. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, StreamSession)> = self.lock().drain().collect();
        for (_, session) in &drained {
            session.cancel.cancel();
        }
        drained.len()
    }

    /// Remove a finished stream without cancelling it.
    pub fn complete(&self, channel_id: &str) {
        self.lock().remove(channel_id);
    }

    /// Cancel and remove every stream idle for at least `max_age`.
    ///
    /// Returns the swept channel ids.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.cancel.cancel();
                tracing::warn!(
                    channel_id = %id,
                    started_at = %session.started_at,
                    cycles = session.cycle_count,
                    "stale stream swept"
                );
            }
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = registry.sweep_expired(max_age);
                        if !swept.is_empty() {
                            tracing::info!(count = swept.len(), "sweeper removed stale streams");
                        }
                    }
                }
            }
            tracing::debug!("stream sweeper stopped");
        })
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        self.lock().contains_key(channel_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

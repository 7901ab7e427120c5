use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use serde_json::Value;

use crate::clock::Clock;
use crate::errors::{CreditsError, Result};
use crate::models::throttle::RateWindow;
use crate::repositories::store::{check_segment, decode, encode, paths, Apply, DocumentStore, StoreError};
use crate::settings;

/// Expired windows are swept from memory once every this many checks.
const SWEEP_EVERY: u64 = 1024;

#[derive(Default)]
struct MemoryWindows {
    windows: DashMap<String, RateWindow>,
    checks: AtomicU64,
}

#[derive(Clone)]
enum Windows {
    Memory(Arc<MemoryWindows>),
    Store(Arc<dyn DocumentStore>),
}

/// Fixed-window, per-user admission control for paid routes.
#[derive(Clone)]
pub struct RequestThrottle {
    windows: Windows,
    clock: Arc<dyn Clock>,
    window: Duration,
    max_requests: u32,
}

impl RequestThrottle {
    pub fn in_memory(clock: Arc<dyn Clock>, window: Duration, max_requests: u32) -> Self {
        Self {
            windows: Windows::Memory(Arc::new(MemoryWindows::default())),
            clock,
            window,
            max_requests,
        }
    }

    /// Keeps windows in the document store so several processes share them.
    pub fn with_store(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        window: Duration,
        max_requests: u32,
    ) -> Self {
        Self {
            windows: Windows::Store(store),
            clock,
            window,
            max_requests,
        }
    }

    pub fn from_settings(
        config: &settings::Throttle,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, config::ConfigError> {
        let window = config.window()?;
        Ok(match config.backend {
            settings::ThrottleBackend::Memory => Self::in_memory(clock, window, config.max_requests),
            settings::ThrottleBackend::Store => {
                Self::with_store(store, clock, window, config.max_requests)
            }
        })
    }

    /// Admits or denies one request. Unauthenticated callers are never
    /// counted here; their routes reject them on their own.
    pub async fn allow(&self, user_id: Option<&str>) -> Result<()> {
        let Some(user_id) = user_id else {
            return Ok(());
        };

        let admitted = match &self.windows {
            Windows::Memory(windows) => self.admit_in_memory(windows, user_id),
            Windows::Store(store) => self.admit_in_store(store.as_ref(), user_id).await?,
        };

        if admitted {
            Ok(())
        } else {
            log::warn!("Rate limit exceeded for {}.", user_id);
            Err(CreditsError::RateLimited {
                user_id: user_id.to_string(),
            })
        }
    }

    fn admit_in_memory(&self, memory: &MemoryWindows, user_id: &str) -> bool {
        let now = self.clock.now();
        let admitted = {
            // The entry guard holds the shard lock until the decision is stored.
            let mut entry = memory
                .windows
                .entry(user_id.to_string())
                .or_insert_with(|| RateWindow {
                    count: 0,
                    window_start: now,
                });
            match RateWindow::admit(Some(entry.value()), now, self.window, self.max_requests) {
                Some(next) => {
                    *entry = next;
                    true
                }
                None => false,
            }
        };

        if memory.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_expired(memory);
        }
        admitted
    }

    /// Drops windows that have fully elapsed. A dropped window behaves exactly
    /// like one that was never opened.
    fn sweep_expired(&self, memory: &MemoryWindows) {
        let now = self.clock.now();
        let before = memory.windows.len();
        memory
            .windows
            .retain(|_, window| !window.expired(now, self.window));
        log::debug!(
            "Swept {} expired rate windows.",
            before.saturating_sub(memory.windows.len())
        );
    }

    #[cfg(test)]
    fn tracked_windows(&self) -> usize {
        match &self.windows {
            Windows::Memory(memory) => memory.windows.len(),
            Windows::Store(_) => 0,
        }
    }

    async fn admit_in_store(&self, store: &dyn DocumentStore, user_id: &str) -> Result<bool> {
        check_segment(user_id)?;
        let now = self.clock.now();
        let path = paths::rate_window(user_id);

        let apply = |values: &[Option<Value>]| -> std::result::Result<Apply, StoreError> {
            let current: Option<RateWindow> = decode(&path, values[0].as_ref())?;
            match RateWindow::admit(current.as_ref(), now, self.window, self.max_requests) {
                Some(next) => Ok(Apply::Commit(vec![Some(encode(&path, &next)?)])),
                None => Ok(Apply::Abort),
            }
        };

        Ok(store.compare_and_apply(&path, &apply).await?.is_committed())
    }
}

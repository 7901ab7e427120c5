use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-window request counter for one user.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl RateWindow {
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start > window
    }

    /// Advances the window for one request. Returns `None` when the request
    /// must be denied; the stored window is left as it was in that case.
    pub fn admit(
        current: Option<&RateWindow>,
        now: DateTime<Utc>,
        window: Duration,
        max_requests: u32,
    ) -> Option<RateWindow> {
        match current {
            None => Some(RateWindow::open(now)),
            Some(w) if w.expired(now, window) => Some(RateWindow::open(now)),
            Some(w) if w.count >= max_requests => None,
            Some(w) => Some(RateWindow {
                count: w.count + 1,
                window_start: w.window_start,
            }),
        }
    }
}

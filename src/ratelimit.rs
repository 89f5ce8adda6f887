use dashmap::DashMap;

use crate::model::Ms;

/// Fixed-window request counter keyed by caller. Windows are pruned by the
/// sweeper so idle keys do not accumulate.
pub struct RateLimiter {
    limit: u32,
    window_ms: Ms,
    windows: DashMap<String, Window>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Ms,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window_ms: Ms) -> Self {
        Self {
            limit,
            window_ms,
            windows: DashMap::new(),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, 60_000)
    }

    /// Count one request for `key`; false when the key is over its limit.
    /// A limit of zero disables limiting.
    pub fn check(&self, key: &str, now: Ms) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - window.started_at >= self.window_ms {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have ended. Returns how many were removed.
    pub fn prune(&self, now: Ms) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now - w.started_at < self.window_ms);
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

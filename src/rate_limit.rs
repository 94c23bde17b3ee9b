// 🚦 Per-client rate limiter
// Sliding window of request timestamps per client key, in memory

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    burst: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(burst: usize, window: Duration) -> Self {
        RateLimiter {
            burst: burst.max(1),
            window: window.max(Duration::from_secs(1)),
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `client` at `now`. Returns false when the client
    /// already made `burst` requests within the window.
    pub fn check_at(&self, client: &str, now: Instant) -> bool {
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = self.window;
        let entries = hits.entry(client.to_string()).or_default();
        while let Some(&oldest) = entries.front() {
            if now.duration_since(oldest) > window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.burst {
            return false;
        }

        entries.push_back(now);
        true
    }

    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    /// Drop clients with no hits inside the window
    pub fn prune(&self, now: Instant) {
        let window = self.window;
        if let Ok(mut hits) = self.hits.lock() {
            hits.retain(|_, entries| {
                entries
                    .back()
                    .is_some_and(|&last| now.duration_since(last) <= window)
            });
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.hits.lock().map(|h| h.len()).unwrap_or(0)
    }
}

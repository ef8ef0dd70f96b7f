use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

// Admitted-request timestamps for one client, oldest first
pub struct ClientWindow {
    timestamps: VecDeque<Instant>,
}

impl ClientWindow {
    // grows with admissions; `max_requests` only bounds the length
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// `retry_after` is how long until the oldest counted request leaves the window.
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Per-client sliding-window rate limiter.
///
/// Each client may be admitted at most `max_requests` times within any trailing
/// `window`. Windows are created on first sight of a client and pruned only when
/// that client calls again.
pub struct RateLimiter {
    windows: DashMap<String, ClientWindow>,
    enabled: bool,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            enabled,
            max_requests,
            window,
        }
    }

    pub fn admit(&self, client_id: &str) -> Admission {
        self.admit_at(client_id, Instant::now())
    }

    pub fn admit_at(&self, client_id: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Accepted;
        }

        // the entry guard holds the shard lock, so prune/check/append is atomic per client
        let mut entry = self
            .windows
            .entry(client_id.to_string())
            .or_insert_with(ClientWindow::new);
        let timestamps = &mut entry.timestamps;

        // strictly older than the window falls out, exactly `window` old still counts
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_requests {
            let retry_after = timestamps
                .front()
                .map(|oldest| self.window - now.saturating_duration_since(*oldest))
                .unwrap_or(self.window);
            return Admission::Rejected { retry_after };
        }

        timestamps.push_back(now);
        Admission::Accepted
    }

    // Number of clients with a window (for the metrics gauge)
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn window_len(&self, client_id: &str) -> usize {
        self.windows.get(client_id).map(|w| w.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const W: Duration = Duration::from_secs(10);

    #[test]
    fn burst_then_reject_then_recover() {
        let limiter = RateLimiter::new(true, 5, W);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(limiter.admit_at("10.0.0.1", t0).is_accepted());
        }
        assert!(!limiter.admit_at("10.0.0.1", t0).is_accepted());
        // rejected attempts are not recorded
        assert_eq!(limiter.window_len("10.0.0.1"), 5);

        let later = t0 + W + Duration::from_millis(1);
        assert!(limiter.admit_at("10.0.0.1", later).is_accepted());
        assert_eq!(limiter.window_len("10.0.0.1"), 1);
    }

    #[test]
    fn timestamp_exactly_window_old_still_counts() {
        let limiter = RateLimiter::new(true, 1, W);
        let t0 = Instant::now();

        assert!(limiter.admit_at("c", t0).is_accepted());
        assert!(!limiter.admit_at("c", t0 + W).is_accepted());
        assert!(limiter.admit_at("c", t0 + W + Duration::from_nanos(1)).is_accepted());
    }

    #[test]
    fn rejection_reports_time_until_oldest_expires() {
        let limiter = RateLimiter::new(true, 2, W);
        let t0 = Instant::now();
        limiter.admit_at("c", t0);
        limiter.admit_at("c", t0 + Duration::from_secs(4));

        match limiter.admit_at("c", t0 + Duration::from_secs(6)) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(4));
            }
            Admission::Accepted => panic!("third request inside the window was admitted"),
        }
    }

    #[test]
    fn clients_are_limited_independently() {
        let limiter = RateLimiter::new(true, 1, W);
        let t0 = Instant::now();

        assert!(limiter.admit_at("a", t0).is_accepted());
        assert!(limiter.admit_at("b", t0).is_accepted());
        assert!(!limiter.admit_at("a", t0).is_accepted());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn disabled_limiter_admits_everything_and_tracks_nothing() {
        let limiter = RateLimiter::new(false, 1, W);
        let t0 = Instant::now();

        for _ in 0..10_000 {
            assert!(limiter.admit_at("flood", t0).is_accepted());
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn window_never_holds_more_than_capacity() {
        let limiter = RateLimiter::new(true, 3, Duration::from_secs(5));
        let t0 = Instant::now();
        let mut admitted: Vec<Instant> = Vec::new();

        // irregular arrivals every 700ms over 30s
        for step in 0..43u64 {
            let now = t0 + Duration::from_millis(step * 700);
            if limiter.admit_at("c", now).is_accepted() {
                admitted.push(now);
            }
            let in_window = admitted
                .iter()
                .filter(|t| now.saturating_duration_since(**t) <= Duration::from_secs(5))
                .count();
            assert!(in_window <= 3, "{in_window} admissions inside the window at step {step}");
            assert!(limiter.window_len("c") <= 3);
        }
        assert!(admitted.len() > 3);
    }

    #[test]
    fn huge_limit_does_not_reserve_memory_up_front() {
        let limiter = RateLimiter::new(true, u32::MAX as usize, W);
        let t0 = Instant::now();

        for i in 0..50 {
            let client = format!("10.0.1.{i}");
            assert!(limiter.admit_at(&client, t0).is_accepted());
            let window = limiter.windows.get(&client).unwrap();
            assert_eq!(window.len(), 1);
            assert!(window.timestamps.capacity() < 64, "capacity {}", window.timestamps.capacity());
        }
        assert_eq!(limiter.tracked_clients(), 50);
    }

    #[test]
    fn concurrent_callers_cannot_exceed_capacity() {
        let limiter = Arc::new(RateLimiter::new(true, 50, Duration::from_secs(60)));
        let accepted = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if limiter.admit_at("shared", now).is_accepted() {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::Relaxed), 50);
    }
}

//! # Rate Limiter
//! Global cap on outbound inference calls: at most `limit` acquisitions in any
//! span of `window`. Acquisition times live in a rolling buffer, so the bound
//! holds for every window, not just aligned ones. Exhaustion is reported, never
//! waited out.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};

#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Inner>,
    limit: u32,
    window: Duration,
}

#[derive(Debug)]
struct Inner {
    /// Granted acquisitions, oldest at the front.
    granted: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    /// `limit` is raised to 1 and `window` to one second if smaller.
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Mutex::new(Inner {
                granted: VecDeque::with_capacity(limit as usize),
            }),
            limit,
            window: window.max(Duration::from_secs(1)),
        }
    }

    /// Convenience constructor for `limit` calls per minute.
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Utc::now())
    }

    /// Take one unit of budget as of `now`; `false` when the window is full.
    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> bool {
        let mut g = self.lock();
        evict(&mut g.granted, now, self.window);
        if g.granted.len() as u32 >= self.limit {
            return false;
        }
        g.granted.push_back(now);
        true
    }

    /// Budget left as of `now`.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u32 {
        let mut g = self.lock();
        evict(&mut g.granted, now, self.window);
        self.limit.saturating_sub(g.granted.len() as u32)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining_at(Utc::now())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Drop grants that no longer fall inside `(now - window, now]`.
fn evict(buf: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let Some(cutoff) = now.checked_sub_signed(window) else {
        return;
    };
    while let Some(&t) = buf.front() {
        if t <= cutoff {
            buf.pop_front();
        } else {
            break;
        }
    }
}

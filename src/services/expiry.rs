//! Expiry resolution and the expired/live test.
//!
//! `expires_in_days = 0` requests a one-time link: the object is consumed by
//! its first successful download. One-time objects still get a time backstop
//! of `default_days`, so links that are never opened are reclaimed too.

use crate::models::StoredObject;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};

/// Source of "now". Production uses [`SystemClock`]; tests move time by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of resolving a requested day-count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedExpiry {
    /// Days actually applied after clamping.
    pub days: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    default_days: u32,
    max_days: u32,
}

impl ExpiryPolicy {
    /// `default_days` is capped at `max_days`.
    pub fn new(default_days: u32, max_days: u32) -> Self {
        Self {
            default_days: default_days.min(max_days),
            max_days,
        }
    }

    pub fn default_days(&self) -> u32 {
        self.default_days
    }

    pub fn max_days(&self) -> u32 {
        self.max_days
    }

    /// Clamp `requested` to `[0, max_days]` (omitted means `default_days`)
    /// and compute the expiry relative to `now`.
    pub fn resolve(&self, requested: Option<i64>, now: DateTime<Utc>) -> ResolvedExpiry {
        let days = match requested {
            None => self.default_days,
            Some(d) => d.clamp(0, i64::from(self.max_days)) as u32,
        };

        if days == 0 {
            let backstop = self.default_days.max(1);
            return ResolvedExpiry {
                days,
                expires_at: Some(now + Duration::days(i64::from(backstop))),
                one_time: true,
            };
        }

        ResolvedExpiry {
            days,
            expires_at: Some(now + Duration::days(i64::from(days))),
            one_time: false,
        }
    }

    /// Expired once `now` reaches `expires_at`, or once a one-time object has
    /// been downloaded.
    pub fn is_expired(object: &StoredObject, now: DateTime<Utc>) -> bool {
        if object.one_time && object.download_count >= 1 {
            return true;
        }
        matches!(object.expires_at, Some(at) if now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn object(expires_at: Option<DateTime<Utc>>, one_time: bool, downloads: i64) -> StoredObject {
        let created_at = Utc::now() - Duration::days(1);
        StoredObject {
            id: Uuid::new_v4(),
            token: "tok".into(),
            original_name: "a.txt".into(),
            content_type: "text/plain".into(),
            storage_key: "k".into(),
            size_bytes: 1,
            etag: None,
            created_at,
            expires_at,
            one_time,
            download_count: downloads,
        }
    }

    #[test]
    fn omitted_days_use_the_default() {
        let now = Utc::now();
        let resolved = ExpiryPolicy::new(2, 30).resolve(None, now);
        assert_eq!(resolved.days, 2);
        assert_eq!(resolved.expires_at, Some(now + Duration::days(2)));
        assert!(!resolved.one_time);
    }

    #[test]
    fn requested_days_are_clamped_to_the_maximum() {
        let now = Utc::now();
        let resolved = ExpiryPolicy::new(2, 30).resolve(Some(400), now);
        assert_eq!(resolved.days, 30);
        assert_eq!(resolved.expires_at, Some(now + Duration::days(30)));
    }

    #[test]
    fn zero_and_negative_days_mean_one_time() {
        let now = Utc::now();
        let policy = ExpiryPolicy::new(3, 30);
        for requested in [0, -5] {
            let resolved = policy.resolve(Some(requested), now);
            assert_eq!(resolved.days, 0);
            assert!(resolved.one_time);
            assert_eq!(resolved.expires_at, Some(now + Duration::days(3)));
        }
    }

    #[test]
    fn default_is_capped_by_maximum() {
        let policy = ExpiryPolicy::new(10, 5);
        assert_eq!(policy.default_days(), 5);
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let now = Utc::now();
        assert!(ExpiryPolicy::is_expired(&object(Some(now - Duration::seconds(1)), false, 0), now));
        assert!(ExpiryPolicy::is_expired(&object(Some(now), false, 0), now));
        assert!(!ExpiryPolicy::is_expired(&object(Some(now + Duration::seconds(1)), false, 0), now));
    }

    #[test]
    fn objects_without_expiry_never_expire_by_time() {
        let far_future = Utc::now() + Duration::days(10_000);
        assert!(!ExpiryPolicy::is_expired(&object(None, false, 7), far_future));
    }

    #[test]
    fn one_time_objects_expire_after_first_download() {
        let now = Utc::now();
        let later = Some(now + Duration::days(1));
        assert!(!ExpiryPolicy::is_expired(&object(later, true, 0), now));
        assert!(ExpiryPolicy::is_expired(&object(later, true, 1), now));
        assert!(!ExpiryPolicy::is_expired(&object(later, false, 5), now));
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(25));
        assert_eq!(clock.now(), start + Duration::hours(25));
    }
}

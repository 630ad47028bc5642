//! Advisory-lock client.
//!
//! The recording frontend writes the lock while a live session is being
//! captured; this subsystem only reads it. Two policies apply on top of the
//! raw record:
//!
//! - stale-lock override: a record older than the TTL is treated as not
//!   held (the record itself is left in place — we never write the key);
//! - fail-safe degradation: if the status check itself fails, the result is
//!   "locked", never an optimistic "proceed".

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::markers::{read_marker, MarkerStore, LOCK_KEY};
use crate::model::{LockRecord, LockStatus};

pub struct LockClient<'a> {
    store: &'a dyn MarkerStore,
    ttl: chrono::Duration,
}

impl<'a> LockClient<'a> {
    #[must_use]
    pub fn new(store: &'a dyn MarkerStore, ttl: chrono::Duration) -> Self {
        Self { store, ttl }
    }

    /// Interpret the producer's lock record. Infallible by design: every
    /// failure path degrades to a "locked" status instead of erroring out,
    /// so callers cannot accidentally proceed on an unknown lock state.
    pub fn status(&self, clock: &dyn Clock) -> LockStatus {
        let record: Option<LockRecord> = match read_marker(self.store, LOCK_KEY) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, "lock status check failed; treating as locked");
                return LockStatus {
                    locked: true,
                    holder: None,
                    age_seconds: None,
                    stale: false,
                    degraded: true,
                };
            }
        };

        let Some(record) = record else {
            return LockStatus::unlocked();
        };

        if !record.locked {
            // Frontend explicitly released; record may linger.
            return LockStatus::unlocked();
        }

        let created: Option<DateTime<Utc>> = DateTime::parse_from_rfc3339(&record.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        let Some(created) = created else {
            tracing::warn!(
                timestamp = %record.timestamp,
                "lock record has unparseable timestamp; treating as locked"
            );
            return LockStatus {
                locked: true,
                holder: Some(record.holder),
                age_seconds: None,
                stale: false,
                degraded: true,
            };
        };

        let age = clock.now().signed_duration_since(created);
        if age > self.ttl {
            tracing::info!(
                holder = %record.holder,
                age_seconds = age.num_seconds(),
                ttl_seconds = self.ttl.num_seconds(),
                "lock is stale; overriding"
            );
            return LockStatus {
                locked: false,
                holder: Some(record.holder),
                age_seconds: Some(age.num_seconds()),
                stale: true,
                degraded: false,
            };
        }

        LockStatus {
            locked: true,
            holder: Some(record.holder),
            age_seconds: Some(age.num_seconds()),
            stale: false,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::markers::{write_marker, MemoryMarkerStore};

    struct FrozenClock(DateTime<Utc>);

    impl Clock for FrozenClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }

        fn sleep(&self, _duration: StdDuration) {}
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, 12, 0, 0).unwrap()
    }

    fn ttl_30m() -> chrono::Duration {
        chrono::Duration::minutes(30)
    }

    fn lock_record(age_minutes: i64) -> LockRecord {
        LockRecord {
            locked: true,
            holder: "producerA".to_owned(),
            session_id: Some("live-session".to_owned()),
            timestamp: (now() - chrono::Duration::minutes(age_minutes)).to_rfc3339(),
        }
    }

    #[test]
    fn fresh_lock_is_respected() {
        let store = MemoryMarkerStore::new();
        write_marker(&store, LOCK_KEY, &lock_record(10)).unwrap();

        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert!(status.locked);
        assert!(!status.stale);
        assert_eq!(status.holder.as_deref(), Some("producerA"));
        assert_eq!(status.age_seconds, Some(600));
    }

    #[test]
    fn stale_lock_is_overridden_past_ttl() {
        let store = MemoryMarkerStore::new();
        write_marker(&store, LOCK_KEY, &lock_record(40)).unwrap();

        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert!(!status.locked);
        assert!(status.stale);
        assert_eq!(status.age_seconds, Some(2400));
    }

    #[test]
    fn absent_record_is_unlocked() {
        let store = MemoryMarkerStore::new();
        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert_eq!(status, LockStatus::unlocked());
    }

    #[test]
    fn released_record_is_unlocked() {
        let store = MemoryMarkerStore::new();
        let mut record = lock_record(1);
        record.locked = false;
        write_marker(&store, LOCK_KEY, &record).unwrap();

        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert!(!status.locked);
    }

    #[test]
    fn store_outage_degrades_to_locked() {
        let store = MemoryMarkerStore::new();
        store.fail_reads(true);

        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert!(status.locked);
        assert!(status.degraded);
    }

    #[test]
    fn unparseable_timestamp_degrades_to_locked() {
        let store = MemoryMarkerStore::new();
        let mut record = lock_record(1);
        record.timestamp = "yesterday-ish".to_owned();
        write_marker(&store, LOCK_KEY, &record).unwrap();

        let status = LockClient::new(&store, ttl_30m()).status(&FrozenClock(now()));
        assert!(status.locked);
        assert!(status.degraded);
    }
}

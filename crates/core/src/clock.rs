//! Time sources for scheduled work.
//!
//! Sweeps and the cron scheduler never read wall-clock time directly. They ask
//! a [`Clock`], which lets tests drive them with a [`ManualClock`].

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;

/// A source of the current time that can also wait for a point in time.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current UTC time.
    fn now(&self) -> OffsetDateTime;

    /// Resolve once `now() >= deadline`.
    async fn sleep_until(&self, deadline: OffsetDateTime);
}

/// Wall-clock time backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let remaining = deadline - OffsetDateTime::now_utc();
        if remaining.is_positive() {
            let std_remaining =
                std::time::Duration::try_from(remaining).unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(std_remaining).await;
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<OffsetDateTime>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: OffsetDateTime) {
        self.now.send_replace(at);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: time::Duration) {
        self.now.send_modify(|now| *now += by);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00 UTC));
        clock.advance(time::Duration::days(91));
        assert_eq!(clock.now(), datetime!(2024-04-01 00:00 UTC));
        clock.set(datetime!(2030-06-01 12:00 UTC));
        assert_eq!(clock.now(), datetime!(2030-06-01 12:00 UTC));
    }

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_when_deadline_passes() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-01-01 00:00 UTC)));
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep_until(datetime!(2024-01-01 00:10 UTC)).await;
            })
        };

        clock.advance(time::Duration::minutes(5));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(time::Duration::minutes(5));
        tokio::time::timeout(std::time::Duration::from_secs(5), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn past_deadline_returns_immediately() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        clock.sleep_until(datetime!(2023-01-01 00:00 UTC)).await;
        SystemClock
            .sleep_until(OffsetDateTime::now_utc() - time::Duration::seconds(1))
            .await;
    }
}

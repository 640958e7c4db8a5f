// Time sources for the background jobs.
//
// Jobs never read the wall clock directly; they take a `Clock` for "now" and a
// `Ticker` for "when to run next", so tests can drive them without waiting.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Truncate a timestamp to the start of its hour.
pub fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::hours(1)).unwrap_or(at)
}

/// `YYYY-MM-DDTHH` key of the hour containing `at`.
pub fn hour_key(at: DateTime<Utc>) -> String {
    hour_floor(at).format("%Y-%m-%dT%H").to_string()
}

/// Yields once per scheduled run; `false` means the job should stop.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self) -> bool;
}

pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        // A tick that overruns its period is not interrupted; the next one just starts late.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker fed from a channel: one message per run, closed channel stops the job.
pub struct ChannelTicker {
    rx: mpsc::Receiver<()>,
}

impl ChannelTicker {
    pub fn new() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_key_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 42, 5).unwrap();
        assert_eq!(hour_key(at), "2024-03-09T17");
        assert_eq!(hour_floor(at), Utc.with_ymd_and_hms(2024, 3, 9, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::minutes(90));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 1, 1, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn test_channel_ticker_stops_when_closed() {
        let (tx, mut ticker) = ChannelTicker::new();
        tx.send(()).await.unwrap();
        assert!(ticker.tick().await);
        drop(tx);
        assert!(!ticker.tick().await);
    }
}

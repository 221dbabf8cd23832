use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel a subscriber receives tick times on.
pub type Subscriber = mpsc::Sender<SystemTime>;

struct Ticker {
    subscribers: Arc<parking_lot::Mutex<Vec<Subscriber>>>,
    cancel: CancellationToken,
}

/// Wall-clock aligned tick scheduler.
///
/// One background task per distinct interval `i`: it fires at every UTC
/// epoch second `t` with `t mod i == 0` and fans the tick out to every
/// subscriber without blocking. A subscriber whose channel is full misses
/// that tick; one whose receiver is gone is dropped.
#[derive(Default)]
pub struct Clock {
    tickers: parking_lot::Mutex<HashMap<u64, Ticker>>,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let intervals: Vec<u64> = self.tickers.lock().keys().copied().collect();
        f.debug_struct("Clock").field("intervals", &intervals).finish()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to ticks every `interval` seconds.
    pub fn add(&self, subscriber: Subscriber, interval: u64) -> Result<()> {
        if interval == 0 {
            bail!("tick interval must be > 0");
        }

        let mut tickers = self.tickers.lock();

        if let Some(ticker) = tickers.get(&interval) {
            let mut subs = ticker.subscribers.lock();
            if !subs.iter().any(|s| s.same_channel(&subscriber)) {
                subs.push(subscriber);
            }
            return Ok(());
        }

        let subscribers = Arc::new(parking_lot::Mutex::new(vec![subscriber]));
        let cancel = CancellationToken::new();

        spawn_ticker(interval, Arc::clone(&subscribers), cancel.clone());
        tickers.insert(interval, Ticker { subscribers, cancel });

        Ok(())
    }

    /// Unsubscribe. A ticker left without subscribers stops.
    pub fn remove(&self, subscriber: &Subscriber) {
        let mut tickers = self.tickers.lock();

        tickers.retain(|interval, ticker| {
            let mut subs = ticker.subscribers.lock();
            subs.retain(|s| !s.same_channel(subscriber));

            if subs.is_empty() {
                debug!(interval, "stopping idle ticker");
                ticker.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Seconds until the subscriber's next tick, if it is subscribed.
    pub fn eta(&self, subscriber: &Subscriber) -> Option<f64> {
        let tickers = self.tickers.lock();

        let interval = tickers.iter().find_map(|(interval, ticker)| {
            ticker
                .subscribers
                .lock()
                .iter()
                .any(|s| s.same_channel(subscriber))
                .then_some(*interval)
        })?;

        Some(until_next_tick(interval, SystemTime::now()).as_secs_f64())
    }

    /// Stop every ticker.
    pub fn stop(&self) {
        let mut tickers = self.tickers.lock();
        for ticker in tickers.values() {
            ticker.cancel.cancel();
        }
        tickers.clear();
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ticker(
    interval: u64,
    subscribers: Arc<parking_lot::Mutex<Vec<Subscriber>>>,
    cancel: CancellationToken,
) {
    info!(interval, "ticker started");

    tokio::spawn(async move {
        loop {
            let wait = until_next_tick(interval, SystemTime::now());

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(interval, "ticker stopped");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let tick = align(interval, SystemTime::now());
            let mut subs = subscribers.lock();

            subs.retain(|s| match s.try_send(tick) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(interval, "subscriber not ready, tick dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
    });
}

/// Time from `now` until the next multiple of `interval` seconds.
fn until_next_tick(interval: u64, now: SystemTime) -> Duration {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let period = Duration::from_secs(interval);
    let into_period = Duration::from_nanos((since_epoch.as_nanos() % period.as_nanos()) as u64);

    period - into_period
}

/// Truncate `now` to a multiple of `interval` seconds.
fn align(interval: u64, now: SystemTime) -> SystemTime {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();

    UNIX_EPOCH + Duration::from_secs(secs - secs % interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_tick() {
        let now = UNIX_EPOCH + Duration::from_millis(125_500);
        assert_eq!(until_next_tick(60, now), Duration::from_millis(54_500));

        let on_boundary = UNIX_EPOCH + Duration::from_secs(120);
        assert_eq!(until_next_tick(60, on_boundary), Duration::from_secs(60));
    }

    #[test]
    fn test_align() {
        let now = UNIX_EPOCH + Duration::from_millis(125_500);
        assert_eq!(align(60, now), UNIX_EPOCH + Duration::from_secs(120));
        assert_eq!(align(1, now), UNIX_EPOCH + Duration::from_secs(125));
    }

    #[test]
    fn test_add_rejects_zero_interval() {
        let clock = Clock::new();
        let (tx, _rx) = mpsc::channel(1);
        let err = clock.add(tx, 0).expect_err("should fail");
        assert!(err.to_string().contains("interval"));
    }

    #[tokio::test]
    async fn test_ticks_are_aligned() {
        let clock = Clock::new();
        let (tx, mut rx) = mpsc::channel(1);
        clock.add(tx.clone(), 1).expect("add");

        let tick = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("tick within timeout")
            .expect("channel open");

        let since = tick.duration_since(UNIX_EPOCH).expect("after epoch");
        assert_eq!(since.subsec_nanos(), 0);

        clock.remove(&tx);
    }

    #[tokio::test]
    async fn test_eta_and_remove() {
        let clock = Clock::new();
        let (tx, _rx) = mpsc::channel(1);
        let (other, _other_rx) = mpsc::channel(1);

        assert!(clock.eta(&tx).is_none());

        clock.add(tx.clone(), 60).expect("add");
        let eta = clock.eta(&tx).expect("subscribed");
        assert!(eta > 0.0 && eta <= 60.0, "eta={eta}");
        assert!(clock.eta(&other).is_none());

        clock.remove(&tx);
        assert!(clock.eta(&tx).is_none());
        assert!(clock.tickers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let clock = Clock::new();
        let (stuck, _stuck_rx) = mpsc::channel(1);
        let (live, mut live_rx) = mpsc::channel(8);

        clock.add(stuck, 1).expect("add stuck");
        clock.add(live, 1).expect("add live");

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(3), live_rx.recv())
                .await
                .expect("tick within timeout")
                .expect("channel open");
        }

        clock.stop();
    }
}

//! Progress reporting.
//!
//! Events go out on a broadcast channel; any number of UI listeners can
//! subscribe. Stages whose real progress cannot be observed use a
//! simulated ticker that creeps toward a ceiling below 100.

use crate::config::ProgressConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

const CHANNEL_CAPACITY: usize = 64;

/// Highest percent a simulated ticker may display
pub const SIMULATED_MAX: u8 = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Update {
        percent: u8,
        message: String,
        /// Indeterminate progress driven by a ticker
        pulsing: bool,
    },
    /// A fatal failure to show to the user
    Failed { message: String },
    Closed,
    /// The application should reload its data
    ReloadRequested,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub percent: u8,
    pub message: String,
    pub pulsing: bool,
}

struct Inner {
    tx: broadcast::Sender<ProgressEvent>,
    snapshot: Mutex<ProgressSnapshot>,
    simulations: AtomicUsize,
    pulse_interval: Duration,
    pulse_step: u8,
}

/// Cheaply cloneable handle to one progress channel
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

impl ProgressReporter {
    pub fn new(config: &ProgressConfig) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tx,
                snapshot: Mutex::new(ProgressSnapshot::default()),
                simulations: AtomicUsize::new(0),
                // tokio's interval panics on a zero period
                pulse_interval: Duration::from_millis(config.pulse_interval_ms.max(1)),
                pulse_step: config.pulse_step.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner
            .snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn update(&self, percent: u8, message: &str, pulsing: bool) {
        let percent = percent.min(100);
        if let Ok(mut snapshot) = self.inner.snapshot.lock() {
            *snapshot = ProgressSnapshot {
                percent,
                message: message.to_string(),
                pulsing,
            };
        }
        self.emit(ProgressEvent::Update {
            percent,
            message: message.to_string(),
            pulsing,
        });
    }

    pub fn fail(&self, message: &str) {
        self.emit(ProgressEvent::Failed {
            message: message.to_string(),
        });
    }

    pub fn close(&self) {
        self.emit(ProgressEvent::Closed);
    }

    pub fn request_reload(&self) {
        self.emit(ProgressEvent::ReloadRequested);
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.inner.tx.send(event);
    }

    /// Number of simulated tickers not yet stopped or dropped
    pub fn active_simulations(&self) -> usize {
        self.inner.simulations.load(Ordering::SeqCst)
    }

    /// Start a ticker that raises the displayed percent from `from`
    /// toward `ceiling` (at most 99) until the guard is stopped.
    pub fn simulate(&self, from: u8, ceiling: u8, message: &str) -> SimulatedProgress {
        let cap = ceiling.min(SIMULATED_MAX);
        let start = from.min(cap);
        self.update(start, message, true);

        let reporter = self.clone();
        let message = message.to_string();
        let period = self.inner.pulse_interval;
        let step = self.inner.pulse_step;

        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first tick

            let mut current = start;
            while current < cap {
                timer.tick().await;
                current = current.saturating_add(step).min(cap);
                reporter.update(current, &message, true);
            }
        });

        self.inner.simulations.fetch_add(1, Ordering::SeqCst);
        SimulatedProgress {
            handle: Some(handle),
            reporter: self.clone(),
        }
    }
}

/// Owner of a running progress ticker.
///
/// `stop` aborts the ticker and waits for it to finish. Dropping the guard
/// without stopping still aborts it.
#[must_use = "the ticker runs until the guard is stopped or dropped"]
pub struct SimulatedProgress {
    handle: Option<JoinHandle<()>>,
    reporter: ProgressReporter,
}

impl SimulatedProgress {
    pub async fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for SimulatedProgress {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.reporter
            .inner
            .simulations
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(interval_ms: u64, step: u8) -> ProgressReporter {
        ProgressReporter::new(&ProgressConfig {
            close_delay_ms: 0,
            pulse_interval_ms: interval_ms,
            pulse_step: step,
            pulse_ceiling: 88,
        })
    }

    #[tokio::test]
    async fn test_final_events_survive_reporter_drop() {
        let progress = reporter(400, 2);
        let mut rx = progress.subscribe();

        progress.close();
        progress.request_reload();
        drop(progress);

        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::Closed);
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::ReloadRequested);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_update_clamps_and_broadcasts() {
        let progress = reporter(400, 2);
        let mut rx = progress.subscribe();

        progress.update(150, "Done", false);
        assert_eq!(progress.snapshot().percent, 100);
        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::Update {
                percent: 100,
                message: "Done".into(),
                pulsing: false
            }
        );

        progress.close();
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_stops_at_ceiling() {
        let progress = reporter(100, 5);
        let sim = progress.simulate(70, 88, "Uploading attachments");
        assert_eq!(progress.active_simulations(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.percent, 88);
        assert!(snapshot.pulsing);

        sim.stop().await;
        assert_eq!(progress.active_simulations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_never_reaches_100() {
        let progress = reporter(10, 50);
        let sim = progress.simulate(60, 100, "Working");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(progress.snapshot().percent, SIMULATED_MAX);
        sim.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_ticker_no_longer_updates() {
        let progress = reporter(100, 1);
        let sim = progress.simulate(10, 80, "Working");

        tokio::time::sleep(Duration::from_millis(350)).await;
        sim.stop().await;
        let frozen = progress.snapshot().percent;
        assert!(frozen > 10 && frozen < 80);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(progress.snapshot().percent, frozen);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_ticker() {
        let progress = reporter(50, 1);
        {
            let _sim = progress.simulate(0, 50, "Working");
            assert_eq!(progress.active_simulations(), 1);
        }
        assert_eq!(progress.active_simulations(), 0);
    }
}

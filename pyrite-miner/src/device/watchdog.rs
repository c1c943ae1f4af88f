//! Device liveness watchdog.
//!
//! A restartable one-shot countdown running as its own task. The owning
//! driver restarts it whenever anything proves the device is alive (data
//! received, work dispatched); if the countdown ever runs out, the watchdog
//! delivers a single expiry notification and parks until restarted.
//!
//! Liveness is deliberately decoupled from any particular read or write
//! call. A device that happily accepts commands but never replies would
//! pass every write; only the absence of events within the window catches
//! it.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WatchdogState {
    Stopped,
    Running,
    Expired,
}

enum Ctl {
    Arm,
    Stop,
}

/// Handle to a running watchdog task.
///
/// Clones control the same countdown; the listener holds one to restart it
/// on every received frame. Dropping the last clone stops the task.
#[derive(Clone)]
pub struct Watchdog {
    ctl: mpsc::UnboundedSender<Ctl>,
    state: Arc<RwLock<WatchdogState>>,
}

impl Watchdog {
    /// Create a watchdog that sends one message on `expired` each time the
    /// countdown runs out.
    pub fn new(timeout: Duration, expired: mpsc::Sender<()>) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(WatchdogState::Stopped));
        tokio::spawn(run(timeout, ctl_rx, expired, Arc::clone(&state)));
        Self { ctl: ctl_tx, state }
    }

    /// Arm the countdown.
    pub fn start(&self) {
        let _ = self.ctl.send(Ctl::Arm);
    }

    /// Re-arm the countdown without changing the timeout. Also arms a
    /// stopped or expired watchdog.
    pub fn restart(&self) {
        let _ = self.ctl.send(Ctl::Arm);
    }

    /// Disarm the countdown.
    pub fn stop(&self) {
        let _ = self.ctl.send(Ctl::Stop);
    }

    pub fn state(&self) -> WatchdogState {
        *self.state.read()
    }
}

async fn run(
    timeout: Duration,
    mut ctl: mpsc::UnboundedReceiver<Ctl>,
    expired: mpsc::Sender<()>,
    state: Arc<RwLock<WatchdogState>>,
) {
    loop {
        // Disarmed: nothing to time, wait for a control message.
        loop {
            match ctl.recv().await {
                None => return,
                Some(Ctl::Arm) => break,
                Some(Ctl::Stop) => continue,
            }
        }
        *state.write() = WatchdogState::Running;

        // Armed: count down, re-arming on every further Arm.
        loop {
            tokio::select! {
                msg = ctl.recv() => match msg {
                    None => return,
                    Some(Ctl::Arm) => continue,
                    Some(Ctl::Stop) => {
                        *state.write() = WatchdogState::Stopped;
                        break;
                    }
                },
                _ = time::sleep(timeout) => {
                    *state.write() = WatchdogState::Expired;
                    if expired.send(()).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout() {
        let (tx, mut rx) = mpsc::channel(1);
        let wd = Watchdog::new(TIMEOUT, tx);
        wd.start();

        rx.recv().await.expect("watchdog should expire");
        assert_eq!(wd.state(), WatchdogState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_defers_expiry() {
        let (tx, mut rx) = mpsc::channel(1);
        let wd = Watchdog::new(TIMEOUT, tx);
        wd.start();

        time::sleep(Duration::from_millis(50)).await;
        wd.restart();

        // 130ms after start, but only 80ms after the restart.
        time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(wd.state(), WatchdogState::Running);

        time::sleep(Duration::from_millis(40)).await;
        rx.recv().await.expect("watchdog should expire eventually");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disarms() {
        let (tx, mut rx) = mpsc::channel(1);
        let wd = Watchdog::new(TIMEOUT, tx);
        wd.start();

        time::sleep(Duration::from_millis(50)).await;
        wd.stop();

        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(wd.state(), WatchdogState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_after_expiry() {
        let (tx, mut rx) = mpsc::channel(1);
        let wd = Watchdog::new(TIMEOUT, tx);
        wd.start();

        rx.recv().await.unwrap();
        wd.restart();

        rx.recv().await.expect("second expiry after re-arm");
    }
}

//! Device driver actor.
//!
//! One driver owns one physical device. It is implemented as an actor task:
//! the [`DeviceDriver`] handle sends commands over a channel and never
//! blocks on I/O, while the actor serializes everything that touches the
//! device — connection lifecycle, work dispatch, result attribution, and
//! recovery. Commands for the same device are applied in the order they
//! were sent.
//!
//! Failure policy: nothing that happens after `load()` is fatal. Transport
//! faults, watchdog timeouts, and listener errors all funnel into the
//! reconnect path, which retries with capped exponential backoff until the
//! device comes back or is deliberately unloaded. Only construction and
//! command submission after unload return errors to the caller.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::link::Link;
use super::listener;
use super::watchdog::Watchdog;
use crate::asic::DeviceFamily;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::pool::WorkSubmissionSink;
use crate::tracing::prelude::*;
use crate::types::HashRate;
use crate::work::Work;

/// First retry delay after a failed connect.
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the exponential connect backoff.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// How long `unload` waits for the listener before aborting it.
const LISTENER_EXIT_GRACE: Duration = Duration::from_millis(200);

/// Where a device is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Unloaded,
    Connecting,
    Connected,
    Disconnected,
}

/// Snapshot of a device's externally visible state.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub state: ConnectionState,

    /// Rated hashrate for the device's tuning parameters
    pub rated_hashrate: HashRate,

    /// Failed connect attempts since the last successful one. Climbing
    /// values make a permanently missing device observable.
    pub consecutive_connect_failures: u32,

    /// Nonces forwarded to the submission sink
    pub shares_submitted: u64,
}

enum Command {
    Load,
    StartWork(Work),
    Unload(oneshot::Sender<()>),
}

/// Internal events feeding the actor: listener results and connect
/// completions.
#[derive(Debug)]
pub(super) enum DriverEvent {
    Connected,
    Frame(Vec<u8>),
    LinkFailed(Error),
}

/// Handle to a running device driver.
///
/// All methods are non-blocking except [`unload`](Self::unload), which
/// waits for the device to be fully stopped.
pub struct DeviceDriver {
    cmd: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<DeviceStatus>>,
}

impl DeviceDriver {
    /// Validate the configuration and spawn the driver actor.
    ///
    /// The device starts out unloaded; call [`load`](Self::load) to begin
    /// connecting. Must be called from within a tokio runtime.
    pub fn new(
        config: DeviceConfig,
        family: Box<dyn DeviceFamily>,
        link: Arc<dyn Link>,
        sink: Arc<dyn WorkSubmissionSink>,
    ) -> Result<Self> {
        let config = config.validate()?;

        let status = Arc::new(RwLock::new(DeviceStatus {
            state: ConnectionState::Unloaded,
            rated_hashrate: family.theoretical_hashrate(),
            consecutive_connect_failures: 0,
            shares_submitted: 0,
        }));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (wd_tx, wd_rx) = mpsc::channel(1);
        let watchdog = Watchdog::new(
            Duration::from_millis(config.watchdog_timeout_ms),
            wd_tx,
        );

        let cmd_buf = vec![0u8; family.command_len()];
        let actor = Actor {
            config,
            family,
            link,
            sink,
            status: Arc::clone(&status),
            event_tx,
            watchdog,
            shutdown: CancellationToken::new(),
            pending: None,
            current: None,
            cmd_buf,
            partial_polls: Arc::new(AtomicU32::new(0)),
            listener: None,
            connecting: false,
        };
        tokio::spawn(actor.run(cmd_rx, event_rx, wd_rx));

        Ok(Self {
            cmd: cmd_tx,
            status,
        })
    }

    /// Begin connecting to the device. Returns without waiting for the
    /// connection; progress is visible through [`status`](Self::status).
    pub fn load(&self) -> Result<()> {
        self.cmd.send(Command::Load).map_err(|_| Error::Unloaded)
    }

    /// Hand the device a new job.
    ///
    /// Never fails for a device that is merely disconnected; the job is
    /// held and dispatched when the connection comes back, with later calls
    /// replacing the held job. Only a device that has been unloaded rejects
    /// work.
    pub fn start_work(&self, work: Work) -> Result<()> {
        self.cmd
            .send(Command::StartWork(work))
            .map_err(|_| Error::Unloaded)
    }

    /// Stop the device: watchdog disarmed, listener stopped, link closed.
    ///
    /// Waits until teardown is complete. Idempotent, and safe to call
    /// concurrently with an in-flight reconnect or listener cycle.
    pub async fn unload(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd.send(Command::Unload(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Snapshot the device status.
    pub fn status(&self) -> DeviceStatus {
        self.status.read().clone()
    }
}

struct Actor {
    config: DeviceConfig,
    family: Box<dyn DeviceFamily>,
    link: Arc<dyn Link>,
    sink: Arc<dyn WorkSubmissionSink>,
    status: Arc<RwLock<DeviceStatus>>,
    event_tx: mpsc::Sender<DriverEvent>,
    watchdog: Watchdog,
    shutdown: CancellationToken,

    /// Most recent job received while not connected. Overwritten, never
    /// queued: a stale job is worthless once a newer one exists.
    pending: Option<Arc<Work>>,

    /// The job last written to the device; labels submissions.
    current: Option<Arc<Work>>,

    /// Reusable command buffer, sized once from the family.
    cmd_buf: Vec<u8>,

    /// Listener's consecutive-partial-frame count, reset on new work.
    partial_polls: Arc<AtomicU32>,

    listener: Option<(CancellationToken, JoinHandle<()>)>,
    connecting: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::Receiver<DriverEvent>,
        mut wd_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None => {
                        // Handle dropped; tear down as if unloaded.
                        self.unload_device().await;
                        break;
                    }
                    Some(Command::Load) => self.handle_load(),
                    Some(Command::StartWork(work)) => {
                        self.start_work(Arc::new(work)).await;
                    }
                    Some(Command::Unload(ack)) => {
                        self.unload_device().await;
                        let _ = ack.send(());
                        break;
                    }
                },
                Some(event) = event_rx.recv() => match event {
                    DriverEvent::Connected => self.handle_connected().await,
                    DriverEvent::Frame(frame) => self.handle_frame(&frame),
                    DriverEvent::LinkFailed(e) => {
                        warn!(port = %self.config.port, error = %e, "Serial link failed.");
                        self.reconnect("transport fault").await;
                    }
                },
                Some(()) = wd_rx.recv() => {
                    warn!(
                        port = %self.config.port,
                        timeout_ms = self.config.watchdog_timeout_ms,
                        "No device activity within the watchdog window."
                    );
                    self.reconnect("watchdog timeout").await;
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    fn set_state(&self, state: ConnectionState) {
        trace!(port = %self.config.port, state = %state, "State change.");
        self.status.write().state = state;
    }

    fn handle_load(&mut self) {
        if self.state() != ConnectionState::Unloaded {
            debug!(port = %self.config.port, "Load ignored, device already loaded.");
            return;
        }
        info!(
            port = %self.config.port,
            family = self.family.name(),
            rated = %self.family.theoretical_hashrate(),
            "Loading device."
        );
        self.set_state(ConnectionState::Connecting);
        self.spawn_connect();
    }

    /// Spawn the background connect attempt, unless one is in flight.
    fn spawn_connect(&mut self) {
        if self.connecting {
            return;
        }
        self.connecting = true;

        let link = Arc::clone(&self.link);
        let events = self.event_tx.clone();
        let token = self.shutdown.clone();
        let status = Arc::clone(&self.status);
        let port = self.config.port.clone();

        tokio::spawn(async move {
            let mut delay = RECONNECT_BASE_DELAY;
            loop {
                if token.is_cancelled() {
                    return;
                }
                match link.open().await {
                    Ok(()) => {
                        if token.is_cancelled() {
                            // Unloaded while the open was in flight.
                            link.close().await;
                            return;
                        }
                        status.write().consecutive_connect_failures = 0;
                        info!(port = %port, "Successfully connected.");
                        let _ = events.send(DriverEvent::Connected).await;
                        return;
                    }
                    Err(e) => {
                        let failures = {
                            let mut s = status.write();
                            s.consecutive_connect_failures += 1;
                            s.consecutive_connect_failures
                        };
                        warn!(
                            port = %port,
                            error = %e,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "Connect failed."
                        );
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
        });
    }

    async fn handle_connected(&mut self) {
        self.connecting = false;
        if self.shutdown.is_cancelled() {
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.start_listener();
        self.watchdog.start();

        if let Some(work) = self.pending.take() {
            debug!(
                port = %self.config.port,
                job_id = %work.job_id,
                "Flushing work buffered while disconnected."
            );
            self.start_work(work).await;
        }
    }

    fn start_listener(&mut self) {
        if let Some((_, handle)) = &self.listener {
            if !handle.is_finished() {
                return;
            }
        }
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(listener::run(
            Arc::clone(&self.link),
            self.family.event_len(),
            Duration::from_millis(self.config.poll_interval_ms),
            self.watchdog.clone(),
            Arc::clone(&self.partial_polls),
            self.event_tx.clone(),
            token.clone(),
        ));
        self.listener = Some((token, handle));
    }

    async fn stop_listener(&mut self) {
        if let Some((token, mut handle)) = self.listener.take() {
            token.cancel();
            if time::timeout(LISTENER_EXIT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }

    async fn start_work(&mut self, work: Arc<Work>) {
        self.partial_polls
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.watchdog.restart();

        if self.state() != ConnectionState::Connected {
            debug!(
                port = %self.config.port,
                job_id = %work.job_id,
                "Device not connected, work held as pending."
            );
            self.pending = Some(work);
            return;
        }

        debug!(port = %self.config.port, job_id = %work.job_id, "Starting work.");
        if let Err(e) = self.family.encode(&work, &mut self.cmd_buf) {
            error!(
                port = %self.config.port,
                job_id = %work.job_id,
                error = %e,
                "Job cannot be encoded, skipped."
            );
            return;
        }
        trace!(
            port = %self.config.port,
            command = %hex::encode(&self.cmd_buf),
            "Writing command."
        );

        // Anything still buffered belongs to a job this command is about
        // to supersede.
        let discarded = self.link.discard_input().await;
        let written = match discarded {
            Ok(()) => self.link.write(&self.cmd_buf).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                self.current = Some(work);
            }
            Err(e) => {
                warn!(
                    port = %self.config.port,
                    job_id = %work.job_id,
                    error = %e,
                    "Command write failed."
                );
                // The job is not lost; it flushes after the reconnect.
                self.pending = Some(work);
                self.reconnect("write fault").await;
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let candidate = self.family.decode(frame);

        let Some(work) = self.current.as_ref() else {
            debug!(
                port = %self.config.port,
                nonce = %candidate.hex,
                "Event with no outstanding job, discarded."
            );
            return;
        };

        info!(
            port = %self.config.port,
            job_id = %work.job_id,
            nonce = %candidate.hex,
            "Submitting nonce."
        );
        self.status.write().shares_submitted += 1;

        let sink = Arc::clone(&self.sink);
        let work = Arc::clone(work);
        tokio::spawn(async move {
            sink.submit(work, candidate.hex).await;
        });
    }

    /// Tear the connection down and start over. Recovery path for every
    /// asynchronous failure.
    async fn reconnect(&mut self, reason: &str) {
        if self.shutdown.is_cancelled() || self.state() == ConnectionState::Unloaded {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.watchdog.stop();
        self.stop_listener().await;
        self.link.close().await;

        info!(port = %self.config.port, reason, "Reconnecting device.");
        self.set_state(ConnectionState::Connecting);
        self.spawn_connect();
    }

    async fn unload_device(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(port = %self.config.port, "Unloading device.");
        self.set_state(ConnectionState::Unloaded);
        self.shutdown.cancel();
        self.watchdog.stop();
        self.stop_listener().await;
        self.link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::ZeusFamily;
    use crate::device::testutil::MockLink;
    use crate::pool::ChannelSink;
    use crate::work::Submission;

    fn test_config(watchdog_ms: u64) -> DeviceConfig {
        DeviceConfig {
            port: "/dev/ttyTEST0".to_string(),
            clock: 328,
            cores: 6,
            poll_interval_ms: 50,
            watchdog_timeout_ms: watchdog_ms,
        }
    }

    fn test_work(job_id: &str, starting_nonce: u32) -> Work {
        Work {
            job_id: job_id.to_string(),
            header: vec![0u8; 32],
            difficulty: 4096,
            starting_nonce,
        }
    }

    fn spawn_device(
        link: Arc<MockLink>,
        watchdog_ms: u64,
    ) -> (DeviceDriver, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(16);
        let driver = DeviceDriver::new(
            test_config(watchdog_ms),
            Box::new(ZeusFamily::new(328, 6)),
            link as Arc<dyn Link>,
            Arc::new(ChannelSink::new(tx)),
        )
        .unwrap();
        (driver, rx)
    }

    /// Poll until `cond` holds; virtual time makes this fast.
    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached: {what}");
    }

    #[tokio::test(start_paused = true)]
    async fn starts_unloaded_with_rated_hashrate() {
        let link = Arc::new(MockLink::new());
        let (driver, _rx) = spawn_device(link, 60_000);
        let status = driver.status();
        assert_eq!(status.state, ConnectionState::Unloaded);
        // 328 MHz * 700 H/MHz * 6 cores
        assert_eq!(status.rated_hashrate, HashRate::from_hashes(229_600 * 6));
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn load_connects_and_reports_state() {
        let link = Arc::new(MockLink::new());
        let (driver, _rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();

        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;
        assert_eq!(link.opens(), 1);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn work_while_disconnected_is_pending_and_replaced() {
        let link = Arc::new(MockLink::new());
        link.fail_opens(3);
        let (driver, _rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();

        // Connection is still failing; neither call may error.
        driver.start_work(test_work("job1", 1)).unwrap();
        driver.start_work(test_work("job2", 2)).unwrap();

        eventually("pending work flushed", || !link.writes().is_empty()).await;

        // Exactly one command went out, carrying the replacement job.
        let writes = link.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][4..8], &2u32.to_le_bytes());

        // And exactly once: nothing further trickles out.
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(link.writes().len(), 1);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_discards_stale_input_and_writes_command() {
        let link = Arc::new(MockLink::new());
        let (driver, _rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();
        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;

        driver.start_work(test_work("job1", 0)).unwrap();
        eventually("command written", || !link.writes().is_empty()).await;

        assert!(link.discards() >= 1);
        let writes = link.writes();
        assert_eq!(writes[0].len(), 84);
        // clock 328 -> code 218, complement 37; difficulty 4096 -> 0x000f
        assert_eq!(&writes[0][0..4], &[218, 37, 0, 15]);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submission_is_attributed_to_current_work() {
        let link = Arc::new(MockLink::new());
        let (driver, mut rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();
        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;
        driver.start_work(test_work("job1", 0)).unwrap();
        eventually("command written", || !link.writes().is_empty()).await;

        link.push_incoming(&[0x12, 0x34, 0x56, 0x78]);

        let submission = rx.recv().await.expect("share should be submitted");
        assert_eq!(submission.work.job_id, "job1");
        assert_eq!(submission.nonce_hex, "78563412");
        assert_eq!(driver.status().shares_submitted, 1);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn event_without_current_work_is_discarded() {
        let link = Arc::new(MockLink::new());
        let (driver, mut rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();
        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;

        link.push_incoming(&[0x12, 0x34, 0x56, 0x78]);
        time::sleep(Duration::from_secs(1)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(driver.status().shares_submitted, 0);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_timeout_reconnects_and_flushes_gap_work() {
        let link = Arc::new(MockLink::new());
        let (driver, _rx) = spawn_device(link.clone(), 2_000);
        driver.load().unwrap();
        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;
        assert_eq!(link.opens(), 1);

        // Hold the reconnect window open so work lands as pending.
        link.fail_opens(4);

        // Silence; the watchdog fires and the link is torn down.
        eventually("link closed by watchdog", || link.closes() >= 1).await;
        eventually("repeated failure observable", || {
            driver.status().consecutive_connect_failures >= 1
        })
        .await;

        driver.start_work(test_work("gap", 7)).unwrap();

        eventually("link reopened", || link.opens() >= 2).await;
        eventually("gap work flushed", || !link.writes().is_empty()).await;
        let writes = link.writes();
        assert_eq!(&writes[0][4..8], &7u32.to_le_bytes());
        assert_eq!(driver.status().consecutive_connect_failures, 0);
        driver.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unload_is_idempotent_and_stops_everything() {
        let link = Arc::new(MockLink::new());
        let (driver, _rx) = spawn_device(link.clone(), 60_000);
        driver.load().unwrap();
        eventually("device connected", || {
            driver.status().state == ConnectionState::Connected
        })
        .await;

        driver.unload().await;
        assert_eq!(driver.status().state, ConnectionState::Unloaded);
        assert_eq!(link.closes(), 1);

        // Second unload is a no-op, and further work is refused.
        driver.unload().await;
        assert!(matches!(
            driver.start_work(test_work("late", 0)),
            Err(Error::Unloaded)
        ));
    }
}

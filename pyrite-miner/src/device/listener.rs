//! Serial read loop.
//!
//! One listener task runs for the lifetime of each connection. It polls the
//! link for buffered bytes rather than waiting on readiness notifications;
//! "data arrived" events are not reliably portable across the platforms
//! these devices turn up on, and at mining event rates a 50 ms poll is
//! cheap.
//!
//! Framing for the supported families is length-based with no preamble, so
//! the only defense against a drifted byte stream is watching for partial
//! frames that refuse to complete. A partial frame that persists across
//! consecutive polls cannot be finished by reading more; the loop discards
//! the whole input buffer to get back onto a frame boundary.
//!
//! The loop is not self-restarting. Any transport error is reported to the
//! driver and the task exits; the reconnect path spawns a fresh one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::driver::DriverEvent;
use super::link::Link;
use super::watchdog::Watchdog;
use crate::error::Result;
use crate::tracing::prelude::*;

/// Consecutive polls that may end with a partial frame before the input
/// buffer is discarded to resynchronize.
const PARTIAL_FRAME_THRESHOLD: u32 = 2;

/// Poll the link until cancelled or the transport fails.
pub(super) async fn run(
    link: Arc<dyn Link>,
    frame_len: usize,
    poll_interval: Duration,
    watchdog: Watchdog,
    partial_polls: Arc<AtomicU32>,
    events: mpsc::Sender<DriverEvent>,
    shutdown: CancellationToken,
) {
    trace!("Listener started.");
    let mut frame = vec![0u8; frame_len];

    while !shutdown.is_cancelled() {
        if let Err(e) = poll_once(&*link, &mut frame, &watchdog, &partial_polls, &events).await {
            if !shutdown.is_cancelled() {
                error!(error = %e, "Listener read failed.");
                let _ = events.send(DriverEvent::LinkFailed(e)).await;
            }
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(poll_interval) => {}
        }
    }

    trace!("Listener stopped.");
}

/// One poll cycle: drain complete frames, then account for leftovers.
async fn poll_once(
    link: &dyn Link,
    frame: &mut [u8],
    watchdog: &Watchdog,
    partial_polls: &AtomicU32,
    events: &mpsc::Sender<DriverEvent>,
) -> Result<()> {
    let mut available = link.bytes_available().await?;
    if available == 0 {
        return Ok(());
    }

    while available >= frame.len() {
        // Data from the device is proof of life.
        watchdog.restart();
        link.read_exact(frame).await?;
        if events.send(DriverEvent::Frame(frame.to_vec())).await.is_err() {
            // Driver gone; the cancellation will follow shortly.
            return Ok(());
        }
        available = link.bytes_available().await?;
    }

    if available > 0 {
        let polls = partial_polls.fetch_add(1, Ordering::Relaxed) + 1;
        if polls >= PARTIAL_FRAME_THRESHOLD {
            debug!(
                leftover = available,
                "Partial frame persisted across polls, discarding input."
            );
            link.discard_input().await?;
        }
    } else {
        partial_polls.store(0, Ordering::Relaxed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testutil::MockLink;
    use crate::device::watchdog::WatchdogState;

    const POLL: Duration = Duration::from_millis(50);
    const FRAME_LEN: usize = 4;

    struct Fixture {
        link: Arc<MockLink>,
        watchdog: Watchdog,
        partial_polls: Arc<AtomicU32>,
        events: mpsc::Receiver<DriverEvent>,
        shutdown: CancellationToken,
    }

    fn spawn_listener() -> Fixture {
        let link = Arc::new(MockLink::new());
        link.force_open();
        let (wd_tx, _wd_rx) = mpsc::channel(1);
        let watchdog = Watchdog::new(Duration::from_secs(60), wd_tx);
        let partial_polls = Arc::new(AtomicU32::new(0));
        let (event_tx, event_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        tokio::spawn(run(
            link.clone() as Arc<dyn Link>,
            FRAME_LEN,
            POLL,
            watchdog.clone(),
            Arc::clone(&partial_polls),
            event_tx,
            shutdown.clone(),
        ));

        Fixture {
            link,
            watchdog,
            partial_polls,
            events: event_rx,
            shutdown,
        }
    }

    fn frame_bytes(event: DriverEvent) -> Vec<u8> {
        match event {
            DriverEvent::Frame(bytes) => bytes,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_complete_frames_in_order() {
        let mut fx = spawn_listener();
        fx.link.push_incoming(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let first = frame_bytes(fx.events.recv().await.unwrap());
        let second = frame_bytes(fx.events.recv().await.unwrap());
        assert_eq!(first, vec![1, 2, 3, 4]);
        assert_eq!(second, vec![5, 6, 7, 8]);

        // A frame restarts the watchdog.
        assert_eq!(fx.watchdog.state(), WatchdogState::Running);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_partial_frame_triggers_discard() {
        let fx = spawn_listener();
        // One complete frame plus a 2-byte runt that never completes.
        fx.link.push_incoming(&[1, 2, 3, 4, 0xaa, 0xbb]);

        // First poll leaves the runt (count 1); second poll sees it again
        // and discards.
        time::sleep(POLL * 5).await;
        assert_eq!(fx.link.discards(), 1);
        assert_eq!(fx.link.available(), 0);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_resets_partial_count() {
        let fx = spawn_listener();
        fx.partial_polls.store(1, Ordering::Relaxed);
        // A poll that drains to empty resets the count.
        fx.link.push_incoming(&[1, 2, 3, 4]);

        time::sleep(POLL * 3).await;
        assert_eq!(fx.partial_polls.load(Ordering::Relaxed), 0);
        assert_eq!(fx.link.discards(), 0);
        fx.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_fault_is_reported_and_loop_exits() {
        let mut fx = spawn_listener();
        fx.link.fail_io(true);

        match fx.events.recv().await.unwrap() {
            DriverEvent::LinkFailed(_) => {}
            other => panic!("expected failure event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop_quietly() {
        let mut fx = spawn_listener();
        fx.shutdown.cancel();
        time::sleep(POLL * 3).await;
        assert!(fx.events.try_recv().is_err());
    }
}

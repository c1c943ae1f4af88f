//! Scripted in-memory link for driver and listener tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::link::Link;
use crate::error::{Error, Result};

#[derive(Default)]
struct MockState {
    open: bool,
    fail_opens_remaining: u32,
    fail_io: bool,
    incoming: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    opens: u32,
    closes: u32,
    discards: u32,
}

/// A [`Link`] whose wire both ends are held by the test.
///
/// Tests feed bytes in with [`push_incoming`](Self::push_incoming), inspect
/// what the driver wrote with [`writes`](Self::writes), and inject faults
/// with [`fail_opens`](Self::fail_opens) and [`fail_io`](Self::fail_io).
#[derive(Default)]
pub(crate) struct MockLink {
    state: Mutex<MockState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the link open without going through `open()`.
    pub fn force_open(&self) {
        self.state.lock().open = true;
    }

    /// Make the next `n` calls to `open()` fail.
    pub fn fail_opens(&self, n: u32) {
        self.state.lock().fail_opens_remaining = n;
    }

    /// Make every I/O call fail until cleared.
    pub fn fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// Queue bytes as if the device had sent them.
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state.lock().incoming.extend(bytes);
    }

    pub fn available(&self) -> usize {
        self.state.lock().incoming.len()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().opens
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().closes
    }

    pub fn discards(&self) -> u32 {
        self.state.lock().discards
    }
}

fn io_fault() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "scripted transport fault",
    ))
}

fn not_open() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "mock link is not open",
    ))
}

#[async_trait]
impl Link for MockLink {
    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_opens_remaining > 0 {
            state.fail_opens_remaining -= 1;
            return Err(Error::Connection("scripted open failure".into()));
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(not_open());
        }
        if state.fail_io {
            return Err(io_fault());
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    async fn bytes_available(&self) -> Result<usize> {
        let state = self.state.lock();
        if !state.open {
            return Err(not_open());
        }
        if state.fail_io {
            return Err(io_fault());
        }
        Ok(state.incoming.len())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(not_open());
        }
        if state.fail_io {
            return Err(io_fault());
        }
        if state.incoming.len() < buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "scripted stream ran dry",
            )));
        }
        for slot in buf.iter_mut() {
            *slot = state.incoming.pop_front().unwrap();
        }
        Ok(())
    }

    async fn discard_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(not_open());
        }
        state.incoming.clear();
        state.discards += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
    }
}

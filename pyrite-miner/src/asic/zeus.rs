//! Zeus family wire protocol.
//!
//! Zeus-style boards take one 84-byte command frame per job and answer with
//! bare 4-byte nonce frames, no preamble and no checksum. Framing therefore
//! rests entirely on the fixed lengths, which is why the listener's
//! desynchronization recovery matters for this family.
//!
//! Command frame layout:
//!
//! | offset | bytes | field                                  |
//! |--------|-------|----------------------------------------|
//! | 0      | 1     | frequency code                         |
//! | 1      | 1     | one's-complement of the frequency code |
//! | 2..4   | 2     | difficulty code, high byte first       |
//! | 4..8   | 4     | starting nonce, wire order             |
//! | 8..84  | 76    | block header, byte-reversed            |
//!
//! The chip clock is programmed as `clk * 2 / 3` with its complement in the
//! next byte as a parity check. The difficulty code is `0xFFFF / difficulty`.
//! Multi-byte fields use the hex-pair swap of their big-endian form, which
//! is plain little-endian byte order on the wire.

use crate::asic::{swap_hex, DeviceFamily, NonceCandidate};
use crate::error::{Error, Result};
use crate::types::HashRate;
use crate::work::Work;

/// Command frame length in bytes.
const COMMAND_LEN: usize = 84;

/// Event frame length in bytes.
const EVENT_LEN: usize = 4;

/// Header field offset within the command frame.
const HEADER_OFFSET: usize = 8;

/// Supported chip clock range in MHz.
const CLK_MIN: u16 = 2;
const CLK_MAX: u16 = 382;

/// Hashes per second contributed by one core per clock MHz.
const HASHES_PER_CORE_PER_CLK: f64 = 87.5 * 8.0;

/// The Zeus high-clock ASIC family.
///
/// Holds the live-tunable parameters for one physical device. Writing the
/// clock recomputes the derived frequency code and rated hashrate.
#[derive(Debug, Clone)]
pub struct ZeusFamily {
    clk: u16,
    cores: u32,
    freq_code: u8,
    rated: HashRate,
}

impl ZeusFamily {
    pub fn new(clk: u16, cores: u32) -> Self {
        let mut family = Self {
            clk: 0,
            cores: cores.max(1),
            freq_code: 0,
            rated: HashRate::default(),
        };
        family.set_clock(clk);
        family
    }

    /// Set the chip clock, clamping to the supported range.
    ///
    /// Derived fields (frequency code, rated hashrate) are recomputed here
    /// so a command encoded after a clock change always carries the new
    /// code.
    pub fn set_clock(&mut self, clk: u16) {
        self.clk = clk.clamp(CLK_MIN, CLK_MAX);
        self.freq_code = (self.clk * 2 / 3) as u8;
        self.rated = HashRate::from_hashes(
            (self.clk as f64 * HASHES_PER_CORE_PER_CLK) as u64 * self.cores as u64,
        );
    }

    /// The clock actually in effect after clamping.
    pub fn clock(&self) -> u16 {
        self.clk
    }

    /// Number of hashing cores this device was configured with.
    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// The frequency code byte derived from the current clock.
    pub fn frequency_code(&self) -> u8 {
        self.freq_code
    }
}

impl DeviceFamily for ZeusFamily {
    fn name(&self) -> &'static str {
        "zeus"
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn command_len(&self) -> usize {
        COMMAND_LEN
    }

    fn event_len(&self) -> usize {
        EVENT_LEN
    }

    fn encode(&self, work: &Work, buf: &mut [u8]) -> Result<()> {
        if buf.len() != COMMAND_LEN {
            return Err(Error::Protocol(format!(
                "command buffer is {} bytes, expected {COMMAND_LEN}",
                buf.len()
            )));
        }
        if work.difficulty == 0 {
            return Err(Error::Protocol(format!(
                "job {} has zero difficulty",
                work.job_id
            )));
        }
        if work.header.len() > COMMAND_LEN - HEADER_OFFSET {
            return Err(Error::Protocol(format!(
                "job {} header is {} bytes, at most {} fit",
                work.job_id,
                work.header.len(),
                COMMAND_LEN - HEADER_OFFSET
            )));
        }

        buf[0] = self.freq_code;
        buf[1] = 0xff - self.freq_code;

        let diff_code = (0xffff / work.difficulty) as u16;
        buf[2] = (diff_code >> 8) as u8;
        buf[3] = diff_code as u8;

        buf[4..8].copy_from_slice(&work.starting_nonce.to_le_bytes());

        for (dst, src) in buf[HEADER_OFFSET..]
            .iter_mut()
            .zip(work.header.iter().rev())
        {
            *dst = *src;
        }
        // The buffer is reused between jobs; clear anything a longer
        // previous header may have left behind.
        for b in buf[HEADER_OFFSET + work.header.len()..].iter_mut() {
            *b = 0;
        }

        Ok(())
    }

    fn decode(&self, frame: &[u8]) -> NonceCandidate {
        debug_assert_eq!(frame.len(), EVENT_LEN);
        let mut wire = [0u8; EVENT_LEN];
        wire.copy_from_slice(frame);
        NonceCandidate {
            nonce: u32::from_le_bytes(wire),
            hex: swap_hex(&hex::encode(wire)),
        }
    }

    fn theoretical_hashrate(&self) -> HashRate {
        self.rated
    }
}

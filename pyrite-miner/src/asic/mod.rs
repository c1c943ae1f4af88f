//! Device family abstraction.
//!
//! A device family captures everything that is specific to one line of
//! mining hardware: the baud rate its UART runs at, the layout of the
//! command packet it accepts, the size and interpretation of the event
//! packets it emits, and the model relating its tuning parameters to an
//! expected hashrate.
//!
//! The driver, listener, and watchdog are family-agnostic and depend only
//! on this trait, so adding support for a new board means implementing
//! `DeviceFamily` and nothing else.

pub mod zeus;

pub use zeus::ZeusFamily;

use crate::error::Result;
use crate::types::HashRate;
use crate::work::Work;

/// A candidate nonce decoded from one device event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceCandidate {
    /// Numeric nonce value
    pub nonce: u32,

    /// The nonce as a hex string in the order the pool protocol expects
    pub hex: String,
}

/// The wire protocol of one mining hardware family.
pub trait DeviceFamily: Send + 'static {
    /// Short family name, used in logs.
    fn name(&self) -> &'static str;

    /// UART baud rate, fixed for the family.
    fn baud_rate(&self) -> u32;

    /// Length in bytes of a command frame.
    fn command_len(&self) -> usize;

    /// Length in bytes of an event frame.
    fn event_len(&self) -> usize;

    /// Serialize `work` plus the family's tuning parameters into `buf`.
    ///
    /// `buf` is the device's reusable command buffer, always exactly
    /// [`command_len`](Self::command_len) bytes; fields are written in place
    /// at their fixed offsets.
    fn encode(&self, work: &Work, buf: &mut [u8]) -> Result<()>;

    /// Interpret one event frame of [`event_len`](Self::event_len) bytes.
    fn decode(&self, frame: &[u8]) -> NonceCandidate;

    /// Rated hashrate for the family's current tuning parameters.
    fn theoretical_hashrate(&self) -> HashRate;
}

/// Reverse a hex string two characters at a time.
///
/// This is the wire byte-order transform shared by the serial device
/// families: `"12345678"` becomes `"78563412"`. Applying it to the
/// big-endian hex form of a value yields its little-endian wire form, and
/// applying it to received wire bytes yields the pool-order form.
pub fn swap_hex(s: &str) -> String {
    debug_assert!(s.len() % 2 == 0, "hex string must have an even length");
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    for pair in bytes.chunks(2).rev() {
        out.push(pair[0] as char);
        if let Some(&c) = pair.get(1) {
            out.push(c as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_reverses_byte_pairs() {
        assert_eq!(swap_hex("12345678"), "78563412");
        assert_eq!(swap_hex("0f"), "0f");
        assert_eq!(swap_hex(""), "");
    }

    #[test]
    fn swap_is_an_involution() {
        let s = "00c1f0aa";
        assert_eq!(swap_hex(&swap_hex(s)), s);
    }
}

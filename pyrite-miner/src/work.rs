//! Mining work and submission types.

/// One mining job handed to a device.
///
/// A work item carries everything the device needs for one mining attempt:
/// the block header to search, the share difficulty, and the nonce to start
/// searching from. Work is owned by the pool collaborator and borrowed by the
/// driver for the duration of one attempt; it is immutable once handed over,
/// so drivers share it as `Arc<Work>` between the dispatch path and in-flight
/// submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    /// Identifier for this job assigned by the pool
    pub job_id: String,

    /// Raw block header bytes, in the order the pool supplied them
    pub header: Vec<u8>,

    /// Share difficulty target
    pub difficulty: u32,

    /// Nonce the device starts searching from
    pub starting_nonce: u32,
}

/// A solved piece of work on its way back to the pool.
///
/// The nonce travels as a hex string in the wire order the pool protocol
/// expects, exactly as produced by the device family's decoder.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Job this solution is for
    pub work: std::sync::Arc<Work>,

    /// Found nonce in pool wire order
    pub nonce_hex: String,
}

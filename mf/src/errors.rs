use std::fmt;

use shared_memory::ShmemError;

/// Every mf operation reports through this enum. Setup failures wrap the
/// underlying shared-memory error; the rest map one-to-one onto protocol
/// conditions a caller can act on.
#[derive(Debug)]
pub enum MfError {
    /// The backing segment could not be created, sized, or mapped.
    SegmentCreate(ShmemError),
    /// The named segment does not exist or could not be mapped.
    SegmentAttach(ShmemError),
    /// The session has no active mapping.
    NotConnected,
    /// No contiguous free run large enough anywhere in the arena, or a
    /// message that could never fit its queue.
    OutOfSpace,
    /// The local queue table or the shared registry is at capacity.
    TableFull,
    /// No queue with that name.
    NotFound,
    /// The queue still has open handles somewhere.
    QueueBusy,
    /// The qid is out of range or not bound in this session.
    InvalidHandle,
    /// A close without a matching open; the count stays at zero.
    RefcountUnderflow,
    /// The qid does not name a live queue.
    InvalidQueue,
    /// The pending message is larger than the caller's buffer. The message
    /// is left in place so a retry with a larger buffer succeeds.
    BufferTooSmall { needed: usize, provided: usize },
    /// Rejected configuration value or unreadable config file.
    Config(String),
    /// A cross-process mutex could not be created, attached, or acquired.
    Lock(String),
    /// Shared state violates a layout invariant; reported instead of
    /// being written through.
    Corrupted(&'static str),
}

impl fmt::Display for MfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MfError::SegmentCreate(e) => write!(f, "cannot create segment: {}", e),
            MfError::SegmentAttach(e) => write!(f, "cannot attach segment: {}", e),
            MfError::NotConnected => write!(f, "no active segment mapping"),
            MfError::OutOfSpace => write!(f, "no contiguous free space"),
            MfError::TableFull => write!(f, "queue table is full"),
            MfError::NotFound => write!(f, "no such queue"),
            MfError::QueueBusy => write!(f, "queue has open handles"),
            MfError::InvalidHandle => write!(f, "invalid queue handle"),
            MfError::RefcountUnderflow => {
                write!(f, "close without matching open; refcount already zero")
            }
            MfError::InvalidQueue => write!(f, "qid does not name a live queue"),
            MfError::BufferTooSmall { needed, provided } => write!(
                f,
                "buffer too small: message is {} bytes, buffer holds {}",
                needed, provided
            ),
            MfError::Config(msg) => write!(f, "configuration error: {}", msg),
            MfError::Lock(msg) => write!(f, "lock error: {}", msg),
            MfError::Corrupted(msg) => write!(f, "corrupted segment state: {}", msg),
        }
    }
}

impl std::error::Error for MfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MfError::SegmentCreate(e) | MfError::SegmentAttach(e) => Some(e),
            _ => None,
        }
    }
}

impl MfError {
    /// raw_sync reports boxed `dyn Error` values that are neither `Send` nor
    /// `Sync`; flatten them to text so `MfError` stays thread-portable.
    pub(crate) fn lock<E: fmt::Display>(err: E) -> MfError {
        MfError::Lock(err.to_string())
    }
}

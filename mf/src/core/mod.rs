use std::mem;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::MfError;

/// Allocator granularity in bytes; one bitmap bit tracks one block.
pub const BLOCK_SIZE: usize = 64;
/// Message slots are rounded up to this many bytes. Send, recv, and space
/// accounting all use the same rounding, so both sides agree on stored size.
pub const MSG_ALIGN: usize = 8;
/// Inline little-endian u32 payload length preceding each payload.
pub const MSG_HEADER_BYTES: usize = 4;
/// Compile-time capacity of the shared registry and the per-process table.
/// `max_queues_in_shmem` may configure less, never more.
pub const MAX_QUEUES: usize = 16;
/// Queue name bytes stored inline in the segment.
pub const MAX_NAME_BYTES: usize = 64;
/// Upper bound on the configurable arena, which also fixes the bitmap size.
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound on `max_msgs_in_queue`.
pub const MAX_MSGS_LIMIT: usize = 4096;
/// Bytes reserved for each process-shared mutex. A pthread mutex needs 40
/// bytes on Linux; the reservation is checked against `Mutex::size_of` when
/// the lock is laid down.
pub const LOCK_BYTES: usize = 64;
/// Backoff between lock-release/retry rounds of a blocked send or recv.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const BITMAP_BYTES: usize = MAX_SEGMENT_SIZE / BLOCK_SIZE / 8;
const MAGIC: u64 = 0x4d46_5345_474d_3031; // "MFSEGM01"
const LAYOUT_VERSION: u32 = 1;

pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// First arena byte, measured from the mapping base. The arena itself is
/// what `shmem_size` configures; the header rides on top of it.
pub const HEADER_BYTES: usize = align_up(mem::size_of::<SegmentHeader>(), BLOCK_SIZE);

/// Process-wide parameters every attaching process must load identically;
/// the config file is the out-of-band contract between processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MfConfig {
    /// Identifier of the backing shared object. `/` maps to `_` on the OS.
    pub shmem_name: String,
    /// Allocatable arena size in bytes, rounded up to a block multiple.
    pub shmem_size: usize,
    /// Waitlist depth of every queue created in the segment.
    pub max_msgs_in_queue: usize,
    /// How many queues may exist in the segment at once.
    pub max_queues_in_shmem: usize,
}

impl Default for MfConfig {
    fn default() -> MfConfig {
        MfConfig {
            shmem_name: "mf-shmem".to_string(),
            shmem_size: 256 * 1024,
            max_msgs_in_queue: 128,
            max_queues_in_shmem: 5,
        }
    }
}

impl MfConfig {
    /// Load the configuration from a TOML file, creating the file with
    /// defaults when it does not exist yet.
    pub fn load_path(path: &str) -> Result<MfConfig, MfError> {
        let cfg: MfConfig = confy::load_path(path).map_err(|e| MfError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), MfError> {
        if self.shmem_name.is_empty() {
            return Err(MfError::Config("shmem_name must not be empty".to_string()));
        }
        if self.shmem_name.len() > 200 {
            return Err(MfError::Config("shmem_name exceeds 200 bytes".to_string()));
        }
        if self.shmem_size == 0 || self.shmem_size > MAX_SEGMENT_SIZE {
            return Err(MfError::Config(format!(
                "shmem_size must be within 1..={} bytes, got {}",
                MAX_SEGMENT_SIZE, self.shmem_size
            )));
        }
        if self.max_msgs_in_queue == 0 || self.max_msgs_in_queue > MAX_MSGS_LIMIT {
            return Err(MfError::Config(format!(
                "max_msgs_in_queue must be within 1..={}, got {}",
                MAX_MSGS_LIMIT, self.max_msgs_in_queue
            )));
        }
        if self.max_queues_in_shmem == 0 || self.max_queues_in_shmem > MAX_QUEUES {
            return Err(MfError::Config(format!(
                "max_queues_in_shmem must be within 1..={}, got {}",
                MAX_QUEUES, self.max_queues_in_shmem
            )));
        }
        Ok(())
    }

    /// POSIX shared object names cannot carry path separators; the original
    /// library mapped them to underscores and peers depend on that.
    pub(crate) fn os_id(&self) -> String {
        self.shmem_name.replace('/', "_")
    }

    pub(crate) fn arena_size(&self) -> usize {
        align_up(self.shmem_size, BLOCK_SIZE)
    }
}

/// Lives at offset 0 of the mapping. Everything after it, starting at
/// `HEADER_BYTES`, is the arena the allocator hands out. All shared fields
/// are offsets or plain integers; never pointers, since each process maps
/// the segment at a different base.
#[repr(C)]
pub struct SegmentHeader {
    pub magic: u64,
    pub version: u32,
    pub arena_size: u32,
    pub max_msgs: u32,
    pub max_queues: u32,
    pub block_count: u32,
    _pad: u32,
    /// Global mutex guarding the bitmap and the registry together.
    pub lock_mem: [u8; LOCK_BYTES],
    pub registry: [RegistryEntry; MAX_QUEUES],
    /// One bit per block, 1 = allocated. Shared so every attacher allocates
    /// against the same state.
    pub bitmap: [u8; BITMAP_BYTES],
}

/// Shared directory entry mapping a queue name to its arena region, so a
/// queue created in one process is discoverable from any other.
#[repr(C)]
pub struct RegistryEntry {
    pub used: u32,
    pub name_len: u32,
    pub region_off: u32,
    pub region_blocks: u32,
    pub name: [u8; MAX_NAME_BYTES],
}

impl RegistryEntry {
    pub fn matches(&self, name: &str) -> bool {
        self.used != 0
            && self.name_len as usize == name.len()
            && &self.name[..name.len()] == name.as_bytes()
    }
}

/// Control block at the start of every queue region, followed by the
/// waitlist descriptor ring `[MsgDesc; max_msgs]` and `capacity` data bytes.
#[repr(C)]
pub struct QueueHeader {
    /// Per-queue mutex guarding every other field and the data area.
    pub lock_mem: [u8; LOCK_BYTES],
    pub name_len: u32,
    pub capacity: u32,
    pub max_msgs: u32,
    /// Cursor of the oldest stored byte, relative to the data area.
    pub read_pos: u32,
    /// Cursor where the next message lands, relative to the data area.
    pub write_pos: u32,
    /// Data-area bytes in use, wrap padding included. Disambiguates full
    /// from empty when the cursors coincide.
    pub used_bytes: u32,
    /// Open handles across all processes. A queue is removable only at zero.
    pub refcount: u32,
    /// Waitlist ring cursor of the oldest undelivered message.
    pub wl_head: u32,
    pub wl_len: u32,
    _pad: u32,
    pub name: [u8; MAX_NAME_BYTES],
}

/// Waitlist entry: where one message sits in the data area. Consumers pop
/// these in arrival order instead of rescanning the ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgDesc {
    pub offset: u32,
    pub len: u32,
}

/// Bytes a queue region occupies: control block + descriptor ring + data,
/// rounded up to whole blocks.
pub(crate) fn region_bytes(capacity: usize, max_msgs: usize) -> usize {
    align_up(
        mem::size_of::<QueueHeader>() + max_msgs * mem::size_of::<MsgDesc>() + capacity,
        BLOCK_SIZE,
    )
}

/// One process's mapping of the segment. Offsets stored in shared state are
/// resolved against this view's base at the point of use.
pub(crate) struct SegmentView {
    shmem: Shmem,
}

impl SegmentView {
    pub fn header_ptr(&self) -> *mut SegmentHeader {
        self.shmem.as_ptr() as *mut SegmentHeader
    }

    pub fn global_lock_mem(&self) -> *mut u8 {
        unsafe { std::ptr::addr_of_mut!((*self.header_ptr()).lock_mem) as *mut u8 }
    }

    /// Resolve an arena-relative offset to a local address.
    pub fn arena_ptr(&self, off: u32) -> *mut u8 {
        unsafe { self.shmem.as_ptr().add(HEADER_BYTES + off as usize) }
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    /// Keep the backing object alive past this mapping's drop.
    pub fn renounce_ownership(&mut self) {
        self.shmem.set_owner(false);
    }

    /// Force this mapping to unlink the backing object on drop.
    pub fn claim_ownership(&mut self) {
        self.shmem.set_owner(true);
    }
}

/// Create, size, and map a fresh segment, then stamp the header. A stale
/// object left behind by a crashed owner under the same name is unlinked
/// and recreated.
pub(crate) fn init_context(cfg: &MfConfig) -> Result<SegmentView, MfError> {
    cfg.validate()?;
    let arena = cfg.arena_size();
    let total = HEADER_BYTES + arena;
    let os_id = cfg.os_id();

    let shmem = match ShmemConf::new().os_id(&os_id).size(total).create() {
        Ok(m) => m,
        Err(ShmemError::MappingIdExists) => {
            let mut stale = ShmemConf::new()
                .os_id(&os_id)
                .open()
                .map_err(MfError::SegmentCreate)?;
            stale.set_owner(true);
            drop(stale);
            ShmemConf::new()
                .os_id(&os_id)
                .size(total)
                .create()
                .map_err(MfError::SegmentCreate)?
        }
        Err(e) => return Err(MfError::SegmentCreate(e)),
    };

    let view = SegmentView { shmem };
    unsafe {
        // Fresh POSIX shm pages arrive zeroed, which already reads as an
        // all-free bitmap and an empty registry.
        let hdr = &mut *view.header_ptr();
        hdr.version = LAYOUT_VERSION;
        hdr.arena_size = arena as u32;
        hdr.max_msgs = cfg.max_msgs_in_queue as u32;
        hdr.max_queues = cfg.max_queues_in_shmem as u32;
        hdr.block_count = (arena / BLOCK_SIZE) as u32;
        // Stamped last: peers treat the magic as the segment-ready flag.
        hdr.magic = MAGIC;
    }
    tracing::debug!(
        "initialized segment {:?}: {} arena bytes in {} blocks",
        os_id,
        arena,
        arena / BLOCK_SIZE
    );
    Ok(view)
}

/// Map an already-created segment and verify it against the local config.
pub(crate) fn connect_context(cfg: &MfConfig) -> Result<SegmentView, MfError> {
    cfg.validate()?;
    let os_id = cfg.os_id();
    let shmem = ShmemConf::new()
        .os_id(&os_id)
        .open()
        .map_err(MfError::SegmentAttach)?;
    let arena = cfg.arena_size();
    if shmem.len() < HEADER_BYTES + arena {
        return Err(MfError::Corrupted("segment smaller than configured"));
    }
    let view = SegmentView { shmem };
    unsafe {
        let hdr = &*view.header_ptr();
        if hdr.magic != MAGIC || hdr.version != LAYOUT_VERSION {
            return Err(MfError::Corrupted("segment magic or version mismatch"));
        }
        if hdr.arena_size as usize != arena
            || hdr.max_msgs as usize != cfg.max_msgs_in_queue
            || hdr.max_queues as usize != cfg.max_queues_in_shmem
        {
            return Err(MfError::Corrupted("segment header does not match configuration"));
        }
    }
    tracing::debug!("attached segment {:?}", os_id);
    Ok(view)
}

//! Session objects owning one process's view of the segment.
//!
//! An [`MfSession`] replaces the process-wide globals of older designs: it
//! carries the mapping, the attached global mutex, and the per-process queue
//! table, so several sessions in one process behave like several processes.

use std::thread;

use raw_sync::locks::{LockImpl, LockInit, Mutex};

use crate::alloc;
use crate::core::{
    self, MfConfig, SegmentView, BLOCK_SIZE, LOCK_BYTES, MAX_NAME_BYTES, MAX_QUEUES, MSG_ALIGN,
    RETRY_INTERVAL,
};
use crate::errors::MfError;
use crate::queue::{slot_bytes, Progress, QueueView};

/// One bound queue: the arena offset is the shared truth, the lock is this
/// process's attachment to the queue mutex.
struct QueueSlot {
    name: String,
    region_off: u32,
    region_blocks: u32,
    lock: Box<dyn LockImpl>,
}

/// Point-in-time snapshot of one queue's control block.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub capacity: usize,
    pub used_bytes: usize,
    pub pending: usize,
    pub refcount: u32,
}

pub struct MfSession {
    // Declared before `view` so lock attachments drop before the mapping.
    table: [Option<QueueSlot>; MAX_QUEUES],
    global_lock: Option<Box<dyn LockImpl>>,
    view: Option<SegmentView>,
}

/// Create the backing segment, map it, and initialize the allocator bitmap
/// and global mutex. The returned session owns the segment: the daemon that
/// calls this is responsible for [`MfSession::destroy`].
pub fn init(cfg: &MfConfig) -> Result<MfSession, MfError> {
    let view = core::init_context(cfg)?;
    let global_lock = create_lock(view.global_lock_mem())?;
    tracing::info!("segment {:?} initialized", cfg.shmem_name);
    Ok(MfSession {
        table: std::array::from_fn(|_| None),
        global_lock: Some(global_lock),
        view: Some(view),
    })
}

/// Attach to a segment some other process created.
pub fn connect(cfg: &MfConfig) -> Result<MfSession, MfError> {
    let view = core::connect_context(cfg)?;
    let global_lock = attach_lock(view.global_lock_mem())?;
    tracing::info!("connected to segment {:?}", cfg.shmem_name);
    Ok(MfSession {
        table: std::array::from_fn(|_| None),
        global_lock: Some(global_lock),
        view: Some(view),
    })
}

impl MfSession {
    /// Unmap this process's view. The backing object stays alive for peers,
    /// even when the owning session disconnects without destroying.
    pub fn disconnect(&mut self) -> Result<(), MfError> {
        let mut view = self.view.take().ok_or(MfError::NotConnected)?;
        self.release_local_state();
        if view.is_owner() {
            view.renounce_ownership();
        }
        tracing::debug!("disconnected from segment");
        Ok(())
    }

    /// Unlink the backing object. Peers with live mappings observe failures
    /// on their next segment operation. The global and per-queue mutexes
    /// live inside the segment, so nothing else needs releasing.
    pub fn destroy(mut self) -> Result<(), MfError> {
        let mut view = self.view.take().ok_or(MfError::NotConnected)?;
        self.release_local_state();
        view.claim_ownership();
        tracing::info!("segment destroyed");
        Ok(())
    }

    /// Materialize a named queue in the segment: reserve a registry entry,
    /// carve a region out of the arena, stamp the control block, and bind it
    /// into this session's table. The new queue starts with refcount zero;
    /// `open` hands out handles.
    pub fn create(&mut self, name: &str, capacity: usize) -> Result<(), MfError> {
        validate_queue_name(name)?;
        if capacity == 0 {
            return Err(MfError::Config("queue capacity must be non-zero".to_string()));
        }
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;
        let local = self
            .table
            .iter()
            .position(|s| s.is_none())
            .ok_or(MfError::TableFull)?;

        let global = self.global_lock.as_ref().ok_or(MfError::NotConnected)?;
        let _g = global.lock().map_err(MfError::lock)?;

        let hdr = unsafe { &mut *view.header_ptr() };
        let max_queues = hdr.max_queues as usize;
        let entry_idx = hdr.registry[..max_queues]
            .iter()
            .position(|e| e.used == 0)
            .ok_or(MfError::TableFull)?;

        let capacity = core::align_up(capacity, MSG_ALIGN);
        let max_msgs = hdr.max_msgs;
        let region = core::region_bytes(capacity, max_msgs as usize);
        let blocks = region / BLOCK_SIZE;
        let block_count = hdr.block_count as usize;
        let first = alloc::allocate(&mut hdr.bitmap, block_count, blocks)
            .ok_or(MfError::OutOfSpace)?;
        let off = (first * BLOCK_SIZE) as u32;

        let region_ptr = view.arena_ptr(off);
        unsafe {
            // The run may hold stale bytes from a removed queue.
            std::ptr::write_bytes(region_ptr, 0, region);
            QueueView::init_region(region_ptr, name, capacity as u32, max_msgs);
        }
        let lock = match create_lock(region_ptr) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = alloc::free(&mut hdr.bitmap, block_count, first, blocks);
                return Err(e);
            }
        };

        let entry = &mut hdr.registry[entry_idx];
        entry.used = 1;
        entry.name_len = name.len() as u32;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.region_off = off;
        entry.region_blocks = blocks as u32;

        self.table[local] = Some(QueueSlot {
            name: name.to_string(),
            region_off: off,
            region_blocks: blocks as u32,
            lock,
        });
        tracing::debug!(
            "created queue {:?}: {} data bytes in {} blocks at offset {}",
            name,
            capacity,
            blocks,
            off
        );
        Ok(())
    }

    /// Tear a queue down and return its region to the allocator. Refused
    /// while any process still holds an open handle; the shared refcount is
    /// the source of truth for that.
    pub fn remove(&mut self, name: &str) -> Result<(), MfError> {
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;
        let local = self
            .table
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| s.name == name))
            .ok_or(MfError::NotFound)?;

        let global = self.global_lock.as_ref().ok_or(MfError::NotConnected)?;
        let _g = global.lock().map_err(MfError::lock)?;

        {
            let slot = self.table[local].as_ref().unwrap();
            let q = unsafe { QueueView::from_region(view.arena_ptr(slot.region_off)) };
            let _ql = slot.lock.lock().map_err(MfError::lock)?;
            if q.refcount() != 0 {
                return Err(MfError::QueueBusy);
            }
        }

        let slot = self.table[local].take().unwrap();
        let hdr = unsafe { &mut *view.header_ptr() };
        let max_queues = hdr.max_queues as usize;
        let block_count = hdr.block_count as usize;
        if let Some(entry) = hdr.registry[..max_queues]
            .iter_mut()
            .find(|e| e.used != 0 && e.region_off == slot.region_off)
        {
            entry.used = 0;
            entry.name_len = 0;
        }
        alloc::free(
            &mut hdr.bitmap,
            block_count,
            slot.region_off as usize / BLOCK_SIZE,
            slot.region_blocks as usize,
        )?;
        tracing::debug!("removed queue {:?}", name);
        Ok(())
    }

    /// Locate a named queue (locally bound or created by a peer), take a
    /// handle on it, and return the qid. Reopening a name this session
    /// already knows reuses its slot.
    pub fn open(&mut self, name: &str) -> Result<usize, MfError> {
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;

        if let Some(qid) = self
            .table
            .iter()
            .position(|s| s.as_ref().map_or(false, |s| s.name == name))
        {
            let slot = self.table[qid].as_ref().unwrap();
            let q = unsafe { QueueView::from_region(view.arena_ptr(slot.region_off)) };
            let _ql = slot.lock.lock().map_err(MfError::lock)?;
            q.inc_ref();
            return Ok(qid);
        }

        let local = self
            .table
            .iter()
            .position(|s| s.is_none())
            .ok_or(MfError::TableFull)?;

        let global = self.global_lock.as_ref().ok_or(MfError::NotConnected)?;
        let _g = global.lock().map_err(MfError::lock)?;

        let hdr = unsafe { &*view.header_ptr() };
        let max_queues = hdr.max_queues as usize;
        let entry = hdr.registry[..max_queues]
            .iter()
            .find(|e| e.matches(name))
            .ok_or(MfError::NotFound)?;
        let region_off = entry.region_off;
        let region_blocks = entry.region_blocks;

        let lock = attach_lock(view.arena_ptr(region_off))?;
        {
            let q = unsafe { QueueView::from_region(view.arena_ptr(region_off)) };
            let _ql = lock.lock().map_err(MfError::lock)?;
            q.inc_ref();
        }
        self.table[local] = Some(QueueSlot {
            name: name.to_string(),
            region_off,
            region_blocks,
            lock,
        });
        tracing::debug!("opened queue {:?} as qid {}", name, local);
        Ok(local)
    }

    /// Give a handle back. The local binding survives so the qid stays
    /// valid for a later reopen; only the shared count moves.
    pub fn close(&mut self, qid: usize) -> Result<(), MfError> {
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;
        let slot = self
            .table
            .get(qid)
            .and_then(|s| s.as_ref())
            .ok_or(MfError::InvalidHandle)?;
        let q = unsafe { QueueView::from_region(view.arena_ptr(slot.region_off)) };
        let _ql = slot.lock.lock().map_err(MfError::lock)?;
        q.dec_ref()?;
        Ok(())
    }

    /// Blocking send: write the message at the write cursor once a waitlist
    /// slot and enough contiguous space exist. While the queue is full the
    /// mutex is released, the thread sleeps one backoff interval, and the
    /// check repeats; there is no timeout in this design.
    pub fn send(&self, qid: usize, payload: &[u8]) -> Result<(), MfError> {
        let (q, lock) = self.data_path(qid)?;
        if slot_bytes(payload.len()) > q.capacity() {
            // Unsatisfiable forever; report instead of blocking for good.
            return Err(MfError::OutOfSpace);
        }
        loop {
            {
                let _ql = lock.lock().map_err(MfError::lock)?;
                if let Progress::Done(_) = q.try_push(payload)? {
                    return Ok(());
                }
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Blocking receive: deliver the oldest message into `buf`, waiting (by
    /// the same release/sleep/retry policy as send) while the waitlist is
    /// empty. A too-small buffer fails without consuming the message.
    pub fn recv(&self, qid: usize, buf: &mut [u8]) -> Result<usize, MfError> {
        let (q, lock) = self.data_path(qid)?;
        loop {
            {
                let _ql = lock.lock().map_err(MfError::lock)?;
                if let Progress::Done(len) = q.try_pop(buf)? {
                    return Ok(len);
                }
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Snapshot a queue's control block under its mutex.
    pub fn stats(&self, qid: usize) -> Result<QueueStats, MfError> {
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;
        let slot = self
            .table
            .get(qid)
            .and_then(|s| s.as_ref())
            .ok_or(MfError::InvalidHandle)?;
        let q = unsafe { QueueView::from_region(view.arena_ptr(slot.region_off)) };
        let _ql = slot.lock.lock().map_err(MfError::lock)?;
        Ok(QueueStats {
            capacity: q.capacity(),
            used_bytes: q.used_bytes() as usize,
            pending: q.pending() as usize,
            refcount: q.refcount(),
        })
    }

    fn data_path(&self, qid: usize) -> Result<(QueueView, &dyn LockImpl), MfError> {
        let view = self.view.as_ref().ok_or(MfError::NotConnected)?;
        let slot = self
            .table
            .get(qid)
            .and_then(|s| s.as_ref())
            .ok_or(MfError::InvalidQueue)?;
        let q = unsafe { QueueView::from_region(view.arena_ptr(slot.region_off)) };
        Ok((q, slot.lock.as_ref()))
    }

    fn release_local_state(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
        self.global_lock = None;
    }
}

fn validate_queue_name(name: &str) -> Result<(), MfError> {
    if name.is_empty() {
        return Err(MfError::Config("queue name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(MfError::Config(format!(
            "queue name exceeds {} bytes",
            MAX_NAME_BYTES
        )));
    }
    Ok(())
}

/// Lay a process-shared mutex down in a `LOCK_BYTES` reservation.
fn create_lock(lock_mem: *mut u8) -> Result<Box<dyn LockImpl>, MfError> {
    let needed = Mutex::size_of(Some(lock_mem));
    if needed > LOCK_BYTES {
        return Err(MfError::Lock(format!(
            "mutex needs {} bytes, only {} reserved",
            needed, LOCK_BYTES
        )));
    }
    let (lock, _) =
        unsafe { Mutex::new(lock_mem, lock_mem.add(LOCK_BYTES)).map_err(MfError::lock)? };
    Ok(lock)
}

/// Attach to a mutex some other process (or session) laid down.
fn attach_lock(lock_mem: *mut u8) -> Result<Box<dyn LockImpl>, MfError> {
    let (lock, _) =
        unsafe { Mutex::from_existing(lock_mem, lock_mem.add(LOCK_BYTES)).map_err(MfError::lock)? };
    Ok(lock)
}

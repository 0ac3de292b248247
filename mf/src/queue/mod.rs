//! Circular message store and FIFO waitlist for one queue region.
//!
//! A region is `QueueHeader` + `[MsgDesc; max_msgs]` + `data[capacity]`,
//! addressed through a per-process [`QueueView`]. Every mutation here
//! requires the queue mutex; the session layer owns that discipline, this
//! module only moves cursors and bytes.

use std::mem;
use std::ptr;

use crate::core::{MsgDesc, QueueHeader, MSG_ALIGN, MSG_HEADER_BYTES};
use crate::errors::MfError;

/// Bytes one stored message occupies: inline length header plus payload,
/// rounded up to the message granularity. Send, recv, and space accounting
/// all go through here.
pub const fn slot_bytes(len: usize) -> usize {
    (MSG_HEADER_BYTES + len + MSG_ALIGN - 1) & !(MSG_ALIGN - 1)
}

/// Outcome of a non-blocking attempt; `WouldBlock` tells the session layer
/// to release the mutex, sleep, and retry.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    Done(usize),
    WouldBlock,
}

/// Process-local resolution of one queue region. Plain pointers into the
/// mapping; safe to rebuild on every operation.
pub struct QueueView {
    header: *mut QueueHeader,
    descs: *mut MsgDesc,
    data: *mut u8,
}

impl QueueView {
    /// Resolve an existing region.
    ///
    /// # Safety
    /// `region` must point at a region initialized by [`QueueView::init_region`]
    /// and stay mapped for the view's lifetime.
    pub unsafe fn from_region(region: *mut u8) -> QueueView {
        let header = region as *mut QueueHeader;
        let descs = region.add(mem::size_of::<QueueHeader>()) as *mut MsgDesc;
        let max_msgs = (*header).max_msgs as usize;
        let data = (descs as *mut u8).add(max_msgs * mem::size_of::<MsgDesc>());
        QueueView { header, descs, data }
    }

    /// Stamp a fresh control block into `region` and resolve it. The queue
    /// mutex is laid down separately by the session layer.
    ///
    /// # Safety
    /// `region` must point at a zeroed, block-aligned run of at least
    /// `region_bytes(capacity, max_msgs)` bytes inside the mapped arena,
    /// and `name` must fit `MAX_NAME_BYTES`.
    pub unsafe fn init_region(
        region: *mut u8,
        name: &str,
        capacity: u32,
        max_msgs: u32,
    ) -> QueueView {
        let header = region as *mut QueueHeader;
        (*header).name_len = name.len() as u32;
        (*header).capacity = capacity;
        (*header).max_msgs = max_msgs;
        (*header).read_pos = 0;
        (*header).write_pos = 0;
        (*header).used_bytes = 0;
        (*header).refcount = 0;
        (*header).wl_head = 0;
        (*header).wl_len = 0;
        ptr::copy_nonoverlapping(
            name.as_ptr(),
            ptr::addr_of_mut!((*header).name) as *mut u8,
            name.len(),
        );
        QueueView::from_region(region)
    }

    pub fn capacity(&self) -> usize {
        unsafe { (*self.header).capacity as usize }
    }

    pub fn refcount(&self) -> u32 {
        unsafe { (*self.header).refcount }
    }

    pub fn pending(&self) -> u32 {
        unsafe { (*self.header).wl_len }
    }

    pub fn used_bytes(&self) -> u32 {
        unsafe { (*self.header).used_bytes }
    }

    pub fn inc_ref(&self) -> u32 {
        unsafe {
            (*self.header).refcount += 1;
            (*self.header).refcount
        }
    }

    /// Never lets the count go below zero; a decrement at zero is caller
    /// misuse reported as underflow.
    pub fn dec_ref(&self) -> Result<u32, MfError> {
        unsafe {
            if (*self.header).refcount == 0 {
                return Err(MfError::RefcountUnderflow);
            }
            (*self.header).refcount -= 1;
            Ok((*self.header).refcount)
        }
    }

    /// Append one message if a descriptor slot and a contiguous run of data
    /// bytes are both available. Caller holds the queue mutex.
    pub fn try_push(&self, payload: &[u8]) -> Result<Progress, MfError> {
        unsafe {
            let h = &mut *self.header;
            let cap = h.capacity as usize;
            let need = slot_bytes(payload.len());
            if need > cap {
                return Err(MfError::OutOfSpace);
            }
            if h.wl_len >= h.max_msgs {
                return Ok(Progress::WouldBlock);
            }
            let free = cap - h.used_bytes as usize;
            if need > free {
                return Ok(Progress::WouldBlock);
            }
            if h.used_bytes == 0 {
                // Empty queue: normalize so messages start contiguous.
                h.read_pos = 0;
                h.write_pos = 0;
            }
            let wp = h.write_pos as usize;
            let rp = h.read_pos as usize;
            let at = if wp >= rp {
                if wp + need <= cap {
                    wp
                } else if rp >= need {
                    // The free space wraps: pad out the tail gap and place
                    // the message at the start of the data area. The pad is
                    // reclaimed when the read cursor passes it.
                    h.used_bytes += (cap - wp) as u32;
                    h.write_pos = 0;
                    0
                } else {
                    return Ok(Progress::WouldBlock);
                }
            } else {
                // Already wrapped; the free run is exactly rp - wp and we
                // know need fits it from the total-free check above.
                wp
            };

            let dst = self.data.add(at);
            dst.copy_from_nonoverlapping(
                (payload.len() as u32).to_le_bytes().as_ptr(),
                MSG_HEADER_BYTES,
            );
            ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(MSG_HEADER_BYTES), payload.len());

            let slot = (h.wl_head + h.wl_len) % h.max_msgs;
            *self.descs.add(slot as usize) = MsgDesc {
                offset: at as u32,
                len: payload.len() as u32,
            };
            h.wl_len += 1;
            h.used_bytes += need as u32;
            let mut wp = at + need;
            if wp == cap {
                wp = 0;
            }
            h.write_pos = wp as u32;
            Ok(Progress::Done(payload.len()))
        }
    }

    /// Deliver the oldest undelivered message into `buf`. Caller holds the
    /// queue mutex. A buffer too small for the front message fails without
    /// consuming it, so a retry with a larger buffer still sees it.
    pub fn try_pop(&self, buf: &mut [u8]) -> Result<Progress, MfError> {
        unsafe {
            let h = &mut *self.header;
            if h.wl_len == 0 {
                return Ok(Progress::WouldBlock);
            }
            let desc = *self.descs.add(h.wl_head as usize);
            let len = desc.len as usize;
            if len > buf.len() {
                return Err(MfError::BufferTooSmall {
                    needed: len,
                    provided: buf.len(),
                });
            }

            let cap = h.capacity as usize;
            let mut rp = h.read_pos as usize;
            if desc.offset as usize != rp {
                // The message wrapped to the front; the bytes from the read
                // cursor to the end of the data area are send-side padding.
                if desc.offset != 0 || rp == 0 {
                    return Err(MfError::Corrupted("waitlist descriptor off the read cursor"));
                }
                h.used_bytes -= (cap - rp) as u32;
                rp = 0;
            }

            let src = self.data.add(rp);
            let mut stored = [0u8; MSG_HEADER_BYTES];
            ptr::copy_nonoverlapping(src, stored.as_mut_ptr(), MSG_HEADER_BYTES);
            if u32::from_le_bytes(stored) != desc.len {
                return Err(MfError::Corrupted("message header disagrees with descriptor"));
            }
            ptr::copy_nonoverlapping(src.add(MSG_HEADER_BYTES), buf.as_mut_ptr(), len);

            let need = slot_bytes(len);
            h.used_bytes -= need as u32;
            rp += need;
            if rp == cap {
                rp = 0;
            }
            h.read_pos = rp as u32;
            h.wl_head = (h.wl_head + 1) % h.max_msgs;
            h.wl_len -= 1;
            Ok(Progress::Done(len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region_bytes;

    // Heap-backed region: the view never touches the lock area, so the ring
    // logic is exercisable without shared memory or mutexes.
    fn region(capacity: u32, max_msgs: u32) -> Vec<u64> {
        vec![0u64; region_bytes(capacity as usize, max_msgs as usize) / 8]
    }

    fn view(backing: &mut Vec<u64>, capacity: u32, max_msgs: u32) -> QueueView {
        unsafe { QueueView::init_region(backing.as_mut_ptr() as *mut u8, "q", capacity, max_msgs) }
    }

    fn pop(v: &QueueView, buf: &mut [u8]) -> Vec<u8> {
        match v.try_pop(buf).unwrap() {
            Progress::Done(n) => buf[..n].to_vec(),
            Progress::WouldBlock => panic!("queue unexpectedly empty"),
        }
    }

    #[test]
    fn fifo_round_trip() {
        let mut backing = region(256, 8);
        let v = view(&mut backing, 256, 8);
        assert_eq!(v.try_push(b"AAAA").unwrap(), Progress::Done(4));
        assert_eq!(v.try_push(b"BBBBBBBB").unwrap(), Progress::Done(8));
        let mut buf = [0u8; 16];
        assert_eq!(pop(&v, &mut buf), b"AAAA");
        assert_eq!(pop(&v, &mut buf), b"BBBBBBBB");
        assert_eq!(v.try_pop(&mut buf).unwrap(), Progress::WouldBlock);
        assert_eq!(v.used_bytes(), 0);
    }

    #[test]
    fn full_queue_would_block_until_space() {
        // Each 10-byte payload occupies slot_bytes(10) == 16 bytes.
        let mut backing = region(32, 8);
        let v = view(&mut backing, 32, 8);
        assert_eq!(v.try_push(b"0123456789").unwrap(), Progress::Done(10));
        assert_eq!(v.try_push(b"abcdefghij").unwrap(), Progress::Done(10));
        assert_eq!(v.try_push(b"KLMNOPQRST").unwrap(), Progress::WouldBlock);

        let mut buf = [0u8; 16];
        assert_eq!(pop(&v, &mut buf), b"0123456789");
        assert_eq!(v.try_push(b"KLMNOPQRST").unwrap(), Progress::Done(10));
    }

    #[test]
    fn oversized_message_is_an_error_not_a_block() {
        let mut backing = region(32, 8);
        let v = view(&mut backing, 32, 8);
        assert!(matches!(v.try_push(&[0u8; 40]), Err(MfError::OutOfSpace)));
    }

    #[test]
    fn wraparound_pads_tail_and_reclaims_it() {
        // Three 16-byte slots would need 48; capacity 40 forces the third
        // message to wrap past an 8-byte tail pad.
        let mut backing = region(40, 8);
        let v = view(&mut backing, 40, 8);
        assert_eq!(v.try_push(b"0123456789").unwrap(), Progress::Done(10));
        assert_eq!(v.try_push(b"abcdefghij").unwrap(), Progress::Done(10));
        let mut buf = [0u8; 16];
        assert_eq!(pop(&v, &mut buf), b"0123456789");

        // 16 data bytes free but only 8 contiguous at the tail; the push
        // pads the tail and lands at offset 0.
        assert_eq!(v.try_push(b"KLMNOPQRST").unwrap(), Progress::Done(10));
        assert_eq!(v.used_bytes(), 40);

        assert_eq!(pop(&v, &mut buf), b"abcdefghij");
        assert_eq!(pop(&v, &mut buf), b"KLMNOPQRST");
        assert_eq!(v.used_bytes(), 0);
    }

    #[test]
    fn waitlist_depth_limits_pending_messages() {
        let mut backing = region(256, 2);
        let v = view(&mut backing, 256, 2);
        assert_eq!(v.try_push(b"a").unwrap(), Progress::Done(1));
        assert_eq!(v.try_push(b"b").unwrap(), Progress::Done(1));
        assert_eq!(v.try_push(b"c").unwrap(), Progress::WouldBlock);
        let mut buf = [0u8; 8];
        assert_eq!(pop(&v, &mut buf), b"a");
        assert_eq!(v.try_push(b"c").unwrap(), Progress::Done(1));
        assert_eq!(pop(&v, &mut buf), b"b");
        assert_eq!(pop(&v, &mut buf), b"c");
    }

    #[test]
    fn small_buffer_leaves_message_in_place() {
        let mut backing = region(64, 4);
        let v = view(&mut backing, 64, 4);
        v.try_push(b"BBBBBBBB").unwrap();
        let mut small = [0u8; 4];
        assert!(matches!(
            v.try_pop(&mut small),
            Err(MfError::BufferTooSmall { needed: 8, provided: 4 })
        ));
        assert_eq!(v.pending(), 1);
        let mut big = [0u8; 16];
        assert_eq!(pop(&v, &mut big), b"BBBBBBBB");
    }

    #[test]
    fn refcount_guards_underflow() {
        let mut backing = region(64, 4);
        let v = view(&mut backing, 64, 4);
        assert_eq!(v.inc_ref(), 1);
        assert_eq!(v.inc_ref(), 2);
        assert_eq!(v.dec_ref().unwrap(), 1);
        assert_eq!(v.dec_ref().unwrap(), 0);
        assert!(matches!(v.dec_ref(), Err(MfError::RefcountUnderflow)));
        assert_eq!(v.refcount(), 0);
    }
}

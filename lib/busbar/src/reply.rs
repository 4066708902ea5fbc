use hashbrown::HashMap;

use crate::dispatch::DispatchCtx;
use crate::message::{error_name, Message};
use crate::support::{BusResult, Fault, Handled};

pub type ReplyCallback = Box<dyn FnMut(&mut DispatchCtx, &Message) -> BusResult<Handled>>;

/// Deadline sentinel for calls that never expire.
pub const NEVER: u64 = 0;

/// One outstanding method call awaiting its reply.
pub struct PendingCall {
    serial: u32,
    deadline: u64,
    heap_pos: Option<usize>,
    callback: ReplyCallback,
}

impl PendingCall {
    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    #[inline]
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    #[inline]
    pub(crate) fn invoke(&mut self, ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
        (self.callback)(ctx, message)
    }
}

/// Maps outgoing call serials to pending calls and orders the expiring
/// ones in a min-heap on deadline. Entries know their heap slot, so
/// removal by serial is O(log n). An entry sits in the heap iff its
/// deadline is not `NEVER`.
pub struct ReplyTracker {
    entries: HashMap<u32, PendingCall>,
    heap: Vec<u32>,
}

impl ReplyTracker {
    pub fn new() -> ReplyTracker {
        ReplyTracker {
            entries: HashMap::new(),
            heap: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a pending call under its serial. A deadline of `NEVER`
    /// keeps the entry out of the heap.
    pub fn register(&mut self, serial: u32, deadline: u64, callback: ReplyCallback) -> BusResult<()> {
        if serial == 0 {
            return Err(Fault::InvalidArgument.into());
        }
        if self.entries.contains_key(&serial) {
            return Err(Fault::AlreadyExists.into());
        }

        self.entries.insert(
            serial,
            PendingCall {
                serial,
                deadline,
                heap_pos: None,
                callback,
            },
        );

        if deadline != NEVER {
            self.heap_insert(serial);
        }

        Ok(())
    }

    /// Removes the entry for `serial`. Returns whether one existed.
    pub fn cancel(&mut self, serial: u32) -> bool {
        self.take(serial).is_some()
    }

    /// Removes and returns the entry a reply message resolves, if any.
    pub(crate) fn take_for_reply(&mut self, reply_serial: u32) -> Option<PendingCall> {
        self.take(reply_serial)
    }

    /// Removes and returns the entry with the earliest elapsed deadline.
    /// At most one expiry is reported per call.
    pub(crate) fn take_expired(&mut self, now: u64) -> Option<PendingCall> {
        let serial = *self.heap.first()?;
        if self.entries[&serial].deadline > now {
            return None;
        }
        self.take(serial)
    }

    /// The earliest deadline among expiring entries.
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.heap.first().map(|serial| self.entries[serial].deadline)
    }

    fn take(&mut self, serial: u32) -> Option<PendingCall> {
        let entry = self.entries.remove(&serial)?;
        if let Some(pos) = entry.heap_pos {
            self.heap_remove_at(pos);
        }
        Some(entry)
    }

    fn heap_insert(&mut self, serial: u32) {
        self.heap.push(serial);
        let pos = self.heap.len() - 1;
        self.set_pos(pos);
        self.sift_up(pos);
    }

    fn heap_remove_at(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        self.heap.pop();

        if pos < self.heap.len() {
            self.set_pos(pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.deadline_at(pos) >= self.deadline_at(parent) {
                break;
            }
            self.heap.swap(pos, parent);
            self.set_pos(pos);
            self.set_pos(parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;

            if left < self.heap.len() && self.deadline_at(left) < self.deadline_at(smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.deadline_at(right) < self.deadline_at(smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }

            self.heap.swap(pos, smallest);
            self.set_pos(pos);
            self.set_pos(smallest);
            pos = smallest;
        }
    }

    #[inline]
    fn deadline_at(&self, pos: usize) -> u64 {
        self.entries[&self.heap[pos]].deadline
    }

    #[inline]
    fn set_pos(&mut self, pos: usize) {
        let serial = self.heap[pos];
        self.entries
            .get_mut(&serial)
            .expect("Heap entry must exist in the serial map")
            .heap_pos = Some(pos);
    }
}

/// Builds the synthetic timeout error delivered for an expired call.
pub(crate) fn timeout_error(serial: u32) -> Message {
    Message::synthetic_error(serial, error_name::TIMEOUT, "Method call timed out")
}

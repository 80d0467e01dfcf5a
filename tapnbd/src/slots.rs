//! Request slot arena.
//!
//! A fixed pool of request slots threaded onto three doubly-linked lists
//! (free, pending-to-send, sent-awaiting-reply) by index, so a slot moves
//! between lists in O(1) with no allocation after construction. Every slot
//! is on exactly one list at any moment.

use bytes::{Bytes, BytesMut};
use nbd::{Handle, NbdCommand, NbdRequest};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotQueue {
    Free = 0,
    Pending = 1,
    Sent = 2,
}

/// Request payload. Reads own their destination until completion hands it
/// back; writes hold the caller's bytes until fully on the wire.
#[derive(Debug, Default)]
pub(crate) enum SlotBody {
    #[default]
    None,
    Read(BytesMut),
    Write(Bytes),
}

impl SlotBody {
    pub(crate) fn len(&self) -> usize {
        match self {
            SlotBody::None => 0,
            SlotBody::Read(buf) => buf.len(),
            SlotBody::Write(buf) => buf.len(),
        }
    }

    /// Reclaim the read destination buffer, if any.
    pub(crate) fn take_read_buf(&mut self) -> Option<BytesMut> {
        match std::mem::take(self) {
            SlotBody::Read(buf) => Some(buf),
            other => {
                *self = other;
                None
            }
        }
    }
}

pub(crate) struct Slot {
    pub token: u64,
    pub command: NbdCommand,
    pub handle: Handle,
    pub header: [u8; NbdRequest::SIZE_BYTES],
    pub header_done: usize,
    pub body: SlotBody,
    pub body_done: usize,

    prev: usize,
    next: usize,
    queue: SlotQueue,
}

impl Slot {
    fn unused() -> Self {
        Self {
            token: 0,
            command: NbdCommand::Disconnect,
            handle: [0; 8],
            header: [0; NbdRequest::SIZE_BYTES],
            header_done: 0,
            body: SlotBody::None,
            body_done: 0,
            prev: NIL,
            next: NIL,
            queue: SlotQueue::Free,
        }
    }
}

#[derive(Clone, Copy)]
struct ListHead {
    head: usize,
    tail: usize,
    len: usize,
}

impl ListHead {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

pub(crate) struct SlotArena {
    slots: Vec<Slot>,
    lists: [ListHead; 3],
}

impl SlotArena {
    /// All slots start on the free list.
    pub(crate) fn new(capacity: usize) -> Self {
        let mut arena = Self {
            slots: (0..capacity).map(|_| Slot::unused()).collect(),
            lists: [ListHead::EMPTY; 3],
        };
        for idx in 0..capacity {
            arena.push_tail(idx, SlotQueue::Free);
        }
        arena
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self, queue: SlotQueue) -> usize {
        self.lists[queue as usize].len
    }

    pub(crate) fn head(&self, queue: SlotQueue) -> Option<usize> {
        match self.lists[queue as usize].head {
            NIL => None,
            idx => Some(idx),
        }
    }

    /// Successor of `idx` on whatever list it is currently on.
    pub(crate) fn next(&self, idx: usize) -> Option<usize> {
        match self.slots[idx].next {
            NIL => None,
            next => Some(next),
        }
    }

    pub(crate) fn get(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// Move a slot to the tail of another (or the same) list.
    pub(crate) fn move_to_tail(&mut self, idx: usize, queue: SlotQueue) {
        self.unlink(idx);
        self.push_tail(idx, queue);
    }

    /// First slot on `queue` satisfying the predicate.
    pub(crate) fn find(
        &self,
        queue: SlotQueue,
        mut pred: impl FnMut(&Slot) -> bool,
    ) -> Option<usize> {
        let mut cursor = self.head(queue);
        while let Some(idx) = cursor {
            if pred(&self.slots[idx]) {
                return Some(idx);
            }
            cursor = self.next(idx);
        }
        None
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next, queue) = {
            let slot = &self.slots[idx];
            (slot.prev, slot.next, slot.queue)
        };
        let list = &mut self.lists[queue as usize];
        list.len -= 1;
        if prev == NIL {
            list.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            list.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_tail(&mut self, idx: usize, queue: SlotQueue) {
        let list = &mut self.lists[queue as usize];
        let old_tail = list.tail;
        list.tail = idx;
        list.len += 1;
        if old_tail == NIL {
            list.head = idx;
        } else {
            self.slots[old_tail].next = idx;
        }
        let slot = &mut self.slots[idx];
        slot.prev = old_tail;
        slot.next = NIL;
        slot.queue = queue;
    }
}

// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;

use crate::{BlockDev, BlockRequest};
use util::aio::{get_iov_size, Iovec};

/// Worker threads serving one request queue.
pub(crate) const BLOCKIF_NUMTHR: usize = 8;
/// Request slots per queue; the queue depth exposed to guests is one less.
pub(crate) const BLOCKIF_MAXREQ: usize = 64 + BLOCKIF_NUMTHR;

/// Key value for requests that never block successors.
const BLOCK_KEY_NONE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOp {
    Read,
    Write,
    Flush,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqStatus {
    Free,
    Block,
    Pend,
    Busy,
    Done,
}

/// One ring position holding an in-flight request.
pub(crate) struct ReqSlot {
    pub req: Option<Arc<BlockRequest>>,
    pub op: BlockOp,
    pub status: ReqStatus,
    pub worker: libc::pthread_t,
    /// End offset of the request's data range, used to serialize a
    /// successor starting exactly there.
    pub block_key: u64,
    /// Iovec snapshot handed to the kernel ring; its address must stay
    /// stable until the completion is reaped.
    submit_iov: Vec<Iovec>,
    prev: Option<u16>,
    next: Option<u16>,
}

impl ReqSlot {
    fn new() -> Self {
        ReqSlot {
            req: None,
            op: BlockOp::Flush,
            status: ReqStatus::Free,
            worker: 0,
            block_key: BLOCK_KEY_NONE,
            submit_iov: Vec::new(),
            prev: None,
            next: None,
        }
    }
}

/// Intrusive list over the slot arena. Linking and unlinking are O(1);
/// the links live in the slots themselves.
#[derive(Default)]
struct SlotList {
    head: Option<u16>,
    tail: Option<u16>,
    len: usize,
}

impl SlotList {
    fn push_tail(&mut self, slots: &mut [ReqSlot], idx: u16) {
        slots[idx as usize].prev = self.tail;
        slots[idx as usize].next = None;
        match self.tail {
            Some(tail) => slots[tail as usize].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    fn push_head(&mut self, slots: &mut [ReqSlot], idx: u16) {
        slots[idx as usize].prev = None;
        slots[idx as usize].next = self.head;
        match self.head {
            Some(head) => slots[head as usize].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    fn remove(&mut self, slots: &mut [ReqSlot], idx: u16) {
        let prev = slots[idx as usize].prev;
        let next = slots[idx as usize].next;
        match prev {
            Some(prev) => slots[prev as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => slots[next as usize].prev = prev,
            None => self.tail = prev,
        }
        slots[idx as usize].prev = None;
        slots[idx as usize].next = None;
        self.len -= 1;
    }
}

/// Result of an enqueue attempt. Only `Pend` calls for waking the backend;
/// a `Block`ed slot becomes pendable when its predecessor completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    NoSlot,
    Pend,
    Block,
}

pub(crate) struct QueueInner {
    pub closing: bool,
    slots: Vec<ReqSlot>,
    freeq: SlotList,
    pendq: SlotList,
    busyq: SlotList,
}

impl QueueInner {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(BLOCKIF_MAXREQ);
        for _ in 0..BLOCKIF_MAXREQ {
            slots.push(ReqSlot::new());
        }
        let mut freeq = SlotList::default();
        for idx in 0..BLOCKIF_MAXREQ {
            freeq.push_head(&mut slots, idx as u16);
        }
        QueueInner {
            closing: false,
            slots,
            freeq,
            pendq: SlotList::default(),
            busyq: SlotList::default(),
        }
    }

    pub fn enqueue(&mut self, req: Arc<BlockRequest>, op: BlockOp, bst_block: bool) -> Enqueue {
        let Some(idx) = self.freeq.head else {
            return Enqueue::NoSlot;
        };
        self.freeq.remove(&mut self.slots, idx);

        let mut block_key = BLOCK_KEY_NONE;
        let mut status = ReqStatus::Pend;
        if bst_block {
            if matches!(op, BlockOp::Read | BlockOp::Write | BlockOp::Discard) {
                block_key = req.offset + get_iov_size(&req.iovec);
            }
            // A request starting exactly where an outstanding one ends
            // waits for that predecessor.
            if self.list_has_key(&self.pendq, req.offset)
                || self.list_has_key(&self.busyq, req.offset)
            {
                status = ReqStatus::Block;
            }
        }

        let slot = &mut self.slots[idx as usize];
        slot.req = Some(req);
        slot.op = op;
        slot.status = status;
        slot.worker = 0;
        slot.block_key = block_key;
        self.pendq.push_tail(&mut self.slots, idx);

        if status == ReqStatus::Pend {
            Enqueue::Pend
        } else {
            Enqueue::Block
        }
    }

    fn list_has_key(&self, list: &SlotList, offset: u64) -> bool {
        let mut cur = list.head;
        while let Some(idx) = cur {
            if self.slots[idx as usize].block_key == offset {
                return true;
            }
            cur = self.slots[idx as usize].next;
        }
        false
    }

    /// Take the first pendable slot, mark it busy and stamp the worker.
    pub fn dequeue(
        &mut self,
        worker: libc::pthread_t,
    ) -> Option<(u16, Arc<BlockRequest>, BlockOp)> {
        let mut cur = self.pendq.head;
        while let Some(idx) = cur {
            if self.slots[idx as usize].status == ReqStatus::Pend {
                break;
            }
            cur = self.slots[idx as usize].next;
        }
        let idx = cur?;
        self.pendq.remove(&mut self.slots, idx);
        let slot = &mut self.slots[idx as usize];
        slot.status = ReqStatus::Busy;
        slot.worker = worker;
        let req = slot.req.clone().unwrap();
        let op = slot.op;
        self.busyq.push_tail(&mut self.slots, idx);
        Some((idx, req, op))
    }

    pub fn set_done(&mut self, idx: u16) {
        self.slots[idx as usize].status = ReqStatus::Done;
    }

    /// Retire a slot: unlink it, promote one-hop successors when the
    /// interlock is on, clear it and return it to the free pool.
    pub fn complete(&mut self, idx: u16, bst_block: bool) {
        let status = self.slots[idx as usize].status;
        if status == ReqStatus::Busy || status == ReqStatus::Done {
            self.busyq.remove(&mut self.slots, idx);
        } else {
            self.pendq.remove(&mut self.slots, idx);
        }

        if bst_block {
            let block_key = self.slots[idx as usize].block_key;
            let mut cur = self.pendq.head;
            while let Some(pidx) = cur {
                let slot = &mut self.slots[pidx as usize];
                if slot.status == ReqStatus::Block
                    && slot.req.as_ref().map_or(false, |r| r.offset == block_key)
                {
                    slot.status = ReqStatus::Pend;
                }
                cur = self.slots[pidx as usize].next;
            }
        }

        let slot = &mut self.slots[idx as usize];
        slot.req = None;
        slot.status = ReqStatus::Free;
        slot.worker = 0;
        slot.block_key = BLOCK_KEY_NONE;
        slot.submit_iov.clear();
        self.freeq.push_head(&mut self.slots, idx);
    }

    /// Move a slot the ring could not accept back to the head of the
    /// pending list so order is preserved.
    pub fn requeue_head(&mut self, idx: u16) {
        self.busyq.remove(&mut self.slots, idx);
        let slot = &mut self.slots[idx as usize];
        slot.status = ReqStatus::Pend;
        slot.worker = 0;
        slot.submit_iov.clear();
        self.pendq.push_head(&mut self.slots, idx);
    }

    /// Park the iovec snapshot in the slot and return its raw view for the
    /// submission queue entry.
    pub fn set_submit_iov(&mut self, idx: u16, iovecs: Vec<Iovec>) -> (*const Iovec, u32) {
        let slot = &mut self.slots[idx as usize];
        slot.submit_iov = iovecs;
        (slot.submit_iov.as_ptr(), slot.submit_iov.len() as u32)
    }

    pub fn req_of(&self, idx: u16) -> Option<(Arc<BlockRequest>, BlockOp)> {
        let slot = self.slots.get(idx as usize)?;
        slot.req.clone().map(|req| (req, slot.op))
    }

    fn find_in(&self, list: &SlotList, req: &Arc<BlockRequest>) -> Option<u16> {
        let mut cur = list.head;
        while let Some(idx) = cur {
            if self.slots[idx as usize]
                .req
                .as_ref()
                .map_or(false, |r| Arc::ptr_eq(r, req))
            {
                return Some(idx);
            }
            cur = self.slots[idx as usize].next;
        }
        None
    }

    pub fn find_pending(&self, req: &Arc<BlockRequest>) -> Option<u16> {
        self.find_in(&self.pendq, req)
    }

    pub fn find_busy(&self, req: &Arc<BlockRequest>) -> Option<(u16, libc::pthread_t)> {
        self.find_in(&self.busyq, req)
            .map(|idx| (idx, self.slots[idx as usize].worker))
    }

    pub fn busy_holds(&self, idx: u16, req: &Arc<BlockRequest>) -> bool {
        let slot = &self.slots[idx as usize];
        slot.status == ReqStatus::Busy
            && slot.req.as_ref().map_or(false, |r| Arc::ptr_eq(r, req))
    }

    pub fn pendq_len(&self) -> usize {
        self.pendq.len
    }

    #[cfg(test)]
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.freeq.len, self.pendq.len, self.busyq.len)
    }

    #[cfg(test)]
    pub fn status_of(&self, idx: u16) -> ReqStatus {
        self.slots[idx as usize].status
    }
}

/// One request queue with its scheduling state and io backend.
pub(crate) struct BlockQueue {
    pub dev: Arc<BlockDev>,
    pub inner: Mutex<QueueInner>,
    pub cond: Condvar,
    pub backend: Box<dyn BlockIoBackend>,
}

/// Execution backend bound to one queue. The thread pool runs workers that
/// block on the queue condvar; the ring backend is driven by the event
/// loop through `completion_cb`.
pub(crate) trait BlockIoBackend: Send + Sync {
    fn init(&self, queue: &Arc<BlockQueue>, tag: &str) -> Result<()>;
    fn deinit(&self, queue: &Arc<BlockQueue>);
    /// A request just became pendable.
    fn request(&self, queue: &Arc<BlockQueue>);
    /// The backend's readiness descriptor fired.
    fn completion_cb(&self, _queue: &Arc<BlockQueue>) {}
}

/// Terminal sequence shared by inline completions: mark done, fire the
/// callback outside the queue lock, then retire the slot.
pub(crate) fn finish_request(queue: &Arc<BlockQueue>, idx: u16, req: &Arc<BlockRequest>, err: i32) {
    queue.inner.lock().unwrap().set_done(idx);
    req.complete(err);
    queue.inner.lock().unwrap().complete(idx, queue.dev.bst_block);
}

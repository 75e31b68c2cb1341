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

//! Worker-thread backend: a fixed pool per queue executing requests with
//! positional vector io. Workers sleep on the queue condvar; syscalls run
//! outside the queue lock. An in-flight request is cancelled by delivering
//! SIGCONT to its worker so the blocking syscall fails with EINTR.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;

use anyhow::{Context, Result};
use log::error;

use crate::align;
use crate::discard::process_discard;
use crate::queue::{BlockIoBackend, BlockOp, BlockQueue, BLOCKIF_NUMTHR};
use crate::{BlockDev, BlockRequest};
use util::aio::{raw_fsync, raw_readv, raw_writev};

pub(crate) struct ThreadPoolBackend {
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolBackend {
    pub fn new() -> Self {
        ThreadPoolBackend {
            threads: Mutex::new(Vec::new()),
        }
    }
}

impl BlockIoBackend for ThreadPoolBackend {
    fn init(&self, queue: &Arc<BlockQueue>, tag: &str) -> Result<()> {
        register_sigcont_handler();

        let mut threads = self.threads.lock().unwrap();
        for i in 0..BLOCKIF_NUMTHR {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", tag, i))
                .spawn(move || worker_loop(queue))
                .with_context(|| format!("Failed to spawn block io worker {}-{}", tag, i))?;
            threads.push(handle);
        }
        Ok(())
    }

    fn deinit(&self, _queue: &Arc<BlockQueue>) {
        // closing has been set and the condvar broadcast by the caller.
        for handle in self.threads.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                error!("Block io worker exited abnormally.");
            }
        }
    }

    fn request(&self, queue: &Arc<BlockQueue>) {
        queue.cond.notify_one();
    }
}

fn worker_loop(queue: Arc<BlockQueue>) {
    // SAFETY: trivially safe.
    let tid = unsafe { libc::pthread_self() };

    let mut inner = queue.inner.lock().unwrap();
    loop {
        while let Some((idx, req, op)) = inner.dequeue(tid) {
            drop(inner);
            let err = process_request(&queue.dev, &req, op);
            queue.inner.lock().unwrap().set_done(idx);
            // The terminal callback runs before the slot goes back to the
            // free pool, and never under the queue lock.
            req.complete(err);
            inner = queue.inner.lock().unwrap();
            inner.complete(idx, queue.dev.bst_block);
        }
        if inner.closing {
            break;
        }
        inner = queue.cond.wait(inner).unwrap();
    }
}

/// Execute one request against the backing descriptor. Returns 0 or a
/// positive errno handed to the request callback.
fn process_request(dev: &Arc<BlockDev>, req: &Arc<BlockRequest>, op: BlockOp) -> i32 {
    match op {
        BlockOp::Read => {
            let (iovecs, offset, converted, org_size) = align::io_vector(dev, req);
            let len = raw_readv(dev.fd(), &iovecs, offset as usize);
            if converted {
                if len >= 0 {
                    align::complete_bounced_read(req);
                }
                align::deinit_bounce_iov(req);
            }
            if len < 0 {
                return (-len) as i32;
            }
            req.consume_resid(if converted { org_size } else { len as u64 });
            0
        }
        BlockOp::Write => {
            if dev.read_only {
                align::deinit_bounce_iov(req);
                return libc::EROFS;
            }
            let (iovecs, offset, converted, org_size) = align::io_vector(dev, req);
            let len = raw_writev(dev.fd(), &iovecs, offset as usize);
            if converted {
                align::deinit_bounce_iov(req);
            }
            if len < 0 {
                return (-len) as i32;
            }
            req.consume_resid(if converted { org_size } else { len as u64 });
            dev.flush_cache()
        }
        BlockOp::Flush => {
            let ret = raw_fsync(dev.fd());
            if ret < 0 {
                (-ret) as i32
            } else {
                0
            }
        }
        BlockOp::Discard => process_discard(dev, req),
    }
}

/// A canceller waiting for its SIGCONT delivery to be acknowledged by the
/// handler. Entries form a process-wide lock-free LIFO.
struct SigElem {
    pending: Mutex<bool>,
    cond: Condvar,
    next: *mut SigElem,
}

static SIG_LIFO: AtomicPtr<SigElem> = AtomicPtr::new(ptr::null_mut());
static SIG_ONCE: Once = Once::new();

extern "C" fn sigcont_handler(_sig: libc::c_int) {
    // Drain the whole list, entries of other cancellers included.
    loop {
        let head = SIG_LIFO.load(Ordering::Acquire);
        if head.is_null() {
            return;
        }
        // SAFETY: an entry stays alive until its waiter is woken below.
        let next = unsafe { (*head).next };
        if SIG_LIFO
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        // SAFETY: the entry was just unlinked and its owner still waits on it.
        unsafe {
            let elem = &*head;
            let mut pending = elem.pending.lock().unwrap();
            *pending = false;
            elem.cond.notify_one();
        }
    }
}

fn register_sigcont_handler() {
    SIG_ONCE.call_once(|| {
        // SAFETY: installs a process-wide handler for a signal the process
        // does not use otherwise.
        unsafe {
            let mut act: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = sigcont_handler;
            act.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut act.sa_mask);
            // SA_RESTART stays off: a blocking io syscall must fail with
            // EINTR for cancellation to make progress.
            act.sa_flags = 0;
            if libc::sigaction(libc::SIGCONT, &act, ptr::null_mut()) != 0 {
                error!(
                    "Failed to install SIGCONT handler: {:?}",
                    std::io::Error::last_os_error()
                );
            }
        }
    });
}

/// Deliver one SIGCONT to the worker and wait until the handler has
/// acknowledged it.
pub(crate) fn interrupt_worker(tid: libc::pthread_t) {
    let elem = Box::into_raw(Box::new(SigElem {
        pending: Mutex::new(true),
        cond: Condvar::new(),
        next: ptr::null_mut(),
    }));

    loop {
        let head = SIG_LIFO.load(Ordering::Acquire);
        // SAFETY: elem is not shared until the exchange below succeeds.
        unsafe { (*elem).next = head };
        if SIG_LIFO
            .compare_exchange(head, elem, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }

    // SAFETY: tid identifies a live worker thread owning a busy slot.
    unsafe { libc::pthread_kill(tid, libc::SIGCONT) };

    // SAFETY: elem stays valid until the handler has woken us.
    unsafe {
        let waiter = &*elem;
        let mut pending = waiter.pending.lock().unwrap();
        while *pending {
            pending = waiter.cond.wait(pending).unwrap();
        }
    }
    // SAFETY: the handler unlinked the entry before waking us, nothing else
    // can reach it.
    unsafe { drop(Box::from_raw(elem)) };
}

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

//! io_uring backend: requests are turned into submission queue entries and
//! reaped when the ring's eventfd fires. There is no worker thread; the
//! external event loop owns the thread of control, so queue state sees no
//! contention. Discard has no ring opcode here and runs inline.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use io_uring::{opcode, types, IoUring};
use log::error;
use vmm_sys_util::eventfd::EventFd;

use crate::align;
use crate::discard::process_discard;
use crate::queue::{finish_request, BlockIoBackend, BlockOp, BlockQueue};
use crate::EventLoop;

/// Entries in the submission/completion queue pair. Polling setup modes are
/// not enabled; they only pay off with dedicated cores.
pub(crate) const MAX_IO_URING_ENTRIES: u32 = 256;

pub(crate) struct UringBackend {
    ring: Mutex<IoUring>,
    evt_fd: EventFd,
    in_flight: AtomicU32,
    event_loop: Arc<dyn EventLoop>,
}

impl UringBackend {
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Result<Self> {
        let ring = IoUring::new(MAX_IO_URING_ENTRIES)
            .with_context(|| "Failed to create io_uring instance")?;
        let evt_fd = EventFd::new(libc::EFD_NONBLOCK)
            .with_context(|| "Failed to create eventfd for io_uring")?;
        ring.submitter()
            .register_eventfd(evt_fd.as_raw_fd())
            .with_context(|| "Failed to register eventfd with io_uring")?;

        Ok(UringBackend {
            ring: Mutex::new(ring),
            evt_fd,
            in_flight: AtomicU32::new(0),
            event_loop,
        })
    }

    /// Drain the pending list into the submission queue until either runs
    /// out. Slots the ring cannot accept stay pendable.
    fn submit(&self, queue: &Arc<BlockQueue>) {
        let fd = queue.dev.fd();
        loop {
            let mut inner = queue.inner.lock().unwrap();
            let Some((idx, req, op)) = inner.dequeue(0) else {
                break;
            };

            if op == BlockOp::Discard {
                drop(inner);
                let err = process_discard(&queue.dev, &req);
                finish_request(queue, idx, &req, err);
                continue;
            }
            if op == BlockOp::Write && queue.dev.read_only {
                drop(inner);
                finish_request(queue, idx, &req, libc::EROFS);
                continue;
            }

            let entry = match op {
                BlockOp::Flush => {
                    drop(inner);
                    opcode::Fsync::new(types::Fd(fd))
                        .flags(types::FsyncFlags::DATASYNC)
                        .build()
                        .user_data(u64::from(idx))
                }
                _ => {
                    let (iovecs, offset, _, _) = align::io_vector(&queue.dev, &req);
                    let (iov_ptr, iov_cnt) = inner.set_submit_iov(idx, iovecs);
                    drop(inner);
                    if op == BlockOp::Read {
                        opcode::Readv::new(types::Fd(fd), iov_ptr as *const libc::iovec, iov_cnt)
                            .offset(offset)
                            .build()
                            .user_data(u64::from(idx))
                    } else {
                        opcode::Writev::new(types::Fd(fd), iov_ptr as *const libc::iovec, iov_cnt)
                            .offset(offset)
                            .build()
                            .user_data(u64::from(idx))
                    }
                }
            };

            let mut ring = self.ring.lock().unwrap();
            // SAFETY: the iovec snapshot lives in the slot until its
            // completion is reaped.
            if unsafe { ring.submission().push(&entry) }.is_err() {
                drop(ring);
                // No free submission entry; the request stays pendable for
                // the next round.
                queue.inner.lock().unwrap().requeue_head(idx);
                break;
            }
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = ring.submit() {
                error!("Failed to submit io_uring entry: {:?}", e);
            }
        }
    }

    /// Consume every available completion entry.
    fn reap(&self, queue: &Arc<BlockQueue>) {
        // Collect eagerly so the ring borrow is released before callbacks run.
        let cqes: Vec<(u64, i32)> = {
            let mut ring = self.ring.lock().unwrap();
            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };

        for (user_data, result) in cqes {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            let idx = user_data as u16;
            let found = queue.inner.lock().unwrap().req_of(idx);
            let Some((req, op)) = found else {
                error!("Stale io_uring completion for slot {}.", idx);
                continue;
            };

            let mut err = if result < 0 { -result } else { 0 };
            let (converted, org_size) = {
                let info = req.align_info.lock().unwrap();
                (info.need_conversion, info.org_size)
            };
            if converted {
                if op == BlockOp::Read && err == 0 {
                    align::complete_bounced_read(&req);
                }
                align::deinit_bounce_iov(&req);
            }
            if err == 0 && matches!(op, BlockOp::Read | BlockOp::Write) {
                req.consume_resid(if converted { org_size } else { result as u64 });
            }
            if err == 0 && op == BlockOp::Write {
                err = queue.dev.flush_cache();
            }
            finish_request(queue, idx, &req, err);
        }
    }
}

impl BlockIoBackend for UringBackend {
    fn init(&self, queue: &Arc<BlockQueue>, _tag: &str) -> Result<()> {
        let queue = queue.clone();
        let evt_fd = self
            .evt_fd
            .try_clone()
            .with_context(|| "Failed to clone io_uring eventfd")?;
        self.event_loop.add(
            self.evt_fd.as_raw_fd(),
            Box::new(move || {
                let _ = evt_fd.read();
                queue.backend.completion_cb(&queue);
            }),
        )
    }

    fn deinit(&self, _queue: &Arc<BlockQueue>) {
        if let Err(e) = self.event_loop.del(self.evt_fd.as_raw_fd()) {
            error!("Failed to remove io_uring eventfd from event loop: {:?}", e);
        }
    }

    fn request(&self, queue: &Arc<BlockQueue>) {
        // Push the fresh request to the kernel first, then pick up whatever
        // already finished to keep completion latency low.
        self.submit(queue);
        if self.in_flight.load(Ordering::Acquire) > 0 {
            self.reap(queue);
        }
    }

    fn completion_cb(&self, queue: &Arc<BlockQueue>) {
        self.reap(queue);
        if queue.inner.lock().unwrap().pendq_len() > 0 {
            self.submit(queue);
        }
    }
}

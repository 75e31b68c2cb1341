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

//! Asynchronous block-io engine for emulated storage front-ends.
//!
//! A `BlockBackend` wraps one backing file or raw block device and serves
//! scatter-gather read/write/flush/discard requests on a configurable
//! number of queues. Two execution backends share the same external
//! semantics: a worker-thread pool issuing positional vector io, and an
//! io_uring instance driven by an external event loop. Misaligned requests
//! against an `O_DIRECT` descriptor are converted through a bounce buffer,
//! and an optional interlock retires strictly consecutive requests in
//! submission order.

mod align;
mod discard;
mod queue;
mod thread_pool;
mod uring;

pub use discard::DiscardRange;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use log::{error, warn};
use thiserror::Error;

use crate::align::AlignInfo;
use crate::queue::{BlockIoBackend, BlockOp, BlockQueue, Enqueue, QueueInner, BLOCKIF_MAXREQ};
use crate::thread_pool::ThreadPoolBackend;
use crate::uring::UringBackend;
use util::aio::{
    blk_get_pbsz, blk_getsize, get_iov_size, raw_blk_discard, raw_fsync, AioEngine, Iovec,
};

/// Base sector unit of the logical device.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug)]
pub enum BlockIoError {
    #[error("No free request slot in the queue")]
    QueueFull,
    #[error("Target queue or request does not exist")]
    NotFound,
    #[error("The device is read only")]
    ReadOnly,
    #[error("The operation is not supported")]
    NotSupported,
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Failed to allocate aligned memory")]
    NoMemory,
    #[error("Io failure, errno {0}")]
    Io(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The request was still pending and was retired without a callback.
    Cancelled,
    /// The request was in flight. The worker has been interrupted, but the
    /// callback may already have fired or may still fire.
    BusyCancelled,
}

/// Readiness multiplexer contract used by the io_uring backend. The loop
/// watches `fd` and invokes the handler on its own thread whenever the
/// descriptor becomes readable.
pub trait EventLoop: Send + Sync {
    fn add(&self, fd: RawFd, handler: Box<dyn Fn() + Send + Sync>) -> Result<()>;
    fn del(&self, fd: RawFd) -> Result<()>;
}

pub type BlockIoCompleteCb = Arc<dyn Fn(&BlockRequest, i32) + Send + Sync>;

/// One block-io request. Owned by the caller; the engine borrows it until
/// the completion callback has fired exactly once per accepted submission.
pub struct BlockRequest {
    /// Byte offset within the logical device.
    pub offset: u64,
    /// Scatter-gather segments addressed by host virtual address.
    pub iovec: Vec<Iovec>,
    /// Bytes left to transfer; decremented by bytes actually moved.
    pub resid: AtomicU64,
    /// Target queue.
    pub qidx: usize,
    complete_cb: BlockIoCompleteCb,
    pub(crate) align_info: Mutex<AlignInfo>,
}

impl BlockRequest {
    pub fn new(
        offset: u64,
        iovec: Vec<Iovec>,
        qidx: usize,
        complete_cb: BlockIoCompleteCb,
    ) -> Arc<Self> {
        let resid = get_iov_size(&iovec);
        Arc::new(BlockRequest {
            offset,
            iovec,
            resid: AtomicU64::new(resid),
            qidx,
            complete_cb,
            align_info: Mutex::new(AlignInfo::default()),
        })
    }

    pub(crate) fn complete(&self, err: i32) {
        (self.complete_cb)(self, err);
    }

    pub(crate) fn consume_resid(&self, moved: u64) {
        let _ = self
            .resid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(moved))
            });
    }
}

/// Parsed open options: `path[,opt]*`.
#[derive(Debug, Clone)]
pub struct BlockProperty {
    pub path: String,
    pub read_only: bool,
    /// Initial write-cache-enable state; writethru (off) by default.
    pub wce: bool,
    /// Bypass the host page cache (`O_DIRECT`).
    pub direct: bool,
    /// Serialize strictly consecutive requests.
    pub bst_block: bool,
    pub candiscard: bool,
    pub max_discard_sectors: Option<u64>,
    pub max_discard_seg: Option<u32>,
    pub discard_sector_alignment: Option<u64>,
    /// Logical and physical sector size override.
    pub sector_size: Option<(u32, u32)>,
    /// Sub range in units of the logical sector size: start lba and length.
    pub sub_range: Option<(u64, u64)>,
    pub aio: AioEngine,
}

impl FromStr for BlockProperty {
    type Err = anyhow::Error;

    fn from_str(optstr: &str) -> Result<Self> {
        let mut opts = optstr.split(',');
        let path = opts
            .next()
            .map(str::to_string)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("Missing backing path in \"{}\"", optstr))?;

        let mut prop = BlockProperty {
            path,
            read_only: false,
            wce: false,
            direct: false,
            bst_block: true,
            candiscard: false,
            max_discard_sectors: None,
            max_discard_seg: None,
            discard_sector_alignment: None,
            sector_size: None,
            sub_range: None,
            aio: AioEngine::Threads,
        };

        for opt in opts {
            match opt {
                "writeback" => prop.wce = true,
                "writethru" => prop.wce = false,
                "ro" => prop.read_only = true,
                "nocache" => prop.direct = true,
                "no_bst_block" => prop.bst_block = false,
                "discard" => prop.candiscard = true,
                _ => {
                    if let Some(value) = opt.strip_prefix("discard=") {
                        // discard=<max sectors>:<max segments>:<alignment>
                        let fields: Vec<&str> = value.split(':').collect();
                        if fields.len() != 3 {
                            bail!("Invalid discard option \"{}\"", opt);
                        }
                        let ctx = || format!("Invalid discard option \"{}\"", opt);
                        prop.max_discard_sectors = Some(fields[0].parse().with_context(ctx)?);
                        prop.max_discard_seg = Some(fields[1].parse().with_context(ctx)?);
                        prop.discard_sector_alignment = Some(fields[2].parse().with_context(ctx)?);
                        prop.candiscard = true;
                    } else if let Some(value) = opt.strip_prefix("sectorsize=") {
                        // sectorsize=<logical>[/<physical>]
                        let ctx = || format!("Invalid sectorsize option \"{}\"", opt);
                        let (logical, physical) = match value.split_once('/') {
                            Some((l, p)) => {
                                (l.parse().with_context(ctx)?, p.parse().with_context(ctx)?)
                            }
                            None => {
                                let l: u32 = value.parse().with_context(ctx)?;
                                (l, l)
                            }
                        };
                        prop.sector_size = Some((logical, physical));
                    } else if let Some(value) = opt.strip_prefix("range=") {
                        // range=<start lba>/<length in sectors>
                        let ctx = || format!("Invalid range option \"{}\"", opt);
                        let (lba, len) = value
                            .split_once('/')
                            .ok_or_else(|| anyhow!("Invalid range option \"{}\"", opt))?;
                        prop.sub_range =
                            Some((lba.parse().with_context(ctx)?, len.parse().with_context(ctx)?));
                    } else if let Some(value) = opt.strip_prefix("aio=") {
                        prop.aio = AioEngine::from_str(value).map_err(|_| {
                            anyhow!("Invalid aio option \"{}\", use threads or io_uring", value)
                        })?;
                    } else {
                        bail!("Invalid device option \"{}\"", opt);
                    }
                }
            }
        }
        Ok(prop)
    }
}

/// Immutable backing-device state shared by the queues; only `wce` changes
/// after open.
pub(crate) struct BlockDev {
    pub file: File,
    pub is_blk: bool,
    pub read_only: bool,
    pub direct: bool,
    pub bst_block: bool,
    pub candiscard: bool,
    pub max_discard_sectors: u64,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u64,
    pub size: u64,
    pub sectsz: u32,
    pub psectsz: u32,
    pub psectoff: u32,
    pub sub_range_base: u64,
    /// Byte range held under the OFD lock, released on close.
    pub sub_range: Option<(u64, u64)>,
    pub wce: AtomicBool,
    pub aio: AioEngine,
}

impl BlockDev {
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Writethru emulation: data-sync after each write while wce is off, so
    /// the cache mode can be flipped at runtime.
    pub fn flush_cache(&self) -> i32 {
        if self.wce.load(Ordering::Acquire) {
            return 0;
        }
        let ret = util::aio::raw_datasync(self.fd());
        if ret < 0 {
            (-ret) as i32
        } else {
            0
        }
    }
}

pub struct BlockBackend {
    dev: Arc<BlockDev>,
    queues: Vec<Arc<BlockQueue>>,
}

impl BlockBackend {
    /// Open a backing file or device from an option string of the form
    /// `path[,opt]*` and start `queue_num` request queues. `aio=io_uring`
    /// requires an event loop to watch the rings' readiness descriptors.
    pub fn open(
        optstr: &str,
        ident: &str,
        queue_num: usize,
        event_loop: Option<Arc<dyn EventLoop>>,
    ) -> Result<Self> {
        let prop = BlockProperty::from_str(optstr)?;
        let queue_num = queue_num.max(1);
        let mut read_only = prop.read_only;

        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);
        if prop.direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = match options.open(&prop.path) {
            Ok(file) => file,
            Err(_) if !read_only => {
                // A failed read-write open falls back to read-only.
                read_only = true;
                let mut options = OpenOptions::new();
                options.read(true);
                if prop.direct {
                    options.custom_flags(libc::O_DIRECT);
                }
                options
                    .open(&prop.path)
                    .with_context(|| format!("Could not open backing file {}", prop.path))?
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Could not open backing file {}", prop.path));
            }
        };

        let meta = file
            .metadata()
            .with_context(|| format!("Could not stat backing file {}", prop.path))?;
        let is_blk = meta.file_type().is_block_device();
        let fd = file.as_raw_fd();

        let mut size;
        let mut sectsz = SECTOR_SIZE as u32;
        let mut psectsz;
        let mut candiscard = prop.candiscard;
        if is_blk {
            size = blk_getsize(fd)?;
            psectsz = match blk_get_pbsz(fd) {
                Ok(v) => v,
                Err(e) => {
                    warn!("{:?}, fall back to {} bytes.", e, SECTOR_SIZE);
                    SECTOR_SIZE as u32
                }
            };
            // A zero length probe tells whether the device really discards.
            if candiscard && raw_blk_discard(fd, 0, 0) < 0 {
                warn!("Backing device {} does not support discard.", prop.path);
                candiscard = false;
            }
        } else {
            size = meta.len();
            if size < SECTOR_SIZE || size % SECTOR_SIZE != 0 {
                bail!(
                    "{} size {} is not a positive multiple of {}",
                    prop.path,
                    size,
                    SECTOR_SIZE
                );
            }
            psectsz = meta.blksize() as u32;
        }

        let psectoff = 0_u32;
        if let Some((logical, physical)) = prop.sector_size {
            if !logical.is_power_of_two()
                || !physical.is_power_of_two()
                || logical < SECTOR_SIZE as u32
                || logical > physical
            {
                bail!("Invalid sector size {}/{}", logical, physical);
            }
            sectsz = logical;
            psectsz = physical;
        }

        let mut sub_range_base = 0;
        let mut sub_range = None;
        if let Some((lba, len)) = prop.sub_range {
            let start = lba * u64::from(sectsz);
            let range_size = len * u64::from(sectsz);
            sub_range_lock(fd, read_only, start, range_size).with_context(|| {
                format!(
                    "Sub range [{}, {}) of {} is locked by another descriptor",
                    start,
                    start + range_size,
                    prop.path
                )
            })?;
            sub_range_base = start;
            size = range_size;
            sub_range = Some((start, range_size));
        }

        let (max_discard_sectors, max_discard_seg, discard_sector_alignment) = if candiscard {
            (
                prop.max_discard_sectors.unwrap_or(size / SECTOR_SIZE),
                prop.max_discard_seg.unwrap_or(1),
                prop.discard_sector_alignment.unwrap_or(0),
            )
        } else {
            (0, 0, 0)
        };

        // The ring retires entries in submission order as far as the
        // interlock cares, so it runs with the interlock off.
        let bst_block = match prop.aio {
            AioEngine::IoUring => false,
            AioEngine::Threads => prop.bst_block,
        };

        let dev = Arc::new(BlockDev {
            file,
            is_blk,
            read_only,
            direct: prop.direct,
            bst_block,
            candiscard,
            max_discard_sectors,
            max_discard_seg,
            discard_sector_alignment,
            size,
            sectsz,
            psectsz,
            psectoff,
            sub_range_base,
            sub_range,
            wce: AtomicBool::new(prop.wce),
            aio: prop.aio,
        });

        let mut queues = Vec::with_capacity(queue_num);
        for qidx in 0..queue_num {
            let backend: Box<dyn BlockIoBackend> = match prop.aio {
                AioEngine::Threads => Box::new(ThreadPoolBackend::new()),
                AioEngine::IoUring => {
                    let event_loop = event_loop
                        .clone()
                        .ok_or_else(|| anyhow!("aio=io_uring requires an event loop"))?;
                    Box::new(UringBackend::new(event_loop)?)
                }
            };
            let blk_queue = Arc::new(BlockQueue {
                dev: dev.clone(),
                inner: Mutex::new(QueueInner::new()),
                cond: Condvar::new(),
                backend,
            });
            blk_queue
                .backend
                .init(&blk_queue, &format!("blk-{}-{}", ident, qidx))
                .with_context(|| format!("Failed to init io backend for queue {}", qidx))?;
            queues.push(blk_queue);
        }

        Ok(BlockBackend { dev, queues })
    }

    pub fn read(&self, req: Arc<BlockRequest>) -> std::result::Result<(), BlockIoError> {
        self.request(req, BlockOp::Read)
    }

    pub fn write(&self, req: Arc<BlockRequest>) -> std::result::Result<(), BlockIoError> {
        self.request(req, BlockOp::Write)
    }

    pub fn flush(&self, req: Arc<BlockRequest>) -> std::result::Result<(), BlockIoError> {
        self.request(req, BlockOp::Flush)
    }

    pub fn discard(&self, req: Arc<BlockRequest>) -> std::result::Result<(), BlockIoError> {
        self.request(req, BlockOp::Discard)
    }

    fn request(
        &self,
        req: Arc<BlockRequest>,
        op: BlockOp,
    ) -> std::result::Result<(), BlockIoError> {
        let blk_queue = self.queues.get(req.qidx).ok_or(BlockIoError::NotFound)?;

        align::init_alignment_info(&self.dev, &req);
        let need_conversion = req.align_info.lock().unwrap().need_conversion;
        if need_conversion && matches!(op, BlockOp::Read | BlockOp::Write) {
            align::init_bounce_iov(&req)?;
            if op == BlockOp::Write {
                if let Err(e) = align::init_bounced_write(self.dev.fd(), &req) {
                    align::deinit_bounce_iov(&req);
                    return Err(e);
                }
            }
        }

        let enqueued = blk_queue
            .inner
            .lock()
            .unwrap()
            .enqueue(req.clone(), op, self.dev.bst_block);
        match enqueued {
            Enqueue::NoSlot => {
                if need_conversion {
                    align::deinit_bounce_iov(&req);
                }
                Err(BlockIoError::QueueFull)
            }
            Enqueue::Pend => {
                blk_queue.backend.request(blk_queue);
                Ok(())
            }
            Enqueue::Block => Ok(()),
        }
    }

    /// Cancel a submitted request. A pending request is retired silently;
    /// an in-flight one has its worker interrupted until the slot leaves
    /// the busy state.
    pub fn cancel(
        &self,
        req: &Arc<BlockRequest>,
    ) -> std::result::Result<CancelStatus, BlockIoError> {
        let blk_queue = self.queues.get(req.qidx).ok_or(BlockIoError::NotFound)?;

        let mut inner = blk_queue.inner.lock().unwrap();
        if let Some(idx) = inner.find_pending(req) {
            // No io was issued for it, so no callback either.
            inner.complete(idx, self.dev.bst_block);
            return Ok(CancelStatus::Cancelled);
        }
        let Some((idx, worker)) = inner.find_busy(req) else {
            return Err(BlockIoError::NotFound);
        };
        drop(inner);

        if self.dev.aio == AioEngine::IoUring {
            // Entries already handed to the kernel ring cannot be recalled.
            return Err(BlockIoError::NotSupported);
        }

        loop {
            let inner = blk_queue.inner.lock().unwrap();
            if !inner.busy_holds(idx, req) {
                break;
            }
            drop(inner);
            thread_pool::interrupt_worker(worker);
        }
        Ok(CancelStatus::BusyCancelled)
    }

    /// Stop the queues, release the sub range lock and close the backing
    /// handle.
    pub fn close(self) {
        for blk_queue in &self.queues {
            blk_queue.inner.lock().unwrap().closing = true;
            blk_queue.cond.notify_all();
            blk_queue.backend.deinit(blk_queue);
        }
        if let Some((start, len)) = self.dev.sub_range {
            sub_range_unlock(self.dev.fd(), start, len);
        }
    }

    /// Synchronously flush the whole backing store.
    pub fn flush_all(&self) -> std::result::Result<(), BlockIoError> {
        let ret = raw_fsync(self.dev.fd());
        if ret < 0 {
            return Err(BlockIoError::Io((-ret) as i32));
        }
        Ok(())
    }

    pub fn disk_size(&self) -> u64 {
        self.dev.size
    }

    pub fn sector_size(&self) -> u32 {
        self.dev.sectsz
    }

    /// Physical sector size and offset.
    pub fn phys_sector_size(&self) -> (u32, u32) {
        (self.dev.psectsz, self.dev.psectoff)
    }

    /// Outstanding requests the device exposes per queue.
    pub fn queue_size(&self) -> u32 {
        (BLOCKIF_MAXREQ - 1) as u32
    }

    pub fn is_read_only(&self) -> bool {
        self.dev.read_only
    }

    pub fn candiscard(&self) -> bool {
        self.dev.candiscard
    }

    pub fn max_discard_sectors(&self) -> u64 {
        self.dev.max_discard_sectors
    }

    pub fn max_discard_seg(&self) -> u32 {
        self.dev.max_discard_seg
    }

    pub fn discard_sector_alignment(&self) -> u64 {
        self.dev.discard_sector_alignment
    }

    pub fn get_wce(&self) -> bool {
        self.dev.wce.load(Ordering::Acquire)
    }

    pub fn set_wce(&self, wce: bool) {
        self.dev.wce.store(wce, Ordering::Release);
    }

    /// Virtual C/H/S values for the device size, per the VHD algorithm.
    pub fn chs(&self) -> (u16, u8, u8) {
        let mut sectors = self.dev.size / u64::from(self.dev.sectsz);
        // Clamp to the largest size expressible with CHS.
        if sectors > 65535 * 16 * 255 {
            sectors = 65535 * 16 * 255;
        }

        let heads: u64;
        let mut secpt: u64;
        let mut hcyl: u64;
        if sectors >= 65536 * 16 * 63 {
            secpt = 255;
            heads = 16;
            hcyl = sectors / secpt;
        } else {
            secpt = 17;
            hcyl = sectors / secpt;
            let mut h = (hcyl + 1023) / 1024;
            if h < 4 {
                h = 4;
            }
            if hcyl >= h * 1024 || h > 16 {
                secpt = 31;
                h = 16;
                hcyl = sectors / secpt;
            }
            if hcyl >= h * 1024 {
                secpt = 63;
                h = 16;
                hcyl = sectors / secpt;
            }
            heads = h;
        }

        ((hcyl / heads) as u16, heads as u8, secpt as u8)
    }
}

fn sub_range_lock(fd: RawFd, read_only: bool, start: u64, len: u64) -> Result<()> {
    // SAFETY: flock is plain data, an all-zero value is valid.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_type = if read_only {
        libc::F_RDLCK as libc::c_short
    } else {
        libc::F_WRLCK as libc::c_short
    };
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;

    // An open-file-description lock outlives threads and conflicts with
    // other descriptors on the same range.
    // SAFETY: fd is valid and fl is initialized above.
    let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &fl) };
    if ret == -1 {
        bail!(
            "Failed to lock range [{}, {}): {:?}",
            start,
            start + len,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn sub_range_unlock(fd: RawFd, start: u64, len: u64) {
    // SAFETY: flock is plain data, an all-zero value is valid.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_type = libc::F_UNLCK as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;

    // SAFETY: fd is valid and fl is initialized above.
    let ret = unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &fl) };
    if ret == -1 {
        // A stale range lock would poison every later open of the file.
        error!("Failed to unlock range [{}, {}).", start, start + len);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, Instant};
    use vmm_sys_util::tempfile::TempFile;

    fn temp_disk(size: u64, fill: u8) -> TempFile {
        let tmp = TempFile::new().unwrap();
        if fill == 0 {
            tmp.as_file().set_len(size).unwrap();
        } else {
            tmp.as_file()
                .write_all_at(&vec![fill; size as usize], 0)
                .unwrap();
        }
        tmp
    }

    fn optstr(tmp: &TempFile, opts: &str) -> String {
        let path = tmp.as_path().display();
        if opts.is_empty() {
            format!("{}", path)
        } else {
            format!("{},{}", path, opts)
        }
    }

    fn done_cb(sender: Sender<i32>) -> BlockIoCompleteCb {
        Arc::new(move |_req: &BlockRequest, err: i32| {
            sender.send(err).unwrap();
        })
    }

    /// Event loop stub the test drives by hand.
    #[derive(Default)]
    struct ManualLoop {
        handlers: Mutex<Vec<(RawFd, Box<dyn Fn() + Send + Sync>)>>,
    }

    impl ManualLoop {
        fn kick(&self) {
            for (_, handler) in self.handlers.lock().unwrap().iter() {
                handler();
            }
        }
    }

    impl EventLoop for ManualLoop {
        fn add(&self, fd: RawFd, handler: Box<dyn Fn() + Send + Sync>) -> Result<()> {
            self.handlers.lock().unwrap().push((fd, handler));
            Ok(())
        }

        fn del(&self, fd: RawFd) -> Result<()> {
            self.handlers.lock().unwrap().retain(|(f, _)| *f != fd);
            Ok(())
        }
    }

    fn wait_cb(rx: &Receiver<i32>, el: Option<&ManualLoop>) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(err) = rx.try_recv() {
                return err;
            }
            if let Some(el) = el {
                el.kick();
            }
            assert!(Instant::now() < deadline, "request timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_aligned_write_then_read_thread_pool() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, "aio=threads"), "ut", 1, None).unwrap();
        assert!(!backend.get_wce());
        assert_eq!(backend.disk_size(), 1 << 20);
        assert_eq!(backend.queue_size(), 71);

        let (tx, rx) = channel();
        let mut wbuf = vec![0x5Au8; 4096];
        let req = BlockRequest::new(
            4096,
            vec![Iovec::new(wbuf.as_mut_ptr() as u64, 4096)],
            0,
            done_cb(tx),
        );
        backend.write(req.clone()).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(req.resid.load(Ordering::Acquire), 0);

        let (tx, rx) = channel();
        let mut rbuf = vec![0u8; 4096];
        let req = BlockRequest::new(
            4096,
            vec![Iovec::new(rbuf.as_mut_ptr() as u64, 4096)],
            0,
            done_cb(tx),
        );
        backend.read(req).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(rbuf, wbuf);

        backend.close();
    }

    #[test]
    fn test_scattered_read_thread_pool() {
        let tmp = temp_disk(1 << 20, 0);
        let content: Vec<u8> = (0..8192u32).map(|v| (v % 251) as u8).collect();
        tmp.as_file().write_all_at(&content, 0).unwrap();

        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();
        let (tx, rx) = channel();
        let mut part1 = vec![0u8; 1024];
        let mut part2 = vec![0u8; 3072];
        let req = BlockRequest::new(
            512,
            vec![
                Iovec::new(part1.as_mut_ptr() as u64, 1024),
                Iovec::new(part2.as_mut_ptr() as u64, 3072),
            ],
            0,
            done_cb(tx),
        );
        backend.read(req).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(&part1[..], &content[512..1536]);
        assert_eq!(&part2[..], &content[1536..4608]);
        backend.close();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, "writeback"), "ut", 1, None).unwrap();
        assert!(backend.get_wce());

        for _ in 0..2 {
            let (tx, rx) = channel();
            let req = BlockRequest::new(0, Vec::new(), 0, done_cb(tx));
            backend.flush(req).unwrap();
            assert_eq!(wait_cb(&rx, None), 0);
        }
        backend.flush_all().unwrap();
        backend.close();
    }

    #[test]
    fn test_write_on_readonly_fails_with_erofs() {
        let tmp = temp_disk(1 << 20, 0x42);
        let backend = BlockBackend::open(&optstr(&tmp, "ro"), "ut", 1, None).unwrap();
        assert!(backend.is_read_only());

        let (tx, rx) = channel();
        let mut wbuf = vec![0u8; 512];
        let req = BlockRequest::new(
            0,
            vec![Iovec::new(wbuf.as_mut_ptr() as u64, 512)],
            0,
            done_cb(tx),
        );
        backend.write(req).unwrap();
        assert_eq!(wait_cb(&rx, None), libc::EROFS);

        // The backing bytes are untouched.
        let mut check = vec![0u8; 512];
        tmp.as_file().read_exact_at(&mut check, 0).unwrap();
        assert_eq!(check, vec![0x42u8; 512]);
        backend.close();
    }

    #[test]
    fn test_bad_queue_index_is_rejected() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();

        let req = BlockRequest::new(0, Vec::new(), 1, Arc::new(|_: &BlockRequest, _| {}));
        assert!(matches!(
            backend.flush(req.clone()),
            Err(BlockIoError::NotFound)
        ));
        assert!(matches!(backend.cancel(&req), Err(BlockIoError::NotFound)));
        backend.close();
    }

    #[test]
    fn test_cancel_unknown_request() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();
        let req = BlockRequest::new(0, Vec::new(), 0, Arc::new(|_: &BlockRequest, _| {}));
        assert!(matches!(backend.cancel(&req), Err(BlockIoError::NotFound)));
        backend.close();
    }

    #[test]
    fn test_misaligned_rw_with_direct_io() {
        let tmp = temp_disk(1 << 20, 0x11);
        // Hosts whose tmp filesystem rejects O_DIRECT cannot run this.
        let backend = match BlockBackend::open(&optstr(&tmp, "nocache"), "ut", 1, None) {
            Ok(b) => b,
            Err(_) => return,
        };

        let (tx, rx) = channel();
        let mut wbuf = vec![0xAAu8; 200];
        let req = BlockRequest::new(
            100,
            vec![Iovec::new(wbuf.as_mut_ptr() as u64, 200)],
            0,
            done_cb(tx),
        );
        backend.write(req.clone()).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(req.resid.load(Ordering::Acquire), 0);

        // Read the whole first sector back and check the surroundings
        // survived the bounced write.
        let (tx, rx) = channel();
        let mut rbuf = vec![0u8; 512];
        let req = BlockRequest::new(
            0,
            vec![Iovec::new(rbuf.as_mut_ptr() as u64, 512)],
            0,
            done_cb(tx),
        );
        backend.read(req).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(&rbuf[..100], &vec![0x11u8; 100][..]);
        assert_eq!(&rbuf[100..300], &vec![0xAAu8; 200][..]);
        assert_eq!(&rbuf[300..], &vec![0x11u8; 212][..]);
        backend.close();
    }

    #[test]
    fn test_discard_end_to_end() {
        let tmp = temp_disk(1 << 20, 0xFF);
        let backend =
            BlockBackend::open(&optstr(&tmp, "discard=1024:4:8"), "ut", 1, None).unwrap();
        assert!(backend.candiscard());
        assert_eq!(backend.max_discard_sectors(), 1024);
        assert_eq!(backend.max_discard_seg(), 4);
        assert_eq!(backend.discard_sector_alignment(), 8);

        let records = [
            DiscardRange { sector: 8, num_sectors: 8, flags: 0 },
            DiscardRange { sector: 32, num_sectors: 16, flags: 0 },
            DiscardRange { sector: 128, num_sectors: 8, flags: 0 },
        ];
        let (tx, rx) = channel();
        let req = BlockRequest::new(
            0,
            vec![Iovec::new(records.as_ptr() as u64, 48)],
            0,
            done_cb(tx),
        );
        backend.discard(req.clone()).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);
        assert_eq!(req.resid.load(Ordering::Acquire), 0);

        let mut buf = vec![0u8; 4096];
        tmp.as_file().read_exact_at(&mut buf, 8 * 512).unwrap();
        assert_eq!(buf, vec![0u8; 4096]);
        tmp.as_file().read_exact_at(&mut buf, 32 * 512).unwrap();
        assert_eq!(buf, vec![0u8; 4096]);

        // A misaligned record is refused before anything is punched.
        let records = [DiscardRange { sector: 7, num_sectors: 8, flags: 0 }];
        let (tx, rx) = channel();
        let req = BlockRequest::new(
            0,
            vec![Iovec::new(records.as_ptr() as u64, 16)],
            0,
            done_cb(tx),
        );
        backend.discard(req).unwrap();
        assert_eq!(wait_cb(&rx, None), libc::EINVAL);
        backend.close();
    }

    #[test]
    fn test_discard_not_supported_by_default() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();
        assert!(!backend.candiscard());

        let (tx, rx) = channel();
        let req = BlockRequest::new(0, Vec::new(), 0, done_cb(tx));
        req.resid.store(512, Ordering::Release);
        backend.discard(req).unwrap();
        assert_eq!(wait_cb(&rx, None), libc::EOPNOTSUPP);
        backend.close();
    }

    #[test]
    fn test_many_outstanding_requests() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, "writeback"), "ut", 1, None).unwrap();

        let (tx, rx) = channel();
        let mut bufs: Vec<Vec<u8>> = (0..128).map(|_| vec![0x5Au8; 512]).collect();
        let mut accepted = 0;
        for (i, buf) in bufs.iter_mut().enumerate() {
            let req = BlockRequest::new(
                (i as u64) * 512,
                vec![Iovec::new(buf.as_mut_ptr() as u64, 512)],
                0,
                done_cb(tx.clone()),
            );
            match backend.write(req) {
                Ok(()) => accepted += 1,
                Err(BlockIoError::QueueFull) => {}
                Err(e) => panic!("unexpected submit error {:?}", e),
            }
        }
        assert!(accepted > 0);
        for _ in 0..accepted {
            assert_eq!(wait_cb(&rx, None), 0);
        }
        backend.close();
    }

    #[test]
    fn test_write_then_read_io_uring() {
        // Skip on hosts where io_uring is unavailable.
        if io_uring::IoUring::new(4).is_err() {
            return;
        }
        let tmp = temp_disk(1 << 20, 0);
        let el = Arc::new(ManualLoop::default());
        let backend = match BlockBackend::open(
            &optstr(&tmp, "aio=io_uring"),
            "ut",
            1,
            Some(el.clone()),
        ) {
            Ok(b) => b,
            Err(_) => return,
        };

        let (tx, rx) = channel();
        let mut wbuf = vec![0xA5u8; 4096];
        let req = BlockRequest::new(
            8192,
            vec![Iovec::new(wbuf.as_mut_ptr() as u64, 4096)],
            0,
            done_cb(tx),
        );
        backend.write(req.clone()).unwrap();
        assert_eq!(wait_cb(&rx, Some(&el)), 0);
        assert_eq!(req.resid.load(Ordering::Acquire), 0);

        let (tx, rx) = channel();
        let mut rbuf = vec![0u8; 4096];
        let req = BlockRequest::new(
            8192,
            vec![Iovec::new(rbuf.as_mut_ptr() as u64, 4096)],
            0,
            done_cb(tx),
        );
        backend.read(req).unwrap();
        assert_eq!(wait_cb(&rx, Some(&el)), 0);
        assert_eq!(rbuf, wbuf);

        let (tx, rx) = channel();
        let req = BlockRequest::new(0, Vec::new(), 0, done_cb(tx));
        backend.flush(req).unwrap();
        assert_eq!(wait_cb(&rx, Some(&el)), 0);

        backend.close();
        assert!(el.handlers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sub_range_confines_and_locks() {
        let tmp = temp_disk(2 << 20, 0x33);
        let path = tmp.as_path().display();

        // [1 MiB, 2 MiB) of the file becomes the whole device.
        let backend =
            BlockBackend::open(&format!("{},range=2048/2048", path), "ut", 1, None).unwrap();
        assert_eq!(backend.disk_size(), 1 << 20);

        // An overlapping open must be refused while the lock is held.
        assert!(
            BlockBackend::open(&format!("{},range=1024/2048", path), "ut2", 1, None).is_err()
        );

        let (tx, rx) = channel();
        let mut wbuf = vec![0x77u8; 512];
        let req = BlockRequest::new(
            0,
            vec![Iovec::new(wbuf.as_mut_ptr() as u64, 512)],
            0,
            done_cb(tx),
        );
        backend.write(req).unwrap();
        assert_eq!(wait_cb(&rx, None), 0);

        let mut check = vec![0u8; 512];
        tmp.as_file().read_exact_at(&mut check, 1 << 20).unwrap();
        assert_eq!(check, vec![0x77u8; 512]);

        backend.close();

        // The lock is gone after close.
        let again =
            BlockBackend::open(&format!("{},range=1024/2048", path), "ut3", 1, None).unwrap();
        again.close();
    }

    #[test]
    fn test_option_parsing_failures() {
        let tmp = temp_disk(1 << 20, 0);
        for opts in [
            "bogus",
            "aio=native",
            "discard=1:2",
            "sectorsize=1000",
            "sectorsize=4096/512",
            "range=17",
        ] {
            assert!(
                BlockBackend::open(&optstr(&tmp, opts), "ut", 1, None).is_err(),
                "option {} was accepted",
                opts
            );
        }

        // A regular file must be a positive multiple of 512 bytes.
        let odd = TempFile::new().unwrap();
        odd.as_file().set_len(1000).unwrap();
        assert!(BlockBackend::open(&optstr(&odd, ""), "ut", 1, None).is_err());
    }

    #[test]
    fn test_sector_size_override() {
        let tmp = temp_disk(1 << 20, 0);
        let backend =
            BlockBackend::open(&optstr(&tmp, "sectorsize=4096/4096"), "ut", 1, None).unwrap();
        assert_eq!(backend.sector_size(), 4096);
        assert_eq!(backend.phys_sector_size(), (4096, 0));
        backend.close();
    }

    #[test]
    fn test_wce_toggle() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, "writethru"), "ut", 1, None).unwrap();
        assert!(!backend.get_wce());
        backend.set_wce(true);
        assert!(backend.get_wce());
        backend.close();
    }

    #[test]
    fn test_chs_small_and_large() {
        let tmp = temp_disk(1 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();
        // 2048 sectors: 17 sectors per track, 4 heads.
        assert_eq!(backend.chs(), (30, 4, 17));
        backend.close();

        let tmp = temp_disk(256 << 20, 0);
        let backend = BlockBackend::open(&optstr(&tmp, ""), "ut", 1, None).unwrap();
        // 524288 sectors: promoted to 16 heads, 63 sectors per track.
        assert_eq!(backend.chs(), (520, 16, 63));
        backend.close();
    }
}

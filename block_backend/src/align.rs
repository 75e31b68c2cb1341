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

//! Conversion of misaligned requests into aligned ones for direct io.
//!
//! A request whose offset, segment bases or segment lengths are not
//! multiples of the device sector size cannot be issued against an
//! `O_DIRECT` descriptor. Such a request is staged through one contiguous
//! aligned bounce buffer spanning
//! `[aligned_dn_start, aligned_dn_start + bounced_size)`:
//!
//! ```text
//! |<--- head --->|<---------- org_size ---------->|<-- tail -->|
//! aligned_dn_start             ...     aligned_dn_end
//! ```
//!
//! Writes pre-read the partially covered head and tail units so the
//! surrounding bytes survive the aligned write. Reads fan the middle of the
//! bounce buffer back out to the caller's segments.

use std::os::unix::io::RawFd;

use libc::c_void;
use log::error;

use crate::{BlockDev, BlockIoError, BlockRequest};
use util::aio::{get_iov_size, iov_from_buf_direct, iov_to_buf_direct, raw_read, Iovec};

/// Aligned staging region, freed on drop.
pub(crate) struct BounceBuffer {
    base: u64,
    len: u64,
}

impl BounceBuffer {
    fn new(alignment: u64, size: u64) -> Option<Self> {
        // SAFETY: alignment is a power of two, the region is released in drop.
        let base = unsafe { libc::memalign(alignment as usize, size as usize) };
        if base.is_null() {
            error!("Failed to alloc aligned memory, size {}.", size);
            return None;
        }
        Some(BounceBuffer {
            base: base as u64,
            len: size,
        })
    }

    pub fn as_iovec(&self) -> Iovec {
        Iovec::new(self.base, self.len)
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the region covers len bytes and is exclusively owned.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len as usize) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region covers len bytes and is exclusively owned.
        unsafe { std::slice::from_raw_parts_mut(self.base as *mut u8, self.len as usize) }
    }
}

impl Drop for BounceBuffer {
    fn drop(&mut self) {
        // SAFETY: base came from memalign and is freed exactly once.
        unsafe { libc::free(self.base as *mut c_void) };
    }
}

/// Per-request conversion state, computed once per submission.
#[derive(Default)]
pub(crate) struct AlignInfo {
    pub alignment: u64,
    pub head: u64,
    pub tail: u64,
    pub org_size: u64,
    pub bounced_size: u64,
    pub aligned_dn_start: u64,
    pub aligned_dn_end: u64,
    pub is_offset_aligned: bool,
    pub is_iov_base_aligned: bool,
    pub is_iov_len_aligned: bool,
    pub need_conversion: bool,
    pub bounce: Option<BounceBuffer>,
}

pub(crate) fn init_alignment_info(dev: &BlockDev, req: &BlockRequest) {
    let mut info = req.align_info.lock().unwrap();
    *info = AlignInfo::default();
    // Without O_DIRECT the host kernel takes any alignment.
    if !dev.direct {
        return;
    }

    let alignment = u64::from(dev.sectsz);
    let start = req.offset + dev.sub_range_base;
    info.alignment = alignment;
    info.is_offset_aligned = start % alignment == 0;
    info.is_iov_base_aligned = true;
    info.is_iov_len_aligned = true;

    let mut size: u64 = 0;
    for iov in req.iovec.iter() {
        size += iov.iov_len;
        if iov.iov_base % alignment != 0 {
            info.is_iov_base_aligned = false;
        }
        if iov.iov_len % alignment != 0 {
            info.is_iov_len_aligned = false;
        }
    }
    info.org_size = size;

    if info.is_offset_aligned && info.is_iov_base_aligned && info.is_iov_len_aligned {
        return;
    }
    info.need_conversion = true;

    info.head = start % alignment;
    info.aligned_dn_start = start - info.head;

    let end = start + size;
    let end_rmd = end % alignment;
    info.tail = if end_rmd == 0 { 0 } else { alignment - end_rmd };
    info.aligned_dn_end = end - end_rmd;

    info.bounced_size = info.head + size + info.tail;
}

pub(crate) fn init_bounce_iov(req: &BlockRequest) -> Result<(), BlockIoError> {
    let mut info = req.align_info.lock().unwrap();
    let bounce =
        BounceBuffer::new(info.alignment, info.bounced_size).ok_or(BlockIoError::NoMemory)?;
    info.bounce = Some(bounce);
    Ok(())
}

pub(crate) fn deinit_bounce_iov(req: &BlockRequest) {
    req.align_info.lock().unwrap().bounce = None;
}

/// Read one aligned unit at `offset` to stage a partially covered head or
/// tail area.
fn read_area(fd: RawFd, offset: u64, alignment: u64) -> Result<BounceBuffer, BlockIoError> {
    let area = BounceBuffer::new(alignment, alignment).ok_or(BlockIoError::NoMemory)?;
    let len = raw_read(fd, area.base, alignment as usize, offset as usize);
    if len < 0 {
        return Err(BlockIoError::Io((-len) as i32));
    }
    if len as u64 != alignment {
        return Err(BlockIoError::Io(libc::EIO));
    }
    Ok(area)
}

/// Synthesize the bounce buffer for a misaligned write: preserved head
/// bytes, the caller's data, preserved tail bytes.
pub(crate) fn init_bounced_write(fd: RawFd, req: &BlockRequest) -> Result<(), BlockIoError> {
    let mut info = req.align_info.lock().unwrap();
    let alignment = info.alignment;
    let head = info.head;
    let tail = info.tail;
    let org_size = info.org_size;

    let head_area = if head != 0 {
        Some(read_area(fd, info.aligned_dn_start, alignment)?)
    } else {
        None
    };
    let tail_area = if tail != 0 {
        Some(read_area(fd, info.aligned_dn_end, alignment)?)
    } else {
        None
    };

    let Some(bounce) = info.bounce.as_mut() else {
        return Err(BlockIoError::Invalid(
            "bounce buffer is not allocated".to_string(),
        ));
    };
    let buf = bounce.as_mut_slice();

    if let Some(area) = head_area {
        buf[..head as usize].copy_from_slice(&area.as_slice()[..head as usize]);
    }

    let body = &mut buf[head as usize..(head + org_size) as usize];
    let copied = iov_to_buf_direct(&req.iovec, 0, body).map_err(|e| {
        error!("Failed to fill bounce buffer from caller iov: {:?}", e);
        BlockIoError::Io(libc::EIO)
    })?;
    if copied as u64 != org_size {
        return Err(BlockIoError::Io(libc::EIO));
    }

    if let Some(area) = tail_area {
        buf[(head + org_size) as usize..]
            .copy_from_slice(&area.as_slice()[(alignment - tail) as usize..]);
    }

    Ok(())
}

/// Fan the middle of the bounce buffer back out to the caller's segments
/// after an aligned read completed.
pub(crate) fn complete_bounced_read(req: &BlockRequest) {
    let info = req.align_info.lock().unwrap();
    let head = info.head as usize;
    let org_size = info.org_size as usize;
    match info.bounce.as_ref() {
        Some(bounce) => {
            let src = &bounce.as_slice()[head..head + org_size];
            if let Err(e) = iov_from_buf_direct(&req.iovec, src) {
                error!("Failed to copy bounced data to caller iov: {:?}", e);
            }
        }
        None => error!("Bounced read completed without a bounce buffer."),
    }
}

/// Submission view of a request: the iovecs and backing offset to issue,
/// whether it was converted, and the caller-visible byte count.
pub(crate) fn io_vector(dev: &BlockDev, req: &BlockRequest) -> (Vec<Iovec>, u64, bool, u64) {
    let info = req.align_info.lock().unwrap();
    if info.need_conversion {
        let iov = info
            .bounce
            .as_ref()
            .map_or(Iovec::new(0, 0), |b| b.as_iovec());
        (vec![iov], info.aligned_dn_start, true, info.org_size)
    } else {
        (
            req.iovec.clone(),
            req.offset + dev.sub_range_base,
            false,
            get_iov_size(&req.iovec),
        )
    }
}

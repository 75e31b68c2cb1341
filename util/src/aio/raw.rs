// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
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

use std::os::unix::io::RawFd;

use anyhow::{bail, Result};
use libc::{c_int, c_uint, c_ulong, c_void, iovec, off_t};

use super::Iovec;

const BLKGETSIZE: c_ulong = 0x1260;
const BLKGETSIZE64: c_ulong = 0x8008_1272;
const BLKPBSZGET: c_ulong = 0x127b;
const BLKDISCARD: c_ulong = 0x1277;

/// Fold a raw syscall return value to `ret` on success or `-errno`.
fn ret_or_errno(ret: i64) -> i64 {
    if ret < 0 {
        -i64::from(errno::errno().0)
    } else {
        ret
    }
}

pub fn raw_read(fd: RawFd, buf: u64, size: usize, offset: usize) -> i64 {
    // SAFETY: the caller guarantees buf covers size bytes.
    let ret = unsafe { libc::pread(fd, buf as *mut c_void, size, offset as off_t) };
    ret_or_errno(ret as i64)
}

pub fn raw_readv(fd: RawFd, iovecs: &[Iovec], offset: usize) -> i64 {
    // SAFETY: Iovec is layout-compatible with libc::iovec and every segment
    // points at memory the caller owns.
    let ret = unsafe {
        libc::preadv(
            fd,
            iovecs.as_ptr() as *const iovec,
            iovecs.len() as c_int,
            offset as off_t,
        )
    };
    ret_or_errno(ret as i64)
}

pub fn raw_write(fd: RawFd, buf: u64, size: usize, offset: usize) -> i64 {
    // SAFETY: the caller guarantees buf covers size bytes.
    let ret = unsafe { libc::pwrite(fd, buf as *const c_void, size, offset as off_t) };
    ret_or_errno(ret as i64)
}

pub fn raw_writev(fd: RawFd, iovecs: &[Iovec], offset: usize) -> i64 {
    // SAFETY: Iovec is layout-compatible with libc::iovec and every segment
    // points at memory the caller owns.
    let ret = unsafe {
        libc::pwritev(
            fd,
            iovecs.as_ptr() as *const iovec,
            iovecs.len() as c_int,
            offset as off_t,
        )
    };
    ret_or_errno(ret as i64)
}

pub fn raw_fsync(fd: RawFd) -> i64 {
    // SAFETY: fd is a valid open file descriptor.
    let ret = unsafe { libc::fsync(fd) };
    ret_or_errno(i64::from(ret))
}

pub fn raw_datasync(fd: RawFd) -> i64 {
    // SAFETY: fd is a valid open file descriptor.
    let ret = unsafe { libc::fdatasync(fd) };
    ret_or_errno(i64::from(ret))
}

/// Deallocate a byte range of a regular file while keeping its apparent
/// length. Subsequent reads of the range return zeroes.
pub fn raw_discard(fd: RawFd, offset: u64, nbytes: u64) -> i64 {
    // SAFETY: fd is a valid open file descriptor.
    let ret = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as off_t,
            nbytes as off_t,
        )
    };
    ret_or_errno(i64::from(ret))
}

/// Discard a byte range of a block device.
pub fn raw_blk_discard(fd: RawFd, offset: u64, nbytes: u64) -> i64 {
    let range: [u64; 2] = [offset, nbytes];
    // SAFETY: the argument matches what the ioctl expects.
    let ret = unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) };
    ret_or_errno(i64::from(ret))
}

/// Block device size in bytes. The 64-bit ioctl wins when it succeeds with
/// a non-zero size, otherwise fall back to 512-byte sectors.
pub fn blk_getsize(fd: RawFd) -> Result<u64> {
    let mut size64: u64 = 0;
    // SAFETY: the argument matches what the ioctl expects.
    let ret = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size64) };
    if ret == 0 && size64 != 0 {
        return Ok(size64);
    }

    let mut sectors: c_ulong = 0;
    // SAFETY: the argument matches what the ioctl expects.
    let ret = unsafe { libc::ioctl(fd, BLKGETSIZE, &mut sectors) };
    if ret < 0 {
        bail!("Failed to get block device size, errno {}.", errno::errno().0);
    }
    Ok(sectors as u64 * 512)
}

/// Physical sector size of a block device.
pub fn blk_get_pbsz(fd: RawFd) -> Result<u32> {
    let mut pbsz: c_uint = 0;
    // SAFETY: the argument matches what the ioctl expects.
    let ret = unsafe { libc::ioctl(fd, BLKPBSZGET, &mut pbsz) };
    if ret < 0 {
        bail!(
            "Failed to get block device physical sector size, errno {}.",
            errno::errno().0
        );
    }
    Ok(pbsz)
}

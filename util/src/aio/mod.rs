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

mod raw;

use std::cmp;
use std::io::Write;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use raw::*;

/// Thread-pool aio type.
const AIO_THREADS: &str = "threads";
/// Io-uring aio type.
const AIO_IOURING: &str = "io_uring";

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum AioEngine {
    Threads = 0,
    IoUring = 1,
}

impl FromStr for AioEngine {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            AIO_THREADS => Ok(AioEngine::Threads),
            AIO_IOURING => Ok(AioEngine::IoUring),
            _ => Err(()),
        }
    }
}

/// A scatter-gather segment addressed by host virtual address. Layout
/// matches `libc::iovec` so slices can be handed to vectored syscalls.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iovec {
    pub iov_base: u64,
    pub iov_len: u64,
}

impl Iovec {
    pub fn new(base: u64, len: u64) -> Self {
        Iovec {
            iov_base: base,
            iov_len: len,
        }
    }
}

pub fn get_iov_size(iovecs: &[Iovec]) -> u64 {
    let mut sum = 0;
    for iov in iovecs {
        sum += iov.iov_len;
    }
    sum
}

pub fn mem_from_buf(buf: &[u8], hva: u64) -> Result<()> {
    // SAFETY: all callers have valid hva address.
    let mut slice = unsafe { std::slice::from_raw_parts_mut(hva as *mut u8, buf.len()) };
    (&mut slice)
        .write(buf)
        .with_context(|| format!("Failed to write buf to hva:{})", hva))?;
    Ok(())
}

/// Write buf to iovec and return the written number of bytes.
pub fn iov_from_buf_direct(iovec: &[Iovec], buf: &[u8]) -> Result<usize> {
    let mut start: usize = 0;
    let mut end: usize = 0;

    for iov in iovec.iter() {
        end = cmp::min(start + iov.iov_len as usize, buf.len());
        mem_from_buf(&buf[start..end], iov.iov_base)?;
        if end >= buf.len() {
            break;
        }
        start = end;
    }
    Ok(end)
}

pub fn mem_to_buf(mut buf: &mut [u8], hva: u64) -> Result<()> {
    // SAFETY: all callers have valid hva address.
    let slice = unsafe { std::slice::from_raw_parts(hva as *const u8, buf.len()) };
    buf.write(slice)
        .with_context(|| format!("Failed to read buf from hva:{})", hva))?;
    Ok(())
}

/// Read iovec to buf and return the read number of bytes.
pub fn iov_to_buf_direct(iovec: &[Iovec], offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut iovec2: Option<&[Iovec]> = None;
    let mut start: usize = 0;
    let mut end: usize = 0;

    if offset == 0 {
        iovec2 = Some(iovec);
    } else {
        let mut offset = offset;
        for (index, iov) in iovec.iter().enumerate() {
            if iov.iov_len > offset {
                end = cmp::min((iov.iov_len - offset) as usize, buf.len());
                mem_to_buf(&mut buf[..end], iov.iov_base + offset)?;
                if end >= buf.len() || index >= (iovec.len() - 1) {
                    return Ok(end);
                }
                start = end;
                iovec2 = Some(&iovec[index + 1..]);
                break;
            }
            offset -= iov.iov_len;
        }
        if iovec2.is_none() {
            return Ok(0);
        }
    }

    for iov in iovec2.unwrap() {
        end = cmp::min(start + iov.iov_len as usize, buf.len());
        mem_to_buf(&mut buf[start..end], iov.iov_base)?;
        if end >= buf.len() {
            break;
        }
        start = end;
    }
    Ok(end)
}

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

use std::mem::size_of;
use std::sync::atomic::Ordering;

use log::error;

use crate::{BlockDev, BlockRequest, SECTOR_SIZE};
use util::aio::{raw_blk_discard, raw_datasync, raw_discard};

/// Discard record as laid out by the front-end when a request carries a
/// single segment of ranges.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiscardRange {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}

/// Validate and execute a discard request. Every range is checked before
/// the first byte is deallocated.
pub(crate) fn process_discard(dev: &BlockDev, req: &BlockRequest) -> i32 {
    if !dev.candiscard {
        return libc::EOPNOTSUPP;
    }
    if dev.read_only {
        return libc::EROFS;
    }

    let mut ranges: Vec<(u64, u64)> = Vec::new();
    if req.iovec.len() == 1 {
        // The single segment carries an array of discard records.
        let iov = &req.iovec[0];
        let n_range = iov.iov_len as usize / size_of::<DiscardRange>();
        if n_range > dev.max_discard_seg as usize {
            error!(
                "Discard records {} exceed the segment limit {}.",
                n_range, dev.max_discard_seg
            );
            return libc::EINVAL;
        }
        // SAFETY: the front-end guarantees the segment holds n_range records.
        let records =
            unsafe { std::slice::from_raw_parts(iov.iov_base as *const DiscardRange, n_range) };
        for range in records {
            let Some(sector_off) = range.sector.checked_mul(SECTOR_SIZE) else {
                return libc::EINVAL;
            };
            let start = sector_off + dev.sub_range_base;
            let size = u64::from(range.num_sectors) * SECTOR_SIZE;
            if !range_is_valid(dev, start, size) {
                error!("Discard range [{}: {}] is invalid.", start, size);
                return libc::EINVAL;
            }
            ranges.push((start, size));
        }
    } else {
        // The range was parsed by the front-end into offset and resid.
        let start = req.offset + dev.sub_range_base;
        let size = req.resid.load(Ordering::Acquire);
        if !range_is_valid(dev, start, size) {
            error!("Discard range [{}: {}] is invalid.", start, size);
            return libc::EINVAL;
        }
        ranges.push((start, size));
    }

    for (start, size) in ranges {
        let ret = if dev.is_blk {
            raw_blk_discard(dev.fd(), start, size)
        } else {
            // Punch a hole but keep the apparent file length, then make the
            // deallocation durable.
            let ret = raw_discard(dev.fd(), start, size);
            if ret == 0 {
                raw_datasync(dev.fd())
            } else {
                ret
            }
        };
        if ret < 0 {
            error!(
                "Failed to discard offset={} nbytes={} errno {}.",
                start, size, -ret
            );
            return (-ret) as i32;
        }
    }
    req.resid.store(0, Ordering::Release);

    0
}

fn range_is_valid(dev: &BlockDev, start: u64, size: u64) -> bool {
    if size == 0 {
        return false;
    }
    match start.checked_add(size) {
        Some(end) if end <= dev.size + dev.sub_range_base => {}
        _ => return false,
    }
    if size / SECTOR_SIZE > dev.max_discard_sectors {
        return false;
    }
    if dev.discard_sector_alignment != 0
        && (start / SECTOR_SIZE) % dev.discard_sector_alignment != 0
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use vmm_sys_util::tempfile::TempFile;

    use util::aio::{AioEngine, Iovec};

    fn discard_dev(tmp: &TempFile, max_sectors: u64, max_seg: u32, align: u64) -> BlockDev {
        let file = tmp.as_file().try_clone().unwrap();
        let size = file.metadata().unwrap().len();
        BlockDev {
            file,
            is_blk: false,
            read_only: false,
            direct: false,
            bst_block: true,
            candiscard: true,
            max_discard_sectors: max_sectors,
            max_discard_seg: max_seg,
            discard_sector_alignment: align,
            size,
            sectsz: 512,
            psectsz: 512,
            psectoff: 0,
            sub_range_base: 0,
            sub_range: None,
            wce: AtomicBool::new(true),
            aio: AioEngine::Threads,
        }
    }

    fn noop_cb() -> crate::BlockIoCompleteCb {
        Arc::new(|_: &BlockRequest, _: i32| {})
    }

    fn record_req(records: &[DiscardRange]) -> Arc<BlockRequest> {
        let len = (records.len() * size_of::<DiscardRange>()) as u64;
        BlockRequest::new(
            0,
            vec![Iovec::new(records.as_ptr() as u64, len)],
            0,
            noop_cb(),
        )
    }

    #[test]
    fn test_discard_multi_range() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all_at(&vec![0xFFu8; 1 << 20], 0).unwrap();
        let dev = discard_dev(&tmp, 1024, 4, 8);

        let records = [
            DiscardRange { sector: 8, num_sectors: 8, flags: 0 },
            DiscardRange { sector: 32, num_sectors: 16, flags: 0 },
            DiscardRange { sector: 128, num_sectors: 8, flags: 0 },
        ];
        let req = record_req(&records);
        assert_eq!(process_discard(&dev, &req), 0);
        assert_eq!(req.resid.load(Ordering::Acquire), 0);

        let mut buf = vec![0u8; 512];
        for (sector, zeroed) in [(7, false), (8, true), (15, true), (16, false), (40, true), (128, true)] {
            tmp.as_file().read_exact_at(&mut buf, sector * 512).unwrap();
            let expect = if zeroed { vec![0u8; 512] } else { vec![0xFFu8; 512] };
            assert_eq!(buf, expect, "sector {}", sector);
        }
    }

    #[test]
    fn test_discard_rejects_misaligned_record_before_any_punch() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all_at(&vec![0xFFu8; 1 << 20], 0).unwrap();
        let dev = discard_dev(&tmp, 1024, 4, 8);

        let records = [
            DiscardRange { sector: 8, num_sectors: 8, flags: 0 },
            DiscardRange { sector: 7, num_sectors: 8, flags: 0 },
        ];
        let req = record_req(&records);
        assert_eq!(process_discard(&dev, &req), libc::EINVAL);

        // The valid first range must not have been punched.
        let mut buf = vec![0u8; 512];
        tmp.as_file().read_exact_at(&mut buf, 8 * 512).unwrap();
        assert_eq!(buf, vec![0xFFu8; 512]);
    }

    #[test]
    fn test_discard_limits() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let dev = discard_dev(&tmp, 16, 2, 0);

        // Too many records.
        let records = [
            DiscardRange { sector: 0, num_sectors: 1, flags: 0 },
            DiscardRange { sector: 8, num_sectors: 1, flags: 0 },
            DiscardRange { sector: 16, num_sectors: 1, flags: 0 },
        ];
        assert_eq!(process_discard(&dev, &record_req(&records)), libc::EINVAL);

        // Range larger than max_discard_sectors.
        let records = [DiscardRange { sector: 0, num_sectors: 17, flags: 0 }];
        assert_eq!(process_discard(&dev, &record_req(&records)), libc::EINVAL);

        // Range crossing the device end.
        let records = [DiscardRange { sector: 2047, num_sectors: 2, flags: 0 }];
        assert_eq!(process_discard(&dev, &record_req(&records)), libc::EINVAL);

        // Empty range.
        let records = [DiscardRange { sector: 0, num_sectors: 0, flags: 0 }];
        assert_eq!(process_discard(&dev, &record_req(&records)), libc::EINVAL);
    }

    #[test]
    fn test_discard_single_range_form() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all_at(&vec![0xFFu8; 1 << 20], 0).unwrap();
        let dev = discard_dev(&tmp, 1024, 1, 0);

        // No record segment: the range comes from offset and resid.
        let req = BlockRequest::new(4096, Vec::new(), 0, noop_cb());
        req.resid.store(8192, Ordering::Release);
        assert_eq!(process_discard(&dev, &req), 0);

        let mut buf = vec![0u8; 8192];
        tmp.as_file().read_exact_at(&mut buf, 4096).unwrap();
        assert_eq!(buf, vec![0u8; 8192]);
    }

    #[test]
    fn test_discard_refused_when_unsupported_or_readonly() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();

        let mut dev = discard_dev(&tmp, 1024, 1, 0);
        dev.candiscard = false;
        let req = BlockRequest::new(0, Vec::new(), 0, noop_cb());
        req.resid.store(512, Ordering::Release);
        assert_eq!(process_discard(&dev, &req), libc::EOPNOTSUPP);

        dev.candiscard = true;
        dev.read_only = true;
        assert_eq!(process_discard(&dev, &req), libc::EROFS);
    }
}

// Copyright 2024 Oxide Computer Company
//! A namespace held in memory, exposed through the queue transport.
//!
//! Commands execute when they are submitted and their completions wait in
//! a per-queue list until polled.  Knobs on the device and its queues
//! inject the faults the verification paths are meant to catch.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::namespace::DsmRange;
use crate::transport::{DmaBuffer, NamespaceInfo, RawCompletion, Transport};
use crate::{Completion, IoOpcode, NvmeCommand, Status};

struct Inner {
    bytes: Vec<u8>,

    /// Blocks marked by Write Uncorrectable
    uncorrectable: Vec<bool>,
}

/// In-memory NVMe namespace, shared by all of its queues
#[derive(Clone)]
pub struct MemDevice {
    info: NamespaceInfo,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice").field("info", &self.info).finish()
    }
}

impl MemDevice {
    pub fn new(info: NamespaceInfo) -> Self {
        let blocks = info.sector_count as usize;
        MemDevice {
            info,
            inner: Arc::new(Mutex::new(Inner {
                bytes: vec![0; blocks * info.sector_size as usize],
                uncorrectable: vec![false; blocks],
            })),
        }
    }

    /// Namespace 1 with the given geometry and a 128 KiB transfer limit
    pub fn with_geometry(sector_count: u64, sector_size: u32) -> Self {
        Self::new(NamespaceInfo {
            nsid: 1,
            sector_size,
            sector_count,
            max_transfer_size: 128 * 1024,
        })
    }

    pub fn info(&self) -> NamespaceInfo {
        self.info
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A new I/O queue onto this device
    pub fn queue(&self) -> MemQueue {
        MemQueue {
            dev: self.clone(),
            completions: VecDeque::new(),
            next_handle: 1,
            submitted: 0,
            fail: None,
            refuse: None,
            hang: false,
            latency: Duration::ZERO,
        }
    }

    /// Copy of the stored bytes of some sectors
    pub fn read_sectors(&self, lba: u64, count: u64) -> Vec<u8> {
        let bs = self.info.sector_size as usize;
        let inner = self.lock();
        inner.bytes[lba as usize * bs..][..count as usize * bs].to_vec()
    }

    /// XOR one stored byte of a sector, behind the driver's back
    pub fn corrupt(&self, lba: u64, offset: usize, mask: u8) {
        let bs = self.info.sector_size as usize;
        let mut inner = self.lock();
        inner.bytes[lba as usize * bs + offset] ^= mask;
    }

    /// Copy a stored sector over another one, as a misdirected write would
    pub fn misdirect(&self, from_lba: u64, to_lba: u64) {
        let bs = self.info.sector_size as usize;
        let mut inner = self.lock();
        let src = from_lba as usize * bs;
        inner
            .bytes
            .copy_within(src..src + bs, to_lba as usize * bs);
    }

    fn in_range(&self, lba: u64, count: u64) -> bool {
        lba.checked_add(count)
            .is_some_and(|end| end <= self.info.sector_count)
    }

    fn execute(&self, cmd: &NvmeCommand, buf: Option<&mut DmaBuffer>) -> Status {
        let bs = self.info.sector_size as usize;
        let opcode = match IoOpcode::from_repr(cmd.opcode()) {
            Some(o) => o,
            None => return Status::INVALID_OPCODE,
        };

        match opcode {
            IoOpcode::Flush => Status::SUCCESS,
            IoOpcode::Read | IoOpcode::Write | IoOpcode::Compare => {
                let (lba, count) = (cmd.lba(), cmd.lba_count() as u64);
                if !self.in_range(lba, count) {
                    return Status::LBA_OUT_OF_RANGE;
                }
                let Some(buf) = buf.filter(|b| b.len() >= count as usize * bs)
                else {
                    return Status::INVALID_FIELD;
                };
                let len = count as usize * bs;
                let start = lba as usize * bs;
                let mut inner = self.lock();
                let marked = inner.uncorrectable[lba as usize..][..count as usize]
                    .iter()
                    .any(|u| *u);

                match opcode {
                    IoOpcode::Write => {
                        inner.bytes[start..][..len].copy_from_slice(&buf[..len]);
                        inner.uncorrectable[lba as usize..][..count as usize]
                            .fill(false);
                        Status::SUCCESS
                    }
                    _ if marked => Status::UNRECOVERED_READ,
                    IoOpcode::Read => {
                        buf[..len].copy_from_slice(&inner.bytes[start..][..len]);
                        Status::SUCCESS
                    }
                    _ => {
                        if buf[..len] == inner.bytes[start..][..len] {
                            Status::SUCCESS
                        } else {
                            // Compare Failure
                            Status { sct: 2, sc: 0x85 }
                        }
                    }
                }
            }
            IoOpcode::WriteUncorrectable | IoOpcode::WriteZeroes => {
                let (lba, count) = (cmd.lba(), cmd.lba_count() as u64);
                if !self.in_range(lba, count) {
                    return Status::LBA_OUT_OF_RANGE;
                }
                let mut inner = self.lock();
                let blocks = lba as usize..(lba + count) as usize;
                if opcode == IoOpcode::WriteZeroes {
                    inner.bytes[blocks.start * bs..blocks.end * bs].fill(0);
                    inner.uncorrectable[blocks].fill(false);
                } else {
                    inner.uncorrectable[blocks].fill(true);
                }
                Status::SUCCESS
            }
            IoOpcode::DatasetManagement => {
                let nr = (cmd.cdw10 & 0xff) as usize + 1;
                let Some(buf) = buf else {
                    return Status::INVALID_FIELD;
                };
                let Some(ranges) = DsmRange::parse(buf, nr) else {
                    return Status::INVALID_FIELD;
                };
                if cmd.cdw11 & DsmRange::ATTR_DEALLOCATE == 0 {
                    return Status::SUCCESS;
                }
                if ranges.iter().any(|r| !self.in_range(r.lba, r.count as u64)) {
                    return Status::LBA_OUT_OF_RANGE;
                }
                let mut inner = self.lock();
                for r in ranges {
                    let blocks = r.lba as usize..(r.lba + r.count as u64) as usize;
                    inner.bytes[blocks.start * bs..blocks.end * bs].fill(0);
                    inner.uncorrectable[blocks].fill(false);
                }
                Status::SUCCESS
            }
        }
    }
}

/// One queue onto a [`MemDevice`]
#[derive(Debug)]
pub struct MemQueue {
    dev: MemDevice,
    completions: VecDeque<(Instant, RawCompletion)>,
    next_handle: u64,
    submitted: u64,
    fail: Option<(u64, Status)>,
    refuse: Option<Status>,
    hang: bool,
    latency: Duration,
}

impl MemQueue {
    pub fn device(&self) -> &MemDevice {
        &self.dev
    }

    /// Complete the `nth` command from now (1 = the next one) with
    /// `status`, without executing it
    pub fn fail_nth(&mut self, nth: u64, status: Status) {
        self.fail = Some((self.submitted + nth, status));
    }

    /// Refuse every submission with `status`, or accept again with `None`
    pub fn refuse_submits(&mut self, status: Option<Status>) {
        self.refuse = status;
    }

    /// Hold every completion back until un-hung
    pub fn set_hang(&mut self, hang: bool) {
        self.hang = hang;
    }

    /// Delay each completion by at least `latency`
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = latency;
    }
}

impl Transport for MemQueue {
    fn namespace_info(&self) -> NamespaceInfo {
        self.dev.info
    }

    fn submit(
        &mut self,
        cmd: &NvmeCommand,
        mut buf: Option<DmaBuffer>,
    ) -> Result<u64, Status> {
        if let Some(status) = self.refuse {
            return Err(status);
        }
        self.submitted += 1;

        let status = match self.fail {
            Some((nth, status)) if nth == self.submitted => {
                self.fail = None;
                status
            }
            _ => self.dev.execute(cmd, buf.as_mut()),
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.completions.push_back((
            Instant::now() + self.latency,
            RawCompletion {
                handle,
                cpl: Completion::new(1, cmd.cid(), status),
                buf,
            },
        ));
        Ok(handle)
    }

    fn poll(&mut self, max: usize) -> Vec<RawCompletion> {
        if self.hang {
            return Vec::new();
        }
        let now = Instant::now();
        let max = if max == 0 { usize::MAX } else { max };
        let mut out = Vec::new();
        while out.len() < max {
            match self.completions.front() {
                Some((ready, _)) if *ready <= now => {}
                _ => break,
            }
            if let Some((_, c)) = self.completions.pop_front() {
                out.push(c);
            }
        }
        out
    }

    fn outstanding(&self) -> usize {
        self.completions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dev() -> MemDevice {
        MemDevice::with_geometry(64, 512)
    }

    fn submit(q: &mut MemQueue, cmd: NvmeCommand, buf: Option<DmaBuffer>) -> RawCompletion {
        let handle = q.submit(&cmd, buf).unwrap();
        let mut cpls = q.poll(0);
        assert_eq!(cpls.len(), 1);
        let c = cpls.remove(0);
        assert_eq!(c.handle, handle);
        c
    }

    #[test]
    fn write_then_read() {
        let d = dev();
        let mut q = d.queue();
        let mut buf = DmaBuffer::sectors(2, 512);
        buf[..].fill(0x77);
        let c = submit(&mut q, NvmeCommand::read_write(false, 1, 4, 2, 0), Some(buf));
        assert!(!c.cpl.is_error());
        assert_eq!(d.read_sectors(4, 2), vec![0x77; 1024]);

        let c = submit(
            &mut q,
            NvmeCommand::read_write(true, 1, 5, 1, 0),
            Some(DmaBuffer::sectors(1, 512)),
        );
        assert_eq!(&c.buf.unwrap()[..], &[0x77; 512][..]);
    }

    #[test]
    fn out_of_range_and_short_buffer() {
        let d = dev();
        let mut q = d.queue();
        let c = submit(
            &mut q,
            NvmeCommand::read_write(true, 1, 63, 2, 0),
            Some(DmaBuffer::sectors(2, 512)),
        );
        assert_eq!(c.cpl.status(), Status::LBA_OUT_OF_RANGE);

        let c = submit(
            &mut q,
            NvmeCommand::read_write(true, 1, 0, 2, 0),
            Some(DmaBuffer::sectors(1, 512)),
        );
        assert_eq!(c.cpl.status(), Status::INVALID_FIELD);
    }

    #[test]
    fn uncorrectable_until_rewritten() {
        let d = dev();
        let mut q = d.queue();
        let mut cmd = NvmeCommand::new(IoOpcode::WriteUncorrectable as u8, 1);
        cmd.cdw10 = 8;
        submit(&mut q, cmd, None);

        let read = NvmeCommand::read_write(true, 1, 8, 1, 0);
        let c = submit(&mut q, read, Some(DmaBuffer::sectors(1, 512)));
        assert_eq!(c.cpl.status(), Status::UNRECOVERED_READ);

        let write = NvmeCommand::read_write(false, 1, 8, 1, 0);
        submit(&mut q, write, Some(DmaBuffer::sectors(1, 512)));
        let c = submit(&mut q, read, Some(DmaBuffer::sectors(1, 512)));
        assert!(!c.cpl.is_error());
    }

    #[test]
    fn fault_knobs() {
        let d = dev();
        let mut q = d.queue();
        let flush = NvmeCommand::new(IoOpcode::Flush as u8, 1);

        q.fail_nth(2, Status::INTERNAL_ERROR);
        assert!(!submit(&mut q, flush, None).cpl.is_error());
        assert_eq!(submit(&mut q, flush, None).cpl.status(), Status::INTERNAL_ERROR);
        assert!(!submit(&mut q, flush, None).cpl.is_error());

        q.set_hang(true);
        q.submit(&flush, None).unwrap();
        assert!(q.poll(0).is_empty());
        assert_eq!(q.outstanding(), 1);
        q.set_hang(false);
        assert_eq!(q.poll(0).len(), 1);

        q.refuse_submits(Some(Status::ABORTED_BY_REQUEST));
        assert_eq!(q.submit(&flush, None), Err(Status::ABORTED_BY_REQUEST));
        q.refuse_submits(None);

        q.set_latency(Duration::from_millis(20));
        q.submit(&flush, None).unwrap();
        assert!(q.poll(0).is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.poll(0).len(), 1);
    }

    #[test]
    fn poll_respects_max() {
        let d = dev();
        let mut q = d.queue();
        let flush = NvmeCommand::new(IoOpcode::Flush as u8, 1);
        for _ in 0..5 {
            q.submit(&flush, None).unwrap();
        }
        assert_eq!(q.poll(2).len(), 2);
        assert_eq!(q.outstanding(), 3);
        assert_eq!(q.poll(0).len(), 3);
    }
}

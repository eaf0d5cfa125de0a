// Copyright 2024 Oxide Computer Company
use std::sync::Arc;

use slog::{debug, info, Logger};

use crate::integrity::DataIntegrity;
use crate::qpair::QueuePair;
use crate::transport::{DmaBuffer, NamespaceInfo, Transport};
use crate::{IoOpcode, NvmeCommand, NvmeError};

/// One Dataset Management range
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DsmRange {
    pub lba: u64,
    pub count: u32,
}

impl DsmRange {
    pub const SIZE: usize = 16;
    /// cdw11 attribute bit for deallocate
    pub const ATTR_DEALLOCATE: u32 = 1 << 2;

    /// Encode ranges the way the device reads them from the data buffer
    pub fn encode(ranges: &[DsmRange]) -> DmaBuffer {
        let mut buf = DmaBuffer::zeroed(ranges.len() * Self::SIZE);
        for (r, chunk) in ranges.iter().zip(buf.chunks_exact_mut(Self::SIZE)) {
            chunk[4..8].copy_from_slice(&r.count.to_le_bytes());
            chunk[8..16].copy_from_slice(&r.lba.to_le_bytes());
        }
        buf
    }

    pub fn parse(buf: &[u8], nr: usize) -> Option<Vec<DsmRange>> {
        let bytes = buf.get(..nr.checked_mul(Self::SIZE)?)?;
        Some(
            bytes
                .chunks_exact(Self::SIZE)
                .map(|c| DsmRange {
                    count: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                    lba: u64::from_le_bytes([
                        c[8], c[9], c[10], c[11], c[12], c[13], c[14], c[15],
                    ]),
                })
                .collect(),
        )
    }
}

/// Namespace 1 of the device, with its data integrity state
#[derive(Debug)]
pub struct Namespace {
    info: NamespaceInfo,
    integrity: Arc<DataIntegrity>,
    log: Logger,
}

impl Namespace {
    pub(crate) fn new(
        info: NamespaceInfo,
        integrity: Arc<DataIntegrity>,
        log: Logger,
    ) -> Self {
        Namespace {
            info,
            integrity,
            log,
        }
    }

    pub fn info(&self) -> NamespaceInfo {
        self.info
    }

    pub fn nsid(&self) -> u32 {
        self.info.nsid
    }

    pub fn sector_size(&self) -> usize {
        self.info.sector_size as usize
    }

    pub fn sector_count(&self) -> u64 {
        self.info.sector_count
    }

    pub fn integrity(&self) -> &DataIntegrity {
        &self.integrity
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    fn check_range(&self, lba: u64, count: u64) -> Result<(), NvmeError> {
        match lba.checked_add(count) {
            Some(end) if end <= self.info.sector_count => Ok(()),
            _ => Err(NvmeError::InvalidField(format!(
                "lba {} count {} beyond namespace of {} sectors",
                lba, count, self.info.sector_count
            ))),
        }
    }

    /// Read or write `lba_count` sectors starting at `lba`
    ///
    /// Write buffers are tagged and their checksums recorded before the
    /// command is submitted.  `io_flags` go into the upper half of cdw12.
    #[allow(clippy::too_many_arguments)]
    pub fn read_write<T: Transport>(
        &self,
        qpair: &mut QueuePair<T>,
        is_read: bool,
        mut buf: DmaBuffer,
        lba: u64,
        lba_count: u16,
        io_flags: u32,
        ctx: u64,
    ) -> Result<(), NvmeError> {
        if lba_count == 0 {
            return Err(NvmeError::InvalidField("zero lba count".to_string()));
        }
        if io_flags & 0xffff != 0 {
            return Err(NvmeError::InvalidField(format!(
                "io flags {:#x} overlap the lba count",
                io_flags
            )));
        }
        self.check_range(lba, lba_count as u64)?;

        let len = lba_count as usize * self.sector_size();
        if buf.len() < len {
            return Err(NvmeError::InvalidField(format!(
                "buffer of {} bytes is short for {} sectors",
                buf.len(),
                lba_count
            )));
        }
        if len > self.info.max_transfer_size as usize {
            return Err(NvmeError::InvalidField(format!(
                "transfer of {} bytes exceeds the limit of {}",
                len, self.info.max_transfer_size
            )));
        }

        let token = if is_read {
            0
        } else {
            self.integrity.tag_and_checksum(
                &mut buf,
                lba,
                lba_count as u64,
                self.sector_size(),
            )?
        };

        let cmd =
            NvmeCommand::read_write(is_read, self.nsid(), lba, lba_count, io_flags);
        qpair.submit(cmd, Some(buf), token, ctx)
    }

    /// Forget the checksums of deallocated ranges
    pub fn deallocate_ranges(&self, ranges: &[DsmRange]) -> Result<(), NvmeError> {
        for r in ranges {
            debug!(self.log, "deallocate lba {:#x}, count {}", r.lba, r.count);
            self.integrity.clear_range(r.lba, r.count as u64, false)?;
        }
        Ok(())
    }

    /// Send a Dataset Management deallocate for `ranges`
    pub fn deallocate<T: Transport>(
        &self,
        qpair: &mut QueuePair<T>,
        ranges: &[DsmRange],
        ctx: u64,
    ) -> Result<(), NvmeError> {
        if ranges.is_empty() || ranges.len() > 256 {
            return Err(NvmeError::InvalidField(format!(
                "{} dataset management ranges",
                ranges.len()
            )));
        }
        for r in ranges {
            self.check_range(r.lba, r.count as u64)?;
        }

        let mut cmd =
            NvmeCommand::new(IoOpcode::DatasetManagement as u8, self.nsid());
        cmd.cdw10 = ranges.len() as u32 - 1;
        cmd.cdw11 = DsmRange::ATTR_DEALLOCATE;
        qpair.submit(cmd, Some(DsmRange::encode(ranges)), 0, ctx)?;
        self.deallocate_ranges(ranges)
    }

    /// Mark sectors uncorrectable on the device and in the checksum table
    pub fn write_uncorrectable<T: Transport>(
        &self,
        qpair: &mut QueuePair<T>,
        lba: u64,
        lba_count: u16,
        ctx: u64,
    ) -> Result<(), NvmeError> {
        if lba_count == 0 {
            return Err(NvmeError::InvalidField("zero lba count".to_string()));
        }
        self.check_range(lba, lba_count as u64)?;

        let mut cmd =
            NvmeCommand::new(IoOpcode::WriteUncorrectable as u8, self.nsid());
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = lba_count as u32 - 1;
        qpair.submit(cmd, None, 0, ctx)?;
        self.integrity.clear_range(lba, lba_count as u64, true)
    }

    /// Forget every checksum after a Format NVM
    pub fn format(&self) {
        info!(self.log, "format: clearing the checksum table");
        self.integrity.clear_all(false);
    }

    /// Forget every checksum after a Sanitize
    pub fn sanitize(&self) {
        info!(self.log, "sanitize: clearing the checksum table");
        self.integrity.clear_all(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::TestDriver;
    use crate::{Driver, Status};

    const SS: usize = 512;

    #[test]
    fn dsm_range_layout() {
        let buf = DsmRange::encode(&[DsmRange {
            lba: 0x0102_0304_0506,
            count: 9,
        }]);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[4..8], &[9, 0, 0, 0]);
        assert_eq!(&buf[8..14], &[6, 5, 4, 3, 2, 1]);
        assert!(DsmRange::parse(&buf, 2).is_none());
    }

    #[test]
    fn rejects_bad_fields() {
        let td = TestDriver::new(64);
        let mut qp = td.qpair();
        let ns = &td.ns;
        let buf = || DmaBuffer::sectors(8, SS);

        let flags = ns.read_write(&mut qp, true, buf(), 0, 8, 0x10, 0);
        assert!(matches!(flags, Err(NvmeError::InvalidField(_))));
        let range = ns.read_write(&mut qp, true, buf(), 60, 8, 0, 0);
        assert!(matches!(range, Err(NvmeError::InvalidField(_))));
        let short = ns.read_write(&mut qp, true, buf(), 0, 9, 0, 0);
        assert!(matches!(short, Err(NvmeError::InvalidField(_))));
        assert_eq!(qp.outstanding(), 0);
        // Nothing was tagged either
        assert_eq!(ns.integrity().token().current(), 1);
    }

    #[test]
    fn transfer_limit() {
        let td = TestDriver::with_geometry(1024, SS as u32, 4 * SS as u32);
        let mut qp = td.qpair();
        let res =
            td.ns
                .read_write(&mut qp, false, DmaBuffer::sectors(5, SS), 0, 5, 0, 0);
        assert!(matches!(res, Err(NvmeError::InvalidField(_))));
        td.ns
            .read_write(&mut qp, false, DmaBuffer::sectors(4, SS), 0, 4, 0, 0)
            .unwrap();
    }

    #[test]
    fn write_then_verified_read() {
        let td = TestDriver::new(64);
        td.driver.config(Driver::VERIFY_READ);
        let mut qp = td.qpair();

        td.ns
            .read_write(&mut qp, false, DmaBuffer::sectors(4, SS), 8, 4, 1 << 30, 1)
            .unwrap();
        td.ns
            .read_write(&mut qp, true, DmaBuffer::sectors(4, SS), 8, 4, 0, 2)
            .unwrap();

        let mut statuses = Vec::new();
        qp.process_completions(0, |_, c| statuses.push((c.ctx, c.status())));
        assert_eq!(statuses, vec![(1, Status::SUCCESS), (2, Status::SUCCESS)]);

        let cmd = td.driver.cmdlog().dump(qp.qid(), 2).unwrap().last().unwrap();
        assert_eq!(cmd.command.cdw12 >> 16, 1 << 14);
        assert_eq!(cmd.buffer_token, 1);
    }

    #[test]
    fn deallocate_clears_checksums() {
        let td = TestDriver::new(64);
        let mut qp = td.qpair();
        td.ns
            .read_write(&mut qp, false, DmaBuffer::sectors(8, SS), 0, 8, 0, 0)
            .unwrap();
        qp.process_completions(0, |_, _| {});
        let table = td.ns.integrity().table().unwrap();
        assert_ne!(table.get(2), Some(0));

        let ranges = [DsmRange { lba: 2, count: 3 }];
        td.ns.deallocate(&mut qp, &ranges, 0).unwrap();
        let mut ok = false;
        qp.process_completions(0, |_, c| ok = !c.is_error());
        assert!(ok);

        for lba in 2..5 {
            assert_eq!(table.get(lba), Some(0));
        }
        assert_ne!(table.get(5), Some(0));
        // The device zeroed those sectors and the reads now pass as unwritten
        assert_eq!(td.dev.read_sectors(2, 3), vec![0; 3 * SS]);
    }

    #[test]
    fn uncorrectable_is_poisoned() {
        let td = TestDriver::new(64);
        let mut qp = td.qpair();
        td.ns.write_uncorrectable(&mut qp, 7, 2, 0).unwrap();
        qp.process_completions(0, |_, _| {});
        let table = td.ns.integrity().table().unwrap();
        assert_eq!(table.get(7), Some(0xffff_ffff));
        assert_eq!(table.get(8), Some(0xffff_ffff));
        assert_eq!(table.get(9), Some(0));

        td.ns.sanitize();
        assert_eq!(table.get(7), Some(0));
    }
}

// Copyright 2024 Oxide Computer Company
//! Write tagging and read verification.
//!
//! Every written sector carries its own LBA in the first 64-bit word and a
//! sequence token in the last one, and its CRC32C goes into an out-of-band
//! table with one slot per LBA.  Reading a sector back and comparing the
//! three catches lost, misdirected and silently corrupted writes.
use std::sync::atomic::{AtomicU32, Ordering};

use slog::{warn, Logger};

use crate::shm::SharedRegion;
use crate::NvmeError;

/// Table slot of an LBA that has never been written
pub const CRC_UNWRITTEN: u32 = 0;
/// Table slot of an LBA marked uncorrectable
pub const CRC_UNCORRECTABLE: u32 = 0xffff_ffff;

const WORD: usize = std::mem::size_of::<u64>();

/// Move real checksums off the two reserved slot values
pub fn remap_reserved(crc: u32) -> u32 {
    match crc {
        CRC_UNWRITTEN => 1,
        CRC_UNCORRECTABLE => CRC_UNCORRECTABLE - 1,
        crc => crc,
    }
}

/// Checksum of one sector, in the form it is stored in the table
pub fn sector_checksum(sector: &[u8]) -> u32 {
    remap_reserved(crc32c::crc32c(sector))
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut w = [0u8; WORD];
    w.copy_from_slice(&bytes[..WORD]);
    u64::from_ne_bytes(w)
}

/// Why a sector failed verification
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("lba {lba} is marked uncorrectable")]
    Uncorrectable { lba: u64 },

    #[error("lba {lba} holds data tagged for lba {found}")]
    LbaMismatch { lba: u64, found: u64 },

    #[error("lba {lba} checksum {computed:#010x}, expected {expected:#010x}")]
    ChecksumMismatch {
        lba: u64,
        expected: u32,
        computed: u32,
    },

    #[error("lba {lba}: {len} bytes do not fit sectors of {sector_size}")]
    Geometry {
        lba: u64,
        sector_size: usize,
        len: usize,
    },
}

impl VerifyError {
    pub fn lba(&self) -> u64 {
        match self {
            VerifyError::Uncorrectable { lba }
            | VerifyError::LbaMismatch { lba, .. }
            | VerifyError::ChecksumMismatch { lba, .. }
            | VerifyError::Geometry { lba, .. } => *lba,
        }
    }
}

impl From<VerifyError> for NvmeError {
    fn from(e: VerifyError) -> Self {
        NvmeError::Verify(e.to_string())
    }
}

/// The device wide write counter
#[derive(Debug)]
pub struct SequenceToken {
    region: SharedRegion,
}

impl SequenceToken {
    pub fn from_region(region: SharedRegion) -> Self {
        SequenceToken { region }
    }

    pub fn current(&self) -> u64 {
        self.region.as_atomic_u64().load(Ordering::SeqCst)
    }

    /// Reserve `n` consecutive token values, returning the first
    pub fn fetch_add(&self, n: u64) -> u64 {
        self.region.as_atomic_u64().fetch_add(n, Ordering::SeqCst)
    }

    pub(crate) fn reset(&self, value: u64) {
        self.region.as_atomic_u64().store(value, Ordering::SeqCst);
    }
}

/// One 32-bit checksum slot per LBA
#[derive(Debug)]
pub struct ChecksumTable {
    region: SharedRegion,
}

impl ChecksumTable {
    pub fn from_region(region: SharedRegion) -> Self {
        ChecksumTable { region }
    }

    fn slots(&self) -> &[AtomicU32] {
        self.region.as_atomic_u32_slice()
    }

    /// Number of LBAs covered
    pub fn len(&self) -> u64 {
        self.slots().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn get(&self, lba: u64) -> Option<u32> {
        self.slots()
            .get(lba as usize)
            .map(|s| s.load(Ordering::Relaxed))
    }

    pub fn set(&self, lba: u64, crc: u32) -> Result<(), NvmeError> {
        let slot = self.slots().get(lba as usize).ok_or_else(|| {
            NvmeError::InvalidField(format!(
                "lba {} beyond checksum table of {}",
                lba,
                self.len()
            ))
        })?;
        slot.store(crc, Ordering::Relaxed);
        Ok(())
    }

    /// Fill every byte of `count` slots starting at `first` with `fill`
    pub fn clear(
        &self,
        first: u64,
        count: u64,
        fill: u8,
    ) -> Result<(), NvmeError> {
        let end = first.checked_add(count).filter(|end| *end <= self.len());
        let Some(end) = end else {
            return Err(NvmeError::InvalidField(format!(
                "clear of {} lbas at {} beyond checksum table of {}",
                count,
                first,
                self.len()
            )));
        };
        let value = u32::from_ne_bytes([fill; 4]);
        for slot in &self.slots()[first as usize..end as usize] {
            slot.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn clear_all(&self, fill: u8) {
        let value = u32::from_ne_bytes([fill; 4]);
        for slot in self.slots() {
            slot.store(value, Ordering::Relaxed);
        }
    }
}

/// Tagging and verification for one namespace
///
/// Without a checksum table the codec runs degraded: writes are still
/// tagged, and reads of tagged sectors are only checked for the LBA word.
#[derive(Debug)]
pub struct DataIntegrity {
    token: SequenceToken,
    table: Option<ChecksumTable>,
}

impl DataIntegrity {
    pub fn new(
        token: SequenceToken,
        table: Option<ChecksumTable>,
        log: &Logger,
    ) -> Self {
        if table.is_none() {
            warn!(log, "no checksum table, data verification is degraded");
        }
        DataIntegrity { token, table }
    }

    pub fn is_degraded(&self) -> bool {
        self.table.is_none()
    }

    pub fn token(&self) -> &SequenceToken {
        &self.token
    }

    pub fn table(&self) -> Option<&ChecksumTable> {
        self.table.as_ref()
    }

    fn check_geometry(
        buf_len: usize,
        lba_count: u64,
        sector_size: usize,
    ) -> Result<(), NvmeError> {
        if sector_size < 2 * WORD || sector_size % WORD != 0 {
            return Err(NvmeError::InvalidField(format!(
                "sector size {} cannot carry tags",
                sector_size
            )));
        }
        let need = (sector_size as u64).checked_mul(lba_count);
        if need.map_or(true, |need| need > buf_len as u64) {
            return Err(NvmeError::InvalidField(format!(
                "buffer of {} bytes is short for {} sectors of {}",
                buf_len, lba_count, sector_size
            )));
        }
        Ok(())
    }

    /// Stamp a write buffer and record its checksums
    ///
    /// Takes `lba_count` values from the sequence token in one step and
    /// returns the first one.
    pub fn tag_and_checksum(
        &self,
        buf: &mut [u8],
        first_lba: u64,
        lba_count: u64,
        sector_size: usize,
    ) -> Result<u64, NvmeError> {
        Self::check_geometry(buf.len(), lba_count, sector_size)?;
        if let Some(table) = &self.table {
            let end = first_lba.checked_add(lba_count);
            if end.map_or(true, |end| end > table.len()) {
                return Err(NvmeError::InvalidField(format!(
                    "{} lbas at {} beyond checksum table of {}",
                    lba_count,
                    first_lba,
                    table.len()
                )));
            }
        }
        let token = self.token.fetch_add(lba_count);

        for (i, sector) in buf
            .chunks_exact_mut(sector_size)
            .take(lba_count as usize)
            .enumerate()
        {
            let lba = first_lba + i as u64;
            sector[..WORD].copy_from_slice(&lba.to_ne_bytes());
            sector[sector_size - WORD..]
                .copy_from_slice(&(token + i as u64).to_ne_bytes());

            if let Some(table) = &self.table {
                table.set(lba, sector_checksum(sector))?;
            }
        }
        Ok(token)
    }

    /// Check a read buffer, stopping at the first bad sector
    ///
    /// A buffer that cannot hold `lba_count` tagged sectors fails as a whole.
    pub fn verify(
        &self,
        buf: &[u8],
        first_lba: u64,
        lba_count: u64,
        sector_size: usize,
    ) -> Result<(), VerifyError> {
        if Self::check_geometry(buf.len(), lba_count, sector_size).is_err() {
            return Err(VerifyError::Geometry {
                lba: first_lba,
                sector_size,
                len: buf.len(),
            });
        }
        for (i, sector) in buf
            .chunks_exact(sector_size)
            .take(lba_count as usize)
            .enumerate()
        {
            let lba = first_lba + i as u64;
            let computed = sector_checksum(sector);
            let expected = match &self.table {
                Some(table) => table.get(lba).unwrap_or(computed),
                // Tokens start at 1, so a zero token word was never tagged
                None if read_word(&sector[sector_size - WORD..]) == 0 => {
                    continue
                }
                None => computed,
            };

            if expected == CRC_UNWRITTEN {
                continue;
            }
            if expected == CRC_UNCORRECTABLE {
                return Err(VerifyError::Uncorrectable { lba });
            }
            let found = read_word(sector);
            if found != lba {
                return Err(VerifyError::LbaMismatch { lba, found });
            }
            if computed != expected {
                return Err(VerifyError::ChecksumMismatch {
                    lba,
                    expected,
                    computed,
                });
            }
        }
        Ok(())
    }

    /// Forget (or poison) the checksums of a range of LBAs
    pub fn clear_range(
        &self,
        first_lba: u64,
        lba_count: u64,
        poison: bool,
    ) -> Result<(), NvmeError> {
        match &self.table {
            Some(table) => {
                table.clear(first_lba, lba_count, if poison { 0xff } else { 0 })
            }
            None => Ok(()),
        }
    }

    pub fn clear_all(&self, poison: bool) {
        if let Some(table) = &self.table {
            table.clear_all(if poison { 0xff } else { 0 });
        }
    }
}

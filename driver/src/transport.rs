// Copyright 2024 Oxide Computer Company
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::{Completion, NvmeCommand, Status};

/// Geometry of the namespace behind a transport
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub sector_size: u32,
    pub sector_count: u64,
    /// Largest single transfer, in bytes
    pub max_transfer_size: u32,
}

impl NamespaceInfo {
    pub fn max_transfer_sectors(&self) -> u64 {
        (self.max_transfer_size / self.sector_size.max(1)) as u64
    }

    pub fn capacity(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }
}

/// Data buffer that travels with a command
///
/// The buffer is moved into the transport at submit and handed back with
/// the completion, so it is never aliased while the device owns it.
#[must_use]
#[derive(Debug, PartialEq, Eq, Default)]
pub struct DmaBuffer {
    data: BytesMut,
}

impl DmaBuffer {
    pub fn zeroed(len: usize) -> DmaBuffer {
        DmaBuffer {
            data: BytesMut::zeroed(len),
        }
    }

    /// Buffer for `count` sectors of `sector_size` bytes each
    pub fn sectors(count: usize, sector_size: usize) -> DmaBuffer {
        Self::zeroed(count * sector_size)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn into_bytes_mut(self) -> BytesMut {
        self.data
    }
}

impl Deref for DmaBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for DmaBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A completion as the transport reports it
#[derive(Debug)]
pub struct RawCompletion {
    /// Handle returned by the matching `submit`
    pub handle: u64,
    pub cpl: Completion,
    pub buf: Option<DmaBuffer>,
}

/// One I/O queue of an NVMe controller
///
/// Submission never blocks; completions are only delivered from `poll`.
pub trait Transport {
    fn namespace_info(&self) -> NamespaceInfo;

    /// Queue a command, returning a handle that its completion will carry
    fn submit(
        &mut self,
        cmd: &NvmeCommand,
        buf: Option<DmaBuffer>,
    ) -> Result<u64, Status>;

    /// Reap up to `max` completions (0 = all available)
    fn poll(&mut self, max: usize) -> Vec<RawCompletion>;

    /// Commands submitted and not yet reaped
    fn outstanding(&self) -> usize;
}

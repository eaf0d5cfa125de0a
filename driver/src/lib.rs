// Copyright 2024 Oxide Computer Company
//! Engine of an NVMe validation driver.
//!
//! Cooperating processes share one device.  The primary process creates
//! the shared state (sequence token, checksum table, command log and the
//! global config word); secondaries attach to it by instance name.  Writes
//! are tagged so that reads can be verified against the checksum table, and
//! every queue keeps a rolling log of its commands for post-mortem use.

pub use nvmeval_common::*;

pub mod cmdlog;
pub mod driver;
pub mod integrity;
pub mod ioworker;
pub mod mem_device;
pub mod namespace;
pub mod qpair;
pub mod shm;
pub mod transport;

pub use cmdlog::{CmdLog, CmdLogRecord, QueueSummary};
pub use driver::{Driver, DriverConfig};
pub use integrity::{DataIntegrity, VerifyError};
pub use ioworker::{ioworker_entry, IoWorker, IoWorkerArgs, IoWorkerRets, RunEnd};
pub use mem_device::{MemDevice, MemQueue};
pub use namespace::{DsmRange, Namespace};
pub use qpair::{IoCompletion, QueuePair};
pub use shm::ProcessRole;
pub use transport::{DmaBuffer, NamespaceInfo, Transport};

// Copyright 2024 Oxide Computer Company
//! NVMe submission and completion queue entries, as seen by the driver.
//!
//! Only the parts of the protocol the validation engine needs are modeled
//! here: raw entry layouts (so they can be copied into shared memory), the
//! read/write field encoding, and status decoding.
use std::fmt;

use serde::{Deserialize, Serialize};

/// I/O command set opcodes
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::Display,
    strum::FromRepr,
    strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum IoOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
    #[strum(serialize = "Write Uncorrectable")]
    WriteUncorrectable = 0x04,
    Compare = 0x05,
    #[strum(serialize = "Write Zeroes")]
    WriteZeroes = 0x08,
    #[strum(serialize = "Dataset Management")]
    DatasetManagement = 0x09,
}

/// Admin command set opcodes
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    strum::Display,
    strum::FromRepr,
    strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum AdminOpcode {
    #[strum(serialize = "Delete I/O Submission Queue")]
    DeleteIoSq = 0x00,
    #[strum(serialize = "Create I/O Submission Queue")]
    CreateIoSq = 0x01,
    #[strum(serialize = "Get Log Page")]
    GetLogPage = 0x02,
    #[strum(serialize = "Delete I/O Completion Queue")]
    DeleteIoCq = 0x04,
    #[strum(serialize = "Create I/O Completion Queue")]
    CreateIoCq = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    #[strum(serialize = "Set Features")]
    SetFeatures = 0x09,
    #[strum(serialize = "Get Features")]
    GetFeatures = 0x0a,
    #[strum(serialize = "Asynchronous Event Request")]
    AsyncEventRequest = 0x0c,
    #[strum(serialize = "Format NVM")]
    FormatNvm = 0x80,
    Sanitize = 0x84,
}

/// Human readable name of an opcode; queue 0 uses the admin set.
pub fn opcode_name(opc: u8, admin: bool) -> &'static str {
    if admin {
        match AdminOpcode::from_repr(opc) {
            Some(o) => o.into(),
            None if opc >= 0xc0 => "Vendor specific",
            None => "Unknown",
        }
    } else {
        match IoOpcode::from_repr(opc) {
            Some(o) => o.into(),
            None if opc >= 0x80 => "Vendor specific",
            None => "Unknown command",
        }
    }
}

/// 64-byte submission queue entry
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct NvmeCommand {
    /// opcode in bits 7:0, command id in bits 31:16
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    pub fn new(opcode: u8, nsid: u32) -> Self {
        NvmeCommand {
            cdw0: opcode as u32,
            nsid,
            ..Default::default()
        }
    }

    /// Build a read (opcode 2) or write (opcode 1)
    ///
    /// `lba_count` is one based here, and stored zero based in cdw12.
    pub fn read_write(
        is_read: bool,
        nsid: u32,
        lba: u64,
        lba_count: u16,
        io_flags: u32,
    ) -> Self {
        let opcode = if is_read {
            IoOpcode::Read
        } else {
            IoOpcode::Write
        };
        let mut cmd = NvmeCommand::new(opcode as u8, nsid);
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = io_flags | (lba_count.saturating_sub(1) as u32);
        cmd
    }

    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xff) as u8
    }

    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xffff) | ((cid as u32) << 16);
    }

    /// Starting LBA of a read/write style command
    pub fn lba(&self) -> u64 {
        self.cdw10 as u64 | ((self.cdw11 as u64) << 32)
    }

    /// Number of LBAs of a read/write style command (one based)
    pub fn lba_count(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }

    pub fn is_read(&self) -> bool {
        self.opcode() == IoOpcode::Read as u8
    }

    pub fn dwords(&self) -> [u32; 16] {
        [
            self.cdw0,
            self.nsid,
            self.cdw2,
            self.cdw3,
            self.mptr as u32,
            (self.mptr >> 32) as u32,
            self.prp1 as u32,
            (self.prp1 >> 32) as u32,
            self.prp2 as u32,
            (self.prp2 >> 32) as u32,
            self.cdw10,
            self.cdw11,
            self.cdw12,
            self.cdw13,
            self.cdw14,
            self.cdw15,
        ]
    }
}

/// Status code type and status code of a completion
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
}

impl Status {
    pub const SUCCESS: Status = Status { sct: 0, sc: 0 };
    pub const INVALID_OPCODE: Status = Status { sct: 0, sc: 0x01 };
    pub const INVALID_FIELD: Status = Status { sct: 0, sc: 0x02 };
    pub const INTERNAL_ERROR: Status = Status { sct: 0, sc: 0x06 };
    pub const ABORTED_BY_REQUEST: Status = Status { sct: 0, sc: 0x07 };
    pub const LBA_OUT_OF_RANGE: Status = Status { sct: 0, sc: 0x80 };
    pub const UNRECOVERED_READ: Status = Status { sct: 0x02, sc: 0x81 };

    /// Packed form: `sct << 8 | sc`, 11 bits
    pub fn code(&self) -> u16 {
        ((self.sct as u16 & 0x7) << 8) | self.sc as u16
    }

    pub fn from_code(code: u16) -> Status {
        Status {
            sct: ((code >> 8) & 0x7) as u8,
            sc: (code & 0xff) as u8,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code() != 0
    }

    pub fn description(&self) -> &'static str {
        match (self.sct, self.sc) {
            (0, 0x00) => "SUCCESS",
            (0, 0x01) => "INVALID OPCODE",
            (0, 0x02) => "INVALID FIELD",
            (0, 0x06) => "INTERNAL DEVICE ERROR",
            (0, 0x07) => "ABORTED - BY REQUEST",
            (0, 0x80) => "LBA OUT OF RANGE",
            (2, 0x81) => "UNRECOVERED READ ERROR",
            _ => "VENDOR OR UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:02x}/{:02x})", self.description(), self.sct, self.sc)
    }
}

/// 16-byte completion queue entry
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Completion {
    pub cdw0: u32,
    pub rsvd1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// phase tag in bit 0, status field in bits 15:1
    pub status: u16,
}

impl Completion {
    pub fn new(sqid: u16, cid: u16, status: Status) -> Self {
        let mut cpl = Completion {
            sqid,
            cid,
            ..Default::default()
        };
        cpl.set_status(status);
        cpl
    }

    pub fn status(&self) -> Status {
        Status::from_code((self.status >> 1) & 0x7ff)
    }

    /// Replace the status field, keeping the phase bit
    pub fn set_status(&mut self, status: Status) {
        self.status = (self.status & !(0x7ff << 1)) | (status.code() << 1);
    }

    pub fn is_error(&self) -> bool {
        self.status().is_error()
    }

    pub fn dwords(&self) -> [u32; 4] {
        [
            self.cdw0,
            self.rsvd1,
            self.sqhd as u32 | ((self.sqid as u32) << 16),
            self.cid as u32 | ((self.status as u32) << 16),
        ]
    }
}

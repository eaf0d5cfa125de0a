// Copyright 2024 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use slog::Drain;
use tempfile::NamedTempFile;

pub mod nvme;
pub use nvme::*;

#[derive(
    thiserror::Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize,
)]
pub enum NvmeError {
    #[error("shared region {0} not found")]
    RegionNotFound(String),

    #[error("no space to reserve shared region {name} of {size} bytes")]
    RegionNoSpace { name: String, size: u64 },

    #[error("shared region {name} is {actual} bytes, expected {expected}")]
    RegionSizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("shared region {name}: {reason}")]
    RegionIo { name: String, reason: String },

    #[error("shared region {0} is held by a live primary")]
    RegionBusy(String),

    #[error("driver initialization failed: {0}")]
    InitFailed(String),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("invalid field in command: {0}")]
    InvalidField(String),

    #[error("no command log slot for queue {0}")]
    QueueLimit(u16),

    #[error("transport refused command with status {0}")]
    Transport(Status),

    #[error("data verification failed: {0}")]
    Verify(String),

    #[error("Error: {0}")]
    GenericError(String),
}

impl NvmeError {
    /// The NVMe status a caller would report for this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            NvmeError::InvalidField(_) => Some(Status::INVALID_FIELD),
            NvmeError::Transport(status) => Some(*status),
            NvmeError::Verify(_) => Some(Status::UNRECOVERED_READ),
            _ => None,
        }
    }

    /// True for the errors that abort startup.
    pub fn is_fatal_init(&self) -> bool {
        matches!(
            self,
            NvmeError::RegionNotFound(_)
                | NvmeError::RegionSizeMismatch { .. }
                | NvmeError::RegionIo { .. }
                | NvmeError::InitFailed(_)
        )
    }
}

impl From<std::io::Error> for NvmeError {
    fn from(e: std::io::Error) -> Self {
        NvmeError::GenericError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for NvmeError {
    fn from(e: anyhow::Error) -> Self {
        NvmeError::GenericError(format!("{:?}", e))
    }
}

pub fn build_logger() -> slog::Logger {
    build_logger_with_level(slog::Level::Info)
}

pub fn build_logger_with_level(level: slog::Level) -> slog::Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("nvmeval", std::io::stdout()).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let drain = main_drain.filter_level(level).fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn read_toml_maybe<P, T>(file: P) -> Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(Some(
        toml::from_str(&buf).with_context(|| anyhow!("parse {:?}", file))?,
    ))
}

pub fn read_toml<P, T>(file: P) -> Result<T>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_toml_maybe(file)?
        .ok_or_else(|| anyhow!("open {:?}: file not found", file))
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmpf = NamedTempFile::new_in(dir)?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

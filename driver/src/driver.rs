// Copyright 2024 Oxide Computer Company
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use slog::{error, info, o, warn, Logger};

use crate::cmdlog::{CmdLog, CMD_LOG_QUEUE_COUNT, CMD_LOG_TABLE_SIZE};
use crate::integrity::{ChecksumTable, DataIntegrity, SequenceToken};
use crate::namespace::Namespace;
use crate::qpair::QueuePair;
use crate::shm::{ProcessRole, RegionName, SharedRegion, ShmBudget};
use crate::transport::{NamespaceInfo, Transport};
use crate::NvmeError;

fn default_instance() -> String {
    "nvmeval".to_string()
}

fn default_shm_limit() -> u64 {
    512 * 1024 * 1024
}

/// Driver settings, usually read from a TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    /// Prefix of every shared region name; processes that cooperate on one
    /// device must agree on it
    #[serde(default = "default_instance")]
    pub instance: String,

    #[serde(default)]
    pub role: ProcessRole,

    /// Bytes of shared memory the primary may reserve
    #[serde(default = "default_shm_limit")]
    pub shm_limit: u64,

    /// Verify read data once the checksum table exists
    #[serde(default)]
    pub verify_read: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            instance: default_instance(),
            role: ProcessRole::default(),
            shm_limit: default_shm_limit(),
            verify_read: false,
        }
    }
}

impl DriverConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, NvmeError> {
        Ok(nvmeval_common::read_toml(path)?)
    }
}

/// State every queue pair of this process shares
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cmdlog: CmdLog,
    config: SharedRegion,
    integrity: OnceLock<Arc<DataIntegrity>>,
    pub(crate) log: Logger,
}

impl Shared {
    pub(crate) fn config_word(&self) -> u64 {
        self.config.as_atomic_u64().load(Ordering::Acquire)
    }

    pub(crate) fn verify_read(&self) -> bool {
        self.config_word() & Driver::VERIFY_READ != 0
    }

    pub(crate) fn integrity(&self) -> Option<&DataIntegrity> {
        self.integrity.get().map(|i| i.as_ref())
    }
}

/// Process-wide driver state: shared regions and queue bookkeeping
#[derive(Debug)]
pub struct Driver {
    cfg: DriverConfig,
    primary: bool,
    budget: Arc<ShmBudget>,
    shared: Arc<Shared>,
    log: Logger,
}

fn fatal(log: &Logger, what: &str, e: NvmeError) -> NvmeError {
    error!(log, "cannot set up {}: {}", what, e);
    if e.is_fatal_init() {
        e
    } else {
        NvmeError::InitFailed(format!("{}: {}", what, e))
    }
}

impl Driver {
    /// Config word bit: verify the data of every successful read
    pub const VERIFY_READ: u64 = 1;

    /// Create (primary) or attach to (secondary) the command log and the
    /// global config word
    pub fn init(cfg: DriverConfig, log: &Logger) -> Result<Driver, NvmeError> {
        if cfg.instance.is_empty() || cfg.instance.contains('/') {
            return Err(NvmeError::InitFailed(format!(
                "bad instance name {:?}",
                cfg.instance
            )));
        }
        let prefix = cfg.instance.as_str();
        let primary = match cfg.role {
            ProcessRole::Primary => true,
            ProcessRole::Secondary => false,
            ProcessRole::Auto => {
                !SharedRegion::exists(prefix, RegionName::GlobalConfig)
            }
        };
        let log = log.new(o!(
            "instance" => cfg.instance.clone(),
            "role" => if primary { "primary" } else { "secondary" },
        ));
        let budget = ShmBudget::new(cfg.shm_limit);

        let cmdlog = SharedRegion::reserve_or_attach(
            prefix,
            RegionName::CmdLogTable,
            CMD_LOG_TABLE_SIZE as u64,
            primary,
            &budget,
            &log,
        )
        .and_then(|r| CmdLog::from_region(r, &log))
        .map_err(|e| fatal(&log, "command log", e))?;

        // Created last: its existence tells other processes init is done.
        let config = SharedRegion::reserve_or_attach(
            prefix,
            RegionName::GlobalConfig,
            8,
            primary,
            &budget,
            &log,
        )
        .map_err(|e| fatal(&log, "global config", e))?;

        if primary {
            cmdlog.clear_all();
            cmdlog.init_queue(0)?;
            config.as_atomic_u64().store(0, Ordering::Release);
        }
        info!(log, "driver initialized");

        Ok(Driver {
            cfg,
            primary,
            budget,
            shared: Arc::new(Shared {
                cmdlog,
                config,
                integrity: OnceLock::new(),
                log: log.clone(),
            }),
            log,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn instance(&self) -> &str {
        &self.cfg.instance
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Shared memory the primary may still reserve
    pub fn shm_remaining(&self) -> u64 {
        self.budget.remaining()
    }

    pub fn cmdlog(&self) -> &CmdLog {
        &self.shared.cmdlog
    }

    /// Attach namespace 1: the sequence token and, if possible, the
    /// checksum table
    pub fn namespace(&self, info: NamespaceInfo) -> Result<Namespace, NvmeError> {
        if info.nsid != 1 {
            return Err(NvmeError::InvalidField(format!(
                "only namespace 1 is supported, not {}",
                info.nsid
            )));
        }
        // Each sector carries its LBA and a sequence token, one word each
        let ss = info.sector_size as usize;
        if ss < 16 || ss % 8 != 0 {
            return Err(NvmeError::InvalidField(format!(
                "sector size {} cannot carry data tags",
                info.sector_size
            )));
        }
        let log = self.log.new(o!("nsid" => info.nsid));
        if let Some(integrity) = self.shared.integrity.get() {
            return Ok(Namespace::new(info, integrity.clone(), log));
        }

        let prefix = self.cfg.instance.as_str();
        let token = SharedRegion::reserve_or_attach(
            prefix,
            RegionName::IoToken,
            8,
            self.primary,
            &self.budget,
            &log,
        )
        .map_err(|e| fatal(&log, "sequence token", e))?;
        let token = SequenceToken::from_region(token);
        if self.primary {
            token.reset(1);
        }

        let table = match SharedRegion::reserve_or_attach(
            prefix,
            RegionName::ChecksumTable,
            info.sector_count.saturating_mul(4),
            self.primary,
            &self.budget,
            &log,
        ) {
            Ok(r) => Some(ChecksumTable::from_region(r)),
            Err(e) => {
                warn!(log, "checksum table unavailable: {}", e);
                None
            }
        };

        let integrity = Arc::new(DataIntegrity::new(token, table, &log));
        let integrity = self.shared.integrity.get_or_init(|| integrity).clone();
        if self.primary && self.cfg.verify_read {
            self.config(Self::VERIFY_READ);
        }
        Ok(Namespace::new(info, integrity, log))
    }

    /// Set the global config word, returning its current value
    ///
    /// The word only changes once a checksum table exists.
    pub fn config(&self, word: u64) -> u64 {
        match self.shared.integrity() {
            Some(i) if !i.is_degraded() => {
                self.shared.config.as_atomic_u64().store(word, Ordering::Release);
            }
            _ => {
                info!(self.log, "no checksum table, config word {:#x} ignored", word);
            }
        }
        self.shared.config_word()
    }

    pub fn config_word(&self) -> u64 {
        self.shared.config_word()
    }

    /// Bind a transport queue to a free command log queue
    pub fn create_qpair<T: Transport>(
        &self,
        transport: T,
    ) -> Result<QueuePair<T>, NvmeError> {
        let qid = self
            .shared
            .cmdlog
            .free_qid()
            .ok_or(NvmeError::QueueLimit(CMD_LOG_QUEUE_COUNT as u16))?;
        self.shared.cmdlog.init_queue(qid)?;
        Ok(QueuePair::new(qid, transport, self.shared.clone()))
    }
}

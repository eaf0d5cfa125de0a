// Copyright 2024 Oxide Computer Company
//! Rolling per-queue trace of submitted commands and their completions.
//!
//! The whole log is one shared region so that another process can inspect
//! it while I/O is running.  Each queue owns a ring of `CMD_LOG_DEPTH`
//! 128-byte entries followed by a 128-byte trailer whose first word is the
//! tail index.  A tail of `CMD_LOG_DEPTH` marks a queue that is not in use.
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use slog::{debug, info, Logger};
use static_assertions::const_assert_eq;

use crate::shm::SharedRegion;
use crate::{opcode_name, Completion, NvmeCommand, NvmeError};

/// Entries per queue; one entry's worth of space holds the tail.
pub const CMD_LOG_DEPTH: usize = 2047;
pub const CMD_LOG_QUEUE_COUNT: usize = 16;
pub const CMD_LOG_ENTRY_SIZE: usize = 128;
/// Size of the whole shared command log region
pub const CMD_LOG_TABLE_SIZE: usize =
    CMD_LOG_QUEUE_COUNT * (CMD_LOG_DEPTH + 1) * CMD_LOG_ENTRY_SIZE;

/// Outstanding counts reported for a queue stop here
pub const OUTSTANDING_CAP: usize = 100;

const FLAG_COMPLETED: u32 = 1;

#[derive(Debug, Default, Copy, Clone)]
#[repr(C)]
struct CmdLogEntry {
    cmd: NvmeCommand,
    submit_sec: u64,
    submit_usec: u64,
    cpl: Completion,
    latency_us: u32,
    flags: u32,
    buffer_token: u64,
    /// Zero for a slot that never held a command
    correlation: u64,
    context: u64,
}

#[repr(C)]
struct CmdLogQueue {
    entries: [CmdLogEntry; CMD_LOG_DEPTH],
    tail: u32,
    _trailer: [u32; 31],
}

const_assert_eq!(std::mem::size_of::<CmdLogEntry>(), CMD_LOG_ENTRY_SIZE);
const_assert_eq!(
    std::mem::size_of::<CmdLogQueue>(),
    (CMD_LOG_DEPTH + 1) * CMD_LOG_ENTRY_SIZE
);

impl CmdLogEntry {
    fn is_used(&self) -> bool {
        self.submit_sec != 0 || self.submit_usec != 0
    }

    fn is_outstanding(&self) -> bool {
        self.correlation != 0 && self.flags & FLAG_COMPLETED == 0
    }

    fn submitted(&self) -> Duration {
        Duration::from_secs(self.submit_sec)
            + Duration::from_micros(self.submit_usec)
    }
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Where a submitted command was logged
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmdLogRef {
    pub qid: u16,
    pub index: u32,
    pub correlation: u64,
}

/// Completion half of a logged command
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub completion: Completion,
    pub completed: Duration,
    pub latency_us: u32,
}

/// One logged command as read back from the table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CmdLogRecord {
    pub qid: u16,
    pub index: u32,
    pub command: NvmeCommand,
    /// Wall clock time of submission, since the epoch
    pub submitted: Duration,
    pub buffer_token: u64,
    pub context: u64,
    pub completion: Option<CompletionRecord>,
}

impl fmt::Display for CmdLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = opcode_name(self.command.opcode(), self.qid == 0);
        write!(
            f,
            "{}.{:06}: [cmd: {}] ",
            self.submitted.as_secs(),
            self.submitted.subsec_micros(),
            name
        )?;
        for row in self.command.dwords().chunks(4) {
            write!(
                f,
                "\n0x{:08x}, 0x{:08x}, 0x{:08x}, 0x{:08x}",
                row[0], row[1], row[2], row[3]
            )?;
        }
        writeln!(f)?;

        match &self.completion {
            Some(c) => {
                let d = c.completion.dwords();
                writeln!(
                    f,
                    "{}.{:06}: [cpl: {}] ",
                    c.completed.as_secs(),
                    c.completed.subsec_micros(),
                    c.completion.status().description()
                )?;
                writeln!(
                    f,
                    "0x{:08x}, 0x{:08x}, 0x{:08x}, 0x{:08x}",
                    d[0], d[1], d[2], d[3]
                )
            }
            None => writeln!(f, "not completed ..."),
        }
    }
}

/// A queue in use, as shown by the queue listing
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub qid: u16,
    /// Uncompleted entries, capped at `OUTSTANDING_CAP`
    pub outstanding: usize,
}

impl QueueSummary {
    /// Coarse depth indicator
    pub fn bucket(&self) -> usize {
        self.outstanding / 4
    }

    /// Packed `qid + 1` in the low half, bucket in the high half
    pub fn encoded(&self) -> u32 {
        (self.qid as u32 + 1) + ((self.bucket() as u32) << 16)
    }
}

/// The shared command log of all queues
#[derive(Debug)]
pub struct CmdLog {
    region: SharedRegion,
    next_correlation: AtomicU64,
    log: Logger,
}

impl CmdLog {
    pub fn from_region(
        region: SharedRegion,
        log: &Logger,
    ) -> Result<Self, NvmeError> {
        if region.len() < CMD_LOG_TABLE_SIZE {
            return Err(NvmeError::RegionSizeMismatch {
                name: region.os_name().to_string(),
                expected: CMD_LOG_TABLE_SIZE as u64,
                actual: region.len() as u64,
            });
        }
        Ok(CmdLog {
            region,
            next_correlation: AtomicU64::new(1),
            log: log.clone(),
        })
    }

    fn queue(&self, qid: u16) -> Result<*mut CmdLogQueue, NvmeError> {
        if qid as usize >= CMD_LOG_QUEUE_COUNT {
            return Err(NvmeError::QueueLimit(qid));
        }
        let base = self.region.as_mut_ptr() as *mut CmdLogQueue;
        // SAFETY: the region holds CMD_LOG_QUEUE_COUNT tables.
        Ok(unsafe { base.add(qid as usize) })
    }

    fn tail_word(&self, q: *mut CmdLogQueue) -> &AtomicU32 {
        // SAFETY: q points into our mapping, which outlives &self.
        unsafe { AtomicU32::from_ptr(ptr::addr_of_mut!((*q).tail)) }
    }

    fn entry(q: *mut CmdLogQueue, index: usize) -> *mut CmdLogEntry {
        debug_assert!(index < CMD_LOG_DEPTH);
        // SAFETY: index is within the entry array of a valid queue table.
        unsafe {
            ptr::addr_of_mut!((*q).entries)
                .cast::<CmdLogEntry>()
                .add(index)
        }
    }

    fn read(q: *mut CmdLogQueue, index: usize) -> CmdLogEntry {
        // SAFETY: see entry(); other processes may be writing, so the
        // copy is volatile and may be torn.
        unsafe { ptr::read_volatile(Self::entry(q, index)) }
    }

    fn write(q: *mut CmdLogQueue, index: usize, e: CmdLogEntry) {
        // SAFETY: see entry(); only the owning queue pair writes a queue.
        unsafe { ptr::write_volatile(Self::entry(q, index), e) }
    }

    /// Mark a queue as in use with an empty ring
    pub fn init_queue(&self, qid: u16) -> Result<(), NvmeError> {
        let q = self.queue(qid)?;
        // SAFETY: zeroing exactly the entries of this queue table.
        unsafe {
            ptr::write_bytes(
                ptr::addr_of_mut!((*q).entries).cast::<CmdLogEntry>(),
                0,
                CMD_LOG_DEPTH,
            )
        };
        self.tail_word(q).store(0, Ordering::Release);
        debug!(self.log, "command log queue {} initialized", qid);
        Ok(())
    }

    /// Mark a queue as not in use
    pub fn clear_queue(&self, qid: u16) -> Result<(), NvmeError> {
        let q = self.queue(qid)?;
        self.tail_word(q)
            .store(CMD_LOG_DEPTH as u32, Ordering::Release);
        Ok(())
    }

    pub fn clear_all(&self) {
        for qid in 0..CMD_LOG_QUEUE_COUNT as u16 {
            let _ = self.clear_queue(qid);
        }
    }

    pub fn tail(&self, qid: u16) -> Option<u32> {
        let q = self.queue(qid).ok()?;
        Some(self.tail_word(q).load(Ordering::Acquire))
    }

    pub fn is_present(&self, qid: u16) -> bool {
        self.tail(qid).is_some_and(|t| (t as usize) < CMD_LOG_DEPTH)
    }

    /// Lowest queue id above the admin queue that nobody is using
    pub fn free_qid(&self) -> Option<u16> {
        (1..CMD_LOG_QUEUE_COUNT as u16).find(|qid| !self.is_present(*qid))
    }

    /// Entries logged but not yet completed
    pub fn outstanding(&self, qid: u16) -> usize {
        let Ok(q) = self.queue(qid) else {
            return 0;
        };
        (0..CMD_LOG_DEPTH)
            .filter(|i| Self::read(q, *i).is_outstanding())
            .count()
    }

    /// Record a command the transport has just accepted
    ///
    /// The slot under the tail is reused even if it still holds an
    /// uncompleted command; that command's completion will be dropped.
    pub fn on_submit(
        &self,
        qid: u16,
        cmd: &NvmeCommand,
        buffer_token: u64,
        context: u64,
    ) -> Result<CmdLogRef, NvmeError> {
        let q = self.queue(qid)?;
        let tail_word = self.tail_word(q);
        let tail = tail_word.load(Ordering::Acquire) as usize;
        if tail >= CMD_LOG_DEPTH {
            return Err(NvmeError::InvalidField(format!(
                "command log queue {} is not in use",
                qid
            )));
        }

        let old = Self::read(q, tail);
        if old.is_outstanding() {
            info!(
                self.log,
                "uncompleted command overwritten in command log";
                "qid" => qid,
                "index" => tail,
                "opcode" => opcode_name(old.cmd.opcode(), qid == 0),
                "cid" => old.cmd.cid(),
            );
        }

        let t = now();
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        Self::write(
            q,
            tail,
            CmdLogEntry {
                cmd: *cmd,
                submit_sec: t.as_secs(),
                submit_usec: t.subsec_micros() as u64,
                cpl: Completion::default(),
                latency_us: 0,
                flags: 0,
                buffer_token,
                correlation,
                context,
            },
        );
        tail_word.store(((tail + 1) % CMD_LOG_DEPTH) as u32, Ordering::Release);

        Ok(CmdLogRef {
            qid,
            index: tail as u32,
            correlation,
        })
    }

    /// Record the completion of a logged command
    ///
    /// Returns false, and records nothing, if the slot has been reused.
    pub fn on_complete(&self, r: &CmdLogRef, cpl: &Completion) -> bool {
        let Ok(q) = self.queue(r.qid) else {
            return false;
        };
        if r.index as usize >= CMD_LOG_DEPTH {
            return false;
        }
        let mut e = Self::read(q, r.index as usize);
        if e.correlation != r.correlation {
            info!(
                self.log,
                "skip overlapped command log entry";
                "qid" => r.qid,
                "index" => r.index,
            );
            return false;
        }

        let latency = now().saturating_sub(e.submitted());
        e.cpl = *cpl;
        e.latency_us = u32::try_from(latency.as_micros()).unwrap_or(u32::MAX);
        e.flags |= FLAG_COMPLETED;
        Self::write(q, r.index as usize, e);
        true
    }

    /// Walk a queue's ring from the most recent entry backwards
    ///
    /// `max` of zero, or more than the ring holds, walks the whole ring.
    /// A torn down queue yields nothing.
    pub fn dump(&self, qid: u16, max: usize) -> Result<CmdLogDump<'_>, NvmeError> {
        let q = self.queue(qid)?;
        let tail = self.tail_word(q).load(Ordering::Acquire) as usize;
        let remaining = if tail >= CMD_LOG_DEPTH {
            0
        } else if max == 0 || max > CMD_LOG_DEPTH {
            CMD_LOG_DEPTH
        } else {
            max
        };
        Ok(CmdLogDump {
            _log: self,
            q,
            qid,
            index: tail.min(CMD_LOG_DEPTH),
            remaining,
        })
    }

    /// Every queue in use, with its outstanding count
    pub fn list_queues(&self) -> Vec<QueueSummary> {
        (0..CMD_LOG_QUEUE_COUNT as u16)
            .filter(|qid| self.is_present(*qid))
            .map(|qid| QueueSummary {
                qid,
                outstanding: self.outstanding(qid).min(OUTSTANDING_CAP),
            })
            .collect()
    }
}

/// Iterator returned by [`CmdLog::dump`]
pub struct CmdLogDump<'a> {
    _log: &'a CmdLog,
    q: *mut CmdLogQueue,
    qid: u16,
    index: usize,
    remaining: usize,
}

impl Iterator for CmdLogDump<'_> {
    type Item = CmdLogRecord;

    fn next(&mut self) -> Option<CmdLogRecord> {
        while self.remaining > 0 {
            self.remaining -= 1;
            self.index = if self.index == 0 {
                CMD_LOG_DEPTH - 1
            } else {
                self.index - 1
            };

            let e = CmdLog::read(self.q, self.index);
            if !e.is_used() {
                continue;
            }
            let completion = (e.flags & FLAG_COMPLETED != 0).then(|| {
                CompletionRecord {
                    completion: e.cpl,
                    completed: e.submitted()
                        + Duration::from_micros(e.latency_us as u64),
                    latency_us: e.latency_us,
                }
            });
            return Some(CmdLogRecord {
                qid: self.qid,
                index: self.index as u32,
                command: e.cmd,
                submitted: e.submitted(),
                buffer_token: e.buffer_token,
                context: e.context,
                completion,
            });
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shm::{RegionName, ShmBudget};
    use crate::test::{csl, test_prefix};
    use crate::Status;

    fn cmdlog() -> CmdLog {
        let log = csl();
        let budget = ShmBudget::new(CMD_LOG_TABLE_SIZE as u64);
        let region = SharedRegion::reserve(
            &test_prefix(),
            RegionName::CmdLogTable,
            CMD_LOG_TABLE_SIZE as u64,
            &budget,
            &log,
        )
        .unwrap();
        let cmdlog = CmdLog::from_region(region, &log).unwrap();
        cmdlog.clear_all();
        cmdlog
    }

    fn read_cmd(lba: u64) -> NvmeCommand {
        NvmeCommand::read_write(true, 1, lba, 8, 0)
    }

    #[test]
    fn queue_presence() {
        let cl = cmdlog();
        assert!(cl.list_queues().is_empty());
        assert_eq!(cl.free_qid(), Some(1));

        cl.init_queue(0).unwrap();
        cl.init_queue(1).unwrap();
        assert!(cl.is_present(1));
        assert_eq!(cl.tail(1), Some(0));
        assert_eq!(cl.free_qid(), Some(2));

        cl.clear_queue(1).unwrap();
        assert!(!cl.is_present(1));
        assert_eq!(cl.tail(1), Some(CMD_LOG_DEPTH as u32));
        assert_eq!(cl.tail(16), None);
        assert_eq!(cl.init_queue(16), Err(NvmeError::QueueLimit(16)));
    }

    #[test]
    fn submit_to_absent_queue_fails() {
        let cl = cmdlog();
        assert!(matches!(
            cl.on_submit(3, &read_cmd(0), 0, 0),
            Err(NvmeError::InvalidField(_))
        ));
    }

    #[test]
    fn submit_and_complete() {
        let cl = cmdlog();
        cl.init_queue(2).unwrap();
        let r = cl.on_submit(2, &read_cmd(100), 7, 42).unwrap();
        assert_eq!(r.index, 0);
        assert_eq!(cl.tail(2), Some(1));
        assert_eq!(cl.outstanding(2), 1);

        let rec = cl.dump(2, 1).unwrap().next().unwrap();
        assert_eq!(rec.command.lba(), 100);
        assert_eq!(rec.buffer_token, 7);
        assert_eq!(rec.context, 42);
        assert!(rec.completion.is_none());
        assert!(rec.to_string().ends_with("not completed ...\n"));

        let cpl = Completion::new(2, 0, Status::SUCCESS);
        assert!(cl.on_complete(&r, &cpl));
        assert_eq!(cl.outstanding(2), 0);

        let rec = cl.dump(2, 1).unwrap().next().unwrap();
        let c = rec.completion.unwrap();
        assert_eq!(c.completion, cpl);
        assert!(c.completed >= rec.submitted);
    }

    #[test]
    fn ring_wrap_drops_late_completion() {
        let cl = cmdlog();
        cl.init_queue(1).unwrap();

        let first = cl.on_submit(1, &read_cmd(0), 0, 0).unwrap();
        let mut last = first;
        for i in 1..=CMD_LOG_DEPTH as u64 {
            last = cl.on_submit(1, &read_cmd(i), 0, 0).unwrap();
        }
        // The last submission wrapped around onto the first slot
        assert_eq!(last.index, 0);
        assert_eq!(cl.tail(1), Some(1));

        let cpl = Completion::new(1, 0, Status::SUCCESS);
        assert!(!cl.on_complete(&first, &cpl));
        assert!(cl.dump(1, 1).unwrap().next().unwrap().completion.is_none());

        assert!(cl.on_complete(&last, &cpl));
        let rec = cl.dump(1, 1).unwrap().next().unwrap();
        assert_eq!(rec.command.lba(), CMD_LOG_DEPTH as u64);
        assert!(rec.completion.is_some());
    }

    #[test]
    fn dump_is_most_recent_first() {
        let cl = cmdlog();
        cl.init_queue(4).unwrap();
        for lba in 0..5 {
            cl.on_submit(4, &read_cmd(lba), 0, 0).unwrap();
        }

        let lbas: Vec<u64> =
            cl.dump(4, 3).unwrap().map(|r| r.command.lba()).collect();
        assert_eq!(lbas, vec![4, 3, 2]);

        // Unused slots are skipped when walking the whole ring
        let all: Vec<u32> = cl.dump(4, 0).unwrap().map(|r| r.index).collect();
        assert_eq!(all, vec![4, 3, 2, 1, 0]);
        assert_eq!(cl.dump(4, CMD_LOG_DEPTH + 10).unwrap().count(), 5);
    }

    #[test]
    fn torn_down_queue_dumps_nothing() {
        let cl = cmdlog();
        cl.init_queue(3).unwrap();
        cl.on_submit(3, &read_cmd(9), 0, 0).unwrap();
        assert_eq!(cl.dump(3, 0).unwrap().count(), 1);

        cl.clear_queue(3).unwrap();
        assert!(!cl.is_present(3));
        assert_eq!(cl.dump(3, 0).unwrap().count(), 0);
        assert_eq!(cl.dump(3, 1).unwrap().next(), None);
    }

    #[test]
    fn queue_listing() {
        let cl = cmdlog();
        cl.init_queue(0).unwrap();
        cl.init_queue(5).unwrap();
        let mut refs = Vec::new();
        for lba in 0..150 {
            refs.push(cl.on_submit(5, &read_cmd(lba), 0, 0).unwrap());
        }
        let cpl = Completion::new(5, 0, Status::SUCCESS);
        for r in &refs[..141] {
            cl.on_complete(r, &cpl);
        }

        let queues = cl.list_queues();
        assert_eq!(
            queues,
            vec![
                QueueSummary {
                    qid: 0,
                    outstanding: 0
                },
                QueueSummary {
                    qid: 5,
                    outstanding: 9
                },
            ]
        );
        assert_eq!(queues[1].bucket(), 2);
        assert_eq!(queues[1].encoded(), 6 + (2 << 16));

        for r in &refs[141..] {
            cl.on_complete(r, &cpl);
        }
        for lba in 0..120 {
            cl.on_submit(5, &read_cmd(lba), 0, 0).unwrap();
        }
        assert_eq!(cl.list_queues()[1].outstanding, OUTSTANDING_CAP);
    }

    #[test]
    fn record_text() {
        let cl = cmdlog();
        cl.init_queue(0).unwrap();
        cl.init_queue(1).unwrap();

        let admin = NvmeCommand::new(crate::AdminOpcode::Identify as u8, 0);
        cl.on_submit(0, &admin, 0, 0).unwrap();
        let text = cl.dump(0, 1).unwrap().next().unwrap().to_string();
        assert!(text.contains("[cmd: Identify]"));

        let r = cl.on_submit(1, &read_cmd(0x10), 0, 0).unwrap();
        let cpl = Completion::new(1, 0, Status::UNRECOVERED_READ);
        cl.on_complete(&r, &cpl);
        let text = cl.dump(1, 1).unwrap().next().unwrap().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].ends_with(": [cmd: Read] "));
        assert_eq!(lines[1], "0x00000002, 0x00000001, 0x00000000, 0x00000000");
        assert_eq!(lines[3], "0x00000000, 0x00000000, 0x00000010, 0x00000000");
        assert_eq!(lines[4], "0x00000007, 0x00000000, 0x00000000, 0x00000000");
        assert!(lines[5].ends_with(": [cpl: UNRECOVERED READ ERROR] "));
        assert_eq!(
            lines[6],
            format!("0x00000000, 0x00000000, 0x00010000, 0x{:08x}", 0x281 << 17)
        );
    }
}

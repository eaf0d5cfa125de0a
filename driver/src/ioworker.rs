// Copyright 2024 Oxide Computer Company
//! Rate controlled workload generator.
//!
//! A run keeps `qdepth` commands in flight on one queue pair.  Every
//! completion is accounted for and, unless the run has finished, replaced
//! by one new command from inside the completion handler.  The run ends
//! when the I/O count or the time budget is used up, on the first error,
//! or on an external stop request, and then drains what is outstanding.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};

use crate::cmdlog::CMD_LOG_DEPTH;
use crate::namespace::Namespace;
use crate::qpair::{IoCompletion, QueuePair};
use crate::transport::{DmaBuffer, Transport};
use crate::NvmeError;

/// Buckets of the latency histogram, one per microsecond
pub const LATENCY_BUCKETS: usize = 1_000_000;

const MAX_SECONDS: u32 = 24 * 3600;

/// Workload description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoWorkerArgs {
    /// First LBA of a sequential run
    pub lba_start: u64,
    /// Sectors per command
    pub lba_size: u16,
    /// Start LBA alignment; 0 means the same as `lba_size`
    pub lba_align: u16,
    pub lba_random: bool,
    pub region_start: u64,
    /// End of the region, clamped to the namespace size
    pub region_end: u64,
    pub read_percentage: u8,
    /// Commands per second, 0 for as fast as possible
    pub iops: u32,
    /// Commands to send, 0 for no limit
    pub io_count: u64,
    /// Time budget, 0 for 24 hours
    pub seconds: u32,
    pub qdepth: u32,
    /// Seed of the LBA and read/write choices
    pub seed: u64,
    pub output_io_per_second: bool,
    pub output_io_per_latency: bool,
    /// How long past `seconds` to wait for outstanding commands
    pub drain_grace_ms: u64,
}

impl Default for IoWorkerArgs {
    fn default() -> Self {
        IoWorkerArgs {
            lba_start: 0,
            lba_size: 8,
            lba_align: 0,
            lba_random: true,
            region_start: 0,
            region_end: u64::MAX,
            read_percentage: 100,
            iops: 0,
            io_count: 0,
            seconds: 0,
            qdepth: 64,
            seed: 1,
            output_io_per_second: false,
            output_io_per_latency: false,
            drain_grace_ms: 30_000,
        }
    }
}

/// How a run ended
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEnd {
    Completed,
    /// Asked to stop from outside
    Stopped,
    /// Outstanding commands did not drain in time and were abandoned
    TimedOut,
}

/// Results of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoWorkerRets {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub latency_max_us: u32,
    pub mseconds: u64,
    /// Status code (`sct << 8 | sc`) of the first failed command, or 0
    pub error: u16,
    pub end: RunEnd,
    pub io_count_per_second: Option<Vec<u64>>,
    pub io_count_per_latency: Option<Vec<u32>>,
}

impl IoWorkerRets {
    pub fn io_count(&self) -> u64 {
        self.io_count_read + self.io_count_write
    }

    pub fn iops(&self) -> f64 {
        if self.mseconds == 0 {
            0.0
        } else {
            self.io_count() as f64 * 1000.0 / self.mseconds as f64
        }
    }
}

fn align_up(n: u64, a: u64) -> u64 {
    match n % a {
        0 => n,
        r => n + (a - r),
    }
}

fn align_down(n: u64, a: u64) -> u64 {
    n - n % a
}

/// A workload with its limits resolved against a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Workload {
    pub lba_start: u64,
    pub lba_size: u16,
    pub lba_align: u64,
    /// Distance between consecutive sequential commands
    pub step: u64,
    pub lba_random: bool,
    pub region_start: u64,
    /// Last LBA a command may start at
    pub region_end: u64,
    pub read_percentage: u8,
    pub iops: u32,
    pub io_count: u64,
    pub seconds: u32,
    pub qdepth: u32,
    pub drain_grace: Duration,
}

impl IoWorkerArgs {
    /// Check the arguments and resolve them for a namespace of
    /// `sector_count` sectors of `sector_size` bytes
    pub(crate) fn normalize(
        &self,
        sector_count: u64,
        sector_size: u32,
        max_transfer_size: u32,
        outstanding: usize,
    ) -> Result<Workload, NvmeError> {
        let bad = |what: &str| Err(NvmeError::InvalidWorkload(what.to_string()));

        if self.read_percentage > 100 {
            return bad("read percentage over 100");
        }
        if self.io_count == 0 && self.seconds == 0 {
            return bad("neither io count nor seconds is set");
        }
        if self.seconds >= MAX_SECONDS {
            return bad("runs are limited to 24 hours");
        }
        if self.lba_size == 0 {
            return bad("zero lba size");
        }
        if self.qdepth == 0 {
            return bad("zero queue depth");
        }
        if self.region_start >= self.region_end {
            return bad("empty region");
        }

        let xfer = self.lba_size as u64 * sector_size as u64;
        if xfer > max_transfer_size as u64 {
            return Err(NvmeError::InvalidField(format!(
                "io size {} is larger than max transfer size {}",
                xfer, max_transfer_size
            )));
        }

        let lba_size = self.lba_size as u64;
        let lba_align = match self.lba_align {
            0 => lba_size,
            a => a as u64,
        };
        let region_end = self.region_end.min(sector_count);
        if region_end < lba_size {
            return bad("region is smaller than one command");
        }
        let region_start = align_up(self.region_start, lba_align);
        let region_end = align_down(region_end - lba_size, lba_align);
        if region_start > region_end {
            return bad("no aligned command fits in the region");
        }

        let free = (CMD_LOG_DEPTH / 2).saturating_sub(outstanding);
        if free == 0 {
            return bad("queue has no room for more commands");
        }
        let io_count = match self.io_count {
            0 => u64::MAX,
            n => n,
        };
        let qdepth = (self.qdepth as u64).min(free as u64).min(io_count) as u32;

        Ok(Workload {
            lba_start: self.lba_start.max(region_start),
            lba_size: self.lba_size,
            lba_align,
            step: align_up(lba_size, lba_align),
            lba_random: self.lba_random,
            region_start,
            region_end,
            read_percentage: self.read_percentage,
            iops: self.iops,
            io_count,
            seconds: if self.seconds == 0 {
                MAX_SECONDS
            } else {
                self.seconds
            },
            qdepth,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
        })
    }
}

struct Run<'a> {
    w: Workload,
    ns: &'a Namespace,
    rng: ChaCha8Rng,
    stop: Option<Arc<AtomicBool>>,

    start: Instant,
    deadline: Instant,
    io_delay: Duration,
    io_due: Instant,
    next_sec: Instant,
    count_till_last_sec: u64,

    cursor: u64,
    sent: u64,
    completed: u64,
    finished: bool,
    stopped: bool,

    rets: IoWorkerRets,
    per_second: Option<Vec<u64>>,
    per_latency: Option<Vec<u32>>,
    log: Logger,
}

impl<'a> Run<'a> {
    fn next_lba(&mut self) -> u64 {
        let lba = if self.w.lba_random {
            if self.w.region_end > self.w.region_start {
                self.rng.gen_range(self.w.region_start..self.w.region_end)
            } else {
                self.w.region_start
            }
        } else {
            if self.cursor > self.w.region_end {
                self.cursor = self.w.region_start;
            }
            self.cursor
        };
        align_down(lba, self.w.lba_align)
    }

    fn send_one<T: Transport>(
        &mut self,
        qpair: &mut QueuePair<T>,
        buf: DmaBuffer,
        slot: u64,
    ) -> bool {
        let is_read = self.rng.gen_range(0..100u8) < self.w.read_percentage;
        let lba = self.next_lba();
        debug!(self.log, "one io"; "slot" => slot, "lba" => lba, "read" => is_read);

        match self
            .ns
            .read_write(qpair, is_read, buf, lba, self.w.lba_size, 0, slot)
        {
            Ok(()) => {
                self.cursor = lba + self.w.step;
                self.sent += 1;
                true
            }
            Err(e) => {
                warn!(self.log, "ioworker submission failed: {}", e);
                self.finished = true;
                false
            }
        }
    }

    fn is_finish(&mut self, now: Instant) -> bool {
        if self.sent == self.w.io_count {
            debug!(self.log, "ioworker finish, sent {} io", self.sent);
            return true;
        }
        if now > self.deadline {
            debug!(self.log, "ioworker finish, time is up");
            return true;
        }
        if self.stop.as_ref().is_some_and(|s| s.load(Ordering::Relaxed)) {
            info!(self.log, "ioworker stop requested");
            self.stopped = true;
            return true;
        }
        false
    }

    fn throttle(&mut self, now: Instant) {
        if self.io_due > now {
            std::thread::sleep(self.io_due - now);
        }
        self.io_due += self.io_delay;
    }

    fn on_complete<T: Transport>(
        &mut self,
        qpair: &mut QueuePair<T>,
        c: IoCompletion,
    ) {
        self.completed += 1;
        let now = Instant::now();

        let latency_us =
            u32::try_from(c.latency.as_micros()).unwrap_or(u32::MAX);
        self.rets.latency_max_us = self.rets.latency_max_us.max(latency_us);
        if c.cmd.is_read() {
            self.rets.io_count_read += 1;
        } else {
            self.rets.io_count_write += 1;
        }
        if let Some(h) = &mut self.per_latency {
            h[(latency_us as usize).min(LATENCY_BUCKETS - 1)] += 1;
        }

        if !self.io_delay.is_zero() {
            self.throttle(now);
        }

        if c.is_error() {
            debug!(self.log, "ioworker error in completion: {}", c.status());
            self.finished = true;
            if self.rets.error == 0 {
                self.rets.error = c.status().code();
            }
        }

        if let Some(h) = &mut self.per_second {
            let current = self.rets.io_count();
            while now > self.next_sec {
                h.push(current - self.count_till_last_sec);
                self.count_till_last_sec = current;
                self.next_sec += Duration::from_secs(1);
            }
        }

        if !self.finished {
            self.finished = self.is_finish(now);
        }
        if !self.finished {
            let (count, ss) = (self.w.lba_size as usize, self.ns.sector_size());
            let buf = c.buf.unwrap_or_else(|| DmaBuffer::sectors(count, ss));
            self.send_one(qpair, buf, c.ctx);
        }
    }
}

/// Handle for running one workload
#[derive(Debug, Clone, Default)]
pub struct IoWorker {
    args: IoWorkerArgs,
    stop: Option<Arc<AtomicBool>>,
}

impl IoWorker {
    pub fn new(args: IoWorkerArgs) -> Self {
        IoWorker { args, stop: None }
    }

    /// Finish early once `flag` becomes true
    pub fn with_stop(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn args(&self) -> &IoWorkerArgs {
        &self.args
    }

    /// Run the workload to the end on `qpair`
    ///
    /// Invalid arguments are refused before anything is sent.
    pub fn run<T: Transport>(
        &self,
        ns: &Namespace,
        qpair: &mut QueuePair<T>,
    ) -> Result<IoWorkerRets, NvmeError> {
        let info = ns.info();
        let w = self.args.normalize(
            info.sector_count,
            info.sector_size,
            info.max_transfer_size,
            qpair.outstanding(),
        )?;
        let log = ns.log().new(o!("qid" => qpair.qid()));
        info!(log, "ioworker start"; "workload" => ?w);

        let start = Instant::now();
        let io_delay = match w.iops {
            0 => Duration::ZERO,
            iops => Duration::from_micros(1_000_000 / iops as u64),
        };
        let mut run = Run {
            ns,
            rng: ChaCha8Rng::seed_from_u64(self.args.seed),
            stop: self.stop.clone(),
            start,
            deadline: start + Duration::from_secs(w.seconds as u64),
            io_delay,
            io_due: start + io_delay,
            next_sec: start + Duration::from_secs(1),
            count_till_last_sec: 0,
            cursor: w.lba_start,
            sent: 0,
            completed: 0,
            finished: false,
            stopped: false,
            rets: IoWorkerRets {
                io_count_read: 0,
                io_count_write: 0,
                latency_max_us: 0,
                mseconds: 0,
                error: 0,
                end: RunEnd::Completed,
                io_count_per_second: None,
                io_count_per_latency: None,
            },
            per_second: self.args.output_io_per_second.then(Vec::new),
            per_latency: self
                .args
                .output_io_per_latency
                .then(|| vec![0; LATENCY_BUCKETS]),
            log,
            w,
        };

        let ss = ns.sector_size();
        for slot in 0..run.w.qdepth as u64 {
            let buf = DmaBuffer::sectors(run.w.lba_size as usize, ss);
            if !run.send_one(qpair, buf, slot) {
                break;
            }
        }

        let limit = Duration::from_secs(run.w.seconds as u64) + run.w.drain_grace;
        while run.sent != run.completed || !run.finished {
            if run.start.elapsed() > limit {
                info!(
                    run.log,
                    "ioworker timeout, io sent {}, io cplt {}, finish {}",
                    run.sent,
                    run.completed,
                    run.finished
                );
                qpair.abandon_pending();
                run.rets.end = RunEnd::TimedOut;
                break;
            }
            if qpair.process_completions(0, |qp, c| run.on_complete(qp, c)) == 0
            {
                std::thread::yield_now();
            }
        }

        let elapsed = run.start.elapsed();
        run.rets.mseconds = (elapsed.as_micros() as u64 + 500) / 1000;
        if run.stopped && run.rets.end == RunEnd::Completed {
            run.rets.end = RunEnd::Stopped;
        }
        run.rets.io_count_per_second = run.per_second.take();
        run.rets.io_count_per_latency = run.per_latency.take();
        info!(
            run.log,
            "ioworker done";
            "read" => run.rets.io_count_read,
            "write" => run.rets.io_count_write,
            "ms" => run.rets.mseconds,
            "error" => run.rets.error,
        );
        Ok(run.rets)
    }
}

/// Run `args` to completion on `qpair`
pub fn ioworker_entry<T: Transport>(
    ns: &Namespace,
    qpair: &mut QueuePair<T>,
    args: &IoWorkerArgs,
) -> Result<IoWorkerRets, NvmeError> {
    IoWorker::new(args.clone()).run(ns, qpair)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::integrity::CRC_UNWRITTEN;
    use crate::test::TestDriver;
    use crate::{Driver, Status};

    fn args(io_count: u64) -> IoWorkerArgs {
        IoWorkerArgs {
            io_count,
            ..Default::default()
        }
    }

    #[test]
    fn normalize_region() {
        let a = IoWorkerArgs {
            lba_start: 3,
            lba_size: 8,
            region_start: 5,
            region_end: 1000,
            qdepth: 16,
            io_count: 10,
            ..Default::default()
        };
        let w = a.normalize(100, 512, 128 * 1024, 0).unwrap();
        assert_eq!(w.region_start, 8);
        assert_eq!(w.region_end, 88);
        assert_eq!(w.lba_start, 8);
        assert_eq!(w.lba_align, 8);
        assert_eq!(w.step, 8);
        assert_eq!(w.qdepth, 10);
        assert_eq!(w.seconds, MAX_SECONDS);
        assert_eq!(w.drain_grace, Duration::from_secs(30));

        let a = IoWorkerArgs {
            lba_size: 3,
            lba_align: 2,
            qdepth: 5000,
            seconds: 5,
            ..Default::default()
        };
        let w = a.normalize(100, 512, 128 * 1024, 1000).unwrap();
        assert_eq!(w.step, 4);
        assert_eq!(w.region_end, 96);
        assert_eq!(w.io_count, u64::MAX);
        assert_eq!(w.qdepth as usize, CMD_LOG_DEPTH / 2 - 1000);
    }

    #[test]
    fn bad_workloads_are_refused() {
        let cases = [
            IoWorkerArgs {
                read_percentage: 101,
                ..args(1)
            },
            IoWorkerArgs {
                seconds: 0,
                ..args(0)
            },
            IoWorkerArgs {
                seconds: 24 * 3600,
                ..args(1)
            },
            IoWorkerArgs {
                lba_size: 0,
                ..args(1)
            },
            IoWorkerArgs {
                qdepth: 0,
                ..args(1)
            },
            IoWorkerArgs {
                region_start: 10,
                region_end: 10,
                ..args(1)
            },
            IoWorkerArgs {
                region_start: 60,
                ..args(1)
            },
        ];
        for a in cases {
            assert!(
                matches!(
                    a.normalize(64, 512, 128 * 1024, 0),
                    Err(NvmeError::InvalidWorkload(_))
                ),
                "{:?}",
                a
            );
        }
        assert!(matches!(
            args(1).normalize(64, 512, 128 * 1024, CMD_LOG_DEPTH),
            Err(NvmeError::InvalidWorkload(_))
        ));
    }

    #[test]
    fn invalid_workload_sends_nothing() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        let a = IoWorkerArgs {
            read_percentage: 150,
            ..args(10)
        };
        assert!(ioworker_entry(&td.ns, &mut qp, &a).is_err());
        assert_eq!(td.driver.cmdlog().dump(qp.qid(), 0).unwrap().count(), 0);
    }

    #[test]
    fn oversized_transfer() {
        let td = TestDriver::with_geometry(1024, 512, 2048);
        let mut qp = td.qpair();
        let err = ioworker_entry(&td.ns, &mut qp, &args(10)).unwrap_err();
        assert!(matches!(err, NvmeError::InvalidField(_)));
        assert_eq!(err.status().map(|s| s.code()), Some(0x0002));
        assert_eq!(qp.transport().outstanding(), 0);
    }

    #[test]
    fn hundred_ios() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        let a = IoWorkerArgs {
            qdepth: 16,
            read_percentage: 50,
            output_io_per_latency: true,
            ..args(100)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.io_count(), 100);
        assert!(rets.io_count_read > 0 && rets.io_count_write > 0);
        assert_eq!(rets.error, 0);
        assert_eq!(rets.end, RunEnd::Completed);
        let hist = rets.io_count_per_latency.unwrap();
        assert_eq!(hist.len(), LATENCY_BUCKETS);
        assert_eq!(hist.iter().map(|n| *n as u64).sum::<u64>(), 100);
        assert_eq!(qp.outstanding(), 0);
    }

    #[test]
    fn same_seed_same_lbas() {
        let lbas = |seed| {
            let td = TestDriver::new(4096);
            let mut qp = td.qpair();
            let a = IoWorkerArgs {
                seed,
                qdepth: 1,
                ..args(20)
            };
            ioworker_entry(&td.ns, &mut qp, &a).unwrap();
            td.driver
                .cmdlog()
                .dump(qp.qid(), 0)
                .unwrap()
                .map(|r| r.command.lba())
                .collect::<Vec<_>>()
        };
        assert_eq!(lbas(1), lbas(1));
        assert_ne!(lbas(1), lbas(2));
        assert!(lbas(7).iter().all(|lba| lba % 8 == 0 && *lba <= 4088));
    }

    #[test]
    fn sequential_wraps() {
        let td = TestDriver::new(64);
        let mut qp = td.qpair();
        let a = IoWorkerArgs {
            lba_random: false,
            read_percentage: 0,
            lba_start: 40,
            qdepth: 1,
            ..args(6)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.io_count_write, 6);
        let mut lbas: Vec<u64> = td
            .driver
            .cmdlog()
            .dump(qp.qid(), 0)
            .unwrap()
            .map(|r| r.command.lba())
            .collect();
        lbas.reverse();
        assert_eq!(lbas, vec![40, 48, 56, 0, 8, 16]);
    }

    #[test]
    fn first_error_ends_run() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        qp.transport_mut().fail_nth(5, Status::INTERNAL_ERROR);
        let a = IoWorkerArgs {
            qdepth: 1,
            ..args(100)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.error, Status::INTERNAL_ERROR.code());
        assert_eq!(rets.io_count(), 5);
        assert_eq!(rets.end, RunEnd::Completed);
    }

    #[test]
    fn submission_failure_ends_run() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        qp.transport_mut().refuse_submits(Some(Status::INTERNAL_ERROR));
        let rets = ioworker_entry(&td.ns, &mut qp, &args(100)).unwrap();
        assert_eq!(rets.io_count(), 0);
        assert_eq!(rets.end, RunEnd::Completed);
    }

    #[test]
    fn throttled_rate() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        let a = IoWorkerArgs {
            iops: 100,
            qdepth: 4,
            ..args(50)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.io_count(), 50);
        // 50 commands at 100 per second take about half a second
        assert!(rets.mseconds >= 450, "{} ms", rets.mseconds);
        assert!(rets.iops() <= 110.0, "{} iops", rets.iops());
    }

    #[test]
    fn time_bound_with_per_second_counts() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        let a = IoWorkerArgs {
            seconds: 2,
            iops: 200,
            qdepth: 2,
            output_io_per_second: true,
            ..args(0)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.end, RunEnd::Completed);
        assert!(rets.mseconds >= 2000);
        let per_second = rets.io_count_per_second.clone().unwrap();
        assert!(!per_second.is_empty());
        assert!(per_second.iter().sum::<u64>() <= rets.io_count());
        assert!(per_second[0] > 150 && per_second[0] <= 210);
    }

    #[test]
    fn hung_device_times_out() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        qp.transport_mut().set_hang(true);
        let a = IoWorkerArgs {
            seconds: 1,
            drain_grace_ms: 200,
            qdepth: 8,
            ..args(0)
        };
        let started = Instant::now();
        let rets = ioworker_entry(&td.ns, &mut qp, &a).unwrap();
        assert_eq!(rets.end, RunEnd::TimedOut);
        assert_eq!(rets.io_count(), 0);
        assert!(started.elapsed() >= Duration::from_millis(1200));
        assert_eq!(qp.outstanding(), 0);

        // Late completions find nobody waiting for them
        qp.transport_mut().set_hang(false);
        let mut calls = 0;
        qp.process_completions(0, |_, _| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn stop_flag() {
        let td = TestDriver::new(1024);
        let mut qp = td.qpair();
        let stop = Arc::new(AtomicBool::new(true));
        let worker = IoWorker::new(IoWorkerArgs {
            qdepth: 4,
            ..args(1000)
        })
        .with_stop(stop);
        let rets = worker.run(&td.ns, &mut qp).unwrap();
        assert_eq!(rets.end, RunEnd::Stopped);
        assert_eq!(rets.io_count(), 4);
    }

    #[test]
    fn writes_then_verified_reads() {
        let td = TestDriver::new(256);
        td.driver.config(Driver::VERIFY_READ);
        let mut qp = td.qpair();

        let fill = IoWorkerArgs {
            lba_random: false,
            read_percentage: 0,
            ..args(32)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &fill).unwrap();
        assert_eq!(rets.io_count_write, 32);
        let table = td.ns.integrity().table().unwrap();
        assert!((0..256).all(|lba| table.get(lba) != Some(CRC_UNWRITTEN)));

        let read = IoWorkerArgs {
            read_percentage: 100,
            ..args(200)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &read).unwrap();
        assert_eq!(rets.error, 0);
        assert_eq!(rets.io_count_read, 200);

        // One flipped byte on the media fails the next read of it
        td.dev.corrupt(17, 100, 0x01);
        let read = IoWorkerArgs {
            lba_random: false,
            lba_start: 16,
            region_start: 16,
            region_end: 24,
            qdepth: 1,
            ..args(1)
        };
        let rets = ioworker_entry(&td.ns, &mut qp, &read).unwrap();
        assert_eq!(rets.error, Status::UNRECOVERED_READ.code());
    }
}

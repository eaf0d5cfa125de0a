// Copyright 2024 Oxide Computer Company
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use csv::WriterBuilder;
use signal_hook::consts::signal::*;
use slog::{info, warn, Logger};

use nvmeval::*;

mod perf;
use perf::*;

#[derive(Debug, Parser)]
#[clap(name = "nvtest", term_width = 80)]
#[clap(about = "NVMe validation driver test client", long_about = None)]
pub struct Opt {
    /// Driver settings file (TOML)
    #[clap(long, global = true, value_name = "FILE", action)]
    config: Option<PathBuf>,

    /// Shared region prefix, overrides the config file
    #[clap(long, global = true, env = "NVMEVAL_INSTANCE", action)]
    instance: Option<String>,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run an ioworker against an in-memory namespace
    Run(RunOpt),
    /// List the queues present in the shared command log
    Queues {
        /// Print as JSON
        #[clap(long, action)]
        json: bool,
    },
    /// Print the most recent command log entries of one queue
    Cmdlog {
        #[clap(long, action)]
        qid: u16,
        /// Entries to print, newest first; 0 for the whole ring
        #[clap(long, default_value = "32", action)]
        count: usize,
    },
}

#[derive(Debug, Parser)]
struct RunOpt {
    /// Sectors in the namespace
    #[clap(long, default_value = "262144", action)]
    sectors: u64,

    #[clap(long, default_value = "512", action)]
    sector_size: u32,

    /// Largest transfer the device accepts, in bytes
    #[clap(long, default_value = "131072", action)]
    max_transfer: u32,

    /// Workload file (TOML); overrides the workload flags below
    #[clap(long, value_name = "FILE", action)]
    workload: Option<PathBuf>,

    /// Sectors per command
    #[clap(long, default_value = "8", action)]
    io_size: u16,

    /// Outstanding commands
    #[clap(long, default_value = "64", action)]
    qdepth: u32,

    /// Percentage of reads
    #[clap(long, default_value = "100", action)]
    read_percentage: u8,

    /// Issue sequential rather than random LBAs
    #[clap(long, action)]
    sequential: bool,

    /// Commands per second, 0 for unlimited
    #[clap(long, default_value = "0", action)]
    iops: u32,

    /// Commands to send, 0 for no limit
    #[clap(long, default_value = "0", action)]
    count: u64,

    /// Run time in seconds, 0 for the 24 hour maximum
    #[clap(long, default_value = "10", action)]
    seconds: u32,

    #[clap(long, default_value = "1", action)]
    seed: u64,

    /// Verify the data of every read against the checksum table
    #[clap(long, action)]
    verify: bool,

    /// Fill the whole region with writes before the measured run
    #[clap(long, action)]
    write_first: bool,

    /// Output file for per-second counts
    #[clap(long, value_name = "CSV", action)]
    perf_out: Option<PathBuf>,

    /// Write the run results as JSON
    #[clap(long, value_name = "FILE", action)]
    json_out: Option<PathBuf>,

    /// After the run, keep the shared state alive until interrupted
    #[clap(long, action)]
    hold: bool,
}

impl RunOpt {
    fn workload(&self) -> Result<IoWorkerArgs> {
        let mut args = match &self.workload {
            Some(file) => nvmeval_common::read_toml(file)?,
            None => IoWorkerArgs {
                lba_size: self.io_size,
                lba_random: !self.sequential,
                read_percentage: self.read_percentage,
                iops: self.iops,
                io_count: self.count,
                seconds: self.seconds,
                qdepth: self.qdepth,
                seed: self.seed,
                ..Default::default()
            },
        };
        args.output_io_per_second = true;
        args.output_io_per_latency = true;
        Ok(args)
    }
}

/// Sequential writes covering the region of `args` once
fn fill_workload(args: &IoWorkerArgs, sector_count: u64) -> IoWorkerArgs {
    let end = args.region_end.min(sector_count);
    let span = end.saturating_sub(args.region_start);
    IoWorkerArgs {
        lba_start: args.region_start,
        lba_size: args.lba_size,
        lba_align: 0,
        lba_random: false,
        region_start: args.region_start,
        region_end: end,
        read_percentage: 0,
        io_count: span / args.lba_size.max(1) as u64,
        qdepth: args.qdepth,
        ..Default::default()
    }
}

pub fn opts() -> Result<Opt> {
    let opt: Opt = Opt::parse();
    Ok(opt)
}

fn driver_config(opt: &Opt, role: ProcessRole) -> Result<DriverConfig> {
    let mut cfg = match &opt.config {
        Some(file) => DriverConfig::from_file(file)?,
        None => DriverConfig::default(),
    };
    if let Some(instance) = &opt.instance {
        cfg.instance = instance.clone();
    }
    if role != ProcessRole::Auto {
        cfg.role = role;
    }
    Ok(cfg)
}

fn run_one<T: Transport>(
    ns: &Namespace,
    qpair: &mut QueuePair<T>,
    args: IoWorkerArgs,
    stop: &Arc<AtomicBool>,
) -> Result<IoWorkerRets> {
    let rets = IoWorker::new(args).with_stop(stop.clone()).run(ns, qpair)?;
    Ok(rets)
}

fn cmd_run(opt: &Opt, run: &RunOpt, log: &Logger) -> Result<()> {
    let mut cfg = driver_config(opt, ProcessRole::Primary)?;
    cfg.verify_read |= run.verify;
    let driver = Driver::init(cfg, log)?;

    let dev = MemDevice::new(NamespaceInfo {
        nsid: 1,
        sector_size: run.sector_size,
        sector_count: run.sectors,
        max_transfer_size: run.max_transfer,
    });
    let ns = driver.namespace(dev.info())?;
    if run.verify && ns.integrity().is_degraded() {
        warn!(log, "no checksum table, reads will not be verified");
    }
    let mut qpair = driver.create_qpair(dev.queue())?;
    info!(log, "namespace ready"; "qid" => qpair.qid(), "info" => ?ns.info());

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let mut opt_wtr = None;
    let mut wtr;
    if let Some(perf_out) = &run.perf_out {
        wtr = WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(perf_out)
            .with_context(|| format!("create {:?}", perf_out))?;
        perf_csv_header(&mut wtr)?;
        opt_wtr = Some(&mut wtr);
    }

    let args = run.workload()?;
    perf_header();
    if run.write_first {
        let fill = fill_workload(&args, ns.sector_count());
        let (qdepth, io_size) = (fill.qdepth, fill.lba_size);
        let rets = run_one(&ns, &mut qpair, fill, &stop)?;
        perf_summary("fill", qdepth, &rets);
        if let Some(wtr) = opt_wtr.as_mut() {
            perf_csv(wtr, "fill", qdepth, io_size, &rets)?;
        }
        if rets.error != 0 || rets.end != RunEnd::Completed {
            bail!("fill ended {:?} with status {:#x}", rets.end, rets.error);
        }
    }

    let label = if args.lba_random { "rand" } else { "seq" };
    let (qdepth, io_size) = (args.qdepth, args.lba_size);
    let rets = run_one(&ns, &mut qpair, args, &stop)?;
    perf_summary(label, qdepth, &rets);
    if let Some(wtr) = opt_wtr.as_mut() {
        perf_csv(wtr, label, qdepth, io_size, &rets)?;
    }
    if let Some(json_out) = &run.json_out {
        nvmeval_common::write_json(json_out, &rets, true)?;
    }

    if run.hold {
        stop.store(false, Ordering::SeqCst);
        println!(
            "holding instance {} as primary, interrupt to exit",
            driver.instance()
        );
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    match rets.end {
        RunEnd::TimedOut => bail!("outstanding commands did not drain"),
        _ if rets.error != 0 => {
            bail!("first failed command had status {:#x}", rets.error)
        }
        _ => Ok(()),
    }
}

fn cmd_queues(opt: &Opt, json: bool, log: &Logger) -> Result<()> {
    let driver = Driver::init(driver_config(opt, ProcessRole::Secondary)?, log)?;
    let queues = driver.cmdlog().list_queues();
    if json {
        println!("{}", serde_json::to_string_pretty(&queues)?);
        return Ok(());
    }
    println!("{:>4} {:>11}", "QID", "OUTSTANDING");
    for q in queues {
        println!("{:>4} {:>11}", q.qid, q.outstanding);
    }
    Ok(())
}

fn cmd_cmdlog(opt: &Opt, qid: u16, count: usize, log: &Logger) -> Result<()> {
    let driver = Driver::init(driver_config(opt, ProcessRole::Secondary)?, log)?;
    if !driver.cmdlog().is_present(qid) {
        bail!("queue {} is not present", qid);
    }
    for record in driver.cmdlog().dump(qid, count)? {
        println!("{}", record);
    }
    Ok(())
}

fn main() -> Result<()> {
    let opt = opts()?;
    let log = nvmeval_common::build_logger();

    match &opt.cmd {
        Cmd::Run(run) => cmd_run(&opt, run, &log),
        Cmd::Queues { json } => cmd_queues(&opt, *json, &log),
        Cmd::Cmdlog { qid, count } => cmd_cmdlog(&opt, *qid, *count, &log),
    }
}

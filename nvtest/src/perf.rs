// Copyright 2024 Oxide Computer Company
use std::fs::File;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use nvmeval::IoWorkerRets;

/*
 * Print the perf header.
 */
pub fn perf_header() {
    println!(
        "{:>8} {:>8} {:>8} {:>4} {:>9} {:>9} {:>8} {:>7} {:>7} {:>7} {:>6}",
        "TEST",
        "SECONDS",
        "COUNT",
        "DPTH",
        "IOPS",
        "IOPS_AVG",
        "IOPS_SD",
        "P50_US",
        "P99_US",
        "MAX_US",
        "ERROR",
    );
}

// Given a latency histogram with one bucket per microsecond, find the
// bucket that holds the desired percentile (1 to 99).
pub fn percentile(hist: &[u32], perc: u8) -> Result<usize> {
    if perc == 0 || perc >= 100 {
        bail!("Requested percentile not: 0 < {} < 100", perc);
    }
    let total: u64 = hist.iter().map(|c| *c as u64).sum();
    if total == 0 {
        bail!("Histogram for percentile is empty");
    }

    // Rank of the sample we want, rounded up
    let rank = (total * perc as u64).div_ceil(100);
    let mut seen = 0;
    for (us, count) in hist.iter().enumerate() {
        seen += *count as u64;
        if seen >= rank {
            return Ok(us);
        }
    }
    Ok(hist.len() - 1)
}

/// Mean and standard deviation of the per-second command counts
///
/// The final partial second is left out.
pub fn per_second_stats(counts: &[u64]) -> Option<(f64, f64)> {
    let full = counts.get(..counts.len().saturating_sub(1))?;
    let samples: Vec<f64> = full.iter().map(|c| *c as f64).collect();
    match samples.len() {
        0 => None,
        1 => Some((samples[0], 0.0)),
        _ => {
            let mean = statistical::mean(&samples);
            Some((mean, statistical::standard_deviation(&samples, Some(mean))))
        }
    }
}

/*
 * Display the summary results from an ioworker run.
 */
pub fn perf_summary(msg: &str, qdepth: u32, rets: &IoWorkerRets) {
    let (avg, sd) = rets
        .io_count_per_second
        .as_deref()
        .and_then(per_second_stats)
        .unwrap_or((0.0, 0.0));
    let (p50, p99) = match rets.io_count_per_latency.as_deref() {
        Some(hist) => (
            percentile(hist, 50).unwrap_or(0),
            percentile(hist, 99).unwrap_or(0),
        ),
        None => (0, 0),
    };

    println!(
        "{:>8} {:>8.2} {:>8} {:>4} {:>9.1} {:>9.1} {:>8.1} {:>7} {:>7} {:>7} {:>#6x}",
        msg,
        rets.mseconds as f64 / 1000.0,
        rets.io_count(),
        qdepth,
        rets.iops(),
        avg,
        sd,
        p50,
        p99,
        rets.latency_max_us,
        rets.error,
    );
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    label: String,
    mseconds: u64,
    qdepth: u32,
    io_size: u16,
    read: u64,
    write: u64,
    error: u16,
    per_second: Vec<u64>,
}

pub fn perf_csv_header(wtr: &mut csv::Writer<File>) -> Result<()> {
    wtr.serialize((
        "type",
        "mseconds",
        "qdepth",
        "io_size",
        "read",
        "write",
        "error",
        "per_second",
    ))?;
    Ok(())
}

/*
 * Write one run as a CSV row; the per-second counts trail the fixed
 * columns.
 */
pub fn perf_csv(
    wtr: &mut csv::Writer<File>,
    msg: &str,
    qdepth: u32,
    io_size: u16,
    rets: &IoWorkerRets,
) -> Result<()> {
    wtr.serialize(Record {
        label: msg.to_string(),
        mseconds: rets.mseconds,
        qdepth,
        io_size,
        read: rets.io_count_read,
        write: rets.io_count_write,
        error: rets.error,
        per_second: rets.io_count_per_second.clone().unwrap_or_default(),
    })?;
    wtr.flush()?;
    Ok(())
}

//! Cross-run aggregation of locality logs
//!
//! Each log comes from one supervisor instance of a multi-process run. The
//! instances have independent clocks, so every log starts with an
//! `emu: sync <offset>` line whose offset is subtracted from each of its
//! sample timestamps.
//!
//! Logs are merged into one-second windows. A window is centered on a time
//! `c` and accepts samples in `[c - 0.5, c + 0.5]`. Streams are visited
//! round-robin:
//! - a stream behind the window skips forward to its next sample
//! - a stream ahead of the window moves the center to its sample, and every
//!   other stream has to validate again against the new center
//! - once every stream that still has data has validated, the window is
//!   reported and the center moves forward by exactly one second
//!
//! Lines that are not samples are copied to the output unchanged.

use std::fmt;
use std::io::{BufRead, Write};

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::{EmuError, Result};
use crate::size::to_gib;
use crate::stats::Sample;

/// Half the width of an aggregation window, in seconds
pub const WINDOW_HALF_WIDTH: f64 = 0.5;
/// Distance between consecutive window centers, in seconds
pub const WINDOW_STEP: f64 = 1.0;
/// Largest aligned timestamp accepted as a sample, in seconds
///
/// Far below 2^53, so stepping the window center always makes progress.
pub const MAX_SAMPLE_TIME: f64 = 1e9;

/// Parse an `emu: sync <offset>` line
pub fn parse_sync_line(line: &str) -> Option<f64> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "emu:" || tokens.next()? != "sync" {
        return None;
    }
    tokens.next()?.parse().ok().filter(|v: &f64| v.is_finite())
}

/// One input log and its read cursor
#[derive(Debug)]
pub struct RunStream<R> {
    source_id: String,
    clock_offset: f64,
    reader: R,
    cursor: Option<Sample>,
    at_eof: bool,
}

impl<R: BufRead> RunStream<R> {
    /// Read the sync line and position the stream before its first sample
    pub fn open(source_id: impl Into<String>, mut reader: R) -> Result<Self> {
        let source_id = source_id.into();
        let mut first = String::new();
        reader.read_line(&mut first)?;

        let clock_offset = parse_sync_line(&first).ok_or_else(|| EmuError::SyncLine {
            source_id: source_id.clone(),
            line: first.trim_end().to_string(),
        })?;

        Ok(Self {
            source_id,
            clock_offset,
            reader,
            cursor: None,
            at_eof: false,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn clock_offset(&self) -> f64 {
        self.clock_offset
    }

    /// The most recently read sample, already shifted by the clock offset
    pub fn cursor(&self) -> Option<&Sample> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.at_eof
    }

    /// Read one line; samples move the cursor, anything else is passed through
    ///
    /// Samples whose aligned time is out of range are passed through too.
    /// Returns `false` at end of stream.
    fn advance<W: Write>(&mut self, passthrough: &mut W) -> Result<bool> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            self.at_eof = true;
            return Ok(false);
        }

        match Sample::from_report_line(&String::from_utf8_lossy(&line)) {
            Some(mut sample) => {
                sample.timestamp -= self.clock_offset;
                if sample.timestamp.abs() <= MAX_SAMPLE_TIME {
                    self.cursor = Some(sample);
                } else {
                    tracing::warn!(source = %self.source_id, "sample time out of range");
                    passthrough.write_all(&line)?;
                }
            }
            None => passthrough.write_all(&line)?,
        }
        Ok(true)
    }
}

/// Outcome of visiting one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// The stream has a sample inside the current window
    Validated,
    /// The stream was ahead and moved the window center to its sample
    Resynced,
    /// The stream ran out of data while catching up
    Exhausted,
    /// The stream was already exhausted
    Skipped,
}

/// One reported window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRecord {
    /// Nominal time of the window
    pub center: f64,
    /// Number of streams that contributed
    pub streams: usize,
    pub local_percent_mean: f64,
    /// Sample standard deviation (n - 1 divisor); 0 for a single stream
    pub local_percent_stddev: f64,
    pub local_bytes: u64,
    pub remote_bytes: u64,
    pub total_bytes: u64,
    /// Mean of the contributing sample timestamps
    pub timestamp: f64,
}

impl AggregateRecord {
    pub fn from_samples(center: f64, samples: &[Sample]) -> Self {
        let n = samples.len();
        let mean = |f: fn(&Sample) -> f64| samples.iter().map(f).sum::<f64>() / n as f64;

        let local_percent_mean = mean(|s| s.local_percent);
        let local_percent_stddev = if n > 1 {
            let var = samples
                .iter()
                .map(|s| (s.local_percent - local_percent_mean).powi(2))
                .sum::<f64>()
                / (n - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        Self {
            center,
            streams: n,
            local_percent_mean,
            local_percent_stddev,
            local_bytes: sum_bytes(samples, |s| s.local_bytes),
            remote_bytes: sum_bytes(samples, |s| s.remote_bytes),
            total_bytes: sum_bytes(samples, |s| s.total_bytes),
            timestamp: mean(|s| s.timestamp),
        }
    }
}

fn sum_bytes(samples: &[Sample], f: fn(&Sample) -> u64) -> u64 {
    samples.iter().map(f).fold(0, u64::saturating_add)
}

impl fmt::Display for AggregateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emu: local% {:.2} {:.2} localGB {:.2} remoteGB {:.2} totalGB {:.2} time {:.2}",
            self.local_percent_mean,
            self.local_percent_stddev,
            to_gib(self.local_bytes),
            to_gib(self.remote_bytes),
            to_gib(self.total_bytes),
            self.timestamp
        )
    }
}

/// Round-robin merger over N streams
#[derive(Debug)]
pub struct Aggregator<R> {
    streams: Vec<RunStream<R>>,
    center: f64,
    validated: Vec<bool>,
}

impl<R: BufRead> Aggregator<R> {
    pub fn new(streams: Vec<RunStream<R>>) -> Self {
        let validated = vec![false; streams.len()];
        Self {
            streams,
            // Before any possible sample: the first sample read always resyncs
            center: f64::NEG_INFINITY,
            validated,
        }
    }

    pub fn streams(&self) -> &[RunStream<R>] {
        &self.streams
    }

    /// Center of the window being collected
    pub fn center(&self) -> f64 {
        self.center
    }

    /// Streams validated against the current center
    pub fn collected(&self) -> usize {
        self.validated.iter().filter(|v| **v).count()
    }

    /// Streams that still have data
    pub fn active(&self) -> usize {
        self.streams.iter().filter(|s| !s.is_exhausted()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.active() == 0
    }

    /// Advance stream `idx` until it validates, resyncs the window, or ends
    ///
    /// Fails with `NoSuchStream` when `idx` is not an input stream.
    pub fn visit<W: Write>(&mut self, idx: usize, passthrough: &mut W) -> Result<Visit> {
        let stream = self
            .streams
            .get_mut(idx)
            .ok_or(EmuError::NoSuchStream(idx))?;
        if stream.is_exhausted() {
            return Ok(Visit::Skipped);
        }

        loop {
            let behind = match stream.cursor {
                None => true,
                Some(sample) => sample.timestamp < self.center - WINDOW_HALF_WIDTH,
            };

            if behind {
                if !stream.advance(passthrough)? {
                    self.validated[idx] = false;
                    return Ok(Visit::Exhausted);
                }
                continue;
            }

            // Cursor is set and not behind
            let time = stream.cursor.map_or(self.center, |s| s.timestamp);
            if time > self.center + WINDOW_HALF_WIDTH {
                self.center = time;
                self.validated.fill(false);
                self.validated[idx] = true;
                return Ok(Visit::Resynced);
            }

            self.validated[idx] = true;
            return Ok(Visit::Validated);
        }
    }

    /// Report the current window if every active stream validated against it
    pub fn close_window(&mut self) -> Option<AggregateRecord> {
        let active = self.active();
        if active == 0 || self.collected() < active {
            return None;
        }

        let samples: Vec<Sample> = self
            .streams
            .iter()
            .zip(&self.validated)
            .filter(|(_, v)| **v)
            .filter_map(|(s, _)| s.cursor)
            .collect();

        let record = AggregateRecord::from_samples(self.center, &samples);
        self.center += WINDOW_STEP;
        self.validated.fill(false);
        Some(record)
    }

    /// Merge every stream to the end, writing records and pass-through lines
    ///
    /// Returns the number of windows reported.
    pub fn run<W: Write>(&mut self, out: &mut W, format: OutputFormat) -> Result<usize> {
        if format == OutputFormat::Text {
            writeln!(out, "agg: {} files", self.streams.len())?;
        }

        let mut windows = 0;
        while !self.is_finished() {
            for idx in 0..self.streams.len() {
                self.visit(idx, out)?;
                if let Some(record) = self.close_window() {
                    write_record(out, &record, format)?;
                    windows += 1;
                }
            }
        }

        out.flush()?;
        Ok(windows)
    }
}

fn write_record<W: Write>(out: &mut W, record: &AggregateRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => writeln!(out, "{}", record)?,
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(record)?)?,
    }
    Ok(())
}

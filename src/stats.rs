//! Memory locality and residency sampling
//!
//! Two per-process accounting sources are read:
//! - `/proc/<pid>/numa_maps`: resident pages per NUMA node (`N<node>=<pages>` tokens)
//! - `/proc/<pid>/smaps_rollup`: aggregate `Rss`/`Pss`/`Referenced`/`Anonymous` sizes
//!
//! Writing to `/proc/<pid>/clear_refs` starts a fresh referenced-bytes interval.
//! The kernel keeps that state per process, so only one monitor may observe a
//! given target at a time; two monitors would clear each other's intervals.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::unistd::{sysconf, Pid, SysconfVar};
use serde::Serialize;

use crate::clock::MonotonicClock;
use crate::error::{EmuError, Result};
use crate::placement::{FAR_NODE, NEAR_NODE};
use crate::size::{to_gib, GIB, KIB};

/// Resident pages per NUMA node, as summed over every mapping of a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePages {
    pages: BTreeMap<u32, u64>,
}

impl NodePages {
    /// Parse the contents of a `numa_maps` file
    ///
    /// Any whitespace-separated token starting with `N` must have the form
    /// `N<node>=<pages>`; anything else is a malformed record.
    pub fn parse(text: &str) -> Result<Self> {
        let mut pages = BTreeMap::new();
        let mut warned_huge = false;

        for token in text.split_whitespace() {
            if let Some(rest) = token.strip_prefix('N') {
                let (node, count) = parse_node_token(rest).ok_or_else(|| EmuError::NodeRecord {
                    record: token.to_string(),
                })?;
                let entry = pages.entry(node).or_insert(0u64);
                *entry = entry.saturating_add(count);
            } else if token.starts_with("huge") && !warned_huge {
                tracing::warn!("skipping huge pages, not supported");
                warned_huge = true;
            }
        }

        Ok(Self { pages })
    }

    /// Pages recorded for one node (0 if absent)
    pub fn get(&self, node: u32) -> u64 {
        self.pages.get(&node).copied().unwrap_or(0)
    }

    /// Nodes that appeared in the accounting source
    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.keys().copied()
    }

    /// Reduce to a near/far locality sample
    ///
    /// Nodes other than the near and far tier are reported and left out of
    /// every total.
    pub fn to_sample(&self, page_size: u64, timestamp: f64) -> Sample {
        for node in self.nodes().filter(|n| *n != NEAR_NODE && *n != FAR_NODE) {
            tracing::warn!("skipping data for node {}", node);
        }

        let near = self.get(NEAR_NODE);
        let far = self.get(FAR_NODE);
        let total = near.saturating_add(far);
        let local_percent = if total == 0 {
            0.0
        } else {
            100.0 * near as f64 / total as f64
        };

        Sample {
            local_percent,
            local_bytes: near.saturating_mul(page_size),
            remote_bytes: far.saturating_mul(page_size),
            total_bytes: total.saturating_mul(page_size),
            timestamp,
        }
    }
}

fn parse_node_token(rest: &str) -> Option<(u32, u64)> {
    let (node, count) = rest.split_once('=')?;
    Some((node.parse().ok()?, count.parse().ok()?))
}

/// One locality observation of one process
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Share of resident pages on the near node, 0..=100
    pub local_percent: f64,
    pub local_bytes: u64,
    pub remote_bytes: u64,
    pub total_bytes: u64,
    /// Seconds since the supervisor started
    pub timestamp: f64,
}

impl Sample {
    /// Parse an `emu: local% ...` report line
    ///
    /// Returns `None` for any other line. Extra trailing fields are ignored.
    pub fn from_report_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "emu:" {
            return None;
        }
        let mut next = |label: &str| -> Option<f64> {
            if tokens.next()? != label {
                return None;
            }
            let value: f64 = tokens.next()?.parse().ok()?;
            value.is_finite().then_some(value)
        };

        let local_percent = next("local%")?;
        let local_gb = next("localGB")?;
        let remote_gb = next("remoteGB")?;
        let total_gb = next("totalGB")?;
        let timestamp = next("time")?;

        Some(Self {
            local_percent,
            local_bytes: from_gib(local_gb),
            remote_bytes: from_gib(remote_gb),
            total_bytes: from_gib(total_gb),
            timestamp,
        })
    }
}

fn from_gib(gib: f64) -> u64 {
    (gib.max(0.0) * GIB as f64).round() as u64
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emu: local% {:.2} localGB {:.2} remoteGB {:.2} totalGB {:.2} time {:.2}",
            self.local_percent,
            to_gib(self.local_bytes),
            to_gib(self.remote_bytes),
            to_gib(self.total_bytes),
            self.timestamp
        )
    }
}

/// One residency observation of one process (`-m` mode)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HotnessSample {
    pub resident_bytes: u64,
    pub proportional_set_bytes: u64,
    pub referenced_bytes: u64,
    pub anonymous_bytes: u64,
    /// referenced / resident, 0 when nothing is resident
    pub hot_ratio: f64,
    pub timestamp: f64,
}

impl HotnessSample {
    /// Parse the contents of an `smaps_rollup` file
    ///
    /// Missing labels count as zero.
    pub fn parse(text: &str, timestamp: f64) -> Self {
        let (mut rss, mut pss, mut referenced, mut anon) = (0, 0, 0, 0);

        for line in text.lines() {
            let Some((label, rest)) = line.split_once(':') else {
                continue;
            };
            let Some(kb) = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            let bytes = kb.saturating_mul(KIB);
            match label.trim() {
                "Rss" => rss = bytes,
                "Pss" => pss = bytes,
                "Referenced" => referenced = bytes,
                "Anonymous" => anon = bytes,
                _ => {}
            }
        }

        let hot_ratio = if rss == 0 {
            0.0
        } else {
            referenced as f64 / rss as f64
        };

        Self {
            resident_bytes: rss,
            proportional_set_bytes: pss,
            referenced_bytes: referenced,
            anonymous_bytes: anon,
            hot_ratio,
            timestamp,
        }
    }
}

impl fmt::Display for HotnessSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memprof: rssKB {} pssKB {} refKB {} hot {:.4} time {:.2} anonKB {}",
            self.resident_bytes / KIB,
            self.proportional_set_bytes / KIB,
            self.referenced_bytes / KIB,
            self.hot_ratio,
            self.timestamp,
            self.anonymous_bytes / KIB
        )
    }
}

/// Reads the accounting sources of one process
#[derive(Debug, Clone)]
pub struct ProcTarget {
    pid: Pid,
    proc_root: PathBuf,
    page_size: u64,
    clock: MonotonicClock,
}

impl ProcTarget {
    /// Sampler for `pid` using the system page size and `/proc`
    pub fn new(pid: Pid, clock: MonotonicClock) -> Result<Self> {
        Ok(Self {
            pid,
            proc_root: PathBuf::from("/proc"),
            page_size: system_page_size()?,
            clock,
        })
    }

    /// Read accounting files below another root instead of `/proc`
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn path(&self, name: &str) -> PathBuf {
        self.proc_root.join(self.pid.to_string()).join(name)
    }

    /// Sample near/far residency from `numa_maps`
    pub fn sample_locality(&self) -> Result<Sample> {
        let path = self.path("numa_maps");
        let text = read_source(&path)?;
        let pages = NodePages::parse(&text)?;
        Ok(pages.to_sample(self.page_size, self.clock.elapsed_secs()))
    }

    /// Sample residency and hotness from `smaps_rollup`
    pub fn sample_hotness(&self) -> Result<HotnessSample> {
        let path = self.path("smaps_rollup");
        let text = read_source(&path)?;
        Ok(HotnessSample::parse(&text, self.clock.elapsed_secs()))
    }

    /// Clear referenced bits so the next hotness sample covers a fresh interval
    pub fn reset_hotness_tracking(&self) -> Result<()> {
        let path = self.path("clear_refs");
        match std::fs::write(&path, b"1\n") {
            Err(source) if is_exited(&source) => {
                tracing::debug!(path = %path.display(), "target already exited");
                Ok(())
            }
            result => result.map_err(|source| EmuError::Write { path, source }),
        }
    }
}

/// The kernel answers ESRCH for a process that exited but is not reaped yet
fn is_exited(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

/// Read an accounting source; an exited target reads as empty
fn read_source(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(source) if is_exited(&source) => {
            tracing::debug!(path = %path.display(), "target already exited");
            Ok(String::new())
        }
        Err(source) => Err(EmuError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Size in bytes of a base page
pub fn system_page_size() -> Result<u64> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as u64),
        Ok(_) => Ok(4096),
        Err(errno) => Err(EmuError::os("sysconf(PAGE_SIZE)", errno)),
    }
}

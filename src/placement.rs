//! NUMA placement and local-memory budget emulation
//!
//! The near node (0) plays the role of local memory and the far node (1) the
//! role of remote memory. A smaller local memory is emulated by reserving and
//! locking the surplus of the near node before the target starts, so the
//! target can only ever get `budget` bytes of near memory.
//!
//! Placement policies are applied in the forked child right before `exec`, so
//! the new image inherits them through the kernel's task memory policy.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::mman::{mlock, mmap_anonymous, munlock, munmap, MapFlags, ProtFlags};
use nix::unistd::Pid;

use crate::error::{EmuError, Result};

/// Node hosting "local" memory
pub const NEAR_NODE: u32 = 0;
/// Node hosting "remote" memory
pub const FAR_NODE: u32 = 1;

// Memory policy modes and flags from <linux/mempolicy.h>
const MPOL_DEFAULT: i32 = 0;
const MPOL_BIND: i32 = 2;
const MPOL_INTERLEAVE: i32 = 3;
const MPOL_MF_STRICT: u32 = 1;

/// Width of a node mask in bits
const NODEMASK_BITS: u32 = u64::BITS;

/// How the target's memory is spread over NUMA nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Kernel default (first touch on the running node)
    Default,
    /// Round-robin over every online node
    Interleave,
    /// Bind every allocation to the far node
    FarOnly,
}

impl PlacementPolicy {
    /// Pick the policy for a budget and the interleave flag
    ///
    /// A zero budget means "no local memory at all" and wins over interleave.
    pub fn select(budget: Option<u64>, interleave: bool) -> Self {
        match (budget, interleave) {
            (Some(0), _) => PlacementPolicy::FarOnly,
            (_, true) => PlacementPolicy::Interleave,
            _ => PlacementPolicy::Default,
        }
    }

    /// Resolve the node mask this policy needs
    pub fn resolve(self, topology: &NodeTopology) -> Result<Placement> {
        let (mode, mask) = match self {
            PlacementPolicy::Default => (MPOL_DEFAULT, NodeMask::default()),
            PlacementPolicy::Interleave => {
                (MPOL_INTERLEAVE, NodeMask::from_nodes(&topology.online_nodes()?)?)
            }
            PlacementPolicy::FarOnly => (MPOL_BIND, NodeMask::from_nodes(&[FAR_NODE])?),
        };
        Ok(Placement {
            policy: self,
            mode,
            mask,
        })
    }
}

/// Bit set of NUMA node ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMask(u64);

impl NodeMask {
    pub fn from_nodes(nodes: &[u32]) -> Result<Self> {
        let mut bits = 0u64;
        for &node in nodes {
            if node >= NODEMASK_BITS {
                return Err(EmuError::NodeOutOfRange(node));
            }
            bits |= 1 << node;
        }
        Ok(Self(bits))
    }

    pub fn contains(&self, node: u32) -> bool {
        node < NODEMASK_BITS && self.0 & (1 << node) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn as_ptr(&self) -> *const libc::c_ulong {
        &self.0 as *const u64 as *const libc::c_ulong
    }

    // The kernel reads maxnode - 1 bits
    fn max_node(&self) -> libc::c_ulong {
        libc::c_ulong::from(NODEMASK_BITS) + 1
    }
}

/// A policy resolved to a concrete memory policy mode and node mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    policy: PlacementPolicy,
    mode: i32,
    mask: NodeMask,
}

impl Placement {
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    pub fn mask(&self) -> NodeMask {
        self.mask
    }

    /// Install the policy for the calling task
    ///
    /// Only issues a single system call, so it is safe to use between `fork`
    /// and `exec`.
    pub fn apply(&self) -> Result<()> {
        if self.policy == PlacementPolicy::Default {
            return Ok(());
        }
        let (mask, max_node) = (self.mask.as_ptr(), self.mask.max_node());
        // SAFETY: the mask points at a live u64 and max_node covers exactly its bits
        let rc = unsafe { libc::syscall(libc::SYS_set_mempolicy, self.mode, mask, max_node) };
        if rc < 0 {
            return Err(EmuError::os("set_mempolicy", Errno::last()));
        }
        Ok(())
    }
}

/// Read-only view of `/sys/devices/system/node`
#[derive(Debug, Clone)]
pub struct NodeTopology {
    root: PathBuf,
}

impl NodeTopology {
    pub fn system() -> Self {
        Self::with_root("/sys/devices/system/node")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(|source| EmuError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Nodes with memory currently online
    pub fn online_nodes(&self) -> Result<Vec<u32>> {
        let text = self.read(&self.root.join("online"))?;
        parse_node_list(&text)
    }

    /// Free bytes on `node`
    pub fn free_bytes(&self, node: u32) -> Result<u64> {
        let path = self.root.join(format!("node{}", node)).join("meminfo");
        let text = self.read(&path)?;
        parse_mem_free(&text).ok_or_else(|| EmuError::Read {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no MemFree entry"),
        })
    }

    /// CPUs attached to `node`
    pub fn node_cpus(&self, node: u32) -> Result<Vec<u32>> {
        let path = self.root.join(format!("node{}", node)).join("cpulist");
        let text = self.read(&path)?;
        parse_node_list(&text)
    }
}

/// Parse a kernel list like `0-3,8,10-11`
pub fn parse_node_list(text: &str) -> Result<Vec<u32>> {
    let invalid = || EmuError::InvalidNodeList(text.trim().to_string());
    let mut ids = Vec::new();

    for part in text.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
                let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(part.trim().parse().map_err(|_| invalid())?),
        }
    }

    Ok(ids)
}

/// Extract `MemFree` (in bytes) from a per-node meminfo file
fn parse_mem_free(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let (label, value) = line.split_once(':')?;
        if !label.trim_end().ends_with("MemFree") {
            return None;
        }
        let kb: u64 = value.split_whitespace().next()?.parse().ok()?;
        Some(kb * crate::size::KIB)
    })
}

/// Restrict the calling process (and its future children) to the CPUs of `node`
pub fn run_on_node(topology: &NodeTopology, node: u32) -> Result<()> {
    let mut set = CpuSet::new();
    for cpu in topology.node_cpus(node)? {
        set.set(cpu as usize)
            .map_err(|errno| EmuError::os("CpuSet::set", errno))?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|errno| EmuError::os("sched_setaffinity", errno))
}

/// How much of the near node must be taken away to meet a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationPlan {
    pub budget_bytes: u64,
    pub available_bytes: u64,
    pub reserve_bytes: u64,
}

impl ReservationPlan {
    /// Fails when the near node already has less free memory than the budget
    pub fn new(budget_bytes: u64, available_bytes: u64) -> Result<Self> {
        if available_bytes < budget_bytes {
            return Err(EmuError::InsufficientNearMemory {
                node: NEAR_NODE,
                available: available_bytes,
                budget: budget_bytes,
            });
        }
        Ok(Self {
            budget_bytes,
            available_bytes,
            reserve_bytes: available_bytes - budget_bytes,
        })
    }
}

/// Pinned block on the near node
///
/// Released only through [`MemoryReservation::release`]; dropping it without
/// releasing leaves the block to process teardown.
#[derive(Debug)]
pub struct MemoryReservation {
    budget_bytes: u64,
    reserved_bytes: u64,
    region: Option<NonNull<c_void>>,
    pinned: bool,
}

impl MemoryReservation {
    /// Reserve, bind to the near node, and lock the planned surplus
    pub fn pin(plan: ReservationPlan) -> Result<Self> {
        let Some(length) = NonZeroUsize::new(plan.reserve_bytes as usize) else {
            return Ok(Self {
                budget_bytes: plan.budget_bytes,
                reserved_bytes: 0,
                region: None,
                pinned: false,
            });
        };

        // SAFETY: fresh anonymous mapping, no existing memory is aliased
        let region = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| EmuError::os("mmap", errno))?;

        let mask = NodeMask::from_nodes(&[NEAR_NODE])?;
        // SAFETY: region/length describe the mapping created above
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                region.as_ptr(),
                length.get(),
                MPOL_BIND,
                mask.as_ptr(),
                mask.max_node(),
                MPOL_MF_STRICT,
            )
        };
        if rc < 0 {
            return Err(EmuError::os("mbind", Errno::last()));
        }

        // Faults every page in and keeps it from being swapped or reclaimed
        // SAFETY: region/length describe the mapping created above
        unsafe { mlock(region, length.get()) }
            .map_err(|errno| EmuError::os("mlock (is the memlock rlimit too low?)", errno))?;

        tracing::debug!(bytes = plan.reserve_bytes, "near node reservation pinned");

        Ok(Self {
            budget_bytes: plan.budget_bytes,
            reserved_bytes: plan.reserve_bytes,
            region: Some(region),
            pinned: true,
        })
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Unlock and unmap the reserved block
    pub fn release(self) -> Result<()> {
        let Some(region) = self.region else {
            return Ok(());
        };
        let length = self.reserved_bytes as usize;
        if self.pinned {
            // SAFETY: region/length are exactly what pin() locked
            unsafe { munlock(region, length) }.map_err(|errno| EmuError::os("munlock", errno))?;
        }
        // SAFETY: region/length are exactly what pin() mapped; self is consumed
        unsafe { munmap(region, length) }.map_err(|errno| EmuError::os("munmap", errno))?;
        tracing::debug!(bytes = length, "near node reservation released");
        Ok(())
    }
}

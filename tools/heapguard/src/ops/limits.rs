use crate::ops::util;
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const MEMINFO: &str = "/proc/meminfo";

const V2_CONTROLLERS: &str = "cgroup.controllers";
const V2_MEMORY_MAX: &str = "memory.max";
const V1_MEMORY_LIMIT: &str = "memory/memory.limit_in_bytes";

/// v2 spells "no limit" as this token.
const V2_UNBOUNDED: &str = "max";

/// v1 reports "no limit" as a page-aligned value just under `i64::MAX`.
const V1_UNBOUNDED_FLOOR: u64 = 1 << 62;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    CgroupV2,
    CgroupV1,
    HostFallback,
}

impl fmt::Display for LimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitSource::CgroupV2 => "cgroup-v2",
            LimitSource::CgroupV1 => "cgroup-v1",
            LimitSource::HostFallback => "host-fallback",
        })
    }
}

/// Memory ceiling the runtime must fit into. `bytes` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub bytes: u64,
    pub source: LimitSource,
}

impl ResourceLimit {
    pub fn mib(&self) -> u64 {
        self.bytes / (1024 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct LimitInspector {
    cgroup_root: PathBuf,
    meminfo: PathBuf,
}

impl Default for LimitInspector {
    fn default() -> Self {
        Self::new(CGROUP_ROOT, MEMINFO)
    }
}

impl LimitInspector {
    pub fn new(cgroup_root: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            meminfo: meminfo.into(),
        }
    }

    pub fn detect_version(&self) -> CgroupVersion {
        if self.cgroup_root.join(V2_CONTROLLERS).exists() {
            CgroupVersion::V2
        } else {
            CgroupVersion::V1
        }
    }

    /// Read the enforced memory ceiling, falling back to host memory when the
    /// cgroup reports no usable limit.
    ///
    /// The only error is an unusable meminfo on the fallback path.
    pub fn read_limit(&self) -> Result<ResourceLimit> {
        let version = self.detect_version();

        let from_cgroup = match version {
            CgroupVersion::V2 => read_v2_limit(&self.cgroup_root.join(V2_MEMORY_MAX))
                .map(|bytes| (bytes, LimitSource::CgroupV2)),
            CgroupVersion::V1 => read_v1_limit(&self.cgroup_root.join(V1_MEMORY_LIMIT))
                .map(|bytes| (bytes, LimitSource::CgroupV1)),
        };

        let limit = match from_cgroup {
            Some((bytes, source)) => ResourceLimit { bytes, source },
            None => ResourceLimit {
                bytes: host_memory_bytes(&self.meminfo)?,
                source: LimitSource::HostFallback,
            },
        };

        tracing::info!(
            version = ?version,
            source = %limit.source,
            limit_mib = limit.mib(),
            "detected cgroup {:?}, memory limit {} MiB ({})",
            version,
            limit.mib(),
            limit.source
        );

        Ok(limit)
    }
}

fn read_v2_limit(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    if raw == V2_UNBOUNDED {
        tracing::debug!(path = %path.display(), "cgroup v2 limit is unbounded");
        return None;
    }
    parse_positive(raw)
}

fn read_v1_limit(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let bytes = parse_positive(raw.trim())?;
    if bytes >= V1_UNBOUNDED_FLOOR {
        tracing::debug!(path = %path.display(), bytes, "cgroup v1 limit is unbounded");
        return None;
    }
    Some(bytes)
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok().filter(|v| *v > 0)
}

fn host_memory_bytes(meminfo: &Path) -> Result<u64> {
    let content = util::read_to_string(meminfo)?;
    parse_memtotal_bytes(&content)
        .ok_or_else(|| anyhow!("no usable MemTotal in {}", meminfo.display()))
        .context("host memory fallback")
}

/// `MemTotal:       16318480 kB` -> bytes.
fn parse_memtotal_bytes(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            return kib.checked_mul(1024).filter(|b| *b > 0);
        }
    }
    None
}

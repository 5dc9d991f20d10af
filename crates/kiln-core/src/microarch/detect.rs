//! Host CPU probing.
//!
//! Only the first probe that yields data for the running platform is used:
//! `/proc/cpuinfo` on Linux, `sysctl` on macOS.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use super::TargetTable;

static POWER_GENERATION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"POWER(\d+)").ok());

/// Normalized host CPU description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Family root (`x86_64`, `aarch64`, `ppc64le`, ...).
    pub family: String,
    /// Vendor string as the table spells it.
    pub vendor: String,
    /// Feature flags, normalized to the table's names.
    pub features: BTreeSet<String>,
    /// POWER generation, zero elsewhere.
    pub generation: u32,
}

type RawInfo = BTreeMap<String, String>;
type Probe = fn() -> Option<RawInfo>;

fn machine_family() -> String {
    match std::env::consts::ARCH {
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le".to_string(),
        "powerpc64" => "ppc64".to_string(),
        other => other.to_string(),
    }
}

fn probes() -> Vec<(&'static str, Probe)> {
    if cfg!(target_os = "macos") {
        vec![("sysctl", sysctl_info as Probe)]
    } else if cfg!(target_os = "linux") {
        vec![("proc_cpuinfo", proc_cpuinfo as Probe)]
    } else {
        Vec::new()
    }
}

/// Parse the first processor block of `/proc/cpuinfo` text.
pub(crate) fn parse_cpuinfo(text: &str) -> RawInfo {
    text.lines()
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn proc_cpuinfo() -> Option<RawInfo> {
    let text = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    let info = parse_cpuinfo(&text);
    (!info.is_empty()).then_some(info)
}

fn sysctl(key: &str) -> Option<String> {
    let out = Command::new("sysctl").args(["-n", key]).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn sysctl_info() -> Option<RawInfo> {
    let mut info = RawInfo::new();
    if let Some(vendor) = sysctl("machdep.cpu.vendor") {
        info.insert("vendor_id".into(), vendor);
    }
    let flags: Vec<String> = [
        "machdep.cpu.features",
        "machdep.cpu.leaf7_features",
        "machdep.cpu.extfeatures",
    ]
    .iter()
    .filter_map(|k| sysctl(k))
    .collect();
    info.insert("flags".into(), flags.join(" ").to_lowercase());
    if let Some(model) = sysctl("machdep.cpu.brand_string") {
        info.insert("model name".into(), model);
    }
    Some(info)
}

/// Build a [`HostInfo`] from raw key/value data.
pub(crate) fn host_info_from_raw(raw: &RawInfo, family: &str, darwin: bool, table: &TargetTable) -> HostInfo {
    let split = |key: &str| -> BTreeSet<String> {
        raw.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    };

    match family {
        "x86_64" => {
            let mut features = split("flags");
            let conversions = if darwin { table.darwin_flags() } else { table.linux_flags() };
            for (from, to) in conversions {
                if from.split_whitespace().all(|f| features.contains(f)) {
                    features.insert(to.clone());
                }
            }
            HostInfo {
                family: family.to_string(),
                vendor: raw.get("vendor_id").cloned().unwrap_or_else(|| "generic".into()),
                features,
                generation: 0,
            }
        }
        "aarch64" => {
            let vendor = if darwin {
                "Apple".to_string()
            } else {
                raw.get("CPU implementer")
                    .and_then(|code| table.arm_vendor(code))
                    .unwrap_or("generic")
                    .to_string()
            };
            HostInfo {
                family: family.to_string(),
                vendor,
                features: split("Features"),
                generation: 0,
            }
        }
        "ppc64" | "ppc64le" => {
            let generation = raw
                .get("cpu")
                .and_then(|cpu| POWER_GENERATION.as_ref()?.captures(cpu))
                .and_then(|c| c.get(1)?.as_str().parse().ok())
                .unwrap_or(0);
            HostInfo {
                family: family.to_string(),
                vendor: "IBM".to_string(),
                features: BTreeSet::new(),
                generation,
            }
        }
        _ => HostInfo {
            family: family.to_string(),
            vendor: "generic".to_string(),
            features: BTreeSet::new(),
            generation: 0,
        },
    }
}

/// Probe the running host.
pub fn detect_host_info(table: &TargetTable) -> HostInfo {
    let family = machine_family();
    let darwin = cfg!(target_os = "macos");
    let raw = probes().into_iter().find_map(|(name, probe)| {
        let info = probe();
        if info.is_none() {
            tracing::debug!(probe = name, "host probe yielded nothing");
        }
        info
    });
    host_info_from_raw(&raw.unwrap_or_default(), &family, darwin, table)
}

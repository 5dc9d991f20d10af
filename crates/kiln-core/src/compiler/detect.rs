//! Host toolchain detection.
//!
//! Each family names its C, C++ and Fortran drivers, the flag that prints a
//! version, and a pattern extracting it. The search path is scanned in order
//! and the first hit for a given (family, version) wins.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use kiln_schema::Version;
use regex::Regex;
use wait_timeout::ChildExt;

use super::{CompilerDescriptor, CompilerFlags, CompilerPaths};

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

struct Family {
    name: &'static str,
    cc: &'static str,
    cxx: &'static str,
    fc: Option<&'static str>,
    version_arg: &'static str,
    version_pattern: &'static str,
}

const GCC: Family = Family {
    name: "gcc",
    cc: "gcc",
    cxx: "g++",
    fc: Some("gfortran"),
    version_arg: "-dumpfullversion",
    version_pattern: r"^(\d+(?:\.\d+)*)\s*$",
};

const CLANG: Family = Family {
    name: "clang",
    cc: "clang",
    cxx: "clang++",
    fc: Some("flang"),
    version_arg: "--version",
    version_pattern: r"(?m)^(?:[\w ]*\s)?clang version (\d+(?:\.\d+)*)",
};

const APPLE_CLANG: Family = Family {
    name: "apple-clang",
    cc: "clang",
    cxx: "clang++",
    fc: None,
    version_arg: "--version",
    version_pattern: r"Apple (?:LLVM|clang) version (\d+(?:\.\d+)*)",
};

const ONEAPI: Family = Family {
    name: "oneapi",
    cc: "icx",
    cxx: "icpx",
    fc: Some("ifx"),
    version_arg: "--version",
    version_pattern: r"Intel\(R\) oneAPI DPC\+\+/C\+\+ Compiler (\d+(?:\.\d+)*)",
};

static SUFFIX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^(-\d+(?:\.\d+)*)?$").ok());

fn families() -> &'static [Family] {
    if cfg!(target_os = "macos") {
        &[APPLE_CLANG, GCC, CLANG]
    } else {
        &[GCC, CLANG, ONEAPI]
    }
}

/// Toolchain families probed on this OS, most preferred first.
pub fn family_names() -> Vec<&'static str> {
    families().iter().map(|f| f.name).collect()
}

/// The `PATH` directories.
pub fn search_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default()
}

/// Platform name as specs spell it (`linux`, `darwin`).
pub fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Host operating system with version (`ubuntu22.04`, `macos14`, ...).
pub fn operating_system() -> String {
    if cfg!(target_os = "macos") {
        let version = Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();
        let major = version.split('.').next().unwrap_or("");
        return format!("macos{major}");
    }
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|text| os_from_release(&text))
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

/// `ID` + `VERSION_ID` from an os-release file.
pub(crate) fn os_from_release(text: &str) -> Option<String> {
    let field = |key: &str| {
        text.lines()
            .filter_map(|l| l.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
    };
    let id = field("ID")?;
    let version = field("VERSION_ID").unwrap_or_default();
    Some(format!("{id}{version}"))
}

/// Run `exe arg` with a timeout and return stdout + stderr.
fn query(exe: &Path, arg: &str) -> Option<String> {
    let mut child = Command::new(exe)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .ok()?;
    let Ok(Some(status)) = child.wait_timeout(VERSION_QUERY_TIMEOUT) else {
        let _ = child.kill();
        let _ = child.wait();
        tracing::debug!(exe = %exe.display(), "version query timed out");
        return None;
    };
    let mut text = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut text);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut text);
    }
    status.success().then_some(text)
}

fn version_of(family: &Family, exe: &Path) -> Option<Version> {
    let output = query(exe, family.version_arg)?;
    let re = Regex::new(family.version_pattern).ok()?;
    let text = re.captures(&output)?.get(1)?.as_str();
    Version::parse(text).ok()
}

fn sibling(dir: &Path, base: &str, suffix: &str) -> Option<PathBuf> {
    let path = dir.join(format!("{base}{suffix}"));
    path.is_file().then_some(path)
}

/// Detect toolchains across `search_path`, in family order.
pub fn detect(search_path: &[PathBuf]) -> Vec<CompilerDescriptor> {
    let os = operating_system();
    let mut seen = BTreeSet::new();
    let mut found = Vec::new();

    for family in families() {
        for dir in search_path {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            names.sort();

            for name in names {
                let Some(suffix) = name.strip_prefix(family.cc) else {
                    continue;
                };
                if !SUFFIX.as_ref().is_some_and(|re| re.is_match(suffix)) {
                    continue;
                }
                let cc = dir.join(&name);
                let Some(version) = version_of(family, &cc) else {
                    tracing::debug!(family = family.name, exe = %cc.display(), "skipping candidate");
                    continue;
                };
                if !seen.insert((family.name, version.clone())) {
                    continue;
                }
                let fc = family.fc.and_then(|fc| sibling(dir, fc, suffix));
                found.push(CompilerDescriptor {
                    alias: CompilerDescriptor::default_alias(family.name, &version),
                    name: family.name.to_string(),
                    version,
                    operating_system: os.clone(),
                    paths: CompilerPaths {
                        cxx: sibling(dir, family.cxx, suffix),
                        f77: fc.clone(),
                        fc,
                        cc: Some(cc),
                    },
                    modules: Vec::new(),
                    flags: CompilerFlags::default(),
                });
            }
        }
    }
    found
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn os_release_parsing() {
        let text = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";
        assert_eq!(os_from_release(text).as_deref(), Some("ubuntu22.04"));
        assert_eq!(os_from_release("ID=arch\n").as_deref(), Some("arch"));
        assert_eq!(os_from_release("NAME=x"), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn finds_versioned_drivers_and_skips_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "gcc", "echo 11.4.0");
        script(dir.path(), "g++", "echo 11.4.0");
        script(dir.path(), "gfortran", "echo 11.4.0");
        script(dir.path(), "gcc-13", "echo 13.2.0");
        script(dir.path(), "gcc-9", "exit 1");
        script(dir.path(), "gcc-ar", "echo 11.4.0");
        script(dir.path(), "clang-17", "echo 'Ubuntu clang version 17.0.6'");

        let found = detect(&[dir.path().to_path_buf()]);
        let names: Vec<String> = found.iter().map(|d| d.alias.clone()).collect();
        assert_eq!(names, ["gcc@11.4.0", "gcc@13.2.0", "clang@17.0.6"]);

        let gcc = &found[0];
        assert_eq!(gcc.paths.cxx, Some(dir.path().join("g++")));
        assert_eq!(gcc.paths.fc, Some(dir.path().join("gfortran")));
        assert_eq!(found[1].paths.cxx, None);
    }

    #[test]
    fn version_patterns() {
        let re = Regex::new(CLANG.version_pattern).unwrap();
        let caps = re.captures("clang version 15.0.7\nTarget: x86_64").unwrap();
        assert_eq!(&caps[1], "15.0.7");
        let re = Regex::new(APPLE_CLANG.version_pattern).unwrap();
        let caps = re.captures("Apple clang version 15.0.0 (clang-1500.3.9.4)").unwrap();
        assert_eq!(&caps[1], "15.0.0");
        let re = Regex::new(ONEAPI.version_pattern).unwrap();
        let caps = re
            .captures("Intel(R) oneAPI DPC++/C++ Compiler 2024.0.2 (2024.0.2.20231213)")
            .unwrap();
        assert_eq!(&caps[1], "2024.0.2");
    }
}

//! Target platform tuple and host detection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Operating systems recipes can target.
pub const SUPPORTED_OS: &[&str] = &["linux", "darwin"];

/// Architectures recipes can target.
pub const SUPPORTED_ARCH: &[&str] = &["amd64", "arm64"];

/// Linux distribution families, in canonical order.
pub const LINUX_FAMILIES: &[&str] = &["debian", "rhel", "arch", "alpine", "suse"];

/// Concrete platform a plan is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<String>,
}

impl Target {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            linux_family: None,
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.linux_family = Some(family.into());
        self
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    /// Detect the host platform.
    ///
    /// On Linux the family comes from `/etc/os-release`; an unrecognized
    /// distribution yields a generic Linux target.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let mut target = Target::new(os, arch);
        if target.is_linux() {
            target.linux_family = detect_family(Path::new("/etc/os-release"));
        }
        target
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(family) = &self.linux_family {
            write!(f, " ({})", family)?;
        }
        Ok(())
    }
}

/// Read an os-release file and map it to a distribution family.
pub fn detect_family(os_release: &Path) -> Option<String> {
    let content = std::fs::read_to_string(os_release).ok()?;
    family_from_os_release(&content)
}

/// Map os-release content to a family. `ID` wins over `ID_LIKE`.
pub fn family_from_os_release(content: &str) -> Option<String> {
    let mut id = None;
    let mut id_like = Vec::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
        match key.trim() {
            "ID" => id = Some(value),
            "ID_LIKE" => id_like = value.split_whitespace().map(str::to_string).collect(),
            _ => {}
        }
    }

    id.iter()
        .chain(id_like.iter())
        .find_map(|candidate| family_for_id(candidate))
        .map(str::to_string)
}

fn family_for_id(id: &str) -> Option<&'static str> {
    match id {
        "debian" | "ubuntu" | "linuxmint" | "pop" | "elementary" | "raspbian" => Some("debian"),
        "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "amzn" | "ol" => Some("rhel"),
        "arch" | "manjaro" | "endeavouros" => Some("arch"),
        "alpine" => Some("alpine"),
        "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => Some("suse"),
        _ => None,
    }
}

pub fn is_known_os(os: &str) -> bool {
    SUPPORTED_OS.contains(&os)
}

pub fn is_known_arch(arch: &str) -> bool {
    SUPPORTED_ARCH.contains(&arch)
}

pub fn is_known_family(family: &str) -> bool {
    LINUX_FAMILIES.contains(&family)
}

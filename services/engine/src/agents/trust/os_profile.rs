//! OS Adapter Table
//!
//! Static per-distribution trust-store knowledge plus the rule tables used to
//! detect which distribution a target runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::error::{Result, TrustError};
use super::runtime::ContainerRuntime;

/// Detected operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Alpine,
    Fedora,
    Rhel,
    Arch,
    OpenSuse,
    Unknown,
}

impl OsFamily {
    pub const KNOWN: [OsFamily; 7] = [
        OsFamily::Ubuntu,
        OsFamily::Debian,
        OsFamily::Alpine,
        OsFamily::Fedora,
        OsFamily::Rhel,
        OsFamily::Arch,
        OsFamily::OpenSuse,
    ];
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Ubuntu => write!(f, "ubuntu"),
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::Alpine => write!(f, "alpine"),
            OsFamily::Fedora => write!(f, "fedora"),
            OsFamily::Rhel => write!(f, "rhel"),
            OsFamily::Arch => write!(f, "arch"),
            OsFamily::OpenSuse => write!(f, "opensuse"),
            OsFamily::Unknown => write!(f, "unknown"),
        }
    }
}

/// How one distribution manages its trust store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsProfile {
    pub family: OsFamily,
    /// Shell command installing the trust-store package.
    pub package_install: &'static str,
    /// Executable whose presence means the prerequisite is installed.
    pub update_binary: &'static str,
    pub trust_anchor_dir: &'static str,
    /// Shell command rebuilding the trust store.
    pub trust_update: &'static str,
}

const DEBIAN_LIKE_INSTALL: &str =
    "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq --no-install-recommends ca-certificates";

/// The process-wide adapter table.
pub const OS_PROFILES: [OsProfile; 7] = [
    OsProfile {
        family: OsFamily::Ubuntu,
        package_install: DEBIAN_LIKE_INSTALL,
        update_binary: "update-ca-certificates",
        trust_anchor_dir: "/usr/local/share/ca-certificates",
        trust_update: "update-ca-certificates",
    },
    OsProfile {
        family: OsFamily::Debian,
        package_install: DEBIAN_LIKE_INSTALL,
        update_binary: "update-ca-certificates",
        trust_anchor_dir: "/usr/local/share/ca-certificates",
        trust_update: "update-ca-certificates",
    },
    OsProfile {
        family: OsFamily::Alpine,
        package_install: "apk add --no-cache ca-certificates",
        update_binary: "update-ca-certificates",
        trust_anchor_dir: "/usr/local/share/ca-certificates",
        trust_update: "update-ca-certificates",
    },
    OsProfile {
        family: OsFamily::Fedora,
        package_install: "dnf install -y ca-certificates",
        update_binary: "update-ca-trust",
        trust_anchor_dir: "/etc/pki/ca-trust/source/anchors",
        trust_update: "update-ca-trust extract",
    },
    OsProfile {
        family: OsFamily::Rhel,
        package_install: "(command -v dnf >/dev/null 2>&1 && dnf install -y ca-certificates) || yum install -y ca-certificates",
        update_binary: "update-ca-trust",
        trust_anchor_dir: "/etc/pki/ca-trust/source/anchors",
        trust_update: "update-ca-trust extract",
    },
    OsProfile {
        family: OsFamily::Arch,
        package_install: "pacman -Sy --noconfirm ca-certificates",
        update_binary: "trust",
        trust_anchor_dir: "/etc/ca-certificates/trust-source/anchors",
        trust_update: "trust extract-compat",
    },
    OsProfile {
        family: OsFamily::OpenSuse,
        package_install: "zypper --non-interactive install ca-certificates",
        update_binary: "update-ca-certificates",
        trust_anchor_dir: "/etc/pki/trust/anchors",
        trust_update: "update-ca-certificates",
    },
];

/// Profile lookup; `None` for `Unknown`.
pub fn profile_for(family: OsFamily) -> Option<&'static OsProfile> {
    OS_PROFILES.iter().find(|p| p.family == family)
}

/// Startup check: every known family maps to a complete profile.
pub fn validate_profiles() -> Result<()> {
    for family in OsFamily::KNOWN {
        let profile = profile_for(family)
            .ok_or_else(|| TrustError::Config(format!("no trust-store profile for {}", family)))?;
        if profile.package_install.is_empty()
            || profile.update_binary.is_empty()
            || profile.trust_update.is_empty()
            || !profile.trust_anchor_dir.starts_with('/')
        {
            return Err(TrustError::Config(format!("incomplete trust-store profile for {}", family)));
        }
    }
    Ok(())
}

/// Release-file rules, evaluated top-down. Derivatives come before their base.
pub const RELEASE_RULES: [(&[&str], OsFamily); 7] = [
    (&["ubuntu"], OsFamily::Ubuntu),
    (&["debian", "raspbian"], OsFamily::Debian),
    (&["alpine"], OsFamily::Alpine),
    (&["rhel", "centos", "rocky", "almalinux", "ol", "redhat"], OsFamily::Rhel),
    (&["fedora"], OsFamily::Fedora),
    (&["arch", "archlinux", "manjaro", "endeavouros"], OsFamily::Arch),
    (&["opensuse", "suse", "sles", "opensuse-leap", "opensuse-tumbleweed"], OsFamily::OpenSuse),
];

/// Package-manager probes, evaluated top-down when no release file helps.
pub const PACKAGE_MANAGER_RULES: [(&str, OsFamily); 6] = [
    ("apk", OsFamily::Alpine),
    ("apt-get", OsFamily::Debian),
    ("dnf", OsFamily::Fedora),
    ("yum", OsFamily::Rhel),
    ("pacman", OsFamily::Arch),
    ("zypper", OsFamily::OpenSuse),
];

/// Release files tried in order.
pub const RELEASE_FILES: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

fn match_rules(token: &str) -> Option<OsFamily> {
    RELEASE_RULES
        .iter()
        .find(|(names, _)| names.iter().any(|n| token.eq_ignore_ascii_case(n)))
        .map(|(_, family)| *family)
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

/// Classify release-file text.
///
/// `ID` is the strongest signal, then each `ID_LIKE` entry, then any word of
/// the text (covers `/etc/redhat-release` style one-liners).
pub fn detect_from_release(text: &str) -> OsFamily {
    let mut id = None;
    let mut id_like = Vec::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "ID" => id = Some(unquote(value).to_string()),
                "ID_LIKE" => id_like.extend(unquote(value).split_whitespace().map(str::to_string)),
                _ => {}
            }
        }
    }

    if let Some(family) = id.as_deref().and_then(match_rules) {
        return family;
    }
    if let Some(family) = id_like.iter().find_map(|t| match_rules(t)) {
        return family;
    }

    let lowered = text.to_ascii_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .collect();
    RELEASE_RULES
        .iter()
        .find(|(names, _)| words.iter().any(|w| names.contains(w)))
        .map(|(_, family)| *family)
        .unwrap_or(OsFamily::Unknown)
}

/// Classify by the first package manager present, in table order.
pub fn detect_from_package_managers(present: &[&str]) -> OsFamily {
    PACKAGE_MANAGER_RULES
        .iter()
        .find(|(binary, _)| present.contains(binary))
        .map(|(_, family)| *family)
        .unwrap_or(OsFamily::Unknown)
}

/// Shell snippet printing every probed package manager that exists.
pub fn package_manager_probe_script() -> String {
    let binaries: Vec<&str> = PACKAGE_MANAGER_RULES.iter().map(|(b, _)| *b).collect();
    format!(
        "for b in {}; do command -v \"$b\" >/dev/null 2>&1 && echo \"$b\"; done; true",
        binaries.join(" ")
    )
}

/// Detect a container's OS: release file first, then package managers.
pub async fn detect_container_os(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<OsFamily> {
    for path in RELEASE_FILES {
        let output = runtime.exec(container_id, &["cat", path]).await?;
        if output.success() {
            let family = detect_from_release(&output.stdout);
            if family != OsFamily::Unknown {
                debug!(container = %container_id, os = %family, path, "Detected OS from release file");
                return Ok(family);
            }
        }
    }

    let script = package_manager_probe_script();
    let output = runtime.exec(container_id, &["sh", "-c", &script]).await?;
    let present: Vec<&str> = output.stdout.lines().map(str::trim).collect();
    let family = detect_from_package_managers(&present);
    debug!(container = %container_id, os = %family, "Detected OS from package managers");
    Ok(family)
}

use crate::constants::profile::TOOL_INVENTORY;
use crate::managers::ssh::RemoteShell;
use crate::services::logger::Logger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Rhel,
    Arch,
    Alpine,
    Suse,
    Unknown,
}

impl OsFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            OsFamily::Debian => "debian",
            OsFamily::Rhel => "rhel",
            OsFamily::Arch => "arch",
            OsFamily::Alpine => "alpine",
            OsFamily::Suse => "suse",
            OsFamily::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    Systemd,
    Sysvinit,
    Openrc,
    Upstart,
    None,
}

impl ServiceManager {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceManager::Systemd => "systemd",
            ServiceManager::Sysvinit => "sysvinit",
            ServiceManager::Openrc => "openrc",
            ServiceManager::Upstart => "upstart",
            ServiceManager::None => "none",
        }
    }
}

/// Immutable snapshot of a target host. Every field is best-effort: a probe
/// that fails leaves its default (unknown, zero, empty) rather than failing
/// the profile.
#[derive(Debug, Clone, Serialize)]
pub struct HostProfile {
    pub os_family: OsFamily,
    pub distribution: String,
    pub version: String,
    pub kernel: String,
    pub arch: String,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub disk_free_bytes: u64,
    pub tools: BTreeSet<String>,
    pub service_manager: ServiceManager,
    /// Ordered, deduplicated (port, protocol) pairs.
    pub listening_ports: BTreeSet<(u16, String)>,
    pub captured_at: DateTime<Utc>,
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            os_family: OsFamily::Unknown,
            distribution: "unknown".to_string(),
            version: String::new(),
            kernel: String::new(),
            arch: String::new(),
            memory_total_bytes: 0,
            memory_available_bytes: 0,
            disk_free_bytes: 0,
            tools: BTreeSet::new(),
            service_manager: ServiceManager::None,
            listening_ports: BTreeSet::new(),
            captured_at: Utc::now(),
        }
    }
}

impl HostProfile {
    pub fn package_manager(&self) -> Option<&str> {
        ["apt-get", "apt", "dnf", "yum", "pacman", "apk", "zypper"]
            .into_iter()
            .find(|tool| self.tools.contains(*tool))
    }
}

/// Runs the fixed read-only probe battery over a live shell. Each probe has
/// its own deadline; profiling never fails the caller.
pub struct HostProfiler {
    logger: Logger,
    probe_deadline: Duration,
}

impl HostProfiler {
    pub fn new(logger: Logger, probe_deadline: Duration) -> Self {
        Self {
            logger: logger.child("profiler"),
            probe_deadline,
        }
    }

    fn probe(&self, shell: &dyn RemoteShell, command: &str) -> Option<String> {
        match shell.run(command, self.probe_deadline) {
            Ok(result) if result.exit_code == 0 => Some(result.stdout),
            Ok(result) => {
                self.logger.debug(
                    "Probe returned nonzero",
                    Some(&serde_json::json!({"command": command, "exit_code": result.exit_code})),
                );
                None
            }
            Err(err) => {
                self.logger.debug(
                    "Probe failed",
                    Some(&serde_json::json!({"command": command, "error": err.message})),
                );
                None
            }
        }
    }

    /// Blocking; call from `spawn_blocking`.
    pub fn profile(&self, shell: &dyn RemoteShell) -> HostProfile {
        let mut profile = HostProfile::default();

        if let Some(raw) = self.probe(shell, "cat /etc/os-release") {
            apply_os_release(&mut profile, &raw);
        }
        if let Some(raw) = self.probe(shell, "uname -srm") {
            apply_uname(&mut profile, &raw);
        }
        if let Some(raw) = self.probe(shell, "cat /proc/meminfo") {
            apply_meminfo(&mut profile, &raw);
        }
        if let Some(raw) = self.probe(shell, "df -Pk /") {
            apply_disk_free(&mut profile, &raw);
        }

        let inventory_cmd = format!(
            "for t in {}; do command -v \"$t\" >/dev/null 2>&1 && echo \"$t\"; done; true",
            TOOL_INVENTORY.join(" ")
        );
        if let Some(raw) = self.probe(shell, &inventory_cmd) {
            profile.tools = raw
                .lines()
                .map(str::trim)
                .filter(|line| TOOL_INVENTORY.contains(line))
                .map(str::to_string)
                .collect();
        }

        let svc_cmd = "for t in systemctl rc-service initctl service; do command -v \"$t\" >/dev/null 2>&1 && echo \"$t\"; done; true";
        let svc_tools: Vec<String> = self
            .probe(shell, svc_cmd)
            .map(|raw| raw.lines().map(|l| l.trim().to_string()).collect())
            .unwrap_or_default();
        profile.service_manager = detect_service_manager(&svc_tools);

        let ports_raw = self
            .probe(shell, "ss -H -lntu 2>/dev/null")
            .filter(|raw| !raw.trim().is_empty())
            .or_else(|| self.probe(shell, "netstat -tuln 2>/dev/null"));
        if let Some(raw) = ports_raw {
            profile.listening_ports = parse_listening_ports(&raw);
        }

        profile.captured_at = Utc::now();
        profile
    }
}

fn os_release_field<'a>(raw: &'a str, key: &str) -> Option<&'a str> {
    raw.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k.trim() != key {
            return None;
        }
        Some(v.trim().trim_matches('"'))
    })
}

fn family_from_ids(id: &str, id_like: &str) -> OsFamily {
    let haystack = format!("{} {}", id, id_like).to_lowercase();
    let mentions =
        |names: &[&str]| names.iter().any(|name| haystack.split_whitespace().any(|w| w == *name));
    if mentions(&["debian", "ubuntu"]) {
        OsFamily::Debian
    } else if mentions(&["rhel", "centos", "fedora", "rocky", "almalinux"]) {
        OsFamily::Rhel
    } else if mentions(&["arch"]) {
        OsFamily::Arch
    } else if mentions(&["alpine"]) {
        OsFamily::Alpine
    } else if mentions(&["suse", "opensuse", "opensuse-leap", "sles"]) {
        OsFamily::Suse
    } else {
        OsFamily::Unknown
    }
}

fn apply_os_release(profile: &mut HostProfile, raw: &str) {
    let id = os_release_field(raw, "ID").unwrap_or("");
    let id_like = os_release_field(raw, "ID_LIKE").unwrap_or("");
    profile.os_family = family_from_ids(id, id_like);
    if let Some(name) = os_release_field(raw, "NAME") {
        profile.distribution = name.to_string();
    } else if !id.is_empty() {
        profile.distribution = id.to_string();
    }
    if let Some(version) = os_release_field(raw, "VERSION_ID") {
        profile.version = version.to_string();
    }
}

fn apply_uname(profile: &mut HostProfile, raw: &str) {
    let mut parts = raw.split_whitespace();
    let _sysname = parts.next();
    if let Some(release) = parts.next() {
        profile.kernel = release.to_string();
    }
    if let Some(machine) = parts.next() {
        profile.arch = machine.to_string();
    }
}

fn meminfo_field(raw: &str, key: &str) -> Option<u64> {
    raw.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib * 1024)
    })
}

fn apply_meminfo(profile: &mut HostProfile, raw: &str) {
    if let Some(total) = meminfo_field(raw, "MemTotal") {
        profile.memory_total_bytes = total;
    }
    if let Some(available) = meminfo_field(raw, "MemAvailable") {
        profile.memory_available_bytes = available;
    }
}

fn apply_disk_free(profile: &mut HostProfile, raw: &str) {
    // POSIX df: header then one line; available is the 4th column, in KiB.
    if let Some(line) = raw.lines().nth(1) {
        if let Some(avail) = line.split_whitespace().nth(3) {
            if let Ok(kib) = avail.parse::<u64>() {
                profile.disk_free_bytes = kib * 1024;
            }
        }
    }
}

fn detect_service_manager(tools: &[String]) -> ServiceManager {
    let has = |name: &str| tools.iter().any(|tool| tool == name);
    if has("systemctl") {
        ServiceManager::Systemd
    } else if has("rc-service") {
        ServiceManager::Openrc
    } else if has("initctl") {
        ServiceManager::Upstart
    } else if has("service") {
        ServiceManager::Sysvinit
    } else {
        ServiceManager::None
    }
}

/// Accepts both `ss -H -lntu` and `netstat -tuln` shapes: protocol is the
/// first token, the local address is the token whose suffix after the last
/// `:` parses as a port.
fn parse_listening_ports(raw: &str) -> BTreeSet<(u16, String)> {
    let mut ports = BTreeSet::new();
    for line in raw.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        let protocol = tokens[0].trim_end_matches(|c: char| c.is_ascii_digit());
        let protocol = match protocol {
            "tcp" | "udp" => protocol.to_string(),
            _ => continue,
        };
        let port = tokens.iter().skip(1).find_map(|token| {
            let (_, candidate) = token.rsplit_once(':')?;
            candidate.parse::<u16>().ok()
        });
        if let Some(port) = port {
            ports.insert((port, protocol));
        }
    }
    ports
}

//! Transport session management
//!
//! Ensures an active session to every configured portal, not merely to any
//! one. A check that is satisfied by a single session would silently leave
//! the additional portals disconnected and defeat multipath redundancy.

use crate::error::{VolumeError, VolumeResult};
use std::process::Command;

/// An established initiator-to-portal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Portal address (host:port)
    pub portal: String,
    /// Target IQN / subsystem NQN
    pub target: String,
}

/// Seam to the kernel initiator tooling.
pub trait Initiator: Send + Sync {
    /// Currently established sessions.
    fn active_sessions(&self) -> VolumeResult<Vec<SessionInfo>>;

    /// Run target discovery against a portal.
    fn discover(&self, portal: &str) -> VolumeResult<()>;

    /// Log in to `target` via `portal`.
    fn login(&self, portal: &str, target: &str) -> VolumeResult<()>;
}

/// Session manager over an [`Initiator`].
pub struct SessionManager {
    initiator: Box<dyn Initiator>,
}

impl SessionManager {
    pub fn new(initiator: Box<dyn Initiator>) -> Self {
        Self { initiator }
    }

    /// Ensure a session to every portal in `portals`.
    ///
    /// Each portal is checked and connected independently; a failure on
    /// one is logged and the rest are still attempted. The call fails only
    /// when not a single portal ends up with a session.
    pub fn ensure_sessions(&self, portals: &[String], target: &str) -> VolumeResult<()> {
        let active = self.initiator.active_sessions()?;
        let mut connected = 0usize;
        let mut failed: Vec<String> = Vec::new();

        for portal in portals {
            let present = active
                .iter()
                .any(|s| s.portal == *portal && s.target == target);
            if present {
                log::debug!("session to {} for {} already active", portal, target);
                connected += 1;
                continue;
            }

            match self.connect_portal(portal, target) {
                Ok(()) => {
                    log::info!("established session to {} for {}", portal, target);
                    connected += 1;
                }
                Err(e) => {
                    log::warn!("portal {} unavailable: {}", portal, e);
                    failed.push(portal.clone());
                }
            }
        }

        if connected == 0 {
            return Err(VolumeError::transient(
                "session establishment",
                format!("no session to any of {} portal(s): {:?}", portals.len(), failed),
            ));
        }
        if !failed.is_empty() {
            log::warn!(
                "multipath degraded: {}/{} portal(s) connected, missing {:?}",
                connected,
                portals.len(),
                failed
            );
        }
        Ok(())
    }

    fn connect_portal(&self, portal: &str, target: &str) -> VolumeResult<()> {
        self.initiator.discover(portal)?;
        self.initiator.login(portal, target)
    }
}

/// Which kernel initiator tooling to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorKind {
    /// open-iscsi (`iscsiadm`)
    Iscsi,
    /// nvme-cli (`nvme`)
    NvmeTcp,
}

impl InitiatorKind {
    /// Pick the tooling from the configured target identifier.
    pub fn for_target(target: &str) -> Self {
        if target.starts_with("nqn.") {
            InitiatorKind::NvmeTcp
        } else {
            InitiatorKind::Iscsi
        }
    }
}

/// Production initiator that shells out to the host tooling.
pub struct CliInitiator {
    kind: InitiatorKind,
}

impl CliInitiator {
    pub fn new(kind: InitiatorKind) -> Self {
        Self { kind }
    }

    fn run(program: &str, args: &[&str]) -> VolumeResult<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| VolumeError::transient(program.to_string(), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VolumeError::transient(
                format!("{} {}", program, args.join(" ")),
                stderr.trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Initiator for CliInitiator {
    fn active_sessions(&self) -> VolumeResult<Vec<SessionInfo>> {
        match self.kind {
            InitiatorKind::Iscsi => {
                // "iscsiadm -m session" exits 21 when no sessions exist.
                match Self::run("iscsiadm", &["-m", "session"]) {
                    Ok(out) => Ok(parse_iscsiadm_sessions(&out)),
                    Err(_) => Ok(Vec::new()),
                }
            }
            InitiatorKind::NvmeTcp => {
                let out = Self::run("nvme", &["list-subsys", "-o", "json"])?;
                Ok(parse_nvme_subsystems(&out))
            }
        }
    }

    fn discover(&self, portal: &str) -> VolumeResult<()> {
        match self.kind {
            InitiatorKind::Iscsi => {
                Self::run(
                    "iscsiadm",
                    &["-m", "discovery", "-t", "sendtargets", "-p", portal],
                )?;
                Ok(())
            }
            // nvme-cli connects directly; discovery is part of login.
            InitiatorKind::NvmeTcp => Ok(()),
        }
    }

    fn login(&self, portal: &str, target: &str) -> VolumeResult<()> {
        match self.kind {
            InitiatorKind::Iscsi => {
                Self::run(
                    "iscsiadm",
                    &["-m", "node", "-T", target, "-p", portal, "--login"],
                )?;
                Ok(())
            }
            InitiatorKind::NvmeTcp => {
                let (host, port) = portal.rsplit_once(':').ok_or_else(|| {
                    VolumeError::validation("portal", format!("missing port: {}", portal))
                })?;
                Self::run(
                    "nvme",
                    &["connect", "-t", "tcp", "-a", host, "-s", port, "-n", target],
                )?;
                Ok(())
            }
        }
    }
}

/// Parse `iscsiadm -m session` output.
///
/// Lines look like: `tcp: [1] 10.0.0.5:3260,1 iqn.2005-10.org.example:target0 (non-flash)`
fn parse_iscsiadm_sessions(output: &str) -> Vec<SessionInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let proto = fields.next()?;
            if !proto.starts_with("tcp") {
                return None;
            }
            let _index = fields.next()?;
            let portal_field = fields.next()?;
            let target = fields.next()?;
            // Strip the trailing ",<tpgt>" from the portal field.
            let portal = portal_field.split(',').next()?.to_string();
            Some(SessionInfo {
                portal,
                target: target.to_string(),
            })
        })
        .collect()
}

/// Parse `nvme list-subsys -o json` output into sessions.
fn parse_nvme_subsystems(output: &str) -> Vec<SessionInfo> {
    let parsed: serde_json::Value = match serde_json::from_str(output) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("unparseable nvme list-subsys output: {}", e);
            return Vec::new();
        }
    };

    let mut sessions = Vec::new();
    let subsystems = parsed
        .get("Subsystems")
        .or_else(|| parsed.as_array().and_then(|a| a.first()?.get("Subsystems")))
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    for subsys in subsystems {
        let Some(nqn) = subsys.get("NQN").and_then(|v| v.as_str()) else {
            continue;
        };
        let paths = subsys
            .get("Paths")
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();
        for path in paths {
            // Address looks like "traddr=10.0.0.5,trsvcid=4420"
            let Some(address) = path.get("Address").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut host = None;
            let mut port = None;
            for part in address.split(',') {
                if let Some(v) = part.strip_prefix("traddr=") {
                    host = Some(v);
                } else if let Some(v) = part.strip_prefix("trsvcid=") {
                    port = Some(v);
                }
            }
            if let (Some(host), Some(port)) = (host, port) {
                sessions.push(SessionInfo {
                    portal: format!("{}:{}", host, port),
                    target: nqn.to_string(),
                });
            }
        }
    }
    sessions
}

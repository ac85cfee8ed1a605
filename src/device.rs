//! Local block-device resolution
//!
//! Maps an export identity (LUN number or namespace UUID) to the OS block
//! device that the kernel created for it. Device paths are ephemeral and
//! never persisted; every attach rediscovers them, bounded in time.

use crate::error::{VolumeError, VolumeResult};
use crate::session::InitiatorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// Identity a volume is exported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportIdentity {
    /// SCSI logical unit number
    Lun(u32),
    /// Stable NVMe namespace UUID
    NamespaceUuid(String),
}

impl std::fmt::Display for ExportIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportIdentity::Lun(n) => write!(f, "LUN {}", n),
            ExportIdentity::NamespaceUuid(u) => write!(f, "namespace {}", u),
        }
    }
}

/// One OS-visible block device and the identity metadata the kernel
/// exposes for it. Fields are `None` when the kernel omits them.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub lun: Option<u32>,
    pub namespace_uuid: Option<String>,
    pub subsystem: Option<String>,
    /// Appearance time (epoch seconds), for the newest-device fallback.
    pub created: u64,
}

/// Seam to the kernel's block-device namespace.
pub trait DeviceBus: Send + Sync {
    /// Every block device currently visible. The full namespace, not a
    /// curated subsystem listing: multipath-capable controllers expose
    /// controller-specific names that only appear here.
    fn list_devices(&self) -> VolumeResult<Vec<BlockDevice>>;

    /// Trigger a bus rescan.
    fn rescan(&self) -> VolumeResult<()>;
}

/// Recheck delays after the immediate check.
const RECHECK_DELAYS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(250)];

/// Rescan on every n-th attempt, not every attempt.
const RESCAN_EVERY: u32 = 3;

/// Resolves export identities to local device paths with a bounded wait.
pub struct DeviceLocator {
    bus: Box<dyn DeviceBus>,
}

impl DeviceLocator {
    pub fn new(bus: Box<dyn DeviceBus>) -> Self {
        Self { bus }
    }

    /// Wait for the device exporting `identity` under `subsystem` to
    /// appear, up to `ceiling`. Fails with `NotReady` instead of hanging.
    pub fn wait_for_device(
        &self,
        identity: &ExportIdentity,
        subsystem: &str,
        ceiling: Duration,
    ) -> VolumeResult<PathBuf> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if let Some(path) = self.find_device(identity, subsystem)? {
                log::debug!("{} resolved to {:?} after {:?}", identity, path, started.elapsed());
                return Ok(path);
            }

            let elapsed = started.elapsed();
            if elapsed >= ceiling {
                return Err(VolumeError::NotReady {
                    what: format!("device for {}", identity),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            if attempt % RESCAN_EVERY == RESCAN_EVERY - 1 {
                log::debug!("rescanning bus while waiting for {}", identity);
                if let Err(e) = self.bus.rescan() {
                    log::warn!("bus rescan failed: {}", e);
                }
            }

            let delay = RECHECK_DELAYS
                .get(attempt as usize)
                .copied()
                .unwrap_or(RECHECK_DELAYS[RECHECK_DELAYS.len() - 1]);
            std::thread::sleep(delay.min(ceiling.saturating_sub(elapsed)));
            attempt += 1;
        }
    }

    /// Single pass over the device listing.
    ///
    /// Exact-identity match first; the newest device under the expected
    /// subsystem is accepted only as a fallback when no visible candidate
    /// carries the identity field at all.
    fn find_device(
        &self,
        identity: &ExportIdentity,
        subsystem: &str,
    ) -> VolumeResult<Option<PathBuf>> {
        let devices = self.bus.list_devices()?;

        let mut identity_seen = false;
        for device in &devices {
            let matches = match identity {
                ExportIdentity::Lun(lun) => {
                    identity_seen |= device.lun.is_some();
                    device.lun == Some(*lun)
                }
                ExportIdentity::NamespaceUuid(uuid) => {
                    identity_seen |= device.namespace_uuid.is_some();
                    device
                        .namespace_uuid
                        .as_deref()
                        .map(|u| u.eq_ignore_ascii_case(uuid))
                        .unwrap_or(false)
                }
            };
            if !matches {
                continue;
            }
            // Never accept a device from another subsystem, even with a
            // matching identity field.
            if !subsystem_matches(device, subsystem) {
                log::debug!(
                    "{:?} matches {} but belongs to {:?}, not {}",
                    device.path,
                    identity,
                    device.subsystem,
                    subsystem
                );
                continue;
            }
            return Ok(Some(device.path.clone()));
        }

        if identity_seen {
            // The kernel is reporting identities; the one we want simply
            // is not there yet.
            return Ok(None);
        }

        // Fallback: identity fields are absent from this kernel's
        // listing; take the most recently created device under the
        // expected subsystem.
        let newest = devices
            .iter()
            .filter(|d| subsystem_matches(d, subsystem))
            .max_by_key(|d| d.created);
        if let Some(device) = newest {
            log::debug!(
                "no identity fields in listing; falling back to newest device {:?}",
                device.path
            );
            return Ok(Some(device.path.clone()));
        }
        Ok(None)
    }
}

fn subsystem_matches(device: &BlockDevice, subsystem: &str) -> bool {
    device
        .subsystem
        .as_deref()
        .map(|s| s == subsystem)
        .unwrap_or(false)
}

/// Production bus backed by sysfs.
pub struct SysfsDeviceBus {
    kind: InitiatorKind,
    root: PathBuf,
}

impl SysfsDeviceBus {
    pub fn new(kind: InitiatorKind) -> Self {
        Self::with_root(kind, PathBuf::from("/sys/block"))
    }

    /// Root override for tests.
    pub fn with_root(kind: InitiatorKind, root: PathBuf) -> Self {
        Self { kind, root }
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn entry_created(path: &Path) -> u64 {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// LUN from the SCSI address encoded in the device symlink target
    /// (".../2:0:0:3" -> 3).
    fn scsi_lun(entry: &Path) -> Option<u32> {
        let device_link = std::fs::read_link(entry.join("device")).ok()?;
        let address = device_link.file_name()?.to_str()?;
        address.rsplit(':').next()?.parse().ok()
    }

    /// Target IQN of the iSCSI session a disk hangs off, from the
    /// `session<N>` component in its device ancestry. Local SATA/SAS
    /// disks have no such component and yield `None`.
    fn iscsi_target_of(entry: &Path) -> Option<String> {
        let device = std::fs::canonicalize(entry.join("device")).ok()?;
        for ancestor in device.ancestors() {
            let Some(name) = ancestor.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_prefix("session") else {
                continue;
            };
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let targetname = ancestor.join("iscsi_session").join(name).join("targetname");
            return Self::read_trimmed(&targetname);
        }
        None
    }

    fn scan_scsi(&self) -> VolumeResult<Vec<BlockDevice>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("sd") {
                continue;
            }
            let sys_path = entry.path();
            devices.push(BlockDevice {
                path: PathBuf::from("/dev").join(&name),
                lun: Self::scsi_lun(&sys_path),
                namespace_uuid: None,
                subsystem: Self::iscsi_target_of(&sys_path),
                created: Self::entry_created(&sys_path),
            });
        }
        Ok(devices)
    }

    fn scan_nvme(&self) -> VolumeResult<Vec<BlockDevice>> {
        let mut devices = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_nvme_namespace(&name) {
                continue;
            }
            let sys_path = entry.path();
            let uuid = Self::read_trimmed(&sys_path.join("uuid"))
                .or_else(|| Self::read_trimmed(&sys_path.join("wwid")));
            let subsystem = Self::read_trimmed(&sys_path.join("device/subsysnqn"));
            devices.push(BlockDevice {
                path: PathBuf::from("/dev").join(&name),
                lun: None,
                namespace_uuid: uuid,
                subsystem,
                created: Self::entry_created(&sys_path),
            });
        }
        Ok(devices)
    }
}

/// Accepts both plain ("nvme0n1") and controller-specific ("nvme0c0n1")
/// namespace names.
fn is_nvme_namespace(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    let mut chars = rest.chars().peekable();
    let mut saw_digit = false;
    while chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        chars.next();
        saw_digit = true;
    }
    if !saw_digit {
        return false;
    }
    // Optional controller component
    if chars.peek() == Some(&'c') {
        chars.next();
        let mut saw = false;
        while chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            chars.next();
            saw = true;
        }
        if !saw {
            return false;
        }
    }
    if chars.next() != Some('n') {
        return false;
    }
    let tail: String = chars.collect();
    !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())
}

/// Controller names ("nvme0", "nvme1") under a `/sys/class/nvme`-shaped
/// directory, skipping subsystem and namespace entries.
fn nvme_controllers(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_controller = name
                .strip_prefix("nvme")
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
            if is_controller {
                names.push(name);
            }
        }
    }
    names.sort();
    names
}

impl DeviceBus for SysfsDeviceBus {
    fn list_devices(&self) -> VolumeResult<Vec<BlockDevice>> {
        match self.kind {
            InitiatorKind::Iscsi => self.scan_scsi(),
            InitiatorKind::NvmeTcp => self.scan_nvme(),
        }
    }

    fn rescan(&self) -> VolumeResult<()> {
        match self.kind {
            InitiatorKind::Iscsi => {
                // Ask every SCSI host to rescan; missing hosts are fine.
                let hosts = Path::new("/sys/class/scsi_host");
                if let Ok(entries) = std::fs::read_dir(hosts) {
                    for entry in entries.flatten() {
                        let scan = entry.path().join("scan");
                        if let Err(e) = std::fs::write(&scan, "- - -") {
                            log::debug!("scan write to {:?} failed: {}", scan, e);
                        }
                    }
                }
                Ok(())
            }
            InitiatorKind::NvmeTcp => {
                // Every controller gets a rescan; multipath subsystems
                // expose one controller per path.
                for name in nvme_controllers(Path::new("/sys/class/nvme")) {
                    let device = format!("/dev/{}", name);
                    match Command::new("nvme").args(["ns-rescan", &device]).status() {
                        Ok(status) if !status.success() => {
                            log::debug!("nvme ns-rescan {} exited with {}", device, status);
                        }
                        Ok(_) => {}
                        Err(e) => log::debug!("nvme ns-rescan {} failed: {}", device, e),
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDeviceBus;

    fn dev(path: &str, lun: Option<u32>, uuid: Option<&str>, subsys: &str, created: u64) -> BlockDevice {
        BlockDevice {
            path: PathBuf::from(path),
            lun,
            namespace_uuid: uuid.map(String::from),
            subsystem: Some(subsys.to_string()),
            created,
        }
    }

    const SUBSYS: &str = "nqn.2014-08.org.example:sub0";

    #[test]
    fn test_exact_lun_match() {
        let bus = MockDeviceBus::new(vec![
            dev("/dev/sda", Some(0), None, "iqn.t0", 10),
            dev("/dev/sdb", Some(3), None, "iqn.t0", 11),
        ]);
        let locator = DeviceLocator::new(Box::new(bus));
        let path = locator
            .wait_for_device(&ExportIdentity::Lun(3), "iqn.t0", Duration::from_secs(1))
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/sdb"));
    }

    #[test]
    fn test_uuid_match_is_case_insensitive() {
        let bus = MockDeviceBus::new(vec![dev(
            "/dev/nvme0n1",
            None,
            Some("6F9619FF-8B86-D011-B42D-00C04FC964FF"),
            SUBSYS,
            10,
        )]);
        let locator = DeviceLocator::new(Box::new(bus));
        let path = locator
            .wait_for_device(
                &ExportIdentity::NamespaceUuid("6f9619ff-8b86-d011-b42d-00c04fc964ff".into()),
                SUBSYS,
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/nvme0n1"));
    }

    #[test]
    fn test_foreign_subsystem_never_matches() {
        // Identity matches but the subsystem is wrong: must not resolve,
        // and must not fall back to "newest" either (identity was seen).
        let bus = MockDeviceBus::new(vec![dev(
            "/dev/nvme1n1",
            None,
            Some("abc-123"),
            "nqn.2014-08.org.example:other",
            10,
        )]);
        let locator = DeviceLocator::new(Box::new(bus));
        let err = locator
            .wait_for_device(
                &ExportIdentity::NamespaceUuid("abc-123".into()),
                SUBSYS,
                Duration::from_millis(200),
            )
            .unwrap_err();
        assert!(matches!(err, VolumeError::NotReady { .. }));
    }

    #[test]
    fn test_newest_fallback_when_identity_absent() {
        let bus = MockDeviceBus::new(vec![
            dev("/dev/nvme0n1", None, None, SUBSYS, 10),
            dev("/dev/nvme0n2", None, None, SUBSYS, 20),
            dev("/dev/nvme1n1", None, None, "nqn.other", 30),
        ]);
        let locator = DeviceLocator::new(Box::new(bus));
        let path = locator
            .wait_for_device(
                &ExportIdentity::NamespaceUuid("abc-123".into()),
                SUBSYS,
                Duration::from_secs(1),
            )
            .unwrap();
        // Newest device within the expected subsystem wins.
        assert_eq!(path, PathBuf::from("/dev/nvme0n2"));
    }

    #[test]
    fn test_bounded_wait_and_rescan_cadence() {
        let bus = MockDeviceBus::new(vec![]);
        let handle = bus.handle();
        let locator = DeviceLocator::new(Box::new(bus));

        let started = Instant::now();
        let err = locator
            .wait_for_device(&ExportIdentity::Lun(0), "iqn.t0", Duration::from_millis(600))
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, VolumeError::NotReady { waited_ms, .. } if waited_ms >= 600));
        assert!(elapsed < Duration::from_secs(3), "wait not bounded");

        // Rescans happen, but less often than listing polls.
        let (lists, rescans) = handle.counts();
        assert!(lists > rescans, "rescan ran on every attempt");
        assert!(rescans >= 1, "rescan never ran");
    }

    #[test]
    fn test_device_appearing_late_is_found() {
        let bus = MockDeviceBus::new(vec![]);
        let handle = bus.handle();
        let locator = DeviceLocator::new(Box::new(bus));

        handle.appear_after(2, dev("/dev/sdc", Some(5), None, "iqn.t0", 42));

        let path = locator
            .wait_for_device(&ExportIdentity::Lun(5), "iqn.t0", Duration::from_secs(5))
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/sdc"));
    }

    #[test]
    fn test_is_nvme_namespace() {
        assert!(is_nvme_namespace("nvme0n1"));
        assert!(is_nvme_namespace("nvme12n3"));
        assert!(is_nvme_namespace("nvme0c0n1"));
        assert!(!is_nvme_namespace("nvme0"));
        assert!(!is_nvme_namespace("nvme0c1"));
        assert!(!is_nvme_namespace("sda"));
        assert!(!is_nvme_namespace("nvmen1"));
    }

    #[test]
    fn test_sysfs_scan_nvme() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();

        let ns = root.join("nvme0n1");
        std::fs::create_dir_all(ns.join("device")).unwrap();
        std::fs::write(ns.join("uuid"), "6f9619ff-8b86-d011-b42d-00c04fc964ff\n").unwrap();
        std::fs::write(ns.join("device/subsysnqn"), format!("{}\n", SUBSYS)).unwrap();

        // Controller-specific name without a uuid file, wwid only
        let cns = root.join("nvme0c0n1");
        std::fs::create_dir_all(cns.join("device")).unwrap();
        std::fs::write(cns.join("wwid"), "uuid.abc-123\n").unwrap();
        std::fs::write(cns.join("device/subsysnqn"), format!("{}\n", SUBSYS)).unwrap();

        // Unrelated entry ignored
        std::fs::create_dir_all(root.join("loop0")).unwrap();

        let bus = SysfsDeviceBus::with_root(InitiatorKind::NvmeTcp, root);
        let mut devices = bus.list_devices().unwrap();
        devices.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, PathBuf::from("/dev/nvme0c0n1"));
        assert_eq!(devices[0].namespace_uuid.as_deref(), Some("uuid.abc-123"));
        assert_eq!(devices[1].path, PathBuf::from("/dev/nvme0n1"));
        assert_eq!(
            devices[1].namespace_uuid.as_deref(),
            Some("6f9619ff-8b86-d011-b42d-00c04fc964ff")
        );
        assert_eq!(devices[1].subsystem.as_deref(), Some(SUBSYS));
    }

    /// Builds `<root>/<block>/device` pointing at a SCSI address directory
    /// nested under `parents` (e.g. a `session1` component for iSCSI).
    #[cfg(unix)]
    fn scsi_fixture(root: &Path, block: &str, parents: &[&str], address: &str) -> PathBuf {
        let mut dir = root.join("devices");
        for parent in parents {
            dir = dir.join(parent);
        }
        let scsi_dev = dir.join(address);
        std::fs::create_dir_all(&scsi_dev).unwrap();
        let entry = root.join(block);
        std::fs::create_dir_all(&entry).unwrap();
        std::os::unix::fs::symlink(&scsi_dev, entry.join("device")).unwrap();
        dir
    }

    #[cfg(unix)]
    #[test]
    fn test_sysfs_scan_scsi() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();

        // An iSCSI disk hangs off a session; its target comes from the
        // session's targetname attribute.
        let session_dir = scsi_fixture(
            &root,
            "sda",
            &["platform", "host2", "session1", "target2:0:0"],
            "2:0:0:3",
        );
        let session = session_dir
            .parent()
            .unwrap()
            .join("iscsi_session")
            .join("session1");
        std::fs::create_dir_all(&session).unwrap();
        std::fs::write(session.join("targetname"), "iqn.t0\n").unwrap();

        // A local SATA boot disk is also sd*, with no session ancestry.
        scsi_fixture(&root, "sdb", &["pci0000:00", "host0", "target0:0:0"], "0:0:0:0");

        let bus = SysfsDeviceBus::with_root(InitiatorKind::Iscsi, root);
        let mut devices = bus.list_devices().unwrap();
        devices.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, PathBuf::from("/dev/sda"));
        assert_eq!(devices[0].lun, Some(3));
        assert_eq!(devices[0].subsystem.as_deref(), Some("iqn.t0"));
        assert_eq!(devices[1].path, PathBuf::from("/dev/sdb"));
        assert_eq!(devices[1].lun, Some(0));
        assert_eq!(devices[1].subsystem, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_local_disk_never_resolves_as_exported_lun() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();

        // Only a local boot disk at SCSI address 0:0:0:0 is visible. Its
        // LUN field matches, but it belongs to no iSCSI target and must
        // never resolve as the exported volume.
        scsi_fixture(&root, "sda", &["pci0000:00", "host0", "target0:0:0"], "0:0:0:0");

        let bus = SysfsDeviceBus::with_root(InitiatorKind::Iscsi, root);
        let locator = DeviceLocator::new(Box::new(bus));
        let err = locator
            .wait_for_device(&ExportIdentity::Lun(0), "iqn.t0", Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, VolumeError::NotReady { .. }));
    }

    #[test]
    fn test_nvme_controller_enumeration() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        for entry in ["nvme0", "nvme1", "nvme12", "nvme-subsys0", "loop0"] {
            std::fs::create_dir_all(root.join(entry)).unwrap();
        }

        assert_eq!(nvme_controllers(root), vec!["nvme0", "nvme1", "nvme12"]);
    }
}

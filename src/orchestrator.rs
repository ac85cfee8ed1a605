//! Volume lifecycle orchestration
//!
//! Composes alignment, pre-flight, naming, remote creation, export
//! binding, session establishment and device resolution into the
//! caller-facing alloc/resize/clone/snapshot/free operations. Every
//! safely-retryable transition is re-entrant: re-invoking an operation
//! whose earlier attempt timed out detects completed steps and continues.

use crate::align::align_size;
use crate::api::{normalize_json, ApiClient};
use crate::config::StorageConfig;
use crate::device::{DeviceLocator, ExportIdentity, SysfsDeviceBus};
use crate::error::{VolumeError, VolumeResult};
use crate::mapping::MappingManager;
use crate::naming;
use crate::preflight::Preflight;
use crate::session::{CliInitiator, InitiatorKind, SessionManager};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// A freshly allocated, attached volume.
#[derive(Debug, Clone)]
pub struct AllocatedVolume {
    /// Volume name (the caller-facing identity)
    pub name: String,
    /// Materialized size in bytes, after alignment
    pub size: u64,
    /// Transport identity it is exported under
    pub export: ExportIdentity,
    /// Local block-device path (ephemeral)
    pub device: PathBuf,
}

/// One row of a volume listing.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    /// Export identity, if the volume is currently exported
    pub export: Option<String>,
    pub created: DateTime<Utc>,
}

/// The volume lifecycle orchestrator.
///
/// Safe to share across threads; operations on distinct volumes may
/// interleave freely. Operations on the same name are serialized by the
/// appliance's own uniqueness constraints, whose rejections are folded
/// into the idempotency contracts here.
pub struct VolumeManager {
    config: StorageConfig,
    api: ApiClient,
    sessions: SessionManager,
    locator: DeviceLocator,
}

impl VolumeManager {
    /// Build a production manager from configuration.
    pub fn new(config: StorageConfig) -> VolumeResult<Self> {
        let api = ApiClient::new(&config.api)?;
        let kind = InitiatorKind::for_target(&config.export.target);
        let sessions = SessionManager::new(Box::new(CliInitiator::new(kind)));
        let locator = DeviceLocator::new(Box::new(SysfsDeviceBus::new(kind)));
        Ok(Self::with_parts(config, api, sessions, locator))
    }

    /// Build a manager from explicit parts. Used by tests.
    pub fn with_parts(
        config: StorageConfig,
        api: ApiClient,
        sessions: SessionManager,
        locator: DeviceLocator,
    ) -> Self {
        Self {
            config,
            api,
            sessions,
            locator,
        }
    }

    fn mapping(&self) -> MappingManager<'_> {
        MappingManager::new(&self.api, &self.config.export)
    }

    fn dataset_path(&self, volume: &str) -> String {
        format!("{}/{}", self.config.export.dataset, volume)
    }

    fn device_wait(&self) -> Duration {
        Duration::from_millis(self.config.volume.device_wait_ms)
    }

    /// Leaf names of every volume under the parent dataset.
    fn existing_names(&self) -> VolumeResult<Vec<String>> {
        let prefix = format!("{}/", self.config.export.dataset);
        let rows = self
            .api
            .call("zfs.dataset.query", json!([[["name", "^", prefix]]]))?;
        Ok(rows
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("name").and_then(Value::as_str))
                    .filter_map(|full| full.strip_prefix(prefix.as_str()))
                    .filter(|leaf| !leaf.contains('/'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn dataset_volsize(&self, volume: &str) -> VolumeResult<Option<u64>> {
        let full = self.dataset_path(volume);
        let rows = self
            .api
            .call("zfs.dataset.query", json!([[["name", "=", full]]]))?;
        Ok(rows
            .as_array()
            .and_then(|rows| rows.first())
            .map(|row| normalize_json(row.get("volsize").unwrap_or(&Value::Null)).max(0) as u64))
    }

    fn create_dataset(&self, volume: &str, size: u64) -> VolumeResult<Value> {
        let mut params = json!({
            "name": self.dataset_path(volume),
            "type": "VOLUME",
            "volsize": size,
            "sparse": self.config.volume.sparse,
        });
        if let Some(blocksize) = &self.config.volume.blocksize {
            params["volblocksize"] = json!(blocksize);
        }
        self.api.call("zfs.dataset.create", params)
    }

    /// Pick a name and materialize the dataset for it, converging with
    /// concurrent allocators. The flag reports whether this call created
    /// the dataset; rollback is limited to what this call made.
    ///
    /// Derived names treat a remote "already exists" as a transient
    /// naming signal and move to the next candidate. An explicit name
    /// that already exists remotely is a retried allocate: verify and
    /// continue from the export step.
    fn create_named_dataset(
        &self,
        owner: &str,
        explicit: Option<&str>,
        size: u64,
    ) -> VolumeResult<(String, bool)> {
        if let Some(name) = explicit {
            match self.dataset_volsize(name)? {
                Some(existing_size) => {
                    if existing_size < size {
                        return Err(VolumeError::validation(
                            "existing volume",
                            format!(
                                "{} exists with {} bytes, smaller than requested {}",
                                name, existing_size, size
                            ),
                        ));
                    }
                    log::info!("{} already exists remotely, resuming allocation", name);
                    return Ok((name.to_string(), false));
                }
                None => {
                    return match self.create_dataset(name, size) {
                        Ok(_) => Ok((name.to_string(), true)),
                        Err(e) if e.is_conflict() => {
                            // Created between our query and the create.
                            log::info!("{} appeared concurrently, resuming allocation", name);
                            Ok((name.to_string(), false))
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        }

        let mut existing = self.existing_names()?;
        for _ in 0..naming::MAX_NAME_ATTEMPTS {
            let candidate = naming::allocate_name(owner, None, &existing, 0)?;
            match self.create_dataset(&candidate, size) {
                Ok(_) => return Ok((candidate, true)),
                Err(e) if e.is_conflict() => {
                    // A concurrent allocator won this candidate; probe on.
                    log::debug!("{} taken concurrently, trying next candidate", candidate);
                    existing.push(candidate);
                }
                Err(e) => return Err(e),
            }
        }
        Err(VolumeError::validation(
            "name allocation",
            format!("no creatable disk name for owner {}", owner),
        ))
    }

    /// Allocate a volume: align, gate, create, export, connect, resolve.
    ///
    /// No remote mutation happens before pre-flight passes. A failure
    /// after remote creation cleans up what this call created; a
    /// `NotReady` return means the remote volume exists but never became
    /// visible locally.
    pub fn allocate(
        &self,
        owner: &str,
        requested_bytes: u64,
        name: Option<&str>,
    ) -> VolumeResult<AllocatedVolume> {
        let aligned = align_size(requested_bytes, self.config.volume.blocksize.as_deref());

        Preflight::new(&self.api, &self.config).check(aligned)?;

        let (volume, created_dataset) = self.create_named_dataset(owner, name, aligned)?;

        let export = match self.mapping().ensure(&volume) {
            Ok(export) => export,
            Err(e) => {
                // Never leave an unexportable dataset behind, but only if
                // it is ours: a resumed allocate must not destroy the
                // dataset of the earlier attempt.
                if created_dataset {
                    self.delete_dataset_quietly(&volume);
                }
                return Err(e);
            }
        };

        self.sessions.ensure_sessions(
            &self.config.export.portals(),
            &self.config.export.target,
        )?;

        let device =
            self.locator
                .wait_for_device(&export, &self.config.export.target, self.device_wait())?;

        log::info!(
            "allocated {} ({} bytes) as {} at {:?}",
            volume,
            aligned,
            export,
            device
        );
        Ok(AllocatedVolume {
            name: volume,
            size: aligned,
            export,
            device,
        })
    }

    /// Grow a volume. Shrinking is rejected; the backing format is
    /// append-only and never gives blocks back.
    pub fn resize(&self, volume: &str, new_bytes: u64) -> VolumeResult<u64> {
        let current = self
            .dataset_volsize(volume)?
            .ok_or_else(|| VolumeError::absent(self.dataset_path(volume)))?;

        let aligned = align_size(new_bytes, self.config.volume.blocksize.as_deref());
        if aligned < current {
            return Err(VolumeError::validation(
                "resize",
                format!(
                    "shrink not supported: {} has {} bytes, requested {} (aligned {})",
                    volume, current, new_bytes, aligned
                ),
            ));
        }
        if aligned == current {
            log::debug!("{} already at {} bytes", volume, current);
            return Ok(current);
        }

        self.api.call(
            "zfs.dataset.update",
            json!([self.dataset_path(volume), {"volsize": aligned}]),
        )?;
        log::info!("resized {} from {} to {} bytes", volume, current, aligned);
        Ok(aligned)
    }

    /// Tear down a volume: mapping, then export object, then dataset.
    ///
    /// Every step suppresses "does not exist", so a retried or concurrent
    /// free converges to deleted instead of erroring.
    pub fn free(&self, volume: &str) -> VolumeResult<()> {
        let mapping = self.mapping();
        mapping.remove_mapping(volume)?;
        mapping.remove_export(volume)?;

        let result = self
            .api
            .call("zfs.dataset.delete", json!([self.dataset_path(volume), {"recursive": true}]));
        match result {
            Ok(_) => {
                log::info!("freed {}", volume);
                Ok(())
            }
            Err(e) if e.is_absent() => {
                log::debug!("dataset for {} already gone", volume);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Clone a volume into a new one owned by `owner`, pre-seeded from
    /// the source. The clone is exported but not attached; it enters the
    /// normal lifecycle from there.
    pub fn clone_volume(
        &self,
        source: &str,
        owner: &str,
        name: Option<&str>,
    ) -> VolumeResult<String> {
        if self.dataset_volsize(source)?.is_none() {
            return Err(VolumeError::absent(self.dataset_path(source)));
        }

        let mut existing = self.existing_names()?;
        let dest = match name {
            Some(n) => naming::allocate_name(owner, Some(n), &existing, 0)?,
            None => naming::allocate_name(owner, None, &existing, 0)?,
        };

        let snapshot = format!("base-{}", dest);
        self.snapshot_create(source, &snapshot)?;

        let source_full = self.dataset_path(source);
        let clone_result = self.api.call(
            "zfs.snapshot.clone",
            json!({
                "snapshot": format!("{}@{}", source_full, snapshot),
                "dataset_dst": self.dataset_path(&dest),
            }),
        );
        match clone_result {
            Ok(_) => {}
            Err(e) if e.is_conflict() && name.is_none() => {
                // Derived destination raced; retry picks the next name.
                // A failed retry still owns the base snapshot.
                existing.push(dest);
                let retry = naming::allocate_name(owner, None, &existing, 0)
                    .inspect_err(|_| self.snapshot_delete_quietly(source, &snapshot))?;
                self.api
                    .call(
                        "zfs.snapshot.clone",
                        json!({
                            "snapshot": format!("{}@{}", source_full, snapshot),
                            "dataset_dst": self.dataset_path(&retry),
                        }),
                    )
                    .inspect_err(|_| self.snapshot_delete_quietly(source, &snapshot))?;
                return self.export_clone(source, &retry, &snapshot);
            }
            Err(e) => {
                self.snapshot_delete_quietly(source, &snapshot);
                return Err(e);
            }
        }

        self.export_clone(source, &dest, &snapshot)
    }

    fn export_clone(&self, source: &str, dest: &str, snapshot: &str) -> VolumeResult<String> {
        if let Err(e) = self.mapping().ensure(dest) {
            // The clone was just made for this call; take it back out
            // along with its base snapshot.
            log::warn!("export of clone {} failed, rolling back: {}", dest, e);
            self.delete_dataset_quietly(dest);
            self.snapshot_delete_quietly(source, snapshot);
            return Err(e);
        }
        log::info!("cloned {} -> {}", source, dest);
        Ok(dest.to_string())
    }

    /// Create a named snapshot of a volume. Already-exists is success.
    pub fn snapshot_create(&self, volume: &str, snapshot: &str) -> VolumeResult<()> {
        let result = self.api.call(
            "zfs.snapshot.create",
            json!({"dataset": self.dataset_path(volume), "name": snapshot}),
        );
        match result {
            Ok(_) => {
                log::info!("snapshot {}@{} created", volume, snapshot);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                log::debug!("snapshot {}@{} already exists", volume, snapshot);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a named snapshot. Absence is success.
    pub fn snapshot_delete(&self, volume: &str, snapshot: &str) -> VolumeResult<()> {
        let result = self.api.call(
            "zfs.snapshot.delete",
            json!([format!("{}@{}", self.dataset_path(volume), snapshot)]),
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_absent() => {
                log::debug!("snapshot {}@{} already gone", volume, snapshot);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// List volumes under the parent dataset, optionally filtered to one
    /// owner. Export identities come from one bulk query, not one call
    /// per volume.
    ///
    /// Ownership is encoded in the derived `vm-{owner}-` name prefix.
    /// Explicitly named volumes carry no owner and only appear in
    /// unfiltered listings.
    pub fn list(&self, owner: Option<&str>) -> VolumeResult<Vec<VolumeInfo>> {
        let prefix = format!("{}/", self.config.export.dataset);
        let rows = self
            .api
            .call("zfs.dataset.query", json!([[["name", "^", prefix]]]))?;

        let exports = self.export_identities()?;

        let mut volumes = Vec::new();
        for row in rows.as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(full) = row.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(leaf) = full.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if leaf.contains('/') {
                continue;
            }
            if let Some(owner) = owner {
                if !leaf.starts_with(&format!("vm-{}-", owner)) {
                    continue;
                }
            }

            let size = normalize_json(row.get("volsize").unwrap_or(&Value::Null)).max(0) as u64;
            let created_epoch = normalize_json(row.get("creation").unwrap_or(&Value::Null));
            let created =
                DateTime::from_timestamp(created_epoch, 0).unwrap_or(DateTime::UNIX_EPOCH);

            volumes.push(VolumeInfo {
                name: leaf.to_string(),
                size,
                export: exports.get(leaf).cloned(),
                created,
            });
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    /// Map of volume name to rendered export identity, from bulk queries.
    fn export_identities(
        &self,
    ) -> VolumeResult<std::collections::HashMap<String, String>> {
        let mut map = std::collections::HashMap::new();

        if self.config.export.target.starts_with("nqn.") {
            let rows = self.api.call("nvmet.namespace.query", json!([[]]))?;
            for row in rows.as_array().map(Vec::as_slice).unwrap_or_default() {
                let (Some(path), Some(uuid)) = (
                    row.get("device_path").and_then(Value::as_str),
                    row.get("device_uuid").and_then(Value::as_str),
                ) else {
                    continue;
                };
                if let Some(leaf) = path.rsplit('/').next() {
                    map.insert(leaf.to_string(), format!("namespace {}", uuid));
                }
            }
            return Ok(map);
        }

        let extents = self.api.call("iscsi.extent.query", json!([[]]))?;
        let mappings = self.api.call("iscsi.targetextent.query", json!([[]]))?;
        for extent in extents.as_array().map(Vec::as_slice).unwrap_or_default() {
            let (Some(name), Some(id)) = (
                extent.get("name").and_then(Value::as_str),
                extent.get("id").map(normalize_json),
            ) else {
                continue;
            };
            let lun = mappings
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .find(|m| m.get("extent").map(normalize_json) == Some(id))
                .map(|m| normalize_json(m.get("lunid").unwrap_or(&Value::Null)));
            if let Some(lun) = lun {
                map.insert(name.to_string(), format!("LUN {}", lun));
            }
        }
        Ok(map)
    }

    /// Bring up storage: sessions to every configured portal. Idempotent,
    /// safe to call repeatedly.
    pub fn activate(&self) -> VolumeResult<()> {
        self.sessions.ensure_sessions(
            &self.config.export.portals(),
            &self.config.export.target,
        )
    }

    fn delete_dataset_quietly(&self, volume: &str) {
        let result = self
            .api
            .call("zfs.dataset.delete", json!([self.dataset_path(volume), {"recursive": true}]));
        match result {
            Ok(_) => {}
            Err(e) if e.is_absent() => {}
            Err(e) => log::warn!("rollback of dataset {} failed: {}", volume, e),
        }
    }

    fn snapshot_delete_quietly(&self, volume: &str, snapshot: &str) {
        if let Err(e) = self.snapshot_delete(volume, snapshot) {
            log::warn!("rollback of snapshot {}@{} failed: {}", volume, snapshot, e);
        }
    }
}

//! Idempotent export binding
//!
//! Binds a remote volume to its transport-visible identity: an extent plus
//! target mapping for iSCSI, a namespace for NVMe subsystems. Creation
//! queries first and reuses what exists; deletion treats "does not exist"
//! as success, since concurrent or retried teardown legitimately observes
//! it.

use crate::api::{normalize_json, ApiClient};
use crate::config::ExportConfig;
use crate::device::ExportIdentity;
use crate::error::{VolumeError, VolumeResult};
use serde_json::{json, Value};

/// Export binding manager.
pub struct MappingManager<'a> {
    api: &'a ApiClient,
    export: &'a ExportConfig,
}

/// Swallow a remote "does not exist" on deletion.
fn suppress_absent(result: VolumeResult<Value>, what: &str) -> VolumeResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_absent() => {
            log::debug!("{} already gone", what);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn first_row(result: &Value) -> Option<&Value> {
    result.as_array().and_then(|rows| rows.first())
}

impl<'a> MappingManager<'a> {
    pub fn new(api: &'a ApiClient, export: &'a ExportConfig) -> Self {
        Self { api, export }
    }

    fn uses_namespaces(&self) -> bool {
        self.export.target.starts_with("nqn.")
    }

    /// Appliance-side device path for a volume.
    pub fn device_path(&self, volume: &str) -> String {
        format!("zvol/{}/{}", self.export.dataset, volume)
    }

    /// Ensure `volume` is exported, returning its transport identity.
    ///
    /// Existing bindings are returned without issuing a create call. A
    /// creation failure removes whatever this call partially created
    /// before propagating.
    pub fn ensure(&self, volume: &str) -> VolumeResult<ExportIdentity> {
        if self.uses_namespaces() {
            self.ensure_namespace(volume)
        } else {
            self.ensure_lun(volume)
        }
    }

    fn ensure_lun(&self, volume: &str) -> VolumeResult<ExportIdentity> {
        let (extent_id, created_extent) = self.ensure_extent(volume)?;

        // Query-first: an existing mapping is reused, no duplicate create.
        let params = json!([[["extent", "=", extent_id]]]);
        let existing = self.api.call("iscsi.targetextent.query", params.clone())?;
        if let Some(row) = first_row(&existing) {
            let lun = normalize_json(row.get("lunid").unwrap_or(&Value::Null)) as u32;
            log::debug!("{} already mapped at LUN {}", volume, lun);
            return Ok(ExportIdentity::Lun(lun));
        }

        let create = self.api.call(
            "iscsi.targetextent.create",
            json!({"target": self.export.target, "extent": extent_id}),
        );

        let lun = match create {
            Ok(row) => normalize_json(row.get("lunid").unwrap_or(&Value::Null)) as u32,
            Err(e) if e.is_conflict() => {
                // Lost a race; the winner's mapping serves us fine.
                let rows = self.api.call("iscsi.targetextent.query", params.clone())?;
                match first_row(&rows) {
                    Some(row) => normalize_json(row.get("lunid").unwrap_or(&Value::Null)) as u32,
                    None => {
                        self.cleanup_extent(extent_id, created_extent, volume);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.cleanup_extent(extent_id, created_extent, volume);
                return Err(e);
            }
        };

        // Verify the mapping actually landed before reporting success.
        let rows = self.api.call("iscsi.targetextent.query", params)?;
        if first_row(&rows).is_none() {
            self.cleanup_extent(extent_id, created_extent, volume);
            return Err(VolumeError::Api {
                method: "iscsi.targetextent.create".to_string(),
                code: -1,
                message: format!("mapping for {} not visible after creation", volume),
            });
        }

        log::info!("exported {} at LUN {} on {}", volume, lun, self.export.target);
        Ok(ExportIdentity::Lun(lun))
    }

    /// Returns the extent id and whether this call created it.
    fn ensure_extent(&self, volume: &str) -> VolumeResult<(i64, bool)> {
        let params = json!([[["name", "=", volume]]]);
        let rows = self.api.call("iscsi.extent.query", params.clone())?;
        if let Some(row) = first_row(&rows) {
            return Ok((normalize_json(row.get("id").unwrap_or(&Value::Null)), false));
        }

        let create = self.api.call(
            "iscsi.extent.create",
            json!({
                "name": volume,
                "type": "DISK",
                "disk": self.device_path(volume),
            }),
        );
        match create {
            Ok(row) => Ok((normalize_json(row.get("id").unwrap_or(&Value::Null)), true)),
            Err(e) if e.is_conflict() => {
                let rows = self.api.call("iscsi.extent.query", params)?;
                match first_row(&rows) {
                    Some(row) => {
                        Ok((normalize_json(row.get("id").unwrap_or(&Value::Null)), false))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an extent this call created; never touch pre-existing ones.
    /// Cleanup failure is logged once, not retried.
    fn cleanup_extent(&self, extent_id: i64, created_here: bool, volume: &str) {
        if !created_here {
            return;
        }
        log::warn!("rolling back extent {} for {}", extent_id, volume);
        if let Err(e) = suppress_absent(
            self.api.call("iscsi.extent.delete", json!([extent_id])),
            "extent",
        ) {
            log::warn!("rollback of extent {} failed: {}", extent_id, e);
        }
    }

    fn ensure_namespace(&self, volume: &str) -> VolumeResult<ExportIdentity> {
        let device_path = self.device_path(volume);
        let params = json!([[["device_path", "=", device_path]]]);

        let rows = self.api.call("nvmet.namespace.query", params.clone())?;
        if let Some(row) = first_row(&rows) {
            let uuid = row
                .get("device_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            log::debug!("{} already a namespace ({})", volume, uuid);
            return Ok(ExportIdentity::NamespaceUuid(uuid));
        }

        let create = self.api.call(
            "nvmet.namespace.create",
            json!({"subsys": self.export.target, "device_path": device_path}),
        );
        let row = match create {
            Ok(row) => row,
            Err(e) if e.is_conflict() => {
                let rows = self.api.call("nvmet.namespace.query", params)?;
                match first_row(&rows) {
                    Some(row) => row.clone(),
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let uuid = row
            .get("device_uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VolumeError::Api {
                method: "nvmet.namespace.create".to_string(),
                code: -1,
                message: format!("no device_uuid in namespace reply for {}", volume),
            })?;

        log::info!("exported {} as namespace {} on {}", volume, uuid, self.export.target);
        Ok(ExportIdentity::NamespaceUuid(uuid))
    }

    /// Remove the target mapping for `volume`. Idempotent.
    pub fn remove_mapping(&self, volume: &str) -> VolumeResult<()> {
        if self.uses_namespaces() {
            // The namespace-to-subsystem binding is intrinsic; it goes
            // away with the namespace in remove_export.
            return Ok(());
        }

        let rows = self
            .api
            .call("iscsi.extent.query", json!([[["name", "=", volume]]]))?;
        let Some(row) = first_row(&rows) else {
            log::debug!("no extent for {}, mapping already gone", volume);
            return Ok(());
        };
        let extent_id = normalize_json(row.get("id").unwrap_or(&Value::Null));

        let rows = self
            .api
            .call("iscsi.targetextent.query", json!([[["extent", "=", extent_id]]]))?;
        let Some(row) = first_row(&rows) else {
            log::debug!("mapping for {} already gone", volume);
            return Ok(());
        };
        let mapping_id = normalize_json(row.get("id").unwrap_or(&Value::Null));

        suppress_absent(
            self.api
                .call("iscsi.targetextent.delete", json!([mapping_id])),
            "target mapping",
        )
    }

    /// Remove the export object for `volume`. Idempotent. Must run after
    /// [`MappingManager::remove_mapping`] and before dataset deletion.
    pub fn remove_export(&self, volume: &str) -> VolumeResult<()> {
        if self.uses_namespaces() {
            let device_path = self.device_path(volume);
            let rows = self.api.call(
                "nvmet.namespace.query",
                json!([[["device_path", "=", device_path]]]),
            )?;
            let Some(row) = first_row(&rows) else {
                log::debug!("namespace for {} already gone", volume);
                return Ok(());
            };
            let id = normalize_json(row.get("id").unwrap_or(&Value::Null));
            return suppress_absent(
                self.api.call("nvmet.namespace.delete", json!([id])),
                "namespace",
            );
        }

        let rows = self
            .api
            .call("iscsi.extent.query", json!([[["name", "=", volume]]]))?;
        let Some(row) = first_row(&rows) else {
            log::debug!("extent for {} already gone", volume);
            return Ok(());
        };
        let extent_id = normalize_json(row.get("id").unwrap_or(&Value::Null));

        suppress_absent(
            self.api.call("iscsi.extent.delete", json!([extent_id])),
            "extent",
        )
    }
}

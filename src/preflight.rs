//! Pre-flight validation for volume mutations
//!
//! Runs every check before the first remote mutation, so a refused
//! allocation leaves zero side effects on the appliance. Checks share the
//! parent-dataset query result to keep the success path cheap.

use crate::api::{normalize_json, ApiClient};
use crate::config::StorageConfig;
use crate::error::{VolumeError, VolumeResult};
use serde_json::json;

/// Fraction of headroom required on top of the aligned size.
const CAPACITY_OVERHEAD_PCT: u64 = 20;

/// One failed precondition, with the values needed to act on it.
#[derive(Debug, Clone)]
pub struct PreflightFailure {
    pub check: String,
    pub detail: String,
}

/// Outcome of a pre-flight run. Failures preserve check order.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub failures: Vec<PreflightFailure>,
}

impl PreflightReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, check: &str, detail: String) {
        log::warn!("preflight {}: {}", check, detail);
        self.failures.push(PreflightFailure {
            check: check.to_string(),
            detail,
        });
    }

    /// Collapse into the error taxonomy for propagation.
    pub fn into_result(self) -> VolumeResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let detail = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.check, f.detail))
            .collect::<Vec<_>>()
            .join("; ");
        Err(VolumeError::validation("preflight", detail))
    }
}

/// Pre-flight validator for a prospective allocation.
pub struct Preflight<'a> {
    api: &'a ApiClient,
    config: &'a StorageConfig,
}

impl<'a> Preflight<'a> {
    pub fn new(api: &'a ApiClient, config: &'a StorageConfig) -> Self {
        Self { api, config }
    }

    fn uses_namespaces(&self) -> bool {
        self.config.export.target.starts_with("nqn.")
    }

    /// Run all checks for allocating `aligned_bytes` under the configured
    /// parent dataset. An unreachable API short-circuits the remote
    /// checks; nothing else does.
    pub fn run(&self, aligned_bytes: u64) -> PreflightReport {
        let mut report = PreflightReport::default();

        if let Err(e) = self.api.call("core.ping", json!([])) {
            report.fail(
                "api reachability",
                format!("{} unreachable: {}", self.config.api.endpoint, e),
            );
            return report;
        }

        self.check_service(&mut report);
        self.check_dataset_and_capacity(aligned_bytes, &mut report);
        self.check_target(&mut report);

        report
    }

    /// Same as [`Preflight::run`], collapsed into a result.
    pub fn check(&self, aligned_bytes: u64) -> VolumeResult<()> {
        self.run(aligned_bytes).into_result()
    }

    fn check_service(&self, report: &mut PreflightReport) {
        let service = if self.uses_namespaces() {
            "nvmet"
        } else {
            "iscsitarget"
        };
        let params = json!([[["service", "=", service]]]);
        match self.api.call("service.query", params) {
            Ok(result) => {
                let running = result
                    .as_array()
                    .and_then(|rows| rows.first())
                    .and_then(|row| row.get("state"))
                    .and_then(|s| s.as_str())
                    .map(|s| s == "RUNNING")
                    .unwrap_or(false);
                if !running {
                    report.fail(
                        "transport service",
                        format!("service {} is not running on the appliance", service),
                    );
                }
            }
            Err(e) => report.fail("transport service", format!("query failed: {}", e)),
        }
    }

    fn check_dataset_and_capacity(&self, aligned_bytes: u64, report: &mut PreflightReport) {
        let dataset = &self.config.export.dataset;
        let params = json!([[["name", "=", dataset]]]);

        let rows = match self.api.call("zfs.dataset.query", params) {
            Ok(result) => result,
            Err(e) => {
                report.fail("parent dataset", format!("query failed: {}", e));
                return;
            }
        };

        // One query answers both existence and capacity.
        let Some(row) = rows.as_array().and_then(|rows| rows.first()) else {
            report.fail(
                "parent dataset",
                format!("dataset {} does not exist", dataset),
            );
            return;
        };

        let available = row
            .get("available")
            .map(normalize_json)
            .unwrap_or(0)
            .max(0) as u64;
        let required = aligned_bytes + aligned_bytes * CAPACITY_OVERHEAD_PCT / 100;
        if available < required {
            report.fail(
                "capacity",
                format!(
                    "dataset {} has {} bytes available, need {} ({} + {}% overhead)",
                    dataset, available, required, aligned_bytes, CAPACITY_OVERHEAD_PCT
                ),
            );
        }
    }

    fn check_target(&self, report: &mut PreflightReport) {
        let target = &self.config.export.target;
        let (method, check) = if self.uses_namespaces() {
            ("nvmet.subsys.query", "subsystem")
        } else {
            ("iscsi.target.query", "target")
        };
        let params = json!([[["name", "=", target]]]);

        match self.api.call(method, params) {
            Ok(result) => {
                let found = result
                    .as_array()
                    .map(|rows| !rows.is_empty())
                    .unwrap_or(false);
                if !found {
                    report.fail(check, format!("{} {} not configured on appliance", check, target));
                }
            }
            Err(e) => report.fail(check, format!("query failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, MockTransport};
    use crate::config::RetryConfig;
    use serde_json::Value;

    fn client_with(handler: impl Fn(&str, &Value) -> VolumeResult<Value> + Send + Sync + 'static) -> ApiClient {
        ApiClient::with_transport(
            Box::new(MockTransport::new(handler)),
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        )
    }

    fn healthy_handler(method: &str, _params: &Value) -> VolumeResult<Value> {
        match method {
            "core.ping" => Ok(json!("pong")),
            "service.query" => Ok(json!([{"service": "iscsitarget", "state": "RUNNING"}])),
            "zfs.dataset.query" => Ok(json!([{
                "name": "tank/vmdata",
                "available": {"parsed": 10_737_418_240i64, "rawvalue": "10737418240"},
            }])),
            "iscsi.target.query" => Ok(json!([{"name": "iqn.2005-10.org.example:target0"}])),
            other => Err(VolumeError::absent(other.to_string())),
        }
    }

    #[test]
    fn test_all_checks_pass() {
        let config = test_config();
        let client = client_with(healthy_handler);
        let report = Preflight::new(&client, &config).run(1 << 30);
        assert!(report.ok(), "unexpected failures: {:?}", report.failures);
    }

    #[test]
    fn test_unreachable_api_short_circuits() {
        let config = test_config();
        let client = client_with(|_, _| Err(VolumeError::transient("core.ping", "refused")));
        let report = Preflight::new(&client, &config).run(1 << 30);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].check, "api reachability");
    }

    #[test]
    fn test_capacity_includes_overhead() {
        let config = test_config();
        // 1 GiB available; 1 GiB requested needs 1.2 GiB.
        let client = client_with(|method, p| match method {
            "zfs.dataset.query" => Ok(json!([{
                "name": "tank/vmdata",
                "available": 1_073_741_824i64,
            }])),
            other => healthy_handler(other, p),
        });
        let report = Preflight::new(&client, &config).run(1 << 30);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].check, "capacity");
        assert!(report.failures[0].detail.contains("1073741824"));

        // An 800 MiB request fits under the same availability.
        let client = client_with(|method, p| match method {
            "zfs.dataset.query" => Ok(json!([{
                "name": "tank/vmdata",
                "available": 1_073_741_824i64,
            }])),
            other => healthy_handler(other, p),
        });
        let report = Preflight::new(&client, &config).run(800 << 20);
        assert!(report.ok());
    }

    #[test]
    fn test_collects_independent_failures() {
        let config = test_config();
        let client = client_with(|method, p| match method {
            "service.query" => Ok(json!([{"service": "iscsitarget", "state": "STOPPED"}])),
            "iscsi.target.query" => Ok(json!([])),
            other => healthy_handler(other, p),
        });
        let report = Preflight::new(&client, &config).run(1 << 20);
        let checks: Vec<_> = report.failures.iter().map(|f| f.check.as_str()).collect();
        assert_eq!(checks, vec!["transport service", "target"]);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, VolumeError::Validation { .. }));
        assert!(err.to_string().contains("iscsitarget"));
    }

    #[test]
    fn test_missing_dataset() {
        let config = test_config();
        let client = client_with(|method, p| match method {
            "zfs.dataset.query" => Ok(json!([])),
            other => healthy_handler(other, p),
        });
        let report = Preflight::new(&client, &config).run(1 << 20);
        assert!(report
            .failures
            .iter()
            .any(|f| f.check == "parent dataset" && f.detail.contains("tank/vmdata")));
    }
}

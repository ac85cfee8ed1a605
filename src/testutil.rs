//! Shared mocks for exercising the orchestrator without an appliance or
//! kernel initiator. Test-only.

use crate::config::StorageConfig;
use crate::device::{BlockDevice, DeviceBus};
use crate::error::{VolumeError, VolumeResult};
use crate::session::{Initiator, SessionInfo};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A standard config for tests: iSCSI target, two portals, 128K blocks.
pub fn test_config() -> StorageConfig {
    StorageConfig::parse(
        r#"
[api]
endpoint = "https://nas.example.net/api"
api_key = "1-abcdef"

[api.retry]
max_retries = 0
base_delay_ms = 1
max_delay_ms = 1

[export]
dataset = "tank/vmdata"
target = "iqn.2005-10.org.example:target0"
portal = "10.0.0.5:3260"
extra_portals = ["10.0.1.5:3260"]

[volume]
blocksize = "128K"
device_wait_ms = 500
"#,
    )
    .expect("test config parses")
}

type Handler = Box<dyn Fn(&str, &Value) -> VolumeResult<Value> + Send + Sync>;

/// Scriptable transport: a handler closure plus a call log.
pub struct MockTransport {
    handler: Handler,
    pub calls: Mutex<Vec<(String, Value)>>,
    batch: bool,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&str, &Value) -> VolumeResult<Value> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            batch: false,
        }
    }

    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }
}

impl crate::api::transport::ApiTransport for MockTransport {
    fn call(&self, method: &str, params: &Value) -> VolumeResult<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.handler)(method, params)
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn call_batch(&self, calls: &[(String, Value)]) -> VolumeResult<Vec<Value>> {
        let items: Vec<Value> = calls
            .iter()
            .map(|(m, p)| json!({"method": m, "params": p}))
            .collect();
        self.calls
            .lock()
            .unwrap()
            .push(("core.batch".to_string(), json!(items)));
        let result = (self.handler)("core.batch", &json!(items))?;
        match result {
            Value::Array(values) if values.len() == calls.len() => Ok(values),
            other => Ok(vec![other; calls.len()]),
        }
    }
}

#[derive(Default)]
struct InitiatorState {
    sessions: Vec<SessionInfo>,
    failed_portals: HashSet<String>,
    logins: Vec<String>,
    discovers: Vec<String>,
}

/// Initiator mock with per-portal failure injection.
#[derive(Clone, Default)]
pub struct MockInitiator {
    state: Arc<Mutex<InitiatorState>>,
}

impl MockInitiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, portal: &str, target: &str) {
        self.state.lock().unwrap().sessions.push(SessionInfo {
            portal: portal.to_string(),
            target: target.to_string(),
        });
    }

    pub fn fail_portal(&self, portal: &str) {
        self.state
            .lock()
            .unwrap()
            .failed_portals
            .insert(portal.to_string());
    }

    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }

    pub fn discovers(&self) -> Vec<String> {
        self.state.lock().unwrap().discovers.clone()
    }
}

impl Initiator for MockInitiator {
    fn active_sessions(&self) -> VolumeResult<Vec<SessionInfo>> {
        Ok(self.state.lock().unwrap().sessions.clone())
    }

    fn discover(&self, portal: &str) -> VolumeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failed_portals.contains(portal) {
            return Err(VolumeError::transient("discover", format!("{} unreachable", portal)));
        }
        state.discovers.push(portal.to_string());
        Ok(())
    }

    fn login(&self, portal: &str, target: &str) -> VolumeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failed_portals.contains(portal) {
            return Err(VolumeError::transient("login", format!("{} unreachable", portal)));
        }
        state.logins.push(portal.to_string());
        state.sessions.push(SessionInfo {
            portal: portal.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }
}

struct BusState {
    devices: Mutex<Vec<BlockDevice>>,
    /// (visible starting at list call N, device)
    pending: Mutex<Vec<(u64, BlockDevice)>>,
    lists: AtomicU64,
    rescans: AtomicU64,
}

/// Device bus mock with delayed device appearance.
#[derive(Clone)]
pub struct MockDeviceBus {
    state: Arc<BusState>,
}

impl MockDeviceBus {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self {
            state: Arc::new(BusState {
                devices: Mutex::new(devices),
                pending: Mutex::new(Vec::new()),
                lists: AtomicU64::new(0),
                rescans: AtomicU64::new(0),
            }),
        }
    }

    /// A handle that stays usable after the bus is boxed.
    pub fn handle(&self) -> Self {
        self.clone()
    }

    /// Make `device` visible starting with list call number `after`.
    pub fn appear_after(&self, after: u64, device: BlockDevice) {
        self.state.lock_pending().push((after, device));
    }

    pub fn counts(&self) -> (u64, u64) {
        (
            self.state.lists.load(Ordering::SeqCst),
            self.state.rescans.load(Ordering::SeqCst),
        )
    }

    pub fn add_device(&self, device: BlockDevice) {
        self.state.devices.lock().unwrap().push(device);
    }
}

impl BusState {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<(u64, BlockDevice)>> {
        self.pending.lock().unwrap()
    }
}

impl DeviceBus for MockDeviceBus {
    fn list_devices(&self) -> VolumeResult<Vec<BlockDevice>> {
        let call = self.state.lists.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pending = self.state.lock_pending();
        let mut devices = self.state.devices.lock().unwrap();
        pending.retain(|(after, device)| {
            if call >= *after {
                devices.push(device.clone());
                false
            } else {
                true
            }
        });
        Ok(devices.clone())
    }

    fn rescan(&self) -> VolumeResult<()> {
        self.state.rescans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

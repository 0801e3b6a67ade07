#![allow(dead_code)]

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tunnel_core::tunnel::{
    AdapterError, ControllerPolicy, DeviceData, DeviceState, FailureHook, MonitorEvent,
    MonitorEventSink, Relay, RelayConstraints, RelayEndpoint, RelaySelector, SelectorError,
    SelectorResult, SettingsError, SettingsStore, TunnelAdapter, TunnelConfiguration,
    TunnelController, TunnelMonitor, TunnelSettings,
};

/// Relay number `n`, reachable at 185.213.154.n with gateway 10.64.0.n.
pub fn relay(n: u8) -> SelectorResult {
    SelectorResult {
        relay: Relay {
            hostname: format!("se-got-wg-{:03}", n),
            location: "se-got".to_string(),
        },
        endpoint: RelayEndpoint {
            socket_address: format!("185.213.154.{}:51820", n).parse().unwrap(),
            ipv4_gateway: Ipv4Addr::new(10, 64, 0, n),
            ipv6_gateway: None,
            public_key: format!("relay-key-{}", n),
        },
    }
}

pub fn logged_in_device() -> DeviceState {
    DeviceState::LoggedIn(DeviceData {
        device_id: "device-1".to_string(),
        private_key: "device-key".to_string(),
        ipv4_address: Ipv4Addr::new(10, 139, 12, 4),
        ipv6_address: None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Start(TunnelConfiguration),
    Update(TunnelConfiguration),
    Stop,
}

/// Adapter that records every call.
#[derive(Default)]
pub struct MockAdapter {
    calls: Mutex<Vec<AdapterCall>>,
    /// Fail starts that carry a peer; empty starts always succeed
    pub fail_start: AtomicBool,
    /// Panic on starts that carry a peer
    pub panic_start: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_stop: AtomicBool,
    start_delay: Mutex<Duration>,
    update_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    in_flight_updates: AtomicUsize,
    max_in_flight_updates: AtomicUsize,
}

impl MockAdapter {
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<TunnelConfiguration> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdapterCall::Start(config) => Some(config),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<TunnelConfiguration> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AdapterCall::Update(config) => Some(config),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AdapterCall::Stop))
            .count()
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    pub fn in_flight_updates(&self) -> usize {
        self.in_flight_updates.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_updates(&self) -> usize {
        self.max_in_flight_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelAdapter for MockAdapter {
    async fn start(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        self.calls
            .lock()
            .unwrap()
            .push(AdapterCall::Start(configuration.clone()));

        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        if !configuration.is_empty() && self.panic_start.load(Ordering::SeqCst) {
            panic!("adapter crashed while starting");
        }
        if !configuration.is_empty() && self.fail_start.load(Ordering::SeqCst) {
            return Err(AdapterError::Start("interface unavailable".to_string()));
        }
        Ok(())
    }

    async fn update(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        self.calls
            .lock()
            .unwrap()
            .push(AdapterCall::Update(configuration.clone()));

        let in_flight = self.in_flight_updates.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_updates
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.update_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        self.in_flight_updates.fetch_sub(1, Ordering::SeqCst);

        if self.fail_update.load(Ordering::SeqCst) {
            return Err(AdapterError::Update("peer rejected".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().push(AdapterCall::Stop);

        let delay = *self.stop_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(AdapterError::Stop("interface busy".to_string()));
        }
        Ok(())
    }
}

/// Selector that hands out relays 1, 2, 3, ... in order and records the
/// failure count it was called with.
#[derive(Default)]
pub struct ScriptedSelector {
    pub fail: AtomicBool,
    calls: Mutex<Vec<u32>>,
}

impl ScriptedSelector {
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

impl RelaySelector for ScriptedSelector {
    fn select(
        &self,
        _constraints: &RelayConstraints,
        failed_attempts: u32,
    ) -> Result<SelectorResult, SelectorError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(failed_attempts);

        if self.fail.load(Ordering::SeqCst) {
            return Err(SelectorError::NoMatchingRelay);
        }
        Ok(relay(calls.len() as u8))
    }
}

/// Monitor whose events are emitted by the test.
#[derive(Default)]
pub struct MockMonitor {
    sink: Mutex<Option<MonitorEventSink>>,
    probes: Mutex<Vec<Ipv4Addr>>,
    stops: AtomicUsize,
}

impl MockMonitor {
    /// Deliver `event` to the controller.
    pub fn emit(&self, event: MonitorEvent) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    pub fn probes(&self) -> Vec<Ipv4Addr> {
        self.probes.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl TunnelMonitor for MockMonitor {
    fn start(&self, probe_address: Ipv4Addr) {
        self.probes.lock().unwrap().push(probe_address);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn set_event_sink(&self, sink: MonitorEventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }
}

/// In-memory settings.
pub struct StaticSettings {
    pub settings: Mutex<TunnelSettings>,
    pub device_state: Mutex<DeviceState>,
    pub fail_settings: AtomicBool,
    pub fail_device_state: AtomicBool,
}

impl Default for StaticSettings {
    fn default() -> Self {
        StaticSettings {
            settings: Mutex::new(TunnelSettings::default()),
            device_state: Mutex::new(logged_in_device()),
            fail_settings: AtomicBool::new(false),
            fail_device_state: AtomicBool::new(false),
        }
    }
}

impl SettingsStore for StaticSettings {
    fn read_settings(&self) -> Result<TunnelSettings, SettingsError> {
        if self.fail_settings.load(Ordering::SeqCst) {
            return Err(SettingsError::ReadSettings("settings file is corrupt".to_string()));
        }
        Ok(self.settings.lock().unwrap().clone())
    }

    fn read_device_state(&self) -> Result<DeviceState, SettingsError> {
        if self.fail_device_state.load(Ordering::SeqCst) {
            return Err(SettingsError::ReadDeviceState("keychain locked".to_string()));
        }
        Ok(self.device_state.lock().unwrap().clone())
    }
}

/// Records failure milestones.
#[derive(Default)]
pub struct RecordingHook {
    milestones: Mutex<Vec<u32>>,
}

impl RecordingHook {
    pub fn milestones(&self) -> Vec<u32> {
        self.milestones.lock().unwrap().clone()
    }
}

impl FailureHook for RecordingHook {
    fn on_failure_milestone(&self, failed_attempts: u32) {
        self.milestones.lock().unwrap().push(failed_attempts);
    }
}

/// A controller wired to mocks.
pub struct Harness {
    pub adapter: Arc<MockAdapter>,
    pub selector: Arc<ScriptedSelector>,
    pub monitor: Arc<MockMonitor>,
    pub settings: Arc<StaticSettings>,
    pub hook: Arc<RecordingHook>,
    pub controller: TunnelController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(ControllerPolicy::default())
    }

    pub fn with_policy(policy: ControllerPolicy) -> Self {
        let adapter = Arc::new(MockAdapter::default());
        let selector = Arc::new(ScriptedSelector::default());
        let monitor = Arc::new(MockMonitor::default());
        let settings = Arc::new(StaticSettings::default());
        let hook = Arc::new(RecordingHook::default());

        let controller = TunnelController::builder(
            adapter.clone(),
            selector.clone(),
            monitor.clone(),
            settings.clone(),
        )
        .policy(policy)
        .failure_hook(hook.clone())
        .build();

        Harness {
            adapter,
            selector,
            monitor,
            settings,
            hook,
            controller,
        }
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}

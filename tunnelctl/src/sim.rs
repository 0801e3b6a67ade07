//! In-process collaborators for dry runs.
//!
//! Nothing here touches the network or any interface; every call is logged so
//! a scenario can be followed in the output.

use async_trait::async_trait;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use tunnel_core::config::Config;
use tunnel_core::tunnel::{
    AdapterError, ControllerSnapshot, DeviceState, FailureHook, MonitorEvent, MonitorEventSink,
    NextRelay, RelayConstraints, RelaySelector, SelectorError, SelectorResult, SettingsError,
    SettingsStore, StateChange, TunnelAdapter, TunnelConfiguration, TunnelController,
    TunnelMonitor, TunnelSettings,
};

use crate::OutputFormat;
use crate::scenario::{Scenario, ScenarioError, Step};

/// Time given to the controller to drain events after each scripted step.
const SETTLE_TIME: Duration = Duration::from_millis(20);

/// Adapter that only logs what it would do.
pub struct SimAdapter {
    latency: Duration,
    fail_start: bool,
    fail_update: AtomicBool,
    fail_stop: bool,
}

impl SimAdapter {
    pub fn new(scenario: &Scenario) -> Self {
        SimAdapter {
            latency: Duration::from_millis(scenario.faults.adapter_latency_ms),
            fail_start: scenario.faults.fail_start,
            fail_update: AtomicBool::new(scenario.faults.fail_update),
            fail_stop: scenario.faults.fail_stop,
        }
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl TunnelAdapter for SimAdapter {
    async fn start(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        if configuration.is_empty() {
            info!("adapter: started empty tunnel, blocking all traffic");
            return Ok(());
        }
        if self.fail_start {
            return Err(AdapterError::Start("simulated start failure".to_string()));
        }
        info!(
            endpoint = ?configuration.peer_endpoint(),
            dns = ?configuration.dns_servers,
            "adapter: started tunnel"
        );
        Ok(())
    }

    async fn update(&self, configuration: &TunnelConfiguration) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(AdapterError::Update("simulated update failure".to_string()));
        }
        info!(endpoint = ?configuration.peer_endpoint(), "adapter: updated tunnel");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.simulate_latency().await;
        if self.fail_stop {
            return Err(AdapterError::Stop("simulated stop failure".to_string()));
        }
        info!("adapter: stopped tunnel");
        Ok(())
    }
}

/// Picks among the scenario relays, moving one relay further along the list
/// with every failed attempt.
pub struct RotatingSelector {
    relays: Vec<SelectorResult>,
}

impl RotatingSelector {
    pub fn new(relays: Vec<SelectorResult>) -> Self {
        RotatingSelector { relays }
    }
}

impl RelaySelector for RotatingSelector {
    fn select(
        &self,
        constraints: &RelayConstraints,
        failed_attempts: u32,
    ) -> Result<SelectorResult, SelectorError> {
        let candidates: Vec<&SelectorResult> = self
            .relays
            .iter()
            .filter(|r| {
                constraints
                    .location
                    .as_ref()
                    .is_none_or(|location| r.relay.location.starts_with(location.as_str()))
            })
            .filter(|r| {
                constraints
                    .port
                    .is_none_or(|port| r.endpoint.socket_address.port() == port)
            })
            .collect();

        if candidates.is_empty() {
            return Err(SelectorError::NoMatchingRelay);
        }
        let pick = candidates[failed_attempts as usize % candidates.len()];
        debug!(relay = %pick, failed_attempts, "selector: picked relay");
        Ok(pick.clone())
    }
}

/// Monitor driven by the scenario script.
#[derive(Default)]
pub struct ScriptedMonitor {
    sink: Mutex<Option<MonitorEventSink>>,
    probing: Mutex<Option<Ipv4Addr>>,
}

impl ScriptedMonitor {
    pub fn emit(&self, event: MonitorEvent) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = sink.as_ref().is_some_and(|sink| sink.send(event));
        if !delivered {
            debug!(?event, "monitor: controller no longer listening");
        }
    }
}

impl TunnelMonitor for ScriptedMonitor {
    fn start(&self, probe_address: Ipv4Addr) {
        info!(%probe_address, "monitor: probing");
        *self.probing.lock().unwrap_or_else(PoisonError::into_inner) = Some(probe_address);
    }

    fn stop(&self) {
        let previous = self
            .probing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("monitor: stopped");
        }
    }

    fn set_event_sink(&self, sink: MonitorEventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }
}

/// Settings read from the scenario.
pub struct ScenarioSettings {
    settings: TunnelSettings,
    device_state: DeviceState,
}

impl ScenarioSettings {
    pub fn new(scenario: &Scenario) -> Self {
        let device_state = if scenario.device.logged_out {
            DeviceState::LoggedOut
        } else {
            DeviceState::LoggedIn(scenario.device.device_data())
        };
        ScenarioSettings {
            settings: scenario.tunnel_settings(),
            device_state,
        }
    }
}

impl SettingsStore for ScenarioSettings {
    fn read_settings(&self) -> Result<TunnelSettings, SettingsError> {
        Ok(self.settings.clone())
    }

    fn read_device_state(&self) -> Result<DeviceState, SettingsError> {
        Ok(self.device_state.clone())
    }
}

/// Logs failure milestones.
pub struct LoggingHook;

impl FailureHook for LoggingHook {
    fn on_failure_milestone(&self, failed_attempts: u32) {
        warn!(failed_attempts, "Repeated connection losses");
    }
}

#[derive(Debug, Serialize)]
struct TransitionRecord {
    from: &'static str,
    to: String,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub state: String,
    pub relay: Option<String>,
    pub failed_attempts: u32,
    pub is_network_reachable: bool,
    pub is_reasserting: bool,
    pub transitions: usize,
}

impl SessionSummary {
    fn new(snapshot: ControllerSnapshot, transitions: usize) -> Self {
        SessionSummary {
            state: snapshot.state.to_string(),
            relay: snapshot.selector_result.map(|r| r.to_string()),
            failed_attempts: snapshot.failed_attempts,
            is_network_reachable: snapshot.is_network_reachable,
            is_reasserting: snapshot.is_reasserting,
            transitions,
        }
    }
}

/// Run `scenario` against a controller wired to simulated collaborators.
pub async fn run(
    config: &Config,
    scenario: &Scenario,
    output: OutputFormat,
) -> Result<SessionSummary, ScenarioError> {
    let adapter = Arc::new(SimAdapter::new(scenario));
    let monitor = Arc::new(ScriptedMonitor::default());
    let relays = scenario.relays.iter().map(|r| r.selector_result()).collect();

    let controller = TunnelController::builder(
        adapter.clone(),
        Arc::new(RotatingSelector::new(relays)),
        monitor.clone(),
        Arc::new(ScenarioSettings::new(scenario)),
    )
    .policy(config.controller.policy())
    .failure_hook(Arc::new(LoggingHook))
    .build();

    let mut changes = controller.subscribe();
    let mut transitions = 0;

    if let Err(e) = controller.start(scenario.start_options()?).await {
        warn!(error = %e, "Start failed, continuing with the fallback tunnel");
    }
    transitions += print_changes(&mut changes, output);

    let mut stopped = false;
    for step in &scenario.steps {
        debug!(?step, "Running scenario step");
        match step {
            Step::Established => monitor.emit(MonitorEvent::ConnectionEstablished),
            Step::Lost => monitor.emit(MonitorEvent::ConnectionLost),
            Step::Reachability { reachable } => {
                monitor.emit(MonitorEvent::ReachabilityChanged(*reachable))
            }
            Step::Reconnect { relay } => {
                let next_relay = match relay {
                    Some(hostname) => NextRelay::Fixed(scenario.find_relay(hostname)?),
                    None => NextRelay::Automatic,
                };
                if let Err(e) = controller.reconnect(next_relay).await {
                    warn!(error = %e, "Reconnect failed");
                }
            }
            Step::FailUpdates { fail } => adapter.set_fail_update(*fail),
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Step::Stop => {
                stop(&controller).await;
                stopped = true;
            }
        }
        tokio::time::sleep(SETTLE_TIME).await;
        transitions += print_changes(&mut changes, output);
    }

    if !stopped {
        stop(&controller).await;
        transitions += print_changes(&mut changes, output);
    }

    Ok(SessionSummary::new(controller.snapshot(), transitions))
}

async fn stop(controller: &TunnelController) {
    if let Err(e) = controller.stop().await {
        warn!(error = %e, "Stop reported an error");
    }
}

/// Print queued state changes and return how many there were.
fn print_changes(changes: &mut broadcast::Receiver<StateChange>, output: OutputFormat) -> usize {
    let mut printed = 0;
    loop {
        match changes.try_recv() {
            Ok(change) => {
                print_change(&change, output);
                printed += 1;
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped state changes");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return printed,
        }
    }
}

fn print_change(change: &StateChange, output: OutputFormat) {
    match output {
        OutputFormat::Table => println!("{:<14} -> {}", change.from.name(), change.to),
        OutputFormat::Json => {
            let record = TransitionRecord {
                from: change.from.name(),
                to: change.to.to_string(),
            };
            match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to encode state change"),
            }
        }
    }
}

//! Packet tunnel lifecycle controller.
//!
//! The controller is the single owner of the tunnel state. All state lives in
//! [`ControllerCore`] behind a mutex that is never held across an `.await`;
//! long-running work (adapter calls) runs in cancellable background tasks that
//! re-check the state after every suspension point.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::tunnel::configuration::{ResolvedConfiguration, TunnelConfiguration};
use crate::tunnel::error::{ControllerError, ControllerResult};
use crate::tunnel::interfaces::{
    FailureHook, MonitorEventSink, NoopFailureHook, RelaySelector, SettingsStore, TunnelAdapter,
    TunnelMonitor,
};
use crate::tunnel::options::StartOptions;
use crate::tunnel::state::{ErrorContext, StateChange, TunnelState};
use crate::tunnel::task::{TaskHandle, checkpoint};
use crate::tunnel::types::{MonitorEvent, NextRelay, SelectorResult};

/// Capacity of the state change broadcast channel.
const STATE_CHANGE_CAPACITY: usize = 64;

/// Runtime policy knobs for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPolicy {
    /// Invoke the failure hook every this many connection losses; 0 disables
    pub failure_hook_interval: u32,
    /// Enter the error state after this many consecutive failed reconnects
    pub reconnect_escalation_threshold: Option<u32>,
    /// How long `stop` waits for a cancelled task before aborting it
    pub task_join_timeout: Duration,
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        ControllerPolicy {
            failure_hook_interval: 2,
            reconnect_escalation_threshold: None,
            task_join_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of the controller for observers.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub state: TunnelState,
    pub selector_result: Option<SelectorResult>,
    pub failed_attempts: u32,
    pub is_network_reachable: bool,
    pub is_reasserting: bool,
}

/// State owned exclusively by the controller.
struct ControllerCore {
    state: TunnelState,
    selector_result: Option<SelectorResult>,
    failed_attempts: u32,
    consecutive_reconnect_failures: u32,
    is_network_reachable: bool,
    is_reasserting: bool,
    start_task: Option<TaskHandle>,
    reconnect_task: Option<TaskHandle>,
    monitor_task: Option<TaskHandle>,
    /// Teardown started by the first accepted `stop`
    stop_task: Option<TaskHandle>,
    /// Taken by the monitor task when it is spawned
    events: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
}

struct Inner {
    adapter: Arc<dyn TunnelAdapter>,
    selector: Arc<dyn RelaySelector>,
    monitor: Arc<dyn TunnelMonitor>,
    settings: Arc<dyn SettingsStore>,
    failure_hook: Arc<dyn FailureHook>,
    policy: ControllerPolicy,
    core: Mutex<ControllerCore>,
    changes: broadcast::Sender<StateChange>,
}

/// Builder for [`TunnelController`].
pub struct TunnelControllerBuilder {
    adapter: Arc<dyn TunnelAdapter>,
    selector: Arc<dyn RelaySelector>,
    monitor: Arc<dyn TunnelMonitor>,
    settings: Arc<dyn SettingsStore>,
    failure_hook: Arc<dyn FailureHook>,
    policy: ControllerPolicy,
}

impl TunnelControllerBuilder {
    pub fn policy(mut self, policy: ControllerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn failure_hook(mut self, failure_hook: Arc<dyn FailureHook>) -> Self {
        self.failure_hook = failure_hook;
        self
    }

    /// Build the controller and register its event sink with the monitor.
    pub fn build(self) -> TunnelController {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);

        self.monitor
            .set_event_sink(MonitorEventSink::new(events_tx));

        let core = ControllerCore {
            state: TunnelState::Initial,
            selector_result: None,
            failed_attempts: 0,
            consecutive_reconnect_failures: 0,
            is_network_reachable: true,
            is_reasserting: false,
            start_task: None,
            reconnect_task: None,
            monitor_task: None,
            stop_task: None,
            events: Some(events_rx),
        };

        TunnelController {
            inner: Arc::new(Inner {
                adapter: self.adapter,
                selector: self.selector,
                monitor: self.monitor,
                settings: self.settings,
                failure_hook: self.failure_hook,
                policy: self.policy,
                core: Mutex::new(core),
                changes,
            }),
        }
    }
}

/// Drives the packet tunnel through its lifecycle.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    pub fn builder(
        adapter: Arc<dyn TunnelAdapter>,
        selector: Arc<dyn RelaySelector>,
        monitor: Arc<dyn TunnelMonitor>,
        settings: Arc<dyn SettingsStore>,
    ) -> TunnelControllerBuilder {
        TunnelControllerBuilder {
            adapter,
            selector,
            monitor,
            settings,
            failure_hook: Arc::new(NoopFailureHook),
            policy: ControllerPolicy::default(),
        }
    }

    /// Start the tunnel.
    ///
    /// Does nothing unless the controller is in its initial state. Waits until
    /// the tunnel is up or startup failed. On failure the controller is left
    /// in the error state with an empty tunnel blocking traffic, and the
    /// original failure is returned.
    pub async fn start(&self, options: impl Into<StartOptions>) -> ControllerResult<()> {
        let handle = {
            let mut core = self.inner.lock();
            if !matches!(core.state, TunnelState::Initial) {
                debug!(state = core.state.name(), "Ignoring start request");
                return Ok(());
            }
            self.inner.transition(&mut core, TunnelState::Starting);

            let options = options.into();
            info!(
                launch_source = %options.launch_source,
                preselected_relay = ?options.preselected_relay.as_ref().map(|r| &r.relay.hostname),
                "Starting tunnel"
            );

            let inner = Arc::clone(&self.inner);
            let handle = TaskHandle::spawn("start", move |token| inner.run_start(options, token));
            core.start_task = Some(handle.clone());
            handle
        };

        let error = match handle.join().await.into_result() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if let ControllerError::StartFailed(cause) = error.as_ref() {
            return Err(ControllerError::StartFailed(Arc::clone(cause)));
        }

        // The start task died without running its own failure path
        error!(error = %error, "Start task terminated abnormally");
        self.inner.fail_start(Arc::clone(&error)).await;
        Err(ControllerError::StartFailed(error))
    }

    /// Stop the tunnel.
    ///
    /// Cancels all background work, waits for it to wind down and stops the
    /// adapter. The controller reaches `Stopped` even if the adapter fails to
    /// stop; that failure is returned afterwards.
    ///
    /// Teardown runs in its own task, so it completes even if the returned
    /// future is dropped. Calling `stop` again while stopping waits for the
    /// same teardown.
    pub async fn stop(&self) -> ControllerResult<()> {
        let handle = {
            let mut core = self.inner.lock();
            if self.inner.transition(&mut core, TunnelState::Stopping) {
                self.inner.monitor.stop();
                core.is_reasserting = false;

                let tasks: Vec<TaskHandle> = [
                    core.start_task.take(),
                    core.reconnect_task.take(),
                    core.monitor_task.take(),
                ]
                .into_iter()
                .flatten()
                .collect();

                let inner = Arc::clone(&self.inner);
                let handle = TaskHandle::spawn("stop", move |_token| inner.run_stop(tasks));
                core.stop_task = Some(handle.clone());
                handle
            } else {
                match (&core.state, &core.stop_task) {
                    (TunnelState::Stopping, Some(stop_task)) => stop_task.clone(),
                    _ => {
                        debug!(state = core.state.name(), "Ignoring stop request");
                        return Ok(());
                    }
                }
            }
        };

        handle
            .join()
            .await
            .into_result()
            .map_err(|e| e.as_ref().clone())
    }

    /// Reconnect the tunnel to `next_relay`, restarting connectivity
    /// monitoring against the new relay.
    ///
    /// Failures are logged and the current tunnel is kept.
    pub async fn reconnect(&self, next_relay: NextRelay) -> ControllerResult<()> {
        Arc::clone(&self.inner)
            .reconnect_tunnel(next_relay, true)
            .await
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.inner.lock().state.clone()
    }

    /// Relay the tunnel is currently configured for.
    pub fn selector_result(&self) -> Option<SelectorResult> {
        self.inner.lock().selector_result.clone()
    }

    /// Number of connection losses observed so far.
    pub fn failed_attempts(&self) -> u32 {
        self.inner.lock().failed_attempts
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let core = self.inner.lock();
        ControllerSnapshot {
            state: core.state.clone(),
            selector_result: core.selector_result.clone(),
            failed_attempts: core.failed_attempts,
            is_network_reachable: core.is_network_reachable,
            is_reasserting: core.is_reasserting,
        }
    }

    /// Subscribe to accepted state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ControllerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the state machine allows it. Returns false and leaves
    /// the state untouched otherwise.
    fn transition(&self, core: &mut ControllerCore, next: TunnelState) -> bool {
        if !core.state.can_transition(&next) {
            trace!(from = core.state.name(), to = next.name(), "Rejected state transition");
            return false;
        }

        let from = std::mem::replace(&mut core.state, next.clone());
        debug!(from = from.name(), to = %next, "State transition");
        // No receivers is fine
        let _ = self.changes.send(StateChange { from, to: next });
        true
    }

    fn make_configuration(&self, next_relay: NextRelay) -> ControllerResult<ResolvedConfiguration> {
        let tunnel_settings = self.settings.read_settings()?;
        let device_state = self.settings.read_device_state()?;

        let selector_result = match next_relay {
            NextRelay::Automatic => {
                let failed_attempts = self.lock().failed_attempts;
                self.selector
                    .select(&tunnel_settings.relay_constraints, failed_attempts)?
            }
            NextRelay::Fixed(selector_result) => selector_result,
        };

        Ok(ResolvedConfiguration {
            device_state,
            tunnel_settings,
            selector_result,
        })
    }

    /// Spawn the monitor event consumer unless it already runs.
    fn ensure_monitoring(self: &Arc<Self>, core: &mut ControllerCore) {
        if core.monitor_task.is_some() {
            return;
        }
        let Some(events) = core.events.take() else {
            return;
        };

        let inner = Arc::downgrade(self);
        core.monitor_task = Some(TaskHandle::spawn("monitor", move |token| {
            run_monitor(inner, events, token)
        }));
    }

    // Start

    async fn run_start(
        self: Arc<Self>,
        options: StartOptions,
        token: CancellationToken,
    ) -> ControllerResult<()> {
        let error = match self.start_tunnel(&options, &token).await {
            Ok(()) => return Ok(()),
            Err(ControllerError::Cancelled) => return Err(ControllerError::Cancelled),
            Err(e) => e,
        };

        checkpoint(&token)?;

        error!(error = %error, "Failed to start the tunnel");
        let error = Arc::new(error);
        self.fail_start(Arc::clone(&error)).await;

        Err(ControllerError::StartFailed(error))
    }

    /// Enter the error state and block traffic with an empty tunnel. Does
    /// nothing if the state has already moved on, e.g. to `Stopping`.
    async fn fail_start(&self, error: Arc<ControllerError>) {
        let entered_error_state = {
            let mut core = self.lock();
            let previous_state = core.state.clone();
            self.transition(
                &mut core,
                TunnelState::Error(ErrorContext::new(previous_state, error)),
            )
        };

        if entered_error_state {
            self.start_empty_tunnel().await;
        }
    }

    async fn start_tunnel(
        self: &Arc<Self>,
        options: &StartOptions,
        token: &CancellationToken,
    ) -> ControllerResult<()> {
        let configuration = self.make_configuration(options.next_relay())?;
        let tunnel_configuration = configuration.tunnel_configuration()?;

        checkpoint(token)?;
        self.adapter.start(&tunnel_configuration).await?;
        checkpoint(token)?;

        let mut core = self.lock();
        if core.state.is_shutting_down() {
            return Err(ControllerError::Cancelled);
        }

        info!(relay = %configuration.selector_result, "Tunnel adapter started");
        let probe_address = configuration.selector_result.endpoint.ipv4_gateway;
        core.selector_result = Some(configuration.selector_result);

        self.monitor.start(probe_address);
        self.ensure_monitoring(&mut core);
        Ok(())
    }

    /// Bring up a tunnel without peers so traffic is blocked instead of
    /// leaking. Failure is logged only.
    async fn start_empty_tunnel(&self) {
        debug!("Starting an empty tunnel");

        if let Err(e) = self.adapter.start(&TunnelConfiguration::empty()).await {
            warn!(error = %e, "Failed to start an empty tunnel");
        }
    }

    // Stop

    async fn run_stop(self: Arc<Self>, tasks: Vec<TaskHandle>) -> ControllerResult<()> {
        let _stopped = StoppedOnDrop(self.as_ref());

        for task in &tasks {
            task.cancel();
        }
        for task in &tasks {
            // Cancellation is expected here
            let _ = task.join_within(self.policy.task_join_timeout).await;
        }

        let result = self.adapter.stop().await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to stop the tunnel adapter");
        }
        result.map_err(ControllerError::from)
    }

    // Reconnect

    async fn reconnect_tunnel(
        self: Arc<Self>,
        next_relay: NextRelay,
        restart_monitor: bool,
    ) -> ControllerResult<()> {
        let handle = {
            let mut core = self.lock();
            let allowed = matches!(core.state, TunnelState::Started | TunnelState::Reconnecting)
                || core.state.can_transition(&TunnelState::Reconnecting);
            if !allowed {
                debug!(state = core.state.name(), "Ignoring reconnect request");
                return Ok(());
            }
            if !core.state.is_reconnecting() {
                self.transition(&mut core, TunnelState::Reconnecting);
            }

            // Cancel the previous attempt; the new one waits for it to finish
            let previous = core.reconnect_task.take();
            if let Some(previous) = &previous {
                previous.cancel();
            }

            let inner = Arc::clone(&self);
            let handle = TaskHandle::spawn("reconnect", move |token| async move {
                if let Some(previous) = previous {
                    let _ = previous.join().await;
                }
                inner.run_reconnect(next_relay, restart_monitor, token).await
            });
            core.reconnect_task = Some(handle.clone());
            handle
        };

        handle.join().await.into_result().map_err(|e| {
            error!(error = %e, "Reconnect task terminated abnormally");
            ControllerError::TaskPanicked(e.to_string())
        })
    }

    async fn run_reconnect(
        self: &Arc<Self>,
        next_relay: NextRelay,
        restart_monitor: bool,
        token: CancellationToken,
    ) -> ControllerResult<()> {
        checkpoint(&token)?;

        {
            let mut core = self.lock();
            if !accepts_reconnect(&core.state) {
                return Ok(());
            }
            if restart_monitor {
                self.monitor.stop();
            }
            if core.selector_result.is_some() {
                core.is_reasserting = true;
            }
        }

        let result = self.reconfigure(next_relay, &token).await;
        checkpoint(&token)?;

        let mut core = self.lock();
        if !accepts_reconnect(&core.state) {
            debug!(state = core.state.name(), "State changed while reconnecting");
            return Ok(());
        }

        match result {
            Ok(configuration) => {
                info!(relay = %configuration.selector_result, "Set tunnel relay");
                let probe_address: Ipv4Addr = configuration.selector_result.endpoint.ipv4_gateway;
                core.selector_result = Some(configuration.selector_result);
                core.consecutive_reconnect_failures = 0;

                self.monitor.start(probe_address);
                self.ensure_monitoring(&mut core);
                Ok(())
            }
            Err(ControllerError::Cancelled) => Err(ControllerError::Cancelled),
            Err(e) => {
                error!(error = %e, "Failed to reconnect the tunnel");
                core.is_reasserting = false;
                core.consecutive_reconnect_failures =
                    core.consecutive_reconnect_failures.saturating_add(1);

                let escalate = self
                    .policy
                    .reconnect_escalation_threshold
                    .is_some_and(|threshold| core.consecutive_reconnect_failures >= threshold);
                if escalate {
                    warn!(
                        attempts = core.consecutive_reconnect_failures,
                        "Giving up on reconnecting"
                    );
                    let previous_state = core.state.clone();
                    self.transition(
                        &mut core,
                        TunnelState::Error(ErrorContext::new(previous_state, Arc::new(e))),
                    );
                }
                Ok(())
            }
        }
    }

    async fn reconfigure(
        &self,
        next_relay: NextRelay,
        token: &CancellationToken,
    ) -> ControllerResult<ResolvedConfiguration> {
        let configuration = self.make_configuration(next_relay)?;
        let tunnel_configuration = configuration.tunnel_configuration()?;

        checkpoint(token)?;
        self.adapter.update(&tunnel_configuration).await?;
        Ok(configuration)
    }

    // Monitor events

    async fn handle_monitor_event(self: &Arc<Self>, event: MonitorEvent) {
        match event {
            MonitorEvent::ConnectionEstablished => self.on_connection_established(),
            MonitorEvent::ConnectionLost => self.on_connection_lost().await,
            MonitorEvent::ReachabilityChanged(is_reachable) => {
                debug!(is_reachable, "Network reachability changed");
                self.lock().is_network_reachable = is_reachable;
            }
        }
    }

    fn on_connection_established(&self) {
        let mut core = self.lock();
        if core.state.is_shutting_down() {
            return;
        }

        debug!("Connection established");
        if matches!(core.state, TunnelState::Starting | TunnelState::Reconnecting) {
            self.transition(&mut core, TunnelState::Started);
        }
        core.is_reasserting = false;
    }

    async fn on_connection_lost(self: &Arc<Self>) {
        let failed_attempts = {
            let mut core = self.lock();
            if core.state.is_shutting_down() {
                return;
            }
            core.failed_attempts = core.failed_attempts.checked_add(1).unwrap_or(0);
            core.failed_attempts
        };

        let interval = self.policy.failure_hook_interval;
        if interval > 0 && failed_attempts % interval == 0 {
            self.failure_hook.on_failure_milestone(failed_attempts);
        }

        debug!(failed_attempts, "Connection lost, picking next relay");

        if let Err(e) = Arc::clone(self)
            .reconnect_tunnel(NextRelay::Automatic, false)
            .await
        {
            warn!(error = %e, "Connection recovery failed");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [&core.start_task, &core.reconnect_task, &core.monitor_task]
            .into_iter()
            .flatten()
        {
            task.cancel();
        }
    }
}

/// States in which a finished reconnect attempt may still be applied.
fn accepts_reconnect(state: &TunnelState) -> bool {
    matches!(state, TunnelState::Reconnecting | TunnelState::Started)
}

/// Drain monitor events one at a time until cancelled.
///
/// Holds only a weak reference so an abandoned controller can be dropped.
async fn run_monitor(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
    token: CancellationToken,
) -> ControllerResult<()> {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ControllerError::Cancelled),
            event = events.recv() => event,
        };

        let Some(event) = event else {
            debug!("Monitor event stream closed");
            return Ok(());
        };
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };

        trace!(?event, "Handling monitor event");
        inner.handle_monitor_event(event).await;
        drop(inner);

        checkpoint(&token)?;
    }
}

/// Moves the controller to `Stopped` when dropped.
struct StoppedOnDrop<'a>(&'a Inner);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        let mut core = self.0.lock();
        if self.0.transition(&mut core, TunnelState::Stopped) {
            info!("Tunnel stopped");
        }
    }
}

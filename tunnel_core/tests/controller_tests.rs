mod common;

use common::{Harness, relay, wait_for};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tunnel_core::tunnel::{
    AdapterError, ControllerError, ControllerPolicy, DeviceState, LaunchSource, MonitorEvent,
    NextRelay, RawStartOptions, SelectorError, SettingsError, StartOptions, TunnelState,
};

fn app_launch() -> StartOptions {
    StartOptions::new(LaunchSource::App)
}

fn is_started(h: &Harness) -> bool {
    matches!(h.controller.state(), TunnelState::Started)
}

/// Start the tunnel and confirm connectivity.
async fn started(policy: ControllerPolicy) -> Harness {
    let h = Harness::with_policy(policy);
    h.controller.start(app_launch()).await.unwrap();
    assert!(h.monitor.emit(MonitorEvent::ConnectionEstablished));
    wait_for(|| is_started(&h)).await;
    h
}

fn short_join_timeout() -> ControllerPolicy {
    ControllerPolicy {
        task_join_timeout: Duration::from_millis(100),
        ..ControllerPolicy::default()
    }
}

#[tokio::test]
async fn test_start_reaches_started_after_connection_established() {
    let h = Harness::new();

    h.controller.start(app_launch()).await.unwrap();
    assert!(matches!(h.controller.state(), TunnelState::Starting));

    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 1);
    assert_eq!(
        starts[0].peer_endpoint(),
        Some(relay(1).endpoint.socket_address)
    );
    assert_eq!(h.selector.calls(), vec![0]);
    assert_eq!(h.monitor.probes(), vec![relay(1).endpoint.ipv4_gateway]);
    assert_eq!(h.controller.selector_result(), Some(relay(1)));

    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;
    assert_eq!(h.controller.failed_attempts(), 0);
}

#[tokio::test]
async fn test_start_with_preselected_relay_skips_selector() {
    let h = Harness::new();
    let raw = RawStartOptions::new()
        .with_selector_result(&relay(7))
        .unwrap();

    h.controller.start(&raw).await.unwrap();

    assert!(h.selector.calls().is_empty());
    assert_eq!(
        h.adapter.starts()[0].peer_endpoint(),
        Some(relay(7).endpoint.socket_address)
    );
    assert_eq!(h.controller.selector_result(), Some(relay(7)));
}

#[tokio::test]
async fn test_connection_lost_reconnects_to_next_relay() {
    let h = started(ControllerPolicy::default()).await;

    h.monitor.emit(MonitorEvent::ConnectionLost);
    wait_for(|| h.monitor.probes().len() == 2).await;

    assert_eq!(h.controller.failed_attempts(), 1);
    assert_eq!(h.selector.calls(), vec![0, 1]);
    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));

    let updates = h.adapter.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].peer_endpoint(),
        Some(relay(2).endpoint.socket_address)
    );
    assert_eq!(h.monitor.probes()[1], relay(2).endpoint.ipv4_gateway);
    assert_eq!(h.controller.selector_result(), Some(relay(2)));
    // Loss-triggered recovery keeps the monitor running
    assert_eq!(h.monitor.stop_count(), 0);

    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;

    // Not reset by a successful connection
    assert_eq!(h.controller.failed_attempts(), 1);

    h.monitor.emit(MonitorEvent::ConnectionLost);
    wait_for(|| h.selector.calls().len() == 3).await;
    assert_eq!(h.selector.calls(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_no_matching_relay_enters_error_with_empty_tunnel() {
    let h = Harness::new();
    h.selector.fail.store(true, Ordering::SeqCst);

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::Selector(SelectorError::NoMatchingRelay))
    ));

    match h.controller.state() {
        TunnelState::Error(context) => {
            assert!(matches!(*context.previous_state, TunnelState::Starting));
            assert!(matches!(
                *context.error,
                ControllerError::Selector(SelectorError::NoMatchingRelay)
            ));
        }
        other => panic!("unexpected state: {}", other),
    }

    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].is_empty());
    assert!(h.monitor.probes().is_empty());
}

#[tokio::test]
async fn test_adapter_start_failure_falls_back_to_empty_tunnel() {
    let h = Harness::new();
    h.adapter.fail_start.store(true, Ordering::SeqCst);

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::Adapter(AdapterError::Start(_)))
    ));
    assert!(h.controller.state().is_error());

    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 2);
    assert!(!starts[0].is_empty());
    assert!(starts[1].is_empty());
}

#[tokio::test]
async fn test_logged_out_device_fails_to_start() {
    let h = Harness::new();
    *h.settings.device_state.lock().unwrap() = DeviceState::LoggedOut;

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::Settings(SettingsError::DeviceNotLoggedIn))
    ));
    assert!(h.controller.state().is_error());
}

#[tokio::test]
async fn test_start_is_ignored_unless_initial() {
    let h = started(ControllerPolicy::default()).await;

    h.controller.start(app_launch()).await.unwrap();

    assert_eq!(h.adapter.starts().len(), 1);
    assert!(is_started(&h));
}

#[tokio::test]
async fn test_stop_from_initial_is_ignored() {
    let h = Harness::new();

    h.controller.stop().await.unwrap();

    assert!(matches!(h.controller.state(), TunnelState::Initial));
    assert_eq!(h.adapter.stop_count(), 0);
}

#[tokio::test]
async fn test_stop_is_terminal() {
    let h = started(ControllerPolicy::default()).await;

    h.controller.stop().await.unwrap();
    assert!(matches!(h.controller.state(), TunnelState::Stopped));
    assert_eq!(h.adapter.stop_count(), 1);
    assert!(h.monitor.stop_count() >= 1);

    // Nothing moves the controller out of Stopped
    h.controller.stop().await.unwrap();
    h.controller.start(app_launch()).await.unwrap();
    h.controller.reconnect(NextRelay::Automatic).await.unwrap();
    h.monitor.emit(MonitorEvent::ConnectionLost);
    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(h.controller.state(), TunnelState::Stopped));
    assert_eq!(h.adapter.stop_count(), 1);
    assert_eq!(h.adapter.starts().len(), 1);
    assert!(h.adapter.updates().is_empty());
    assert_eq!(h.selector.calls(), vec![0]);
}

#[tokio::test]
async fn test_stop_during_reconnect_stops_adapter_once() {
    let h = started(short_join_timeout()).await;
    h.adapter.set_update_delay(Duration::from_secs(30));

    let controller = h.controller.clone();
    let reconnect =
        tokio::spawn(async move { controller.reconnect(NextRelay::Automatic).await });
    wait_for(|| h.adapter.in_flight_updates() == 1).await;

    h.controller.stop().await.unwrap();

    assert!(matches!(h.controller.state(), TunnelState::Stopped));
    assert_eq!(h.adapter.stop_count(), 1);
    assert!(reconnect.await.unwrap().is_ok());
    // The interrupted relay change was never applied
    assert_eq!(h.controller.selector_result(), Some(relay(1)));
}

#[tokio::test]
async fn test_stop_during_start_cancels_startup() {
    let h = Harness::with_policy(short_join_timeout());
    h.adapter.set_start_delay(Duration::from_secs(30));

    let controller = h.controller.clone();
    let start = tokio::spawn(async move { controller.start(app_launch()).await });
    wait_for(|| h.adapter.starts().len() == 1).await;

    h.controller.stop().await.unwrap();

    assert!(start.await.unwrap().is_ok());
    assert!(matches!(h.controller.state(), TunnelState::Stopped));
    assert_eq!(h.adapter.starts().len(), 1);
    assert_eq!(h.adapter.stop_count(), 1);
    assert!(h.controller.selector_result().is_none());
}

#[tokio::test]
async fn test_adapter_stop_failure_still_reaches_stopped() {
    let h = started(ControllerPolicy::default()).await;
    h.adapter.fail_stop.store(true, Ordering::SeqCst);

    let err = h.controller.stop().await.unwrap_err();

    assert!(matches!(err, ControllerError::Adapter(AdapterError::Stop(_))));
    assert!(matches!(h.controller.state(), TunnelState::Stopped));
}

#[tokio::test]
async fn test_abandoned_stop_still_reaches_stopped() {
    let h = started(short_join_timeout()).await;
    h.adapter.set_update_delay(Duration::from_secs(30));

    let controller = h.controller.clone();
    let reconnect =
        tokio::spawn(async move { controller.reconnect(NextRelay::Automatic).await });
    wait_for(|| h.adapter.in_flight_updates() == 1).await;

    // Dropped while the stuck reconnect is still being joined
    let result = tokio::time::timeout(Duration::from_millis(20), h.controller.stop()).await;
    assert!(result.is_err());
    assert!(matches!(h.controller.state(), TunnelState::Stopping));

    // A second stop waits for the teardown already in progress
    h.controller.stop().await.unwrap();

    assert!(matches!(h.controller.state(), TunnelState::Stopped));
    assert_eq!(h.adapter.stop_count(), 1);
    assert!(reconnect.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_dropped_stop_future_still_stops_adapter() {
    let h = started(ControllerPolicy::default()).await;
    h.adapter.set_stop_delay(Duration::from_millis(100));

    let result = tokio::time::timeout(Duration::from_millis(20), h.controller.stop()).await;
    assert!(result.is_err());

    wait_for(|| matches!(h.controller.state(), TunnelState::Stopped)).await;
    assert_eq!(h.adapter.stop_count(), 1);
}

#[tokio::test]
async fn test_start_task_panic_enters_error_with_empty_tunnel() {
    let h = Harness::new();
    h.adapter.panic_start.store(true, Ordering::SeqCst);

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::TaskPanicked(_))
    ));

    match h.controller.state() {
        TunnelState::Error(context) => {
            assert!(matches!(*context.previous_state, TunnelState::Starting));
        }
        other => panic!("unexpected state: {}", other),
    }

    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 2);
    assert!(starts[1].is_empty());
    assert!(h.monitor.probes().is_empty());
}

#[tokio::test]
async fn test_settings_read_failure_fails_start() {
    let h = Harness::new();
    h.settings.fail_settings.store(true, Ordering::SeqCst);

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::Settings(SettingsError::ReadSettings(_)))
    ));

    match h.controller.state() {
        TunnelState::Error(context) => {
            assert!(matches!(*context.previous_state, TunnelState::Starting));
        }
        other => panic!("unexpected state: {}", other),
    }

    // Only the empty tunnel was brought up, and no relay was picked
    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].is_empty());
    assert!(h.selector.calls().is_empty());
}

#[tokio::test]
async fn test_device_state_read_failure_fails_start() {
    let h = Harness::new();
    h.settings.fail_device_state.store(true, Ordering::SeqCst);

    let err = h.controller.start(app_launch()).await.unwrap_err();
    assert!(matches!(
        err.start_failure(),
        Some(ControllerError::Settings(SettingsError::ReadDeviceState(_)))
    ));
    assert!(h.controller.state().is_error());

    let starts = h.adapter.starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].is_empty());
}

#[tokio::test]
async fn test_rapid_reconnects_never_overlap() {
    let h = started(ControllerPolicy::default()).await;
    h.adapter.set_update_delay(Duration::from_millis(50));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let controller = h.controller.clone();
        handles.push(tokio::spawn(async move {
            controller.reconnect(NextRelay::Automatic).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(h.adapter.max_in_flight_updates(), 1);
    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));

    let last_update = h.adapter.updates().pop().unwrap();
    let current = h.controller.selector_result().unwrap();
    assert_eq!(
        last_update.peer_endpoint(),
        Some(current.endpoint.socket_address)
    );
}

#[tokio::test]
async fn test_reconnect_to_fixed_relay() {
    let h = started(ControllerPolicy::default()).await;

    h.controller
        .reconnect(NextRelay::Fixed(relay(9)))
        .await
        .unwrap();

    assert_eq!(h.selector.calls(), vec![0]);
    assert_eq!(h.controller.selector_result(), Some(relay(9)));
    assert_eq!(
        h.monitor.probes().last(),
        Some(&relay(9).endpoint.ipv4_gateway)
    );
    // Explicit reconnects restart the monitor
    assert_eq!(h.monitor.stop_count(), 1);
}

#[tokio::test]
async fn test_failed_reconnect_keeps_current_tunnel() {
    let h = started(ControllerPolicy::default()).await;
    h.adapter.fail_update.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        h.controller.reconnect(NextRelay::Automatic).await.unwrap();
    }

    // No escalation without a threshold
    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));
    assert_eq!(h.controller.selector_result(), Some(relay(1)));
    assert!(!h.controller.snapshot().is_reasserting);
}

#[tokio::test]
async fn test_selector_failure_during_reconnect_keeps_current_relay() {
    let h = started(ControllerPolicy::default()).await;
    h.selector.fail.store(true, Ordering::SeqCst);

    h.controller.reconnect(NextRelay::Automatic).await.unwrap();

    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));
    assert_eq!(h.controller.selector_result(), Some(relay(1)));
    assert_eq!(h.selector.calls(), vec![0, 0]);
    assert!(h.adapter.updates().is_empty());
    assert!(!h.controller.snapshot().is_reasserting);
}

#[tokio::test]
async fn test_connection_lost_while_starting_is_counted_only() {
    let h = Harness::new();
    h.controller.start(app_launch()).await.unwrap();

    h.monitor.emit(MonitorEvent::ConnectionLost);
    wait_for(|| h.controller.failed_attempts() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Starting cannot move to Reconnecting, so no relay change happens
    assert!(matches!(h.controller.state(), TunnelState::Starting));
    assert_eq!(h.selector.calls(), vec![0]);
    assert!(h.adapter.updates().is_empty());

    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;
}

#[tokio::test]
async fn test_repeated_reconnect_failures_escalate_to_error() {
    let h = started(ControllerPolicy {
        reconnect_escalation_threshold: Some(2),
        ..ControllerPolicy::default()
    })
    .await;
    h.adapter.fail_update.store(true, Ordering::SeqCst);

    h.controller.reconnect(NextRelay::Automatic).await.unwrap();
    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));

    h.controller.reconnect(NextRelay::Automatic).await.unwrap();
    match h.controller.state() {
        TunnelState::Error(context) => {
            assert!(matches!(*context.previous_state, TunnelState::Reconnecting));
            assert!(matches!(
                *context.error,
                ControllerError::Adapter(AdapterError::Update(_))
            ));
        }
        other => panic!("unexpected state: {}", other),
    }

    // Recovery from the error state goes through Reconnecting
    h.adapter.fail_update.store(false, Ordering::SeqCst);
    h.controller.reconnect(NextRelay::Automatic).await.unwrap();
    assert!(matches!(h.controller.state(), TunnelState::Reconnecting));

    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;
}

#[tokio::test]
async fn test_failure_hook_fires_every_other_loss() {
    let h = started(ControllerPolicy::default()).await;

    for _ in 0..4 {
        h.monitor.emit(MonitorEvent::ConnectionLost);
    }
    wait_for(|| h.selector.calls().len() == 5).await;

    assert_eq!(h.hook.milestones(), vec![2, 4]);
    assert_eq!(h.controller.failed_attempts(), 4);
    assert_eq!(h.selector.calls(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_failure_hook_can_be_disabled() {
    let h = started(ControllerPolicy {
        failure_hook_interval: 0,
        ..ControllerPolicy::default()
    })
    .await;

    for _ in 0..4 {
        h.monitor.emit(MonitorEvent::ConnectionLost);
    }
    wait_for(|| h.selector.calls().len() == 5).await;

    assert!(h.hook.milestones().is_empty());
}

#[tokio::test]
async fn test_reachability_is_tracked() {
    let h = started(ControllerPolicy::default()).await;
    assert!(h.controller.snapshot().is_network_reachable);

    h.monitor.emit(MonitorEvent::ReachabilityChanged(false));
    wait_for(|| !h.controller.snapshot().is_network_reachable).await;

    h.monitor.emit(MonitorEvent::ReachabilityChanged(true));
    wait_for(|| h.controller.snapshot().is_network_reachable).await;
    assert!(is_started(&h));
}

#[tokio::test]
async fn test_reasserting_while_switching_relays() {
    let h = started(ControllerPolicy::default()).await;
    h.adapter.set_update_delay(Duration::from_millis(200));

    let controller = h.controller.clone();
    let reconnect =
        tokio::spawn(async move { controller.reconnect(NextRelay::Automatic).await });
    wait_for(|| h.adapter.in_flight_updates() == 1).await;
    assert!(h.controller.snapshot().is_reasserting);

    reconnect.await.unwrap().unwrap();
    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;
    assert!(!h.controller.snapshot().is_reasserting);
}

#[tokio::test]
async fn test_state_changes_follow_transition_table() {
    let h = Harness::new();
    let mut changes = h.controller.subscribe();

    h.controller.start(app_launch()).await.unwrap();
    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;

    h.monitor.emit(MonitorEvent::ConnectionLost);
    wait_for(|| h.monitor.probes().len() == 2).await;
    h.monitor.emit(MonitorEvent::ConnectionEstablished);
    wait_for(|| is_started(&h)).await;

    h.controller.stop().await.unwrap();

    let mut walk = Vec::new();
    loop {
        match changes.try_recv() {
            Ok(change) => walk.push(change),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {:?}", e),
        }
    }

    let names: Vec<_> = walk.iter().map(|change| change.to.name()).collect();
    assert_eq!(
        names,
        vec!["starting", "started", "reconnecting", "started", "stopping", "stopped"]
    );

    for change in &walk {
        assert!(change.from.can_transition(&change.to));
    }
    for pair in walk.windows(2) {
        assert_eq!(pair[0].to.name(), pair[1].from.name());
    }
}

//! Startup, shutdown and transport failure handling

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{recv, TestDaemon, WAIT};
use hd_core::{Attributes, StateValue};
use hd_daemon::{DaemonError, HostState, OutboundCall, TransportError};
use hd_listeners::RegistrationError;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn test_stop_releases_listeners_delays_and_timers() {
    let daemon = TestDaemon::started().await;
    let delay = daemon
        .host
        .delay_until_state_change(["climate.living"], Some("heat".into()), None, false)
        .unwrap();
    let timer = daemon
        .host
        .scheduler()
        .run_every(Duration::from_secs(3600), || async { Ok(()) });
    daemon.host.listen_state("climate.living", |_| async { Ok(()) }).unwrap();

    daemon.host.stop().await;

    assert_eq!(daemon.host.host_state(), HostState::Stopped);
    assert_eq!(delay.outcome(), Some(false));
    assert!(timer.is_cancelled());
    assert_eq!(daemon.host.scheduler().active_count(), 0);
    assert!(matches!(
        daemon.host.listen_state("climate.living", |_| async { Ok(()) }),
        Err(RegistrationError::Closed)
    ));
    assert!(matches!(daemon.host.start().await, Err(DaemonError::Stopped)));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let daemon = TestDaemon::started().await;
    daemon.host.stop().await;
    daemon.host.stop().await;
    assert_eq!(daemon.host.host_state(), HostState::Stopped);
}

#[tokio::test]
async fn test_stream_end_stops_host() {
    let daemon = TestDaemon::started().await;
    let delay = daemon
        .host
        .delay_until_state_change(["vacuum.robot"], Some("docked".into()), None, false)
        .unwrap();

    daemon.hub.close();
    timeout(WAIT, daemon.host.stopped()).await.unwrap();

    assert!(!daemon.host.is_running());
    assert!(!timeout(WAIT, delay.wait()).await.unwrap());
    assert!(daemon.host.registry().is_closed());
}

#[tokio::test]
async fn test_run_returns_after_stream_end() {
    let daemon = TestDaemon::new();
    let host = daemon.host.clone();
    let running = tokio::spawn(async move { host.run().await });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut attempts = 0;
    while !daemon.host.is_running() {
        attempts += 1;
        assert!(attempts < 500, "host never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    daemon
        .host
        .listen_state("sensor.outdoor", move |change| {
            let _ = tx.send(change.new_state.state);
            async { Ok(()) }
        })
        .unwrap();
    daemon.push_state("sensor.outdoor", 4.5);
    assert_eq!(recv(&mut rx).await, StateValue::from(4.5));

    daemon.hub.close();
    timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(daemon.host.host_state(), HostState::Stopped);
}

#[tokio::test]
async fn test_transport_failures_surface_to_caller() {
    let daemon = TestDaemon::started().await;
    daemon.hub.set_online(false);

    let result = daemon.host.call_service("light", "turn_on", None).await;
    assert!(matches!(
        result,
        Err(DaemonError::Transport(TransportError::Disconnected(_)))
    ));
    assert!(daemon
        .host
        .set_state("input_boolean.guest", "on", Attributes::new())
        .await
        .is_err());
    assert!(daemon.host.send_event("custom", None).await.is_err());
    assert!(daemon.hub.calls().is_empty());
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_listener_survives_failed_outbound_call() {
    let daemon = TestDaemon::started().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let host = daemon.host.clone();
    let counter = attempts.clone();
    daemon
        .host
        .listen_state("binary_sensor.motion", move |change| {
            let host = host.clone();
            let tx = tx.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let result = host.call_service("light", "turn_on", None).await;
                let _ = tx.send((change.new_state.state, result.is_ok()));
                result?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    daemon.hub.set_online(false);
    daemon.push_state("binary_sensor.motion", "on");
    let (_, ok) = recv(&mut rx).await;
    assert!(!ok);

    daemon.hub.set_online(true);
    daemon.push_state("binary_sensor.motion", "off");
    let (state, ok) = recv(&mut rx).await;
    assert!(ok);
    assert_eq!(state, StateValue::from("off"));

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let calls = daemon.hub.wait_for_calls(1).await;
    assert!(matches!(&calls[0], OutboundCall::CallService { .. }));
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_set_state_follows_hub_echo() {
    let daemon = TestDaemon::started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    daemon
        .host
        .listen_state("input_boolean.guest", move |change| {
            let _ = tx.send(change.new_state.state);
            async { Ok(()) }
        })
        .unwrap();

    let stored = daemon
        .host
        .set_state("input_boolean.guest", "on", Attributes::new())
        .await
        .unwrap();
    assert_eq!(stored.map(|s| s.state), Some(StateValue::from("on")));

    assert_eq!(recv(&mut rx).await, StateValue::from("on"));
    daemon.assert_state("input_boolean.guest", "on");
    daemon.host.stop().await;
}

//! Fluent automations driven through the memory hub

mod common;

use std::time::Duration;

use common::{id, recv, TestDaemon};
use hd_core::{Attributes, EntityState, StateValue};
use hd_daemon::{DaemonError, OutboundCall};
use hd_listeners::{ListenerKind, RegistrationError};
use serde_json::json;
use tokio::sync::mpsc;

fn call_service(domain: &str, service: &str, data: serde_json::Value) -> OutboundCall {
    OutboundCall::CallService {
        domain: domain.to_string(),
        service: service.to_string(),
        data: Some(data),
        wait_for_response: false,
    }
}

#[tokio::test]
async fn test_freezer_temperature_turns_on_light() {
    let daemon = TestDaemon::started().await;
    daemon
        .host
        .entity(["sensor.frysnere_temperature"])
        .state_changed_when(|new, _old| new.numeric_state().is_some_and(|t| t > -10.0))
        .entity(["light.hall"])
        .turn_on()
        .with_attribute("transition", 0)
        .execute()
        .unwrap();

    for reading in ["-15", "-5", "unavailable", "-2"] {
        daemon.push_state("sensor.frysnere_temperature", reading);
    }

    let calls = daemon.hub.wait_for_calls(2).await;
    let expected = call_service("light", "turn_on", json!({"entity_id": "light.hall", "transition": 0}));
    assert_eq!(calls, vec![expected.clone(), expected]);
    daemon.assert_state("sensor.frysnere_temperature", "-2");
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_motion_runs_every_action_in_order() {
    let daemon = TestDaemon::started().await;
    daemon
        .host
        .entity(["binary_sensor.hall_pir", "binary_sensor.porch_pir"])
        .state_changed(Some("on"), Some("off"))
        .entity(["light.hall", "switch.porch"])
        .turn_on()
        .entity(["light.attic"])
        .turn_off()
        .execute()
        .unwrap();

    daemon.push_state("binary_sensor.porch_pir", "off");
    daemon.push_state("binary_sensor.porch_pir", "on");

    let calls = daemon.hub.wait_for_calls(3).await;
    let services: Vec<_> = calls.iter().filter_map(OutboundCall::service_id).collect();
    assert_eq!(services, ["light.turn_on", "switch.turn_on", "light.turn_off"]);
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_automation_echo_reaches_service_listeners() {
    let daemon = TestDaemon::started().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    daemon
        .host
        .listen_service_call("light", "turn_off", move |call| {
            let _ = tx.send(call.entity_ids());
            async { Ok(()) }
        })
        .unwrap();
    daemon
        .host
        .entity(["sun.sun"])
        .state_changed_to("above_horizon")
        .entity(["light.garden"])
        .turn_off()
        .execute()
        .unwrap();

    daemon.push_state("sun.sun", "above_horizon");
    assert_eq!(recv(&mut rx).await, vec!["light.garden".to_string()]);
    daemon.host.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_toggles_every_interval() {
    let daemon = TestDaemon::started().await;
    let handle = daemon
        .host
        .timer()
        .every(Duration::from_secs(10))
        .entity(["switch.pump"])
        .toggle()
        .execute()
        .unwrap();
    assert!(handle.listener_id().is_none());

    tokio::time::sleep(Duration::from_secs(35)).await;
    let calls = daemon.hub.wait_for_calls(3).await;
    assert_eq!(calls.len(), 3);
    assert!(calls
        .iter()
        .all(|c| *c == call_service("switch", "toggle", json!({"entity_id": "switch.pump"}))));

    assert!(handle.cancel());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(daemon.hub.calls().len(), 3);
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_cancelled_automation_stops_firing() {
    let daemon = TestDaemon::started().await;
    let handle = daemon
        .host
        .entity(["input_boolean.away"])
        .state_changed_to("on")
        .entity(["climate.living"])
        .turn_off()
        .execute()
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    daemon
        .host
        .listen_state("input_boolean.away", move |change| {
            let _ = tx.send(change.new_state.state);
            async { Ok(()) }
        })
        .unwrap();

    assert!(handle.cancel());
    assert_eq!(daemon.host.registry().count(ListenerKind::State), 1);
    daemon.push_state("input_boolean.away", "on");
    assert_eq!(recv(&mut rx).await, StateValue::from("on"));
    assert!(daemon.hub.calls().is_empty());
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_immediate_action_and_closed_host() {
    let daemon = TestDaemon::started().await;
    daemon
        .host
        .entity(["cover.garage", "cover.shed"])
        .turn_off()
        .execute()
        .await
        .unwrap();
    let services: Vec<_> = daemon
        .hub
        .calls()
        .iter()
        .filter_map(OutboundCall::service_id)
        .collect();
    assert_eq!(services, ["cover.turn_off", "cover.turn_off"]);

    daemon.host.stop().await;
    let after_stop = daemon
        .host
        .timer()
        .every(Duration::from_secs(60))
        .entity(["light.hall"])
        .toggle()
        .execute();
    assert!(matches!(after_stop, Err(RegistrationError::Closed)));
}

#[tokio::test]
async fn test_event_automation_targets_entities_by_predicate() {
    let daemon = TestDaemon::new();
    for entity in ["light.kitchen", "light.hall", "switch.fan"] {
        daemon
            .hub
            .seed_state(EntityState::new(id(entity), "off", Attributes::new()));
    }
    tokio_test::assert_ok!(daemon.host.start().await);

    daemon
        .host
        .events(["doorbell", "gate_opened"])
        .entities_where(|state| state.entity_id.in_domain("light"))
        .turn_on()
        .execute()
        .unwrap();

    daemon.hub.push_event("window_opened", json!({}));
    daemon.hub.push_event("gate_opened", json!({}));

    let calls = daemon.hub.wait_for_calls(2).await;
    let mut targets: Vec<_> = calls
        .iter()
        .map(|call| match call {
            OutboundCall::CallService { domain, service, data, .. } => {
                assert_eq!((domain.as_str(), service.as_str()), ("light", "turn_on"));
                data.as_ref().map(|d| d["entity_id"].clone())
            }
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    targets.sort_by_key(|t| t.as_ref().and_then(|v| v.as_str().map(str::to_string)));
    assert_eq!(targets, [Some(json!("light.hall")), Some(json!("light.kitchen"))]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(daemon.hub.calls().len(), 2);
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_event_predicate_automation() {
    let daemon = TestDaemon::started().await;
    daemon
        .host
        .events_when(|event| event.event_type == "zwave_scene" && event.data["scene"] == 2)
        .entity(["light.bedroom"])
        .toggle()
        .execute()
        .unwrap();

    daemon.hub.push_event("zwave_scene", json!({"scene": 1}));
    daemon.hub.push_event("zwave_scene", json!({"scene": 2}));

    let calls = daemon.hub.wait_for_calls(1).await;
    assert_eq!(calls[0], call_service("light", "toggle", json!({"entity_id": "light.bedroom"})));
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_event_selection_rejections() {
    let daemon = TestDaemon::started().await;
    let no_events = daemon
        .host
        .events(Vec::<String>::new())
        .entity(["light.hall"])
        .turn_on()
        .execute();
    assert!(matches!(no_events, Err(RegistrationError::EmptyEventName)));

    let no_entities = daemon
        .host
        .event("doorbell")
        .entities_where(|state| state.entity_id.in_domain("fan"))
        .turn_on()
        .execute();
    assert!(matches!(no_entities, Err(RegistrationError::EmptyEntitySet)));
    assert_eq!(daemon.host.registry().count(ListenerKind::Event), 0);
    daemon.host.stop().await;
}

#[tokio::test]
async fn test_run_script_and_speak() {
    let daemon = TestDaemon::started().await;
    daemon
        .host
        .run_script(["goodnight", "script.close_blinds"])
        .execute()
        .await
        .unwrap();
    daemon
        .host
        .speak("media_player.kitchen", "Dinner is ready")
        .await
        .unwrap();

    let script = |service: &str| OutboundCall::CallService {
        domain: "script".to_string(),
        service: service.to_string(),
        data: None,
        wait_for_response: false,
    };
    assert_eq!(
        daemon.hub.calls(),
        vec![
            script("goodnight"),
            script("close_blinds"),
            call_service(
                "tts",
                "google_say",
                json!({"entity_id": "media_player.kitchen", "message": "Dinner is ready"})
            ),
        ]
    );

    let not_a_script = daemon.host.run_script(["light.hall"]).execute().await;
    assert!(matches!(not_a_script, Err(DaemonError::NotAScript(id)) if id == "light.hall"));
    assert_eq!(daemon.hub.calls().len(), 3);
    daemon.host.stop().await;
}

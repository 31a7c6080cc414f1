//! End-to-end device scenarios over simulated hardware.
//!
//! Every test runs with paused tokio time, so simulated motion and timeouts
//! complete instantly and deterministically.

use beamline_devices::config::EngineConfig;
use beamline_devices::device::DeviceState;
use beamline_devices::sim::{self, SimBeamline};
use beamline_devices::status::{Status, StatusPhase};
use beamline_devices::DeviceError;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const WAIT: Duration = Duration::from_secs(120);

const BEAMLINE: &str = r#"
[timeouts]
move_timeout = "10s"
actuate_timeout = "5s"
cancel_grace = "1s"

[[devices]]
name = "sample_x"
prefix = "XPP:SB2:MMS:01"
kind = "positioner"
low_limit = -10.0
high_limit = 10.0
speed = 2.0

[[devices]]
name = "top"
prefix = "XPP:SLITS:TOP"
kind = "positioner"
group = "slits"

[[devices]]
name = "bottom"
prefix = "XPP:SLITS:BOTTOM"
kind = "positioner"
group = "slits"

[[devices]]
name = "left"
prefix = "XPP:SLITS:LEFT"
kind = "positioner"
group = "slits"

[[devices]]
name = "stopper"
prefix = "XPP:STP:01"
kind = "shutter"
supports_cancel = false
"#;

fn config() -> EngineConfig {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(BEAMLINE.as_bytes()).unwrap();
    EngineConfig::load_from(file.path()).unwrap()
}

async fn beamline() -> SimBeamline {
    let beamline = sim::build_beamline(&config()).unwrap();
    for path in ["sample_x", "slits.top", "slits.bottom", "slits.left", "stopper"] {
        beamline
            .device(path)
            .unwrap()
            .wait_for_state(DeviceState::Idle, WAIT)
            .await
            .unwrap();
    }
    beamline
}

#[tokio::test(start_paused = true)]
async fn limit_interlock_denies_and_device_stays_idle() {
    let beamline = beamline().await;
    let status = beamline.command("sample_x", "25").await.unwrap();

    assert_eq!(status.wait(WAIT).await, StatusPhase::Failure);
    let reason = status.reason().unwrap();
    assert!(reason.to_string().contains("limit ok"), "{}", reason);

    let device = beamline.device("sample_x").unwrap();
    assert_eq!(device.state(), DeviceState::Idle);
    assert!(device.record().last_denial.is_some());
    assert!(beamline.positioner("sample_x").unwrap().setpoint.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn completed_move_resolves_success_and_returns_to_idle() {
    let beamline = beamline().await;
    let device = beamline.device("sample_x").unwrap();
    let mut states = device.subscribe();

    let status = beamline.command("sample_x", "3.0").await.unwrap();
    assert_eq!(states.borrow_and_update().state, DeviceState::Moving);

    assert_eq!(status.wait(WAIT).await, StatusPhase::Success);
    device.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();
    assert_eq!(status.progress(), Some(1.0));

    let positioner = beamline.positioner("sample_x").unwrap();
    assert!((positioner.position() - 3.0).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn stalled_move_times_out_and_faults() {
    let beamline = beamline().await;
    beamline.positioner("sample_x").unwrap().set_stalled(true);

    let status = beamline.command("sample_x", "3.0").await.unwrap();
    assert_eq!(status.wait(WAIT).await, StatusPhase::TimedOut);

    let device = beamline.device("sample_x").unwrap();
    device.wait_for_state(DeviceState::Faulted, WAIT).await.unwrap();
    assert!(matches!(status.reason(), Some(DeviceError::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_denied_while_fault_active() {
    let beamline = beamline().await;
    let positioner = beamline.positioner("sample_x").unwrap();
    let device = beamline.device("sample_x").unwrap();

    let status = beamline.command("sample_x", "5.0").await.unwrap();
    positioner.trip_fault();
    assert_eq!(status.wait(WAIT).await, StatusPhase::Failure);
    assert!(matches!(
        status.reason(),
        Some(DeviceError::AsynchronousFault(_))
    ));
    device.wait_for_state(DeviceState::Faulted, WAIT).await.unwrap();

    let denied = device.acknowledge_fault().await.unwrap();
    assert_eq!(denied.phase(), StatusPhase::Failure);
    assert!(denied.reason().unwrap().to_string().contains("fault cleared"));
    assert_eq!(device.state(), DeviceState::Faulted);

    positioner.clear_fault();
    let accepted = device.acknowledge_fault().await.unwrap();
    assert_eq!(accepted.phase(), StatusPhase::Success);
    assert_eq!(device.state(), DeviceState::Idle);
    assert_eq!(positioner.reset.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn group_aggregates_faulted_over_moving_and_idle() {
    let beamline = beamline().await;
    let slits = beamline.registry.lookup("slits").unwrap();
    assert_eq!(slits.aggregate_status(), DeviceState::Idle);

    beamline.positioner("slits.top").unwrap().trip_fault();
    beamline
        .device("slits.top")
        .unwrap()
        .wait_for_state(DeviceState::Faulted, WAIT)
        .await
        .unwrap();

    beamline.positioner("slits.bottom").unwrap().set_stalled(true);
    let _moving = beamline.command("slits.bottom", "1.0").await.unwrap();
    assert_eq!(
        beamline.device("slits.bottom").unwrap().state(),
        DeviceState::Moving
    );
    assert_eq!(
        beamline.device("slits.left").unwrap().state(),
        DeviceState::Idle
    );

    assert_eq!(slits.aggregate_status(), DeviceState::Faulted);
    assert_eq!(beamline.registry.aggregate_status(), DeviceState::Faulted);
    let faults = beamline.registry.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].path, "slits.top");
}

#[tokio::test(start_paused = true)]
async fn request_while_moving_is_busy_without_new_status() {
    let beamline = beamline().await;
    let device = beamline.device("sample_x").unwrap();

    let first = beamline.command("sample_x", "4.0").await.unwrap();
    let history_before = device.history().len();

    let second = beamline.command("sample_x", "-4.0").await;
    assert_eq!(second.unwrap_err(), DeviceError::Busy);
    assert_eq!(device.history().len(), history_before);
    assert_eq!(device.current_status().map(|s| s.id()), Some(first.id()));

    assert_eq!(first.wait(WAIT).await, StatusPhase::Success);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_motion_and_resolves_cancelled() {
    let beamline = beamline().await;
    let device = beamline.device("sample_x").unwrap();

    let status = beamline.command("sample_x", "8.0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1050)).await;
    let cancelled = device.cancel().await.unwrap();
    assert!(cancelled.same_as(&status));

    assert_eq!(status.wait(WAIT).await, StatusPhase::Cancelled);
    device.wait_for_state(DeviceState::Idle, WAIT).await.unwrap();

    let position = beamline.positioner("sample_x").unwrap().position();
    assert!(position > 0.0 && position < 8.0, "stopped at {}", position);
}

#[tokio::test(start_paused = true)]
async fn shutter_without_stop_cannot_cancel() {
    let beamline = beamline().await;
    let device = beamline.device("stopper").unwrap();

    let status = beamline.command("stopper", "open").await.unwrap();
    assert!(matches!(
        device.cancel().await,
        Err(DeviceError::Unsupported(_))
    ));
    assert_eq!(status.wait(WAIT).await, StatusPhase::Success);
    assert!(beamline.shutter("stopper").unwrap().is_open());
}

#[tokio::test(start_paused = true)]
async fn combined_status_waits_for_every_blade() {
    let beamline = beamline().await;
    let combined = Status::new("open slits");
    for (path, target) in [("slits.top", "1.0"), ("slits.bottom", "-1.0")] {
        let child = beamline.command(path, target).await.unwrap();
        combined.add_child(child).unwrap();
    }

    assert_eq!(combined.wait(WAIT).await, StatusPhase::Success);
    assert_eq!(combined.children().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn registry_snapshot_exposes_tree_for_operators() {
    let beamline = beamline().await;
    let _denied = beamline.command("sample_x", "99").await.unwrap();

    let snapshot = serde_json::to_value(beamline.registry.snapshot()).unwrap();
    let sample = &snapshot[0];
    assert_eq!(sample["metadata"]["kind"], "positioner");
    assert_eq!(sample["node"]["state"], "idle");
    assert_eq!(sample["node"]["history"][0]["phase"], "done-failure");
    assert!(sample["node"]["last_denial"]
        .as_str()
        .unwrap()
        .contains("limit ok"));

    let slits = &snapshot[1];
    assert_eq!(slits["metadata"]["kind"], "group");
    assert_eq!(slits["node"]["children"][2]["path"], "slits.left");
}

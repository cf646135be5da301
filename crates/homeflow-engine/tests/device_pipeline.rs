use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use tokio::sync::broadcast;
use tokio::time::sleep;

use homeflow_core::config::EngineConfig;
use homeflow_core::time::ManualClock;
use homeflow_core::types::{Command, DeviceId, Source, State};
use homeflow_engine::{ControllerConfig, DeviceConfig, DeviceKind, Engine};
use homeflow_devices::RegistryEvent;

fn clock_at(h: u32, m: u32) -> Arc<ManualClock> {
    Arc::new(ManualClock::at_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()))
}

fn engine() -> Engine {
    Engine::with_clock(EngineConfig::default(), clock_at(12, 0)).unwrap()
}

fn api() -> Source {
    Source::External("test".into())
}

/// Drain the events, returning `changed` for each commit of `device`
fn commit_log(events: &mut broadcast::Receiver<RegistryEvent>, device: DeviceId) -> Vec<bool> {
    let mut log = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Committed { id, changed, .. } = event {
            if id == device {
                log.push(changed);
            }
        }
    }
    log
}

fn commits(events: &mut broadcast::Receiver<RegistryEvent>, device: DeviceId) -> usize {
    commit_log(events, device).len()
}

fn light(name: &str) -> DeviceConfig {
    DeviceConfig::new(name).with_kind(DeviceKind::Light)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn state_stays_valid_under_concurrent_callers() {
    let engine = Arc::new(engine());
    let lamp = engine.build_device(&light("lamp")).unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8u8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for step in 0..200u8 {
                let command = match (worker + step) % 4 {
                    0 => Command::On,
                    1 => Command::Off,
                    2 => Command::Level(step % 101),
                    _ => Command::Toggle,
                };
                engine.dispatch(lamp, command, api()).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let info = engine.device("lamp").unwrap().info();
    assert!(DeviceKind::Light.accepts(info.state));
    assert_ne!(info.state, State::Unknown);
    let last = info.previous_command.unwrap();
    assert_eq!(last.target_state(), Some(info.state));
}

#[test_log::test(tokio::test)]
async fn changes_only_suppresses_repeat_delegation() {
    for (changes_only, expected) in [(true, vec![true]), (false, vec![true, false])] {
        let engine = engine();
        engine
            .build_device(&DeviceConfig::new("switch").with_changes_only(changes_only))
            .unwrap();
        let lamp = engine
            .build_device(&light("lamp").with_producers(&["switch"]))
            .unwrap();

        let mut events = engine.subscribe();
        engine.dispatch_to("switch", Command::On, api()).unwrap();
        engine.dispatch_to("switch", Command::On, api()).unwrap();

        assert_eq!(engine.state("lamp").unwrap(), State::On);
        assert_eq!(commit_log(&mut events, lamp), expected, "changes_only = {}", changes_only);
    }
}

#[test_log::test(tokio::test)]
async fn toggle_round_trip() {
    let engine = engine();
    engine
        .build_device(&light("lamp").with_initial(Command::Off))
        .unwrap();

    engine.dispatch_to("lamp", Command::Toggle, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::On);
    engine.dispatch_to("lamp", Command::Toggle, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Off);

    engine.dispatch_to("lamp", Command::Level(60), api()).unwrap();
    engine.dispatch_to("lamp", Command::Toggle, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Off);
    engine.dispatch_to("lamp", Command::Previous, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Level(60));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn later_command_cancels_pending_delay() {
    let engine = engine();
    let config = DeviceConfig::from_toml(
        r#"
        name = "hall"
        kind = "light"

        [delay]
        command = "off"
        seconds = 30
        "#,
    )
    .unwrap();
    engine.build_device(&config).unwrap();

    engine.dispatch_to("hall", Command::On, api()).unwrap();
    engine.dispatch_to("hall", Command::Off, api()).unwrap();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(engine.state("hall").unwrap(), State::On);

    engine.dispatch_to("hall", Command::Level(50), api()).unwrap();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(engine.state("hall").unwrap(), State::Level(50));

    engine.dispatch_to("hall", Command::Off, api()).unwrap();
    sleep(Duration::from_secs(31)).await;
    assert_eq!(engine.state("hall").unwrap(), State::Off);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn retrigger_guard_voids_quick_repeats() {
    let engine = engine();
    let motion = engine
        .build_device(
            &DeviceConfig::new("motion")
                .with_kind(DeviceKind::Motion)
                .with_retrigger_delay(2.0),
        )
        .unwrap();
    let mut events = engine.subscribe();

    engine.dispatch(motion, Command::Motion, api()).unwrap();
    sleep(Duration::from_millis(500)).await;
    engine.dispatch(motion, Command::Motion, api()).unwrap();
    assert_eq!(commits(&mut events, motion), 1);

    sleep(Duration::from_secs(3)).await;
    engine.dispatch(motion, Command::Motion, api()).unwrap();
    assert_eq!(commits(&mut events, motion), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn voided_repeat_does_not_rearm_idle() {
    let engine = engine();
    let config = DeviceConfig::from_toml(
        r#"
        name = "motion"
        kind = "motion"
        retrigger_delay = 2

        [idle]
        command = "motion"
        mapped = "still"
        seconds = 5
        "#,
    )
    .unwrap();
    engine.build_device(&config).unwrap();

    engine.dispatch_to("motion", Command::Motion, api()).unwrap();
    sleep(Duration::from_secs(1)).await;
    engine.dispatch_to("motion", Command::Motion, api()).unwrap();

    // The idle timer still counts from the first commit
    sleep(Duration::from_millis(4500)).await;
    assert_eq!(engine.state("motion").unwrap(), State::Still);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn guard_delay_and_idle_together() {
    let engine = engine();
    let config = DeviceConfig::from_toml(
        r#"
        name = "hall"
        kind = "light"
        retrigger_delay = 2

        [delay]
        command = "off"
        seconds = 2

        [idle]
        command = "on"
        mapped = "level:30"
        seconds = 5
        "#,
    )
    .unwrap();
    let hall = engine.build_device(&config).unwrap();
    let mut events = engine.subscribe();

    engine.dispatch(hall, Command::On, api()).unwrap();
    sleep(Duration::from_millis(500)).await;
    engine.dispatch(hall, Command::Off, api()).unwrap();
    sleep(Duration::from_millis(500)).await;
    // Voided by the guard, yet still newer than the held OFF
    engine.dispatch(hall, Command::On, api()).unwrap();
    assert_eq!(commits(&mut events, hall), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.state("hall").unwrap(), State::On);

    // Idle still counts from the only commit, at t = 0
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(engine.state("hall").unwrap(), State::Level(30));
    assert_eq!(commits(&mut events, hall), 1);
}

#[test_log::test(tokio::test)]
async fn restriction_blocks_while_reference_holds_state() {
    let engine = engine();
    let config = ControllerConfig::from_toml(
        r#"
        [[device]]
        name = "photocell"
        kind = "photocell"

        [[device]]
        name = "lamp"
        kind = "light"

        [[device.restriction]]
        state = "light"
        device = "photocell"
        command = "on"
        "#,
    )
    .unwrap();
    assert_eq!(engine.load(&config).len(), 2);
    let photocell = engine.device("photocell").unwrap().id();

    engine.dispatch_to("photocell", Command::Light, api()).unwrap();
    engine.dispatch_to("lamp", Command::On, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Unknown);

    // Off is not restricted, and the reference device itself is exempt
    engine.dispatch_to("lamp", Command::Off, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Off);
    engine
        .dispatch_to("lamp", Command::On, Source::Device(photocell))
        .unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::On);

    engine.dispatch_to("lamp", Command::Off, api()).unwrap();
    engine.dispatch_to("photocell", Command::Dark, api()).unwrap();
    engine.dispatch_to("lamp", Command::On, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::On);
}

#[test_log::test(tokio::test)]
async fn ignore_window_crosses_midnight() {
    let clock = clock_at(21, 0);
    let engine = Engine::with_clock(EngineConfig::default(), clock.clone()).unwrap();
    let config = DeviceConfig::from_toml(
        r#"
        name = "garden"
        kind = "light"

        [[ignore]]
        command = "on"
        start = "10:00 PM"
        end = "6:00 AM"
        "#,
    )
    .unwrap();
    engine.build_device(&config).unwrap();

    let cases = [
        (21, 59, State::On),
        (22, 0, State::Off),
        (23, 30, State::Off),
        (0, 15, State::Off),
        (5, 59, State::Off),
        (6, 1, State::On),
    ];
    for (h, m, expected) in cases {
        engine.dispatch_to("garden", Command::Off, api()).unwrap();
        clock.set_time(NaiveTime::from_hms_opt(h, m, 0).unwrap());
        engine.dispatch_to("garden", Command::On, api()).unwrap();
        assert_eq!(engine.state("garden").unwrap(), expected, "at {:02}:{:02}", h, m);
    }
}

#[test_log::test(tokio::test)]
async fn delegation_cycles_terminate() {
    let engine = engine();
    let a = engine.build_device(&light("a")).unwrap();
    let b = engine.build_device(&light("b").with_producers(&["a"])).unwrap();
    let c = engine.build_device(&light("c").with_producers(&["b"])).unwrap();

    // Close the loop a -> b -> c -> a, plus a self-loop on b
    engine.registry().get(c).unwrap().subscribe(a);
    engine.registry().get(a).unwrap().add_producer(c);
    engine.registry().get(b).unwrap().subscribe(b);

    let mut events = engine.subscribe();
    engine.dispatch(a, Command::On, api()).unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(engine.state(name).unwrap(), State::On, "{}", name);
    }
    assert_eq!(commits(&mut events, a), 1);
    assert_eq!(commits(&mut events, b), 1);
}

#[test_log::test(tokio::test)]
async fn delegation_depth_is_bounded() {
    let settings = EngineConfig {
        max_delegation_depth: 4,
        ..EngineConfig::default()
    };
    let engine = Engine::with_clock(settings, clock_at(12, 0)).unwrap();

    let mut previous: Option<String> = None;
    for i in 0..7 {
        let name = format!("d{}", i);
        let mut config = DeviceConfig::new(&name);
        if let Some(producer) = &previous {
            config = config.with_producers(&[producer.as_str()]);
        }
        engine.build_device(&config).unwrap();
        previous = Some(name);
    }

    engine.dispatch_to("d0", Command::On, api()).unwrap();
    for i in 0..5 {
        assert_eq!(engine.state(&format!("d{}", i)).unwrap(), State::On);
    }
    assert_eq!(engine.state("d5").unwrap(), State::Unknown);
    assert_eq!(engine.state("d6").unwrap(), State::Unknown);
}

#[test_log::test(tokio::test)]
async fn manual_mode_propagates_to_delegates() {
    let engine = engine();
    engine.build_device(&DeviceConfig::new("room")).unwrap();
    engine
        .build_device(&light("lamp").with_producers(&["room"]))
        .unwrap();

    engine.dispatch_to("room", Command::Manual, api()).unwrap();
    assert!(!engine.device("lamp").unwrap().info().automatic);
    engine.dispatch_to("room", Command::Automatic, api()).unwrap();
    assert!(engine.device("lamp").unwrap().info().automatic);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn calendar_rule_issues_command() {
    let clock = clock_at(18, 29);
    let engine = Engine::with_clock(EngineConfig::default(), clock.clone()).unwrap();
    let config = DeviceConfig::from_toml(
        r#"
        name = "porch"
        kind = "light"

        [[time]]
        at = "6:30 PM"
        command = "on"
        "#,
    )
    .unwrap();
    engine.build_device(&config).unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.state("porch").unwrap(), State::Unknown);

    clock.set_time(NaiveTime::from_hms_opt(18, 30, 0).unwrap());
    sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.state("porch").unwrap(), State::On);
}

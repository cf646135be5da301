use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout};

use homeflow_core::config::EngineConfig;
use homeflow_core::types::{Address, Command, Source, State};
use homeflow_devices::{DriverOptions, LineCodec, LinkDriver, MemoryDriver, StreamTransport};
use homeflow_engine::{ControllerConfig, DeviceConfig, Engine};

fn api() -> Source {
    Source::External("test".into())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn lamp_dims_after_idle_period() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let x10 = Arc::new(MemoryDriver::new("x10"));
    engine.register_driver(x10.clone()).unwrap();

    let config = DeviceConfig::from_toml(
        r#"
        name = "lamp"
        kind = "light"
        address = "A1"
        drivers = ["x10"]

        [idle]
        mapped = "LEVEL:30"
        seconds = 2
        "#,
    )
    .unwrap();
    engine.build_device(&config).unwrap();
    let address = Address::new("A1");

    assert_eq!(x10.inject(&address, Command::On), 1);
    assert_eq!(engine.state("lamp").unwrap(), State::On);
    // The report came from the only bound driver, so nothing is echoed back
    assert!(x10.sent().is_empty());

    sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.state("lamp").unwrap(), State::Level(30));
    assert_eq!(x10.sent(), vec![(address, Command::Level(30))]);

    // The idle command does not re-arm itself
    sleep(Duration::from_secs(5)).await;
    assert_eq!(x10.sent().len(), 1);
}

#[test_log::test(tokio::test)]
async fn commits_are_mirrored_to_other_drivers() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let x10 = Arc::new(MemoryDriver::new("x10"));
    let insteon = Arc::new(MemoryDriver::new("insteon"));
    engine.register_driver(x10.clone()).unwrap();
    engine.register_driver(insteon.clone()).unwrap();

    let config = ControllerConfig::from_toml(
        r#"
        [[device]]
        name = "kitchen"
        kind = "light"
        address = "B2"
        drivers = ["x10", "insteon"]

        [[device]]
        name = "sensor"
        kind = "motion"
        address = "B3"
        drivers = ["x10", "insteon"]
        read_only = true

        [[device]]
        name = "chime"
        kind = "switch"
        address = "B4"
        drivers = ["x10"]
        send_always = true
        "#,
    )
    .unwrap();
    assert_eq!(engine.load(&config).len(), 3);

    x10.inject(&Address::new("B2"), Command::Level(80));
    assert_eq!(insteon.sent(), vec![(Address::new("B2"), Command::Level(80))]);
    assert!(x10.sent().is_empty());

    engine.dispatch_to("kitchen", Command::Off, api()).unwrap();
    assert_eq!(x10.sent(), vec![(Address::new("B2"), Command::Off)]);

    x10.clear();
    insteon.clear();
    engine.dispatch_to("sensor", Command::Motion, api()).unwrap();
    assert_eq!(engine.state("sensor").unwrap(), State::Motion);
    assert!(x10.sent().is_empty() && insteon.sent().is_empty());

    engine.dispatch_to("chime", Command::On, api()).unwrap();
    engine.dispatch_to("chime", Command::On, api()).unwrap();
    assert_eq!(x10.sent().len(), 2);
}

#[test_log::test(tokio::test)]
async fn configuration_problems_do_not_stop_the_build() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let config = ControllerConfig::from_toml(
        r#"
        [[device]]
        name = "lamp"
        kind = "light"
        drivers = ["missing"]
        devices = ["ghost"]
        brightness = 11

        [[device.map]]
        command = "on"

        [[device.map]]
        command = "off"
        mapped = "level:5"

        [[device]]
        name = "lamp"
        "#,
    )
    .unwrap();

    let built = engine.load(&config);
    assert_eq!(built.len(), 1);

    engine.dispatch_to("lamp", Command::Off, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Level(5));
    let info = engine.device("lamp").unwrap().info();
    assert!(info.producers.is_empty());
}

#[test_log::test(tokio::test)]
async fn malformed_entries_leave_other_devices_working() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let config = ControllerConfig::from_toml(
        r#"
        [[device]]
        name = "good"
        kind = "switch"

        [[device]]
        name = "lamp"
        kind = "light"
        devices = ["good"]

        [[device.map]]
        command = "on"
        mapped = "dance"

        [[device.delay]]
        command = "off"
        seconds = "ten"

        [[device]]
        name = "broken"
        initial = "sideways"
        "#,
    )
    .unwrap();
    assert_eq!(config.rejected.len(), 1);
    assert_eq!(engine.load(&config).len(), 2);

    engine.dispatch_to("good", Command::On, api()).unwrap();
    assert_eq!(engine.state("good").unwrap(), State::On);
    assert_eq!(engine.state("lamp").unwrap(), State::On);

    // The unusable delay rule was skipped, so OFF applies at once
    engine.dispatch_to("lamp", Command::Off, api()).unwrap();
    assert_eq!(engine.state("lamp").unwrap(), State::Off);
    assert!(engine.device("broken").is_err());
}

async fn wait_for_state(engine: &Engine, name: &str, state: State) -> bool {
    for _ in 0..50 {
        if engine.state(name).ok() == Some(state) {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[test_log::test(tokio::test)]
async fn line_link_round_trip() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let (transport, hardware) = StreamTransport::memory(1024);
    let options = DriverOptions::default()
        .with_inter_send_delay(Duration::from_millis(1))
        .with_poll_interval(Duration::from_millis(10));
    let link = LinkDriver::spawn(
        "serial",
        transport,
        LineCodec::new().with_acknowledgements(false),
        options,
    );
    engine.register_driver(link.clone()).unwrap();
    engine
        .build_device(&DeviceConfig::new("porch").with_address("P1", &["serial"]))
        .unwrap();

    let (read, mut write) = tokio::io::split(hardware);
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"P1 ON\n").await.unwrap();
    assert!(wait_for_state(&engine, "porch", State::On).await);

    engine.dispatch_to("porch", Command::Level(40), api()).unwrap();
    let line = timeout(Duration::from_secs(1), lines.next_line())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.as_deref(), Some("P1 LEVEL:40"));

    link.shutdown();
    engine.shutdown().unwrap();
}

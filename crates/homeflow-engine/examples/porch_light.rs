//! A porch light that follows a motion sensor, with simulated hardware on
//! an in-memory line-protocol link.
//!
//! Run with `RUST_LOG=debug cargo run --example porch_light`.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::info;

use homeflow_core::config::EngineConfig;
use homeflow_devices::{DriverOptions, LineCodec, LinkDriver, StreamTransport};
use homeflow_engine::{ControllerConfig, Engine};

const DEVICES: &str = r#"
[[device]]
name = "motion"
kind = "motion"
address = "M1"
drivers = ["serial"]
retrigger_delay = 2

[[device]]
name = "porch"
kind = "light"
address = "L1"
drivers = ["serial"]
devices = ["motion"]
initial = "off"

[[device.map]]
command = "motion"
mapped = "on"

[[device.map]]
command = "still"
mapped = "level:30"

[device.idle]
mapped = "off"
seconds = 3
"#;

/// Acknowledge every line, and report motion once the controller is up
async fn hardware(stream: DuplexStream) -> Result<()> {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    tokio::time::sleep(Duration::from_millis(200)).await;
    write.write_all(b"M1 MOTION\n").await?;

    while let Some(line) = lines.next_line().await? {
        info!(line = %line, "Hardware received");
        write.write_all(format!("OK {}\n", line).as_bytes()).await?;
        if line == "L1 ON" {
            write.write_all(b"M1 STILL\n").await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    homeflow_core::logging::init_with_filter("info")?;

    let settings = EngineConfig::default();
    let engine = Engine::new(settings.clone())?;

    let (transport, hardware_side) = StreamTransport::memory(1024);
    let link = LinkDriver::spawn(
        "serial",
        transport,
        LineCodec::new(),
        DriverOptions::from_config(&settings),
    );
    engine.register_driver(link.clone())?;
    tokio::spawn(hardware(hardware_side));

    let config = ControllerConfig::from_toml(DEVICES)?;
    engine.load(&config);

    let mut events = engine.subscribe();
    let watch = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "Registry event");
        }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    for device in engine.devices()? {
        println!("{:>8}  {:<10}  previous {}", device.name, device.state, device.previous_state);
    }

    engine.shutdown()?;
    link.shutdown();
    watch.abort();
    Ok(())
}

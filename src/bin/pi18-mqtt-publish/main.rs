mod config;
mod logging;
mod rumqttc_wrapper;

use anyhow::{bail, Context};
use config::Config;
use log::{debug, error, info};
use pi18::inverter::{Inverter, TickOutcome};
use pi18::metric_collector::{LogCollector, SensorBindings};
use pi18::simple_mqtt::SimpleMqtt;
use pi18::transport::SerialTransport;
use rumqttc_wrapper::RumqttcWrapper;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// upper bound for one sleep, so ctrl-c is handled promptly between cycles
const IDLE_SLICE: Duration = Duration::from_millis(100);

/// config.toml in the current working dir, or next to the executable if absent
fn config_path() -> anyhow::Result<PathBuf> {
    let mut path = std::env::current_dir().context("can't retrieve current dir")?;
    path.push("config.toml");
    if !path.exists() {
        path = std::env::current_exe().context("Unable to get current executable path")?;
        path.pop();
        path.push("config.toml");
    }
    Ok(path)
}

fn main() -> anyhow::Result<()> {
    let path = config_path()?;
    let config = Config::load(&path);
    logging::init_logger(
        config
            .as_ref()
            .is_ok_and(|config| config.debug.unwrap_or(false)),
    );

    info!("Running revision: {}", env!("GIT_HASH"));
    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml in its path");
    }
    info!("loaded configuration from {}", path.display());

    let config = config?;
    if !config.is_valid() {
        bail!(
            "{} is incomplete: serial_port is required, intervals and thresholds must be positive",
            path.display()
        );
    }

    let sensors = config.sensors();
    let mut bindings = SensorBindings::default();
    match &config.simple_mqtt {
        Some(mqtt_config) => {
            info!("Publishing to simple MQTT broker {}", mqtt_config.host);
            let collector = Arc::new(Mutex::new(SimpleMqtt::<RumqttcWrapper>::new(mqtt_config)));
            bindings.bind_shared(&sensors, &collector);
        }
        None => {
            info!("No MQTT broker configured, readings are logged only");
            bindings.bind_shared(&sensors, &Arc::new(Mutex::new(LogCollector)));
        }
    }

    info!("inverter port: {}", config.serial_port);
    let transport = SerialTransport::open(&config.serial_port, config.baud_rate())
        .with_context(|| format!("cannot open {}", config.serial_port))?;

    let driver_config = config.driver_config();
    let interval = driver_config.poll_interval;
    let mut inverter = Inverter::new(transport, driver_config, bindings);

    let shutdown = inverter.shutdown_handle();
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("cannot install ctrl-c handler")?;

    let mut next_tick = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep((next_tick - now).min(IDLE_SLICE));
            continue;
        }

        match inverter.tick(now) {
            TickOutcome::Published { query, fields } => {
                debug!("{query}: published {fields} values")
            }
            outcome => debug!("{outcome:?}"),
        }

        next_tick += interval;
        let finished = Instant::now();
        if next_tick <= finished {
            debug!("poll cycle overran the update interval, dropping missed ticks");
            while next_tick <= finished {
                next_tick += interval;
            }
        }
    }

    info!("shutting down");
    Ok(())
}

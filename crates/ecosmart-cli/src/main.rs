//! Command-line interface for EcoSmart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use ecosmart_agents::weather::build_forecast;
use ecosmart_agents::{plan, EcoSystem, PlanInput, PlanSettings, SimulatedWeather};
use ecosmart_core::config::env_vars;
use ecosmart_core::sink::PERSISTED_TOPICS;
use ecosmart_core::{
    attach_sink, EventBus, Generation, MemorySink, NoOpSink, SystemConfig, WeatherSource,
};
use ecosmart_messages::{ChannelRegistry, ConsoleChannel, NotificationBridge};

/// EcoSmart - multi-agent household energy coordination.
#[derive(Parser, Debug)]
#[command(name = "ecosmart")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. Falls back to ECOSMART_CONFIG, then defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent pipeline against the simulated household.
    Run {
        /// Simulator seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Keep every persistable record in memory and print counts on exit.
        #[arg(long)]
        record: bool,
    },
    /// Compute one decision from a simulated forecast and print it as JSON.
    Plan {
        /// Local hour to plan from (0-23). Defaults to now.
        #[arg(long)]
        hour: Option<u8>,
        /// Override the simulated outdoor temperature.
        #[arg(long)]
        temperature: Option<f64>,
    },
    /// Validate the configuration and print the effective settings.
    CheckConfig {
        /// Print the full configuration as TOML.
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Run {
            seed,
            duration_secs,
            record,
        } => run_pipeline(config, seed, duration_secs, record).await,
        Command::Plan { hour, temperature } => run_plan(&config, hour, temperature),
        Command::CheckConfig { print } => check_config(&config, print),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "ecosmart={level},ecosmart_core={level},ecosmart_devices={level},\
             ecosmart_agents={level},ecosmart_messages={level}"
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<SystemConfig> {
    let config = match path {
        Some(path) => SystemConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SystemConfig::from_env().context("Failed to load config")?,
    };
    Ok(config)
}

async fn run_pipeline(
    config: SystemConfig,
    seed: u64,
    duration_secs: Option<u64>,
    record: bool,
) -> Result<()> {
    let bus = EventBus::with_name("ecosmart");

    let recorder = Arc::new(MemorySink::new());
    let _sink = if record {
        attach_sink(&bus, recorder.clone())
    } else {
        attach_sink(&bus, Arc::new(NoOpSink))
    };

    let channels = Arc::new(ChannelRegistry::new());
    channels
        .register(Arc::new(ConsoleChannel::new("console")))
        .await;
    let _bridge = NotificationBridge::new(channels).attach(&bus);

    let mut system = EcoSystem::simulated(&config, bus, seed)?;
    system.start().await?;
    println!(
        "EcoSmart running: {} devices, site {} (Ctrl-C to stop)",
        system.registry().len(),
        config.site.location
    );

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C")?,
            }
        }
        None => tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?,
    }

    system.stop().await?;
    print_summary(&system);
    if record {
        println!("Records:");
        for topic in PERSISTED_TOPICS {
            println!("  {:<12} {}", topic.as_str(), recorder.records_for(topic).len());
        }
    }
    Ok(())
}

fn print_summary(system: &EcoSystem) {
    let monitor = system.monitor().stats();
    let optimizer = system.optimizer().stats();
    let controller = system.controller().stats();
    let summary = system.monitor().consumption_summary();

    println!(
        "Monitor:    {} readings, {} anomalies, {} read failures",
        monitor.readings, monitor.anomalies, monitor.read_failures
    );
    println!(
        "            last batch {:.0} W across {} active devices",
        summary.total_watts, summary.active_devices
    );
    if let Some(snapshot) = system.weather().snapshot() {
        println!(
            "Weather:    {:.1} C, {:?}{}",
            snapshot.temperature_c,
            snapshot.source,
            if snapshot.stale { " (stale)" } else { "" }
        );
    }
    println!(
        "Optimizer:  {} runs, {:.2} projected savings",
        optimizer.runs, optimizer.cumulative_projected_savings
    );
    println!(
        "Controller: {} applied, {} rejected, {} safety blocks, {} overrides",
        controller.applied,
        controller.rejected,
        controller.safety_blocks,
        controller.overrides_handled
    );
    for health in system.health() {
        println!("  {:<10} {}", health.agent, health.state);
    }
}

/// Planning instant: today at local `hour`, or now.
fn plan_start(config: &SystemConfig, hour: Option<u8>) -> Result<DateTime<Utc>> {
    let Some(hour) = hour else {
        return Ok(Utc::now());
    };
    let offset = config.site.offset();
    let naive = Utc::now()
        .with_timezone(&offset)
        .date_naive()
        .and_hms_opt(u32::from(hour), 0, 0)
        .with_context(|| format!("Invalid hour {hour}, expected 0-23"))?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .context("Ambiguous local time")?;
    Ok(local.with_timezone(&Utc))
}

fn run_plan(config: &SystemConfig, hour: Option<u8>, temperature: Option<f64>) -> Result<()> {
    let now = plan_start(config, hour)?;
    let offset = config.site.offset();
    let mut reading =
        SimulatedWeather::new(config.weather.simulated_base_temp_c, offset).reading_at(now);
    if let Some(temperature) = temperature {
        reading.temperature_c = temperature;
    }

    let forecast = build_forecast(
        Generation(1),
        &reading,
        WeatherSource::Simulated,
        false,
        now,
        config.weather.base_demand_w,
        &config.weather,
        offset,
    );
    let settings = PlanSettings::from(&config.optimizer);
    let observed = HashMap::new();
    let decision = plan(&PlanInput {
        generation: Generation(1),
        now,
        forecast: &forecast,
        pricing: &config.pricing,
        devices: &config.devices,
        observed_watts: &observed,
        consumption: None,
        settings: &settings,
    })?;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn check_config(config: &SystemConfig, print: bool) -> Result<()> {
    if print {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    println!("Configuration OK");
    println!(
        "  site:      {} (UTC{:+})",
        config.site.location,
        f64::from(config.site.utc_offset_minutes) / 60.0
    );
    println!("  devices:   {}", config.devices.len());
    for device in &config.devices {
        println!(
            "    {:<18} {:>7.0} W  {:<8} {}",
            device.id,
            device.power_watts,
            device.priority.as_str(),
            if device.controllable { "controllable" } else { "fixed" }
        );
    }
    println!("  tariff:");
    for range in &config.pricing.ranges {
        println!(
            "    {:02}-{:02}  {:<8} {:.2}/kWh",
            range.start_hour,
            range.end_hour,
            range.tier.as_str(),
            range.rate
        );
    }
    println!(
        "  monitor:   every {:?}, anomaly threshold {:.0}%",
        config.monitor.poll_interval(),
        config.monitor.anomaly_threshold * 100.0
    );
    println!("  weather:   every {:?}", config.weather.refresh_interval());
    println!("  optimizer: debounce {:?}", config.optimizer.debounce());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[site]\nlocation = \"Rabat\"\n\n[monitor]\nanomaly_threshold = 0.3\n"
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.site.location, "Rabat");
        assert_eq!(config.monitor.anomaly_threshold, 0.3);
        assert_eq!(config.devices.len(), 6);
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nanomaly_threshold = 1.5\n").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_plan_start_uses_local_hour() {
        let config = SystemConfig::default();
        let start = plan_start(&config, Some(12)).unwrap();
        assert_eq!(ecosmart_core::model::local_hour(start, config.site.offset()), 12);
        assert!(plan_start(&config, Some(24)).is_err());
    }

    #[test]
    fn test_plan_runs_for_default_household() {
        let config = SystemConfig::default();
        assert!(run_plan(&config, Some(12), Some(30.0)).is_ok());
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use meter_poller::cli::Args;
use meter_poller::config::Config;
use meter_poller::decoder::DecoderCommand;
use meter_poller::derived::DewpointConstants;
use meter_poller::meter::MeterReader;
use meter_poller::orchestrator::Orchestrator;
use meter_poller::scheduler::{Poller, Schedule, Sinks};
use meter_poller::sink::InfluxSink;
use meter_poller::weather::{weather_command, WeatherReader};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,meter_poller=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn build_poller(config: &Config) -> Result<Poller<InfluxSink>> {
    let http = reqwest::Client::new();

    tracing::info!(
        host = %config.influx_host,
        port = config.influx_port,
        database = %config.weather_database,
        "writing weather readings"
    );
    let weather_sink = InfluxSink::new(
        http.clone(),
        &config.influx_host,
        config.influx_port,
        &config.weather_database,
    )
    .context("invalid InfluxDB address")?;

    let meter_sink = match &config.meter_database {
        Some(database) => {
            tracing::info!(database = %database, "writing meter readings");
            Some(
                InfluxSink::new(http, &config.influx_host, config.influx_port, database)
                    .context("invalid InfluxDB address")?,
            )
        }
        None => None,
    };

    let meters = MeterReader::new(
        DecoderCommand::new(config.rtlamr_bin.as_str()),
        config.rtl_tcp.clone(),
        config.meter_ids.clone(),
    );
    let weather = config.weather_enabled.then(|| {
        WeatherReader::new(
            weather_command(
                DecoderCommand::new(config.rtl433_bin.as_str()),
                config.rtl_tcp.as_deref(),
            ),
            DewpointConstants::default(),
        )
    });

    if !config.meter_ids.any() {
        tracing::info!("no meter ids configured; reading weather only");
    }
    if !config.tags.is_empty() {
        tracing::info!(tags = ?config.tags, "found tags");
    }

    Ok(Poller::new(
        Orchestrator::new(meters, weather),
        Schedule::new(config.interval, config.water_every_ticks)
            .with_decoder_timeout(config.decoder_timeout),
        Sinks {
            weather: Some(weather_sink),
            meters: meter_sink,
        },
        config.weather_tags(),
        config.meter_tags(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;
    let config = Config::from_args(args)?;
    let poller = build_poller(&config)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = poller.run() => {}
    }

    Ok(())
}

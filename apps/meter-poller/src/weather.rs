use crate::decoder::{stream_messages, DecoderCommand, DecoderError, StreamOutcome};
use crate::derived::{celsius_to_fahrenheit, DewpointConstants};
use serde_json::Value;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::Instant;

/// LaCrosse TX141-style sensor on 434.0787 MHz, rtl_433 protocol 34.
const WEATHER_FREQUENCY_HZ: &str = "434078700";
const WEATHER_PROTOCOL: &str = "34";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherReading {
    pub temp_c: f64,
    pub temp_f: f64,
    pub rh: f64,
    pub dew_c: f64,
    pub dew_f: f64,
}

impl WeatherReading {
    /// `None` when the sensor values fall outside the dewpoint formula's domain.
    pub fn derive(temp_c: f64, rh: f64, constants: &DewpointConstants) -> Option<Self> {
        if !constants.valid_input(temp_c, rh) {
            return None;
        }
        let dew_c = constants.dewpoint_c(temp_c, rh);
        Some(Self {
            temp_c,
            temp_f: celsius_to_fahrenheit(temp_c),
            rh,
            dew_c,
            dew_f: celsius_to_fahrenheit(dew_c),
        })
    }
}

#[derive(Debug, Default)]
struct Observed {
    humidity: Option<f64>,
    temperature_c: Option<f64>,
}

impl Observed {
    fn absorb(&mut self, message: &Value) {
        if let Some(value) = numeric_field(message, "humidity") {
            self.humidity = Some(value);
        }
        if let Some(value) = numeric_field(message, "temperature_C") {
            self.temperature_c = Some(value);
        }
    }

    fn complete(&self) -> Option<(f64, f64)> {
        Some((self.temperature_c?, self.humidity?))
    }
}

fn numeric_field(message: &Value, field: &str) -> Option<f64> {
    match message.get(field)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// rtl_433 invocation for the weather sensor; `server` is an rtl_tcp
/// `host:port` when the radio is remote.
pub fn weather_command(rtl_433: DecoderCommand, server: Option<&str>) -> DecoderCommand {
    let mut command = rtl_433;
    if let Some(server) = server {
        command = command.arg("-d").arg(format!("rtl_tcp:{server}"));
    }
    command
        .args(["-f", WEATHER_FREQUENCY_HZ, "-R", WEATHER_PROTOCOL, "-F", "json"])
}

#[derive(Debug, Clone)]
pub struct WeatherReader {
    command: DecoderCommand,
    constants: DewpointConstants,
}

impl WeatherReader {
    pub fn new(command: DecoderCommand, constants: DewpointConstants) -> Self {
        Self { command, constants }
    }

    /// Reads until both humidity and temperature have been seen. Returns
    /// `Ok(None)` when the stream ends or times out first, or when the pair is
    /// physically implausible.
    pub async fn read(&self, timeout: Duration) -> Result<Option<WeatherReading>, DecoderError> {
        let mut observed = Observed::default();
        let deadline = Instant::now() + timeout;
        let outcome = stream_messages(&self.command, deadline, |message| {
            observed.absorb(&message);
            if observed.complete().is_some() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;

        let Some((temp_c, rh)) = observed.complete() else {
            tracing::info!(outcome = ?outcome, "weather decoder ended without humidity + temperature");
            return Ok(None);
        };
        debug_assert_eq!(outcome, StreamOutcome::Completed);

        let reading = WeatherReading::derive(temp_c, rh, &self.constants);
        if reading.is_none() {
            tracing::warn!(temp_c, rh, "implausible weather sensor values; skipping");
        }
        Ok(reading)
    }
}

use crate::meter::{GasElectric, MeterKind, MeterReader, MeterReading};
use crate::metrics::{batch_json, MetricPoint, TagSet};
use crate::sink::{MetricSink, SinkError};
use crate::weather::{WeatherReader, WeatherReading};
use chrono::{DateTime, Utc};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone)]
pub struct Orchestrator {
    meters: MeterReader,
    weather: Option<WeatherReader>,
}

impl Orchestrator {
    pub fn new(meters: MeterReader, weather: Option<WeatherReader>) -> Self {
        Self { meters, weather }
    }

    pub fn meters(&self) -> &MeterReader {
        &self.meters
    }

    /// Returns the number of points handed to `sink`.
    pub async fn read_gas_and_electric<S: MetricSink>(
        &self,
        sink: Option<&S>,
        timestamp: DateTime<Utc>,
        base_tags: &TagSet,
        timeout: Duration,
    ) -> Result<usize, SinkError> {
        let ids = self.meters.ids();
        if ids.gas.is_none() && ids.electric.is_none() {
            return Ok(0);
        }

        let readings = self.meters.read_gas_and_electric(timeout).await;
        if readings.is_empty() {
            tracing::info!("no gas or electric readings this tick");
            return Ok(0);
        }
        if let Some(gas) = readings.gas {
            tracing::info!("Gas: {gas} CCF");
        }
        if let Some(electric) = readings.electric {
            tracing::info!("Electric: {electric} KWH");
        }

        let batch = gas_electric_batch(&self.meters, &readings, timestamp, base_tags);
        submit(sink, &batch).await
    }

    pub async fn read_water<S: MetricSink>(
        &self,
        sink: Option<&S>,
        timestamp: DateTime<Utc>,
        base_tags: &TagSet,
        timeout: Duration,
    ) -> Result<usize, SinkError> {
        let MeterReading::Value(reading) = self.meters.read_water(timeout).await else {
            return Ok(0);
        };
        tracing::info!("Water: {reading} HCF");

        let batch: Vec<MetricPoint> =
            meter_point(&self.meters, MeterKind::Water, reading, timestamp, base_tags)
                .into_iter()
                .collect();
        submit(sink, &batch).await
    }

    pub async fn read_weather<S: MetricSink>(
        &self,
        sink: Option<&S>,
        timestamp: DateTime<Utc>,
        tags: &TagSet,
        timeout: Duration,
    ) -> Result<usize, SinkError> {
        let Some(weather) = &self.weather else {
            return Ok(0);
        };
        let reading = match weather.read(timeout).await {
            Ok(Some(reading)) => reading,
            Ok(None) => return Ok(0),
            Err(err) => {
                tracing::warn!(error = %err, "weather decoder failed");
                return Ok(0);
            }
        };
        tracing::info!(
            "Temp: {}C {}F, RH: {}%, Dewpoint: {}C {}F",
            reading.temp_c,
            reading.temp_f,
            reading.rh,
            reading.dew_c,
            reading.dew_f
        );

        let batch = weather_batch(&reading, timestamp, tags);
        submit(sink, &batch).await
    }
}

fn meter_point(
    meters: &MeterReader,
    kind: MeterKind,
    reading: f64,
    timestamp: DateTime<Utc>,
    base_tags: &TagSet,
) -> Option<MetricPoint> {
    let meter_id = meters.ids().get(kind)?;
    let tags = base_tags
        .with("meterid", meter_id)
        .insert("units", kind.units())
        .insert("version", SCHEMA_VERSION);
    Some(MetricPoint::new(kind.measurement(), tags, timestamp).field("reading", reading))
}

pub fn gas_electric_batch(
    meters: &MeterReader,
    readings: &GasElectric,
    timestamp: DateTime<Utc>,
    base_tags: &TagSet,
) -> Vec<MetricPoint> {
    [
        (MeterKind::Gas, readings.gas),
        (MeterKind::Electric, readings.electric),
    ]
    .into_iter()
    .filter_map(|(kind, reading)| meter_point(meters, kind, reading?, timestamp, base_tags))
    .collect()
}

pub fn weather_batch(
    reading: &WeatherReading,
    timestamp: DateTime<Utc>,
    tags: &TagSet,
) -> Vec<MetricPoint> {
    vec![
        MetricPoint::new("temperature", tags.clone(), timestamp)
            .field("tempC", reading.temp_c)
            .field("tempF", reading.temp_f),
        MetricPoint::new("humidity", tags.clone(), timestamp).field("rh", reading.rh),
        MetricPoint::new("dewpoint", tags.clone(), timestamp)
            .field("dewC", reading.dew_c)
            .field("dewF", reading.dew_f),
    ]
}

async fn submit<S: MetricSink>(sink: Option<&S>, batch: &[MetricPoint]) -> Result<usize, SinkError> {
    if batch.is_empty() {
        return Ok(0);
    }
    tracing::debug!(batch = %batch_json(batch), "metric batch");
    let Some(sink) = sink else {
        tracing::debug!(points = batch.len(), "no sink configured; batch logged only");
        return Ok(0);
    };
    sink.write_points(batch).await?;
    Ok(batch.len())
}

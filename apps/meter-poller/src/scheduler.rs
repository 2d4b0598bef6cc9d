use crate::metrics::TagSet;
use crate::orchestrator::Orchestrator;
use crate::sink::MetricSink;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WATER_EVERY_TICKS: u64 = 6;
pub const DEFAULT_DECODER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub water_every_ticks: u64,
    /// Budget for each decoder run, never longer than the interval.
    pub decoder_timeout: Duration,
}

impl Schedule {
    pub fn new(interval: Duration, water_every_ticks: u64) -> Self {
        Self {
            interval,
            water_every_ticks: water_every_ticks.max(1),
            decoder_timeout: DEFAULT_DECODER_TIMEOUT.min(interval),
        }
    }

    pub fn with_decoder_timeout(mut self, timeout: Duration) -> Self {
        self.decoder_timeout = timeout.min(self.interval);
        self
    }

    // Counted in ticks, so slow ticks never shift the water cadence.
    pub fn water_due(&self, tick: u64) -> bool {
        tick % self.water_every_ticks.max(1) == 0
    }
}

/// Time left in the tick after the reads took `elapsed`; zero once the reads
/// overran the interval.
pub fn sleep_after(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub water_read: bool,
    pub points_written: usize,
    pub elapsed: Duration,
    pub sleep: Duration,
}

#[derive(Debug, Clone)]
pub struct Sinks<S> {
    pub weather: Option<S>,
    pub meters: Option<S>,
}

pub struct Poller<S> {
    orchestrator: Orchestrator,
    schedule: Schedule,
    sinks: Sinks<S>,
    weather_tags: TagSet,
    meter_tags: TagSet,
    tick: u64,
}

impl<S: MetricSink> Poller<S> {
    pub fn new(
        orchestrator: Orchestrator,
        schedule: Schedule,
        sinks: Sinks<S>,
        weather_tags: TagSet,
        meter_tags: TagSet,
    ) -> Self {
        Self {
            orchestrator,
            schedule,
            sinks,
            weather_tags,
            meter_tags,
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// One pass over every due read. Each decoder run gets its own
    /// `decoder_timeout`, so a silent decoder only costs its own reading.
    /// Advances the tick counter but does not sleep.
    pub async fn run_tick(&mut self) -> TickReport {
        let started = Instant::now();
        let timeout = self.schedule.decoder_timeout;
        let timestamp = Utc::now();
        let tick = self.tick;
        let mut points_written = 0;

        match self
            .orchestrator
            .read_weather(self.sinks.weather.as_ref(), timestamp, &self.weather_tags, timeout)
            .await
        {
            Ok(points) => points_written += points,
            Err(err) => tracing::warn!(error = %err, tick, "failed to write weather batch"),
        }

        match self
            .orchestrator
            .read_gas_and_electric(self.sinks.meters.as_ref(), timestamp, &self.meter_tags, timeout)
            .await
        {
            Ok(points) => points_written += points,
            Err(err) => tracing::warn!(error = %err, tick, "failed to write gas/electric batch"),
        }

        let water_read = self.orchestrator.meters().ids().water.is_some()
            && self.schedule.water_due(tick);
        if water_read {
            match self
                .orchestrator
                .read_water(self.sinks.meters.as_ref(), timestamp, &self.meter_tags, timeout)
                .await
            {
                Ok(points) => points_written += points,
                Err(err) => tracing::warn!(error = %err, tick, "failed to write water batch"),
            }
        }

        let elapsed = started.elapsed();
        let sleep = sleep_after(self.schedule.interval, elapsed);
        self.tick = self.tick.wrapping_add(1);

        TickReport {
            tick,
            water_read,
            points_written,
            elapsed,
            sleep,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.schedule.interval.as_secs(),
            water_every_ticks = self.schedule.water_every_ticks,
            decoder_timeout_secs = self.schedule.decoder_timeout.as_secs(),
            "poller started"
        );
        loop {
            let report = self.run_tick().await;
            tracing::info!(
                tick = report.tick,
                points = report.points_written,
                "Readings took {:.3} seconds, sleeping {:.3} seconds",
                report.elapsed.as_secs_f64(),
                report.sleep.as_secs_f64()
            );
            tokio::time::sleep(report.sleep).await;
        }
    }
}

use crate::cli::Args;
use crate::meter::MeterIds;
use crate::metrics::TagSet;
use crate::scheduler::{DEFAULT_DECODER_TIMEOUT, DEFAULT_WATER_EVERY_TICKS};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub influx_host: String,
    pub influx_port: u16,
    pub weather_database: String,
    pub meter_database: Option<String>,

    pub hostname: String,
    pub tags: Vec<(String, String)>,

    pub interval: Duration,
    pub water_every_ticks: u64,
    pub decoder_timeout: Duration,

    pub rtl_tcp: Option<String>,
    pub meter_ids: MeterIds,
    pub weather_enabled: bool,
    pub rtlamr_bin: String,
    pub rtl433_bin: String,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        let lookup = |key: &str| env::var(key).ok();
        Self::resolve(args, &Env { lookup: &lookup })
    }

    fn resolve(args: Args, env: &Env<'_>) -> Result<Self> {
        let influx_host = pick_string(args.influx_server, env, "METER_POLLER_INFLUX_SERVER", "localhost")?;
        let influx_port = match args.influx_port {
            Some(port) => port,
            None => u16::try_from(env.u64("METER_POLLER_INFLUX_PORT", Some(8086))?)
                .context("invalid METER_POLLER_INFLUX_PORT")?,
        };
        let weather_database =
            pick_string(args.influx_database, env, "METER_POLLER_INFLUX_DATABASE", "pi_dht")?;
        let meter_database = pick_optional(args.meter_database, env, "METER_POLLER_METER_DATABASE");

        let hostname = env
            .optional("METER_POLLER_HOSTNAME")
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string());
        let tags = match args.tags.or_else(|| env.optional("METER_POLLER_TAGS")) {
            Some(raw) => parse_tags(&raw)?,
            None => Vec::new(),
        };

        let interval_minutes = match args.interval {
            Some(minutes) => minutes,
            None => env.u64("METER_POLLER_INTERVAL_MINUTES", Some(5))?,
        };
        if interval_minutes == 0 {
            bail!("interval must be at least one minute");
        }
        let interval_secs = interval_minutes
            .checked_mul(60)
            .ok_or_else(|| anyhow!("interval of {interval_minutes} minutes is too large"))?;
        let interval = Duration::from_secs(interval_secs);

        let water_every_ticks = match args.water_every_ticks {
            Some(ticks) => ticks,
            None => env.u64("METER_POLLER_WATER_EVERY_TICKS", Some(DEFAULT_WATER_EVERY_TICKS))?,
        };
        if water_every_ticks == 0 {
            bail!("water cadence must be at least one tick");
        }

        let decoder_timeout_secs = match args.decoder_timeout {
            Some(secs) => secs,
            None => env.u64(
                "METER_POLLER_DECODER_TIMEOUT_SECS",
                Some(DEFAULT_DECODER_TIMEOUT.as_secs()),
            )?,
        };
        if decoder_timeout_secs == 0 {
            bail!("decoder timeout must be at least one second");
        }
        let decoder_timeout = Duration::from_secs(decoder_timeout_secs);

        let rtl_tcp = match pick_optional(args.rtltcp_ip, env, "METER_POLLER_RTLTCP_IP") {
            Some(ip) => {
                let port = match args.rtltcp_port {
                    Some(port) => port,
                    None => u16::try_from(env.u64("METER_POLLER_RTLTCP_PORT", Some(1234))?)
                        .context("invalid METER_POLLER_RTLTCP_PORT")?,
                };
                Some(format!("{ip}:{port}"))
            }
            None => None,
        };

        let meter_ids = MeterIds {
            electric: pick_optional(args.electric_id, env, "METER_POLLER_ELECTRIC_ID"),
            gas: pick_optional(args.gas_id, env, "METER_POLLER_GAS_ID"),
            water: pick_optional(args.water_id, env, "METER_POLLER_WATER_ID"),
        };

        let weather_enabled = !args.no_weather && !env.flag("METER_POLLER_NO_WEATHER");
        let rtlamr_bin = pick_string(args.rtlamr_bin, env, "METER_POLLER_RTLAMR_BIN", "rtlamr")?;
        let rtl433_bin = pick_string(args.rtl433_bin, env, "METER_POLLER_RTL433_BIN", "rtl_433")?;

        Ok(Self {
            influx_host,
            influx_port,
            weather_database,
            meter_database,
            hostname,
            tags,
            interval,
            water_every_ticks,
            decoder_timeout,
            rtl_tcp,
            meter_ids,
            weather_enabled,
            rtlamr_bin,
            rtl433_bin,
        })
    }

    /// `hostname` plus the user tags, for the weather measurements.
    pub fn weather_tags(&self) -> TagSet {
        self.tags
            .iter()
            .fold(self.meter_tags(), |tags, (key, value)| tags.insert(key.as_str(), value.as_str()))
    }

    pub fn meter_tags(&self) -> TagSet {
        TagSet::new().insert("hostname", self.hostname.as_str())
    }
}

/// Parses `name=value,name=value`. Blank entries are ignored.
pub fn parse_tags(raw: &str) -> Result<Vec<(String, String)>> {
    let mut tags = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid tag `{entry}`; expected name=value"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid tag `{entry}`; name is empty");
        }
        tags.push((key.to_string(), value.trim().to_string()));
    }
    Ok(tags)
}

fn pick_string(arg: Option<String>, env: &Env<'_>, key: &str, default: &str) -> Result<String> {
    match arg {
        Some(value) => Ok(value.trim().to_string()),
        None => env.string(key, Some(default.to_string())),
    }
}

fn pick_optional(arg: Option<String>, env: &Env<'_>, key: &str) -> Option<String> {
    arg.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| env.optional(key))
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, key: &str, default: Option<String>) -> Result<String> {
        match (self.lookup)(key) {
            Some(value) => Ok(value.trim().to_string()),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match (self.lookup)(key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.optional(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

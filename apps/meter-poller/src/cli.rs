use clap::Parser;

/// Every flag falls back to a `METER_POLLER_*` env var, then a default.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "meter-poller",
    version,
    about = "Poll rtlamr / rtl_433 decoders and forward readings to InfluxDB"
)]
pub struct Args {
    /// InfluxDB host.
    #[arg(long)]
    pub influx_server: Option<String>,
    #[arg(long)]
    pub influx_port: Option<u16>,
    /// Database for weather readings.
    #[arg(long)]
    pub influx_database: Option<String>,
    /// Database for meter readings; meters are only logged without it.
    #[arg(long)]
    pub meter_database: Option<String>,
    /// Extra tags in the form name=value,name=value.
    #[arg(long)]
    pub tags: Option<String>,
    /// Minutes between readings.
    #[arg(long)]
    pub interval: Option<u64>,
    /// rtl_tcp server address; the radio is assumed local when unset.
    #[arg(long)]
    pub rtltcp_ip: Option<String>,
    #[arg(long)]
    pub rtltcp_port: Option<u16>,
    #[arg(long)]
    pub electric_id: Option<String>,
    #[arg(long)]
    pub gas_id: Option<String>,
    #[arg(long)]
    pub water_id: Option<String>,
    /// Read the water meter once every N ticks.
    #[arg(long)]
    pub water_every_ticks: Option<u64>,
    /// Seconds each decoder run may take before it is killed.
    #[arg(long)]
    pub decoder_timeout: Option<u64>,
    /// Skip the rtl_433 weather sensor.
    #[arg(long, default_value_t = false)]
    pub no_weather: bool,
    #[arg(long)]
    pub rtlamr_bin: Option<String>,
    #[arg(long)]
    pub rtl433_bin: Option<String>,
}

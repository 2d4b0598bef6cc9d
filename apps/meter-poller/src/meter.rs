use crate::decoder::{read_matching, DecoderCommand};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Meters report consumption in hundredths of the billing unit.
const CONSUMPTION_SCALE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterKind {
    Electric,
    Gas,
    Water,
}

impl MeterKind {
    /// rtlamr `-msgtype` filter. The decoder accepts one per run.
    pub fn msgtype(self) -> &'static str {
        match self {
            MeterKind::Electric => "scm",
            MeterKind::Gas => "scm+",
            MeterKind::Water => "r900bcd",
        }
    }

    pub fn id_field(self) -> &'static str {
        match self {
            MeterKind::Electric | MeterKind::Water => "ID",
            MeterKind::Gas => "EndpointID",
        }
    }

    pub fn units(self) -> &'static str {
        match self {
            MeterKind::Electric => "kwh",
            MeterKind::Gas => "ccf",
            MeterKind::Water => "hcf",
        }
    }

    pub fn measurement(self) -> &'static str {
        match self {
            MeterKind::Electric => "electric",
            MeterKind::Gas => "gas",
            MeterKind::Water => "water",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractError {
    #[error("message has no `{0}` field")]
    MissingField(&'static str),
    #[error("`{field}` is not numeric: {raw}")]
    NotNumeric { field: &'static str, raw: String },
}

/// Configured meter identities. `None` disables reads of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterIds {
    pub electric: Option<String>,
    pub gas: Option<String>,
    pub water: Option<String>,
}

impl MeterIds {
    pub fn get(&self, kind: MeterKind) -> Option<&str> {
        match kind {
            MeterKind::Electric => self.electric.as_deref(),
            MeterKind::Gas => self.gas.as_deref(),
            MeterKind::Water => self.water.as_deref(),
        }
    }

    pub fn any(&self) -> bool {
        self.electric.is_some() || self.gas.is_some() || self.water.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeterReading {
    Value(f64),
    NotConfigured,
    Failed,
}

impl MeterReading {
    pub fn value(self) -> Option<f64> {
        match self {
            MeterReading::Value(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GasElectric {
    pub gas: Option<f64>,
    pub electric: Option<f64>,
}

impl GasElectric {
    pub fn is_empty(&self) -> bool {
        self.gas.is_none() && self.electric.is_none()
    }
}

// rtlamr wraps the payload in `Message`; older builds and replayed captures
// put the fields at the top level.
fn message_body(message: &Value) -> &Value {
    message.get("Message").unwrap_or(message)
}

/// Meter identity carried by `message`, rendered as a string so `"0123"` and
/// `123` never compare equal by accident.
pub fn meter_id(kind: MeterKind, message: &Value) -> Option<String> {
    match message_body(message).get(kind.id_field())? {
        Value::String(raw) => Some(raw.trim().to_string()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    }
}

/// Consumption in billing units (CCF, KWH or HCF depending on the meter).
pub fn consumption(message: &Value) -> Result<f64, ExtractError> {
    const FIELD: &str = "Consumption";
    let raw = message_body(message)
        .get(FIELD)
        .ok_or(ExtractError::MissingField(FIELD))?;
    let parsed = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed.filter(|value| value.is_finite()) {
        Some(value) => Ok(value / CONSUMPTION_SCALE),
        None => Err(ExtractError::NotNumeric {
            field: FIELD,
            raw: raw.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct MeterReader {
    rtlamr: DecoderCommand,
    server: Option<String>,
    ids: MeterIds,
}

impl MeterReader {
    /// `rtlamr` is the base invocation; per-read flags are appended to it.
    /// `server` is the rtl_tcp `host:port` to tune, if not local.
    pub fn new(rtlamr: DecoderCommand, server: Option<String>, ids: MeterIds) -> Self {
        Self {
            rtlamr,
            server,
            ids,
        }
    }

    pub fn ids(&self) -> &MeterIds {
        &self.ids
    }

    pub fn command(&self, kind: MeterKind, filter_ids: &[&str]) -> DecoderCommand {
        let mut command = self.rtlamr.clone().args([
            "-format",
            "json",
            "-msgtype",
            kind.msgtype(),
        ]);
        if let Some(server) = &self.server {
            command = command.arg("-server").arg(server.as_str());
        }
        command
            .arg("-filterid")
            .arg(filter_ids.join(","))
            .arg("-single")
            .arg("true")
    }

    pub async fn read(&self, kind: MeterKind, timeout: Duration) -> MeterReading {
        let Some(id) = self.ids.get(kind) else {
            return MeterReading::NotConfigured;
        };
        let command = self.command(kind, &[id]);
        let required: HashSet<String> = HashSet::from([id.to_string()]);

        let deadline = Instant::now() + timeout;
        let read = match read_matching(&command, &required, deadline, |message| {
            meter_id(kind, message)
        })
        .await
        {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(meter = kind.measurement(), error = %err, "meter decoder failed");
                return MeterReading::Failed;
            }
        };

        let Some(message) = read.messages.get(id) else {
            tracing::info!(meter = kind.measurement(), meter_id = id, outcome = ?read.outcome, "no data returned");
            return MeterReading::Failed;
        };

        match consumption(message) {
            Ok(value) => MeterReading::Value(value),
            Err(err) => {
                tracing::warn!(
                    meter = kind.measurement(),
                    meter_id = id,
                    error = %err,
                    message = %message,
                    "parse error"
                );
                MeterReading::Failed
            }
        }
    }

    /// One decoder run per message type, each with its own `timeout`; a
    /// failure on one side leaves the other reading intact.
    pub async fn read_gas_and_electric(&self, timeout: Duration) -> GasElectric {
        let gas = self.read(MeterKind::Gas, timeout).await.value();
        let electric = self.read(MeterKind::Electric, timeout).await.value();
        GasElectric { gas, electric }
    }

    pub async fn read_water(&self, timeout: Duration) -> MeterReading {
        self.read(MeterKind::Water, timeout).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Stand-in for rtlamr that prints `lines` whatever flags it is given.
    pub(crate) fn fake_decoder(lines: &[&str]) -> DecoderCommand {
        let quoted: Vec<String> = lines.iter().map(|line| format!("'{line}'")).collect();
        DecoderCommand::new("sh")
            .arg("-c")
            .arg(format!("printf '%s\\n' {}", quoted.join(" ")))
            .arg("fake-decoder")
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn meter_id_reads_nested_and_flat_shapes() {
        let nested = json!({"Message": {"ID": 123, "Consumption": 10}});
        let flat = json!({"ID": "123", "Consumption": "4500"});
        let gas = json!({"Message": {"EndpointID": "0042", "Consumption": 1}});

        assert_eq!(meter_id(MeterKind::Electric, &nested).as_deref(), Some("123"));
        assert_eq!(meter_id(MeterKind::Electric, &flat).as_deref(), Some("123"));
        assert_eq!(meter_id(MeterKind::Gas, &gas).as_deref(), Some("0042"));
        assert_eq!(meter_id(MeterKind::Electric, &gas), None);
    }

    #[test]
    fn consumption_scales_to_billing_units() {
        assert_eq!(consumption(&json!({"Consumption": "4500"})), Ok(45.0));
        assert_eq!(
            consumption(&json!({"Message": {"Consumption": 123456}})),
            Ok(1234.56)
        );
    }

    #[test]
    fn consumption_errors() {
        assert_eq!(
            consumption(&json!({"Message": {"ID": 1}})),
            Err(ExtractError::MissingField("Consumption"))
        );
        assert!(matches!(
            consumption(&json!({"Consumption": "n/a"})),
            Err(ExtractError::NotNumeric { .. })
        ));
        assert!(matches!(
            consumption(&json!({"Consumption": null})),
            Err(ExtractError::NotNumeric { .. })
        ));
    }

    #[test]
    fn command_carries_filters_and_server() {
        let reader = MeterReader::new(
            DecoderCommand::new("rtlamr"),
            Some("10.0.0.5:1234".to_string()),
            MeterIds::default(),
        );
        let command = reader.command(MeterKind::Gas, &["11", "22"]);
        assert_eq!(
            command.to_string(),
            "rtlamr -format json -msgtype scm+ -server 10.0.0.5:1234 -filterid 11,22 -single true"
        );

        let local = MeterReader::new(DecoderCommand::new("rtlamr"), None, MeterIds::default());
        assert!(!local.command(MeterKind::Water, &["7"]).args.contains(&"-server".to_string()));
    }

    #[tokio::test]
    async fn electric_reading_from_scm_line() {
        let reader = MeterReader::new(
            fake_decoder(&[r#"{"ID":"123","Consumption":"4500"}"#]),
            None,
            MeterIds {
                electric: Some("123".to_string()),
                ..MeterIds::default()
            },
        );
        assert_eq!(
            reader.read(MeterKind::Electric, TIMEOUT).await,
            MeterReading::Value(45.0)
        );
    }

    #[tokio::test]
    async fn gas_and_electric_are_read_independently() {
        let reader = MeterReader::new(
            fake_decoder(&[
                r#"{"Message":{"ID":99,"Consumption":1}}"#,
                r#"{"Message":{"EndpointID":555,"Consumption":120}}"#,
                r#"{"Message":{"ID":123,"Consumption":"4500"}}"#,
            ]),
            None,
            MeterIds {
                electric: Some("123".to_string()),
                gas: Some("555".to_string()),
                water: None,
            },
        );
        let readings = reader.read_gas_and_electric(TIMEOUT).await;
        assert_eq!(readings.gas, Some(1.2));
        assert_eq!(readings.electric, Some(45.0));
    }

    #[tokio::test]
    async fn parse_failure_omits_only_that_meter() {
        let reader = MeterReader::new(
            fake_decoder(&[
                r#"{"Message":{"EndpointID":555,"Consumption":120}}"#,
                r#"{"Message":{"ID":123,"Consumption":"garbage"}}"#,
            ]),
            None,
            MeterIds {
                electric: Some("123".to_string()),
                gas: Some("555".to_string()),
                water: None,
            },
        );
        let readings = reader.read_gas_and_electric(TIMEOUT).await;
        assert_eq!(readings.gas, Some(1.2));
        assert_eq!(readings.electric, None);
    }

    #[tokio::test]
    async fn silent_gas_decoder_does_not_hide_electric() {
        let script = r#"case "$*" in
            *scm+*) exec sleep 30 ;;
            *) printf '%s\n' '{"Message":{"ID":123,"Consumption":"4500"}}' ;;
        esac"#;
        let reader = MeterReader::new(
            DecoderCommand::new("sh").arg("-c").arg(script).arg("fake-rtlamr"),
            None,
            MeterIds {
                electric: Some("123".to_string()),
                gas: Some("555".to_string()),
                water: None,
            },
        );
        let readings = reader
            .read_gas_and_electric(Duration::from_millis(300))
            .await;
        assert_eq!(readings.gas, None);
        assert_eq!(readings.electric, Some(45.0));
    }

    #[tokio::test]
    async fn water_reading_states() {
        let lines = [r#"{"Message":{"ID":1550,"Consumption":"8812"}}"#];
        let configured = MeterReader::new(
            fake_decoder(&lines),
            None,
            MeterIds {
                water: Some("1550".to_string()),
                ..MeterIds::default()
            },
        );
        assert_eq!(
            configured.read_water(TIMEOUT).await,
            MeterReading::Value(88.12)
        );

        let other_meter = MeterReader::new(
            fake_decoder(&lines),
            None,
            MeterIds {
                water: Some("9999".to_string()),
                ..MeterIds::default()
            },
        );
        assert_eq!(other_meter.read_water(TIMEOUT).await, MeterReading::Failed);

        let unset = MeterReader::new(fake_decoder(&lines), None, MeterIds::default());
        assert_eq!(unset.read_water(TIMEOUT).await, MeterReading::NotConfigured);
    }

    #[tokio::test]
    async fn missing_decoder_binary_is_a_failed_read() {
        let reader = MeterReader::new(
            DecoderCommand::new("/nonexistent/rtlamr"),
            None,
            MeterIds {
                water: Some("1".to_string()),
                ..MeterIds::default()
            },
        );
        assert_eq!(reader.read_water(TIMEOUT).await, MeterReading::Failed);
    }
}

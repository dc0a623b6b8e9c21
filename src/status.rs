//! Status extractor.
//!
//! Folds the frames a session actually relayed into a [`StatusSnapshot`] for
//! the dashboard. Read-only with respect to the relay: nothing here feeds back
//! into forwarding, and malformed payloads are logged at debug and skipped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ocpp::{Action, Call, CorrelationId, Direction, Frame};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChargePointIdentity {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub status: String,
    pub error_code: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub value: String,
    pub unit: Option<String>,
    pub context: Option<String>,
    pub connector_id: Option<i64>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargingLimit {
    pub limit: f64,
    pub unit: String,
    pub set_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationValue {
    pub value: Option<String>,
    pub readonly: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameCounters {
    pub device_to_backend: u64,
    pub backend_to_device: u64,
}

/// Derived view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub identity: Option<ChargePointIdentity>,
    pub connectors: BTreeMap<i64, ConnectorStatus>,
    /// Latest sample per `measurand` or `measurand/phase`.
    pub measurements: BTreeMap<String, Measurement>,
    pub charging_limit: Option<ChargingLimit>,
    pub configuration: BTreeMap<String, ConfigurationValue>,
    pub transaction_id: Option<i64>,
    pub last_heartbeat: Option<String>,
    pub frames: FrameCounters,
    /// Active import power in W, measured or derived from current × voltage.
    pub power_estimate_w: Option<f64>,
    /// `ChangeConfiguration` requests waiting for their answer.
    #[serde(skip)]
    pending_changes: HashMap<CorrelationId, (String, String)>,
}

impl StatusSnapshot {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            connected_at: Utc::now(),
            identity: None,
            connectors: BTreeMap::new(),
            measurements: BTreeMap::new(),
            charging_limit: None,
            configuration: BTreeMap::new(),
            transaction_id: None,
            last_heartbeat: None,
            frames: FrameCounters::default(),
            power_estimate_w: None,
            pending_changes: HashMap::new(),
        }
    }

    /// Fold one relayed frame. Returns `None` when a payload did not have
    /// the expected shape.
    fn fold(&mut self, frame: &Frame, request_action: Option<&Action>) -> Option<()> {
        match frame {
            Frame::Call(call) => self.fold_call(call),
            Frame::CallResult(result) => {
                self.fold_result(&result.id, &result.payload, request_action?)
            }
            Frame::CallError(err) => {
                self.pending_changes.remove(&err.id);
                Some(())
            }
        }
    }

    fn fold_call(&mut self, call: &Call) -> Option<()> {
        let p = &call.payload;
        match call.action {
            Action::BootNotification => {
                let text = |key: &str| p.get(key).and_then(Value::as_str).map(String::from);
                self.identity = Some(ChargePointIdentity {
                    vendor: text("chargePointVendor"),
                    model: text("chargePointModel"),
                    firmware_version: text("firmwareVersion"),
                    serial_number: text("chargePointSerialNumber")
                        .or_else(|| text("chargeBoxSerialNumber")),
                });
            }
            Action::StatusNotification => {
                let connector = p.get("connectorId")?.as_i64()?;
                self.connectors.insert(
                    connector,
                    ConnectorStatus {
                        status: p.get("status")?.as_str()?.to_string(),
                        error_code: p.get("errorCode").and_then(Value::as_str).map(String::from),
                        timestamp: p.get("timestamp").and_then(Value::as_str).map(String::from),
                    },
                );
            }
            Action::MeterValues => {
                let connector = p.get("connectorId").and_then(Value::as_i64);
                for mv in p.get("meterValue")?.as_array()? {
                    self.fold_meter_value(mv, connector);
                }
                self.power_estimate_w = self.estimate_power();
            }
            Action::SetChargingProfile => {
                let schedule = p.get("csChargingProfiles")?.get("chargingSchedule")?;
                let unit = schedule.get("chargingRateUnit")?.as_str()?.to_string();
                let limit = schedule
                    .get("chargingSchedulePeriod")?
                    .as_array()?
                    .first()?
                    .get("limit")?
                    .as_f64()?;
                self.charging_limit = Some(ChargingLimit {
                    limit,
                    unit,
                    set_at: Utc::now(),
                });
            }
            Action::ChangeConfiguration => {
                let key = p.get("key")?.as_str()?.to_string();
                let value = p.get("value")?.as_str()?.to_string();
                self.pending_changes.insert(call.id.clone(), (key, value));
            }
            Action::StopTransaction => {
                self.transaction_id = None;
            }
            _ => {}
        }
        Some(())
    }

    fn fold_meter_value(&mut self, mv: &Value, connector: Option<i64>) {
        let timestamp = mv.get("timestamp").and_then(Value::as_str).map(String::from);
        let Some(samples) = mv.get("sampledValue").and_then(Value::as_array) else {
            return;
        };
        for sample in samples {
            let Some(value) = sample.get("value").and_then(Value::as_str) else {
                continue;
            };
            let measurand = sample
                .get("measurand")
                .and_then(Value::as_str)
                .unwrap_or("Energy.Active.Import.Register");
            let key = match sample.get("phase").and_then(Value::as_str) {
                Some(phase) => format!("{measurand}/{phase}"),
                None => measurand.to_string(),
            };
            self.measurements.insert(
                key,
                Measurement {
                    value: value.to_string(),
                    unit: sample.get("unit").and_then(Value::as_str).map(String::from),
                    context: sample.get("context").and_then(Value::as_str).map(String::from),
                    connector_id: connector,
                    timestamp: timestamp.clone(),
                },
            );
        }
    }

    fn measured(&self, prefix: &str) -> Vec<(f64, Option<&str>)> {
        self.measurements
            .iter()
            .filter(|(key, _)| *key == prefix || key.starts_with(&format!("{prefix}/")))
            .filter_map(|(_, m)| Some((m.value.parse::<f64>().ok()?, m.unit.as_deref())))
            .collect()
    }

    fn estimate_power(&self) -> Option<f64> {
        let power = self.measured("Power.Active.Import");
        if !power.is_empty() {
            let watts = power
                .iter()
                .map(|(v, unit)| if *unit == Some("kW") { v * 1000.0 } else { *v })
                .sum();
            return Some(watts);
        }
        let current: f64 = self.measured("Current.Import").iter().map(|(v, _)| v).sum();
        let voltage = self.measured("Voltage").first().map(|(v, _)| *v)?;
        (current > 0.0).then_some(current * voltage)
    }

    fn fold_result(&mut self, id: &CorrelationId, p: &Value, request: &Action) -> Option<()> {
        match request {
            Action::GetConfiguration => {
                for entry in p.get("configurationKey")?.as_array()? {
                    let Some(key) = entry.get("key").and_then(Value::as_str) else {
                        continue;
                    };
                    self.configuration.insert(
                        key.to_string(),
                        ConfigurationValue {
                            value: entry.get("value").and_then(Value::as_str).map(String::from),
                            readonly: entry.get("readonly").and_then(Value::as_bool),
                        },
                    );
                }
            }
            Action::ChangeConfiguration => {
                let (key, value) = self.pending_changes.remove(id)?;
                if p.get("status").and_then(Value::as_str) == Some("Accepted") {
                    let entry = self.configuration.entry(key).or_insert(ConfigurationValue {
                        value: None,
                        readonly: None,
                    });
                    entry.value = Some(value);
                }
            }
            Action::StartTransaction => {
                self.transaction_id = Some(p.get("transactionId")?.as_i64()?);
            }
            Action::Heartbeat => {
                self.last_heartbeat = Some(p.get("currentTime")?.as_str()?.to_string());
            }
            _ => {}
        }
        Some(())
    }
}

/// Snapshot registry, one entry per live session.
#[derive(Clone, Default)]
pub struct StatusExtractor {
    snapshots: Arc<RwLock<HashMap<String, StatusSnapshot>>>,
}

impl StatusExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh snapshot for a new session, replacing any previous one.
    pub async fn begin(&self, session_id: &str) {
        self.snapshots
            .write()
            .await
            .insert(session_id.to_string(), StatusSnapshot::new(session_id));
    }

    /// Fold a frame that travelled `direction`. Never fails.
    pub async fn observe(
        &self,
        session_id: &str,
        direction: Direction,
        frame: &Frame,
        request_action: Option<&Action>,
    ) {
        let mut map = self.snapshots.write().await;
        let Some(snapshot) = map.get_mut(session_id) else {
            return;
        };
        match direction {
            Direction::DeviceToBackend => snapshot.frames.device_to_backend += 1,
            Direction::BackendToDevice => snapshot.frames.backend_to_device += 1,
        }
        if snapshot.fold(frame, request_action).is_none() {
            debug!(
                session = %session_id,
                %direction,
                action = ?frame.action().or(request_action),
                "status extractor skipped unexpected payload"
            );
        }
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<StatusSnapshot> {
        self.snapshots.read().await.get(session_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn remove(&self, session_id: &str) {
        self.snapshots.write().await.remove(session_id);
    }
}

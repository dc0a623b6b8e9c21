//! Rewriting rules: field fixes, unit conversions and schedule standardization.
//!
//! Every rule works on a clone of the frame and reports [`RuleOutcome::Skipped`]
//! when nothing changed, so running a rule twice over its own output is a no-op
//! (except `measurand_scale`, which is a plain multiplication).

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Number, Value};
use tracing::{debug, warn};

use super::{Rule, RuleContext, RuleOutcome};
use crate::ocpp::Frame;
use crate::util::format_ocpp_time;

/// Measurand implied by OCPP when a sampled value names none.
const DEFAULT_MEASURAND: &str = "Energy.Active.Import.Register";

/// Visit every JSON object below `value` (including `value` itself), parents
/// before children. Returns whether any visit reported a change.
pub(crate) fn visit_objects_mut(
    value: &mut Value,
    f: &mut dyn FnMut(&mut Map<String, Value>) -> bool,
) -> bool {
    match value {
        Value::Object(map) => {
            let mut changed = f(map);
            for child in map.values_mut() {
                changed |= visit_objects_mut(child, f);
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| visit_objects_mut(item, f) | changed),
        _ => false,
    }
}

/// Run `edit` on a copy of the frame's payload; `Applied` if it reports a change.
fn rewrite_payload(frame: &Frame, edit: impl FnOnce(&mut Value) -> bool) -> RuleOutcome {
    let mut out = frame.clone();
    let changed = out.payload_mut().is_some_and(edit);
    if changed {
        RuleOutcome::Applied(out)
    } else {
        RuleOutcome::Skipped
    }
}

// ---------------------------------------------------------------------------
// timestamp_fix
// ---------------------------------------------------------------------------

/// Replaces empty, placeholder or pre-2000 timestamps with the current time.
pub struct TimestampFix;

fn is_timestamp_key(key: &str) -> bool {
    key == "timestamp" || key.ends_with("Timestamp")
}

fn is_broken_timestamp(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return true;
    }
    let floor = NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    match (DateTime::parse_from_rfc3339(value), floor) {
        (Ok(ts), Some(floor)) => ts.with_timezone(&Utc) < floor,
        (Ok(_), None) => false,
        (Err(_), _) => true,
    }
}

impl Rule for TimestampFix {
    fn kind(&self) -> &'static str {
        "timestamp_fix"
    }

    fn apply(&self, frame: &Frame, ctx: &RuleContext<'_>) -> RuleOutcome {
        let now = format_ocpp_time(ctx.now);
        rewrite_payload(frame, |payload| {
            visit_objects_mut(payload, &mut |obj| {
                let mut changed = false;
                for (key, value) in obj.iter_mut() {
                    if !is_timestamp_key(key) {
                        continue;
                    }
                    if let Value::String(s) = value {
                        if is_broken_timestamp(s) {
                            debug!(field = %key, from = %s, to = %now, "fixed timestamp");
                            *value = Value::String(now.clone());
                            changed = true;
                        }
                    }
                }
                changed
            })
        })
    }
}

// ---------------------------------------------------------------------------
// id_tag_truncate
// ---------------------------------------------------------------------------

/// Shortens `idTag` values beyond the CiString20 limit.
pub struct IdTagTruncate {
    pub max_len: usize,
}

/// `YYYY-MM-DDTHH:MM:SS` prefix check.
fn looks_like_iso_timestamp(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() < 19 {
        return false;
    }
    let digits = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18];
    digits.iter().all(|&i| b[i].is_ascii_digit())
        && b[4] == b'-'
        && b[7] == b'-'
        && b[10] == b'T'
        && b[13] == b':'
        && b[16] == b':'
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl IdTagTruncate {
    fn shorten(&self, tag: &str) -> String {
        if looks_like_iso_timestamp(tag) {
            if let Ok(ts) = DateTime::parse_from_rfc3339(tag) {
                let short = format!(
                    "tag{}{:03}",
                    ts.format("%H%M%S"),
                    ts.timestamp_subsec_millis().min(999)
                );
                return truncate_chars(&short, self.max_len);
            }
        }
        truncate_chars(tag, self.max_len)
    }
}

impl Rule for IdTagTruncate {
    fn kind(&self) -> &'static str {
        "id_tag_truncate"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        rewrite_payload(frame, |payload| {
            visit_objects_mut(payload, &mut |obj| {
                let mut changed = false;
                for (key, value) in obj.iter_mut() {
                    if !key.eq_ignore_ascii_case("idtag") {
                        continue;
                    }
                    if let Value::String(tag) = value {
                        if tag.chars().count() > self.max_len {
                            let short = self.shorten(tag);
                            debug!(from = %tag, to = %short, "shortened idTag");
                            *tag = short;
                            changed = true;
                        }
                    }
                }
                changed
            })
        })
    }
}

// ---------------------------------------------------------------------------
// measurand_scale
// ---------------------------------------------------------------------------

/// Multiplies sampled meter values of one unit by a constant.
pub struct MeasurandScale {
    pub factor: f64,
    pub unit: String,
    pub measurand: Option<String>,
}

impl MeasurandScale {
    fn matches(&self, sample: &Map<String, Value>) -> bool {
        if sample.get("unit").and_then(Value::as_str) != Some(self.unit.as_str()) {
            return false;
        }
        match &self.measurand {
            Some(wanted) => {
                let measurand = sample
                    .get("measurand")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_MEASURAND);
                measurand == wanted
            }
            None => true,
        }
    }

    fn scale_sample(&self, sample: &mut Map<String, Value>) -> bool {
        if !self.matches(sample) {
            return false;
        }
        let Some(Value::String(raw)) = sample.get_mut("value") else {
            return false;
        };
        match raw.trim().parse::<f64>() {
            Ok(v) => {
                let scaled = (v * self.factor).trunc();
                if !scaled.is_finite() {
                    return false;
                }
                let scaled = format!("{}", scaled as i64);
                if scaled == *raw {
                    return false;
                }
                *raw = scaled;
                true
            }
            Err(_) => {
                warn!(value = %raw, unit = %self.unit, "could not parse sampled value");
                false
            }
        }
    }
}

impl Rule for MeasurandScale {
    fn kind(&self) -> &'static str {
        "measurand_scale"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        rewrite_payload(frame, |payload| {
            visit_objects_mut(payload, &mut |obj| {
                let Some(Value::Array(meter_values)) = obj.get_mut("meterValue") else {
                    return false;
                };
                let mut changed = false;
                for mv in meter_values.iter_mut() {
                    let Some(Value::Array(samples)) = mv.get_mut("sampledValue") else {
                        continue;
                    };
                    for sample in samples.iter_mut() {
                        if let Value::Object(sample) = sample {
                            changed |= self.scale_sample(sample);
                        }
                    }
                }
                changed
            })
        })
    }
}

// ---------------------------------------------------------------------------
// rate_unit_conversion
// ---------------------------------------------------------------------------

/// Converts charging limits between rate units (e.g. A → W).
pub struct RateUnitConversion {
    pub from_unit: String,
    pub to_unit: String,
    pub factor: f64,
    pub unit_field: String,
    pub limit_field: String,
}

/// Multiply a JSON number in place. Integers times an integral factor stay
/// integers. Non-numbers are left alone.
pub(crate) fn scale_number(value: &mut Value, factor: f64) -> bool {
    let Value::Number(n) = value else {
        return false;
    };
    let integral = factor.fract() == 0.0 && factor.abs() < i64::MAX as f64;
    if integral {
        if let Some(product) = n.as_i64().and_then(|i| i.checked_mul(factor as i64)) {
            *value = Value::from(product);
            return true;
        }
    }
    let Some(product) = n.as_f64().map(|f| f * factor) else {
        return false;
    };
    match Number::from_f64(product) {
        Some(product) => {
            *value = Value::Number(product);
            true
        }
        None => false,
    }
}

impl RateUnitConversion {
    fn convert(&self, obj: &mut Map<String, Value>) -> bool {
        if obj.get(&self.unit_field).and_then(Value::as_str) != Some(self.from_unit.as_str()) {
            return false;
        }
        let mut changed = false;
        if let Some(limit) = obj.get_mut(&self.limit_field) {
            changed |= scale_number(limit, self.factor);
        }
        if self.limit_field != "minChargingRate" {
            if let Some(min) = obj.get_mut("minChargingRate") {
                changed |= scale_number(min, self.factor);
            }
        }
        for (key, child) in obj.iter_mut() {
            if key == &self.limit_field || key == &self.unit_field {
                continue;
            }
            let Value::Array(items) = child else {
                continue;
            };
            for item in items.iter_mut() {
                if let Some(limit) = item.get_mut(&self.limit_field) {
                    changed |= scale_number(limit, self.factor);
                }
            }
        }
        if changed {
            obj.insert(self.unit_field.clone(), Value::String(self.to_unit.clone()));
        }
        changed
    }
}

impl Rule for RateUnitConversion {
    fn kind(&self) -> &'static str {
        "rate_unit_conversion"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        rewrite_payload(frame, |payload| {
            visit_objects_mut(payload, &mut |obj| self.convert(obj))
        })
    }
}

// ---------------------------------------------------------------------------
// schedule_standardize
// ---------------------------------------------------------------------------

/// Rewrites a charging request into the canonical `SetChargingProfile` payload.
///
/// Lossy: only the first limit, its unit and (when present) its phase count
/// survive. Everything else comes from configuration.
pub struct ScheduleStandardize {
    pub profile_id: i64,
    pub stack_level: i64,
    pub purpose: String,
    pub profile_kind: String,
    pub connector_id: i64,
    pub number_phases: Option<i64>,
    pub unit_field: String,
    pub limit_field: String,
}

/// First value (depth-first, document order) stored under `key`.
fn find_first<'a>(value: &'a Value, key: &str, pred: &dyn Fn(&Value) -> bool) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).filter(|v| pred(v)) {
                return Some(found);
            }
            map.values().find_map(|child| find_first(child, key, pred))
        }
        Value::Array(items) => items.iter().find_map(|item| find_first(item, key, pred)),
        _ => None,
    }
}

impl ScheduleStandardize {
    fn canonical(&self, limit: &Value, unit: &str, phases: Option<&Value>) -> Value {
        let mut period = json!({ "startPeriod": 0, "limit": limit });
        let phases = self.number_phases.map(Value::from).or_else(|| phases.cloned());
        if let (Some(phases), Value::Object(period)) = (phases, &mut period) {
            period.insert("numberPhases".into(), phases);
        }
        json!({
            "connectorId": self.connector_id,
            "csChargingProfiles": {
                "chargingProfileId": self.profile_id,
                "stackLevel": self.stack_level,
                "chargingProfilePurpose": self.purpose,
                "chargingProfileKind": self.profile_kind,
                "chargingSchedule": {
                    "chargingRateUnit": unit,
                    "chargingSchedulePeriod": [period],
                },
            },
        })
    }
}

impl Rule for ScheduleStandardize {
    fn kind(&self) -> &'static str {
        "schedule_standardize"
    }

    fn apply(&self, frame: &Frame, _ctx: &RuleContext<'_>) -> RuleOutcome {
        let Frame::Call(call) = frame else {
            return RuleOutcome::Skipped;
        };
        let Some(limit) = find_first(&call.payload, &self.limit_field, &Value::is_number) else {
            return RuleOutcome::Skipped;
        };
        let unit = find_first(&call.payload, &self.unit_field, &Value::is_string)
            .or_else(|| find_first(&call.payload, "chargingRateUnit", &Value::is_string))
            .and_then(Value::as_str);
        let Some(unit) = unit else {
            debug!(action = %call.action, "no rate unit found, leaving schedule alone");
            return RuleOutcome::Skipped;
        };
        let phases = find_first(&call.payload, "numberPhases", &Value::is_number);

        let canonical = self.canonical(limit, unit, phases);
        if canonical == call.payload {
            return RuleOutcome::Skipped;
        }
        let mut out = call.clone();
        out.payload = canonical;
        RuleOutcome::Applied(Frame::Call(out))
    }
}

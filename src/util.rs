//! Small helpers shared across modules.

use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};

/// Normalize a connection path.
///
/// Empty segments are dropped and the result carries exactly one leading `/`.
///
/// - `"//AcTec001"` → `"/AcTec001"`
/// - `"/ocpp//CP1/"` → `"/ocpp/CP1"`
/// - `"CP1"` → `"/CP1"`
/// - `"///"` → `"/"`
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let already_clean = path.starts_with('/')
        && !path.contains("//")
        && (path.len() == 1 || !path.ends_with('/'));
    if already_clean {
        return Cow::Borrowed(path);
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    Cow::Owned(format!("/{}", segments.join("/")))
}

/// Session identifier for a normalized path: the path without its leading
/// slash. `None` when nothing is left.
pub fn session_id_from_path(normalized: &str) -> Option<&str> {
    let id = normalized.trim_start_matches('/');
    (!id.is_empty()).then_some(id)
}

/// `2025-10-01T15:05:31.123Z`, the form OCPP peers expect.
pub fn format_ocpp_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("//AcTec001"), "/AcTec001");
        assert_eq!(normalize_path("/ocpp//CP1/"), "/ocpp/CP1");
        assert_eq!(normalize_path("CP1"), "/CP1");
        assert_eq!(normalize_path("///"), "/");
        assert_eq!(normalize_path(""), "/");
        assert!(matches!(normalize_path("/CP1"), Cow::Borrowed(_)));
    }

    #[test]
    fn session_id_strips_leading_slash() {
        assert_eq!(session_id_from_path("/X"), Some("X"));
        assert_eq!(session_id_from_path("/ocpp/CP1"), Some("ocpp/CP1"));
        assert_eq!(session_id_from_path("/"), None);
    }

    #[test]
    fn ocpp_time_has_millis_and_zulu() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 1, 15, 5, 31).unwrap();
        assert_eq!(format_ocpp_time(ts), "2025-10-01T15:05:31.000Z");
    }
}

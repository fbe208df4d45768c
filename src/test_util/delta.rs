use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use crate::model::{Delta, PathValue, Source, Update};

pub const TEST_CONTEXT: &str = "vessels.urn:mrn:imo:mmsi:230099999";

/// `2024-05-01T12:00:00Z`, plus the given number of seconds
pub fn timestamp(offset_seconds: i64) -> DateTime<Utc> {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("valid base timestamp");
    base + Duration::seconds(offset_seconds)
}

/// A typical navigation delta with three values. Deltas with different numbers differ in
///  timestamp and (slightly) in their values, like consecutive readings of the same sensors.
pub fn sample_delta(i: u32) -> Delta {
    let mut update = Update::new(timestamp(i as i64), vec![
        PathValue::new("navigation.speedOverGround", json!((30 + i % 5) as f64 / 10.0)),
        PathValue::new("navigation.courseOverGroundTrue", json!([1.05, 1.07, 1.1][i as usize % 3])),
        PathValue::new("environment.wind.speedApparent", json!([5.2, 5.4, 5.1, 4.9][i as usize % 4])),
    ]);
    update.source_ref = Some("nmea1.GP".to_string());
    Delta::new(TEST_CONTEXT, vec![update])
}

/// Satellites in view, as reported by a GPS receiver in NMEA 0183 `GSV` sentences
pub fn gsv_delta() -> Delta {
    let mut update = Update::new(timestamp(0), vec![
        PathValue::new("navigation.gnss.satellitesInView", json!({
            "count": 2,
            "satellites": [
                { "id": 10, "elevation": 1.1, "azimuth": 2.4, "SNR": 41 },
                { "id": 23, "elevation": 0.5, "azimuth": 4.8, "SNR": 37 },
            ],
        })),
    ]);
    update.source = Some(Source {
        label: Some("gps".to_string()),
        kind: Some("NMEA0183".to_string()),
        talker: Some("GP".to_string()),
        sentence: Some("GSV".to_string()),
    });
    update.source_ref = Some("gps.GP".to_string());
    Delta::new(TEST_CONTEXT, vec![update])
}

/// Deeply nested values, empty arrays and all JSON value kinds
pub fn nested_delta() -> Delta {
    Delta::new(TEST_CONTEXT, vec![
        Update::new(timestamp(1), vec![
            PathValue::new("navigation.position", json!({ "latitude": 60.15, "longitude": 24.95, "altitude": null })),
            PathValue::new("custom.deeply.nested", json!({ "a": { "b": { "c": { "d": [1, [2, [3, []]], { "e": true }] } } } })),
            PathValue::new("custom.empty", json!([])),
            PathValue::new("custom.flags", json!([true, false, null, -17, 4294967296u64, "x"])),
        ]),
        Update::new(timestamp(2), vec![]),
    ])
}

pub fn unicode_delta() -> Delta {
    Delta::new("vessels.urn:mrn:signalk:uuid:ß-漢字", vec![
        Update::new(timestamp(3), vec![
            PathValue::new("communication.callsignVhf", json!("Ærø ⚓ \"quoted\" \\ back\\slash \n newline")),
            PathValue::new("environment.wätter.température", json!("🌊 emoji \u{0000} nul")),
        ]),
    ])
}

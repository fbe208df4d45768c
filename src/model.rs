use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A delta is the unit of telemetry exchanged with the telemetry bus: observations for a single
///  context (vessel or other entity), grouped into timestamped updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub context: String,
    pub updates: Vec<Update>,
}
impl Delta {
    pub fn new(context: impl Into<String>, updates: Vec<Update>) -> Delta {
        Delta {
            context: context.into(),
            updates,
        }
    }

    pub fn value_count(&self) -> usize {
        self.updates.iter()
            .map(|u| u.values.len())
            .sum()
    }

    pub fn values(&self) -> impl Iterator<Item = &PathValue> {
        self.updates.iter()
            .flat_map(|u| u.values.iter())
    }

    /// The NMEA sentence tags of all updates in this delta that carry one
    pub fn sentences(&self) -> impl Iterator<Item = &str> {
        self.updates.iter()
            .filter_map(|u| u.source.as_ref())
            .filter_map(|s| s.sentence.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<PathValue>,
}
impl Update {
    pub fn new(timestamp: DateTime<Utc>, values: Vec<PathValue>) -> Update {
        Update {
            source: None,
            source_ref: None,
            timestamp,
            values,
        }
    }
}

/// Where an update came from, e.g. an NMEA 0183 talker / sentence pair
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: PathRef,
    pub value: Value,
}
impl PathValue {
    pub fn new(path: impl Into<String>, value: Value) -> PathValue {
        PathValue {
            path: PathRef::Name(path.into()),
            value,
        }
    }
}

/// A telemetry path, either spelled out (`navigation.speedOverGround`) or replaced by its
///  numeric id from the path dictionary.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathRef {
    Id(u16),
    Name(String),
}
impl PathRef {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            PathRef::Name(name) => Some(name),
            PathRef::Id(_) => None,
        }
    }
}

impl std::fmt::Display for PathRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathRef::Id(id) => write!(f, "#{}", id),
            PathRef::Name(name) => write!(f, "{}", name),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::delta::{sample_delta, gsv_delta};
    use serde_json::json;

    #[test]
    fn test_value_count() {
        assert_eq!(sample_delta(0).value_count(), 3);
        assert_eq!(Delta::new("vessels.self", vec![]).value_count(), 0);
    }

    #[test]
    fn test_sentences() {
        let delta = gsv_delta();
        assert_eq!(delta.sentences().collect::<Vec<_>>(), vec!["GSV"]);
        assert_eq!(sample_delta(1).sentences().count(), 0);
    }

    #[test]
    fn test_json_shape() {
        let delta = gsv_delta();
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["updates"][0]["source"]["sentence"], json!("GSV"));
        assert_eq!(json["updates"][0]["source"]["type"], json!("NMEA0183"));
        assert_eq!(json["updates"][0]["$source"], json!("gps.GP"));
        assert!(json["updates"][0]["values"][0]["path"].is_string());
    }

    #[test]
    fn test_path_ref_untagged() {
        let numeric: PathValue = serde_json::from_value(json!({"path": 12, "value": 1.5})).unwrap();
        assert_eq!(numeric.path, PathRef::Id(12));

        let named: PathValue = serde_json::from_value(json!({"path": "a.b", "value": null})).unwrap();
        assert_eq!(named.path, PathRef::Name("a.b".to_string()));
        assert_eq!(named.path.as_name(), Some("a.b"));
    }
}

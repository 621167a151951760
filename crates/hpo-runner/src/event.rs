use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const SAMPLE_SEGMENT: usize = 3;

/// One event range as handed out by the job scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventRange {
    #[serde(rename = "eventRangeID")]
    pub event_range_id: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventRangeIdError {
    #[error("event range id is empty")]
    Empty,
    #[error("event range id '{raw}' has {found} segments, need at least {}", SAMPLE_SEGMENT + 1)]
    TooFewSegments { raw: String, found: usize },
    #[error("event range id '{0}' has an empty sample segment")]
    EmptySample(String),
}

/// Composite event range identifier. The scheduler encodes the sample id as
/// the fourth `-` or `/` separated segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRangeId {
    raw: String,
    sample_id: String,
}

impl EventRangeId {
    pub fn parse(raw: &str) -> Result<Self, EventRangeIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EventRangeIdError::Empty);
        }
        let segments: Vec<&str> = trimmed.split(['-', '/']).collect();
        if segments.len() <= SAMPLE_SEGMENT {
            return Err(EventRangeIdError::TooFewSegments {
                raw: trimmed.to_string(),
                found: segments.len(),
            });
        }
        let sample_id = segments[SAMPLE_SEGMENT];
        if sample_id.is_empty() {
            return Err(EventRangeIdError::EmptySample(trimmed.to_string()));
        }
        Ok(Self {
            raw: trimmed.to_string(),
            sample_id: sample_id.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }
}

impl fmt::Display for EventRangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_id_is_fourth_dash_segment() {
        let id = EventRangeId::parse("4321-0-27181399-17-1").expect("parse");
        assert_eq!(id.sample_id(), "17");
        assert_eq!(id.as_str(), "4321-0-27181399-17-1");
    }

    #[test]
    fn slash_separators_are_accepted() {
        let id = EventRangeId::parse("a/b/c/42").expect("parse");
        assert_eq!(id.sample_id(), "42");
        assert_eq!(id.to_string(), "a/b/c/42");
    }

    #[test]
    fn short_identifier_is_a_validation_error() {
        assert_eq!(
            EventRangeId::parse("1-2-3").expect_err("too short"),
            EventRangeIdError::TooFewSegments {
                raw: "1-2-3".to_string(),
                found: 3
            }
        );
        assert_eq!(
            EventRangeId::parse("  ").expect_err("empty"),
            EventRangeIdError::Empty
        );
        assert!(matches!(
            EventRangeId::parse("1-2-3--5"),
            Err(EventRangeIdError::EmptySample(_))
        ));
    }

    #[test]
    fn event_range_keeps_unknown_fields() {
        let value = serde_json::json!({
            "eventRangeID": "1-2-3-4-5",
            "startEvent": 0,
            "LFN": "x.root"
        });
        let range: EventRange = serde_json::from_value(value).expect("decode");
        assert_eq!(range.event_range_id, "1-2-3-4-5");
        assert_eq!(range.extra.get("LFN"), Some(&serde_json::json!("x.root")));
    }
}

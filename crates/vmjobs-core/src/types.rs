use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Six- or seven-field cron expression (seconds first), evaluated in UTC.
    Cron { expression: String },

    /// Repeat every N seconds, first fire one interval after registration.
    Interval { every_secs: u64 },

    /// Fire exactly once at the given UTC instant.
    Date { at: DateTime<Utc> },
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { expression } => write!(f, "cron '{expression}'"),
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Schedule::Date { at } => write!(f, "on {}", at.to_rfc3339()),
        }
    }
}

/// Which workflow a job definition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Time-series store → relational store, reconcile-driven.
    Extractor,
    /// Upstream REST source → time-series store, watermark-driven.
    Collector,
    /// Re-times `biz_date`-labelled series onto their business date.
    #[serde(rename = "business_date_converter")]
    Converter,
    /// Time-series store → relational store per selector, resuming from the
    /// last extracted timestamp.
    MetricsExtract,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extractor => "extractor",
            JobKind::Collector => "collector",
            JobKind::Converter => "business_date_converter",
            JobKind::MetricsExtract => "metrics_extract",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured job. Immutable for the duration of a run; replaced wholesale
/// when the registry reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique identity; also the advisory lock key.
    pub id: String,
    /// Human-readable label. Falls back to `id`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub kind: JobKind,
    pub schedule: Schedule,
    /// Kind-specific settings, interpreted when the run starts.
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

impl JobDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

fn bool_true() -> bool {
    true
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_tagged_by_type() {
        let s: Schedule =
            serde_json::from_str(r#"{"type":"cron","expression":"0 0 7 * * Mon-Fri"}"#).unwrap();
        assert_eq!(
            s,
            Schedule::Cron {
                expression: "0 0 7 * * Mon-Fri".into()
            }
        );

        let s: Schedule = serde_json::from_str(r#"{"type":"interval","every_secs":60}"#).unwrap();
        assert_eq!(s, Schedule::Interval { every_secs: 60 });
    }

    #[test]
    fn definition_defaults() {
        let def: JobDefinition = serde_json::from_str(
            r#"{"id":"ext_a","kind":"extractor","schedule":{"type":"interval","every_secs":300}}"#,
        )
        .unwrap();
        assert!(def.enabled);
        assert_eq!(def.display_name(), "ext_a");
        assert!(def.params.as_object().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            JobKind::Extractor,
            JobKind::Collector,
            JobKind::Converter,
            JobKind::MetricsExtract,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
            assert_eq!(serde_json::from_value::<JobKind>(json).unwrap(), kind);
        }
    }
}

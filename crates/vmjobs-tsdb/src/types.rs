use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TsdbError};

pub const NAME_LABEL: &str = "__name__";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One labelled series. The metric name, when present, is the `__name__` label.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn name(&self) -> Option<&str> {
        self.labels.get(NAME_LABEL).map(String::as_str)
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.iter().max_by_key(|s| s.timestamp)
    }
}

/// Label matchers, optionally with a metric name and a lookback window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub metric: Option<String>,
    pub matchers: BTreeMap<String, String>,
    /// For instant queries: take the last value seen within this window.
    pub lookback: Option<Duration>,
}

impl Selector {
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            metric: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.matchers.insert(label.into(), value.into());
        self
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    /// Parses a series selector such as `up{job="api", env='prod'}`. Only
    /// equality matchers are understood.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let (name, rest) = match expr.find('{') {
            Some(i) => (expr[..i].trim(), Some(&expr[i..])),
            None => (expr, None),
        };
        if name.is_empty() && rest.is_none() {
            return Err(TsdbError::Parse("empty selector".into()));
        }
        if !name.is_empty() && !is_metric_name(name) {
            return Err(TsdbError::Parse(format!("invalid metric name in selector: {expr}")));
        }

        let mut selector = if name.is_empty() {
            Self::any()
        } else {
            Self::metric(name)
        };
        if let Some(body) = rest {
            let body = body
                .strip_prefix('{')
                .and_then(|b| b.strip_suffix('}'))
                .ok_or_else(|| TsdbError::Parse(format!("unbalanced braces in selector: {expr}")))?;
            for (k, v) in parse_matchers(body).map_err(|e| TsdbError::Parse(format!("{e} in selector: {expr}")))? {
                selector.matchers.insert(k, v);
            }
        }
        Ok(selector)
    }

    /// `name{a="1",b="2"}`, label values escaped.
    pub fn to_promql(&self) -> String {
        let matchers: Vec<String> = self
            .matchers
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
            .collect();
        format!("{}{{{}}}", self.metric.as_deref().unwrap_or(""), matchers.join(","))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if let Some(name) = &self.metric {
            if labels.get(NAME_LABEL) != Some(name) {
                return false;
            }
        }
        self.matchers
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// A single gauge value to push.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl GaugeSample {
    pub fn new(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            value,
            timestamp,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in labels {
            self.labels.insert(k.into(), v.into());
        }
        self
    }

    /// One line of Prometheus text exposition format with a millisecond
    /// timestamp.
    pub fn to_line(&self) -> String {
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
            .collect();
        let labels = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };
        format!(
            "{}{} {} {}",
            self.name,
            labels,
            self.value,
            self.timestamp.timestamp_millis()
        )
    }
}

fn is_metric_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn parse_matchers(body: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(out);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if key.is_empty() || chars.next() != Some('=') {
            return Err("expected label=\"value\"".into());
        }
        if matches!(chars.peek(), Some('~') | Some('=')) {
            return Err(format!("unsupported matcher on {key}"));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let quote = match chars.next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(format!("unquoted value for {key}")),
        };
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(c) => value.push(c),
                    None => return Err(format!("unterminated value for {key}")),
                },
                Some(c) if c == quote => break,
                Some(c) => value.push(c),
                None => return Err(format!("unterminated value for {key}")),
            }
        }
        out.push((key, value));
    }
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn selector_renders_promql() {
        let sel = Selector::any()
            .with("job", "ext_a")
            .with("biz_date", "15/01/2024");
        assert_eq!(sel.to_promql(), r#"{biz_date="15/01/2024",job="ext_a"}"#);

        let sel = Selector::metric("wm").with("source", "say \"hi\"");
        assert_eq!(sel.to_promql(), r#"wm{source="say \"hi\""}"#);
    }

    #[test]
    fn selector_matches_name_and_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(NAME_LABEL.to_string(), "cpu".to_string());
        labels.insert("job".to_string(), "a".to_string());
        assert!(Selector::metric("cpu").with("job", "a").matches(&labels));
        assert!(Selector::any().with("job", "a").matches(&labels));
        assert!(!Selector::metric("mem").matches(&labels));
        assert!(!Selector::any().with("env", "prod").matches(&labels));
    }

    #[test]
    fn selector_parses_equality_matchers() {
        let sel = Selector::parse(r#"balance{job="ext_a", desk='rates'}"#).unwrap();
        assert_eq!(sel.metric.as_deref(), Some("balance"));
        assert_eq!(sel.matchers["job"], "ext_a");
        assert_eq!(sel.matchers["desk"], "rates");

        let sel = Selector::parse(r#"{note="say \"hi\""}"#).unwrap();
        assert!(sel.metric.is_none());
        assert_eq!(sel.matchers["note"], r#"say "hi""#);

        assert_eq!(Selector::parse("up").unwrap(), Selector::metric("up"));
        assert_eq!(Selector::parse(&sel.to_promql()).unwrap(), sel);
    }

    #[test]
    fn selector_rejects_what_it_cannot_match() {
        for bad in ["", "rate(x[5m])", r#"up{job=~"a.*"}"#, r#"up{job!="a"}"#, "up{job=a}", r#"up{job="a""#] {
            assert!(Selector::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn gauge_line_format() {
        let ts = Utc.timestamp_opt(1_705_276_800, 0).unwrap();
        let line = GaugeSample::new("apex_job_status", 1.0, ts)
            .label("job_id", "apex")
            .label("env", "prod")
            .to_line();
        assert_eq!(line, r#"apex_job_status{env="prod",job_id="apex"} 1 1705276800000"#);
    }
}

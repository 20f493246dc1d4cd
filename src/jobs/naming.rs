//! Display names of streamed series.
//!
//! A series is named after its metric, its identifying dimensions and the
//! stream label it was published under, e.g. `A:cpu.utilization/host=a`.
//! A query alias such as `$metric on $host` replaces that composite name for
//! the labels the query's program publishes.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::signalflow::{encode_series_id, SeriesId, SeriesProperties};

const METRIC_PROPERTY: &str = "sf_metric";
const ORIGINATING_METRIC_PROPERTY: &str = "sf_originatingMetric";
const STREAM_LABEL_PROPERTY: &str = "sf_streamLabel";
const KEY_PROPERTY: &str = "sf_key";
const INTERNAL_PREFIX: &str = "_sf_";

/// Key dimensions that never show up in a name.
const HIDDEN_DIMENSIONS: [&str; 5] = [
    METRIC_PROPERTY,
    ORIGINATING_METRIC_PROPERTY,
    "jobId",
    "programId",
    "computationId",
];

lazy_static! {
    static ref PUBLISH_LABEL: Regex = Regex::new(r"label\s?=\s?'(\w*?)'").unwrap();
    static ref TEMPLATE_VARIABLE: Regex = Regex::new(r"\$\{(\w+)\}|\$(\w+)").unwrap();
}

/// An alias template together with the stream labels it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasRule {
    template: String,
    labels: Vec<String>,
}

impl AliasRule {
    /// `None` for a blank template.
    pub fn new(program: &str, template: &str) -> Option<Self> {
        if template.trim().is_empty() {
            return None;
        }
        let labels = PUBLISH_LABEL
            .captures_iter(program)
            .map(|captures| captures[1].to_string())
            .collect();
        Some(Self {
            template: template.to_string(),
            labels,
        })
    }

    /// Unlabeled series always take the alias.
    fn applies_to(&self, label: Option<&str>) -> bool {
        label.map_or(true, |label| self.labels.iter().any(|l| l == label))
    }

    /// Unknown variables are left as written.
    fn render(&self, variables: &HashMap<String, String>) -> String {
        TEMPLATE_VARIABLE
            .replace_all(&self.template, |captures: &Captures| {
                let name = captures
                    .get(1)
                    .or_else(|| captures.get(2))
                    .map_or("", |m| m.as_str());
                variables
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| captures[0].to_string())
            })
            .into_owned()
    }
}

/// Display name and tags of a series. Tag values stay JSON-encoded.
pub fn describe_series(
    id: SeriesId,
    metadata: Option<&SeriesProperties>,
    alias: Option<&AliasRule>,
) -> (String, BTreeMap<String, String>) {
    let Some(properties) = metadata else {
        return (encode_series_id(id), BTreeMap::new());
    };

    let mut variables = HashMap::new();
    let mut parts = Vec::new();
    for key in [METRIC_PROPERTY, ORIGINATING_METRIC_PROPERTY] {
        if let Some(metric) = properties.get(key).and_then(Value::as_str) {
            if !metric.to_lowercase().starts_with(INTERNAL_PREFIX) {
                variables.insert("metric".to_string(), metric.to_string());
                parts.push(metric.to_string());
            }
        }
    }

    let mut dimensions = Vec::new();
    let keys = properties.get(KEY_PROPERTY).and_then(Value::as_array);
    for dimension in keys.into_iter().flatten().filter_map(Value::as_str) {
        if HIDDEN_DIMENSIONS.contains(&dimension) {
            continue;
        }
        if let Some(value) = properties.get(dimension).and_then(property_text) {
            dimensions.push(format!("{}={}", dimension, value));
            variables.insert(dimension.to_string(), value);
        }
    }
    if !dimensions.is_empty() {
        parts.push(dimensions.join(","));
    }

    let label = properties
        .get(STREAM_LABEL_PROPERTY)
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty());
    let mut composite = parts.join("/");
    if let Some(label) = label {
        variables.insert("label".to_string(), label.to_string());
        composite = format!("{}:{}", label, composite);
    }
    if composite.is_empty() {
        composite = encode_series_id(id);
    }

    let name = match alias.filter(|rule| rule.applies_to(label)) {
        Some(rule) => rule.render(&variables),
        None => composite,
    };

    let tags = properties
        .iter()
        .filter(|(key, _)| key.as_str() != METRIC_PROPERTY)
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect();

    (name, tags)
}

fn property_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn properties(entries: Value) -> SeriesProperties {
        serde_json::from_value(entries).unwrap()
    }

    fn kubernetes_series() -> SeriesProperties {
        properties(json!({
            "sf_metric": "metric_name",
            "metric_source": "kubernetes",
            "kubernetes_node": "node-1",
            "sf_streamLabel": "D",
            "sf_key": ["kubernetes_node", "sf_originatingMetric", "sf_metric", "computationId"]
        }))
    }

    #[test]
    fn test_describe_series() {
        let series = kubernetes_series();

        let (name, tags) = describe_series(123, Some(&series), None);

        assert_eq!(name, "D:metric_name/kubernetes_node=node-1");
        let expected: BTreeMap<String, String> = [
            ("sf_streamLabel", "\"D\""),
            ("metric_source", "\"kubernetes\""),
            ("kubernetes_node", "\"node-1\""),
            (
                "sf_key",
                "[\"kubernetes_node\",\"sf_originatingMetric\",\"sf_metric\",\"computationId\"]",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_describe_series_fallbacks() {
        let (name, tags) = describe_series(123, None, None);
        assert_eq!(name, encode_series_id(123));
        assert!(tags.is_empty());

        let internal = properties(json!({
            "sf_metric": "_SF_internal",
            "sf_originatingMetric": "requests"
        }));
        let (name, _) = describe_series(123, Some(&internal), None);
        assert_eq!(name, "requests");

        let (name, _) = describe_series(123, Some(&properties(json!({"host": "a"}))), None);
        assert_eq!(name, encode_series_id(123));
    }

    #[test]
    fn test_describe_series_with_alias() {
        let rule = AliasRule::new(
            "data('cpu').publish(label = 'D')",
            "${metric} on $kubernetes_node ($label, $missing)",
        )
        .unwrap();

        let (name, _) = describe_series(123, Some(&kubernetes_series()), Some(&rule));

        assert_eq!(name, "metric_name on node-1 (D, $missing)");
    }

    #[test]
    fn test_alias_only_covers_published_labels() {
        let rule = AliasRule::new("data('cpu').publish(label='A')", "$metric").unwrap();

        let (labelled, _) = describe_series(123, Some(&kubernetes_series()), Some(&rule));
        let unlabelled = properties(json!({"sf_metric": "cpu"}));
        let (plain, _) = describe_series(123, Some(&unlabelled), Some(&rule));

        assert_eq!(labelled, "D:metric_name/kubernetes_node=node-1");
        assert_eq!(plain, "cpu");
    }

    #[test]
    fn test_blank_alias_is_ignored() {
        assert_eq!(AliasRule::new("data('cpu').publish()", "  "), None);
    }
}

//! Metric labels and their canonical text form
//!
//! The text form (`__name__="cpu_used",item="/home"`) is sorted by label
//! name and is part of a metric identity on the API.

use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

pub const METRIC_NAME: &str = "__name__";
pub const ITEM: &str = "item";
pub const INSTANCE: &str = "instance";
pub const INSTANCE_UUID: &str = "instance_uuid";
pub const SCRAPER: &str = "scraper";

/// Prefix of labels that carry routing information and never reach the API.
pub const META_PREFIX: &str = "__meta_";
pub const META_BLEEMEO_UUID: &str = "__meta_bleemeo_uuid";
pub const META_SNMP_TARGET: &str = "__meta_snmp_target";
pub const META_BLEEMEO_TARGET_AGENT_UUID: &str = "__meta_bleemeo_target_agent_uuid";

/// Build a label set from pairs.
pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Labels {
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Canonical text of a label set. Meta labels are excluded.
pub fn labels_to_text(labels: &Labels) -> String {
    let mut out = String::new();

    for (name, value) in labels {
        if name.starts_with(META_PREFIX) {
            continue;
        }

        if !out.is_empty() {
            out.push(',');
        }

        out.push_str(name);
        out.push_str("=\"");
        for c in value.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                other => out.push(other),
            }
        }
        out.push('"');
    }

    out
}

/// Parse the canonical text form. Malformed trailing input is ignored.
pub fn text_to_labels(text: &str) -> Labels {
    let mut labels = Labels::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(',') | Some(' ')) {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            name.push(c);
            chars.next();
        }

        if name.is_empty() || chars.next() != Some('=') || chars.next() != Some('"') {
            break;
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some(escaped) => value.push(escaped),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }

        if !closed {
            break;
        }

        labels.insert(name, value);
    }

    labels
}

/// The metric name, empty when missing.
pub fn metric_name(labels: &Labels) -> &str {
    labels.get(METRIC_NAME).map(String::as_str).unwrap_or("")
}

//! Provider/region labels for confirmed playlists.

use serde::Deserialize;

/// How a label is derived from a playlist's per-entry metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LabelRule {
    /// Attribute read from the first entry carrying it.
    pub field: String,
    /// Generic suffixes removed before picking the most specific token.
    pub strip_suffixes: Vec<String>,
    pub fallback: String,
}

impl Default for LabelRule {
    fn default() -> Self {
        LabelRule {
            field: "group-title".into(),
            strip_suffixes: vec!["组播".into()],
            fallback: "unknown".into(),
        }
    }
}

impl LabelRule {
    pub fn classify(&self, payload: &str) -> String {
        let raw = self.extract(payload).unwrap_or_default();
        let label = sanitize_label(&raw);
        if label.is_empty() {
            sanitize_label(&self.fallback)
        } else {
            label
        }
    }

    fn extract(&self, payload: &str) -> Option<String> {
        let mut value = attribute(payload, &self.field)?.to_string();
        for suffix in &self.strip_suffixes {
            if !suffix.is_empty() {
                value = value.replace(suffix.as_str(), "");
            }
        }
        value.split_whitespace().last().map(str::to_string)
    }
}

/// First non-empty `field="value"` in `payload`. The name must not be the tail of a longer one.
fn attribute<'a>(payload: &'a str, field: &str) -> Option<&'a str> {
    if field.is_empty() {
        return None;
    }
    let needle = format!("{field}=\"");
    payload
        .match_indices(&needle)
        .filter(|(at, _)| {
            payload[..*at]
                .chars()
                .next_back()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '-' || c == '_'))
        })
        .find_map(|(at, _)| {
            let rest = &payload[at + needle.len()..];
            let value = &rest[..rest.find('"')?];
            (!value.is_empty()).then_some(value)
        })
}

/// Drop characters that cannot appear in a catalog key or file name.
pub fn sanitize_label(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace() && !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

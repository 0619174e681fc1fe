//! `{{ name }}` placeholder substitution.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value as JsonValue;

use crate::models::JsonMap;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid placeholder regex")
    })
}

/// String form of a template value.
pub fn coerce(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Look up a possibly dotted name (`order.total`) in `data`.
fn lookup<'a>(data: &'a JsonMap, name: &str) -> Option<&'a JsonValue> {
    if let Some(v) = data.get(name) {
        return Some(v);
    }
    let mut parts = name.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Replace every placeholder in `text`; unknown names render empty.
pub fn render(text: &str, data: &JsonMap) -> String {
    placeholder_re()
        .replace_all(text, |caps: &Captures<'_>| {
            lookup(data, &caps[1]).map(coerce).unwrap_or_default()
        })
        .into_owned()
}

/// Placeholder names used in `text`, in order of first appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_re().captures_iter(text) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Required names that have no value in `data`.
pub fn missing_variables(required: &[String], data: &JsonMap) -> Vec<String> {
    required
        .iter()
        .filter(|name| lookup(data, name).map_or(true, JsonValue::is_null))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(v: JsonValue) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_substitutes_all_tokens() {
        let d = data(json!({"order_no": "A-100", "count": 3, "paid": true}));
        assert_eq!(
            render("Order {{order_no}} ({{ count }} items, paid={{paid}})", &d),
            "Order A-100 (3 items, paid=true)"
        );
    }

    #[test]
    fn test_render_unknown_is_empty() {
        let d = data(json!({}));
        assert_eq!(render("Hi {{name}}!", &d), "Hi !");
    }

    #[test]
    fn test_render_nested_and_null() {
        let d = data(json!({"order": {"total": 12.5}, "note": null}));
        assert_eq!(render("{{order.total}}|{{note}}", &d), "12.5|");
    }

    #[test]
    fn test_render_leaves_non_placeholders() {
        let d = data(json!({"a": "x"}));
        assert_eq!(render("{ {a} } {{a}} {{}}", &d), "{ {a} } x {{}}");
    }

    #[test]
    fn test_placeholders_unique_in_order() {
        assert_eq!(
            placeholders("{{b}} {{a}} {{ b }}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_missing_variables() {
        let d = data(json!({"order_no": "A-1", "carrier": null}));
        let required = vec!["order_no".to_string(), "carrier".to_string(), "eta".to_string()];
        assert_eq!(
            missing_variables(&required, &d),
            vec!["carrier".to_string(), "eta".to_string()]
        );
    }

    #[test]
    fn test_no_required_token_survives_render() {
        let required = vec!["order_no".to_string(), "name".to_string()];
        let d = data(json!({"order_no": "A-100", "name": "Ada"}));
        let out = render("Hi {{name}}, order {{ order_no }} shipped", &d);
        for name in &required {
            assert!(placeholders(&out).iter().all(|p| p != name));
        }
    }
}

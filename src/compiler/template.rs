//! Placeholder substitution for objective templates.
//!
//! Templates use `{name}` placeholders where `name` is an identifier.
//! Every placeholder in the template must resolve through the merged value
//! map or a schema default; a missing required placeholder is an error,
//! never a silent blank.

use crate::errors::CompileError;
use crate::station::Station;
use std::collections::BTreeMap;

/// Merge placeholder values by precedence: station defaults, then step
/// params, then per-call overrides (later wins).
pub fn merge_values(
    station: &Station,
    step_params: &BTreeMap<String, String>,
    call_overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for placeholder in &station.placeholders {
        if let Some(default) = &placeholder.default {
            merged.insert(placeholder.name.clone(), default.clone());
        }
    }
    for (k, v) in step_params {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in call_overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Render a template against resolved values. Every `{name}` token must
/// have a value; other brace uses pass through untouched.
pub fn render(
    template: &str,
    values: &BTreeMap<String, String>,
    station_id: &str,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) if is_identifier(&tail[..close]) => {
                let name = &tail[..close];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(CompileError::TemplateError {
                            station: station_id.to_string(),
                            placeholder: name.to_string(),
                        });
                    }
                }
                rest = &tail[close + 1..];
            }
            _ => {
                // Not a placeholder; keep the brace literally
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{EngineProfile, Placeholder};

    fn station_with(placeholders: Vec<Placeholder>) -> Station {
        Station {
            id: "tester".to_string(),
            version: 1,
            name: "Tester".to_string(),
            required_inputs: vec![],
            optional_inputs: vec![],
            required_outputs: vec![],
            required_result_fields: vec![],
            engine: EngineProfile::default(),
            identity: String::new(),
            invariants: vec![],
            objective_template: String::new(),
            placeholders,
            fragments: vec![],
            singleton: false,
            allowed_flows: None,
        }
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_simple() {
        let rendered = render("Test {target} carefully", &values(&[("target", "auth")]), "s")
            .unwrap();
        assert_eq!(rendered, "Test auth carefully");
    }

    #[test]
    fn test_render_missing_placeholder_errors() {
        let err = render("Test {target}", &BTreeMap::new(), "tester").unwrap_err();
        match err {
            CompileError::TemplateError {
                station,
                placeholder,
            } => {
                assert_eq!(station, "tester");
                assert_eq!(placeholder, "target");
            }
            other => panic!("Expected TemplateError, got {other}"),
        }
    }

    #[test]
    fn test_render_leaves_non_placeholder_braces() {
        let rendered = render("json: { \"a\": {x} }", &values(&[("x", "1")]), "s").unwrap();
        assert_eq!(rendered, "json: { \"a\": 1 }");
    }

    #[test]
    fn test_merge_precedence() {
        let station = station_with(vec![
            Placeholder::optional("style", "terse"),
            Placeholder::required("target"),
        ]);
        let step = values(&[("target", "auth"), ("style", "verbose")]);
        let call = values(&[("style", "formal")]);

        let merged = merge_values(&station, &step, &call);
        assert_eq!(merged.get("target").map(String::as_str), Some("auth"));
        // call override wins over step which wins over default
        assert_eq!(merged.get("style").map(String::as_str), Some("formal"));
    }

    #[test]
    fn test_default_fills_absent_optional() {
        let station = station_with(vec![Placeholder::optional("style", "terse")]);
        let merged = merge_values(&station, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(merged.get("style").map(String::as_str), Some("terse"));
    }
}

// Default NDJSON resource parser

use crate::domain::{ParsedResource, SearchParam};
use crate::port::ResourceParser;
use serde_json::Value;

/// Validates one JSON resource per line and derives its search rows
pub struct NdjsonResourceParser;

impl ResourceParser for NdjsonResourceParser {
    fn parse(&self, expected_type: &str, line: &str) -> Result<ParsedResource, String> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("Invalid JSON: {}", e))?;
        let object = value
            .as_object()
            .ok_or_else(|| "Resource must be a JSON object".to_string())?;

        let resource_type = object
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing resourceType".to_string())?;
        if resource_type != expected_type {
            return Err(format!(
                "Resource type {} does not match expected type {}",
                resource_type, expected_type
            ));
        }

        let resource_id = object
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| "Missing resource id".to_string())?;

        let last_updated = object
            .get("meta")
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut search_params = Vec::new();
        collect_identifiers(&value, &mut search_params);
        collect_names(&value, &mut search_params);
        for field in ["subject", "patient"] {
            if let Some(reference) = value
                .get(field)
                .and_then(|r| r.get("reference"))
                .and_then(Value::as_str)
            {
                search_params.push(parse_reference(field, reference));
            }
        }
        if let Some(updated) = &last_updated {
            search_params.push(SearchParam::DateTime {
                name: "_lastUpdated".to_string(),
                start: updated.clone(),
                end: updated.clone(),
            });
        }

        Ok(ParsedResource {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            last_updated,
            raw: line.to_string(),
            search_params,
        })
    }
}

fn collect_identifiers(value: &Value, out: &mut Vec<SearchParam>) {
    let Some(identifiers) = value.get("identifier").and_then(Value::as_array) else {
        return;
    };
    for identifier in identifiers {
        if let Some(code) = identifier.get("value").and_then(Value::as_str) {
            out.push(SearchParam::Token {
                name: "identifier".to_string(),
                system: identifier
                    .get("system")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                code: code.to_string(),
            });
        }
    }
}

fn collect_names(value: &Value, out: &mut Vec<SearchParam>) {
    match value.get("name") {
        Some(Value::String(name)) => out.push(SearchParam::String {
            name: "name".to_string(),
            value: name.clone(),
        }),
        Some(Value::Array(names)) => {
            for family in names
                .iter()
                .filter_map(|n| n.get("family").and_then(Value::as_str))
            {
                out.push(SearchParam::String {
                    name: "family".to_string(),
                    value: family.to_string(),
                });
            }
        }
        _ => {}
    }
}

/// `Patient/123` -> type + id; a bare id has no type
fn parse_reference(name: &str, reference: &str) -> SearchParam {
    let (reference_type, reference_id) = match reference.rsplit_once('/') {
        Some((kind, id)) => (Some(kind.to_string()), id.to_string()),
        None => (None, reference.to_string()),
    };
    SearchParam::Reference {
        name: name.to_string(),
        reference_type,
        reference_id,
    }
}

/// Per-record fan-out of child pipelines
///
/// A child in `for_each_record` mode runs once per parent output record. Each
/// clone gets a derived id (`{id}_{index}`), a derived name (`{name}[{index}]`)
/// and its parameter bindings copied from the record into its source config.

use crate::workflow::{ParameterBinding, PipelineSpec};
use serde_json::{Map, Value};

/// One clone of an expanding pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedPipeline {
    pub index: usize,
    pub spec: PipelineSpec,
    /// Bindings that could not be resolved against the record
    pub warnings: Vec<String>,
}

pub fn expand(spec: &PipelineSpec, records: &[Value]) -> Vec<ExpandedPipeline> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| expand_record(spec, index, record))
        .collect()
}

pub fn expand_record(spec: &PipelineSpec, index: usize, record: &Value) -> ExpandedPipeline {
    let mut clone = spec.clone();
    clone.id = format!("{}_{}", spec.id, index);
    clone.name = format!("{}[{}]", spec.name, index);

    let mut warnings = Vec::new();
    if !spec.parameter_bindings.is_empty() {
        let mut source = match clone.source.take() {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for binding in &spec.parameter_bindings {
            match resolve(record, binding) {
                Some(value) => {
                    source.insert(binding.child_param.clone(), value);
                }
                None => warnings.push(format!(
                    "{}: record {} has no field '{}'",
                    clone.name, index, binding.parent_field
                )),
            }
        }
        clone.source = Value::Object(source);
    }

    ExpandedPipeline {
        index,
        spec: clone,
        warnings,
    }
}

/// Plain key lookup, or a JSONPath query when the field starts with `$`
fn resolve(record: &Value, binding: &ParameterBinding) -> Option<Value> {
    let field = binding.parent_field.as_str();
    if field.starts_with('$') {
        match jsonpath_lib::select(record, field) {
            Ok(matches) => matches.first().map(|value| (*value).clone()),
            Err(e) => {
                tracing::warn!("⚠️ Invalid binding path '{}': {:?}", field, e);
                None
            }
        }
    } else {
        record.get(field).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child() -> PipelineSpec {
        let mut spec = PipelineSpec::new("b", "B");
        spec.parent_pipeline_id = Some("a".into());
        spec.source = json!({"type": "inline", "records": []});
        spec.parameter_bindings = vec![ParameterBinding {
            parent_field: "id".into(),
            child_param: "record_id".into(),
        }];
        spec
    }

    #[test]
    fn clones_get_derived_ids_and_bound_params() {
        let expanded = expand(&child(), &[json!({"id": 1}), json!({"id": 2})]);

        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].spec.id, "b_0");
        assert_eq!(expanded[1].spec.name, "B[1]");
        assert_eq!(expanded[0].spec.source["record_id"], 1);
        assert_eq!(expanded[1].spec.source["record_id"], 2);
        assert_eq!(expanded[1].spec.source["type"], "inline");
    }

    #[test]
    fn jsonpath_bindings_reach_nested_fields() {
        let mut spec = child();
        spec.parameter_bindings[0].parent_field = "$.customer.id".into();

        let expanded = expand_record(&spec, 0, &json!({"customer": {"id": "c-9"}}));
        assert_eq!(expanded.spec.source["record_id"], "c-9");
        assert!(expanded.warnings.is_empty());
    }

    #[test]
    fn missing_fields_are_skipped_with_warning() {
        let expanded = expand_record(&child(), 3, &json!({"other": true}));
        assert!(expanded.spec.source.get("record_id").is_none());
        assert_eq!(expanded.warnings.len(), 1);
        assert_eq!(expanded.spec.id, "b_3");
    }
}

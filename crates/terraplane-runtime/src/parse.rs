use crate::RuntimeError;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use terraplane_schema::PlanSummary;

#[derive(Deserialize)]
struct PlanMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    changes: Option<ChangeCounts>,
}

#[derive(Deserialize)]
struct ChangeCounts {
    #[serde(default)]
    add: u32,
    #[serde(default)]
    change: u32,
    #[serde(default)]
    remove: u32,
}

/// Extract the change summary from a `plan -json` message stream.
///
/// Non-JSON lines (stderr warnings) are ignored. Returns the last summary
/// seen, or `None` if the stream carried none.
pub fn parse_plan_summary(output: &str) -> Option<PlanSummary> {
    output
        .lines()
        .rev()
        .filter(|l| l.trim_start().starts_with('{'))
        .filter_map(|l| serde_json::from_str::<PlanMessage>(l).ok())
        .filter(|m| m.kind == "change_summary")
        .find_map(|m| m.changes)
        .map(|c| PlanSummary {
            add: c.add,
            change: c.change,
            remove: c.remove,
        })
}

/// Values from `output -json`, with the names of sensitive entries tracked
/// separately so callers can keep them out of logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutputs {
    pub values: BTreeMap<String, serde_json::Value>,
    pub sensitive: BTreeSet<String>,
}

/// Parse `output -json`: `{"name": {"value": ..., "type": ..., "sensitive": bool}}`.
pub fn parse_outputs(output: &str) -> Result<ToolOutputs, RuntimeError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(ToolOutputs::default());
    }

    let parsed: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(first) => {
            // Combined capture may wrap the document in stderr noise.
            let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
                return Err(RuntimeError::OutputParse(first.to_string()));
            };
            serde_json::from_str(&trimmed[start..=end])
                .map_err(|e| RuntimeError::OutputParse(e.to_string()))?
        }
    };

    let serde_json::Value::Object(entries) = parsed else {
        return Err(RuntimeError::OutputParse(
            "expected a JSON object of outputs".to_owned(),
        ));
    };

    let mut outputs = ToolOutputs::default();
    for (name, entry) in entries {
        let sensitive = entry
            .get("sensitive")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if sensitive {
            outputs.sensitive.insert(name.clone());
        }
        let value = match entry {
            serde_json::Value::Object(mut obj) if obj.contains_key("value") => {
                obj.remove("value").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        };
        outputs.values.insert(name, value);
    }
    Ok(outputs)
}

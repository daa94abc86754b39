use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{FlowError, FlowResult};

/// One flow invocation as handed over on the command line.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Invocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub commit_id: Option<String>,
}

impl Invocation {
    /// Parses a parameter blob. A malformed blob is logged and treated as an
    /// empty invocation rather than rejected.
    pub fn parse(blob: &str) -> Self {
        if blob.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(blob) {
            Ok(invocation) => invocation,
            Err(err) => {
                warn!(error = %err, "Failed to parse invocation parameters, continuing with none");
                Self::default()
            }
        }
    }

    pub fn from_optional(blob: Option<&str>) -> Self {
        blob.map(Self::parse).unwrap_or_default()
    }

    /// Maps positional args onto `order` and merges the named kwargs.
    pub fn bind(&self, order: &[&str]) -> FlowResult<Map<String, Value>> {
        if self.args.len() > order.len() {
            return Err(FlowError::Validation(format!(
                "Expected at most {} positional arguments, got {}",
                order.len(),
                self.args.len()
            )));
        }
        let mut bound: Map<String, Value> = order
            .iter()
            .zip(self.args.iter())
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        for (name, value) in &self.kwargs {
            if bound.contains_key(name) {
                return Err(FlowError::Validation(format!(
                    "Parameter '{name}' given both positionally and by name"
                )));
            }
            bound.insert(name.clone(), value.clone());
        }
        Ok(bound)
    }

    /// Binds and deserializes into the flow's typed parameters.
    pub fn params<T: DeserializeOwned>(&self, order: &[&str]) -> FlowResult<T> {
        let bound = self.bind(order)?;
        serde_json::from_value(Value::Object(bound))
            .map_err(|err| FlowError::Validation(format!("Invalid flow parameters: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_blob_degrades_to_empty() {
        assert_eq!(Invocation::parse("{not json"), Invocation::default());
        assert_eq!(Invocation::parse("[1, 2]"), Invocation::default());
        assert_eq!(Invocation::from_optional(None), Invocation::default());
    }

    #[test]
    fn parses_args_kwargs_and_commit() {
        let invocation = Invocation::parse(
            r#"{"args": ["data", 3], "kwargs": {"seed": 7}, "commit_id": "abc123"}"#,
        );
        assert_eq!(invocation.args, vec![json!("data"), json!(3)]);
        assert_eq!(invocation.kwargs.get("seed"), Some(&json!(7)));
        assert_eq!(invocation.commit_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn binds_positionals_in_declared_order() {
        let invocation =
            Invocation::parse(r#"{"args": ["./data", "games.csv"], "kwargs": {"seed": 1}}"#);
        let bound = invocation.bind(&["working_dir", "dataset_name", "seed"]).unwrap();
        assert_eq!(bound["working_dir"], json!("./data"));
        assert_eq!(bound["dataset_name"], json!("games.csv"));
        assert_eq!(bound["seed"], json!(1));
    }

    #[test]
    fn rejects_duplicate_and_surplus_arguments() {
        let duplicate =
            Invocation::parse(r#"{"args": ["./data"], "kwargs": {"working_dir": "x"}}"#);
        assert!(matches!(
            duplicate.bind(&["working_dir"]),
            Err(FlowError::Validation(_))
        ));
        let surplus = Invocation::parse(r#"{"args": [1, 2]}"#);
        assert!(matches!(surplus.bind(&["only"]), Err(FlowError::Validation(_))));
    }
}

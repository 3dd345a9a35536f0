use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Atomic reference-counted string used to identify capabilities.
pub type CapabilityId = Arc<str>;

/// Output of a provider, and the value type of the parameter bag.
pub type Value = serde_json::Value;

/// Flat key/value context shared by every provider call of a request.
pub type Params = BTreeMap<String, Value>;

/// A single user turn: the capabilities the caller wants executed and the
/// shared parameter bag visible to every provider call.
///
/// A `Request` is built once and is immutable afterwards.
///
/// # Example
///
/// ```rust
/// use locus::Request;
///
/// let request = Request::new(["wardrobe"])
///     .param("location", "Nairobi")
///     .param("event", "wedding");
///
/// assert_eq!(request.capabilities().len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    capabilities: Vec<CapabilityId>,
    params: Arc<Params>,
}

impl Request {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<CapabilityId> = Vec::new();
        for id in capabilities {
            let id = id.as_ref();
            if !ids.iter().any(|known| known.as_ref() == id) {
                ids.push(id.into());
            }
        }

        Self {
            capabilities: ids,
            params: Arc::default(),
        }
    }

    /// Adds a parameter to the bag, replacing any previous value for `key`.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.params).insert(key.into(), value.into());
        self
    }

    pub fn params_from(mut self, params: Params) -> Self {
        Arc::make_mut(&mut self.params).extend(params);
        self
    }

    pub fn capabilities(&self) -> &[CapabilityId] {
        &self.capabilities
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn shared_params(&self) -> Arc<Params> {
        self.params.clone()
    }
}

/// What a provider receives: the request's parameter bag together with the
/// outputs of the capabilities it declared a dependency on, and nothing else.
#[derive(Debug, Clone, Default)]
pub struct Input {
    params: Arc<Params>,
    upstream: BTreeMap<CapabilityId, Value>,
}

impl Input {
    pub(crate) fn new(params: Arc<Params>, upstream: BTreeMap<CapabilityId, Value>) -> Self {
        Self { params, upstream }
    }

    /// Parameter from the request bag.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Convenience accessor for string parameters.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Output of a direct dependency.
    pub fn upstream(&self, capability: &str) -> Option<&Value> {
        self.upstream.get(capability)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn upstream_outputs(&self) -> &BTreeMap<CapabilityId, Value> {
        &self.upstream
    }

    /// Flattens the input into one map. Dependency outputs are keyed by
    /// capability id and take precedence over parameters of the same name.
    pub fn merged(&self) -> Params {
        let mut merged = (*self.params).clone();
        for (id, value) in &self.upstream {
            merged.insert(id.to_string(), value.clone());
        }
        merged
    }

    /// Looks `key` up among dependency outputs first, then in the parameter bag.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.upstream.get(key).or_else(|| self.params.get(key))
    }
}

/// Kind of a single input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Description of the input a capability expects.
///
/// Fields are resolved through [`Input::get`], so a field may be satisfied
/// either by a request parameter or by the output of a dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub fields: Vec<Field>,
}

impl InputShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub(crate) fn check(&self, input: &Input) -> Result<(), String> {
        for field in &self.fields {
            match input.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(format!(
                        "field '{}' expected {:?}, got {}",
                        field.name, field.kind, value
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_dedup_preserves_order() {
        let request = Request::new(["weather", "navigator", "weather"]);
        let ids: Vec<&str> = request.capabilities().iter().map(AsRef::as_ref).collect();
        assert_eq!(ids, ["weather", "navigator"]);
    }

    #[test]
    fn test_input_merged_prefers_upstream() {
        let params = Arc::new(Params::from([
            ("location".to_string(), json!("Nairobi")),
            ("weather".to_string(), json!("ignored")),
        ]));
        let upstream = BTreeMap::from([("weather".into(), json!({"temp": 24}))]);
        let input = Input::new(params, upstream);

        let merged = input.merged();
        assert_eq!(merged["location"], json!("Nairobi"));
        assert_eq!(merged["weather"], json!({"temp": 24}));
        assert_eq!(input.param_str("location"), Some("Nairobi"));
    }

    #[test]
    fn test_shape_check() {
        let shape = InputShape::new()
            .required("location", FieldKind::String)
            .optional("days_ahead", FieldKind::Number);

        let ok = Input::new(
            Arc::new(Params::from([("location".to_string(), json!("Lima"))])),
            BTreeMap::new(),
        );
        assert!(shape.check(&ok).is_ok());

        let missing = Input::default();
        assert!(shape.check(&missing).unwrap_err().contains("location"));

        let wrong = Input::new(
            Arc::new(Params::from([
                ("location".to_string(), json!("Lima")),
                ("days_ahead".to_string(), json!("two")),
            ])),
            BTreeMap::new(),
        );
        assert!(shape.check(&wrong).unwrap_err().contains("days_ahead"));
    }
}

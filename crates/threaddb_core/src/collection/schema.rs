//! JSON schema compilation and validation.
//!
//! Supports the subset of JSON Schema used to describe collection
//! instances: `type`, `properties`, `required`, `additionalProperties`,
//! `items`, `enum`, `const`, numeric and length bounds, `pattern` and
//! `default`.

use crate::error::{CoreError, CoreResult, ValidationFailure};
use regex::Regex;
use serde_json::{json, Map, Value};

/// JSON value types recognised by the `type` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    fn parse(name: &str) -> CoreResult<Self> {
        Ok(match name {
            "null" => JsonType::Null,
            "boolean" => JsonType::Boolean,
            "integer" => JsonType::Integer,
            "number" => JsonType::Number,
            "string" => JsonType::String,
            "array" => JsonType::Array,
            "object" => JsonType::Object,
            other => return Err(CoreError::invalid_schema(format!("unknown type: {other}"))),
        })
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            JsonType::Number => value.is_number(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    types: Option<Vec<JsonType>>,
    properties: Vec<(String, Node)>,
    required: Vec<String>,
    additional_properties: bool,
    items: Option<Box<Node>>,
    enumeration: Option<Vec<Value>>,
    constant: Option<Value>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    exclusive_minimum: Option<f64>,
    exclusive_maximum: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    min_items: Option<usize>,
    max_items: Option<usize>,
    default: Option<Value>,
}

fn number(schema: &Map<String, Value>, keyword: &str) -> CoreResult<Option<f64>> {
    match schema.get(keyword) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| CoreError::invalid_schema(format!("{keyword} must be a number"))),
    }
}

fn count(schema: &Map<String, Value>, keyword: &str) -> CoreResult<Option<usize>> {
    match schema.get(keyword) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| {
                CoreError::invalid_schema(format!("{keyword} must be a non-negative integer"))
            }),
    }
}

impl Node {
    fn compile(schema: &Value) -> CoreResult<Self> {
        let schema = match schema {
            Value::Object(map) => map,
            Value::Bool(true) => return Ok(Node::permissive()),
            _ => return Err(CoreError::invalid_schema("schema must be an object")),
        };

        let types = match schema.get("type") {
            None => None,
            Some(Value::String(name)) => Some(vec![JsonType::parse(name)?]),
            Some(Value::Array(names)) => Some(
                names
                    .iter()
                    .map(|n| {
                        n.as_str()
                            .ok_or_else(|| CoreError::invalid_schema("type entries must be strings"))
                            .and_then(JsonType::parse)
                    })
                    .collect::<CoreResult<Vec<_>>>()?,
            ),
            Some(_) => return Err(CoreError::invalid_schema("type must be a string or array")),
        };

        let properties = match schema.get("properties") {
            None => Vec::new(),
            Some(Value::Object(props)) => props
                .iter()
                .map(|(name, sub)| Ok((name.clone(), Node::compile(sub)?)))
                .collect::<CoreResult<Vec<_>>>()?,
            Some(_) => return Err(CoreError::invalid_schema("properties must be an object")),
        };

        let required = match schema.get("required") {
            None => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| {
                    n.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| CoreError::invalid_schema("required entries must be strings"))
                })
                .collect::<CoreResult<Vec<_>>>()?,
            Some(_) => return Err(CoreError::invalid_schema("required must be an array")),
        };

        let additional_properties = match schema.get("additionalProperties") {
            None | Some(Value::Object(_)) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(CoreError::invalid_schema(
                    "additionalProperties must be a boolean",
                ))
            }
        };

        let items = schema
            .get("items")
            .map(|sub| Node::compile(sub).map(Box::new))
            .transpose()?;

        let enumeration = match schema.get("enum") {
            None => None,
            Some(Value::Array(values)) => Some(values.clone()),
            Some(_) => return Err(CoreError::invalid_schema("enum must be an array")),
        };

        let pattern = match schema.get("pattern") {
            None => None,
            Some(Value::String(p)) => Some(
                Regex::new(p)
                    .map_err(|e| CoreError::invalid_schema(format!("invalid pattern {p:?}: {e}")))?,
            ),
            Some(_) => return Err(CoreError::invalid_schema("pattern must be a string")),
        };

        Ok(Node {
            types,
            properties,
            required,
            additional_properties,
            items,
            enumeration,
            constant: schema.get("const").cloned(),
            minimum: number(schema, "minimum")?,
            maximum: number(schema, "maximum")?,
            exclusive_minimum: number(schema, "exclusiveMinimum")?,
            exclusive_maximum: number(schema, "exclusiveMaximum")?,
            min_length: count(schema, "minLength")?,
            max_length: count(schema, "maxLength")?,
            pattern,
            min_items: count(schema, "minItems")?,
            max_items: count(schema, "maxItems")?,
            default: schema.get("default").cloned(),
        })
    }

    fn permissive() -> Self {
        Node {
            additional_properties: true,
            ..Node::default()
        }
    }

    fn property(&self, name: &str) -> Option<&Node> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    fn apply_defaults(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (name, node) in &self.properties {
                    match map.get_mut(name) {
                        Some(child) => node.apply_defaults(child),
                        None => {
                            if let Some(default) = &node.default {
                                map.insert(name.clone(), default.clone());
                            }
                        }
                    }
                }
            }
            Value::Array(items) => {
                if let Some(node) = &self.items {
                    for item in items {
                        node.apply_defaults(item);
                    }
                }
            }
            _ => {}
        }
    }

    fn validate(&self, value: &Value, path: &str, failures: &mut Vec<ValidationFailure>) {
        let mut fail = |keyword: &str, message: String| {
            failures.push(ValidationFailure {
                path: path.to_owned(),
                keyword: keyword.to_owned(),
                message,
            });
        };

        if let Some(types) = &self.types {
            if !types.iter().any(|t| t.matches(value)) {
                let names: Vec<&str> = types.iter().map(|t| t.name()).collect();
                fail("type", format!("must be {}", names.join(" or ")));
                return;
            }
        }
        if let Some(values) = &self.enumeration {
            if !values.contains(value) {
                fail("enum", "must be one of the allowed values".to_owned());
            }
        }
        if let Some(constant) = &self.constant {
            if constant != value {
                fail("const", format!("must equal {constant}"));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum.filter(|min| n < *min) {
                fail("minimum", format!("must be >= {min}"));
            }
            if let Some(max) = self.maximum.filter(|max| n > *max) {
                fail("maximum", format!("must be <= {max}"));
            }
            if let Some(min) = self.exclusive_minimum.filter(|min| n <= *min) {
                fail("exclusiveMinimum", format!("must be > {min}"));
            }
            if let Some(max) = self.exclusive_maximum.filter(|max| n >= *max) {
                fail("exclusiveMaximum", format!("must be < {max}"));
            }
        }

        if let Some(s) = value.as_str() {
            let len = s.chars().count();
            if let Some(min) = self.min_length.filter(|min| len < *min) {
                fail("minLength", format!("must have at least {min} characters"));
            }
            if let Some(max) = self.max_length.filter(|max| len > *max) {
                fail("maxLength", format!("must have at most {max} characters"));
            }
            if let Some(pattern) = self.pattern.as_ref().filter(|p| !p.is_match(s)) {
                fail("pattern", format!("must match {}", pattern.as_str()));
            }
        }

        match value {
            Value::Array(items) => {
                if let Some(min) = self.min_items.filter(|min| items.len() < *min) {
                    fail("minItems", format!("must have at least {min} items"));
                }
                if let Some(max) = self.max_items.filter(|max| items.len() > *max) {
                    fail("maxItems", format!("must have at most {max} items"));
                }
                if let Some(node) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        node.validate(item, &format!("{path}/{i}"), failures);
                    }
                }
            }
            Value::Object(map) => {
                for name in &self.required {
                    if !map.contains_key(name) {
                        fail("required", format!("missing property {name}"));
                    }
                }
                for (name, child) in map {
                    match self.property(name) {
                        Some(node) => node.validate(child, &format!("{path}/{name}"), failures),
                        None if !self.additional_properties => failures.push(ValidationFailure {
                            path: format!("{path}/{name}"),
                            keyword: "additionalProperties".to_owned(),
                            message: "property is not allowed".to_owned(),
                        }),
                        None => {}
                    }
                }
            }
            _ => {}
        }
    }
}

/// A compiled JSON schema.
#[derive(Debug, Clone)]
pub struct Schema {
    source: Value,
    root: Node,
}

impl Schema {
    /// Compiles a schema document.
    pub fn compile(source: Value) -> CoreResult<Self> {
        let root = Node::compile(&source)?;
        Ok(Self { source, root })
    }

    /// Returns the schema document this was compiled from.
    #[must_use]
    pub fn source(&self) -> &Value {
        &self.source
    }

    /// Fills missing properties that declare a `default`.
    pub fn apply_defaults(&self, value: &mut Value) {
        self.root.apply_defaults(value);
    }

    /// Returns every failing constraint. Empty means valid.
    #[must_use]
    pub fn validate(&self, value: &Value) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        self.root.validate(value, "", &mut failures);
        failures
    }

    /// Returns true if `value` conforms.
    #[must_use]
    pub fn is_valid(&self, value: &Value) -> bool {
        self.validate(value).is_empty()
    }

    /// Derives a schema document describing `sample`.
    ///
    /// Objects get a `properties` entry per field; arrays take their `items`
    /// schema from the first element. Top-level objects always declare the
    /// `_id` string property.
    #[must_use]
    pub fn infer(sample: &Value) -> Value {
        let mut schema = infer_value(sample);
        if let Some(Value::Object(props)) = schema.get_mut("properties") {
            props
                .entry(super::ID_FIELD)
                .or_insert_with(|| json!({"type": "string"}));
        }
        schema
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn infer_value(sample: &Value) -> Value {
    match sample {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!({"type": "integer"}),
        Value::Number(_) => json!({"type": "number"}),
        Value::String(_) => json!({"type": "string"}),
        Value::Array(items) => match items.first() {
            Some(first) => json!({"type": "array", "items": infer_value(first)}),
            None => json!({"type": "array"}),
        },
        Value::Object(map) => {
            let properties: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), infer_value(v)))
                .collect();
            json!({"type": "object", "properties": properties})
        }
    }
}

//! Extraction schema model
//!
//! A schema maps output field names to [`FieldDef`]s. The JSON form is produced
//! by an independent generation step, so several spellings of each key are
//! accepted; the shape of every definition is decided once here and the engine
//! never inspects raw JSON again.

use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::error::{Result, ScrapeError};
use crate::normalize::normalize_keys;

const PATH_KEYS: &[&str] = &["xpath", "path_query", "path"];
const CONTAINER_KEYS: &[&str] = &["container_xpath", "container_path_query"];
const CONTEXT_KEYS: &[&str] = &["context_xpath", "context_path_query"];
const FIELDS_KEYS: &[&str] = &["properties", "fields"];
const ITEMS_KEYS: &[&str] = &["items", "item_fields", "item"];
const TYPE_KEY: &str = "type";
const TRANSFORM_KEY: &str = "transform";

/// Declared scalar type of a primitive field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    /// Missing or unrecognized type: the raw string is passed through
    #[default]
    Raw,
}

impl ValueType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => ValueType::String,
            "integer" | "int" => ValueType::Integer,
            "number" | "float" | "decimal" | "double" => ValueType::Number,
            "boolean" | "bool" => ValueType::Boolean,
            _ => ValueType::Raw,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            ValueType::String => Some("string"),
            ValueType::Integer => Some("integer"),
            ValueType::Number => Some("number"),
            ValueType::Boolean => Some("boolean"),
            ValueType::Raw => None,
        }
    }

    fn is_known(name: &str) -> bool {
        ValueType::from_name(name) != ValueType::Raw
    }
}

/// A single scalar read from the current context
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveField {
    pub path_query: String,
    pub value_type: ValueType,
    pub transform: Option<String>,
}

impl PrimitiveField {
    pub fn new(path_query: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            path_query: path_query.into(),
            value_type,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }
}

/// A nested mapping, optionally evaluated against a narrowed context
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub context_path_query: Option<String>,
    pub fields: ExtractionSchema,
}

/// One field definition, classified once at schema construction
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDef {
    Primitive(PrimitiveField),
    Object(ObjectField),
    ArrayOfPrimitives {
        container_path_query: String,
        item: PrimitiveField,
    },
    ArrayOfObjects {
        container_path_query: String,
        item_fields: ExtractionSchema,
    },
    /// Structurally invalid definition; always extracts as `null`
    Malformed(String),
}

impl FieldDef {
    pub fn primitive(path_query: impl Into<String>, value_type: ValueType) -> Self {
        FieldDef::Primitive(PrimitiveField::new(path_query, value_type))
    }

    pub fn object(context_path_query: Option<&str>, fields: ExtractionSchema) -> Self {
        FieldDef::Object(ObjectField {
            context_path_query: context_path_query.map(String::from),
            fields,
        })
    }

    pub fn array_of(container_path_query: impl Into<String>, item: PrimitiveField) -> Self {
        FieldDef::ArrayOfPrimitives {
            container_path_query: container_path_query.into(),
            item,
        }
    }

    pub fn array_of_objects(
        container_path_query: impl Into<String>,
        item_fields: ExtractionSchema,
    ) -> Self {
        FieldDef::ArrayOfObjects {
            container_path_query: container_path_query.into(),
            item_fields,
        }
    }

    /// Classify a JSON field definition. Never fails: shapes that cannot be
    /// interpreted become [`FieldDef::Malformed`].
    pub fn from_value(value: &Value) -> Self {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => return FieldDef::Malformed(format!("expected a mapping, found {}", kind(value))),
        };

        match str_key(obj, &[TYPE_KEY]).map(|t| t.trim().to_ascii_lowercase()) {
            Some(t) if t == "array" || t == "list" => parse_array(obj),
            Some(t) if t == "object" => parse_object(obj),
            _ => {
                if first_key(obj, FIELDS_KEYS).is_some() {
                    parse_object(obj)
                } else if str_key(obj, PATH_KEYS).is_some() {
                    FieldDef::Primitive(parse_primitive(obj, None))
                } else if str_key(obj, CONTAINER_KEYS).is_some() {
                    parse_array(obj)
                } else {
                    FieldDef::Malformed("no path query".to_string())
                }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            FieldDef::Primitive(p) => primitive_value(p),
            FieldDef::Object(o) => {
                let mut map = Map::new();
                map.insert(TYPE_KEY.into(), Value::String("object".into()));
                if let Some(ctx) = &o.context_path_query {
                    map.insert("context_xpath".into(), Value::String(ctx.clone()));
                }
                map.insert("properties".into(), o.fields.to_value());
                Value::Object(map)
            }
            FieldDef::ArrayOfPrimitives {
                container_path_query,
                item,
            } => array_value(container_path_query, primitive_value(item)),
            FieldDef::ArrayOfObjects {
                container_path_query,
                item_fields,
            } => {
                let mut items = Map::new();
                items.insert(TYPE_KEY.into(), Value::String("object".into()));
                items.insert("properties".into(), item_fields.to_value());
                array_value(container_path_query, Value::Object(items))
            }
            FieldDef::Malformed(_) => Value::Null,
        }
    }
}

/// Immutable mapping from output field name to definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionSchema {
    fields: IndexMap<String, FieldDef>,
}

impl ExtractionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion for hand-authored schemas
    pub fn with_field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a schema from its JSON form.
    ///
    /// The top level must be a mapping of field definitions; anything else is
    /// the one fatal error extraction has. A root of the form
    /// `{"type": "object", "properties": {...}}` is unwrapped.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ScrapeError::invalid_schema(format!(
                "top-level schema must be a mapping of field definitions, found {}",
                kind(value)
            ))
        })?;

        if let Some(inner) = root_properties(obj) {
            return Ok(parse_fields(inner));
        }
        Ok(parse_fields(obj))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(&normalize_keys(&value))
    }

    /// Load a persisted schema; `.yaml`/`.yml` files are read as YAML, anything else as JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Self::from_json_str(&content),
        }
    }

    /// Canonical JSON form, suitable for persisting a plan
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, def) in &self.fields {
            map.insert(name.clone(), def.to_value());
        }
        Value::Object(map)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}

fn parse_fields(obj: &Map<String, Value>) -> ExtractionSchema {
    let mut fields = IndexMap::with_capacity(obj.len());
    for (name, value) in obj {
        let def = FieldDef::from_value(value);
        if let FieldDef::Malformed(reason) = &def {
            debug!(field = %name, %reason, "malformed field definition");
        }
        fields.insert(name.clone(), def);
    }
    ExtractionSchema { fields }
}

fn parse_primitive(obj: &Map<String, Value>, default_path: Option<&str>) -> PrimitiveField {
    let path_query = str_key(obj, PATH_KEYS)
        .or(default_path)
        .unwrap_or_default()
        .to_string();
    PrimitiveField {
        path_query,
        value_type: str_key(obj, &[TYPE_KEY])
            .map(ValueType::from_name)
            .unwrap_or_default(),
        transform: str_key(obj, &[TRANSFORM_KEY]).map(String::from),
    }
}

fn parse_object(obj: &Map<String, Value>) -> FieldDef {
    let fields = match first_key(obj, FIELDS_KEYS) {
        Some(Value::Object(fields)) => parse_fields(fields),
        Some(other) => {
            return FieldDef::Malformed(format!("object fields must be a mapping, found {}", kind(other)))
        }
        None => return FieldDef::Malformed("object without fields".to_string()),
    };
    FieldDef::Object(ObjectField {
        context_path_query: str_key(obj, CONTEXT_KEYS).map(String::from),
        fields,
    })
}

fn parse_array(obj: &Map<String, Value>) -> FieldDef {
    // Generators sometimes put the container under the plain path key
    let container = match str_key(obj, CONTAINER_KEYS).or_else(|| str_key(obj, PATH_KEYS)) {
        Some(c) => c.to_string(),
        None => return FieldDef::Malformed("array without container query".to_string()),
    };

    match first_key(obj, ITEMS_KEYS) {
        None => FieldDef::ArrayOfPrimitives {
            container_path_query: container,
            item: PrimitiveField::new(".", ValueType::Raw),
        },
        Some(Value::Object(items)) => {
            if is_object_shaped(items) {
                match parse_object(items) {
                    FieldDef::Object(o) => FieldDef::ArrayOfObjects {
                        container_path_query: container,
                        item_fields: o.fields,
                    },
                    other => other,
                }
            } else if is_primitive_shaped(items) {
                FieldDef::ArrayOfPrimitives {
                    container_path_query: container,
                    item: parse_primitive(items, Some(".")),
                }
            } else {
                FieldDef::ArrayOfObjects {
                    container_path_query: container,
                    item_fields: parse_fields(items),
                }
            }
        }
        Some(other) => FieldDef::Malformed(format!("array items must be a mapping, found {}", kind(other))),
    }
}

fn is_object_shaped(obj: &Map<String, Value>) -> bool {
    matches!(str_key(obj, &[TYPE_KEY]), Some(t) if t.eq_ignore_ascii_case("object"))
        || matches!(first_key(obj, FIELDS_KEYS), Some(Value::Object(_)))
}

fn is_primitive_shaped(obj: &Map<String, Value>) -> bool {
    str_key(obj, PATH_KEYS).is_some()
        || matches!(str_key(obj, &[TYPE_KEY]), Some(t) if ValueType::is_known(t))
}

fn root_properties(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    let is_object = matches!(str_key(obj, &[TYPE_KEY]), Some(t) if t.eq_ignore_ascii_case("object"));
    if !is_object {
        return None;
    }
    match first_key(obj, FIELDS_KEYS) {
        Some(Value::Object(inner)) => Some(inner),
        _ => None,
    }
}

fn primitive_value(p: &PrimitiveField) -> Value {
    let mut map = Map::new();
    map.insert("xpath".into(), Value::String(p.path_query.clone()));
    if let Some(name) = p.value_type.name() {
        map.insert(TYPE_KEY.into(), Value::String(name.into()));
    }
    if let Some(t) = &p.transform {
        map.insert(TRANSFORM_KEY.into(), Value::String(t.clone()));
    }
    Value::Object(map)
}

fn array_value(container: &str, items: Value) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_KEY.into(), Value::String("array".into()));
    map.insert("container_xpath".into(), Value::String(container.to_string()));
    map.insert("items".into(), items);
    Value::Object(map)
}

fn first_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn str_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classifies_every_shape() {
        let schema = ExtractionSchema::from_value(&json!({
            "title": { "xpath": "//h1", "type": "string" },
            "meta": {
                "type": "object",
                "context_xpath": "//div[@class='meta']",
                "properties": { "author": { "xpath": ".//span", "type": "string" } }
            },
            "tags": {
                "type": "array",
                "container_xpath": "//li",
                "items": { "type": "string" }
            },
            "repos": {
                "type": "array",
                "container_path_query": "//item",
                "item_fields": { "name": { "path_query": ".//h3", "type": "string" } }
            }
        }))
        .unwrap();

        assert_eq!(schema.len(), 4);
        assert_eq!(
            schema.get("title"),
            Some(&FieldDef::primitive("//h1", ValueType::String))
        );
        match schema.get("meta") {
            Some(FieldDef::Object(o)) => {
                assert_eq!(o.context_path_query.as_deref(), Some("//div[@class='meta']"));
                assert!(o.fields.get("author").is_some());
            }
            other => panic!("expected object, got {:?}", other),
        }
        assert_eq!(
            schema.get("tags"),
            Some(&FieldDef::array_of("//li", PrimitiveField::new(".", ValueType::String)))
        );
        match schema.get("repos") {
            Some(FieldDef::ArrayOfObjects {
                container_path_query,
                item_fields,
            }) => {
                assert_eq!(container_path_query, "//item");
                assert_eq!(
                    item_fields.get("name"),
                    Some(&FieldDef::primitive(".//h3", ValueType::String))
                );
            }
            other => panic!("expected array of objects, got {:?}", other),
        }
    }

    #[test]
    fn test_array_items_as_object_definition() {
        let schema = ExtractionSchema::from_value(&json!({
            "rows": {
                "type": "array",
                "container_xpath": "//tr",
                "items": {
                    "type": "object",
                    "properties": { "cell": { "xpath": "./td", "type": "integer" } }
                }
            }
        }))
        .unwrap();

        assert!(matches!(schema.get("rows"), Some(FieldDef::ArrayOfObjects { .. })));
    }

    #[test]
    fn test_scalar_field_definition_is_malformed() {
        let schema = ExtractionSchema::from_value(&json!({
            "broken": "//h1",
            "also_broken": { "type": "object" },
            "no_container": { "type": "array", "items": { "type": "string" } }
        }))
        .unwrap();

        for name in ["broken", "also_broken", "no_container"] {
            assert!(
                matches!(schema.get(name), Some(FieldDef::Malformed(_))),
                "{} should be malformed",
                name
            );
        }
    }

    #[test]
    fn test_top_level_must_be_mapping() {
        let err = ExtractionSchema::from_value(&json!([{ "xpath": "//h1" }])).unwrap_err();
        assert!(matches!(err, ScrapeError::InvalidSchema(_)));

        assert!(ExtractionSchema::from_json_str("\"just a string\"").is_err());
    }

    #[test]
    fn test_root_object_wrapper_unwrapped() {
        let schema = ExtractionSchema::from_value(&json!({
            "type": "object",
            "properties": { "title": { "xpath": "//h1" } }
        }))
        .unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.get("title"), Some(&FieldDef::primitive("//h1", ValueType::Raw)));
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(ValueType::from_name("Integer"), ValueType::Integer);
        assert_eq!(ValueType::from_name("float"), ValueType::Number);
        assert_eq!(ValueType::from_name("BOOL"), ValueType::Boolean);
        assert_eq!(ValueType::from_name("currency"), ValueType::Raw);
    }

    #[test]
    fn test_canonical_form_reparses_identically() {
        let schema = ExtractionSchema::new()
            .with_field(
                "price",
                FieldDef::Primitive(
                    PrimitiveField::new("//span[@class='price']", ValueType::Number)
                        .with_transform("parse_price"),
                ),
            )
            .with_field(
                "links",
                FieldDef::array_of("//a", PrimitiveField::new("@href", ValueType::String)),
            )
            .with_field(
                "seller",
                FieldDef::object(
                    Some("//aside"),
                    ExtractionSchema::new().with_field("name", FieldDef::primitive("./b", ValueType::String)),
                ),
            );

        let reparsed = ExtractionSchema::from_json_str(&schema.to_json_pretty().unwrap()).unwrap();
        assert_eq!(schema, reparsed);
    }

    #[test]
    fn test_yaml_schema() {
        let schema = ExtractionSchema::from_yaml_str(
            r#"
            title:
              xpath: //h1
              type: string
            2024:
              xpath: //span[@class='year']
              type: integer
            "#,
        )
        .unwrap();

        assert_eq!(
            schema.get("2024"),
            Some(&FieldDef::primitive("//span[@class='year']", ValueType::Integer))
        );
    }
}

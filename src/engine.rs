//! Schema-driven extraction
//!
//! Walks an [`ExtractionSchema`] in lock-step with a document, narrowing the
//! context for nested objects and array items. Absence never aborts a run:
//! an unmatched primitive is `null`, an unmatched container is `[]`, and an
//! unmatched object narrowing is `null` without evaluating its fields.

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::coerce::{apply_transform, coerce};
use crate::error::Result;
use crate::query::{HtmlDocument, Match, QueryEngine};
use crate::resolve::{match_value, resolve_raw};
use crate::schema::{ExtractionSchema, FieldDef, ObjectField, PrimitiveField};

/// Applies schemas against documents exposed through a [`QueryEngine`]
pub struct Extractor<'q, Q: QueryEngine> {
    engine: &'q Q,
}

impl<'q, Q: QueryEngine> Extractor<'q, Q> {
    pub fn new(engine: &'q Q) -> Self {
        Self { engine }
    }

    /// Evaluate every field of `schema` against the document root
    pub fn extract(&self, schema: &ExtractionSchema) -> Value {
        let root = self.engine.root();
        Value::Object(self.extract_fields(&root, schema))
    }

    /// Evaluate every field of `schema` against `context`
    pub fn extract_fields(&self, context: &Q::Node, schema: &ExtractionSchema) -> Map<String, Value> {
        let mut result = Map::with_capacity(schema.len());
        for (name, def) in schema.iter() {
            trace!(field = name, "extracting field");
            result.insert(name.to_string(), self.extract_field(context, def));
        }
        result
    }

    pub fn extract_field(&self, context: &Q::Node, def: &FieldDef) -> Value {
        match def {
            FieldDef::Primitive(field) => self.primitive(context, field),
            FieldDef::Object(field) => self.object(context, field),
            FieldDef::ArrayOfPrimitives {
                container_path_query,
                item,
            } => self.array_of_primitives(context, container_path_query, item),
            FieldDef::ArrayOfObjects {
                container_path_query,
                item_fields,
            } => self.array_of_objects(context, container_path_query, item_fields),
            FieldDef::Malformed(_) => Value::Null,
        }
    }

    fn primitive(&self, context: &Q::Node, field: &PrimitiveField) -> Value {
        let result = self.engine.evaluate(context, &field.path_query);
        let raw = resolve_raw(self.engine, result);
        self.finish(raw, field)
    }

    fn object(&self, context: &Q::Node, field: &ObjectField) -> Value {
        match &field.context_path_query {
            Some(query) => match self.engine.narrow(context, query) {
                Some(narrowed) => Value::Object(self.extract_fields(&narrowed, &field.fields)),
                None => {
                    debug!(query = %query, "object context not found");
                    Value::Null
                }
            },
            None => Value::Object(self.extract_fields(context, &field.fields)),
        }
    }

    fn array_of_primitives(&self, context: &Q::Node, container: &str, item: &PrimitiveField) -> Value {
        let matches = self.engine.evaluate(context, container).into_matches();
        let values = matches
            .into_iter()
            .map(|m| match m {
                Match::Node(node) => self.primitive(&node, item),
                // Attribute and text matches are already the item's value
                other => {
                    let raw = match_value(self.engine, other).trim().to_string();
                    self.finish(Some(raw), item)
                }
            })
            .collect();
        Value::Array(values)
    }

    /// One object per container match. An attribute or text match cannot act
    /// as a context, so its object holds what an empty context would give:
    /// `null` scalars and objects, `[]` arrays.
    fn array_of_objects(&self, context: &Q::Node, container: &str, item_fields: &ExtractionSchema) -> Value {
        let matches = self.engine.evaluate(context, container).into_matches();
        let values = matches
            .into_iter()
            .map(|m| match m {
                Match::Node(node) => Value::Object(self.extract_fields(&node, item_fields)),
                _ => {
                    debug!(container, "non-element container match has no fields");
                    Value::Object(absent_fields(item_fields))
                }
            })
            .collect();
        Value::Array(values)
    }

    fn finish(&self, raw: Option<String>, field: &PrimitiveField) -> Value {
        let raw = match (raw, &field.transform) {
            (Some(raw), Some(transform)) => apply_transform(raw, transform, self.engine.base_url()),
            (raw, None) => raw,
            (None, Some(_)) => None,
        };
        match raw {
            Some(raw) => coerce(&raw, field.value_type),
            None => Value::Null,
        }
    }
}

// The result of evaluating `schema` where no query matches anything
fn absent_fields(schema: &ExtractionSchema) -> Map<String, Value> {
    schema
        .iter()
        .map(|(name, def)| {
            let value = match def {
                FieldDef::Object(ObjectField {
                    context_path_query: None,
                    fields,
                }) => Value::Object(absent_fields(fields)),
                FieldDef::ArrayOfPrimitives { .. } | FieldDef::ArrayOfObjects { .. } => Value::Array(Vec::new()),
                _ => Value::Null,
            };
            (name.to_string(), value)
        })
        .collect()
}

/// Extract `schema` from a parsed HTML document
pub fn extract(document: &HtmlDocument, schema: &ExtractionSchema) -> Value {
    let query = document.query();
    Extractor::new(&query).extract(schema)
}

/// Extract using a schema still in JSON form.
///
/// Fails only when the schema's top level is not a mapping of field definitions.
pub fn extract_json(document: &HtmlDocument, schema: &Value) -> Result<Value> {
    let schema = ExtractionSchema::from_value(schema)?;
    Ok(extract(document, &schema))
}

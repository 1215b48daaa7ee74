//! Schema-driven structured data extraction from HTML
//!
//! An [`ExtractionSchema`] maps output field names to path queries plus a
//! declared type. Applying it to a document yields a JSON object of the same
//! shape, with nested objects and arrays resolved against narrowed contexts:
//! - XPath 1.0 queries by default, CSS selectors behind a `css:` prefix
//! - Lossy type coercion (string, integer, number, boolean, raw)
//! - Value transforms (trim, case, price parsing, absolute URLs)
//! - Sample reduction and prompting for externally generated schemas
//! - C ABI for embedding in non-Rust hosts
//!
//! ```
//! use schema_scraper::{extract, ExtractionSchema, HtmlDocument};
//! use serde_json::json;
//!
//! let doc = HtmlDocument::parse("<html><body><h1> Hello </h1></body></html>");
//! let schema = ExtractionSchema::from_value(&json!({
//!     "title": { "xpath": "//h1", "type": "string" }
//! }))
//! .unwrap();
//!
//! assert_eq!(extract(&doc, &schema), json!({ "title": "Hello" }));
//! ```

pub mod coerce;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod generate;
pub mod normalize;
pub mod query;
pub mod reduce;
pub mod resolve;
pub mod schema;

pub use config::{config, init_config, GeneratorConfig, ReductionConfig, ScraperConfig};
pub use engine::{extract, extract_json, Extractor};
pub use error::{Result, ScrapeError};
pub use ffi::*;
pub use generate::{build_prompt, generate_schema, unwrap_response, SchemaGenerator, Scraper};
pub use normalize::normalize_keys;
pub use query::{HtmlDocument, HtmlQuery, Match, QueryEngine, QueryResult};
pub use reduce::reduce_html;
pub use schema::{ExtractionSchema, FieldDef, ObjectField, PrimitiveField, ValueType};

//! Schema generation support
//!
//! The crate does no network I/O. Generating a schema means reducing a sample
//! document, rendering a prompt, and handing it to a caller-supplied
//! [`SchemaGenerator`] whose reply is parsed back into an [`ExtractionSchema`].

use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{GeneratorConfig, ScraperConfig};
use crate::engine;
use crate::error::{Result, ScrapeError};
use crate::normalize::normalize_keys;
use crate::query::HtmlDocument;
use crate::reduce::reduce_html;
use crate::schema::ExtractionSchema;

const SCHEMA_INSTRUCTIONS: &str = r#"You write extraction schemas for HTML pages.

Given the page below and the data requirements, answer with a single JSON
object mapping each output field name to a field definition.

Field definitions:
- Primitive value:
  {"xpath": "<query>", "type": "string|integer|number|boolean", "transform": "<optional>"}
- Nested object, with an optional query narrowing the context:
  {"type": "object", "context_xpath": "<query>", "properties": {<field definitions>}}
- List, one item per container match:
  {"type": "array", "container_xpath": "<query>", "items": <primitive definition or {"type": "object", "properties": {...}}>}

Queries are XPath 1.0 expressions. Queries inside "properties" and "items"
are evaluated relative to the narrowed context, so start them with "." (for
example ".//h3" or "./@href"). Prefer stable attributes such as ids, data-*
attributes and semantic class names over positional paths.

Available transforms: trim, lowercase, uppercase, parse_price, absolute_url."#;

const OUTPUT_FORMAT_REMINDER: &str =
    "Respond with the JSON object only. Do not add explanations or comments.";

/// Renders the generation prompt for a reduced sample document
pub fn build_prompt(reduced_html: &str, requirements: &str) -> String {
    let mut prompt = String::with_capacity(SCHEMA_INSTRUCTIONS.len() + reduced_html.len() + 256);

    prompt.push_str(SCHEMA_INSTRUCTIONS);
    prompt.push_str("\n\n");

    prompt.push_str("Data requirements:\n");
    prompt.push_str(requirements.trim());
    prompt.push_str("\n\n");

    prompt.push_str("Page:\n");
    prompt.push_str("---\n");
    prompt.push_str(reduced_html);
    prompt.push_str("\n---\n\n");

    prompt.push_str(OUTPUT_FORMAT_REMINDER);
    prompt
}

/// Strip surrounding code-fence markers (```` ```json ... ``` ````) from a reply
pub fn unwrap_response(text: &str) -> &str {
    let mut body = text.trim();
    if body.starts_with("```") {
        // The opening fence runs to the end of its line, language tag included
        body = match body.find('\n') {
            Some(newline) => &body[newline + 1..],
            None => strip_language_tag(body.trim_start_matches('`')),
        };
    }
    if let Some(stripped) = body.trim_end().strip_suffix("```") {
        body = stripped;
    }
    body.trim()
}

// "json{...}" or "yaml a: b" on a single fenced line
fn strip_language_tag(body: &str) -> &str {
    let rest = body.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let tagged = rest.len() < body.len()
        && rest.starts_with(|c: char| c.is_whitespace() || c == '{' || c == '[');
    if tagged {
        rest
    } else {
        body
    }
}

/// Anything that turns a prompt into schema text
///
/// Implemented for closures, so a network client can be plugged in as
/// `|prompt, config| client.complete(&config.model, prompt)`.
pub trait SchemaGenerator {
    fn generate(&self, prompt: &str, config: &GeneratorConfig) -> Result<String>;
}

impl<F> SchemaGenerator for F
where
    F: Fn(&str, &GeneratorConfig) -> Result<String>,
{
    fn generate(&self, prompt: &str, config: &GeneratorConfig) -> Result<String> {
        self(prompt, config)
    }
}

/// Reduce `html`, ask `generator` for a schema and parse its reply
pub fn generate_schema<G>(
    generator: &G,
    html: &str,
    requirements: &str,
    config: &ScraperConfig,
) -> Result<ExtractionSchema>
where
    G: SchemaGenerator + ?Sized,
{
    let reduced = reduce_html(html, &config.reduction);
    debug!(
        original_len = html.len(),
        reduced_len = reduced.len(),
        "reduced sample document"
    );

    let prompt = build_prompt(&reduced, requirements);
    let response = generator.generate(&prompt, &config.generator)?;
    let value = parse_response(unwrap_response(&response))?;

    if !value.is_object() {
        warn!(model = %config.generator.model, "generator did not return a mapping");
        return Err(ScrapeError::Generation(
            "generator response is not a mapping of field definitions".to_string(),
        ));
    }
    ExtractionSchema::from_value(&value)
}

// JSON first; models regularly answer in YAML despite being asked not to
fn parse_response(body: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => Ok(value),
        Err(json_err) => match serde_yaml::from_str::<serde_yaml::Value>(body) {
            Ok(yaml) => Ok(normalize_keys(&yaml)),
            Err(_) => {
                warn!(error = %json_err, "generator response is not JSON");
                Err(ScrapeError::Generation(format!(
                    "unparseable generator response: {}",
                    json_err
                )))
            }
        },
    }
}

/// A schema bound to the settings it is applied with
#[derive(Debug, Clone)]
pub struct Scraper {
    schema: ExtractionSchema,
    base_url: Option<Url>,
}

impl Scraper {
    pub fn new(schema: ExtractionSchema) -> Self {
        Self {
            schema,
            base_url: None,
        }
    }

    /// Generate a schema from a sample document and wrap it
    pub fn generate<G>(
        generator: &G,
        html: &str,
        requirements: &str,
        config: &ScraperConfig,
    ) -> Result<Self>
    where
        G: SchemaGenerator + ?Sized,
    {
        let schema = generate_schema(generator, html, requirements, config)?;
        Self::new(schema).with_config(config)
    }

    /// Take the fallback base URL from `config`
    pub fn with_config(mut self, config: &ScraperConfig) -> Result<Self> {
        self.base_url = match &config.base_url {
            Some(base) => Some(
                Url::parse(base)
                    .map_err(|e| ScrapeError::Config(format!("base_url {:?}: {}", base, e)))?,
            ),
            None => None,
        };
        Ok(self)
    }

    pub fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    pub fn extract_html(&self, html: &str) -> Value {
        let document = HtmlDocument::parse(html).or_base_url(self.base_url.as_ref());
        engine::extract(&document, &self.schema)
    }

    /// Extract from an already parsed document; its own base URL takes precedence
    pub fn extract_document(&self, document: &HtmlDocument) -> Value {
        let query = document.query().or_base_url(self.base_url.as_ref());
        engine::Extractor::new(&query).extract(&self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    const PAGE: &str = r#"
    <html>
    <head><script>track();</script></head>
    <body>
        <ul class="products">
            <li class="product"><a href="/p/1">Lamp</a><span class="price">€12,50</span></li>
            <li class="product"><a href="/p/2">Desk</a><span class="price">€99,00</span></li>
        </ul>
    </body>
    </html>
    "#;

    const REPLY: &str = r#"```json
{
  "products": {
    "type": "array",
    "container_xpath": "//li[@class='product']",
    "items": {
      "type": "object",
      "properties": {
        "name": { "xpath": "./a", "type": "string" },
        "url": { "xpath": "./a/@href", "type": "string", "transform": "absolute_url" },
        "price": { "xpath": ".//span[@class='price']", "type": "number", "transform": "parse_price" }
      }
    }
  }
}
```"#;

    #[test]
    fn test_prompt_contains_requirements_and_page() {
        let prompt = build_prompt("<html><body>x</body></html>", "  product names  ");
        assert!(prompt.contains("Data requirements:\nproduct names\n"));
        assert!(prompt.contains("---\n<html><body>x</body></html>\n---"));
        assert!(prompt.contains("container_xpath"));
        assert!(prompt.ends_with(OUTPUT_FORMAT_REMINDER));
    }

    #[test]
    fn test_unwrap_response() {
        assert_eq!(unwrap_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(unwrap_response("```\n{}\n```\n"), "{}");
        assert_eq!(unwrap_response("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(unwrap_response("```json{\"a\": 1}```"), "{\"a\": 1}");
        assert_eq!(unwrap_response("```yaml a: 1```"), "a: 1");
        assert_eq!(unwrap_response("```[1, 2]```"), "[1, 2]");
        assert_eq!(unwrap_response("```title: x```"), "title: x");
    }

    #[test]
    fn test_generate_schema_sends_reduced_page() {
        let seen = RefCell::new(String::new());
        let generator = |prompt: &str, config: &GeneratorConfig| -> Result<String> {
            assert_eq!(config.model, "gpt-4o-mini");
            *seen.borrow_mut() = prompt.to_string();
            Ok(REPLY.to_string())
        };

        let schema = generate_schema(&generator, PAGE, "products with prices", &ScraperConfig::default())
            .unwrap();

        assert_eq!(schema.len(), 1);
        let prompt = seen.borrow();
        assert!(prompt.contains("products with prices"));
        assert!(prompt.contains("Lamp"));
        assert!(!prompt.contains("track()"));
    }

    #[test]
    fn test_yaml_reply_accepted() {
        let generator = |_: &str, _: &GeneratorConfig| -> Result<String> {
            Ok("title:\n  xpath: //h1\n  type: string\n".to_string())
        };
        let schema = generate_schema(&generator, PAGE, "title", &ScraperConfig::default()).unwrap();
        assert!(schema.get("title").is_some());
    }

    #[test]
    fn test_single_line_fenced_reply() {
        let generator = |_: &str, _: &GeneratorConfig| -> Result<String> {
            Ok(r#"```json{"t": {"xpath": "//p"}}```"#.to_string())
        };
        let schema = generate_schema(&generator, PAGE, "paragraph", &ScraperConfig::default()).unwrap();
        assert!(schema.get("t").is_some());
    }

    #[test]
    fn test_non_mapping_reply_is_generation_error() {
        let generator = |_: &str, _: &GeneratorConfig| -> Result<String> { Ok("[1, 2, 3]".to_string()) };
        let err = generate_schema(&generator, PAGE, "anything", &ScraperConfig::default()).unwrap_err();
        assert!(matches!(err, ScrapeError::Generation(_)));
    }

    #[test]
    fn test_generator_failure_propagates() {
        let generator = |_: &str, _: &GeneratorConfig| -> Result<String> {
            Err(ScrapeError::Generation("quota exceeded".to_string()))
        };
        let err = Scraper::generate(&generator, PAGE, "anything", &ScraperConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Schema generation failed: quota exceeded");
    }

    #[test]
    fn test_scraper_uses_config_base_url() {
        let generator = |_: &str, _: &GeneratorConfig| -> Result<String> { Ok(REPLY.to_string()) };
        let config = ScraperConfig {
            base_url: Some("https://shop.example.com/".to_string()),
            ..ScraperConfig::default()
        };

        let scraper = Scraper::generate(&generator, PAGE, "products", &config).unwrap();
        let expected = json!({
            "products": [
                { "name": "Lamp", "url": "https://shop.example.com/p/1", "price": 12.5 },
                { "name": "Desk", "url": "https://shop.example.com/p/2", "price": 99.0 }
            ]
        });

        assert_eq!(scraper.extract_html(PAGE), expected);
        assert_eq!(scraper.extract_document(&HtmlDocument::parse(PAGE)), expected);
    }

    #[test]
    fn test_document_base_takes_precedence() {
        let schema = ExtractionSchema::from_value(&json!({
            "link": { "xpath": "//a/@href", "type": "string", "transform": "absolute_url" }
        }))
        .unwrap();
        let config = ScraperConfig {
            base_url: Some("https://fallback.example.com/".to_string()),
            ..ScraperConfig::default()
        };
        let scraper = Scraper::new(schema).with_config(&config).unwrap();

        let html = r#"<html><head><base href="https://own.example.com/"></head><body><a href="x">x</a></body></html>"#;
        assert_eq!(scraper.extract_html(html), json!({ "link": "https://own.example.com/x" }));
    }
}

//! Path-query evaluation over parsed documents
//!
//! The extraction engine only talks to documents through [`QueryEngine`].
//! [`HtmlDocument`] is the built-in implementation, backed by `scraper`:
//! queries are XPath expressions by default, or CSS selectors when prefixed
//! with `css:`.

pub mod css;
mod xpath;

use once_cell::sync::OnceCell;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::error::{Result, ScrapeError};

use xpath::DocumentOrder;

pub use xpath::QueryParseError;

/// One item matched by a path query
#[derive(Debug, Clone, PartialEq)]
pub enum Match<N> {
    /// An element node, usable as a context for nested queries
    Node(N),
    Attribute { name: String, value: String },
    Text(String),
}

/// Outcome of evaluating a path query against a context node
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult<N> {
    /// Ordered matches, possibly empty
    Matches(Vec<Match<N>>),
    /// The query computed a value directly, e.g. `count(//li)`
    Scalar(String),
}

impl<N> QueryResult<N> {
    pub fn empty() -> Self {
        QueryResult::Matches(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QueryResult::Matches(m) if m.is_empty())
    }

    /// The matches in order; scalar results have none
    pub fn into_matches(self) -> Vec<Match<N>> {
        match self {
            QueryResult::Matches(m) => m,
            QueryResult::Scalar(_) => Vec::new(),
        }
    }
}

/// Read-only access to a document tree
pub trait QueryEngine {
    type Node: Clone;

    /// The context top-level schema fields are evaluated against
    fn root(&self) -> Self::Node;

    fn evaluate(&self, context: &Self::Node, query: &str) -> QueryResult<Self::Node>;

    /// First element matched by `query`, if any
    fn narrow(&self, context: &Self::Node, query: &str) -> Option<Self::Node> {
        self.evaluate(context, query)
            .into_matches()
            .into_iter()
            .find_map(|m| match m {
                Match::Node(node) => Some(node),
                _ => None,
            })
    }

    /// Rendered text content of a node
    fn text_content(&self, node: &Self::Node) -> String;

    /// Base for resolving relative links, when the document has one
    fn base_url(&self) -> Option<&Url> {
        None
    }
}

/// A parsed HTML document
#[derive(Debug)]
pub struct HtmlDocument {
    html: Html,
    base_url: Option<Url>,
    // Built on the first XPath query
    order: OnceCell<DocumentOrder>,
}

impl HtmlDocument {
    /// Parse a full document. An absolute `<base href>` becomes the base URL.
    pub fn parse(html: &str) -> Self {
        let html = Html::parse_document(html);
        let base_url = document_base(&html);
        Self {
            html,
            base_url,
            order: OnceCell::new(),
        }
    }

    pub fn parse_fragment(fragment: &str) -> Self {
        Self {
            html: Html::parse_fragment(fragment),
            base_url: None,
            order: OnceCell::new(),
        }
    }

    /// Override the base URL used by the `absolute_url` transform
    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let url = Url::parse(base)
            .map_err(|e| ScrapeError::Config(format!("invalid base URL {:?}: {}", base, e)))?;
        self.base_url = Some(url);
        Ok(self)
    }

    /// Use `base` only when the document did not declare one itself
    pub fn or_base_url(mut self, base: Option<&Url>) -> Self {
        if self.base_url.is_none() {
            self.base_url = base.cloned();
        }
        self
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    pub fn query(&self) -> HtmlQuery<'_> {
        HtmlQuery {
            html: &self.html,
            base_url: self.base_url.as_ref(),
            order: &self.order,
        }
    }
}

fn document_base(html: &Html) -> Option<Url> {
    let selector = Selector::parse("base[href]").ok()?;
    let href = html.select(&selector).next()?.value().attr("href")?;
    Url::parse(href.trim()).ok()
}

/// [`QueryEngine`] over a borrowed [`HtmlDocument`]
#[derive(Debug, Clone, Copy)]
pub struct HtmlQuery<'a> {
    html: &'a Html,
    base_url: Option<&'a Url>,
    order: &'a OnceCell<DocumentOrder>,
}

impl<'a> HtmlQuery<'a> {
    /// Use `base` only when the document did not declare one itself
    pub fn or_base_url(self, base: Option<&'a Url>) -> Self {
        Self {
            base_url: self.base_url.or(base),
            ..self
        }
    }
}

impl<'a> QueryEngine for HtmlQuery<'a> {
    type Node = ElementRef<'a>;

    fn root(&self) -> ElementRef<'a> {
        self.html.root_element()
    }

    fn evaluate(&self, context: &ElementRef<'a>, query: &str) -> QueryResult<ElementRef<'a>> {
        let query = query.trim();
        if let Some(selector) = query.strip_prefix("css:") {
            return QueryResult::Matches(css::select(*context, selector));
        }
        let order = self.order.get_or_init(|| DocumentOrder::new(self.html));
        match xpath::evaluate(self.html, order, *context, query) {
            Ok(result) => result,
            Err(e) => {
                debug!(query, error = %e, "unparseable path query matches nothing");
                QueryResult::empty()
            }
        }
    }

    fn text_content(&self, node: &ElementRef<'a>) -> String {
        node.text().collect()
    }

    fn base_url(&self) -> Option<&Url> {
        self.base_url
    }
}

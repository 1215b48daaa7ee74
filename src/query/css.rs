//! CSS selector queries
//!
//! Queries of the form `css:<selector>[::text | ::attr(name)]`, evaluated with
//! the scraper crate against the descendants of the context element.

use scraper::{ElementRef, Selector};
use tracing::debug;

use super::Match;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CssAccessor {
    /// The element itself
    Node,
    Text,
    Attr(String),
}

/// Select descendants of `context` matching `input`
pub fn select<'a>(context: ElementRef<'a>, input: &str) -> Vec<Match<ElementRef<'a>>> {
    let (selector_str, accessor) = split_accessor(input);

    let selector = match Selector::parse(&selector_str) {
        Ok(s) => s,
        Err(e) => {
            debug!(selector = %selector_str, error = ?e, "invalid CSS selector");
            return vec![];
        }
    };

    let elements = context.select(&selector);
    match accessor {
        CssAccessor::Node => elements.map(Match::Node).collect(),
        CssAccessor::Text => elements
            .map(|el| Match::Text(el.text().collect::<String>()))
            .collect(),
        CssAccessor::Attr(name) => elements
            .filter_map(|el| {
                el.value().attr(&name).map(|value| Match::Attribute {
                    name: name.clone(),
                    value: value.to_string(),
                })
            })
            .collect(),
    }
}

// Split a trailing pseudo-element (::text, ::attr(x)) off the selector
fn split_accessor(input: &str) -> (String, CssAccessor) {
    let input = input.trim();
    if let Some(pos) = input.rfind("::text") {
        (input[..pos].trim().to_string(), CssAccessor::Text)
    } else if let Some(pos) = input.rfind("::attr(") {
        let attr_start = pos + 7;
        match input[attr_start..].find(')') {
            Some(attr_end) => {
                let attr_name = input[attr_start..attr_start + attr_end].trim().to_string();
                (input[..pos].trim().to_string(), CssAccessor::Attr(attr_name))
            }
            None => (input.to_string(), CssAccessor::Node),
        }
    } else {
        (input.to_string(), CssAccessor::Node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    const HTML: &str = r#"
    <html>
    <body>
        <div class="price">$19.99</div>
        <div class="price">$29.99</div>
        <a href="/product/123" class="link">Product</a>
        <a class="link">No href</a>
    </body>
    </html>
    "#;

    #[test]
    fn test_css_nodes_in_document_order() {
        let document = Html::parse_document(HTML);
        let matches = select(document.root_element(), ".price");
        assert_eq!(matches.len(), 2);
        match &matches[1] {
            Match::Node(el) => assert_eq!(el.text().collect::<String>(), "$29.99"),
            other => panic!("expected node, got {:?}", other),
        }
    }

    #[test]
    fn test_css_text_accessor() {
        let document = Html::parse_document(HTML);
        let matches = select(document.root_element(), "div.price::text");
        assert!(matches!(&matches[0], Match::Text(t) if t == "$19.99"));
    }

    #[test]
    fn test_css_attr_accessor_skips_missing() {
        let document = Html::parse_document(HTML);
        let matches = select(document.root_element(), "a.link::attr(href)");
        assert_eq!(matches.len(), 1);
        assert!(matches!(
            &matches[0],
            Match::Attribute { name, value } if name == "href" && value == "/product/123"
        ));
    }

    #[test]
    fn test_split_accessor() {
        assert_eq!(
            split_accessor("div.product .unit-price::attr( data-unit )"),
            (
                "div.product .unit-price".to_string(),
                CssAccessor::Attr("data-unit".to_string())
            )
        );
        assert_eq!(split_accessor("li a"), ("li a".to_string(), CssAccessor::Node));
        assert_eq!(split_accessor("p::attr(broken"), ("p::attr(broken".to_string(), CssAccessor::Node));
    }
}

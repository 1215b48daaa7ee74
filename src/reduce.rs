//! Sample document reduction
//!
//! Before a sample page is shown to a schema generator it is shrunk: non-content
//! elements and comments go away, whitespace is collapsed, `style` and inline
//! event-handler attributes are dropped, and long runs of look-alike siblings
//! are cut down to a few representatives.

use scraper::{ElementRef, Html};

use crate::config::ReductionConfig;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Reduce a full HTML document to compact markup
pub fn reduce_html(html: &str, config: &ReductionConfig) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len().min(config.max_length));
    write_element(document.root_element(), config, &mut out);
    truncate_at_boundary(out, config.max_length)
}

fn write_element(element: ElementRef<'_>, config: &ReductionConfig, out: &mut String) {
    let name = element.value().name();
    out.push('<');
    out.push_str(name);
    for (attr, value) in element.value().attrs() {
        if attr == "style" || attr.starts_with("on") {
            continue;
        }
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        push_escaped(out, value, true);
        out.push('"');
    }
    out.push('>');

    if VOID_ELEMENTS.contains(&name) {
        return;
    }

    let mut previous: Option<(&str, Option<&str>)> = None;
    let mut run = 0usize;
    let mut omitted = 0usize;

    for child in element.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            let child_name = child_el.value().name();
            if config.strip_tags.iter().any(|t| t.eq_ignore_ascii_case(child_name)) {
                continue;
            }

            let key = (child_name, child_el.value().attr("class"));
            if previous == Some(key) {
                run += 1;
            } else {
                flush_omitted(out, &mut omitted);
                previous = Some(key);
                run = 1;
            }

            if run > config.max_repeated_siblings {
                omitted += 1;
                continue;
            }
            write_element(child_el, config, out);
        } else if let Some(text) = child.value().as_text() {
            let collapsed = collapse(text);
            if collapsed.trim().is_empty() {
                continue;
            }
            // Real text between siblings ends a run
            flush_omitted(out, &mut omitted);
            previous = None;
            push_escaped(out, &collapsed, false);
        }
    }
    flush_omitted(out, &mut omitted);

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn flush_omitted(out: &mut String, omitted: &mut usize) {
    if *omitted > 0 {
        out.push_str(&format!("<!-- {} similar elements omitted -->", omitted));
        *omitted = 0;
    }
}

// Collapse whitespace runs to one space, keeping a boundary space if present
fn collapse(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                collapsed.push(' ');
            }
            in_space = true;
        } else {
            collapsed.push(c);
            in_space = false;
        }
    }
    collapsed
}

fn push_escaped(out: &mut String, text: &str, in_attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' if !in_attribute => out.push_str("&lt;"),
            '>' if !in_attribute => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn truncate_at_boundary(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReductionConfig {
        ReductionConfig {
            max_repeated_siblings: 2,
            ..ReductionConfig::default()
        }
    }

    #[test]
    fn test_strips_non_content() {
        let html = r#"
        <html>
        <head><title>T</title><script>var x = 1;</script><style>p{}</style></head>
        <body>
            <!-- comment -->
            <p style="color:red" onclick="go()" class="lead">  Hello
                 <b>world</b>  </p>
            <noscript>enable js</noscript>
        </body>
        </html>
        "#;

        let reduced = reduce_html(html, &config());
        assert!(!reduced.contains("var x"));
        assert!(!reduced.contains("p{}"));
        assert!(!reduced.contains("comment"));
        assert!(!reduced.contains("enable js"));
        assert!(!reduced.contains("style="));
        assert!(!reduced.contains("onclick"));
        assert!(reduced.contains(r#"<p class="lead"> Hello <b>world</b></p>"#));
        assert!(reduced.contains("<title>T</title>"));
    }

    #[test]
    fn test_truncates_repeated_siblings() {
        let items: String = (1..=6).map(|i| format!("<li class=\"row\">item {}</li>\n", i)).collect();
        let html = format!("<html><body><ul>{}<li class=\"footer\">end</li></ul></body></html>", items);

        let reduced = reduce_html(&html, &config());
        assert!(reduced.contains("item 1"));
        assert!(reduced.contains("item 2"));
        assert!(!reduced.contains("item 3"));
        assert!(reduced.contains("<!-- 4 similar elements omitted -->"));
        assert!(reduced.contains("end"));
    }

    #[test]
    fn test_respects_max_length_on_char_boundary() {
        let html = "<html><body><p>ééééééééééé</p></body></html>";
        let reduced = reduce_html(
            html,
            &ReductionConfig {
                max_length: 30,
                ..config()
            },
        );
        assert!(reduced.len() <= 30);
        assert!(reduced.starts_with("<html><head></head><body>"));
    }

    #[test]
    fn test_escapes_text_and_attributes() {
        let html = r#"<html><body><a title="say &quot;hi&quot;">1 &lt; 2 &amp; 3</a></body></html>"#;
        let reduced = reduce_html(html, &config());
        assert!(reduced.contains(r#"<a title="say &quot;hi&quot;">1 &lt; 2 &amp; 3</a>"#));
    }
}

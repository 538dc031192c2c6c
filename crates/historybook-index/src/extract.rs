//! Title and plain-text extraction from captured HTML.
//!
//! Parsing is best-effort: malformed markup never fails, it only yields less
//! text.

use scraper::{Html, Node};

/// Elements whose text never reaches the index.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that separate words in the rendered page.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "dd", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "head", "header", "html", "li", "main", "nav", "ol", "option", "p", "pre", "section",
    "table", "td", "th", "title", "tr", "ul",
];

/// Void elements that break the surrounding text.
const BREAK_ELEMENTS: &[&str] = &["br", "hr", "img", "wbr"];

/// Text extracted from a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    /// Contents of the `<title>` element, or empty if there is none.
    pub title: String,
    /// Whitespace-normalized text of the whole document.
    pub content: String,
}

/// Extracts the title and visible text from `markup`.
///
/// `base_url` is the address the markup was fetched from; it is only used for
/// diagnostics.
pub fn extract(markup: &str, base_url: &str) -> ExtractedText {
    let document = Html::parse_document(markup);

    if !document.errors.is_empty() {
        tracing::trace!(
            "{} parse errors while extracting {}",
            document.errors.len(),
            base_url
        );
    }

    ExtractedText {
        title: extract_title(&document),
        content: extract_content(&document),
    }
}

fn extract_title(document: &Html) -> String {
    document
        .root_element()
        .descendants()
        .find(|node| {
            node.value()
                .as_element()
                .is_some_and(|element| element.name() == "title")
        })
        .map(|title| {
            let text: String = title
                .descendants()
                .filter_map(|node| node.value().as_text().map(|t| t.to_string()))
                .collect();
            normalize_whitespace(&text)
        })
        .unwrap_or_default()
}

fn extract_content(document: &Html) -> String {
    let mut text = String::new();
    let mut last_block = None;

    for node in document.root_element().descendants() {
        let fragment = match node.value() {
            Node::Text(fragment) => fragment,
            Node::Element(element) if BREAK_ELEMENTS.contains(&element.name()) => {
                text.push(' ');
                continue;
            }
            _ => continue,
        };

        let mut block = None;
        let mut skipped = false;
        for ancestor in node.ancestors() {
            if let Some(element) = ancestor.value().as_element() {
                let name = element.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    skipped = true;
                    break;
                }
                if block.is_none() && BLOCK_ELEMENTS.contains(&name) {
                    block = Some(ancestor.id());
                }
            }
        }
        if skipped {
            continue;
        }

        // Text runs inside the same block element are joined without a gap
        if block != last_block {
            text.push(' ');
            last_block = block;
        }
        text.push_str(fragment);
    }

    normalize_whitespace(&text)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

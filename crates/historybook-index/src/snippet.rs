//! Highlighted snippets built from the best matching fragments of a page.

use once_cell::sync::Lazy;
use regex::Regex;
use tantivy::query::Query;
use tantivy::schema::Field;
use tantivy::snippet::{Snippet, SnippetGenerator};
use tantivy::Searcher;

use crate::error::Result;

/// Maximum characters per highlighted fragment.
const FRAGMENT_MAX_CHARS: usize = 150;

/// Maximum fragments joined into one snippet.
const MAX_FRAGMENTS: usize = 3;

const FRAGMENT_SEPARATOR: &str = " ... ";

/// Any tag other than the `<b>` pair emitted around matched terms.
static RESIDUAL_MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9]*)[^<>]*>").expect("Invalid regex pattern"));

/// Produces highlighted snippets for one query.
pub struct Highlighter {
    generator: SnippetGenerator,
}

impl Highlighter {
    /// Creates a highlighter for the terms `query` matches in `field`.
    pub fn new(searcher: &Searcher, query: &dyn Query, field: Field) -> Result<Self> {
        let mut generator = SnippetGenerator::create(searcher, query, field)?;
        generator.set_max_num_chars(FRAGMENT_MAX_CHARS);
        Ok(Self { generator })
    }

    /// Returns up to `MAX_FRAGMENTS` highlighted fragments of `text`, in page
    /// order, as plain text with matched terms wrapped in `<b>`.
    ///
    /// Falls back to the beginning of the text when no term matches.
    pub fn highlight(&self, text: &str) -> String {
        let mut fragments: Vec<(usize, usize, Snippet)> = passages(text, FRAGMENT_MAX_CHARS * 2)
            .into_iter()
            .enumerate()
            .filter_map(|(position, passage)| {
                let snippet = self.generator.snippet(passage.trim());
                let hits = snippet.highlighted().len();
                (hits > 0).then_some((position, hits, snippet))
            })
            .collect();

        if fragments.is_empty() {
            return strip_markup(&escape_html(leading_text(text, FRAGMENT_MAX_CHARS)));
        }

        fragments.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        fragments.truncate(MAX_FRAGMENTS);
        fragments.sort_by_key(|(position, _, _)| *position);

        let joined = fragments
            .iter()
            .map(|(_, _, snippet)| snippet.to_html())
            .collect::<Vec<_>>()
            .join(FRAGMENT_SEPARATOR);

        strip_markup(&joined)
    }
}

/// Removes every tag except `<b>` and `</b>`.
pub fn strip_markup(snippet: &str) -> String {
    RESIDUAL_MARKUP
        .replace_all(snippet, |caps: &regex::Captures<'_>| {
            if caps[2].eq_ignore_ascii_case("b") && caps[0].len() == caps[1].len() + 3 {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

/// Splits `text` into passages of roughly `width` bytes, breaking only at
/// whitespace.
fn passages(text: &str, width: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + width.max(1)).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        if end < text.len() {
            end = match text[end..].find(char::is_whitespace) {
                Some(offset) => end + offset,
                None => text.len(),
            };
        }
        out.push(&text[start..end]);
        start = end;
    }

    out
}

fn leading_text(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => {
            let cut = text[..end].rfind(char::is_whitespace).unwrap_or(end);
            &text[..cut]
        }
        None => text,
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

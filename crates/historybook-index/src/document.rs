//! Index schema and the adapter between captured pages and index documents.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tantivy::schema::{Field, Schema, Value, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::TantivyDocument;
use url::{Host, Url};

/// Name of the tokenized page text field.
pub const FIELD_SEARCH: &str = "body";
pub const FIELD_COLLECTION: &str = "collection";
/// Exact-match page address. Also a fast column so results group by URL
/// without loading stored documents.
pub const FIELD_URL: &str = "url";
pub const FIELD_DOMAIN: &str = "domain";
/// Epoch seconds, indexed as a fast column for ranking. Never stored.
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_TIMESTAMP_TEXT: &str = "timestamp_text";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_KEY: &str = "key";

/// Schema with field handles.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub schema: Schema,
    pub collection: Field,
    pub url: Field,
    pub domain: Field,
    pub timestamp: Field,
    pub timestamp_text: Field,
    pub title: Field,
    pub body: Field,
    pub key: Field,
}

impl IndexSchema {
    /// Builds the page schema.
    pub fn new() -> Self {
        let mut builder = Schema::builder();

        let collection = builder.add_text_field(FIELD_COLLECTION, STRING | STORED);
        let url = builder.add_text_field(FIELD_URL, STRING | STORED | FAST);
        let domain = builder.add_text_field(FIELD_DOMAIN, STRING | STORED);
        let timestamp = builder.add_i64_field(FIELD_TIMESTAMP, INDEXED | FAST);
        let timestamp_text = builder.add_text_field(FIELD_TIMESTAMP_TEXT, STORED);
        let title = builder.add_text_field(FIELD_TITLE, TEXT | STORED);
        let body = builder.add_text_field(FIELD_SEARCH, TEXT | STORED);
        let key = builder.add_text_field(FIELD_KEY, STRING | STORED);

        Self {
            schema: builder.build(),
            collection,
            url,
            domain,
            timestamp,
            timestamp_text,
            title,
            body,
            key,
        }
    }
}

impl Default for IndexSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Semantic view over an index document.
///
/// Setters consume and return the adapter so a page can be built in one chain.
#[derive(Debug, Clone)]
pub struct PageDocument<'a> {
    fields: &'a IndexSchema,
    doc: TantivyDocument,
}

impl<'a> PageDocument<'a> {
    /// Creates an adapter over a new, empty document.
    pub fn new(fields: &'a IndexSchema) -> Self {
        Self {
            fields,
            doc: TantivyDocument::default(),
        }
    }

    /// Wraps a document retrieved from the index.
    pub fn from_document(fields: &'a IndexSchema, doc: TantivyDocument) -> Self {
        Self { fields, doc }
    }

    /// Sets the case-sensitive collection namespace.
    pub fn set_collection(mut self, collection: &str) -> Self {
        self.doc.add_text(self.fields.collection, collection);
        self
    }

    pub fn collection(&self) -> Option<&str> {
        self.text(self.fields.collection)
    }

    /// Sets the page URL and derives the domain field from it.
    pub fn set_url(mut self, url: &str) -> Self {
        self.doc.add_text(self.fields.url, url);
        match registrable_domain(url) {
            Some(domain) => self.doc.add_text(self.fields.domain, domain),
            None => tracing::error!("Unable to parse url {}", url),
        }
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.text(self.fields.url)
    }

    /// The registrable domain of the page URL. Useful for grouping/filtering results.
    pub fn domain(&self) -> Option<&str> {
        self.text(self.fields.domain)
    }

    /// Records when the page was fetched, as epoch seconds for ranking and as
    /// ISO-8601 text for display.
    pub fn set_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.doc.add_i64(self.fields.timestamp, timestamp.timestamp());
        self.doc.add_text(
            self.fields.timestamp_text,
            timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
        self
    }

    pub fn timestamp_text(&self) -> Option<&str> {
        self.text(self.fields.timestamp_text)
    }

    /// Epoch seconds. Only present before the document is indexed; the
    /// numeric field is not stored.
    pub fn timestamp_secs(&self) -> Option<i64> {
        self.doc
            .get_first(self.fields.timestamp)
            .and_then(|value| value.as_i64())
    }

    pub fn set_title(mut self, title: &str) -> Self {
        self.doc.add_text(self.fields.title, title);
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.text(self.fields.title)
    }

    /// Sets the page text and its content key.
    pub fn set_content(mut self, content: &str) -> Self {
        self.doc.add_text(self.fields.body, content);
        self.doc.add_text(self.fields.key, content_key(content));
        self
    }

    pub fn content(&self) -> Option<&str> {
        self.text(self.fields.body)
    }

    /// A key identifying the page content (a hash of the extracted text).
    pub fn key(&self) -> Option<&str> {
        self.text(self.fields.key)
    }

    /// Returns the underlying document.
    pub fn into_document(self) -> TantivyDocument {
        self.doc
    }

    fn text(&self, field: Field) -> Option<&str> {
        self.doc.get_first(field).and_then(|value| value.as_str())
    }
}

/// Hex SHA-256 of the extracted page text.
pub fn content_key(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reduces the host of `url` to its registrable domain.
///
/// IP literals and `localhost` are returned verbatim. Returns `None` if the
/// URL cannot be parsed or has no host.
pub fn registrable_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    match parsed.host()? {
        Host::Domain(host) => {
            if host.eq_ignore_ascii_case("localhost") {
                return Some(host.to_string());
            }
            let domain = psl::domain_str(host).unwrap_or(host);
            Some(domain.to_string())
        }
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

//! The history index: ingest, ranked search and lifecycle.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{
    DocAddress, DocId, Index, IndexReader, IndexWriter, ReloadPolicy, Score, Searcher,
    SegmentReader, TantivyDocument, Term,
};

use crate::document::{IndexSchema, PageDocument, FIELD_TIMESTAMP, FIELD_URL};
use crate::error::{IndexError, Result};
use crate::extract::extract;
use crate::ranking::{RecencyBoost, ScoreTransform};
use crate::result::{ResultPage, SearchResult};
use crate::snippet::Highlighter;
use crate::PageIndex;

/// Name of the index directory under the data directory.
pub const INDEX_DIR: &str = "index";

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Persistent full-text index of captured pages.
///
/// Writes are serialized through a single writer; every ingest commits and
/// reloads the reader, so searches issued afterwards observe the page.
/// Searches run concurrently against the current snapshot.
pub struct HistoryIndex {
    index: Index,
    fields: IndexSchema,
    writer: Mutex<Option<IndexWriter>>,
    reader: IndexReader,
    transform: Arc<dyn ScoreTransform>,
    closed: AtomicBool,
}

impl HistoryIndex {
    /// Opens the index under `<data_dir>/index`, creating it if needed.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join(INDEX_DIR);
        std::fs::create_dir_all(&path)?;

        let fields = IndexSchema::new();
        let directory = MmapDirectory::open(&path)?;
        let index = Index::open_or_create(directory, fields.schema.clone())?;

        tracing::info!("Opened history index at {:?}", path);
        Self::from_index(index, fields)
    }

    /// Creates a throwaway index held in memory.
    pub fn in_memory() -> Result<Self> {
        let fields = IndexSchema::new();
        let index = Index::create_in_ram(fields.schema.clone());
        Self::from_index(index, fields)
    }

    fn from_index(index: Index, fields: IndexSchema) -> Result<Self> {
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            fields,
            writer: Mutex::new(Some(writer)),
            reader,
            transform: Arc::new(RecencyBoost::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Replaces the score transform applied to search results.
    pub fn with_transform(mut self, transform: impl ScoreTransform + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Extracts, indexes and commits one page.
    ///
    /// Returns once the page is visible to subsequent searches.
    pub fn index_page(
        &self,
        collection: &str,
        url: &str,
        timestamp: DateTime<Utc>,
        body: &str,
    ) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(IndexError::Closed)?;

        let extracted = extract(body, url);
        let doc = PageDocument::new(&self.fields)
            .set_collection(collection)
            .set_url(url)
            .set_timestamp(timestamp)
            .set_title(&extracted.title)
            .set_content(&extracted.content)
            .into_document();

        writer.add_document(doc)?;
        writer.commit()?;
        self.reader.reload()?;

        tracing::debug!("Indexed {} into collection {}", url, collection);
        Ok(())
    }

    /// Runs `query` against one collection.
    ///
    /// Matches are grouped by URL, keeping the best scoring capture of each,
    /// then ordered by descending score and windowed by `offset`/`size`.
    pub fn search(
        &self,
        collection: &str,
        query: &str,
        offset: usize,
        size: usize,
        include_debug: bool,
    ) -> Result<ResultPage> {
        if self.is_closed() {
            return Err(IndexError::Closed);
        }

        let parser =
            QueryParser::for_index(&self.index, vec![self.fields.body, self.fields.title]);
        let user_query = parser.parse_query(query)?;

        let searcher = self.reader.searcher();
        let highlighter = Highlighter::new(&searcher, user_query.as_ref(), self.fields.body)?;

        let collection_filter = ConstScoreQuery::new(
            Box::new(TermQuery::new(
                Term::from_field_text(self.fields.collection, collection),
                IndexRecordOption::Basic,
            )),
            0.0,
        );
        let full_query = BooleanQuery::new(vec![
            (Occur::Must, user_query),
            (Occur::Must, Box::new(collection_filter) as Box<dyn Query>),
        ]);

        let now = Utc::now().timestamp();
        let groups = self.grouped_matches(&searcher, &full_query, now)?;

        let mut page = ResultPage::empty(query, offset, size);
        page.result_count = groups.len();
        if include_debug {
            page.debug_info = Some(format!("{:?}", full_query));
        }

        for (score, address) in groups.into_iter().skip(offset).take(size) {
            let doc: TantivyDocument = searcher.doc(address)?;
            let page_doc = PageDocument::from_document(&self.fields, doc);

            let debug_info = if include_debug {
                let explanation = full_query.explain(&searcher, address)?;
                let timestamp = timestamp_of(&searcher, address);
                Some(format!(
                    "{}\n{}",
                    explanation.to_pretty_json(),
                    self.transform.explain(timestamp, now)
                ))
            } else {
                None
            };

            page.results.push(SearchResult {
                key: page_doc.key().unwrap_or_default().to_string(),
                collection: page_doc.collection().unwrap_or_default().to_string(),
                title: page_doc.title().unwrap_or_default().to_string(),
                url: page_doc.url().unwrap_or_default().to_string(),
                domain: page_doc.domain().unwrap_or_default().to_string(),
                timestamp: page_doc.timestamp_text().unwrap_or_default().to_string(),
                snippet: highlighter.highlight(page_doc.content().unwrap_or_default()),
                debug_info,
                score,
            });
        }

        tracing::debug!(
            "Query {:?} in {} matched {} urls",
            query,
            collection,
            page.result_count
        );
        Ok(page)
    }

    /// Collects every match with its transformed score and keeps the best one
    /// per URL, ordered by descending score.
    fn grouped_matches(
        &self,
        searcher: &Searcher,
        query: &dyn Query,
        now: i64,
    ) -> Result<Vec<(Score, DocAddress)>> {
        let limit = (searcher.num_docs() as usize).max(1);
        let transform = Arc::clone(&self.transform);

        let collector = TopDocs::with_limit(limit).tweak_score(
            move |segment_reader: &SegmentReader| {
                let timestamps = segment_reader.fast_fields().i64(FIELD_TIMESTAMP).ok();
                let transform = Arc::clone(&transform);
                move |doc: DocId, score: Score| {
                    let timestamp = timestamps.as_ref().and_then(|column| column.first(doc));
                    transform.transform(score, timestamp, now)
                }
            },
        );

        let matches = searcher.search(query, &collector)?;

        let url_columns = searcher
            .segment_readers()
            .iter()
            .map(|reader| reader.fast_fields().str(FIELD_URL))
            .collect::<tantivy::Result<Vec<_>>>()?;

        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        for (score, address) in matches {
            let column = url_columns
                .get(address.segment_ord as usize)
                .and_then(Option::as_ref);

            let mut url = String::new();
            if let Some(column) = column {
                if let Some(ord) = column.term_ords(address.doc_id).next() {
                    column.ord_to_str(ord, &mut url)?;
                }
            }

            if seen.insert(url) {
                groups.push((score, address));
            }
        }

        Ok(groups)
    }

    /// Flushes and releases the writer.
    ///
    /// Every later operation, including a second close, fails with
    /// [`IndexError::Closed`].
    pub fn close(&self) -> Result<()> {
        let writer = self.writer.lock().take().ok_or(IndexError::Closed)?;
        self.closed.store(true, Ordering::Release);
        writer.wait_merging_threads()?;
        tracing::info!("History index closed");
        Ok(())
    }
}

impl PageIndex for HistoryIndex {
    fn index_page(
        &self,
        collection: &str,
        url: &str,
        timestamp: DateTime<Utc>,
        body: &str,
    ) -> Result<()> {
        HistoryIndex::index_page(self, collection, url, timestamp, body)
    }

    fn search(
        &self,
        collection: &str,
        query: &str,
        offset: usize,
        size: usize,
        include_debug: bool,
    ) -> Result<ResultPage> {
        HistoryIndex::search(self, collection, query, offset, size, include_debug)
    }
}

fn timestamp_of(searcher: &Searcher, address: DocAddress) -> Option<i64> {
    searcher
        .segment_reader(address.segment_ord)
        .fast_fields()
        .i64(FIELD_TIMESTAMP)
        .ok()
        .and_then(|column| column.first(address.doc_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::IdentityTransform;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    const TEST_HTML: &str =
        "<html><head><title>Testing 1-2-3</title></head><body>Testing Doc1</body></html>";

    #[test]
    fn index_and_search() {
        let temp_dir = TempDir::new().unwrap();
        let index = HistoryIndex::open(temp_dir.path()).unwrap();
        let fetched = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();

        index
            .index_page("test", "http://www.difference.com/page", fetched, TEST_HTML)
            .unwrap();

        let page = index.search("test", "Doc1", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 1);
        assert_eq!(page.query, "Doc1");
        assert_eq!(page.max_results_requested, 10);

        let result = &page.results[0];
        assert_eq!(result.collection, "test");
        assert_eq!(result.url, "http://www.difference.com/page");
        assert_eq!(result.domain, "difference.com");
        assert_eq!(result.title, "Testing 1-2-3");
        assert_eq!(result.timestamp, "2020-01-02T03:04:05Z");
        assert_eq!(result.key.len(), 64);
        assert!(result.snippet.contains("<b>Doc1</b>"));
        assert!(result.score > 0.0);
    }

    #[test]
    fn title_terms_are_searchable() {
        let index = HistoryIndex::in_memory().unwrap();
        index
            .index_page("test", "http://example.com/", Utc::now(), TEST_HTML)
            .unwrap();

        let page = index.search("test", "title:testing", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 1);
    }

    #[test]
    fn reopened_index_keeps_pages() {
        let temp_dir = TempDir::new().unwrap();
        {
            let index = HistoryIndex::open(temp_dir.path()).unwrap();
            index
                .index_page("test", "http://example.com/", Utc::now(), TEST_HTML)
                .unwrap();
            index.close().unwrap();
        }

        let index = HistoryIndex::open(temp_dir.path()).unwrap();
        let page = index.search("test", "Doc1", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 1);
    }

    #[test]
    fn collections_are_isolated() {
        let index = HistoryIndex::in_memory().unwrap();
        index
            .index_page("test", "http://example.com/a", Utc::now(), TEST_HTML)
            .unwrap();
        index
            .index_page("other", "http://example.com/b", Utc::now(), TEST_HTML)
            .unwrap();

        let page = index.search("test", "Doc1", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 1);
        assert_eq!(page.results[0].url, "http://example.com/a");

        let page = index.search("Test", "Doc1", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 0);
    }

    #[test]
    fn debug_info_only_when_requested() {
        let index = HistoryIndex::in_memory().unwrap();
        index
            .index_page("test", "http://example.com/", Utc::now(), TEST_HTML)
            .unwrap();

        let page = index.search("test", "Doc1", 0, 10, false).unwrap();
        assert!(page.debug_info.is_none());
        assert!(page.results[0].debug_info.is_none());

        let page = index.search("test", "Doc1", 0, 10, true).unwrap();
        assert!(page.debug_info.is_some());
        let result_debug = page.results[0].debug_info.as_deref().unwrap();
        assert!(result_debug.contains("recency boost"));
    }

    #[test]
    fn same_url_is_grouped() {
        let index = HistoryIndex::in_memory().unwrap();
        let url = "http://example.com/page";
        index
            .index_page("test", url, Utc::now() - Duration::days(3), "<p>Shared first</p>")
            .unwrap();
        index
            .index_page("test", url, Utc::now(), "<p>Shared second</p>")
            .unwrap();

        let page = index.search("test", "shared", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 1);
        assert_eq!(page.results.len(), 1);
        assert!(page.results[0].snippet.contains("second"));
    }

    #[test]
    fn grouping_spans_segments() {
        let index = HistoryIndex::in_memory().unwrap();
        for url in ["http://a.example.com/", "http://b.example.com/", "http://a.example.com/"] {
            index
                .index_page("test", url, Utc::now(), "<p>Segment spread</p>")
                .unwrap();
        }

        let page = index.search("test", "spread", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 2);
        let mut urls: Vec<_> = page.results.iter().map(|r| r.url.as_str()).collect();
        urls.sort();
        assert_eq!(urls, ["http://a.example.com/", "http://b.example.com/"]);
    }

    #[test]
    fn older_pages_score_lower() {
        let index = HistoryIndex::in_memory().unwrap();
        let now = Utc::now();
        let body = "<p>Identical decay content</p>";
        index
            .index_page("test", "http://example.com/now", now, body)
            .unwrap();
        index
            .index_page("test", "http://example.com/1y", now - Duration::days(365), body)
            .unwrap();
        index
            .index_page("test", "http://example.com/2y", now - Duration::days(730), body)
            .unwrap();

        let page = index.search("test", "decay", 0, 10, false).unwrap();
        let urls: Vec<&str> = page.results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com/now",
                "http://example.com/1y",
                "http://example.com/2y"
            ]
        );

        let current = page.results[0].score;
        let one_year = page.results[1].score / current;
        let two_years = page.results[2].score / current;
        assert!((0.49..=0.51).contains(&one_year), "1y ratio {}", one_year);
        assert!((0.32..=0.34).contains(&two_years), "2y ratio {}", two_years);
    }

    #[test]
    fn identity_transform_ignores_age() {
        let index = HistoryIndex::in_memory()
            .unwrap()
            .with_transform(IdentityTransform);
        let now = Utc::now();
        let body = "<p>Identical content</p>";
        index
            .index_page("test", "http://example.com/a", now, body)
            .unwrap();
        index
            .index_page("test", "http://example.com/b", now - Duration::days(730), body)
            .unwrap();

        let page = index.search("test", "identical", 0, 10, false).unwrap();
        assert_eq!(page.results.len(), 2);
        assert!((page.results[0].score - page.results[1].score).abs() < 1e-6);
    }

    #[test]
    fn no_matches_is_empty() {
        let index = HistoryIndex::in_memory().unwrap();
        index
            .index_page("test", "http://example.com/", Utc::now(), TEST_HTML)
            .unwrap();

        let page = index.search("test", "absent", 0, 10, false).unwrap();
        assert_eq!(page.result_count, 0);
        assert!(page.results.is_empty());
    }

    #[test]
    fn offsets_window_the_groups() {
        let index = HistoryIndex::in_memory().unwrap();
        for i in 0..5 {
            index
                .index_page("test", &format!("http://example.com/{}", i), Utc::now(), TEST_HTML)
                .unwrap();
        }

        let page = index.search("test", "Doc1", 3, 10, false).unwrap();
        assert_eq!(page.result_count, 5);
        assert_eq!(page.results.len(), 2);

        let page = index.search("test", "Doc1", 1, 2, false).unwrap();
        assert_eq!(page.results.len(), 2);

        let page = index.search("test", "Doc1", 7, 10, false).unwrap();
        assert_eq!(page.result_count, 5);
        assert!(page.results.is_empty());
    }

    #[test]
    fn bad_query_syntax_fails() {
        let index = HistoryIndex::in_memory().unwrap();
        let err = index.search("test", "nosuchfield:value", 0, 10, false).unwrap_err();
        assert!(err.is_query_error());
    }

    #[test]
    fn closed_index_rejects_operations() {
        let index = HistoryIndex::in_memory().unwrap();
        index.close().unwrap();
        assert!(index.is_closed());

        assert!(matches!(index.close(), Err(IndexError::Closed)));
        assert!(matches!(
            index.index_page("test", "http://example.com/", Utc::now(), TEST_HTML),
            Err(IndexError::Closed)
        ));
        assert!(matches!(
            index.search("test", "Doc1", 0, 10, false),
            Err(IndexError::Closed)
        ));
    }
}

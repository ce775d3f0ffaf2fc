//! Story records and the collaborators that supply and persist them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::BufRead;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StoryQuery;
use crate::error::PipelineError;

/// A story row joined with the HTML of all of its descendant comments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    /// Primary key.
    pub story_id: i64,
    /// Submitter handle.
    #[serde(default)]
    pub author: Option<String>,
    /// Creation time in unix seconds.
    pub unix_time: i64,
    /// Story score.
    #[serde(default)]
    pub score: i64,
    /// Story title.
    #[serde(default)]
    pub title: String,
    /// Linked URL, absent for text posts.
    #[serde(default)]
    pub url: Option<String>,
    /// Number of descendant comments.
    #[serde(default)]
    pub num_comments: i64,
    /// Concatenated HTML bodies of all descendant comments.
    #[serde(default)]
    pub children: String,
    /// Persisted comma-separated embedding, if one was computed before.
    #[serde(default)]
    pub comment_embedding: Option<String>,
}

impl StoryRecord {
    /// The subset of fields that ends up in the cluster artifact.
    pub fn meta(&self) -> StoryMeta {
        StoryMeta {
            story_id: self.story_id,
            title: self.title.clone(),
            url: self.url.clone(),
            unix_time: self.unix_time,
        }
    }
}

/// Story metadata retained until serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryMeta {
    /// Primary key.
    pub story_id: i64,
    /// Story title.
    pub title: String,
    /// Linked URL.
    pub url: Option<String>,
    /// Creation time in unix seconds.
    pub unix_time: i64,
}

/// One range-bounded fetch: `[begin, end)` on the query's range field plus the
/// inclusive comment and score filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryWindow<'q> {
    /// Inclusive lower bound on the range field.
    pub begin: i64,
    /// Exclusive upper bound on the range field.
    pub end: i64,
    /// Query the window belongs to.
    pub query: &'q StoryQuery,
}

impl StoryWindow<'_> {
    /// Whether `record` falls inside this window and passes the filters.
    pub fn matches(&self, record: &StoryRecord) -> bool {
        let key = match self.query.field {
            crate::config::RangeField::UnixTime => record.unix_time,
            crate::config::RangeField::StoryId => record.story_id,
        };
        (self.begin..self.end).contains(&key)
            && (self.query.min_comments..=self.query.max_comments).contains(&record.num_comments)
            && (self.query.min_score..=self.query.max_score).contains(&record.score)
    }
}

/// Supplies stories, one range-bounded window at a time.
pub trait StorySource {
    /// Returns every story inside `window`, ordered by story id.
    fn fetch(&self, window: &StoryWindow<'_>) -> Result<Vec<StoryRecord>>;
}

/// Persists computed embeddings next to their story.
pub trait EmbeddingStore {
    /// Overwrites the cached embedding of `story_id` with `serialized`.
    fn store_embedding(&self, story_id: i64, serialized: &str) -> Result<()>;
}

/// Walks the query range window by window, yielding each non-empty window as a batch.
///
/// Windows are half-open so a story sitting on a boundary is fetched exactly once; the
/// last window is clamped to include `query.end`. Fetch failures are forwarded as
/// [`PipelineError::Source`] and end the stream.
pub fn story_batches<'a, S>(
    source: &'a S,
    query: &'a StoryQuery,
) -> impl Iterator<Item = Result<Vec<StoryRecord>, PipelineError>> + 'a
where
    S: StorySource + ?Sized,
{
    StoryBatches {
        source,
        query,
        next_begin: Some(query.begin),
        fetched: 0,
        done: false,
    }
}

struct StoryBatches<'a, S: ?Sized> {
    source: &'a S,
    query: &'a StoryQuery,
    next_begin: Option<i64>,
    fetched: usize,
    done: bool,
}

impl<S: StorySource + ?Sized> Iterator for StoryBatches<'_, S> {
    type Item = Result<Vec<StoryRecord>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let limit = self.query.end.saturating_add(1);
        while let Some(begin) = self.next_begin {
            let end = begin.saturating_add(self.query.window).min(limit);
            self.next_begin = (end < limit).then_some(end);
            let window = StoryWindow {
                begin,
                end,
                query: self.query,
            };
            match self.source.fetch(&window) {
                Ok(stories) if stories.is_empty() => continue,
                Ok(stories) => {
                    self.fetched += stories.len();
                    debug!(begin, end, stories = stories.len(), "fetched window");
                    return Some(Ok(stories));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(PipelineError::from_source(err.context(format!(
                        "failed to fetch stories in [{begin}, {end})"
                    )))));
                }
            }
        }
        info!(stories = self.fetched, "story fetch complete");
        self.done = true;
        None
    }
}

/// In-process story table that also records every embedding write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    stories: RefCell<BTreeMap<i64, StoryRecord>>,
    writes: RefCell<Vec<(i64, String)>>,
}

impl MemoryStore {
    /// Builds a store holding `stories`.
    pub fn new(stories: impl IntoIterator<Item = StoryRecord>) -> Self {
        Self {
            stories: RefCell::new(
                stories
                    .into_iter()
                    .map(|story| (story.story_id, story))
                    .collect(),
            ),
            writes: RefCell::new(Vec::new()),
        }
    }

    /// Loads stories from JSON lines, one [`StoryRecord`] per non-empty line.
    pub fn from_jsonl<R: BufRead>(reader: R) -> Result<Self> {
        let mut stories = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let story: StoryRecord = serde_json::from_str(&line)
                .with_context(|| format!("invalid story record at line {}", line_no + 1))?;
            stories.push(story);
        }
        Ok(Self::new(stories))
    }

    /// Current state of a story, including any cached embedding written back.
    pub fn story(&self, story_id: i64) -> Option<StoryRecord> {
        self.stories.borrow().get(&story_id).cloned()
    }

    /// Every `(story_id, serialized)` pair written so far, in write order.
    pub fn writes(&self) -> Vec<(i64, String)> {
        self.writes.borrow().clone()
    }

    /// Number of stories held.
    pub fn len(&self) -> usize {
        self.stories.borrow().len()
    }

    /// Whether the store holds no stories.
    pub fn is_empty(&self) -> bool {
        self.stories.borrow().is_empty()
    }
}

impl StorySource for MemoryStore {
    fn fetch(&self, window: &StoryWindow<'_>) -> Result<Vec<StoryRecord>> {
        Ok(self
            .stories
            .borrow()
            .values()
            .filter(|story| window.matches(story))
            .cloned()
            .collect())
    }
}

impl EmbeddingStore for MemoryStore {
    fn store_embedding(&self, story_id: i64, serialized: &str) -> Result<()> {
        let mut stories = self.stories.borrow_mut();
        let story = stories
            .get_mut(&story_id)
            .with_context(|| format!("story {story_id} is not in the store"))?;
        story.comment_embedding = Some(serialized.to_string());
        self.writes
            .borrow_mut()
            .push((story_id, serialized.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RangeField;
    use pretty_assertions::assert_eq;

    fn story(story_id: i64, unix_time: i64) -> StoryRecord {
        StoryRecord {
            story_id,
            author: Some("pg".to_string()),
            unix_time,
            score: 10,
            title: format!("story {story_id}"),
            url: None,
            num_comments: 5,
            children: "<p>hello.</p>".to_string(),
            comment_embedding: None,
        }
    }

    fn query(begin: i64, end: i64, window: i64) -> StoryQuery {
        StoryQuery {
            begin,
            end,
            window,
            ..StoryQuery::default()
        }
    }

    #[test]
    fn windows_cover_the_range_once() {
        let store = MemoryStore::new((0..10).map(|i| story(i, i * 10)));
        let query = query(0, 90, 25);
        let ids: Vec<Vec<i64>> = story_batches(&store, &query)
            .map(|batch| batch.unwrap().iter().map(|s| s.story_id).collect())
            .collect();
        // [0,25) [25,50) [50,75) [75,91)
        assert_eq!(ids, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn empty_windows_are_skipped() {
        let store = MemoryStore::new([story(1, 5), story(2, 95)]);
        let query = query(0, 100, 10);
        let sizes: Vec<usize> = story_batches(&store, &query)
            .map(|batch| batch.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[test]
    fn filters_apply_to_comments_and_score() {
        let mut quiet = story(1, 5);
        quiet.num_comments = 1;
        let mut popular = story(2, 6);
        popular.score = 9_000;
        let store = MemoryStore::new([quiet, popular, story(3, 7)]);
        let query = query(0, 10, 100);
        let batches: Vec<_> = story_batches(&store, &query).collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].story_id, 3);
    }

    #[test]
    fn id_ranges_select_by_story_id() {
        let store = MemoryStore::new((100..110).map(|i| story(i, 0)));
        let query = StoryQuery {
            field: RangeField::StoryId,
            ..query(103, 105, 1_000)
        };
        let ids: Vec<i64> = story_batches(&store, &query)
            .flat_map(|batch| batch.unwrap())
            .map(|s| s.story_id)
            .collect();
        assert_eq!(ids, vec![103, 104, 105]);
    }

    struct Failing;

    impl StorySource for Failing {
        fn fetch(&self, _window: &StoryWindow<'_>) -> Result<Vec<StoryRecord>> {
            anyhow::bail!("database is locked")
        }
    }

    #[test]
    fn fetch_failures_end_the_stream() {
        let query = query(0, 100, 10);
        let results: Vec<_> = story_batches(&Failing, &query).collect();
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
        assert!(err.to_string().contains("database is locked"));
    }

    #[test]
    fn writes_update_the_cached_field() {
        let store = MemoryStore::new([story(7, 0)]);
        store.store_embedding(7, "0.5,0.25").unwrap();
        assert_eq!(store.story(7).unwrap().comment_embedding.as_deref(), Some("0.5,0.25"));
        assert_eq!(store.writes(), vec![(7, "0.5,0.25".to_string())]);
        assert!(store.store_embedding(8, "1").is_err());
    }

    #[test]
    fn loads_json_lines() {
        let input = concat!(
            r#"{"story_id": 1, "unix_time": 10, "title": "a", "children": "<p>x</p>"}"#,
            "\n\n",
            r#"{"story_id": 2, "unix_time": 20, "url": "https://example.com"}"#,
            "\n"
        );
        let store = MemoryStore::from_jsonl(input.as_bytes()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.story(2).unwrap().url.as_deref(), Some("https://example.com"));
    }
}

//! Postgres-backed story source and embedding cache.
//!
//! Expects a `story` table (`story_id`, `author`, `unix_time`, `score`, `title`,
//! `url`, `descendants`, `comment_embedding`) and a `comment` table (`comment_id`,
//! `parent_id`, `body`) whose `parent_id` points at either a story or a comment.
//! Integer columns may be `INTEGER` or `BIGINT`; queries cast them to `BIGINT`.

use anyhow::{Context, Result};
use tokio::runtime::Runtime;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use crate::config::RangeField;
use crate::source::{EmbeddingStore, StoryRecord, StorySource, StoryWindow};

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Synchronous facade over a tokio-postgres connection.
///
/// The pipeline is single-threaded and pull-based, so each call blocks on a private
/// current-thread runtime that also drives the connection task.
pub struct PgStore {
    runtime: Runtime,
    client: Client,
    stories: TableName,
    comments: TableName,
}

impl PgStore {
    /// Connects to `database_url`.
    pub fn connect(database_url: &str, stories: TableName, comments: TableName) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start Postgres runtime")?;
        let (client, connection) = runtime
            .block_on(tokio_postgres::connect(database_url, NoTls))
            .context("failed to connect to Postgres")?;
        runtime.spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        info!(stories = %stories.qualified(), comments = %comments.qualified(), "connected to Postgres");
        Ok(Self {
            runtime,
            client,
            stories,
            comments,
        })
    }

    /// Adds the `comment_embedding` column if the story table predates it.
    pub fn ensure_embedding_column(&self) -> Result<()> {
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS comment_embedding TEXT",
            self.stories.qualified()
        );
        self.runtime
            .block_on(self.client.execute(&alter, &[]))
            .context("failed to ensure comment_embedding column")?;
        Ok(())
    }
}

impl StorySource for PgStore {
    fn fetch(&self, window: &StoryWindow<'_>) -> Result<Vec<StoryRecord>> {
        let sql = story_window_sql(&self.stories, &self.comments, window.query.field);
        let query = window.query;
        let rows = self
            .runtime
            .block_on(self.client.query(
                &sql,
                &[
                    &window.begin,
                    &window.end,
                    &query.min_comments,
                    &query.max_comments,
                    &query.min_score,
                    &query.max_score,
                ],
            ))
            .with_context(|| {
                format!(
                    "failed to query stories with {} in [{}, {})",
                    query.field.column(),
                    window.begin,
                    window.end
                )
            })?;
        debug!(rows = rows.len(), "story window fetched");
        rows.iter().map(story_from_row).collect()
    }
}

impl EmbeddingStore for PgStore {
    fn store_embedding(&self, story_id: i64, serialized: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET comment_embedding = $1 WHERE story_id = $2::BIGINT",
            self.stories.qualified()
        );
        self.runtime
            .block_on(self.client.execute(&sql, &[&serialized, &story_id]))
            .with_context(|| format!("failed to cache embedding for story {story_id}"))?;
        Ok(())
    }
}

fn story_from_row(row: &Row) -> Result<StoryRecord> {
    let story_id: i64 = row.try_get("story_id")?;
    let read = || -> Result<StoryRecord, tokio_postgres::Error> {
        Ok(StoryRecord {
            story_id,
            author: row.try_get("author")?,
            unix_time: row.try_get("unix_time")?,
            score: row.try_get("score")?,
            title: row.try_get::<_, Option<String>>("title")?.unwrap_or_default(),
            url: row.try_get("url")?,
            num_comments: row.try_get("descendants")?,
            children: row.try_get::<_, Option<String>>("children")?.unwrap_or_default(),
            comment_embedding: row.try_get("comment_embedding")?,
        })
    };
    read().with_context(|| format!("malformed row for story {story_id}"))
}

/// Stories in `[$1, $2)` on `field` with `$3..=$4` comments and `$5..=$6` score,
/// each joined with the HTML of every descendant comment.
fn story_window_sql(stories: &TableName, comments: &TableName, field: RangeField) -> String {
    let stories = stories.qualified();
    let comments = comments.qualified();
    let column = quote_ident(field.column());
    format!(
        "WITH RECURSIVE selected AS (
            SELECT s.story_id::BIGINT AS story_id, s.author,
                   s.unix_time::BIGINT AS unix_time, s.score::BIGINT AS score,
                   s.title, s.url, s.descendants::BIGINT AS descendants,
                   s.comment_embedding
            FROM {stories} AS s
            WHERE s.{column} >= $1::BIGINT AND s.{column} < $2::BIGINT
              AND s.descendants BETWEEN $3::BIGINT AND $4::BIGINT
              AND s.score BETWEEN $5::BIGINT AND $6::BIGINT
        ),
        tree(id, root_id, body) AS (
            SELECT story_id, story_id, NULL::TEXT FROM selected
            UNION ALL
            SELECT c.comment_id::BIGINT, tree.root_id, c.body::TEXT
            FROM {comments} AS c
            JOIN tree ON c.parent_id = tree.id
        )
        SELECT sel.*,
               COALESCE(
                   (SELECT string_agg(tree.body, '<br><br>' ORDER BY tree.id)
                    FROM tree
                    WHERE tree.root_id = sel.story_id AND tree.body IS NOT NULL),
                   ' '
               ) AS children
        FROM selected AS sel
        ORDER BY sel.story_id"
    )
}

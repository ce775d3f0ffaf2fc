//! Embedding generation with a persistent per-story cache.
//!
//! A story's comment embedding is expensive (one encoder call per sentence), so the
//! vector produced by the canonical model is written back to the story row and reused
//! on later runs. Vectors from any other model are computed on every run and never
//! persisted, which keeps the cached column unambiguous about its model.

use std::cell::{Cell, RefCell};

use ndarray::Array2;
use tracing::{debug, warn};

use crate::encoder::SentenceEncoder;
use crate::error::PipelineError;
use crate::source::{EmbeddingStore, StoryRecord};
use crate::text::html_to_sentences;
use crate::PipelineWarning;

/// Cache counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Stories whose cached vector was reused.
    pub hits: usize,
    /// Stories whose vector had to be computed.
    pub misses: usize,
    /// Vectors written back to the store.
    pub writes: usize,
    /// Stories whose comments produced no sentences.
    pub empty_texts: usize,
}

/// Maps stories to comment embeddings, reusing persisted vectors when valid.
pub struct EmbeddingCache<'a, E: ?Sized, S: ?Sized> {
    encoder: &'a E,
    store: &'a S,
    persist: bool,
    stats: Cell<CacheStats>,
    warnings: RefCell<Vec<PipelineWarning>>,
}

impl<'a, E, S> EmbeddingCache<'a, E, S>
where
    E: SentenceEncoder + ?Sized,
    S: EmbeddingStore + ?Sized,
{
    /// Builds a cache. `persist` marks the encoder as the canonical model: only then
    /// are cached vectors trusted and new vectors written back.
    pub fn new(encoder: &'a E, store: &'a S, persist: bool) -> Self {
        Self {
            encoder,
            store,
            persist,
            stats: Cell::new(CacheStats::default()),
            warnings: RefCell::new(Vec::new()),
        }
    }

    /// Vector length produced for every story.
    pub fn dimensions(&self) -> usize {
        self.encoder.dimensions()
    }

    /// Counters so far.
    pub fn stats(&self) -> CacheStats {
        self.stats.get()
    }

    /// Drains the warnings recorded so far.
    pub fn take_warnings(&self) -> Vec<PipelineWarning> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }

    /// Embeds one batch, returning one row per story in input order.
    pub fn embed_batch(&self, stories: &[StoryRecord]) -> Result<Array2<f64>, PipelineError> {
        let dims = self.dimensions();
        let mut out = Array2::zeros((stories.len(), dims));
        for (row, story) in out.rows_mut().into_iter().zip(stories) {
            let vector = self.embed_story(story)?;
            for (dst, src) in row.into_iter().zip(vector) {
                *dst = f64::from(src);
            }
        }
        Ok(out)
    }

    /// Embeds a single story, consulting and refreshing the cache.
    pub fn embed_story(&self, story: &StoryRecord) -> Result<Vec<f32>, PipelineError> {
        let mut stats = self.stats.get();
        if self.persist {
            if let Some(cached) = story.comment_embedding.as_deref() {
                match decode_embedding(cached, self.dimensions()) {
                    Some(vector) => {
                        stats.hits += 1;
                        self.stats.set(stats);
                        return Ok(vector);
                    }
                    None => {
                        warn!(story_id = story.story_id, "discarding malformed cached embedding");
                        self.warnings
                            .borrow_mut()
                            .push(PipelineWarning::MalformedCache {
                                story_id: story.story_id,
                            });
                    }
                }
            }
        }

        stats.misses += 1;
        let sentences = html_to_sentences(&story.children);
        let vector = if sentences.is_empty() {
            warn!(story_id = story.story_id, "no comment sentences; using a zero vector");
            stats.empty_texts += 1;
            self.warnings
                .borrow_mut()
                .push(PipelineWarning::EmptyCommentText {
                    story_id: story.story_id,
                });
            vec![0.0; self.dimensions()]
        } else {
            let refs: Vec<&str> = sentences.iter().map(String::as_str).collect();
            let encoded = self
                .encoder
                .encode(&refs)
                .map_err(|err| {
                    PipelineError::from_encoder(
                        err.context(format!("failed to encode story {}", story.story_id)),
                    )
                })?;
            if encoded.len() != refs.len() {
                return Err(PipelineError::from_encoder(anyhow::anyhow!(
                    "encoder returned {} vectors for {} sentences of story {}",
                    encoded.len(),
                    refs.len(),
                    story.story_id
                )));
            }
            mean_vector(&encoded, self.dimensions())?
        };

        if self.persist {
            self.store
                .store_embedding(story.story_id, &encode_embedding(&vector))
                .map_err(PipelineError::from_store)?;
            stats.writes += 1;
            debug!(story_id = story.story_id, "cached comment embedding");
        }
        self.stats.set(stats);
        Ok(vector)
    }
}

/// Serializes a vector as comma-separated floats.
pub fn encode_embedding(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 12);
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out
}

/// Parses a cached vector, rejecting anything that is not exactly `dims` finite floats.
pub fn decode_embedding(serialized: &str, dims: usize) -> Option<Vec<f32>> {
    let vector = serialized
        .split(',')
        .map(|value| value.trim().parse::<f32>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f32>>>()?;
    (vector.len() == dims).then_some(vector)
}

fn mean_vector(vectors: &[Vec<f32>], dims: usize) -> Result<Vec<f32>, PipelineError> {
    let mut sum = vec![0.0f64; dims];
    for vector in vectors {
        if vector.len() != dims {
            return Err(PipelineError::DimensionMismatch {
                expected: dims,
                found: vector.len(),
            });
        }
        for (acc, value) in sum.iter_mut().zip(vector) {
            *acc += f64::from(*value);
        }
    }
    let n = vectors.len().max(1) as f64;
    Ok(sum.into_iter().map(|total| (total / n) as f32).collect())
}

#![warn(missing_docs)]
//! Streaming batched clustering of discussion-forum stories by the semantics of
//! their comments.
//!
//! A run pulls stories window by window from a [`StorySource`], regroups them into
//! minimum-size batches, embeds each story's comments (reusing cached vectors),
//! standardizes and PCA-reduces the vectors, clusters them with mini-batch k-means
//! and writes a tab-separated artifact. No stage materializes the whole corpus.

pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod kmeans;
mod linalg;
pub mod pipeline;
pub mod rebatch;
pub mod serialize;
pub mod source;
pub mod stats;
pub mod store;
pub mod stream;
pub mod text;

pub use cache::{CacheStats, EmbeddingCache};
pub use config::{
    ClusterArgs, ClusterConfig, ClusterSettings, ModelSpec, RangeField, StoryQuery,
    CANONICAL_MODEL,
};
pub use encoder::{openai::OpenAiEncoder, SentenceEncoder};
pub use error::PipelineError;
pub use kmeans::StreamingKMeans;
pub use pipeline::{ClusterPipeline, OutputPaths, PipelineWarning, RunReport, Stage};
pub use rebatch::rebatch;
pub use serialize::{Projection, ResultSerializer};
pub use source::{EmbeddingStore, MemoryStore, StoryMeta, StoryRecord, StorySource, StoryWindow};
pub use stats::{reduce, Standardizer, StreamingPca};
pub use store::{PgStore, TableName};
pub use stream::{tee, BatchStream, LabelBatch, MetaBatch, Tee, VectorBatch};

//! End-to-end clustering run: fetch, rebatch, embed, standardize, reduce, cluster,
//! serialize.
//!
//! Every stage is a lazy iterator over batches and nothing runs concurrently. The
//! downstream stage pulls one batch at a time, and streams that are needed twice go
//! through [`tee`], which only buffers the gap between its readers.

use std::cell::Cell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use ndarray::Array2;
use tracing::{info, warn};

use crate::cache::{CacheStats, EmbeddingCache};
use crate::config::ClusterConfig;
use crate::encoder::SentenceEncoder;
use crate::error::PipelineError;
use crate::kmeans::StreamingKMeans;
use crate::rebatch::rebatch;
use crate::serialize::{ClusteringStreams, Projection, ResultSerializer};
use crate::source::{story_batches, EmbeddingStore, StorySource};
use crate::stats::{reduce, Standardizer};
use crate::stream::{tee, BatchStream, MetaBatch, VectorBatch};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Range-bounded story fetches.
    Fetch,
    /// Regrouping into minimum-size batches.
    Rebatch,
    /// Comment embeddings, through the cache.
    Embed,
    /// Per-dimension scaling.
    Standardize,
    /// PCA.
    Reduce,
    /// Mini-batch k-means.
    Cluster,
    /// Artifact output.
    Serialize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "fetch",
            Self::Rebatch => "rebatch",
            Self::Embed => "embed",
            Self::Standardize => "standardize",
            Self::Reduce => "reduce",
            Self::Cluster => "cluster",
            Self::Serialize => "serialize",
        };
        f.write_str(name)
    }
}

/// Non-fatal conditions recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineWarning {
    /// The query matched no stories; nothing was written.
    EmptyRun,
    /// Fewer stories than PCA dimensions, so embeddings were clustered unreduced.
    ReductionSkipped {
        /// Stories in the run.
        stories: usize,
        /// Requested PCA dimensionality.
        n_dims: usize,
    },
    /// A story's comments produced no sentences; it was embedded as a zero vector.
    EmptyCommentText {
        /// Affected story.
        story_id: i64,
    },
    /// A cached embedding could not be decoded and was recomputed.
    MalformedCache {
        /// Affected story.
        story_id: i64,
    },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRun => write!(f, "no stories matched the query"),
            Self::ReductionSkipped { stories, n_dims } => write!(
                f,
                "{stories} stories is fewer than {n_dims} PCA dimensions; reduction skipped"
            ),
            Self::EmptyCommentText { story_id } => {
                write!(f, "story {story_id} has no comment text")
            }
            Self::MalformedCache { story_id } => {
                write!(f, "story {story_id} had a malformed cached embedding")
            }
        }
    }
}

/// Where a run writes its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    /// Tab-separated cluster assignments.
    pub clusters: PathBuf,
    /// Explained-variance ratios, one per line.
    pub variance: PathBuf,
}

/// Summary of a completed run, owned by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Stories processed.
    pub stories: usize,
    /// Batches after rebatching.
    pub batches: usize,
    /// Width of the embedding column in the artifact.
    pub output_dims: usize,
    /// Whether the PCA stage ran.
    pub reduced: bool,
    /// How the artifact's embedding column was produced.
    pub projection: Option<Projection>,
    /// Whether the explained-variance file was written.
    pub variance_written: bool,
    /// Stories per cluster.
    pub cluster_sizes: Vec<usize>,
    /// Embedding cache counters.
    pub cache: CacheStats,
    /// Non-fatal conditions, in the order they occurred.
    pub warnings: Vec<PipelineWarning>,
    /// Fitted centroids, one per row.
    pub centroids: Option<Array2<f64>>,
}

/// Runs the clustering pipeline against borrowed collaborators.
pub struct ClusterPipeline<'a, S: ?Sized, E: ?Sized, W: ?Sized> {
    config: &'a ClusterConfig,
    source: &'a S,
    encoder: &'a E,
    store: &'a W,
}

impl<'a, S, E, W> ClusterPipeline<'a, S, E, W>
where
    S: StorySource + ?Sized,
    E: SentenceEncoder + ?Sized,
    W: EmbeddingStore + ?Sized,
{
    /// Wires a pipeline. `store` receives cache writes and is usually the same
    /// object as `source`.
    pub fn new(config: &'a ClusterConfig, source: &'a S, encoder: &'a E, store: &'a W) -> Self {
        Self {
            config,
            source,
            encoder,
            store,
        }
    }

    /// Executes one full run and writes the artifacts under `paths`.
    pub fn run(&self, paths: &OutputPaths) -> Result<RunReport, PipelineError> {
        let config = self.config;
        if self.encoder.model_name() != config.model_name() {
            return Err(PipelineError::InvalidConfig(format!(
                "encoder serves {} but the run is configured for {}",
                self.encoder.model_name(),
                config.model_name()
            )));
        }
        let mut report = RunReport::default();
        let cache = EmbeddingCache::new(self.encoder, self.store, config.uses_canonical_model());
        let batches_seen = Cell::new(0usize);

        info!(stage = %Stage::Fetch, range_begin = config.query().begin, range_end = config.query().end, "starting run");
        let fetched = story_batches(self.source, config.query());

        info!(stage = %Stage::Rebatch, min_batch_size = config.min_batch_size(), "stage ready");
        let rebatched = rebatch(fetched, config.min_batch_size());

        info!(stage = %Stage::Embed, model = config.model_name(), "stage ready");
        let cache_ref = &cache;
        let counter = &batches_seen;
        let embedded = rebatched.map(move |batch| -> Result<(MetaBatch, VectorBatch), PipelineError> {
            let batch = batch?;
            counter.set(counter.get() + 1);
            let vectors = cache_ref.embed_batch(&batch)?;
            let meta: MetaBatch = Rc::new(batch.iter().map(|story| story.meta()).collect());
            Ok((meta, Rc::new(vectors)))
        });
        let [meta_branch, vector_branch] = tee(embedded);
        let stories: BatchStream<'_, MetaBatch> =
            Box::new(meta_branch.map(|item| item.map(|(meta, _)| meta)));
        let vectors: BatchStream<'_, VectorBatch> =
            Box::new(vector_branch.map(|item| item.map(|(_, vectors)| vectors)));

        info!(stage = %Stage::Standardize, "fitting");
        let mut scaler = Standardizer::new();
        let standardized = scaler.fit_transform(vectors)?;
        let total = scaler.count();
        report.stories = total;
        report.batches = batches_seen.get();
        report.cache = cache.stats();
        report.warnings.extend(cache.take_warnings());
        if total == 0 {
            warn!("no stories matched the query; nothing written");
            report.warnings.push(PipelineWarning::EmptyRun);
            return Ok(report);
        }

        info!(stage = %Stage::Reduce, stories = total, n_dims = config.n_pca_dims(), "fitting");
        let reduction = reduce(standardized, total, config.n_pca_dims())?;
        report.reduced = reduction.model.is_some();
        if !report.reduced {
            report.warnings.push(PipelineWarning::ReductionSkipped {
                stories: total,
                n_dims: config.n_pca_dims(),
            });
        }

        info!(stage = %Stage::Cluster, clusters = config.n_clusters(), "fitting");
        let [fit_pass, predict_pass, embeddings] = tee(reduction.batches);
        let mut kmeans = StreamingKMeans::new(config.n_clusters(), config.seed());
        kmeans.fit(Box::new(fit_pass))?;
        let labels = kmeans.predict(Box::new(predict_pass))?;

        info!(stage = %Stage::Serialize, path = %paths.clusters.display(), "writing");
        let serializer = ResultSerializer::new(reduction.model.as_ref(), config.n_pca_dims());
        let summary = serializer.serialize_clustering_result(
            &paths.clusters,
            ClusteringStreams {
                stories,
                embeddings: Box::new(embeddings),
                labels,
            },
            kmeans.centroids(),
            total,
        )?;
        report.variance_written = serializer.serialize_pca_explained_variance(&paths.variance)?;

        report.output_dims = summary.dims;
        report.projection = Some(summary.projection);
        report.cluster_sizes = summary.cluster_sizes;
        report.centroids = kmeans.centroids().cloned();
        info!(
            stories = report.stories,
            batches = report.batches,
            dims = report.output_dims,
            warnings = report.warnings.len(),
            "run complete"
        );
        Ok(report)
    }
}

//! Immutable run configuration and the command-line surface that builds it.

use clap::{Args, ValueEnum};

use crate::error::PipelineError;

/// Embedding model whose vectors are persisted as the comment-embedding cache.
pub const CANONICAL_MODEL: &str = "sentence-transformers/all-distilroberta-v1";
/// Default number of clusters.
pub const DEFAULT_CLUSTERS: usize = 10;
/// Default target dimensionality of the reduction step.
pub const DEFAULT_PCA_DIMS: usize = 100;
/// Default minimum number of stories per rebatched batch.
pub const DEFAULT_MIN_BATCH: usize = 100;
/// Default width of a single range-bounded fetch window.
pub const DEFAULT_WINDOW: i64 = 100_000;
/// Smallest accepted cluster count.
pub const MIN_CLUSTERS: usize = 2;
/// Largest accepted cluster count.
pub const MAX_CLUSTERS: usize = 50;

/// Column the story range bounds apply to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum RangeField {
    /// Story creation time in unix seconds.
    UnixTime,
    /// Story identifier.
    StoryId,
}

impl RangeField {
    /// Column name in the story table.
    pub fn column(self) -> &'static str {
        match self {
            Self::UnixTime => "unix_time",
            Self::StoryId => "story_id",
        }
    }
}

/// Bounds selecting which stories enter a run. All bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoryQuery {
    /// Column the `begin`/`end` range applies to.
    pub field: RangeField,
    /// First value of the range.
    pub begin: i64,
    /// Last value of the range.
    pub end: i64,
    /// Minimum comment count.
    pub min_comments: i64,
    /// Maximum comment count.
    pub max_comments: i64,
    /// Minimum score.
    pub min_score: i64,
    /// Maximum score.
    pub max_score: i64,
    /// Width of each range-bounded fetch.
    pub window: i64,
}

impl Default for StoryQuery {
    fn default() -> Self {
        Self {
            field: RangeField::UnixTime,
            begin: 0,
            end: 0,
            min_comments: 3,
            max_comments: 500,
            min_score: 0,
            max_score: 500,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Every tunable knob of a run, before validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Number of clusters to fit.
    pub n_clusters: usize,
    /// Sentence-encoder model identifier.
    pub model_name: String,
    /// Target dimensionality of the reduction step.
    pub n_pca_dims: usize,
    /// Minimum stories per batch after rebatching.
    pub min_batch_size: usize,
    /// Seed for centroid initialization.
    pub seed: u64,
    /// Story selection.
    pub query: StoryQuery,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            n_clusters: DEFAULT_CLUSTERS,
            model_name: CANONICAL_MODEL.to_string(),
            n_pca_dims: DEFAULT_PCA_DIMS,
            min_batch_size: DEFAULT_MIN_BATCH,
            seed: 0,
            query: StoryQuery::default(),
        }
    }
}

/// Validated, read-only configuration handed to the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    settings: ClusterSettings,
}

impl ClusterConfig {
    /// Number of clusters, within `[MIN_CLUSTERS, MAX_CLUSTERS]`.
    pub fn n_clusters(&self) -> usize {
        self.settings.n_clusters
    }

    /// Sentence-encoder model identifier.
    pub fn model_name(&self) -> &str {
        &self.settings.model_name
    }

    /// Whether vectors from the configured model may be read from and written to the cache.
    pub fn uses_canonical_model(&self) -> bool {
        self.settings.model_name == CANONICAL_MODEL
    }

    /// Target dimensionality of the reduction step.
    pub fn n_pca_dims(&self) -> usize {
        self.settings.n_pca_dims
    }

    /// Minimum stories per rebatched batch.
    pub fn min_batch_size(&self) -> usize {
        self.settings.min_batch_size
    }

    /// Seed for centroid initialization.
    pub fn seed(&self) -> u64 {
        self.settings.seed
    }

    /// Story selection bounds.
    pub fn query(&self) -> &StoryQuery {
        &self.settings.query
    }
}

impl TryFrom<ClusterSettings> for ClusterConfig {
    type Error = PipelineError;

    fn try_from(settings: ClusterSettings) -> Result<Self, Self::Error> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));
        if !(MIN_CLUSTERS..=MAX_CLUSTERS).contains(&settings.n_clusters) {
            return invalid(format!(
                "n_clusters must lie in [{MIN_CLUSTERS}, {MAX_CLUSTERS}], got {}",
                settings.n_clusters
            ));
        }
        if settings.model_name.trim().is_empty() {
            return invalid("model name is required".to_string());
        }
        if settings.n_pca_dims == 0 {
            return invalid("n_pca_dims must be positive".to_string());
        }
        if settings.min_batch_size == 0 {
            return invalid("min_batch_size must be positive".to_string());
        }
        let query = &settings.query;
        if query.window <= 0 {
            return invalid(format!("fetch window must be positive, got {}", query.window));
        }
        if query.begin > query.end {
            return invalid(format!(
                "range begin {} is after range end {}",
                query.begin, query.end
            ));
        }
        if query.min_comments > query.max_comments {
            return invalid(format!(
                "comment bounds are inverted ({} > {})",
                query.min_comments, query.max_comments
            ));
        }
        if query.min_score > query.max_score {
            return invalid(format!(
                "score bounds are inverted ({} > {})",
                query.min_score, query.max_score
            ));
        }
        Ok(Self { settings })
    }
}

/// Output dimensionality of sentence-encoder models the cache knows about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    name: String,
    dimensions: usize,
}

impl ModelSpec {
    /// Resolves the dimensionality of `name`, using `dimensions` for models not listed here.
    pub fn resolve(name: &str, dimensions: Option<usize>) -> Result<Self, PipelineError> {
        let known = match name {
            CANONICAL_MODEL => Some(768),
            "sentence-transformers/all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L12-v2" => {
                Some(384)
            }
            "bert-base-nli-mean-tokens" => Some(768),
            _ => None,
        };
        let dimensions = dimensions.or(known).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "unknown embedding dimensionality for model {name}; pass it explicitly"
            ))
        })?;
        if dimensions == 0 {
            return Err(PipelineError::InvalidConfig(
                "embedding dimensionality must be positive".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            dimensions,
        })
    }

    /// Model identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of every vector the model produces.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Command-line arguments that map onto [`ClusterSettings`].
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Number of clusters (2-50)
    #[arg(long, env = "STORYCLUST_CLUSTERS", default_value_t = DEFAULT_CLUSTERS)]
    pub n_clusters: usize,

    /// Sentence-encoder model identifier
    #[arg(long, env = "STORYCLUST_MODEL", default_value = CANONICAL_MODEL)]
    pub model: String,

    /// Target dimensionality of the PCA step
    #[arg(long, env = "STORYCLUST_PCA_DIMS", default_value_t = DEFAULT_PCA_DIMS)]
    pub n_pca_dims: usize,

    /// Minimum stories per batch
    #[arg(long, env = "STORYCLUST_MIN_BATCH", default_value_t = DEFAULT_MIN_BATCH)]
    pub min_batch_size: usize,

    /// Seed for centroid initialization
    #[arg(long, env = "STORYCLUST_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Column the begin/end bounds apply to
    #[arg(long, env = "STORYCLUST_RANGE_FIELD", value_enum, default_value = "unix-time")]
    pub range_field: RangeField,

    /// First value of the story range (inclusive)
    #[arg(long, env = "STORYCLUST_BEGIN")]
    pub begin: i64,

    /// Last value of the story range (inclusive)
    #[arg(long, env = "STORYCLUST_END")]
    pub end: i64,

    /// Minimum comment count
    #[arg(long, default_value_t = 3)]
    pub min_comments: i64,

    /// Maximum comment count
    #[arg(long, default_value_t = 500)]
    pub max_comments: i64,

    /// Minimum story score
    #[arg(long, default_value_t = 0)]
    pub min_score: i64,

    /// Maximum story score
    #[arg(long, default_value_t = 500)]
    pub max_score: i64,

    /// Width of each range-bounded fetch
    #[arg(long, env = "STORYCLUST_WINDOW", default_value_t = DEFAULT_WINDOW)]
    pub window: i64,
}

impl ClusterArgs {
    /// Converts the parsed arguments into unvalidated settings.
    pub fn settings(&self) -> ClusterSettings {
        ClusterSettings {
            n_clusters: self.n_clusters,
            model_name: self.model.trim().to_string(),
            n_pca_dims: self.n_pca_dims,
            min_batch_size: self.min_batch_size,
            seed: self.seed,
            query: StoryQuery {
                field: self.range_field,
                begin: self.begin,
                end: self.end,
                min_comments: self.min_comments,
                max_comments: self.max_comments,
                min_score: self.min_score,
                max_score: self.max_score,
                window: self.window,
            },
        }
    }

    /// Validates the arguments into a [`ClusterConfig`].
    pub fn build_config(&self) -> Result<ClusterConfig, PipelineError> {
        ClusterConfig::try_from(self.settings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            query: StoryQuery {
                begin: 1_600_000_000,
                end: 1_600_500_000,
                ..StoryQuery::default()
            },
            ..ClusterSettings::default()
        }
    }

    #[test]
    fn defaults_validate() {
        let config = ClusterConfig::try_from(settings()).expect("valid");
        assert_eq!(config.n_clusters(), 10);
        assert_eq!(config.n_pca_dims(), 100);
        assert_eq!(config.min_batch_size(), 100);
        assert!(config.uses_canonical_model());
        assert_eq!(config.query().window, DEFAULT_WINDOW);
    }

    #[test]
    fn rejects_cluster_counts_outside_range() {
        for n_clusters in [0, 1, 51] {
            let err = ClusterConfig::try_from(ClusterSettings {
                n_clusters,
                ..settings()
            })
            .unwrap_err();
            assert!(matches!(err, PipelineError::InvalidConfig(_)), "{n_clusters}");
        }
        for n_clusters in [2, 50] {
            assert!(ClusterConfig::try_from(ClusterSettings {
                n_clusters,
                ..settings()
            })
            .is_ok());
        }
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut bad = settings();
        bad.query.begin = bad.query.end + 1;
        assert!(ClusterConfig::try_from(bad).is_err());

        let mut bad = settings();
        bad.query.min_score = 10;
        bad.query.max_score = 5;
        assert!(ClusterConfig::try_from(bad).is_err());

        let mut bad = settings();
        bad.query.window = 0;
        assert!(ClusterConfig::try_from(bad).is_err());
    }

    #[test]
    fn model_dimensions_resolve() {
        assert_eq!(ModelSpec::resolve(CANONICAL_MODEL, None).unwrap().dimensions(), 768);
        assert_eq!(
            ModelSpec::resolve("sentence-transformers/all-MiniLM-L6-v2", None)
                .unwrap()
                .dimensions(),
            384
        );
        assert!(ModelSpec::resolve("custom/model", None).is_err());
        assert_eq!(ModelSpec::resolve("custom/model", Some(64)).unwrap().dimensions(), 64);
    }

    #[test]
    fn non_canonical_model_disables_cache() {
        let config = ClusterConfig::try_from(ClusterSettings {
            model_name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            ..settings()
        })
        .unwrap();
        assert!(!config.uses_canonical_model());
    }
}

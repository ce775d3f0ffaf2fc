use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use storyclust::{
    ClusterArgs, ClusterPipeline, ModelSpec, OpenAiEncoder, OutputPaths, PgStore, TableName,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "storyclust-cluster",
    about = "Cluster stories in a time or id range by the semantics of their comments"
)]
struct ClusterCli {
    #[command(flatten)]
    run: ClusterArgs,

    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the story and comment tables
    #[arg(long, env = "STORYCLUST_SCHEMA", default_value = "public")]
    schema: String,

    /// Story table name inside the schema
    #[arg(long, env = "STORYCLUST_STORY_TABLE", default_value = "story")]
    story_table: String,

    /// Comment table name inside the schema
    #[arg(long, env = "STORYCLUST_COMMENT_TABLE", default_value = "comment")]
    comment_table: String,

    /// Add the comment_embedding column if it is missing
    #[arg(long, env = "STORYCLUST_PREPARE", default_value_t = false)]
    prepare: bool,

    /// Base URL of the OpenAI-compatible embeddings API
    #[arg(
        long,
        env = "STORYCLUST_ENCODER_BASE",
        default_value = "http://localhost:8080/v1"
    )]
    encoder_base_url: String,

    /// API key for the embeddings API, if it requires one
    #[arg(long, env = "STORYCLUST_ENCODER_API_KEY")]
    encoder_api_key: Option<String>,

    /// Vector length of the model; required for models without a known size
    #[arg(long, env = "STORYCLUST_ENCODER_DIMENSIONS")]
    encoder_dimensions: Option<usize>,

    /// Max sentences per embedding request
    #[arg(long, env = "STORYCLUST_ENCODER_BATCH", default_value_t = 64)]
    encoder_batch_size: usize,

    /// Max seconds to wait for each embedding request
    #[arg(long, env = "STORYCLUST_ENCODER_TIMEOUT_SECS", default_value_t = 30)]
    encoder_timeout_secs: u64,

    /// Number of attempts for rate limits or transient errors
    #[arg(long, env = "STORYCLUST_ENCODER_MAX_RETRIES", default_value_t = 5)]
    encoder_max_retries: usize,

    /// Destination of the tab-separated cluster assignments
    #[arg(long, env = "STORYCLUST_OUTPUT", default_value = "clusters.tsv")]
    output: PathBuf,

    /// Destination of the PCA explained-variance ratios
    #[arg(long, env = "STORYCLUST_VARIANCE_OUTPUT", default_value = "pca_variance.txt")]
    variance_output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = ClusterCli::parse();
    let config = cli.run.build_config()?;
    let model = ModelSpec::resolve(config.model_name(), cli.encoder_dimensions)?;
    let encoder = OpenAiEncoder::new(
        cli.encoder_api_key.clone(),
        cli.encoder_base_url.clone(),
        model,
        Duration::from_secs(cli.encoder_timeout_secs.max(1)),
        cli.encoder_max_retries,
        cli.encoder_batch_size,
    )?;

    let store = PgStore::connect(
        &cli.database_url,
        TableName::new(cli.schema.clone(), cli.story_table.clone())?,
        TableName::new(cli.schema.clone(), cli.comment_table.clone())?,
    )
    .with_context(|| format!("failed to open story database at {}", cli.database_url))?;
    if cli.prepare {
        store.ensure_embedding_column()?;
    }

    let paths = OutputPaths {
        clusters: cli.output.clone(),
        variance: cli.variance_output.clone(),
    };
    let report = ClusterPipeline::new(&config, &store, &encoder, &store).run(&paths)?;

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if report.stories == 0 {
        println!("No stories matched; nothing written.");
        return Ok(());
    }
    println!(
        "Clustered {} stor{} in {} batch{} into {} clusters ({}-d output{}); cache: {} hit{}, {} computed.",
        report.stories,
        if report.stories == 1 { "y" } else { "ies" },
        report.batches,
        if report.batches == 1 { "" } else { "es" },
        config.n_clusters(),
        report.output_dims,
        if report.reduced { ", PCA" } else { "" },
        report.cache.hits,
        if report.cache.hits == 1 { "" } else { "s" },
        report.cache.misses,
    );
    println!("Wrote {}", paths.clusters.display());
    if report.variance_written {
        println!("Wrote {}", paths.variance.display());
    }
    Ok(())
}

//! Writes clustering results and PCA diagnostics to disk.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::{Array2, ArrayView1};
use tracing::info;

use crate::error::PipelineError;
use crate::stats::StreamingPca;
use crate::stream::{tee, BatchStream, LabelBatch, MetaBatch, VectorBatch};

/// Header row of the cluster artifact.
pub const HEADER: &str = "id\ttitle\turl\tunix_time\tlabel\tembedding";

/// Upper bound on the dimensionality of fallback projections.
pub const FALLBACK_DIMS: usize = 2;

/// How the embedding column of the artifact was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Vectors were already reduced by the main PCA model.
    Reduced,
    /// Vectors were narrow enough to write as-is.
    Unprojected,
    /// Vectors were projected by a PCA fitted on the cluster centroids.
    Centroids {
        /// Output dimensionality.
        dims: usize,
    },
    /// Vectors were projected by a PCA fitted over the embeddings themselves.
    Embeddings {
        /// Output dimensionality.
        dims: usize,
    },
}

/// The three aligned streams that make up a clustering result.
pub struct ClusteringStreams<'a> {
    /// Story metadata.
    pub stories: BatchStream<'a, MetaBatch>,
    /// Final embeddings, reduced or not.
    pub embeddings: BatchStream<'a, VectorBatch>,
    /// Cluster labels.
    pub labels: BatchStream<'a, LabelBatch>,
}

/// What [`ResultSerializer::serialize_clustering_result`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializeSummary {
    /// Data rows written, excluding the header.
    pub rows: usize,
    /// Width of the embedding column.
    pub dims: usize,
    /// How the embedding column was produced.
    pub projection: Projection,
    /// Rows per cluster label.
    pub cluster_sizes: Vec<usize>,
}

/// Writes pipeline artifacts.
pub struct ResultSerializer<'m> {
    reduction: Option<&'m StreamingPca>,
    n_pca_dims: usize,
}

impl<'m> ResultSerializer<'m> {
    /// `reduction` is the main PCA model, if the reduce stage produced one.
    pub fn new(reduction: Option<&'m StreamingPca>, n_pca_dims: usize) -> Self {
        Self {
            reduction,
            n_pca_dims,
        }
    }

    /// Writes one tab-separated row per story to `path`, replacing any previous file.
    ///
    /// Without a main reduction model the embeddings are projected to at most
    /// [`FALLBACK_DIMS`] dimensions so the artifact stays plottable.
    pub fn serialize_clustering_result(
        &self,
        path: &Path,
        streams: ClusteringStreams<'_>,
        centroids: Option<&Array2<f64>>,
        total_stories: usize,
    ) -> Result<SerializeSummary, PipelineError> {
        let centroids = centroids.ok_or_else(|| PipelineError::not_fitted("serializer", "clustering"))?;
        let ClusteringStreams {
            mut stories,
            embeddings,
            mut labels,
        } = streams;

        let (mut embeddings, model, projection) = if self.reduction.is_some() {
            (embeddings, None, Projection::Reduced)
        } else {
            let dims = FALLBACK_DIMS
                .min(total_stories)
                .min(self.n_pca_dims)
                .max(1);
            if centroids.ncols() <= dims {
                (embeddings, None, Projection::Unprojected)
            } else if centroids.nrows() >= dims {
                let mut pca = StreamingPca::new(dims);
                pca.fit_matrix(centroids.view())?;
                (embeddings, Some(pca), Projection::Centroids { dims })
            } else {
                let [fit_pass, output] = tee(embeddings);
                let mut pca = StreamingPca::new(dims);
                for batch in fit_pass {
                    pca.partial_fit(batch?.view())?;
                }
                pca.finish()?;
                let output: BatchStream<'_, VectorBatch> = Box::new(output);
                (output, Some(pca), Projection::Embeddings { dims })
            }
        };

        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{HEADER}")?;
        let mut rows = 0usize;
        let mut dims = 0usize;
        let mut cluster_sizes = vec![0usize; centroids.nrows()];
        loop {
            let (meta, vectors, batch_labels) = match (stories.next(), embeddings.next(), labels.next()) {
                (None, None, None) => break,
                (Some(meta), Some(vectors), Some(batch_labels)) => (meta?, vectors?, batch_labels?),
                _ => {
                    return Err(PipelineError::Misaligned(
                        "story, embedding and label streams ended at different batches".into(),
                    ))
                }
            };
            if meta.len() != vectors.nrows() || meta.len() != batch_labels.len() {
                return Err(PipelineError::Misaligned(format!(
                    "batch of {} stories has {} vectors and {} labels",
                    meta.len(),
                    vectors.nrows(),
                    batch_labels.len()
                )));
            }

            let projected = match &model {
                Some(pca) if vectors.ncols() > pca.output_dims().unwrap_or(usize::MAX) => {
                    Cow::Owned(pca.transform_batch(vectors.view())?)
                }
                _ => Cow::Borrowed(&*vectors),
            };
            dims = projected.ncols();
            for ((story, vector), &label) in meta.iter().zip(projected.rows()).zip(batch_labels.iter()) {
                if let Some(size) = cluster_sizes.get_mut(label) {
                    *size += 1;
                }
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    story.story_id,
                    sanitize(&story.title),
                    sanitize(story.url.as_deref().unwrap_or("")),
                    story.unix_time,
                    label,
                    join_floats(vector)
                )?;
                rows += 1;
            }
        }
        out.flush()?;
        info!(path = %path.display(), rows, dims, "wrote clustering result");
        Ok(SerializeSummary {
            rows,
            dims,
            projection,
            cluster_sizes,
        })
    }

    /// Writes the main model's explained-variance ratios, one per line.
    ///
    /// Returns `Ok(false)` without touching `path` when reduction was skipped.
    pub fn serialize_pca_explained_variance(&self, path: &Path) -> Result<bool, PipelineError> {
        let Some(ratios) = self.reduction.and_then(StreamingPca::explained_variance_ratio) else {
            return Ok(false);
        };
        let mut out = BufWriter::new(File::create(path)?);
        for ratio in ratios {
            writeln!(out, "{ratio}")?;
        }
        out.flush()?;
        info!(path = %path.display(), components = ratios.len(), "wrote explained variance");
        Ok(true)
    }
}

fn sanitize(field: &str) -> Cow<'_, str> {
    if field.contains(['\t', '\n', '\r']) {
        Cow::Owned(field.replace(['\t', '\n', '\r'], " "))
    } else {
        Cow::Borrowed(field)
    }
}

fn join_floats(vector: ArrayView1<'_, f64>) -> String {
    let mut out = String::with_capacity(vector.len() * 20);
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StoryMeta;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn meta(story_id: i64, title: &str, url: Option<&str>) -> StoryMeta {
        StoryMeta {
            story_id,
            title: title.to_string(),
            url: url.map(str::to_string),
            unix_time: 1_600_000_000 + story_id,
        }
    }

    fn streams<'a>(
        stories: Vec<Vec<StoryMeta>>,
        embeddings: Vec<Array2<f64>>,
        labels: Vec<Vec<usize>>,
    ) -> ClusteringStreams<'a> {
        ClusteringStreams {
            stories: Box::new(stories.into_iter().map(|b| Ok(Rc::new(b)))),
            embeddings: Box::new(embeddings.into_iter().map(|b| Ok(Rc::new(b)))),
            labels: Box::new(labels.into_iter().map(|b| Ok(Rc::new(b)))),
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn writes_header_and_sanitized_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let serializer = ResultSerializer::new(None, 100);
        let summary = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![
                        vec![meta(1, "tabs\there", Some("https://a.example"))],
                        vec![meta(2, "multi\nline", None)],
                    ],
                    vec![array![[0.5, -1.0]], array![[2.0, 0.25]]],
                    vec![vec![1], vec![0]],
                ),
                Some(&array![[0.0, 0.0], [1.0, 1.0]]),
                2,
            )
            .unwrap();

        assert_eq!(
            read_lines(&path),
            vec![
                HEADER.to_string(),
                "1\ttabs here\thttps://a.example\t1600000001\t1\t0.5,-1".to_string(),
                "2\tmulti line\t\t1600000002\t0\t2,0.25".to_string(),
            ]
        );
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.projection, Projection::Unprojected);
        assert_eq!(summary.cluster_sizes, vec![1, 1]);
    }

    #[test]
    fn wide_vectors_are_projected_through_centroids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let centroids = array![[0.0, 0.0, 0.0, 1.0], [4.0, 0.0, 1.0, 0.0], [0.0, 3.0, 0.0, 0.0]];
        let serializer = ResultSerializer::new(None, 100);
        let summary = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![vec![meta(1, "a", None), meta(2, "b", None), meta(3, "c", None)]],
                    vec![centroids.clone()],
                    vec![vec![0, 1, 2]],
                ),
                Some(&centroids),
                3,
            )
            .unwrap();

        assert_eq!(summary.projection, Projection::Centroids { dims: 2 });
        assert_eq!(summary.dims, 2);
        for line in read_lines(&path).iter().skip(1) {
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!(fields.len(), 6);
            assert_eq!(fields[5].split(',').count(), 2);
        }
    }

    #[test]
    fn single_story_projects_to_one_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let serializer = ResultSerializer::new(None, 100);
        let summary = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![vec![meta(1, "a", None)]],
                    vec![array![[1.0, 2.0, 3.0]]],
                    vec![vec![0]],
                ),
                Some(&array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]),
                1,
            )
            .unwrap();
        assert_eq!(summary.dims, 1);
    }

    #[test]
    fn too_few_centroids_fit_on_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let serializer = ResultSerializer::new(None, 100);
        let summary = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![
                        vec![meta(1, "a", None), meta(2, "b", None)],
                        vec![meta(3, "c", None)],
                    ],
                    vec![
                        array![[1.0, 0.0, 2.0], [0.0, 1.0, 0.0]],
                        array![[3.0, 3.0, 1.0]],
                    ],
                    vec![vec![0, 0], vec![0]],
                ),
                Some(&array![[1.0, 1.0, 1.0]]),
                3,
            )
            .unwrap();
        assert_eq!(summary.projection, Projection::Embeddings { dims: 2 });
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.cluster_sizes, vec![3]);
    }

    #[test]
    fn reduced_vectors_are_written_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let mut pca = StreamingPca::new(3);
        pca.fit_matrix(array![[1.0, 2.0, 0.0], [0.0, 1.0, 4.0], [2.0, 2.0, 2.0], [5.0, 0.0, 1.0]].view())
            .unwrap();
        let serializer = ResultSerializer::new(Some(&pca), 3);
        let summary = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![vec![meta(1, "a", None)]],
                    vec![array![[0.125, 0.5, -2.0]]],
                    vec![vec![0]],
                ),
                Some(&array![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]),
                4,
            )
            .unwrap();
        assert_eq!(summary.projection, Projection::Reduced);
        assert!(read_lines(&path)[1].ends_with("\t0\t0.125,0.5,-2"));
    }

    #[test]
    fn misaligned_streams_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.tsv");
        let serializer = ResultSerializer::new(None, 2);
        let err = serializer
            .serialize_clustering_result(
                &path,
                streams(
                    vec![vec![meta(1, "a", None)], vec![meta(2, "b", None)]],
                    vec![array![[1.0, 2.0]]],
                    vec![vec![0]],
                ),
                Some(&array![[0.0, 0.0], [1.0, 1.0]]),
                2,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Misaligned(_)));
    }

    #[test]
    fn serializing_before_clustering_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = ResultSerializer::new(None, 2);
        let err = serializer
            .serialize_clustering_result(
                &dir.path().join("clusters.tsv"),
                streams(vec![], vec![], vec![]),
                None,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFitted { .. }));
        assert!(!dir.path().join("clusters.tsv").exists());
    }

    #[test]
    fn explained_variance_is_only_written_for_the_main_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variance.txt");
        std::fs::write(&path, "previous\n").unwrap();

        let serializer = ResultSerializer::new(None, 2);
        assert!(!serializer.serialize_pca_explained_variance(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous\n");

        let mut pca = StreamingPca::new(2);
        pca.fit_matrix(array![[1.0, 0.0], [-1.0, 0.0], [0.0, 0.5], [0.0, -0.5]].view())
            .unwrap();
        let serializer = ResultSerializer::new(Some(&pca), 2);
        assert!(serializer.serialize_pca_explained_variance(&path).unwrap());
        let ratios: Vec<f64> = read_lines(&path).iter().map(|l| l.parse().unwrap()).collect();
        assert_eq!(ratios.len(), 2);
        assert!((ratios[0] - 0.8).abs() < 1e-12);
        assert!((ratios[1] - 0.2).abs() < 1e-12);
    }
}

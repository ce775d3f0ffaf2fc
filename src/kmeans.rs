//! Mini-batch k-means over a batch stream.

use std::rc::Rc;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::stream::{BatchStream, LabelBatch, VectorBatch};

/// Mini-batch k-means with seeded greedy k-means++ initialization.
///
/// Centroids are initialized from the first `k` or more vectors seen, then each
/// batch moves every centroid toward the running mean of the points assigned to it.
/// Assignment uses squared Euclidean distance; ties go to the lowest centroid index.
#[derive(Debug)]
pub struct StreamingKMeans {
    n_clusters: usize,
    rng: ChaCha8Rng,
    centroids: Option<Array2<f64>>,
    counts: Vec<f64>,
    // vectors held back until there are enough to initialize from
    warmup: Vec<Vec<f64>>,
    n_samples: usize,
}

impl StreamingKMeans {
    /// An unfitted model for `n_clusters` clusters seeded with `seed`.
    pub fn new(n_clusters: usize, seed: u64) -> Self {
        Self {
            n_clusters: n_clusters.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
            centroids: None,
            counts: Vec::new(),
            warmup: Vec::new(),
            n_samples: 0,
        }
    }

    /// A model starting from explicit centroids instead of k-means++.
    pub fn with_centroids(centroids: Array2<f64>, seed: u64) -> Self {
        let n_clusters = centroids.nrows();
        Self {
            n_clusters,
            rng: ChaCha8Rng::seed_from_u64(seed),
            counts: vec![0.0; n_clusters],
            centroids: Some(centroids),
            warmup: Vec::new(),
            n_samples: 0,
        }
    }

    /// Requested cluster count.
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Vectors folded in so far.
    pub fn n_samples_seen(&self) -> usize {
        self.n_samples
    }

    /// Current centroids, one per row, once initialized.
    pub fn centroids(&self) -> Option<&Array2<f64>> {
        self.centroids.as_ref()
    }

    /// Folds one batch into the centroids.
    pub fn partial_fit(&mut self, batch: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        if batch.nrows() == 0 {
            return Ok(());
        }
        self.n_samples += batch.nrows();
        if self.centroids.is_some() {
            return self.update(batch);
        }

        if let Some(first) = self.warmup.first() {
            if first.len() != batch.ncols() {
                return Err(PipelineError::DimensionMismatch {
                    expected: first.len(),
                    found: batch.ncols(),
                });
            }
        }
        self.warmup.extend(batch.rows().into_iter().map(|row| row.to_vec()));
        if self.warmup.len() < self.n_clusters {
            debug!(
                buffered = self.warmup.len(),
                needed = self.n_clusters,
                "waiting for enough vectors to initialize centroids"
            );
            return Ok(());
        }

        let rows = self.warmup.len();
        let dims = batch.ncols();
        let flat: Vec<f64> = std::mem::take(&mut self.warmup).into_iter().flatten().collect();
        let seed_points = Array2::from_shape_vec((rows, dims), flat).map_err(|err| {
            PipelineError::Misaligned(format!("warm-up buffer has the wrong shape: {err}"))
        })?;
        self.centroids = Some(kmeans_plus_plus(
            seed_points.view(),
            self.n_clusters,
            &mut self.rng,
        ));
        self.counts = vec![0.0; self.n_clusters];
        self.update(seed_points.view())
    }

    /// Fits on every batch of `batches`.
    ///
    /// Fails with [`PipelineError::TooFewSamples`] if the stream held fewer vectors
    /// than clusters.
    pub fn fit(&mut self, batches: BatchStream<'_, VectorBatch>) -> Result<(), PipelineError> {
        for batch in batches {
            self.partial_fit(batch?.view())?;
        }
        if self.centroids.is_none() {
            return Err(PipelineError::TooFewSamples {
                samples: self.n_samples,
                clusters: self.n_clusters,
            });
        }
        info!(
            clusters = self.n_clusters,
            samples = self.n_samples,
            "clustering fitted"
        );
        Ok(())
    }

    /// Labels one batch with the nearest centroid.
    pub fn predict_batch(&self, batch: ArrayView2<'_, f64>) -> Result<Vec<usize>, PipelineError> {
        let centroids = self
            .centroids
            .as_ref()
            .ok_or_else(|| PipelineError::not_fitted("clusterer", "`fit`"))?;
        assign(centroids.view(), batch)
    }

    /// Lazily labels every batch of `batches` against the current centroids.
    pub fn predict<'a>(
        &self,
        batches: BatchStream<'a, VectorBatch>,
    ) -> Result<BatchStream<'a, LabelBatch>, PipelineError> {
        let centroids = self
            .centroids
            .clone()
            .ok_or_else(|| PipelineError::not_fitted("clusterer", "`fit`"))?;
        Ok(Box::new(batches.map(move |batch| {
            let batch = batch?;
            assign(centroids.view(), batch.view()).map(Rc::new)
        })))
    }

    /// Sum of squared distances from each vector to its nearest centroid.
    pub fn inertia_batch(&self, batch: ArrayView2<'_, f64>) -> Result<f64, PipelineError> {
        let centroids = self
            .centroids
            .as_ref()
            .ok_or_else(|| PipelineError::not_fitted("clusterer", "`fit`"))?;
        let labels = assign(centroids.view(), batch)?;
        Ok(batch
            .rows()
            .into_iter()
            .zip(labels)
            .map(|(row, label)| squared_distance(row, centroids.row(label)))
            .sum())
    }

    fn update(&mut self, batch: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        let Some(centroids) = self.centroids.as_mut() else {
            return Err(PipelineError::not_fitted("clusterer", "`partial_fit`"));
        };
        let labels = assign(centroids.view(), batch)?;
        for (row, label) in batch.rows().into_iter().zip(labels) {
            self.counts[label] += 1.0;
            let rate = 1.0 / self.counts[label];
            let mut centroid = centroids.row_mut(label);
            centroid.zip_mut_with(&row, |c, x| *c += rate * (x - *c));
        }
        Ok(())
    }
}

fn assign(
    centroids: ArrayView2<'_, f64>,
    batch: ArrayView2<'_, f64>,
) -> Result<Vec<usize>, PipelineError> {
    if batch.nrows() > 0 && batch.ncols() != centroids.ncols() {
        return Err(PipelineError::DimensionMismatch {
            expected: centroids.ncols(),
            found: batch.ncols(),
        });
    }
    Ok(batch
        .rows()
        .into_iter()
        .map(|row| nearest(centroids, row).0)
        .collect())
}

fn nearest(centroids: ArrayView2<'_, f64>, point: ArrayView1<'_, f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (index, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
        let distance = squared_distance(point, centroid);
        if distance < best.1 {
            best = (index, distance);
        }
    }
    best
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Greedy k-means++: each new centroid is the best of several candidates sampled
/// proportionally to squared distance from the centroids chosen so far.
fn kmeans_plus_plus(points: ArrayView2<'_, f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let n = points.nrows();
    let trials = 2 + (k as f64).ln().floor() as usize;
    let mut centroids = Array2::zeros((k, points.ncols()));

    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&points.row(first));
    let mut closest: Vec<f64> = points
        .rows()
        .into_iter()
        .map(|row| squared_distance(row, points.row(first)))
        .collect();

    for c in 1..k {
        let potential: f64 = closest.iter().sum();
        let mut best: Option<(usize, f64, Vec<f64>)> = None;
        for _ in 0..trials {
            let candidate = if potential > 0.0 {
                sample_weighted(&closest, potential, rng)
            } else {
                rng.random_range(0..n)
            };
            let distances: Vec<f64> = points
                .rows()
                .into_iter()
                .zip(&closest)
                .map(|(row, current)| current.min(squared_distance(row, points.row(candidate))))
                .collect();
            let candidate_potential: f64 = distances.iter().sum();
            if best
                .as_ref()
                .map_or(true, |(_, best_potential, _)| candidate_potential < *best_potential)
            {
                best = Some((candidate, candidate_potential, distances));
            }
        }
        if let Some((index, _, distances)) = best {
            centroids.row_mut(c).assign(&points.row(index));
            closest = distances;
        }
    }
    centroids
}

fn sample_weighted(weights: &[f64], total: f64, rng: &mut ChaCha8Rng) -> usize {
    let target = rng.random::<f64>() * total;
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if cumulative > target {
            return index;
        }
    }
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn stream<'a>(batches: Vec<Array2<f64>>) -> BatchStream<'a, VectorBatch> {
        Box::new(batches.into_iter().map(|b| Ok(Rc::new(b))))
    }

    fn blobs(seed: u64, per_blob: usize) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let centers = [[0.0, 0.0], [10.0, 10.0], [-10.0, 10.0]];
        let mut flat = Vec::new();
        for i in 0..per_blob * centers.len() {
            let [x, y] = centers[i % centers.len()];
            flat.push(x + rng.random_range(-1.0..1.0));
            flat.push(y + rng.random_range(-1.0..1.0));
        }
        Array2::from_shape_vec((per_blob * centers.len(), 2), flat).unwrap()
    }

    #[test]
    fn separates_well_spaced_blobs() {
        let data = blobs(1, 30);
        let mut model = StreamingKMeans::new(3, 42);
        model
            .fit(stream(vec![
                data.slice(ndarray::s![..45, ..]).to_owned(),
                data.slice(ndarray::s![45.., ..]).to_owned(),
            ]))
            .unwrap();
        let labels = model.predict_batch(data.view()).unwrap();
        for blob in 0..3 {
            let first = labels[blob];
            assert!(labels.iter().skip(blob).step_by(3).all(|l| *l == first));
        }
        let mut distinct = labels[..3].to_vec();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        assert!(model.inertia_batch(data.view()).unwrap() < 90.0 * 2.0);
    }

    #[test]
    fn same_seed_same_labels() {
        let data = blobs(9, 20);
        let run = || {
            let mut model = StreamingKMeans::new(4, 7);
            model.fit(stream(vec![data.clone()])).unwrap();
            model.predict_batch(data.view()).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn ties_go_to_the_lowest_index() {
        let model = StreamingKMeans::with_centroids(array![[1.0, 0.0], [-1.0, 0.0]], 0);
        let labels = model.predict_batch(array![[0.0, 5.0], [-0.9, 0.0]].view()).unwrap();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn centroids_track_running_means() {
        let mut model = StreamingKMeans::with_centroids(array![[0.0], [100.0]], 0);
        model.partial_fit(array![[2.0], [4.0], [98.0]].view()).unwrap();
        model.partial_fit(array![[6.0]].view()).unwrap();
        assert_eq!(model.centroids().unwrap(), &array![[4.0], [98.0]]);
    }

    #[test]
    fn predict_before_fit_is_rejected() {
        let model = StreamingKMeans::new(3, 0);
        assert!(matches!(
            model.predict_batch(array![[1.0]].view()),
            Err(PipelineError::NotFitted { .. })
        ));
        assert!(model.predict(stream(vec![])).is_err());
    }

    #[test]
    fn too_few_samples_fail_the_fit() {
        let mut model = StreamingKMeans::new(5, 0);
        let err = model
            .fit(stream(vec![array![[1.0], [2.0]], array![[3.0]]]))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TooFewSamples {
                samples: 3,
                clusters: 5
            }
        ));
    }

    #[test]
    fn initialization_waits_for_enough_vectors() {
        let mut model = StreamingKMeans::new(3, 0);
        model.partial_fit(array![[0.0], [1.0]].view()).unwrap();
        assert!(model.centroids().is_none());
        model.partial_fit(array![[50.0]].view()).unwrap();
        assert_eq!(model.centroids().map(|c| c.nrows()), Some(3));
    }

    #[test]
    fn predicted_labels_keep_batch_shape() {
        let data = blobs(2, 10);
        let mut model = StreamingKMeans::new(3, 1);
        model.fit(stream(vec![data.clone()])).unwrap();
        let labels: Vec<LabelBatch> = model
            .predict(stream(vec![data.clone(), Array2::zeros((0, 2))]))
            .unwrap()
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].len(), 30);
        assert!(labels[1].is_empty());
    }
}

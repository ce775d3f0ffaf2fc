//! Streaming feature scaling and dimensionality reduction.
//!
//! Both models are fitted from a [`BatchStream`] without materializing it: the
//! standardizer makes a mean pass and a variance pass over two branches of a tee, and
//! PCA folds each batch into a running mean and scatter matrix before solving for the
//! leading components once.

use std::rc::Rc;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::linalg::top_eigenpairs;
use crate::stream::{tee, BatchStream, VectorBatch};

#[derive(Debug)]
struct Moments {
    mean: Array1<f64>,
    std: Array1<f64>,
}

/// Per-dimension zero-mean, unit-variance scaling fitted over a whole stream.
///
/// Dimensions with zero variance are mapped to exactly 0.
#[derive(Debug, Default)]
pub struct Standardizer {
    count: usize,
    moments: Option<Rc<Moments>>,
}

impl Standardizer {
    /// An unfitted standardizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Vectors seen by the last fit.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether [`fit`](Self::fit) has completed.
    pub fn is_fitted(&self) -> bool {
        self.moments.is_some()
    }

    /// Per-dimension mean, once fitted.
    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.moments.as_deref().map(|m| &m.mean)
    }

    /// Per-dimension population standard deviation, once fitted.
    pub fn std(&self) -> Option<&Array1<f64>> {
        self.moments.as_deref().map(|m| &m.std)
    }

    /// Fits mean and standard deviation, consuming the stream.
    pub fn fit(&mut self, batches: BatchStream<'_, VectorBatch>) -> Result<(), PipelineError> {
        let [mean_pass, variance_pass] = tee(batches);
        self.fit_passes(mean_pass, variance_pass)
    }

    /// Fits on the stream and returns its standardized copy.
    ///
    /// The returned stream replays batches buffered during the fit passes.
    pub fn fit_transform<'a>(
        &mut self,
        batches: BatchStream<'a, VectorBatch>,
    ) -> Result<BatchStream<'a, VectorBatch>, PipelineError> {
        let [mean_pass, variance_pass, output] = tee(batches);
        self.fit_passes(mean_pass, variance_pass)?;
        self.transform(Box::new(output))
    }

    /// Lazily standardizes every batch of `batches`.
    pub fn transform<'a>(
        &self,
        batches: BatchStream<'a, VectorBatch>,
    ) -> Result<BatchStream<'a, VectorBatch>, PipelineError> {
        let moments = self
            .moments
            .clone()
            .ok_or_else(|| PipelineError::not_fitted("standardizer", "`fit`"))?;
        Ok(Box::new(batches.map(move |batch| {
            let batch = batch?;
            scale(&moments, batch.view()).map(Rc::new)
        })))
    }

    /// Maps standardized vectors back to the original feature space.
    pub fn inverse_transform_batch(
        &self,
        batch: ArrayView2<'_, f64>,
    ) -> Result<Array2<f64>, PipelineError> {
        let moments = self
            .moments
            .as_deref()
            .ok_or_else(|| PipelineError::not_fitted("standardizer", "`fit`"))?;
        check_dims(moments.mean.len(), batch)?;
        let mut out = batch.to_owned();
        for mut row in out.rows_mut() {
            row *= &moments.std;
            row += &moments.mean;
        }
        Ok(out)
    }

    fn fit_passes<I, J>(&mut self, mean_pass: I, variance_pass: J) -> Result<(), PipelineError>
    where
        I: Iterator<Item = Result<VectorBatch, PipelineError>>,
        J: Iterator<Item = Result<VectorBatch, PipelineError>>,
    {
        let mut count = 0usize;
        let mut sum: Option<Array1<f64>> = None;
        // per-dimension (min, max), so constant columns are caught exactly
        let mut range: Vec<(f64, f64)> = Vec::new();
        for batch in mean_pass {
            let batch = batch?;
            let acc = sum.get_or_insert_with(|| Array1::zeros(batch.ncols()));
            check_dims(acc.len(), batch.view())?;
            *acc += &batch.sum_axis(Axis(0));
            count += batch.nrows();
            if range.is_empty() {
                range = vec![(f64::INFINITY, f64::NEG_INFINITY); batch.ncols()];
            }
            for row in batch.rows() {
                for ((lo, hi), value) in range.iter_mut().zip(row) {
                    *lo = lo.min(*value);
                    *hi = hi.max(*value);
                }
            }
        }
        let mut mean = sum.unwrap_or_else(|| Array1::zeros(0));
        if count > 0 {
            mean /= count as f64;
        }

        let mut squares = Array1::<f64>::zeros(mean.len());
        for batch in variance_pass {
            let batch = batch?;
            for row in batch.rows() {
                let centered = &row - &mean;
                squares += &(&centered * &centered);
            }
        }
        let mut std = if count > 0 {
            squares.mapv(|s| (s / count as f64).sqrt())
        } else {
            squares
        };
        // rounding in the mean leaves a tiny nonzero spread on constant columns
        for (spread, (lo, hi)) in std.iter_mut().zip(&range) {
            if lo == hi {
                *spread = 0.0;
            }
        }

        debug!(vectors = count, dims = mean.len(), "standardizer fitted");
        self.count = count;
        self.moments = Some(Rc::new(Moments { mean, std }));
        Ok(())
    }
}

fn scale(moments: &Moments, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, PipelineError> {
    if batch.nrows() == 0 {
        return Ok(batch.to_owned());
    }
    check_dims(moments.mean.len(), batch)?;
    let mut out = batch.to_owned();
    for mut row in out.rows_mut() {
        for ((value, mean), std) in row.iter_mut().zip(&moments.mean).zip(&moments.std) {
            *value = if *std > 0.0 { (*value - mean) / std } else { 0.0 };
        }
    }
    Ok(out)
}

fn check_dims(expected: usize, batch: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
    if batch.ncols() == expected {
        Ok(())
    } else {
        Err(PipelineError::DimensionMismatch {
            expected,
            found: batch.ncols(),
        })
    }
}

#[derive(Debug)]
struct PcaModel {
    mean: Array1<f64>,
    // one component per row
    components: Array2<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
}

/// Principal component analysis fitted incrementally, one batch at a time.
///
/// Batches are folded into a running mean and scatter matrix with the pairwise
/// update of Chan et al., so the result equals a PCA over the concatenated input.
/// Components are sign-normalized for reproducible projections.
#[derive(Debug)]
pub struct StreamingPca {
    n_components: usize,
    n_samples: usize,
    mean: Array1<f64>,
    scatter: Array2<f64>,
    model: Option<Rc<PcaModel>>,
}

impl StreamingPca {
    /// An empty model that will keep `n_components` components (fewer if the data
    /// has fewer dimensions).
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components: n_components.max(1),
            n_samples: 0,
            mean: Array1::zeros(0),
            scatter: Array2::zeros((0, 0)),
            model: None,
        }
    }

    /// Vectors folded in so far.
    pub fn n_samples_seen(&self) -> usize {
        self.n_samples
    }

    /// Requested number of components.
    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Folds one batch into the running statistics.
    pub fn partial_fit(&mut self, batch: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        if batch.nrows() == 0 {
            return Ok(());
        }
        if self.n_samples == 0 {
            self.mean = Array1::zeros(batch.ncols());
            self.scatter = Array2::zeros((batch.ncols(), batch.ncols()));
        }
        check_dims(self.mean.len(), batch)?;

        let nb = batch.nrows() as f64;
        let na = self.n_samples as f64;
        let batch_mean = batch.sum_axis(Axis(0)) / nb;
        let centered = &batch - &batch_mean;
        let batch_scatter = centered.t().dot(&centered);

        let delta = &batch_mean - &self.mean;
        let n = na + nb;
        let column = delta.view().insert_axis(Axis(1));
        let row = delta.view().insert_axis(Axis(0));
        let correction = column.dot(&row) * (na * nb / n);
        self.scatter = &self.scatter + &batch_scatter + &correction;
        self.mean.scaled_add(nb / n, &delta);
        self.n_samples += batch.nrows();
        self.model = None;
        Ok(())
    }

    /// Solves for the components from everything folded in so far.
    pub fn finish(&mut self) -> Result<(), PipelineError> {
        if self.n_samples == 0 {
            return Err(PipelineError::not_fitted("pca", "`partial_fit`"));
        }
        let dims = self.mean.len();
        let k = self.n_components.min(dims);
        let covariance = &self.scatter / (self.n_samples.saturating_sub(1).max(1) as f64);
        let total_variance: f64 = covariance.diag().sum();

        let pairs = top_eigenpairs(&covariance, k);
        let explained_variance = pairs.values.mapv(|v| v.max(0.0));
        let explained_variance_ratio = if total_variance > 0.0 {
            &explained_variance / total_variance
        } else {
            Array1::zeros(k)
        };
        debug!(
            samples = self.n_samples,
            dims,
            components = k,
            retained = explained_variance_ratio.sum(),
            "pca fitted"
        );
        self.model = Some(Rc::new(PcaModel {
            mean: self.mean.clone(),
            components: pairs.vectors.reversed_axes(),
            explained_variance,
            explained_variance_ratio,
        }));
        Ok(())
    }

    /// Convenience for fitting on a single in-memory matrix.
    pub fn fit_matrix(&mut self, data: ArrayView2<'_, f64>) -> Result<(), PipelineError> {
        self.partial_fit(data)?;
        self.finish()
    }

    /// Whether [`finish`](Self::finish) has run since the last update.
    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    /// Output dimensionality of the fitted model.
    pub fn output_dims(&self) -> Option<usize> {
        self.model.as_deref().map(|m| m.components.nrows())
    }

    /// Components as rows, once fitted.
    pub fn components(&self) -> Option<&Array2<f64>> {
        self.model.as_deref().map(|m| &m.components)
    }

    /// Variance captured by each component.
    pub fn explained_variance(&self) -> Option<&Array1<f64>> {
        self.model.as_deref().map(|m| &m.explained_variance)
    }

    /// Fraction of the total variance captured by each component.
    pub fn explained_variance_ratio(&self) -> Option<&Array1<f64>> {
        self.model.as_deref().map(|m| &m.explained_variance_ratio)
    }

    /// Projects one batch onto the components.
    pub fn transform_batch(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, PipelineError> {
        let model = self
            .model
            .as_deref()
            .ok_or_else(|| PipelineError::not_fitted("pca", "`finish`"))?;
        project(model, batch)
    }

    /// Lazily projects every batch of `batches`.
    pub fn transform<'a>(
        &self,
        batches: BatchStream<'a, VectorBatch>,
    ) -> Result<BatchStream<'a, VectorBatch>, PipelineError> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| PipelineError::not_fitted("pca", "`finish`"))?;
        Ok(Box::new(batches.map(move |batch| {
            let batch = batch?;
            project(&model, batch.view()).map(Rc::new)
        })))
    }
}

fn project(model: &PcaModel, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, PipelineError> {
    if batch.nrows() == 0 {
        return Ok(Array2::zeros((0, model.components.nrows())));
    }
    check_dims(model.mean.len(), batch)?;
    Ok((&batch - &model.mean).dot(&model.components.t()))
}

/// Output of the [`reduce`] stage.
pub struct Reduction<'a> {
    /// Reduced vectors, or the input unchanged when reduction was skipped.
    pub batches: BatchStream<'a, VectorBatch>,
    /// The fitted model; `None` when reduction was skipped.
    pub model: Option<StreamingPca>,
}

/// Reduces standardized vectors to `n_dims` principal components.
///
/// `total` is the number of vectors in the stream. PCA cannot extract more
/// components than samples, so when `total < n_dims` the stream is passed through
/// unchanged and no model is produced.
pub fn reduce<'a>(
    batches: BatchStream<'a, VectorBatch>,
    total: usize,
    n_dims: usize,
) -> Result<Reduction<'a>, PipelineError> {
    if total < n_dims {
        warn!(
            stories = total,
            n_dims, "fewer stories than PCA dimensions; skipping reduction"
        );
        return Ok(Reduction {
            batches,
            model: None,
        });
    }

    let [fit_pass, output] = tee(batches);
    let mut pca = StreamingPca::new(n_dims);
    for batch in fit_pass {
        pca.partial_fit(batch?.view())?;
    }
    pca.finish()?;
    if let Some(ratio) = pca.explained_variance_ratio() {
        info!(
            components = ratio.len(),
            retained = ratio.sum(),
            "reduced embeddings"
        );
    }
    let batches = pca.transform(Box::new(output))?;
    Ok(Reduction {
        batches,
        model: Some(pca),
    })
}

//! Linear regression trained with mini-batch gradient descent.
//!
//! The model is `y = x · w + b` with `w: (features, 1)` and `b: (1,)`, in that
//! order. It is small enough to run anywhere while exercising the full round
//! path: decode, train, encode.

use std::sync::Arc;

use comms::typing::{Config, Metrics, Properties, Scalar};
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, linalg};

use crate::{
    DType, EngineError, EvaluateOptions, Evaluated, FitOptions, Fitted, InMemoryDataset,
    LocalEvaluator, LocalTrainer, ModelState,
};

/// Reference engine implementing both `LocalTrainer` and `LocalEvaluator`
/// over a shared in-memory dataset.
#[derive(Debug, Clone)]
pub struct LinearEngine {
    dataset: Arc<InMemoryDataset>,
    fit_defaults: FitOptions,
    evaluate_defaults: EvaluateOptions,
}

impl LinearEngine {
    pub fn new(dataset: Arc<InMemoryDataset>) -> Self {
        Self {
            dataset,
            fit_defaults: FitOptions::default(),
            evaluate_defaults: EvaluateOptions::default(),
        }
    }

    /// Options used for keys the round configuration does not carry.
    pub fn with_defaults(mut self, fit: FitOptions, evaluate: EvaluateOptions) -> Self {
        self.fit_defaults = fit;
        self.evaluate_defaults = evaluate;
        self
    }

    pub fn dataset(&self) -> &InMemoryDataset {
        &self.dataset
    }

    /// The ordered tensor shapes of the model.
    pub fn layout(&self) -> Vec<Vec<usize>> {
        vec![vec![self.dataset.features(), 1], vec![1]]
    }

    /// A zeroed model of the given element type.
    pub fn initial_state(&self, dtype: DType) -> ModelState {
        ModelState::zeros(&self.layout(), dtype)
    }

    /// Extracts `(w, b)` from `state`, checking it follows `layout`.
    fn unpack(&self, state: &ModelState) -> Result<(Array2<f32>, f32), EngineError> {
        let [w, b] = state.tensors() else {
            return Err(EngineError::ShapeMismatch {
                what: "model tensors",
                got: state.len(),
                expected: 2,
            });
        };

        let features = self.dataset.features();
        if w.shape() != [features, 1] {
            return Err(EngineError::ShapeMismatch {
                what: "weights",
                got: w.numel(),
                expected: features,
            });
        }

        if b.shape() != [1] {
            return Err(EngineError::ShapeMismatch {
                what: "bias",
                got: b.numel(),
                expected: 1,
            });
        }

        let w = Array2::from_shape_vec((features, 1), w.to_f32()).map_err(EngineError::other)?;
        Ok((w, b.to_f32()[0]))
    }

    fn views(&self, n: usize) -> Result<(ArrayView2<'_, f32>, ArrayView1<'_, f32>), EngineError> {
        let n = n.min(self.dataset.len());
        let x = ArrayView2::from_shape((n, self.dataset.features()), self.dataset.inputs(n))
            .map_err(EngineError::other)?;
        let y = ArrayView1::from(self.dataset.targets(n));
        Ok((x, y))
    }
}

/// Residuals `x · w + b - y` as a column.
fn residuals(x: ArrayView2<f32>, y: ArrayView1<f32>, w: &Array2<f32>, b: f32) -> Array2<f32> {
    let mut r = Array2::zeros((x.nrows(), 1));
    linalg::general_mat_mul(1.0, &x, w, 0.0, &mut r);
    r.column_mut(0).zip_mut_with(&y, |r, &y| *r += b - y);
    r
}

fn mse(r: &Array2<f32>) -> f64 {
    r.iter().map(|&e| f64::from(e) * f64::from(e)).sum::<f64>() / r.len() as f64
}

impl LocalTrainer for LinearEngine {
    fn train(&mut self, mut state: ModelState, config: &Config) -> Result<Fitted, EngineError> {
        let opts = FitOptions::from_config(config, self.fit_defaults)?;
        let (mut w, mut b) = self.unpack(&state)?;
        let (x, y) = self.views(opts.max_samples.unwrap_or(usize::MAX))?;
        let n = x.nrows();

        let mut epoch_loss = 0.0;
        let mut grad = Array2::zeros(w.raw_dim());

        for epoch in 0..opts.epochs {
            let mut sum = 0.0;

            for (xb, yb) in x
                .axis_chunks_iter(Axis(0), opts.batch_size)
                .zip(y.axis_chunks_iter(Axis(0), opts.batch_size))
            {
                let r = residuals(xb, yb, &w, b);
                sum += mse(&r) * xb.nrows() as f64;

                let scale = 2.0 / xb.nrows() as f32;
                linalg::general_mat_mul(scale, &xb.t(), &r, 0.0, &mut grad);
                let grad_b = scale * r.sum();

                let lr = opts.learning_rate as f32;
                w.scaled_add(-lr, &grad);
                b -= lr * grad_b;
            }

            epoch_loss = sum / n as f64;
            debug!(epoch = epoch, loss = epoch_loss; "linear engine epoch done");
        }

        if !epoch_loss.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "training diverged with learning rate {}",
                opts.learning_rate
            )));
        }

        if let [wt, bt] = state.tensors_mut() {
            wt.assign_f32(&w.iter().copied().collect::<Vec<_>>())?;
            bt.assign_f32(&[b])?;
        }

        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), Scalar::Float(epoch_loss));

        Ok(Fitted {
            state,
            num_examples: n as u64,
            metrics,
        })
    }

    fn properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("engine".into(), Scalar::from("linear"));
        props.insert("num_samples".into(), Scalar::Int(self.dataset.len() as i64));
        props.insert("features".into(), Scalar::Int(self.dataset.features() as i64));
        props
    }
}

impl LocalEvaluator for LinearEngine {
    fn evaluate(&mut self, state: &ModelState, config: &Config) -> Result<Evaluated, EngineError> {
        let opts = EvaluateOptions::from_config(config, self.evaluate_defaults)?;
        let (w, b) = self.unpack(state)?;
        let (x, y) = self.views(opts.max_samples.unwrap_or(usize::MAX))?;
        let n = x.nrows();

        let mut squared = 0.0;
        let mut absolute = 0.0;

        for (xb, yb) in x
            .axis_chunks_iter(Axis(0), opts.batch_size)
            .zip(y.axis_chunks_iter(Axis(0), opts.batch_size))
        {
            let r = residuals(xb, yb, &w, b);
            squared += mse(&r) * xb.nrows() as f64;
            absolute += r.iter().map(|&e| f64::from(e.abs())).sum::<f64>();
        }

        let mut metrics = Metrics::new();
        metrics.insert("mae".into(), Scalar::Float(absolute / n as f64));

        Ok(Evaluated {
            loss: squared / n as f64,
            num_examples: n as u64,
            metrics,
        })
    }
}

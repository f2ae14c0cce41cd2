use std::{fmt, fs, io, path::Path};

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};

/// Errors produced while loading or accessing dataset samples.
#[derive(Debug)]
pub enum DataError {
    /// The dataset file could not be read.
    Io(io::Error),

    /// A line of a dataset file could not be parsed.
    Parse { line: usize, detail: String },

    /// The dataset holds no samples.
    Empty,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Io(e) => write!(f, "cannot read dataset: {e}"),
            DataError::Parse { line, detail } => write!(f, "dataset line {line}: {detail}"),
            DataError::Empty => write!(f, "dataset is empty"),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DataError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// A regression dataset held in memory: `features` inputs and one target per
/// sample.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryDataset {
    features: usize,
    x: Vec<f32>,
    y: Vec<f32>,
}

impl InMemoryDataset {
    /// Builds a dataset from row-major inputs `x` and targets `y`.
    pub fn new(features: usize, x: Vec<f32>, y: Vec<f32>) -> Result<Self, DataError> {
        if y.is_empty() || features == 0 {
            return Err(DataError::Empty);
        }

        if x.len() != y.len() * features {
            return Err(DataError::Parse {
                line: 0,
                detail: format!(
                    "{} input values do not split into {} samples of {features} features",
                    x.len(),
                    y.len()
                ),
            });
        }

        Ok(Self { features, x, y })
    }

    /// Parses comma separated rows whose last column is the target.
    ///
    /// Blank lines are skipped. Every row must have the same width.
    pub fn parse_csv(content: &str) -> Result<Self, DataError> {
        let mut width = None;
        let mut x = Vec::new();
        let mut y = Vec::new();

        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let values: Vec<f32> = line
                .split(',')
                .map(|v| {
                    v.trim().parse::<f32>().map_err(|_| DataError::Parse {
                        line: i + 1,
                        detail: format!("cannot parse '{}' as f32", v.trim()),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if values.len() < 2 {
                return Err(DataError::Parse {
                    line: i + 1,
                    detail: "expected at least one feature and a target".into(),
                });
            }

            let expected = *width.get_or_insert(values.len());
            if values.len() != expected {
                return Err(DataError::Parse {
                    line: i + 1,
                    detail: format!("expected {expected} values, got {}", values.len()),
                });
            }

            let (features, target) = values.split_at(values.len() - 1);
            x.extend_from_slice(features);
            y.push(target[0]);
        }

        match width {
            Some(width) => Self::new(width - 1, x, y),
            None => Err(DataError::Empty),
        }
    }

    /// Reads a CSV file, see [`InMemoryDataset::parse_csv`].
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let content = fs::read_to_string(path)?;
        Self::parse_csv(&content)
    }

    /// Generates `samples` points of `y = w·x + b + noise` with weights and
    /// bias drawn from `seed`, so two clients with different seeds hold
    /// different local data.
    pub fn synthetic(samples: usize, features: usize, seed: u64) -> Result<Self, DataError> {
        if samples == 0 || features == 0 {
            return Err(DataError::Empty);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let coef = Uniform::new(-2.0_f32, 2.0).map_err(|e| DataError::Parse {
            line: 0,
            detail: e.to_string(),
        })?;
        let noise = Normal::new(0.0_f32, 0.05).map_err(|e| DataError::Parse {
            line: 0,
            detail: e.to_string(),
        })?;

        let weights: Vec<f32> = (0..features).map(|_| coef.sample(&mut rng)).collect();
        let bias = coef.sample(&mut rng);

        let mut x = Vec::with_capacity(samples * features);
        let mut y = Vec::with_capacity(samples);

        for _ in 0..samples {
            let row: Vec<f32> = (0..features).map(|_| rng.random_range(-1.0..1.0)).collect();
            let target = row.iter().zip(&weights).map(|(a, w)| a * w).sum::<f32>()
                + bias
                + noise.sample(&mut rng);

            x.extend(row);
            y.push(target);
        }

        Self::new(features, x, y)
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Row-major inputs of the first `n` samples.
    pub fn inputs(&self, n: usize) -> &[f32] {
        &self.x[..n.min(self.len()) * self.features]
    }

    /// Targets of the first `n` samples.
    pub fn targets(&self, n: usize) -> &[f32] {
        &self.y[..n.min(self.len())]
    }
}

//! Round configuration keys understood by the bundled engines.
//!
//! Keys that are not listed here are ignored. A listed key holding the wrong
//! type or an out of range value is rejected.

use comms::typing::{Config, Scalar};

use crate::EngineError;

/// Options of a training round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Train on the first `max_samples` samples only.
    pub max_samples: Option<usize>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.01,
            batch_size: 32,
            max_samples: None,
        }
    }
}

impl FitOptions {
    /// Reads `epochs`, `learning_rate` (or `lr`), `batch_size` and
    /// `max_samples`, falling back to `defaults`.
    pub fn from_config(config: &Config, defaults: Self) -> Result<Self, EngineError> {
        let learning_rate = match positive_float(config, "learning_rate")? {
            Some(lr) => Some(lr),
            None => positive_float(config, "lr")?,
        };

        Ok(Self {
            epochs: positive_int(config, "epochs")?.unwrap_or(defaults.epochs),
            learning_rate: learning_rate.unwrap_or(defaults.learning_rate),
            batch_size: positive_int(config, "batch_size")?.unwrap_or(defaults.batch_size),
            max_samples: positive_int(config, "max_samples")?.or(defaults.max_samples),
        })
    }
}

/// Options of an evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluateOptions {
    pub batch_size: usize,
    pub max_samples: Option<usize>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_samples: None,
        }
    }
}

impl EvaluateOptions {
    pub fn from_config(config: &Config, defaults: Self) -> Result<Self, EngineError> {
        Ok(Self {
            batch_size: positive_int(config, "batch_size")?.unwrap_or(defaults.batch_size),
            max_samples: positive_int(config, "max_samples")?.or(defaults.max_samples),
        })
    }
}

fn positive_int(config: &Config, key: &str) -> Result<Option<usize>, EngineError> {
    match config.get(key) {
        None => Ok(None),
        Some(Scalar::Int(v)) if *v >= 1 => Ok(usize::try_from(*v).ok()),
        Some(Scalar::Int(v)) => Err(EngineError::InvalidInput(format!(
            "{key} must be at least 1, got {v}"
        ))),
        Some(other) => Err(EngineError::InvalidInput(format!(
            "{key} must be an int, got {}",
            other.type_name()
        ))),
    }
}

fn positive_float(config: &Config, key: &str) -> Result<Option<f64>, EngineError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => match value.as_f64() {
            Some(v) if v.is_finite() && v > 0.0 => Ok(Some(v)),
            Some(v) => Err(EngineError::InvalidInput(format!(
                "{key} must be a positive number, got {v}"
            ))),
            None => Err(EngineError::InvalidInput(format!(
                "{key} must be a float, got {}",
                value.type_name()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, Scalar)]) -> Config {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn missing_keys_take_defaults() {
        let opts = FitOptions::from_config(&Config::new(), FitOptions::default()).unwrap();
        assert_eq!(opts, FitOptions::default());
    }

    #[test]
    fn recognized_keys_are_read() {
        let cfg = config(&[
            ("epochs", Scalar::Int(3)),
            ("lr", Scalar::Float(0.5)),
            ("batch_size", Scalar::Int(8)),
            ("max_samples", Scalar::Int(10)),
        ]);

        let opts = FitOptions::from_config(&cfg, FitOptions::default()).unwrap();
        assert_eq!(opts.epochs, 3);
        assert_eq!(opts.learning_rate, 0.5);
        assert_eq!(opts.batch_size, 8);
        assert_eq!(opts.max_samples, Some(10));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = config(&[
            ("server_round", Scalar::Int(12)),
            ("strategy", Scalar::Str("fedavg".into())),
        ]);

        assert!(FitOptions::from_config(&cfg, FitOptions::default()).is_ok());
        assert!(EvaluateOptions::from_config(&cfg, EvaluateOptions::default()).is_ok());
    }

    #[test]
    fn integer_learning_rate_is_accepted() {
        let cfg = config(&[("learning_rate", Scalar::Int(1))]);
        let opts = FitOptions::from_config(&cfg, FitOptions::default()).unwrap();
        assert_eq!(opts.learning_rate, 1.0);
    }

    #[test]
    fn mistyped_keys_are_rejected() {
        let cfg = config(&[("epochs", Scalar::Str("two".into()))]);
        assert!(matches!(
            FitOptions::from_config(&cfg, FitOptions::default()),
            Err(EngineError::InvalidInput(_))
        ));

        let cfg = config(&[("batch_size", Scalar::Int(0))]);
        assert!(EvaluateOptions::from_config(&cfg, EvaluateOptions::default()).is_err());

        let cfg = config(&[("lr", Scalar::Float(-1.0))]);
        assert!(FitOptions::from_config(&cfg, FitOptions::default()).is_err());
    }
}

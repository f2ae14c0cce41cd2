//! Value types exchanged between a client and the coordinator.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Options sent by the coordinator along with an instruction.
pub type Config = BTreeMap<String, Scalar>;

/// Values reported by the client along with a result.
pub type Metrics = BTreeMap<String, Scalar>;

/// Static descriptive values of a client.
pub type Properties = BTreeMap<String, Scalar>;

/// Metrics key present on every degenerate result, holding the error kind.
pub const ERROR_KEY: &str = "error";

/// Metrics key holding the human readable error of a degenerate result.
pub const ERROR_MESSAGE_KEY: &str = "error_message";

/// A single config, metrics or properties value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Bool(bool),
    Bytes(Vec<u8>),
    Float(#[serde(with = "nan_as_null")] f64),
    Int(i64),
    Str(String),
}

impl Scalar {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(f) => Some(*f),
            Scalar::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Bytes(_) => "bytes",
            Scalar::Float(_) => "float",
            Scalar::Int(_) => "int",
            Scalar::Str(_) => "str",
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Self::Float(value as f64)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Str(s) => write!(f, "{s}"),
        }
    }
}

/// JSON has no representation for non finite floats, they travel as `null`
/// and come back as NaN.
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Identifier of a client, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a random 64 bit identifier rendered as hex.
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialized model weights.
///
/// One opaque blob per tensor, in the order both sides agreed upon, plus the
/// tag naming the numeric encoding of the blobs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Parameters {
    pub tensors: Vec<Vec<u8>>,
    pub tensor_type: String,
}

impl Parameters {
    pub fn new(tensors: Vec<Vec<u8>>, tensor_type: impl Into<String>) -> Self {
        Self {
            tensors,
            tensor_type: tensor_type.into(),
        }
    }

    /// Parameters with no tensors, used by degenerate results.
    pub fn empty(tensor_type: impl Into<String>) -> Self {
        Self::new(Vec::new(), tensor_type)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total size of all blobs.
    pub fn num_bytes(&self) -> usize {
        self.tensors.iter().map(Vec::len).sum()
    }
}

/// Instruction to train on local data.
#[derive(Debug, Clone, PartialEq)]
pub struct FitIns {
    pub parameters: Parameters,
    pub config: Config,
}

/// Result of a local training pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRes {
    pub parameters: Parameters,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// Instruction to evaluate on local data.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateIns {
    pub parameters: Parameters,
    pub config: Config,
}

/// Result of a local evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetParametersIns {
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetParametersRes {
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetPropertiesIns {
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetPropertiesRes {
    pub properties: Properties,
}

/// Asks the client to drop the connection and come back after `seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectIns {
    pub seconds: u64,
}

/// Last reply of a client before it closes its side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRes {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_json_is_tagged() {
        let json = serde_json::to_string(&Scalar::Int(3)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":3}"#);

        let back: Scalar = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Scalar::Int(3));
    }

    #[test]
    fn non_finite_floats_come_back_as_nan() {
        let json = serde_json::to_string(&Scalar::Float(f64::INFINITY)).unwrap();
        let back: Scalar = serde_json::from_str(&json).unwrap();
        assert!(back.as_f64().unwrap().is_nan());
    }

    #[test]
    fn ints_widen_to_floats() {
        assert_eq!(Scalar::Int(2).as_f64(), Some(2.0));
        assert_eq!(Scalar::Float(2.0).as_i64(), None);
    }

    #[test]
    fn generated_ids_are_hex() {
        let id = ClientId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}

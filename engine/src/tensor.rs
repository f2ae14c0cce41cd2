use std::fmt;

use half::f16;

use crate::EngineError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
}

impl DType {
    /// The wire tag naming this encoding in `Parameters::tensor_type`.
    pub fn tag(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "f32" => Some(DType::F32),
            "f16" => Some(DType::F16),
            _ => None,
        }
    }

    /// Size in bytes of one element.
    pub fn size(self) -> usize {
        match self {
            DType::F32 => size_of::<f32>(),
            DType::F16 => size_of::<f16>(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Row-major tensor elements.
///
/// Equality is bitwise, so two tensors holding the same NaN payload are equal
/// and `0.0` differs from `-0.0`.
#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F16(_) => DType::F16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::F32(v) => bytemuck::cast_slice(v),
            TensorData::F16(v) => bytemuck::cast_slice(v),
        }
    }
}

impl PartialEq for TensorData {
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype() && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for TensorData {}

/// One named layer of a model, without the name: position identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, EngineError> {
        let expected = numel(&shape);
        if data.len() != expected {
            return Err(EngineError::ShapeMismatch {
                what: "tensor data",
                got: data.len(),
                expected,
            });
        }

        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, EngineError> {
        Self::new(shape, TensorData::F32(data))
    }

    pub fn from_f16(shape: Vec<usize>, data: Vec<f16>) -> Result<Self, EngineError> {
        Self::new(shape, TensorData::F16(data))
    }

    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let n = numel(&shape);
        let data = match dtype {
            DType::F32 => TensorData::F32(vec![0.0; n]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; n]),
        };

        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The elements widened to `f32`.
    pub fn to_f32(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    /// Replaces the elements with `values`, narrowing to the tensor's dtype.
    pub fn assign_f32(&mut self, values: &[f32]) -> Result<(), EngineError> {
        if values.len() != self.numel() {
            return Err(EngineError::ShapeMismatch {
                what: "assigned values",
                got: values.len(),
                expected: self.numel(),
            });
        }

        match &mut self.data {
            TensorData::F32(v) => v.copy_from_slice(values),
            TensorData::F16(v) => {
                for (dst, src) in v.iter_mut().zip(values) {
                    *dst = f16::from_f32(*src);
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// The full local model: tensors in the order agreed with the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelState {
    tensors: Vec<Tensor>,
}

impl ModelState {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// A state of zeroed tensors following `layout`.
    pub fn zeros(layout: &[Vec<usize>], dtype: DType) -> Self {
        Self::new(
            layout
                .iter()
                .map(|shape| Tensor::zeros(shape.clone(), dtype))
                .collect(),
        )
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    pub fn into_tensors(self) -> Vec<Tensor> {
        self.tensors
    }

    /// The ordered shapes of the tensors.
    pub fn layout(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

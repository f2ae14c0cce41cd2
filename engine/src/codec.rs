use bytemuck::Pod;
use comms::typing::Parameters;
use half::f16;

use crate::{
    DType, FormatError, ModelState, Tensor, TensorData,
    tensor::numel,
};

/// Converts a `ModelState` into wire `Parameters` and back.
///
/// The codec knows the local model's layout, the ordered tensor shapes, and the
/// element type. Blobs hold the raw little-endian elements with no header, the
/// shape of blob `i` is `layout[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCodec {
    layout: Vec<Vec<usize>>,
    dtype: DType,
}

impl ParameterCodec {
    pub fn new(layout: Vec<Vec<usize>>, dtype: DType) -> Self {
        Self { layout, dtype }
    }

    /// A codec whose layout is that of `state`, `F32` for an empty state.
    pub fn for_state(state: &ModelState) -> Self {
        let dtype = state
            .tensors()
            .first()
            .map(Tensor::dtype)
            .unwrap_or(DType::F32);

        Self::new(state.layout(), dtype)
    }

    pub fn layout(&self) -> &[Vec<usize>] {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The `tensor_type` of every `Parameters` this codec produces.
    pub fn tag(&self) -> &'static str {
        self.dtype.tag()
    }

    /// Serializes `state`.
    ///
    /// # Errors
    /// A `FormatError` if `state` does not follow the codec's layout or dtype.
    pub fn encode(&self, state: &ModelState) -> Result<Parameters, FormatError> {
        self.check_count(state.len())?;

        let tensors = state
            .tensors()
            .iter()
            .zip(&self.layout)
            .enumerate()
            .map(|(index, (tensor, shape))| {
                if tensor.shape() != shape.as_slice() {
                    return Err(FormatError::ShapeMismatch {
                        index,
                        expected: shape.clone(),
                        got: tensor.shape().to_vec(),
                    });
                }

                match tensor.data() {
                    TensorData::F32(v) if self.dtype == DType::F32 => Ok(to_le_blob(v)),
                    TensorData::F16(v) if self.dtype == DType::F16 => Ok(to_le_blob(v)),
                    other => Err(FormatError::DTypeMismatch {
                        index,
                        expected: self.dtype,
                        got: other.dtype(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Parameters::new(tensors, self.tag()))
    }

    /// Rebuilds a model state from `params`.
    ///
    /// # Errors
    /// A `FormatError` if the tag, the blob count or any blob size is not the
    /// one the local model expects.
    pub fn decode(&self, params: &Parameters) -> Result<ModelState, FormatError> {
        if params.tensor_type != self.tag() {
            return Err(FormatError::TagMismatch {
                expected: self.tag(),
                got: params.tensor_type.clone(),
            });
        }

        self.check_count(params.tensors.len())?;

        let tensors = params
            .tensors
            .iter()
            .zip(&self.layout)
            .enumerate()
            .map(|(index, (blob, shape))| {
                let expected = numel(shape) * self.dtype.size();
                if blob.len() != expected {
                    return Err(FormatError::BlobSizeMismatch {
                        index,
                        expected,
                        got: blob.len(),
                    });
                }

                let data = match self.dtype {
                    DType::F32 => TensorData::F32(from_le_blob::<f32>(blob)),
                    DType::F16 => TensorData::F16(from_le_blob::<f16>(blob)),
                };

                Tensor::new(shape.clone(), data).map_err(|_| FormatError::BlobSizeMismatch {
                    index,
                    expected,
                    got: blob.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ModelState::new(tensors))
    }

    fn check_count(&self, got: usize) -> Result<(), FormatError> {
        if got != self.layout.len() {
            return Err(FormatError::TensorCountMismatch {
                expected: self.layout.len(),
                got,
            });
        }
        Ok(())
    }
}

fn to_le_blob<T: Pod>(data: &[T]) -> Vec<u8> {
    let mut blob = bytemuck::cast_slice::<T, u8>(data).to_vec();
    if cfg!(target_endian = "big") {
        for elem in blob.chunks_exact_mut(size_of::<T>()) {
            elem.reverse();
        }
    }
    blob
}

/// `blob.len()` must be a multiple of `size_of::<T>()`.
fn from_le_blob<T: Pod>(blob: &[u8]) -> Vec<T> {
    let mut data: Vec<T> = bytemuck::pod_collect_to_vec(blob);
    if cfg!(target_endian = "big") {
        for elem in bytemuck::cast_slice_mut::<T, u8>(&mut data).chunks_exact_mut(size_of::<T>()) {
            elem.reverse();
        }
    }
    data
}

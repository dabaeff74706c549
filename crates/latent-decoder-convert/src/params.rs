//! Named parameter tensors
//!
//! A [`ParamStore`] is the in-memory mapping from layer identifier to
//! parameter values that the decoder loader consumes. Producing it from a
//! file is left to the caller.

use std::collections::BTreeMap;

use burn::prelude::*;
use thiserror::Error;

use latent_decoder_core::error::DecoderError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid tensor data for {tensor}: {reason}")]
    InvalidData { tensor: String, reason: String },

    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

/// Host-side parameter values in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    /// Fails when `values` does not hold exactly `shape.product()` elements
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, LoadError> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(LoadError::InvalidData {
                tensor: format!("{shape:?}"),
                reason: format!("{} values for {numel} elements", values.len()),
            });
        }
        Ok(Self { shape, values })
    }

    /// Copies a tensor to the host as f32
    pub fn from_tensor<B: Backend, const D: usize>(
        name: &str,
        tensor: Tensor<B, D>,
    ) -> Result<Self, LoadError> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| LoadError::InvalidData {
                tensor: name.to_string(),
                reason: format!("{e:?}"),
            })?;
        Ok(Self { shape, values })
    }

    pub fn numel(&self) -> usize {
        self.values.len()
    }
}

/// Parameter tensors keyed by name, e.g. `layers.2.conv_1.weight`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    tensors: BTreeMap<String, ParamTensor>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ParamTensor) -> Option<ParamTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&ParamTensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamTensor> {
        self.tensors.remove(name)
    }

    /// Tensor names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(ParamTensor::numel).sum()
    }

    /// Loads `name` onto `device`, checking it has exactly the `expected` shape
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let entry = self
            .get(name)
            .ok_or_else(|| LoadError::MissingTensor(name.to_string()))?;

        if entry.shape != expected {
            return Err(LoadError::ShapeMismatch {
                tensor: name.to_string(),
                expected: expected.to_vec(),
                actual: entry.shape.clone(),
            });
        }

        Ok(Tensor::from_data(
            TensorData::new(entry.values.clone(), expected),
            device,
        ))
    }

    /// Stores a copy of `tensor` under `name`
    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<(), LoadError> {
        let name = name.into();
        let param = ParamTensor::from_tensor(&name, tensor)?;
        self.tensors.insert(name, param);
        Ok(())
    }
}

impl FromIterator<(String, ParamTensor)> for ParamStore {
    fn from_iter<I: IntoIterator<Item = (String, ParamTensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_param_tensor_rejects_wrong_length() {
        assert!(ParamTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            ParamTensor::new(vec![2, 3], vec![0.0; 5]),
            Err(LoadError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_tensor_round_trip() {
        let device = Default::default();
        let mut store = ParamStore::new();

        let t = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], &device);
        store.insert_tensor("a.weight", t).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.num_params(), 6);

        let loaded: Tensor<TestBackend, 2> = store.tensor("a.weight", [2, 3], &device).unwrap();
        let values: Vec<f32> = loaded.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_tensor_errors() {
        let device = Default::default();
        let mut store = ParamStore::new();
        store.insert("b", ParamTensor::new(vec![4], vec![0.0; 4]).unwrap());

        let missing = store.tensor::<TestBackend, 1>("c", [4], &device);
        assert!(matches!(missing, Err(LoadError::MissingTensor(name)) if name == "c"));

        let wrong = store.tensor::<TestBackend, 1>("b", [8], &device);
        assert!(matches!(
            wrong,
            Err(LoadError::ShapeMismatch { ref expected, ref actual, .. })
                if expected == &vec![8] && actual == &vec![4]
        ));

        let wrong_rank = store.tensor::<TestBackend, 2>("b", [2, 2], &device);
        assert!(matches!(wrong_rank, Err(LoadError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_names_are_sorted() {
        let store: ParamStore = [
            ("z".to_string(), ParamTensor::new(vec![1], vec![0.0]).unwrap()),
            ("a".to_string(), ParamTensor::new(vec![1], vec![1.0]).unwrap()),
        ]
        .into_iter()
        .collect();
        assert_eq!(store.names().collect::<Vec<_>>(), vec!["a", "z"]);
    }
}

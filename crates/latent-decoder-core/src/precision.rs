//! Precision configuration for inference
//!
//! Supports running the decoder and its helpers in different precision modes:
//! - fp32: Full precision (default)
//! - fp16: Half precision (faster, less memory)
//! - bf16: Brain floating point (good balance)
//!
//! # Note on Burn's precision model
//!
//! In Burn, the default float precision is determined at **compile time** by
//! the backend type (`NdArray<f32>`, `Wgpu<half::f16>`, ...). [`PrecisionMode`]
//! is used to request a dtype for freshly computed tensors (see
//! [`PrecisionMode::cast`]). The ndarray backend stores floats as f32/f64
//! only, so 16-bit requests fail there with
//! [`DecoderError::UnsupportedPrecision`] instead of reaching the backend.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::DType;

use crate::error::DecoderError;

/// Precision mode for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionMode {
    /// Full 32-bit precision (default)
    #[default]
    Fp32,
    /// 16-bit half precision
    Fp16,
    /// 16-bit brain floating point
    Bf16,
}

impl PrecisionMode {
    const NAMES: &'static [&'static str] = &["fp32", "fp16", "bf16"];

    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Bf16 => "bf16",
        }
    }

    /// Burn dtype for this precision
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionMode::Fp32 => DType::F32,
            PrecisionMode::Fp16 => DType::F16,
            PrecisionMode::Bf16 => DType::BF16,
        }
    }

    /// Memory footprint relative to fp32
    pub fn memory_savings(&self) -> f32 {
        match self {
            PrecisionMode::Fp32 => 1.0,
            PrecisionMode::Fp16 | PrecisionMode::Bf16 => 0.5,
        }
    }

    /// Whether backend `B` can hold float tensors of this precision
    pub fn is_supported<B: Backend>(&self, device: &B::Device) -> bool {
        match self {
            PrecisionMode::Fp32 => true,
            // burn-ndarray has no half-precision float storage
            PrecisionMode::Fp16 | PrecisionMode::Bf16 => !B::name(device).starts_with("ndarray"),
        }
    }

    /// Casts a float tensor to this precision (no-op when it already matches)
    pub fn cast<B: Backend, const D: usize>(
        &self,
        x: Tensor<B, D>,
    ) -> Result<Tensor<B, D>, DecoderError> {
        let dtype = self.dtype();
        if x.dtype() == dtype {
            return Ok(x);
        }

        let device = x.device();
        if !self.is_supported::<B>(&device) {
            return Err(DecoderError::UnsupportedPrecision {
                precision: self.name(),
                backend: B::name(&device),
            });
        }
        Ok(x.cast(dtype))
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PrecisionMode {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" => Ok(PrecisionMode::Fp32),
            "fp16" | "f16" => Ok(PrecisionMode::Fp16),
            "bf16" => Ok(PrecisionMode::Bf16),
            _ => Err(DecoderError::InvalidEnum {
                kind: "precision",
                value: s.to_string(),
                expected: Self::NAMES,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_precision_mode_default() {
        assert_eq!(PrecisionMode::default(), PrecisionMode::Fp32);
        assert_eq!(PrecisionMode::default().dtype(), DType::F32);
    }

    #[test]
    fn test_parse() {
        assert_eq!("fp16".parse::<PrecisionMode>().unwrap(), PrecisionMode::Fp16);
        assert_eq!("F32".parse::<PrecisionMode>().unwrap(), PrecisionMode::Fp32);
        assert_eq!("bf16".parse::<PrecisionMode>().unwrap(), PrecisionMode::Bf16);

        let err = "fp8".parse::<PrecisionMode>().unwrap_err();
        assert!(matches!(err, DecoderError::InvalidEnum { kind: "precision", .. }));
    }

    #[test]
    fn test_memory_savings() {
        assert_eq!(PrecisionMode::Fp32.memory_savings(), 1.0);
        assert_eq!(PrecisionMode::Fp16.memory_savings(), 0.5);
    }

    #[test]
    fn test_cast_same_precision_is_identity() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.5, -2.0], &device);
        let y = PrecisionMode::Fp32.cast(x).unwrap();
        assert_eq!(y.dtype(), DType::F32);
        assert_eq!(y.into_data().to_vec::<f32>().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_half_precision_rejected_on_ndarray() {
        let device = Default::default();
        assert!(PrecisionMode::Fp32.is_supported::<TestBackend>(&device));

        for precision in [PrecisionMode::Fp16, PrecisionMode::Bf16] {
            assert!(!precision.is_supported::<TestBackend>(&device));

            let x = Tensor::<TestBackend, 1>::from_floats([1.5, -2.0], &device);
            let err = precision.cast(x).unwrap_err();
            assert!(matches!(
                err,
                DecoderError::UnsupportedPrecision { precision: name, ref backend }
                    if name == precision.name() && backend == "ndarray"
            ));
        }
    }
}

use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// SiLU (Sigmoid Linear Unit) activation: x * sigmoid(x)
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().mul(sigmoid(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_silu_values() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, -1.0, 20.0], &device);
        let y: Vec<f32> = silu(x).into_data().to_vec().unwrap();

        assert_eq!(y[0], 0.0);
        assert!((y[1] - 0.731_058_6).abs() < 1e-6);
        assert!((y[2] + 0.268_941_4).abs() < 1e-6);
        // Saturates to identity for large inputs
        assert!((y[3] - 20.0).abs() < 1e-4);
    }
}

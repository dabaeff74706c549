//! Backend support for the latent decoder
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (no GPU required)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//!
//! # Example
//!
//! ```toml
//! [dependencies]
//! latent-decoder = { version = "0.1", features = ["wgpu"] }
//! ```
//!
//! ```ignore
//! use latent_decoder::backends::{Wgpu, WgpuDevice};
//! use latent_decoder::{Decoder, DecoderConfig};
//!
//! let device = WgpuDevice::default();
//! let decoder = Decoder::<Wgpu>::new(&DecoderConfig::sd1x(), &device)?;
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Type alias for the default backend when using ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

/// Type alias for the default backend when using wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Name of the backend [`DefaultBackend`] resolves to
#[cfg(feature = "ndarray")]
pub const DEFAULT_BACKEND_NAME: &str = "ndarray (CPU)";

/// Name of the backend [`DefaultBackend`] resolves to
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub const DEFAULT_BACKEND_NAME: &str = "wgpu (WebGPU)";

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Backends compiled into this build, in preference order
pub fn enabled_backends() -> Vec<&'static str> {
    let mut backends = Vec::new();
    if cfg!(feature = "ndarray") {
        backends.push("ndarray");
    }
    if cfg!(feature = "wgpu") {
        backends.push("wgpu");
    }
    backends
}

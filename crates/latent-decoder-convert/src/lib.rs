//! Decoder Weight Mapping
//!
//! This crate maps decoder parameters to and from a flat, named tensor store
//! using the reference network's layer names (`layers.{i}.conv_1.weight`, ...).
//!
//! ```ignore
//! use latent_decoder_convert::{ParamStore, load_decoder};
//!
//! let store: ParamStore = read_weights()?;
//! let decoder = load_decoder::<Backend>(&store, &DecoderConfig::sd1x(), &device)?;
//! ```
//!
//! Reading a weight file into a [`ParamStore`] is up to the caller.

pub mod decoder_loader;
pub mod params;

pub use decoder_loader::{export_decoder, layer_indices, load_decoder, stage_prefixes};
pub use params::{LoadError, ParamStore, ParamTensor};

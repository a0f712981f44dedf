use crate::errors::Result;
use ndarray::prelude::*;

/// Abstraction over the saliency network so the pipeline can run against
/// the ONNX session or a test double.
pub trait SaliencyModel: Send + Sync {
    /// Spatial size of the network's square input.
    fn input_size(&self) -> u32;

    /// Forward pass over a (batch, 4, H, W) tensor. Returns the
    /// finest-resolution decoder output as (batch, 1, H, W) probabilities.
    fn predict(&self, tensor: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

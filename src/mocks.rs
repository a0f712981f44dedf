use ndarray::prelude::*;

use crate::errors::Result;
use crate::traits::SaliencyModel;

/// Test double for the saliency network: echoes the prior channel as the
/// predicted mask, so tests can reason about output values without an
/// ONNX file.
#[derive(Debug, Clone)]
pub struct MockSaliencyModel {
    pub input_size: u32,
}

impl MockSaliencyModel {
    pub const fn new(input_size: u32) -> Self {
        Self { input_size }
    }
}

impl SaliencyModel for MockSaliencyModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, tensor: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let shape = tensor.shape();
        if shape[1] >= 4 {
            Ok(tensor.slice(s![.., 3..4, .., ..]).to_owned())
        } else {
            Ok(Array4::<f32>::zeros((shape[0], 1, shape[2], shape[3])))
        }
    }
}

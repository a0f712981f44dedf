use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

use crate::errors::{Result, SalObjError};
use crate::traits::SaliencyModel;

/// Input channels the network consumes: RGB plus the prior mask.
const INPUT_CHANNELS: i64 = 4;
/// Decoder side outputs per forward pass; the first is the finest.
const DECODER_OUTPUTS: usize = 7;

/// ONNX session wrapper for the U2NET / U2NETP export. Device placement is
/// chosen once at construction and held for the run.
pub struct U2NetSession {
    input_size: u32,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl U2NetSession {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| SalObjError::Model {
                operation: "session builder initialization".to_string(),
                source: Box::new(e),
            })?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| SalObjError::Model {
                operation: "execution provider setup".to_string(),
                source: Box::new(e),
            })?
            .with_memory_pattern(true)
            .map_err(|e| SalObjError::Model {
                operation: "memory pattern setup".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| SalObjError::Model {
                operation: format!("model file load: {}", model_path.display()),
                source: Box::new(e),
            })?;

        let (channels, input_size) = {
            let shape = session.inputs[0]
                .input_type
                .tensor_shape()
                .ok_or_else(|| SalObjError::Model {
                    operation: "model input shape query".to_string(),
                    source: Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "tensor shape unavailable",
                    )),
                })?;
            (shape[1], shape[2])
        };
        if channels != INPUT_CHANNELS {
            return Err(SalObjError::Validation {
                field: "model input".to_string(),
                reason: format!("expected {} channels, model takes {}", INPUT_CHANNELS, channels),
            });
        }
        if input_size <= 0 {
            return Err(SalObjError::Validation {
                field: "model input".to_string(),
                reason: "dynamic spatial size is not supported".to_string(),
            });
        }
        if session.outputs.len() != DECODER_OUTPUTS {
            return Err(SalObjError::Validation {
                field: "model outputs".to_string(),
                reason: format!(
                    "expected {} decoder outputs, model has {}",
                    DECODER_OUTPUTS,
                    session.outputs.len()
                ),
            });
        }

        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        let input_size = input_size as u32;

        // initialize model
        let data = Array4::<f32>::zeros((
            1,
            INPUT_CHANNELS as usize,
            input_size as usize,
            input_size as usize,
        ));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data).map_err(|e| SalObjError::Model {
                operation: "warm-up tensor creation".to_string(),
                source: Box::new(e),
            })?])
            .map_err(|e| SalObjError::Model {
                operation: "warm-up run".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            input_size,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }
}

impl SaliencyModel for U2NetSession {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn predict(&self, tensor: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

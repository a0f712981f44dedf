pub mod augment;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod model;
pub mod sample;
pub mod stages;
pub mod traits;
pub mod warp;

pub mod mocks;

use std::fs;
use std::path::PathBuf;

use image::{GrayImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;

pub use config::Config;
pub use errors::{Result, SalObjError};
pub use model::U2NetSession;
pub use traits::SaliencyModel;

use dataset::{collect_image_files, DataLoader, SalObjDataset};
use stages::{AugmentPrior, Compose, Rescale, TensorConversion};

/// Drives the whole pipeline: dataset over image/label/prior directories,
/// the fixed inference stage chain (augment-prior → rescale → lab tensor
/// conversion), a sequential batch loader, the network, and the mask
/// writes. Any read, inference or write error aborts the run.
pub struct InferenceRunner<M: SaliencyModel> {
    model: M,
    config: Config,
}

impl<M: SaliencyModel> InferenceRunner<M> {
    pub const fn new(model: M, config: Config) -> Self {
        Self { model, config }
    }

    pub fn run(&self) -> Result<()> {
        let input_path = &self.config.image_dir;
        if !input_path.exists() {
            return Err(SalObjError::FileSystem {
                path: input_path.clone(),
                operation: "input directory check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(&self.config.output_dir).map_err(|e| SalObjError::FileSystem {
            path: self.config.output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let images = collect_image_files(input_path)?;
        if images.is_empty() {
            println!("no input images found");
            return Ok(());
        }

        let labels = match &self.config.label_dir {
            Some(dir) => collect_image_files(dir)?,
            None => Vec::new(),
        };
        let priors = match &self.config.prior_dir {
            Some(dir) => collect_image_files(dir)?,
            None => Vec::new(),
        };

        let size = self.model.input_size();
        let transform = Compose::new(vec![
            Box::new(AugmentPrior::new(self.config.prior_prob)),
            Box::new(Rescale::square(size)),
        ]);
        let dataset =
            SalObjDataset::new(images, labels, priors, transform, TensorConversion::Lab)?;

        let pb = ProgressBar::new(dataset.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );

        for batch in DataLoader::new(&dataset, self.config.batch_size) {
            let batch = batch?;
            let masks = self.model.predict(batch.images.view())?;

            for (slot, &index) in batch.indices.iter().enumerate() {
                self.write_mask(&dataset, index, masks.slice(s![slot, 0, .., ..]))?;
                if self.config.dump_inputs {
                    self.write_input(&dataset, index, batch.images.slice(s![slot, .., .., ..]))?;
                }
                pb.inc(1);
            }
        }

        pb.finish_with_message("inference complete");
        Ok(())
    }

    /// Output file for one dataset index: the source image's stem, the
    /// configured format extension, and an optional suffix before it.
    fn output_path(
        &self,
        dataset: &SalObjDataset,
        index: usize,
        suffix: Option<&str>,
    ) -> Result<PathBuf> {
        let source = dataset
            .image_path(index)
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .ok_or_else(|| SalObjError::Validation {
                field: "output name".to_string(),
                reason: format!("no usable stem for dataset index {}", index),
            })?;
        let name = match suffix {
            Some(sfx) => format!("{}_{}.{}", source, sfx, self.config.format),
            None => format!("{}.{}", source, self.config.format),
        };
        Ok(self.config.output_dir.join(name))
    }

    fn write_mask(
        &self,
        dataset: &SalObjDataset,
        index: usize,
        mask: ArrayView2<'_, f32>,
    ) -> Result<()> {
        let (h, w) = mask.dim();
        // the network emits probabilities; scale by 255 for the 8-bit file
        let raw: Vec<u8> = mask
            .iter()
            .map(|&v| (v * 255.0).clamp(0.0, 255.0) as u8)
            .collect();
        let image =
            GrayImage::from_raw(w as u32, h as u32, raw).ok_or_else(|| SalObjError::Validation {
                field: "mask".to_string(),
                reason: format!("prediction buffer does not fit {}x{}", w, h),
            })?;

        let path = self.output_path(dataset, index, None)?;
        image.save(&path).map_err(|e| SalObjError::ImageProcessing {
            path: path.display().to_string(),
            operation: "mask write".to_string(),
            source: Box::new(e),
        })?;
        Ok(())
    }

    /// Rescales the first three input channels by 255 and writes them back
    /// as an RGB image for inspection.
    fn write_input(
        &self,
        dataset: &SalObjDataset,
        index: usize,
        input: ArrayView3<'_, f32>,
    ) -> Result<()> {
        let (_, h, w) = input.dim();
        let mut raw = Vec::with_capacity(h * w * 3);
        for y in 0..h {
            for x in 0..w {
                for channel in 0..3 {
                    raw.push((input[[channel, y, x]] * 255.0).clamp(0.0, 255.0) as u8);
                }
            }
        }
        let image =
            RgbImage::from_raw(w as u32, h as u32, raw).ok_or_else(|| SalObjError::Validation {
                field: "input dump".to_string(),
                reason: format!("input buffer does not fit {}x{}", w, h),
            })?;

        let path = self.output_path(dataset, index, Some("input"))?;
        image.save(&path).map_err(|e| SalObjError::ImageProcessing {
            path: path.display().to_string(),
            operation: "input dump write".to_string(),
            source: Box::new(e),
        })?;
        Ok(())
    }
}

impl InferenceRunner<U2NetSession> {
    /// Wires the ONNX model from the configuration.
    pub fn with_onnx_model(config: Config) -> Result<Self> {
        let model = U2NetSession::new(&config.model_path, config.device_id)?;
        Ok(Self::new(model, config))
    }
}

use anyhow::{ensure, Context, Result};
use clap::Parser;

use salobj_seg_rs::{Config, InferenceRunner};

fn main() -> Result<()> {
    let config = Config::parse();

    ensure!(config.model_path.exists(), "Model path does not exist");
    ensure!(config.image_dir.exists(), "Image directory does not exist");
    if let Some(dir) = &config.label_dir {
        ensure!(dir.exists(), "Label directory does not exist");
    }
    if let Some(dir) = &config.prior_dir {
        ensure!(dir.exists(), "Prior directory does not exist");
    }
    ensure!(
        (0.0..=1.0).contains(&config.prior_prob),
        "Prior probability must lie in [0, 1]"
    );

    let runner = InferenceRunner::with_onnx_model(config)
        .context("Failed to initialize the segmentation model")?;
    runner.run().context("Inference run failed")
}

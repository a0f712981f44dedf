use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use tempfile::TempDir;

use salobj_seg_rs::dataset::SalObjDataset;
use salobj_seg_rs::mocks::MockSaliencyModel;
use salobj_seg_rs::stages::{Compose, Rescale, TensorConversion};
use salobj_seg_rs::{Config, InferenceRunner, Result};

/// Three 4×4 RGB images differing in a single pixel, with all-255 labels
/// and all-128 priors, laid out as images/ labels/ priors/ under one root.
fn write_test_triples(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let image_dir = root.join("images");
    let label_dir = root.join("labels");
    let prior_dir = root.join("priors");
    for dir in [&image_dir, &label_dir, &prior_dir] {
        std::fs::create_dir_all(dir).unwrap();
    }

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let mut image = RgbImage::from_fn(4, 4, |x, y| {
            Rgb([(x * 60) as u8, (y * 60) as u8, 120])
        });
        image.put_pixel(i as u32, i as u32, Rgb([255, 0, 0]));
        image.save(image_dir.join(format!("{}.png", name))).unwrap();

        GrayImage::from_pixel(4, 4, Luma([255]))
            .save(label_dir.join(format!("{}.png", name)))
            .unwrap();
        GrayImage::from_pixel(4, 4, Luma([128]))
            .save(prior_dir.join(format!("{}.png", name)))
            .unwrap();
    }
    (image_dir, label_dir, prior_dir)
}

fn list(dir: &Path) -> Vec<PathBuf> {
    salobj_seg_rs::dataset::collect_image_files(dir).unwrap()
}

fn test_config(image_dir: PathBuf, output_dir: PathBuf) -> Config {
    Config {
        image_dir,
        output_dir,
        model_path: "unused.onnx".into(),
        label_dir: None,
        prior_dir: None,
        format: "png".to_string(),
        device_id: 0,
        batch_size: 1,
        prior_prob: 1.0,
        dump_inputs: false,
    }
}

#[test]
fn end_to_end_tensor_assembly() -> Result<()> {
    let root = TempDir::new()?;
    let (image_dir, label_dir, prior_dir) = write_test_triples(root.path());

    let dataset = SalObjDataset::new(
        list(&image_dir),
        list(&label_dir),
        list(&prior_dir),
        Compose::new(vec![Box::new(Rescale::square(2))]),
        TensorConversion::Lab,
    )?;
    assert_eq!(dataset.len(), 3);

    for index in 0..dataset.len() {
        let tensors = dataset.get(index)?;
        assert_eq!(tensors.index, index);
        assert_eq!(tensors.image.dim(), (4, 2, 2));
        assert_eq!(tensors.label.dim(), (1, 2, 2));

        for channel in 0..3 {
            for &v in tensors.image.index_axis(Axis(0), channel).iter() {
                assert!((0.0..=1.0).contains(&v), "rgb channel escaped [0,1]: {}", v);
            }
        }
        // a uniform label normalizes to exactly 1.0
        for &v in tensors.label.iter() {
            assert!((v - 1.0).abs() < 1e-5);
        }
        // a uniform prior max-normalizes to 1.0 as well
        for &v in tensors.image.index_axis(Axis(0), 3).iter() {
            assert!((v - 1.0).abs() < 1e-5);
        }
    }
    Ok(())
}

#[test]
fn prior_channel_scales_relative_to_its_max() -> Result<()> {
    let root = TempDir::new()?;
    let (image_dir, label_dir, prior_dir) = write_test_triples(root.path());

    // one saturated pixel makes the 128 body land near 0.5 after
    // max-normalization
    let mut prior = GrayImage::from_pixel(4, 4, Luma([128]));
    prior.put_pixel(0, 0, Luma([255]));
    prior.save(prior_dir.join("a.png")).unwrap();

    let dataset = SalObjDataset::new(
        list(&image_dir),
        list(&label_dir),
        list(&prior_dir),
        Compose::default(),
        TensorConversion::Lab,
    )?;
    let tensors = dataset.get(0)?;
    assert!((tensors.image[[3, 0, 0]] - 1.0).abs() < 1e-5);
    assert!((tensors.image[[3, 3, 3]] - 128.0 / 255.0).abs() < 1e-3);
    Ok(())
}

#[test]
fn runner_writes_one_mask_per_input_named_by_stem() -> Result<()> {
    let root = TempDir::new()?;
    let (image_dir, label_dir, prior_dir) = write_test_triples(root.path());
    let output_dir = root.path().join("out");

    let mut config = test_config(image_dir, output_dir.clone());
    config.label_dir = Some(label_dir);
    config.prior_dir = Some(prior_dir);
    config.dump_inputs = true;

    let runner = InferenceRunner::new(MockSaliencyModel::new(4), config);
    runner.run()?;

    for name in ["a", "b", "c"] {
        let mask_path = output_dir.join(format!("{}.png", name));
        assert!(mask_path.exists(), "missing mask for {}", name);

        let mask = image::open(&mask_path)?.to_luma8();
        assert_eq!(mask.dimensions(), (4, 4));
        // the mock echoes the max-normalized prior, so the interior is white
        assert_eq!(mask.get_pixel(2, 2), &Luma([255]));

        assert!(output_dir.join(format!("{}_input.png", name)).exists());
    }
    Ok(())
}

#[test]
fn runner_zero_fills_missing_prior_and_label_sets() -> Result<()> {
    let root = TempDir::new()?;
    let (image_dir, _, _) = write_test_triples(root.path());
    let output_dir = root.path().join("out");

    let mut config = test_config(image_dir, output_dir.clone());
    config.batch_size = 2;

    let runner = InferenceRunner::new(MockSaliencyModel::new(4), config);
    runner.run()?;

    for name in ["a", "b", "c"] {
        let mask = image::open(output_dir.join(format!("{}.png", name)))?.to_luma8();
        assert!(mask.pixels().all(|p| p.0[0] == 0), "zero prior must yield a black mask");
    }
    Ok(())
}

#[test]
fn runner_with_empty_input_directory_is_a_no_op() -> Result<()> {
    let root = TempDir::new()?;
    let image_dir = root.path().join("empty");
    std::fs::create_dir_all(&image_dir)?;
    let output_dir = root.path().join("out");

    let runner = InferenceRunner::new(MockSaliencyModel::new(4), test_config(image_dir, output_dir.clone()));
    runner.run()?;
    assert!(std::fs::read_dir(&output_dir)?.next().is_none());
    Ok(())
}

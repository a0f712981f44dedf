//! Dataset over image/label/prior triples and the sequential batch loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use ndarray::prelude::*;
use walkdir::WalkDir;

use crate::errors::{Result, SalObjError};
use crate::sample::{image_to_array, Sample, SampleTensors};
use crate::stages::{Compose, TensorConversion};

/// Recursively collects the readable image files under `dir`, sorted by
/// path so dataset indices are stable across runs.
pub fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(SalObjError::FileSystem {
            path: dir.to_path_buf(),
            operation: "directory listing".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        });
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| ImageFormat::from_path(e.path()).is_ok())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

fn stem_of(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .ok_or_else(|| SalObjError::Validation {
            field: "file name".to_string(),
            reason: format!("{} has no usable stem", path.display()),
        })
}

fn stem_index(paths: &[PathBuf], role: &str) -> Result<HashMap<String, PathBuf>> {
    let mut map = HashMap::with_capacity(paths.len());
    for path in paths {
        if map.insert(stem_of(path)?, path.clone()).is_some() {
            return Err(SalObjError::Validation {
                field: format!("{} files", role),
                reason: format!("duplicate stem for {}", path.display()),
            });
        }
    }
    Ok(map)
}

fn open_array(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path).map_err(|e| SalObjError::ImageProcessing {
        path: path.display().to_string(),
        operation: "image read".to_string(),
        source: Box::new(e),
    })?;
    Ok(image_to_array(&img))
}

/// Reads a mask file and reduces it to its first channel regardless of the
/// source channel count.
fn open_mask(path: &Path) -> Result<Array3<u8>> {
    let arr = open_array(path)?;
    Ok(arr.slice(s![.., .., 0..1]).to_owned())
}

struct Entry {
    image: PathBuf,
    label: Option<PathBuf>,
    prior: Option<PathBuf>,
}

/// Lazily materializes samples from parallel image/label/prior file sets.
///
/// Triples are paired by shared file stem: the image list defines the index
/// order, and each non-empty label/prior set must cover every image stem.
/// Empty label or prior sets are replaced by zero masks of the image's
/// spatial shape.
pub struct SalObjDataset {
    entries: Vec<Entry>,
    transform: Compose,
    tensorize: TensorConversion,
}

impl SalObjDataset {
    pub fn new(
        mut images: Vec<PathBuf>,
        labels: Vec<PathBuf>,
        priors: Vec<PathBuf>,
        transform: Compose,
        tensorize: TensorConversion,
    ) -> Result<Self> {
        images.sort();
        let label_index = if labels.is_empty() {
            None
        } else {
            Some(stem_index(&labels, "label")?)
        };
        let prior_index = if priors.is_empty() {
            None
        } else {
            Some(stem_index(&priors, "prior")?)
        };

        let mut entries = Vec::with_capacity(images.len());
        for image in images {
            let stem = stem_of(&image)?;
            let label = lookup(label_index.as_ref(), &stem, "label")?;
            let prior = lookup(prior_index.as_ref(), &stem, "prior")?;
            entries.push(Entry {
                image,
                label,
                prior,
            });
        }

        Ok(Self {
            entries,
            transform,
            tensorize,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn image_path(&self, index: usize) -> Option<&Path> {
        self.entries.get(index).map(|e| e.image.as_path())
    }

    /// Reads the triple at `index`, normalizes array shapes and runs the
    /// configured stage chain.
    pub fn sample(&self, index: usize) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or_else(|| SalObjError::Validation {
            field: "dataset index".to_string(),
            reason: format!("{} out of range (len {})", index, self.entries.len()),
        })?;

        let image = open_array(&entry.image)?;
        let (h, w, _) = image.dim();

        let label = match &entry.label {
            Some(path) => open_mask(path)?,
            None => Array3::zeros((h, w, 1)),
        };
        let prior = match &entry.prior {
            Some(path) => open_mask(path)?,
            None => Array3::zeros((h, w, 1)),
        };

        for (name, mask) in [("label", &label), ("prior", &prior)] {
            let (mh, mw, _) = mask.dim();
            if (mh, mw) != (h, w) {
                return Err(SalObjError::Validation {
                    field: format!("{} shape", name),
                    reason: format!(
                        "{}x{} does not match image {}x{} for {}",
                        mw,
                        mh,
                        w,
                        h,
                        entry.image.display()
                    ),
                });
            }
        }

        self.transform.apply(Sample {
            index,
            image,
            label,
            prior,
        })
    }

    /// Network-ready tensors for one index: [`Self::sample`] followed by
    /// the tensor conversion.
    pub fn get(&self, index: usize) -> Result<SampleTensors> {
        let sample = self.sample(index)?;
        self.tensorize.apply(sample)
    }
}

fn lookup(
    index: Option<&HashMap<String, PathBuf>>,
    stem: &str,
    role: &str,
) -> Result<Option<PathBuf>> {
    match index {
        None => Ok(None),
        Some(map) => map
            .get(stem)
            .cloned()
            .map(Some)
            .ok_or_else(|| SalObjError::Validation {
                field: format!("{} files", role),
                reason: format!("no file with stem `{}`", stem),
            }),
    }
}

/// Samples stacked along a new batch axis.
pub struct Batch {
    pub indices: Vec<usize>,
    pub images: Array4<f32>,
    pub labels: Array4<f32>,
}

/// Sequential batching over a dataset: no shuffling, no worker threads.
/// With batch size 1 (the inference default) this is a plain iterator.
pub struct DataLoader<'a> {
    dataset: &'a SalObjDataset,
    batch_size: usize,
    cursor: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a SalObjDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    fn collate(&self, start: usize, end: usize) -> Result<Batch> {
        let mut indices = Vec::with_capacity(end - start);
        let mut images = Vec::with_capacity(end - start);
        let mut labels = Vec::with_capacity(end - start);
        for index in start..end {
            let tensors = self.dataset.get(index)?;
            indices.push(tensors.index);
            images.push(tensors.image);
            labels.push(tensors.label);
        }

        let image_views: Vec<_> = images.iter().map(|t| t.view()).collect();
        let label_views: Vec<_> = labels.iter().map(|t| t.view()).collect();
        Ok(Batch {
            indices,
            images: ndarray::stack(Axis(0), &image_views)?,
            labels: ndarray::stack(Axis(0), &label_views)?,
        })
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.dataset.len() {
            return None;
        }
        let start = self.cursor;
        let end = (start + self.batch_size).min(self.dataset.len());
        self.cursor = end;
        Some(self.collate(start, end))
    }
}

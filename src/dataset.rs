//! Image-folder datasets and the ImageNet class index
//!
//! Layout: `root/<class_dir>/<image>`. Class directories are sorted by
//! name and samples are sorted by path inside each class, so two loads of
//! the same directory always agree on length and label order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Tensor;
use serde::Deserialize;
use tracing::{debug, info};

use crate::transforms::Preprocess;

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "webp", "ppm"];

/// One entry of the class-index JSON: `"0": ["n01440764", "tench"]`
#[derive(Debug, Clone, Deserialize)]
struct ClassEntry(String, String);

/// Mapping from numeric class indices to (wnid, human-readable name)
#[derive(Debug, Clone)]
pub struct ClassIndex {
    entries: Vec<(String, String)>,
    by_wnid: HashMap<String, usize>,
}

impl ClassIndex {
    /// Load from a JSON object keyed by class index
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read class index {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: HashMap<String, ClassEntry> = serde_json::from_str(content)?;
        let mut indexed: Vec<(usize, ClassEntry)> = raw
            .into_iter()
            .map(|(k, v)| {
                k.parse::<usize>()
                    .map(|idx| (idx, v))
                    .with_context(|| format!("Non-numeric class index '{k}'"))
            })
            .collect::<Result<_>>()?;
        indexed.sort_by_key(|(idx, _)| *idx);

        for (expected, (idx, _)) in indexed.iter().enumerate() {
            anyhow::ensure!(
                *idx == expected,
                "Class index is not contiguous: missing {expected}"
            );
        }

        let entries: Vec<(String, String)> = indexed
            .into_iter()
            .map(|(_, ClassEntry(wnid, name))| (wnid, name))
            .collect();
        let by_wnid = entries
            .iter()
            .enumerate()
            .map(|(i, (wnid, _))| (wnid.clone(), i))
            .collect();

        Ok(Self { entries, by_wnid })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human-readable name of a class
    pub fn name(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).map(|(_, name)| name.as_str())
    }

    /// WordNet id of a class
    pub fn wnid(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).map(|(wnid, _)| wnid.as_str())
    }

    /// Class position of a WordNet id
    pub fn index_of(&self, wnid: &str) -> Option<usize> {
        self.by_wnid.get(wnid).copied()
    }
}

/// A single (path, label) entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: u32,
}

/// Indexable collection of preprocessed (image, label) pairs
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<ImageSample>,
    preprocess: Preprocess,
}

impl ImageFolder {
    /// Scan `root`, labelling classes by their sorted directory position
    pub fn load(root: &Path, preprocess: Preprocess) -> Result<Self> {
        Self::load_with_labels(root, preprocess, None)
    }

    /// Scan `root`, labelling class directories through a class index
    ///
    /// Directory names must be WordNet ids present in the index.
    pub fn load_with_class_index(
        root: &Path,
        preprocess: Preprocess,
        class_index: &ClassIndex,
    ) -> Result<Self> {
        Self::load_with_labels(root, preprocess, Some(class_index))
    }

    fn load_with_labels(
        root: &Path,
        preprocess: Preprocess,
        class_index: Option<&ClassIndex>,
    ) -> Result<Self> {
        let mut classes: Vec<String> = std::fs::read_dir(root)
            .with_context(|| format!("Failed to read dataset root {}", root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        classes.sort();
        anyhow::ensure!(
            !classes.is_empty(),
            "No class directories under {}",
            root.display()
        );

        let mut samples = Vec::new();
        for (position, class) in classes.iter().enumerate() {
            let label = match class_index {
                Some(index) => index.index_of(class).with_context(|| {
                    format!("Class directory '{class}' not found in class index")
                })?,
                None => position,
            };

            let mut paths: Vec<PathBuf> = std::fs::read_dir(root.join(class))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && is_image(p))
                .collect();
            paths.sort();
            debug!("Class {} ({}): {} images", class, label, paths.len());

            samples.extend(paths.into_iter().map(|path| ImageSample {
                path,
                label: label as u32,
            }));
        }

        info!(
            "Loaded image folder {}: {} classes, {} images",
            root.display(),
            classes.len(),
            samples.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
            preprocess,
        })
    }

    /// Decode and preprocess sample `idx` into a `(3, H, W)` CPU tensor
    pub fn get(&self, idx: usize) -> Result<(Tensor, u32)> {
        let sample = self
            .samples
            .get(idx)
            .ok_or_else(|| anyhow::anyhow!("Sample {idx} out of range ({})", self.len()))?;
        let image = image::open(&sample.path)
            .with_context(|| format!("Failed to decode {}", sample.path.display()))?;
        Ok((self.preprocess.apply(&image)?, sample.label))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sorted class directory names
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    /// Labels in sample order
    pub fn labels(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.label).collect()
    }

    pub fn preprocess(&self) -> &Preprocess {
        &self.preprocess
    }
}

/// Load and preprocess a single image file (the ad-hoc demo input)
pub fn load_image(path: &Path, preprocess: &Preprocess) -> Result<Tensor> {
    let image =
        image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
    preprocess.apply(&image)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

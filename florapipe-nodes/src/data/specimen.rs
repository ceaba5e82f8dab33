//! Labeled specimen dataset root
//!
//! Reads the competition-style `train_metadata.json` layout: a list of
//! categories (genus/species), a list of annotations binding image ids to
//! category ids, and a list of image files. Samples are fold-split per
//! category with a seeded shuffle so the train and validation partitions of
//! the same seed are disjoint and reproducible.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use florapipe_core::error::{Error, Result};
use florapipe_core::node::Node;
use florapipe_core::partition::{fold_split, worker_sample_range, Split, WorkerInfo};
use florapipe_core::record::Record;
use florapipe_core::source::{Category, DataSource};
use florapipe_core::value::Value;

#[derive(Deserialize)]
struct Metadata {
    categories: Vec<CategoryEntry>,
    annotations: Vec<AnnotationEntry>,
    images: Vec<ImageEntry>,
}

#[derive(Deserialize)]
struct CategoryEntry {
    category_id: i64,
    genus: String,
    species: String,
}

#[derive(Deserialize, Clone)]
struct AnnotationEntry {
    image_id: i64,
    category_id: i64,
}

#[derive(Deserialize)]
struct ImageEntry {
    image_id: i64,
    file_name: String,
}

struct Sample {
    category_id: i64,
    image_name: String,
    image_path: PathBuf,
}

/// Construction parameters for [`SpecimenDataset`]
pub struct SpecimenConfig {
    /// Dataset root directory holding `train_metadata.json`
    pub dsroot: PathBuf,

    /// Which fold partition this dataset serves
    pub split: Split,

    /// Batch size downstream stages will collate to; sharding is computed
    /// at batch granularity so batches never straddle workers
    pub batch_size: usize,

    /// Directory under `dsroot` holding the image files
    pub image_dir: String,

    /// Whether `reshuffle` permutes the sample order between epochs
    pub shuffle: bool,

    /// Seed for the fold shuffle and all epoch reshuffles
    pub shuffle_seed: u64,

    /// Number of folds each category is split into
    pub nfolds: usize,

    /// Which fold serves as the validation partition
    pub vfold: usize,

    /// Whether to read raw image bytes into each record
    pub load_images: bool,

    /// Whether to honor the `excludes.txt` blocklist
    pub excludes: bool,
}

impl Default for SpecimenConfig {
    fn default() -> Self {
        Self {
            dsroot: PathBuf::from("."),
            split: Split::Train,
            batch_size: 1,
            image_dir: "train_images".to_string(),
            shuffle: true,
            shuffle_seed: 331,
            nfolds: 5,
            vfold: 4,
            load_images: false,
            excludes: true,
        }
    }
}

/// Root node over a labeled specimen image collection
pub struct SpecimenDataset {
    batch_size: usize,
    shuffle: bool,
    load_images: bool,
    rng: StdRng,

    images: Vec<i64>,
    samples: HashMap<i64, Sample>,
    categories: BTreeMap<i64, Category>,
    num_categories: usize,

    worker: WorkerInfo,
    range: Range<usize>,
    cursor: usize,
}

impl SpecimenDataset {
    /// Load the metadata and materialize one fold partition
    pub fn new(config: SpecimenConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.shuffle_seed);

        let excluded = if config.excludes {
            load_excludes(&config.dsroot.join("excludes.txt"))?
        } else {
            HashSet::new()
        };

        let metadata_path = config.dsroot.join("train_metadata.json");
        let raw = fs::read_to_string(&metadata_path).map_err(|e| {
            Error::resource(format!("cannot read {}: {e}", metadata_path.display()))
        })?;
        let metadata: Metadata = serde_json::from_str(&raw)?;

        let mut categories = BTreeMap::new();
        for cat in &metadata.categories {
            let label = format!("{} {}", cat.genus, cat.species).to_lowercase();
            categories.insert(
                cat.category_id,
                Category {
                    id: cat.category_id,
                    label,
                    genus: cat.genus.clone(),
                    species: cat.species.clone(),
                },
            );
        }
        let num_categories = categories.keys().next_back().map_or(0, |&id| id as usize + 1);

        // fold each category independently after a seeded shuffle
        let mut by_category: BTreeMap<i64, Vec<AnnotationEntry>> = BTreeMap::new();
        for anno in &metadata.annotations {
            by_category.entry(anno.category_id).or_default().push(anno.clone());
        }

        let mut annotations: HashMap<i64, AnnotationEntry> = HashMap::new();
        for annos in by_category.values_mut() {
            annos.shuffle(&mut rng);
            let kept = fold_split(annos, config.nfolds, config.vfold, config.split)?;
            for anno in kept {
                annotations.insert(anno.image_id, anno);
            }
        }

        // keep the images that survived the fold and the blocklist
        let mut images = Vec::new();
        let mut samples = HashMap::new();
        for image in &metadata.images {
            if excluded.contains(&image.file_name) {
                continue;
            }
            if let Some(anno) = annotations.get(&image.image_id) {
                images.push(image.image_id);
                samples.insert(
                    image.image_id,
                    Sample {
                        category_id: anno.category_id,
                        image_name: image.file_name.clone(),
                        image_path: config.dsroot.join(&config.image_dir).join(&image.file_name),
                    },
                );
            }
        }

        // shuffle once so the first epoch is not metadata-ordered
        images.shuffle(&mut rng);

        tracing::info!(
            samples = images.len(),
            categories = categories.len(),
            "specimen dataset loaded"
        );

        Ok(Self {
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            load_images: config.load_images,
            rng,
            images,
            samples,
            categories,
            num_categories,
            worker: WorkerInfo::solo(),
            range: 0..0,
            cursor: 0,
        })
    }

    fn record_for(&self, image_id: i64) -> Result<Record> {
        let sample = self.samples.get(&image_id).ok_or_else(|| {
            Error::contract(format!("no sample indexed for image id {image_id}"))
        })?;

        let mut rec = Record::new();
        rec.set("image_id", image_id);
        rec.set("image_name", sample.image_name.clone());
        rec.set("image_path", sample.image_path.display().to_string());
        rec.set("target", sample.category_id);
        rec.set("category_id", sample.category_id);

        if self.load_images {
            let bytes = fs::read(&sample.image_path).map_err(|e| {
                Error::resource(format!("cannot read {}: {e}", sample.image_path.display()))
            })?;
            rec.set("image_bytes", Value::Bytes(bytes));
        }
        Ok(rec)
    }
}

fn load_excludes(path: &Path) -> Result<HashSet<String>> {
    let mut excluded = HashSet::new();
    if !path.exists() {
        return Ok(excluded);
    }
    for line in fs::read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        excluded.insert(line.to_string());
    }
    Ok(excluded)
}

impl Node for SpecimenDataset {
    fn fullname(&self) -> &'static str {
        "SpecimenDataset"
    }

    fn len(&self) -> usize {
        self.images.len()
    }

    fn start(&mut self) -> Result<()> {
        self.range = worker_sample_range(self.worker, self.images.len(), self.batch_size);
        self.cursor = self.range.start;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.cursor >= self.range.end {
            return Ok(None);
        }
        let image_id = self.images[self.cursor];
        self.cursor += 1;
        Ok(Some(self.record_for(image_id)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_source(&self) -> Option<&dyn DataSource> {
        Some(self)
    }

    fn as_source_mut(&mut self) -> Option<&mut dyn DataSource> {
        Some(self)
    }

    fn set_worker(&mut self, worker: WorkerInfo) {
        self.worker = worker;
    }
}

impl DataSource for SpecimenDataset {
    fn sample_ids(&self) -> Vec<i64> {
        self.images.clone()
    }

    fn num_categories(&self) -> usize {
        self.num_categories
    }

    fn categories(&self) -> &BTreeMap<i64, Category> {
        &self.categories
    }

    fn reshuffle(&mut self) {
        if !self.shuffle {
            return;
        }
        self.images.shuffle(&mut self.rng);
    }

    fn worker(&self) -> WorkerInfo {
        self.worker
    }

    fn validate(&self) -> Result<()> {
        let unique: HashSet<i64> = self.images.iter().copied().collect();
        if unique.len() != self.images.len() {
            return Err(Error::contract("duplicate image ids in the dataset"));
        }
        Ok(())
    }
}

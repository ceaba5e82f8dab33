//! Unlabeled dataset root over a directory of image files

use std::any::Any;
use std::fs;
use std::ops::Range;
use std::path::PathBuf;

use florapipe_core::error::{Error, Result};
use florapipe_core::node::Node;
use florapipe_core::partition::{worker_sample_range, WorkerInfo};
use florapipe_core::record::Record;
use florapipe_core::value::Value;

/// Root node over the files of a directory, for prediction runs
///
/// Scans `dsroot/image_dir` for files with the given suffix, in name
/// order. The numeric image id is the trailing digit run of the file stem
/// (`test-0042.jpg` yields 42); files without one are skipped with a
/// warning.
pub struct GlobDataset {
    dsroot: PathBuf,
    load_images: bool,
    batch_size: usize,

    images: Vec<(i64, String)>,

    worker: WorkerInfo,
    range: Range<usize>,
    cursor: usize,
}

impl GlobDataset {
    /// Scan `dsroot/image_dir` for `suffix` files
    pub fn new(
        dsroot: PathBuf,
        image_dir: &str,
        suffix: &str,
        batch_size: usize,
        load_images: bool,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }

        let scan_dir = dsroot.join(image_dir);
        let mut names = Vec::new();
        let entries = fs::read_dir(&scan_dir).map_err(|e| {
            Error::resource(format!("cannot scan {}: {e}", scan_dir.display()))
        })?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(suffix) {
                names.push(name);
            }
        }
        names.sort();

        let mut images = Vec::with_capacity(names.len());
        for name in names {
            match image_id_of(&name) {
                Some(id) => images.push((id, format!("{image_dir}/{name}"))),
                None => tracing::warn!(name, "no image id in file name, skipping"),
            }
        }

        Ok(Self {
            dsroot,
            load_images,
            batch_size,
            images,
            worker: WorkerInfo::solo(),
            range: 0..0,
            cursor: 0,
        })
    }
}

/// Trailing digit run of the file stem, if any
fn image_id_of(name: &str) -> Option<i64> {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

impl Node for GlobDataset {
    fn fullname(&self) -> &'static str {
        "GlobDataset"
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
        let (image_id, image_name) = self.images[self.cursor].clone();
        self.cursor += 1;

        let image_path = self.dsroot.join(&image_name);
        let mut rec = Record::new();
        rec.set("image_id", image_id);
        rec.set("image_name", image_name);
        rec.set("image_path", image_path.display().to_string());

        if self.load_images {
            let bytes = fs::read(&image_path).map_err(|e| {
                Error::resource(format!("cannot read {}: {e}", image_path.display()))
            })?;
            rec.set("image_bytes", Value::Bytes(bytes));
        }
        Ok(Some(rec))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn set_worker(&mut self, worker: WorkerInfo) {
        self.worker = worker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use florapipe_core::node::drain;

    fn write_files(dir: &std::path::Path, names: &[&str]) {
        let images = dir.join("test_images");
        fs::create_dir(&images).unwrap();
        for name in names {
            fs::write(images.join(name), b"jpeg").unwrap();
        }
    }

    #[test]
    fn test_scans_sorted_with_ids() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &["test-3.jpg", "test-1.jpg", "test-10.jpg", "notes.txt"]);

        let mut ds = GlobDataset::new(dir.path().to_path_buf(), "test_images", ".jpg", 1, false)
            .unwrap();
        assert_eq!(ds.len(), 3);

        let records = drain(&mut ds).unwrap();
        let ids: Vec<i64> = records
            .iter()
            .map(|r| r.get("image_id").unwrap().as_int().unwrap())
            .collect();
        // name order: test-1, test-10, test-3
        assert_eq!(ids, vec![1, 10, 3]);
    }

    #[test]
    fn test_files_without_id_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &["test-7.jpg", "cover.jpg"]);

        let ds = GlobDataset::new(dir.path().to_path_buf(), "test_images", ".jpg", 1, false)
            .unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn test_load_images_reads_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &["test-1.jpg"]);

        let mut ds = GlobDataset::new(dir.path().to_path_buf(), "test_images", ".jpg", 1, true)
            .unwrap();
        let records = drain(&mut ds).unwrap();
        match records[0].get("image_bytes").unwrap() {
            Value::Bytes(bytes) => assert_eq!(bytes, b"jpeg"),
            other => panic!("expected Bytes, got {}", other.kind()),
        }
    }
}

//! Metric logging stage and writers
//!
//! The logger smooths per-batch metrics into running averages as records
//! stream through, mirrors `batch_*` metrics to the writer at step
//! granularity, and dumps the final record's metrics once per pass at
//! epoch granularity. Writers are pluggable; a JSONL file writer and an
//! in-memory writer are provided.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::sink::{MetricWriter, SharedWriter};
use florapipe_core::value::Value;

/// Running mean of a streamed scalar
#[derive(Debug, Default, Clone)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    /// Create a meter with no observations
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all observations
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    /// Fold in an observation
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current mean, zero before any observation
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Streams records through while reporting their metrics
///
/// Per record, `loss*` and `lr` metrics are replaced by their running
/// averages over the pass so downstream consumers see smoothed values,
/// and `batch_*` metrics go to the writer keyed by a global step counter.
/// When the pass drains, every scalar metric of the final record goes to
/// the writer keyed by the epoch counter, with `loss*` values clamped so
/// divergent epochs do not flatten the graphs.
pub struct Logger {
    input: Upstream,
    writer: SharedWriter,
    prefix: String,
    loss_clamp: f64,
    epoch: i64,
    global_step: i64,
    loss_meters: BTreeMap<String, AverageMeter>,
    lr_meter: AverageMeter,
    pending: Option<Record>,
}

impl Logger {
    /// Wrap `input`, reporting under `prefix` to `writer`
    pub fn new(input: Box<dyn Node>, writer: SharedWriter, prefix: impl Into<String>, loss_clamp: f64) -> Self {
        Self {
            input: Upstream::new(input),
            writer,
            prefix: prefix.into(),
            loss_clamp,
            epoch: -1,
            global_step: -1,
            loss_meters: BTreeMap::new(),
            lr_meter: AverageMeter::new(),
            pending: None,
        }
    }

    fn absorb(&mut self, rec: &mut Record) -> Result<()> {
        self.global_step += 1;
        let prefix = self.prefix.clone();
        let step = self.global_step;
        let metrics = rec.metrics_mut();

        let mut writer = self.writer.borrow_mut();
        for (name, value) in metrics.iter() {
            if !name.starts_with("batch") {
                continue;
            }
            if let Ok(scalar) = value.as_float() {
                writer.add_scalar(&format!("{prefix}/{}", camel_label(name)), scalar, step)?;
            }
        }
        drop(writer);

        // smooth losses and the learning rate across the pass
        for (name, value) in metrics.iter_mut() {
            if name.starts_with("loss") {
                if let Ok(scalar) = value.as_float() {
                    let meter = self.loss_meters.entry(name.clone()).or_default();
                    meter.update(scalar);
                    *value = Value::Float(meter.value());
                }
            } else if name == "lr" {
                if let Ok(scalar) = value.as_float() {
                    self.lr_meter.update(scalar);
                    *value = Value::Float(self.lr_meter.value());
                }
            }
        }
        Ok(())
    }

    fn dump_epoch(&self, rec: &Record) -> Result<()> {
        let Some(metrics) = rec.metrics() else {
            return Ok(());
        };

        let mut writer = self.writer.borrow_mut();
        for (name, value) in metrics {
            if name.starts_with("batch") {
                continue;
            }
            let label = camel_label(name);

            match value {
                Value::FloatList(values) => {
                    for (idx, &v) in values.iter().enumerate() {
                        writer.add_scalar(
                            &format!("{}/{label}_{idx:02}", self.prefix),
                            v,
                            self.epoch,
                        )?;
                    }
                }
                Value::IntList(values) => {
                    for (idx, &v) in values.iter().enumerate() {
                        writer.add_scalar(
                            &format!("{}/{label}_{idx:02}", self.prefix),
                            v as f64,
                            self.epoch,
                        )?;
                    }
                }
                Value::Tensor(t) if t.len() != 1 => continue,
                other => {
                    let Ok(mut scalar) = scalar_of(other) else {
                        continue;
                    };
                    if name.starts_with("loss") {
                        scalar = scalar.min(self.loss_clamp);
                    }
                    writer.add_scalar(&format!("{}/{label}", self.prefix), scalar, self.epoch)?;
                }
            }
        }
        writer.flush()
    }
}

fn scalar_of(value: &Value) -> Result<f64> {
    match value {
        Value::Tensor(t) if t.len() == 1 => Ok(t.iter().copied().next().unwrap_or(0.0) as f64),
        other => other.as_float(),
    }
}

/// `f1_score` becomes `F1Score`, `batch_lr` becomes `BatchLr`
fn camel_label(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

impl Node for Logger {
    fn fullname(&self) -> &'static str {
        "Logger"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.epoch += 1;
        self.loss_meters.clear();
        self.lr_meter.reset();
        self.pending = None;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.pending.is_none() {
            match self.input.next_record()? {
                Some(mut rec) => {
                    self.absorb(&mut rec)?;
                    self.pending = Some(rec);
                }
                None => return Ok(None),
            }
        }

        match self.input.next_record()? {
            Some(mut next) => {
                self.absorb(&mut next)?;
                Ok(self.pending.replace(next))
            }
            None => {
                let last = self.pending.take();
                if let Some(rec) = last.as_ref() {
                    self.dump_epoch(rec)?;
                }
                Ok(last)
            }
        }
    }

    fn upstream(&self) -> Option<&dyn Node> {
        self.input.get()
    }

    fn upstream_mut(&mut self) -> Option<&mut dyn Node> {
        self.input.get_mut()
    }

    fn take_upstream(&mut self) -> Option<Box<dyn Node>> {
        self.input.take()
    }

    fn set_upstream(&mut self, upstream: Box<dyn Node>) -> Result<()> {
        self.input.set(upstream);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Appends metric scalars to a JSONL file, one object per line
///
/// The file is created lazily on the first scalar. A bare directory name
/// (no separator) gets a timestamped subdirectory so repeated runs do not
/// interleave.
pub struct JsonlWriter {
    log_dir: PathBuf,
    file: Option<File>,
}

impl JsonlWriter {
    /// Create a writer rooted at `log_dir`
    pub fn new(log_dir: &str) -> Self {
        let log_dir = if log_dir.contains('/') {
            PathBuf::from(log_dir)
        } else {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            PathBuf::from(log_dir).join(now.to_string())
        };
        Self { log_dir, file: None }
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            fs::create_dir_all(&self.log_dir)?;
            let path = self.log_dir.join("metrics.jsonl");
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(Error::resource("metric log file unavailable")),
        }
    }
}

impl MetricWriter for JsonlWriter {
    fn add_scalar(&mut self, label: &str, value: f64, step: i64) -> Result<()> {
        let line = serde_json::json!({
            "label": label,
            "value": value,
            "step": step,
        });
        let file = self.file()?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Discards every scalar, for runs where metric output is unwanted
pub struct NullWriter;

impl MetricWriter for NullWriter {
    fn add_scalar(&mut self, _label: &str, _value: f64, _step: i64) -> Result<()> {
        Ok(())
    }
}

/// Collects scalars in memory, for tests and dry runs
#[derive(Default)]
pub struct MemoryWriter {
    /// Recorded `(label, value, step)` triples, in call order
    pub scalars: Vec<(String, f64, i64)>,
}

impl MemoryWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// The values recorded under a label, in call order
    pub fn values_for(&self, label: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|(l, _, _)| l == label)
            .map(|&(_, v, _)| v)
            .collect()
    }
}

impl MetricWriter for MemoryWriter {
    fn add_scalar(&mut self, label: &str, value: f64, step: i64) -> Result<()> {
        self.scalars.push((label.to_string(), value, step));
        Ok(())
    }
}

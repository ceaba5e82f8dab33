//! Epoch-loop driver
//!
//! Instantiates the configuration's top-level entries in declaration order,
//! registering each shared collaborator under its key, then builds the
//! train and validate pipelines and drives them for the configured number
//! of epochs. Pipelines are rebuilt from configuration per run, never
//! mutated across runs.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde_json::Value as ConfigValue;

use florapipe_core::instantiate::{instantiate, Constructors, Registry, Resolved};
use florapipe_core::node::{root, root_mut, Node};
use florapipe_core::pipeline::build_pipeline;
use florapipe_core::record::Record;
use florapipe_core::source::DataSource;
use florapipe_core::value::Value;

use crate::config::Runtime;

/// Key suffix marking a top-level entry as a pipeline entry list
pub const PIPELINE_SUFFIX: &str = "_pipeline";

/// The instantiated run: shared collaborators plus the built pipelines
pub struct Assembly {
    /// Shared instances registered under their configuration keys
    pub registry: Registry,

    /// The training pipeline tail, if the configuration declares one
    pub train: Option<Box<dyn Node>>,

    /// The validation pipeline tail, if the configuration declares one
    pub validate: Option<Box<dyn Node>>,
}

/// Instantiate every top-level entry and build the pipelines
///
/// Non-pipeline entries resolve first, in declaration order, so a pipeline
/// entry can reference any of them by `instance`. Plain-data sections (the
/// `runtime` block, free-form settings) pass through unregistered.
pub fn assemble(constructors: &Constructors, config: &ConfigValue) -> Result<Assembly> {
    let mapping = config
        .as_object()
        .context("configuration root must be a mapping")?;

    let mut registry = Registry::new();
    for (key, value) in mapping {
        if key.ends_with(PIPELINE_SUFFIX) {
            continue;
        }
        match instantiate(constructors, &registry, value)
            .with_context(|| format!("instantiating top-level entry '{key}'"))?
        {
            Resolved::Shared(shared) => {
                tracing::info!(name = %key, kind = shared.kind(), "registered shared instance");
                registry.insert(key.clone(), shared);
            }
            Resolved::Data(_) => {}
            other => bail!(
                "top-level entry '{key}' resolved to a {}, expected a shared instance or plain data",
                other.kind()
            ),
        }
    }

    let pipeline = |name: &str| -> Result<Option<Box<dyn Node>>> {
        match mapping.get(name) {
            Some(entries) => build_pipeline(constructors, &registry, entries)
                .with_context(|| format!("building '{name}'")),
            None => Ok(None),
        }
    };
    let train = pipeline("train_pipeline")?;
    let validate = pipeline("validate_pipeline")?;

    Ok(Assembly {
        registry,
        train,
        validate,
    })
}

/// Sanity-check the assembled data sources before the first pass
///
/// Each root source validates itself (duplicate sample ids), and when both
/// pipelines are present their sample sets must be disjoint, otherwise the
/// validation metrics would be contaminated by training data.
pub fn check_data(assembly: &Assembly) -> Result<()> {
    let ids_of = |tail: &Option<Box<dyn Node>>| -> Result<Option<Vec<i64>>> {
        let Some(tail) = tail else {
            return Ok(None);
        };
        let Some(source) = root(tail.as_ref()).as_source() else {
            return Ok(None);
        };
        source.validate()?;
        Ok(Some(source.sample_ids()))
    };

    let train_ids = ids_of(&assembly.train)?;
    let val_ids = ids_of(&assembly.validate)?;

    if let (Some(train_ids), Some(val_ids)) = (train_ids, val_ids) {
        let train_set: HashSet<i64> = train_ids.into_iter().collect();
        let shared: Vec<i64> = val_ids
            .into_iter()
            .filter(|id| train_set.contains(id))
            .collect();
        if !shared.is_empty() {
            bail!(
                "{} sample ids appear in both the train and validate partitions",
                shared.len()
            );
        }
    }
    Ok(())
}

/// Assemble the run from configuration and drive the epoch loop
pub fn run(constructors: &Constructors, config: &ConfigValue) -> Result<()> {
    let runtime = Runtime::from_config(config)?;
    let rendered = crate::config::save_rendered(&runtime, config)?;
    tracing::info!(config = %rendered.display(), "run configuration saved");

    let mut assembly = assemble(constructors, config)?;
    check_data(&assembly)?;

    let started = Instant::now();
    for epoch in 0..runtime.num_epochs {
        if let Some(limit) = runtime.time_limit {
            let elapsed = started.elapsed().as_secs_f64() / 60.0;
            if elapsed > limit {
                tracing::info!(epoch, elapsed, "time limit reached, stopping");
                break;
            }
        }

        if let Some(train) = assembly.train.as_mut() {
            // the source shuffles itself at construction; later epochs
            // draw a fresh permutation from the same seeded stream
            if epoch > 0 {
                if let Some(source) = root_mut(train.as_mut()).as_source_mut() {
                    source.reshuffle();
                }
            }
            run_pass("train", train.as_mut(), epoch)?;
        }
        if let Some(validate) = assembly.validate.as_mut() {
            run_pass("validate", validate.as_mut(), epoch)?;
        }
    }
    Ok(())
}

fn run_pass(pass: &str, tail: &mut dyn Node, epoch: usize) -> Result<()> {
    let started = Instant::now();
    tail.start()?;

    let mut records = 0usize;
    let mut last: Option<Record> = None;
    while let Some(rec) = tail.next_record()? {
        records += 1;
        last = Some(rec);
    }

    let summary = last
        .as_ref()
        .and_then(|rec| rec.metrics())
        .map(summarize)
        .unwrap_or_default();
    tracing::info!(
        pass,
        epoch,
        records,
        elapsed_s = started.elapsed().as_secs_f64(),
        %summary,
        "pass complete"
    );
    Ok(())
}

/// Render the final record's metrics for the epoch log line
///
/// Per-batch metrics and the smoothed learning rate are writer concerns,
/// and multi-element tensors do not belong in a log line.
fn summarize(metrics: &std::collections::BTreeMap<String, Value>) -> String {
    metrics
        .iter()
        .filter(|(name, _)| !name.starts_with("batch") && name.as_str() != "lr")
        .filter_map(|(name, value)| {
            let shown = match value {
                Value::Tensor(t) if t.len() != 1 => return None,
                Value::Tensor(t) => t.iter().copied().next().unwrap_or(0.0).to_string(),
                other => other.to_string(),
            };
            Some(format!("{name}={shown}"))
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::any::Any;
    use std::collections::BTreeMap;

    use florapipe_core::error::Result as CoreResult;
    use florapipe_core::instantiate::SharedInstance;
    use florapipe_core::partition::WorkerInfo;
    use florapipe_core::sink::MetricWriter;
    use florapipe_core::source::{Category, DataSource};

    /// Root yielding one record per id in a fixed range
    struct RangeSource {
        ids: Vec<i64>,
        categories: BTreeMap<i64, Category>,
        cursor: usize,
    }

    impl RangeSource {
        fn new(start: i64, count: usize) -> Self {
            Self {
                ids: (start..start + count as i64).collect(),
                categories: BTreeMap::new(),
                cursor: 0,
            }
        }
    }

    impl Node for RangeSource {
        fn fullname(&self) -> &'static str {
            "RangeSource"
        }

        fn len(&self) -> usize {
            self.ids.len()
        }

        fn start(&mut self) -> CoreResult<()> {
            self.cursor = 0;
            Ok(())
        }

        fn next_record(&mut self) -> CoreResult<Option<Record>> {
            if self.cursor >= self.ids.len() {
                return Ok(None);
            }
            let mut rec = Record::new();
            rec.set("image_id", self.ids[self.cursor]);
            rec.metrics_mut()
                .insert("loss".to_string(), Value::Float(0.5));
            self.cursor += 1;
            Ok(Some(rec))
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
    }

    impl DataSource for RangeSource {
        fn sample_ids(&self) -> Vec<i64> {
            self.ids.clone()
        }

        fn num_categories(&self) -> usize {
            0
        }

        fn categories(&self) -> &BTreeMap<i64, Category> {
            &self.categories
        }

        fn reshuffle(&mut self) {
            self.ids.rotate_left(1);
        }

        fn worker(&self) -> WorkerInfo {
            WorkerInfo::solo()
        }
    }

    struct NullWriter;

    impl MetricWriter for NullWriter {
        fn add_scalar(&mut self, _label: &str, _value: f64, _step: i64) -> CoreResult<()> {
            Ok(())
        }
    }

    fn constructors() -> Constructors {
        let mut cons = Constructors::new();
        cons.register("test.Range", |args| {
            let start = args.take_usize_or("start", 0)? as i64;
            let count = args.take_usize_or("count", 4)?;
            args.finish()?;
            Ok(Resolved::Node(Box::new(RangeSource::new(start, count))))
        });
        cons.register("test.Writer", |args| {
            args.finish()?;
            Ok(Resolved::Shared(SharedInstance::Writer(std::rc::Rc::new(
                std::cell::RefCell::new(NullWriter),
            ))))
        });
        cons
    }

    #[test]
    fn test_assemble_registers_shared_and_builds_pipelines() {
        let config = json!({
            "runtime": {"num_epochs": 1},
            "writer": {"target": "test.Writer"},
            "train_pipeline": [{"target": "test.Range", "count": 6}],
            "validate_pipeline": [{"target": "test.Range", "start": 100, "count": 2}],
        });

        let assembly = assemble(&constructors(), &config).unwrap();
        assert!(assembly.registry.contains("writer"));
        assert_eq!(assembly.train.as_ref().unwrap().len(), 6);
        assert_eq!(assembly.validate.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_check_data_rejects_shared_samples() {
        let config = json!({
            "train_pipeline": [{"target": "test.Range", "count": 6}],
            "validate_pipeline": [{"target": "test.Range", "start": 4, "count": 2}],
        });
        let assembly = assemble(&constructors(), &config).unwrap();
        assert!(check_data(&assembly).is_err());

        let config = json!({
            "train_pipeline": [{"target": "test.Range", "count": 4}],
            "validate_pipeline": [{"target": "test.Range", "start": 4, "count": 2}],
        });
        let assembly = assemble(&constructors(), &config).unwrap();
        check_data(&assembly).unwrap();
    }

    #[test]
    fn test_run_drives_epochs_and_saves_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = json!({
            "runtime": {
                "num_epochs": 2,
                "run_dir": dir.path().join("run0").display().to_string(),
            },
            "train_pipeline": [{"target": "test.Range", "count": 4}],
        });

        run(&constructors(), &config).unwrap();
        assert!(dir.path().join("run0/config.json").exists());
    }

    #[test]
    fn test_reshuffle_skips_first_epoch() {
        use std::cell::Cell;
        use std::rc::Rc;

        /// Root that counts reshuffle calls through a shared cell
        struct TrackingSource {
            inner: RangeSource,
            reshuffles: Rc<Cell<usize>>,
        }

        impl Node for TrackingSource {
            fn fullname(&self) -> &'static str {
                "TrackingSource"
            }

            fn len(&self) -> usize {
                self.inner.len()
            }

            fn start(&mut self) -> CoreResult<()> {
                self.inner.start()
            }

            fn next_record(&mut self) -> CoreResult<Option<Record>> {
                self.inner.next_record()
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
        }

        impl DataSource for TrackingSource {
            fn sample_ids(&self) -> Vec<i64> {
                self.inner.sample_ids()
            }

            fn num_categories(&self) -> usize {
                self.inner.num_categories()
            }

            fn categories(&self) -> &BTreeMap<i64, Category> {
                self.inner.categories()
            }

            fn reshuffle(&mut self) {
                self.reshuffles.set(self.reshuffles.get() + 1);
                self.inner.reshuffle();
            }

            fn worker(&self) -> WorkerInfo {
                self.inner.worker()
            }
        }

        let reshuffles = Rc::new(Cell::new(0usize));
        let counter = reshuffles.clone();
        let mut cons = Constructors::new();
        cons.register("test.Tracking", move |args| {
            args.finish()?;
            Ok(Resolved::Node(Box::new(TrackingSource {
                inner: RangeSource::new(0, 4),
                reshuffles: counter.clone(),
            })))
        });

        let dir = tempfile::tempdir().unwrap();
        let config = json!({
            "runtime": {
                "num_epochs": 3,
                "run_dir": dir.path().join("run").display().to_string(),
            },
            "train_pipeline": [{"target": "test.Tracking"}],
        });
        run(&cons, &config).unwrap();

        // the construction-time shuffle covers epoch 0; epochs 1 and 2
        // each reshuffle once
        assert_eq!(reshuffles.get(), 2);
    }

    #[test]
    fn test_summarize_skips_writer_concerns() {
        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), Value::Float(0.5));
        metrics.insert("lr".to_string(), Value::Float(0.01));
        metrics.insert("batch_lr".to_string(), Value::Float(0.01));
        metrics.insert(
            "confusion_matrix".to_string(),
            Value::Tensor(ndarray::ArrayD::zeros(ndarray::IxDyn(&[3, 3]))),
        );

        assert_eq!(summarize(&metrics), "loss=0.5");
    }
}

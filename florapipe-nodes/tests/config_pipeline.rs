//! End-to-end pipeline assembly from configuration
//!
//! Builds a validation-style pipeline out of the constructor registry and
//! a declarative entry list, drives it for two passes, and checks that the
//! metric stages and the logger cooperate the way a driver relies on.

use std::any::Any;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};
use serde_json::json;

use florapipe_core::error::Result;
use florapipe_core::instantiate::{Registry, Resolved, SharedInstance};
use florapipe_core::node::{drain, iter_rev, Node, Upstream};
use florapipe_core::pipeline::build_pipeline;
use florapipe_core::record::Record;
use florapipe_nodes::{default_constructors, MemoryWriter};

/// Fabricates a one-hot `output` tensor agreeing with the batched targets,
/// standing in for a model-driving stage
struct OneHot {
    input: Upstream,
    num_categories: usize,
}

impl Node for OneHot {
    fn fullname(&self) -> &'static str {
        "OneHot"
    }

    fn len(&self) -> usize {
        self.input.len()
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count()
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let Some(mut rec) = self.input.next_record()? else {
            return Ok(None);
        };
        let targets = rec.require("OneHot", "target")?.as_int_list()?.to_vec();
        let mut out = ArrayD::zeros(IxDyn(&[targets.len(), self.num_categories]));
        for (row, &target) in targets.iter().enumerate() {
            out[[row, target as usize]] = 1.0;
        }
        rec.set("output", out);
        rec.metrics_mut()
            .insert("loss".to_string(), florapipe_core::value::Value::Float(0.25));
        Ok(Some(rec))
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

fn write_fixture(dir: &Path, per_category: usize, categories: usize) {
    let mut cats = Vec::new();
    let mut annos = Vec::new();
    let mut images = Vec::new();

    for cat in 0..categories {
        cats.push(json!({
            "category_id": cat,
            "genus": format!("Genus{cat}"),
            "species": format!("species{cat}"),
        }));
        for idx in 0..per_category {
            let image_id = (cat * per_category + idx) as i64;
            annos.push(json!({"image_id": image_id, "category_id": cat}));
            images.push(json!({
                "image_id": image_id,
                "file_name": format!("img-{image_id:04}.jpg"),
            }));
        }
    }

    let metadata = json!({"categories": cats, "annotations": annos, "images": images});
    fs::write(
        dir.join("train_metadata.json"),
        serde_json::to_string(&metadata).unwrap(),
    )
    .unwrap();
}

#[test]
fn test_validation_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 10, 2);

    let mut cons = default_constructors();
    cons.register("test.OneHot", |args| {
        let input = args.require_node("input")?;
        let num_categories = args.require_usize("num_categories")?;
        args.finish()?;
        Ok(Resolved::Node(Box::new(OneHot {
            input: Upstream::new(input),
            num_categories,
        })))
    });

    let writer = Rc::new(RefCell::new(MemoryWriter::new()));
    let mut reg = Registry::new();
    reg.insert("writer", SharedInstance::Writer(writer.clone()));

    let entries = json!([
        {
            "target": "florapipe.data.SpecimenDataset",
            "dsroot": dir.path().display().to_string(),
            "split": "val",
            "batch_size": 4,
        },
        {"target": "florapipe.data.BatchLoader", "batch_size": 4},
        {"target": "test.OneHot", "num_categories": 2},
        {"target": "florapipe.evaluate.F1Score", "num_categories": 2},
        {"target": "florapipe.evaluate.ConfusionMatrix", "num_categories": 2},
        {
            "target": "florapipe.logger.Logger",
            "writer": {"instance": "writer"},
            "prefix": "Vdate",
        },
    ]);
    let mut tail = build_pipeline(&cons, &reg, &entries).unwrap().unwrap();

    let names: Vec<&str> = iter_rev(tail.as_ref()).iter().map(|n| n.fullname()).collect();
    assert_eq!(
        names,
        vec![
            "Logger",
            "ConfusionMatrix",
            "F1Score",
            "OneHot",
            "BatchLoader",
            "SpecimenDataset",
        ]
    );

    // two full passes; the val fold holds 2 of each category's 10 samples
    for epoch in 0..2i64 {
        let records = drain(tail.as_mut()).unwrap();
        assert_eq!(records.len(), 1);

        // finalized metrics land only on the last record of the pass
        let metrics = records.last().unwrap().metrics().unwrap();
        assert!((metrics["f1_score"].as_float().unwrap() - 1.0).abs() < 1e-9);
        let matrix = metrics["confusion_matrix"].as_tensor().unwrap();
        assert_eq!(matrix.shape(), &[2, 2]);
        assert_eq!(matrix.sum(), 4.0);

        let w = writer.borrow();
        let f1: Vec<(f64, i64)> = w
            .scalars
            .iter()
            .filter(|(label, _, _)| label == "Vdate/F1Score")
            .map(|&(_, value, step)| (value, step))
            .collect();
        assert_eq!(f1.last().copied(), Some((1.0, epoch)));
        assert_eq!(f1.len(), (epoch + 1) as usize);
    }

    // the loss dump is the running average, written once per pass
    let w = writer.borrow();
    assert_eq!(w.values_for("Vdate/Loss"), vec![0.25, 0.25]);
}

#[test]
fn test_train_and_val_folds_never_share_images() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 10, 3);

    let cons = default_constructors();
    let reg = Registry::new();

    let ids_for = |split: &str| -> Vec<i64> {
        let entries = json!([{
            "target": "florapipe.data.SpecimenDataset",
            "dsroot": dir.path().display().to_string(),
            "split": split,
        }]);
        let mut tail = build_pipeline(&cons, &reg, &entries).unwrap().unwrap();
        drain(tail.as_mut())
            .unwrap()
            .iter()
            .map(|rec| rec.get("image_id").unwrap().as_int().unwrap())
            .collect()
    };

    let train = ids_for("train");
    let val = ids_for("val");
    assert_eq!(train.len() + val.len(), 30);
    assert!(train.iter().all(|id| !val.contains(id)));
}

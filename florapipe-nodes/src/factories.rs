//! Constructor registry for the configuration targets
//!
//! Maps each dotted target identifier to a closure that pulls typed
//! arguments out of the resolved configuration mapping and builds the
//! stage or shared object. The set of targets is explicit; there is no
//! module scanning.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use serde_json::Value as ConfigValue;

use florapipe_core::error::{Error, Result};
use florapipe_core::instantiate::{Args, Constructors, Resolved, SharedInstance};
use florapipe_core::partition::Split;

use crate::data::{
    BatchLimiter, BatchLoader, CenterCrop, FiveCrop, GlobDataset, Normalize, SpecimenConfig,
    SpecimenDataset, Transformer,
};
use crate::ensemble::Assembler;
use crate::evaluate::{ConfusionMatrix, F1Score};
use crate::logger::{JsonlWriter, Logger, NullWriter};
use crate::predict::Predictor;
use crate::scheduler::{
    BatchLinearRamp, MultiCycleCosine, OneCycleCosine, OneCycleExponential, Scheduled, StepOptions,
};
use crate::train::Trainer;
use crate::validate::Validator;

fn node(node: impl florapipe_core::node::Node + 'static) -> Resolved {
    Resolved::Node(Box::new(node))
}

fn take_opt_f64(args: &mut Args, name: &str) -> Result<Option<f64>> {
    match args.take(name) {
        Some(Resolved::Data(ConfigValue::Number(n))) => Ok(n.as_f64()),
        Some(other) => Err(Error::Construction {
            target: args.target().to_string(),
            reason: format!("argument '{name}' must be a number, got {}", other.kind()),
        }),
        None => Ok(None),
    }
}

fn require_f64s(args: &mut Args, name: &str) -> Result<Vec<f64>> {
    match args.take_f64s(name)? {
        Some(values) => Ok(values),
        None => Err(Error::Construction {
            target: args.target().to_string(),
            reason: format!("missing required argument '{name}'"),
        }),
    }
}

fn epoch_window(args: &mut Args) -> Result<(i64, i64)> {
    let start = args.take_usize_or("start_epoch", 0)? as i64;
    let end = args
        .take_u64_or("end_epoch", i64::MAX as u64)?
        .min(i64::MAX as u64) as i64;
    Ok((start, end))
}

/// The full constructor registry of this crate
pub fn default_constructors() -> Constructors {
    let mut cons = Constructors::new();

    cons.register("florapipe.data.SpecimenDataset", |args| {
        let config = SpecimenConfig {
            dsroot: PathBuf::from(args.require_str("dsroot")?),
            split: Split::parse(&args.take_str_or("split", "train")?)?,
            batch_size: args.take_usize_or("batch_size", 1)?,
            image_dir: args.take_str_or("image_dir", "train_images")?,
            shuffle: args.take_bool_or("shuffle", true)?,
            shuffle_seed: args.take_u64_or("shuffle_seed", 331)?,
            nfolds: args.take_usize_or("nfolds", 5)?,
            vfold: args.take_usize_or("vfold", 4)?,
            load_images: args.take_bool_or("load_images", false)?,
            excludes: args.take_bool_or("excludes", true)?,
        };
        args.finish()?;
        Ok(node(SpecimenDataset::new(config)?))
    });

    cons.register("florapipe.data.GlobDataset", |args| {
        let dsroot = PathBuf::from(args.require_str("dsroot")?);
        let image_dir = args.take_str_or("image_dir", "test_images")?;
        let suffix = args.take_str_or("suffix", ".jpg")?;
        let batch_size = args.take_usize_or("batch_size", 1)?;
        let load_images = args.take_bool_or("load_images", false)?;
        args.finish()?;
        Ok(node(GlobDataset::new(
            dsroot,
            &image_dir,
            &suffix,
            batch_size,
            load_images,
        )?))
    });

    cons.register("florapipe.data.BatchLoader", |args| {
        let input = args.require_node("input")?;
        let batch_size = args.require_usize("batch_size")?;
        let drop_last = args.take_bool_or("drop_last", false)?;
        args.finish()?;
        Ok(node(BatchLoader::new(input, batch_size, drop_last)?))
    });

    cons.register("florapipe.data.BatchLimiter", |args| {
        let input = args.require_node("input")?;
        let batch_limit = args.take_usize_or("batch_limit", 0)?;
        let batch_size = args.require_usize("batch_size")?;
        args.finish()?;
        Ok(node(BatchLimiter::new(input, batch_limit, batch_size)?))
    });

    cons.register("florapipe.data.FiveCrop", |args| {
        let input = args.require_node("input")?;
        let height = args.require_usize("height")?;
        let width = args.require_usize("width")?;
        args.finish()?;
        Ok(node(FiveCrop::new(input, height, width)?))
    });

    cons.register("florapipe.data.Transformer", |args| {
        let input = args.require_node("input")?;
        let transforms = args.require_transforms("transforms")?;
        args.finish()?;
        Ok(node(Transformer::new(input, transforms)))
    });

    cons.register("florapipe.transforms.CenterCrop", |args| {
        let height = args.require_usize("height")?;
        let width = args.require_usize("width")?;
        args.finish()?;
        let crop = CenterCrop::new(height, width)?;
        Ok(Resolved::Shared(SharedInstance::Transform(Rc::new(crop))))
    });

    cons.register("florapipe.transforms.Normalize", |args| {
        let mean: Vec<f32> = require_f64s(args, "mean")?.iter().map(|&v| v as f32).collect();
        let std: Vec<f32> = require_f64s(args, "std")?.iter().map(|&v| v as f32).collect();
        args.finish()?;
        let norm = Normalize::new(mean, std)?;
        Ok(Resolved::Shared(SharedInstance::Transform(Rc::new(norm))))
    });

    cons.register("florapipe.ensemble.Assembler", |args| {
        let input = args.require_node("input")?;
        let samples_per_id = args.require_usize("samples_per_id")?;
        let reducer = args.take_str_or("reducer", "sum")?;
        args.finish()?;
        Ok(node(Assembler::new(input, samples_per_id, &reducer)?))
    });

    cons.register("florapipe.evaluate.ConfusionMatrix", |args| {
        let input = args.require_node("input")?;
        let num_categories = args.require_usize("num_categories")?;
        args.finish()?;
        Ok(node(ConfusionMatrix::new(input, num_categories)?))
    });

    cons.register("florapipe.evaluate.F1Score", |args| {
        let input = args.require_node("input")?;
        let num_categories = args.require_usize("num_categories")?;
        args.finish()?;
        Ok(node(F1Score::new(input, num_categories)?))
    });

    cons.register("florapipe.train.Trainer", |args| {
        let input = args.require_node("input")?;
        let model = args.require_model("model")?;
        let criterion = args.require_criterion("criterion")?;
        let optimizer = args.require_optimizer("optimizer")?;
        args.finish()?;
        Ok(node(Trainer::new(input, model, criterion, optimizer)))
    });

    cons.register("florapipe.validate.Validator", |args| {
        let input = args.require_node("input")?;
        let model = args.require_model("model")?;
        let criterion = args.require_criterion("criterion")?;
        args.finish()?;
        Ok(node(Validator::new(input, model, criterion)))
    });

    cons.register("florapipe.predict.Predictor", |args| {
        let input = args.require_node("input")?;
        let model = args.require_model("model")?;
        args.finish()?;
        Ok(node(Predictor::new(input, model)))
    });

    cons.register("florapipe.scheduler.BatchLinearRamp", |args| {
        let input = args.require_node("input")?;
        let optimizer = args.require_optimizer("optimizer")?;
        let final_lr = args.require_f64("final_lr")?;
        let cycle_len = args.require_usize("cycle_len")?;
        let cycle_scale = args.take_f64_or("cycle_scale", 1.0)?;
        let initial_lr = take_opt_f64(args, "initial_lr")?;
        let track_loss = args.take_bool_or("track_loss", false)?;
        let (start_epoch, end_epoch) = epoch_window(args)?;
        args.finish()?;

        let options = StepOptions {
            batch_mode: true,
            annotate_lr: true,
            annotate_loss: track_loss,
            start_epoch,
            end_epoch,
        };
        let shape = BatchLinearRamp::new(final_lr, cycle_len, cycle_scale);
        Ok(node(Scheduled::new(input, optimizer, shape, options, initial_lr)))
    });

    cons.register("florapipe.scheduler.OneCycleCosine", |args| {
        let input = args.require_node("input")?;
        let optimizer = args.require_optimizer("optimizer")?;
        let peak_epoch = args.take_usize_or("peak_epoch", 2)?;
        let final_epoch = args.take_usize_or("final_epoch", 15)?;
        let peak_scale = args.take_f64_or("peak_scale", 10.0)?;
        let final_scale = args.take_f64_or("final_scale", 0.1)?;
        let warmup_step = args.take_usize_or("warmup_step", 0)?;
        let warmup_scale = args.take_f64_or("warmup_scale", 1.0)?;
        let batch = args.take_bool_or("batch", false)?;
        let (start_epoch, end_epoch) = epoch_window(args)?;
        args.finish()?;

        // in batch mode the phase lengths are given in passes, so they
        // scale by the upstream batch count
        let steps_per_epoch = if batch { input.len() } else { 1 };
        let shape = OneCycleCosine::new(
            peak_epoch,
            final_epoch,
            peak_scale,
            final_scale,
            warmup_step,
            warmup_scale,
            steps_per_epoch,
        )?;
        let options = StepOptions {
            batch_mode: batch,
            annotate_lr: batch,
            annotate_loss: batch,
            start_epoch,
            end_epoch,
        };
        Ok(node(Scheduled::new(input, optimizer, shape, options, None)))
    });

    cons.register("florapipe.scheduler.MultiCycleCosine", |args| {
        let input = args.require_node("input")?;
        let optimizer = args.require_optimizer("optimizer")?;
        let stage0 = args.take_usize_or("stage0", 5)?;
        let stage1 = args.take_usize_or("stage1", 10)?;
        let peak_scale = args.take_f64_or("peak_scale", 10.0)?;
        let cycle_scale = args.take_f64_or("cycle_scale", 1.0)?;
        let batch = args.take_bool_or("batch", false)?;
        let (start_epoch, end_epoch) = epoch_window(args)?;
        args.finish()?;

        let shape = MultiCycleCosine::new(stage0, stage1, peak_scale, cycle_scale)?;
        let options = StepOptions {
            batch_mode: batch,
            annotate_lr: batch,
            annotate_loss: batch,
            start_epoch,
            end_epoch,
        };
        Ok(node(Scheduled::new(input, optimizer, shape, options, None)))
    });

    cons.register("florapipe.scheduler.OneCycleExponential", |args| {
        let input = args.require_node("input")?;
        let optimizer = args.require_optimizer("optimizer")?;
        let stage0 = args.take_usize_or("stage0", 0)?;
        let stage1 = args.take_usize_or("stage1", 5)?;
        let stage2 = args.take_usize_or("stage2", 15)?;
        let scale1 = args.take_f64_or("scale1", 10.0)?;
        let scale2 = args.take_f64_or("scale2", 0.1)?;
        let batch = args.take_bool_or("batch", false)?;
        let (start_epoch, end_epoch) = epoch_window(args)?;
        args.finish()?;

        let shape = OneCycleExponential::new(stage0, stage1, stage2, scale1, scale2)?;
        let options = StepOptions {
            batch_mode: batch,
            annotate_lr: batch,
            annotate_loss: batch,
            start_epoch,
            end_epoch,
        };
        Ok(node(Scheduled::new(input, optimizer, shape, options, None)))
    });

    cons.register("florapipe.logger.Logger", |args| {
        let input = args.require_node("input")?;
        let writer = args.require_writer("writer")?;
        let prefix = args.require_str("prefix")?;
        let loss_clamp = args.take_f64_or("loss_clamp", f64::MAX)?;
        args.finish()?;
        Ok(node(Logger::new(input, writer, prefix, loss_clamp)))
    });

    cons.register("florapipe.logger.JsonlWriter", |args| {
        let log_dir = args.take_str_or("log_dir", "logs")?;
        args.finish()?;
        let writer = JsonlWriter::new(&log_dir);
        Ok(Resolved::Shared(SharedInstance::Writer(Rc::new(
            RefCell::new(writer),
        ))))
    });

    cons.register("florapipe.logger.NullWriter", |args| {
        args.finish()?;
        Ok(Resolved::Shared(SharedInstance::Writer(Rc::new(
            RefCell::new(NullWriter),
        ))))
    });

    cons
}

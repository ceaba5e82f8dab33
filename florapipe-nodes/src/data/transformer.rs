//! Image transform stage and the built-in transforms

use std::any::Any;

use ndarray::{s, Axis, Ix3};

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::tensor::Tensor;
use florapipe_core::transform::{SharedTransform, Transform};

/// Applies an ordered list of transforms to each record's image
///
/// Transform instances come from the registry, so an augmentation chain
/// can be shared between pipelines. Dimension bookkeeping follows the
/// five-crop convention: the pre-transform dimensions move to `orig_*`.
pub struct Transformer {
    input: Upstream,
    transforms: Vec<SharedTransform>,
}

impl Transformer {
    /// Wrap `input`, applying `transforms` in order
    pub fn new(input: Box<dyn Node>, transforms: Vec<SharedTransform>) -> Self {
        Self {
            input: Upstream::new(input),
            transforms,
        }
    }
}

impl Node for Transformer {
    fn fullname(&self) -> &'static str {
        "Transformer"
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

        let mut image = rec.require("Transformer", "image")?.as_tensor()?.clone();
        let before = image.shape().to_vec();

        for transform in &self.transforms {
            image = transform.apply(&image)?;
        }

        if before.len() == 3 {
            rec.set("orig_channels", before[0] as i64);
            rec.set("orig_height", before[1] as i64);
            rec.set("orig_width", before[2] as i64);
        }
        if image.ndim() == 3 {
            rec.set("image_channels", image.shape()[0] as i64);
            rec.set("image_height", image.shape()[1] as i64);
            rec.set("image_width", image.shape()[2] as i64);
        }
        rec.set("image", image);
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

/// Crops the center `height` by `width` region of a `[C, H, W]` image
pub struct CenterCrop {
    height: usize,
    width: usize,
}

impl CenterCrop {
    /// Create a crop of the given output size
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::config("crop dimensions must be at least 1"));
        }
        Ok(Self { height, width })
    }
}

impl Transform for CenterCrop {
    fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let view = image.view().into_dimensionality::<Ix3>().map_err(|_| {
            Error::contract(format!(
                "expected a [C, H, W] image, got shape {:?}",
                image.shape()
            ))
        })?;

        let (full_h, full_w) = (view.shape()[1], view.shape()[2]);
        if full_h < self.height || full_w < self.width {
            return Err(Error::contract(format!(
                "image {full_h}x{full_w} is smaller than the {}x{} crop",
                self.height, self.width
            )));
        }

        let top = (full_h - self.height) / 2;
        let left = (full_w - self.width) / 2;
        Ok(view
            .slice(s![.., top..top + self.height, left..left + self.width])
            .to_owned()
            .into_dyn())
    }

    fn name(&self) -> &'static str {
        "CenterCrop"
    }
}

/// Normalizes each channel of a `[C, H, W]` image to `(x - mean) / std`
///
/// A single mean/std applies to every channel; otherwise one value per
/// channel is required.
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    /// Create a per-channel normalization
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.is_empty() || std.is_empty() {
            return Err(Error::config("mean and std must not be empty"));
        }
        if std.iter().any(|&s| s == 0.0) {
            return Err(Error::config("std must be non-zero"));
        }
        Ok(Self { mean, std })
    }

    fn factor(values: &[f32], channel: usize, channels: usize) -> Result<f32> {
        if values.len() == 1 {
            Ok(values[0])
        } else if values.len() == channels {
            Ok(values[channel])
        } else {
            Err(Error::contract(format!(
                "normalization has {} values for {channels} channels",
                values.len()
            )))
        }
    }
}

impl Transform for Normalize {
    fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let mut out = image.clone();
        let channels = out.shape()[0];
        for channel in 0..channels {
            let mean = Self::factor(&self.mean, channel, channels)?;
            let std = Self::factor(&self.std, channel, channels)?;
            out.index_axis_mut(Axis(0), channel)
                .mapv_inplace(|x| (x - mean) / std);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "Normalize"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlib::VecSource;
    use florapipe_core::node::drain;
    use ndarray::{ArrayD, IxDyn};
    use std::rc::Rc;

    fn image_record(height: usize, width: usize, fill: f32) -> Record {
        let mut rec = Record::new();
        rec.set("image", ArrayD::from_elem(IxDyn(&[3, height, width]), fill));
        rec
    }

    #[test]
    fn test_transforms_apply_in_order() {
        let source = Box::new(VecSource::new(vec![image_record(6, 6, 4.0)]));
        let transforms: Vec<SharedTransform> = vec![
            Rc::new(CenterCrop::new(2, 2).unwrap()),
            Rc::new(Normalize::new(vec![2.0], vec![2.0]).unwrap()),
        ];
        let mut node = Transformer::new(source, transforms);

        let records = drain(&mut node).unwrap();
        let image = records[0].get("image").unwrap().as_tensor().unwrap();
        assert_eq!(image.shape(), &[3, 2, 2]);
        assert_eq!(image[[0, 0, 0]], 1.0);

        assert_eq!(records[0].get("orig_height").unwrap().as_int().unwrap(), 6);
        assert_eq!(records[0].get("image_height").unwrap().as_int().unwrap(), 2);
    }

    #[test]
    fn test_normalize_per_channel() {
        let mut image: Tensor = ArrayD::zeros(IxDyn(&[2, 1, 1]));
        image[[0, 0, 0]] = 10.0;
        image[[1, 0, 0]] = 20.0;

        let norm = Normalize::new(vec![10.0, 10.0], vec![1.0, 5.0]).unwrap();
        let out = norm.apply(&image).unwrap();
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_normalize_channel_mismatch() {
        let image: Tensor = ArrayD::zeros(IxDyn(&[3, 1, 1]));
        let norm = Normalize::new(vec![1.0, 2.0], vec![1.0, 1.0]).unwrap();
        assert!(norm.apply(&image).is_err());
    }
}

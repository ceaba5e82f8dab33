//! Five-crop expansion stage

use std::any::Any;
use std::collections::VecDeque;

use ndarray::{s, Ix3};

use florapipe_core::error::{Error, Result};
use florapipe_core::node::{Node, Upstream};
use florapipe_core::record::Record;
use florapipe_core::tensor::Tensor;

/// Expands each record into five cropped copies
///
/// The four corner crops and the center crop, in that order (top-left,
/// top-right, bottom-left, bottom-right, center). Each copy keeps every
/// other field of the source record; the original dimensions move to the
/// `orig_*` fields and the `image_*` fields describe the crop.
pub struct FiveCrop {
    input: Upstream,
    height: usize,
    width: usize,
    pending: VecDeque<Record>,
}

impl FiveCrop {
    /// Wrap `input`, producing `height` by `width` crops
    pub fn new(input: Box<dyn Node>, height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::config("crop dimensions must be at least 1"));
        }
        Ok(Self {
            input: Upstream::new(input),
            height,
            width,
            pending: VecDeque::new(),
        })
    }

    fn expand(&mut self, rec: Record) -> Result<()> {
        let image = rec.require("FiveCrop", "image")?.as_tensor()?.clone();
        let view = image.view().into_dimensionality::<Ix3>().map_err(|_| {
            Error::contract(format!(
                "expected a [C, H, W] image, got shape {:?}",
                image.shape()
            ))
        })?;

        let (channels, full_h, full_w) = (view.shape()[0], view.shape()[1], view.shape()[2]);
        if full_h < self.height || full_w < self.width {
            return Err(Error::contract(format!(
                "image {full_h}x{full_w} is smaller than the {}x{} crop",
                self.height, self.width
            )));
        }

        let bottom = full_h - self.height;
        let right = full_w - self.width;
        let corners = [
            (0, 0),
            (0, right),
            (bottom, 0),
            (bottom, right),
            (bottom / 2, right / 2),
        ];

        for (top, left) in corners {
            let crop = view
                .slice(s![.., top..top + self.height, left..left + self.width])
                .to_owned()
                .into_dyn();

            let mut out = rec.clone();
            out.set("image", crop);
            out.set("orig_channels", channels as i64);
            out.set("orig_height", full_h as i64);
            out.set("orig_width", full_w as i64);
            out.set("image_channels", channels as i64);
            out.set("image_height", self.height as i64);
            out.set("image_width", self.width as i64);
            self.pending.push_back(out);
        }
        Ok(())
    }
}

impl Node for FiveCrop {
    fn fullname(&self) -> &'static str {
        "FiveCrop"
    }

    fn len(&self) -> usize {
        self.input.len() * 5
    }

    fn sample_count(&self) -> usize {
        self.input.sample_count() * 5
    }

    fn start(&mut self) -> Result<()> {
        self.input.start()?;
        self.pending.clear();
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if let Some(rec) = self.pending.pop_front() {
            return Ok(Some(rec));
        }
        match self.input.next_record()? {
            Some(rec) => {
                self.expand(rec)?;
                Ok(self.pending.pop_front())
            }
            None => Ok(None),
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

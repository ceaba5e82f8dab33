//! Tensor alias and small numeric helpers shared by pipeline stages

use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::{Error, Result};

/// Dense tensor of 32-bit floats with a dynamic number of dimensions
///
/// Images flow through the pipeline as `[C, H, W]`, batched images as
/// `[N, C, H, W]`, model outputs as `[N, K]` where `K` is the category count.
pub type Tensor = ArrayD<f32>;

/// Stack a list of equally shaped tensors along a new leading axis
pub fn stack(rows: &[Tensor]) -> Result<Tensor> {
    if rows.is_empty() {
        return Err(Error::contract("cannot stack an empty tensor list"));
    }

    let shape = rows[0].shape().to_vec();
    for row in &rows[1..] {
        if row.shape() != shape.as_slice() {
            return Err(Error::contract(format!(
                "cannot stack tensors of shapes {:?} and {:?}",
                shape,
                row.shape()
            )));
        }
    }

    let mut out_shape = Vec::with_capacity(shape.len() + 1);
    out_shape.push(rows.len());
    out_shape.extend_from_slice(&shape);

    let mut data = Vec::with_capacity(rows.len() * rows[0].len());
    for row in rows {
        data.extend(row.iter().copied());
    }

    ArrayD::from_shape_vec(IxDyn(&out_shape), data)
        .map_err(|e| Error::contract(format!("stack produced an invalid shape: {e}")))
}

/// Index of the maximum value along the last axis, one index per row
///
/// A 1-d tensor yields a single index; a 2-d `[N, K]` tensor yields `N`
/// indices.
pub fn argmax_rows(tensor: &Tensor) -> Vec<i64> {
    if tensor.ndim() <= 1 {
        return vec![argmax_slice(tensor.iter().copied())];
    }

    let last = Axis(tensor.ndim() - 1);
    tensor
        .lanes(last)
        .into_iter()
        .map(|lane| argmax_slice(lane.iter().copied()))
        .collect()
}

fn argmax_slice(values: impl Iterator<Item = f32>) -> i64 {
    let mut best_idx = 0i64;
    let mut best = f32::NEG_INFINITY;
    for (idx, v) in values.enumerate() {
        if v > best {
            best = v;
            best_idx = idx as i64;
        }
    }
    best_idx
}

/// Reduce a stacked `[S, …]` tensor along its leading axis by mean
pub fn reduce_mean(stacked: &Tensor) -> Tensor {
    let s = stacked.len_of(Axis(0)) as f32;
    let sum = stacked.sum_axis(Axis(0));
    sum / s
}

/// Reduce a stacked `[S, …]` tensor along its leading axis by sum
pub fn reduce_sum(stacked: &Tensor) -> Tensor {
    stacked.sum_axis(Axis(0))
}

/// Reduce a stacked `[S, …]` tensor along its leading axis by element max
pub fn reduce_max(stacked: &Tensor) -> Tensor {
    stacked.map_axis(Axis(0), |lane| {
        lane.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_stack_rows() {
        let a = arr2(&[[1.0f32, 2.0]]).into_dyn();
        let b = arr2(&[[3.0f32, 4.0]]).into_dyn();
        let stacked = stack(&[a, b]).unwrap();
        assert_eq!(stacked.shape(), &[2, 1, 2]);
    }

    #[test]
    fn test_stack_shape_mismatch() {
        let a = arr2(&[[1.0f32, 2.0]]).into_dyn();
        let b = arr2(&[[3.0f32, 4.0, 5.0]]).into_dyn();
        assert!(stack(&[a, b]).is_err());
    }

    #[test]
    fn test_argmax_rows() {
        let t = arr2(&[[0.1f32, 0.9, 0.0], [0.7, 0.1, 0.2]]).into_dyn();
        assert_eq!(argmax_rows(&t), vec![1, 0]);
    }

    #[test]
    fn test_reductions() {
        let t = arr2(&[[1.0f32, 4.0], [3.0, 2.0]]).into_dyn();
        assert_eq!(reduce_mean(&t).as_slice().unwrap(), &[2.0, 3.0]);
        assert_eq!(reduce_sum(&t).as_slice().unwrap(), &[4.0, 6.0]);
        assert_eq!(reduce_max(&t).as_slice().unwrap(), &[3.0, 4.0]);
    }
}

//! The ndarray <-> burn boundary.
//!
//! Batches, costs and couplings live on the host as `ndarray` values; models and losses work on
//! burn tensors. Tensors created here never carry a gradient tape, which is exactly what the
//! coupling needs.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::{Error, Result};

pub fn array2_to_tensor<B: Backend>(device: &B::Device, x: &ArrayView2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    // `iter()` walks in logical order, so non-contiguous views are fine.
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

pub fn array3_to_tensor<B: Backend>(device: &B::Device, x: &ArrayView3<f32>) -> Tensor<B, 3> {
    let (b, n, d) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [b, n, d]);
    Tensor::from_data(data, device)
}

pub fn tensor_to_array2<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [n, d] = t.dims();
    let v = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))?;
    Array2::from_shape_vec((n, d), v).map_err(|e| Error::Tensor(e.to_string()))
}

pub fn tensor_to_array3<B: Backend>(t: Tensor<B, 3>) -> Result<Array3<f32>> {
    let [b, n, d] = t.dims();
    let v = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))?;
    Array3::from_shape_vec((b, n, d), v).map_err(|e| Error::Tensor(e.to_string()))
}

/// Read a one-element tensor.
pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> Result<f32> {
    let v = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))?;
    match v.as_slice() {
        [x] => Ok(*x),
        _ => Err(Error::Tensor(format!(
            "expected a single element, got {}",
            v.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::{array, Array3};

    type B = NdArray<f32>;

    #[test]
    fn array2_survives_the_boundary() {
        let device = Default::default();
        let x = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let t = array2_to_tensor::<B>(&device, &x.view());
        assert_eq!(t.dims(), [2, 3]);
        assert_eq!(tensor_to_array2(t).unwrap(), x);
    }

    #[test]
    fn transposed_view_keeps_logical_order() {
        let device = Default::default();
        let x = array![[1.0f32, 2.0], [3.0, 4.0]];
        let t = array2_to_tensor::<B>(&device, &x.t());
        assert_eq!(tensor_to_array2(t).unwrap(), x.t().to_owned());
    }

    #[test]
    fn array3_and_scalar() {
        let device = Default::default();
        let x = Array3::<f32>::from_shape_fn((2, 3, 3), |(b, n, d)| (b * 9 + n * 3 + d) as f32);
        let t = array3_to_tensor::<B>(&device, &x.view());
        assert_eq!(tensor_to_array3(t.clone()).unwrap(), x);
        let s = scalar(t.sum()).unwrap();
        assert!((s - (0..18).sum::<usize>() as f32).abs() < 1e-4);
    }
}

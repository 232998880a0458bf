//! Moving data between ndarray and burn.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ndarray::prelude::*;

use crate::errors::{HempSegError, Result};

pub fn array_to_tensor<B: Backend>(array: ArrayView4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let shape = array.shape().to_vec();
    let values: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 4>) -> Result<Array4<f32>> {
    let [b, c, h, w] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| HempSegError::Model {
            operation: "tensor readback".to_string(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{e:?}"),
            )),
        })?;
    Ok(Array4::from_shape_vec((b, c, h, w), values)?)
}

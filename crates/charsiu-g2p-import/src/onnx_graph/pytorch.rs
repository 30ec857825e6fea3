use super::Error;
use super::operators::{self, Binary, Constant, Unary};
use super::tensor::{Shape, Tensor, TensorData};
use super::weights::WeightManager;
use std::sync::Arc;

pub fn scalar_f32(value: f32) -> Arc<dyn Tensor> {
    Constant::new(None, TensorData::scalar(value))
}

pub fn scalar_i64(value: i64) -> Arc<dyn Tensor> {
    Constant::new(None, TensorData::scalar(value))
}

pub fn constant_i64(values: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    let len = values.len();
    Ok(Constant::new(None, TensorData::new(values.into(), Shape::from(vec![len]))?))
}

/// `nn.Linear` with the weight stored as `[out_features, in_features]`.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let name = weight_manager.get_prefix().map(|x| x.to_string());
    let weight = operators::Transpose::new(None, weight_manager.get_tensor("weight")?, Some(vec![1, 0]))?;
    let mat_out = operators::MatMul::new(name.clone(), input, weight)?;
    if weight_manager.has_tensor("bias") {
        Ok(Binary::add(name.map(|x| format!("{x}.bias")), mat_out, weight_manager.get_tensor("bias")?)?)
    } else {
        Ok(mat_out)
    }
}

/// T5 layer norm: scale only, no mean subtraction and no bias.
pub fn rms_layer_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<dyn Tensor>, Error> {
    let name = weight_manager.get_prefix().map(|x| x.to_string());
    let squared = Binary::mul(None, input.clone(), input.clone())?;
    let variance = operators::ReduceMean::new(None, squared, vec![-1], true)?;
    let denom = Unary::sqrt(None, Binary::add(None, variance, scalar_f32(epsilon))?);
    let normalized = Binary::div(None, input, denom)?;
    Ok(Binary::mul(name, weight_manager.get_tensor("weight")?, normalized)?)
}

pub fn reshape(input: Arc<dyn Tensor>, shape: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Reshape::new(None, input, constant_i64(shape)?)?)
}

pub fn transpose(input: Arc<dyn Tensor>, perm: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Transpose::new(None, input, Some(perm))?)
}

pub fn unsqueeze(input: Arc<dyn Tensor>, axes: Vec<i64>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(operators::Unsqueeze::new(None, input, constant_i64(axes)?)?)
}

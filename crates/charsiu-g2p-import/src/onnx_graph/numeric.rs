use super::tensor::DType;
use ndarray::{Array3, ArrayD, Axis, IxDyn, Zip};

#[derive(Debug, thiserror::Error)]
pub enum NumericError {
    #[error("Shapes {0:?} and {1:?} cannot be broadcast together")]
    BroadcastError(Vec<usize>, Vec<usize>),
    #[error("{0} does not support dtype {1}")]
    UnsupportedDType(&'static str, DType),
    #[error("{0} got mismatched dtypes {1} and {2}")]
    DTypeMismatch(&'static str, DType, DType),
    #[error("Axis {0} is out of range for rank {1}")]
    InvalidAxis(i64, usize),
    #[error("Index {0} is out of range for dimension of size {1}")]
    IndexOutOfRange(i64, usize),
    #[error("Cannot reshape {0:?} to {1:?}")]
    ReshapeError(Vec<usize>, Vec<i64>),
    #[error("MatMul operands {0:?} and {1:?} are incompatible")]
    MatMulShapeError(Vec<usize>, Vec<usize>),
    #[error("{0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString, strum_macros::AsRefStr)]
pub enum WhichBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Less,
    Greater,
}

impl WhichBinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, WhichBinaryOp::Less | WhichBinaryOp::Greater)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString, strum_macros::AsRefStr)]
pub enum WhichUnaryOp {
    Abs,
    Neg,
    Sqrt,
    Log,
    Tanh,
    Relu,
}

/// Dense host tensor used for export-time folding and reference execution.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericTensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

macro_rules! map_any {
    ($t:expr, $a:ident => $body:expr) => {
        match $t {
            NumericTensor::F32($a) => NumericTensor::F32($body),
            NumericTensor::I64($a) => NumericTensor::I64($body),
            NumericTensor::Bool($a) => NumericTensor::Bool($body),
        }
    };
}

impl NumericTensor {
    pub fn dtype(&self) -> DType {
        match self {
            NumericTensor::F32(_) => DType::F32,
            NumericTensor::I64(_) => DType::I64,
            NumericTensor::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            NumericTensor::F32(x) => x.shape(),
            NumericTensor::I64(x) => x.shape(),
            NumericTensor::Bool(x) => x.shape(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn from_f32(values: Vec<f32>, shape: &[usize]) -> Result<Self, NumericError> {
        Ok(NumericTensor::F32(
            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|x| NumericError::InvalidInput(x.to_string()))?,
        ))
    }

    pub fn from_i64(values: Vec<i64>, shape: &[usize]) -> Result<Self, NumericError> {
        Ok(NumericTensor::I64(
            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|x| NumericError::InvalidInput(x.to_string()))?,
        ))
    }

    pub fn scalar_i64(value: i64) -> Self {
        NumericTensor::I64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>, NumericError> {
        match self {
            NumericTensor::F32(x) => Ok(x),
            x => Err(NumericError::UnsupportedDType("as_f32", x.dtype())),
        }
    }

    pub fn as_i64(&self) -> Result<&ArrayD<i64>, NumericError> {
        match self {
            NumericTensor::I64(x) => Ok(x),
            x => Err(NumericError::UnsupportedDType("as_i64", x.dtype())),
        }
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>, NumericError> {
        Ok(self.as_i64()?.iter().copied().collect())
    }

    /// Largest absolute elementwise difference between two float tensors of the same shape.
    pub fn max_abs_diff(&self, other: &NumericTensor) -> Result<f32, NumericError> {
        let (a, b) = (self.as_f32()?, other.as_f32()?);
        if a.shape() != b.shape() {
            return Err(NumericError::BroadcastError(a.shape().to_vec(), b.shape().to_vec()));
        }
        Ok(Zip::from(a).and(b).fold(0.0f32, |m, x, y| m.max((x - y).abs())))
    }
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, NumericError> {
    let adjusted = if axis < 0 { axis + rank as i64 } else { axis };
    if adjusted < 0 || adjusted >= rank as i64 {
        return Err(NumericError::InvalidAxis(axis, rank));
    }
    Ok(adjusted as usize)
}

pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, NumericError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(NumericError::BroadcastError(a.to_vec(), b.to_vec()));
        };
    }
    Ok(out)
}

fn zip_broadcast<A, B, O>(a: &ArrayD<A>, b: &ArrayD<B>, f: impl Fn(&A, &B) -> O) -> Result<ArrayD<O>, NumericError> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let err = || NumericError::BroadcastError(a.shape().to_vec(), b.shape().to_vec());
    let av = a.broadcast(shape.as_slice()).ok_or_else(err)?;
    let bv = b.broadcast(shape.as_slice()).ok_or_else(err)?;
    Ok(Zip::from(av).and(bv).map_collect(|x, y| f(x, y)))
}

pub fn binary(op: WhichBinaryOp, a: &NumericTensor, b: &NumericTensor) -> Result<NumericTensor, NumericError> {
    let name = "binary";
    Ok(match (a, b) {
        (NumericTensor::F32(a), NumericTensor::F32(b)) => match op {
            WhichBinaryOp::Add => NumericTensor::F32(zip_broadcast(a, b, |x, y| x + y)?),
            WhichBinaryOp::Sub => NumericTensor::F32(zip_broadcast(a, b, |x, y| x - y)?),
            WhichBinaryOp::Mul => NumericTensor::F32(zip_broadcast(a, b, |x, y| x * y)?),
            WhichBinaryOp::Div => NumericTensor::F32(zip_broadcast(a, b, |x, y| x / y)?),
            WhichBinaryOp::Min => NumericTensor::F32(zip_broadcast(a, b, |x, y| x.min(*y))?),
            WhichBinaryOp::Less => NumericTensor::Bool(zip_broadcast(a, b, |x, y| x < y)?),
            WhichBinaryOp::Greater => NumericTensor::Bool(zip_broadcast(a, b, |x, y| x > y)?),
        },
        (NumericTensor::I64(a), NumericTensor::I64(b)) => match op {
            WhichBinaryOp::Add => NumericTensor::I64(zip_broadcast(a, b, |x, y| x.wrapping_add(*y))?),
            WhichBinaryOp::Sub => NumericTensor::I64(zip_broadcast(a, b, |x, y| x.wrapping_sub(*y))?),
            WhichBinaryOp::Mul => NumericTensor::I64(zip_broadcast(a, b, |x, y| x.wrapping_mul(*y))?),
            WhichBinaryOp::Div => NumericTensor::I64(zip_broadcast(a, b, |x, y| x.checked_div(*y).unwrap_or(0))?),
            WhichBinaryOp::Min => NumericTensor::I64(zip_broadcast(a, b, |x, y| *x.min(y))?),
            WhichBinaryOp::Less => NumericTensor::Bool(zip_broadcast(a, b, |x, y| x < y)?),
            WhichBinaryOp::Greater => NumericTensor::Bool(zip_broadcast(a, b, |x, y| x > y)?),
        },
        (NumericTensor::Bool(_), NumericTensor::Bool(_)) => Err(NumericError::UnsupportedDType(name, DType::Bool))?,
        (a, b) => Err(NumericError::DTypeMismatch(name, a.dtype(), b.dtype()))?,
    })
}

pub fn unary(op: WhichUnaryOp, input: &NumericTensor) -> Result<NumericTensor, NumericError> {
    Ok(match input {
        NumericTensor::F32(x) => NumericTensor::F32(match op {
            WhichUnaryOp::Abs => x.mapv(f32::abs),
            WhichUnaryOp::Neg => x.mapv(|v| -v),
            WhichUnaryOp::Sqrt => x.mapv(f32::sqrt),
            WhichUnaryOp::Log => x.mapv(f32::ln),
            WhichUnaryOp::Tanh => x.mapv(f32::tanh),
            WhichUnaryOp::Relu => x.mapv(|v| v.max(0.0)),
        }),
        NumericTensor::I64(x) => NumericTensor::I64(match op {
            WhichUnaryOp::Abs => x.mapv(i64::wrapping_abs),
            WhichUnaryOp::Neg => x.mapv(i64::wrapping_neg),
            WhichUnaryOp::Relu => x.mapv(|v| v.max(0)),
            _ => Err(NumericError::UnsupportedDType("unary", DType::I64))?,
        }),
        NumericTensor::Bool(_) => Err(NumericError::UnsupportedDType("unary", DType::Bool))?,
    })
}

pub fn cast(input: &NumericTensor, to: DType) -> NumericTensor {
    match (input, to) {
        (NumericTensor::F32(x), DType::I64) => NumericTensor::I64(x.mapv(|v| v as i64)),
        (NumericTensor::F32(x), DType::Bool) => NumericTensor::Bool(x.mapv(|v| v != 0.0)),
        (NumericTensor::I64(x), DType::F32) => NumericTensor::F32(x.mapv(|v| v as f32)),
        (NumericTensor::I64(x), DType::Bool) => NumericTensor::Bool(x.mapv(|v| v != 0)),
        (NumericTensor::Bool(x), DType::F32) => NumericTensor::F32(x.mapv(|v| if v { 1.0 } else { 0.0 })),
        (NumericTensor::Bool(x), DType::I64) => NumericTensor::I64(x.mapv(i64::from)),
        (x, _) => x.clone(),
    }
}

pub fn where_op(condition: &NumericTensor, x: &NumericTensor, y: &NumericTensor) -> Result<NumericTensor, NumericError> {
    let NumericTensor::Bool(c) = condition else {
        return Err(NumericError::UnsupportedDType("Where", condition.dtype()));
    };
    fn select<T: Clone>(c: &ArrayD<bool>, x: &ArrayD<T>, y: &ArrayD<T>) -> Result<ArrayD<T>, NumericError> {
        let shape = broadcast_shape(&broadcast_shape(c.shape(), x.shape())?, y.shape())?;
        let err = || NumericError::BroadcastError(x.shape().to_vec(), y.shape().to_vec());
        let cv = c.broadcast(shape.as_slice()).ok_or_else(err)?;
        let xv = x.broadcast(shape.as_slice()).ok_or_else(err)?;
        let yv = y.broadcast(shape.as_slice()).ok_or_else(err)?;
        Ok(Zip::from(cv).and(xv).and(yv).map_collect(|c, x, y| if *c { x.clone() } else { y.clone() }))
    }
    Ok(match (x, y) {
        (NumericTensor::F32(x), NumericTensor::F32(y)) => NumericTensor::F32(select(c, x, y)?),
        (NumericTensor::I64(x), NumericTensor::I64(y)) => NumericTensor::I64(select(c, x, y)?),
        (NumericTensor::Bool(x), NumericTensor::Bool(y)) => NumericTensor::Bool(select(c, x, y)?),
        (x, y) => Err(NumericError::DTypeMismatch("Where", x.dtype(), y.dtype()))?,
    })
}

fn gather_array<T: Clone>(data: &ArrayD<T>, indices: &ArrayD<i64>, axis: usize) -> Result<ArrayD<T>, NumericError> {
    let axis_len = data.shape()[axis];
    let mut out_shape = data.shape()[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&data.shape()[axis + 1..]);

    let outer: usize = data.shape()[..axis].iter().product();
    let inner: usize = data.shape()[axis + 1..].iter().product();
    let data = data.as_standard_layout();
    let flat = data
        .as_slice()
        .ok_or_else(|| NumericError::InvalidInput("Gather data is not contiguous".to_string()))?;

    let mut values = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &index in indices.iter() {
            let i = if index < 0 { index + axis_len as i64 } else { index };
            if i < 0 || i >= axis_len as i64 {
                return Err(NumericError::IndexOutOfRange(index, axis_len));
            }
            let base = (o * axis_len + i as usize) * inner;
            values.extend_from_slice(&flat[base..base + inner]);
        }
    }
    ArrayD::from_shape_vec(IxDyn(&out_shape), values).map_err(|x| NumericError::InvalidInput(x.to_string()))
}

pub fn gather(data: &NumericTensor, indices: &NumericTensor, axis: i64) -> Result<NumericTensor, NumericError> {
    let indices = indices.as_i64()?;
    let axis = normalize_axis(axis, data.rank())?;
    Ok(map_any!(data, x => gather_array(x, indices, axis)?))
}

pub fn matmul(a: &NumericTensor, b: &NumericTensor) -> Result<NumericTensor, NumericError> {
    let (a, b) = (a.as_f32()?, b.as_f32()?);
    let (ra, rb) = (a.ndim(), b.ndim());
    let shape_err = || NumericError::MatMulShapeError(a.shape().to_vec(), b.shape().to_vec());
    if ra < 2 || rb < 2 {
        return Err(shape_err());
    }
    let (m, k) = (a.shape()[ra - 2], a.shape()[ra - 1]);
    let (k2, n) = (b.shape()[rb - 2], b.shape()[rb - 1]);
    if k != k2 {
        return Err(shape_err());
    }
    let batch = broadcast_shape(&a.shape()[..ra - 2], &b.shape()[..rb - 2])?;
    let num_batches: usize = batch.iter().product();

    let mut a_full = batch.clone();
    a_full.extend([m, k]);
    let mut b_full = batch.clone();
    b_full.extend([k, n]);
    let a3 = a
        .broadcast(a_full.as_slice())
        .ok_or_else(shape_err)?
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((num_batches, m, k))
        .map_err(|x| NumericError::InvalidInput(x.to_string()))?;
    let b3 = b
        .broadcast(b_full.as_slice())
        .ok_or_else(shape_err)?
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((num_batches, k, n))
        .map_err(|x| NumericError::InvalidInput(x.to_string()))?;

    let mut out = Array3::<f32>::zeros((num_batches, m, n));
    for i in 0..num_batches {
        let r = a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i));
        out.index_axis_mut(Axis(0), i).assign(&r);
    }
    let mut out_shape = batch;
    out_shape.extend([m, n]);
    Ok(NumericTensor::F32(
        out.into_shape_with_order(out_shape).map_err(|x| NumericError::InvalidInput(x.to_string()))?,
    ))
}

pub fn reduce_mean(input: &NumericTensor, axes: &[i64], keepdims: bool) -> Result<NumericTensor, NumericError> {
    let x = input.as_f32()?;
    let rank = x.ndim();
    let mut axes = if axes.is_empty() {
        (0..rank).collect::<Vec<_>>()
    } else {
        axes.iter().map(|a| normalize_axis(*a, rank)).collect::<Result<Vec<_>, _>>()?
    };
    axes.sort_unstable();
    axes.dedup();
    let mut out = x.clone();
    for &axis in axes.iter().rev() {
        out = out
            .mean_axis(Axis(axis))
            .ok_or_else(|| NumericError::InvalidInput("ReduceMean over an empty axis".to_string()))?;
        if keepdims {
            out = out.insert_axis(Axis(axis));
        }
    }
    Ok(NumericTensor::F32(out))
}

pub fn softmax(input: &NumericTensor, axis: i64) -> Result<NumericTensor, NumericError> {
    let x = input.as_f32()?;
    let axis = normalize_axis(axis, x.ndim())?;
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(NumericTensor::F32(out))
}

pub fn transpose(input: &NumericTensor, perm: Option<&[i64]>) -> Result<NumericTensor, NumericError> {
    let rank = input.rank();
    let perm: Vec<usize> = match perm {
        Some(perm) => perm.iter().map(|a| normalize_axis(*a, rank)).collect::<Result<_, _>>()?,
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    for &p in &perm {
        if seen[p] {
            return Err(NumericError::InvalidInput(format!("Invalid permutation {perm:?}")));
        }
        seen[p] = true;
    }
    if perm.len() != rank {
        return Err(NumericError::InvalidInput(format!("Invalid permutation {perm:?}")));
    }
    Ok(map_any!(input, x => x.clone().permuted_axes(perm.clone()).as_standard_layout().into_owned()))
}

/// Resolves an ONNX `Reshape` target (with `0` copy and `-1` infer entries) against an input shape.
pub fn resolve_reshape(input: &[usize], target: &[i64]) -> Result<Vec<usize>, NumericError> {
    let err = || NumericError::ReshapeError(input.to_vec(), target.to_vec());
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(target.len());
    let mut infer = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            0 => out.push(*input.get(i).ok_or_else(err)?),
            -1 => {
                if infer.is_some() {
                    return Err(err());
                }
                infer = Some(i);
                out.push(1);
            }
            d if d > 0 => out.push(d as usize),
            _ => return Err(err()),
        }
    }
    if let Some(i) = infer {
        let known: usize = out.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, v)| *v).product();
        if known == 0 || total % known != 0 {
            return Err(err());
        }
        out[i] = total / known;
    }
    if out.iter().product::<usize>() != total {
        return Err(err());
    }
    Ok(out)
}

pub fn reshape(input: &NumericTensor, target: &[i64]) -> Result<NumericTensor, NumericError> {
    let out_shape = resolve_reshape(input.shape(), target)?;
    let err = |x: ndarray::ShapeError| NumericError::InvalidInput(x.to_string());
    Ok(map_any!(input, x => x.as_standard_layout().into_owned().into_shape_with_order(out_shape.clone()).map_err(err)?))
}

pub fn unsqueeze(input: &NumericTensor, axes: &[i64]) -> Result<NumericTensor, NumericError> {
    let out_rank = input.rank() + axes.len();
    let mut axes = axes.iter().map(|a| normalize_axis(*a, out_rank)).collect::<Result<Vec<_>, _>>()?;
    axes.sort_unstable();
    if axes.windows(2).any(|w| w[0] == w[1]) {
        return Err(NumericError::InvalidInput(format!("Duplicate unsqueeze axes {axes:?}")));
    }
    let mut out = input.clone();
    for axis in axes {
        out = map_any!(out, x => x.insert_axis(Axis(axis)));
    }
    Ok(out)
}

pub fn shape_of(input: &NumericTensor, start: Option<i64>, end: Option<i64>) -> NumericTensor {
    let rank = input.rank() as i64;
    let clamp = |v: i64| (if v < 0 { v + rank } else { v }).clamp(0, rank) as usize;
    let start = clamp(start.unwrap_or(0));
    let end = clamp(end.unwrap_or(rank));
    let dims: Vec<i64> = input.shape()[start..end.max(start)].iter().map(|x| *x as i64).collect();
    let len = dims.len();
    NumericTensor::I64(ArrayD::from_shape_vec(IxDyn(&[len]), dims).unwrap_or_else(|_| ArrayD::from_elem(IxDyn(&[0]), 0)))
}

pub fn range(start: &NumericTensor, limit: &NumericTensor, delta: &NumericTensor) -> Result<NumericTensor, NumericError> {
    fn first<T: Copy>(x: &ArrayD<T>) -> Result<T, NumericError> {
        x.iter().next().copied().ok_or_else(|| NumericError::InvalidInput("Range expects scalar inputs".to_string()))
    }
    Ok(match (start, limit, delta) {
        (NumericTensor::I64(s), NumericTensor::I64(l), NumericTensor::I64(d)) => {
            let (s, l, d) = (first(s)?, first(l)?, first(d)?);
            if d == 0 {
                return Err(NumericError::InvalidInput("Range delta must be non-zero".to_string()));
            }
            let n = ((l - s) as f64 / d as f64).ceil().max(0.0) as usize;
            let values: Vec<i64> = (0..n).map(|i| s + i as i64 * d).collect();
            NumericTensor::I64(ArrayD::from_shape_vec(IxDyn(&[n]), values).map_err(|x| NumericError::InvalidInput(x.to_string()))?)
        }
        (NumericTensor::F32(s), NumericTensor::F32(l), NumericTensor::F32(d)) => {
            let (s, l, d) = (first(s)?, first(l)?, first(d)?);
            if d == 0.0 {
                return Err(NumericError::InvalidInput("Range delta must be non-zero".to_string()));
            }
            let n = ((l - s) / d).ceil().max(0.0) as usize;
            let values: Vec<f32> = (0..n).map(|i| s + i as f32 * d).collect();
            NumericTensor::F32(ArrayD::from_shape_vec(IxDyn(&[n]), values).map_err(|x| NumericError::InvalidInput(x.to_string()))?)
        }
        (s, l, _) => Err(NumericError::DTypeMismatch("Range", s.dtype(), l.dtype()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(values: &[f32], shape: &[usize]) -> NumericTensor {
        NumericTensor::from_f32(values.to_vec(), shape).unwrap()
    }

    #[test]
    fn binary_broadcasts_row_against_column() {
        let a = f32_tensor(&[1.0, 2.0, 3.0], &[1, 3]);
        let b = f32_tensor(&[10.0, 20.0], &[2, 1]);
        let out = binary(WhichBinaryOp::Add, &a, &b).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out, f32_tensor(&[11.0, 12.0, 13.0, 21.0, 22.0, 23.0], &[2, 3]));
    }

    #[test]
    fn binary_rejects_incompatible_shapes() {
        let a = f32_tensor(&[1.0, 2.0, 3.0], &[3]);
        let b = f32_tensor(&[1.0, 2.0], &[2]);
        assert!(matches!(binary(WhichBinaryOp::Mul, &a, &b), Err(NumericError::BroadcastError(..))));
    }

    #[test]
    fn gather_embeds_token_rows() {
        let table = f32_tensor(&[0.0, 0.5, 1.0, 1.5, 2.0, 2.5], &[3, 2]);
        let ids = NumericTensor::from_i64(vec![2, 0, -1, 1], &[2, 2]).unwrap();
        let out = gather(&table, &ids, 0).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        assert_eq!(out, f32_tensor(&[2.0, 2.5, 0.0, 0.5, 2.0, 2.5, 1.0, 1.5], &[2, 2, 2]));
    }

    #[test]
    fn gather_scalar_index_drops_axis() {
        let shape = NumericTensor::from_i64(vec![4, 7], &[2]).unwrap();
        let out = gather(&shape, &NumericTensor::scalar_i64(1), 0).unwrap();
        assert_eq!(out, NumericTensor::scalar_i64(7));
    }

    #[test]
    fn matmul_broadcasts_batch_dims() {
        let a = f32_tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2]);
        let b = f32_tensor(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
        let out = matmul(&a, &b).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = f32_tensor(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3]);
        let out = softmax(&x, -1).unwrap();
        let out = out.as_f32().unwrap();
        for row in out.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn reshape_copies_and_infers() {
        let x = f32_tensor(&[0.0; 24], &[2, 3, 4]);
        assert_eq!(reshape(&x, &[0, 0, 2, 2]).unwrap().shape(), &[2, 3, 2, 2]);
        assert_eq!(reshape(&x, &[0, -1]).unwrap().shape(), &[2, 12]);
        assert!(reshape(&x, &[5, -1]).is_err());
    }

    #[test]
    fn range_and_relative_positions() {
        let r = range(&NumericTensor::scalar_i64(0), &NumericTensor::scalar_i64(3), &NumericTensor::scalar_i64(1)).unwrap();
        let ctx = unsqueeze(&r, &[1]).unwrap();
        let mem = unsqueeze(&r, &[0]).unwrap();
        let rel = binary(WhichBinaryOp::Sub, &mem, &ctx).unwrap();
        assert_eq!(rel, NumericTensor::from_i64(vec![0, 1, 2, -1, 0, 1, -2, -1, 0], &[3, 3]).unwrap());
    }

    #[test]
    fn shape_of_slices_dimensions() {
        let x = f32_tensor(&[0.0; 6], &[1, 2, 3]);
        assert_eq!(shape_of(&x, Some(1), Some(2)), NumericTensor::from_i64(vec![2], &[1]).unwrap());
        assert_eq!(shape_of(&x, None, None), NumericTensor::from_i64(vec![1, 2, 3], &[3]).unwrap());
    }

    #[test]
    fn where_selects_with_broadcast() {
        let c = NumericTensor::Bool(ArrayD::from_shape_vec(IxDyn(&[2]), vec![true, false]).unwrap());
        let x = f32_tensor(&[1.0], &[1]);
        let y = f32_tensor(&[5.0, 6.0], &[2]);
        assert_eq!(where_op(&c, &x, &y).unwrap(), f32_tensor(&[1.0, 6.0], &[2]));
    }
}

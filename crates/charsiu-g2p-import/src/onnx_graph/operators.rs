use super::Error;
use super::node::{Node, SingleOutputNode, attr_int, attr_ints, attr_tensor};
use super::numeric::{self, NumericTensor, WhichBinaryOp, WhichUnaryOp};
use super::onnx::AttributeProto;
use super::tensor::{DType, Dimension, Shape, Tensor, TensorData};
use std::sync::Arc;

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if dtype != DType::I64 {
        Err(Error::InvalidDTypeError)?;
    }
    Ok(())
}

fn expect_inputs(inputs: &[NumericTensor], count: usize) -> Result<&[NumericTensor], Error> {
    if inputs.len() != count {
        return Err(Error::InvalidInputError(format!("expected {count} inputs, got {}", inputs.len())));
    }
    Ok(inputs)
}

fn broadcast_dims(a: &Shape, b: &Shape) -> Result<Shape, Error> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = (i + a.rank()).checked_sub(rank).map(|j| &a[j]);
        let db = (i + b.rank()).checked_sub(rank).map(|j| &b[j]);
        dims.push(match (da, db) {
            (Some(da), None) => da.clone(),
            (None, Some(db)) => db.clone(),
            (Some(da), Some(db)) => {
                if da.as_ref() == db.as_ref() || db.value == Some(1) {
                    da.clone()
                } else if da.value == Some(1) {
                    db.clone()
                } else if da.value.is_none() && db.value.is_some() {
                    db.clone()
                } else if da.is_compatible(db) {
                    da.clone()
                } else {
                    Err(Error::InputShapeError(format!("cannot broadcast {a} with {b}")))?
                }
            }
            (None, None) => unreachable!(),
        });
    }
    Ok(Shape::new(dims))
}

pub struct Binary {
    name: Option<String>,
    which: WhichBinaryOp,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_shape: Shape,
    output_dtype: DType,
}

impl Binary {
    pub fn new(name: Option<String>, which: WhichBinaryOp, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
        }
        let output_shape = broadcast_dims(a.shape(), b.shape())?;
        let output_dtype = if which.is_comparison() { DType::Bool } else { a.dtype() };
        Ok(Arc::new(Self { name, which, a, b, output_shape, output_dtype }))
    }

    pub fn add(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Add, a, b)
    }

    pub fn sub(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Sub, a, b)
    }

    pub fn mul(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Mul, a, b)
    }

    pub fn div(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Div, a, b)
    }

    pub fn min(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Min, a, b)
    }

    pub fn less(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Less, a, b)
    }

    pub fn greater(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        Self::new(name, WhichBinaryOp::Greater, a, b)
    }
}

impl Node for Binary {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        self.which.as_ref()
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 2)?;
        Ok(numeric::binary(self.which, &inputs[0], &inputs[1])?)
    }
}

impl SingleOutputNode for Binary {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Unary {
    name: Option<String>,
    which: WhichUnaryOp,
    input: Arc<dyn Tensor>,
}

impl Unary {
    pub fn new(name: Option<String>, which: WhichUnaryOp, input: Arc<dyn Tensor>) -> Arc<Self> {
        Arc::new(Self { name, which, input })
    }

    pub fn sqrt(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Sqrt, input)
    }

    pub fn tanh(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Tanh, input)
    }

    pub fn relu(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Relu, input)
    }

    pub fn abs(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Abs, input)
    }

    pub fn neg(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Neg, input)
    }

    pub fn log(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        Self::new(name, WhichUnaryOp::Log, input)
    }
}

impl Node for Unary {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        self.which.as_ref()
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::unary(self.which, &inputs[0])?)
    }
}

impl SingleOutputNode for Unary {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType,
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast { name, input, to })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Cast"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        vec![attr_int("to", super::onnx::tensor_proto::DataType::from(self.to) as i64)]
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::cast(&inputs[0], self.to))
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

pub struct Where {
    name: Option<String>,
    condition: Arc<dyn Tensor>,
    x: Arc<dyn Tensor>,
    y: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl Where {
    pub fn new(name: Option<String>, condition: Arc<dyn Tensor>, x: Arc<dyn Tensor>, y: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if condition.dtype() != DType::Bool {
            return Err(Error::InvalidDTypeError);
        }
        if x.dtype() != y.dtype() {
            return Err(Error::DTypeMismatchError(x.dtype(), y.dtype()));
        }
        let output_shape = broadcast_dims(&broadcast_dims(condition.shape(), x.shape())?, y.shape())?;
        Ok(Arc::new(Self { name, condition, x, y, output_shape }))
    }
}

impl Node for Where {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.condition.as_ref(), self.x.as_ref(), self.y.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Where"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 3)?;
        Ok(numeric::where_op(&inputs[0], &inputs[1], &inputs[2])?)
    }
}

impl SingleOutputNode for Where {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.x.dtype()
    }
}

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape,
    dtype: DType,
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        validate_index_dtype(indices.dtype())?;
        let data_shape = data.shape();
        let axis_index = data_shape.normalize_axis(axis)?;
        let mut output_dims = data_shape.dims[..axis_index].to_vec();
        output_dims.extend_from_slice(&indices.shape().dims);
        output_dims.extend_from_slice(&data_shape.dims[axis_index + 1..]);
        let dtype = data.dtype();
        Ok(Arc::new(Self { name, data, indices, axis, output_shape: Shape::new(output_dims), dtype }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Gather"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 2)?;
        Ok(numeric::gather(&inputs[0], &inputs[1], self.axis)?)
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_dtype: DType,
    output_shape: Shape,
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            Err(Error::DTypeMismatchError(a.dtype(), b.dtype()))?
        }
        if a.rank() < 2 || b.rank() < 2 {
            Err(Error::InputShapeError(format!("MatMul needs rank >= 2 operands, got {} and {}", a.shape(), b.shape())))?
        }
        let (a_shape, b_shape) = (a.shape(), b.shape());
        if !a_shape.dim(-1).is_compatible(b_shape.dim(-2)) {
            Err(Error::InputShapeError(format!("MatMul inner dimensions differ: {a_shape} x {b_shape}")))?
        }
        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = broadcast_dims(&a_batch, &b_batch)?.dims;
        output_dims.push(a_shape.dim(-2).clone());
        output_dims.push(b_shape.dim(-1).clone());

        let output_dtype = a.dtype();
        Ok(Arc::new(MatMul { name, a, b, output_dtype, output_shape: Shape::new(output_dims) }))
    }
}

impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 2)?;
        Ok(numeric::matmul(&inputs[0], &inputs[1])?)
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct ReduceMean {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Vec<i64>,
    keepdims: bool,
    output_shape: Shape,
}

impl ReduceMean {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: Vec<i64>, keepdims: bool) -> Result<Arc<Self>, Error> {
        let shape = input.shape();
        let reduced = axes.iter().map(|a| shape.normalize_axis(*a)).collect::<Result<Vec<_>, _>>()?;
        let mut output_dims = vec![];
        for (i, dim) in shape.dims.iter().enumerate() {
            if !reduced.contains(&i) {
                output_dims.push(dim.clone());
            } else if keepdims {
                output_dims.push(Dimension::known(1));
            }
        }
        Ok(Arc::new(Self { name, input, axes, keepdims, output_shape: Shape::new(output_dims) }))
    }
}

impl Node for ReduceMean {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "ReduceMean"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        vec![attr_ints("axes", self.axes.clone()), attr_int("keepdims", self.keepdims as i64)]
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::reduce_mean(&inputs[0], &self.axes, self.keepdims)?)
    }
}

impl SingleOutputNode for ReduceMean {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64,
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: Option<i64>) -> Arc<Self> {
        Arc::new(Self { name, input, axis: axis.unwrap_or(-1) })
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::softmax(&inputs[0], self.axis)?)
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Option<Vec<i64>>,
    output_shape: Shape,
}

impl Transpose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<i64>>) -> Result<Arc<Self>, Error> {
        let dims = &input.shape().dims;
        let output_shape = match &perm {
            Some(perm) => {
                let mut out = vec![];
                for p in perm {
                    out.push(dims[input.shape().normalize_axis(*p)?].clone());
                }
                if out.len() != dims.len() {
                    Err(Error::InvalidInputError(format!("permutation {perm:?} does not match rank {}", dims.len())))?
                }
                Shape::new(out)
            }
            None => Shape::new(dims.iter().rev().cloned().collect()),
        };
        Ok(Arc::new(Self { name, input, perm, output_shape }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        match &self.perm {
            Some(perm) => vec![attr_ints("perm", perm.clone())],
            None => vec![],
        }
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::transpose(&inputs[0], self.perm.as_deref())?)
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl Reshape {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Reshape>, Error> {
        validate_index_dtype(shape.dtype())?;
        let target = shape.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()?;
        let input_dims = &input.shape().dims;

        let mut output_dims = vec![];
        let mut infer_index = None;
        let mut copied = vec![false; input_dims.len()];
        for (i, d) in target.iter().enumerate() {
            match *d {
                0 => {
                    let dim = input_dims
                        .get(i)
                        .ok_or_else(|| Error::InputShapeError(format!("reshape {target:?} copies a missing axis of {}", input.shape())))?;
                    copied[i] = true;
                    output_dims.push(dim.clone());
                }
                -1 => {
                    if infer_index.is_some() {
                        Err(Error::InvalidInputError(format!("reshape {target:?} has more than one -1")))?
                    }
                    infer_index = Some(i);
                    output_dims.push(Dimension::unknown());
                }
                d if d > 0 => output_dims.push(Dimension::known(d as usize)),
                _ => Err(Error::InvalidInputError(format!("invalid reshape target {target:?}")))?,
            }
        }
        if let Some(i) = infer_index {
            // The inferred extent is known when every axis not copied through is known.
            let remaining: Option<usize> = input_dims
                .iter()
                .zip(copied.iter())
                .filter(|(_, c)| !**c)
                .map(|(d, _)| d.value)
                .product();
            let explicit: usize = target.iter().filter(|d| **d > 0).map(|d| *d as usize).product();
            if let Some(remaining) = remaining {
                if explicit == 0 || remaining % explicit != 0 {
                    Err(Error::InputShapeError(format!("cannot reshape {} to {target:?}", input.shape())))?
                }
                output_dims[i] = Dimension::known(remaining / explicit);
            }
        }
        Ok(Arc::new(Reshape { name, input, shape, output_shape: Shape::new(output_dims) }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 2)?;
        Ok(numeric::reshape(&inputs[0], &inputs[1].to_i64_vec()?)?)
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Unsqueeze {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl Unsqueeze {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        validate_index_dtype(axes.dtype())?;
        let axes_data = axes.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()?;
        let out_rank = input.rank() + axes_data.len();
        let mut normalized = axes_data
            .iter()
            .map(|a| if *a < 0 { *a + out_rank as i64 } else { *a })
            .collect::<Vec<_>>();
        normalized.sort_unstable();
        let mut output_shape = input.shape().clone();
        for axis in normalized {
            if axis < 0 || axis as usize > output_shape.rank() {
                Err(Error::InvalidInputError(format!("unsqueeze axes {axes_data:?} out of range")))?
            }
            output_shape = output_shape.unsqueeze(axis as usize);
        }
        Ok(Arc::new(Self { name, input, axes, output_shape }))
    }
}

impl Node for Unsqueeze {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.axes.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Unsqueeze"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 2)?;
        Ok(numeric::unsqueeze(&inputs[0], &inputs[1].to_i64_vec()?)?)
    }
}

impl SingleOutputNode for Unsqueeze {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// ONNX `Shape`: the runtime extents of its input as a 1-D int64 tensor.
pub struct ShapeOp {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl ShapeOp {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Self> {
        let output_shape = Shape::new(vec![Dimension::known(input.rank())]);
        Arc::new(Self { name, input, output_shape })
    }
}

impl Node for ShapeOp {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Shape"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 1)?;
        Ok(numeric::shape_of(&inputs[0], None, None))
    }
}

impl SingleOutputNode for ShapeOp {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        DType::I64
    }
}

pub struct Range {
    name: Option<String>,
    start: Arc<dyn Tensor>,
    limit: Arc<dyn Tensor>,
    delta: Arc<dyn Tensor>,
    output_shape: Shape,
}

impl Range {
    /// `length` names the extent of the produced sequence, when the caller knows which dimension it mirrors.
    pub fn new(
        name: Option<String>,
        start: Arc<dyn Tensor>,
        limit: Arc<dyn Tensor>,
        delta: Arc<dyn Tensor>,
        length: Option<Arc<Dimension>>,
    ) -> Result<Arc<Self>, Error> {
        for t in [&start, &limit, &delta] {
            if t.rank() != 0 {
                Err(Error::InputShapeError(format!("Range expects scalars, got {}", t.shape())))?
            }
            if t.dtype() != start.dtype() {
                Err(Error::DTypeMismatchError(start.dtype(), t.dtype()))?
            }
        }
        let output_shape = Shape::new(vec![length.unwrap_or_else(Dimension::unknown)]);
        Ok(Arc::new(Self { name, start, limit, delta, output_shape }))
    }
}

impl Node for Range {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.start.as_ref(), self.limit.as_ref(), self.delta.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Range"
    }
    fn evaluate(&self, inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        let inputs = expect_inputs(inputs, 3)?;
        Ok(numeric::range(&inputs[0], &inputs[1], &inputs[2])?)
    }
}

impl SingleOutputNode for Range {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.start.dtype()
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData,
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant { name, data })
    }
}

impl Node for Constant {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Constant"
    }
    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        match self.data.to_tensor_data_proto(None) {
            Ok(proto) => vec![attr_tensor("value", proto)],
            Err(_) => vec![],
        }
    }
    fn evaluate(&self, _inputs: &[NumericTensor]) -> Result<NumericTensor, Error> {
        self.data.to_numeric()
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

use super::node::{Node, SingleOutputNode};
use super::numeric::NumericTensor;
use super::onnx::{TensorProto, ValueInfoProto};
use super::{Error, onnx};
use core::fmt;
use ndarray::{ArrayD, IxDyn};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>,
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn known(value: usize) -> Arc<Self> {
        Self::new(Some(value), None, None)
    }

    pub fn symbolic(name: &str) -> Arc<Self> {
        Self::new(None, Some(name.to_string()), None)
    }

    pub fn unknown() -> Arc<Self> {
        Self::new(None, None, None)
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }

    /// Two dimensions conflict only when both carry known, different sizes.
    pub fn is_compatible(&self, other: &Dimension) -> bool {
        match (self.value, other.value) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match (&value.name, value.value) {
                (Some(name), _) => Some(onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone())),
                (None, Some(v)) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v as i64)),
                (None, None) => None,
            },
            denotation: value.denotation.clone().unwrap_or_default(),
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other)
            || match (self.value, other.value) {
                (Some(a), Some(b)) => a == b,
                (None, None) => self.name.is_some() && self.name == other.name,
                _ => false,
            }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        } else if let Some(name) = &self.name {
            write!(f, "{}", name)
        } else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>,
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        self.dims.iter().map(|d| d.resolve()).collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn normalize_axis(&self, axis: i64) -> Result<usize, Error> {
        let rank = self.rank() as i64;
        let adjusted = if axis < 0 { axis + rank } else { axis };
        if adjusted < 0 || adjusted >= rank {
            return Err(Error::InvalidInputError(format!("axis {axis} out of range for shape {self}")));
        }
        Ok(adjusted as usize)
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        let rank = self.rank();
        let index = if index < 0 { rank - (-index) as usize } else { index as usize };
        &self.dims[index]
    }

    pub fn unsqueeze(&self, axis: usize) -> Self {
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::known(1));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("x"))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self { dim: value.dims.iter().map(|x| x.as_ref().into()).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl<T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>,
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl<T> From<Vec<T>> for Shape
where
    Dimension: From<T>,
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    F32,
    I64,
    Bool,
}

impl DType {
    pub fn from_onnx(data_type: i32) -> Result<Self, Error> {
        match onnx::tensor_proto::DataType::try_from(data_type) {
            Ok(onnx::tensor_proto::DataType::Float) => Ok(DType::F32),
            Ok(onnx::tensor_proto::DataType::Int64) => Ok(DType::I64),
            Ok(onnx::tensor_proto::DataType::Bool) => Ok(DType::Bool),
            _ => Err(Error::UnsupportedDTypeError(format!("onnx data type {data_type}"))),
        }
    }

    /// Half precision storage is reported as F32; it is widened when read.
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, Error> {
        match dtype {
            safetensors::Dtype::F32 | safetensors::Dtype::F16 | safetensors::Dtype::BF16 => Ok(DType::F32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            safetensors::Dtype::BOOL => Ok(DType::Bool),
            dtype => Err(Error::UnsupportedDTypeError(format!("{dtype:?}"))),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
            DType::Bool => onnx::tensor_proto::DataType::Bool,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto {
            name,
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                    elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                    shape: Some(self.shape().into()),
                })),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }

    /// The node computing this tensor, if it is not a graph leaf.
    fn get_node(&self) -> Option<&dyn Node> {
        None
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    /// Data known while the graph is being built (literal constants only).
    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;

    fn is_weight(&self) -> bool {
        false
    }

    /// Reads stored parameter values. Only weights return data here.
    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        Ok(None)
    }
}

impl PartialEq for &dyn Tensor {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(*self, *other)
    }
}

impl Eq for &dyn Tensor {}

impl Hash for &dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

impl<T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn get_node(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape,
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self { name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
            TensorDataValue::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::I64(_) => DType::I64,
            TensorDataValue::Bool(_) => DType::Bool,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::Bool(v) => v.iter().map(|x| u8::from(*x)).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        if data.len() % dtype.size_in_bytes() != 0 {
            return Err(Error::InvalidInputError(format!("{} bytes is not a whole number of {dtype} values", data.len())));
        }
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(
                data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            ),
            DType::I64 => TensorDataValue::I64(
                data.chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Bool => TensorDataValue::Bool(data.iter().map(|x| *x != 0).collect()),
        })
    }

    /// Decodes 16-bit float storage, widening to f32.
    pub fn from_half_encoding(dtype: safetensors::Dtype, data: &[u8]) -> Result<Self, Error> {
        let words = data.chunks_exact(2).map(|c| [c[0], c[1]]);
        Ok(match dtype {
            safetensors::Dtype::F16 => TensorDataValue::F32(words.map(|b| half::f16::from_le_bytes(b).to_f32()).collect()),
            safetensors::Dtype::BF16 => TensorDataValue::F32(words.map(|b| half::bf16::from_le_bytes(b).to_f32()).collect()),
            dtype => Err(Error::UnsupportedDTypeError(format!("{dtype:?}")))?,
        })
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

impl From<Vec<bool>> for TensorDataValue {
    fn from(value: Vec<bool>) -> Self {
        TensorDataValue::Bool(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape,
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError(format!("{} values do not fill shape {shape}", value.len())));
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    pub fn scalar<T>(value: T) -> Self
    where
        TensorDataValue: From<Vec<T>>,
    {
        Self { value: TensorDataValue::from(vec![value]), shape: Shape::new(vec![]) }
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(Error::InvalidDTypeError),
        }
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto {
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }

    /// Decodes an initializer or constant. External data is resolved relative to `base_dir`.
    pub fn from_tensor_proto(proto: &TensorProto, base_dir: Option<&Path>) -> Result<Self, Error> {
        let dtype = DType::from_onnx(proto.data_type)?;
        let shape = Shape::from(proto.dims.iter().map(|x| *x as usize).collect::<Vec<_>>());
        let value = if proto.data_location == onnx::tensor_proto::DataLocation::External as i32 {
            let entry = |key: &str| proto.external_data.iter().find(|e| e.key == key).map(|e| e.value.clone());
            let location = entry("location").ok_or_else(|| Error::InvalidInputError(format!("{} has no external location", proto.name)))?;
            let offset: usize = entry("offset").map(|x| x.parse::<usize>()).transpose().map_err(|_| Error::InvalidInputError("bad offset".to_string()))?.unwrap_or(0);
            let path = base_dir.map(|d| d.join(&location)).unwrap_or_else(|| location.clone().into());
            let bytes = std::fs::read(path)?;
            let length: usize = match entry("length") {
                Some(x) => x.parse().map_err(|_| Error::InvalidInputError("bad length".to_string()))?,
                None => bytes.len().saturating_sub(offset),
            };
            let truncated = || Error::InvalidInputError(format!("external data for {} is truncated", proto.name));
            let end = offset.checked_add(length).ok_or_else(truncated)?;
            let slice = bytes.get(offset..end).ok_or_else(truncated)?;
            TensorDataValue::from_raw_encoding(dtype, slice)?
        } else if !proto.raw_data.is_empty() {
            TensorDataValue::from_raw_encoding(dtype, &proto.raw_data)?
        } else {
            match dtype {
                DType::F32 => TensorDataValue::F32(proto.float_data.clone()),
                DType::I64 => TensorDataValue::I64(proto.int64_data.clone()),
                DType::Bool => TensorDataValue::Bool(proto.int32_data.iter().map(|x| *x != 0).collect()),
            }
        };
        Self::new(value, shape)
    }

    pub fn from_safetensors_view(tensor: safetensors::tensor::TensorView) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let value = match tensor.dtype() {
            safetensors::Dtype::F32 => TensorDataValue::from_raw_encoding(DType::F32, tensor.data())?,
            safetensors::Dtype::I64 => TensorDataValue::from_raw_encoding(DType::I64, tensor.data())?,
            safetensors::Dtype::BOOL => TensorDataValue::from_raw_encoding(DType::Bool, tensor.data())?,
            dtype @ (safetensors::Dtype::F16 | safetensors::Dtype::BF16) => TensorDataValue::from_half_encoding(dtype, tensor.data())?,
            dtype => Err(Error::UnsupportedDTypeError(format!("{dtype:?}")))?,
        };
        Self::new(value, shape)
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.dims());
        let values: Vec<f32> = tensor.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1()?;
        Self::new(TensorDataValue::F32(values), shape)
    }

    pub fn to_numeric(&self) -> Result<NumericTensor, Error> {
        let dims = self.shape.resolve()?;
        let err = |x: ndarray::ShapeError| Error::InvalidInputError(x.to_string());
        Ok(match &self.value {
            TensorDataValue::F32(v) => NumericTensor::F32(ArrayD::from_shape_vec(IxDyn(&dims), v.clone()).map_err(err)?),
            TensorDataValue::I64(v) => NumericTensor::I64(ArrayD::from_shape_vec(IxDyn(&dims), v.clone()).map_err(err)?),
            TensorDataValue::Bool(v) => NumericTensor::Bool(ArrayD::from_shape_vec(IxDyn(&dims), v.clone()).map_err(err)?),
        })
    }

    pub fn from_numeric(tensor: &NumericTensor) -> Self {
        let shape = Shape::from(tensor.shape());
        let value = match tensor {
            NumericTensor::F32(x) => TensorDataValue::F32(x.iter().copied().collect()),
            NumericTensor::I64(x) => TensorDataValue::I64(x.iter().copied().collect()),
            NumericTensor::Bool(x) => TensorDataValue::Bool(x.iter().copied().collect()),
        };
        Self { value, shape }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_dims_serialize_as_params() {
        let shape = Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::known(7), Dimension::unknown()]);
        let proto = onnx::TensorShapeProto::from(&shape);
        use onnx::tensor_shape_proto::dimension::Value;
        assert_eq!(proto.dim[0].value, Some(Value::DimParam("batch_size".to_string())));
        assert_eq!(proto.dim[1].value, Some(Value::DimValue(7)));
        assert_eq!(proto.dim[2].value, None);
    }

    #[test]
    fn tensor_data_proto_decodes_back() {
        let data = TensorData::new(vec![1i64, -2, 3, 4].into(), Shape::from(vec![2usize, 2])).unwrap();
        let proto = data.to_tensor_data_proto(Some("x".to_string())).unwrap();
        let back = TensorData::from_tensor_proto(&proto, None).unwrap();
        assert_eq!(back.value(), data.value());
        assert_eq!(back.shape().resolve().unwrap(), vec![2, 2]);
    }

    #[test]
    fn half_storage_is_widened() {
        let bytes: Vec<u8> = [1.5f32, -0.25].iter().flat_map(|x| half::bf16::from_f32(*x).to_le_bytes()).collect();
        let value = TensorDataValue::from_half_encoding(safetensors::Dtype::BF16, &bytes).unwrap();
        assert_eq!(value, TensorDataValue::F32(vec![1.5, -0.25]));
    }

    fn external_proto(offset: &str, length: &str) -> TensorProto {
        let entry = |key: &str, value: &str| onnx::StringStringEntryProto { key: key.to_string(), value: value.to_string() };
        TensorProto {
            name: "w".to_string(),
            data_type: onnx::tensor_proto::DataType::Float as i32,
            dims: vec![2],
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![entry("location", "weights.bin"), entry("offset", offset), entry("length", length)],
            ..Default::default()
        }
    }

    #[test]
    fn external_data_is_read_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = [9.0f32, 1.0, 2.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        std::fs::write(dir.path().join("weights.bin"), bytes).unwrap();

        let data = TensorData::from_tensor_proto(&external_proto("4", "8"), Some(dir.path())).unwrap();
        assert_eq!(data.value(), &TensorDataValue::F32(vec![1.0, 2.0]));

        assert!(matches!(TensorData::from_tensor_proto(&external_proto("8", "8"), Some(dir.path())), Err(Error::InvalidInputError(_))));
        let overflowing = external_proto(&usize::MAX.to_string(), "8");
        assert!(matches!(TensorData::from_tensor_proto(&overflowing, Some(dir.path())), Err(Error::InvalidInputError(_))));
    }

    #[test]
    fn mismatched_value_count_is_rejected() {
        assert!(TensorData::new(vec![1.0f32, 2.0].into(), Shape::from(vec![3usize])).is_err());
    }
}

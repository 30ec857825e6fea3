use charsiu_g2p_import::onnx::{self, ModelProto, NodeProto};
use charsiu_g2p_import::onnx_graph;
use charsiu_g2p_import::onnx_graph::numeric::{self, NumericError, NumericTensor, WhichBinaryOp, WhichUnaryOp};
use charsiu_g2p_import::onnx_graph::tensor::{DType, TensorData};
use prost::Message;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Model decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),
    #[error("Model has no graph")]
    MissingGraph,
    #[error("Unsupported op {0}")]
    UnsupportedOp(String),
    #[error("Missing value {0}")]
    MissingValue(String),
    #[error("Input {name} expects {expected}, got {got}")]
    InputMismatch { name: String, expected: String, got: String },
    #[error("Node {node} failed: {source}")]
    NodeError {
        node: String,
        #[source]
        source: NumericError,
    },
    #[error(transparent)]
    GraphError(#[from] onnx_graph::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

const SUPPORTED_OPS: &[&str] = &[
    "Cast",
    "Where",
    "Gather",
    "MatMul",
    "ReduceMean",
    "Softmax",
    "Transpose",
    "Reshape",
    "Unsqueeze",
    "Shape",
    "Range",
    "Constant",
];

fn is_supported(op_type: &str) -> bool {
    SUPPORTED_OPS.contains(&op_type) || WhichBinaryOp::from_str(op_type).is_ok() || WhichUnaryOp::from_str(op_type).is_ok()
}

/// Declared element type and extents of a graph input. `None` extents are symbolic.
#[derive(Debug, Clone, PartialEq)]
pub struct IoSpec {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>,
}

impl IoSpec {
    fn from_value_info(info: &onnx::ValueInfoProto) -> Result<Self, SessionError> {
        let Some(onnx::type_proto::Value::TensorType(tensor_type)) = info.r#type.as_ref().and_then(|t| t.value.as_ref()) else {
            return Err(SessionError::MissingValue(format!("type of {}", info.name)));
        };
        let dims = tensor_type
            .shape
            .as_ref()
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|d| match d.value {
                        Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)) => Some(v as usize),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { name: info.name.clone(), dtype: DType::from_onnx(tensor_type.elem_type)?, dims })
    }

    fn describe(dtype: DType, dims: &[Option<usize>]) -> String {
        let dims: Vec<String> = dims.iter().map(|d| d.map(|x| x.to_string()).unwrap_or_else(|| "?".to_string())).collect();
        format!("{dtype}[{}]", dims.join(", "))
    }

    fn check(&self, value: &NumericTensor) -> Result<(), SessionError> {
        let shape = value.shape();
        let matches = value.dtype() == self.dtype
            && shape.len() == self.dims.len()
            && self.dims.iter().zip(shape).all(|(d, s)| d.is_none_or(|d| d == *s));
        if matches {
            Ok(())
        } else {
            Err(SessionError::InputMismatch {
                name: self.name.clone(),
                expected: Self::describe(self.dtype, &self.dims),
                got: Self::describe(value.dtype(), &shape.iter().map(|x| Some(*x)).collect::<Vec<_>>()),
            })
        }
    }
}

/// Reference CPU executor for the graphs this crate emits.
pub struct Session {
    nodes: Vec<NodeProto>,
    constants: HashMap<String, NumericTensor>,
    inputs: Vec<IoSpec>,
    outputs: Vec<String>,
    opset_version: i64,
    metadata: Vec<(String, String)>,
}

impl Session {
    /// External tensor data is resolved relative to `base_dir`.
    pub fn from_model(model: &ModelProto, base_dir: Option<&Path>) -> Result<Self, SessionError> {
        let graph = model.graph.as_ref().ok_or(SessionError::MissingGraph)?;

        let mut constants = HashMap::new();
        for initializer in &graph.initializer {
            let data = TensorData::from_tensor_proto(initializer, base_dir)?;
            constants.insert(initializer.name.clone(), data.to_numeric()?);
        }

        let mut nodes = vec![];
        for node in &graph.node {
            if !is_supported(&node.op_type) {
                return Err(SessionError::UnsupportedOp(node.op_type.clone()));
            }
            if node.op_type == "Constant" {
                let value = node
                    .attribute
                    .iter()
                    .find(|a| a.name == "value")
                    .and_then(|a| a.t.as_ref())
                    .ok_or_else(|| SessionError::MissingValue(format!("value of {}", node.name)))?;
                let output = node.output.first().ok_or_else(|| SessionError::MissingValue(format!("output of {}", node.name)))?;
                constants.insert(output.clone(), TensorData::from_tensor_proto(value, base_dir)?.to_numeric()?);
            } else {
                nodes.push(node.clone());
            }
        }

        let inputs = graph
            .input
            .iter()
            .filter(|i| !constants.contains_key(&i.name))
            .map(IoSpec::from_value_info)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = graph.output.iter().map(|o| o.name.clone()).collect();
        let opset_version = model.opset_import.iter().find(|o| o.domain.is_empty()).map(|o| o.version).unwrap_or_default();
        let metadata = model.metadata_props.iter().map(|p| (p.key.clone(), p.value.clone())).collect();

        Ok(Self { nodes, constants, inputs, outputs, opset_version, metadata })
    }

    pub fn from_onnx_bytes(bytes: &[u8], base_dir: Option<&Path>) -> Result<Self, SessionError> {
        let model = ModelProto::decode(bytes)?;
        Self::from_model(&model, base_dir)
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let bytes = std::fs::read(path)?;
        Self::from_onnx_bytes(&bytes, path.parent())
    }

    pub fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn opset_version(&self) -> i64 {
        self.opset_version
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn run(&self, feeds: &HashMap<String, NumericTensor>) -> Result<HashMap<String, NumericTensor>, SessionError> {
        for spec in &self.inputs {
            let value = feeds.get(&spec.name).ok_or_else(|| SessionError::MissingValue(spec.name.clone()))?;
            spec.check(value)?;
        }

        let mut computed: HashMap<&str, NumericTensor> = HashMap::new();
        for node in &self.nodes {
            let mut inputs = Vec::with_capacity(node.input.len());
            for name in &node.input {
                if name.is_empty() {
                    inputs.push(None);
                    continue;
                }
                let value = computed
                    .get(name.as_str())
                    .or_else(|| feeds.get(name))
                    .or_else(|| self.constants.get(name))
                    .ok_or_else(|| SessionError::MissingValue(name.clone()))?;
                inputs.push(Some(value));
            }
            let output = evaluate(node, &inputs).map_err(|source| SessionError::NodeError {
                node: if node.name.is_empty() { node.op_type.clone() } else { node.name.clone() },
                source,
            })?;
            let name = node.output.first().ok_or_else(|| SessionError::MissingValue(format!("output of {}", node.name)))?;
            computed.insert(name.as_str(), output);
        }

        let mut out = HashMap::new();
        for name in &self.outputs {
            let value = computed
                .remove(name.as_str())
                .or_else(|| feeds.get(name).cloned())
                .or_else(|| self.constants.get(name).cloned())
                .ok_or_else(|| SessionError::MissingValue(name.clone()))?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a onnx::AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_int(node: &NodeProto, name: &str) -> Option<i64> {
    attr(node, name).map(|a| a.i)
}

fn attr_ints(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name).map(|a| a.ints.clone())
}

fn evaluate(node: &NodeProto, inputs: &[Option<&NumericTensor>]) -> Result<NumericTensor, NumericError> {
    let get = |i: usize| {
        inputs
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| NumericError::InvalidInput(format!("{} is missing input {i}", node.op_type)))
    };
    let op = node.op_type.as_str();
    if let Ok(which) = WhichBinaryOp::from_str(op) {
        return numeric::binary(which, get(0)?, get(1)?);
    }
    if let Ok(which) = WhichUnaryOp::from_str(op) {
        return numeric::unary(which, get(0)?);
    }
    match op {
        "Cast" => {
            let to = attr_int(node, "to").ok_or_else(|| NumericError::InvalidInput("Cast has no target type".to_string()))?;
            let to = DType::from_onnx(to as i32).map_err(|e| NumericError::InvalidInput(e.to_string()))?;
            Ok(numeric::cast(get(0)?, to))
        }
        "Where" => numeric::where_op(get(0)?, get(1)?, get(2)?),
        "Gather" => numeric::gather(get(0)?, get(1)?, attr_int(node, "axis").unwrap_or(0)),
        "MatMul" => numeric::matmul(get(0)?, get(1)?),
        "ReduceMean" => {
            let axes = match (attr_ints(node, "axes"), inputs.get(1).copied().flatten()) {
                (Some(axes), _) => axes,
                (None, Some(axes)) => axes.to_i64_vec()?,
                (None, None) => (0..get(0)?.rank() as i64).collect(),
            };
            numeric::reduce_mean(get(0)?, &axes, attr_int(node, "keepdims").unwrap_or(1) != 0)
        }
        "Softmax" => numeric::softmax(get(0)?, attr_int(node, "axis").unwrap_or(-1)),
        "Transpose" => numeric::transpose(get(0)?, attr_ints(node, "perm").as_deref()),
        "Reshape" => numeric::reshape(get(0)?, &get(1)?.to_i64_vec()?),
        "Unsqueeze" => {
            let axes = match attr_ints(node, "axes") {
                Some(axes) => axes,
                None => get(1)?.to_i64_vec()?,
            };
            numeric::unsqueeze(get(0)?, &axes)
        }
        "Shape" => Ok(numeric::shape_of(get(0)?, attr_int(node, "start"), attr_int(node, "end"))),
        "Range" => numeric::range(get(0)?, get(1)?, get(2)?),
        op => Err(NumericError::InvalidInput(format!("no kernel for {op}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charsiu_g2p_import::onnx_graph::operators::{Binary, Constant, Softmax};
    use charsiu_g2p_import::onnx_graph::tensor::{Dimension, InputTensor, Shape, Tensor};
    use charsiu_g2p_import::onnx_graph::{BuildOptions, build_proto};
    use std::sync::Arc;

    fn tiny_model(do_constant_folding: bool) -> ModelProto {
        let x = InputTensor::new("x".to_string(), DType::F32, Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::known(3)]));
        let offset = Constant::new(None, TensorData::new(vec![1.0f32, 0.0, -1.0].into(), Shape::from(vec![3usize])).unwrap());
        let sum = Binary::add(None, x.clone(), offset).unwrap();
        let y: Arc<dyn Tensor> = Softmax::new(None, sum, None);
        let options = BuildOptions { do_constant_folding, ..Default::default() };
        build_proto(&[x], &[("y", y)], &options).unwrap()
    }

    #[test]
    fn runs_built_graphs() {
        for folding in [true, false] {
            let session = Session::from_onnx_bytes(&tiny_model(folding).encode_to_vec(), None).unwrap();
            let feeds = HashMap::from([("x".to_string(), NumericTensor::from_f32(vec![0.0; 6], &[2, 3]).unwrap())]);
            let out = session.run(&feeds).unwrap();
            let y = out["y"].as_f32().unwrap();
            assert_eq!(y.shape(), &[2, 3]);
            assert!((y.iter().sum::<f32>() - 2.0).abs() < 1e-5);
            assert!(y[&[0, 0][..]] > y[&[0, 2][..]]);
        }
    }

    #[test]
    fn fixed_dims_are_enforced() {
        let session = Session::from_model(&tiny_model(true), None).unwrap();
        let feeds = HashMap::from([("x".to_string(), NumericTensor::from_f32(vec![0.0; 4], &[2, 2]).unwrap())]);
        assert!(matches!(session.run(&feeds), Err(SessionError::InputMismatch { .. })));
        assert!(matches!(session.run(&HashMap::new()), Err(SessionError::MissingValue(_))));
    }

    #[test]
    fn unknown_ops_are_rejected_on_load() {
        // The exporter never emits the last three, so the session has no kernels for them.
        for unknown in ["LSTM", "Squeeze", "Exp", "Pow"] {
            let mut model = tiny_model(true);
            if let Some(graph) = model.graph.as_mut() {
                graph.node[0].op_type = unknown.to_string();
            }
            assert!(matches!(Session::from_model(&model, None), Err(SessionError::UnsupportedOp(op)) if op == unknown));
        }
    }
}

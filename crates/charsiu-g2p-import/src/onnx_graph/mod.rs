pub mod node;
pub mod numeric;
pub mod operators;
pub mod pytorch;
pub mod tensor;
pub mod weights;

use node::Node;
use numeric::{NumericError, NumericTensor};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tensor::{DType, InputTensor, Tensor, TensorData};
use weights::{BinOutputManager, EmbeddedOutputManager, WeightExternalOutputManager};

pub mod onnx {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

pub const MIN_OPSET_VERSION: i64 = 13;
pub const MAX_OPSET_VERSION: i64 = 17;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape error: {0}")]
    InputShapeError(String),
    #[error("Mismatched dtypes {0} and {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Unsupported dtype {0}")]
    UnsupportedDTypeError(String),
    #[error("Tensor name {0} is used twice")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension has no known size")]
    UnresolvedDimensionError,
    #[error("Invalid dtype for this operand")]
    InvalidDTypeError,
    #[error("Tensor data cannot be resolved while building the graph")]
    CannotResolveDataError,
    #[error(transparent)]
    SafeTensorError(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
    #[error(transparent)]
    NumericError(#[from] NumericError),
    #[error("Opset {0} is outside the supported range {MIN_OPSET_VERSION}..={MAX_OPSET_VERSION}")]
    UnsupportedOpsetError(i64),
}

/// Where parameter values end up in the emitted model.
#[derive(Debug, Clone, Default)]
pub enum WeightStorageStrategy {
    #[default]
    EmbeddedData,
    BinFile(PathBuf),
    /// Parameters become extra graph inputs and carry no data.
    None,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub opset_version: i64,
    pub weight_storage: WeightStorageStrategy,
    pub do_constant_folding: bool,
    pub producer_name: String,
    pub doc_string: String,
    pub metadata_props: Vec<(String, String)>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            opset_version: 14,
            weight_storage: WeightStorageStrategy::EmbeddedData,
            do_constant_folding: true,
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            doc_string: String::new(),
            metadata_props: vec![],
        }
    }
}

pub fn ir_version_for_opset(opset_version: i64) -> Result<i64, Error> {
    match opset_version {
        13 | 14 => Ok(onnx::Version::IrVersion202058 as i64),
        15..=17 => Ok(onnx::Version::IrVersion2021730 as i64),
        v => Err(Error::UnsupportedOpsetError(v)),
    }
}

/// Post-order walk from the outputs. Visit order only depends on graph structure.
fn topological_tensors<'a>(outputs: &'a [(&str, Arc<dyn Tensor>)]) -> Vec<&'a dyn Tensor> {
    let mut order = vec![];
    let mut visited: HashSet<&dyn Tensor> = HashSet::new();
    let mut stack: Vec<(&dyn Tensor, bool)> = outputs.iter().rev().map(|(_, t)| (t.as_ref(), false)).collect();
    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor) {
            continue;
        }
        stack.push((tensor, true));
        if let Some(node) = tensor.get_node() {
            for input in node.get_input_tensors().into_iter().rev() {
                if !visited.contains(&input) {
                    stack.push((input, false));
                }
            }
        }
    }
    order
}

/// Returns the value of a foldable tensor, computing and caching it on first use.
fn evaluate_constant<'a>(tensor: &'a dyn Tensor, cache: &mut HashMap<&'a dyn Tensor, NumericTensor>) -> Result<NumericTensor, Error> {
    if let Some(value) = cache.get(&tensor) {
        return Ok(value.clone());
    }
    let value = if tensor.is_weight() {
        tensor
            .load_data()?
            .ok_or_else(|| Error::NoSuchTensorError(tensor.get_name().unwrap_or_default().to_string()))?
            .to_numeric()?
    } else if let Some(node) = tensor.get_node() {
        let mut inputs = vec![];
        for input in node.get_input_tensors() {
            inputs.push(evaluate_constant(input, cache)?);
        }
        node.evaluate(&inputs)?
    } else {
        return Err(Error::CannotResolveDataError);
    };
    cache.insert(tensor, value.clone());
    Ok(value)
}

pub fn build_proto(inputs: &[Arc<InputTensor>], outputs: &[(&str, Arc<dyn Tensor>)], options: &BuildOptions) -> Result<onnx::ModelProto, Error> {
    let ir_version = ir_version_for_opset(options.opset_version)?;
    let order = topological_tensors(outputs);
    let output_set: HashSet<&dyn Tensor> = outputs.iter().map(|(_, t)| t.as_ref()).collect();
    let embed_weights = !matches!(options.weight_storage, WeightStorageStrategy::None);

    for tensor in &order {
        if tensor.is_input() && !inputs.iter().any(|t| (t.as_ref() as &dyn Tensor) == *tensor) {
            return Err(Error::InvalidInputError(format!(
                "graph reads input {} which was not declared",
                tensor.get_name().unwrap_or("<unnamed>")
            )));
        }
    }

    // A tensor is constant when its value is fixed at export time.
    let mut constant: HashSet<&dyn Tensor> = HashSet::new();
    for tensor in &order {
        let is_constant = if tensor.is_weight() {
            embed_weights
        } else if let Some(node) = tensor.get_node() {
            options.do_constant_folding
                && !output_set.contains(tensor)
                && node.get_input_tensors().iter().all(|x| constant.contains(x))
        } else {
            false
        };
        if is_constant {
            constant.insert(*tensor);
        }
    }

    // Keep only what the outputs actually consume: emitted nodes and the constants they read.
    let mut needed: HashSet<&dyn Tensor> = output_set.clone();
    for tensor in order.iter().rev() {
        if !needed.contains(tensor) || constant.contains(tensor) {
            continue;
        }
        if let Some(node) = tensor.get_node() {
            needed.extend(node.get_input_tensors());
        }
    }
    let order: Vec<&dyn Tensor> = order.into_iter().filter(|t| needed.contains(t)).collect();

    // Names: declared inputs, outputs and weights keep theirs, the rest are numbered in order.
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    for input in inputs {
        let name = input.get_name().unwrap_or_default().to_string();
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name));
        }
        tensor_names.insert(input.as_ref(), name);
    }
    for (name, tensor) in outputs {
        if !chosen_names.insert(name.to_string()) {
            return Err(Error::NameConflictError(name.to_string()));
        }
        tensor_names.insert(tensor.as_ref(), name.to_string());
    }
    for tensor in &order {
        if tensor_names.contains_key(tensor) || !tensor.is_weight() {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            if !chosen_names.insert(name.to_string()) {
                return Err(Error::NameConflictError(name.to_string()));
            }
            tensor_names.insert(*tensor, name.to_string());
        }
    }
    let mut next_tensor_id = 0;
    for tensor in &order {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        let name = loop {
            let name = format!("tensor_{next_tensor_id}");
            next_tensor_id += 1;
            if !chosen_names.contains(&name) {
                break name;
            }
        };
        chosen_names.insert(name.clone());
        tensor_names.insert(*tensor, name);
    }

    // Constant values
    let mut data_manager: Box<dyn WeightExternalOutputManager<'_> + '_> = match &options.weight_storage {
        WeightStorageStrategy::BinFile(path) => Box::new(BinOutputManager::new(path)?),
        _ => Box::new(EmbeddedOutputManager::new()),
    };
    let mut cache: HashMap<&dyn Tensor, NumericTensor> = HashMap::new();
    let mut folded_count = 0;
    for tensor in &order {
        if !constant.contains(tensor) {
            continue;
        }
        let data = if tensor.is_weight() {
            tensor
                .load_data()?
                .ok_or_else(|| Error::NoSuchTensorError(tensor_names[tensor].clone()))?
        } else {
            folded_count += 1;
            TensorData::from_numeric(&evaluate_constant(*tensor, &mut cache)?)
        };
        data_manager.write_tensor_data(*tensor, data)?;
    }
    drop(cache);
    data_manager.finalize_tensor_data()?;

    let mut initializers = vec![];
    let mut value_info = vec![];
    let mut graph_inputs: Vec<onnx::ValueInfoProto> =
        inputs.iter().map(|t| t.to_value_info_proto(tensor_names[&(t.as_ref() as &dyn Tensor)].clone())).collect();
    let mut nodes = vec![];
    let mut used_node_names: HashSet<String> = HashSet::new();
    for tensor in &order {
        let name = tensor_names[tensor].clone();
        if constant.contains(tensor) {
            if let Some(initializer) = data_manager.get_initializer(*tensor, name.clone())? {
                initializers.push(initializer);
            }
        } else if tensor.is_weight() {
            graph_inputs.push(tensor.to_value_info_proto(name));
        } else if let Some(node) = tensor.get_node() {
            let node_name = match node.get_name() {
                Some(requested) if !used_node_names.contains(requested) => requested.to_string(),
                _ => format!("{}_{}", node.get_onnx_type(), nodes.len()),
            };
            used_node_names.insert(node_name.clone());
            nodes.push(node.to_node_proto(Some(node_name), &tensor_names));
            if !output_set.contains(tensor) {
                value_info.push(tensor.to_value_info_proto(name));
            }
        }
    }

    log::debug!(
        "Built graph with {} nodes, {} initializers ({} folded)",
        nodes.len(),
        initializers.len(),
        folded_count
    );

    let graph = onnx::GraphProto {
        name: "main_graph".to_string(),
        node: nodes,
        initializer: initializers,
        input: graph_inputs,
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        ..Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version,
        opset_import: vec![onnx::OperatorSetIdProto { domain: String::new(), version: options.opset_version }],
        producer_name: options.producer_name.clone(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        doc_string: options.doc_string.clone(),
        graph: Some(graph),
        metadata_props: options
            .metadata_props
            .iter()
            .map(|(key, value)| onnx::StringStringEntryProto { key: key.clone(), value: value.clone() })
            .collect(),
        ..Default::default()
    })
}

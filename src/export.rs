use crate::seed::SeedSource;
use crate::session::{Session, SessionError};
use charsiu_g2p_import::onnx::{self, ModelProto};
use charsiu_g2p_import::onnx_graph::numeric::NumericTensor;
use charsiu_g2p_import::onnx_graph::tensor::DType;
use charsiu_g2p_import::onnx_graph::{self, BuildOptions, MAX_OPSET_VERSION, MIN_OPSET_VERSION, WeightStorageStrategy};
use charsiu_g2p_import::t5::{ATTENTION_MASK, DECODER_INPUT_IDS, INPUT_IDS, LOGITS};
use charsiu_g2p_import::TransformersModel;
use onnx::tensor_shape_proto::dimension::Value as DimValue;
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

pub const METADATA_KEY: &str = "g2p_metadata";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Opset {0} is outside the supported range {MIN_OPSET_VERSION}..={MAX_OPSET_VERSION}")]
    UnsupportedOpset(i64),
    #[error("Expected {expected} {kind} names, got {got}")]
    NameCount { kind: &'static str, expected: usize, got: usize },
    #[error("Tensor name {0} is declared more than once")]
    DuplicateName(String),
    #[error("External data location {0:?} must be a plain file name distinct from the model file")]
    InvalidExternalDataName(String),
    #[error("Dynamic axes reference unknown tensor {0}")]
    UnknownDynamicAxisName(String),
    #[error("Dynamic axis {axis} of {name} is out of range for rank {rank}")]
    DynamicAxisOutOfRange { name: String, axis: usize, rank: usize },
    #[error("Invalid sample input: {0}")]
    InvalidSampleInput(String),
    #[error("Metadata serialization error: {0}")]
    MetadataError(#[from] serde_json::Error),
    #[error("Model error: {0}")]
    ModelError(#[from] charsiu_g2p_import::Error),
    #[error("Graph error: {0}")]
    GraphError(#[from] onnx_graph::Error),
    #[error("Trace check failed: {0}")]
    TraceCheckError(#[source] SessionError),
    #[error("Write error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Special token ids a consumer of the artifact needs for decoding.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct G2pMetadata {
    pub decoder_start_token_id: i64,
    pub decoder_start_source: SeedSource,
    pub eos_token_id: Option<i64>,
    pub pad_token_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub opset_version: i64,
    /// When false, parameters become graph inputs instead of embedded initializers.
    pub export_params: bool,
    pub do_constant_folding: bool,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Tensor name to `{axis: symbol}`. Axes not listed are fixed to the traced sizes.
    pub dynamic_axes: BTreeMap<String, BTreeMap<usize, String>>,
    pub metadata: Option<G2pMetadata>,
    /// Sidecar file, next to the model, that receives the parameters as ONNX external data.
    pub external_data: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        let axes = |entries: &[(usize, &str)]| entries.iter().map(|(a, s)| (*a, s.to_string())).collect::<BTreeMap<_, _>>();
        Self {
            opset_version: 14,
            export_params: true,
            do_constant_folding: true,
            input_names: vec![INPUT_IDS.to_string(), ATTENTION_MASK.to_string(), DECODER_INPUT_IDS.to_string()],
            output_names: vec![LOGITS.to_string()],
            dynamic_axes: BTreeMap::from([
                (INPUT_IDS.to_string(), axes(&[(0, "batch_size"), (1, "sequence_length")])),
                (ATTENTION_MASK.to_string(), axes(&[(0, "batch_size"), (1, "sequence_length")])),
                (DECODER_INPUT_IDS.to_string(), axes(&[(0, "batch_size"), (1, "decoder_sequence_length")])),
                (LOGITS.to_string(), axes(&[(0, "batch_size"), (1, "decoder_sequence_length"), (2, "vocab_size")])),
            ]),
            metadata: None,
            external_data: None,
        }
    }
}

/// The three int64 tensors the model is traced with.
#[derive(Debug, Clone)]
pub struct SampleInputs {
    pub input_ids: NumericTensor,
    pub attention_mask: NumericTensor,
    pub decoder_input_ids: NumericTensor,
}

impl SampleInputs {
    /// A single-row batch: the encoded text, its mask, and a one-token decoder seed.
    pub fn from_single(input_ids: Vec<i64>, attention_mask: Vec<i64>, decoder_start_token_id: i64) -> Result<Self, ExportError> {
        let err = |e: charsiu_g2p_import::onnx_graph::numeric::NumericError| ExportError::InvalidSampleInput(e.to_string());
        let len = input_ids.len();
        Ok(Self {
            input_ids: NumericTensor::from_i64(input_ids, &[1, len]).map_err(err)?,
            attention_mask: NumericTensor::from_i64(attention_mask, &[1, len]).map_err(err)?,
            decoder_input_ids: NumericTensor::from_i64(vec![decoder_start_token_id], &[1, 1]).map_err(err)?,
        })
    }

    fn validate(&self) -> Result<(), ExportError> {
        for (name, tensor) in self.named() {
            if tensor.dtype() != DType::I64 || tensor.rank() != 2 {
                return Err(ExportError::InvalidSampleInput(format!(
                    "{name} must be a rank 2 int64 tensor, got {} of shape {:?}",
                    tensor.dtype(),
                    tensor.shape()
                )));
            }
            if tensor.shape().contains(&0) {
                return Err(ExportError::InvalidSampleInput(format!("{name} is empty")));
            }
        }
        if self.input_ids.shape() != self.attention_mask.shape() {
            return Err(ExportError::InvalidSampleInput(format!(
                "input_ids {:?} and attention_mask {:?} differ in shape",
                self.input_ids.shape(),
                self.attention_mask.shape()
            )));
        }
        if self.input_ids.shape()[0] != self.decoder_input_ids.shape()[0] {
            return Err(ExportError::InvalidSampleInput("encoder and decoder batch sizes differ".to_string()));
        }
        Ok(())
    }

    fn named(&self) -> [(&'static str, &NumericTensor); 3] {
        [(INPUT_IDS, &self.input_ids), (ATTENTION_MASK, &self.attention_mask), (DECODER_INPUT_IDS, &self.decoder_input_ids)]
    }

    pub fn feeds(&self) -> HashMap<String, NumericTensor> {
        self.named().into_iter().map(|(name, t)| (name.to_string(), t.clone())).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExportedArtifact {
    pub path: PathBuf,
    pub byte_size: usize,
    pub external_data_path: Option<PathBuf>,
    pub node_count: usize,
    pub initializer_count: usize,
    pub logits_shape: Vec<usize>,
}

fn validate_options(options: &ExportOptions, graph_inputs: usize, graph_outputs: usize) -> Result<(), ExportError> {
    if !(MIN_OPSET_VERSION..=MAX_OPSET_VERSION).contains(&options.opset_version) {
        return Err(ExportError::UnsupportedOpset(options.opset_version));
    }
    if options.input_names.len() != graph_inputs {
        return Err(ExportError::NameCount { kind: "input", expected: graph_inputs, got: options.input_names.len() });
    }
    if options.output_names.len() != graph_outputs {
        return Err(ExportError::NameCount { kind: "output", expected: graph_outputs, got: options.output_names.len() });
    }
    let mut seen = HashSet::new();
    for name in options.input_names.iter().chain(&options.output_names) {
        if !seen.insert(name.as_str()) {
            return Err(ExportError::DuplicateName(name.clone()));
        }
    }
    if let Some(name) = &options.external_data {
        let mut components = Path::new(name).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return Err(ExportError::InvalidExternalDataName(name.clone()));
        }
    }
    for name in options.dynamic_axes.keys() {
        if !options.input_names.contains(name) && !options.output_names.contains(name) {
            return Err(ExportError::UnknownDynamicAxisName(name.clone()));
        }
    }
    Ok(())
}

/// Renames graph inputs and outputs positionally, and fixes or names each of their axes.
fn apply_io_declarations(
    model: &mut ModelProto,
    options: &ExportOptions,
    traced_shapes: &HashMap<String, Vec<usize>>,
) -> Result<(), ExportError> {
    let Some(graph) = model.graph.as_mut() else {
        return Ok(());
    };

    let mut renames: HashMap<String, String> = HashMap::new();
    for (info, name) in graph.input.iter().zip(&options.input_names) {
        renames.insert(info.name.clone(), name.clone());
    }
    for (info, name) in graph.output.iter().zip(&options.output_names) {
        renames.insert(info.name.clone(), name.clone());
    }
    let existing = graph
        .node
        .iter()
        .flat_map(|n| n.output.iter())
        .chain(graph.initializer.iter().map(|i| &i.name))
        .chain(graph.input.iter().map(|i| &i.name));
    for name in existing {
        if !renames.contains_key(name) && renames.values().any(|new_name| new_name == name) {
            return Err(ExportError::DuplicateName(name.clone()));
        }
    }

    // Symbols the builder used, mapped to what the declarations turn them into.
    let mut symbols: HashMap<String, DimValue> = HashMap::new();
    for info in graph.input.iter_mut().chain(graph.output.iter_mut()) {
        let Some(traced) = traced_shapes.get(&info.name) else {
            continue;
        };
        let new_name = renames.get(&info.name).cloned().unwrap_or_else(|| info.name.clone());
        let declared = options.dynamic_axes.get(&new_name);
        let Some(onnx::type_proto::Value::TensorType(tensor_type)) = info.r#type.as_mut().and_then(|t| t.value.as_mut()) else {
            continue;
        };
        let Some(shape) = tensor_type.shape.as_mut() else {
            continue;
        };
        if let Some(declared) = declared {
            if let Some((axis, _)) = declared.iter().find(|(axis, _)| **axis >= shape.dim.len()) {
                return Err(ExportError::DynamicAxisOutOfRange { name: new_name, axis: *axis, rank: shape.dim.len() });
            }
        }
        for (axis, dim) in shape.dim.iter_mut().enumerate() {
            let value = match (declared.and_then(|d| d.get(&axis)), traced.get(axis)) {
                (Some(symbol), _) => DimValue::DimParam(symbol.clone()),
                (None, Some(size)) => DimValue::DimValue(*size as i64),
                (None, None) => continue,
            };
            if let Some(DimValue::DimParam(old)) = &dim.value {
                symbols.entry(old.clone()).or_insert_with(|| value.clone());
            }
            dim.value = Some(value);
        }
        info.name = new_name;
    }

    for info in graph.value_info.iter_mut() {
        if let Some(onnx::type_proto::Value::TensorType(tensor_type)) = info.r#type.as_mut().and_then(|t| t.value.as_mut()) {
            for dim in tensor_type.shape.iter_mut().flat_map(|s| s.dim.iter_mut()) {
                if let Some(DimValue::DimParam(old)) = &dim.value {
                    if let Some(value) = symbols.get(old) {
                        dim.value = Some(value.clone());
                    }
                }
            }
        }
    }

    for node in graph.node.iter_mut() {
        for name in node.input.iter_mut().chain(node.output.iter_mut()) {
            if let Some(new_name) = renames.get(name) {
                *name = new_name.clone();
            }
        }
    }
    Ok(())
}

/// Builds the graph, checks it on the sample inputs, and writes the serialized model to `path`.
pub fn export(model: &TransformersModel, sample: &SampleInputs, path: &Path, options: &ExportOptions) -> Result<ExportedArtifact, ExportError> {
    let graph = model.build_graph()?;
    validate_options(options, graph.inputs.len(), graph.outputs.len())?;
    sample.validate()?;

    let mut metadata_props = vec![];
    if let Some(metadata) = &options.metadata {
        metadata_props.push((METADATA_KEY.to_string(), serde_json::to_string(metadata)?));
    }
    let base_dir = path.parent();
    let external_data_path = match (&options.external_data, options.export_params) {
        (Some(name), true) => {
            if path.file_name() == Some(std::ffi::OsStr::new(name)) {
                return Err(ExportError::InvalidExternalDataName(name.clone()));
            }
            Some(base_dir.map(|dir| dir.join(name)).unwrap_or_else(|| PathBuf::from(name)))
        }
        (Some(name), false) => {
            log::warn!("Ignoring external data location {name:?}, parameters are not exported");
            None
        }
        (None, _) => None,
    };
    let weight_storage = match (&external_data_path, options.export_params) {
        (Some(data_path), _) => WeightStorageStrategy::BinFile(data_path.clone()),
        (None, true) => WeightStorageStrategy::EmbeddedData,
        (None, false) => WeightStorageStrategy::None,
    };
    let build_options = BuildOptions {
        opset_version: options.opset_version,
        weight_storage,
        do_constant_folding: options.do_constant_folding,
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        doc_string: String::new(),
        metadata_props,
    };
    log::info!("Building graph (opset {}, constant folding {})", options.opset_version, options.do_constant_folding);
    let mut proto = graph.to_model_proto(&build_options)?;

    // The check needs parameter values, so a parameterless export is checked against an embedded twin.
    let check_session = if options.export_params {
        Session::from_model(&proto, base_dir)
    } else {
        let check_options = BuildOptions { weight_storage: WeightStorageStrategy::EmbeddedData, ..build_options.clone() };
        Session::from_model(&graph.to_model_proto(&check_options)?, None)
    };
    let check_session = check_session.map_err(ExportError::TraceCheckError)?;
    let outputs = check_session.run(&sample.feeds()).map_err(ExportError::TraceCheckError)?;
    drop(check_session);

    let mut traced_shapes: HashMap<String, Vec<usize>> =
        sample.named().into_iter().map(|(name, t)| (name.to_string(), t.shape().to_vec())).collect();
    for (name, _) in &graph.outputs {
        let value = outputs.get(name).ok_or_else(|| ExportError::TraceCheckError(SessionError::MissingValue(name.clone())))?;
        traced_shapes.insert(name.clone(), value.shape().to_vec());
    }
    let logits_shape = traced_shapes.get(LOGITS).cloned().unwrap_or_default();
    log::info!("Trace check produced logits of shape {logits_shape:?}");

    apply_io_declarations(&mut proto, options, &traced_shapes)?;

    let bytes = proto.encode_to_vec();
    std::fs::write(path, &bytes)?;
    let graph_proto = proto.graph.unwrap_or_default();
    let artifact = ExportedArtifact {
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        external_data_path,
        node_count: graph_proto.node.len(),
        initializer_count: graph_proto.initializer.len(),
        logits_shape,
    };
    log::info!(
        "Wrote {} ({} bytes, {} nodes, {} initializers)",
        artifact.path.display(),
        artifact.byte_size,
        artifact.node_count,
        artifact.initializer_count
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_mirror_reference_export() {
        let options = ExportOptions::default();
        assert_eq!(options.opset_version, 14);
        assert!(options.export_params);
        assert_eq!(options.dynamic_axes[DECODER_INPUT_IDS][&1], "decoder_sequence_length");
        assert!(validate_options(&options, 3, 1).is_ok());
    }

    #[test]
    fn option_validation() {
        let options = ExportOptions { opset_version: 12, ..Default::default() };
        assert!(matches!(validate_options(&options, 3, 1), Err(ExportError::UnsupportedOpset(12))));

        let options = ExportOptions { input_names: vec!["a".to_string()], ..Default::default() };
        assert!(matches!(validate_options(&options, 3, 1), Err(ExportError::NameCount { kind: "input", .. })));

        let options = ExportOptions { output_names: vec![INPUT_IDS.to_string()], ..Default::default() };
        assert!(matches!(validate_options(&options, 3, 1), Err(ExportError::DuplicateName(name)) if name == INPUT_IDS));

        for bad in ["", "../weights.bin", "/tmp/weights.bin", "sub/weights.bin"] {
            let options = ExportOptions { external_data: Some(bad.to_string()), ..Default::default() };
            assert!(matches!(validate_options(&options, 3, 1), Err(ExportError::InvalidExternalDataName(_))), "{bad}");
        }
        let options = ExportOptions { external_data: Some("g2p_t5_model.onnx.data".to_string()), ..Default::default() };
        assert!(validate_options(&options, 3, 1).is_ok());

        let mut options = ExportOptions::default();
        options.dynamic_axes.insert("past_key_values".to_string(), BTreeMap::new());
        assert!(matches!(validate_options(&options, 3, 1), Err(ExportError::UnknownDynamicAxisName(_))));
    }

    #[test]
    fn metadata_errors_keep_their_own_variant() {
        let err = serde_json::from_str::<G2pMetadata>("{").unwrap_err();
        let err = ExportError::from(err);
        assert!(matches!(err, ExportError::MetadataError(_)));
        assert!(err.to_string().starts_with("Metadata serialization error"));
    }

    #[test]
    fn sample_validation() {
        let sample = SampleInputs::from_single(vec![5, 6, 1], vec![1, 1, 1], 0).unwrap();
        assert!(sample.validate().is_ok());

        let mut bad = sample.clone();
        bad.attention_mask = NumericTensor::from_i64(vec![1, 1], &[1, 2]).unwrap();
        assert!(matches!(bad.validate(), Err(ExportError::InvalidSampleInput(_))));

        let mut bad = sample;
        bad.decoder_input_ids = NumericTensor::from_f32(vec![0.0], &[1, 1]).unwrap();
        assert!(matches!(bad.validate(), Err(ExportError::InvalidSampleInput(_))));
    }
}

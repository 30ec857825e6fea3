use crate::export::ExportOptions;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file read error: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Config file parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

pub const DEFAULT_MODEL: &str = "charsiu/g2p_multilingual_byT5_tiny_16_layers_100";
pub const DEFAULT_TEXT: &str = "charsiu is delicious";
pub const DEFAULT_OUTPUT: &str = "g2p_t5_model.onnx";

/// Everything the exporter binary reads. Missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Hub repository id, or a local directory holding `config.json` and weights.
    pub model: String,
    pub revision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub text: String,
    pub output_path: PathBuf,
    pub opset_version: i64,
    pub export_params: bool,
    pub do_constant_folding: bool,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub dynamic_axes: BTreeMap<String, BTreeMap<usize, String>>,
    /// Store parameters in this sidecar file instead of inside the model.
    pub external_data: Option<String>,
    /// Decoder start token used when neither the model nor the tokenizer defines one.
    pub fallback_decoder_start_token_id: i64,
    /// Decoding step limit for the `phonemize` demo.
    pub max_length: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let options = ExportOptions::default();
        Self {
            model: DEFAULT_MODEL.to_string(),
            revision: None,
            cache_dir: None,
            text: DEFAULT_TEXT.to_string(),
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            opset_version: options.opset_version,
            export_params: options.export_params,
            do_constant_folding: options.do_constant_folding,
            input_names: options.input_names,
            output_names: options.output_names,
            dynamic_axes: options.dynamic_axes,
            external_data: options.external_data,
            fallback_decoder_start_token_id: 0,
            max_length: 300,
        }
    }
}

impl ExportConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            opset_version: self.opset_version,
            export_params: self.export_params,
            do_constant_folding: self.do_constant_folding,
            input_names: self.input_names.clone(),
            output_names: self.output_names.clone(),
            dynamic_axes: self.dynamic_axes.clone(),
            metadata: None,
            external_data: self.external_data.clone(),
        }
    }
}

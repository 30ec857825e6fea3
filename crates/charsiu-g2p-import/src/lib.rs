pub mod onnx_graph;
pub mod t5;

use memmap2::Mmap;
use onnx_graph::weights::{PthWeightManager, SafetensorsWeightManager};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use t5::{T5Config, T5Graph};

pub use onnx_graph::onnx;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot identify model: {0}")]
    CannotIdentifyModel(PathBuf),
    #[error("Unknown model type: {0}")]
    UnknownModelType(String),
    #[error("Missing config entry: {0}")]
    MissingConfigEntryError(String),
    #[error("Config file read error: {0}")]
    ConfigFileReadError(#[from] std::io::Error),
    #[error("Config file parse error: {0}")]
    ConfigFileParseError(serde_json::Error),
    #[error("Model load error: {0}")]
    ModelLoadError(anyhow::Error),
    #[error("Model build error: {0}")]
    ModelBuildError(#[from] onnx_graph::Error),
    #[error("Unsupported configuration: {0} {1}")]
    UnsupportedConfigurationError(String, String),
}

enum ModelWeights {
    Safetensors(SafetensorsWeightManager),
    Pth(PthWeightManager),
}

/// A Hugging Face checkpoint directory: parsed `config.json` plus opened weights.
pub struct TransformersModel {
    path: PathBuf,
    config: T5Config,
    weights: ModelWeights,
}

impl TransformersModel {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    pub fn build_graph(&self) -> Result<T5Graph, Error> {
        Ok(match &self.weights {
            ModelWeights::Safetensors(weights) => t5::build_t5_graph(weights, &self.config)?,
            ModelWeights::Pth(weights) => t5::build_t5_graph(weights, &self.config)?,
        })
    }
}

fn find_files_with_extension(model_path: &Path, extension: &str) -> Result<Vec<PathBuf>, Error> {
    let mut files = vec![];
    for entry in std::fs::read_dir(model_path)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn load_transformers_format(model_path: &Path) -> Result<TransformersModel, Error> {
    log::info!("Loading hf transformers weights from {}", model_path.display());

    let config_file = File::open(model_path.join("config.json"))?;
    let raw_config: serde_json::Value = serde_json::from_reader(config_file).map_err(Error::ConfigFileParseError)?;

    let model_type = raw_config
        .get("model_type")
        .and_then(|x| x.as_str())
        .ok_or(Error::MissingConfigEntryError("model_type".to_string()))?;
    if model_type != "t5" {
        return Err(Error::UnknownModelType(model_type.to_string()));
    }
    let config = T5Config::from_huggingface_transformers_json(&raw_config)?;

    let safetensors_files = find_files_with_extension(model_path, "safetensors")?;
    let weights = if !safetensors_files.is_empty() {
        let mut safetensors_mmaps = vec![];
        for safetensors_file in safetensors_files {
            let safetensors_file = File::open(safetensors_file)?;
            let mmap = unsafe { Mmap::map(&safetensors_file) }?;
            safetensors_mmaps.push(Arc::new(mmap));
        }
        ModelWeights::Safetensors(SafetensorsWeightManager::new(safetensors_mmaps)?)
    } else {
        let pth_path = model_path.join("pytorch_model.bin");
        if !pth_path.exists() {
            return Err(Error::CannotIdentifyModel(model_path.to_path_buf()));
        }
        let tensors = candle_core::pickle::PthTensors::new(&pth_path, None).map_err(|x| Error::ModelLoadError(x.into()))?;
        ModelWeights::Pth(PthWeightManager::new(Arc::new(tensors)))
    };

    log::info!(
        "Loaded t5 config: {} encoder layers, {} decoder layers, d_model {}, vocab {}",
        config.num_layers,
        config.num_decoder_layers,
        config.d_model,
        config.vocab_size
    );
    Ok(TransformersModel { path: model_path.to_path_buf(), config, weights })
}

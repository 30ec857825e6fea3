use crate::tokenizer::{ByT5Tokenizer, TokenizerError};
use charsiu_g2p_import::{TransformersModel, load_transformers_format};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Model \"{0}\" contains invalid characters, expected only alphanumeric or '-', '_', '.', '/'")]
    InvalidIdentifier(String),
    #[error("Revision \"{0}\" contains invalid characters, expected only alphanumeric or '-', '_', '.', '/'")]
    InvalidRevision(String),
    #[error("{0} is not a local model directory and hub downloads are disabled")]
    DownloadsDisabled(String),
    #[error("Hub error: {0}")]
    ApiError(String),
    #[error("Repository {0} has neither model.safetensors nor pytorch_model.bin")]
    MissingWeights(String),
    #[error(transparent)]
    ModelError(#[from] charsiu_g2p_import::Error),
    #[error(transparent)]
    TokenizerError(#[from] TokenizerError),
}

fn is_valid_char(x: char) -> bool {
    x.is_alphanumeric() || ['-', '_', '.', '/'].contains(&x)
}

fn validate(identifier: &str, revision: Option<&str>) -> Result<(), HubError> {
    if identifier.is_empty() || !identifier.chars().all(is_valid_char) {
        return Err(HubError::InvalidIdentifier(identifier.to_string()));
    }
    if let Some(revision) = revision {
        if !revision.chars().all(is_valid_char) {
            return Err(HubError::InvalidRevision(revision.to_string()));
        }
    }
    Ok(())
}

#[cfg(feature = "http")]
fn download(identifier: &str, revision: Option<&str>, cache_dir: Option<&Path>) -> Result<PathBuf, HubError> {
    use hf_hub::api::sync::ApiBuilder;
    use hf_hub::{Repo, RepoType};

    let mut builder = ApiBuilder::new();
    if let Some(cache_dir) = cache_dir {
        builder = builder.with_cache_dir(cache_dir.to_path_buf());
    }
    let api = builder.build().map_err(|x| HubError::ApiError(x.to_string()))?;
    let repo = match revision {
        Some(revision) => Repo::with_revision(identifier.to_string(), RepoType::Model, revision.to_string()),
        None => Repo::model(identifier.to_string()),
    };
    let api = api.repo(repo);

    log::info!("Fetching {identifier} from the hub");
    let config_path = api.get("config.json").map_err(|x| HubError::ApiError(x.to_string()))?;
    if let Err(err) = api.get("model.safetensors") {
        log::debug!("No model.safetensors in {identifier} ({err}), trying pytorch_model.bin");
        api.get("pytorch_model.bin").map_err(|_| HubError::MissingWeights(identifier.to_string()))?;
    }
    if let Err(err) = api.get("tokenizer_config.json") {
        log::debug!("No tokenizer_config.json in {identifier} ({err}), using tokenizer defaults");
    }
    config_path.parent().map(Path::to_path_buf).ok_or_else(|| HubError::ApiError(format!("bad cache path {}", config_path.display())))
}

#[cfg(not(feature = "http"))]
fn download(identifier: &str, _revision: Option<&str>, _cache_dir: Option<&Path>) -> Result<PathBuf, HubError> {
    Err(HubError::DownloadsDisabled(identifier.to_string()))
}

/// Resolves `identifier` to a checkpoint directory, downloading it first unless it already is one.
pub fn resolve_model_dir(identifier: &str, revision: Option<&str>, cache_dir: Option<&Path>) -> Result<PathBuf, HubError> {
    let local = Path::new(identifier);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    validate(identifier, revision)?;
    download(identifier, revision, cache_dir)
}

/// The tokenizer and model for `identifier`, which is either a local directory or a hub repository id.
pub fn fetch(identifier: &str, revision: Option<&str>, cache_dir: Option<&Path>) -> Result<(ByT5Tokenizer, TransformersModel), HubError> {
    let model_dir = resolve_model_dir(identifier, revision, cache_dir)?;
    let tokenizer = ByT5Tokenizer::from_pretrained_dir(&model_dir)?;
    let model = load_transformers_format(&model_dir)?;
    Ok((tokenizer, model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate("charsiu/g2p_multilingual_byT5_tiny_16_layers_100", Some("main")).is_ok());
        assert!(matches!(validate("charsiu/g2p?x=1", None), Err(HubError::InvalidIdentifier(_))));
        assert!(matches!(validate("", None), Err(HubError::InvalidIdentifier(_))));
        assert!(matches!(validate("charsiu/g2p", Some("main;rm")), Err(HubError::InvalidRevision(_))));
    }

    #[test]
    fn local_directories_skip_the_hub() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_model_dir(dir.path().to_str().unwrap(), Some("not valid!"), None).unwrap();
        assert_eq!(resolved, dir.path());
        assert!(matches!(fetch(dir.path().to_str().unwrap(), None, None), Err(HubError::ModelError(_))));
    }
}

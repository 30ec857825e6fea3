use std::path::Path;
use std::str::Utf8Error;

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error(transparent)]
    Utf8Error(#[from] Utf8Error),
    #[error("Tokenizer config read error: {0}")]
    ConfigReadError(#[from] std::io::Error),
    #[error("Tokenizer config parse error: {0}")]
    ConfigParseError(#[from] serde_json::Error),
}

pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> Result<String, TokenizerError>;
}

/// The subset of `tokenizer_config.json` a byte-level T5 tokenizer reads.
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ByT5TokenizerConfig {
    #[serde(default)]
    tokenizer_class: Option<String>,
    #[serde(default = "default_pad_token")]
    pad_token: Option<serde_json::Value>,
    #[serde(default)]
    extra_ids: Option<u32>,
}

fn default_pad_token() -> Option<serde_json::Value> {
    Some(serde_json::Value::String("<pad>".to_string()))
}

/// ByT5: every UTF-8 byte maps to `byte + 3`, after the pad, eos and unk ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByT5Tokenizer {
    pad_token_id: Option<u32>,
    extra_ids: u32,
}

impl ByT5Tokenizer {
    pub const PAD_TOKEN_ID: u32 = 0;
    pub const EOS_TOKEN_ID: u32 = 1;
    pub const UNK_TOKEN_ID: u32 = 2;
    const OFFSET: u32 = 3;

    pub fn new() -> Self {
        Self { pad_token_id: Some(Self::PAD_TOKEN_ID), extra_ids: 125 }
    }

    /// Reads `tokenizer_config.json` when the model ships one; absent files mean defaults.
    pub fn from_pretrained_dir(model_dir: &Path) -> Result<Self, TokenizerError> {
        let path = model_dir.join("tokenizer_config.json");
        if !path.exists() {
            return Ok(Self::new());
        }
        let config: ByT5TokenizerConfig = serde_json::from_reader(std::fs::File::open(path)?)?;
        Ok(Self::from_config(&config))
    }

    fn from_config(config: &ByT5TokenizerConfig) -> Self {
        if let Some(class) = &config.tokenizer_class {
            if class != "ByT5Tokenizer" {
                log::warn!("Tokenizer class {class} is not ByT5Tokenizer, encoding bytes anyway");
            }
        }
        let pad_token_id = match &config.pad_token {
            None | Some(serde_json::Value::Null) => None,
            Some(_) => Some(Self::PAD_TOKEN_ID),
        };
        Self { pad_token_id, extra_ids: config.extra_ids.unwrap_or(125) }
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        Self::EOS_TOKEN_ID
    }

    pub fn vocab_size(&self) -> u32 {
        Self::OFFSET + 256 + self.extra_ids
    }

    /// Token ids and an all-ones attention mask, as int64 rows of equal length.
    pub fn encode_with_mask(&self, text: &str) -> (Vec<i64>, Vec<i64>) {
        let ids: Vec<i64> = self.encode(text).into_iter().map(i64::from).collect();
        let mask = vec![1; ids.len()];
        (ids, mask)
    }

    fn is_special(&self, token: u32) -> bool {
        token < Self::OFFSET || token >= Self::OFFSET + 256
    }

    /// Like [`Tokenizer::decode`], but invalid or truncated UTF-8 sequences are dropped.
    pub fn decode_lossy(&self, tokens: &[u32]) -> String {
        let bytes = self.content_bytes(tokens);
        bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
    }

    fn content_bytes(&self, tokens: &[u32]) -> Vec<u8> {
        tokens.iter().filter(|t| !self.is_special(**t)).map(|t| (t - Self::OFFSET) as u8).collect()
    }
}

impl Default for ByT5Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByT5Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| u32::from(b) + Self::OFFSET).chain(std::iter::once(Self::EOS_TOKEN_ID)).collect()
    }

    /// Special and extra-id tokens are skipped.
    fn decode(&self, tokens: &[u32]) -> Result<String, TokenizerError> {
        Ok(std::str::from_utf8(&self.content_bytes(tokens))?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bytes_with_offset_and_eos() {
        let tokenizer = ByT5Tokenizer::new();
        assert_eq!(tokenizer.encode("ab"), vec![100, 101, 1]);
        // "é" is two UTF-8 bytes.
        assert_eq!(tokenizer.encode("é"), vec![0xC3 + 3, 0xA9 + 3, 1]);
        let (ids, mask) = tokenizer.encode_with_mask("charsiu is delicious");
        assert_eq!(ids.len(), 21);
        assert_eq!(mask, vec![1; 21]);
        assert_eq!(ids, tokenizer.encode_with_mask("charsiu is delicious").0);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tokenizer = ByT5Tokenizer::new();
        let mut tokens = vec![0];
        tokens.extend(tokenizer.encode("ˈtʃɑɹ"));
        tokens.push(300);
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "ˈtʃɑɹ");
    }

    #[test]
    fn decode_rejects_broken_utf8() {
        let tokenizer = ByT5Tokenizer::new();
        assert!(matches!(tokenizer.decode(&[0xC3 + 3]), Err(TokenizerError::Utf8Error(_))));
    }

    #[test]
    fn lossy_decode_drops_truncated_characters() {
        let tokenizer = ByT5Tokenizer::new();
        let mut tokens = tokenizer.encode("tʃ");
        tokens.pop();
        assert_eq!(tokenizer.decode_lossy(&tokens), "tʃ");
        // Cut inside the two-byte "ʃ".
        tokens.pop();
        assert_eq!(tokenizer.decode_lossy(&tokens), "t");
        assert_eq!(tokenizer.decode_lossy(&[212]), "");
        assert_eq!(tokenizer.decode_lossy(&[0xFF + 3, 0, 120, 0xC3 + 3]), "u");
    }

    #[test]
    fn null_pad_token_disables_pad() {
        let config: ByT5TokenizerConfig = serde_json::from_str(r#"{"pad_token": null, "extra_ids": 0}"#).unwrap();
        let tokenizer = ByT5Tokenizer::from_config(&config);
        assert_eq!(tokenizer.pad_token_id(), None);
        assert_eq!(tokenizer.vocab_size(), 259);

        let config: ByT5TokenizerConfig = serde_json::from_str(r#"{"eos_token": "</s>"}"#).unwrap();
        assert_eq!(ByT5Tokenizer::from_config(&config).pad_token_id(), Some(0));
    }
}

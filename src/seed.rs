/// Which source supplied the decoder start token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum_macros::Display)]
pub enum SeedSource {
    ModelConfig,
    TokenizerPad,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DecoderSeed {
    pub token_id: i64,
    pub source: SeedSource,
}

/// Model `decoder_start_token_id`, then the tokenizer pad token, then `fallback`.
/// Only the last step logs, and it logs exactly one warning.
pub fn resolve_decoder_seed(decoder_start_token_id: Option<i64>, pad_token_id: Option<u32>, fallback: i64) -> DecoderSeed {
    if let Some(token_id) = decoder_start_token_id {
        return DecoderSeed { token_id, source: SeedSource::ModelConfig };
    }
    if let Some(pad) = pad_token_id {
        return DecoderSeed { token_id: i64::from(pad), source: SeedSource::TokenizerPad };
    }
    log::warn!(
        "Neither decoder_start_token_id nor pad_token_id is defined, assuming decoder start token {fallback}. Please verify this manually."
    );
    DecoderSeed { token_id: fallback, source: SeedSource::Fallback }
}

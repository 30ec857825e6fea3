use crate::export::{G2pMetadata, METADATA_KEY};
use crate::session::{Session, SessionError};
use crate::tokenizer::{ByT5Tokenizer, TokenizerError};
use charsiu_g2p_import::onnx_graph::numeric::{NumericError, NumericTensor};
use charsiu_g2p_import::t5::{ATTENTION_MASK, DECODER_INPUT_IDS, INPUT_IDS, LOGITS};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum G2pError {
    #[error(transparent)]
    SessionError(#[from] SessionError),
    #[error(transparent)]
    TokenizerError(#[from] TokenizerError),
    #[error(transparent)]
    NumericError(#[from] NumericError),
    #[error("Model metadata is malformed: {0}")]
    MetadataError(#[from] serde_json::Error),
    #[error("Logits have unexpected shape {0:?}")]
    LogitsShapeError(Vec<usize>),
}

/// espeak language codes and the tags the multilingual checkpoints were trained with.
const ESPEAK_TO_MODEL_LANG: &[(&str, &str)] = &[
    ("cmn", "zho-s"),
    ("zho", "zho-s"),
    ("yue", "yue"),
    ("ja", "jpn"),
    ("ko", "kor"),
    ("th", "tha"),
    ("vi", "vie-n"),
    ("vi-n", "vie-n"),
    ("vi-c", "vie-c"),
    ("vi-s", "vie-s"),
    ("hi", "hin"),
    ("bn", "ben"),
    ("ta", "tam"),
    ("id", "ind"),
    ("tr", "tur"),
    ("fa", "fas"),
    ("ar", "ara"),
    ("kk", "kaz"),
    ("km", "khm"),
    ("my", "bur"),
    ("en", "eng-us"),
    ("en-us", "eng-us"),
    ("en-uk", "eng-uk"),
    ("en-gb", "eng-uk"),
    ("fr", "fra"),
    ("fr-ca", "fra-qu"),
    ("de", "ger"),
    ("es", "spa"),
    ("es-mx", "spa-me"),
    ("it", "ita"),
    ("pt", "por-po"),
    ("pt-pt", "por-po"),
    ("pt-br", "por-bz"),
    ("ru", "rus"),
    ("nl", "dut"),
    ("pl", "pol"),
    ("sv", "swe"),
    ("da", "dan"),
    ("no", "nob"),
    ("fi", "fin"),
    ("el", "gre"),
    ("el-grc", "grc"),
    ("hu", "hun"),
    ("cs", "cze"),
    ("ro", "ron"),
    ("bg", "bul"),
    ("uk", "ukr"),
    ("sr", "srp"),
    ("hr", "hbs-latn"),
    ("bs", "bos"),
    ("sl", "slv"),
    ("sq", "sqi"),
    ("is", "ice"),
    ("ga", "gle"),
    ("cy", "wel-nw"),
    ("af", "afr"),
    ("sw", "swa"),
];

/// Unknown codes pass through unchanged.
pub fn model_language(lang: &str) -> &str {
    ESPEAK_TO_MODEL_LANG.iter().find(|(espeak, _)| *espeak == lang).map(|(_, model)| *model).unwrap_or(lang)
}

/// Greedy grapheme-to-phoneme decoding over an exported artifact.
pub struct G2p {
    session: Session,
    tokenizer: ByT5Tokenizer,
    decoder_start_token_id: i64,
    eos_token_id: i64,
    max_length: usize,
}

impl G2p {
    /// Start and end tokens come from the artifact's metadata when it carries any.
    pub fn new(session: Session, tokenizer: ByT5Tokenizer, max_length: usize) -> Result<Self, G2pError> {
        let mut decoder_start_token_id = i64::from(ByT5Tokenizer::PAD_TOKEN_ID);
        let mut eos_token_id = i64::from(tokenizer.eos_token_id());
        if let Some(json) = session.metadata(METADATA_KEY) {
            let metadata: G2pMetadata = serde_json::from_str(json)?;
            decoder_start_token_id = metadata.decoder_start_token_id;
            eos_token_id = metadata.eos_token_id.unwrap_or(eos_token_id);
        }
        Ok(Self { session, tokenizer, decoder_start_token_id, eos_token_id, max_length })
    }

    pub fn load(path: &Path, max_length: usize) -> Result<Self, G2pError> {
        let session = Session::load(path)?;
        let tokenizer = match path.parent() {
            Some(dir) => ByT5Tokenizer::from_pretrained_dir(dir)?,
            None => ByT5Tokenizer::new(),
        };
        Self::new(session, tokenizer, max_length)
    }

    /// Generated token ids, without the decoder start token and the terminating EOS.
    pub fn generate(&self, text: &str, lang: &str) -> Result<Vec<i64>, G2pError> {
        let prompt = format!("<{}>: {text}", model_language(lang));
        let (input_ids, attention_mask) = self.tokenizer.encode_with_mask(&prompt);
        let len = input_ids.len();
        let mut feeds = HashMap::from([
            (INPUT_IDS.to_string(), NumericTensor::from_i64(input_ids, &[1, len])?),
            (ATTENTION_MASK.to_string(), NumericTensor::from_i64(attention_mask, &[1, len])?),
        ]);

        let mut decoded = vec![self.decoder_start_token_id];
        for _ in 0..self.max_length {
            feeds.insert(DECODER_INPUT_IDS.to_string(), NumericTensor::from_i64(decoded.clone(), &[1, decoded.len()])?);
            let outputs = self.session.run(&feeds)?;
            let logits = outputs.get(LOGITS).ok_or_else(|| SessionError::MissingValue(LOGITS.to_string()))?.as_f32()?;
            let &[1, steps, vocab] = logits.shape() else {
                return Err(G2pError::LogitsShapeError(logits.shape().to_vec()));
            };
            if steps == 0 || vocab == 0 {
                return Err(G2pError::LogitsShapeError(logits.shape().to_vec()));
            }
            let last = logits.iter().skip((steps - 1) * vocab).take(vocab);
            // First maximum wins on ties.
            let (next, _) = last.enumerate().fold((0, f32::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best });
            let next = next as i64;
            if next == self.eos_token_id {
                break;
            }
            decoded.push(next);
        }
        decoded.remove(0);
        Ok(decoded)
    }

    pub fn phonemize(&self, text: &str, lang: &str) -> Result<String, G2pError> {
        let generated = self.generate(text, lang)?;
        let tokens: Vec<u32> = generated.into_iter().filter_map(|t| u32::try_from(t).ok()).collect();
        // A step limit can stop generation inside a multi-byte character.
        let phonemes = self.tokenizer.decode_lossy(&tokens);
        log::debug!("Phonemized {text:?} ({lang}) as {phonemes:?}");
        Ok(phonemes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_codes_map_to_model_tags() {
        assert_eq!(model_language("en"), "eng-us");
        assert_eq!(model_language("en-gb"), "eng-uk");
        assert_eq!(model_language("cmn"), "zho-s");
        assert_eq!(model_language("hr"), "hbs-latn");
        assert_eq!(model_language("eng-us"), "eng-us");
        assert_eq!(model_language("xx"), "xx");
    }
}

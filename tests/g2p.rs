mod common;

use charsiu_g2p::export::{ExportOptions, G2pMetadata, SampleInputs, export};
use charsiu_g2p::g2p::G2p;
use charsiu_g2p::seed::SeedSource;
use charsiu_g2p::tokenizer::{ByT5Tokenizer, Tokenizer};
use std::path::Path;
use charsiu_g2p_import::load_transformers_format;
use common::{TinyT5, TinyT5Options, ids};
use ndarray::{Array2, s};

fn reference_greedy(checkpoint: &TinyT5, prompt: &str, start: i64, max_length: usize) -> Vec<i64> {
    let tokens: Vec<i64> = ByT5Tokenizer::new().encode(prompt).into_iter().map(i64::from).collect();
    let input_ids = ids(&[&tokens]);
    let mask = Array2::ones(input_ids.raw_dim());
    let mut decoded = vec![start];
    for _ in 0..max_length {
        let logits = checkpoint.reference_logits(&input_ids, &mask, &ids(&[&decoded]));
        let last = logits.slice(s![0, decoded.len() - 1, ..]);
        let next = last.iter().enumerate().fold((0, f32::NEG_INFINITY), |b, (i, &x)| if x > b.1 { (i, x) } else { b }).0 as i64;
        if next == 1 {
            break;
        }
        decoded.push(next);
    }
    decoded.split_off(1)
}

fn export_with_metadata(checkpoint: &TinyT5, path: &Path) {
    let model = load_transformers_format(checkpoint.path()).unwrap();
    let (input_ids, attention_mask) = ByT5Tokenizer::new().encode_with_mask("charsiu is delicious");
    let sample = SampleInputs::from_single(input_ids, attention_mask, 0).unwrap();
    let options = ExportOptions {
        metadata: Some(G2pMetadata {
            decoder_start_token_id: 0,
            decoder_start_source: SeedSource::ModelConfig,
            eos_token_id: Some(1),
            pad_token_id: Some(0),
        }),
        ..Default::default()
    };
    export(&model, &sample, path, &options).unwrap();
}

#[test]
fn greedy_decoding_follows_the_reference_model() {
    let checkpoint = TinyT5::new(TinyT5Options::default());
    let out_dir = tempfile::tempdir().unwrap();
    let path = out_dir.path().join("g2p_t5_model.onnx");
    export_with_metadata(&checkpoint, &path);

    let g2p = G2p::load(&path, 6).unwrap();
    let generated = g2p.generate("charsiu", "en").unwrap();
    assert!(generated.len() <= 6);
    assert!(generated.iter().all(|t| *t != 1));
    assert_eq!(generated, reference_greedy(&checkpoint, "<eng-us>: charsiu", 0, 6));

    let again = g2p.generate("charsiu", "eng-us").unwrap();
    assert_eq!(generated, again);
}

#[test]
fn step_limit_inside_a_character_still_phonemizes() {
    // Random weights emit arbitrary bytes, so short limits regularly end mid-character.
    let checkpoint = TinyT5::new(TinyT5Options { seed: 8, ..Default::default() });
    let out_dir = tempfile::tempdir().unwrap();
    let path = out_dir.path().join("g2p_t5_model.onnx");
    export_with_metadata(&checkpoint, &path);

    let tokenizer = ByT5Tokenizer::new();
    for max_length in 1..=4 {
        let g2p = G2p::load(&path, max_length).unwrap();
        let generated: Vec<u32> = g2p.generate("charsiu", "en").unwrap().into_iter().map(|t| t as u32).collect();
        let phonemes = g2p.phonemize("charsiu", "en").unwrap();
        assert_eq!(phonemes, tokenizer.decode_lossy(&generated));
        if let Ok(strict) = tokenizer.decode(&generated) {
            assert_eq!(phonemes, strict);
        }
    }
}

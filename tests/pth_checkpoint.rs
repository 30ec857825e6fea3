use charsiu_g2p::export::{ExportOptions, SampleInputs, export};
use charsiu_g2p::onnx::ModelProto;
use charsiu_g2p::onnx::tensor_proto::DataType;
use charsiu_g2p::session::Session;
use charsiu_g2p::tokenizer::ByT5Tokenizer;
use charsiu_g2p_import::load_transformers_format;
use prost::Message;
use std::path::{Path, PathBuf};

/// The same tiny T5 saved by `tests/fixtures/tiny_t5/generate.py` as a torch zip
/// pickle and as safetensors, with one f16 and one bf16 tensor in each.
fn fixture(format: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tiny_t5").join(format)
}

#[test]
fn pytorch_checkpoint_exports_like_safetensors() {
    let (input_ids, attention_mask) = ByT5Tokenizer::new().encode_with_mask("charsiu is delicious");
    let sample = SampleInputs::from_single(input_ids, attention_mask, 0).unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let mut artifacts = vec![];
    for format in ["pth", "safetensors"] {
        let model = load_transformers_format(&fixture(format)).unwrap();
        assert_eq!(model.config().vocab_size, 128);
        let path = out_dir.path().join(format!("{format}.onnx"));
        let artifact = export(&model, &sample, &path, &ExportOptions::default()).unwrap();
        assert_eq!(artifact.logits_shape, vec![1, 1, 128]);
        artifacts.push(path);
    }

    let logits: Vec<_> = artifacts
        .iter()
        .map(|path| Session::load(path).unwrap().run(&sample.feeds()).unwrap().remove("logits").unwrap())
        .collect();
    assert_eq!(logits[0], logits[1]);
    assert_eq!(std::fs::read(&artifacts[0]).unwrap(), std::fs::read(&artifacts[1]).unwrap());
}

#[test]
fn half_precision_pickle_tensors_are_widened() {
    let model = load_transformers_format(&fixture("pth")).unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let path = out_dir.path().join("pth.onnx");
    let (input_ids, attention_mask) = ByT5Tokenizer::new().encode_with_mask("abc");
    let sample = SampleInputs::from_single(input_ids, attention_mask, 0).unwrap();
    export(&model, &sample, &path, &ExportOptions::default()).unwrap();

    let proto = ModelProto::decode(std::fs::read(&path).unwrap().as_slice()).unwrap();
    let graph = proto.graph.unwrap();
    for name in ["decoder.final_layer_norm.weight", "encoder.final_layer_norm.weight"] {
        let init = graph.initializer.iter().find(|i| i.name == name).unwrap();
        assert_eq!(init.data_type, DataType::Float as i32, "{name}");
        assert_eq!(init.raw_data.len(), 8 * 4, "{name}");
    }
}

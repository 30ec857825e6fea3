pub mod config;
pub mod export;
pub mod g2p;
pub mod hub;
pub mod phoneme;
pub mod seed;
pub mod session;
pub mod tokenizer;

pub use charsiu_g2p_import::onnx;
pub use charsiu_g2p_import::onnx_graph::numeric::NumericTensor;
pub use export::{ExportError, ExportOptions, ExportedArtifact, SampleInputs, export};

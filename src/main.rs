use anyhow::Context;
use charsiu_g2p::config::ExportConfig;
use charsiu_g2p::export::{G2pMetadata, SampleInputs, export};
use charsiu_g2p::hub;
use charsiu_g2p::seed::resolve_decoder_seed;
use std::path::Path;

fn run() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ExportConfig::load(Path::new(&path)).with_context(|| format!("reading config {path}"))?,
        None => ExportConfig::default(),
    };

    let (tokenizer, model) = hub::fetch(&config.model, config.revision.as_deref(), config.cache_dir.as_deref())?;
    let (input_ids, attention_mask) = tokenizer.encode_with_mask(&config.text);
    log::info!("Encoded {:?} as {} tokens", config.text, input_ids.len());

    let seed = resolve_decoder_seed(
        model.config().decoder_start_token_id,
        tokenizer.pad_token_id(),
        config.fallback_decoder_start_token_id,
    );
    log::info!("Decoder start token {} (from {})", seed.token_id, seed.source);

    let sample = SampleInputs::from_single(input_ids, attention_mask, seed.token_id)?;
    let mut options = config.export_options();
    options.metadata = Some(G2pMetadata {
        decoder_start_token_id: seed.token_id,
        decoder_start_source: seed.source,
        eos_token_id: model.config().eos_token_id,
        pad_token_id: model.config().pad_token_id.or(tokenizer.pad_token_id().map(i64::from)),
    });

    let artifact = export(&model, &sample, &config.output_path, &options)?;
    log::info!(
        "Exported {} to {} (logits {:?})",
        config.model,
        artifact.path.display(),
        artifact.logits_shape
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("ONNX export failed: {err:#}");
        std::process::exit(1);
    }
}

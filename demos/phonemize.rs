use anyhow::Context;
use charsiu_g2p::config::ExportConfig;
use charsiu_g2p::g2p::G2p;
use charsiu_g2p::phoneme::PhonemeTokenizer;
use std::path::Path;

/// Usage: phonemize <text> [lang] [config.json] [tokens.txt]
///
/// The model path and decoding limit come from the same config the exporter reads.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let text = args.get(1).map(String::as_str).unwrap_or("charsiu is delicious");
    let lang = args.get(2).map(String::as_str).unwrap_or("en-us");
    let config = match args.get(3) {
        Some(path) => ExportConfig::load(Path::new(path)).with_context(|| format!("reading config {path}"))?,
        None => ExportConfig::default(),
    };

    let g2p = G2p::load(&config.output_path, config.max_length)
        .with_context(|| format!("loading {}", config.output_path.display()))?;
    let phonemes = g2p.phonemize(text, lang)?;
    println!("{phonemes}");

    if let Some(table_path) = args.get(4) {
        let table = PhonemeTokenizer::load(Path::new(table_path))?;
        println!("{:?}", table.tokenize(&phonemes));
    }
    Ok(())
}

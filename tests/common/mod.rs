#![allow(dead_code)]

use ndarray::{Array1, Array2, Array3, ArrayD, Ix1, Ix2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

pub const VOCAB_SIZE: usize = 384;
const D_MODEL: usize = 16;
const D_KV: usize = 4;
const NUM_HEADS: usize = 2;
const D_FF: usize = 24;
const NUM_BUCKETS: usize = 8;
const MAX_DISTANCE: usize = 20;
const EPS: f32 = 1e-6;

#[derive(Debug, Clone)]
pub struct TinyT5Options {
    pub feed_forward_proj: &'static str,
    pub tie_word_embeddings: bool,
    pub decoder_start_token_id: Option<i64>,
    /// `None` writes `"pad_token": null` to the tokenizer config.
    pub tokenizer_pad_token: Option<&'static str>,
    pub skip_weight: Option<&'static str>,
    pub seed: u64,
}

impl Default for TinyT5Options {
    fn default() -> Self {
        Self {
            feed_forward_proj: "gated-gelu",
            tie_word_embeddings: false,
            decoder_start_token_id: Some(0),
            tokenizer_pad_token: Some("<pad>"),
            skip_weight: None,
            seed: 17,
        }
    }
}

/// A randomly initialised T5 checkpoint on disk plus a plain ndarray forward pass over the same weights.
pub struct TinyT5 {
    pub dir: tempfile::TempDir,
    options: TinyT5Options,
    weights: BTreeMap<String, ArrayD<f32>>,
}

impl TinyT5 {
    pub fn new(options: TinyT5Options) -> Self {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut weights = BTreeMap::new();
        let mut add = |name: String, shape: &[usize], center: f32, rng: &mut StdRng| {
            let count = shape.iter().product();
            let values: Vec<f32> = (0..count).map(|_| center + rng.gen_range(-0.5f32..0.5)).collect();
            weights.insert(name, ArrayD::from_shape_vec(shape.to_vec(), values).unwrap());
        };
        let inner = NUM_HEADS * D_KV;
        let gated = options.feed_forward_proj != "relu";

        add("shared.weight".to_string(), &[VOCAB_SIZE, D_MODEL], 0.0, &mut rng);
        for (side, layers) in [("encoder", 2), ("decoder", 2)] {
            add(format!("{side}.block.0.layer.0.SelfAttention.relative_attention_bias.weight"), &[NUM_BUCKETS, NUM_HEADS], 0.0, &mut rng);
            for i in 0..layers {
                let block = format!("{side}.block.{i}");
                let mut attention_layers = vec![("layer.0", "SelfAttention")];
                if side == "decoder" {
                    attention_layers.push(("layer.1", "EncDecAttention"));
                }
                for (layer, attention) in &attention_layers {
                    add(format!("{block}.{layer}.layer_norm.weight"), &[D_MODEL], 1.0, &mut rng);
                    for proj in ["q", "k", "v"] {
                        add(format!("{block}.{layer}.{attention}.{proj}.weight"), &[inner, D_MODEL], 0.0, &mut rng);
                    }
                    add(format!("{block}.{layer}.{attention}.o.weight"), &[D_MODEL, inner], 0.0, &mut rng);
                }
                let ff = format!("{block}.layer.{}", attention_layers.len());
                add(format!("{ff}.layer_norm.weight"), &[D_MODEL], 1.0, &mut rng);
                if gated {
                    add(format!("{ff}.DenseReluDense.wi_0.weight"), &[D_FF, D_MODEL], 0.0, &mut rng);
                    add(format!("{ff}.DenseReluDense.wi_1.weight"), &[D_FF, D_MODEL], 0.0, &mut rng);
                } else {
                    add(format!("{ff}.DenseReluDense.wi.weight"), &[D_FF, D_MODEL], 0.0, &mut rng);
                }
                add(format!("{ff}.DenseReluDense.wo.weight"), &[D_MODEL, D_FF], 0.0, &mut rng);
            }
            add(format!("{side}.final_layer_norm.weight"), &[D_MODEL], 1.0, &mut rng);
        }
        if !options.tie_word_embeddings {
            add("lm_head.weight".to_string(), &[VOCAB_SIZE, D_MODEL], 0.0, &mut rng);
        }

        let dir = tempfile::tempdir().unwrap();
        let out = Self { dir, options, weights };
        out.write_files();
        out
    }

    fn write_files(&self) {
        let bytes: Vec<(String, Vec<u8>, Vec<usize>)> = self
            .weights
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != self.options.skip_weight)
            .map(|(name, array)| (name.clone(), array.iter().flat_map(|x| x.to_le_bytes()).collect(), array.shape().to_vec()))
            .collect();
        let views: Vec<(&str, safetensors::tensor::TensorView)> = bytes
            .iter()
            .map(|(name, data, shape)| {
                (name.as_str(), safetensors::tensor::TensorView::new(safetensors::Dtype::F32, shape.clone(), data).unwrap())
            })
            .collect();
        let serialized = safetensors::serialize(views, &None).unwrap();
        std::fs::File::create(self.path().join("model.safetensors")).unwrap().write_all(&serialized).unwrap();

        let mut config = serde_json::json!({
            "architectures": ["T5ForConditionalGeneration"],
            "model_type": "t5",
            "vocab_size": VOCAB_SIZE,
            "d_model": D_MODEL,
            "d_kv": D_KV,
            "d_ff": D_FF,
            "num_layers": 2,
            "num_decoder_layers": 2,
            "num_heads": NUM_HEADS,
            "relative_attention_num_buckets": NUM_BUCKETS,
            "relative_attention_max_distance": MAX_DISTANCE,
            "layer_norm_epsilon": EPS,
            "feed_forward_proj": self.options.feed_forward_proj,
            "tie_word_embeddings": self.options.tie_word_embeddings,
            "eos_token_id": 1,
            "pad_token_id": 0,
        });
        if let Some(start) = self.options.decoder_start_token_id {
            config["decoder_start_token_id"] = serde_json::json!(start);
        }
        std::fs::write(self.path().join("config.json"), serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let tokenizer_config = serde_json::json!({
            "tokenizer_class": "ByT5Tokenizer",
            "extra_ids": 125,
            "pad_token": self.options.tokenizer_pad_token,
            "eos_token": "</s>",
            "unk_token": "<unk>",
        });
        std::fs::write(self.path().join("tokenizer_config.json"), serde_json::to_vec(&tokenizer_config).unwrap()).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn w1(&self, name: &str) -> Array1<f32> {
        self.weights[name].clone().into_dimensionality::<Ix1>().unwrap()
    }

    fn w2(&self, name: &str) -> Array2<f32> {
        self.weights[name].clone().into_dimensionality::<Ix2>().unwrap()
    }

    fn linear(&self, prefix: &str, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.w2(&format!("{prefix}.weight")).t())
    }

    fn rms(&self, prefix: &str, x: &Array2<f32>) -> Array2<f32> {
        let weight = self.w1(&format!("{prefix}.weight"));
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            let variance = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
            let denom = (variance + EPS).sqrt();
            for (v, w) in row.iter_mut().zip(weight.iter()) {
                *v = w * (*v / denom);
            }
        }
        out
    }

    /// `[heads, q, k]` learned bias for `q` queries over `k` keys.
    fn position_bias(&self, side: &str, q: usize, k: usize, bidirectional: bool) -> Array3<f32> {
        let table = self.w2(&format!("{side}.block.0.layer.0.SelfAttention.relative_attention_bias.weight"));
        Array3::from_shape_fn((NUM_HEADS, q, k), |(h, i, j)| table[[bucket(j as i64 - i as i64, bidirectional), h]])
    }

    fn attention(&self, prefix: &str, x: &Array2<f32>, kv: &Array2<f32>, bias: &Array3<f32>) -> Array2<f32> {
        let q = self.linear(&format!("{prefix}.q"), x);
        let k = self.linear(&format!("{prefix}.k"), kv);
        let v = self.linear(&format!("{prefix}.v"), kv);
        let mut context = Array2::<f32>::zeros((x.nrows(), NUM_HEADS * D_KV));
        for h in 0..NUM_HEADS {
            let cols = h * D_KV..(h + 1) * D_KV;
            let mut scores = q.slice(s![.., cols.clone()]).dot(&k.slice(s![.., cols.clone()]).t()) + &bias.slice(s![h, .., ..]);
            for mut row in scores.rows_mut() {
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                row.mapv_inplace(|x| (x - max).exp());
                let sum = row.sum();
                row.mapv_inplace(|x| x / sum);
            }
            context.slice_mut(s![.., cols.clone()]).assign(&scores.dot(&v.slice(s![.., cols])));
        }
        self.linear(&format!("{prefix}.o"), &context)
    }

    fn feed_forward(&self, prefix: &str, x: &Array2<f32>) -> Array2<f32> {
        let normed = self.rms(&format!("{prefix}.layer_norm"), x);
        let dense = format!("{prefix}.DenseReluDense");
        let activated = match self.options.feed_forward_proj {
            "relu" => self.linear(&format!("{dense}.wi"), &normed).mapv(|v| v.max(0.0)),
            "gated-relu" => self.linear(&format!("{dense}.wi_0"), &normed).mapv(|v| v.max(0.0)) * self.linear(&format!("{dense}.wi_1"), &normed),
            _ => self.linear(&format!("{dense}.wi_0"), &normed).mapv(gelu_new) * self.linear(&format!("{dense}.wi_1"), &normed),
        };
        x + &self.linear(&format!("{dense}.wo"), &activated)
    }

    fn embed(&self, ids: &[i64]) -> Array2<f32> {
        let shared = self.w2("shared.weight");
        Array2::from_shape_fn((ids.len(), D_MODEL), |(i, j)| shared[[ids[i] as usize, j]])
    }

    /// `[batch, decoder_len, vocab]` logits, computed the way transformers does.
    pub fn reference_logits(&self, input_ids: &Array2<i64>, attention_mask: &Array2<i64>, decoder_input_ids: &Array2<i64>) -> Array3<f32> {
        let batch = input_ids.nrows();
        let (s_len, t_len) = (input_ids.ncols(), decoder_input_ids.ncols());
        let mut out = Array3::<f32>::zeros((batch, t_len, VOCAB_SIZE));
        for b in 0..batch {
            let mask_term = |j: usize| (1.0 - attention_mask[[b, j]] as f32) * f32::MIN;

            let mut encoder_bias = self.position_bias("encoder", s_len, s_len, true);
            encoder_bias.indexed_iter_mut().for_each(|((_, _, j), v)| *v += mask_term(j));
            let mut hidden = self.embed(&input_ids.row(b).to_vec());
            for i in 0..2 {
                let block = format!("encoder.block.{i}");
                let normed = self.rms(&format!("{block}.layer.0.layer_norm"), &hidden);
                hidden = &hidden + &self.attention(&format!("{block}.layer.0.SelfAttention"), &normed, &normed, &encoder_bias);
                hidden = self.feed_forward(&format!("{block}.layer.1"), &hidden);
            }
            let encoded = self.rms("encoder.final_layer_norm", &hidden);

            let mut self_bias = self.position_bias("decoder", t_len, t_len, false);
            self_bias.indexed_iter_mut().for_each(|((_, i, j), v)| {
                if j > i {
                    *v += f32::MIN
                }
            });
            let cross_bias = Array3::from_shape_fn((NUM_HEADS, t_len, s_len), |(_, _, j)| mask_term(j));
            let mut hidden = self.embed(&decoder_input_ids.row(b).to_vec());
            for i in 0..2 {
                let block = format!("decoder.block.{i}");
                let normed = self.rms(&format!("{block}.layer.0.layer_norm"), &hidden);
                hidden = &hidden + &self.attention(&format!("{block}.layer.0.SelfAttention"), &normed, &normed, &self_bias);
                let normed = self.rms(&format!("{block}.layer.1.layer_norm"), &hidden);
                hidden = &hidden + &self.attention(&format!("{block}.layer.1.EncDecAttention"), &normed, &encoded, &cross_bias);
                hidden = self.feed_forward(&format!("{block}.layer.2"), &hidden);
            }
            let decoded = self.rms("decoder.final_layer_norm", &hidden);

            let logits = if self.options.tie_word_embeddings {
                (decoded * (D_MODEL as f32).powf(-0.5)).dot(&self.w2("shared.weight").t())
            } else {
                self.linear("lm_head", &decoded)
            };
            out.slice_mut(s![b, .., ..]).assign(&logits);
        }
        out
    }
}

fn gelu_new(x: f32) -> f32 {
    0.5 * x * (1.0 + ((2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x)).tanh())
}

fn bucket(relative_position: i64, bidirectional: bool) -> usize {
    let mut num_buckets = NUM_BUCKETS as i64;
    let mut out = 0;
    let relative_position = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            out += num_buckets;
        }
        relative_position.abs()
    } else {
        -relative_position.min(0)
    };
    let max_exact = num_buckets / 2;
    if relative_position < max_exact {
        return (out + relative_position) as usize;
    }
    let scaled = (relative_position as f32 / max_exact as f32).ln() / (MAX_DISTANCE as f32 / max_exact as f32).ln()
        * (num_buckets - max_exact) as f32;
    let large = (max_exact + scaled as i64).min(num_buckets - 1);
    (out + large) as usize
}

pub fn ids(rows: &[&[i64]]) -> Array2<i64> {
    let cols = rows[0].len();
    Array2::from_shape_vec((rows.len(), cols), rows.iter().flat_map(|r| r.iter().copied()).collect()).unwrap()
}

pub fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    assert_eq!(a.shape(), b.shape());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

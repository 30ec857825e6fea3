use crate::Error;
use crate::onnx_graph::operators::{Binary, Cast, Gather, MatMul, Range, ShapeOp, Softmax, Unary, Where};
use crate::onnx_graph::pytorch::{linear, reshape, rms_layer_norm, scalar_f32, scalar_i64, transpose, unsqueeze};
use crate::onnx_graph::tensor::{DType, Dimension, InputTensor, Shape, Tensor};
use crate::onnx_graph::weights::WeightManager;
use crate::onnx_graph::{self, BuildOptions};
use std::sync::Arc;

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const DECODER_INPUT_IDS: &str = "decoder_input_ids";
pub const LOGITS: &str = "logits";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedForwardProj {
    Relu,
    GatedRelu,
    /// `gated-gelu`, which transformers evaluates with the tanh approximation.
    GatedGelu,
}

impl std::str::FromStr for FeedForwardProj {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "relu" => Ok(FeedForwardProj::Relu),
            "gated-relu" => Ok(FeedForwardProj::GatedRelu),
            "gated-gelu" => Ok(FeedForwardProj::GatedGelu),
            s => Err(Error::UnsupportedConfigurationError("feed_forward_proj".to_string(), s.to_string())),
        }
    }
}

impl FeedForwardProj {
    fn is_gated(&self) -> bool {
        !matches!(self, FeedForwardProj::Relu)
    }

    fn apply(&self, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        match self {
            FeedForwardProj::Relu | FeedForwardProj::GatedRelu => Ok(Unary::relu(None, input)),
            FeedForwardProj::GatedGelu => gelu_new(input),
        }
    }
}

/// `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`
fn gelu_new(x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let cube = Binary::mul(None, Binary::mul(None, x.clone(), x.clone())?, x.clone())?;
    let inner = Binary::add(None, x.clone(), Binary::mul(None, cube, scalar_f32(0.044715))?)?;
    let scaled = Binary::mul(None, inner, scalar_f32((2.0f64 / std::f64::consts::PI).sqrt() as f32))?;
    let gate = Binary::add(None, scalar_f32(1.0), Unary::tanh(None, scaled))?;
    Ok(Binary::mul(None, Binary::mul(None, scalar_f32(0.5), x)?, gate)?)
}

#[derive(Debug, Clone)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_decoder_layers: usize,
    pub num_heads: usize,
    pub relative_attention_num_buckets: usize,
    pub relative_attention_max_distance: usize,
    pub layer_norm_epsilon: f32,
    pub feed_forward_proj: FeedForwardProj,
    pub tie_word_embeddings: bool,
    pub decoder_start_token_id: Option<i64>,
    pub pad_token_id: Option<i64>,
    pub eos_token_id: Option<i64>,
}

impl T5Config {
    pub fn from_huggingface_transformers_json(config: &serde_json::Value) -> Result<Self, Error> {
        fn get_int(config: &serde_json::Value, key: &str) -> Result<i64, Error> {
            config
                .get(key)
                .ok_or(Error::MissingConfigEntryError(key.to_string()))?
                .as_i64()
                .ok_or(Error::MissingConfigEntryError(key.to_string()))
        }

        fn get_opt_int(config: &serde_json::Value, key: &str) -> Option<i64> {
            config.get(key).and_then(|x| x.as_i64())
        }

        let num_layers = get_int(config, "num_layers")? as usize;
        let feed_forward_proj: FeedForwardProj = config.get("feed_forward_proj").and_then(|x| x.as_str()).unwrap_or("relu").parse()?;

        let out = Self {
            vocab_size: get_int(config, "vocab_size")? as usize,
            d_model: get_int(config, "d_model")? as usize,
            d_kv: get_int(config, "d_kv")? as usize,
            d_ff: get_int(config, "d_ff")? as usize,
            num_layers,
            num_decoder_layers: get_opt_int(config, "num_decoder_layers").map(|x| x as usize).unwrap_or(num_layers),
            num_heads: get_int(config, "num_heads")? as usize,
            relative_attention_num_buckets: get_opt_int(config, "relative_attention_num_buckets").unwrap_or(32) as usize,
            relative_attention_max_distance: get_opt_int(config, "relative_attention_max_distance").unwrap_or(128) as usize,
            layer_norm_epsilon: config.get("layer_norm_epsilon").and_then(|x| x.as_f64()).unwrap_or(1e-6) as f32,
            feed_forward_proj,
            tie_word_embeddings: config.get("tie_word_embeddings").and_then(|x| x.as_bool()).unwrap_or(true),
            decoder_start_token_id: get_opt_int(config, "decoder_start_token_id"),
            pad_token_id: get_opt_int(config, "pad_token_id"),
            eos_token_id: get_opt_int(config, "eos_token_id"),
        };
        if out.relative_attention_num_buckets < 4 {
            Err(Error::UnsupportedConfigurationError(
                "relative_attention_num_buckets".to_string(),
                out.relative_attention_num_buckets.to_string(),
            ))?;
        }
        Ok(out)
    }

    fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }
}

/// Graph-level view of a built T5 model: its declared inputs and named outputs.
pub struct T5Graph {
    pub inputs: Vec<Arc<InputTensor>>,
    pub outputs: Vec<(String, Arc<dyn Tensor>)>,
}

impl T5Graph {
    pub fn to_model_proto(&self, options: &BuildOptions) -> Result<onnx_graph::onnx::ModelProto, onnx_graph::Error> {
        let outputs: Vec<(&str, Arc<dyn Tensor>)> = self.outputs.iter().map(|(name, t)| (name.as_str(), t.clone())).collect();
        onnx_graph::build_proto(&self.inputs, &outputs, options)
    }
}

/// Scalar int64 extent of `input` along `axis`, read at run time.
fn dynamic_dim(input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    Ok(Gather::new(None, ShapeOp::new(None, input), scalar_i64(axis), 0)?)
}

/// Signed distance `key - query` for every query/key position pair, shape `[q, k]`.
fn relative_positions(
    query_source: Arc<dyn Tensor>,
    key_source: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let query_dim = query_source.shape().dims[1].clone();
    let key_dim = key_source.shape().dims[1].clone();
    let query_len = dynamic_dim(query_source, 1)?;
    let key_len = dynamic_dim(key_source, 1)?;
    let context = Range::new(None, scalar_i64(0), query_len, scalar_i64(1), Some(query_dim))?;
    let memory = Range::new(None, scalar_i64(0), key_len, scalar_i64(1), Some(key_dim))?;
    Ok(Binary::sub(None, unsqueeze(memory, vec![0])?, unsqueeze(context, vec![1])?)?)
}

/// Maps relative distances to buckets: exact for short distances, logarithmic up to `max_distance`.
fn relative_position_bucket(
    relative_position: Arc<dyn Tensor>,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let mut num_buckets = num_buckets as i64;
    let mut offset = None;
    let relative_position: Arc<dyn Tensor> = if bidirectional {
        num_buckets /= 2;
        let forward = Cast::new(None, Binary::greater(None, relative_position.clone(), scalar_i64(0))?, DType::I64);
        offset = Some(Binary::mul(None, forward, scalar_i64(num_buckets))?);
        Unary::abs(None, relative_position)
    } else {
        Unary::neg(None, Binary::min(None, relative_position, scalar_i64(0))?)
    };

    let max_exact = num_buckets / 2;
    let is_small = Binary::less(None, relative_position.clone(), scalar_i64(max_exact))?;
    let ratio = Binary::div(None, Cast::new(None, relative_position.clone(), DType::F32), scalar_f32(max_exact as f32))?;
    let log_ratio = Binary::div(
        None,
        Unary::log(None, ratio),
        scalar_f32((max_distance as f32 / max_exact as f32).ln()),
    )?;
    let scaled = Binary::mul(None, log_ratio, scalar_f32((num_buckets - max_exact) as f32))?;
    let if_large = Binary::add(None, scalar_i64(max_exact), Cast::new(None, scaled, DType::I64))?;
    let if_large = Binary::min(None, if_large, scalar_i64(num_buckets - 1))?;
    let buckets: Arc<dyn Tensor> = Where::new(None, is_small, relative_position, if_large)?;
    match offset {
        Some(offset) => Ok(Binary::add(None, offset, buckets)?),
        None => Ok(buckets),
    }
}

/// Learned relative position bias, `[1, heads, q, k]`.
fn compute_bias(
    weight_manager: &impl WeightManager,
    config: &T5Config,
    query_source: Arc<dyn Tensor>,
    key_source: Arc<dyn Tensor>,
    bidirectional: bool,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let relative_position = relative_positions(query_source, key_source)?;
    let buckets = relative_position_bucket(
        relative_position,
        bidirectional,
        config.relative_attention_num_buckets,
        config.relative_attention_max_distance,
    )?;
    let values = Gather::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        weight_manager.get_tensor("weight")?,
        buckets,
        0,
    )?;
    unsqueeze(transpose(values, vec![2, 0, 1])?, vec![0])
}

fn attention(
    weight_manager: &impl WeightManager,
    config: &T5Config,
    hidden: Arc<dyn Tensor>,
    key_value_states: Arc<dyn Tensor>,
    bias: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let heads = config.num_heads as i64;
    let d_kv = config.d_kv as i64;
    let split_heads = |x: Arc<dyn Tensor>, perm: Vec<i64>| -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        transpose(reshape(x, vec![0, 0, heads, d_kv])?, perm)
    };
    let q = split_heads(linear(&weight_manager.prefix("q"), hidden)?, vec![0, 2, 1, 3])?;
    let k = split_heads(linear(&weight_manager.prefix("k"), key_value_states.clone())?, vec![0, 2, 3, 1])?;
    let v = split_heads(linear(&weight_manager.prefix("v"), key_value_states)?, vec![0, 2, 1, 3])?;

    let scores = Binary::add(None, MatMul::new(None, q, k)?, bias)?;
    let weights = Softmax::new(None, scores, Some(-1));
    let context = transpose(MatMul::new(None, weights, v)?, vec![0, 2, 1, 3])?;
    let context = reshape(context, vec![0, 0, config.inner_dim() as i64])?;
    linear(&weight_manager.prefix("o"), context)
}

fn feed_forward(
    weight_manager: &impl WeightManager,
    config: &T5Config,
    hidden: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let dense = weight_manager.prefix("DenseReluDense");
    let normed = rms_layer_norm(&weight_manager.prefix("layer_norm"), hidden.clone(), config.layer_norm_epsilon)?;
    let activated = if config.feed_forward_proj.is_gated() {
        let gate = config.feed_forward_proj.apply(linear(&dense.prefix("wi_0"), normed.clone())?)?;
        Binary::mul(None, gate, linear(&dense.prefix("wi_1"), normed)?)?
    } else {
        config.feed_forward_proj.apply(linear(&dense.prefix("wi"), normed)?)?
    };
    let out = linear(&dense.prefix("wo"), activated)?;
    Ok(Binary::add(None, hidden, out)?)
}

fn attention_layer(
    weight_manager: &impl WeightManager,
    attention_name: &str,
    config: &T5Config,
    hidden: Arc<dyn Tensor>,
    key_value_states: Option<Arc<dyn Tensor>>,
    bias: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let normed = rms_layer_norm(&weight_manager.prefix("layer_norm"), hidden.clone(), config.layer_norm_epsilon)?;
    let key_value_states = key_value_states.unwrap_or_else(|| normed.clone());
    let out = attention(&weight_manager.prefix(attention_name), config, normed, key_value_states, bias)?;
    Ok(Binary::add(None, hidden, out)?)
}

/// `(1 - mask) * f32::MIN`, broadcastable over `[batch, heads, q, k]`.
fn extended_attention_mask(attention_mask: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let mask = Cast::new(None, attention_mask, DType::F32);
    let inverted = Binary::sub(None, scalar_f32(1.0), mask)?;
    let bias = Binary::mul(None, inverted, scalar_f32(f32::MIN))?;
    unsqueeze(bias, vec![1, 2])
}

fn encoder(
    weight_manager: &impl WeightManager,
    config: &T5Config,
    embeddings: Arc<dyn Tensor>,
    input_ids: Arc<dyn Tensor>,
    mask_bias: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let blocks = weight_manager.prefix("block");
    let position_bias = compute_bias(
        &blocks.prefix("0").prefix("layer.0.SelfAttention.relative_attention_bias"),
        config,
        input_ids.clone(),
        input_ids,
        true,
    )?;
    let bias = Binary::add(None, position_bias, mask_bias)?;

    let mut hidden = embeddings;
    for i in 0..config.num_layers {
        let block = blocks.prefix(&i.to_string());
        hidden = attention_layer(&block.prefix("layer.0"), "SelfAttention", config, hidden, None, bias.clone())?;
        hidden = feed_forward(&block.prefix("layer.1"), config, hidden)?;
    }
    rms_layer_norm(&weight_manager.prefix("final_layer_norm"), hidden, config.layer_norm_epsilon)
}

fn decoder(
    weight_manager: &impl WeightManager,
    config: &T5Config,
    embeddings: Arc<dyn Tensor>,
    decoder_input_ids: Arc<dyn Tensor>,
    encoder_hidden: Arc<dyn Tensor>,
    encoder_mask_bias: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
    let blocks = weight_manager.prefix("block");
    let position_bias = compute_bias(
        &blocks.prefix("0").prefix("layer.0.SelfAttention.relative_attention_bias"),
        config,
        decoder_input_ids.clone(),
        decoder_input_ids.clone(),
        false,
    )?;
    // Keys after the query position are masked out.
    let future = Binary::greater(None, relative_positions(decoder_input_ids.clone(), decoder_input_ids)?, scalar_i64(0))?;
    let causal = Binary::mul(None, Cast::new(None, future, DType::F32), scalar_f32(f32::MIN))?;
    let self_bias = Binary::add(None, position_bias, unsqueeze(causal, vec![0, 1])?)?;

    let mut hidden = embeddings;
    for i in 0..config.num_decoder_layers {
        let block = blocks.prefix(&i.to_string());
        hidden = attention_layer(&block.prefix("layer.0"), "SelfAttention", config, hidden, None, self_bias.clone())?;
        hidden = attention_layer(
            &block.prefix("layer.1"),
            "EncDecAttention",
            config,
            hidden,
            Some(encoder_hidden.clone()),
            encoder_mask_bias.clone(),
        )?;
        hidden = feed_forward(&block.prefix("layer.2"), config, hidden)?;
    }
    rms_layer_norm(&weight_manager.prefix("final_layer_norm"), hidden, config.layer_norm_epsilon)
}

/// Builds `T5ForConditionalGeneration` without a key/value cache.
pub fn build_t5_graph(weight_manager: &impl WeightManager, config: &T5Config) -> Result<T5Graph, onnx_graph::Error> {
    let batch = Dimension::symbolic("batch_size");
    let sequence = Dimension::symbolic("sequence_length");
    let decoder_sequence = Dimension::symbolic("decoder_sequence_length");

    let input_ids = InputTensor::new(INPUT_IDS.to_string(), DType::I64, Shape::new(vec![batch.clone(), sequence.clone()]));
    let attention_mask = InputTensor::new(ATTENTION_MASK.to_string(), DType::I64, Shape::new(vec![batch.clone(), sequence]));
    let decoder_input_ids = InputTensor::new(DECODER_INPUT_IDS.to_string(), DType::I64, Shape::new(vec![batch, decoder_sequence]));

    let shared = weight_manager.get_tensor("shared.weight")?;
    let mask_bias = extended_attention_mask(attention_mask.clone())?;

    let encoder_embeddings = Gather::new(Some("encoder.embed_tokens".to_string()), shared.clone(), input_ids.clone(), 0)?;
    let encoder_hidden = encoder(&weight_manager.prefix("encoder"), config, encoder_embeddings, input_ids.clone(), mask_bias.clone())?;

    let decoder_embeddings = Gather::new(Some("decoder.embed_tokens".to_string()), shared.clone(), decoder_input_ids.clone(), 0)?;
    let sequence_output = decoder(
        &weight_manager.prefix("decoder"),
        config,
        decoder_embeddings,
        decoder_input_ids.clone(),
        encoder_hidden,
        mask_bias,
    )?;

    let logits: Arc<dyn Tensor> = if config.tie_word_embeddings {
        let scaled = Binary::mul(None, sequence_output, scalar_f32((config.d_model as f32).powf(-0.5)))?;
        let head = crate::onnx_graph::operators::Transpose::new(None, shared, Some(vec![1, 0]))?;
        MatMul::new(Some("lm_head".to_string()), scaled, head)?
    } else {
        linear(&weight_manager.prefix("lm_head"), sequence_output)?
    };

    Ok(T5Graph {
        inputs: vec![input_ids, attention_mask, decoder_input_ids],
        outputs: vec![(LOGITS.to_string(), logits)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_graph::numeric::NumericTensor;
    use crate::onnx_graph::node::Node;

    fn eval(tensor: &dyn Tensor, feeds: &[(&dyn Tensor, NumericTensor)]) -> NumericTensor {
        if let Some((_, value)) = feeds.iter().find(|(t, _)| std::ptr::addr_eq(*t, tensor)) {
            return value.clone();
        }
        let node: &dyn Node = tensor.get_node().expect("leaf tensor without a feed");
        let inputs: Vec<NumericTensor> = node.get_input_tensors().into_iter().map(|t| eval(t, feeds)).collect();
        node.evaluate(&inputs).unwrap()
    }

    fn ids() -> Arc<InputTensor> {
        InputTensor::new("ids".to_string(), DType::I64, Shape::new(vec![Dimension::symbolic("b"), Dimension::symbolic("s")]))
    }

    #[test]
    fn bidirectional_buckets_match_reference_values() {
        let input = ids();
        let rel = relative_positions(input.clone(), input.clone()).unwrap();
        let buckets = relative_position_bucket(rel, true, 32, 128).unwrap();
        let feed = NumericTensor::from_i64(vec![0; 6], &[1, 6]).unwrap();
        let out = eval(buckets.as_ref(), &[(input.as_ref() as &dyn Tensor, feed)]);
        // Row 0 looks forward only, so keys land in the upper half of the buckets.
        assert_eq!(out.to_i64_vec().unwrap()[..6], [0, 17, 18, 19, 20, 21]);
        // Row 5 looks backward only.
        assert_eq!(out.to_i64_vec().unwrap()[30..], [5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn long_distances_use_log_buckets() {
        let input = ids();
        let rel = relative_positions(input.clone(), input.clone()).unwrap();
        let buckets = relative_position_bucket(rel, false, 32, 128).unwrap();
        let feed = NumericTensor::from_i64(vec![0; 200], &[1, 200]).unwrap();
        let out = eval(buckets.as_ref(), &[(input.as_ref() as &dyn Tensor, feed)]).to_i64_vec().unwrap();
        let last_row = &out[199 * 200..];
        assert_eq!(last_row[199], 0);
        assert_eq!(last_row[199 - 15], 15);
        assert_eq!(last_row[199 - 16], 16);
        assert_eq!(last_row[0], 31);
        // Causal buckets never look forward.
        assert!(out[..200].iter().skip(1).all(|b| *b == 0));
    }

    #[test]
    fn config_defaults_follow_transformers() {
        let config: serde_json::Value = serde_json::json!({
            "vocab_size": 384, "d_model": 64, "d_kv": 16, "d_ff": 128, "num_layers": 2, "num_heads": 4,
            "feed_forward_proj": "gated-gelu", "tie_word_embeddings": false, "decoder_start_token_id": 0
        });
        let config = T5Config::from_huggingface_transformers_json(&config).unwrap();
        assert_eq!(config.num_decoder_layers, 2);
        assert_eq!(config.relative_attention_num_buckets, 32);
        assert_eq!(config.relative_attention_max_distance, 128);
        assert_eq!(config.feed_forward_proj, FeedForwardProj::GatedGelu);
        assert_eq!(config.decoder_start_token_id, Some(0));
        assert_eq!(config.pad_token_id, None);
    }

    #[test]
    fn unknown_activation_is_rejected() {
        let config = serde_json::json!({
            "vocab_size": 384, "d_model": 64, "d_kv": 16, "d_ff": 128, "num_layers": 2, "num_heads": 4,
            "feed_forward_proj": "gated-silu"
        });
        assert!(matches!(
            T5Config::from_huggingface_transformers_json(&config),
            Err(Error::UnsupportedConfigurationError(_, _))
        ));
    }
}

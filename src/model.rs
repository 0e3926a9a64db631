use std::f64;

use tch::{
    Kind::{Bool, Float},
    Tensor,
    nn::{Embedding, LayerNorm, Linear, Path, embedding, layer_norm, linear},
};

use crate::constants::{D_FEEDFORWARD, D_MODEL, DROPOUT_RATE, MAX_POSITIONS, NUM_HEADS, NUM_LAYERS};

/// Precomputed sinusoidal position table with shape `[1, max_positions, d_model]`.
/// Even embedding dimensions carry sines, odd ones cosines, each pair sharing a
/// wavelength that grows geometrically from 2*pi up to 10000*2*pi.
fn positional_encoding(max_positions: i64, d_model: i64) -> Tensor {
    let mut table = vec![0f32; (max_positions * d_model) as usize];
    for pos in 0..max_positions {
        for dim in 0..d_model {
            let angle =
                pos as f64 / f64::powf(10000.0, (2 * (dim / 2)) as f64 / d_model as f64);
            table[(pos * d_model + dim) as usize] = if dim % 2 == 0 {
                angle.sin() as f32
            } else {
                angle.cos() as f32
            };
        }
    }
    Tensor::from_slice(&table).view([1, max_positions, d_model])
}

/// Single-head attention over a query sequence and a key/value sequence.
/// For self-attention both arguments are the same tensor; the decoder's
/// cross-attention passes its own state as the query and the encoder
/// output as key/value.
struct SingleHeadAttention {
    query: Linear, // Projects D_MODEL -> head_dim
    key: Linear,   // Projects D_MODEL -> head_dim
    value: Linear, // Projects D_MODEL -> head_dim
    head_dim: i64,
}

impl SingleHeadAttention {
    pub fn new(vs: &Path) -> Self {
        let head_dim = D_MODEL / NUM_HEADS;
        let query = linear(vs / "query", D_MODEL, head_dim, Default::default());
        let key = linear(vs / "key", D_MODEL, head_dim, Default::default());
        let value = linear(vs / "value", D_MODEL, head_dim, Default::default());
        SingleHeadAttention {
            query,
            key,
            value,
            head_dim,
        }
    }

    /// Takes a query input of shape [batch, q_len, D_MODEL] and a key/value
    /// input of shape [batch, kv_len, D_MODEL]; produces [batch, q_len, head_dim].
    /// `mask` is a Bool tensor broadcastable to [batch, q_len, kv_len]; true
    /// positions are excluded from attention.
    pub fn forward(&self, q_input: &Tensor, kv_input: &Tensor, mask: Option<&Tensor>) -> Tensor {
        // [batch, q_len, head_dim]
        let q_embeds = q_input.apply(&self.query);
        // [batch, kv_len, head_dim]
        let k_embeds = kv_input.apply(&self.key);
        let v_embeds = kv_input.apply(&self.value);
        // Q @ K^T, scaled by sqrt(head_dim): [batch, q_len, kv_len]
        let mut attention_scores =
            q_embeds.matmul(&k_embeds.transpose(-2, -1)) / f64::sqrt(self.head_dim as f64);
        if let Some(mask) = mask {
            attention_scores =
                attention_scores.masked_fill(&mask.to_kind(Bool), f64::NEG_INFINITY);
        }
        // Weighted sum of values: [batch, q_len, head_dim]
        attention_scores.softmax(-1, Float).matmul(&v_embeds)
    }
}

struct MultiHeadAttention {
    heads: Vec<SingleHeadAttention>,
    output_projection: Linear,
}

impl MultiHeadAttention {
    pub fn new(vs: &Path) -> MultiHeadAttention {
        let mut heads = Vec::with_capacity(NUM_HEADS as usize);
        for i in 0..(NUM_HEADS as usize) {
            heads.push(SingleHeadAttention::new(&(vs / i.to_string())));
        }
        let output_projection = linear(vs / "output", D_MODEL, D_MODEL, Default::default());
        MultiHeadAttention {
            heads,
            output_projection,
        }
    }

    pub fn forward(&self, q_input: &Tensor, kv_input: &Tensor, mask: Option<&Tensor>) -> Tensor {
        // Vec of [batch, q_len, head_dim]
        let outputs: Vec<Tensor> = self
            .heads
            .iter()
            .map(|head| head.forward(q_input, kv_input, mask))
            .collect();
        // Back to [batch, q_len, D_MODEL] after concatenation and projection
        Tensor::cat(&outputs, -1).apply(&self.output_projection)
    }
}

struct FeedForward {
    expand: Linear,   // D_MODEL -> D_FEEDFORWARD
    contract: Linear, // D_FEEDFORWARD -> D_MODEL
}

impl FeedForward {
    pub fn new(vs: &Path) -> Self {
        let expand = linear(vs / "expand", D_MODEL, D_FEEDFORWARD, Default::default());
        let contract = linear(vs / "contract", D_FEEDFORWARD, D_MODEL, Default::default());
        FeedForward { expand, contract }
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        input.apply(&self.expand).relu().apply(&self.contract)
    }
}

/// Self-attention followed by feed-forward, each behind a residual
/// connection and layer norm (post-norm).
struct EncoderLayer {
    self_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    attention_norm: LayerNorm,
    feed_forward_norm: LayerNorm,
}

impl EncoderLayer {
    pub fn new(vs: &Path) -> Self {
        EncoderLayer {
            self_attention: MultiHeadAttention::new(&(vs / "self_attention")),
            feed_forward: FeedForward::new(&(vs / "feed_forward")),
            attention_norm: layer_norm(vs / "attention_norm", vec![D_MODEL], Default::default()),
            feed_forward_norm: layer_norm(
                vs / "feed_forward_norm",
                vec![D_MODEL],
                Default::default(),
            ),
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool, padding_mask: Option<&Tensor>) -> Tensor {
        let attended = self
            .self_attention
            .forward(input, input, padding_mask)
            .dropout(DROPOUT_RATE, train);
        let state = (input + attended).apply(&self.attention_norm);
        let fed = self.feed_forward.forward(&state).dropout(DROPOUT_RATE, train);
        (state + fed).apply(&self.feed_forward_norm)
    }
}

/// Decoder block: masked self-attention over the decoder state, then
/// cross-attention into the encoder output, then feed-forward.
struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    self_attention_norm: LayerNorm,
    cross_attention_norm: LayerNorm,
    feed_forward_norm: LayerNorm,
}

impl DecoderLayer {
    pub fn new(vs: &Path) -> Self {
        DecoderLayer {
            self_attention: MultiHeadAttention::new(&(vs / "self_attention")),
            cross_attention: MultiHeadAttention::new(&(vs / "cross_attention")),
            feed_forward: FeedForward::new(&(vs / "feed_forward")),
            self_attention_norm: layer_norm(
                vs / "self_attention_norm",
                vec![D_MODEL],
                Default::default(),
            ),
            cross_attention_norm: layer_norm(
                vs / "cross_attention_norm",
                vec![D_MODEL],
                Default::default(),
            ),
            feed_forward_norm: layer_norm(
                vs / "feed_forward_norm",
                vec![D_MODEL],
                Default::default(),
            ),
        }
    }

    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        train: bool,
        look_ahead_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
    ) -> Tensor {
        let attended = self
            .self_attention
            .forward(input, input, look_ahead_mask)
            .dropout(DROPOUT_RATE, train);
        let state = (input + attended).apply(&self.self_attention_norm);
        let crossed = self
            .cross_attention
            .forward(&state, encoder_output, padding_mask)
            .dropout(DROPOUT_RATE, train);
        let state = (state + crossed).apply(&self.cross_attention_norm);
        let fed = self.feed_forward.forward(&state).dropout(DROPOUT_RATE, train);
        (state + fed).apply(&self.feed_forward_norm)
    }
}

struct Encoder {
    embedding: Embedding,
    position_table: Tensor,
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(vs: &Path, vocab_size: i64) -> Self {
        let embedding = embedding(vs / "embedding", vocab_size, D_MODEL, Default::default());
        let position_table = positional_encoding(MAX_POSITIONS, D_MODEL).to_device(vs.device());
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        for i in 0..NUM_LAYERS {
            layers.push(EncoderLayer::new(&(vs / i.to_string())));
        }
        Encoder {
            embedding,
            position_table,
            layers,
        }
    }

    pub fn forward(&self, tokens: &Tensor, train: bool, padding_mask: Option<&Tensor>) -> Tensor {
        let seq_len = tokens.size()[1];
        // [batch, seq_len] -> [batch, seq_len, D_MODEL], scaled before positions are added
        let mut state = tokens.apply(&self.embedding) * f64::sqrt(D_MODEL as f64);
        state = state + self.position_table.narrow(1, 0, seq_len);
        state = state.dropout(DROPOUT_RATE, train);
        for layer in &self.layers {
            state = layer.forward(&state, train, padding_mask);
        }
        state
    }
}

struct Decoder {
    embedding: Embedding,
    position_table: Tensor,
    layers: Vec<DecoderLayer>,
}

impl Decoder {
    pub fn new(vs: &Path, vocab_size: i64) -> Self {
        let embedding = embedding(vs / "embedding", vocab_size, D_MODEL, Default::default());
        let position_table = positional_encoding(MAX_POSITIONS, D_MODEL).to_device(vs.device());
        let mut layers = Vec::with_capacity(NUM_LAYERS);
        for i in 0..NUM_LAYERS {
            layers.push(DecoderLayer::new(&(vs / i.to_string())));
        }
        Decoder {
            embedding,
            position_table,
            layers,
        }
    }

    pub fn forward(
        &self,
        tokens: &Tensor,
        encoder_output: &Tensor,
        train: bool,
        look_ahead_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
    ) -> Tensor {
        let seq_len = tokens.size()[1];
        let mut state = tokens.apply(&self.embedding) * f64::sqrt(D_MODEL as f64);
        state = state + self.position_table.narrow(1, 0, seq_len);
        state = state.dropout(DROPOUT_RATE, train);
        for layer in &self.layers {
            state = layer.forward(&state, encoder_output, train, look_ahead_mask, padding_mask);
        }
        state
    }
}

/// Encoder-decoder transformer over a shared melody-token vocabulary.
pub struct MelodyTransformer {
    encoder: Encoder,
    decoder: Decoder,
    output_projection: Linear, // D_MODEL -> vocab_size
}

impl MelodyTransformer {
    pub fn new(vs: &Path, vocab_size: i64) -> Self {
        MelodyTransformer {
            encoder: Encoder::new(&(vs / "encoder"), vocab_size),
            decoder: Decoder::new(&(vs / "decoder"), vocab_size),
            output_projection: linear(vs / "output", D_MODEL, vocab_size, Default::default()),
        }
    }

    /// Produces raw per-position logits with shape [batch, decoder_len, vocab_size].
    /// The mask arguments are honored when given; the training step and the
    /// generator both pass `None` for all three.
    pub fn forward(
        &self,
        encoder_input: &Tensor,
        decoder_input: &Tensor,
        train: bool,
        encoder_mask: Option<&Tensor>,
        look_ahead_mask: Option<&Tensor>,
        decoder_padding_mask: Option<&Tensor>,
    ) -> Tensor {
        let context = self.encoder.forward(encoder_input, train, encoder_mask);
        let decoded = self.decoder.forward(
            decoder_input,
            &context,
            train,
            look_ahead_mask,
            decoder_padding_mask,
        );
        decoded.apply(&self.output_projection)
    }
}

use tch::{nn, Kind, Tensor};

use crate::attention::{causal_mask, MultiHeadAttention};
use crate::config::ModelConfig;
use crate::layer_norm::LayerNorm;

/// FeedForward block (MLP)
pub struct FeedForward {
    fc_1: nn::Linear,
    fc_2: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, embed_dim: i64, hidden_dim: i64, dropout: f64) -> Self {
        let fc_1 = nn::linear(vs / "fc_1", embed_dim, hidden_dim, Default::default());
        let fc_2 = nn::linear(vs / "fc_2", hidden_dim, embed_dim, Default::default());

        Self { fc_1, fc_2, dropout }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.fc_1)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.fc_2)
    }
}

/// Refines the flattened CNN feature map with self-attention.
pub struct TransformerEncoderBlock {
    ln_1: LayerNorm,
    dense_1: nn::Linear,
    attn: MultiHeadAttention,
    ln_2: LayerNorm,
    ffn: FeedForward,
    ln_3: LayerNorm,
}

impl TransformerEncoderBlock {
    pub fn new(vs: &nn::Path, embed_dim: i64, dense_dim: i64, num_heads: i64, config: &ModelConfig) -> Self {
        let eps = config.layer_norm_epsilon;

        Self {
            ln_1: LayerNorm::new(&(vs / "ln_1"), embed_dim, eps),
            dense_1: nn::linear(vs / "dense_1", embed_dim, embed_dim, Default::default()),
            attn: MultiHeadAttention::new(&(vs / "attn"), embed_dim, num_heads, embed_dim, 0.0),
            ln_2: LayerNorm::new(&(vs / "ln_2"), embed_dim, eps),
            ffn: FeedForward::new(&(vs / "ffn"), embed_dim, dense_dim, 0.0),
            ln_3: LayerNorm::new(&(vs / "ln_3"), embed_dim, eps),
        }
    }

    /// x: [batch, patches, embed_dim]
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let x = self.ln_1.forward(x).apply(&self.dense_1).relu();
        let attn_out = self.attn.forward_t(&x, &x, &x, None, train);
        let out_1 = self.ln_2.forward(&(&x + attn_out));

        let ffn_out = self.ffn.forward_t(&out_1, train);
        self.ln_3.forward(&(&out_1 + ffn_out))
    }
}

/// Token embedding scaled by sqrt(embed_dim) plus a learned position embedding.
pub struct PositionalEmbedding {
    token_embeddings: nn::Embedding,
    position_embeddings: nn::Embedding,
    embed_scale: f64,
}

impl PositionalEmbedding {
    pub fn new(vs: &nn::Path, seq_length: i64, vocab_size: i64, embed_dim: i64) -> Self {
        Self {
            token_embeddings: nn::embedding(vs / "token", vocab_size, embed_dim, Default::default()),
            position_embeddings: nn::embedding(vs / "position", seq_length, embed_dim, Default::default()),
            embed_scale: (embed_dim as f64).sqrt(),
        }
    }

    /// tokens: [batch, len] int64
    pub fn forward(&self, tokens: &Tensor) -> Tensor {
        let len = tokens.size()[1];
        let positions = Tensor::arange(len, (Kind::Int64, tokens.device()));
        let tok = tokens.apply(&self.token_embeddings) * self.embed_scale;
        let pos = positions.apply(&self.position_embeddings).unsqueeze(0);
        tok + pos
    }
}

/// Predicts next-token logits from a caption prefix and the encoder output.
pub struct TransformerDecoderBlock {
    embedding: PositionalEmbedding,
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ln_1: LayerNorm,
    ln_2: LayerNorm,
    ln_3: LayerNorm,
    ffn: FeedForward,
    output_dropout: f64,
    out: nn::Linear,
}

impl TransformerDecoderBlock {
    pub fn new(
        vs: &nn::Path,
        embed_dim: i64,
        ff_dim: i64,
        num_heads: i64,
        vocab_size: i64,
        config: &ModelConfig,
    ) -> Self {
        let eps = config.layer_norm_epsilon;
        let dropout = config.attention_dropout;

        Self {
            embedding: PositionalEmbedding::new(&(vs / "embedding"), config.seq_length, vocab_size, embed_dim),
            self_attn: MultiHeadAttention::new(&(vs / "self_attn"), embed_dim, num_heads, embed_dim, dropout),
            cross_attn: MultiHeadAttention::new(&(vs / "cross_attn"), embed_dim, num_heads, embed_dim, dropout),
            ln_1: LayerNorm::new(&(vs / "ln_1"), embed_dim, eps),
            ln_2: LayerNorm::new(&(vs / "ln_2"), embed_dim, eps),
            ln_3: LayerNorm::new(&(vs / "ln_3"), embed_dim, eps),
            ffn: FeedForward::new(&(vs / "ffn"), embed_dim, ff_dim, config.ffn_dropout),
            output_dropout: config.output_dropout,
            out: nn::linear(vs / "out", embed_dim, vocab_size, Default::default()),
        }
    }

    /// tokens: [batch, len] int64, encoder_out: [batch, patches, embed_dim]
    /// Returns logits: [batch, len, vocab_size]
    pub fn forward_t(&self, tokens: &Tensor, encoder_out: &Tensor, train: bool) -> Tensor {
        let len = tokens.size()[1];
        let x = self.embedding.forward(tokens);

        // Padding positions never serve as keys; future positions are hidden.
        let padding = tokens.ne(0).unsqueeze(1);
        let mask = causal_mask(len, tokens.device()).logical_and(&padding);

        let attn_1 = self.self_attn.forward_t(&x, &x, &x, Some(&mask), train);
        let out_1 = self.ln_1.forward(&(&x + attn_1));

        let attn_2 = self
            .cross_attn
            .forward_t(&out_1, encoder_out, encoder_out, None, train);
        let out_2 = self.ln_2.forward(&(&out_1 + attn_2));

        let ffn_out = self.ffn.forward_t(&out_2, train);
        let ffn_out = self
            .ln_3
            .forward(&(ffn_out + &out_2))
            .dropout(self.output_dropout, train);

        ffn_out.apply(&self.out)
    }
}

use tch::{nn, Kind, Tensor};

/// Multi-head attention where every head projects to `key_dim` features.
pub struct MultiHeadAttention {
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    output: nn::Linear,
    num_heads: i64,
    key_dim: i64,
    dropout: f64,
}

impl MultiHeadAttention {
    pub fn new(vs: &nn::Path, embed_dim: i64, num_heads: i64, key_dim: i64, dropout: f64) -> Self {
        let inner = num_heads * key_dim;
        let query = nn::linear(vs / "query", embed_dim, inner, Default::default());
        let key = nn::linear(vs / "key", embed_dim, inner, Default::default());
        let value = nn::linear(vs / "value", embed_dim, inner, Default::default());
        let output = nn::linear(vs / "output", inner, embed_dim, Default::default());

        Self {
            query,
            key,
            value,
            output,
            num_heads,
            key_dim,
            dropout,
        }
    }

    fn split_heads(&self, x: &Tensor) -> Tensor {
        let size = x.size();
        x.view([size[0], size[1], self.num_heads, self.key_dim])
            .transpose(1, 2)
    }

    /// query: [B, Tq, E], key/value: [B, Tk, E]
    /// mask: optional bool [B or 1, Tq, Tk], true where attention is allowed.
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Tensor {
        let size = query.size();
        let (b, tq) = (size[0], size[1]);

        let q = self.split_heads(&query.apply(&self.query));
        let k = self.split_heads(&key.apply(&self.key));
        let v = self.split_heads(&value.apply(&self.value));

        let mut att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (self.key_dim as f64).sqrt());

        if let Some(mask) = mask {
            // Large negative rather than -inf keeps fully masked rows finite.
            att = att.masked_fill(&mask.unsqueeze(1).logical_not(), -1e9);
        }

        let att = att.softmax(-1, Kind::Float).dropout(self.dropout, train);
        let y = att.matmul(&v);
        let y = y
            .transpose(1, 2)
            .contiguous()
            .view([b, tq, self.num_heads * self.key_dim]);
        y.apply(&self.output)
    }
}

/// Lower-triangular bool mask of shape [1, len, len].
pub fn causal_mask(len: i64, device: tch::Device) -> Tensor {
    Tensor::ones([len, len], (Kind::Bool, device))
        .tril(0)
        .unsqueeze(0)
}

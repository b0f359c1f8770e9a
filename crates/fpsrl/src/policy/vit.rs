//! Compact vision transformer backbone.
//!
//! Patch embedding, learned position embeddings, pre-norm transformer blocks
//! and mean pooling over tokens. Module paths follow the usual
//! `blocks.{i}.attn.qkv` / `blocks.{i}.mlp.fc1` naming so low-rank targets
//! such as `attn` and `fc` select the attention and MLP projections.

use super::backbone::{average, probe_feature_dim, Backbone, FrameInput};
use super::config::{AgentConfig, FrameMode};
use super::lora::{Projection, ProjectionFactory};
use tch::{nn, nn::Module, Kind, Tensor};

pub const PATCH_SIZE: i64 = 14;
pub const EMBED_DIM: i64 = 192;
pub const DEPTH: usize = 4;
pub const NUM_HEADS: i64 = 3;
pub const MLP_RATIO: i64 = 4;

#[derive(Debug)]
struct Attention {
    qkv: Projection,
    proj: Projection,
    num_heads: i64,
}

impl Attention {
    fn forward(&self, x: &Tensor) -> Tensor {
        let size = x.size();
        let (b, n, d) = (size[0], size[1], size[2]);
        let head_dim = d / self.num_heads;
        let qkv = self
            .qkv
            .forward(x)
            .view([b, n, 3, self.num_heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let scale = (head_dim as f64).powf(-0.5);
        let attn = (q.matmul(&k.transpose(-2, -1)) * scale).softmax(-1, Kind::Float);
        let out = attn.matmul(&v).transpose(1, 2).reshape([b, n, d]);
        self.proj.forward(&out)
    }
}

#[derive(Debug)]
struct Block {
    norm1: nn::LayerNorm,
    attn: Attention,
    norm2: nn::LayerNorm,
    fc1: Projection,
    fc2: Projection,
}

impl Block {
    fn new(path: &nn::Path, index: usize, factory: &mut ProjectionFactory) -> Self {
        let scope = format!("blocks.{index}");
        let attn_path = path / "attn";
        let mlp_path = path / "mlp";
        let hidden = EMBED_DIM * MLP_RATIO;
        Self {
            norm1: nn::layer_norm(path / "norm1", vec![EMBED_DIM], Default::default()),
            attn: Attention {
                qkv: factory.linear(&(&attn_path / "qkv"), &format!("{scope}.attn.qkv"), EMBED_DIM, 3 * EMBED_DIM),
                proj: factory.linear(&(&attn_path / "proj"), &format!("{scope}.attn.proj"), EMBED_DIM, EMBED_DIM),
                num_heads: NUM_HEADS,
            },
            norm2: nn::layer_norm(path / "norm2", vec![EMBED_DIM], Default::default()),
            fc1: factory.linear(&(&mlp_path / "fc1"), &format!("{scope}.mlp.fc1"), EMBED_DIM, hidden),
            fc2: factory.linear(&(&mlp_path / "fc2"), &format!("{scope}.mlp.fc2"), hidden, EMBED_DIM),
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let x = x + self.attn.forward(&self.norm1.forward(x));
        let hidden = self.fc1.forward(&self.norm2.forward(&x)).gelu("none");
        &x + self.fc2.forward(&hidden)
    }
}

pub struct VisionTransformer {
    input: FrameInput,
    patch_embed: nn::Conv2D,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: nn::LayerNorm,
    feature_dim: i64,
}

impl VisionTransformer {
    pub fn new(path: &nn::Path, config: &AgentConfig, factory: &mut ProjectionFactory) -> Self {
        let net = path / "net";
        let (height, width) = config.input_hw();
        let tokens_per_frame = (height / PATCH_SIZE) * (width / PATCH_SIZE);
        let tokens = match config.frame_mode {
            FrameMode::MultiFramePatchConcat => tokens_per_frame * config.frames,
            _ => tokens_per_frame,
        };

        let patch_embed = nn::conv2d(
            &net / "patch_embed" / "proj",
            FrameInput::view_channels(config),
            EMBED_DIM,
            PATCH_SIZE,
            nn::ConvConfig {
                stride: PATCH_SIZE,
                ..Default::default()
            },
        );
        let pos_embed = net.var(
            "pos_embed",
            &[1, tokens, EMBED_DIM],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        );
        let blocks = (0..DEPTH)
            .map(|i| Block::new(&(&net / "blocks" / i), i, factory))
            .collect();

        let mut vit = Self {
            input: FrameInput::new(path, config, true),
            patch_embed,
            pos_embed,
            blocks,
            norm: nn::layer_norm(&net / "norm", vec![EMBED_DIM], Default::default()),
            feature_dim: 0,
        };
        vit.feature_dim = probe_feature_dim(&vit, config, path.device());
        vit
    }

    /// Patch tokens `[B, N, D]` of one view
    fn embed(&self, view: &Tensor) -> Tensor {
        self.patch_embed
            .forward(view)
            .flatten(2, -1)
            .transpose(1, 2)
    }

    /// Encode a token sequence into pooled features `[B, D]`
    fn encode(&self, tokens: Tensor) -> Tensor {
        let mut x = tokens + &self.pos_embed;
        for block in &self.blocks {
            x = block.forward(&x);
        }
        self.norm.forward(&x).mean_dim(1, false, Kind::Float)
    }
}

impl Backbone for VisionTransformer {
    fn adapt(&self, observations: &Tensor) -> Tensor {
        self.input.adapt(observations)
    }

    fn extract(&self, adapted: &Tensor, _train: bool) -> Tensor {
        let views = self.input.views(adapted);
        match self.input.mode() {
            FrameMode::MultiFramePatchConcat => {
                let tokens: Vec<Tensor> = views.iter().map(|v| self.embed(v)).collect();
                self.encode(Tensor::cat(&tokens, 1))
            }
            _ => average(views.iter().map(|v| self.encode(self.embed(v))).collect()),
        }
    }

    fn feature_dim(&self) -> i64 {
        self.feature_dim
    }
}

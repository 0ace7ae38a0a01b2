use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};
use tracing::instrument;

use crate::cache::Movable;
use crate::hf_hub::hf_download;
use crate::loading;

pub const CANNY: &str = "lllyasviel/control_v11p_sd15_canny";
pub const SOFT_EDGE: &str = "lllyasviel/control_v11p_sd15_softedge";
pub const INPAINT: &str = "lllyasviel/control_v11p_sd15_inpaint";

/// Layout of a ControlNet trained against the Stable Diffusion 1.x UNet.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlNetConfig {
    /// `(output channels, cross-attention enabled)` per down block.
    pub blocks: Vec<(usize, bool)>,
    pub layers_per_block: usize,
    pub attention_head_dim: usize,
    pub cross_attention_dim: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub conditioning_channels: usize,
    pub conditioning_embedding_channels: Vec<usize>,
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self {
            blocks: vec![(320, true), (640, true), (1280, true), (1280, false)],
            layers_per_block: 2,
            attention_head_dim: 8,
            cross_attention_dim: 768,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            conditioning_channels: 3,
            conditioning_embedding_channels: vec![16, 32, 96, 256],
        }
    }
}

impl ControlNetConfig {
    fn time_embed_dim(&self) -> usize {
        self.blocks[0].0 * 4
    }

    /// Channels of every residual handed to the UNet, in down-block order.
    fn residual_channels(&self) -> Vec<usize> {
        let mut channels = vec![self.blocks[0].0];
        let last = self.blocks.len() - 1;
        for (index, &(out, _)) in self.blocks.iter().enumerate() {
            channels.extend(std::iter::repeat_n(out, self.layers_per_block));
            if index < last {
                channels.push(out);
            }
        }
        channels
    }
}

fn conv(vb: VarBuilder, in_c: usize, out_c: usize, kernel: usize, stride: usize) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    };
    Ok(conv2d(in_c, out_c, kernel, config, vb)?)
}

/// Maps the hint image down to the latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn load(vb: VarBuilder, config: &ControlNetConfig, out_channels: usize) -> Result<Self> {
        let channels = &config.conditioning_embedding_channels;
        let conv_in = conv(vb.pp("conv_in"), config.conditioning_channels, channels[0], 3, 1)?;

        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * (channels.len() - 1));
        for (index, pair) in channels.windows(2).enumerate() {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(conv(vb_blocks.pp(2 * index), c_in, c_in, 3, 1)?);
            blocks.push(conv(vb_blocks.pp(2 * index + 1), c_in, c_out, 3, 2)?);
        }

        let last = channels[channels.len() - 1];
        let conv_out = conv(vb.pp("conv_out"), last, out_channels, 3, 1)?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

struct Net {
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    conv_in: Conv2d,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    zero_convs: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    mid_zero_conv: Conv2d,
}

impl Net {
    fn load(vb: VarBuilder, config: &ControlNetConfig) -> Result<Self> {
        let first = config.blocks[0].0;
        let time_embed_dim = config.time_embed_dim();
        let time_proj = Timesteps::new(first, true, 0.);
        let time_embedding = TimestepEmbedding::new(vb.pp("time_embedding"), first, time_embed_dim)?;

        let conv_in = conv(vb.pp("conv_in"), super::LATENT_CHANNELS, first, 3, 1)?;
        let cond_embedding =
            ConditioningEmbedding::load(vb.pp("controlnet_cond_embedding"), config, first)?;

        let vb_down = vb.pp("down_blocks");
        let last = config.blocks.len() - 1;
        let mut down_blocks = Vec::with_capacity(config.blocks.len());
        let mut in_channels = first;
        for (index, &(out_channels, cross_attn)) in config.blocks.iter().enumerate() {
            let downblock = DownBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_downsample: index < last,
                downsample_padding: 1,
                ..Default::default()
            };
            let block = if cross_attn {
                let cfg = CrossAttnDownBlock2DConfig {
                    downblock,
                    attn_num_head_channels: config.attention_head_dim,
                    cross_attention_dim: config.cross_attention_dim,
                    sliced_attention_size: None,
                    use_linear_projection: false,
                    transformer_layers_per_block: 1,
                };
                DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                    vb_down.pp(index),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    false,
                    cfg,
                )?)
            } else {
                DownBlock::Basic(DownBlock2D::new(
                    vb_down.pp(index),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    downblock,
                )?)
            };
            down_blocks.push(block);
            in_channels = out_channels;
        }

        let vb_zero = vb.pp("controlnet_down_blocks");
        let zero_convs = config
            .residual_channels()
            .into_iter()
            .enumerate()
            .map(|(index, channels)| conv(vb_zero.pp(index), channels, channels, 1, 1))
            .collect::<Result<Vec<_>>>()?;

        let mid_channels = config.blocks[last].0;
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vb.pp("mid_block"),
            mid_channels,
            Some(time_embed_dim),
            false,
            UNetMidBlock2DCrossAttnConfig {
                resnet_eps: config.norm_eps,
                output_scale_factor: 1.,
                cross_attn_dim: config.cross_attention_dim,
                attn_num_head_channels: config.attention_head_dim,
                resnet_groups: Some(config.norm_num_groups),
                use_linear_projection: false,
                transformer_layers_per_block: 1,
                ..Default::default()
            },
        )?;
        let mid_zero_conv = conv(vb.pp("controlnet_mid_block"), mid_channels, mid_channels, 1, 1)?;

        Ok(Self {
            time_proj,
            time_embedding,
            conv_in,
            cond_embedding,
            down_blocks,
            zero_convs,
            mid_block,
            mid_zero_conv,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &Tensor,
        scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let (batch, _, _, _) = xs.dims4()?;
        let emb = (Tensor::ones(batch, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let mut xs = (self.conv_in.forward(xs)? + self.cond_embedding.forward(cond)?)?;
        let mut residuals = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?,
            };
            residuals.extend(res);
            xs = out;
        }
        anyhow::ensure!(
            residuals.len() == self.zero_convs.len(),
            "controlnet produced {} residuals, expected {}",
            residuals.len(),
            self.zero_convs.len()
        );

        let down = residuals
            .iter()
            .zip(&self.zero_convs)
            .map(|(res, zero)| Ok((zero.forward(res)? * scale)?))
            .collect::<Result<Vec<_>>>()?;

        let mid = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;
        let mid = (self.mid_zero_conv.forward(&mid)? * scale)?;
        Ok((down, mid))
    }
}

/// ControlNet encoder producing the extra down and mid residuals fed into the
/// Stable Diffusion UNet.
pub struct ControlNetModel {
    repo: String,
    weights: PathBuf,
    config: ControlNetConfig,
    use_f16: bool,
    dtype: DType,
    net: Net,
}

impl ControlNetModel {
    pub async fn load(repo: &str, use_f16: bool, device: Device) -> Result<Self> {
        let variant = if use_f16 { ".fp16" } else { "" };
        let weights = hf_download(
            repo,
            &format!("diffusion_pytorch_model{variant}.safetensors"),
        )
        .await?;
        let config = ControlNetConfig::default();
        let dtype = loading::dtype_for(&device, use_f16);
        let net = Self::build(&weights, &config, dtype, &device)
            .with_context(|| format!("failed to build controlnet {repo}"))?;

        Ok(Self {
            repo: repo.to_string(),
            weights,
            config,
            use_f16,
            dtype,
            net,
        })
    }

    fn build(
        weights: &PathBuf,
        config: &ControlNetConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Net> {
        let vb = loading::mmaped_safetensors(std::slice::from_ref(weights), dtype, device)?;
        Net::load(vb, config)
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the scaled down-block residuals and the mid-block residual.
    #[instrument(level = "trace", skip_all, fields(timestep = timestep))]
    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        hint: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        self.net.forward(
            &latents.to_dtype(self.dtype)?,
            timestep,
            &encoder_hidden_states.to_dtype(self.dtype)?,
            &hint.to_dtype(self.dtype)?,
            conditioning_scale,
        )
    }
}

impl Movable for ControlNetModel {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        let dtype = loading::dtype_for(device, self.use_f16);
        self.net = Self::build(&self.weights, &self.config, dtype, device)?;
        self.dtype = dtype;
        Ok(())
    }
}

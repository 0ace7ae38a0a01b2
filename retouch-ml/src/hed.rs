use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d};
use image::{DynamicImage, GenericImageView, GrayImage, RgbImage};
use tracing::instrument;

use crate::cache::Movable;
use crate::define_models;
use crate::loading;

define_models! {
    Hed => ("lllyasviel/Annotators", "ControlNetHED.pth"),
}

/// `(input channels, output channels, convolutions)` of the five stages.
const BLOCKS: [(usize, usize, usize); 5] = [
    (3, 64, 2),
    (64, 128, 2),
    (128, 256, 3),
    (256, 512, 3),
    (512, 512, 3),
];

struct Block {
    convs: Vec<Conv2d>,
    projection: Conv2d,
}

impl Block {
    fn load(vb: VarBuilder, in_channels: usize, out_channels: usize, layers: usize) -> Result<Self> {
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let convs = (0..layers)
            .map(|i| {
                let c_in = if i == 0 { in_channels } else { out_channels };
                conv2d(c_in, out_channels, 3, padded, vb.pp("convs").pp(i))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let projection = conv2d(out_channels, 1, 1, Default::default(), vb.pp("projection"))?;
        Ok(Self { convs, projection })
    }

    fn forward(&self, xs: &Tensor, down_sample: bool) -> Result<(Tensor, Tensor)> {
        let mut xs = if down_sample {
            xs.max_pool2d(2)?
        } else {
            xs.clone()
        };
        for conv in &self.convs {
            xs = conv.forward(&xs)?.relu()?;
        }
        let projection = self.projection.forward(&xs)?;
        Ok((xs, projection))
    }
}

struct Net {
    norm: Tensor,
    blocks: Vec<Block>,
}

impl Net {
    fn load(vb: VarBuilder) -> Result<Self> {
        let norm = vb.get((1, 3, 1, 1), "norm")?;
        let blocks = BLOCKS
            .iter()
            .enumerate()
            .map(|(i, &(c_in, c_out, layers))| {
                Block::load(vb.pp(format!("block{}", i + 1)), c_in, c_out, layers)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { norm, blocks })
    }

    /// One single-channel side output per stage, at decreasing resolution.
    fn forward(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let mut xs = xs.broadcast_sub(&self.norm)?;
        let mut projections = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let (next, projection) = block.forward(&xs, i > 0)?;
            projections.push(projection);
            xs = next;
        }
        Ok(projections)
    }
}

/// Holistically-nested edge detector producing soft edge maps for the
/// soft-edge ControlNet.
pub struct HedDetector {
    weights: PathBuf,
    net: Net,
    device: Device,
}

impl HedDetector {
    pub async fn load(device: Device) -> Result<Self> {
        let weights = Manifest::Hed.get().await?;
        let net = Self::build(&weights, &device)?;
        Ok(Self {
            weights,
            net,
            device,
        })
    }

    fn build(weights: &PathBuf, device: &Device) -> Result<Net> {
        let vb = loading::pth(weights, DType::F32, device)?;
        Net::load(vb).context("failed to build HED")
    }

    #[instrument(level = "debug", skip_all)]
    pub fn inference(&self, image: &DynamicImage) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        let pixels = Tensor::from_vec(
            image.to_rgb8().into_raw(),
            (height as usize, width as usize, 3),
            &self.device,
        )?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .unsqueeze(0)?;

        let projections = self.net.forward(&pixels)?;
        let mut sum = vec![0f32; (width * height) as usize];
        for projection in &projections {
            let side = upsample(projection, width, height)?;
            for (acc, value) in sum.iter_mut().zip(&side) {
                *acc += value;
            }
        }

        let count = projections.len() as f32;
        let edges = sum
            .into_iter()
            .map(|v| {
                let edge = 1. / (1. + (-v / count).exp());
                (edge * 255.).round().clamp(0., 255.) as u8
            })
            .collect::<Vec<_>>();
        let edges = GrayImage::from_raw(width, height, edges)
            .context("failed to create edge map buffer")?;
        Ok(DynamicImage::ImageLuma8(edges).to_rgb8())
    }
}

impl Movable for HedDetector {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.net = Self::build(&self.weights, device)?;
        self.device = device.clone();
        Ok(())
    }
}

/// Bilinear resize of a `(1, 1, h, w)` side output to the image size, with
/// pixel centres aligned at half-pixel offsets. Values are logits, so they are
/// interpolated unclamped.
fn upsample(projection: &Tensor, width: u32, height: u32) -> Result<Vec<f32>> {
    let projection = projection.squeeze(0)?.squeeze(0)?.to_device(&Device::Cpu)?;
    let (h, w) = projection.dims2()?;
    let values = projection.flatten_all()?.to_vec1::<f32>()?;
    if (w as u32, h as u32) == (width, height) {
        return Ok(values);
    }

    let axis = |dst: u32, src: usize| {
        let scale = src as f32 / dst as f32;
        (0..dst)
            .map(|i| {
                let pos = ((i as f32 + 0.5) * scale - 0.5).clamp(0., (src - 1) as f32);
                let lo = pos.floor() as usize;
                let hi = (lo + 1).min(src - 1);
                (lo, hi, pos - lo as f32)
            })
            .collect::<Vec<_>>()
    };
    let xs = axis(width, w);
    let ys = axis(height, h);

    let mut out = Vec::with_capacity((width * height) as usize);
    for &(y0, y1, fy) in &ys {
        for &(x0, x1, fx) in &xs {
            let top = values[y0 * w + x0] * (1. - fx) + values[y0 * w + x1] * fx;
            let bottom = values[y1 * w + x0] * (1. - fx) + values[y1 * w + x1] * fx;
            out.push(top * (1. - fy) + bottom * fy);
        }
    }
    Ok(out)
}

pub mod controlnet;
pub mod img2img;
pub mod inpaint;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    StableDiffusionConfig, build_clip_transformer, clip, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

use crate::define_models;
use crate::hf_hub::hf_download;
use crate::loading;

pub use controlnet::{ControlNetConfig, ControlNetModel};
pub use img2img::{ControlNetPipeline, Img2ImgParams};
pub use inpaint::{InpaintParams, StableDiffusionInpaint};

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;
/// Processing sizes are snapped to this so every UNet level divides evenly.
const SIZE_MULTIPLE: u32 = 64;
const MAX_SIDE: u32 = 1024;

define_models! {
    ClipTokenizer => ("openai/clip-vit-base-patch32", "tokenizer.json"),
}

/// Weight files of a diffusers-layout Stable Diffusion repository.
#[derive(Debug, Clone)]
pub(crate) struct DiffusersWeights {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub tokenizer: PathBuf,
}

impl DiffusersWeights {
    pub async fn fetch(repo: &str, use_f16: bool) -> Result<Self> {
        let variant = if use_f16 { ".fp16" } else { "" };
        Ok(Self {
            unet: hf_download(
                repo,
                &format!("unet/diffusion_pytorch_model{variant}.safetensors"),
            )
            .await?,
            vae: hf_download(
                repo,
                &format!("vae/diffusion_pytorch_model{variant}.safetensors"),
            )
            .await?,
            text_encoder: hf_download(repo, &format!("text_encoder/model{variant}.safetensors"))
                .await?,
            tokenizer: Manifest::ClipTokenizer.get().await?,
        })
    }
}

/// Tokenizer, UNet and autoencoder shared by the inpainting and ControlNet
/// pipelines.
pub(crate) struct StableDiffusion {
    config: StableDiffusionConfig,
    weights: DiffusersWeights,
    unet_in_channels: usize,
    use_f16: bool,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    clip: clip::ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusion {
    pub fn load(
        config: StableDiffusionConfig,
        weights: DiffusersWeights,
        unet_in_channels: usize,
        use_f16: bool,
        device: &Device,
    ) -> Result<Self> {
        let dtype = loading::dtype_for(device, use_f16);
        let tokenizer = loading::tokenizer(&weights.tokenizer)?;
        let (clip, unet, vae) = Self::build(&config, &weights, unet_in_channels, device, dtype)?;

        Ok(Self {
            config,
            weights,
            unet_in_channels,
            use_f16,
            device: device.clone(),
            dtype,
            tokenizer,
            clip,
            unet,
            vae,
        })
    }

    fn build(
        config: &StableDiffusionConfig,
        weights: &DiffusersWeights,
        unet_in_channels: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<(clip::ClipTextTransformer, UNet2DConditionModel, AutoEncoderKL)> {
        let clip = build_clip_transformer(&config.clip, &weights.text_encoder, device, dtype)
            .context("failed to build text encoder")?;
        let unet = config
            .build_unet(&weights.unet, device, unet_in_channels, false, dtype)
            .context("failed to build unet")?;
        let vae = config
            .build_vae(&weights.vae, device, dtype)
            .context("failed to build vae")?;
        Ok((clip, unet, vae))
    }

    /// Rebuilds every network from its weight files on `device`.
    pub fn move_to(&mut self, device: &Device) -> Result<()> {
        let dtype = loading::dtype_for(device, self.use_f16);
        let (clip, unet, vae) = Self::build(
            &self.config,
            &self.weights,
            self.unet_in_channels,
            device,
            dtype,
        )?;
        self.clip = clip;
        self.unet = unet;
        self.vae = vae;
        self.device = device.clone();
        self.dtype = dtype;
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn unet(&self) -> &UNet2DConditionModel {
        &self.unet
    }

    fn token_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let vocab = self.tokenizer.get_vocab(true);
        let eos = *vocab
            .get("<|endoftext|>")
            .context("tokenizer has no end-of-text token")?;
        let pad = match &self.config.clip.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .with_context(|| format!("tokenizer has no padding token {padding}"))?,
            None => eos,
        };
        let max_len = self.config.clip.max_position_embeddings;

        let mut ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if ids.len() > max_len {
            tracing::warn!(
                tokens = ids.len(),
                max_len,
                "prompt is longer than the text encoder window, truncating"
            );
            ids.truncate(max_len - 1);
            ids.push(eos);
        }
        ids.resize(max_len, pad);
        Ok(ids)
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let ids = self.token_ids(prompt)?;
        let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&ids)?)
    }

    /// Unconditional and conditional embeddings stacked for classifier-free
    /// guidance, in that order.
    pub fn guidance_embeddings(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let uncond = self.encode_prompt(negative_prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?)
    }

    pub fn encode_latents(&self, pixels: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(pixels)?;
        Ok((dist.sample()? * VAE_SCALE)?)
    }

    pub fn decode_latents(&self, latents: &Tensor) -> Result<RgbImage> {
        let pixels = self.vae.decode(&(latents / VAE_SCALE)?)?;
        tensor_to_rgb(&pixels)
    }

    pub fn noise(&self, shape: (usize, usize, usize, usize), seed: Option<u64>) -> Result<Tensor> {
        let noise = match seed {
            // the CPU backend cannot be reseeded
            Some(seed) if self.device.is_cpu() => seeded_noise(shape, seed, &self.device)?,
            Some(seed) => {
                self.device.set_seed(seed)?;
                Tensor::randn(0f32, 1f32, shape, &self.device)?
            }
            None => Tensor::randn(0f32, 1f32, shape, &self.device)?,
        };
        Ok(noise.to_dtype(self.dtype)?)
    }
}

/// Standard normal noise drawn from a host RNG seeded with `seed`.
pub(crate) fn seeded_noise(
    shape: (usize, usize, usize, usize),
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let values = (0..len)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Applies classifier-free guidance to a batched `[uncond, cond]` prediction.
pub(crate) fn guide(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * guidance_scale)?)?)
}

/// First inference step for an image-to-image run at `strength`.
pub(crate) fn start_step(steps: usize, strength: f64) -> usize {
    let init = ((steps as f64 * strength.clamp(0.0, 1.0)) as usize).min(steps);
    steps - init
}

/// Largest size not above `MAX_SIDE` keeping the aspect ratio, snapped to a
/// multiple of `SIZE_MULTIPLE`.
pub(crate) fn processing_size(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let scale = (MAX_SIDE as f64 / longest as f64).min(1.0);
    let snap = |side: u32| {
        let scaled = (side as f64 * scale).round() as u32;
        ((scaled + SIZE_MULTIPLE / 2) / SIZE_MULTIPLE).max(1) * SIZE_MULTIPLE
    };
    (snap(width), snap(height))
}

/// `(1, 3, h, w)` tensor in `[-1, 1]`.
pub(crate) fn rgb_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let tensor = Tensor::from_vec(image.as_raw().clone(), (h, w, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_dtype(dtype)?)
}

/// `(1, 3, h, w)` tensor in `[0, 1]`, the range ControlNet hints are fed in.
pub(crate) fn hint_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let tensor = (Tensor::from_vec(image.as_raw().clone(), (h, w, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        / 255.)?
        .unsqueeze(0)?;
    Ok(tensor.to_dtype(dtype)?)
}

pub(crate) fn tensor_to_rgb(pixels: &Tensor) -> Result<RgbImage> {
    let pixels = pixels.i(0)?.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (channels, height, width) = pixels.dims3()?;
    anyhow::ensure!(channels == 3, "expected 3 channels in output, got {channels}");
    let pixels = ((pixels / 2.)? + 0.5)?
        .clamp(0f32, 1f32)?
        .affine(255., 0.5)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .context("failed to create image buffer from decoded latents")
}

pub(crate) fn resize_rgb(image: &DynamicImage, width: u32, height: u32) -> RgbImage {
    if image.width() == width && image.height() == height {
        image.to_rgb8()
    } else {
        image
            .resize_exact(width, height, FilterType::Lanczos3)
            .to_rgb8()
    }
}

pub(crate) fn latent_shape(width: u32, height: u32) -> (usize, usize, usize, usize) {
    (1, LATENT_CHANNELS, height as usize / 8, width as usize / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_size_snaps_and_caps() {
        assert_eq!(processing_size(512, 512), (512, 512));
        assert_eq!(processing_size(640, 480), (640, 512));
        assert_eq!(processing_size(2048, 1024), (1024, 512));
        assert_eq!(processing_size(10, 10), (64, 64));
    }

    #[test]
    fn start_step_follows_strength() {
        assert_eq!(start_step(30, 1.0), 0);
        assert_eq!(start_step(25, 0.3), 18);
        assert_eq!(start_step(25, 0.0), 25);
        assert_eq!(start_step(10, 2.0), 0);
    }

    #[test]
    fn guidance_interpolates_between_halves() -> Result<()> {
        let uncond = Tensor::full(1f32, (1, 2), &Device::Cpu)?;
        let cond = Tensor::full(3f32, (1, 2), &Device::Cpu)?;
        let batch = Tensor::cat(&[uncond, cond], 0)?;

        let guided = guide(&batch, 7.5)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(guided, vec![16.0, 16.0]);
        Ok(())
    }

    #[test]
    fn seeded_noise_is_reproducible_on_cpu() -> Result<()> {
        let shape = latent_shape(64, 32);
        let first = seeded_noise(shape, 42, &Device::Cpu)?;
        assert_eq!(first.dims(), &[1, 4, 4, 8]);

        let first = first.flatten_all()?.to_vec1::<f32>()?;
        let again = seeded_noise(shape, 42, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let other = seeded_noise(shape, 43, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(first, again);
        assert_ne!(first, other);

        let mean = first.iter().sum::<f32>() / first.len() as f32;
        assert!(mean.abs() < 0.5, "mean {mean}");
        Ok(())
    }

    #[test]
    fn pixels_survive_tensor_conversion() -> Result<()> {
        let image = RgbImage::from_fn(4, 2, |x, y| image::Rgb([x as u8 * 60, y as u8 * 200, 255]));
        let tensor = rgb_to_tensor(&image, &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims(), &[1, 3, 2, 4]);
        assert_eq!(tensor_to_rgb(&tensor)?, image);
        Ok(())
    }
}

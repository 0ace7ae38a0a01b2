use anyhow::{Result, bail};
use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    StableDiffusionConfig,
    schedulers::SchedulerConfig,
    uni_pc::UniPCSchedulerConfig,
};
use image::{DynamicImage, GenericImageView, RgbImage, imageops::FilterType};
use tracing::instrument;

use super::{
    ControlNetModel, DiffusersWeights, StableDiffusion, guide, hint_to_tensor, latent_shape,
    processing_size, resize_rgb, rgb_to_tensor, start_step,
};
use crate::cache::{Handle, Movable};

pub const DEFAULT_BASE_MODEL: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";

#[derive(Debug, Clone, PartialEq)]
pub struct Img2ImgParams {
    pub prompt: String,
    pub negative_prompt: String,
    /// Fraction of the schedule re-run on top of the input image.
    pub strength: f64,
    pub guidance_scale: f64,
    pub steps: usize,
    pub controlnet_scale: f64,
    pub seed: Option<u64>,
}

impl Img2ImgParams {
    pub fn new(prompt: impl Into<String>, strength: f64) -> Self {
        Self {
            prompt: prompt.into(),
            strength,
            ..Default::default()
        }
    }

    pub fn negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }
}

impl Default for Img2ImgParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            strength: 0.5,
            guidance_scale: 7.5,
            steps: 25,
            controlnet_scale: 1.0,
            seed: None,
        }
    }
}

/// Stable Diffusion 1.5 image-to-image steered by a shared ControlNet.
pub struct ControlNetPipeline {
    sd: StableDiffusion,
    controlnet: Handle<ControlNetModel>,
}

impl ControlNetPipeline {
    pub async fn load(
        base_repo: &str,
        controlnet: Handle<ControlNetModel>,
        use_f16: bool,
        device: Device,
    ) -> Result<Self> {
        let weights = DiffusersWeights::fetch(base_repo, use_f16).await?;
        let config = StableDiffusionConfig::v1_5(None, Some(512), Some(512));
        let sd = StableDiffusion::load(config, weights, super::LATENT_CHANNELS, use_f16, &device)?;
        Ok(Self { sd, controlnet })
    }

    pub fn controlnet(&self) -> &Handle<ControlNetModel> {
        &self.controlnet
    }

    /// Re-renders `image` following `hint`, a control image already produced
    /// by the preprocessor matching the ControlNet.
    #[instrument(level = "debug", skip_all, fields(steps = params.steps, strength = params.strength))]
    pub fn inference(
        &self,
        image: &DynamicImage,
        hint: &RgbImage,
        params: &Img2ImgParams,
    ) -> Result<DynamicImage> {
        if params.steps == 0 {
            bail!("at least one inference step is required");
        }

        let (orig_w, orig_h) = image.dimensions();
        let (width, height) = processing_size(orig_w, orig_h);
        let device = self.sd.device();
        let dtype = self.sd.dtype();

        let pixels = rgb_to_tensor(&resize_rgb(image, width, height), device, dtype)?;
        let hint = resize_rgb(&DynamicImage::ImageRgb8(hint.clone()), width, height);
        let hint = hint_to_tensor(&hint, device, dtype)?.repeat((2, 1, 1, 1))?;

        let embeddings = self
            .sd
            .guidance_embeddings(&params.prompt, &params.negative_prompt)?;

        let mut scheduler = UniPCSchedulerConfig::default().build(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = start_step(timesteps.len(), params.strength);
        if t_start >= timesteps.len() {
            tracing::debug!("strength is zero, returning the input unchanged");
            return Ok(image.clone());
        }

        let noise = self.sd.noise(latent_shape(width, height), params.seed)?;
        let mut latents = if t_start == 0 {
            (noise * scheduler.init_noise_sigma())?
        } else {
            let image_latents = self.sd.encode_latents(&pixels)?;
            scheduler.add_noise(&image_latents, noise, timesteps[t_start])?
        };

        let controlnet = self.controlnet.read()?;
        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            tracing::trace!(index, timestep, "denoising");
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;

            let (down, mid) = controlnet.forward(
                &input,
                timestep as f64,
                &embeddings,
                &hint,
                params.controlnet_scale,
            )?;
            let down = down
                .iter()
                .map(|res| res.to_dtype(dtype))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let mid = mid.to_dtype(dtype)?;

            let noise_pred = self.sd.unet().forward_with_additional_residuals(
                &input,
                timestep as f64,
                &embeddings,
                Some(&down),
                Some(&mid),
            )?;
            let noise_pred = guide(&noise_pred, params.guidance_scale)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let output = DynamicImage::ImageRgb8(self.sd.decode_latents(&latents)?);
        Ok(if (width, height) == (orig_w, orig_h) {
            output
        } else {
            output.resize_exact(orig_w, orig_h, FilterType::Lanczos3)
        })
    }
}

/// Only the base networks move here; the ControlNet is a cache entry of its
/// own and is moved through its own slot.
impl Movable for ControlNetPipeline {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.sd.move_to(device)
    }
}

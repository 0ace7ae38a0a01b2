use anyhow::{Result, bail};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    StableDiffusionConfig,
    ddim::DDIMSchedulerConfig,
    schedulers::{PredictionType, SchedulerConfig},
};
use image::{DynamicImage, GenericImageView, GrayImage, imageops::FilterType};
use tracing::instrument;

use super::{
    DiffusersWeights, StableDiffusion, guide, latent_shape, processing_size, resize_rgb,
    rgb_to_tensor, start_step,
};
use crate::cache::Movable;

pub const DEFAULT_MODEL: &str = "stabilityai/stable-diffusion-2-inpainting";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "low quality, blurry, ugly, deformed";

/// Latents, mask and masked-image latents are stacked on the channel axis.
const UNET_IN_CHANNELS: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct InpaintParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub strength: f64,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: Option<u64>,
}

impl InpaintParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

impl Default for InpaintParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            strength: 1.0,
            guidance_scale: 7.5,
            steps: 30,
            seed: None,
        }
    }
}

/// Stable Diffusion 2 inpainting: regenerates the white region of a mask and
/// keeps the black region.
pub struct StableDiffusionInpaint {
    sd: StableDiffusion,
}

impl StableDiffusionInpaint {
    pub async fn load(model_id: &str, use_f16: bool, device: Device) -> Result<Self> {
        let weights = DiffusersWeights::fetch(model_id, use_f16).await?;
        // same networks as 2.1, trained against epsilon at 512px
        let config = StableDiffusionConfig::v2_1(None, Some(512), Some(512));
        let sd = StableDiffusion::load(config, weights, UNET_IN_CHANNELS, use_f16, &device)?;
        Ok(Self { sd })
    }

    #[instrument(level = "debug", skip_all, fields(steps = params.steps, strength = params.strength))]
    pub fn inference(
        &self,
        image: &DynamicImage,
        mask: &GrayImage,
        params: &InpaintParams,
    ) -> Result<DynamicImage> {
        if image.dimensions() != mask.dimensions() {
            bail!(
                "image and mask dimensions mismatch: image is {:?}, mask is {:?}",
                image.dimensions(),
                mask.dimensions()
            );
        }
        if params.steps == 0 {
            bail!("at least one inference step is required");
        }

        let (orig_w, orig_h) = image.dimensions();
        let (width, height) = processing_size(orig_w, orig_h);
        let device = self.sd.device();
        let dtype = self.sd.dtype();

        let pixels = rgb_to_tensor(&resize_rgb(image, width, height), device, dtype)?;
        let mask = mask_to_tensor(mask, width, height, device, dtype)?;

        let keep = (1. - &mask)?;
        let masked_latents = self.sd.encode_latents(&pixels.broadcast_mul(&keep)?)?;
        let (_, _, latent_h, latent_w) = masked_latents.dims4()?;
        let mask_latents = mask.interpolate2d(latent_h, latent_w)?;

        let embeddings = self
            .sd
            .guidance_embeddings(&params.prompt, &params.negative_prompt)?;

        let mut scheduler = DDIMSchedulerConfig {
            prediction_type: PredictionType::Epsilon,
            ..Default::default()
        }
        .build(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = start_step(timesteps.len(), params.strength);
        if t_start >= timesteps.len() {
            return Ok(image.clone());
        }

        let noise = self.sd.noise(latent_shape(width, height), params.seed)?;
        let mut latents = if t_start == 0 {
            (noise * scheduler.init_noise_sigma())?
        } else {
            let image_latents = self.sd.encode_latents(&pixels)?;
            scheduler.add_noise(&image_latents, noise, timesteps[t_start])?
        };

        let conditioning = Tensor::cat(&[&mask_latents, &masked_latents], 1)?.repeat((2, 1, 1, 1))?;
        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            tracing::trace!(index, timestep, "denoising");
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let input = Tensor::cat(&[&input, &conditioning], 1)?;

            let noise_pred = self
                .sd
                .unet()
                .forward(&input, timestep as f64, &embeddings)?;
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

impl Movable for StableDiffusionInpaint {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.sd.move_to(device)
    }
}

/// `(1, 1, h, w)` tensor holding 1 where pixels are regenerated.
fn mask_to_tensor(
    mask: &GrayImage,
    width: u32,
    height: u32,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mask = if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        image::imageops::resize(mask, width, height, FilterType::Nearest)
    };
    let values = mask
        .pixels()
        .map(|p| if p.0[0] >= 128 { 1f32 } else { 0f32 })
        .collect::<Vec<_>>();
    let tensor = Tensor::from_vec(values, (1, 1, height as usize, width as usize), device)?;
    Ok(tensor.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn mask_is_binarized_at_half_intensity() -> Result<()> {
        let mask = GrayImage::from_fn(4, 1, |x, _| Luma([[0, 127, 128, 255][x as usize]]));
        let tensor = mask_to_tensor(&mask, 4, 1, &Device::Cpu, DType::F32)?;
        assert_eq!(
            tensor.flatten_all()?.to_vec1::<f32>()?,
            vec![0.0, 0.0, 1.0, 1.0]
        );
        Ok(())
    }

    #[test]
    fn default_params_match_pipeline_defaults() {
        let params = InpaintParams::new("a cat");
        assert_eq!(params.prompt, "a cat");
        assert_eq!(params.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(params.strength, 1.0);
        assert_eq!(params.guidance_scale, 7.5);
        assert_eq!(params.steps, 30);
    }
}

//! Quality improvements: ControlNet-guided image-to-image with fixed prompts.

use std::str::FromStr;

use image::{DynamicImage, GenericImageView, imageops::FilterType};
use retouch_ml::stable_diffusion::Img2ImgParams;
use tracing::{info, warn};

use crate::SharedCache;
use crate::config::ModelConfig;
use crate::image::MAX_CANVAS_SIDE;
use crate::pipelines::run_controlled_img2img;
use crate::result::{Error, Result};

pub const DENOISE_STRENGTH: f64 = 0.35;
pub const SHARPEN_STRENGTH: f64 = 0.3;
pub const DEBLUR_STRENGTH: f64 = 0.4;
pub const SUPER_RESOLUTION_SCALE: u32 = 4;
pub const COLORIZE_PROMPT: &str = "a vivid, realistic color photograph";
pub const CORRECT_LIGHT_PROMPT: &str = "good lighting, well-lit, balanced light, studio lighting";

const DENOISE_PROMPT: &str = "denoised, clean, sharp, high quality photo, dslr, 8k";
const DENOISE_NEGATIVE_PROMPT: &str = "noise, noisy, grainy, blurry, soft";
const SHARPEN_PROMPT: &str = "sharp, focused, clear, detailed, high contrast, professional photograph";
const SHARPEN_NEGATIVE_PROMPT: &str = "blurry, out of focus, soft, hazy";
const SUPER_RESOLUTION_STRENGTH: f64 = 0.2;
const COLORIZE_STRENGTH: f64 = 0.9;
const CORRECT_LIGHT_STRENGTH: f64 = 0.45;

/// Structure hint a ControlNet is conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ControlType {
    #[strum(to_string = "canny")]
    Canny,
    #[strum(to_string = "softedge")]
    SoftEdge,
}

impl ControlType {
    /// ControlNet repository trained on this hint.
    pub fn model_id<'a>(&self, models: &'a ModelConfig) -> &'a str {
        match self {
            ControlType::Canny => &models.controlnet_canny,
            ControlType::SoftEdge => &models.controlnet_softedge,
        }
    }
}

impl FromStr for ControlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "canny" => Ok(ControlType::Canny),
            "softedge" | "soft_edge" => Ok(ControlType::SoftEdge),
            _ => Err(Error::UnsupportedControl(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Enhancement {
    cache: SharedCache,
    models: ModelConfig,
}

impl Enhancement {
    pub(crate) fn new(cache: SharedCache, models: ModelConfig) -> Self {
        Self { cache, models }
    }

    async fn enhance(
        &self,
        image: &DynamicImage,
        control: ControlType,
        params: Img2ImgParams,
    ) -> Result<DynamicImage> {
        run_controlled_img2img(&self.cache, &self.models, image, control, &params).await
    }

    /// Regenerates texture under a soft-edge hint so structure survives.
    pub async fn denoise(&self, image: &DynamicImage, strength: f64) -> Result<DynamicImage> {
        let params =
            Img2ImgParams::new(DENOISE_PROMPT, strength).negative_prompt(DENOISE_NEGATIVE_PROMPT);
        self.enhance(image, ControlType::SoftEdge, params).await
    }

    /// Reinforces edges under a Canny hint.
    pub async fn sharpen(&self, image: &DynamicImage, strength: f64) -> Result<DynamicImage> {
        let params =
            Img2ImgParams::new(SHARPEN_PROMPT, strength).negative_prompt(SHARPEN_NEGATIVE_PROMPT);
        self.enhance(image, ControlType::Canny, params).await
    }

    pub async fn deblur(&self, image: &DynamicImage, strength: f64) -> Result<DynamicImage> {
        self.sharpen(image, strength).await
    }

    /// Lanczos upscale followed by a light sharpen. There is no dedicated
    /// super-resolution network behind this.
    pub async fn super_resolution(&self, image: &DynamicImage, scale: u32) -> Result<DynamicImage> {
        if scale == 0 {
            return Err(Error::InvalidInput("scale must be at least 1".to_string()));
        }
        warn!("super resolution is simulated by upscaling and sharpening");

        let (w, h) = image.dimensions();
        let Some((new_w, new_h)) = w
            .checked_mul(scale)
            .zip(h.checked_mul(scale))
            .filter(|&(new_w, new_h)| new_w.max(new_h) <= MAX_CANVAS_SIDE)
        else {
            return Err(Error::InvalidInput(format!(
                "{w}x{h} upscaled {scale}x exceeds {MAX_CANVAS_SIDE} pixels per side"
            )));
        };
        let upscaled = image.resize_exact(new_w, new_h, FilterType::Lanczos3);
        info!(from = ?(w, h), to = ?upscaled.dimensions(), "upscaled");
        self.sharpen(&upscaled, SUPER_RESOLUTION_STRENGTH).await
    }

    pub async fn colorize(&self, image: &DynamicImage, prompt: &str) -> Result<DynamicImage> {
        let gray = DynamicImage::ImageLuma8(image.to_luma8());
        let gray = DynamicImage::ImageRgb8(gray.to_rgb8());
        let params = Img2ImgParams::new(prompt, COLORIZE_STRENGTH);
        self.enhance(&gray, ControlType::Canny, params).await
    }

    pub async fn correct_light(&self, image: &DynamicImage, prompt: &str) -> Result<DynamicImage> {
        let params = Img2ImgParams::new(prompt, CORRECT_LIGHT_STRENGTH);
        self.enhance(image, ControlType::SoftEdge, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_types_parse_by_name() -> anyhow::Result<()> {
        assert_eq!("canny".parse::<ControlType>()?, ControlType::Canny);
        assert_eq!("SoftEdge".parse::<ControlType>()?, ControlType::SoftEdge);
        assert_eq!("soft_edge".parse::<ControlType>()?, ControlType::SoftEdge);
        assert_eq!(ControlType::SoftEdge.to_string(), "softedge");
        Ok(())
    }

    #[test]
    fn unknown_control_is_rejected() {
        let err = "depth".parse::<ControlType>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedControl(ref name) if name == "depth"));
    }

    #[test]
    fn control_types_map_to_configured_models() {
        let models = ModelConfig::default();
        assert_eq!(
            ControlType::Canny.model_id(&models),
            "lllyasviel/control_v11p_sd15_canny"
        );
        assert_eq!(
            ControlType::SoftEdge.model_id(&models),
            "lllyasviel/control_v11p_sd15_softedge"
        );
    }
}

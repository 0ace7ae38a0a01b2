use std::path::{Path, PathBuf};

use retouch_ml::Device;
use retouch_ml::segment_anything::SamVariant;
use retouch_ml::stable_diffusion::{controlnet, img2img, inpaint};
use serde::{Deserialize, Serialize};

use crate::result::Result;

/// Construction-time settings, usually read from a TOML file.
///
/// ```toml
/// device = "cuda:0"
/// cache_dir = "/data/models"
///
/// [models]
/// sam_variant = "vit_b"
/// use_f16 = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Detected at startup when absent.
    pub device: Option<Device>,
    pub cache_dir: Option<PathBuf>,
    pub models: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub inpaint: String,
    pub controlnet_base: String,
    pub controlnet_canny: String,
    pub controlnet_softedge: String,
    pub sam_variant: SamVariant,
    pub use_f16: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            inpaint: inpaint::DEFAULT_MODEL.to_string(),
            controlnet_base: img2img::DEFAULT_BASE_MODEL.to_string(),
            controlnet_canny: controlnet::CANNY.to_string(),
            controlnet_softedge: controlnet::SOFT_EDGE.to_string(),
            sam_variant: SamVariant::default(),
            use_f16: true,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }
}

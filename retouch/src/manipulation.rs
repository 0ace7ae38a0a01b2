//! Object-level edits: inpainting, removal, insertion and repositioning.

use image::{DynamicImage, GrayImage};
use retouch_ml::stable_diffusion::InpaintParams;
use tracing::info;

use crate::SharedCache;
use crate::config::ModelConfig;
use crate::image::BoundingBox;
use crate::pipelines::{run_inpaint, run_segmentation};
use crate::result::{Error, Result};

pub const REMOVE_PROMPT: &str = "photorealistic background, no objects";

/// Region to edit: an explicit mask, or a box refined into a precise mask
/// by segmentation.
#[derive(Debug, Clone)]
pub enum MaskInput {
    Image(GrayImage),
    Box(BoundingBox),
}

impl From<GrayImage> for MaskInput {
    fn from(mask: GrayImage) -> Self {
        MaskInput::Image(mask)
    }
}

impl From<BoundingBox> for MaskInput {
    fn from(bbox: BoundingBox) -> Self {
        MaskInput::Box(bbox)
    }
}

#[derive(Debug, Clone)]
pub struct Manipulation {
    cache: SharedCache,
    models: ModelConfig,
}

impl Manipulation {
    pub(crate) fn new(cache: SharedCache, models: ModelConfig) -> Self {
        Self { cache, models }
    }

    pub async fn mask(&self, image: &DynamicImage, input: &MaskInput) -> Result<GrayImage> {
        match input {
            MaskInput::Image(mask) => Ok(mask.clone()),
            MaskInput::Box(bbox) if bbox.is_empty() => Err(Error::InvalidInput(format!(
                "bounding box {bbox:?} has no area"
            ))),
            MaskInput::Box(bbox) => {
                run_segmentation(&self.cache, &self.models, image, Some(*bbox), &[]).await
            }
        }
    }

    pub async fn inpaint(
        &self,
        image: &DynamicImage,
        mask: &MaskInput,
        prompt: &str,
    ) -> Result<DynamicImage> {
        let mask = self.mask(image, mask).await?;
        run_inpaint(
            &self.cache,
            &self.models,
            image,
            &mask,
            &InpaintParams::new(prompt),
        )
        .await
    }

    /// Fills the masked object with background described by `prompt`.
    pub async fn remove_object(
        &self,
        image: &DynamicImage,
        mask: &MaskInput,
        prompt: &str,
    ) -> Result<DynamicImage> {
        self.inpaint(image, mask, prompt).await
    }

    pub async fn add_object(
        &self,
        image: &DynamicImage,
        mask: &MaskInput,
        prompt: &str,
    ) -> Result<DynamicImage> {
        self.inpaint(image, mask, prompt).await
    }

    /// Removes the object at `source`, then paints `object_prompt` at
    /// `destination`.
    pub async fn reposition_object(
        &self,
        image: &DynamicImage,
        source: &MaskInput,
        destination: &MaskInput,
        object_prompt: &str,
    ) -> Result<DynamicImage> {
        info!("removing object from source region");
        let removed = self.remove_object(image, source, REMOVE_PROMPT).await?;

        info!("adding object at destination region");
        self.add_object(&removed, destination, object_prompt).await
    }
}

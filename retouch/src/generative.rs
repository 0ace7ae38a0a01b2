//! Generation of new content: background replacement and generative zoom.

use image::{DynamicImage, GenericImageView};
use retouch_ml::stable_diffusion::InpaintParams;
use tracing::info;

use crate::SharedCache;
use crate::config::ModelConfig;
use crate::image::invert_mask;
use crate::manipulation::{Manipulation, MaskInput};
use crate::pipelines::{generative_zoom_step, run_inpaint, zoom_size};
use crate::result::Result;

pub const ZOOM_FRAMES: usize = 10;
pub const ZOOM_FACTOR: f64 = 1.15;
pub const ZOOM_STEPS: usize = 25;

#[derive(Debug, Clone)]
pub struct Generative {
    cache: SharedCache,
    models: ModelConfig,
    manipulation: Manipulation,
}

impl Generative {
    pub(crate) fn new(cache: SharedCache, models: ModelConfig) -> Self {
        let manipulation = Manipulation::new(cache.clone(), models.clone());
        Self {
            cache,
            models,
            manipulation,
        }
    }

    /// Keeps the foreground and regenerates everything else from `prompt`.
    pub async fn generate_background(
        &self,
        image: &DynamicImage,
        foreground: &MaskInput,
        prompt: &str,
    ) -> Result<DynamicImage> {
        let foreground = self.manipulation.mask(image, foreground).await?;
        let background = invert_mask(&foreground);
        run_inpaint(
            &self.cache,
            &self.models,
            image,
            &background,
            &InpaintParams::new(prompt),
        )
        .await
    }

    /// `frames + 1` images starting with `image`, each outpainted from the
    /// previous one.
    pub async fn generative_zoom(
        &self,
        image: &DynamicImage,
        prompt: &str,
        frames: usize,
        zoom_factor: f64,
    ) -> Result<Vec<DynamicImage>> {
        let (width, height) = image.dimensions();
        zoom_size(width, height, zoom_factor)?;

        let mut sequence = Vec::with_capacity(frames + 1);
        sequence.push(image.clone());
        for frame in 1..=frames {
            info!(frame, frames, "generating zoom frame");
            let previous = &sequence[frame - 1];
            let next = generative_zoom_step(
                &self.cache,
                &self.models,
                previous,
                prompt,
                zoom_factor,
                ZOOM_STEPS,
            )
            .await?;
            sequence.push(next);
        }
        Ok(sequence)
    }
}

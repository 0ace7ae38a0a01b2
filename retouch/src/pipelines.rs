//! Stateless operations composing the cached models into image edits.
//!
//! Each function keeps the cache guard until its inference returns, so a
//! device switch never lands between two models of one run.

use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use retouch_ml::edges::{self, CANNY_HIGH_THRESHOLD, CANNY_LOW_THRESHOLD};
use retouch_ml::hed::HedDetector;
use retouch_ml::segment_anything::SamPredictor;
use retouch_ml::stable_diffusion::{
    ControlNetModel, ControlNetPipeline, Img2ImgParams, InpaintParams, StableDiffusionInpaint,
};
use retouch_ml::{Handle, ModelCache, ModelKey};
use tracing::instrument;

use crate::SharedCache;
use crate::config::ModelConfig;
use crate::enhancement::ControlType;
use crate::image::{BoundingBox, MASK_OFF, MASK_ON, MAX_CANVAS_SIDE, Point};
use crate::result::{Error, Result};

pub const HED_ANNOTATOR: &str = "hed_annotator";

/// Binary mask (255 on the object) of the object selected by either `bbox`
/// or `points`, the size of `image`.
#[instrument(level = "info", skip(cache, models, image))]
pub async fn run_segmentation(
    cache: &SharedCache,
    models: &ModelConfig,
    image: &DynamicImage,
    bbox: Option<BoundingBox>,
    points: &[Point],
) -> Result<GrayImage> {
    match (bbox, points.is_empty()) {
        (None, true) => {
            return Err(Error::InvalidInput(
                "segmentation needs a bounding box or a point set".to_string(),
            ));
        }
        (Some(_), false) => {
            return Err(Error::InvalidInput(
                "segmentation takes a bounding box or a point set, not both".to_string(),
            ));
        }
        _ => {}
    }

    let variant = models.sam_variant;
    let mut cache = cache.lock().await;
    let predictor = cache
        .get(
            ModelKey::named(variant.cache_name()),
            variant,
            SamPredictor::load,
        )
        .await
        .require()?;

    let mask = predictor.read()?.inference(image, bbox, points)?;
    Ok(mask)
}

/// Regenerates the white part of `mask` and keeps the rest of `image`.
#[instrument(level = "info", skip(cache, models, image, mask))]
pub async fn run_inpaint(
    cache: &SharedCache,
    models: &ModelConfig,
    image: &DynamicImage,
    mask: &GrayImage,
    params: &InpaintParams,
) -> Result<DynamicImage> {
    if image.dimensions() != mask.dimensions() {
        return Err(Error::DimensionMismatch {
            image: image.dimensions(),
            mask: mask.dimensions(),
        });
    }

    let mut cache = cache.lock().await;
    let model = inpaint_model(&mut cache, models).await?;
    let output = model.read()?.inference(image, mask, params)?;
    Ok(output)
}

async fn inpaint_model(
    cache: &mut ModelCache,
    models: &ModelConfig,
) -> Result<Handle<StableDiffusionInpaint>> {
    let config = (models.inpaint.clone(), models.use_f16);
    let handle = cache
        .get(
            ModelKey::single(&models.inpaint),
            config,
            |(model_id, use_f16), device| async move {
                StableDiffusionInpaint::load(&model_id, use_f16, device).await
            },
        )
        .await
        .require()?;
    Ok(handle)
}

/// Canvas size of one zoom step over a `width` x `height` frame. The factor
/// must be finite, above 1, add at least one border pixel and keep both
/// sides within `MAX_CANVAS_SIDE`.
pub fn zoom_size(width: u32, height: u32, zoom_factor: f64) -> Result<(u32, u32)> {
    if !zoom_factor.is_finite() || zoom_factor <= 1.0 {
        return Err(Error::InvalidZoomFactor(zoom_factor));
    }

    let scale = |side: u32| {
        let scaled = (side as f64 * zoom_factor).floor();
        (scaled <= MAX_CANVAS_SIDE as f64).then_some(scaled as u32)
    };
    match (scale(width), scale(height)) {
        (Some(w), Some(h)) if (w, h) != (width, height) => Ok((w, h)),
        _ => Err(Error::InvalidZoomFactor(zoom_factor)),
    }
}

/// Canvas `zoom_factor` times larger than `image` with the frame pasted in
/// the centre, and the outpainting mask that is white only on the new border.
pub fn zoom_canvas(image: &DynamicImage, zoom_factor: f64) -> Result<(DynamicImage, GrayImage)> {
    let (w, h) = image.dimensions();
    let (new_w, new_h) = zoom_size(w, h, zoom_factor)?;
    let (x, y) = ((new_w - w) / 2, (new_h - h) / 2);

    let mut canvas = RgbImage::new(new_w, new_h);
    image::imageops::replace(&mut canvas, &image.to_rgb8(), x as i64, y as i64);

    let mut mask = GrayImage::from_pixel(new_w, new_h, Luma([MASK_ON]));
    image::imageops::replace(
        &mut mask,
        &GrayImage::from_pixel(w, h, Luma([MASK_OFF])),
        x as i64,
        y as i64,
    );

    Ok((DynamicImage::ImageRgb8(canvas), mask))
}

/// One outpainting step of a generative zoom: widens the frame by
/// `zoom_factor` and fills the new border from `prompt`.
#[instrument(level = "info", skip(cache, models, image))]
pub async fn generative_zoom_step(
    cache: &SharedCache,
    models: &ModelConfig,
    image: &DynamicImage,
    prompt: &str,
    zoom_factor: f64,
    steps: usize,
) -> Result<DynamicImage> {
    let (canvas, mask) = zoom_canvas(image, zoom_factor)?;
    let params = InpaintParams {
        steps,
        ..InpaintParams::new(prompt)
    };
    run_inpaint(cache, models, &canvas, &mask, &params).await
}

/// Image-to-image guided by the ControlNet matching `control`, with the
/// control image computed from `image` by the matching preprocessor.
#[instrument(level = "info", skip(cache, models, image, params), fields(strength = params.strength))]
pub async fn run_controlled_img2img(
    cache: &SharedCache,
    models: &ModelConfig,
    image: &DynamicImage,
    control: ControlType,
    params: &Img2ImgParams,
) -> Result<DynamicImage> {
    let mut cache = cache.lock().await;
    let pipeline = controlnet_pipeline(&mut cache, models, control).await?;
    let hint = control_image(&mut cache, image, control).await?;
    let output = pipeline.read()?.inference(image, &hint, params)?;
    Ok(output)
}

async fn controlnet_pipeline(
    cache: &mut ModelCache,
    models: &ModelConfig,
    control: ControlType,
) -> Result<Handle<ControlNetPipeline>> {
    let controlnet_id = control.model_id(models).to_string();
    let base_id = models.controlnet_base.clone();
    let use_f16 = models.use_f16;

    let handle = cache
        .get_compound(
            ModelKey::compound(&base_id, &controlnet_id),
            ModelKey::single(&controlnet_id),
            (controlnet_id.clone(), use_f16),
            |(repo, use_f16), device| async move {
                ControlNetModel::load(&repo, use_f16, device).await
            },
            move |controlnet, device| async move {
                ControlNetPipeline::load(&base_id, controlnet, use_f16, device).await
            },
        )
        .await
        .require()?;
    Ok(handle)
}

async fn control_image(
    cache: &mut ModelCache,
    image: &DynamicImage,
    control: ControlType,
) -> Result<RgbImage> {
    match control {
        ControlType::Canny => Ok(edges::canny(
            image,
            CANNY_LOW_THRESHOLD,
            CANNY_HIGH_THRESHOLD,
        )),
        ControlType::SoftEdge => {
            let detector = cache
                .get(ModelKey::named(HED_ANNOTATOR), (), |(), device| {
                    HedDetector::load(device)
                })
                .await
                .require()?;
            let hint = detector.read()?.inference(image)?;
            Ok(hint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_canvas_centres_the_frame() -> anyhow::Result<()> {
        let frame = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, image::Rgb([9, 9, 9])));
        let (canvas, mask) = zoom_canvas(&frame, 2.0)?;

        assert_eq!(canvas.dimensions(), (8, 4));
        assert_eq!(mask.dimensions(), (8, 4));
        let canvas = canvas.to_rgb8();
        for (x, y, p) in mask.enumerate_pixels() {
            let inside = (2..6).contains(&x) && (1..3).contains(&y);
            assert_eq!(p.0[0] == MASK_OFF, inside);
            assert_eq!(canvas.get_pixel(x, y).0 == [9, 9, 9], inside);
        }
        Ok(())
    }

    #[test]
    fn zoom_size_rejects_degenerate_and_oversized_canvases() {
        assert_eq!(zoom_size(512, 512, 1.002).ok(), Some((513, 513)));
        assert_eq!(zoom_size(512, 256, 1.15).ok(), Some((588, 294)));
        for factor in [1.001, 1e10, f64::MAX] {
            assert!(
                matches!(zoom_size(512, 512, factor), Err(Error::InvalidZoomFactor(f)) if f == factor),
                "{factor}"
            );
        }
        assert!(zoom_size(MAX_CANVAS_SIDE, 16, 1.5).is_err());
    }

    #[test]
    fn zoom_factor_must_enlarge() {
        let frame = DynamicImage::new_rgb8(4, 4);
        for factor in [1.0, 0.5, -2.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                zoom_canvas(&frame, factor),
                Err(Error::InvalidZoomFactor(_))
            ));
        }
    }
}

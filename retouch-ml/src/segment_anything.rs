use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::segment_anything::sam::{IMAGE_SIZE, Sam};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, imageops::FilterType};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumProperty, EnumString};
use tracing::instrument;

use crate::cache::Movable;
use crate::loading;

const CHECKPOINT_URL: &str = "https://dl.fbaipublicfiles.com/segment_anything";
const CHECKPOINT_DIR: &str = "sam_models";

/// Axis-aligned box in pixel coordinates, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 + self.x2) as f64 / 2.,
            (self.y1 + self.y2) as f64 / 2.,
        )
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.x1..self.x2).contains(&x) && (self.y1..self.y2).contains(&y)
    }

    /// Clamps the box to an image of `width` x `height`.
    pub fn clamp(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.x1.min(width),
            self.y1.min(height),
            self.x2.min(width),
            self.y2.min(height),
        )
    }
}

/// A click prompt; `positive` marks the object, otherwise background.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub positive: bool,
}

impl Point {
    pub fn positive(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            positive: true,
        }
    }

    pub fn negative(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            positive: false,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    EnumProperty,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum SamVariant {
    #[default]
    #[strum(props(checkpoint = "sam_vit_h_4b8939.pth"))]
    VitH,
    #[strum(props(checkpoint = "sam_vit_l_0b3195.pth"))]
    VitL,
    #[strum(props(checkpoint = "sam_vit_b_01ec64.pth"))]
    VitB,
}

impl SamVariant {
    pub fn checkpoint(&self) -> &'static str {
        self.get_str("checkpoint").expect("checkpoint property")
    }

    pub fn url(&self) -> String {
        format!("{CHECKPOINT_URL}/{}", self.checkpoint())
    }

    /// Name the predictor is cached under.
    pub fn cache_name(&self) -> String {
        format!("sam_predictor_{self}")
    }

    /// `(embed dim, depth, heads, global attention layers)` of the image encoder.
    fn encoder(&self) -> (usize, usize, usize, &'static [usize]) {
        match self {
            SamVariant::VitH => (1280, 32, 16, &[7, 15, 23, 31]),
            SamVariant::VitL => (1024, 24, 16, &[5, 11, 17, 23]),
            SamVariant::VitB => (768, 12, 12, &[2, 5, 8, 11]),
        }
    }
}

/// Segment Anything predictor producing one binary mask per prompt set.
pub struct SamPredictor {
    variant: SamVariant,
    checkpoint: PathBuf,
    model: Sam,
    device: Device,
}

impl SamPredictor {
    pub async fn load(variant: SamVariant, device: Device) -> Result<Self> {
        let checkpoint = retouch_core::checkpoint(&variant.url(), CHECKPOINT_DIR).await?;
        let model = Self::build(variant, &checkpoint, &device)?;
        Ok(Self {
            variant,
            checkpoint,
            model,
            device,
        })
    }

    fn build(variant: SamVariant, checkpoint: &PathBuf, device: &Device) -> Result<Sam> {
        let vb = loading::pth(checkpoint, DType::F32, device)?;
        let (embed_dim, depth, heads, global_attn) = variant.encoder();
        Sam::new(embed_dim, depth, heads, global_attn, vb)
            .with_context(|| format!("failed to build SAM {variant}"))
    }

    pub fn variant(&self) -> SamVariant {
        self.variant
    }

    /// Returns a mask of the image's size, 255 on the selected object.
    ///
    /// A box prompt becomes a positive click on its centre and the mask is
    /// clipped to the box.
    #[instrument(level = "debug", skip(self, image))]
    pub fn inference(
        &self,
        image: &DynamicImage,
        bbox: Option<BoundingBox>,
        points: &[Point],
    ) -> Result<GrayImage> {
        let (width, height) = image.dimensions();
        let bbox = bbox.map(|b| b.clamp(width, height));
        if bbox.is_some_and(|b| b.is_empty()) {
            bail!("bounding box is empty after clamping to {width}x{height}");
        }

        let mut prompts = points
            .iter()
            .map(|p| (p.x / width as f64, p.y / height as f64, p.positive))
            .collect::<Vec<_>>();
        if let Some(b) = bbox {
            let (cx, cy) = b.center();
            prompts.push((cx / width as f64, cy / height as f64, true));
        }
        if prompts.is_empty() {
            bail!("segmentation needs a bounding box or at least one point");
        }

        let resized = fit_longest_side(image);
        let (rw, rh) = resized.dimensions();
        let pixels = Tensor::from_vec(
            resized.to_rgb8().into_raw(),
            (rh as usize, rw as usize, 3),
            &self.device,
        )?
        .permute((2, 0, 1))?;

        let (logits, iou) = self.model.forward(&pixels, &prompts, false)?;
        let iou = iou.flatten_all()?.to_vec1::<f32>()?;
        tracing::debug!(?iou, "mask predicted");

        let mask = (logits.ge(0f32)?.to_dtype(DType::F32)? * 255.)?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_device(&Device::Cpu)?
            .to_vec1::<u8>()?;
        let (_, mh, mw) = logits.dims3()?;
        let mask = GrayImage::from_raw(mw as u32, mh as u32, mask)
            .context("failed to create mask buffer from SAM output")?;
        let mut mask = if (mw as u32, mh as u32) == (width, height) {
            mask
        } else {
            image::imageops::resize(&mask, width, height, FilterType::Nearest)
        };

        if let Some(b) = bbox
            && clip_to_box(&mut mask, b) == 0
        {
            tracing::warn!(
                bbox = ?b,
                "mask is empty inside the box, its centre may miss the object; try point prompts"
            );
        }
        Ok(mask)
    }
}

impl Movable for SamPredictor {
    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.model = Self::build(self.variant, &self.checkpoint, device)?;
        self.device = device.clone();
        Ok(())
    }
}

/// Zeroes `mask` outside `bbox`, returning how many pixels remain set.
fn clip_to_box(mask: &mut GrayImage, bbox: BoundingBox) -> usize {
    let mut kept = 0;
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        if !bbox.contains(x, y) {
            *pixel = Luma([0]);
        } else if pixel.0[0] > 0 {
            kept += 1;
        }
    }
    kept
}

/// SAM encodes at most `IMAGE_SIZE` pixels per side.
fn fit_longest_side(image: &DynamicImage) -> DynamicImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height) as usize;
    if longest <= IMAGE_SIZE {
        return image.clone();
    }
    let scale = IMAGE_SIZE as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, IMAGE_SIZE as u32);
    let h = ((height as f64 * scale).round() as u32).clamp(1, IMAGE_SIZE as u32);
    image.resize_exact(w, h, FilterType::CatmullRom)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use image::RgbImage;

    use super::*;

    #[test]
    fn variants_parse_and_name_their_cache_entry() -> Result<()> {
        assert_eq!(SamVariant::from_str("vit_h")?, SamVariant::VitH);
        assert_eq!(SamVariant::from_str("VIT_B")?, SamVariant::VitB);
        assert!(SamVariant::from_str("vit_x").is_err());
        assert_eq!(SamVariant::default().cache_name(), "sam_predictor_vit_h");
        assert_eq!(
            SamVariant::VitL.url(),
            "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_l_0b3195.pth"
        );
        Ok(())
    }

    #[test]
    fn bounding_box_is_normalized_and_clamped() {
        let b = BoundingBox::new(50, 40, 10, 20).clamp(30, 100);
        assert_eq!(b, BoundingBox::new(10, 20, 30, 40));
        assert_eq!((b.width(), b.height()), (20, 20));
        assert!(b.contains(10, 20));
        assert!(!b.contains(30, 20));
        assert_eq!(b.center(), (20., 30.));
    }

    #[test]
    fn masks_are_clipped_to_the_box() {
        let mut mask = GrayImage::from_pixel(8, 8, Luma([255]));
        let kept = clip_to_box(&mut mask, BoundingBox::new(2, 2, 5, 4));
        assert_eq!(kept, 6);
        assert_eq!(mask.get_pixel(1, 2).0, [0]);
        assert_eq!(mask.get_pixel(4, 3).0, [255]);

        let mut ring = GrayImage::new(8, 8);
        ring.put_pixel(0, 0, Luma([255]));
        assert_eq!(clip_to_box(&mut ring, BoundingBox::new(2, 2, 6, 6)), 0);
        assert!(ring.pixels().all(|p| p.0 == [0]));
    }

    #[test]
    fn large_images_are_fitted_to_encoder_size() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(2048, 512));
        assert_eq!(fit_longest_side(&image).dimensions(), (1024, 256));

        let small = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        assert_eq!(fit_longest_side(&small).dimensions(), (640, 480));
    }
}

use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};

pub use retouch_ml::segment_anything::{BoundingBox, Point};

/// Pixel value marking a region to regenerate.
pub const MASK_ON: u8 = 255;
pub const MASK_OFF: u8 = 0;
/// Largest side of any canvas this crate allocates.
pub const MAX_CANVAS_SIDE: u32 = 16384;
const MASK_THRESHOLD: u8 = 128;
const OVERLAY: Rgba<u8> = Rgba([255, 0, 0, 128]);

/// Mask of `width` x `height` that is white exactly inside `bbox`.
pub fn mask_from_box(width: u32, height: u32, bbox: BoundingBox) -> GrayImage {
    let bbox = bbox.clamp(width, height);
    GrayImage::from_fn(width, height, |x, y| {
        if bbox.contains(x, y) {
            Luma([MASK_ON])
        } else {
            Luma([MASK_OFF])
        }
    })
}

pub fn invert_mask(mask: &GrayImage) -> GrayImage {
    let mut inverted = mask.clone();
    image::imageops::invert(&mut inverted);
    inverted
}

/// Snaps every pixel to `MASK_ON` or `MASK_OFF` at half intensity.
pub fn binarize(mask: &GrayImage) -> GrayImage {
    imageproc::map::map_colors(mask, |Luma([v])| {
        Luma([if v >= MASK_THRESHOLD { MASK_ON } else { MASK_OFF }])
    })
}

/// Paints the masked region of `image` with a semi-transparent red.
pub fn overlay_mask(image: &DynamicImage, mask: &GrayImage) -> RgbaImage {
    let mut base = image.to_rgba8();
    let mask = if mask.dimensions() == base.dimensions() {
        mask.clone()
    } else {
        image::imageops::resize(
            mask,
            base.width(),
            base.height(),
            image::imageops::FilterType::Nearest,
        )
    };
    for (pixel, m) in base.pixels_mut().zip(mask.pixels()) {
        if m.0[0] >= MASK_THRESHOLD {
            blend(pixel, OVERLAY);
        }
    }
    base
}

/// Source-over compositing of `top` onto `bottom`.
fn blend(bottom: &mut Rgba<u8>, top: Rgba<u8>) {
    let ta = top.0[3] as f32 / 255.;
    let ba = bottom.0[3] as f32 / 255.;
    let out_a = ta + ba * (1. - ta);
    if out_a <= 0. {
        *bottom = Rgba([0, 0, 0, 0]);
        return;
    }
    for c in 0..3 {
        let value = (top.0[c] as f32 * ta + bottom.0[c] as f32 * ba * (1. - ta)) / out_a;
        bottom.0[c] = value.round().clamp(0., 255.) as u8;
    }
    bottom.0[3] = (out_a * 255.).round() as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_mask_marks_exactly_the_box() {
        let mask = mask_from_box(8, 6, BoundingBox::new(2, 1, 5, 4));
        for (x, y, p) in mask.enumerate_pixels() {
            let inside = (2..5).contains(&x) && (1..4).contains(&y);
            assert_eq!(p.0[0] == MASK_ON, inside, "pixel ({x}, {y})");
        }
    }

    #[test]
    fn box_past_the_edge_is_clamped() {
        let mask = mask_from_box(4, 4, BoundingBox::new(2, 2, 10, 10));
        assert_eq!(mask.pixels().filter(|p| p.0[0] == MASK_ON).count(), 4);
    }

    #[test]
    fn inverting_twice_is_identity() {
        let mask = GrayImage::from_fn(5, 5, |x, y| Luma([(x * 40 + y * 7) as u8]));
        assert_eq!(invert_mask(&invert_mask(&mask)), mask);
        assert_eq!(invert_mask(&mask).get_pixel(0, 0).0, [255]);
    }

    #[test]
    fn binarize_splits_at_half() {
        let mask = GrayImage::from_fn(4, 1, |x, _| Luma([[0, 127, 128, 200][x as usize]]));
        let raw = binarize(&mask).into_raw();
        assert_eq!(raw, vec![0, 0, 255, 255]);
    }

    #[test]
    fn overlay_tints_only_the_mask() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(2, 1, image::Rgb([0, 0, 255])));
        let mask = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 255 } else { 0 }]));
        let overlay = overlay_mask(&image, &mask);
        assert_eq!(overlay.get_pixel(0, 0).0, [128, 0, 127, 255]);
        assert_eq!(overlay.get_pixel(1, 0).0, [0, 0, 255, 255]);
    }
}

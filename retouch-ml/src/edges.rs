use image::{DynamicImage, GrayImage, RgbImage};
use tracing::instrument;

pub const CANNY_LOW_THRESHOLD: f32 = 100.;
pub const CANNY_HIGH_THRESHOLD: f32 = 200.;

/// Canny edge map of `image` as a three-channel control image, white on black.
#[instrument(level = "debug", skip(image))]
pub fn canny(image: &DynamicImage, low_threshold: f32, high_threshold: f32) -> RgbImage {
    let edges = canny_gray(&image.to_luma8(), low_threshold, high_threshold);
    DynamicImage::ImageLuma8(edges).to_rgb8()
}

pub fn canny_gray(gray: &GrayImage, low_threshold: f32, high_threshold: f32) -> GrayImage {
    imageproc::edges::canny(gray, low_threshold, high_threshold)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    fn step_image() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(32, 32, |x, _| {
            if x < 16 { Luma([0]) } else { Luma([255]) }
        }))
    }

    #[test]
    fn finds_a_vertical_step() {
        let edges = canny(&step_image(), CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD);
        assert_eq!(edges.dimensions(), (32, 32));

        let columns = (0..32)
            .filter(|&x| edges.get_pixel(x, 16).0 == [255, 255, 255])
            .collect::<Vec<_>>();
        assert!(!columns.is_empty());
        assert!(columns.iter().all(|&x| (14..=17).contains(&x)));
    }

    #[test]
    fn flat_image_has_no_edges() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([128])));
        let edges = canny(&flat, CANNY_LOW_THRESHOLD, CANNY_HIGH_THRESHOLD);
        assert!(edges.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}

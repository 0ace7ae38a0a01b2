use image::{DynamicImage, Rgb, RgbImage};

/// A grey backdrop with a saturated square in the middle.
pub fn square_on_backdrop(width: u32, height: u32) -> DynamicImage {
    let (x0, y0) = (width / 4, height / 4);
    let (x1, y1) = (width * 3 / 4, height * 3 / 4);
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            Rgb([220, 30, 40])
        } else {
            Rgb([128, 128, 128])
        }
    }))
}

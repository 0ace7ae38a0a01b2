//! Before/after inspection helpers.

use image::{
    DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage, imageops::FilterType,
};
use imageproc::drawing::draw_line_segment_mut;
use rayon::prelude::*;

const GAP: u32 = 16;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const CHANNEL_COLORS: [Rgb<u8>; 3] = [
    Rgb([220, 40, 40]),
    Rgb([40, 160, 40]),
    Rgb([40, 40, 220]),
];

const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.;

/// `before` and `after` side by side on a white canvas, `after` scaled to the
/// height of `before`.
pub fn compare(before: &DynamicImage, after: &DynamicImage) -> RgbImage {
    let (bw, bh) = before.dimensions();
    let after = if after.height() == bh {
        after.to_rgb8()
    } else {
        let aw = (after.width() as f64 * bh as f64 / after.height().max(1) as f64).round() as u32;
        after
            .resize_exact(aw.max(1), bh, FilterType::Lanczos3)
            .to_rgb8()
    };

    let mut canvas = RgbImage::from_pixel(bw + GAP + after.width(), bh, BACKGROUND);
    image::imageops::replace(&mut canvas, &before.to_rgb8(), 0, 0);
    image::imageops::replace(&mut canvas, &after, (bw + GAP) as i64, 0);
    canvas
}

/// Structural similarity between the luma of both images (`after` resized to
/// `before`), and the per-pixel similarity map scaled to 0..=255.
///
/// Uses a 7x7 uniform window with sample covariance; the score is the mean
/// over pixels whose window lies fully inside the image.
pub fn difference_map(before: &DynamicImage, after: &DynamicImage) -> (f64, GrayImage) {
    let (width, height) = before.dimensions();
    let a = before.to_luma8();
    let b = if after.dimensions() == (width, height) {
        after.to_luma8()
    } else {
        after
            .resize_exact(width, height, FilterType::Lanczos3)
            .to_luma8()
    };

    let (w, h) = (width as usize, height as usize);
    let a = a.as_raw();
    let b = b.as_raw();
    let half = SSIM_WINDOW / 2;
    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = n / (n - 1.);
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);

    let reflect = |i: isize, len: usize| -> usize {
        let len = len as isize;
        let mut i = i;
        if i < 0 {
            i = -i - 1;
        }
        if i >= len {
            i = 2 * len - i - 1;
        }
        i.clamp(0, len - 1) as usize
    };

    let rows = (0..h)
        .into_par_iter()
        .map(|y| {
            (0..w)
                .map(|x| {
                    let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0., 0., 0., 0., 0.);
                    for dy in -(half as isize)..=half as isize {
                        let yy = reflect(y as isize + dy, h);
                        for dx in -(half as isize)..=half as isize {
                            let xx = reflect(x as isize + dx, w);
                            let va = a[yy * w + xx] as f64;
                            let vb = b[yy * w + xx] as f64;
                            sa += va;
                            sb += vb;
                            saa += va * va;
                            sbb += vb * vb;
                            sab += va * vb;
                        }
                    }
                    let (ma, mb) = (sa / n, sb / n);
                    let va = cov_norm * (saa / n - ma * ma);
                    let vb = cov_norm * (sbb / n - mb * mb);
                    let vab = cov_norm * (sab / n - ma * mb);
                    ((2. * ma * mb + c1) * (2. * vab + c2))
                        / ((ma * ma + mb * mb + c1) * (va + vb + c2))
                })
                .collect::<Vec<f64>>()
        })
        .collect::<Vec<_>>();

    let interior = |i: usize, len: usize| len <= 2 * half || (half..len - half).contains(&i);
    let (sum, count) = rows
        .iter()
        .enumerate()
        .filter(|(y, _)| interior(*y, h))
        .flat_map(|(_, row)| {
            row.iter()
                .enumerate()
                .filter(|(x, _)| interior(*x, w))
                .map(|(_, s)| *s)
        })
        .fold((0., 0usize), |(sum, count), s| (sum + s, count + 1));
    let score = if count == 0 { 1. } else { sum / count as f64 };

    let map = GrayImage::from_fn(width, height, |x, y| {
        let s = rows[y as usize][x as usize];
        Luma([(s * 255.).round().clamp(0., 255.) as u8])
    });
    (score, map)
}

/// Per-channel (R, G, B) intensity histograms.
pub type Histogram = [[u32; 256]; 3];

pub fn histogram(image: &DynamicImage) -> Histogram {
    let rgb = image.to_rgb8();
    let raw = rgb.as_raw();
    let channels = (0..3)
        .into_par_iter()
        .map(|c| {
            let mut bins = [0u32; 256];
            for value in raw.iter().skip(c).step_by(3) {
                bins[*value as usize] += 1;
            }
            bins
        })
        .collect::<Vec<_>>();
    [channels[0], channels[1], channels[2]]
}

/// Histograms of both images, `before` first.
pub fn histograms(before: &DynamicImage, after: &DynamicImage) -> (Histogram, Histogram) {
    rayon::join(|| histogram(before), || histogram(after))
}

/// Line plot of both histograms: `before` dashed, `after` solid, one color per
/// channel, on a shared vertical scale.
pub fn plot_histograms(
    before: &Histogram,
    after: &Histogram,
    width: u32,
    height: u32,
) -> RgbImage {
    let (width, height) = (width.max(2), height.max(2));
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);
    let peak = before
        .iter()
        .chain(after.iter())
        .flat_map(|bins| bins.iter())
        .copied()
        .max()
        .unwrap_or(0)
        .max(1) as f32;
    let x_of = |bin: usize| bin as f32 * (width - 1) as f32 / 255.;
    let y_of = |count: u32| (height - 1) as f32 * (1. - count as f32 / peak);

    for (channel, color) in CHANNEL_COLORS.iter().enumerate() {
        for bin in 1..256 {
            let start = (x_of(bin - 1), y_of(before[channel][bin - 1]));
            let end = (x_of(bin), y_of(before[channel][bin]));
            if bin % 4 < 2 {
                draw_line_segment_mut(&mut canvas, start, end, *color);
            }

            let start = (x_of(bin - 1), y_of(after[channel][bin - 1]));
            let end = (x_of(bin), y_of(after[channel][bin]));
            draw_line_segment_mut(&mut canvas, start, end, *color);
        }
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 8) as u8, (y * 8) as u8, ((x + y) * 4) as u8])
        }))
    }

    #[test]
    fn identical_images_are_fully_similar() {
        let image = gradient(24, 20);
        let (score, map) = difference_map(&image, &image);
        assert!((score - 1.0).abs() < 1e-9, "score was {score}");
        assert!(map.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn altered_image_scores_lower() {
        let image = gradient(24, 20);
        let mut altered = image.to_rgb8();
        for p in altered.pixels_mut().step_by(3) {
            p.0 = [255, 0, 255];
        }
        let (score, _) = difference_map(&image, &DynamicImage::ImageRgb8(altered));
        assert!(score < 0.9, "score was {score}");
    }

    #[test]
    fn compare_places_images_side_by_side() {
        let before = gradient(10, 8);
        let after = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 16, Rgb([1, 2, 3])));
        let canvas = compare(&before, &after);
        assert_eq!(canvas.dimensions(), (10 + GAP + 10, 8));
        assert_eq!(canvas.get_pixel(10, 0), &BACKGROUND);
        assert_eq!(canvas.get_pixel(10 + GAP, 0).0, [1, 2, 3]);
    }

    #[test]
    fn histogram_counts_every_pixel_per_channel() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([0, 128, 255])));
        let (before, after) = histograms(&image, &image);
        assert_eq!(before, after);
        assert_eq!(before[0][0], 16);
        assert_eq!(before[1][128], 16);
        assert_eq!(before[2][255], 16);
        assert_eq!(before.iter().map(|c| c.iter().sum::<u32>()).sum::<u32>(), 48);

        let plot = plot_histograms(&before, &after, 256, 100);
        assert_eq!(plot.dimensions(), (256, 100));
    }
}

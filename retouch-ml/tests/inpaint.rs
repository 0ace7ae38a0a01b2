mod common;

use candle_core::Device;
use image::{GenericImageView, GrayImage, Luma};
use retouch_ml::stable_diffusion::{InpaintParams, StableDiffusionInpaint, inpaint};

#[tokio::test]
#[ignore]
async fn inpainting_updates_masked_region() -> anyhow::Result<()> {
    let model = StableDiffusionInpaint::load(inpaint::DEFAULT_MODEL, false, Device::Cpu).await?;
    let base = common::square_on_backdrop(256, 192);
    let mask = GrayImage::from_fn(256, 192, |x, y| {
        if (64..192).contains(&x) && (48..144).contains(&y) {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let params = InpaintParams {
        steps: 4,
        seed: Some(42),
        ..InpaintParams::new("a wooden table")
    };
    let output = model.inference(&base, &mask, &params)?;
    assert_eq!(output.dimensions(), base.dimensions());

    let base = base.to_rgb8();
    let output = output.to_rgb8();
    let changed = mask
        .pixels()
        .zip(base.pixels())
        .zip(output.pixels())
        .any(|((m, b), o)| m.0[0] > 0 && b.0 != o.0);
    assert!(changed, "inpainting should change at least one masked pixel");
    Ok(())
}

#[tokio::test]
#[ignore]
async fn mismatched_mask_is_rejected() -> anyhow::Result<()> {
    let model = StableDiffusionInpaint::load(inpaint::DEFAULT_MODEL, false, Device::Cpu).await?;
    let base = common::square_on_backdrop(64, 64);
    let mask = GrayImage::new(32, 64);

    let err = model
        .inference(&base, &mask, &InpaintParams::default())
        .unwrap_err();
    assert!(err.to_string().contains("dimensions mismatch"));
    Ok(())
}

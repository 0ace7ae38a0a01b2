mod common;

use candle_core::Device;
use retouch_ml::segment_anything::{BoundingBox, Point, SamPredictor, SamVariant};

#[tokio::test]
#[ignore]
async fn box_prompt_selects_the_square() -> anyhow::Result<()> {
    let predictor = SamPredictor::load(SamVariant::VitB, Device::Cpu).await?;
    let image = common::square_on_backdrop(256, 256);

    let bbox = BoundingBox::new(56, 56, 200, 200);
    let mask = predictor.inference(&image, Some(bbox), &[])?;

    assert_eq!(mask.dimensions(), (256, 256));
    assert_eq!(mask.get_pixel(128, 128).0, [255]);
    // the mask never leaks outside the box
    assert_eq!(mask.get_pixel(10, 10).0, [0]);
    assert!(mask.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn point_prompt_selects_the_square() -> anyhow::Result<()> {
    let predictor = SamPredictor::load(SamVariant::VitB, Device::Cpu).await?;
    let image = common::square_on_backdrop(256, 256);

    let mask = predictor.inference(&image, None, &[Point::positive(128., 128.)])?;
    assert_eq!(mask.get_pixel(128, 128).0, [255]);
    Ok(())
}

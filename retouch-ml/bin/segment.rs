mod common;

use clap::Parser;
use retouch_ml::segment_anything::{BoundingBox, Point, SamPredictor, SamVariant};

#[derive(Parser)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    input: String,

    #[arg(short, long, value_name = "FILE")]
    output: String,

    /// Box prompt as `x1,y1,x2,y2`.
    #[arg(long, value_delimiter = ',', num_args = 4)]
    bbox: Option<Vec<u32>>,

    /// Positive click as `x,y`; repeatable.
    #[arg(long, value_delimiter = ',', num_args = 2)]
    point: Vec<f64>,

    #[arg(long, default_value_t = SamVariant::VitH)]
    variant: SamVariant,

    #[command(flatten)]
    device: common::DeviceArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing();
    let cli = Cli::parse();

    let bbox = cli
        .bbox
        .as_deref()
        .map(|b| BoundingBox::new(b[0], b[1], b[2], b[3]));
    let points = cli
        .point
        .chunks_exact(2)
        .map(|xy| Point::positive(xy[0], xy[1]))
        .collect::<Vec<_>>();

    let predictor = SamPredictor::load(cli.variant, cli.device.resolve()?).await?;
    let image = image::open(&cli.input)?;
    let mask = predictor.inference(&image, bbox, &points)?;
    mask.save(&cli.output)?;

    Ok(())
}

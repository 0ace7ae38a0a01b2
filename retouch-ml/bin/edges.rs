mod common;

use clap::{Parser, ValueEnum};
use retouch_ml::{edges, hed::HedDetector};

#[derive(Clone, Copy, ValueEnum)]
enum Detector {
    Canny,
    Hed,
}

#[derive(Parser)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    input: String,

    #[arg(short, long, value_name = "FILE")]
    output: String,

    #[arg(long, value_enum, default_value_t = Detector::Canny)]
    detector: Detector,

    #[arg(long, default_value_t = edges::CANNY_LOW_THRESHOLD)]
    low: f32,

    #[arg(long, default_value_t = edges::CANNY_HIGH_THRESHOLD)]
    high: f32,

    #[command(flatten)]
    device: common::DeviceArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing();
    let cli = Cli::parse();

    let image = image::open(&cli.input)?;
    let output = match cli.detector {
        Detector::Canny => edges::canny(&image, cli.low, cli.high),
        Detector::Hed => {
            let detector = HedDetector::load(cli.device.resolve()?).await?;
            detector.inference(&image)?
        }
    };
    output.save(&cli.output)?;

    Ok(())
}

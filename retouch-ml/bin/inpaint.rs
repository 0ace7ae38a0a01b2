mod common;

use clap::Parser;
use retouch_ml::stable_diffusion::{InpaintParams, StableDiffusionInpaint, inpaint};

#[derive(Parser)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    input: String,

    #[arg(short, long, value_name = "FILE")]
    mask: String,

    #[arg(short, long, value_name = "FILE")]
    output: String,

    #[arg(short, long)]
    prompt: String,

    #[arg(long, default_value = inpaint::DEFAULT_NEGATIVE_PROMPT)]
    negative_prompt: String,

    #[arg(long, default_value_t = 30)]
    steps: usize,

    #[arg(long, default_value_t = 1.0)]
    strength: f64,

    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = inpaint::DEFAULT_MODEL)]
    model: String,

    #[arg(long, default_value_t = false)]
    f16: bool,

    #[command(flatten)]
    device: common::DeviceArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common::init_tracing();
    let cli = Cli::parse();

    let model = StableDiffusionInpaint::load(&cli.model, cli.f16, cli.device.resolve()?).await?;
    let image = image::open(&cli.input)?;
    let mask = image::open(&cli.mask)?.to_luma8();

    let params = InpaintParams {
        prompt: cli.prompt,
        negative_prompt: cli.negative_prompt,
        strength: cli.strength,
        guidance_scale: cli.guidance_scale,
        steps: cli.steps,
        seed: cli.seed,
    };
    let output = model.inference(&image, &mask, &params)?;
    output.save(&cli.output)?;

    Ok(())
}

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use image::DynamicImage;
use retouch::enhancement::{
    COLORIZE_PROMPT, CORRECT_LIGHT_PROMPT, DEBLUR_STRENGTH, DENOISE_STRENGTH, SHARPEN_STRENGTH,
    SUPER_RESOLUTION_SCALE,
};
use retouch::generative::{ZOOM_FACTOR, ZOOM_FRAMES};
use retouch::manipulation::REMOVE_PROMPT;
use retouch::{
    BoundingBox, Config, MaskInput, Point, Retouch, image as imaging, pipelines, visualization,
};
use retouch_ml::Device;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "cpu, cuda[:N] or metal[:N]; overrides the configuration")]
    device: Option<Device>,

    #[arg(long, value_name = "DIR", help = "Where downloaded weights are stored")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Io {
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Remove noise while keeping structure
    Denoise {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value_t = DENOISE_STRENGTH)]
        strength: f64,
    },
    /// Reinforce edges of a soft image
    Sharpen {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value_t = SHARPEN_STRENGTH)]
        strength: f64,
    },
    Deblur {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value_t = DEBLUR_STRENGTH)]
        strength: f64,
    },
    /// Upscale, then sharpen
    SuperResolution {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value_t = SUPER_RESOLUTION_SCALE)]
        scale: u32,
    },
    Colorize {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value = COLORIZE_PROMPT)]
        prompt: String,
    },
    CorrectLight {
        #[command(flatten)]
        io: Io,
        #[arg(long, default_value = CORRECT_LIGHT_PROMPT)]
        prompt: String,
    },
    /// Write the mask of the object selected by a box and/or points
    Segment {
        #[command(flatten)]
        io: Io,
        #[arg(long, value_name = "X1,Y1,X2,Y2", value_parser = parse_box)]
        bbox: Option<BoundingBox>,
        #[arg(long, value_name = "X,Y", value_parser = parse_point)]
        point: Vec<Point>,
        #[arg(long, value_name = "FILE", help = "Also write the mask overlaid on the image")]
        overlay: Option<PathBuf>,
    },
    /// Regenerate the white part of a mask
    Inpaint {
        #[command(flatten)]
        io: Io,
        #[arg(short, long, value_name = "FILE|X1,Y1,X2,Y2")]
        mask: String,
        #[arg(short, long)]
        prompt: String,
    },
    Remove {
        #[command(flatten)]
        io: Io,
        #[arg(short, long, value_name = "FILE|X1,Y1,X2,Y2")]
        mask: String,
        #[arg(short, long, default_value = REMOVE_PROMPT)]
        prompt: String,
    },
    Add {
        #[command(flatten)]
        io: Io,
        #[arg(short, long, value_name = "FILE|X1,Y1,X2,Y2")]
        mask: String,
        #[arg(short, long)]
        prompt: String,
    },
    /// Move an object from one region to another
    Reposition {
        #[command(flatten)]
        io: Io,
        #[arg(long, value_name = "FILE|X1,Y1,X2,Y2")]
        source: String,
        #[arg(long, value_name = "FILE|X1,Y1,X2,Y2")]
        destination: String,
        #[arg(short, long)]
        prompt: String,
    },
    /// Replace everything but the foreground
    Background {
        #[command(flatten)]
        io: Io,
        #[arg(long, value_name = "FILE|X1,Y1,X2,Y2")]
        foreground: String,
        #[arg(short, long)]
        prompt: String,
    },
    /// Write a generative zoom-out sequence as numbered frames
    Zoom {
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        #[arg(short, long)]
        prompt: String,
        #[arg(long, default_value_t = ZOOM_FRAMES)]
        frames: usize,
        #[arg(long, default_value_t = ZOOM_FACTOR)]
        factor: f64,
    },
    /// Side-by-side comparison, SSIM map and histograms of two images
    Compare {
        #[arg(long, value_name = "FILE")]
        before: PathBuf,
        #[arg(long, value_name = "FILE")]
        after: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        #[arg(long, value_name = "FILE")]
        difference: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        histogram: Option<PathBuf>,
    },
}

fn parse_box(s: &str) -> Result<BoundingBox, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| err.to_string())?;
    match values[..] {
        [x1, y1, x2, y2] => Ok(BoundingBox::new(x1, y1, x2, y2)),
        _ => Err(format!("expected x1,y1,x2,y2, got `{s}`")),
    }
}

fn parse_point(s: &str) -> Result<Point, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| err.to_string())?;
    match values[..] {
        [x, y] => Ok(Point::positive(x, y)),
        _ => Err(format!("expected x,y, got `{s}`")),
    }
}

/// A box literal selects by segmentation; anything else is a mask file.
fn mask_input(spec: &str) -> retouch::Result<MaskInput> {
    match parse_box(spec) {
        Ok(bbox) => Ok(MaskInput::Box(bbox)),
        Err(_) => Ok(MaskInput::Image(image::open(spec)?.to_luma8())),
    }
}

fn save(image: &DynamicImage, path: &Path) -> retouch::Result<()> {
    image.save(path)?;
    tracing::info!(path = %path.display(), "saved");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(device) = cli.device {
        config = config.with_device(device);
    }
    if let Some(dir) = cli.cache_dir {
        config = config.with_cache_dir(dir);
    }

    let retouch = Retouch::new(config)?;
    match cli.command {
        Command::Denoise { io, strength } => {
            let image = image::open(&io.input)?;
            save(&retouch.enhancement.denoise(&image, strength).await?, &io.output)?;
        }
        Command::Sharpen { io, strength } => {
            let image = image::open(&io.input)?;
            save(&retouch.enhancement.sharpen(&image, strength).await?, &io.output)?;
        }
        Command::Deblur { io, strength } => {
            let image = image::open(&io.input)?;
            save(&retouch.enhancement.deblur(&image, strength).await?, &io.output)?;
        }
        Command::SuperResolution { io, scale } => {
            let image = image::open(&io.input)?;
            let output = retouch.enhancement.super_resolution(&image, scale).await?;
            save(&output, &io.output)?;
        }
        Command::Colorize { io, prompt } => {
            let image = image::open(&io.input)?;
            save(&retouch.enhancement.colorize(&image, &prompt).await?, &io.output)?;
        }
        Command::CorrectLight { io, prompt } => {
            let image = image::open(&io.input)?;
            let output = retouch.enhancement.correct_light(&image, &prompt).await?;
            save(&output, &io.output)?;
        }
        Command::Segment {
            io,
            bbox,
            point,
            overlay,
        } => {
            let image = image::open(&io.input)?;
            let mask = pipelines::run_segmentation(
                retouch.cache(),
                &retouch.config().models,
                &image,
                bbox,
                &point,
            )
            .await?;
            mask.save(&io.output)?;
            if let Some(path) = overlay {
                imaging::overlay_mask(&image, &mask).save(path)?;
            }
        }
        Command::Inpaint { io, mask, prompt } => {
            let image = image::open(&io.input)?;
            let mask = mask_input(&mask)?;
            let output = retouch.manipulation.inpaint(&image, &mask, &prompt).await?;
            save(&output, &io.output)?;
        }
        Command::Remove { io, mask, prompt } => {
            let image = image::open(&io.input)?;
            let mask = mask_input(&mask)?;
            let output = retouch
                .manipulation
                .remove_object(&image, &mask, &prompt)
                .await?;
            save(&output, &io.output)?;
        }
        Command::Add { io, mask, prompt } => {
            let image = image::open(&io.input)?;
            let mask = mask_input(&mask)?;
            let output = retouch.manipulation.add_object(&image, &mask, &prompt).await?;
            save(&output, &io.output)?;
        }
        Command::Reposition {
            io,
            source,
            destination,
            prompt,
        } => {
            let image = image::open(&io.input)?;
            let output = retouch
                .manipulation
                .reposition_object(
                    &image,
                    &mask_input(&source)?,
                    &mask_input(&destination)?,
                    &prompt,
                )
                .await?;
            save(&output, &io.output)?;
        }
        Command::Background {
            io,
            foreground,
            prompt,
        } => {
            let image = image::open(&io.input)?;
            let foreground = mask_input(&foreground)?;
            let output = retouch
                .generative
                .generate_background(&image, &foreground, &prompt)
                .await?;
            save(&output, &io.output)?;
        }
        Command::Zoom {
            input,
            output,
            prompt,
            frames,
            factor,
        } => {
            let image = image::open(&input)?;
            let sequence = retouch
                .generative
                .generative_zoom(&image, &prompt, frames, factor)
                .await?;
            std::fs::create_dir_all(&output)?;
            for (index, frame) in sequence.iter().enumerate() {
                save(frame, &output.join(format!("frame_{index:03}.png")))?;
            }
        }
        Command::Compare {
            before,
            after,
            output,
            difference,
            histogram,
        } => {
            let before = image::open(&before)?;
            let after = image::open(&after)?;
            visualization::compare(&before, &after).save(&output)?;

            let (score, map) = visualization::difference_map(&before, &after);
            tracing::info!(ssim = score, "compared");
            if let Some(path) = difference {
                map.save(path)?;
            }
            if let Some(path) = histogram {
                let (b, a) = visualization::histograms(&before, &after);
                visualization::plot_histograms(&b, &a, 512, 256).save(path)?;
            }
        }
    }

    Ok(())
}

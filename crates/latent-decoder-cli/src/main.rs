//! latent-decoder CLI
//!
//! Command-line interface for the latent decoder and its numeric helpers.
//!
//! Supports:
//! - Decoding seeded random latents to PNG
//! - Printing the noise schedule, timestep embedding and decoder stage plan

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use burn::prelude::*;
use clap::{Parser, Subcommand, ValueEnum};
use image::RgbImage;
use tracing_subscriber::EnvFilter;

use latent_decoder::backends::{
    DEFAULT_BACKEND_NAME, DefaultBackend, default_device, enabled_backends,
};
use latent_decoder::convert::stage_prefixes;
use latent_decoder::samplers::{
    ScheduleConfig, TIMESTEP_EMBED_DIM, alphas_cumprod, compute_sigmas, inference_timesteps,
    init_noise_latent, timestep_embedding,
};
use latent_decoder::{Decoder, DecoderConfig, PrecisionMode, to_rgb8};

/// Built-in decoder configurations
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Preset {
    /// Stable Diffusion 1.x (latent scale 0.18215)
    #[default]
    Sd1x,
    /// Stable Diffusion XL (latent scale 0.13025)
    Sdxl,
}

impl Preset {
    fn config(&self) -> DecoderConfig {
        match self {
            Preset::Sd1x => DecoderConfig::sd1x(),
            Preset::Sdxl => DecoderConfig::sdxl(),
        }
    }
}

#[derive(Parser)]
#[command(name = "latent-decoder")]
#[command(about = "Latent diffusion decoder in pure Rust")]
#[command(version)]
struct Cli {
    /// Log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode seeded random latents into PNG images
    Decode {
        /// Output image path
        #[arg(short, long, default_value = "decoded.png")]
        output: PathBuf,

        /// Built-in decoder configuration
        #[arg(long, value_enum, default_value_t = Preset::Sd1x)]
        preset: Preset,

        /// JSON decoder configuration (overrides --preset)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Latent height (image height is 8x)
        #[arg(long, default_value = "8")]
        latent_height: usize,

        /// Latent width (image width is 8x)
        #[arg(long, default_value = "8")]
        latent_width: usize,

        /// Number of latents to decode
        #[arg(short, long, default_value = "1")]
        batch: usize,

        /// Random seed for weights and latents
        #[arg(short, long)]
        seed: Option<u64>,

        /// Standard deviation of the random latents
        #[arg(long, default_value = "1.0")]
        sigma: f32,

        /// Save the batch side by side in one image instead of one file each
        #[arg(long)]
        grid: bool,

        /// Skip the attention stage
        #[arg(long)]
        skip_attention: bool,

        /// Clamp activations to the f16 range after every stage
        #[arg(long)]
        clamp_overflow: bool,

        /// Log NaN/Inf statistics after every stage
        #[arg(long)]
        check_nan: bool,
    },

    /// Print the noise schedule for a number of inference steps
    Schedule {
        /// Number of inference steps
        #[arg(long, default_value = "50")]
        steps: usize,

        #[arg(long, default_value_t = latent_decoder::samplers::DEFAULT_BETA_START)]
        beta_start: f64,

        #[arg(long, default_value_t = latent_decoder::samplers::DEFAULT_BETA_END)]
        beta_end: f64,

        /// Number of training timesteps
        #[arg(long, default_value_t = latent_decoder::samplers::DEFAULT_TRAIN_STEPS)]
        train_steps: usize,

        /// Print the whole alpha_cumprod table instead of the inference steps
        #[arg(long)]
        full: bool,
    },

    /// Print the sinusoidal embedding of a timestep
    Embed {
        /// Timestep to embed
        timestep: f64,

        /// Output precision (fp32, fp16, bf16; 16-bit needs the wgpu backend)
        #[arg(long, default_value = "fp32")]
        precision: PrecisionMode,

        /// Only print the first N values of each half
        #[arg(long)]
        head: Option<usize>,
    },

    /// Print the decoder stage plan with reference parameter names
    Plan {
        #[arg(long, value_enum, default_value_t = Preset::Sd1x)]
        preset: Preset,

        /// JSON decoder configuration (overrides --preset)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show build and backend information
    Info,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(preset: Preset, path: Option<&Path>) -> Result<DecoderConfig> {
    let config = match path {
        Some(path) => DecoderConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => preset.config(),
    };
    config.validate().context("Invalid decoder configuration")?;
    Ok(config)
}

#[allow(clippy::too_many_arguments)]
fn run_decode(
    output: &Path,
    config: DecoderConfig,
    latent_size: [usize; 2],
    batch: usize,
    seed: Option<u64>,
    sigma: f32,
    grid: bool,
    skip_attention: bool,
    clamp_overflow: bool,
    check_nan: bool,
) -> Result<()> {
    if batch == 0 || latent_size.contains(&0) {
        bail!("batch and latent size must be non-zero");
    }

    let device = default_device();
    if let Some(seed) = seed {
        DefaultBackend::seed(&device, seed);
    }

    let start = Instant::now();
    let decoder = Decoder::<DefaultBackend>::new(&config, &device)
        .context("Failed to build decoder")?
        .with_skip_attention(skip_attention)
        .with_clamp_overflow(clamp_overflow);
    log::info!(
        "Built decoder: {} stages, {} parameters in {:?}",
        decoder.stages.len(),
        decoder.num_params(),
        start.elapsed()
    );

    let [h, w] = latent_size;
    let latents = init_noise_latent::<DefaultBackend>(
        [batch, config.latent_channels, h, w],
        sigma,
        &device,
    );

    let start = Instant::now();
    let decoded = if check_nan {
        decoder.forward_checked(latents)
    } else {
        decoder.forward(latents)
    }
    .context("Decoding failed")?;
    log::info!("Decoded {:?} in {:?}", decoded.dims(), start.elapsed());

    let images = to_rgb8(decoded).context("Failed to convert to RGB")?;
    save_images(output, images, grid)
}

fn save_images(output: &Path, images: Vec<RgbImage>, grid: bool) -> Result<()> {
    if images.len() == 1 || grid {
        let image = if grid {
            tile(&images)
        } else {
            images.into_iter().next().context("No image decoded")?
        };
        image
            .save(output)
            .with_context(|| format!("Failed to save {}", output.display()))?;
        println!("Saved {}", output.display());
        return Ok(());
    }

    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("decoded");
    let ext = output.extension().and_then(|s| s.to_str()).unwrap_or("png");
    for (i, image) in images.into_iter().enumerate() {
        let path = output.with_file_name(format!("{stem}_{i}.{ext}"));
        image
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

/// Places the images left to right
fn tile(images: &[RgbImage]) -> RgbImage {
    let (w, h) = images.first().map(|i| i.dimensions()).unwrap_or((0, 0));
    let mut canvas = RgbImage::new(w * images.len() as u32, h);
    for (i, image) in images.iter().enumerate() {
        image::imageops::replace(&mut canvas, image, i as i64 * w as i64, 0);
    }
    canvas
}

fn run_schedule(config: ScheduleConfig, steps: usize, full: bool) -> Result<()> {
    let table = alphas_cumprod(&config).context("Invalid noise schedule")?;

    if full {
        println!("{:>6}  {:>12}", "t", "alpha_cumprod");
        for (t, alpha) in table.iter().enumerate() {
            println!("{t:>6}  {alpha:>12.8}");
        }
        return Ok(());
    }

    let timesteps = inference_timesteps(steps, config.num_train_steps);
    let sigmas = compute_sigmas(&table, &timesteps).context("Invalid inference timesteps")?;

    println!("{:>4}  {:>6}  {:>12}  {:>10}", "step", "t", "alpha_cumprod", "sigma");
    for (i, (&t, sigma)) in timesteps.iter().zip(&sigmas).enumerate() {
        println!("{i:>4}  {t:>6}  {:>12.8}  {sigma:>10.6}", table[t]);
    }
    if let Some(last) = sigmas.last() {
        println!("{:>4}  {:>6}  {:>12}  {last:>10.6}", "", "", "");
    }
    Ok(())
}

fn run_embed(timestep: f64, precision: PrecisionMode, head: Option<usize>) -> Result<()> {
    let device = default_device();
    let embedding = timestep_embedding::<DefaultBackend>(timestep, precision, &device)
        .with_context(|| format!("Cannot embed in {precision} on {DEFAULT_BACKEND_NAME}"))?;
    let values: Vec<f32> = embedding
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to read embedding: {e:?}"))?;

    let half = TIMESTEP_EMBED_DIM / 2;
    let n = head.unwrap_or(half).min(half);
    println!("timestep {timestep} ({precision}), {} values", values.len());
    println!("cos: {:?}", &values[..n]);
    println!("sin: {:?}", &values[half..half + n]);
    Ok(())
}

fn run_plan(config: &DecoderConfig) -> Result<()> {
    let plan = config.stage_plan();
    let prefixes = stage_prefixes(&plan);

    println!(
        "{} stages, latent scale {}, {}x spatial",
        plan.len(),
        config.scale_factor,
        config.spatial_factor()
    );
    for (i, (spec, prefix)) in plan.iter().zip(&prefixes).enumerate() {
        println!("{i:>3}  {prefix:<10}  {spec}");
    }
    Ok(())
}

fn run_info() -> Result<()> {
    println!("latent-decoder: Latent diffusion decoder in pure Rust\n");
    println!("Default backend: {DEFAULT_BACKEND_NAME}");
    println!("Enabled backends: {}", enabled_backends().join(", "));

    println!("\nDecoder presets:");
    for preset in [Preset::Sd1x, Preset::Sdxl] {
        let config = preset.config();
        println!(
            "  - {:?}: {} stages, latent scale {}",
            preset,
            config.stage_plan().len(),
            config.scale_factor
        );
    }

    println!("\nPrecisions:");
    let device = default_device();
    for precision in [PrecisionMode::Fp32, PrecisionMode::Fp16, PrecisionMode::Bf16] {
        let support = if precision.is_supported::<DefaultBackend>(&device) {
            ""
        } else {
            " (unsupported on this backend)"
        };
        println!(
            "  - {precision}: {:.0}% of fp32 memory{support}",
            precision.memory_savings() * 100.0
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Decode {
            output,
            preset,
            config,
            latent_height,
            latent_width,
            batch,
            seed,
            sigma,
            grid,
            skip_attention,
            clamp_overflow,
            check_nan,
        } => {
            let config = load_config(preset, config.as_deref())?;
            run_decode(
                &output,
                config,
                [latent_height, latent_width],
                batch,
                seed,
                sigma,
                grid,
                skip_attention,
                clamp_overflow,
                check_nan,
            )
        }

        Commands::Schedule {
            steps,
            beta_start,
            beta_end,
            train_steps,
            full,
        } => run_schedule(
            ScheduleConfig {
                beta_start,
                beta_end,
                num_train_steps: train_steps,
            },
            steps,
            full,
        ),

        Commands::Embed {
            timestep,
            precision,
            head,
        } => run_embed(timestep, precision, head),

        Commands::Plan { preset, config } => run_plan(&load_config(preset, config.as_deref())?),

        Commands::Info => run_info(),
    }
}

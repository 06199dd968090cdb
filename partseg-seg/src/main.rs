#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    clippy::match_same_arms,
    clippy::needless_pass_by_value
)]

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use partseg::encoding::decode_map;
use partseg::{
    load_project, save_project_to_path, ArchiveCompression, ArchiveOptions, ByteSource, ImageReader, MaskProperty,
    ParameterMap, PartSegError, Settings, SettingsStore, TiffImageReader,
};
use partseg_seg::{builtin_registry, THRESHOLD_ALGORITHM};

/// PartSeg segmenter
#[derive(Parser)]
#[command(name = "partseg-seg")]
#[command(about = "PartSeg segmenter - runs a segmentation algorithm and saves a project archive")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Input TIFF stack (with --append, the project when OUTPUT is omitted)
    #[arg(value_name = "INPUT", required_unless_present_any = ["list", "append"])]
    input: Option<PathBuf>,

    /// Output project archive
    #[arg(value_name = "OUTPUT", required_unless_present_any = ["list", "append"])]
    output: Option<PathBuf>,

    /// Mask TIFF (single channel, 8-bit values)
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// Algorithm to run (current or former name)
    #[arg(short, long, default_value = THRESHOLD_ALGORITHM)]
    algorithm: String,

    /// Algorithm parameters as a JSON object
    #[arg(short, long)]
    parameters: Option<String>,

    /// Named parameter profile from the settings file
    #[arg(long, conflicts_with = "parameters")]
    profile: Option<String>,

    /// Settings file (defaults to the user configuration directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Continue an existing project instead of starting from INPUT
    #[arg(long)]
    append: bool,

    /// Use the previous segmentation as mask before running
    #[arg(long, requires = "append")]
    mask_from_segmentation: bool,

    /// Write a plain tar instead of gzip
    #[arg(long)]
    no_compress: bool,

    /// List available algorithms and exit
    #[arg(long)]
    list: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.quiet {
        log::LevelFilter::Error
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Err(e) = run(args) {
        error!("Segmentation failed: {:#}", e);

        let exit_code = match e.downcast_ref::<PartSegError>() {
            Some(PartSegError::CorruptArchive(_)) => 1,
            Some(PartSegError::ParameterValidation { .. }) => 1,
            Some(PartSegError::UnsupportedVersion { .. }) => 1,
            Some(PartSegError::ShapeMismatch { .. }) => 1,
            Some(PartSegError::Image(_) | PartSegError::Npz(_) | PartSegError::Json(_)) => 1,
            Some(PartSegError::Io(_)) => 1,
            _ => 2,
        };

        process::exit(exit_code);
    }
}

fn run(args: Args) -> Result<()> {
    validate_args(&args)?;

    let registry = builtin_registry()?;
    if args.list {
        for descriptor in registry.descriptors() {
            println!("{}", descriptor.documentation());
        }
        return Ok(());
    }

    let (input, output) = resolve_paths(&args)?;
    info!("PartSeg segmenter v{}", env!("CARGO_PKG_VERSION"));
    if let Some(input) = input {
        info!("Input: {}", input.display());
    }
    info!("Output: {}", output.display());

    let settings_path = match &args.settings {
        Some(path) => path.clone(),
        None => default_settings_path()?,
    };
    let store = SettingsStore::open(&settings_path)?;
    let mut settings = Settings::new(registry).with_store(store);

    let progress = if args.quiet {
        None
    } else {
        Some(create_progress_bar())
    };

    if let Some(ref pb) = progress {
        pb.set_message("Loading input...");
    }

    if args.append {
        let project = load_project(output.as_path())
            .with_context(|| format!("Failed to load project {}", output.display()))?;
        info!("Resuming project with {} history steps", project.history.len());
        settings.adopt(project)?;
        if args.mask_from_segmentation {
            settings.derive_mask(MaskProperty::simple())?;
        }
    } else if let Some(input) = input {
        let mask = args.mask.as_ref().map(|path| ByteSource::from(path.as_path()));
        let image = TiffImageReader.read(ByteSource::from(input.as_path()), mask)?;
        let [layers, height, width] = image.spatial_shape();
        info!(
            "Loaded image: {} channels, {}x{}x{} voxels",
            image.channels(),
            layers,
            height,
            width
        );
        settings.set_image(image)?;
    }

    if let Some(ref pb) = progress {
        pb.set_message("Preparing parameters...");
        pb.inc(20);
    }

    let (algorithm, values) = resolve_parameters(&args, settings.store())?;

    if let Some(ref pb) = progress {
        pb.set_message(format!("Running {}...", algorithm));
        pb.inc(10);
    }

    settings.run_step(&algorithm, &values)?;

    if let Some(ref pb) = progress {
        pb.set_message("Saving project...");
        pb.inc(50);
    }

    let compression = if args.no_compress {
        ArchiveCompression::None
    } else {
        ArchiveCompression::default()
    };
    let options = ArchiveOptions::default().with_compression(compression);
    let project = settings.current_project_tuple()?;
    save_project_to_path(&project, output, &options)?;
    settings.store().save()?;

    if let Some(ref pb) = progress {
        pb.finish_with_message("Segmentation complete!");
    }

    let components = project
        .segmentation
        .as_ref()
        .and_then(|segmentation| segmentation.iter().copied().max())
        .unwrap_or(0);
    info!(
        "Output file: {} ({} bytes, {} components, {} history steps)",
        output.display(),
        std::fs::metadata(output)?.len(),
        components,
        project.history.len()
    );

    Ok(())
}

/// Algorithm name and raw parameters from the command line, a profile, or the
/// values remembered from the last run
fn resolve_parameters(args: &Args, store: &SettingsStore) -> Result<(String, ParameterMap)> {
    if let Some(name) = &args.profile {
        let profile = store
            .profile(name)
            .with_context(|| format!("No profile named `{}` in {}", name, store.path().display()))?;
        return Ok((profile.algorithm.clone(), profile.values.clone()));
    }
    if let Some(json) = &args.parameters {
        let value: serde_json::Value = serde_json::from_str(json).context("Invalid --parameters JSON")?;
        return Ok((args.algorithm.clone(), decode_map(value)?));
    }
    let values = store.algorithm_values(&args.algorithm).cloned().unwrap_or_default();
    Ok((args.algorithm.clone(), values))
}

/// Image to read and project to write
///
/// With `--append` there is no image; a single positional names the project.
fn resolve_paths(args: &Args) -> Result<(Option<&PathBuf>, &PathBuf)> {
    if args.append {
        if args.input.is_some() && args.output.is_some() {
            warn!("INPUT is ignored with --append");
        }
        let project = args.output.as_ref().or(args.input.as_ref());
        let project = project.context("--append needs the project archive")?;
        return Ok((None, project));
    }
    match (&args.input, &args.output) {
        (Some(input), Some(output)) => Ok((Some(input), output)),
        _ => anyhow::bail!("INPUT and OUTPUT are required"),
    }
}

fn default_settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("No user configuration directory")?;
    Ok(base.join("partseg").join("settings.json"))
}

fn validate_args(args: &Args) -> Result<()> {
    if args.list {
        return Ok(());
    }

    let (input, output) = resolve_paths(args)?;
    if let Some(input) = input {
        if !input.exists() {
            anyhow::bail!("Input file does not exist: {}", input.display());
        }
    }

    if args.append && !output.exists() {
        anyhow::bail!("Project to append to does not exist: {}", output.display());
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            anyhow::bail!("Output directory does not exist: {}", parent.display());
        }
    }

    if let Some(mask) = &args.mask {
        if args.append {
            warn!("--mask is ignored with --append");
        } else if !mask.exists() {
            anyhow::bail!("Mask file does not exist: {}", mask.display());
        }
    }

    if args.quiet && args.verbose {
        warn!("Both --quiet and --verbose specified, using --quiet");
    }

    Ok(())
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    pb
}

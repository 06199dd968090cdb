#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    clippy::match_same_arms,
    clippy::needless_pass_by_value
)]

mod summary;

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::{ImageBuffer, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use ndarray::{Array3, Axis};
use serde_json::json;

use partseg::container::OpenArchive;
use partseg::tiff_image::encode_image;
use partseg::{
    load_project, save_project_to_path, ArchiveCompression, ArchiveOptions, ByteSource, HistoryLog, PartSegError,
    ProjectTuple, Settings,
};
use partseg_seg::builtin_registry;

use crate::summary::{ProjectSummary, StepSummary};

/// PartSeg project tools
#[derive(Parser)]
#[command(name = "partseg")]
#[command(about = "PartSeg project tools - inspect, validate, undo and extract project archives")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a project summary
    Inspect {
        /// Project archive to inspect
        file: PathBuf,
        /// Output format (json, yaml, toml)
        #[arg(short, long, default_value = "json")]
        format: InspectFormat,
        /// Pretty print output
        #[arg(short, long)]
        pretty: bool,
    },
    /// Show archive members and sizes
    Info {
        /// Project archive to analyze
        file: PathBuf,
    },
    /// Validate a project archive
    Validate {
        /// Project archive to validate
        file: PathBuf,
        /// Re-run every history step with the built-in algorithms
        #[arg(long)]
        check_history: bool,
    },
    /// List the history steps of a project
    History {
        /// Project archive
        file: PathBuf,
    },
    /// Undo steps and save the result as a new project
    Undo {
        /// Project archive
        file: PathBuf,
        /// Output project archive
        #[arg(short, long)]
        output: PathBuf,
        /// Number of steps to undo
        #[arg(short, long, default_value = "1")]
        steps: usize,
        /// Write a plain tar instead of gzip
        #[arg(long)]
        no_compress: bool,
    },
    /// Export image, segmentation and mask
    Extract {
        /// Project archive to extract from
        file: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "extracted")]
        output_dir: PathBuf,
        /// Export format for label arrays
        #[arg(short, long, default_value = "npy")]
        format: ExtractFormat,
        /// Only this layer (png only)
        #[arg(short, long)]
        layer: Option<usize>,
    },
    /// Describe the built-in algorithms
    Algorithms,
}

#[derive(clap::ValueEnum, Clone)]
enum InspectFormat {
    Json,
    Yaml,
    Toml,
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
enum ExtractFormat {
    Npy,
    Png,
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

    let quiet = args.quiet;
    if let Err(e) = run(args.command, quiet) {
        error!("Command failed: {:#}", e);

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

fn run(command: Commands, quiet: bool) -> Result<()> {
    match command {
        Commands::Inspect { file, format, pretty } => cmd_inspect(file, format, pretty),
        Commands::Info { file } => cmd_info(file),
        Commands::Validate { file, check_history } => cmd_validate(file, check_history, quiet),
        Commands::History { file } => cmd_history(file),
        Commands::Undo {
            file,
            output,
            steps,
            no_compress,
        } => cmd_undo(file, output, steps, no_compress),
        Commands::Extract {
            file,
            output_dir,
            format,
            layer,
        } => cmd_extract(file, output_dir, format, layer),
        Commands::Algorithms => cmd_algorithms(),
    }
}

fn open_project(file: &Path) -> Result<ProjectTuple> {
    load_project(file).with_context(|| format!("Failed to load {}", file.display()))
}

fn cmd_inspect(file: PathBuf, format: InspectFormat, pretty: bool) -> Result<()> {
    info!("Inspecting {}", file.display());

    let project = open_project(&file)?;
    let summary = ProjectSummary::new(&file.display().to_string(), &project);

    let output = match format {
        InspectFormat::Json => {
            if pretty {
                serde_json::to_string_pretty(&summary)?
            } else {
                serde_json::to_string(&summary)?
            }
        }
        InspectFormat::Yaml => serde_yaml::to_string(&summary)?,
        InspectFormat::Toml => toml::to_string_pretty(&summary)?,
    };

    println!("{}", output);
    Ok(())
}

fn cmd_info(file: PathBuf) -> Result<()> {
    let archive = OpenArchive::open(ByteSource::from(file.as_path()))?;
    let members: Vec<_> = archive
        .names()
        .map(|name| {
            json!({
                "name": name,
                "bytes": archive.member(name).map_or(0, <[u8]>::len),
            })
        })
        .collect();

    let info = json!({
        "file": file.display().to_string(),
        "archive_bytes": fs::metadata(&file)?.len(),
        "members": members,
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_validate(file: PathBuf, check_history: bool, quiet: bool) -> Result<()> {
    info!("Validating {}", file.display());

    let project = open_project(&file)?;
    project.check_shapes()?;
    info!("✓ Archive structure validation passed");

    HistoryLog::from_records(project.history.clone()).verify()?;
    info!("✓ History bundles validation passed ({} steps)", project.history.len());

    if check_history {
        validate_history(project, quiet)?;
        info!("✓ History replay validation passed");
    }

    info!("Validation completed successfully");
    Ok(())
}

fn validate_history(project: ProjectTuple, quiet: bool) -> Result<()> {
    let steps = project.history.len();
    let mut settings = Settings::new(builtin_registry()?);
    settings.adopt(project)?;

    let progress = if quiet {
        None
    } else {
        Some(create_progress_bar(steps as u64))
    };

    let mut mismatched = Vec::new();
    for index in 0..steps {
        if let Some(ref pb) = progress {
            pb.set_message(format!("Replaying step {}", index));
        }
        if !settings.verify_step(index)? {
            warn!("Step {} does not reproduce its stored segmentation", index);
            mismatched.push(index);
        }
        if let Some(ref pb) = progress {
            pb.inc(1);
        }
    }
    if let Some(ref pb) = progress {
        pb.finish_with_message("Replay complete");
    }

    if !mismatched.is_empty() {
        anyhow::bail!("History steps {:?} do not reproduce their results", mismatched);
    }
    Ok(())
}

fn cmd_history(file: PathBuf) -> Result<()> {
    let project = open_project(&file)?;
    if project.history.is_empty() {
        info!("{} has no history", file.display());
        return Ok(());
    }
    let steps: Vec<StepSummary> = project
        .history
        .iter()
        .enumerate()
        .map(|(index, element)| StepSummary::new(index, element))
        .collect();
    println!("{}", serde_json::to_string_pretty(&steps)?);
    Ok(())
}

fn cmd_undo(file: PathBuf, output: PathBuf, steps: usize, no_compress: bool) -> Result<()> {
    let project = open_project(&file)?;
    let mut settings = Settings::new(builtin_registry()?);
    settings.adopt(project)?;

    let undone = undo_steps(&mut settings, steps)?;
    if undone < steps {
        warn!(
            "Only {} of {} steps could be undone, the first step is kept",
            undone, steps
        );
    }

    let compression = if no_compress {
        ArchiveCompression::None
    } else {
        ArchiveCompression::default()
    };
    let project = settings.current_project_tuple()?;
    save_project_to_path(&project, &output, &ArchiveOptions::default().with_compression(compression))?;
    info!(
        "Saved {} with {} history steps",
        output.display(),
        project.history.len()
    );
    Ok(())
}

/// Undo up to `steps` steps, never past the first one
///
/// A loaded project does not carry the state before its first step, so
/// undoing that step would leave nothing to save.
fn undo_steps(settings: &mut Settings, steps: usize) -> Result<usize> {
    let mut undone = 0;
    while undone < steps && settings.history().cursor() > 1 && settings.undo()? {
        undone += 1;
    }
    Ok(undone)
}

fn cmd_extract(file: PathBuf, output_dir: PathBuf, format: ExtractFormat, layer: Option<usize>) -> Result<()> {
    info!("Extracting from {}", file.display());

    let project = open_project(&file)?;
    if layer.is_some() && format != ExtractFormat::Png {
        warn!("--layer only applies to png export");
    }
    if let Some(layer) = layer {
        let layers = project.image.layers();
        if layer >= layers {
            anyhow::bail!("Layer {} out of range, image has {} layers", layer, layers);
        }
    }

    fs::create_dir_all(&output_dir)?;
    fs::write(output_dir.join("image.tif"), encode_image(&project.image)?)?;

    let mut extracted = 1;
    let labels = [
        ("segmentation", project.segmentation.as_ref()),
        ("full_segmentation", project.full_segmentation.as_ref()),
    ];
    for (name, array) in labels {
        let Some(array) = array else { continue };
        extracted += match format {
            ExtractFormat::Npy => {
                ndarray_npy::write_npy(output_dir.join(format!("{}.npy", name)), array)?;
                1
            }
            ExtractFormat::Png => write_png_layers(&output_dir, name, &array.mapv(clamp_label), layer)?,
        };
    }
    if let Some(mask) = &project.mask {
        extracted += match format {
            ExtractFormat::Npy => {
                ndarray_npy::write_npy(output_dir.join("mask.npy"), mask)?;
                1
            }
            ExtractFormat::Png => write_png_layers(&output_dir, "mask", &mask.mapv(u16::from), layer)?,
        };
    }

    info!("Extracted {} files to {}", extracted, output_dir.display());
    Ok(())
}

fn clamp_label(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Write one 16-bit grayscale PNG per layer, or only `only`
fn write_png_layers(output_dir: &Path, name: &str, array: &Array3<u16>, only: Option<usize>) -> Result<usize> {
    let (_, height, width) = array.dim();
    let width = u32::try_from(width)?;
    let height = u32::try_from(height)?;
    let mut written = 0;
    for (index, plane) in array.axis_iter(Axis(0)).enumerate() {
        if only.is_some_and(|layer| layer != index) {
            continue;
        }
        let pixels: Vec<u16> = plane.iter().copied().collect();
        let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, pixels)
            .context("Layer size does not match its buffer")?;
        let path = output_dir.join(format!("{}_{:03}.png", name, index));
        buffer.save(&path)?;
        written += 1;
    }
    Ok(written)
}

fn cmd_algorithms() -> Result<()> {
    let registry = builtin_registry()?;
    for descriptor in registry.descriptors() {
        println!("{}", descriptor.documentation());
    }
    Ok(())
}

fn create_progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    pb
}

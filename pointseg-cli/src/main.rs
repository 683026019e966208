// pointseg command line interface
// Provision models, run point-prompted segmentation on a file, inspect model tensors

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use pointseg::models::{ModelManager, OnnxModelLoader};
use pointseg::{LabelId, NormalizedPoint, SegmentConfig, SegmentService};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pointseg")]
#[command(about = "Interactive point-prompted segmentation with SAM2", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Override the model directory
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy bundled models into the model directory
    Provision {
        /// Directory holding the packaged models
        #[arg(long)]
        bundle_dir: Option<PathBuf>,
    },

    /// Segment an image from prompt points and write the composite PNG
    Segment {
        /// Input image (PNG or JPEG)
        #[arg(long)]
        image: PathBuf,

        /// Normalized point: x,y[,fg|bg][:label]. Repeat for more points.
        #[arg(long = "point", required = true, value_parser = parse_point)]
        points: Vec<PointArg>,

        /// Label for points without an explicit :label suffix
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        label_id: LabelId,

        /// Labels to remove after all points are applied
        #[arg(long = "remove-label", allow_hyphen_values = true)]
        remove_labels: Vec<LabelId>,

        /// Output PNG path
        #[arg(long, short)]
        out: PathBuf,
    },

    /// Load both models and print the resolved tensor schema
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PointArg {
    point: NormalizedPoint,
    label: Option<LabelId>,
}

fn parse_point(value: &str) -> Result<PointArg, String> {
    let (body, label) = match value.split_once(':') {
        Some((body, label)) => {
            let label = label
                .trim()
                .parse::<LabelId>()
                .map_err(|e| format!("Invalid label '{}': {}", label, e))?;
            (body, Some(label))
        }
        None => (value, None),
    };

    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("Expected x,y[,fg|bg], got '{}'", value));
    }

    let x = parts[0]
        .parse::<f32>()
        .map_err(|e| format!("Invalid x '{}': {}", parts[0], e))?;
    let y = parts[1]
        .parse::<f32>()
        .map_err(|e| format!("Invalid y '{}': {}", parts[1], e))?;
    let kind = match parts.get(2).copied() {
        None | Some("fg") | Some("1") => 1,
        Some("bg") | Some("0") => 0,
        Some(other) => return Err(format!("Point type must be fg or bg, got '{}'", other)),
    };

    Ok(PointArg {
        point: NormalizedPoint::new(x, y, kind),
        label,
    })
}

/// Points grouped per label, labels in first-seen order
fn group_points(points: &[PointArg], default_label: LabelId) -> Vec<(LabelId, Vec<NormalizedPoint>)> {
    let mut groups: Vec<(LabelId, Vec<NormalizedPoint>)> = Vec::new();
    for arg in points {
        let label = arg.label.unwrap_or(default_label);
        match groups.iter_mut().find(|(l, _)| *l == label) {
            Some((_, group)) => group.push(arg.point),
            None => groups.push((label, vec![arg.point])),
        }
    }
    groups
}

fn load_config(cli: &Cli) -> anyhow::Result<SegmentConfig> {
    let mut config = match &cli.config {
        Some(path) => SegmentConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SegmentConfig::default(),
    };
    if let Some(dir) = &cli.model_dir {
        config.model_dir = dir.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Provision { bundle_dir } => {
            if bundle_dir.is_some() {
                config.bundle_dir = bundle_dir;
            }
            provision(config)?;
        }
        Commands::Segment {
            image,
            points,
            label_id,
            remove_labels,
            out,
        } => {
            segment(config, &image, &points, label_id, &remove_labels, &out).await?;
        }
        Commands::Inspect => {
            inspect(config).await?;
        }
    }

    Ok(())
}

fn provision(config: SegmentConfig) -> anyhow::Result<()> {
    let manager = ModelManager::new(Arc::new(config));
    let paths = manager.ensure_models().context("Model provisioning failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "encoder": paths.encoder,
            "decoder": paths.decoder,
        }))?
    );
    Ok(())
}

async fn segment(
    config: SegmentConfig,
    image: &Path,
    points: &[PointArg],
    default_label: LabelId,
    remove_labels: &[LabelId],
    out: &Path,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read image {}", image.display()))?;

    let groups = group_points(points, default_label);
    if groups.is_empty() {
        bail!("At least one --point is required");
    }

    let service = SegmentService::new(config)?;
    service
        .initialize_models()
        .await
        .context("Model initialization failed")?;

    let mut png = None;
    for (label, group) in &groups {
        info!("Label {}: {} points", label, group.len());
        let result = service
            .process_image(bytes.clone(), group, *label)
            .await
            .with_context(|| format!("Segmentation failed for label {}", label))?;
        png = Some(result);
    }

    for label in remove_labels {
        if let Some(result) = service.remove_label(*label).await? {
            png = Some(result);
        }
    }

    let png = png.ok_or_else(|| anyhow!("No composite was produced"))?;
    tokio::fs::write(out, &png)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    service.shutdown().await?;

    let labels: Vec<LabelId> = groups
        .iter()
        .map(|(label, _)| *label)
        .filter(|label| !remove_labels.contains(label))
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "output": out,
            "bytes": png.len(),
            "labels": labels,
        }))?
    );
    Ok(())
}

async fn inspect(config: SegmentConfig) -> anyhow::Result<()> {
    let loader = OnnxModelLoader::new(Arc::new(config));
    // Session creation is blocking
    let (encoder, decoder) = tokio::task::spawn_blocking(move || loader.load_onnx())
        .await
        .context("Model loading task failed")??;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "encoder": encoder.schema(),
            "decoder": decoder.schema(),
        }))?
    );
    Ok(())
}

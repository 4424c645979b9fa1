use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leaf_core::{
    LabelSet, OnnxModel, Pipeline, PipelineConfig, ScanOptions, ScanOutcome, Verdict,
    analyze_files, export_csv, scan_folder,
};
use tracing_subscriber::EnvFilter;

/// Leaf disease triage for single photos or whole folders.
#[derive(Debug, Parser)]
#[command(name = "leafdoc", version = env!("LEAFDOC_VERSION"))]
struct Cli {
    /// TOML file overriding thresholds and model settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Model file; overrides `classifier.model_path` from the config.
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    /// Log gate and distribution measurements.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze one photo.
    Analyze {
        file: PathBuf,
        /// Print the full analysis as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Analyze every JPG/PNG in a folder.
    Scan {
        dir: PathBuf,
        #[arg(short, long)]
        recursive: bool,
        /// Write results to this CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// List the classes the model knows about.
    Labels,
}

const TREATMENT_STEPS: [&str; 4] = [
    "Isolate affected plants",
    "Remove infected leaves",
    "Apply appropriate treatment",
    "Monitor plant recovery",
];

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(model) = cli.model {
        config.classifier.model_path = model;
    }
    tracing::debug!(model = %config.classifier.model_path.display(), "configuration ready");
    let model = OnnxModel::lazy(config.classifier.model_path.clone());
    let pipeline = Pipeline::from_config(&config, model)?;

    match cli.command {
        Command::Analyze { file, json } => analyze(&pipeline, &file, json),
        Command::Scan {
            dir,
            recursive,
            csv,
        } => scan(&pipeline, &dir, recursive, csv),
        Command::Labels => {
            print!("{}", render_labels(pipeline.labels()));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn analyze(pipeline: &Pipeline, file: &Path, json: bool) -> Result<ExitCode> {
    let bytes = fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    let analysis = match pipeline.run(&bytes) {
        Ok(analysis) => analysis,
        Err(e) => {
            eprintln!("Failed to load image: {e}");
            eprintln!("Please try a different image or make sure the file is not corrupted.");
            return Ok(ExitCode::FAILURE);
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print!("{}", render_verdict(&analysis.verdict, pipeline.labels()));
    }
    Ok(match analysis.verdict {
        Verdict::AnalysisFailed { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn scan(
    pipeline: &Pipeline,
    dir: &Path,
    recursive: bool,
    csv: Option<PathBuf>,
) -> Result<ExitCode> {
    let files = scan_folder(dir, ScanOptions { recursive })?;
    if files.is_empty() {
        println!("No images found in {}", dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    tracing::info!("analyzing {} images in {}", files.len(), dir.display());
    let rows = analyze_files(pipeline, &files);
    for row in &rows {
        let summary = match &row.outcome {
            ScanOutcome::Analyzed(a) => match &a.verdict {
                Verdict::Diagnosis { label, confidence } => format!("{label} ({confidence:.2}%)"),
                Verdict::LowConfidence { confidence } => {
                    format!("low confidence ({confidence:.2}%)")
                }
                other => other.kind().replace('_', " "),
            },
            ScanOutcome::Unreadable { error } => format!("unreadable: {error}"),
        };
        println!("{}\t{summary}", row.file.display());
    }
    let diagnosed = rows
        .iter()
        .filter(|r| matches!(&r.outcome, ScanOutcome::Analyzed(a) if a.verdict.label().is_some()))
        .count();
    tracing::info!("done: {} images, diagnosed: {diagnosed}", rows.len());
    if let Some(path) = csv {
        export_csv(&rows, &path)?;
        tracing::info!("CSV exported: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn render_verdict(verdict: &Verdict, labels: &LabelSet) -> String {
    match verdict {
        Verdict::Diagnosis { label, confidence } => {
            let mut out = format!("Detected: {label}\nConfidence: {confidence:.2}%\n");
            let healthy = labels
                .iter()
                .position(|l| l == label.as_str())
                .is_some_and(|idx| labels.is_healthy(idx));
            if healthy {
                out.push_str("The leaf looks healthy.\n");
            } else {
                out.push_str("\nTreatment recommendations:\n");
                for (i, step) in TREATMENT_STEPS.iter().enumerate() {
                    out.push_str(&format!("  {}. {step}\n", i + 1));
                }
            }
            out
        }
        Verdict::NotAPlant => {
            "This does not look like a plant leaf. Please upload a clear photo of a single leaf.\n"
                .to_string()
        }
        Verdict::Unsupported => format!(
            "Unsupported image: the leaf does not match any known class.\nSupported plants: {}\n",
            labels.supported_plants().join(", ")
        ),
        Verdict::LowConfidence { confidence } => format!(
            "Confidence too low ({confidence:.2}%). Please ensure the image is clear and well-lit.\n"
        ),
        Verdict::AnalysisFailed { reason } => format!(
            "Analysis failed: {reason}\nPlease make sure the image is clear and contains a leaf from one of the supported plants.\n"
        ),
    }
}

fn render_labels(labels: &LabelSet) -> String {
    let mut out = String::new();
    for (i, label) in labels.iter().enumerate() {
        out.push_str(&format!("{i:>2}  {label}\n"));
    }
    out.push_str(&format!(
        "\nSupported plants: {}\n",
        labels.supported_plants().join(", ")
    ));
    out
}

//! Batch mode: analyze every image in a folder and export the results.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use walkdir::WalkDir;

use crate::pipeline::{Analysis, Pipeline};

/// Options controlling how folder scanning behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanOptions {
    /// When true, scan subdirectories recursively.
    pub recursive: bool,
}

/// Result for a single file of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRow {
    pub file: PathBuf,
    pub outcome: ScanOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    Analyzed(Analysis),
    /// The file could not be read or decoded.
    Unreadable { error: String },
}

/// Lists `.jpg`, `.jpeg` and `.png` files under `path`, sorted.
pub fn scan_folder(path: impl AsRef<Path>, opts: ScanOptions) -> Result<Vec<PathBuf>> {
    let root = path.as_ref();
    if !root.exists() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("Path is not a directory: {}", root.display());
    }

    let walker = if opts.recursive {
        WalkDir::new(root).into_iter()
    } else {
        WalkDir::new(root).max_depth(1).into_iter()
    };

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("walkdir error: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && is_supported_image(path) {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Analyzes each file. Unreadable files become rows of their own instead of
/// aborting the batch.
pub fn analyze_files(pipeline: &Pipeline, files: &[PathBuf]) -> Vec<ScanRow> {
    files
        .par_iter()
        .map(|file| {
            let outcome = match fs::read(file) {
                Ok(bytes) => match pipeline.run(&bytes) {
                    Ok(analysis) => ScanOutcome::Analyzed(analysis),
                    Err(e) => {
                        tracing::warn!("cannot decode {}: {e}", file.display());
                        ScanOutcome::Unreadable {
                            error: e.to_string(),
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!("cannot read {}: {e}", file.display());
                    ScanOutcome::Unreadable {
                        error: e.to_string(),
                    }
                }
            };
            ScanRow {
                file: file.clone(),
                outcome,
            }
        })
        .collect()
}

/// Export the provided rows to CSV with headers:
/// file,verdict,label,confidence
pub fn export_csv(rows: &[ScanRow], path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["file", "verdict", "label", "confidence"])?;

    for row in rows {
        let (kind, label, confidence) = match &row.outcome {
            ScanOutcome::Analyzed(analysis) => (
                analysis.verdict.kind(),
                analysis.verdict.label().unwrap_or_default().to_string(),
                analysis
                    .verdict
                    .confidence()
                    .map(|c| format!("{c:.2}"))
                    .unwrap_or_default(),
            ),
            ScanOutcome::Unreadable { .. } => ("decode_error", String::new(), String::new()),
        };
        wtr.write_record([
            row.file.to_string_lossy().as_ref(),
            kind,
            label.as_str(),
            confidence.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            matches!(ext.as_str(), "jpg" | "jpeg" | "png")
        }
        None => false,
    }
}

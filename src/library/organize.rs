//! Sorting photos into dated folders.
//!
//! Planning is separate from execution: [`plan_organize`] decides where every
//! file should go, and [`execute`] carries out one operation. The job runner
//! executes plans in batches and records new paths in the store.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Month};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{move_file, unique_destination};
use crate::scanner::{read_exif, resolve_capture_date, CaptureDate};

/// Folder layout under the destination root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizePattern {
    /// `2021/`
    Year,
    /// `2021/March/`
    #[default]
    YearMonth,
    /// `2021/March/07/`
    YearMonthDay,
}

impl OrganizePattern {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "year" => Some(Self::Year),
            "year_month" => Some(Self::YearMonth),
            "year_month_day" => Some(Self::YearMonthDay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Leave the source in place.
    pub copy: bool,
}

const UNKNOWN_FOLDER: &str = "unknown";

fn month_name(month: u32) -> Option<&'static str> {
    u8::try_from(month)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .map(|m| m.name())
}

/// The folder a photo with `date` belongs in, or `root/unknown` when the date
/// lacks a part the pattern needs.
pub fn destination_folder(root: &Path, date: &CaptureDate, pattern: OrganizePattern) -> PathBuf {
    let folder = match pattern {
        OrganizePattern::Year => date.year.map(|y| PathBuf::from(y.to_string())),
        OrganizePattern::YearMonth => date
            .year
            .zip(date.month.and_then(month_name))
            .map(|(y, m)| Path::new(&y.to_string()).join(m)),
        OrganizePattern::YearMonthDay => date.taken.and_then(|dt| {
            month_name(dt.month()).map(|m| {
                Path::new(&dt.year().to_string())
                    .join(m)
                    .join(format!("{:02}", dt.day()))
            })
        }),
    };
    root.join(folder.unwrap_or_else(|| PathBuf::from(UNKNOWN_FOLDER)))
}

/// Plan where each of `files` goes under `destination_root`. Files already in
/// their target folder are left out.
pub fn plan_organize(
    files: &[PathBuf],
    destination_root: &Path,
    pattern: OrganizePattern,
    copy: bool,
) -> Vec<FileOperation> {
    files
        .iter()
        .filter_map(|source| {
            let exif_date = read_exif(source).ok().and_then(|e| e.date_original);
            let date = resolve_capture_date(source, exif_date);
            let destination = destination_folder(destination_root, &date, pattern).join(source.file_name()?);
            (destination != *source).then(|| FileOperation {
                source: source.clone(),
                destination,
                copy,
            })
        })
        .collect()
}

/// Carry out one operation. Returns the final path, which differs from the
/// planned one when that name was already taken.
pub fn execute(operation: &FileOperation) -> Result<PathBuf> {
    if !operation.source.is_file() {
        bail!("Source file not found: {}", operation.source.display());
    }
    let destination = unique_destination(&operation.destination);

    if operation.copy {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        std::fs::copy(&operation.source, &destination).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                operation.source.display(),
                destination.display()
            )
        })?;
    } else {
        move_file(&operation.source, &destination)?;
    }
    Ok(destination)
}

/// Remove `dir` and then its ancestors while they are empty, stopping at
/// `root`, which is never removed.
pub fn remove_empty_dirs(dir: &Path, root: &Path) {
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == root || !path.starts_with(root) {
            break;
        }
        let empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty || std::fs::remove_dir(path).is_err() {
            break;
        }
        current = path.parent();
    }
}

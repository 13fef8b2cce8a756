//! Capture date resolution.
//!
//! Priority: a date encoded in the file name, then EXIF `DateTimeOriginal`,
//! then the file's modification time. Each source is consulted only when the
//! previous one produced nothing.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// What is known about when a photo was taken. A filename may give only a
/// year, or a month and year, without a full date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureDate {
    pub taken: Option<NaiveDateTime>,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

impl CaptureDate {
    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self {
            taken: Some(dt),
            year: Some(dt.year()),
            month: Some(dt.month()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_none() && self.year.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum FullDateLayout {
    YearMonthDay,
    DayMonthYear,
    /// Two-digit year, pivoting at 50.
    MonthDayShortYear,
}

const FULL_DATE_PATTERNS: &[(&str, FullDateLayout)] = &[
    (r"(\d{4})(\d{2})(\d{2})", FullDateLayout::YearMonthDay),
    (r"(\d{4})[-_](\d{2})[-_](\d{2})", FullDateLayout::YearMonthDay),
    (r"(?:IMG|DSC|PXL|VID)[-_]?(\d{4})(\d{2})(\d{2})", FullDateLayout::YearMonthDay),
    (r"(\d{2})[-_](\d{2})[-_](\d{4})", FullDateLayout::DayMonthYear),
    (r"(\d{2})(\d{2})(\d{2})(?:[A-Z]{2})?[-_]", FullDateLayout::MonthDayShortYear),
];

const MONTH_YEAR_PATTERN: &str = r"(\d{2})(\d{4})";

const YEAR_PATTERNS: &[&str] = &[
    r"[_-]((?:19|20)\d{2})[_-]",
    r"[_-]((?:19|20)\d{2})\.",
    r"^((?:19|20)\d{2})[_-]",
];

struct Patterns {
    full: Vec<(Regex, FullDateLayout)>,
    month_year: Option<Regex>,
    year: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        full: FULL_DATE_PATTERNS
            .iter()
            .filter_map(|(p, layout)| Regex::new(p).ok().map(|re| (re, *layout)))
            .collect(),
        month_year: Regex::new(MONTH_YEAR_PATTERN).ok(),
        year: YEAR_PATTERNS.iter().filter_map(|p| Regex::new(p).ok()).collect(),
    })
}

fn parse_full_date(caps: &regex::Captures, layout: FullDateLayout) -> Option<CaptureDate> {
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i32>().ok());
    let (a, b, c) = (num(1)?, num(2)?, num(3)?);

    let (year, month, day) = match layout {
        FullDateLayout::YearMonthDay => (a, b, c),
        FullDateLayout::DayMonthYear => (c, b, a),
        FullDateLayout::MonthDayShortYear => (if c < 50 { 2000 + c } else { 1900 + c }, a, b),
    };

    let date = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)?;
    date.and_hms_opt(0, 0, 0).map(CaptureDate::from_datetime)
}

fn conflicting(results: &[CaptureDate]) -> bool {
    let years: HashSet<i32> = results.iter().filter_map(|r| r.year).collect();
    let months: HashSet<u32> = results.iter().filter_map(|r| r.month).collect();
    let dates: HashSet<NaiveDateTime> = results.iter().filter_map(|r| r.taken).collect();
    years.len() > 1 || months.len() > 1 || dates.len() > 1
}

/// Read a date out of a file name.
///
/// Every pattern is tried. If the candidates disagree on year, month or date
/// the name is considered ambiguous and nothing is returned; otherwise a full
/// date beats month and year, which beats a bare year.
pub fn date_from_filename(name: &str) -> CaptureDate {
    let patterns = patterns();

    let full: Vec<CaptureDate> = patterns
        .full
        .iter()
        .flat_map(|(re, layout)| {
            re.captures_iter(name)
                .filter_map(|caps| parse_full_date(&caps, *layout))
                .collect::<Vec<_>>()
        })
        .collect();

    let month_year: Vec<CaptureDate> = patterns
        .month_year
        .iter()
        .flat_map(|re| re.captures_iter(name).collect::<Vec<_>>())
        .filter_map(|caps| {
            let month: u32 = caps.get(1)?.as_str().parse().ok()?;
            let year: i32 = caps.get(2)?.as_str().parse().ok()?;
            ((1..=12).contains(&month) && (1900..=2100).contains(&year)).then_some(CaptureDate {
                taken: None,
                year: Some(year),
                month: Some(month),
            })
        })
        .collect();

    let year_only: Vec<CaptureDate> = patterns
        .year
        .iter()
        .flat_map(|re| re.captures_iter(name).collect::<Vec<_>>())
        .filter_map(|caps| caps.get(1)?.as_str().parse::<i32>().ok())
        .map(|year| CaptureDate {
            taken: None,
            year: Some(year),
            month: None,
        })
        .collect();

    let all: Vec<CaptureDate> = full
        .iter()
        .chain(&month_year)
        .chain(&year_only)
        .copied()
        .collect();
    if conflicting(&all) {
        return CaptureDate::default();
    }

    full.first()
        .or(month_year.first())
        .or(year_only.first())
        .copied()
        .unwrap_or_default()
}

/// Parse an EXIF `YYYY:MM:DD HH:MM:SS` timestamp.
pub fn parse_exif_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim().trim_matches('"');
    NaiveDateTime::parse_from_str(value, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn modified_time(path: &Path) -> Option<NaiveDateTime> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Local>::from(modified).naive_local())
}

/// Resolve the capture date of `path`, given the EXIF original date if any.
pub fn resolve_capture_date(path: &Path, exif_date: Option<NaiveDateTime>) -> CaptureDate {
    let from_name = path
        .file_name()
        .map(|n| date_from_filename(&n.to_string_lossy()))
        .unwrap_or_default();
    if !from_name.is_empty() {
        return from_name;
    }

    if let Some(dt) = exif_date {
        return CaptureDate::from_datetime(dt);
    }

    modified_time(path)
        .map(CaptureDate::from_datetime)
        .unwrap_or_default()
}

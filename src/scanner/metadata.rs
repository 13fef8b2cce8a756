use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::dates::parse_exif_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// The parts of a file's EXIF block the indexer cares about.
#[derive(Debug, Clone, Default)]
pub struct ExifSummary {
    pub date_original: Option<NaiveDateTime>,
    pub gps: Option<GpsCoordinates>,
    /// `(tag_name, tag_value)` for every primary-image field except dates.
    pub tags: Vec<(String, String)>,
}

/// Date fields are resolved separately and never stored as tags.
const DATE_TAGS: &[exif::Tag] = &[
    exif::Tag::DateTimeOriginal,
    exif::Tag::DateTime,
    exif::Tag::DateTimeDigitized,
    exif::Tag::SubSecTime,
    exif::Tag::SubSecTimeOriginal,
    exif::Tag::SubSecTimeDigitized,
    exif::Tag::GPSDateStamp,
    exif::Tag::GPSTimeStamp,
];

/// Opaque blobs that make poor tags.
const SKIPPED_TAGS: &[exif::Tag] = &[exif::Tag::MakerNote, exif::Tag::UserComment];

/// Read EXIF from `path`. Files without an EXIF block yield an empty summary;
/// I/O errors are returned.
pub fn read_exif(path: &Path) -> Result<ExifSummary> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(exif::Error::Io(e)) => return Err(e).context("Failed to read EXIF"),
        Err(_) => return Ok(ExifSummary::default()),
    };

    let date_original = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .and_then(|field| parse_exif_datetime(&field.display_value().to_string()));

    let tags = exif
        .fields()
        .filter(|f| f.ifd_num == exif::In::PRIMARY)
        .filter(|f| !DATE_TAGS.contains(&f.tag) && !SKIPPED_TAGS.contains(&f.tag))
        .filter_map(|f| {
            let value = f.display_value().with_unit(&exif).to_string();
            let value = value.trim().trim_matches('"').trim().to_string();
            (!value.is_empty()).then(|| (f.tag.to_string(), value))
        })
        .collect();

    Ok(ExifSummary {
        date_original,
        gps: gps_from_exif(&exif),
        tags,
    })
}

fn rational_degrees(field: &exif::Field) -> Option<f64> {
    match &field.value {
        exif::Value::Rational(v) if v.len() >= 3 => {
            let part = |r: &exif::Rational| {
                if r.denom == 0 {
                    None
                } else {
                    Some(r.num as f64 / r.denom as f64)
                }
            };
            Some(dms_to_decimal(part(&v[0])?, part(&v[1])?, part(&v[2])?))
        }
        _ => None,
    }
}

fn gps_from_exif(exif: &exif::Exif) -> Option<GpsCoordinates> {
    let lat = exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY)?;
    let lat_ref = exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY)?;
    let lon = exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY)?;
    let lon_ref = exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY)?;

    let latitude = rational_degrees(lat)?;
    let longitude = rational_degrees(lon)?;

    Some(GpsCoordinates {
        latitude: signed(latitude, &lat_ref.display_value().to_string(), 'S'),
        longitude: signed(longitude, &lon_ref.display_value().to_string(), 'W'),
    })
}

fn signed(value: f64, reference: &str, negative: char) -> f64 {
    if reference.contains(negative) {
        -value
    } else {
        value
    }
}

pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

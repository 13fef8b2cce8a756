//! File-level helpers used by the import, index and library tasks: discovery,
//! hashing, EXIF and capture dates.

pub mod dates;
pub mod discovery;
pub mod hashing;
pub mod metadata;

pub use dates::{resolve_capture_date, CaptureDate};
pub use discovery::discover_images;
pub use hashing::{perceptual_hash, sha256_file};
pub use metadata::{read_exif, ExifSummary, GpsCoordinates};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// DCT perceptual hash of an image, base64 encoded. Visually identical images
/// share a hash regardless of encoding or size.
pub fn perceptual_hash(path: &Path) -> Result<String> {
    use img_hash::{HashAlg, HasherConfig};

    let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
    // Hashing a small thumbnail is much faster and gives the same hash
    let rgba = img.thumbnail(64, 64).to_rgba8();
    let (width, height) = rgba.dimensions();

    // img_hash links its own `image` version, so hand it the raw pixels
    let pixels = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

    let hasher = HasherConfig::new()
        .hash_size(8, 8)
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .to_hasher();
    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(pixels));

    Ok(hash.to_base64())
}

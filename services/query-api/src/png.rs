//! Minimal PNG encoder for tile responses.
//!
//! Emits 8-bit grayscale+alpha (color type 4): the gray channel carries the
//! normalized value, the alpha channel makes no-data cells transparent.

use std::io::Write;

use pipeline_common::is_no_data;

pub const TILE_PIXELS: usize = 256;

/// Encode a grayscale+alpha PNG from cell values. `min`/`max` define the
/// normalization range; no-data cells become fully transparent.
pub fn encode_grayscale_alpha(
    values: &[f32],
    width: usize,
    height: usize,
    min: f32,
    max: f32,
) -> Result<Vec<u8>, String> {
    if values.len() != width * height {
        return Err(format!(
            "value buffer is {} cells, expected {}",
            values.len(),
            width * height
        ));
    }

    let range = if (max - min).abs() < f32::EPSILON {
        1.0
    } else {
        max - min
    };

    // Scanlines: filter byte + (gray, alpha) per pixel
    let mut raw = Vec::with_capacity(height * (1 + width * 2));
    for y in 0..height {
        raw.push(0); // filter type: none
        for x in 0..width {
            let value = values[y * width + x];
            if is_no_data(value) {
                raw.push(0);
                raw.push(0);
            } else {
                let normalized = ((value - min) / range).clamp(0.0, 1.0);
                raw.push((normalized * 255.0) as u8);
                raw.push(255);
            }
        }
    }

    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder
        .write_all(&raw)
        .map_err(|e| format!("IDAT compression failed: {}", e))?;
    let idat = encoder
        .finish()
        .map_err(|e| format!("IDAT compression failed: {}", e))?;

    let mut png = Vec::new();
    png.extend_from_slice(&[137, 80, 78, 71, 13, 10, 26, 10]);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&(width as u32).to_be_bytes());
    ihdr.extend_from_slice(&(height as u32).to_be_bytes());
    ihdr.push(8); // bit depth
    ihdr.push(4); // color type 4 = grayscale + alpha
    ihdr.push(0); // compression method
    ihdr.push(0); // filter method
    ihdr.push(0); // interlace method
    write_chunk(&mut png, b"IHDR", &ihdr);
    write_chunk(&mut png, b"IDAT", &idat);
    write_chunk(&mut png, b"IEND", &[]);

    Ok(png)
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

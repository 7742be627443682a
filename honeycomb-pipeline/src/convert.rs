//! PNG to JPEG conversion for basemaps that ship JPEG tiles.
//!
//! The tile tool writes PNG for any tile with transparency, even in a JPEG
//! cache. Before upload those strays are converted in place: transparent
//! pixels are composited over opaque white (the basemap background), the
//! JPEG is written at quality 75 beside the source, and the PNG is removed.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};

use crate::error::PipelineError;

/// JPEG quality used for converted tiles.
const JPEG_QUALITY: u8 = 75;

/// Convert a PNG tile to a JPEG with the same stem, removing the source.
/// Returns the path of the new file.
pub fn png_to_jpeg(path: &Path) -> Result<PathBuf, PipelineError> {
    let img = image::open(path)
        .map_err(|err| PipelineError::filesystem(format!("{}: {}", path.display(), err)))?;

    let rgb = flatten(img);

    let target = path.with_extension("jpg");
    let file = fs::File::create(&target)?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|err| PipelineError::filesystem(format!("{}: {}", target.display(), err)))?;

    fs::remove_file(path)?;
    Ok(target)
}

/// Composite an image over opaque white using its alpha channel as the
/// mask; images without alpha convert straight to RGB.
fn flatten(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |channel: u8| -> u8 {
            ((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        rgb.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    rgb
}

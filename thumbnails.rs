use crate::error::Result;
use image::imageops::FilterType;
use image::ImageFormat;
use std::path::Path;

pub const THUMB_MAX_DIM: u32 = 300;

/// Writes a JPEG no larger than `THUMB_MAX_DIM` on either side, keeping the
/// aspect ratio. Smaller images are re-encoded at their own size.
pub fn build_thumbnail(input: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let img = image::open(input)?;
    let thumb = if img.width() > THUMB_MAX_DIM || img.height() > THUMB_MAX_DIM {
        img.resize(THUMB_MAX_DIM, THUMB_MAX_DIM, FilterType::CatmullRom)
    } else {
        img
    };
    // JPEG has no alpha channel.
    thumb.to_rgb8().save_with_format(output, ImageFormat::Jpeg)?;
    Ok(())
}

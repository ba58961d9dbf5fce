use std::path::Path;

use tracing::info;

use crate::error::RenderError;

/// Metadata of a decoded image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Bits per channel.
    pub depth: u16,
    pub channels: u8,
}

/// Decodes an image file and reports its dimensions and pixel format.
///
/// The pixels themselves are discarded; nothing samples the texture yet.
pub fn probe_image(path: &Path) -> Result<ImageInfo, RenderError> {
    if !path.exists() {
        return Err(RenderError::AssetNotFound(path.to_path_buf()));
    }

    let img = image::open(path).map_err(|e| RenderError::ImageDecodeError {
        message: format!("{}: {}", path.display(), e),
    })?;

    let color = img.color();
    let channels = color.channel_count();
    let info = ImageInfo {
        width: img.width(),
        height: img.height(),
        depth: color.bits_per_pixel() / u16::from(channels.max(1)),
        channels,
    };

    info!(
        "texture '{}': {}x{}, {} channels, {} bits per channel",
        path.display(),
        info.width,
        info.height,
        info.channels,
        info.depth
    );
    Ok(info)
}

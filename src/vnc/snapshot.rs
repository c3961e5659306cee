//! Packed RGB snapshots of the relayed image.
//!
//! Embedders use these to grab the current picture outside the RFB protocol,
//! e.g. for thumbnails or health checks.

use bytes::Bytes;

use crate::error::SnapshotError;

/// A packed RGB (3 bytes per pixel) copy of a framebuffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbSnapshot {
    width: u16,
    height: u16,
    data: Bytes,
}

impl RgbSnapshot {
    pub(crate) fn new(width: u16, height: u16, data: Bytes) -> Self {
        Self { width, height, data }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Row-major RGB bytes, `width * height * 3` long.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Encodes the snapshot as an 8-bit RGB PNG image.
    pub fn to_png(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut out = Vec::new();
        let mut encoder = png::Encoder::new(&mut out, u32::from(self.width), u32::from(self.height));
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);

        let mut writer = encoder.write_header()?;
        writer.write_image_data(&self.data)?;
        writer.finish()?;
        Ok(out)
    }
}

//! Framebuffer mirrors shared between the relay and the RFB engines.
//!
//! Pixels are stored row-major from the top-left corner, 4 bytes per pixel in
//! memory order R, G, B, pad. This byte order is part of the engine contract:
//! the relay copies bytes verbatim, the placeholder and snapshots read them as
//! RGB. An engine whose native buffer is BGRX must swizzle at its boundary.

use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use bytes::{BufMut, BytesMut};
use log::warn;

use crate::error::FramebufferError;
use crate::vnc::snapshot::RgbSnapshot;

/// Bytes per pixel of every framebuffer handled by the relay.
pub const BYTES_PER_PIXEL: usize = 4;
/// Smallest accepted framebuffer side.
pub const MIN_DIMENSION: u16 = 1;
/// Largest accepted framebuffer side.
pub const MAX_DIMENSION: u16 = 8192;

/// Pixel layout handed to engine factories and pixel-format negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub bits_per_sample: u8,
    pub samples_per_pixel: u8,
    pub bytes_per_pixel: u8,
}

impl PixelLayout {
    /// 8 bits per sample, 3 samples (RGB), 4 bytes per pixel.
    pub const STANDARD: PixelLayout = PixelLayout {
        bits_per_sample: 8,
        samples_per_pixel: 3,
        bytes_per_pixel: BYTES_PER_PIXEL as u8,
    };
}

/// A dirty rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole `width` x `height` framebuffer.
    pub const fn full(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the rectangle lies entirely inside a `width` x `height` area.
    pub fn fits_within(&self, width: u16, height: u16) -> bool {
        u32::from(self.x) + u32::from(self.width) <= u32::from(width)
            && u32::from(self.y) + u32::from(self.height) <= u32::from(height)
    }
}

/// An opaque RGB color, written to framebuffers as `[r, g, b, 0xFF]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// The color as one framebuffer pixel, red first.
    pub const fn to_pixel(self) -> [u8; BYTES_PER_PIXEL] {
        [self.r, self.g, self.b, 0xFF]
    }
}

/// Checks that a geometry reported by an engine can back a framebuffer.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(u16, u16), FramebufferError> {
    let valid = |side: u32| (u32::from(MIN_DIMENSION)..=u32::from(MAX_DIMENSION)).contains(&side);
    if !valid(width) || !valid(height) {
        return Err(FramebufferError::InvalidDimensions {
            width,
            height,
            min: MIN_DIMENSION,
            max: MAX_DIMENSION,
        });
    }
    Ok((width as u16, height as u16))
}

/// A fixed-size RGBX framebuffer.
///
/// Geometry never changes after construction; a different size means a new
/// framebuffer (and, for the downstream side, a new server).
#[derive(Debug)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    data: RwLock<Vec<u8>>,
}

impl Framebuffer {
    /// Creates a zeroed framebuffer.
    pub fn new(width: u16, height: u16) -> Result<Self, FramebufferError> {
        validate_dimensions(u32::from(width), u32::from(height))?;
        let len = usize::from(width) * usize::from(height) * BYTES_PER_PIXEL;
        Ok(Self {
            width,
            height,
            data: RwLock::new(vec![0; len]),
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Length of the pixel buffer in bytes.
    pub fn len(&self) -> usize {
        usize::from(self.width) * usize::from(self.height) * BYTES_PER_PIXEL
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn full_rect(&self) -> Rect {
        Rect::full(self.width, self.height)
    }

    /// Read access to the raw pixel bytes.
    pub fn pixels(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole framebuffer content.
    pub fn update_from_slice(&self, data: &[u8]) -> Result<(), FramebufferError> {
        if data.len() != self.len() {
            return Err(FramebufferError::SizeMismatch {
                expected: self.len(),
                actual: data.len(),
            });
        }
        let mut pixels = self.data.write().unwrap_or_else(PoisonError::into_inner);
        pixels.copy_from_slice(data);
        Ok(())
    }

    /// Writes a tightly packed `rect`-sized block of pixels at `rect`.
    pub fn update_cropped(&self, data: &[u8], rect: Rect) -> Result<(), FramebufferError> {
        if !rect.fits_within(self.width, self.height) {
            return Err(FramebufferError::OutOfBounds {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                fb_width: self.width,
                fb_height: self.height,
            });
        }

        let row_bytes = usize::from(rect.width) * BYTES_PER_PIXEL;
        let expected = row_bytes * usize::from(rect.height);
        if data.len() != expected {
            return Err(FramebufferError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        if row_bytes == 0 {
            return Ok(());
        }

        let mut pixels = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for (row, src) in data.chunks_exact(row_bytes).enumerate() {
            let start = self.offset(rect.x, rect.y + row as u16);
            pixels[start..start + row_bytes].copy_from_slice(src);
        }
        Ok(())
    }

    /// Paints every pixel with `color`.
    pub fn fill(&self, color: Rgb) {
        let pixel = color.to_pixel();
        let mut pixels = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for chunk in pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            chunk.copy_from_slice(&pixel);
        }
    }

    /// Copies `rect` from `source` into the same position of this framebuffer.
    ///
    /// Rows are addressed with each framebuffer's own stride. The rectangle is
    /// expected to be in bounds for both; copying stops at the first row that
    /// is not. Returns the number of rows copied.
    pub fn copy_rect_from(&self, source: &Framebuffer, rect: Rect) -> usize {
        if std::ptr::eq(self, source) || rect.is_empty() {
            return 0;
        }

        let row_bytes = usize::from(rect.width) * BYTES_PER_PIXEL;
        let src = source.pixels();
        let mut dst = self.data.write().unwrap_or_else(PoisonError::into_inner);

        for row in 0..rect.height {
            let y = u32::from(rect.y) + u32::from(row);
            let src_start = source.offset_u32(rect.x, y);
            let dst_start = self.offset_u32(rect.x, y);

            let src_row = src.get(src_start..src_start + row_bytes);
            let dst_row = dst.get_mut(dst_start..dst_start + row_bytes);
            match (src_row, dst_row) {
                (Some(src_row), Some(dst_row)) => dst_row.copy_from_slice(src_row),
                _ => {
                    warn!(
                        "Dirty rectangle {:?} leaves the framebuffer at row {} (source {}x{}, destination {}x{})",
                        rect, y, source.width, source.height, self.width, self.height
                    );
                    return usize::from(row);
                }
            }
        }

        usize::from(rect.height)
    }

    /// Packs the framebuffer into 3-byte RGB pixels, dropping the pad byte.
    pub fn to_rgb(&self) -> RgbSnapshot {
        let pixels = self.pixels();
        let mut rgb = BytesMut::with_capacity(usize::from(self.width) * usize::from(self.height) * 3);
        for chunk in pixels.chunks_exact(BYTES_PER_PIXEL) {
            rgb.put_slice(&chunk[..3]);
        }
        RgbSnapshot::new(self.width, self.height, rgb.freeze())
    }

    fn offset(&self, x: u16, y: u16) -> usize {
        self.offset_u32(x, u32::from(y))
    }

    fn offset_u32(&self, x: u16, y: u32) -> usize {
        (y as usize * usize::from(self.width) + usize::from(x)) * BYTES_PER_PIXEL
    }
}

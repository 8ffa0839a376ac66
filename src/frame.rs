//! Transient storage for one captured primary frame.

use drm::buffer::DrmFourcc;

/// A host-addressable copy of the primary scanout, alive for a single
/// mirror iteration.
pub struct FrameView {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    format: DrmFourcc,
}

impl FrameView {
    /// Allocates a zeroed, tightly packed 32-bit frame.
    pub fn new(width: u32, height: u32, format: DrmFourcc) -> Self {
        let stride = width * 4;
        Self {
            data: vec![0; stride as usize * height as usize],
            width,
            height,
            stride,
            format,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        &mut self.data[start..start + self.stride as usize]
    }

    /// Reads the pixel at `(x, y)`. Callers must stay in bounds.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let offset = y as usize * self.stride as usize + x as usize * 4;
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, value: u32) {
        let offset = y as usize * self.stride as usize + x as usize * 4;
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Fills the frame with the diagnostic gradient that stands in for a
    /// failed capture: `gray = (x + y) mod 256` replicated across R, G, B.
    pub fn fill_diagnostic_gradient(&mut self) {
        for y in 0..self.height {
            for x in 0..self.width {
                let gray = (x + y) % 256;
                self.put_pixel(x, y, gray << 16 | gray << 8 | gray);
            }
        }
    }

    /// XOR checksum over the first 1000 pixels, used to notice a frozen
    /// source without hashing whole frames.
    pub fn content_checksum(&self) -> u32 {
        let count = 1000.min(self.width as usize * self.height as usize);
        let mut checksum = 0;
        for i in 0..count {
            let x = (i as u32) % self.width;
            let y = (i as u32) / self.width;
            checksum ^= self.pixel(x, y);
        }
        checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_matches_documented_pattern() {
        let mut frame = FrameView::new(300, 4, DrmFourcc::Xrgb8888);
        frame.fill_diagnostic_gradient();
        // pixel(x, y) = 0x00010101 * ((x + y) mod 256)
        assert_eq!(frame.pixel(0, 0), 0);
        assert_eq!(frame.pixel(1, 0), 0x00010101);
        assert_eq!(frame.pixel(10, 3), 0x00010101 * 13);
        assert_eq!(frame.pixel(255, 1), 0);
        assert_eq!(frame.pixel(256, 1), 0x00010101);
    }

    #[test]
    fn pixel_round_trips_through_rows() {
        let mut frame = FrameView::new(4, 2, DrmFourcc::Xrgb8888);
        frame.put_pixel(3, 1, 0xFF123456);
        assert_eq!(frame.pixel(3, 1), 0xFF123456);
        assert_eq!(frame.byte_size(), 4 * 2 * 4);
    }

    #[test]
    fn checksum_reacts_to_content_changes() {
        let mut frame = FrameView::new(64, 64, DrmFourcc::Xrgb8888);
        let before = frame.content_checksum();
        frame.put_pixel(5, 5, 0x00FF00FF);
        assert_ne!(frame.content_checksum(), before);
    }
}

use companion_protocol::{DecodeError, BYTES_PER_PIXEL, IMAGE_BUFFER_LEN, IMAGE_HEIGHT, IMAGE_WIDTH};

/// A 72×72 button face, row-major RGB without padding.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    rgb: Box<[u8]>,
}

impl Bitmap {
    pub fn black() -> Self {
        Self {
            rgb: vec![0; IMAGE_BUFFER_LEN].into_boxed_slice(),
        }
    }

    pub fn filled(rgb: [u8; 3]) -> Self {
        let data: Vec<u8> = rgb.iter().copied().cycle().take(IMAGE_BUFFER_LEN).collect();
        Self {
            rgb: data.into_boxed_slice(),
        }
    }

    pub fn from_rgb(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() != IMAGE_BUFFER_LEN {
            return Err(DecodeError::BufferLength {
                expected: IMAGE_BUFFER_LEN,
                actual: buffer.len(),
            });
        }
        Ok(Self {
            rgb: buffer.into(),
        })
    }

    pub fn width(&self) -> usize {
        IMAGE_WIDTH
    }

    pub fn height(&self) -> usize {
        IMAGE_HEIGHT
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= IMAGE_WIDTH || y >= IMAGE_HEIGHT {
            return None;
        }
        let pos = (y * IMAGE_WIDTH + x) * BYTES_PER_PIXEL;
        let px = self.rgb.get(pos..pos + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2]])
    }

    pub fn as_rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// Opaque RGBA copy for renderers that want four channels.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IMAGE_WIDTH * IMAGE_HEIGHT * 4);
        for px in self.rgb.chunks_exact(BYTES_PER_PIXEL) {
            out.extend_from_slice(px);
            out.push(0xFF);
        }
        out
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &IMAGE_WIDTH)
            .field("height", &IMAGE_HEIGHT)
            .finish_non_exhaustive()
    }
}

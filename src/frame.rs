use image::RgbImage;
use nalgebra::Point2;
use std::sync::Arc;

/// An immutable preview frame. Cloning is cheap; the pixel buffer is shared
/// between the preview display and the detection job that inspects it.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Returns a copy with every sample multiplied by `gain`, saturating at 255.
    pub fn brightened(&self, gain: f32) -> Frame {
        let mut scaled = (*self.image).clone();
        for sample in scaled.iter_mut() {
            *sample = (*sample as f32 * gain).round().clamp(0.0, 255.0) as u8;
        }
        Frame::new(scaled)
    }
}

/// Four corners of a detected chart, in the pixel space of the image it was
/// found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartQuad {
    pub corners: [Point2<f32>; 4],
}

impl ChartQuad {
    pub fn from_pairs(pairs: [[f32; 2]; 4]) -> Self {
        Self {
            corners: pairs.map(|[x, y]| Point2::new(x, y)),
        }
    }

    /// Scales each axis independently from `from` pixel dimensions to `to`,
    /// rounding to whole pixels.
    pub fn rescale(&self, from: (u32, u32), to: (u32, u32)) -> ChartQuad {
        let sx = to.0 as f32 / from.0.max(1) as f32;
        let sy = to.1 as f32 / from.1.max(1) as f32;
        ChartQuad {
            corners: self
                .corners
                .map(|p| Point2::new((p.x * sx).round(), (p.y * sy).round())),
        }
    }
}

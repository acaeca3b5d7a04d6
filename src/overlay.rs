use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_line_segment_mut;
use thiserror::Error;

use crate::frame::ChartQuad;

pub const DEFAULT_MISS_HYSTERESIS: u32 = 10;

const OUTLINE_COLOUR: Rgba<u8> = Rgba([0, 255, 0, 100]);
const OUTLINE_THICKNESS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayTransition {
    /// A chart was seen; redraw the outline at its latest position.
    Show,
    /// Too many consecutive misses; clear the outline.
    Hide,
    /// Nothing to redraw.
    Hold,
}

/// Smoothed "chart visible" flag. A hit shows the outline at once; it is only
/// hidden after more than `hysteresis` consecutive misses.
#[derive(Debug, Clone)]
pub struct OverlayState {
    shown: bool,
    misses: u32,
    hysteresis: u32,
}

impl Default for OverlayState {
    fn default() -> Self {
        Self::new(DEFAULT_MISS_HYSTERESIS)
    }
}

impl OverlayState {
    pub fn new(hysteresis: u32) -> Self {
        Self {
            shown: false,
            misses: 0,
            hysteresis,
        }
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn observe(&mut self, detected: bool) -> OverlayTransition {
        if detected {
            self.shown = true;
            self.misses = 0;
            return OverlayTransition::Show;
        }

        self.misses = self.misses.saturating_add(1);
        if self.shown && self.misses > self.hysteresis {
            self.shown = false;
            OverlayTransition::Hide
        } else {
            OverlayTransition::Hold
        }
    }
}

/// Draws `chart` as a closed outline on a transparent buffer, or returns a
/// fully transparent buffer when there is nothing to show.
pub fn render_overlay(size: (u32, u32), chart: Option<&ChartQuad>) -> RgbaImage {
    let mut overlay = RgbaImage::new(size.0, size.1);

    if let Some(chart) = chart {
        let half = OUTLINE_THICKNESS / 2;
        for i in 0..4 {
            let a = chart.corners[i];
            let b = chart.corners[(i + 1) % 4];
            for dx in -half..=half {
                for dy in -half..=half {
                    let (ox, oy) = (dx as f32, dy as f32);
                    draw_line_segment_mut(
                        &mut overlay,
                        (a.x + ox, a.y + oy),
                        (b.x + ox, b.y + oy),
                        OUTLINE_COLOUR,
                    );
                }
            }
        }
    }

    overlay
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("display surface has been torn down")]
    TornDown,
}

/// Wherever the overlay buffer ends up being shown.
pub trait OverlaySurface {
    fn set_overlay(&mut self, overlay: RgbaImage) -> Result<(), SurfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_misses_keep_overlay_shown() {
        let mut state = OverlayState::default();
        assert_eq!(state.observe(true), OverlayTransition::Show);

        for _ in 0..10 {
            assert_eq!(state.observe(false), OverlayTransition::Hold);
            assert!(state.is_shown());
        }

        assert_eq!(state.observe(false), OverlayTransition::Hide);
        assert!(!state.is_shown());

        // already hidden: further misses change nothing
        assert_eq!(state.observe(false), OverlayTransition::Hold);
    }

    #[test]
    fn test_hit_shows_regardless_of_misses() {
        let mut state = OverlayState::default();
        for _ in 0..50 {
            state.observe(false);
        }
        assert!(!state.is_shown());

        assert_eq!(state.observe(true), OverlayTransition::Show);
        assert!(state.is_shown());
        assert_eq!(state.misses(), 0);
    }

    #[test]
    fn test_late_hit_scenario() {
        let scores = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.9, 0.0, 0.0, 0.0];
        let mut state = OverlayState::default();

        let shown: Vec<bool> = scores
            .iter()
            .map(|score| {
                state.observe(*score > 0.5);
                state.is_shown()
            })
            .collect();

        let first_shown = shown.iter().position(|s| *s).unwrap();
        assert_eq!(first_shown + 1, 12);
        assert!(shown[11..].iter().all(|s| *s));
        assert_eq!(state.misses(), 3);
    }

    #[test]
    fn test_render_overlay_outline() {
        let chart = ChartQuad::from_pairs([[100.0, 100.0], [100.0, 300.0], [400.0, 300.0], [400.0, 100.0]]);
        let overlay = render_overlay((800, 800), Some(&chart));

        assert_eq!(overlay.dimensions(), (800, 800));
        assert_eq!(overlay.get_pixel(100, 200), &OUTLINE_COLOUR);
        assert_eq!(overlay.get_pixel(102, 200), &OUTLINE_COLOUR);
        assert_eq!(overlay.get_pixel(250, 200), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_render_overlay_cleared() {
        let overlay = render_overlay((16, 16), None);
        assert!(overlay.pixels().all(|p| p[3] == 0));
    }
}

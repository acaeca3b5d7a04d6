use egui::{ColorImage, Context, TextureHandle, TextureOptions};
use image::{RgbImage, RgbaImage};

use crate::overlay::{OverlaySurface, SurfaceError};

/// Camera preview, re-uploaded into the same texture every frame.
pub struct PreviewTexture {
    handle: Option<TextureHandle>,
}

impl PreviewTexture {
    pub fn new() -> Self {
        Self { handle: None }
    }

    pub fn handle(&self) -> Option<&TextureHandle> {
        self.handle.as_ref()
    }

    pub fn update(&mut self, ctx: &Context, image: &RgbImage) {
        // Skip invalid frames
        if image.width() == 0 || image.height() == 0 {
            return;
        }

        let size = [image.width() as usize, image.height() as usize];
        let color_image = ColorImage::from_rgb(size, image.as_raw());

        // Reuse the texture unless the frame size changed
        if let Some(texture) = self.handle.as_mut().filter(|t| t.size() == size) {
            texture.set(color_image, TextureOptions::LINEAR);
            return;
        }
        self.handle = Some(ctx.load_texture("camera_preview", color_image, TextureOptions::LINEAR));
    }
}

/// The chart outline layer drawn on top of the preview.
pub struct OverlayTexture {
    ctx: Option<Context>,
    handle: Option<TextureHandle>,
}

impl OverlayTexture {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: Some(ctx.clone()),
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&TextureHandle> {
        self.handle.as_ref()
    }

    /// The window is going away; later updates are refused.
    pub fn detach(&mut self) {
        self.ctx = None;
        self.handle = None;
    }
}

impl OverlaySurface for OverlayTexture {
    fn set_overlay(&mut self, overlay: RgbaImage) -> Result<(), SurfaceError> {
        let ctx = self.ctx.as_ref().ok_or(SurfaceError::TornDown)?;

        let size = [overlay.width() as usize, overlay.height() as usize];
        let color_image = ColorImage::from_rgba_unmultiplied(size, overlay.as_raw());

        match &mut self.handle {
            Some(texture) => texture.set(color_image, TextureOptions::LINEAR),
            None => {
                self.handle = Some(ctx.load_texture("chart_overlay", color_image, TextureOptions::LINEAR));
            }
        }
        ctx.request_repaint();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::render_overlay;

    #[test]
    fn test_overlay_texture_refuses_after_detach() {
        let ctx = Context::default();
        let mut surface = OverlayTexture::new(&ctx);

        surface.set_overlay(render_overlay((80, 80), None)).unwrap();
        assert_eq!(surface.handle().map(|t| t.size()), Some([80, 80]));

        surface.detach();
        assert!(matches!(
            surface.set_overlay(render_overlay((80, 80), None)),
            Err(SurfaceError::TornDown)
        ));
        assert!(surface.handle().is_none());
    }

    #[test]
    fn test_preview_texture_follows_frame_size() {
        let ctx = Context::default();
        let mut preview = PreviewTexture::new();

        preview.update(&ctx, &RgbImage::new(0, 10));
        assert!(preview.handle().is_none());

        preview.update(&ctx, &RgbImage::new(32, 24));
        assert_eq!(preview.handle().map(|t| t.size()), Some([32, 24]));
        preview.update(&ctx, &RgbImage::new(64, 48));
        assert_eq!(preview.handle().map(|t| t.size()), Some([64, 48]));
    }
}

// src/ui.rs - Theme and painting helpers for the scan viewer
use eframe::egui::{self, Align2, Color32, FontId, Pos2, Rect, Vec2};
use nalgebra::Point2;

use crate::overlay::{Composite, HINT};

#[derive(Debug, Clone)]
pub struct Theme {
    pub background: Color32,
    pub surface: Color32,
    pub cast: Color32,
    pub marker_label: Color32,
    pub text_primary: Color32,
    pub text_secondary: Color32,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            background: Color32::from_rgb(20, 20, 25),
            surface: Color32::from_rgb(50, 50, 55),
            cast: Color32::from_rgb(255, 152, 0),
            marker_label: Color32::from_rgb(244, 67, 54),
            text_primary: Color32::WHITE,
            text_secondary: Color32::from_rgb(200, 200, 200),
        }
    }
}

/// Largest size with the image's aspect ratio that fits in `available`.
pub fn fit_size(image: [usize; 2], available: Vec2) -> Vec2 {
    if image[0] == 0 || image[1] == 0 {
        return available;
    }
    let aspect = image[0] as f32 / image[1] as f32;
    let width = available.x.min(available.y * aspect);
    Vec2::new(width, width / aspect)
}

/// Maps a point in image pixels into the screen rect the image is drawn in.
pub fn to_screen(rect: Rect, image: [usize; 2], point: Point2<f32>) -> Pos2 {
    let sx = rect.width() / image[0].max(1) as f32;
    let sy = rect.height() / image[1].max(1) as f32;
    Pos2::new(rect.min.x + point.x * sx, rect.min.y + point.y * sy)
}

/// The composited camera frame plus its text annotations.
pub struct VideoWidget {
    texture: Option<egui::TextureHandle>,
    size: [usize; 2],
    theme: Theme,
}

impl VideoWidget {
    pub fn new(theme: Theme) -> Self {
        Self {
            texture: None,
            size: [0, 0],
            theme,
        }
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    pub fn update_frame(&mut self, ctx: &egui::Context, composite: &Composite) {
        let size = [composite.image.width() as usize, composite.image.height() as usize];
        let color_image = egui::ColorImage::from_rgb(size, composite.image.as_raw());
        match &mut self.texture {
            Some(texture) if self.size == size => texture.set(color_image, Default::default()),
            slot => *slot = Some(ctx.load_texture("scan_frame", color_image, Default::default())),
        }
        self.size = size;
    }

    pub fn show(&self, ui: &mut egui::Ui, composite: Option<&Composite>) {
        let size = fit_size(self.size, ui.available_size());
        let (rect, _response) = ui.allocate_exact_size(size, egui::Sense::hover());
        let painter = ui.painter();

        let Some(texture) = self.texture.as_ref() else {
            painter.rect_filled(rect, egui::Rounding::same(4.0), self.theme.surface);
            painter.text(
                rect.center(),
                Align2::CENTER_CENTER,
                "No Video Signal",
                FontId::proportional(16.0),
                self.theme.text_secondary,
            );
            return;
        };

        painter.image(
            texture.id(),
            rect,
            Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
            Color32::WHITE,
        );

        let Some(composite) = composite else {
            return;
        };
        for marker in &composite.markers {
            let at = to_screen(rect, self.size, marker.position) + Vec2::new(8.0, -8.0);
            painter.text(
                at,
                Align2::LEFT_BOTTOM,
                marker.track_id.to_string(),
                FontId::monospace(12.0),
                self.theme.marker_label,
            );
        }

        painter.text(
            rect.left_top() + Vec2::new(10.0, 10.0),
            Align2::LEFT_TOP,
            format!("epoch {}  {:.1} fps", composite.epoch, composite.fps),
            FontId::monospace(14.0),
            self.theme.text_secondary,
        );

        if let Some(cast) = &composite.cast {
            painter.text(
                rect.center_top() + Vec2::new(0.0, 40.0),
                Align2::CENTER_TOP,
                format!("{}  {}", cast.gesture.name().to_uppercase(), cast.at.format("%H:%M:%S")),
                FontId::proportional(28.0),
                self.theme.cast,
            );
        }

        painter.text(
            rect.left_bottom() + Vec2::new(10.0, -10.0),
            Align2::LEFT_BOTTOM,
            HINT,
            FontId::proportional(16.0),
            self.theme.text_primary,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_keeps_aspect_inside_a_wide_area() {
        let size = fit_size([640, 480], Vec2::new(1000.0, 480.0));
        assert_eq!(size, Vec2::new(640.0, 480.0));
    }

    #[test]
    fn fit_keeps_aspect_inside_a_tall_area() {
        let size = fit_size([640, 480], Vec2::new(320.0, 1000.0));
        assert_eq!(size, Vec2::new(320.0, 240.0));
    }

    #[test]
    fn image_points_scale_into_the_rect() {
        let rect = Rect::from_min_size(Pos2::new(10.0, 20.0), Vec2::new(320.0, 240.0));
        let pos = to_screen(rect, [640, 480], Point2::new(100.0, 200.0));
        assert_eq!(pos, Pos2::new(60.0, 120.0));
    }
}

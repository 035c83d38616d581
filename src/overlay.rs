// src/overlay.rs - Per-epoch trace mask, frame compositing and the render sink seam
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use nalgebra::Point2;

use crate::gesture::Gesture;

pub const HINT: &str = "Press ESC to close.";

const TRACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const MARKER_RADIUS: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub track_id: usize,
    pub position: Point2<f32>,
}

#[derive(Debug, Clone)]
pub struct Cast {
    pub gesture: Gesture,
    pub at: DateTime<Local>,
}

/// What a render sink receives each tracked frame.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbImage,
    pub markers: Vec<Marker>,
    pub cast: Option<Cast>,
    pub epoch: u64,
    pub fps: f32,
}

/// A named display surface.
pub trait RenderSink: Send {
    fn show(&mut self, surface: &str, composite: Composite);
    fn close(&mut self, surface: &str);
}

/// Discards frames; used when running without a window.
#[derive(Debug, Default)]
pub struct HeadlessSink {
    shown: u64,
}

impl RenderSink for HeadlessSink {
    fn show(&mut self, surface: &str, composite: Composite) {
        self.shown += 1;
        tracing::trace!(
            "{}: frame {} epoch {} with {} markers",
            surface,
            self.shown,
            composite.epoch,
            composite.markers.len()
        );
    }

    fn close(&mut self, surface: &str) {
        tracing::debug!("{} closed after {} frames", surface, self.shown);
    }
}

/// Motion traces accumulated over one epoch plus the last cast.
pub struct Overlay {
    traces: RgbImage,
    cast: Option<Cast>,
}

impl Overlay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            traces: RgbImage::new(width, height),
            cast: None,
        }
    }

    pub fn traces(&self) -> &RgbImage {
        &self.traces
    }

    pub fn cast(&self) -> Option<&Cast> {
        self.cast.as_ref()
    }

    /// Draws a 2px segment from `from` to `to`.
    pub fn trace(&mut self, from: Point2<f32>, to: Point2<f32>) {
        for (ox, oy) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
            draw_line_segment_mut(
                &mut self.traces,
                (from.x + ox, from.y + oy),
                (to.x + ox, to.y + oy),
                TRACE_COLOR,
            );
        }
    }

    pub fn record_cast(&mut self, gesture: Gesture) {
        self.cast = Some(Cast {
            gesture,
            at: Local::now(),
        });
    }

    /// Saturating-adds the traces onto `frame` and dots every marker.
    pub fn compose(&self, frame: &RgbImage, markers: Vec<Marker>, epoch: u64, fps: f32) -> Composite {
        let mut image = frame.clone();
        if image.dimensions() == self.traces.dimensions() {
            for (dst, src) in image.pixels_mut().zip(self.traces.pixels()) {
                for c in 0..3 {
                    dst[c] = dst[c].saturating_add(src[c]);
                }
            }
        }
        for marker in &markers {
            draw_filled_circle_mut(
                &mut image,
                (marker.position.x.round() as i32, marker.position.y.round() as i32),
                MARKER_RADIUS,
                MARKER_COLOR,
            );
        }
        Composite {
            image,
            markers,
            cast: self.cast.clone(),
            epoch,
            fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_overlay_is_blank() {
        let overlay = Overlay::new(32, 16);
        assert!(overlay.traces().pixels().all(|p| p.0 == [0, 0, 0]));
        assert!(overlay.cast().is_none());
    }

    #[test]
    fn traces_are_green_and_saturate_onto_the_frame() {
        let mut overlay = Overlay::new(32, 16);
        overlay.trace(Point2::new(2.0, 8.0), Point2::new(20.0, 8.0));
        assert_eq!(overlay.traces().get_pixel(10, 8), &TRACE_COLOR);

        let frame = RgbImage::from_pixel(32, 16, Rgb([200, 200, 200]));
        let composite = overlay.compose(&frame, Vec::new(), 1, 24.0);
        assert_eq!(composite.image.get_pixel(10, 8), &Rgb([200, 255, 200]));
        assert_eq!(composite.image.get_pixel(10, 2), &Rgb([200, 200, 200]));
    }

    #[test]
    fn markers_are_dotted_and_carried() {
        let overlay = Overlay::new(32, 32);
        let frame = RgbImage::new(32, 32);
        let markers = vec![Marker {
            track_id: 3,
            position: Point2::new(16.0, 16.0),
        }];

        let composite = overlay.compose(&frame, markers.clone(), 2, 0.0);
        assert_eq!(composite.image.get_pixel(16, 16), &MARKER_COLOR);
        assert_eq!(composite.markers, markers);
        assert_eq!(composite.epoch, 2);
    }

    #[test]
    fn last_cast_rides_along() {
        let mut overlay = Overlay::new(8, 8);
        overlay.record_cast(Gesture::Nox);
        let composite = overlay.compose(&RgbImage::new(8, 8), Vec::new(), 1, 0.0);
        assert_eq!(composite.cast.map(|c| c.gesture), Some(Gesture::Nox));
    }
}

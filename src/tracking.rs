// src/tracking.rs - Sparse pyramidal Lucas-Kanade point tracking
use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Side of the square integration window, in pixels.
    pub window_size: u32,
    /// Coarsest pyramid level; 0 tracks on the full-resolution frame only.
    pub max_level: usize,
    pub max_iterations: u32,
    /// Stop iterating once a correction is shorter than this, in pixels.
    pub epsilon: f32,
    /// Minimum eigenvalue of the window's structure tensor, normalized by
    /// window area on [0, 1] intensities.
    pub min_eigen_threshold: f32,
    /// Mean absolute intensity difference on [0, 1] between the window and
    /// its match in the next frame, above which the point is lost.
    pub max_error: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_size: 15,
            max_level: 2,
            max_iterations: 10,
            epsilon: 0.03,
            min_eigen_threshold: 1e-4,
            max_error: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingFault {
    #[error("frame shape changed from {prev:?} to {next:?}")]
    ShapeMismatch { prev: (u32, u32), next: (u32, u32) },
    #[error("cannot track on an empty frame")]
    EmptyFrame,
    #[error("point {index} is not a finite image coordinate")]
    InvalidPoint { index: usize },
}

/// Per-point flow output: `next[i]` is `Some` iff point `i` was tracked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowResult {
    pub next: Vec<Option<Point2<f32>>>,
}

impl FlowResult {
    pub fn validity_mask(&self) -> Vec<bool> {
        self.next.iter().map(Option::is_some).collect()
    }

    pub fn tracked(&self) -> usize {
        self.next.iter().filter(|p| p.is_some()).count()
    }
}

/// A single-channel float image with clamped bilinear sampling.
#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
        }
    }

    fn px(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let (ix, iy) = (x0 as isize, y0 as isize);
        let top = self.px(ix, iy) * (1.0 - fx) + self.px(ix + 1, iy) * fx;
        let bottom = self.px(ix, iy + 1) * (1.0 - fx) + self.px(ix + 1, iy + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn contains(&self, p: &Point2<f32>) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x <= (self.width - 1) as f32 && p.y <= (self.height - 1) as f32
    }

    /// 5-tap binomial blur followed by 2x decimation.
    fn pyr_down(&self) -> Self {
        const K: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];
        let (w, h) = (self.width, self.height);

        let mut rows = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                rows[y * w + x] = K
                    .iter()
                    .enumerate()
                    .map(|(k, c)| c * self.px(x as isize + k as isize - 2, y as isize))
                    .sum();
            }
        }
        let rows = Plane { width: w, height: h, data: rows };

        let (dw, dh) = ((w + 1) / 2, (h + 1) / 2);
        let mut data = Vec::with_capacity(dw * dh);
        for y in 0..dh {
            for x in 0..dw {
                let (sx, sy) = (2 * x as isize, 2 * y as isize);
                data.push(
                    K.iter()
                        .enumerate()
                        .map(|(k, c)| c * rows.px(sx, sy + k as isize - 2))
                        .sum(),
                );
            }
        }
        Plane { width: dw, height: dh, data }
    }
}

struct Pyramid {
    levels: Vec<Plane>,
}

impl Pyramid {
    fn build(gray: &GrayImage, max_level: usize, window: usize) -> Self {
        let mut levels = vec![Plane::from_gray(gray)];
        while levels.len() <= max_level {
            let last = &levels[levels.len() - 1];
            if last.width / 2 < window || last.height / 2 < window {
                break;
            }
            let next = last.pyr_down();
            levels.push(next);
        }
        Self { levels }
    }
}

pub struct PointTracker {
    config: FlowConfig,
}

impl PointTracker {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    /// Follows `points` from `prev` into `next`. An empty point set is not
    /// a fault; it yields an empty result.
    pub fn track(
        &self,
        prev: &GrayImage,
        points: &[Point2<f32>],
        next: &GrayImage,
    ) -> Result<FlowResult, TrackingFault> {
        if prev.dimensions() != next.dimensions() {
            return Err(TrackingFault::ShapeMismatch {
                prev: prev.dimensions(),
                next: next.dimensions(),
            });
        }
        if prev.width() == 0 || prev.height() == 0 {
            return Err(TrackingFault::EmptyFrame);
        }
        if let Some(index) = points.iter().position(|p| !(p.x.is_finite() && p.y.is_finite())) {
            return Err(TrackingFault::InvalidPoint { index });
        }
        if points.is_empty() {
            return Ok(FlowResult::default());
        }

        let window = self.config.window_size.max(3) as usize;
        let prev_pyr = Pyramid::build(prev, self.config.max_level, window);
        let next_pyr = Pyramid::build(next, self.config.max_level, window);

        let next = points
            .iter()
            .map(|p| self.track_point(&prev_pyr, &next_pyr, *p))
            .collect();
        Ok(FlowResult { next })
    }

    fn track_point(&self, prev: &Pyramid, next: &Pyramid, point: Point2<f32>) -> Option<Point2<f32>> {
        let half = (self.config.window_size.max(3) / 2) as i32;
        let area = ((2 * half + 1) * (2 * half + 1)) as f32;
        let eps_sq = self.config.epsilon * self.config.epsilon;
        let top = prev.levels.len().min(next.levels.len()) - 1;

        let mut flow = Vector2::<f32>::zeros();
        for level in (0..=top).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            let (i_plane, j_plane) = (&prev.levels[level], &next.levels[level]);
            let origin = Point2::new(point.x * scale, point.y * scale);

            // Template intensities and gradients around the previous position.
            let mut template = Vec::with_capacity(area as usize);
            let (mut gxx, mut gxy, mut gyy) = (0.0f32, 0.0f32, 0.0f32);
            for dy in -half..=half {
                for dx in -half..=half {
                    let (x, y) = (origin.x + dx as f32, origin.y + dy as f32);
                    let ix = (i_plane.sample(x + 1.0, y) - i_plane.sample(x - 1.0, y)) * 0.5;
                    let iy = (i_plane.sample(x, y + 1.0) - i_plane.sample(x, y - 1.0)) * 0.5;
                    gxx += ix * ix;
                    gxy += ix * iy;
                    gyy += iy * iy;
                    template.push((i_plane.sample(x, y), ix, iy));
                }
            }

            let min_eig = (gxx + gyy - ((gxx - gyy).powi(2) + 4.0 * gxy * gxy).sqrt()) / (2.0 * area);
            let inverse = Matrix2::new(gxx, gxy, gxy, gyy).try_inverse();
            let inverse = match inverse {
                Some(inv) if min_eig >= self.config.min_eigen_threshold => inv,
                _ if level == 0 => return None,
                _ => {
                    flow *= 2.0;
                    continue;
                }
            };

            let mut guess = origin + flow;
            for _ in 0..self.config.max_iterations {
                if !j_plane.contains(&guess) {
                    if level == 0 {
                        return None;
                    }
                    break;
                }

                let mut mismatch = Vector2::<f32>::zeros();
                let mut taps = template.iter();
                for dy in -half..=half {
                    for dx in -half..=half {
                        if let Some(&(value, ix, iy)) = taps.next() {
                            let diff = value - j_plane.sample(guess.x + dx as f32, guess.y + dy as f32);
                            mismatch += Vector2::new(diff * ix, diff * iy);
                        }
                    }
                }

                let delta = inverse * mismatch;
                guess += delta;
                if delta.norm_squared() <= eps_sq {
                    break;
                }
            }

            if level == 0 {
                let error = residual(&template, j_plane, guess, half);
                if error > self.config.max_error {
                    tracing::trace!("lost ({:.1}, {:.1}): residual {:.3}", point.x, point.y, error);
                    return None;
                }
            }

            flow = guess - origin;
            if level > 0 {
                flow *= 2.0;
            }
        }

        let tracked = point + flow;
        let base = &next.levels[0];
        (tracked.x.is_finite() && tracked.y.is_finite() && base.contains(&tracked)).then_some(tracked)
    }
}

/// Mean absolute difference between the template and the window at `at`.
fn residual(template: &[(f32, f32, f32)], plane: &Plane, at: Point2<f32>, half: i32) -> f32 {
    let mut taps = template.iter();
    let mut total = 0.0f32;
    for dy in -half..=half {
        for dx in -half..=half {
            if let Some(&(value, _, _)) = taps.next() {
                total += (value - plane.sample(at.x + dx as f32, at.y + dy as f32)).abs();
            }
        }
    }
    total / template.len().max(1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Gaussian glints on a dark background, the way an IR-lit wand tip reads.
    fn glints(w: u32, h: u32, centers: &[(f32, f32)]) -> GrayImage {
        let sigma = 3.0f32;
        GrayImage::from_fn(w, h, |x, y| {
            let v: f32 = centers
                .iter()
                .map(|&(cx, cy)| {
                    let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
                    230.0 * (-d2 / (2.0 * sigma * sigma)).exp()
                })
                .sum();
            Luma([(10.0 + v).min(255.0) as u8])
        })
    }

    fn close(p: &Point2<f32>, x: f32, y: f32, tol: f32) -> bool {
        (p.x - x).abs() <= tol && (p.y - y).abs() <= tol
    }

    #[test]
    fn still_scene_stays_put() {
        let tracker = PointTracker::new(FlowConfig::default());
        let frame = glints(160, 120, &[(60.0, 50.0)]);
        let flow = tracker.track(&frame, &[Point2::new(60.0, 50.0)], &frame).unwrap();

        let p = flow.next[0].expect("tracked");
        assert!(close(&p, 60.0, 50.0, 0.05), "{:?}", p);
    }

    #[test]
    fn follows_a_small_shift() {
        let tracker = PointTracker::new(FlowConfig::default());
        let prev = glints(160, 120, &[(60.0, 50.0)]);
        let next = glints(160, 120, &[(63.0, 52.0)]);

        let flow = tracker.track(&prev, &[Point2::new(60.0, 50.0)], &next).unwrap();
        let p = flow.next[0].expect("tracked");
        assert!(close(&p, 63.0, 52.0, 0.25), "{:?}", p);
    }

    #[test]
    fn pyramid_recovers_a_wand_flick() {
        let tracker = PointTracker::new(FlowConfig::default());
        let prev = glints(200, 200, &[(100.0, 100.0)]);
        let next = glints(200, 200, &[(106.0, 100.0)]);

        let flow = tracker.track(&prev, &[Point2::new(100.0, 100.0)], &next).unwrap();
        let p = flow.next[0].expect("tracked");
        assert!(close(&p, 106.0, 100.0, 0.3), "{:?}", p);
    }

    #[test]
    fn flick_beyond_the_pyramid_is_lost_not_stuck() {
        let tracker = PointTracker::new(FlowConfig::default());
        let prev = glints(640, 480, &[(300.0, 240.0)]);

        for dx in [20.0, 28.0] {
            let next = glints(640, 480, &[(300.0 + dx, 240.0)]);
            let flow = tracker.track(&prev, &[Point2::new(300.0, 240.0)], &next).unwrap();
            assert_eq!(flow.next[0], None, "dx={} tracked to {:?}", dx, flow.next[0]);
        }
    }

    #[test]
    fn featureless_window_is_reported_lost() {
        let tracker = PointTracker::new(FlowConfig::default());
        let prev = glints(160, 120, &[(30.0, 30.0)]);
        let next = glints(160, 120, &[(30.0, 30.0)]);

        let flow = tracker
            .track(&prev, &[Point2::new(30.0, 30.0), Point2::new(120.0, 90.0)], &next)
            .unwrap();
        assert_eq!(flow.validity_mask(), vec![true, false]);
        assert_eq!(flow.tracked(), 1);
    }

    #[test]
    fn no_points_is_an_empty_success() {
        let tracker = PointTracker::new(FlowConfig::default());
        let frame = glints(64, 64, &[]);
        assert_eq!(tracker.track(&frame, &[], &frame), Ok(FlowResult::default()));
    }

    #[test]
    fn resized_frame_is_a_fault() {
        let tracker = PointTracker::new(FlowConfig::default());
        let prev = glints(64, 64, &[(32.0, 32.0)]);
        let next = glints(80, 64, &[(32.0, 32.0)]);

        let err = tracker.track(&prev, &[Point2::new(32.0, 32.0)], &next).unwrap_err();
        assert_eq!(
            err,
            TrackingFault::ShapeMismatch { prev: (64, 64), next: (80, 64) }
        );
    }

    #[test]
    fn non_finite_point_is_a_fault() {
        let tracker = PointTracker::new(FlowConfig::default());
        let frame = glints(64, 64, &[(32.0, 32.0)]);
        let points = [Point2::new(32.0, 32.0), Point2::new(f32::NAN, 1.0)];

        assert_eq!(
            tracker.track(&frame, &points, &frame),
            Err(TrackingFault::InvalidPoint { index: 1 })
        );
    }
}

// src/detect.rs - Bright-blob candidate detection with a gradient Hough circle transform
use image::GrayImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Finds wand-tip candidates in a grayscale frame. An empty result is a
/// valid answer ("nothing trackable in this scene"), not a failure.
pub trait Detect: Send {
    fn detect(&self, gray: &GrayImage) -> Vec<Point2<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Accumulator downsampling relative to the image.
    pub dp: f32,
    pub min_distance: f32,
    /// Upper Canny threshold; the lower one is half of it.
    pub canny_high: f32,
    pub accumulator_threshold: u32,
    pub min_radius: u32,
    pub max_radius: u32,
    pub max_candidates: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            dp: 3.0,
            min_distance: 100.0,
            canny_high: 100.0,
            accumulator_threshold: 30,
            min_radius: 4,
            max_radius: 15,
            max_candidates: 20,
        }
    }
}

pub struct CandidateDetector {
    config: DetectorConfig,
}

struct Accumulator {
    width: usize,
    height: usize,
    votes: Vec<u32>,
}

impl Accumulator {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            votes: vec![0; width * height],
        }
    }

    fn at(&self, x: usize, y: usize) -> u32 {
        self.votes[y * self.width + x]
    }

    /// Cells above `threshold` that beat their 4-neighbourhood, strongest first.
    fn peaks(&self, threshold: u32) -> Vec<(usize, usize, u32)> {
        let mut peaks = Vec::new();
        for y in 1..self.height.saturating_sub(1) {
            for x in 1..self.width.saturating_sub(1) {
                let v = self.at(x, y);
                if v > threshold
                    && v > self.at(x - 1, y)
                    && v >= self.at(x + 1, y)
                    && v > self.at(x, y - 1)
                    && v >= self.at(x, y + 1)
                {
                    peaks.push((x, y, v));
                }
            }
        }
        peaks.sort_by(|a, b| b.2.cmp(&a.2));
        peaks
    }
}

impl CandidateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    fn edge_points(&self, gray: &GrayImage) -> Vec<(u32, u32)> {
        let high = self.config.canny_high.max(1.0);
        let edges = imageproc::edges::canny(gray, (high / 2.0).max(1.0), high);
        edges
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] > 0)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    fn vote(&self, gray: &GrayImage, edges: &[(u32, u32)]) -> Accumulator {
        let dp = self.config.dp.max(1.0);
        let (w, h) = gray.dimensions();
        let mut acc = Accumulator::new(
            (w as f32 / dp).ceil() as usize,
            (h as f32 / dp).ceil() as usize,
        );

        let gx = imageproc::gradients::horizontal_sobel(gray);
        let gy = imageproc::gradients::vertical_sobel(gray);

        for &(x, y) in edges {
            let vx = gx.get_pixel(x, y)[0] as f32;
            let vy = gy.get_pixel(x, y)[0] as f32;
            let mag = vx.hypot(vy);
            if mag == 0.0 {
                continue;
            }
            let (ux, uy) = (vx / mag, vy / mag);

            // Walk both ways along the gradient: the center of a bright blob
            // lies against it, a dark ring's along it.
            for sign in [1.0f32, -1.0] {
                for r in self.config.min_radius..=self.config.max_radius {
                    let px = x as f32 + sign * ux * r as f32;
                    let py = y as f32 + sign * uy * r as f32;
                    if px < 0.0 || py < 0.0 {
                        break;
                    }
                    let (ax, ay) = ((px / dp) as usize, (py / dp) as usize);
                    if ax >= acc.width || ay >= acc.height {
                        break;
                    }
                    acc.votes[ay * acc.width + ax] += 1;
                }
            }
        }
        acc
    }

    /// Densest band of edge distances around `center`, as (radius, support).
    /// `center` is an accumulator cell center, so distances get one pixel of
    /// slack on both ends of the radius range.
    fn estimate_radius(&self, center: Point2<f32>, edges: &[(u32, u32)]) -> Option<(f32, usize)> {
        let min_r = (self.config.min_radius as f32 - 1.0).max(0.0);
        let max_r = self.config.max_radius as f32 + 1.0;
        let mut dists: Vec<f32> = edges
            .iter()
            .map(|&(x, y)| (x as f32 - center.x).hypot(y as f32 - center.y))
            .filter(|d| *d >= min_r && *d <= max_r)
            .collect();
        if dists.is_empty() {
            return None;
        }
        dists.sort_by(|a, b| a.total_cmp(b));

        let band = self.config.dp.max(1.0);
        let mut best: Option<(f32, usize)> = None;
        let mut end = 0;
        for start in 0..dists.len() {
            while end < dists.len() && dists[end] - dists[start] <= band {
                end += 1;
            }
            let support = end - start;
            if best.map_or(true, |(_, s)| support > s) {
                best = Some((dists[(start + end - 1) / 2], support));
            }
        }
        best
    }

    /// Edge points a circle of `radius` needs: the accumulator threshold, or
    /// half its circumference for circles too small to reach it.
    fn required_support(&self, radius: f32) -> f32 {
        (self.config.accumulator_threshold as f32).min(std::f32::consts::PI * radius)
    }
}

impl Detect for CandidateDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<Point2<f32>> {
        let edges = self.edge_points(gray);
        if edges.is_empty() {
            return Vec::new();
        }

        let acc = self.vote(gray, &edges);
        let dp = self.config.dp.max(1.0);
        let mut found: Vec<Point2<f32>> = Vec::new();

        for (ax, ay, votes) in acc.peaks(self.config.accumulator_threshold) {
            if found.len() >= self.config.max_candidates {
                break;
            }
            let center = Point2::new((ax as f32 + 0.5) * dp, (ay as f32 + 0.5) * dp);
            if found
                .iter()
                .any(|c| nalgebra::distance(c, &center) < self.config.min_distance)
            {
                continue;
            }
            match self.estimate_radius(center, &edges) {
                Some((radius, support)) if support as f32 >= self.required_support(radius) => {
                    tracing::trace!(
                        "candidate at ({:.1}, {:.1}) r={:.1} votes={} support={}",
                        center.x,
                        center.y,
                        radius,
                        votes,
                        support
                    );
                    found.push(center);
                }
                _ => {}
            }
        }
        found
    }
}

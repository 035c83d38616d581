// src/video.rs - Frame sources (live camera, still-image replay) and grayscale conditioning
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use image::{GrayImage, RgbImage};
use imageproc::distance_transform::Norm;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use thiserror::Error;

use crate::config::{CameraConfig, PreprocessConfig};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("frame source exhausted")]
    Exhausted,
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }
}

/// Produces decoded color frames on request. Implementations may block.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Stops the underlying device. Called once when the session closes.
    fn release(&mut self) {}
}

pub struct CameraSource {
    camera: Camera,
    mirror: bool,
    sequence: u64,
}

impl CameraSource {
    pub fn open(config: &CameraConfig) -> anyhow::Result<Self> {
        tracing::debug!(
            "opening camera {} at {}x{}@{}",
            config.index,
            config.width,
            config.height,
            config.fps
        );

        let format = CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            config.fps,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(format));

        let mut camera = Camera::new(CameraIndex::Index(config.index), requested)
            .map_err(|e| anyhow!("Failed to open camera {}: {}", config.index, e))?;
        camera
            .open_stream()
            .map_err(|e| anyhow!("Failed to open camera stream: {}", e))?;

        let resolution = camera.resolution();
        tracing::info!(
            "camera {} streaming {}x{} @ {} fps",
            config.index,
            resolution.width(),
            resolution.height(),
            camera.frame_rate()
        );

        Ok(Self {
            camera,
            mirror: config.mirror,
            sequence: 0,
        })
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if !self.camera.is_stream_open() {
            self.camera
                .open_stream()
                .map_err(|e| anyhow!("Failed to reopen camera stream: {}", e))?;
        }

        let buffer = self
            .camera
            .frame()
            .map_err(|e| anyhow!("Failed to capture frame: {}", e))?;
        let mut image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| anyhow!("Failed to decode frame: {}", e))?;

        if self.mirror {
            image::imageops::flip_horizontal_in_place(&mut image);
        }

        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }

    fn release(&mut self) {
        if self.camera.is_stream_open() {
            if let Err(e) = self.camera.stop_stream() {
                tracing::warn!("failed to stop camera stream: {}", e);
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Replays a directory of still frames (PNG/JPEG, lexical order).
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    cursor: usize,
    mirror: bool,
    interval: Option<Duration>,
    last_capture: Option<Instant>,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>, fps: Option<u32>, mirror: bool) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Cannot read replay directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false);
            if is_image {
                frames.push(path);
            }
        }
        frames.sort();

        if frames.is_empty() {
            return Err(anyhow!("No PNG or JPEG frames in {}", dir.display()));
        }
        tracing::info!("replaying {} frames from {}", frames.len(), dir.display());

        Ok(Self {
            frames,
            cursor: 0,
            mirror,
            interval: fps.filter(|fps| *fps > 0).map(|fps| Duration::from_secs_f64(1.0 / fps as f64)),
            last_capture: None,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_capture) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());
    }
}

impl FrameSource for ImageSequenceSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let path = self.frames.get(self.cursor).ok_or(CaptureError::Exhausted)?.clone();
        self.cursor += 1;
        self.pace();

        let mut image = image::open(&path)
            .with_context(|| format!("Failed to load frame {}", path.display()))?
            .to_rgb8();
        if self.mirror {
            image::imageops::flip_horizontal_in_place(&mut image);
        }
        Ok(Frame::new(image, self.cursor as u64))
    }
}

/// Converts a color frame to the grayscale image the detector and tracker consume.
pub fn grayscale(image: &RgbImage, preprocess: &PreprocessConfig) -> GrayImage {
    let mut gray = image::imageops::grayscale(image);
    if preprocess.equalize {
        gray = imageproc::contrast::equalize_histogram(&gray);
    }
    if let Some(sigma) = preprocess.blur_sigma.filter(|s| *s > 0.0) {
        gray = imageproc::filter::gaussian_blur_f32(&gray, sigma);
    }
    if let Some(radius) = preprocess.dilate_radius.filter(|r| *r > 0) {
        gray = imageproc::morphology::dilate(&gray, Norm::LInf, radius);
    }
    gray
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn write_frame(dir: &Path, name: &str, lit: (u32, u32)) {
        let mut img = RgbImage::new(8, 4);
        img.put_pixel(lit.0, lit.1, Rgb([255, 255, 255]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn replay_yields_frames_in_order_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "frame_0002.png", (1, 0));
        write_frame(dir.path(), "frame_0001.png", (0, 0));
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), None, false).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.capture().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([255, 255, 255]));

        let second = source.capture().unwrap();
        assert_eq!(second.image.get_pixel(1, 0), &Rgb([255, 255, 255]));

        assert!(matches!(source.capture(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn replay_mirrors_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path(), "a.png", (0, 0));

        let mut source = ImageSequenceSource::open(dir.path(), None, true).unwrap();
        let frame = source.capture().unwrap();
        assert_eq!(frame.image.get_pixel(7, 0), &Rgb([255, 255, 255]));
        assert_eq!(frame.image.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn empty_replay_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::open(dir.path(), None, false).is_err());
    }

    #[test]
    fn grayscale_without_preprocessing_keeps_bright_spots() {
        let mut img = RgbImage::new(5, 5);
        img.put_pixel(2, 2, Rgb([255, 255, 255]));
        let gray = grayscale(&img, &PreprocessConfig::default());
        assert_eq!(gray.get_pixel(2, 2), &Luma([255]));
        assert_eq!(gray.get_pixel(0, 0), &Luma([0]));
    }

    #[test]
    fn dilation_grows_bright_spots() {
        let mut img = RgbImage::new(5, 5);
        img.put_pixel(2, 2, Rgb([255, 255, 255]));
        let preprocess = PreprocessConfig {
            dilate_radius: Some(1),
            ..Default::default()
        };
        let gray = grayscale(&img, &preprocess);
        assert_eq!(gray.get_pixel(1, 1), &Luma([255]));
        assert_eq!(gray.get_pixel(0, 0), &Luma([0]));
    }
}

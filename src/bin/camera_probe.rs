use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

/// Opens the camera the way the scanner does and reports where the
/// brightest spot is, to check IR lighting before a session.
fn main() {
    let index = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(0u32);
    println!("Probing camera {}...\n", index);

    let format = CameraFormat::new(Resolution::new(640, 480), FrameFormat::MJPEG, 24);
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(format));

    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(e) => {
            println!("✗ Failed to open camera: {}", e);
            println!("\nPossible causes:");
            println!("1. Camera is being used by another app");
            println!("2. Camera does not offer 640x480 MJPEG at 24 fps");
            println!("3. No camera connected");
            return;
        }
    };
    println!("✓ Camera opened");

    if let Err(e) = camera.open_stream() {
        println!("✗ Failed to open stream: {}", e);
        return;
    }
    let resolution = camera.resolution();
    println!(
        "✓ Stream opened at {}x{} @ {} fps",
        resolution.width(),
        resolution.height(),
        camera.frame_rate()
    );

    let image = match camera.frame().and_then(|buffer| buffer.decode_image::<RgbFormat>()) {
        Ok(image) => image,
        Err(e) => {
            println!("✗ Failed to capture frame: {}", e);
            return;
        }
    };

    let gray = image::imageops::grayscale(&image);
    let total: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    let mean = total as f64 / (gray.width() * gray.height()).max(1) as f64;
    let (x, y, peak) = gray
        .enumerate_pixels()
        .map(|(x, y, p)| (x, y, p.0[0]))
        .max_by_key(|&(_, _, v)| v)
        .unwrap_or((0, 0, 0));

    println!("✓ Frame captured: mean brightness {:.1}", mean);
    println!("  brightest pixel {} at ({}, {})", peak, x, y);
    if peak < 200 {
        println!("  no strong glint; check the IR emitter and the wand tip");
    }

    let _ = camera.stop_stream();
}

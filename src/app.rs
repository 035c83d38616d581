// src/app.rs
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

use eframe::egui;

use crate::overlay::{Composite, RenderSink};
use crate::session::Shutdown;
use crate::ui::{Theme, VideoWidget};

const SINK_DEPTH: usize = 2;

#[derive(Debug)]
pub enum SinkMessage {
    Show(Composite),
    Close,
}

/// Hands composites from the session thread to the viewer. Frames are
/// dropped rather than queued when the viewer falls behind.
pub struct ChannelSink {
    tx: SyncSender<SinkMessage>,
}

pub fn channel() -> (ChannelSink, Receiver<SinkMessage>) {
    let (tx, rx) = mpsc::sync_channel(SINK_DEPTH);
    (ChannelSink { tx }, rx)
}

impl RenderSink for ChannelSink {
    fn show(&mut self, surface: &str, composite: Composite) {
        match self.tx.try_send(SinkMessage::Show(composite)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("{}: viewer busy, frame dropped", surface),
            Err(TrySendError::Disconnected(_)) => tracing::trace!("{}: viewer gone", surface),
        }
    }

    fn close(&mut self, surface: &str) {
        if self.tx.send(SinkMessage::Close).is_err() {
            tracing::debug!("{}: viewer already closed", surface);
        }
    }
}

pub struct WandViewerApp {
    rx: Receiver<SinkMessage>,
    video: VideoWidget,
    latest: Option<Composite>,
    shutdown: Shutdown,
    closing: bool,
}

impl WandViewerApp {
    pub fn new(rx: Receiver<SinkMessage>, shutdown: Shutdown) -> Self {
        Self {
            rx,
            video: VideoWidget::new(Theme::default()),
            latest: None,
            shutdown,
            closing: false,
        }
    }

    fn drain(&mut self, ctx: &egui::Context) {
        loop {
            match self.rx.try_recv() {
                Ok(SinkMessage::Show(composite)) => {
                    self.video.update_frame(ctx, &composite);
                    self.latest = Some(composite);
                }
                Ok(SinkMessage::Close) | Err(TryRecvError::Disconnected) => {
                    self.closing = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }
}

impl eframe::App for WandViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain(ctx);

        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) {
            tracing::info!("ESC pressed, stopping");
            self.shutdown.trigger();
            self.closing = true;
        }

        let fill = self.video.theme().background;
        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(fill))
            .show(ctx, |ui| {
                ui.centered_and_justified(|ui| self.video.show(ui, self.latest.as_ref()));
            });

        if self.closing {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }
        ctx.request_repaint();
    }
}

/// Blocks the calling (main) thread until the viewer window closes.
pub fn run_viewer(
    title: &str,
    size: [f32; 2],
    rx: Receiver<SinkMessage>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(title)
            .with_inner_size(size),
        centered: true,
        ..Default::default()
    };

    let app = WandViewerApp::new(rx, shutdown);
    eframe::run_native(title, options, Box::new(move |cc| {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());
        Box::new(app)
    }))
    .map_err(|e| anyhow::anyhow!("viewer failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::Overlay;
    use image::RgbImage;

    fn composite(epoch: u64) -> Composite {
        Overlay::new(4, 4).compose(&RgbImage::new(4, 4), Vec::new(), epoch, 0.0)
    }

    #[test]
    fn full_channel_drops_frames_instead_of_blocking() {
        let (mut sink, rx) = channel();
        for epoch in 0..5 {
            sink.show("scan", composite(epoch));
        }

        let epochs: Vec<u64> = rx
            .try_iter()
            .map(|m| match m {
                SinkMessage::Show(c) => c.epoch,
                SinkMessage::Close => u64::MAX,
            })
            .collect();
        assert_eq!(epochs, vec![0, 1]);
    }

    #[test]
    fn close_is_delivered_after_frames() {
        let (mut sink, rx) = channel();
        sink.show("scan", composite(1));
        sink.close("scan");

        assert!(matches!(rx.recv().unwrap(), SinkMessage::Show(_)));
        assert!(matches!(rx.recv().unwrap(), SinkMessage::Close));
    }

    #[test]
    fn sink_outlives_the_viewer() {
        let (mut sink, rx) = channel();
        drop(rx);
        sink.show("scan", composite(1));
        sink.close("scan");
    }
}

//! Shared GStreamer plumbing for the direct and stream adapters.
//!
//! A pipeline is parsed from a format string and must contain an `appsink`
//! named `sink` negotiating `video/x-raw,format=RGB`. Decoded frames are
//! forwarded through a bounded async channel; when the consumer lags, the
//! newest frame wins and older ones are dropped.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tokio::sync::mpsc;

use crate::error::{AgentError, Result};

/// One decoded RGB frame as delivered by the appsink.
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGB rows (stride removed).
    pub data: Vec<u8>,
}

/// Handle to a running pipeline delivering RGB frames.
pub struct FrameSource {
    pipeline: gst::Pipeline,
    rx: mpsc::Receiver<RawFrame>,
}

impl FrameSource {
    /// Parse, wire and start a pipeline.
    pub fn open(pipeline_str: &str, queue: usize) -> Result<Self> {
        gst::init().map_err(|e| AgentError::GStreamer(format!("gst::init: {e}")))?;

        let (tx, rx) = mpsc::channel::<RawFrame>(queue.max(1));

        let pipeline = gst::parse::launch(pipeline_str)
            .map_err(|e| AgentError::GStreamer(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| AgentError::GStreamer("Not a pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| AgentError::GStreamer("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| AgentError::GStreamer("Cast to AppSink failed".into()))?;

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info = gst_video::VideoInfo::from_caps(caps)
                        .map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let width = info.width();
                    let height = info.height();
                    let stride = info.stride()[0] as usize;
                    let row_bytes = width as usize * 3;
                    let src = map.as_slice();
                    let mut data = Vec::with_capacity(row_bytes * height as usize);
                    for row in 0..height as usize {
                        let start = row * stride;
                        if start + row_bytes > src.len() {
                            return Err(gst::FlowError::Error);
                        }
                        data.extend_from_slice(&src[start..start + row_bytes]);
                    }

                    // Non-blocking send; drop when the consumer is behind.
                    let _ = tx.try_send(RawFrame { width, height, data });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AgentError::GStreamer(format!("set_state Playing: {e}")))?;

        Ok(FrameSource { pipeline, rx })
    }

    /// Wait up to `timeout` for the next frame. `None` means the pipeline has
    /// stopped delivering (EOS, error, or a stalled source).
    pub async fn read_frame(&mut self, timeout: Duration) -> Option<RawFrame> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    /// Discard one buffered frame if present.
    pub fn drain_one(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Stop the pipeline cleanly.
    pub fn stop(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

//! RTSP frame source.
//!
//! Uses GStreamer for RTSP decode: `rtspsrc ! decodebin ! videoconvert ! appsink`.
//! The appsink keeps a single buffer and drops older ones, so the worker always
//! reads the freshest frame instead of working through a backlog.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{redact_url, FrameSource};
use crate::frame::Frame;
use crate::FootfallError;

pub struct RtspSource {
    url: String,
    frame_timeout: Duration,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
}

impl RtspSource {
    pub fn new(url: String, frame_timeout: Duration) -> Self {
        Self {
            url,
            frame_timeout,
            pipeline: None,
        }
    }

    fn build_pipeline(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok((pipeline, appsink))
    }

    fn poll_bus(pipeline: &gstreamer::Pipeline) -> Result<()> {
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(FootfallError::Connection(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ))
                    .into());
                }
                MessageView::Eos(..) => {
                    return Err(FootfallError::Decode("gstreamer reached EOS".to_string()).into());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        self.release();
        let (pipeline, appsink) = self.build_pipeline()?;
        pipeline.set_state(gstreamer::State::Playing).map_err(|e| {
            FootfallError::Connection(format!("{}: {}", redact_url(&self.url), e))
        })?;
        self.pipeline = Some((pipeline, appsink));
        log::info!("RtspSource: connected to {}", redact_url(&self.url));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let (pipeline, appsink) = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("rtsp source not connected; call connect() first"))?;
        Self::poll_bus(pipeline)?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let sample = appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| FootfallError::Decode("RTSP stream stalled".to_string()))?;
        sample_to_frame(&sample)
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!(
                    "RtspSource: failed to stop pipeline for {}: {}",
                    redact_url(&self.url),
                    err
                );
            }
        }
    }

    fn describe(&self) -> String {
        redact_url(&self.url)
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?;
        return Frame::new(packed.to_vec(), width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Frame::new(pixels, width, height)
}

//! HTTP MJPEG / JPEG frame source.
//!
//! Connects to cameras that serve `multipart/x-mixed-replace` MJPEG over HTTP, or
//! single JPEG snapshots. A read timeout bounds every blocking read so a stalled
//! camera surfaces as an error instead of hanging the worker.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::{redact_url, FrameSource};
use crate::frame::Frame;
use crate::FootfallError;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn new(url: String, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(read_timeout)
            .timeout_read(read_timeout)
            .build();
        Self {
            url,
            agent,
            stream: None,
        }
    }
}

impl FrameSource for HttpSource {
    fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let response = self.agent.get(&self.url).call().map_err(|e| {
            FootfallError::Connection(format!("{}: {}", redact_url(&self.url), e))
        })?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        log::info!("HttpSource: connected to {}", redact_url(&self.url));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let jpeg_bytes = match self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call connect() first"))?
        {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.agent, &self.url)?,
        };
        decode_jpeg(&jpeg_bytes)
    }

    fn release(&mut self) {
        self.stream = None;
    }

    fn describe(&self) -> String {
        redact_url(&self.url)
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Newest complete JPEG in the buffer. Older complete frames are discarded with it,
    /// so at most a partial frame stays buffered.
    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_last_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(FootfallError::Decode("mjpeg stream ended".to_string()).into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| FootfallError::Connection(format!("{}: {}", redact_url(url), e)))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(FootfallError::Decode("empty jpeg snapshot".to_string()).into());
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| FootfallError::Decode(format!("decode jpeg: {}", e)))?;
    Ok(Frame::from_image(image.into_rgb8()))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn find_last_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut offset = 0;
    let mut last = None;
    while let Some((start, end)) = find_jpeg_bounds(&buffer[offset..]) {
        last = Some((offset + start, offset + end));
        offset += end;
    }
    last
}

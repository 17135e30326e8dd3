//! Synthetic `stub://` frame source.
//!
//! Produces a moving gradient so encoded frames differ from one another. Query
//! parameters shape its behaviour for tests and demos:
//!
//! `stub://<name>?fps=20&frames=100&fail_connects=1&width=320&height=240`
//!
//! - `fps`: pace reads to this rate (0 = unpaced)
//! - `frames`: stop producing after this many frames; later reads fail
//! - `fail_connects`: the first N `connect()` calls fail

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::Frame;
use crate::FootfallError;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub fps: u32,
    pub frames: Option<u64>,
    pub fail_connects: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            fps: 0,
            frames: None,
            fail_connects: 0,
            width: 320,
            height: 240,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw).with_context(|| format!("parse stub url {}", raw))?;
        let mut cfg = Self {
            url: raw.to_string(),
            ..Self::default()
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "fps" => cfg.fps = parse_param(&key, &value)?,
                "frames" => cfg.frames = Some(parse_param(&key, &value)?),
                "fail_connects" => cfg.fail_connects = parse_param(&key, &value)?,
                "width" => cfg.width = parse_param(&key, &value)?,
                "height" => cfg.height = parse_param(&key, &value)?,
                _ => {}
            }
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(FootfallError::InvalidRequest(
                "stub source dimensions must be non-zero".to_string(),
            )
            .into());
        }
        Ok(cfg)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        FootfallError::InvalidRequest(format!("invalid stub parameter {}={}", key, value)).into()
    })
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    connected: bool,
    connect_attempts: u32,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            connected: false,
            connect_attempts: 0,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.config.fps == 0 {
            return;
        }
        let interval = Duration::from_millis((1000 / self.config.fps).max(1) as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let shift = (self.frame_count * 4) as usize;
        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width;
            let y = i / width;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = (self.frame_count % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connect_attempts += 1;
        if self.connect_attempts <= self.config.fail_connects {
            return Err(FootfallError::Connection(format!(
                "{} refused connection (attempt {})",
                self.config.url, self.connect_attempts
            ))
            .into());
        }
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Err(FootfallError::Decode(format!(
                    "{} stream ended after {} frames",
                    self.config.url, limit
                ))
                .into());
            }
        }
        self.pace();
        let pixels = self.generate_pixels();
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(pixels, self.config.width, self.config.height)
    }

    fn release(&mut self) {
        self.connected = false;
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::from_url(
            "stub://test?width=64&height=48",
        )?);
        source.connect()?;

        let frame = source.read_frame()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.pixels().len(), 64 * 48 * 3);

        let next = source.read_frame()?;
        assert_ne!(frame.pixels(), next.pixels());
        Ok(())
    }

    #[test]
    fn synthetic_source_requires_connect() {
        let mut source = SyntheticSource::new(SyntheticConfig::default());
        assert!(source.read_frame().is_err());
    }

    #[test]
    fn synthetic_source_honours_fail_connects() -> Result<()> {
        let mut source =
            SyntheticSource::new(SyntheticConfig::from_url("stub://test?fail_connects=2")?);
        assert!(source.connect().is_err());
        assert!(source.connect().is_err());
        source.connect()?;
        assert!(source.read_frame().is_ok());
        Ok(())
    }

    #[test]
    fn synthetic_source_stops_after_frame_limit() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::from_url(
            "stub://test?frames=2&width=8&height=8",
        )?);
        source.connect()?;
        source.read_frame()?;
        source.read_frame()?;
        assert!(source.read_frame().is_err());
        assert_eq!(source.frames_produced(), 2);
        Ok(())
    }

    #[test]
    fn synthetic_config_rejects_bad_params() {
        assert!(SyntheticConfig::from_url("stub://test?fps=fast").is_err());
        assert!(SyntheticConfig::from_url("stub://test?width=0").is_err());
    }
}

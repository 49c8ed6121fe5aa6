use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::pipeline::histogram::{most_frequent_color, parse_histogram};
use crate::pipeline::runtime::PipelineCommandRunner;
use crate::pipeline::tool_resolver::ToolResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyColor(u32);

impl KeyColor {
    pub const GREEN: Self = Self(0x00FF00);

    pub const fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub fn from_hex(value: &str) -> Result<Self, KeyColorError> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix('#')
            .or_else(|| trimmed.strip_prefix("0x"))
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyColorError::InvalidHex(value.to_string()));
        }
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| KeyColorError::InvalidHex(value.to_string()))
    }

    pub fn rgb(self) -> (u8, u8, u8) {
        ((self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8)
    }

    pub fn to_hex(self) -> String {
        format!("{:06X}", self.0)
    }
}

impl Default for KeyColor {
    fn default() -> Self {
        Self::GREEN
    }
}

impl fmt::Display for KeyColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyColorError {
    #[error("invalid key color '{0}': expected 6 hex digits")]
    InvalidHex(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRegion {
    pub width: u32,
    pub height: u32,
}

impl SampleRegion {
    pub const fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    fn crop_geometry(self) -> String {
        format!("{}x{}+0+0", self.width, self.height)
    }
}

impl Default for SampleRegion {
    fn default() -> Self {
        Self::square(4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyColorDetectorConfig {
    pub sample_region: SampleRegion,
    pub fallback: KeyColor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyColorDetection {
    Detected(KeyColor),
    Fallback { color: KeyColor, reason: String },
}

impl KeyColorDetection {
    pub fn color(&self) -> KeyColor {
        match self {
            Self::Detected(color) | Self::Fallback { color, .. } => *color,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyColorDetector {
    config: KeyColorDetectorConfig,
    image_tool: ToolResolver,
}

impl KeyColorDetector {
    pub fn new(config: KeyColorDetectorConfig, image_tool: ToolResolver) -> Self {
        Self { config, image_tool }
    }

    pub fn config(&self) -> &KeyColorDetectorConfig {
        &self.config
    }

    pub fn build_histogram_args(&self, image_path: &Path) -> Vec<String> {
        vec![
            image_path.to_string_lossy().to_string(),
            String::from("-crop"),
            self.config.sample_region.crop_geometry(),
            String::from("-depth"),
            String::from("8"),
            String::from("-format"),
            String::from("%c"),
            String::from("histogram:info:"),
        ]
    }

    pub fn detect<R>(&self, runner: &R, image_path: &Path) -> KeyColorDetection
    where
        R: PipelineCommandRunner + ?Sized,
    {
        let args = self.build_histogram_args(image_path);
        let output = self.image_tool.run(runner, args.as_slice());
        if !output.is_success() {
            let reason = output.stderr.trim().to_string();
            debug!(
                image = %image_path.display(),
                status_code = output.status_code,
                "corner histogram failed"
            );
            return KeyColorDetection::Fallback {
                color: self.config.fallback,
                reason,
            };
        }

        KeyColorDetection::Detected(most_frequent_color(
            parse_histogram(output.stdout.as_str()),
            self.config.fallback,
        ))
    }
}

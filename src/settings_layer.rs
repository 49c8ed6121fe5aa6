use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::generation::ImageSize;
use crate::pipeline::background::{BackgroundRemovalConfig, DespillChannel};
use crate::pipeline::key_color::{KeyColor, SampleRegion};
use crate::pipeline::tool_resolver::ToolResolver;
use crate::storage::{NbHome, PROJECT_SETTINGS_REL_PATH};

const ROOT_TABLE: &str = "nano_banana";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SettingsOverlay {
    pub similarity: Option<f32>,
    pub blend: Option<f32>,
    pub despill: Option<DespillChannel>,
    pub fallback_key_color: Option<KeyColor>,
    pub sample_size: Option<u32>,
    pub filter_binary: Option<String>,
    pub image_tool: Option<String>,
    pub image_tool_legacy: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub model: Option<String>,
    pub size: Option<ImageSize>,
    pub output_dir: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsLayerError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("settings root must be a table")]
    RootMustBeObject,
    #[error("settings field '{field}' has invalid type")]
    InvalidFieldType { field: String },
    #[error("settings field '{field}' is out of range")]
    OutOfRange { field: String },
}

impl SettingsOverlay {
    pub fn layered_under(&self, upper: &SettingsOverlay) -> SettingsOverlay {
        SettingsOverlay {
            similarity: upper.similarity.or(self.similarity),
            blend: upper.blend.or(self.blend),
            despill: upper.despill.or(self.despill),
            fallback_key_color: upper.fallback_key_color.or(self.fallback_key_color),
            sample_size: upper.sample_size.or(self.sample_size),
            filter_binary: upper
                .filter_binary
                .clone()
                .or_else(|| self.filter_binary.clone()),
            image_tool: upper.image_tool.clone().or_else(|| self.image_tool.clone()),
            image_tool_legacy: upper
                .image_tool_legacy
                .clone()
                .or_else(|| self.image_tool_legacy.clone()),
            command_timeout_secs: upper.command_timeout_secs.or(self.command_timeout_secs),
            model: upper.model.clone().or_else(|| self.model.clone()),
            size: upper.size.or(self.size),
            output_dir: upper.output_dir.clone().or_else(|| self.output_dir.clone()),
        }
    }

    pub fn background_removal_config(&self) -> BackgroundRemovalConfig {
        let mut config = BackgroundRemovalConfig::default();
        if let Some(v) = self.similarity {
            config.chroma_key.similarity = v;
        }
        if let Some(v) = self.blend {
            config.chroma_key.blend = v;
        }
        if let Some(v) = self.despill {
            config.chroma_key.despill = v;
        }
        if let Some(v) = self.filter_binary.as_deref() {
            config.chroma_key.filter_binary = v.to_string();
        }
        if let Some(v) = self.fallback_key_color {
            config.key_color.fallback = v;
        }
        if let Some(v) = self.sample_size {
            config.key_color.sample_region = SampleRegion::square(v);
        }
        if self.image_tool.is_some() || self.image_tool_legacy.is_some() {
            let defaults = ToolResolver::image_tool();
            config.image_tool = ToolResolver::new(
                self.image_tool.as_deref().unwrap_or(defaults.primary()),
                self.image_tool_legacy.as_deref().unwrap_or(defaults.legacy()),
            );
        }
        config
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

pub fn merge_settings_overlays(
    user: &SettingsOverlay,
    project: &SettingsOverlay,
    overrides: &SettingsOverlay,
) -> SettingsOverlay {
    user.layered_under(project).layered_under(overrides)
}

pub fn load_user_settings(home: &NbHome) -> Result<SettingsOverlay, SettingsLayerError> {
    let toml_path = home.settings_toml();
    if toml_path.exists() {
        return load_optional_overlay_from_toml_path(toml_path.as_path());
    }
    load_optional_overlay_from_json_path(home.settings_json().as_path())
}

pub fn load_project_settings(
    cwd: &Path,
    explicit_path: Option<&str>,
) -> Result<SettingsOverlay, SettingsLayerError> {
    let path = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { cwd.join(p) })
        .unwrap_or_else(|| cwd.join(PROJECT_SETTINGS_REL_PATH));
    load_optional_overlay_by_extension(path.as_path())
}

pub fn parse_settings_overlay_json(value: &Value) -> Result<SettingsOverlay, SettingsLayerError> {
    let root = value
        .as_object()
        .ok_or(SettingsLayerError::RootMustBeObject)?;
    let root = match root.get(ROOT_TABLE) {
        Some(nested) => nested
            .as_object()
            .ok_or(SettingsLayerError::RootMustBeObject)?,
        None => root,
    };

    let mut out = SettingsOverlay::default();
    if let Some(background) = section(root, "background")? {
        if let Some(v) = background.get("similarity") {
            out.similarity = Some(parse_unit_interval(v, "background.similarity")?);
        }
        if let Some(v) = background.get("blend") {
            out.blend = Some(parse_unit_interval(v, "background.blend")?);
        }
        if let Some(v) = background.get("despill") {
            let raw = parse_string(v, "background.despill")?;
            out.despill = Some(DespillChannel::parse(raw.as_str()).ok_or_else(|| {
                SettingsLayerError::InvalidFieldType {
                    field: String::from("background.despill"),
                }
            })?);
        }
        if let Some(v) = background.get("fallback_key_color") {
            let raw = parse_string(v, "background.fallback_key_color")?;
            out.fallback_key_color = Some(KeyColor::from_hex(raw.as_str()).map_err(|_| {
                SettingsLayerError::InvalidFieldType {
                    field: String::from("background.fallback_key_color"),
                }
            })?);
        }
        if let Some(v) = background.get("sample_size") {
            let size = parse_positive_integer(v, "background.sample_size")?;
            out.sample_size =
                Some(
                    u32::try_from(size).map_err(|_| SettingsLayerError::OutOfRange {
                        field: String::from("background.sample_size"),
                    })?,
                );
        }
        if let Some(v) = background.get("filter_binary") {
            out.filter_binary = Some(parse_string(v, "background.filter_binary")?);
        }
        if let Some(v) = background.get("image_tool") {
            out.image_tool = Some(parse_string(v, "background.image_tool")?);
        }
        if let Some(v) = background.get("image_tool_legacy") {
            out.image_tool_legacy = Some(parse_string(v, "background.image_tool_legacy")?);
        }
        if let Some(v) = background.get("command_timeout_secs") {
            out.command_timeout_secs =
                Some(parse_positive_integer(v, "background.command_timeout_secs")?);
        }
    }
    if let Some(generation) = section(root, "generation")? {
        if let Some(v) = generation.get("model") {
            out.model = Some(parse_string(v, "generation.model")?);
        }
        if let Some(v) = generation.get("size") {
            let raw = parse_string(v, "generation.size")?;
            out.size = Some(ImageSize::parse(raw.as_str()).ok_or_else(|| {
                SettingsLayerError::InvalidFieldType {
                    field: String::from("generation.size"),
                }
            })?);
        }
        if let Some(v) = generation.get("output_dir") {
            out.output_dir = Some(parse_string(v, "generation.output_dir")?);
        }
    }
    Ok(out)
}

fn section<'a>(
    root: &'a Map<String, Value>,
    name: &str,
) -> Result<Option<&'a Map<String, Value>>, SettingsLayerError> {
    root.get(name)
        .map(|v| {
            v.as_object()
                .ok_or_else(|| SettingsLayerError::InvalidFieldType {
                    field: name.to_string(),
                })
        })
        .transpose()
}

fn load_optional_overlay_by_extension(path: &Path) -> Result<SettingsOverlay, SettingsLayerError> {
    match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "json" => load_optional_overlay_from_json_path(path),
        _ => load_optional_overlay_from_toml_path(path),
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, SettingsLayerError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|error| SettingsLayerError::ReadFile {
            path: path.display().to_string(),
            message: error.to_string(),
        })
}

fn load_optional_overlay_from_json_path(path: &Path) -> Result<SettingsOverlay, SettingsLayerError> {
    let Some(raw) = read_optional(path)? else {
        return Ok(SettingsOverlay::default());
    };
    let parsed =
        serde_json::from_str::<Value>(raw.as_str()).map_err(|error| SettingsLayerError::ParseJson {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_settings_overlay_json(&parsed)
}

fn load_optional_overlay_from_toml_path(path: &Path) -> Result<SettingsOverlay, SettingsLayerError> {
    let Some(raw) = read_optional(path)? else {
        return Ok(SettingsOverlay::default());
    };
    let parsed =
        toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| SettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    let json_value =
        serde_json::to_value(parsed).map_err(|error| SettingsLayerError::ParseToml {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    parse_settings_overlay_json(&json_value)
}

fn parse_string(value: &Value, field: &str) -> Result<String, SettingsLayerError> {
    let parsed = value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed.is_empty() {
        return Err(SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        });
    }
    Ok(parsed.to_string())
}

fn parse_unit_interval(value: &Value, field: &str) -> Result<f32, SettingsLayerError> {
    let parsed = value
        .as_f64()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(SettingsLayerError::OutOfRange {
            field: field.to_string(),
        });
    }
    Ok(parsed as f32)
}

fn parse_positive_integer(value: &Value, field: &str) -> Result<u64, SettingsLayerError> {
    let parsed = value
        .as_u64()
        .ok_or_else(|| SettingsLayerError::InvalidFieldType {
            field: field.to_string(),
        })?;
    if parsed == 0 {
        return Err(SettingsLayerError::OutOfRange {
            field: field.to_string(),
        });
    }
    Ok(parsed)
}

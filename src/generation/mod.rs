pub mod api_key;
pub mod gemini;

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use thiserror::Error;

pub const FLASH_MODEL_ID: &str = "gemini-3.1-flash-image-preview";
pub const PRO_MODEL_ID: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_MODEL_ALIAS: &str = "flash";
pub const MAX_REFERENCE_IMAGES: usize = 14;

pub const VALID_ASPECT_RATIOS: [&str; 14] = [
    "1:1", "16:9", "9:16", "4:3", "3:4", "3:2", "2:3", "4:5", "5:4", "21:9", "1:4", "1:8", "4:1",
    "8:1",
];

const GREEN_SCREEN_INSTRUCTIONS: &str = "\n\nIMPORTANT: Generate this on a solid, bright green background (#00FF00). \
The subject must have clear, clean edges with NO green spill on the subject. \
The green background must be uniform and extend to all edges of the image. \
Do NOT include any ground shadows that touch the edges.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    Px512,
    #[default]
    K1,
    K2,
    K4,
}

impl ImageSize {
    pub const ALL: [Self; 4] = [Self::Px512, Self::K1, Self::K2, Self::K4];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Px512 => "512",
            Self::K1 => "1K",
            Self::K2 => "2K",
            Self::K4 => "4K",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|size| size.as_str() == value.trim())
    }

    pub fn valid_values() -> String {
        Self::ALL
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn is_valid_aspect_ratio(value: &str) -> bool {
    VALID_ASPECT_RATIOS.contains(&value.trim())
}

pub fn resolve_model(input: &str) -> String {
    match input.trim().to_ascii_lowercase().as_str() {
        "flash" | "nb2" => String::from(FLASH_MODEL_ID),
        "pro" | "nb-pro" => String::from(PRO_MODEL_ID),
        _ => input.trim().to_string(),
    }
}

pub fn model_tier(model_id: &str) -> &'static str {
    if model_id.contains("pro") {
        "Pro"
    } else {
        "Flash"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOptions {
    pub prompt: String,
    pub output_name: String,
    pub size: ImageSize,
    pub aspect_ratio: Option<String>,
    pub model: String,
    pub output_dir: PathBuf,
    pub reference_images: Vec<PathBuf>,
    pub transparent: bool,
}

impl GenerationOptions {
    pub fn prompt_text(&self) -> String {
        build_prompt_text(self.prompt.as_str(), self.transparent)
    }
}

pub fn build_prompt_text(prompt: &str, transparent: bool) -> String {
    if transparent {
        format!("{prompt}{GREEN_SCREEN_INSTRUCTIONS}")
    } else {
        prompt.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub mime_type: String,
    pub data_base64: String,
}

pub fn load_reference_image(path: &Path) -> Result<ReferenceImage, GenerationError> {
    if !path.is_file() {
        return Err(GenerationError::ReferenceImageNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(GenerationError::Io)?;
    Ok(ReferenceImage {
        mime_type: mime_for_path(path),
        data_base64: BASE64_STANDARD.encode(bytes.as_slice()),
    })
}

pub fn load_reference_images(paths: &[PathBuf]) -> Result<Vec<ReferenceImage>, GenerationError> {
    if paths.len() > MAX_REFERENCE_IMAGES {
        return Err(GenerationError::TooManyReferenceImages(paths.len()));
    }
    paths
        .iter()
        .map(|path| load_reference_image(path.as_path()))
        .collect()
}

pub fn mime_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => String::from("image/jpeg"),
        "gif" => String::from("image/gif"),
        "webp" => String::from("image/webp"),
        "bmp" => String::from("image/bmp"),
        _ => String::from("image/png"),
    }
}

pub fn output_file_name(output_name: &str, index: usize) -> String {
    if index == 0 {
        format!("{output_name}.png")
    } else {
        format!("{output_name}-{}.png", index + 1)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("reference image not found: {}", .0.display())]
    ReferenceImageNotFound(PathBuf),
    #[error("too many reference images: {0} (max {max})", max = MAX_REFERENCE_IMAGES)]
    TooManyReferenceImages(usize),
    #[error("image request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("image API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("no output generated, try a different prompt")]
    NoCandidates,
    #[error("no images in response, the model may have declined the prompt")]
    NoImages,
    #[error("image base64 decode failed: {0}")]
    Decode(#[source] base64::DecodeError),
    #[error("generation filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_model_aliases_case_insensitively() {
        assert_eq!(resolve_model("flash"), FLASH_MODEL_ID);
        assert_eq!(resolve_model(" NB2 "), FLASH_MODEL_ID);
        assert_eq!(resolve_model("Pro"), PRO_MODEL_ID);
        assert_eq!(resolve_model("nb-pro"), PRO_MODEL_ID);
        assert_eq!(resolve_model("gemini-custom"), "gemini-custom");
    }

    #[test]
    fn labels_model_tier() {
        assert_eq!(model_tier(PRO_MODEL_ID), "Pro");
        assert_eq!(model_tier(FLASH_MODEL_ID), "Flash");
    }

    #[test]
    fn parses_sizes_and_aspects() {
        assert_eq!(ImageSize::parse("2K"), Some(ImageSize::K2));
        assert_eq!(ImageSize::parse("512"), Some(ImageSize::Px512));
        assert_eq!(ImageSize::parse("2k"), None);
        assert_eq!(ImageSize::valid_values(), "512, 1K, 2K, 4K");
        assert!(is_valid_aspect_ratio("21:9"));
        assert!(!is_valid_aspect_ratio("7:5"));
    }

    #[test]
    fn transparent_prompt_requests_green_screen() {
        let text = build_prompt_text("game sprite", true);

        assert!(text.starts_with("game sprite\n\nIMPORTANT:"));
        assert!(text.contains("#00FF00"));
        assert_eq!(build_prompt_text("game sprite", false), "game sprite");
    }

    #[test]
    fn numbers_additional_output_files() {
        assert_eq!(output_file_name("hero", 0), "hero.png");
        assert_eq!(output_file_name("hero", 1), "hero-2.png");
        assert_eq!(output_file_name("hero", 2), "hero-3.png");
    }

    #[test]
    fn rejects_more_than_fourteen_references() {
        let paths = (0..15)
            .map(|i| PathBuf::from(format!("/nowhere/{i}.png")))
            .collect::<Vec<_>>();

        let err = load_reference_images(&paths).expect_err("too many refs");

        assert!(matches!(err, GenerationError::TooManyReferenceImages(15)));
        assert_eq!(err.to_string(), "too many reference images: 15 (max 14)");
    }

    #[test]
    fn loads_reference_image_as_base64() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("nano_banana_refs_{stamp}"));
        fs::create_dir_all(&root).expect("temp root should exist");
        let path = root.join("ref.JPG");
        fs::write(&path, b"abc").expect("ref should be written");

        let image = load_reference_image(&path).expect("ref should load");

        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.data_base64, "YWJj");
        let missing = load_reference_image(&root.join("nope.png")).expect_err("missing ref");
        assert!(matches!(missing, GenerationError::ReferenceImageNotFound(_)));

        let _ = fs::remove_dir_all(root);
    }
}

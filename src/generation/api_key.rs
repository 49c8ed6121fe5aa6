use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeySource {
    Flag,
    Environment,
    DotEnv(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApiKey {
    pub key: String,
    pub source: ApiKeySource,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiKeyError {
    #[error(
        "no Gemini API key found; set --api-key, GEMINI_API_KEY, or GEMINI_API_KEY=... in one of: {}; get a free key at https://aistudio.google.com/",
        join_paths(.searched)
    )]
    Missing { searched: Vec<PathBuf> },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn resolve_api_key(
    flag: Option<&str>,
    env_value: Option<String>,
    dotenv_files: &[PathBuf],
) -> Result<ResolvedApiKey, ApiKeyError> {
    if let Some(key) = flag.map(str::trim).filter(|v| !v.is_empty()) {
        return Ok(ResolvedApiKey {
            key: key.to_string(),
            source: ApiKeySource::Flag,
        });
    }
    if let Some(key) = env_value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        return Ok(ResolvedApiKey {
            key,
            source: ApiKeySource::Environment,
        });
    }
    for path in dotenv_files {
        let dotenv = match load_dotenv_file(path.as_path()) {
            Ok(map) => map,
            Err(error) => {
                debug!(path = %path.display(), error = %error, "skipping unreadable .env");
                continue;
            }
        };
        if let Some(key) = dotenv
            .get(API_KEY_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            return Ok(ResolvedApiKey {
                key,
                source: ApiKeySource::DotEnv(path.clone()),
            });
        }
    }
    Err(ApiKeyError::Missing {
        searched: dotenv_files.to_vec(),
    })
}

pub fn default_dotenv_candidates(
    cwd: Option<&Path>,
    exe_dir: Option<&Path>,
    home_env_file: Option<&Path>,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for candidate in [
        cwd.map(|dir| dir.join(".env")),
        exe_dir.map(|dir| dir.join(".env")),
        home_env_file.map(Path::to_path_buf),
    ]
    .into_iter()
    .flatten()
    {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

pub fn load_dotenv_file(path: &Path) -> Result<HashMap<String, String>, std::io::Error> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(parse_dotenv_content(raw.as_str()))
}

pub fn parse_dotenv_content(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let mut value = line.trim();
        if value.is_empty() || value.starts_with('#') {
            continue;
        }
        if let Some(rest) = value.strip_prefix("export ") {
            value = rest.trim_start();
        }
        let Some((key_raw, value_raw)) = value.split_once('=') else {
            continue;
        };
        let key = key_raw.trim();
        if key.is_empty() {
            continue;
        }
        let mut parsed = value_raw.trim().to_string();
        if parsed.len() >= 2
            && ((parsed.starts_with('"') && parsed.ends_with('"'))
                || (parsed.starts_with('\'') && parsed.ends_with('\'')))
        {
            parsed = parsed[1..parsed.len() - 1].to_string();
        } else if let Some((before_comment, _)) = parsed.split_once(" #") {
            parsed = before_comment.trim_end().to_string();
        }
        out.insert(key.to_string(), parsed);
    }
    out
}

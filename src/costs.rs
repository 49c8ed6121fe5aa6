use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::generation::{model_tier, PRO_MODEL_ID};

const RECENT_ENTRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

pub fn cost_rate_for(model: &str) -> CostRate {
    match model {
        PRO_MODEL_ID => CostRate {
            input_per_million: 2.0,
            output_per_million: 120.0,
        },
        // Flash, and anything unrecognized.
        _ => CostRate {
            input_per_million: 0.25,
            output_per_million: 60.0,
        },
    }
}

pub fn calculate_cost(model: &str, prompt_tokens: u64, output_tokens: u64) -> f64 {
    let rate = cost_rate_for(model);
    (prompt_tokens as f64 / 1_000_000.0) * rate.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * rate.output_per_million
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub timestamp: String,
    pub model: String,
    pub size: String,
    pub aspect: Option<String>,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub output_file: String,
}

impl CostEntry {
    pub fn new(
        model: &str,
        size: &str,
        aspect: Option<&str>,
        prompt_tokens: u64,
        output_tokens: u64,
        output_file: &Path,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            model: model.to_string(),
            size: size.to_string(),
            aspect: aspect.map(str::to_string),
            prompt_tokens,
            output_tokens,
            estimated_cost: calculate_cost(model, prompt_tokens, output_tokens),
            output_file: output_file.display().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CostLedgerError {
    #[error("failed to create cost ledger directory '{path}': {message}")]
    CreateParent { path: String, message: String },
    #[error("failed to serialize cost ledger JSON: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write cost ledger '{path}': {message}")]
    WriteFile { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostLedger {
    path: PathBuf,
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Vec<CostEntry> {
        let Ok(raw) = fs::read_to_string(self.path.as_path()) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<CostEntry>>(raw.as_str()) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "ignoring unparsable cost ledger");
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: CostEntry) -> Result<(), CostLedgerError> {
        let mut entries = self.load();
        entries.push(entry);
        write_pretty_json_with_newline(self.path.as_path(), &entries)
    }
}

pub fn write_pretty_json_with_newline<T>(path: &Path, value: &T) -> Result<(), CostLedgerError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| CostLedgerError::CreateParent {
            path: parent.display().to_string(),
            message: error.to_string(),
        })?;
    }

    let mut bytes = serde_json::to_vec_pretty(value).map_err(CostLedgerError::Serialize)?;
    bytes.push(b'\n');
    fs::write(path, bytes).map_err(|error| CostLedgerError::WriteFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierTotal {
    pub tier: &'static str,
    pub count: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostSummary {
    pub total_generations: u64,
    pub total_cost: f64,
    pub by_tier: Vec<TierTotal>,
    pub recent: Vec<CostEntry>,
}

pub fn summarize_costs(entries: &[CostEntry]) -> CostSummary {
    let mut by_tier: Vec<TierTotal> = Vec::new();
    let mut total_cost = 0.0;
    for entry in entries {
        let tier = model_tier(entry.model.as_str());
        match by_tier.iter_mut().find(|t| t.tier == tier) {
            Some(total) => {
                total.count += 1;
                total.cost += entry.estimated_cost;
            }
            None => by_tier.push(TierTotal {
                tier,
                count: 1,
                cost: entry.estimated_cost,
            }),
        }
        total_cost += entry.estimated_cost;
    }

    CostSummary {
        total_generations: entries.len() as u64,
        total_cost,
        by_tier,
        recent: entries.iter().rev().take(RECENT_ENTRIES).cloned().collect(),
    }
}

pub fn render_cost_summary(ledger: &CostLedger) -> String {
    let entries = ledger.load();
    if entries.is_empty() {
        return format!(
            "No generation history found.\nCosts are tracked at: {}\n",
            ledger.path().display()
        );
    }

    let summary = summarize_costs(entries.as_slice());
    let mut out = String::from("\nNano Banana - Cost Summary\n\n");
    out.push_str(format!("  Total generations: {}\n", summary.total_generations).as_str());
    out.push_str(format!("  Total estimated cost: ${:.4}\n\n", summary.total_cost).as_str());
    for tier in &summary.by_tier {
        out.push_str(
            format!("  {}: {} images - ${:.4}\n", tier.tier, tier.count, tier.cost).as_str(),
        );
    }
    out.push_str("\n  Recent generations:\n");
    for entry in &summary.recent {
        let file_name = Path::new(entry.output_file.as_str())
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.output_file.clone());
        out.push_str(
            format!(
                "    {} | {} {} | ${:.4} | {}\n",
                display_date(entry.timestamp.as_str()),
                model_tier(entry.model.as_str()),
                entry.size,
                entry.estimated_cost,
                file_name
            )
            .as_str(),
        );
    }
    out
}

fn display_date(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

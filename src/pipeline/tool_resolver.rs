use tracing::debug;

use crate::pipeline::runtime::{CommandOutput, CommandSpec, PipelineCommandRunner};

pub const DEFAULT_IMAGE_TOOL: &str = "magick";
pub const DEFAULT_IMAGE_TOOL_LEGACY: &str = "convert";
const DEFAULT_NOT_FOUND_MARKER: &str = "not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResolver {
    primary: String,
    legacy: String,
    not_found_markers: Vec<String>,
}

impl Default for ToolResolver {
    fn default() -> Self {
        Self::image_tool()
    }
}

impl ToolResolver {
    pub fn new(primary: impl Into<String>, legacy: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            legacy: legacy.into(),
            not_found_markers: vec![String::from(DEFAULT_NOT_FOUND_MARKER)],
        }
    }

    pub fn image_tool() -> Self {
        Self::new(DEFAULT_IMAGE_TOOL, DEFAULT_IMAGE_TOOL_LEGACY)
    }

    pub fn with_not_found_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.not_found_markers = markers
            .into_iter()
            .map(Into::into)
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .collect();
        self
    }

    pub fn primary(&self) -> &str {
        self.primary.as_str()
    }

    pub fn legacy(&self) -> &str {
        self.legacy.as_str()
    }

    pub fn indicates_missing_tool(&self, output: &CommandOutput) -> bool {
        if output.is_success() {
            return false;
        }
        let stderr = output.stderr.to_ascii_lowercase();
        self.not_found_markers
            .iter()
            .any(|marker| stderr.contains(marker.as_str()))
    }

    pub fn run<R>(&self, runner: &R, args: &[String]) -> CommandOutput
    where
        R: PipelineCommandRunner + ?Sized,
    {
        let spec = CommandSpec::new(self.primary.as_str(), args.iter().cloned());
        let output = runner.run(&spec);
        if !self.indicates_missing_tool(&output) {
            return output;
        }

        debug!(
            primary = %self.primary,
            legacy = %self.legacy,
            "primary tool not found, retrying with legacy name"
        );
        runner.run(&spec.with_program(self.legacy.as_str()))
    }
}

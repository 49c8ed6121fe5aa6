use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::pipeline::key_color::{
    KeyColor, KeyColorDetection, KeyColorDetector, KeyColorDetectorConfig,
};
use crate::pipeline::reporter::{PipelineEvent, SharedPipelineReporter, TracingPipelineReporter};
use crate::pipeline::runtime::{CommandSpec, PipelineCommandRunner};
use crate::pipeline::tool_resolver::ToolResolver;
use crate::pipeline::PipelineStage;

pub const TRANSPARENT_SUFFIX: &str = "-transparent.png";
pub const DEFAULT_SIMILARITY: f32 = 0.25;
pub const DEFAULT_BLEND: f32 = 0.08;
pub const DEFAULT_FILTER_BINARY: &str = "ffmpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DespillChannel {
    #[default]
    Green,
    Blue,
}

impl DespillChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Blue => "blue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "green" => Some(Self::Green),
            "blue" => Some(Self::Blue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChromaKeyConfig {
    pub similarity: f32,
    pub blend: f32,
    pub despill: DespillChannel,
    pub filter_binary: String,
}

impl Default for ChromaKeyConfig {
    fn default() -> Self {
        Self {
            similarity: DEFAULT_SIMILARITY,
            blend: DEFAULT_BLEND,
            despill: DespillChannel::Green,
            filter_binary: String::from(DEFAULT_FILTER_BINARY),
        }
    }
}

impl ChromaKeyConfig {
    pub fn filter_expression(&self, key_color: KeyColor) -> String {
        format!(
            "colorkey=0x{}:{}:{},despill={}",
            key_color.to_hex(),
            self.similarity,
            self.blend,
            self.despill.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackgroundRemovalConfig {
    pub key_color: KeyColorDetectorConfig,
    pub chroma_key: ChromaKeyConfig,
    pub image_tool: ToolResolver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundRemovalOutcome {
    Transparent {
        path: PathBuf,
        key_color: KeyColor,
        trimmed: bool,
    },
    Original { path: PathBuf, reason: String },
}

impl BackgroundRemovalOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Transparent { path, .. } | Self::Original { path, .. } => path.as_path(),
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            Self::Transparent { path, .. } | Self::Original { path, .. } => path,
        }
    }

    pub fn is_transparent(&self) -> bool {
        matches!(self, Self::Transparent { .. })
    }
}

// Any extension is replaced: the keyed output needs alpha.
pub fn transparent_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("image"));
    input.with_file_name(format!("{stem}{TRANSPARENT_SUFFIX}"))
}

pub struct BackgroundRemover<R> {
    runner: R,
    config: BackgroundRemovalConfig,
    detector: KeyColorDetector,
    reporter: SharedPipelineReporter,
}

impl<R> BackgroundRemover<R>
where
    R: PipelineCommandRunner,
{
    pub fn new(runner: R, config: BackgroundRemovalConfig) -> Self {
        let detector = KeyColorDetector::new(config.key_color.clone(), config.image_tool.clone());
        Self {
            runner,
            config,
            detector,
            reporter: Arc::new(TracingPipelineReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: SharedPipelineReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &BackgroundRemovalConfig {
        &self.config
    }

    pub fn build_chroma_key_command(
        &self,
        input: &Path,
        output: &Path,
        key_color: KeyColor,
    ) -> CommandSpec {
        CommandSpec::new(
            self.config.chroma_key.filter_binary.as_str(),
            [
                String::from("-y"),
                String::from("-i"),
                input.to_string_lossy().to_string(),
                String::from("-vf"),
                self.config.chroma_key.filter_expression(key_color),
                String::from("-frames:v"),
                String::from("1"),
                output.to_string_lossy().to_string(),
            ],
        )
    }

    pub fn build_trim_args(&self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy().to_string();
        vec![
            path.clone(),
            String::from("-trim"),
            String::from("+repage"),
            path,
        ]
    }

    pub fn remove_background(&self, input: &Path) -> BackgroundRemovalOutcome {
        let output_path = transparent_output_path(input);

        self.report(PipelineEvent::StageStarted(PipelineStage::Detect));
        let detection = self.detector.detect(&self.runner, input);
        if let KeyColorDetection::Fallback { color, reason } = &detection {
            self.report(PipelineEvent::KeyColorFallback {
                color: *color,
                reason: reason.clone(),
            });
        }
        let key_color = detection.color();
        self.report(PipelineEvent::KeyColorDetected(key_color));

        self.report(PipelineEvent::StageStarted(PipelineStage::Remove));
        let keyed = self
            .runner
            .run(&self.build_chroma_key_command(input, output_path.as_path(), key_color));
        if !keyed.is_success() || !output_path.is_file() {
            let reason = if keyed.is_success() {
                format!(
                    "{} exited successfully but wrote no output",
                    self.config.chroma_key.filter_binary
                )
            } else {
                keyed.stderr.trim().to_string()
            };
            self.report(PipelineEvent::ChromaKeyFailed {
                stderr: reason.clone(),
            });
            discard_partial_output(output_path.as_path());
            self.report(PipelineEvent::ReturningOriginal {
                path: input.to_path_buf(),
            });
            return BackgroundRemovalOutcome::Original {
                path: input.to_path_buf(),
                reason,
            };
        }

        self.report(PipelineEvent::StageStarted(PipelineStage::Trim));
        let trim_args = self.build_trim_args(output_path.as_path());
        let trimmed = self.config.image_tool.run(&self.runner, trim_args.as_slice());
        let trimmed_ok = trimmed.is_success();
        if !trimmed_ok {
            self.report(PipelineEvent::TrimFailed {
                stderr: trimmed.stderr,
            });
        }

        BackgroundRemovalOutcome::Transparent {
            path: output_path,
            key_color,
            trimmed: trimmed_ok,
        }
    }

    pub fn remove_backgrounds(&self, inputs: &[PathBuf]) -> Vec<BackgroundRemovalOutcome> {
        inputs
            .iter()
            .map(|input| self.remove_background(input.as_path()))
            .collect()
    }

    fn report(&self, event: PipelineEvent) {
        self.reporter.report(&event);
    }
}

fn discard_partial_output(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(error) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %error, "could not remove partial output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::reporter::PipelineReporter;
    use crate::pipeline::runtime::CommandOutput;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    type Script = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

    struct ScriptedRunner {
        script: Script,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(script: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn programs(&self) -> Vec<String> {
            self.seen
                .lock()
                .expect("scripted runner mutex poisoned")
                .iter()
                .map(|spec| spec.program.clone())
                .collect()
        }
    }

    impl PipelineCommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> CommandOutput {
            self.seen
                .lock()
                .expect("scripted runner mutex poisoned")
                .push(spec.clone());
            (self.script)(spec)
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<PipelineEvent>>,
    }

    impl PipelineReporter for RecordingReporter {
        fn report(&self, event: &PipelineEvent) {
            self.events
                .lock()
                .expect("reporter mutex poisoned")
                .push(event.clone());
        }
    }

    fn temp_dir() -> PathBuf {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("nano_banana_background_{stamp}"));
        fs::create_dir_all(&root).expect("temp root should exist");
        root
    }

    fn write_input(root: &Path) -> PathBuf {
        let input = root.join("img.png");
        fs::write(&input, b"input-bytes").expect("input should be written");
        input
    }

    fn histogram_ok(spec: &CommandSpec) -> Option<CommandOutput> {
        spec.args
            .iter()
            .any(|a| a == "histogram:info:")
            .then(|| CommandOutput::success("  16: (  0,255,  0) #00FF00 lime\n"))
    }

    fn write_last_arg(spec: &CommandSpec, bytes: &[u8]) {
        let out = spec.args.last().expect("output arg should exist");
        fs::write(out, bytes).expect("fake output should be written");
    }

    #[test]
    fn derives_transparent_png_path() {
        assert_eq!(
            transparent_output_path(Path::new("/tmp/img.png")),
            PathBuf::from("/tmp/img-transparent.png")
        );
        assert_eq!(
            transparent_output_path(Path::new("/tmp/shot.PNG")),
            PathBuf::from("/tmp/shot-transparent.png")
        );
        assert_eq!(
            transparent_output_path(Path::new("out/photo.jpg")),
            PathBuf::from("out/photo-transparent.png")
        );
        assert_eq!(
            transparent_output_path(Path::new("plain")),
            PathBuf::from("plain-transparent.png")
        );
    }

    #[test]
    fn output_path_derivation_is_stable() {
        let input = Path::new("/tmp/batch/nb-1700000000000-2.png");

        assert_eq!(
            transparent_output_path(input),
            transparent_output_path(input)
        );
    }

    #[test]
    fn filter_expression_uses_key_and_thresholds() {
        let cfg = ChromaKeyConfig::default();

        assert_eq!(
            cfg.filter_expression(KeyColor::from_rgb(0x12, 0xab, 0x00)),
            "colorkey=0x12AB00:0.25:0.08,despill=green"
        );
        let blue = ChromaKeyConfig {
            similarity: 0.3,
            blend: 0.1,
            despill: DespillChannel::Blue,
            ..ChromaKeyConfig::default()
        };
        assert_eq!(
            blue.filter_expression(KeyColor::from_rgb(0, 0, 255)),
            "colorkey=0x0000FF:0.3:0.1,despill=blue"
        );
    }

    #[test]
    fn builds_single_frame_filter_command() {
        let remover = BackgroundRemover::new(
            ScriptedRunner::new(|_| CommandOutput::success("")),
            BackgroundRemovalConfig::default(),
        );

        let spec = remover.build_chroma_key_command(
            Path::new("/tmp/img.png"),
            Path::new("/tmp/img-transparent.png"),
            KeyColor::GREEN,
        );

        assert_eq!(spec.program, "ffmpeg");
        assert_eq!(
            spec.args,
            vec![
                "-y",
                "-i",
                "/tmp/img.png",
                "-vf",
                "colorkey=0x00FF00:0.25:0.08,despill=green",
                "-frames:v",
                "1",
                "/tmp/img-transparent.png",
            ]
        );
        assert_eq!(
            remover.build_trim_args(Path::new("/tmp/img-transparent.png")),
            vec![
                "/tmp/img-transparent.png",
                "-trim",
                "+repage",
                "/tmp/img-transparent.png"
            ]
        );
    }

    #[test]
    fn chroma_key_failure_returns_original_and_cleans_partial_output() {
        let root = temp_dir();
        let input = write_input(&root);
        let runner = ScriptedRunner::new(|spec| {
            if let Some(out) = histogram_ok(spec) {
                return out;
            }
            write_last_arg(spec, b"partial");
            CommandOutput::failure(1, "Invalid filter expression\n")
        });
        let reporter = Arc::new(RecordingReporter::default());
        let remover = BackgroundRemover::new(runner, BackgroundRemovalConfig::default())
            .with_reporter(reporter.clone());

        let outcome = remover.remove_background(&input);

        assert_eq!(
            outcome,
            BackgroundRemovalOutcome::Original {
                path: input.clone(),
                reason: String::from("Invalid filter expression"),
            }
        );
        assert!(input.is_file());
        assert!(!root.join("img-transparent.png").exists());
        assert_eq!(remover.runner.programs(), vec!["magick", "ffmpeg"]);
        let events = reporter.events.lock().expect("reporter mutex poisoned");
        assert_eq!(
            *events,
            vec![
                PipelineEvent::StageStarted(PipelineStage::Detect),
                PipelineEvent::KeyColorDetected(KeyColor::GREEN),
                PipelineEvent::StageStarted(PipelineStage::Remove),
                PipelineEvent::ChromaKeyFailed {
                    stderr: String::from("Invalid filter expression"),
                },
                PipelineEvent::ReturningOriginal { path: input.clone() },
            ]
        );

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_output_after_clean_exit_counts_as_failure() {
        let root = temp_dir();
        let input = write_input(&root);
        let runner = ScriptedRunner::new(|spec| {
            histogram_ok(spec).unwrap_or_else(|| CommandOutput::success(""))
        });
        let remover = BackgroundRemover::new(runner, BackgroundRemovalConfig::default());

        let outcome = remover.remove_background(&input);

        assert!(!outcome.is_transparent());
        assert_eq!(outcome.path(), input.as_path());

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn trim_failure_still_returns_keyed_output() {
        let root = temp_dir();
        let input = write_input(&root);
        let runner = ScriptedRunner::new(|spec| {
            if let Some(out) = histogram_ok(spec) {
                return out;
            }
            if spec.program == "ffmpeg" {
                write_last_arg(spec, b"keyed-bytes");
                return CommandOutput::success("");
            }
            CommandOutput::failure(1, "magick: no images defined")
        });
        let reporter = Arc::new(RecordingReporter::default());
        let remover = BackgroundRemover::new(runner, BackgroundRemovalConfig::default())
            .with_reporter(reporter.clone());

        let outcome = remover.remove_background(&input);

        let expected = root.join("img-transparent.png");
        assert_eq!(
            outcome,
            BackgroundRemovalOutcome::Transparent {
                path: expected.clone(),
                key_color: KeyColor::GREEN,
                trimmed: false,
            }
        );
        let written = fs::read(&expected).expect("keyed output should remain");
        assert!(!written.is_empty());
        let events = reporter.events.lock().expect("reporter mutex poisoned");
        assert_eq!(
            events.last(),
            Some(&PipelineEvent::TrimFailed {
                stderr: String::from("magick: no images defined"),
            })
        );

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn key_color_fallback_is_reported_and_used_in_filter() {
        let root = temp_dir();
        let input = write_input(&root);
        let runner = ScriptedRunner::new(|spec| {
            if spec.args.iter().any(|a| a == "histogram:info:") {
                return CommandOutput::failure(1, format!("{}: command not found", spec.program));
            }
            if spec.program == "ffmpeg" {
                write_last_arg(spec, b"keyed");
            }
            CommandOutput::success("")
        });
        let reporter = Arc::new(RecordingReporter::default());
        let remover = BackgroundRemover::new(runner, BackgroundRemovalConfig::default())
            .with_reporter(reporter.clone());

        let outcome = remover.remove_background(&input);

        assert!(outcome.is_transparent());
        let seen = remover.runner.seen.lock().expect("scripted runner mutex poisoned");
        let ffmpeg = seen
            .iter()
            .find(|spec| spec.program == "ffmpeg")
            .expect("ffmpeg should run");
        assert!(ffmpeg.args.contains(&String::from(
            "colorkey=0x00FF00:0.25:0.08,despill=green"
        )));
        let events = reporter.events.lock().expect("reporter mutex poisoned");
        assert_eq!(
            events[1],
            PipelineEvent::KeyColorFallback {
                color: KeyColor::GREEN,
                reason: String::from("convert: command not found"),
            }
        );
        drop(seen);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn batch_preserves_input_order() {
        let root = temp_dir();
        let first = root.join("a.png");
        let second = root.join("b.png");
        fs::write(&first, b"a").expect("input should be written");
        fs::write(&second, b"b").expect("input should be written");
        let runner = ScriptedRunner::new(|spec| {
            if let Some(out) = histogram_ok(spec) {
                return out;
            }
            if spec.program == "ffmpeg" && spec.args.iter().any(|a| a.ends_with("b.png")) {
                return CommandOutput::failure(1, "boom");
            }
            if spec.program == "ffmpeg" {
                write_last_arg(spec, b"keyed");
            }
            CommandOutput::success("")
        });
        let remover = BackgroundRemover::new(runner, BackgroundRemovalConfig::default());

        let paths = remover
            .remove_backgrounds(&[first.clone(), second.clone()])
            .into_iter()
            .map(BackgroundRemovalOutcome::into_path)
            .collect::<Vec<_>>();

        assert_eq!(paths, vec![root.join("a-transparent.png"), second]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn parses_despill_channel() {
        assert_eq!(DespillChannel::parse(" Green "), Some(DespillChannel::Green));
        assert_eq!(DespillChannel::parse("blue"), Some(DespillChannel::Blue));
        assert_eq!(DespillChannel::parse("red"), None);
    }
}

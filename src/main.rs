use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use nano_banana::costs::{render_cost_summary, CostEntry, CostLedger};
use nano_banana::generation::api_key::{default_dotenv_candidates, resolve_api_key, API_KEY_ENV};
use nano_banana::generation::gemini::{save_generated_images, GeminiImageClient};
use nano_banana::generation::{
    is_valid_aspect_ratio, load_reference_images, resolve_model, GenerationOptions, ImageSize,
    DEFAULT_MODEL_ALIAS, MAX_REFERENCE_IMAGES, VALID_ASPECT_RATIOS,
};
use nano_banana::pipeline::background::{BackgroundRemovalOutcome, BackgroundRemover};
use nano_banana::pipeline::reporter::TracingPipelineReporter;
use nano_banana::pipeline::runtime::StdPipelineCommandRunner;
use nano_banana::settings_layer::{
    load_project_settings, load_user_settings, merge_settings_overlays, SettingsOverlay,
};
use nano_banana::storage::NbHome;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    match parse_cli_args(cli_args.as_slice())? {
        CliCommand::Help => print_usage(),
        CliCommand::Costs => {
            let ledger = CostLedger::new(NbHome::from_user_home().costs_file());
            print!("{}", render_cost_summary(&ledger));
        }
        CliCommand::Generate(args) => run_generate_cli(args)?,
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    Help,
    Costs,
    Generate(GenerateCliArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct GenerateCliArgs {
    prompt: String,
    output: Option<String>,
    size: Option<ImageSize>,
    aspect_ratio: Option<String>,
    model: Option<String>,
    output_dir: Option<String>,
    reference_images: Vec<PathBuf>,
    transparent: bool,
    api_key: Option<String>,
    settings_path: Option<String>,
}

fn parse_cli_args(args: &[String]) -> Result<CliCommand, Box<dyn std::error::Error>> {
    if args.is_empty()
        || args
            .iter()
            .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        return Ok(CliCommand::Help);
    }

    let mut parsed = GenerateCliArgs::default();
    let mut prompt = None::<String>;
    let mut show_costs = false;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "-o" | "--output" => {
                parsed.output = Some(needs_value(i)?);
                i += 2;
            }
            "-s" | "--size" => {
                let value = needs_value(i)?;
                let size = ImageSize::parse(value.as_str()).ok_or_else(|| {
                    std::io::Error::other(format!(
                        "Invalid size: {value}. Valid: {}",
                        ImageSize::valid_values()
                    ))
                })?;
                parsed.size = Some(size);
                i += 2;
            }
            "-a" | "--aspect" => {
                let value = needs_value(i)?;
                if !is_valid_aspect_ratio(value.as_str()) {
                    return Err(std::io::Error::other(format!(
                        "Invalid aspect ratio: {value}. Valid: {}",
                        VALID_ASPECT_RATIOS.join(", ")
                    ))
                    .into());
                }
                parsed.aspect_ratio = Some(value.trim().to_string());
                i += 2;
            }
            "-m" | "--model" => {
                parsed.model = Some(needs_value(i)?);
                i += 2;
            }
            "-d" | "--dir" => {
                parsed.output_dir = Some(needs_value(i)?);
                i += 2;
            }
            "-r" | "--ref" => {
                parsed.reference_images.push(PathBuf::from(needs_value(i)?));
                if parsed.reference_images.len() > MAX_REFERENCE_IMAGES {
                    return Err(std::io::Error::other(format!(
                        "Too many reference images (max {MAX_REFERENCE_IMAGES})"
                    ))
                    .into());
                }
                i += 2;
            }
            "-t" | "--transparent" => {
                parsed.transparent = true;
                i += 1;
            }
            "--api-key" => {
                parsed.api_key = Some(needs_value(i)?);
                i += 2;
            }
            "--settings" => {
                parsed.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "--costs" => {
                show_costs = true;
                i += 1;
            }
            unknown if unknown.starts_with('-') && unknown.len() > 1 => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
            positional => {
                if prompt.is_some() {
                    return Err(std::io::Error::other(format!(
                        "Unexpected argument: {positional}\n\nQuote the prompt if it contains spaces."
                    ))
                    .into());
                }
                prompt = Some(positional.to_string());
                i += 1;
            }
        }
    }

    if show_costs {
        return Ok(CliCommand::Costs);
    }
    parsed.prompt = prompt
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("Missing prompt\n\nUse --help for usage."))?;
    Ok(CliCommand::Generate(parsed))
}

fn run_generate_cli(args: GenerateCliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let home = NbHome::from_user_home();
    let cwd = std::env::current_dir()?;

    let user = load_user_settings(&home)?;
    let project = load_project_settings(cwd.as_path(), args.settings_path.as_deref())?;
    let overrides = SettingsOverlay {
        model: args.model.clone(),
        size: args.size,
        output_dir: args.output_dir.clone(),
        ..SettingsOverlay::default()
    };
    let settings = merge_settings_overlays(&user, &project, &overrides);

    let options = GenerationOptions {
        prompt: args.prompt,
        output_name: args
            .output
            .unwrap_or_else(|| format!("nb-{}", chrono::Utc::now().timestamp_millis())),
        size: settings.size.unwrap_or_default(),
        aspect_ratio: args.aspect_ratio,
        model: resolve_model(settings.model.as_deref().unwrap_or(DEFAULT_MODEL_ALIAS)),
        output_dir: settings
            .output_dir
            .as_deref()
            .map(|dir| cwd.join(dir))
            .unwrap_or_else(|| cwd.clone()),
        reference_images: args.reference_images,
        transparent: args.transparent,
    };
    let references = load_reference_images(options.reference_images.as_slice())?;

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let dotenv_files = default_dotenv_candidates(
        Some(cwd.as_path()),
        exe_dir.as_deref(),
        Some(home.env_file().as_path()),
    );
    let api_key = resolve_api_key(
        args.api_key.as_deref(),
        std::env::var(API_KEY_ENV).ok(),
        dotenv_files.as_slice(),
    )?;

    info!(
        model = %options.model,
        size = options.size.as_str(),
        aspect = options.aspect_ratio.as_deref().unwrap_or("auto"),
        references = references.len(),
        transparent = options.transparent,
        "generating"
    );
    let started = Instant::now();
    let client = GeminiImageClient::new(api_key.key)?;
    let response = client.generate(&options, references.as_slice())?;
    info!(elapsed_secs = started.elapsed().as_secs_f32(), "generation finished");

    let saved = save_generated_images(
        &response,
        options.output_dir.as_path(),
        options.output_name.as_str(),
    )?;

    if let (Some(usage), Some(first)) = (saved.usage, saved.paths.first()) {
        let entry = CostEntry::new(
            options.model.as_str(),
            options.size.as_str(),
            options.aspect_ratio.as_deref(),
            usage.prompt_token_count,
            usage.candidates_token_count,
            first.as_path(),
        );
        info!(
            cost = %format!("{:.4}", entry.estimated_cost),
            prompt_tokens = entry.prompt_tokens,
            output_tokens = entry.output_tokens,
            "estimated cost"
        );
        if let Err(error) = CostLedger::new(home.costs_file()).append(entry) {
            warn!(error = %error, "failed to record generation cost");
        }
    }

    let mut output_paths = saved.paths;
    if options.transparent {
        info!("applying transparency pipeline");
        let runner = StdPipelineCommandRunner::new().with_timeout(settings.command_timeout());
        let remover = BackgroundRemover::new(runner, settings.background_removal_config())
            .with_reporter(Arc::new(TracingPipelineReporter));
        output_paths = remover
            .remove_backgrounds(output_paths.as_slice())
            .into_iter()
            .map(BackgroundRemovalOutcome::into_path)
            .collect();
    }

    println!("Output:");
    for path in &output_paths {
        println!("  -> {}", path.display());
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  nb \"<prompt>\" [options]\n\n",
            "Options:\n",
            "  -o, --output <name>     output file stem (default nb-<timestamp>)\n",
            "  -s, --size <size>       512 | 1K | 2K | 4K (default 1K)\n",
            "  -a, --aspect <ratio>    1:1 16:9 9:16 4:3 3:4 3:2 2:3 4:5 5:4 21:9 1:4 1:8 4:1 8:1\n",
            "  -m, --model <model>     flash (default) | pro | nb2 | nb-pro | full model id\n",
            "  -d, --dir <path>        output directory (default: current directory)\n",
            "  -r, --ref <image>       reference image, repeatable (max 14)\n",
            "  -t, --transparent       generate on green screen and remove the background\n",
            "      --api-key <key>     Gemini API key (overrides GEMINI_API_KEY and .env files)\n",
            "      --settings <path>   settings file (default ./.nano-banana/settings.toml)\n",
            "      --costs             print the cost summary\n",
            "  -h, --help              show this help\n\n",
            "Transparency requires ffmpeg and ImageMagick (magick or convert) on PATH.\n"
        )
    );
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edit_guard_core::analysis::GroundTruthAnalyzer;
use edit_guard_core::execution::NativeToolRegistry;
use edit_guard_core::learning::open_learning_store;
use edit_guard_core::orchestrator::{ConversationContext, RunControl, ToolCallRunner};
use edit_guard_core::settings::{GuardSettings, SettingsError};
use edit_guard_core::tools::{ProposalParseError, ToolCallProposal};
use edit_guard_core::validation::ParameterValidator;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Proposal(#[from] ProposalParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliArgs {
    settings: Option<String>,
    image: Option<PathBuf>,
    proposal: Option<String>,
    output: Option<PathBuf>,
    max_retries: Option<u32>,
    timeout_ms: Option<u64>,
    keep: Option<usize>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let Some(command) = cli_args.first().cloned() else {
        print_usage();
        std::process::exit(2);
    };
    let rest = &cli_args[1..];
    if rest
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
        || matches!(command.as_str(), "-h" | "--help" | "help")
    {
        print_usage();
        return;
    }

    let result = match command.as_str() {
        "analyze" => run_analyze_cli(rest),
        "validate" => run_validate_cli(rest),
        "run" => run_tool_call_cli(rest).await,
        "learning-stats" => run_learning_stats_cli(rest),
        "learning-prune" => run_learning_prune_cli(rest),
        unknown => Err(CliError::Usage(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))),
    };
    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_cli_args(args: &[String]) -> Result<CliArgs, CliError> {
    let mut parsed = CliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, CliError> {
            let Some(value) = args.get(idx + 1) else {
                return Err(CliError::Usage(format!("Missing value for {flag}")));
            };
            Ok(value.clone())
        };
        let number = |idx: usize| -> Result<u64, CliError> {
            let raw = needs_value(idx)?;
            raw.trim()
                .parse::<u64>()
                .map_err(|_| CliError::Usage(format!("{flag} expects a number, got '{raw}'")))
        };

        match flag {
            "--settings" => parsed.settings = Some(needs_value(i)?),
            "--image" => parsed.image = Some(PathBuf::from(needs_value(i)?)),
            "--proposal" => parsed.proposal = Some(needs_value(i)?),
            "--output" => parsed.output = Some(PathBuf::from(needs_value(i)?)),
            "--max-retries" => {
                let value = number(i)?;
                parsed.max_retries = Some(u32::try_from(value).map_err(|_| {
                    CliError::Usage(format!("--max-retries is out of range: {value}"))
                })?);
            }
            "--timeout-ms" => parsed.timeout_ms = Some(number(i)?),
            "--keep" => parsed.keep = Some(number(i)? as usize),
            unknown => {
                return Err(CliError::Usage(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                )));
            }
        }
        i += 2;
    }
    Ok(parsed)
}

fn load_settings(args: &CliArgs) -> Result<GuardSettings, CliError> {
    let app_root = std::env::current_dir().map_err(|source| CliError::Read {
        path: String::from("."),
        source,
    })?;
    Ok(GuardSettings::load(app_root.as_path(), args.settings.as_deref())?)
}

fn read_image(args: &CliArgs) -> Result<Vec<u8>, CliError> {
    let path = args
        .image
        .as_ref()
        .ok_or_else(|| CliError::Usage(String::from("Missing required --image")))?;
    std::fs::read(path).map_err(|source| CliError::Read {
        path: path.display().to_string(),
        source,
    })
}

// `--proposal` takes inline JSON or `@path/to/proposal.json`.
fn read_proposal(args: &CliArgs) -> Result<ToolCallProposal, CliError> {
    let raw = args
        .proposal
        .as_deref()
        .ok_or_else(|| CliError::Usage(String::from("Missing required --proposal")))?;
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).map_err(|source| CliError::Read {
            path: path.to_string(),
            source,
        })?,
        None => raw.to_string(),
    };
    let value = serde_json::from_str::<Value>(text.as_str())?;
    Ok(ToolCallProposal::from_json(&value)?)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_analyze_cli(args: &[String]) -> Result<(), CliError> {
    let parsed = parse_cli_args(args)?;
    let settings = load_settings(&parsed)?;
    let image = read_image(&parsed)?;
    let analysis = GroundTruthAnalyzer::new(settings.analysis).analyze(&image);
    print_json(&analysis)
}

fn run_validate_cli(args: &[String]) -> Result<(), CliError> {
    let parsed = parse_cli_args(args)?;
    let settings = load_settings(&parsed)?;
    let image = read_image(&parsed)?;
    let proposal = read_proposal(&parsed)?;
    let analysis = GroundTruthAnalyzer::new(settings.analysis.clone()).analyze(&image);
    let store = open_learning_store(&settings.learning, &settings.similarity);
    let validation =
        ParameterValidator::new(settings.validation).validate(&proposal, &analysis, store.as_ref());
    print_json(&json!({
        "tool": proposal.tool,
        "analysis_confidence": analysis.confidence,
        "validation": validation,
    }))
}

async fn run_tool_call_cli(args: &[String]) -> Result<(), CliError> {
    let parsed = parse_cli_args(args)?;
    let settings = load_settings(&parsed)?;
    let image = read_image(&parsed)?;
    let proposal = read_proposal(&parsed)?;

    let runner = ToolCallRunner::from_settings(&settings, Arc::new(NativeToolRegistry));
    let max_retries = parsed.max_retries.unwrap_or(runner.default_max_retries());
    let mut control = RunControl::new();
    if let Some(timeout_ms) = parsed.timeout_ms {
        control = control.with_timeout(Duration::from_millis(timeout_ms));
    }
    let context = ConversationContext::new(format!("cli run of {}", proposal.tool));
    let report = runner
        .run_tool_call(proposal, Arc::from(image), &context, max_retries, &control)
        .await;
    runner.wait_for_learning_writes().await;

    if let (Some(path), Some(result)) = (parsed.output.as_ref(), report.final_result.as_ref()) {
        std::fs::write(path, result).map_err(|source| CliError::Write {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "result image written");
    }
    print_json(&report)
}

fn run_learning_stats_cli(args: &[String]) -> Result<(), CliError> {
    let parsed = parse_cli_args(args)?;
    let settings = load_settings(&parsed)?;
    let store = open_learning_store(&settings.learning, &settings.similarity);
    print_json(&store.stats())
}

fn run_learning_prune_cli(args: &[String]) -> Result<(), CliError> {
    let parsed = parse_cli_args(args)?;
    let keep = parsed
        .keep
        .ok_or_else(|| CliError::Usage(String::from("Missing required --keep")))?;
    let settings = load_settings(&parsed)?;
    let store = open_learning_store(&settings.learning, &settings.similarity);
    let removed = store.prune(keep);
    print_json(&json!({
        "ok": true,
        "backend": store.backend_name(),
        "kept": keep,
        "removed": removed,
    }))
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  edit-guard-core analyze --image PATH [--settings PATH]\n",
        "  edit-guard-core validate --image PATH --proposal JSON|@FILE [--settings PATH]\n",
        "  edit-guard-core run --image PATH --proposal JSON|@FILE [--max-retries N] ",
        "[--output PATH] [--timeout-ms MS] [--settings PATH]\n",
        "  edit-guard-core learning-stats [--settings PATH]\n",
        "  edit-guard-core learning-prune --keep N [--settings PATH]\n\n",
        "Settings default: $EDIT_GUARD_SETTINGS, else config/edit_guard.settings.toml\n",
        "Learning records persist only when EDIT_GUARD_LEARNING_DB or learning.sqlite_path is set\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_run_flags() {
        let parsed = parse_cli_args(&args(&[
            "--image",
            "in.png",
            "--proposal",
            "@proposal.json",
            "--max-retries",
            "2",
            "--timeout-ms",
            "1500",
        ]))
        .expect("parse should succeed");
        assert_eq!(parsed.image, Some(PathBuf::from("in.png")));
        assert_eq!(parsed.proposal.as_deref(), Some("@proposal.json"));
        assert_eq!(parsed.max_retries, Some(2));
        assert_eq!(parsed.timeout_ms, Some(1500));
    }

    #[test]
    fn rejects_unknown_flags_and_missing_values() {
        let err = parse_cli_args(&args(&["--bogus"])).expect_err("unknown flag");
        assert!(err.to_string().contains("Unknown argument"));
        let err = parse_cli_args(&args(&["--keep"])).expect_err("missing value");
        assert!(err.to_string().contains("--keep"));
        let err = parse_cli_args(&args(&["--keep", "many"])).expect_err("not a number");
        assert!(err.to_string().contains("expects a number"));
    }

    #[test]
    fn inline_proposal_is_parsed() {
        let parsed = CliArgs {
            proposal: Some(String::from(r##"{"tool": "upscale", "scale": 2}"##)),
            ..CliArgs::default()
        };
        let proposal = read_proposal(&parsed).expect("proposal parses");
        assert_eq!(proposal.tool.as_str(), "upscale");
        assert_eq!(proposal.parameters["scale"], json!(2));
    }
}

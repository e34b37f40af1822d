mod binder;
mod catalog;
mod config;
mod dispatcher;
mod envelope;
mod error;
mod llm;
mod operations;
mod pipeline;
mod resolver;
mod runtime;
mod sandbox;
mod server;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Natural-language task runner over a sandboxed data directory")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "TASKDESK_RS_CONFIG",
        default_value = "taskdesk-rs.toml"
    )]
    config: PathBuf,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "TASKDESK_RS_LOG", default_value = "info")]
    log: String,

    /// Override the HTTP bind address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Override the sandbox root directory.
    #[arg(long = "sandbox-root", global = true)]
    sandbox_root: Option<PathBuf>,

    /// Override the chat completions endpoint used for classification.
    #[arg(long = "classifier-url", global = true)]
    classifier_url: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Serve the HTTP boundary (default).
    Serve,
    /// Classify and execute one task, printing the result document.
    Run(RunArgs),
    /// Print a file from inside the sandbox.
    Read(ReadArgs),
    /// List the operation catalog.
    Operations(OperationsArgs),
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Natural-language task description.
    #[arg(long)]
    task: String,
}

#[derive(Debug, Clone, Args)]
struct ReadArgs {
    /// Path inside the sandbox, e.g. data/out.txt.
    #[arg(long)]
    path: String,
}

#[derive(Debug, Clone, Args, Default)]
struct OperationsArgs {
    /// Emit the tool schemas as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Serve);
    match command {
        CliCommand::Serve => {
            let cfg = load_config(&cli)?;
            runtime::TaskRuntime::new(cfg)?.run().await
        }
        CliCommand::Run(args) => run_task_command(&cli, args).await,
        CliCommand::Read(args) => run_read_command(&cli, args),
        CliCommand::Operations(args) => {
            run_operations_command(args);
            Ok(())
        }
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(
        cli.bind.as_deref(),
        cli.sandbox_root.as_deref(),
        cli.classifier_url.as_deref(),
    )?;
    Ok(cfg)
}

async fn run_task_command(cli: &Cli, args: RunArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let pipeline = runtime::build_pipeline(&cfg)?;
    let envelope = pipeline.run(&args.task).await;
    print_json_value(&envelope.to_document());
    if envelope.is_success() {
        return Ok(());
    }
    Err(anyhow!(
        "task failed ({})",
        envelope.error_code().map(|code| code.as_str()).unwrap_or("error")
    ))
}

fn run_read_command(cli: &Cli, args: ReadArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let guard = sandbox::SandboxGuard::new(&cfg.sandbox.root, &cfg.sandbox.logical_prefix)?;
    let path = guard
        .resolve(&args.path)
        .map_err(|err| anyhow!("{}: {}", err.code.as_str(), err.message))?;
    let bytes =
        std::fs::read(path.as_path()).with_context(|| format!("failed reading {path}"))?;
    std::io::stdout()
        .write_all(&bytes)
        .context("failed writing to stdout")?;
    Ok(())
}

fn run_operations_command(args: OperationsArgs) {
    let specs = catalog::catalog();
    if args.json {
        print_json_value(&json!({
            "count": specs.len(),
            "tools": catalog::tool_schemas(specs),
        }));
        return;
    }
    println!("operations: {}", specs.len());
    for spec in specs {
        let params = spec
            .parameters
            .iter()
            .map(|param| {
                if param.required {
                    format!("{}*", param.name)
                } else {
                    param.name.to_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        println!("{}({params})", spec.name());
    }
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, &cli.config, command_available);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    available: impl Fn(&str) -> bool,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            let message = if config_path.exists() {
                format!("loaded {}", config_path.display())
            } else {
                format!("{} not found, using defaults", config_path.display())
            };
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message,
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    let catalog_check = catalog::verify_catalog();
    checks.push(DoctorCheck {
        id: "catalog".to_owned(),
        status: if catalog_check.is_ok() { "pass" } else { "fail" }.to_owned(),
        message: format!("{} operations", catalog::catalog().len()),
        detail: catalog_check.err().map(|err| format!("{err:#}")),
    });

    if let Some(cfg) = config.as_ref() {
        let sandbox = sandbox::SandboxGuard::new(&cfg.sandbox.root, &cfg.sandbox.logical_prefix);
        checks.push(match sandbox {
            Ok(guard) => DoctorCheck {
                id: "sandbox.root".to_owned(),
                status: "pass".to_owned(),
                message: guard.root().display().to_string(),
                detail: Some(format!("logical prefix `{}`", cfg.sandbox.logical_prefix)),
            },
            Err(err) => DoctorCheck {
                id: "sandbox.root".to_owned(),
                status: "fail".to_owned(),
                message: format!("unusable sandbox root {}", cfg.sandbox.root.display()),
                detail: Some(format!("{err:#}")),
            },
        });

        let has_key = cfg
            .classifier
            .api_key
            .as_deref()
            .map(str::trim)
            .is_some_and(|key| !key.is_empty());
        checks.push(DoctorCheck {
            id: "classifier.api_key".to_owned(),
            status: if has_key { "pass" } else { "warn" }.to_owned(),
            message: if has_key {
                "configured".to_owned()
            } else {
                "missing".to_owned()
            },
            detail: Some(cfg.classifier.endpoint.clone()),
        });

        for (id, runner, purpose) in [
            (
                "operations.script_runner",
                cfg.operations.script_runner.as_str(),
                "needed by generate_data",
            ),
            (
                "operations.formatter_runner",
                cfg.operations.formatter_runner.as_str(),
                "needed by format_file",
            ),
        ] {
            let found = available(runner);
            checks.push(DoctorCheck {
                id: id.to_owned(),
                status: if found { "pass" } else { "warn" }.to_owned(),
                message: if found {
                    format!("{runner} available")
                } else {
                    format!("{runner} not found")
                },
                detail: Some(purpose.to_owned()),
            });
        }
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn command_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("taskdesk-main-{tag}-{stamp}"))
    }

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["taskdesk-agent-rs"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn cli_parses_run_command_with_global_overrides() {
        let cli = Cli::parse_from([
            "taskdesk-agent-rs",
            "run",
            "--task",
            "count Mondays in dates.txt",
            "--sandbox-root",
            "/tmp/sandbox",
            "--bind",
            "127.0.0.1:9000",
        ]);
        match cli.command {
            Some(CliCommand::Run(args)) => assert_eq!(args.task, "count Mondays in dates.txt"),
            _ => panic!("expected run command"),
        }
        assert_eq!(cli.sandbox_root, Some(PathBuf::from("/tmp/sandbox")));
        assert_eq!(cli.bind.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn cli_parses_doctor_and_operations_flags() {
        let cli = Cli::parse_from(["taskdesk-agent-rs", "doctor", "--json"]);
        assert!(matches!(cli.command, Some(CliCommand::Doctor(DoctorArgs { json: true }))));
        let cli = Cli::parse_from(["taskdesk-agent-rs", "operations", "--json"]);
        assert!(matches!(
            cli.command,
            Some(CliCommand::Operations(OperationsArgs { json: true }))
        ));
        let cli = Cli::parse_from(["taskdesk-agent-rs", "read", "--path", "data/out.txt"]);
        match cli.command {
            Some(CliCommand::Read(args)) => assert_eq!(args.path, "data/out.txt"),
            _ => panic!("expected read command"),
        }
    }

    #[test]
    fn doctor_report_fails_on_config_error() {
        let report = build_doctor_report(
            Err("bad toml".to_owned()),
            Path::new("missing.toml"),
            |_| true,
        );
        assert!(!report.ok);
        assert_eq!(report.checks[0].id, "config.load");
        assert_eq!(report.checks[0].status, "fail");
    }

    #[test]
    fn doctor_report_warns_on_missing_runners_and_key() {
        let root = temp_dir("doctor");
        let mut cfg = Config::default();
        cfg.sandbox.root = root.clone();
        cfg.classifier.api_key = None;
        let report = build_doctor_report(Ok(cfg), Path::new("missing.toml"), |_| false);
        assert!(report.ok);
        let status_of = |id: &str| {
            report
                .checks
                .iter()
                .find(|check| check.id == id)
                .map(|check| check.status.clone())
        };
        assert_eq!(status_of("sandbox.root").as_deref(), Some("pass"));
        assert_eq!(status_of("classifier.api_key").as_deref(), Some("warn"));
        assert_eq!(status_of("operations.script_runner").as_deref(), Some("warn"));
        assert_eq!(status_of("operations.formatter_runner").as_deref(), Some("warn"));
        let _ = std::fs::remove_dir_all(root);
    }
}

use std::{env, path::PathBuf, time::Duration};

use agent::{AgentConfig, CoordinatorClient, init_logging, run_agent};
use tracing::info;

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match parse_cli_args() {
        Ok(CliAction::Run(cli)) => *cli,
        Ok(CliAction::Help) => {
            print_cli_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("{}", binary_version_text());
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print_cli_help();
            return Err(err.into());
        }
    };

    init_logging()?;
    info!("{}", binary_version_text());

    let config = resolve_config(cli)?;
    match config {
        Resolved::Watch(config) => {
            tokio::select! {
                _ = run_agent(config) => {}
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("shutting down");
                }
            }
        }
        Resolved::Fire(config) => {
            let client = CoordinatorClient::new(
                &config.coordinator_url,
                config.secret,
                Duration::from_millis(config.rpc_timeout_ms),
            );
            let result = client.increment_trigger(&config.trigger).await?;
            info!("trigger={} count={}", result.trigger, result.count);
            println!("{}", result.count);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Watch,
    Fire,
}

#[derive(Clone, Debug, Default)]
struct CliArgs {
    mode: Mode,
    coordinator_url: Option<String>,
    trigger: Option<String>,
    script: Option<PathBuf>,
    shell: Option<String>,
    poll_interval_ms: Option<u64>,
    rpc_timeout_ms: Option<u64>,
}

enum CliAction {
    Run(Box<CliArgs>),
    Help,
    Version,
}

enum Resolved {
    Watch(AgentConfig),
    Fire(FireConfig),
}

struct FireConfig {
    coordinator_url: String,
    secret: String,
    trigger: String,
    rpc_timeout_ms: u64,
}

fn parse_cli_args() -> Result<CliAction, String> {
    let mut args = env::args().skip(1).peekable();
    let mut cli = CliArgs::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            "watch" => cli.mode = Mode::Watch,
            "fire" => cli.mode = Mode::Fire,
            "--coordinator-url" => {
                cli.coordinator_url = Some(next_arg_value("--coordinator-url", &mut args)?);
            }
            "--trigger" => {
                cli.trigger = Some(next_arg_value("--trigger", &mut args)?);
            }
            "--script" => {
                cli.script = Some(PathBuf::from(next_arg_value("--script", &mut args)?));
            }
            "--shell" => {
                cli.shell = Some(next_arg_value("--shell", &mut args)?);
            }
            "--poll-interval-ms" => {
                let value = next_arg_value("--poll-interval-ms", &mut args)?;
                cli.poll_interval_ms = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid --poll-interval-ms: {value}"))?,
                );
            }
            "--rpc-timeout-ms" => {
                let value = next_arg_value("--rpc-timeout-ms", &mut args)?;
                cli.rpc_timeout_ms = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid --rpc-timeout-ms: {value}"))?,
                );
            }
            _ => {
                return Err(format!("unknown argument: {arg}"));
            }
        }
    }
    Ok(CliAction::Run(Box::new(cli)))
}

fn next_arg_value(
    flag: &str,
    args: &mut std::iter::Peekable<impl Iterator<Item = String>>,
) -> Result<String, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("missing value for {flag}"))?;
    if value.trim().is_empty() {
        return Err(format!("value for {flag} cannot be empty"));
    }
    Ok(value)
}

fn resolve_config(cli: CliArgs) -> Result<Resolved, Box<dyn std::error::Error>> {
    let coordinator_url = cli
        .coordinator_url
        .or_else(|| env_value("PROSTAGMA_HOST"))
        .ok_or("coordinator url missing: pass --coordinator-url or set PROSTAGMA_HOST")?;
    url::Url::parse(&coordinator_url)
        .map_err(|err| format!("invalid coordinator url {coordinator_url}: {err}"))?;
    let secret = env_value("PROSTAGMA_SECRET").ok_or("PROSTAGMA_SECRET must be set")?;
    let trigger = cli
        .trigger
        .or_else(|| env_value("PROSTAGMA_TRIGGER"))
        .ok_or("trigger name missing: pass --trigger or set PROSTAGMA_TRIGGER")?;
    let rpc_timeout_ms = match cli.rpc_timeout_ms {
        Some(value) => value,
        None => parse_u64("PROSTAGMA_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?,
    };

    if cli.mode == Mode::Fire {
        return Ok(Resolved::Fire(FireConfig {
            coordinator_url,
            secret,
            trigger,
            rpc_timeout_ms,
        }));
    }

    let script_path = cli
        .script
        .or_else(|| env_value("PROSTAGMA_SCRIPT").map(PathBuf::from))
        .ok_or("build script missing: pass --script or set PROSTAGMA_SCRIPT")?;
    let shell = cli
        .shell
        .or_else(|| env_value("PROSTAGMA_SHELL"))
        .unwrap_or_else(|| DEFAULT_SHELL.to_string());
    let poll_interval_ms = match cli.poll_interval_ms {
        Some(value) => value,
        None => parse_u64("PROSTAGMA_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
    };

    Ok(Resolved::Watch(AgentConfig {
        coordinator_url,
        secret,
        trigger,
        script_path,
        shell,
        poll_interval_ms,
        rpc_timeout_ms,
    }))
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env_value(key) {
        Some(value) => Ok(value.parse()?),
        None => Ok(default),
    }
}

fn print_cli_help() {
    eprintln!(concat!(
        "Usage: prostagma-agent [watch|fire] [options]\n\n",
        "Commands:\n",
        "  watch                         Poll the trigger and run the build script on every increase (default)\n",
        "  fire                          Increment the trigger once and print the new count\n\n",
        "Options:\n",
        "  --coordinator-url <URL>       Coordinator base URL (env PROSTAGMA_HOST)\n",
        "  --trigger <NAME>              Trigger to watch or fire (env PROSTAGMA_TRIGGER)\n",
        "  --script <PATH>               Build script, re-read on every run (env PROSTAGMA_SCRIPT)\n",
        "  --shell <PATH>                Shell for `shell` steps (env PROSTAGMA_SHELL, default /bin/sh)\n",
        "  --poll-interval-ms <MS>       Trigger poll period (env PROSTAGMA_POLL_INTERVAL_MS, default 5000)\n",
        "  --rpc-timeout-ms <MS>         Timeout for trigger requests (env PROSTAGMA_RPC_TIMEOUT_MS, default 30000)\n",
        "  -V, --version                 Show version with git metadata\n",
        "  -h, --help                    Show this help\n\n",
        "The shared secret is read from PROSTAGMA_SECRET.\n"
    ));
}

fn binary_version_text() -> String {
    buildinfo::version_text(
        env!("CARGO_PKG_NAME"),
        option_env!("PROSTAGMA_BUILD_GIT_TAG"),
        option_env!("PROSTAGMA_BUILD_GIT_COMMIT"),
        option_env!("PROSTAGMA_BUILD_GIT_DIRTY"),
    )
}

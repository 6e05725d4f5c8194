use std::{
    io,
    path::{Path, PathBuf},
};

use protocol::FetchSource;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info};

use crate::{
    client::{ClientError, CoordinatorClient},
    download::ensure_file,
    logging::category_build,
};

/// An ordered list of build steps, read from a YAML document of the form
///
/// ```yaml
/// steps:
///   - shell: |
///       make clean
///       make all
///   - download:
///       cache: true
///       url: https://example.com/toolchain.tar.gz
///       dest: toolchain.tar.gz
///   - download_s3:
///       url: s3://artifacts/base.img
///       dest: base.img
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildScript {
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Shell(ShellStep),
    Download(DownloadStep),
    DownloadS3(DownloadStep),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellStep {
    pub commands: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DownloadStep {
    #[serde(default)]
    pub cache: bool,
    pub url: String,
    pub dest: PathBuf,
}

#[derive(Debug)]
pub enum ScriptError {
    Load { path: PathBuf, source: io::Error },
    Parse(String),
    UnknownStep { index: usize, kind: String },
    MalformedStep { index: usize, message: String },
    Spawn { command: String, source: io::Error },
    CommandFailed { command: String, status: String, output: String },
    Download { url: String, source: ClientError },
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Load { path, source } => {
                write!(f, "could not read build script {}: {source}", path.display())
            }
            ScriptError::Parse(message) => write!(f, "could not parse build script: {message}"),
            ScriptError::UnknownStep { index, kind } => {
                write!(f, "step {index}: unknown step kind `{kind}`")
            }
            ScriptError::MalformedStep { index, message } => write!(f, "step {index}: {message}"),
            ScriptError::Spawn { command, source } => {
                write!(f, "could not start `{command}`: {source}")
            }
            ScriptError::CommandFailed {
                command,
                status,
                output,
            } => write!(f, "`{command}` exited with {status}: {output}"),
            ScriptError::Download { url, source } => {
                write!(f, "could not download {url}: {source}")
            }
        }
    }
}

impl std::error::Error for ScriptError {}

#[derive(Deserialize)]
struct RawScript {
    #[serde(default)]
    steps: Vec<serde_yaml::Value>,
}

impl ShellStep {
    fn from_text(text: &str) -> Self {
        Self {
            commands: text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl BuildScript {
    pub async fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ScriptError::Load {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let raw: RawScript =
            serde_yaml::from_str(text).map_err(|err| ScriptError::Parse(err.to_string()))?;
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, value)| parse_step(index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }
}

fn parse_step(index: usize, value: serde_yaml::Value) -> Result<Step, ScriptError> {
    let malformed = |message: String| ScriptError::MalformedStep { index, message };

    let serde_yaml::Value::Mapping(map) = value else {
        return Err(malformed("expected a map of step kind to arguments".to_string()));
    };
    if map.len() != 1 {
        return Err(malformed(format!(
            "expected exactly one step kind, found {}",
            map.len()
        )));
    }
    let Some((key, body)) = map.into_iter().next() else {
        return Err(malformed("empty step".to_string()));
    };
    let Some(kind) = key.as_str() else {
        return Err(malformed("step kind must be a string".to_string()));
    };

    match kind {
        "shell" => {
            let text: String = serde_yaml::from_value(body)
                .map_err(|err| malformed(format!("`shell` expects a string: {err}")))?;
            Ok(Step::Shell(ShellStep::from_text(&text)))
        }
        "download" => serde_yaml::from_value(body)
            .map(Step::Download)
            .map_err(|err| malformed(format!("invalid `download` step: {err}"))),
        "download_s3" => serde_yaml::from_value(body)
            .map(Step::DownloadS3)
            .map_err(|err| malformed(format!("invalid `download_s3` step: {err}"))),
        other => Err(ScriptError::UnknownStep {
            index,
            kind: other.to_string(),
        }),
    }
}

/// Runs every step in order, stopping at the first failure. Steps that
/// already ran are not undone.
pub async fn run_build_script(
    script: &BuildScript,
    client: &CoordinatorClient,
    shell: &str,
) -> Result<(), ScriptError> {
    for (index, step) in script.steps.iter().enumerate() {
        match step {
            Step::Shell(shell_step) => {
                for command in &shell_step.commands {
                    run_command(shell, command).await?;
                }
            }
            Step::Download(download) => {
                run_download(client, FetchSource::Http, download).await?;
            }
            Step::DownloadS3(download) => {
                run_download(client, FetchSource::S3, download).await?;
            }
        }
        info!("{} step {index} done", category_build());
    }
    Ok(())
}

async fn run_command(shell: &str, command: &str) -> Result<(), ScriptError> {
    let output = Command::new(shell)
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|source| ScriptError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        error!(
            "{} command failed command={command} status={} output={}",
            category_build(),
            output.status,
            combined.trim_end()
        );
        return Err(ScriptError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            output: combined.trim_end().to_string(),
        });
    }
    info!(
        "{} ran command command={command} output={}",
        category_build(),
        combined.trim_end()
    );
    Ok(())
}

async fn run_download(
    client: &CoordinatorClient,
    source: FetchSource,
    step: &DownloadStep,
) -> Result<(), ScriptError> {
    ensure_file(&client.origin(source), &step.url, &step.dest, step.cache)
        .await
        .map(|_| ())
        .map_err(|source| ScriptError::Download {
            url: step.url.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_step_kind_in_order() {
        let script = BuildScript::parse(concat!(
            "steps:\n",
            "  - shell: |\n",
            "      echo one\n",
            "\n",
            "      echo two\n",
            "  - download:\n",
            "      cache: true\n",
            "      url: https://example.com/a.tar\n",
            "      dest: a.tar\n",
            "  - download_s3:\n",
            "      url: s3://bucket/b.img\n",
            "      dest: out/b.img\n",
        ))
        .expect("script should parse");

        assert_eq!(
            script.steps,
            vec![
                Step::Shell(ShellStep {
                    commands: vec!["echo one".to_string(), "echo two".to_string()],
                }),
                Step::Download(DownloadStep {
                    cache: true,
                    url: "https://example.com/a.tar".to_string(),
                    dest: PathBuf::from("a.tar"),
                }),
                Step::DownloadS3(DownloadStep {
                    cache: false,
                    url: "s3://bucket/b.img".to_string(),
                    dest: PathBuf::from("out/b.img"),
                }),
            ]
        );
    }

    #[test]
    fn unknown_step_kind_is_rejected() {
        let err = BuildScript::parse("steps:\n  - shell: echo ok\n  - upload: {}\n")
            .expect_err("script should be rejected");
        match err {
            ScriptError::UnknownStep { index, kind } => {
                assert_eq!(index, 1);
                assert_eq!(kind, "upload");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn step_with_two_kinds_is_malformed() {
        let err = BuildScript::parse("steps:\n  - shell: echo a\n    download: {}\n")
            .expect_err("script should be rejected");
        assert!(matches!(err, ScriptError::MalformedStep { index: 0, .. }));
    }

    #[test]
    fn non_map_step_is_malformed() {
        let err = BuildScript::parse("steps:\n  - echo a\n").expect_err("should be rejected");
        assert!(matches!(err, ScriptError::MalformedStep { index: 0, .. }));
    }

    #[test]
    fn download_without_url_is_malformed() {
        let err = BuildScript::parse("steps:\n  - download:\n      dest: x\n")
            .expect_err("should be rejected");
        assert!(matches!(err, ScriptError::MalformedStep { index: 0, .. }));
    }

    #[test]
    fn script_without_steps_is_empty() {
        let script = BuildScript::parse("steps: []\n").expect("should parse");
        assert!(script.steps.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_stops_the_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("after");
        let script = BuildScript::parse(&format!(
            "steps:\n  - shell: |\n      true\n      exit 3\n      touch {}\n",
            marker.display()
        ))
        .expect("script should parse");
        let client = CoordinatorClient::new(
            "http://127.0.0.1:9",
            "unused",
            std::time::Duration::from_secs(1),
        );

        let err = run_build_script(&script, &client, "/bin/sh")
            .await
            .expect_err("script should fail");
        assert!(matches!(err, ScriptError::CommandFailed { .. }));
        assert!(!marker.exists());
    }
}

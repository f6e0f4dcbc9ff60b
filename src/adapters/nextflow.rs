use crate::domain::ports::{PipelineOutcome, PipelineRunner};
use crate::utils::error::{Result, RozError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a Nextflow pipeline from its git repository as a child process.
#[derive(Debug, Clone)]
pub struct NextflowRunner {
    pipe: String,
    config: Option<PathBuf>,
    executable: PathBuf,
    profile: Option<String>,
    timeout: Duration,
}

impl NextflowRunner {
    pub fn new(pipe: &str, executable: PathBuf) -> Self {
        Self {
            pipe: pipe.to_string(),
            config: None,
            executable,
            profile: None,
            timeout: Duration::from_secs(7200),
        }
    }

    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_command(&self, params: &BTreeMap<String, String>) -> Vec<String> {
        let mut cmd = vec![
            self.executable.display().to_string(),
            "run".to_string(),
            "-r".to_string(),
            "main".to_string(),
            "-latest".to_string(),
            self.pipe.clone(),
        ];

        if let Some(config) = &self.config {
            let resolved = std::fs::canonicalize(config).unwrap_or_else(|_| config.clone());
            cmd.push("-c".to_string());
            cmd.push(resolved.display().to_string());
        }

        if let Some(profile) = &self.profile {
            cmd.push("-profile".to_string());
            cmd.push(profile.clone());
        }

        for (k, v) in params {
            cmd.push(format!("--{}", k));
            cmd.push(v.clone());
        }

        cmd
    }

    async fn run(cmd: Vec<String>, timeout: Duration) -> Result<PipelineOutcome> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| RozError::PipelineError {
                message: "empty command".to_string(),
            })?;

        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(output) => {
                let output = output.map_err(|e| RozError::PipelineError {
                    message: format!("failed to start {}: {}", program, e),
                })?;
                Ok(PipelineOutcome {
                    return_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    command: cmd,
                })
            }
            Err(_) => {
                tracing::warn!(command = %cmd.join(" "), "⏰ pipeline timed out after {:?}", timeout);
                Ok(PipelineOutcome {
                    return_code: -1,
                    timed_out: true,
                    stdout: String::new(),
                    stderr: String::new(),
                    command: cmd,
                })
            }
        }
    }
}

/// Run name Nextflow prints in brackets on its `Launching` line.
pub fn run_name(stdout: &str) -> Option<String> {
    let line = stdout
        .lines()
        .find(|l| l.contains("Launching"))
        .or_else(|| stdout.lines().nth(3))?;
    let start = line.find('[')?;
    let end = start + line[start..].find(']')?;
    let name = line[start + 1..end].trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl PipelineRunner for NextflowRunner {
    async fn execute(&self, params: &BTreeMap<String, String>) -> Result<PipelineOutcome> {
        let cmd = self.build_command(params);
        tracing::info!(command = %cmd.join(" "), "🚀 starting pipeline");
        Self::run(cmd, self.timeout).await
    }

    async fn cleanup(&self, stdout: &str) -> Result<PipelineOutcome> {
        let name = run_name(stdout).ok_or_else(|| RozError::PipelineError {
            message: "could not find the pipeline run name in stdout".to_string(),
        })?;
        let cmd = vec![
            self.executable.display().to_string(),
            "clean".to_string(),
            "-f".to_string(),
            name,
        ];
        Self::run(cmd, CLEANUP_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STDOUT: &str = "N E X T F L O W  ~  version 23.04.1\n\
Pulling artifacts/scylla ...\n\
 Already-up-to-date\n\
Launching `https://github.com/artic-network/scylla` [elated_euler] DSL2 - revision: 4e4c9f7 [main]\n\
executor >  k8s (12)\n";

    #[test]
    fn test_run_name_from_launch_line() {
        assert_eq!(run_name(STDOUT).as_deref(), Some("elated_euler"));
        assert_eq!(run_name("nothing useful"), None);
    }

    #[test]
    fn test_build_command() {
        let runner = NextflowRunner::new("artic-network/scylla", PathBuf::from("nextflow"))
            .with_profile(Some("docker".to_string()));
        let mut params = BTreeMap::new();
        params.insert("unique_id".to_string(), "abc".to_string());
        params.insert("climb".to_string(), "true".to_string());

        let cmd = runner.build_command(&params);
        assert_eq!(
            cmd,
            vec![
                "nextflow", "run", "-r", "main", "-latest", "artic-network/scylla", "-profile",
                "docker", "--climb", "true", "--unique_id", "abc"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_reported() {
        let outcome = NextflowRunner::run(
            vec!["sleep".to_string(), "5".to_string()],
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_captured() {
        let outcome = NextflowRunner::run(
            vec!["sh".to_string(), "-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome.return_code, 3);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }
}

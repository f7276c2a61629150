// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend CLI invocation shared by the drivers.
//!
//! Every call is bounded by a timeout and spawned with `kill_on_drop`, so
//! dropping a driver future (timeout supervision, task abort) also stops the
//! child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::traits::{ProviderError, Result};

/// Longest stderr excerpt carried into an error message.
const STDERR_TAIL_CHARS: usize = 400;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last meaningful stderr line(s), bounded in length.
    pub fn stderr_tail(&self) -> String {
        let trimmed = self.stderr.trim();
        if trimmed.is_empty() {
            return match self.code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
        }
        let chars: Vec<char> = trimmed.chars().collect();
        if chars.len() <= STDERR_TAIL_CHARS {
            trimmed.to_string()
        } else {
            chars[chars.len() - STDERR_TAIL_CHARS..].iter().collect()
        }
    }
}

/// A single CLI invocation.
#[derive(Debug, Clone)]
pub(crate) struct CliCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    stdin: Option<String>,
    timeout: Duration,
    step: String,
}

impl CliCommand {
    /// `step` names the invocation in errors and logs.
    pub fn new(program: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(60),
            step: step.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Run to completion and capture output, whatever the exit code.
    pub async fn output(&self) -> Result<CommandOutput> {
        debug!(step = %self.step, program = %self.program, args = ?self.args, "Running command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::Unavailable(format!("'{}' not found on PATH", self.program))
            } else {
                ProviderError::step_failed(&self.step, format!("failed to start: {}", e))
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (self.stdin.as_ref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::StepTimeout {
                    step: self.step.clone(),
                    seconds: self.timeout.as_secs(),
                    partial: Vec::new(),
                });
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }

    /// Run and require a zero exit code; returns stdout.
    pub async fn run(&self) -> Result<String> {
        let output = self.output().await?;
        if !output.success() {
            return Err(ProviderError::step_failed(&self.step, output.stderr_tail()));
        }
        Ok(output.stdout)
    }
}

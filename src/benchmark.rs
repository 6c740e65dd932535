/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{BindingMode, RunConfig},
    console::session::{ConsoleSession, Phase, PhaseOutcome, DB_PROMPT, KDB_ENTER, PANIC, STOPPED},
    host,
    pattern::Pattern,
};
use anyhow::Context;
use colored::Colorize;
use std::{fmt, time::Duration};

/// Where benchmark payloads land on the target.
pub const TARGET_FS_ROOT: &str = "/tmp/benchdir";

/// The script is chained with a guaranteed-nonexistent binary so that a
/// failing script and a missing script produce different console output.
const SENTINEL: &str = "/this/command/does/not/exist";
const DONE_RUNNING: &str = "DONE RUNNING BENCHMARKS";
const CSH_NOT_FOUND: &str = ": Command not found.";

/// How a benchmark invocation terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkRunResult {
    Completed,
    /// The shell could not find the script at all.
    CommandNotFound,
    /// The script ran and failed, or printed the configured failure string.
    ExplicitFailure { matched: String },
    KernelPanic { backtrace: Option<String> },
}

impl fmt::Display for BenchmarkRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchmarkRunResult::Completed => write!(f, "completed"),
            BenchmarkRunResult::CommandNotFound => write!(f, "benchmark script not found"),
            BenchmarkRunResult::ExplicitFailure { matched } => {
                write!(f, "benchmark failed ({})", matched)
            }
            BenchmarkRunResult::KernelPanic { .. } => write!(f, "kernel panic"),
        }
    }
}

/// The ssh endpoint used for file transfers to and from the booted target.
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    fn remote(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }
}

/// Directory on the target where the benchmark ends up.
pub fn target_dir(config: &RunConfig) -> anyhow::Result<String> {
    let name = config
        .benchdir
        .file_name()
        .context("benchmark dir has no final path component")?;
    Ok(format!("{}/{}", TARGET_FS_ROOT, name.to_string_lossy()))
}

/// Copies the benchmark directory and any extra input files to the target.
pub async fn transfer_in(config: &RunConfig, ssh: &SshEndpoint) -> anyhow::Result<()> {
    println!("> {}", "transfer benchmark".yellow());
    println!(
        "copying {} to {}",
        config.benchdir.display(),
        TARGET_FS_ROOT
    );
    host::scp(
        &config.benchdir.display().to_string(),
        &ssh.remote(TARGET_FS_ROOT),
        ssh.port,
        &config.ssh_key,
        config.timeouts.copy(),
    )
    .await?;
    for extra in &config.extra_input_files {
        host::scp(
            extra,
            &ssh.remote(TARGET_FS_ROOT),
            ssh.port,
            &config.ssh_key,
            config.timeouts.copy(),
        )
        .await?;
    }
    Ok(())
}

/// Copies the declared output path and extra output files back to the host.
pub async fn transfer_out(config: &RunConfig, ssh: &SshEndpoint) -> anyhow::Result<()> {
    println!("> {}", "transfer benchmark result".yellow());
    let local_out = match &config.local_out_path {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let target_out = format!("{}/{}", target_dir(config)?, config.out_path);
    host::scp(
        &ssh.remote(&target_out),
        &local_out.display().to_string(),
        ssh.port,
        &config.ssh_key,
        config.timeouts.copy(),
    )
    .await?;
    for extra in &config.extra_output_files {
        host::scp(
            &ssh.remote(extra),
            &local_out.display().to_string(),
            ssh.port,
            &config.ssh_key,
            config.timeouts.copy(),
        )
        .await?;
    }
    Ok(())
}

/// Runs the benchmark script on the booted target and classifies how it
/// terminated.
pub struct BenchmarkController<'a> {
    console: &'a mut ConsoleSession,
    config: &'a RunConfig,
}

impl<'a> BenchmarkController<'a> {
    pub fn new(console: &'a mut ConsoleSession, config: &'a RunConfig) -> Self {
        Self { console, config }
    }

    pub async fn execute(&mut self) -> anyhow::Result<BenchmarkRunResult> {
        println!("> {}", "running benchmark".yellow());
        let t = self.config.timeouts.command();

        self.console.send_line("").await?;
        self.console.expect_prompt(t).await?;
        self.console
            .checked_run(&format!("cd {} && ls -la", target_dir(self.config)?), t)
            .await?;

        match self.config.binding {
            BindingMode::Lazy => {
                self.console.checked_run("unset LD_CHERI_BIND_NOW", t).await?;
                self.console.checked_run("unset LD_BIND_NOW", t).await?;
            }
            BindingMode::Eager => {
                // CheriABI on MIPS has no lazy binding; forcing both link
                // maps eager keeps the ABIs comparable
                self.console
                    .checked_run("export LD_CHERI_BIND_NOW=1", t)
                    .await?;
                self.console.checked_run("export LD_BIND_NOW=1", t).await?;
            }
        }

        if let Some(pre) = &self.config.pre_command {
            self.console.checked_run(pre, t).await?;
        }
        // log the environment for post-mortem diagnosis
        self.console.checked_run("env", t).await?;

        let command = format!(
            "./{} {} || {}",
            self.config.script_name, self.config.script_args, SENTINEL
        );
        self.console.send_line(&command).await?;

        let phase = Phase::new(
            "waiting for benchmark to finish",
            vec![
                Pattern::literal(DONE_RUNNING),
                Pattern::literal(CSH_NOT_FOUND),
                Pattern::literal(format!("{}: not found", SENTINEL)),
                Pattern::literal(self.config.failure_string.clone()),
                Pattern::literal(KDB_ENTER),
                Pattern::literal(PANIC),
                Pattern::literal(STOPPED),
            ],
            self.config.timeouts.benchmark(),
        );
        let m = self
            .console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;

        let result = match m.index {
            0 => BenchmarkRunResult::Completed,
            1 => BenchmarkRunResult::CommandNotFound,
            2 | 3 => BenchmarkRunResult::ExplicitFailure { matched: m.text },
            _ => BenchmarkRunResult::KernelPanic {
                backtrace: self.collect_backtrace().await,
            },
        };
        if result != BenchmarkRunResult::Completed {
            println!("{}", format!("failed to run benchmark: {}", result).red());
        }
        Ok(result)
    }

    /// Requests a backtrace from the kernel debugger. Sent exactly once, and
    /// only after the debugger prompt shows up.
    async fn collect_backtrace(&mut self) -> Option<String> {
        println!("{}", "kernel panic, extracting backtrace".red());
        let enter = Phase::new(
            "waiting for debugger prompt",
            vec![Pattern::literal(DB_PROMPT)],
            Duration::from_secs(10),
        )
        .unguarded();
        if !self.console.run_phase(&enter).await.is_success() {
            return None;
        }
        if self.console.send_line("bt").await.is_err() {
            return None;
        }
        let trace = Phase::new(
            "collecting backtrace",
            vec![Pattern::literal(DB_PROMPT)],
            Duration::from_secs(30),
        )
        .unguarded();
        match self.console.run_phase(&trace).await {
            PhaseOutcome::Success(m) => {
                let text = m.before.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn run_command_chains_the_sentinel() {
        let config = RunConfig {
            benchdir: PathBuf::from("/work/spec-bundle"),
            script_name: "run.sh".to_string(),
            script_args: "-x 1".to_string(),
            ..RunConfig::default()
        };
        let cmd = format!(
            "./{} {} || {}",
            config.script_name, config.script_args, SENTINEL
        );
        assert_eq!(cmd, "./run.sh -x 1 || /this/command/does/not/exist");
        assert_eq!(
            target_dir(&config).expect("target dir"),
            "/tmp/benchdir/spec-bundle"
        );
    }

    #[test]
    fn ssh_endpoint_renders_remote_paths() {
        let ssh = SshEndpoint {
            user: "ctsrd".to_string(),
            host: "10.0.2.15".to_string(),
            port: 22,
        };
        assert_eq!(
            ssh.remote("/tmp/benchdir"),
            "ctsrd@10.0.2.15:/tmp/benchdir"
        );
    }
}

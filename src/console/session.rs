/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    console::stream::{ExpectError, ExpectMatch, PatternStream},
    error::RunError,
    pattern::Pattern,
};
use std::time::Duration;
use tracing::debug;

// Boot and shell markers printed by the target OS.
pub const STARTING_INIT: &str = "start_init: trying /sbin/init";
pub const BOOT_FAILURE: &str = "Enter full pathname of shell or RETURN for /bin/sh";
pub const SHELL_OPEN: &str = "exec /bin/sh";
pub const LOGIN_PROMPT: &str = "login:";
pub const SHELL_PROMPT: &str = "root@.+:.+# ";
pub const SH_PROMPT: &str = "# ";

// Crash markers. Any of these showing up while waiting for something else
// means the kernel is gone.
pub const PANIC: &str = "panic: trap";
pub const PANIC_KDB: &str = "KDB: enter: panic";
pub const STOPPED: &str = "Stopped at";
pub const KDB_ENTER: &str = "KDB: enter: ";
pub const DB_PROMPT: &str = "db> ";

const CMD_NOT_FOUND: &str = r"/bin/sh: [/\w\d_-]+: not found";
const MISSING_SOLIB: &str = r#"ld(-cheri)?-elf\.so\.1: Shared object ".+" not found, required by ".+""#;

/// A named console step: what success looks like, what failure looks like,
/// and how long to wait. Phases are stateless descriptors; the runtime result
/// is a [`PhaseOutcome`].
#[derive(Debug, Clone)]
pub struct Phase {
    pub label: String,
    pub success: Vec<Pattern>,
    pub failure: Vec<Pattern>,
    pub timeout: Duration,
    pub guarded: bool,
}

impl Phase {
    pub fn new(label: impl Into<String>, success: Vec<Pattern>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            success,
            failure: vec![],
            timeout,
            guarded: true,
        }
    }

    pub fn failing_on(mut self, failure: Vec<Pattern>) -> Self {
        self.failure = failure;
        self
    }

    /// Disables the implicit crash-marker failure patterns. Only used by
    /// steps that talk to the kernel debugger after a panic.
    pub fn unguarded(mut self) -> Self {
        self.guarded = false;
        self
    }
}

/// Exactly one of these per phase execution. Non-success outcomes are never
/// retried; the caller decides whether they are fatal.
#[derive(Debug)]
pub enum PhaseOutcome {
    Success(ExpectMatch),
    ExplicitFailure { matched: String },
    Timeout,
    StreamClosed,
}

impl PhaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success(_))
    }

    /// Converts a non-success outcome into the corresponding typed error.
    pub fn into_result(self, label: &str, timeout: Duration) -> Result<ExpectMatch, RunError> {
        match self {
            PhaseOutcome::Success(m) => Ok(m),
            PhaseOutcome::ExplicitFailure { matched } => Err(RunError::PhaseFailure {
                phase: label.to_string(),
                matched,
            }),
            PhaseOutcome::Timeout => Err(RunError::PhaseTimeout {
                phase: label.to_string(),
                timeout,
            }),
            PhaseOutcome::StreamClosed => Err(RunError::StreamClosed {
                phase: label.to_string(),
            }),
        }
    }
}

/// A live console bound to one booted target. At most one session exists per
/// invocation; it must be explicitly closed.
pub struct ConsoleSession {
    stream: PatternStream,
    prompt: Pattern,
    guards: Vec<Pattern>,
    not_found: Pattern,
    missing_solib: Pattern,
}

impl ConsoleSession {
    pub fn new(stream: PatternStream) -> anyhow::Result<Self> {
        Ok(Self {
            stream,
            prompt: Pattern::regex(SHELL_PROMPT)?,
            guards: vec![
                Pattern::literal(PANIC),
                Pattern::literal(STOPPED),
                Pattern::literal(PANIC_KDB),
            ],
            not_found: Pattern::regex(CMD_NOT_FOUND)?,
            missing_solib: Pattern::regex(MISSING_SOLIB)?,
        })
    }

    pub fn prompt(&self) -> Pattern {
        self.prompt.clone()
    }

    /// Runs one phase to completion. Sends nothing by itself; callers issue
    /// commands explicitly and then wait. Crash markers are appended as
    /// implicit failure patterns unless the phase already races on them.
    pub async fn run_phase(&mut self, phase: &Phase) -> PhaseOutcome {
        debug!(
            "phase '{}': waiting up to {:?} for {} pattern(s)",
            phase.label,
            phase.timeout,
            phase.success.len()
        );
        let mut patterns: Vec<Pattern> = phase.success.clone();
        let success_count = patterns.len();
        patterns.extend(phase.failure.iter().cloned());
        if phase.guarded {
            for guard in &self.guards {
                if !patterns.iter().any(|p| p.source() == guard.source()) {
                    patterns.push(guard.clone());
                }
            }
        }

        match self.stream.expect(&patterns, phase.timeout).await {
            Ok(m) if m.index < success_count => PhaseOutcome::Success(m),
            Ok(m) => PhaseOutcome::ExplicitFailure { matched: m.text },
            Err(ExpectError::Timeout(_)) => PhaseOutcome::Timeout,
            Err(ExpectError::StreamClosed) => PhaseOutcome::StreamClosed,
        }
    }

    /// Sends a shell command and resynchronizes on the prompt, recognizing
    /// "not found" and missing shared-object errors as explicit failures.
    pub async fn run_command(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<PhaseOutcome> {
        self.send_line(cmd).await?;
        let phase = Phase::new(format!("`{}`", cmd), vec![self.prompt.clone()], timeout)
            .failing_on(vec![self.not_found.clone(), self.missing_solib.clone()]);
        Ok(self.run_phase(&phase).await)
    }

    /// `run_command`, with any non-success outcome promoted to an error.
    pub async fn checked_run(&mut self, cmd: &str, timeout: Duration) -> anyhow::Result<()> {
        let outcome = self.run_command(cmd, timeout).await?;
        outcome.into_result(&format!("`{}`", cmd), timeout)?;
        Ok(())
    }

    pub async fn expect_prompt(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let phase = Phase::new("waiting for shell prompt", vec![self.prompt.clone()], timeout);
        self.run_phase(&phase).await.into_result(&phase.label, timeout)?;
        Ok(())
    }

    pub async fn send_line(&mut self, text: &str) -> anyhow::Result<()> {
        self.stream.send_line(text).await
    }

    pub async fn interact(&mut self) -> anyhow::Result<()> {
        self.stream.interact().await
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.stream.close().await
    }
}

/// Runs a phase against a bare stream (loader invocations that have no shell
/// and therefore no session).
pub async fn expect_phase(stream: &mut PatternStream, phase: &Phase) -> PhaseOutcome {
    match stream.expect(&phase.success, phase.timeout).await {
        Ok(m) => PhaseOutcome::Success(m),
        Err(ExpectError::Timeout(_)) => PhaseOutcome::Timeout,
        Err(ExpectError::StreamClosed) => PhaseOutcome::StreamClosed,
    }
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    backend::Backend,
    config::RunConfig,
    console::session::{
        ConsoleSession, Phase, BOOT_FAILURE, LOGIN_PROMPT, SHELL_OPEN, SH_PROMPT, STARTING_INIT,
    },
    pattern::Pattern,
};
use anyhow::Context;
use colored::Colorize;
use std::{fmt, time::Duration};
use tracing::debug;

/// One planned bring-up operation. The plan is computed up front so that
/// `skip_*` flags provably elide the right steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStep {
    LoadBitstream,
    LoadKernel,
    ConfigureTrace,
    Boot,
    AttachConsole,
    WaitInit,
    Login,
    ProvisionSshKeys,
    ProvisionUser,
}

/// Progress through the bring-up sequence, strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Start,
    BitstreamLoaded,
    KernelLoaded,
    TraceConfigured,
    BootTriggered,
    InitStarted,
    LoginPromptSeen,
    ShellReady,
    SshKeysProvisioned,
    UserProvisioned,
    Done,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootState::Start => "start",
            BootState::BitstreamLoaded => "bitstream loaded",
            BootState::KernelLoaded => "kernel loaded",
            BootState::TraceConfigured => "trace configured",
            BootState::BootTriggered => "boot triggered",
            BootState::InitStarted => "init started",
            BootState::LoginPromptSeen => "login prompt seen",
            BootState::ShellReady => "shell ready",
            BootState::SshKeysProvisioned => "ssh keys provisioned",
            BootState::UserProvisioned => "user provisioned",
            BootState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Orchestrates bitstream load, kernel load, boot, login and provisioning,
/// delegating all I/O to the backend and the console session.
pub struct BringupSequencer<'a> {
    backend: &'a dyn Backend,
    config: &'a RunConfig,
    state: BootState,
}

impl<'a> BringupSequencer<'a> {
    pub fn new(backend: &'a dyn Backend, config: &'a RunConfig) -> Self {
        Self {
            backend,
            config,
            state: BootState::Start,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Computes the ordered step list for this configuration.
    pub fn plan(config: &RunConfig, bitfile_only: bool) -> Vec<BootStep> {
        if bitfile_only {
            return vec![BootStep::LoadBitstream];
        }
        if config.skip_boot {
            // attach to whatever is already running; no load operations
            return vec![BootStep::AttachConsole];
        }
        let mut steps = vec![];
        if !config.skip_bitfile {
            steps.push(BootStep::LoadBitstream);
        }
        steps.extend([
            BootStep::LoadKernel,
            BootStep::ConfigureTrace,
            BootStep::Boot,
            BootStep::WaitInit,
            BootStep::Login,
        ]);
        if config.ssh_pubkey().is_file() {
            steps.push(BootStep::ProvisionSshKeys);
        }
        steps.push(BootStep::ProvisionUser);
        steps
    }

    fn advance(&mut self, state: BootState) {
        debug!("bring-up: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Runs the plan. Returns the live console, or `None` for a plan that
    /// stops before booting (bitfile-only).
    pub async fn run(&mut self, bitfile_only: bool) -> anyhow::Result<Option<ConsoleSession>> {
        let start = chrono::Utc::now();
        let mut console: Option<ConsoleSession> = None;

        for step in Self::plan(self.config, bitfile_only) {
            match step {
                BootStep::LoadBitstream => {
                    println!("> {}", "loading bitfile".yellow());
                    self.backend.load_bitstream().await?;
                    self.advance(BootState::BitstreamLoaded);
                }
                BootStep::LoadKernel => {
                    println!("> {}", "loading kernel image".yellow());
                    self.backend.load_kernel().await?;
                    self.advance(BootState::KernelLoaded);
                }
                BootStep::ConfigureTrace => {
                    self.backend.configure_trace().await?;
                    self.advance(BootState::TraceConfigured);
                }
                BootStep::Boot => {
                    println!("> {}", "booting".yellow());
                    console = Some(self.backend.boot().await?);
                    self.advance(BootState::BootTriggered);
                }
                BootStep::AttachConsole => {
                    println!("> {}", "attaching to console".yellow());
                    console = Some(self.backend.attach_console().await?);
                    self.advance(BootState::ShellReady);
                }
                BootStep::WaitInit => {
                    let console = console.as_mut().context("no console before init wait")?;
                    self.wait_init(console).await?;
                    let startup = chrono::Utc::now() - start;
                    println!(
                        "{}",
                        format!("init running (kernel startup took {}s)", startup.num_seconds())
                            .green()
                    );
                }
                BootStep::Login => {
                    let console = console.as_mut().context("no console before login")?;
                    self.login(console).await?;
                }
                BootStep::ProvisionSshKeys => {
                    let console = console.as_mut().context("no console before provisioning")?;
                    self.provision_ssh_keys(console).await?;
                }
                BootStep::ProvisionUser => {
                    let console = console.as_mut().context("no console before provisioning")?;
                    provision_user(console, &self.config.user, self.config.timeouts.command())
                        .await?;
                    self.advance(BootState::UserProvisioned);
                }
            }
        }

        self.advance(BootState::Done);
        Ok(console)
    }

    /// Waits for the kernel to hand over to init. A missing banner means the
    /// kernel never started; the single-user fallback prompt means the boot
    /// scripts failed. Both are fatal.
    async fn wait_init(&mut self, console: &mut ConsoleSession) -> anyhow::Result<()> {
        let phase = Phase::new(
            "waiting for init",
            vec![Pattern::literal(STARTING_INIT)],
            self.config.timeouts.init(),
        )
        .failing_on(vec![Pattern::literal(BOOT_FAILURE)]);
        console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        self.advance(BootState::InitStarted);
        Ok(())
    }

    async fn login(&mut self, console: &mut ConsoleSession) -> anyhow::Result<()> {
        let phase = Phase::new(
            "waiting for login prompt",
            vec![
                Pattern::literal(LOGIN_PROMPT),
                Pattern::literal(SHELL_OPEN),
            ],
            self.config.timeouts.login(),
        )
        .failing_on(vec![Pattern::literal(BOOT_FAILURE)]);
        let m = console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        self.advance(BootState::LoginPromptSeen);

        if m.index == 0 {
            self.login_as_root(console).await?;
        } else {
            // MFS image that drops straight into a shell from /etc/rc
            let phase = Phase::new(
                "waiting for rc shell",
                vec![Pattern::literal(SH_PROMPT)],
                Duration::from_secs(30),
            );
            console
                .run_phase(&phase)
                .await
                .into_result(&phase.label, phase.timeout)?;
            set_posix_sh_prompt(console, self.config.timeouts.shell()).await?;
        }

        self.advance(BootState::ShellReady);
        Ok(())
    }

    /// Sends the login name and normalizes onto a POSIX sh prompt so every
    /// later phase can resynchronize against a single prompt pattern.
    async fn login_as_root(&mut self, console: &mut ConsoleSession) -> anyhow::Result<()> {
        println!("{}", "got login prompt".green());
        console.send_line("root").await?;

        let prompts = vec![console.prompt(), Pattern::literal(SH_PROMPT)];
        let phase = Phase::new(
            "waiting for command prompt",
            prompts.clone(),
            self.config.timeouts.shell(),
        );
        let m = console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;

        if m.index == 0 {
            // csh is weird; switch to the plain POSIX sh
            println!("{}", "got csh command prompt, starting POSIX sh".green());
            console.send_line("sh").await?;
            let phase = Phase::new(
                "starting /bin/sh",
                prompts,
                self.config.timeouts.shell(),
            );
            let m = console
                .run_phase(&phase)
                .await
                .into_result(&phase.label, phase.timeout)?;
            if m.index == 1 {
                set_posix_sh_prompt(console, self.config.timeouts.shell()).await?;
            }
        } else {
            set_posix_sh_prompt(console, self.config.timeouts.shell()).await?;
        }
        Ok(())
    }

    /// Appends the local public key to the target's authorized_keys over the
    /// live console. The console is the provisioning channel: at this point
    /// the network is not configured yet.
    async fn provision_ssh_keys(&mut self, console: &mut ConsoleSession) -> anyhow::Result<()> {
        println!("> {}", "setting up ssh keys".yellow());
        let t = self.config.timeouts.command();
        let pubkey_path = self.config.ssh_pubkey();
        let pubkey = std::fs::read_to_string(&pubkey_path)
            .context(format!("failed to read {}", pubkey_path.display()))?;
        let pubkey = pubkey.trim();

        console.checked_run("mkdir -p /root/.ssh", t).await?;
        // the key may be longer than the console line discipline tolerates;
        // send it in bounded chunks
        for part in chunk_str(pubkey, 150) {
            let quoted = shlex::try_quote(&part)
                .map_err(|e| anyhow::anyhow!("cannot quote public key chunk: {}", e))?;
            console
                .checked_run(
                    &format!("printf %s {} >> /root/.ssh/authorized_keys", quoted),
                    t,
                )
                .await?;
        }
        console
            .checked_run("printf '\\n' >> /root/.ssh/authorized_keys", t)
            .await?;
        console
            .checked_run("chmod 600 /root/.ssh/authorized_keys", t)
            .await?;
        console.checked_run("chmod 700 /root /root/.ssh/", t).await?;
        console
            .checked_run(
                "echo 'PermitRootLogin without-password' >> /etc/ssh/sshd_config",
                t,
            )
            .await?;

        // verify the key actually landed
        console.send_line("cat /root/.ssh/authorized_keys").await?;
        let phase = Phase::new("verifying authorized_keys", vec![Pattern::literal("ssh-")], t);
        console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        console.expect_prompt(t).await?;

        console.send_line("service sshd restart").await?;
        let phase = Phase::new(
            "restarting sshd",
            vec![
                Pattern::literal("service: not found"),
                Pattern::literal("Starting sshd."),
                Pattern::literal("Cannot 'restart' sshd."),
            ],
            Duration::from_secs(120),
        );
        console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        console.expect_prompt(t).await?;
        // sshd rejects connections for a moment after restarting
        tokio::time::sleep(Duration::from_secs(2)).await;

        // mirror the keys into the benchmark user's account, if it has one
        console
            .checked_run(
                &format!(
                    "test -e /home/{user}/.ssh/authorized_keys && \
                     cat /root/.ssh/authorized_keys >> /home/{user}/.ssh/authorized_keys",
                    user = self.config.user
                ),
                t,
            )
            .await?;

        println!("{}", "ssh authorized_keys set up".green());
        self.advance(BootState::SshKeysProvisioned);
        Ok(())
    }
}

/// The guarded user-creation command. The existence check makes repeated
/// invocations against a persistent disk image safe.
pub fn user_provision_command(user: &str) -> String {
    format!(
        "if ! pw user show {user} -q > /dev/null; then \
         pw useradd -n {user} {user}-test-user -s /bin/sh -m -w none && \
         mkdir -p /home/{user} && cp -a /root/.ssh /home/{user}/.ssh && \
         chown -R {user} /home/{user}/.ssh && echo \"Created user {user}\"; fi",
        user = user
    )
}

/// Creates the benchmark user unless it already exists.
pub async fn provision_user(
    console: &mut ConsoleSession,
    user: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    console
        .checked_run(&user_provision_command(user), timeout)
        .await
}

/// Sets PS1 to a prompt the session's prompt pattern matches.
async fn set_posix_sh_prompt(
    console: &mut ConsoleSession,
    timeout: Duration,
) -> anyhow::Result<()> {
    debug!("setting PS1");
    console
        .send_line("export PS1=\"root@beri:~ \\$ \"")
        .await?;
    let phase = Phase::new("setting command prompt", vec![console.prompt()], timeout);
    console
        .run_phase(&phase)
        .await
        .into_result(&phase.label, phase.timeout)?;
    Ok(())
}

fn chunk_str(s: &str, size: usize) -> Vec<String> {
    s.as_bytes()
        .chunks(size)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    #[test]
    fn skip_boot_attaches_without_load_operations() {
        let config = RunConfig {
            skip_boot: true,
            ..RunConfig::default()
        };
        assert_eq!(
            BringupSequencer::plan(&config, false),
            vec![BootStep::AttachConsole]
        );
    }

    #[test]
    fn skip_bitfile_elides_only_the_bitstream() {
        let config = RunConfig {
            skip_bitfile: true,
            ssh_key: std::path::PathBuf::from("/nonexistent/id_rsa"),
            ..RunConfig::default()
        };
        let plan = BringupSequencer::plan(&config, false);
        assert!(!plan.contains(&BootStep::LoadBitstream));
        assert_eq!(plan.first(), Some(&BootStep::LoadKernel));
        assert_eq!(plan.last(), Some(&BootStep::ProvisionUser));
    }

    #[test]
    fn bitfile_only_plan_stops_after_the_bitstream() {
        let config = RunConfig::default();
        assert_eq!(
            BringupSequencer::plan(&config, true),
            vec![BootStep::LoadBitstream]
        );
    }

    #[test]
    fn ssh_provisioning_requires_a_local_pubkey() {
        let config = RunConfig {
            ssh_key: std::path::PathBuf::from("/nonexistent/id_rsa"),
            ..RunConfig::default()
        };
        let plan = BringupSequencer::plan(&config, false);
        assert!(!plan.contains(&BootStep::ProvisionSshKeys));
    }

    #[test]
    fn user_creation_is_guarded_by_an_existence_check() {
        let cmd = user_provision_command("ctsrd");
        assert!(cmd.starts_with("if ! pw user show ctsrd -q"));
        assert_eq!(cmd.matches("pw useradd").count(), 1);
    }

    #[test]
    fn key_chunks_cover_the_whole_key() {
        let key = "x".repeat(380);
        let chunks = chunk_str(&key, 150);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), key);
    }
}

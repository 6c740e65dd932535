/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    backend::Backend,
    config::{BackendKind, RunConfig},
    console::{
        session::{expect_phase, ConsoleSession, Phase},
        stream::{render_command, PatternStream},
        Transcript,
    },
    pattern::Pattern,
};
use async_trait::async_trait;
use std::{path::Path, sync::Arc, time::Duration};
use tracing::debug;

const UART_BANNER: &str = "Connecting to BERI UART";
const PROGRAMMER_OK: &str = "Programmer was successful. 0 errors";
const LOADBIN_OK: &str = "100% of";
const TRACE_MASK: &str = "Trace Mask";
const STREAMTRACE_OK: &str = "Leaving processor paused";

// Loader processes exit shortly after printing their success marker.
const LOADER_EXIT: Duration = Duration::from_secs(60);
const BOOT_TRIGGER: Duration = Duration::from_secs(120);

/// Drives the control utility over a numbered cable.
pub struct FpgaBackend {
    config: Arc<RunConfig>,
    transcript: Transcript,
}

impl FpgaBackend {
    pub fn new(config: Arc<RunConfig>, transcript: Transcript) -> Self {
        Self { config, transcript }
    }

    fn berictl_args(&self, subcmd: &str) -> Vec<String> {
        vec![
            "-c".to_string(),
            self.config.cable_id.clone(),
            "-j".to_string(),
            subcmd.to_string(),
        ]
    }

    fn spawn_berictl(&self, args: &[String]) -> anyhow::Result<PatternStream> {
        debug!(
            "{}",
            render_command(&self.config.berictl, args)
        );
        PatternStream::spawn(&self.config.berictl, args, self.transcript.clone())
    }

    /// Runs one loader invocation: wait for its success marker, then for the
    /// process to exit.
    async fn run_loader(
        &self,
        args: Vec<String>,
        label: &str,
        success: Pattern,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let mut stream = self.spawn_berictl(&args)?;
        let phase = Phase::new(label, vec![success], timeout);
        expect_phase(&mut stream, &phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        stream
            .wait_exit(LOADER_EXIT)
            .await
            .map_err(|e| anyhow::anyhow!("{} did not exit cleanly: {}", label, e))?;
        Ok(())
    }
}

fn push_compressed_flag(args: &mut Vec<String>, path: &Path) {
    if path.extension().and_then(|e| e.to_str()) == Some("bz2") {
        args.push("-z".to_string());
    }
}

#[async_trait]
impl Backend for FpgaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fpga
    }

    async fn load_bitstream(&self) -> anyhow::Result<()> {
        let mut args = self.berictl_args("loadsof");
        push_compressed_flag(&mut args, &self.config.bitfile);
        args.push(self.config.bitfile.display().to_string());
        self.run_loader(
            args,
            "loading bitfile",
            Pattern::literal(PROGRAMMER_OK),
            self.config.timeouts.bitstream(),
        )
        .await
    }

    async fn load_kernel(&self) -> anyhow::Result<()> {
        let mut args = self.berictl_args("loadbin");
        push_compressed_flag(&mut args, &self.config.kernel_img);
        args.push(self.config.kernel_img.display().to_string());
        args.push(format!("{:#x}", self.config.kernel_addr));
        self.run_loader(
            args,
            "loading kernel image",
            Pattern::literal(LOADBIN_OK),
            self.config.timeouts.kernel_load(),
        )
        .await
    }

    async fn configure_trace(&self) -> anyhow::Result<()> {
        self.run_loader(
            self.berictl_args("settracefilter"),
            "setting trace filter",
            Pattern::literal(TRACE_MASK),
            self.config.timeouts.command(),
        )
        .await
    }

    async fn boot(&self) -> anyhow::Result<ConsoleSession> {
        // grab the console before triggering execution so no early boot
        // messages are lost
        let console = self.attach_console().await?;

        let args = self.berictl_args("resume");
        let mut resume = self.spawn_berictl(&args)?;
        resume
            .wait_exit(BOOT_TRIGGER)
            .await
            .map_err(|e| anyhow::anyhow!("resume did not complete: {}", e))?;

        let args = self.berictl_args("boot");
        let mut boot = self.spawn_berictl(&args)?;
        boot.wait_exit(BOOT_TRIGGER)
            .await
            .map_err(|e| anyhow::anyhow!("boot did not complete: {}", e))?;

        Ok(console)
    }

    async fn attach_console(&self) -> anyhow::Result<ConsoleSession> {
        let args = self.berictl_args("console");
        let mut stream = self.spawn_berictl(&args)?;
        let phase = Phase::new(
            "attaching to UART",
            vec![Pattern::literal(UART_BANNER)],
            self.config.timeouts.uart_attach(),
        );
        expect_phase(&mut stream, &phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        ConsoleSession::new(stream)
    }

    async fn capture_streamtrace(&self) -> anyhow::Result<()> {
        self.run_loader(
            self.berictl_args("streamtrace"),
            "capturing streamtrace",
            Pattern::literal(STREAMTRACE_OK),
            self.config.timeouts.command(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_images_get_the_z_flag() {
        let mut args = vec![];
        push_compressed_flag(&mut args, Path::new("kernel.bz2"));
        assert_eq!(args, vec!["-z".to_string()]);

        let mut args = vec![];
        push_compressed_flag(&mut args, Path::new("DE4_BERI.sof"));
        assert!(args.is_empty());
    }

    #[test]
    fn loadbin_address_is_rendered_in_hex() {
        assert_eq!(format!("{:#x}", 0x100000u64), "0x100000");
    }
}

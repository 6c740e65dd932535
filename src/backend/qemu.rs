use crate::{
    backend::Backend,
    config::{BackendKind, RunConfig},
    console::{session::ConsoleSession, stream::PatternStream, Transcript},
    host,
};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Boots the softcore's kernel under the emulator instead of real hardware.
/// Bitstream, trace and streamtrace operations have no hardware to talk to
/// and are no-ops.
pub struct QemuBackend {
    config: Arc<RunConfig>,
    transcript: Transcript,
}

impl QemuBackend {
    pub fn new(config: Arc<RunConfig>, transcript: Transcript) -> Self {
        Self { config, transcript }
    }
}

#[async_trait]
impl Backend for QemuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Qemu
    }

    async fn load_bitstream(&self) -> anyhow::Result<()> {
        debug!("no bitstream to load for the emulator");
        Ok(())
    }

    async fn load_kernel(&self) -> anyhow::Result<()> {
        debug!("kernel is passed on the emulator command line");
        Ok(())
    }

    async fn configure_trace(&self) -> anyhow::Result<()> {
        debug!("no trace filter for the emulator");
        Ok(())
    }

    async fn boot(&self) -> anyhow::Result<ConsoleSession> {
        let kernel = host::maybe_decompress(&self.config.kernel_img).await?;
        let disk = match &self.config.qemu_disk_image {
            Some(disk) => Some(host::maybe_decompress(disk).await?),
            None => None,
        };
        let qemu = self
            .config
            .qemu_binary
            .as_ref()
            .context("emulator binary was not resolved during configuration")?;

        let mut args: Vec<String> = vec![
            "-M".to_string(),
            "malta".to_string(),
            "-kernel".to_string(),
            kernel.display().to_string(),
            "-m".to_string(),
            "2048".to_string(),
            "-nographic".to_string(),
            "-net".to_string(),
            "nic".to_string(),
            "-net".to_string(),
            format!(
                "user,id=net0,ipv6=off,hostfwd=tcp::{}-:22",
                self.config.qemu_ssh_port
            ),
        ];
        if let Some(disk) = disk {
            args.push("-hda".to_string());
            args.push(disk.display().to_string());
        }

        let stream = PatternStream::spawn(
            &qemu.display().to_string(),
            &args,
            self.transcript.clone(),
        )?;
        ConsoleSession::new(stream)
    }

    async fn attach_console(&self) -> anyhow::Result<ConsoleSession> {
        Err(anyhow::anyhow!(
            "cannot attach to an existing console with the QEMU backend"
        ))
    }

    async fn capture_streamtrace(&self) -> anyhow::Result<()> {
        debug!("no streamtrace for the emulator");
        Ok(())
    }
}

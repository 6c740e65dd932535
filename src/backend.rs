pub mod fpga;
pub mod qemu;

use crate::{
    config::{BackendKind, RunConfig},
    console::{session::ConsoleSession, Transcript},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything the bring-up pipeline needs from a target, so that no caller
/// ever branches on the backend kind.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Feeds the bitstream to the FPGA. No-op for the emulator.
    async fn load_bitstream(&self) -> anyhow::Result<()>;

    /// Loads the kernel image at the configured address. No-op for the
    /// emulator (the image is passed on its command line instead).
    async fn load_kernel(&self) -> anyhow::Result<()>;

    /// Enables hardware tracing. No-op for the emulator.
    async fn configure_trace(&self) -> anyhow::Result<()>;

    /// Triggers execution and returns a console attached to the target.
    async fn boot(&self) -> anyhow::Result<ConsoleSession>;

    /// Attaches to an already-running target's console.
    async fn attach_console(&self) -> anyhow::Result<ConsoleSession>;

    /// Best-effort diagnostic trace-buffer dump. No-op for the emulator.
    async fn capture_streamtrace(&self) -> anyhow::Result<()>;
}

pub fn from_config(config: Arc<RunConfig>, transcript: Transcript) -> Box<dyn Backend> {
    match config.backend {
        BackendKind::Fpga => Box::new(fpga::FpgaBackend::new(config, transcript)),
        BackendKind::Qemu => Box::new(qemu::QemuBackend::new(config, transcript)),
    }
}

use beribench::{
    backend::{self, Backend},
    benchmark::{self, BenchmarkController, BenchmarkRunResult, SshEndpoint},
    bringup::BringupSequencer,
    clap_args::{self, Commands},
    cleanup::{self, CleanupGuard},
    config::{BackendKind, RunConfig},
    console::{session::ConsoleSession, Transcript},
    error::RunError,
    network::NetworkController,
};
use anyhow::Context;
use colored::Colorize;
use std::{sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = clap_args::parse();
    init_tracing(args.verbose);

    let config = match RunConfig::from_args(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}", format!("{}", e).red());
            std::process::exit(1);
        }
    };

    let transcript = match Transcript::new(config.log_file.as_deref(), config.verbose >= 1) {
        Ok(transcript) => transcript,
        Err(e) => {
            eprintln!("{}", format!("{}", e).red());
            std::process::exit(1);
        }
    };

    let backend = backend::from_config(config.clone(), transcript);
    let guard = Arc::new(CleanupGuard::new());

    // an interrupt must still release the cable before the process dies
    {
        let guard = guard.clone();
        let kind = config.backend;
        let cable_id = config.cable_id.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            guard.run(|| cleanup::terminate_cable_terminals(kind, &cable_id));
            std::process::exit(1);
        }) {
            tracing::warn!("failed to install interrupt handler: {}", e);
        }
    }

    let result = dispatch(&args.command, &config, backend.as_ref()).await;

    match &result {
        Ok(()) => println!("{}", "DONE".green()),
        Err(e) => {
            if is_phase_timeout(e) {
                println!("{}", "phase timed out, capturing streamtrace".yellow());
                if let Err(diag) = backend.capture_streamtrace().await {
                    // the diagnostic must never mask the original timeout
                    tracing::warn!("streamtrace capture failed: {}", diag);
                }
            }
            eprintln!("{}", format!("{:#}", e).red());
        }
    }

    guard.run(|| cleanup::terminate_cable_terminals(config.backend, &config.cable_id));
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn is_phase_timeout(e: &anyhow::Error) -> bool {
    e.downcast_ref::<RunError>()
        .map(RunError::is_timeout)
        .unwrap_or(false)
}

async fn dispatch(
    command: &Commands,
    config: &Arc<RunConfig>,
    backend: &dyn Backend,
) -> anyhow::Result<()> {
    match command {
        Commands::LoadBitfile => cmd_load_bitfile(config, backend).await,
        Commands::Bootonly { .. } => cmd_bootonly(config, backend).await,
        Commands::Runbench { .. } => cmd_runbench(config, backend).await,
        Commands::Console => cmd_console(backend).await,
    }
}

async fn cmd_load_bitfile(config: &RunConfig, backend: &dyn Backend) -> anyhow::Result<()> {
    let mut sequencer = BringupSequencer::new(backend, config);
    sequencer.run(true).await?;
    Ok(())
}

async fn cmd_bootonly(config: &RunConfig, backend: &dyn Backend) -> anyhow::Result<()> {
    let mut sequencer = BringupSequencer::new(backend, config);
    let console = sequencer
        .run(false)
        .await?
        .context("bring-up finished without a live console")?;
    finish_session(console, config.interact).await
}

async fn cmd_console(backend: &dyn Backend) -> anyhow::Result<()> {
    let console = backend.attach_console().await?;
    finish_session(console, true).await
}

async fn cmd_runbench(config: &Arc<RunConfig>, backend: &dyn Backend) -> anyhow::Result<()> {
    let mut sequencer = BringupSequencer::new(backend, config);
    let mut console = sequencer
        .run(false)
        .await?
        .context("bring-up finished without a live console")?;

    if config.skip_boot {
        // the interface state after a previous run is unknown; cycle it
        let mut net = NetworkController::new(&mut console, config);
        net.bring_down().await?;
        net.bring_up().await?;
    } else if config.backend == BackendKind::Fpga {
        println!("sleeping 20 seconds so the FPGA settles");
        tokio::time::sleep(Duration::from_secs(20)).await;
    }

    // figure out where scp should connect
    let ssh = if config.backend == BackendKind::Qemu {
        SshEndpoint {
            user: config.user.clone(),
            host: "localhost".to_string(),
            port: config.qemu_ssh_port,
        }
    } else {
        // the board's hostname assignment is flaky; prefer the address DHCP
        // actually handed out
        let mut net = NetworkController::new(&mut console, config);
        let host = match net.ip_address().await? {
            Some(ip) => {
                println!("inferred board address: {}", ip.green());
                ip
            }
            None => config.target_host.clone(),
        };
        SshEndpoint {
            user: config.user.clone(),
            host,
            port: 22,
        }
    };

    if !config.skip_copy {
        benchmark::transfer_in(config, &ssh).await?;
    }

    NetworkController::new(&mut console, config)
        .bring_down()
        .await?;

    let result = BenchmarkController::new(&mut console, config)
        .execute()
        .await?;

    if let BenchmarkRunResult::KernelPanic { backtrace } = &result {
        if let Some(backtrace) = backtrace {
            println!("{}", backtrace);
        }
        console.close().await?;
        return Err(RunError::PhaseFailure {
            phase: "running benchmark".to_string(),
            matched: result.to_string(),
        }
        .into());
    }

    // retrieve whatever the run produced, even on failure, so the outputs
    // are available for post-mortem analysis
    NetworkController::new(&mut console, config).bring_up().await?;
    benchmark::transfer_out(config, &ssh).await?;

    finish_session(console, config.interact).await?;

    match result {
        BenchmarkRunResult::Completed => Ok(()),
        other => Err(RunError::PhaseFailure {
            phase: "running benchmark".to_string(),
            matched: other.to_string(),
        }
        .into()),
    }
}

async fn finish_session(mut console: ConsoleSession, interact: bool) -> anyhow::Result<()> {
    if interact {
        println!(
            "{}",
            "interacting with the console, CTRL+D to exit".green()
        );
        console.interact().await?;
    }
    console.close().await
}

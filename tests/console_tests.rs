#![cfg(target_family = "unix")]

use beribench::{
    benchmark::{BenchmarkController, BenchmarkRunResult},
    bringup,
    config::{RunConfig, Timeouts},
    console::{
        session::{ConsoleSession, Phase, PhaseOutcome},
        stream::PatternStream,
        Transcript,
    },
    error::RunError,
    network::NetworkController,
    pattern::Pattern,
};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

/// Spawns `sh` running the given script as a stand-in for the board's UART.
fn fake_console(script: &str) -> anyhow::Result<ConsoleSession> {
    let stream = PatternStream::spawn(
        "sh",
        &["-c".to_string(), script.to_string()],
        Transcript::disabled(),
    )?;
    ConsoleSession::new(stream)
}

/// A read/eval loop that logs every received line, runs per-command cases,
/// and prints a shell prompt after each one, the way a logged-in console
/// would.
fn prompt_loop(cmdlog: &str, cases: &str) -> String {
    format!(
        r#"CMDLOG={cmdlog}
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$CMDLOG"
  case "$line" in
{cases}
  esac
  printf 'root@beri:~ # '
done"#,
        cmdlog = cmdlog,
        cases = cases
    )
}

fn temp_log() -> String {
    std::env::temp_dir()
        .join(format!("beribench-test-{}.log", nanoid::nanoid!(8)))
        .display()
        .to_string()
}

fn test_config() -> RunConfig {
    RunConfig {
        benchdir: PathBuf::from("/work/bench"),
        script_name: "bench.sh".to_string(),
        script_args: String::new(),
        timeouts: Timeouts {
            command_secs: 5,
            network_secs: 5,
            benchmark_secs: 5,
            ..Timeouts::default()
        },
        ..RunConfig::default()
    }
}

// ---- run_phase outcome classification ----

#[tokio::test]
async fn run_phase_reports_success() -> anyhow::Result<()> {
    let mut console = fake_console("echo boot marker seen; sleep 5")?;
    let phase = Phase::new(
        "waiting for marker",
        vec![Pattern::literal("boot marker seen")],
        Duration::from_secs(5),
    );
    let outcome = console.run_phase(&phase).await;
    assert!(matches!(outcome, PhaseOutcome::Success(_)));
    console.close().await
}

#[tokio::test]
async fn run_phase_reports_explicit_failure() -> anyhow::Result<()> {
    let mut console = fake_console("echo BOOT FAILED; sleep 5")?;
    let phase = Phase::new(
        "waiting for marker",
        vec![Pattern::literal("never printed")],
        Duration::from_secs(5),
    )
    .failing_on(vec![Pattern::literal("BOOT FAILED")]);
    let outcome = console.run_phase(&phase).await;
    assert!(matches!(outcome, PhaseOutcome::ExplicitFailure { .. }));
    console.close().await
}

#[tokio::test]
async fn run_phase_reports_timeout() -> anyhow::Result<()> {
    let mut console = fake_console("sleep 5")?;
    let phase = Phase::new(
        "waiting for marker",
        vec![Pattern::literal("never printed")],
        Duration::from_millis(300),
    );
    let outcome = console.run_phase(&phase).await;
    assert!(matches!(outcome, PhaseOutcome::Timeout));
    console.close().await
}

#[tokio::test]
async fn run_phase_reports_closed_stream() -> anyhow::Result<()> {
    let mut console = fake_console("true")?;
    let phase = Phase::new(
        "waiting for marker",
        vec![Pattern::literal("never printed")],
        Duration::from_secs(5),
    );
    let outcome = console.run_phase(&phase).await;
    assert!(matches!(outcome, PhaseOutcome::StreamClosed));
    Ok(())
}

#[tokio::test]
async fn panic_banner_short_circuits_unrelated_phases() -> anyhow::Result<()> {
    let mut console = fake_console("echo panic: trap; sleep 5")?;
    let phase = Phase::new(
        "waiting for login prompt",
        vec![Pattern::literal("login:")],
        Duration::from_secs(5),
    );
    let outcome = console.run_phase(&phase).await;
    assert!(matches!(outcome, PhaseOutcome::ExplicitFailure { .. }));
    console.close().await
}

// ---- network controller ----

#[tokio::test]
async fn network_bring_up_succeeds_when_dhcp_binds() -> anyhow::Result<()> {
    let cmdlog = temp_log();
    let cases = r#"    "/usr/sbin/devctl enable atse0")
        echo "atse0: bpf attached" ;;
    "/sbin/ifconfig atse0 up")
        printf 'root@beri:~ # '
        echo "atse0: link state changed to UP"
        continue ;;
    "/sbin/dhclient atse0")
        echo "bound to 10.0.2.15 -- renewal in 42." ;;"#;
    let mut console = fake_console(&prompt_loop(&cmdlog, cases))?;
    let config = test_config();

    NetworkController::new(&mut console, &config)
        .bring_up()
        .await?;

    console.close().await?;
    let _ = std::fs::remove_file(&cmdlog);
    Ok(())
}

#[tokio::test]
async fn network_bring_up_times_out_without_a_lease() -> anyhow::Result<()> {
    let cmdlog = temp_log();
    let cases = r#"    "/usr/sbin/devctl enable atse0")
        echo "atse0: bpf attached" ;;
    "/sbin/ifconfig atse0 up")
        printf 'root@beri:~ # '
        echo "atse0: link state changed to UP"
        continue ;;"#;
    let mut console = fake_console(&prompt_loop(&cmdlog, cases))?;
    let mut config = test_config();
    config.timeouts.network_secs = 1;

    let start = Instant::now();
    let err = NetworkController::new(&mut console, &config)
        .bring_up()
        .await
        .expect_err("no lease should time out");
    let elapsed = start.elapsed();

    match err.downcast_ref::<RunError>() {
        Some(RunError::PhaseTimeout { phase, .. }) => {
            assert!(phase.contains("DHCP"), "unexpected phase: {}", phase)
        }
        other => panic!("expected a phase timeout, got {:?}", other),
    }
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(3),
        "timeout fired after {:?}",
        elapsed
    );

    console.close().await?;
    let _ = std::fs::remove_file(&cmdlog);
    Ok(())
}

#[tokio::test]
async fn ip_address_is_extracted_from_ifconfig() -> anyhow::Result<()> {
    let cmdlog = temp_log();
    let cases = r#"    "ifconfig atse0")
        echo "atse0: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500"
        echo "	inet 10.0.2.15 netmask 0xffffff00 broadcast 10.0.2.255" ;;"#;
    let mut console = fake_console(&prompt_loop(&cmdlog, cases))?;
    let config = test_config();

    let ip = NetworkController::new(&mut console, &config)
        .ip_address()
        .await?;
    assert_eq!(ip.as_deref(), Some("10.0.2.15"));

    console.close().await?;
    let _ = std::fs::remove_file(&cmdlog);
    Ok(())
}

#[tokio::test]
async fn missing_interface_is_a_typed_failure() -> anyhow::Result<()> {
    let cmdlog = temp_log();
    let cases = r#"    "ifconfig atse0")
        echo "interface atse0 does not exist" ;;"#;
    let mut console = fake_console(&prompt_loop(&cmdlog, cases))?;
    let config = test_config();

    let err = NetworkController::new(&mut console, &config)
        .ip_address()
        .await
        .expect_err("missing interface should fail");
    match err.downcast_ref::<RunError>() {
        Some(RunError::NoSuchInterface(iface)) => assert_eq!(iface, "atse0"),
        other => panic!("expected NoSuchInterface, got {:?}", other),
    }

    console.close().await?;
    let _ = std::fs::remove_file(&cmdlog);
    Ok(())
}

// ---- benchmark termination classification ----

async fn run_benchmark_against(response: &str) -> anyhow::Result<(BenchmarkRunResult, String)> {
    let cmdlog = temp_log();
    let cases = format!(
        r#"    "./bench.sh"*)
{response} ;;
    "bt")
        echo "Tracing pid 1 tid 100 td 0xc000000"
        echo "db> " ;;"#,
        response = response
    );
    let mut console = fake_console(&prompt_loop(&cmdlog, &cases))?;
    let config = test_config();

    let result = BenchmarkController::new(&mut console, &config)
        .execute()
        .await?;
    console.close().await?;

    let log = std::fs::read_to_string(&cmdlog).unwrap_or_default();
    let _ = std::fs::remove_file(&cmdlog);
    Ok((result, log))
}

#[tokio::test]
async fn benchmark_success_banner_completes() -> anyhow::Result<()> {
    let (result, log) = run_benchmark_against(r#"        echo "DONE RUNNING BENCHMARKS""#).await?;
    assert_eq!(result, BenchmarkRunResult::Completed);
    // the composite command carries the sentinel
    assert!(log.contains("./bench.sh  || /this/command/does/not/exist"));
    Ok(())
}

#[tokio::test]
async fn benchmark_missing_script_is_command_not_found() -> anyhow::Result<()> {
    let (result, _) =
        run_benchmark_against(r#"        echo "./bench.sh: Command not found.""#).await?;
    assert_eq!(result, BenchmarkRunResult::CommandNotFound);
    Ok(())
}

#[tokio::test]
async fn benchmark_script_failure_hits_the_sentinel() -> anyhow::Result<()> {
    let (result, _) =
        run_benchmark_against(r#"        echo "/this/command/does/not/exist: not found""#).await?;
    assert!(matches!(
        result,
        BenchmarkRunResult::ExplicitFailure { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn benchmark_failure_string_is_explicit_failure() -> anyhow::Result<()> {
    let (result, _) =
        run_benchmark_against(r#"        echo "FAILED RUNNING BENCHMARKS""#).await?;
    match result {
        BenchmarkRunResult::ExplicitFailure { matched } => {
            assert_eq!(matched, "FAILED RUNNING BENCHMARKS")
        }
        other => panic!("expected an explicit failure, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn kernel_panic_sends_exactly_one_bt() -> anyhow::Result<()> {
    let (result, log) = run_benchmark_against(
        r#"        echo "KDB: enter: sysctl debug.kdb.enter"
        echo "db> ""#,
    )
    .await?;
    match result {
        BenchmarkRunResult::KernelPanic { backtrace } => {
            let backtrace = backtrace.expect("backtrace should be captured");
            assert!(backtrace.contains("Tracing pid 1"));
        }
        other => panic!("expected a kernel panic, got {:?}", other),
    }
    let bt_requests = log.lines().filter(|l| *l == "bt").count();
    assert_eq!(bt_requests, 1);
    Ok(())
}

// ---- user provisioning ----

#[tokio::test]
async fn user_provisioning_is_idempotent() -> anyhow::Result<()> {
    let cmdlog = temp_log();
    let script = format!(
        r#"CMDLOG={cmdlog}
USER_EXISTS=0
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$CMDLOG"
  case "$line" in
    "if ! pw user show"*)
        if [ "$USER_EXISTS" = "0" ]; then
            USER_EXISTS=1
            echo "useradd" >> "$CMDLOG"
            echo "Created user ctsrd"
        fi ;;
  esac
  printf 'root@beri:~ # '
done"#,
        cmdlog = cmdlog
    );
    let mut console = fake_console(&script)?;

    bringup::provision_user(&mut console, "ctsrd", Duration::from_secs(5)).await?;
    bringup::provision_user(&mut console, "ctsrd", Duration::from_secs(5)).await?;

    console.close().await?;
    let log = std::fs::read_to_string(&cmdlog)?;
    let created = log.lines().filter(|l| *l == "useradd").count();
    assert_eq!(created, 1, "second provisioning must not create the user");
    let _ = std::fs::remove_file(&cmdlog);
    Ok(())
}

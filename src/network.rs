use crate::{
    config::{BackendKind, RunConfig},
    console::session::{ConsoleSession, Phase, PhaseOutcome},
    error::RunError,
    pattern::Pattern,
};
use colored::Colorize;
use std::time::Duration;
use tracing::warn;

const DHCP_BOUND: &str = r"bound to .* -- renewal in .*\.";
const IP_ADDRESS: &str = r"inet (.+) netmask ";

const LINK_BANNER_TIMEOUT: Duration = Duration::from_secs(60);
const IP_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Brings the board's network interface up and down over the console and
/// extracts its DHCP-assigned address.
pub struct NetworkController<'a> {
    console: &'a mut ConsoleSession,
    config: &'a RunConfig,
}

impl<'a> NetworkController<'a> {
    pub fn new(console: &'a mut ConsoleSession, config: &'a RunConfig) -> Self {
        Self { console, config }
    }

    /// Enables the device, waits for the link to come up, and blocks until
    /// DHCP reports a bound lease. DHCP acquisition time is environment
    /// dependent, so the lease wait runs under the configurable network
    /// timeout.
    pub async fn bring_up(&mut self) -> anyhow::Result<()> {
        println!("> {}", "turn network on".yellow());
        let t = self.config.timeouts.command();
        let iface = self.config.network_interface.clone();

        if self.config.backend == BackendKind::Fpga {
            self.console
                .send_line(&format!("/usr/sbin/devctl enable {}", iface))
                .await?;
            let phase = Phase::new(
                format!("enabling {}", iface),
                vec![Pattern::literal(format!("{}: bpf attached", iface))],
                t,
            );
            self.console
                .run_phase(&phase)
                .await
                .into_result(&phase.label, phase.timeout)?;
            self.console.expect_prompt(t).await?;
        }

        self.console
            .checked_run(&format!("/sbin/ifconfig {} up", iface), t)
            .await?;
        if self.config.link_state_banner {
            let phase = Phase::new(
                format!("waiting for {} link", iface),
                vec![Pattern::literal(format!(
                    "{}: link state changed to UP",
                    iface
                ))],
                LINK_BANNER_TIMEOUT,
            );
            self.console
                .run_phase(&phase)
                .await
                .into_result(&phase.label, phase.timeout)?;
        }
        // resynchronize before starting dhclient
        self.console.send_line("").await?;
        self.console.expect_prompt(t).await?;

        self.console
            .send_line(&format!("/sbin/dhclient {}", iface))
            .await?;
        let phase = Phase::new(
            "waiting for DHCP lease",
            vec![Pattern::regex(DHCP_BOUND)?],
            self.config.timeouts.network(),
        );
        self.console
            .run_phase(&phase)
            .await
            .into_result(&phase.label, phase.timeout)?;
        self.console.expect_prompt(t).await?;
        Ok(())
    }

    /// Takes the interface down. Detaching an already-detached device is
    /// fine: both the detach banner and "Device not configured" count as
    /// success.
    pub async fn bring_down(&mut self) -> anyhow::Result<()> {
        println!("> {}", "turn network off".yellow());
        let t = self.config.timeouts.command();
        let iface = self.config.network_interface.clone();

        self.console
            .checked_run(&format!("/sbin/ifconfig {} down", iface), t)
            .await?;
        if self.config.backend == BackendKind::Fpga {
            self.console
                .send_line(&format!("/usr/sbin/devctl disable {}", iface))
                .await?;
            let phase = Phase::new(
                format!("disabling {}", iface),
                vec![
                    Pattern::literal(format!("{}: detached", iface)),
                    Pattern::literal(format!(
                        "Failed to disable {}: Device not configured",
                        iface
                    )),
                ],
                t,
            );
            self.console
                .run_phase(&phase)
                .await
                .into_result(&phase.label, phase.timeout)?;
            // consume the prompt the disable command leaves behind
            let _ = self.console.expect_prompt(IP_QUERY_TIMEOUT).await;
        }
        Ok(())
    }

    /// Asks `ifconfig` for the interface's IPv4 address. Returns `None` when
    /// no address shows up in time (the caller falls back to the configured
    /// host name); a missing interface is a typed error, not a timeout.
    pub async fn ip_address(&mut self) -> anyhow::Result<Option<String>> {
        let iface = self.config.network_interface.clone();
        self.console
            .send_line(&format!("ifconfig {}", iface))
            .await?;
        let phase = Phase::new(
            format!("querying {} address", iface),
            vec![Pattern::regex(IP_ADDRESS)?],
            IP_QUERY_TIMEOUT,
        )
        .failing_on(vec![Pattern::literal(format!(
            "interface {} does not exist",
            iface
        ))]);

        match self.console.run_phase(&phase).await {
            PhaseOutcome::Success(m) => {
                let ip = m
                    .capture
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
                let _ = self.console.expect_prompt(IP_QUERY_TIMEOUT).await;
                Ok(ip)
            }
            PhaseOutcome::ExplicitFailure { matched }
                if matched.contains("does not exist") =>
            {
                Err(RunError::NoSuchInterface(iface).into())
            }
            PhaseOutcome::Timeout => {
                warn!("no address found for {} within {:?}", iface, phase.timeout);
                Ok(None)
            }
            outcome => {
                outcome.into_result(&phase.label, phase.timeout)?;
                Ok(None)
            }
        }
    }
}

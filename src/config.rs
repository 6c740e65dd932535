use crate::{
    clap_args::{Args, Commands},
    error::RunError,
};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Which kind of target this invocation drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Fpga,
    Qemu,
}

/// Dynamic symbol binding mode for the benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    /// `LD_BIND_NOW`: resolve everything at program load.
    Eager,
    /// Resolve on first use.
    Lazy,
}

/// CPU flavour of the softcore, used to infer the matching emulator binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CpuKind {
    Mips,
    Cheri128,
    Cheri256,
}

impl CpuKind {
    pub fn qemu_suffix(&self) -> &'static str {
        match self {
            CpuKind::Mips => "cheri256",
            CpuKind::Cheri128 => "cheri128",
            CpuKind::Cheri256 => "cheri256",
        }
    }
}

/// Phase timeout table, in seconds. Overridable from the TOML config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub bitstream_secs: u64,
    pub kernel_load_secs: u64,
    pub uart_attach_secs: u64,
    pub init_secs: u64,
    pub login_secs: u64,
    pub shell_secs: u64,
    pub command_secs: u64,
    pub network_secs: u64,
    pub benchmark_secs: u64,
    pub copy_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            bitstream_secs: 160,
            kernel_load_secs: 3000,
            uart_attach_secs: 30,
            init_secs: 300,
            login_secs: 900,
            shell_secs: 180,
            command_secs: 60,
            network_secs: 300,
            benchmark_secs: 10000,
            copy_secs: 2400,
        }
    }
}

impl Timeouts {
    pub fn bitstream(&self) -> Duration {
        Duration::from_secs(self.bitstream_secs)
    }
    pub fn kernel_load(&self) -> Duration {
        Duration::from_secs(self.kernel_load_secs)
    }
    pub fn uart_attach(&self) -> Duration {
        Duration::from_secs(self.uart_attach_secs)
    }
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init_secs)
    }
    pub fn login(&self) -> Duration {
        Duration::from_secs(self.login_secs)
    }
    pub fn shell(&self) -> Duration {
        Duration::from_secs(self.shell_secs)
    }
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }
    pub fn network(&self) -> Duration {
        Duration::from_secs(self.network_secs)
    }
    pub fn benchmark(&self) -> Duration {
        Duration::from_secs(self.benchmark_secs)
    }
    pub fn copy(&self) -> Duration {
        Duration::from_secs(self.copy_secs)
    }
}

/// Optional on-disk configuration: the timeout table and per-interface
/// capabilities. CLI flags always win over this file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub timeouts: Timeouts,
    pub interface: Option<InterfaceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceConfig {
    pub name: Option<String>,
    /// Whether the driver prints "<iface>: link state changed to UP". Some
    /// drivers never do, and waiting for the banner would always time out.
    pub link_state_banner: Option<bool>,
}

impl FileConfig {
    pub fn try_from_path(path: &Path) -> anyhow::Result<FileConfig> {
        let config_str = fs::read_to_string(path)?;
        FileConfig::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<FileConfig> {
        toml::from_str::<FileConfig>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }
}

/// Immutable configuration for one invocation. Built once from CLI input
/// (plus the optional config file), read-only thereafter.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub backend: BackendKind,
    pub berictl: String,
    pub cable_id: String,
    pub bitfile: PathBuf,
    pub kernel_img: PathBuf,
    pub kernel_addr: u64,
    pub qemu_binary: Option<PathBuf>,
    pub qemu_disk_image: Option<PathBuf>,
    pub qemu_ssh_port: u16,
    pub cpu_kind: Option<CpuKind>,
    pub ssh_key: PathBuf,
    pub user: String,
    pub target_host: String,
    pub network_interface: String,
    pub link_state_banner: bool,
    pub benchdir: PathBuf,
    pub script_name: String,
    pub script_args: String,
    pub pre_command: Option<String>,
    pub out_path: String,
    pub local_out_path: Option<PathBuf>,
    pub extra_input_files: Vec<String>,
    pub extra_output_files: Vec<String>,
    pub binding: BindingMode,
    pub failure_string: String,
    pub skip_boot: bool,
    pub skip_copy: bool,
    pub skip_bitfile: bool,
    pub interact: bool,
    pub timeouts: Timeouts,
    pub verbose: u8,
    pub log_file: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Fpga,
            berictl: "berictl".to_string(),
            cable_id: "1".to_string(),
            bitfile: PathBuf::from("DE4_BERI.sof"),
            kernel_img: PathBuf::from("bsd.bz2"),
            kernel_addr: 0x100000,
            qemu_binary: None,
            qemu_disk_image: None,
            qemu_ssh_port: 12345,
            cpu_kind: None,
            ssh_key: default_ssh_key(),
            user: "ctsrd".to_string(),
            target_host: "de4".to_string(),
            network_interface: "atse0".to_string(),
            link_state_banner: true,
            benchdir: PathBuf::new(),
            script_name: "run_jenkins-bluehive.sh".to_string(),
            script_args: String::new(),
            pre_command: None,
            out_path: "*results*".to_string(),
            local_out_path: None,
            extra_input_files: vec![],
            extra_output_files: vec![],
            binding: BindingMode::Eager,
            failure_string: "FAILED RUNNING BENCHMARKS".to_string(),
            skip_boot: false,
            skip_copy: false,
            skip_bitfile: false,
            interact: false,
            timeouts: Timeouts::default(),
            verbose: 0,
            log_file: None,
        }
    }
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Result<RunConfig, RunError> {
        let file = match &args.config {
            Some(path) => FileConfig::try_from_path(path)
                .map_err(|e| RunError::Config(format!("{}: {}", path.display(), e)))?,
            None => FileConfig::default(),
        };

        let backend = if args.use_qemu {
            BackendKind::Qemu
        } else {
            BackendKind::Fpga
        };

        let mut config = RunConfig {
            backend,
            berictl: args.berictl.clone(),
            cable_id: args.cable_id.clone(),
            bitfile: args.bitfile.clone(),
            kernel_img: args.kernel_img.clone(),
            kernel_addr: args.kernel_addr,
            qemu_disk_image: args.qemu_disk_image.clone(),
            qemu_ssh_port: args.qemu_ssh_port,
            cpu_kind: args.cpu_kind,
            ssh_key: args.ssh_key.clone().unwrap_or_else(default_ssh_key),
            timeouts: file.timeouts,
            verbose: args.verbose,
            log_file: args.log_file.clone(),
            ..RunConfig::default()
        };

        // interface name: CLI flag, then config file, then the per-backend
        // default
        let file_iface = file.interface.as_ref().and_then(|i| i.name.clone());
        config.network_interface = args
            .network_interface
            .clone()
            .or(file_iface)
            .unwrap_or_else(|| match backend {
                BackendKind::Qemu => "le0".to_string(),
                BackendKind::Fpga => "atse0".to_string(),
            });
        let file_banner = file.interface.as_ref().and_then(|i| i.link_state_banner);
        config.link_state_banner = args
            .link_state_banner
            .or(file_banner)
            .unwrap_or(config.network_interface != "le0");

        match &args.command {
            Commands::LoadBitfile => {
                config.require_bitfile()?;
            }
            Commands::Bootonly {
                interact,
                skip_bitfile,
            } => {
                config.skip_bitfile = *skip_bitfile;
                config.interact = *interact;
                config.require_boot_artifacts()?;
            }
            Commands::Runbench {
                benchdir,
                timeout,
                script_name,
                script_args,
                pre_command,
                out_path,
                local_out_path,
                extra_output_files,
                extra_input_files,
                user,
                target,
                skip_boot,
                skip_copy,
                skip_bitfile,
                lazy_binding,
                failure_string,
                interact,
            } => {
                config.benchdir = benchdir.clone();
                config.timeouts.benchmark_secs = *timeout;
                config.script_name = script_name.clone();
                config.script_args = script_args.clone();
                config.pre_command = pre_command.clone();
                config.out_path = out_path.clone();
                config.local_out_path = local_out_path.clone();
                config.extra_output_files = extra_output_files.clone();
                config.extra_input_files = extra_input_files.clone();
                config.user = user.clone();
                config.target_host = target.clone();
                config.skip_boot = *skip_boot;
                config.skip_copy = *skip_copy;
                config.skip_bitfile = *skip_bitfile;
                config.binding = if *lazy_binding {
                    BindingMode::Lazy
                } else {
                    BindingMode::Eager
                };
                config.failure_string = failure_string.clone();
                config.interact = *interact;

                if !config.benchdir.exists() {
                    return Err(RunError::Config(format!(
                        "benchmark dir does not exist: {}",
                        config.benchdir.display()
                    )));
                }
                if config.skip_boot && config.backend == BackendKind::Qemu {
                    return Err(RunError::Config(
                        "--skip-boot is not compatible with --use-qemu".to_string(),
                    ));
                }
                if !config.skip_boot {
                    config.require_boot_artifacts()?;
                }
            }
            Commands::Console => {}
        }

        if config.backend == BackendKind::Qemu {
            config.qemu_binary = Some(resolve_qemu_binary(args)?);
        }

        Ok(config)
    }

    pub fn ssh_pubkey(&self) -> PathBuf {
        self.ssh_key.with_extension("pub")
    }

    fn require_bitfile(&self) -> Result<(), RunError> {
        if self.backend == BackendKind::Fpga && !self.bitfile.is_file() {
            return Err(RunError::Config(format!(
                "bitfile does not exist: {}",
                self.bitfile.display()
            )));
        }
        Ok(())
    }

    fn require_boot_artifacts(&self) -> Result<(), RunError> {
        if !self.skip_bitfile {
            self.require_bitfile()?;
        }
        if !self.kernel_img.is_file() {
            return Err(RunError::Config(format!(
                "kernel image does not exist: {}",
                self.kernel_img.display()
            )));
        }
        Ok(())
    }
}

fn default_ssh_key() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_rsa")
}

/// Resolves the emulator binary: an explicit path wins; otherwise the SDK
/// root env var is combined with the CPU-kind-derived binary suffix.
fn resolve_qemu_binary(args: &Args) -> Result<PathBuf, RunError> {
    if let Some(path) = &args.qemu_path {
        if !path.is_file() {
            return Err(RunError::Config(format!(
                "selected --qemu-path {} does not exist",
                path.display()
            )));
        }
        return Ok(path.clone());
    }

    let sdk = env::var_os("CHERI_SDK").ok_or_else(|| {
        RunError::Config(
            "could not infer the emulator path: set $CHERI_SDK or pass --qemu-path".to_string(),
        )
    })?;
    let mut bindir = PathBuf::from(sdk);
    if !bindir.join("clang").is_file() {
        bindir = bindir.join("bin");
    }
    if !bindir.join("clang").is_file() {
        return Err(RunError::Config(
            "neither $CHERI_SDK/clang nor $CHERI_SDK/bin/clang exist; \
             point $CHERI_SDK at the SDK or pass --qemu-path"
                .to_string(),
        ));
    }
    let cpu = args.cpu_kind.ok_or_else(|| {
        RunError::Config("could not infer the CPU for the emulator: pass --cpu-kind".to_string())
    })?;
    let candidate = bindir.join(format!("qemu-system-{}", cpu.qemu_suffix()));
    if !candidate.is_file() {
        return Err(RunError::Config(format!(
            "inferred emulator path {} does not exist: pass --qemu-path",
            candidate.display()
        )));
    }
    Ok(candidate)
}

use crate::config::CpuKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beribench", version, about = "Boot and benchmark the BERI FPGA softcore over its serial console.", long_about = None)]
pub struct Args {
    /// The control utility used to drive the FPGA
    #[arg(short = 'b', long, default_value = "berictl")]
    pub berictl: String,

    /// Cable id passed to the control utility
    #[arg(short = 'c', long, default_value = "1")]
    pub cable_id: String,

    /// FPGA bitstream to load
    #[arg(long, default_value = "DE4_BERI.sof")]
    pub bitfile: PathBuf,

    /// Kernel image to load
    #[arg(long, default_value = "bsd.bz2")]
    pub kernel_img: PathBuf,

    /// Load address for the kernel image (hex or decimal)
    #[arg(long, value_parser = parse_load_addr, default_value = "0x100000")]
    pub kernel_addr: u64,

    /// Boot with QEMU instead of the FPGA
    #[arg(long)]
    pub use_qemu: bool,

    /// Path to the emulator binary (inferred from $CHERI_SDK when omitted)
    #[arg(long)]
    pub qemu_path: Option<PathBuf>,

    /// Optional disk image for the emulator
    #[arg(long)]
    pub qemu_disk_image: Option<PathBuf>,

    /// Host port forwarded to the emulated target's ssh port
    #[arg(long, default_value_t = 12345)]
    pub qemu_ssh_port: u16,

    /// CPU flavour of the softcore/emulator
    #[arg(long, value_enum)]
    pub cpu_kind: Option<CpuKind>,

    /// Network interface on the board (default atse0 for FPGA, le0 for QEMU)
    #[arg(long)]
    pub network_interface: Option<String>,

    /// Whether the interface driver prints the link-state-changed banner
    #[arg(long)]
    pub link_state_banner: Option<bool>,

    /// SSH private key used to reach the board
    #[arg(short = 'k', long)]
    pub ssh_key: Option<PathBuf>,

    /// Optional TOML config file (timeout table, interface capabilities)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the full console transcript to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose mode (-v, -vv, ...)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the bitfile onto the FPGA
    LoadBitfile,

    /// Boot the kernel image
    Bootonly {
        /// Get an interactive session once logged in
        #[arg(short = 'i', long)]
        interact: bool,

        /// Skip feeding the bitfile to the FPGA
        #[arg(long)]
        skip_bitfile: bool,
    },

    /// Boot, copy a benchmark over, run it, and copy the results back
    Runbench {
        /// The benchmark directory to copy and run (must contain the script)
        benchdir: PathBuf,

        /// Benchmark timeout in seconds
        #[arg(long, default_value_t = 10000)]
        timeout: u64,

        /// The script to run from within the benchmark dir once copied
        #[arg(short = 's', long, default_value = "run_jenkins-bluehive.sh")]
        script_name: String,

        /// Arguments passed to the script
        #[arg(short = 'a', long, default_value = "")]
        script_args: String,

        /// Command to run before the script (e.g. exporting env variables)
        #[arg(long)]
        pre_command: Option<String>,

        /// Output path (relative to the benchmark dir) to copy back
        #[arg(short = 'o', long, default_value = "*results*")]
        out_path: String,

        /// Local directory to copy results into (defaults to $PWD)
        #[arg(long)]
        local_out_path: Option<PathBuf>,

        /// Additional files to copy off the board
        #[arg(long, num_args = 0..)]
        extra_output_files: Vec<String>,

        /// Additional files to copy to the board before running
        #[arg(long, num_args = 0..)]
        extra_input_files: Vec<String>,

        /// User name for ssh connections to the board
        #[arg(short = 'u', long, default_value = "ctsrd")]
        user: String,

        /// Host name or IP address of the board
        #[arg(short = 't', long, default_value = "de4")]
        target: String,

        /// Assume the board has booted already and attach to the console
        #[arg(long)]
        skip_boot: bool,

        /// Assume the benchmark files are already on the board
        #[arg(long)]
        skip_copy: bool,

        /// Skip feeding the bitfile to the FPGA
        #[arg(long)]
        skip_bitfile: bool,

        /// Run without LD_BIND_NOW
        #[arg(long)]
        lazy_binding: bool,

        /// Console output that marks the benchmark as failed
        #[arg(long, default_value = "FAILED RUNNING BENCHMARKS")]
        failure_string: String,

        /// Get an interactive session after the outputs are transferred
        #[arg(short = 'i', long)]
        interact: bool,
    },

    /// Attach to the live UART without loading anything
    Console,
}

fn parse_load_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid load address {:?}: {}", s, e))
}

pub fn parse() -> Args {
    Args::parse()
}

use crate::console::stream::render_command;
use anyhow::{anyhow, Context};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Runs a host-side helper command to completion, echoing the literal
/// command line first. The caller supplies a hard deadline where one makes
/// sense (scp of large benchmark trees).
pub async fn run_host_command(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let rendered = render_command(program, args);
    debug!("running host command: {}", rendered);

    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);
    let output = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| anyhow!("host command timed out after {:?}: {}", timeout, rendered))?,
        None => command.output().await,
    }
    .context(format!("failed to run host command: {}", rendered))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "host command failed ({}): {}\n{}",
            output.status,
            rendered,
            stderr.trim()
        ));
    }
    Ok(())
}

/// Secure-copies `src` to `dst` (either side may be a remote `user@host:path`
/// spec). Host-key checking is disabled on purpose: ephemeral boards and
/// emulator instances regenerate their host keys every boot.
pub async fn scp(
    src: &str,
    dst: &str,
    port: u16,
    ssh_privkey: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut args: Vec<String> = vec![];
    if port != 22 {
        args.push("-P".to_string());
        args.push(port.to_string());
    }
    args.extend(
        [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
        ]
        .map(String::from),
    );
    args.push("-i".to_string());
    args.push(ssh_privkey.display().to_string());
    args.push("-r".to_string());
    args.push(src.to_string());
    args.push(dst.to_string());
    run_host_command("scp", &args, Some(timeout)).await
}

/// Maps a compressed artifact path to (decompressed path, decompressor).
fn decompressed_path(path: &Path) -> Option<(PathBuf, &'static str)> {
    let tool = match path.extension().and_then(|e| e.to_str()) {
        Some("bz2") => "bunzip2",
        Some("xz") => "xz",
        _ => return None,
    };
    Some((path.with_extension(""), tool))
}

/// Decompresses a kernel or disk image if its suffix says it is compressed.
/// An already-extracted copy that is newer than the archive is reused.
pub async fn maybe_decompress(path: &Path) -> anyhow::Result<PathBuf> {
    let Some((target, tool)) = decompressed_path(path) else {
        return Ok(path.to_path_buf());
    };
    if is_newer(&target, path) {
        info!(
            "not extracting {}: uncompressed image {} is newer",
            path.display(),
            target.display()
        );
        return Ok(target);
    }
    info!("extracting {}", path.display());
    let args: Vec<String> = match tool {
        "xz" => ["-d", "-k", "-f"].map(String::from).to_vec(),
        _ => ["-k", "-f"].map(String::from).to_vec(),
    }
    .into_iter()
    .chain(std::iter::once(path.display().to_string()))
    .collect();
    run_host_command(tool, &args, None).await?;
    if !target.is_file() {
        return Err(anyhow!(
            "decompressing {} did not produce {}",
            path.display(),
            target.display()
        ));
    }
    Ok(target)
}

fn is_newer(path: &Path, than: &Path) -> bool {
    let (Ok(a), Ok(b)) = (std::fs::metadata(path), std::fs::metadata(than)) else {
        return false;
    };
    match (a.modified(), b.modified()) {
        (Ok(a), Ok(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_suffixes_map_to_their_tools() {
        let (target, tool) = decompressed_path(Path::new("/imgs/bsd.bz2")).expect("bz2");
        assert_eq!(target, PathBuf::from("/imgs/bsd"));
        assert_eq!(tool, "bunzip2");

        let (target, tool) = decompressed_path(Path::new("/imgs/disk.img.xz")).expect("xz");
        assert_eq!(target, PathBuf::from("/imgs/disk.img"));
        assert_eq!(tool, "xz");

        assert!(decompressed_path(Path::new("/imgs/kernel")).is_none());
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::super::*;

        #[tokio::test]
        async fn host_command_reports_failure_with_stderr() {
            let err = run_host_command(
                "sh",
                &["-c".to_string(), "echo nope >&2; exit 3".to_string()],
                None,
            )
            .await
            .expect_err("exit 3 should fail");
            let msg = format!("{}", err);
            assert!(msg.contains("nope"), "stderr missing from: {}", msg);
        }

        #[tokio::test]
        async fn host_command_times_out() {
            let err = run_host_command(
                "sh",
                &["-c".to_string(), "sleep 5".to_string()],
                Some(Duration::from_millis(200)),
            )
            .await
            .expect_err("should time out");
            assert!(format!("{}", err).contains("timed out"));
        }
    }
}

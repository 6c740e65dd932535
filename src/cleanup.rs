/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::BackendKind;
use itertools::Itertools;
use std::sync::atomic::{AtomicBool, Ordering};
use sysinfo::System;
use tracing::{info, warn};

/// Ensures the end-of-run cleanup happens exactly once per invocation,
/// whether the run succeeds, fails, or is interrupted.
pub struct CleanupGuard {
    done: AtomicBool,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Runs `action` the first time this is called; later calls do nothing.
    pub fn run(&self, action: impl FnOnce()) {
        if !self.done.swap(true, Ordering::SeqCst) {
            action();
        }
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Kills any terminal-emulator process the control utility left attached to
/// the hardware cable. A crashed or interrupted run would otherwise leave
/// the cable busy for every following run. "Nothing found" is success.
pub fn terminate_cable_terminals(kind: BackendKind, cable_id: &str) {
    if kind == BackendKind::Qemu {
        return;
    }

    let mut system = System::new();
    system.refresh_all();

    let mut killed = 0usize;
    for (pid, process) in system.processes() {
        let name = process.name().to_string_lossy();
        let cmdline = process.cmd().iter().map(|s| s.to_string_lossy()).join(" ");
        let is_terminal =
            name.contains("nios2-terminal") || cmdline.contains("nios2-terminal");
        if is_terminal && cmdline.contains(cable_id) {
            info!("killing stray nios2-terminal (pid {})", pid);
            if process.kill() {
                killed += 1;
            } else {
                warn!("failed to kill nios2-terminal (pid {})", pid);
            }
        }
    }
    if killed == 0 {
        info!("no nios2-terminal instance found, nothing to kill");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cleanup_runs_exactly_once() {
        let guard = CleanupGuard::new();
        let calls = AtomicUsize::new(0);

        // normal completion, then a fatal-error path, then an interrupt all
        // funnel through the same guard
        guard.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        guard.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        guard.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn qemu_runs_have_nothing_to_clean_up() {
        // must not touch the process table at all; just exercise the early
        // return
        terminate_cable_terminals(BackendKind::Qemu, "1");
    }
}

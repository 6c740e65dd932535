/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod session;
pub mod stream;

use anyhow::Context;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

/// Shared sink for everything the console produces. Reads are appended here
/// as they arrive so a failed run always leaves a transcript behind for
/// post-mortem diagnosis.
#[derive(Clone)]
pub struct Transcript {
    inner: Arc<Mutex<TranscriptInner>>,
}

struct TranscriptInner {
    file: Option<File>,
    echo: bool,
}

impl Transcript {
    pub fn new(path: Option<&Path>, echo: bool) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .context(format!("failed to open transcript log {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(TranscriptInner { file, echo })),
        })
    }

    /// A transcript that keeps nothing and prints nothing. Used in tests.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TranscriptInner {
                file: None,
                echo: false,
            })),
        }
    }

    /// Sets whether reads are echoed to stdout; returns the previous value.
    pub fn set_echo(&self, echo: bool) -> bool {
        match self.inner.lock() {
            Ok(mut inner) => std::mem::replace(&mut inner.echo, echo),
            Err(_) => echo,
        }
    }

    pub fn record(&self, text: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.echo {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = file.write_all(text.as_bytes()) {
                tracing::warn!("failed to append to console transcript: {}", e);
            }
        }
    }
}

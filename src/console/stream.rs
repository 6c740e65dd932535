/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    console::Transcript,
    pattern::{first_match, Pattern, PatternMatch},
};
use anyhow::Context;
use std::{process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::{timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Expected ways an `expect` can come up empty. Anything else (host-side I/O
/// failure) surfaces as a plain error from the calling operation.
#[derive(Debug, Error)]
pub enum ExpectError {
    #[error("no pattern matched within {0:?}")]
    Timeout(Duration),
    #[error("console stream closed")]
    StreamClosed,
}

/// A successful `expect`: which pattern fired and what it matched.
#[derive(Debug, Clone)]
pub struct ExpectMatch {
    /// Index into the pattern list passed to `expect`.
    pub index: usize,
    /// The matched text.
    pub text: String,
    /// First regex capture group, if any.
    pub capture: Option<String>,
    /// Everything buffered before the match, consumed along with it.
    pub before: String,
}

/// Wraps a spawned interactive process (the control utility's UART bridge, a
/// loader invocation, or a local QEMU) with buffered pattern matching.
///
/// Both stdout and stderr are drained into a single decode buffer; everything
/// read is appended to the transcript.
pub struct PatternStream {
    child: Child,
    stdin: Option<ChildStdin>,
    chunks: mpsc::UnboundedReceiver<String>,
    buffer: String,
    closed: bool,
    transcript: Transcript,
}

impl PatternStream {
    pub fn spawn(program: &str, args: &[String], transcript: Transcript) -> anyhow::Result<Self> {
        debug!("spawning console process: {}", render_command(program, args));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(format!("failed to spawn {}", program))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .context("child stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("child stderr was not captured")?;

        let (tx, chunks) = mpsc::unbounded_channel();
        drain(stdout, tx.clone(), transcript.clone());
        drain(stderr, tx, transcript.clone());

        Ok(Self {
            child,
            stdin,
            chunks,
            buffer: String::new(),
            closed: false,
            transcript,
        })
    }

    /// Blocks until one of `patterns` matches the buffered output, the
    /// timeout elapses, or the stream closes. Matched output is consumed up
    /// to the end of the match; anything after it stays buffered.
    pub async fn expect(
        &mut self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<ExpectMatch, ExpectError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((index, m)) = first_match(&self.buffer, patterns) {
                return Ok(self.consume(index, m));
            }
            if self.closed {
                return Err(ExpectError::StreamClosed);
            }
            match timeout_at(deadline, self.chunks.recv()).await {
                Ok(Some(chunk)) => self.buffer.push_str(&chunk),
                Ok(None) => self.closed = true,
                Err(_) => return Err(ExpectError::Timeout(timeout)),
            }
        }
    }

    fn consume(&mut self, index: usize, m: PatternMatch) -> ExpectMatch {
        let before = self.buffer[..m.start].to_string();
        self.buffer = self.buffer.split_off(m.end);
        ExpectMatch {
            index,
            text: m.text,
            capture: m.capture,
            before,
        }
    }

    /// Writes a line plus newline to the process's input side. No implicit
    /// wait happens here; callers resynchronize explicitly.
    pub async fn send_line(&mut self, text: &str) -> anyhow::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .context("console stdin is not available")?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Waits for the child to terminate. Loader invocations signal
    /// completion by exiting rather than by printing a final marker.
    pub async fn wait_exit(&mut self, timeout: Duration) -> Result<(), ExpectError> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(_)) => Err(ExpectError::StreamClosed),
            Err(_) => Err(ExpectError::Timeout(timeout)),
        }
    }

    /// Hands the stream over to the operator: host stdin lines are forwarded
    /// to the target and target output streams to the host terminal, until
    /// the target exits or stdin reaches EOF.
    pub async fn interact(&mut self) -> anyhow::Result<()> {
        // output is printed directly below; echoing it again would double it
        let was_echoing = self.transcript.set_echo(false);
        let token = CancellationToken::new();

        let mut child_stdin = self
            .stdin
            .take()
            .context("console stdin is not available")?;
        let forward_token = token.clone();
        let forwarder = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = forward_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if child_stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                            if child_stdin.write_all(b"\n").await.is_err() {
                                break;
                            }
                            let _ = child_stdin.flush().await;
                        }
                        _ => {
                            forward_token.cancel();
                            break;
                        }
                    },
                }
            }
            child_stdin
        });

        if !self.buffer.is_empty() {
            print!("{}", self.buffer);
            self.buffer.clear();
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                chunk = self.chunks.recv() => match chunk {
                    Some(chunk) => {
                        print!("{}", chunk);
                        use std::io::Write;
                        let _ = std::io::stdout().flush();
                    }
                    None => {
                        self.closed = true;
                        token.cancel();
                        break;
                    }
                },
            }
        }

        self.stdin = Some(forwarder.await?);
        self.transcript.set_echo(was_echoing);
        Ok(())
    }

    /// Kills the child and reaps it, releasing the OS process handle.
    pub async fn close(mut self) -> anyhow::Result<()> {
        let _ = self.child.start_kill();
        self.child.wait().await?;
        Ok(())
    }
}

fn drain<R>(reader: R, tx: mpsc::UnboundedSender<String>, transcript: Transcript)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    transcript.record(&text);
                    if tx.send(text).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

pub fn render_command(program: &str, args: &[String]) -> String {
    let parts = std::iter::once(program).chain(args.iter().map(|s| s.as_str()));
    shlex::try_join(parts).unwrap_or_else(|_| {
        std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_quotes_arguments() {
        let rendered = render_command(
            "scp",
            &["-o".to_string(), "StrictHostKeyChecking=no".to_string()],
        );
        assert_eq!(rendered, "scp -o StrictHostKeyChecking=no");

        let rendered = render_command("sh", &["-c".to_string(), "echo hi".to_string()]);
        assert_eq!(rendered, "sh -c 'echo hi'");
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::super::*;
        use crate::pattern::Pattern;

        #[tokio::test]
        async fn expect_matches_emitted_output() -> anyhow::Result<()> {
            let mut stream = PatternStream::spawn(
                "sh",
                &["-c".to_string(), "echo ready; sleep 5".to_string()],
                Transcript::disabled(),
            )?;
            let m = stream
                .expect(&[Pattern::literal("ready")], Duration::from_secs(5))
                .await
                .expect("pattern should match");
            assert_eq!(m.index, 0);
            stream.close().await?;
            Ok(())
        }

        #[tokio::test]
        async fn expect_times_out_on_silence() -> anyhow::Result<()> {
            let mut stream = PatternStream::spawn(
                "sh",
                &["-c".to_string(), "sleep 5".to_string()],
                Transcript::disabled(),
            )?;
            let err = stream
                .expect(&[Pattern::literal("never")], Duration::from_millis(300))
                .await
                .expect_err("should time out");
            assert!(matches!(err, ExpectError::Timeout(_)));
            stream.close().await?;
            Ok(())
        }

        #[tokio::test]
        async fn expect_reports_closed_stream() -> anyhow::Result<()> {
            let mut stream = PatternStream::spawn(
                "sh",
                &["-c".to_string(), "true".to_string()],
                Transcript::disabled(),
            )?;
            let err = stream
                .expect(&[Pattern::literal("never")], Duration::from_secs(5))
                .await
                .expect_err("stream should close");
            assert!(matches!(err, ExpectError::StreamClosed));
            Ok(())
        }

        #[tokio::test]
        async fn match_in_final_output_beats_eof() -> anyhow::Result<()> {
            let mut stream = PatternStream::spawn(
                "sh",
                &["-c".to_string(), "echo last words".to_string()],
                Transcript::disabled(),
            )?;
            let m = stream
                .expect(&[Pattern::literal("last words")], Duration::from_secs(5))
                .await
                .expect("output before exit should still match");
            assert_eq!(m.index, 0);
            Ok(())
        }
    }
}

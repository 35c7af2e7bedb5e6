//! Bounded execution of external tools.
//!
//! Every external command this crate runs goes through [`run_with_timeout`]:
//! stdout and stderr are captured to unlinked temp files, the child is polled
//! until it exits or its deadline passes, and a hung tool is killed rather
//! than hanging the caller. Only a bounded tail of stderr is ever reported.

use std::io::{Read, Seek};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a bounded command run. `status` is `None` when the child was
/// killed on timeout.
#[derive(Debug)]
pub struct ExecOutcome {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr_tail: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }
}

/// Run `cmd` to completion or to `timeout`, whichever comes first.
///
/// Errors are spawn/IO level only; a non-zero exit or timeout is reported in
/// the returned [`ExecOutcome`] so callers can classify it themselves.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> std::io::Result<ExecOutcome> {
    let stdout = tempfile::tempfile()?;
    let stderr = tempfile::tempfile()?;
    cmd.stdin(Stdio::null());
    cmd.stdout(stdout.try_clone()?);
    cmd.stderr(stderr.try_clone()?);

    tracing::trace!("exec: {cmd:?} (timeout {timeout:?})");
    let mut child = cmd.spawn()?;
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status.code().unwrap_or(-1)),
            None => {
                if Instant::now() >= deadline {
                    tracing::warn!("command exceeded {timeout:?}, killing: {cmd:?}");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    Ok(ExecOutcome {
        status,
        stdout: read_from_start(stdout),
        stderr_tail: last_utf8_content_from_file(stderr),
    })
}

fn read_from_start(mut f: std::fs::File) -> String {
    let mut s = String::new();
    let r = f
        .seek(std::io::SeekFrom::Start(0))
        .and_then(|_| f.read_to_string(&mut s));
    if let Err(e) = r {
        tracing::warn!("failed to read captured stdout: {e}");
    }
    s
}

/// Read at most the trailing `MAX_STDERR_BYTES` of a capture file, so
/// pathological tool output never produces a pathological error message.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

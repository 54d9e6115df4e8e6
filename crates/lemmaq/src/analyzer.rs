//! Handle to the external analyzer subprocess.
//!
//! The analyzer reads one request per line on stdin and answers with one or
//! more JSON lines on stdout; the echoed sentinel marks the end of an answer.
//! [`Analyzer`] owns the child and both pipe ends; dropping it closes stdin,
//! gives the child [`DROP_GRACE`] to exit, then kills and reaps it.

use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::config::AnalyzerCommand;
use crate::protocol::SENTINEL;

/// How long a dropped analyzer may take to exit after its stdin closes.
pub const DROP_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("failed to spawn analyzer {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("analyzer {0} pipe not available")]
    MissingPipe(&'static str),

    #[error("failed to write request to analyzer: {0}")]
    Write(#[source] io::Error),

    #[error("failed to read analyzer output: {0}")]
    Read(#[source] io::Error),
}

/// How reading one answer ended.
#[derive(Debug)]
pub enum Termination {
    /// A line carrying the sentinel was read.
    Sentinel,
    /// stdout closed before the sentinel.
    EndOfStream,
    /// Writing the request or reading the answer failed.
    Failed(AnalyzerError),
}

/// Complete lines of one answer, in order.
#[derive(Debug)]
pub struct Reply {
    pub lines: Vec<String>,
    pub termination: Termination,
}

impl Reply {
    pub fn failed(error: AnalyzerError) -> Self {
        Self {
            lines: Vec::new(),
            termination: Termination::Failed(error),
        }
    }

    /// True when the answer ended with the sentinel.
    pub fn is_complete(&self) -> bool {
        matches!(self.termination, Termination::Sentinel)
    }
}

pub struct Analyzer {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl Analyzer {
    pub fn spawn(command: &AnalyzerCommand) -> Result<Self, AnalyzerError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| AnalyzerError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AnalyzerError::MissingPipe("stdin/stdout"));
        };

        tracing::info!(
            pid = child.id(),
            program = %command.program.display(),
            args = ?command.args,
            "Analyzer started"
        );
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write one framed request and flush it.
    pub fn send(&mut self, framed: &str) -> Result<(), AnalyzerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(AnalyzerError::MissingPipe("stdin"))?;
        stdin
            .write_all(framed.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(AnalyzerError::Write)
    }

    /// Read the answer to the last request.
    pub fn receive(&mut self) -> Reply {
        read_reply(&mut self.stdout)
    }

    /// Send a request and read its answer. A failed write yields an empty reply.
    pub fn exchange(&mut self, framed: &str) -> Reply {
        match self.send(framed) {
            Ok(()) => self.receive(),
            Err(e) => Reply::failed(e),
        }
    }

    /// Exit status if the child has already exited, waiting at most `grace`
    /// for an exit that is in progress.
    pub fn exit_status_within(&mut self, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll analyzer status");
                    return None;
                }
            }
        }
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let pid = self.child.id();
        if let Some(status) = self.exit_status_within(DROP_GRACE) {
            tracing::debug!(pid, %status, "Analyzer exited");
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid, error = %e, "Failed to kill analyzer");
        }
        match self.child.wait() {
            Ok(status) => tracing::debug!(pid, %status, "Analyzer killed"),
            Err(e) => tracing::warn!(pid, error = %e, "Failed to reap analyzer"),
        }
    }
}

/// Read complete lines until one carries the sentinel or the stream ends.
///
/// An unterminated fragment at end of stream is discarded.
pub fn read_reply<R: BufRead>(reader: &mut R) -> Reply {
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                return Reply {
                    lines,
                    termination: Termination::EndOfStream,
                };
            }
            Ok(_) if buf.last() != Some(&b'\n') => {
                tracing::warn!(bytes = buf.len(), "Discarding unterminated analyzer output");
                return Reply {
                    lines,
                    termination: Termination::EndOfStream,
                };
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                let done = line.contains(SENTINEL);
                lines.push(line.to_string());
                if done {
                    return Reply {
                        lines,
                        termination: Termination::Sentinel,
                    };
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Reply {
                    lines,
                    termination: Termination::Failed(AnalyzerError::Read(e)),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sh(script: &str) -> AnalyzerCommand {
        AnalyzerCommand::new("sh").with_args(["-c", script])
    }

    #[test]
    fn reads_until_sentinel_line() {
        let mut input = Cursor::new(
            "[{\"text\":\"a\"}]\n[{\"text\":\"EndOfArticleMarker\"}]\n[{\"text\":\"next\"}]\n",
        );
        let reply = read_reply(&mut input);
        assert!(reply.is_complete());
        assert_eq!(reply.lines.len(), 2);

        // The following answer is still buffered.
        let reply = read_reply(&mut input);
        assert!(matches!(reply.termination, Termination::EndOfStream));
        assert_eq!(reply.lines, vec!["[{\"text\":\"next\"}]"]);
    }

    #[test]
    fn unterminated_fragment_is_discarded() {
        let mut input = Cursor::new("[{\"text\":\"a\"}]\n[{\"text\":\"b\"");
        let reply = read_reply(&mut input);
        assert!(matches!(reply.termination, Termination::EndOfStream));
        assert_eq!(reply.lines, vec!["[{\"text\":\"a\"}]"]);
    }

    #[test]
    fn crlf_is_trimmed() {
        let mut input = Cursor::new("[{\"text\":\"EndOfArticleMarker\"}]\r\n");
        let reply = read_reply(&mut input);
        assert!(reply.is_complete());
        assert_eq!(reply.lines, vec!["[{\"text\":\"EndOfArticleMarker\"}]"]);
    }

    #[test]
    fn exchanges_with_echoing_child() {
        let mut analyzer = Analyzer::spawn(&sh("exec cat")).unwrap();
        let reply = analyzer.exchange("hello EndOfArticleMarker\n");
        assert!(reply.is_complete());
        assert_eq!(reply.lines, vec!["hello EndOfArticleMarker"]);
        assert!(analyzer.exit_status_within(Duration::ZERO).is_none());
    }

    #[test]
    fn reports_exit_of_dead_child() {
        let mut analyzer = Analyzer::spawn(&sh("exit 3")).unwrap();
        let reply = analyzer.exchange("hello EndOfArticleMarker\n");
        assert!(!reply.is_complete());

        let status = analyzer
            .exit_status_within(Duration::from_secs(5))
            .expect("child should have exited");
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn dropping_closes_stdin_and_lets_child_finish() {
        let marker = std::env::temp_dir().join(format!(
            "lemmaq-drop-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let command = AnalyzerCommand::new("sh").with_args([
            "-c".to_string(),
            r#"while IFS= read -r line; do :; done; echo done > "$0""#.to_string(),
            marker.display().to_string(),
        ]);

        drop(Analyzer::spawn(&command).unwrap());

        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "done\n");
        std::fs::remove_file(&marker).unwrap();
    }

    #[test]
    fn stubborn_child_is_killed_on_drop() {
        let started = Instant::now();
        drop(Analyzer::spawn(&sh("trap '' TERM; while :; do sleep 1; done")).unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = Analyzer::spawn(&AnalyzerCommand::new("/nonexistent/lemmaq-analyzer"))
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, AnalyzerError::Spawn { .. }));
    }
}

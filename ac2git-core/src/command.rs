//! External command execution.
//!
//! Both version-control clients are driven as opaque subprocesses. This
//! module owns spawning, stdin piping, output capture and the optional
//! wall-clock deadline. Callers map a non-zero exit to their own error
//! class.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Captured result of one external command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// One external command invocation, built up then run.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    deadline: Option<Duration>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            stdin: None,
            deadline: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Wall-clock deadline; the child is killed when it expires.
    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Short description for error messages: program plus first arguments.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().take(3).cloned());
        parts.join(" ")
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(&self) -> Result<CommandOutput> {
        tracing::trace!(command = %self.describe(), "running external command");

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::source(
                self.describe(),
                format!("failed to spawn '{}': {}", self.program, e),
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(data) = &self.stdin {
                // A child that exits without draining stdin breaks the pipe;
                // that is its way of declining the input, not ours to report.
                let _ = stdin.write_all(data);
            }
        }

        // Drain both pipes on threads so a chatty child never blocks on a
        // full pipe while we wait for it.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let status = match self.deadline {
            None => child.wait()?,
            Some(deadline) => {
                let started = Instant::now();
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if started.elapsed() > deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::source(
                            self.describe(),
                            format!("deadline of {:?} exceeded", deadline),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        Ok(CommandOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status: status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stdout() {
        let out = Cmd::new("sh").arg("-c").arg("echo hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_str().trim(), "hello");
    }

    #[test]
    fn test_capture_stderr_and_status() {
        let out = Cmd::new("sh")
            .arg("-c")
            .arg("echo oops >&2; exit 3")
            .run()
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.status, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_stdin_piping() {
        let out = Cmd::new("cat").stdin_bytes(b"abc".to_vec()).run().unwrap();
        assert_eq!(out.stdout_str(), "abc");
    }

    #[test]
    fn test_deadline_kills_child() {
        let err = Cmd::new("sleep")
            .arg("30")
            .deadline(Some(Duration::from_millis(100)))
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn test_missing_program() {
        let err = Cmd::new("definitely-not-a-real-binary").run().unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}

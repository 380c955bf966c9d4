//! Blocking execution of external build commands
//!
//! Every external tool (protector, interpreter, freezing tool) goes through
//! [`ProcessRunner`]. Stdout and stderr share one pipe so the captured text
//! keeps the interleaving the tool produced.

use crate::{PackError, PackResult};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Argument vector plus working directory of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Build a command from an argv-style list, `argv[0]` being the program
    pub fn from_argv<I, S>(argv: I) -> PackResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .ok_or_else(|| PackError::Config("Empty command line".to_string()))?;
        Ok(Self::new(program).args(argv))
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the command from `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Human readable command line, used in logs and errors
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit code and merged output of a finished command
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Synchronous runner for external commands
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command to completion and return its exit code and output,
    /// whatever the exit code is.
    pub fn execute(&self, spec: &CommandSpec) -> PackResult<ProcessOutput> {
        let (mut reader, writer) = std::io::pipe()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        tracing::debug!(command = %spec.display(), cwd = ?spec.cwd, "Spawning process");
        let mut child = command.spawn().map_err(|source| PackError::Spawn {
            program: Path::new(&spec.program).display().to_string(),
            source,
        })?;

        // The command still owns the write ends; EOF only arrives once they are closed.
        drop(command);

        let mut captured = Vec::new();
        let read_result = reader.read_to_end(&mut captured);
        let status = child.wait()?;
        read_result?;

        Ok(ProcessOutput {
            code: status.code(),
            output: String::from_utf8_lossy(&captured).into_owned(),
        })
    }

    /// Run a command and fail with [`PackError::BuildCommandFailed`] on a
    /// non-zero exit. Never retries.
    pub fn run(&self, spec: &CommandSpec) -> PackResult<ProcessOutput> {
        let result = self.execute(spec)?;
        if !result.success() {
            tracing::error!("\n\n{}\n\n", result.output);
            return Err(PackError::BuildCommandFailed {
                command: spec.display(),
                code: result.code,
                output: result.output,
            });
        }
        if !result.output.is_empty() {
            tracing::debug!(output = %result.output, "Command output");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_argv() {
        let spec = CommandSpec::from_argv(["python", "pyarmor.py", "build"]).unwrap();
        assert_eq!(spec.program, OsString::from("python"));
        assert_eq!(spec.args.len(), 2);
        assert_eq!(spec.display(), "python pyarmor.py build");

        let empty: [&str; 0] = [];
        assert!(matches!(
            CommandSpec::from_argv(empty),
            Err(PackError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_output_is_merged() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2; echo done"]);
        let result = ProcessRunner::new().run(&spec).unwrap();
        assert!(result.success());
        assert_eq!(result.output, "out\nerr\ndone\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken 1>&2; exit 3"]);
        let runner = ProcessRunner::new();

        let result = runner.execute(&spec).unwrap();
        assert_eq!(result.code, Some(3));

        match runner.run(&spec) {
            Err(PackError::BuildCommandFailed { code, output, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(output.trim(), "broken");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_working_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "x").unwrap();

        let spec = CommandSpec::new("ls").current_dir(temp_dir.path());
        let result = ProcessRunner::new().run(&spec).unwrap();
        assert!(result.output.contains("marker.txt"));
    }

    #[test]
    fn test_missing_program() {
        let spec = CommandSpec::new("aurora-packer-no-such-program");
        assert!(matches!(
            ProcessRunner::new().run(&spec),
            Err(PackError::Spawn { .. })
        ));
    }
}

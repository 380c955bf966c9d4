//! Python bytecode compilation
//!
//! Protected sources and sources extracted from a library archive are
//! compiled next to themselves (`a.py` -> `a.pyc`) so the rebuilt archive
//! only ever contains bytecode produced by one interpreter.

use crate::runner::{CommandSpec, ProcessRunner};
use crate::{PackError, PackResult};
use std::path::{Path, PathBuf};

/// Files handed to one interpreter invocation
const BATCH_SIZE: usize = 200;

const COMPILE_SCRIPT: &str = "import sys, py_compile\n\
for source in sys.argv[1:]:\n    \
py_compile.compile(source, source + 'c', doraise=True)\n";

/// Compiles source files into bytecode written beside them
pub trait SourceCompiler {
    /// Write `<file>c` for every file in `sources`
    fn compile_in_place(&self, sources: &[PathBuf]) -> PackResult<()>;
}

/// Compiler backed by the target Python interpreter's `py_compile`
#[derive(Debug, Clone)]
pub struct PythonCompiler {
    python: String,
    runner: ProcessRunner,
}

impl PythonCompiler {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            runner: ProcessRunner::new(),
        }
    }
}

impl Default for PythonCompiler {
    fn default() -> Self {
        Self::new("python")
    }
}

impl SourceCompiler for PythonCompiler {
    fn compile_in_place(&self, sources: &[PathBuf]) -> PackResult<()> {
        for batch in sources.chunks(BATCH_SIZE) {
            let spec = CommandSpec::new(&self.python)
                .args(["-c", COMPILE_SCRIPT])
                .args(batch);
            match self.runner.run(&spec) {
                Ok(_) => {}
                Err(PackError::BuildCommandFailed { output, .. }) => {
                    return Err(PackError::CompileError(output));
                }
                Err(e) => return Err(PackError::CompileError(e.to_string())),
            }
        }
        tracing::debug!("Compiled {} source files", sources.len());
        Ok(())
    }
}

/// Whether `path` is a Python source file (`.py`, any case)
pub fn is_python_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("py"))
}

/// Path of the bytecode file written for `source`
pub fn compiled_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push("c");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_python_source() {
        assert!(is_python_source(Path::new("a.py")));
        assert!(is_python_source(Path::new("pkg/B.PY")));
        assert!(!is_python_source(Path::new("a.pyc")));
        assert!(!is_python_source(Path::new("license.lic")));
        assert!(!is_python_source(Path::new("py")));
    }

    #[test]
    fn test_compiled_path() {
        assert_eq!(compiled_path(Path::new("pkg/b.py")), PathBuf::from("pkg/b.pyc"));
    }

    #[test]
    fn test_missing_interpreter_is_compile_error() {
        let compiler = PythonCompiler::new("aurora-packer-no-such-python");
        let result = compiler.compile_in_place(&[PathBuf::from("a.py")]);
        assert!(matches!(result, Err(PackError::CompileError(_))));
    }

    #[test]
    fn test_empty_input_runs_nothing() {
        let compiler = PythonCompiler::new("aurora-packer-no-such-python");
        assert!(compiler.compile_in_place(&[]).is_ok());
    }
}

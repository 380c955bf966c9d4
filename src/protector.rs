//! Protection step, delegated to an external protector
//!
//! How scripts get protected is not this crate's business. The pipelines
//! only need a directory mirroring the source tree with protected modules,
//! the runtime shim and the runtime files; [`ProtectionBackend`] produces it.

use crate::runner::{CommandSpec, ProcessRunner};
use crate::{PackError, PackResult};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Directory produced by the protection step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedTree {
    /// Intermediate project, removed at the end of a run
    pub project: PathBuf,
    /// Protected modules and runtime files
    pub dist: PathBuf,
}

impl ProtectedTree {
    pub fn new(project: impl Into<PathBuf>) -> Self {
        let project = project.into();
        let dist = project.join("dist");
        Self { project, dist }
    }

    pub fn entry(&self, entry: &str) -> PathBuf {
        self.dist.join(entry)
    }

    /// Fail unless the protected tree was actually produced
    pub fn ensure_built(&self) -> PackResult<()> {
        if self.dist.is_dir() {
            Ok(())
        } else {
            Err(PackError::Protection(format!(
                "No protected scripts in {}",
                self.dist.display()
            )))
        }
    }
}

/// Sources to protect
#[derive(Debug, Clone)]
pub struct ProtectRequest<'a> {
    pub source_dir: &'a Path,
    /// Entry script, relative to `source_dir`
    pub entry: &'a str,
    /// Runtime shim file name, kept out of the protected sources
    pub shim: &'a str,
    pub tree: &'a ProtectedTree,
}

/// External capability producing protected trees
pub trait ProtectionBackend {
    /// Create a protected project for the sources
    fn init_project(&self, request: &ProtectRequest<'_>) -> PackResult<()>;

    /// Restrict the project to the sources the setup script bundles
    fn configure_manifest(&self, request: &ProtectRequest<'_>) -> PackResult<()>;

    /// Build the project into `request.tree.dist`
    fn build_project(&self, request: &ProtectRequest<'_>) -> PackResult<()>;

    /// Protect the sources straight into `request.tree.dist`
    fn obfuscate(&self, request: &ProtectRequest<'_>) -> PackResult<()>;
}

/// Manifest template for setup-script builds
pub fn manifest_filters(entry: &str, shim: &str) -> Vec<String> {
    vec![
        "global-include *.py".to_string(),
        "prune build, prune dist".to_string(),
        format!("exclude {} {}", entry, shim),
    ]
}

/// Protector driven through its command line
#[derive(Debug, Clone)]
pub struct ArmorCli {
    command: Vec<String>,
    runner: ProcessRunner,
}

impl ArmorCli {
    /// `command` is the protector's argv prefix, e.g. `["pyarmor"]`
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            runner: ProcessRunner::new(),
        }
    }

    fn call<I, S>(&self, args: I) -> PackResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let spec = CommandSpec::from_argv(&self.command)?.args(args);
        tracing::info!("Call protector: {}", spec.display());
        self.runner.run(&spec)?;
        Ok(())
    }
}

impl ProtectionBackend for ArmorCli {
    fn init_project(&self, request: &ProtectRequest<'_>) -> PackResult<()> {
        self.call([
            OsStr::new("init"),
            OsStr::new("-t"),
            OsStr::new("app"),
            OsStr::new("--src"),
            request.source_dir.as_os_str(),
            OsStr::new("--entry"),
            OsStr::new(request.entry),
            request.tree.project.as_os_str(),
        ])
    }

    fn configure_manifest(&self, request: &ProtectRequest<'_>) -> PackResult<()> {
        let manifest = manifest_filters(request.entry, request.shim).join(",");
        self.call([
            OsStr::new("config"),
            OsStr::new("--runtime-path"),
            OsStr::new(""),
            OsStr::new("--manifest"),
            OsStr::new(&manifest),
            request.tree.project.as_os_str(),
        ])
    }

    fn build_project(&self, request: &ProtectRequest<'_>) -> PackResult<()> {
        self.call([OsStr::new("build"), request.tree.project.as_os_str()])
    }

    fn obfuscate(&self, request: &ProtectRequest<'_>) -> PackResult<()> {
        self.call([
            OsStr::new("obfuscate"),
            OsStr::new("-r"),
            OsStr::new("--src"),
            request.source_dir.as_os_str(),
            OsStr::new("--entry"),
            OsStr::new(request.entry),
            OsStr::new("-O"),
            request.tree.dist.as_os_str(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_filters() {
        assert_eq!(
            manifest_filters("hello.py", "pytransform.py").join(","),
            "global-include *.py,prune build, prune dist,exclude hello.py pytransform.py"
        );
    }

    #[test]
    fn test_protected_tree_layout() {
        let tree = ProtectedTree::new("/work/pyinstaller");
        assert_eq!(tree.dist, PathBuf::from("/work/pyinstaller/dist"));
        assert_eq!(tree.entry("hello.py"), PathBuf::from("/work/pyinstaller/dist/hello.py"));
        assert!(matches!(tree.ensure_built(), Err(PackError::Protection(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_armor_cli_failure_is_build_error() {
        let cli = ArmorCli::new(vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()]);
        let tree = ProtectedTree::new("/tmp/aurora-packer-test");
        let request = ProtectRequest {
            source_dir: Path::new("/src"),
            entry: "hello.py",
            shim: "pytransform.py",
            tree: &tree,
        };
        assert!(matches!(
            cli.build_project(&request),
            Err(PackError::BuildCommandFailed { code: Some(2), .. })
        ));
    }
}

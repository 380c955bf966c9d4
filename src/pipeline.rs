//! Pack pipelines
//!
//! Setup-script tools (py2exe, py2app, cx_Freeze):
//!
//! ```text
//! ProtectSources -> ConfigureManifest -> BuildProtectedProject
//!   -> RunExternalBuild (entry swapped) -> RewriteArchive
//!   -> CopyRuntimeAssets -> Cleanup
//! ```
//!
//! PyInstaller reads the protected tree straight from disk through a
//! patched spec, so there is no archive rewrite:
//!
//! ```text
//! ProtectSources -> GenerateSpec -> PatchSpec -> RunExternalBuild -> Cleanup
//! ```
//!
//! Any failing stage aborts the run with its error. Cleanup still runs.

use crate::archive::{ArchiveRewriter, RewriteResult};
use crate::bytecode::{PythonCompiler, SourceCompiler};
use crate::config::{PackConfig, PackLayout};
use crate::protector::{ArmorCli, ProtectRequest, ProtectedTree, ProtectionBackend};
use crate::runner::{CommandSpec, ProcessRunner};
use crate::runtime::{copy_runtime_files, NATIVE_LIBRARY_PATTERN};
use crate::spec_patch::{SpecPatch, SpecPatcher};
use crate::swap::{with_entry_swapped, SwapPlan};
use crate::{PackError, PackResult};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Project directory for setup-script builds, under the work root
const SETUP_PROJECT: &str = "build-for-packer";

/// Project directory for PyInstaller builds, under the work root
const PYINSTALLER_PROJECT: &str = "pyinstaller";

/// Separator between source and destination of `--add-data`
#[cfg(windows)]
const DATA_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const DATA_SEPARATOR: &str = ":";

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ProtectSources,
    ConfigureManifest,
    BuildProtectedProject,
    GenerateSpec,
    PatchSpec,
    RunExternalBuild,
    RewriteArchive,
    CopyRuntimeAssets,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ProtectSources => "protect_sources",
            Stage::ConfigureManifest => "configure_manifest",
            Stage::BuildProtectedProject => "build_protected_project",
            Stage::GenerateSpec => "generate_spec",
            Stage::PatchSpec => "patch_spec",
            Stage::RunExternalBuild => "run_external_build",
            Stage::RewriteArchive => "rewrite_archive",
            Stage::CopyRuntimeAssets => "copy_runtime_assets",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful pack run
#[derive(Debug, Clone)]
pub struct PackReport {
    /// Directory holding the final bundle
    pub output: PathBuf,
    /// Stages in the order they completed
    pub stages: Vec<Stage>,
    /// Rewritten library archive (setup-script tools)
    pub archive: Option<RewriteResult>,
    /// Patched spec file (PyInstaller)
    pub patched_spec: Option<PathBuf>,
}

/// Records completed stages and logs each one as it starts
#[derive(Debug, Default)]
struct Progress {
    completed: Vec<Stage>,
}

impl Progress {
    fn run<T>(&mut self, stage: Stage, step: impl FnOnce() -> PackResult<T>) -> PackResult<T> {
        tracing::info!("Stage {}", stage);
        match step() {
            Ok(value) => {
                self.completed.push(stage);
                Ok(value)
            }
            Err(e) => {
                tracing::error!("Stage {} failed: {}", stage, e);
                Err(e)
            }
        }
    }
}

/// Packs protected scripts with the configured freezing tool
pub struct Packer {
    config: PackConfig,
    backend: Box<dyn ProtectionBackend>,
    compiler: Box<dyn SourceCompiler>,
    runner: ProcessRunner,
}

impl Packer {
    /// Create a packer using the configured protector and interpreter
    pub fn new(config: PackConfig) -> Self {
        let backend = ArmorCli::new(config.protector.clone());
        let compiler = PythonCompiler::new(config.python());
        Self {
            config,
            backend: Box::new(backend),
            compiler: Box::new(compiler),
            runner: ProcessRunner::new(),
        }
    }

    /// Use another protection backend
    pub fn with_backend(mut self, backend: impl ProtectionBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    /// Use another bytecode compiler
    pub fn with_compiler(mut self, compiler: impl SourceCompiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// Run the pipeline matching the configured tool
    pub fn pack(&self) -> PackResult<PackReport> {
        let layout = self.config.resolve()?;
        let work_root = std::path::absolute(self.config.work_root())?;
        tracing::info!("Prepare to pack protected scripts with {}", layout.kind);

        let report = if layout.kind.uses_library_archive() {
            self.pack_with_setup(&layout, &work_root)?
        } else {
            self.pack_with_pyinstaller(&layout, &work_root)?
        };

        tracing::info!(
            "Pack protected scripts successfully in {}",
            report.output.display()
        );
        Ok(report)
    }

    fn pack_with_setup(&self, layout: &PackLayout, work_root: &Path) -> PackResult<PackReport> {
        check_setup_script(layout)?;

        let tree = ProtectedTree::new(work_root.join(SETUP_PROJECT));
        remove_stale(&tree)?;

        let mut progress = Progress::default();
        let result = self.setup_stages(layout, &tree, &mut progress);
        self.cleanup(&tree, &mut progress);

        let archive = result?;
        Ok(PackReport {
            output: layout.output.clone(),
            stages: progress.completed,
            archive: Some(archive),
            patched_spec: None,
        })
    }

    fn setup_stages(
        &self,
        layout: &PackLayout,
        tree: &ProtectedTree,
        progress: &mut Progress,
    ) -> PackResult<RewriteResult> {
        let request = ProtectRequest {
            source_dir: &layout.source_dir,
            entry: &layout.entry,
            shim: &self.config.shim,
            tree,
        };

        progress.run(Stage::ProtectSources, || {
            self.backend.init_project(&request)
        })?;
        progress.run(Stage::ConfigureManifest, || {
            self.backend.configure_manifest(&request)
        })?;
        progress.run(Stage::BuildProtectedProject, || {
            self.backend.build_project(&request)?;
            tree.ensure_built()
        })?;

        let plan = SwapPlan {
            entry: layout.entry_path(),
            protected_entry: tree.entry(&layout.entry),
            shim: tree.dist.join(&self.config.shim),
        };
        let build = CommandSpec::new(self.config.python())
            .arg(&layout.setup_script)
            .args(&layout.pack_command)
            .current_dir(&layout.build_dir);
        progress.run(Stage::RunExternalBuild, || {
            with_entry_swapped(&plan, || self.runner.run(&build))
        })?;

        let library_name = layout.library_name.as_deref().ok_or_else(|| {
            PackError::Config(format!("{} has no library archive", layout.kind))
        })?;
        let library = layout.output.join(library_name);
        let rewrite = progress.run(Stage::RewriteArchive, || {
            ArchiveRewriter::new(self.compiler.as_ref()).rewrite(&library, &tree.dist)
        })?;

        progress.run(Stage::CopyRuntimeAssets, || {
            copy_runtime_files(&tree.dist, &layout.output)
        })?;

        Ok(rewrite)
    }

    fn pack_with_pyinstaller(
        &self,
        layout: &PackLayout,
        work_root: &Path,
    ) -> PackResult<PackReport> {
        let tree = ProtectedTree::new(work_root.join(PYINSTALLER_PROJECT));
        remove_stale(&tree)?;

        let mut progress = Progress::default();
        let result = self.pyinstaller_stages(layout, &tree, &mut progress);
        self.cleanup(&tree, &mut progress);

        let patched = result?;
        Ok(PackReport {
            output: layout.output.clone(),
            stages: progress.completed,
            archive: None,
            patched_spec: Some(patched),
        })
    }

    fn pyinstaller_stages(
        &self,
        layout: &PackLayout,
        tree: &ProtectedTree,
        progress: &mut Progress,
    ) -> PackResult<PathBuf> {
        let request = ProtectRequest {
            source_dir: &layout.source_dir,
            entry: &layout.entry,
            shim: &self.config.shim,
            tree,
        };

        progress.run(Stage::ProtectSources, || {
            self.backend.obfuscate(&request)?;
            tree.ensure_built()
        })?;

        let spec = tree.project.join(format!("{}.spec", layout.entry_module()));
        progress.run(Stage::GenerateSpec, || {
            self.runner.run(&self.makespec_command(layout, tree))?;
            if spec.is_file() {
                Ok(())
            } else {
                Err(PackError::FileNotFound(spec.display().to_string()))
            }
        })?;

        let patch = SpecPatch {
            module_name: layout.entry_module(),
            protected_entry: tree.entry(&layout.entry),
            base_path: layout.source_dir.clone(),
            protected_dir: tree.dist.clone(),
        };
        let patched = progress.run(Stage::PatchSpec, || {
            SpecPatcher::new().patch_file(&spec, &patch)
        })?;

        let build = CommandSpec::new(self.config.python())
            .args(layout.kind.command_options())
            .arg(&layout.output)
            .args(["-y", "--workpath"])
            .arg(tree.project.join("build"))
            .arg(&patched);
        progress.run(Stage::RunExternalBuild, || self.runner.run(&build))?;

        Ok(patched)
    }

    /// `makespec` invocation bundling runtime files and the shim
    fn makespec_command(&self, layout: &PackLayout, tree: &ProtectedTree) -> CommandSpec {
        let data = |pattern: &str| {
            format!(
                "{}{}.",
                tree.dist.join(pattern).display(),
                DATA_SEPARATOR
            )
        };
        let shim_module = Path::new(&self.config.shim)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        CommandSpec::new(self.config.python())
            .args(["-m", "PyInstaller.utils.cliutils.makespec", "--specpath"])
            .arg(&tree.project)
            .args(["--add-data".to_string(), data("*.lic")])
            .args(["--add-data".to_string(), data("*.key")])
            .args(["--add-data".to_string(), data(NATIVE_LIBRARY_PATTERN)])
            .args(["--hidden-import".to_string(), shim_module])
            .arg("--paths")
            .arg(&tree.dist)
            .args(&self.config.options)
            .arg(layout.entry_path())
    }

    /// Best effort: a failed removal is only logged
    fn cleanup(&self, tree: &ProtectedTree, progress: &mut Progress) {
        let _ = progress.run(Stage::Cleanup, || {
            if self.config.keep_temp {
                tracing::info!("Keep project {}", tree.project.display());
                return Ok(());
            }
            match fs::remove_dir_all(&tree.project) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", tree.project.display(), e);
                    Ok(())
                }
            }
        });
    }
}

/// Setup-script tools need the script before anything is touched
pub fn check_setup_script(layout: &PackLayout) -> PackResult<()> {
    let setup = layout.setup_path();
    if setup.is_file() {
        return Ok(());
    }
    let hint = layout.kind.setup_hint();
    tracing::info!("Please run the following command to generate {}", layout.setup_script);
    tracing::info!("\t{}", hint);
    Err(PackError::MissingSetupScript {
        path: setup,
        hint: hint.to_string(),
    })
}

/// Remove a project left behind by a run that kept its temp files
fn remove_stale(tree: &ProtectedTree) -> PackResult<()> {
    if tree.project.exists() {
        tracing::debug!("Remove stale project {}", tree.project.display());
        fs::remove_dir_all(&tree.project)?;
    }
    Ok(())
}

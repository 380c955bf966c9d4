//! Temporary substitution of the entry script
//!
//! Setup scripts (py2exe, py2app, cx_Freeze) read the entry script from the
//! source tree, so the protected entry has to sit at the original path while
//! the freezing tool runs. [`EntrySwap`] moves it in, and puts everything
//! back on every exit path: explicitly through [`EntrySwap::restore`], or
//! from `Drop` when the swap is abandoned by an early return or a panic.
//!
//! Concurrent swaps of the same source tree are not supported; callers run
//! one pipeline per source tree at a time.

use crate::{PackError, PackResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of the backup kept beside the original entry script
pub const BACKUP_SUFFIX: &str = ".armor.bak";

/// What to swap: the original entry, its protected replacement and the
/// runtime shim the protected script imports.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    /// Absolute path of the original entry script
    pub entry: PathBuf,
    /// Protected entry script inside the protected tree
    pub protected_entry: PathBuf,
    /// Runtime shim to make importable next to the entry
    pub shim: PathBuf,
}

/// Paths recorded while a swap is active
#[derive(Debug, Clone)]
pub struct TempSwapState {
    pub original: PathBuf,
    pub backup: PathBuf,
    pub replacement: PathBuf,
}

/// Guard for an active entry-script swap
#[derive(Debug)]
pub struct EntrySwap {
    state: TempSwapState,
    shim_target: PathBuf,
    shim_backup: PathBuf,
    original_moved: bool,
    replacement_installed: bool,
    shim_backed_up: bool,
    shim_installed: bool,
}

impl EntrySwap {
    /// Put the protected entry and the shim in place.
    ///
    /// If any step fails, the steps already done are undone before the
    /// error is returned.
    pub fn begin(plan: &SwapPlan) -> PackResult<Self> {
        if !plan.entry.is_file() {
            return Err(PackError::FileNotFound(plan.entry.display().to_string()));
        }
        let source_dir = plan
            .entry
            .parent()
            .ok_or_else(|| PackError::Config(format!("No parent for {}", plan.entry.display())))?;
        let shim_name = plan
            .shim
            .file_name()
            .ok_or_else(|| PackError::Config(format!("Invalid shim {}", plan.shim.display())))?;
        let shim_target = source_dir.join(shim_name);

        let mut swap = Self {
            state: TempSwapState {
                original: plan.entry.clone(),
                backup: with_suffix(&plan.entry, BACKUP_SUFFIX),
                replacement: plan.protected_entry.clone(),
            },
            shim_backup: with_suffix(&shim_target, BACKUP_SUFFIX),
            shim_target,
            original_moved: false,
            replacement_installed: false,
            shim_backed_up: false,
            shim_installed: false,
        };

        for backup in [&swap.state.backup, &swap.shim_backup] {
            if backup.exists() {
                return Err(PackError::Config(format!(
                    "Backup {} left by an earlier run, restore it by hand before packing",
                    backup.display()
                )));
            }
        }

        tracing::debug!(
            "Move {} to {}",
            swap.state.original.display(),
            swap.state.backup.display()
        );
        fs::rename(&swap.state.original, &swap.state.backup)?;
        swap.original_moved = true;

        if !swap.state.replacement.is_file() {
            return Err(PackError::Protection(format!(
                "Protected entry {} not found",
                swap.state.replacement.display()
            )));
        }
        move_file(&swap.state.replacement, &swap.state.original)?;
        swap.replacement_installed = true;

        if swap.shim_target.exists() {
            fs::rename(&swap.shim_target, &swap.shim_backup)?;
            swap.shim_backed_up = true;
        }
        fs::copy(&plan.shim, &swap.shim_target).map_err(|e| PackError::from_io(&plan.shim, e))?;
        swap.shim_installed = true;

        Ok(swap)
    }

    pub fn state(&self) -> &TempSwapState {
        &self.state
    }

    /// Restore the source tree, reporting the first failure
    pub fn restore(mut self) -> PackResult<()> {
        self.undo()
    }

    /// Every step is attempted even when an earlier one fails
    fn undo(&mut self) -> PackResult<()> {
        let mut first_error: Option<io::Error> = None;
        let mut record = |result: io::Result<()>| {
            if let Err(e) = result {
                tracing::warn!("Restore step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        if self.shim_installed {
            record(fs::remove_file(&self.shim_target));
            self.shim_installed = false;
        }
        if self.shim_backed_up {
            record(fs::rename(&self.shim_backup, &self.shim_target));
            self.shim_backed_up = false;
        }
        if self.replacement_installed {
            record(move_file(&self.state.original, &self.state.replacement));
            self.replacement_installed = false;
        }
        if self.original_moved {
            record(fs::rename(&self.state.backup, &self.state.original));
            self.original_moved = false;
        }

        match first_error {
            Some(e) => Err(PackError::Io(e)),
            None => Ok(()),
        }
    }
}

impl Drop for EntrySwap {
    fn drop(&mut self) {
        if self.original_moved || self.shim_installed || self.shim_backed_up {
            let _ = self.undo();
        }
    }
}

/// Run `action` while the protected entry is swapped in.
///
/// The source tree is restored before any result is returned. A restore
/// failure takes precedence over the action's error, since it means the
/// source tree is no longer intact.
pub fn with_entry_swapped<T>(
    plan: &SwapPlan,
    action: impl FnOnce() -> PackResult<T>,
) -> PackResult<T> {
    let swap = EntrySwap::begin(plan)?;
    let result = action();
    if let Err(restore_error) = swap.restore() {
        if let Err(e) = &result {
            tracing::error!("Build failed before restore: {}", e);
        }
        return Err(restore_error);
    }
    result
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `rename`, falling back to copy and delete across filesystems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

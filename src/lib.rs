//! Aurora Packer - Bundle Protected Python Scripts
//!
//! Builds a distributable bundle from protected (obfuscated) scripts with a
//! third-party freezing tool, then replaces whatever the tool picked up from
//! the plain sources with the protected equivalents.
//!
//! ## Setup-script tools (py2exe, py2app, cx_Freeze)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  src/ ──► protector ──► project/dist (protected tree)            │
//! │                              │                                   │
//! │                              ▼                                   │
//! │   swap entry: src/hello.py ◄── dist/hello.py (+ runtime shim)    │
//! │                              │                                   │
//! │                              ▼                                   │
//! │             python setup.py py2exe --dist-dir <output>           │
//! │                              │                                   │
//! │                              ▼                                   │
//! │   restore entry, rewrite library.zip with protected bytecode,    │
//! │   copy license/key files and the native support library          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## PyInstaller
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  src/ ──► protector ──► dist ──► makespec ──► hello.spec         │
//! │                                                   │              │
//! │                                                   ▼              │
//! │         hello-patched.spec (scripts + pure modules → dist)       │
//! │                                                   │              │
//! │                                                   ▼              │
//! │                 python -m PyInstaller hello-patched.spec         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use aurora_packer::{PackConfig, Packer, PackerKind};
//!
//! let config = PackConfig::new("src/hello.py").kind(PackerKind::Py2exe);
//! let report = Packer::new(config).pack()?;
//! println!("Bundle in {}", report.output.display());
//! # Ok::<(), aurora_packer::PackError>(())
//! ```

pub mod archive;
pub mod bytecode;
mod config;
mod error;
pub mod pipeline;
pub mod protector;
pub mod runner;
pub mod runtime;
pub mod spec_patch;
pub mod swap;

pub use archive::{ArchiveMember, ArchiveRewriter, RewriteResult};
pub use bytecode::{PythonCompiler, SourceCompiler};
pub use config::{PackConfig, PackLayout, PackerKind, PythonInfo};
pub use error::{PackError, PackResult};
pub use pipeline::{PackReport, Packer, Stage};
pub use protector::{ArmorCli, ProtectRequest, ProtectedTree, ProtectionBackend};
pub use runner::{CommandSpec, ProcessOutput, ProcessRunner};
pub use spec_patch::{PyzAnchor, SpecAnchor, SpecPatch, SpecPatcher};
pub use swap::{with_entry_swapped, EntrySwap, SwapPlan, TempSwapState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

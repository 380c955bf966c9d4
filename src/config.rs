//! Configuration for packing protected scripts

use crate::runner::{CommandSpec, ProcessRunner};
use crate::{PackError, PackResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Freezing tool used to build the bundle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PackerKind {
    #[serde(rename = "py2exe")]
    Py2exe,
    #[serde(rename = "py2app")]
    Py2app,
    #[serde(rename = "cx_Freeze")]
    CxFreeze,
    #[default]
    #[serde(rename = "PyInstaller")]
    PyInstaller,
}

impl PackerKind {
    pub const ALL: [PackerKind; 4] = [
        PackerKind::Py2exe,
        PackerKind::Py2app,
        PackerKind::CxFreeze,
        PackerKind::PyInstaller,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PackerKind::Py2exe => "py2exe",
            PackerKind::Py2app => "py2app",
            PackerKind::CxFreeze => "cx_Freeze",
            PackerKind::PyInstaller => "PyInstaller",
        }
    }

    /// Tools driven by a setup script whose output has a library archive
    pub fn uses_library_archive(self) -> bool {
        !matches!(self, PackerKind::PyInstaller)
    }

    /// Default output directory, relative to the build directory
    pub fn default_dist_dir(self, python: &PythonInfo) -> PathBuf {
        match self {
            PackerKind::CxFreeze => Path::new("build")
                .join(format!("exe.{}-{}", python.platform, python.version)),
            _ => PathBuf::from("dist"),
        }
    }

    /// Name of the compiled-library archive in the output directory
    pub fn library_name(self, python: &PythonInfo) -> Option<String> {
        match self {
            PackerKind::Py2exe | PackerKind::Py2app => Some("library.zip".to_string()),
            PackerKind::CxFreeze => Some(format!("python{}.zip", python.version.replace('.', ""))),
            PackerKind::PyInstaller => None,
        }
    }

    /// Options naming the output directory; the directory itself follows
    pub fn command_options(self) -> &'static [&'static str] {
        match self {
            PackerKind::Py2exe => &["py2exe", "--dist-dir"],
            PackerKind::Py2app => &["py2app", "--dist-dir"],
            PackerKind::CxFreeze => &["build", "--build-exe"],
            PackerKind::PyInstaller => &["-m", "PyInstaller", "--distpath"],
        }
    }

    /// How to generate a missing setup script
    pub fn setup_hint(self) -> &'static str {
        match self {
            PackerKind::Py2exe => "python -m py2exe.build_exe -W setup.py hello.py",
            PackerKind::CxFreeze => "cxfreeze-quickstart",
            _ => "vi setup.py",
        }
    }
}

impl fmt::Display for PackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for PackerKind {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "py2exe" => Ok(PackerKind::Py2exe),
            "py2app" => Ok(PackerKind::Py2app),
            "cx_freeze" | "cxfreeze" => Ok(PackerKind::CxFreeze),
            "pyinstaller" => Ok(PackerKind::PyInstaller),
            _ => Err(PackError::Config(format!(
                "Unknown packer type: {} (expected one of {})",
                s,
                PackerKind::ALL.map(PackerKind::name).join(", ")
            ))),
        }
    }
}

/// Platform tag and `major.minor` version of the target interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonInfo {
    pub platform: String,
    pub version: String,
}

const PROBE_SCRIPT: &str = "import sys, sysconfig\n\
    print(sysconfig.get_platform())\n\
    print('%d.%d' % sys.version_info[:2])";

impl PythonInfo {
    /// Ask the interpreter for its platform tag and version
    pub fn probe(python: &str) -> PackResult<Self> {
        let spec = CommandSpec::new(python).args(["-c", PROBE_SCRIPT]);
        let output = ProcessRunner::new().run(&spec)?.output;
        Self::parse(&output)
    }

    fn parse(output: &str) -> PackResult<Self> {
        let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
        match (lines.next(), lines.next()) {
            (Some(platform), Some(version)) => Ok(Self {
                platform: platform.to_string(),
                version: version.to_string(),
            }),
            _ => Err(PackError::Config(format!(
                "Unexpected interpreter info: {}",
                output.trim()
            ))),
        }
    }
}

/// Configuration for one pack run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    /// Freezing tool
    #[serde(default, rename = "type")]
    pub kind: PackerKind,

    /// Entry script of the application
    pub entry: PathBuf,

    /// Setup script (default: `setup.py` beside the entry)
    #[serde(default)]
    pub setup: Option<PathBuf>,

    /// Output directory (default: the tool's own dist directory)
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Extra options passed to the pack command
    #[serde(default)]
    pub options: Vec<String>,

    /// Python executable path (default: `python`)
    #[serde(default)]
    pub python_path: Option<String>,

    /// Command line of the protection tool
    #[serde(default = "default_protector")]
    pub protector: Vec<String>,

    /// Directory holding intermediate protected projects
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Keep intermediate projects for debugging
    #[serde(default)]
    pub keep_temp: bool,

    /// Python version (e.g., "3.11"), probed when needed and not set
    #[serde(default)]
    pub python_version: Option<String>,

    /// Platform tag (e.g., "linux-x86_64"), probed when needed and not set
    #[serde(default)]
    pub platform: Option<String>,

    /// Runtime shim imported by protected scripts
    #[serde(default = "default_shim")]
    pub shim: String,
}

fn default_protector() -> Vec<String> {
    vec!["pyarmor".to_string()]
}

fn default_shim() -> String {
    "pytransform.py".to_string()
}

impl PackConfig {
    /// Create new config with defaults
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            kind: PackerKind::default(),
            entry: entry.into(),
            setup: None,
            output: None,
            options: vec![],
            python_path: None,
            protector: default_protector(),
            work_dir: None,
            keep_temp: false,
            python_version: None,
            platform: None,
            shim: default_shim(),
        }
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: &Path) -> PackResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| PackError::FileNotFound(path.display().to_string()))?;
        serde_json::from_str(&text)
            .map_err(|e| PackError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn kind(mut self, kind: PackerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn setup(mut self, setup: impl Into<PathBuf>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Add an extra pack option
    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// Set Python path
    pub fn python_path(mut self, path: impl Into<String>) -> Self {
        self.python_path = Some(path.into());
        self
    }

    /// Set the protector command line
    pub fn protector<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protector = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Keep temporary files
    pub fn keep_temp(mut self, keep: bool) -> Self {
        self.keep_temp = keep;
        self
    }

    /// Set Python version and platform tag, skipping the interpreter probe
    pub fn python_info(mut self, version: impl Into<String>, platform: impl Into<String>) -> Self {
        self.python_version = Some(version.into());
        self.platform = Some(platform.into());
        self
    }

    /// Python interpreter used to run setup scripts and tools
    pub fn python(&self) -> &str {
        self.python_path.as_deref().unwrap_or("python")
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("aurora-packer"))
    }

    fn python_info_for(&self) -> PackResult<PythonInfo> {
        match (&self.python_version, &self.platform) {
            (Some(version), Some(platform)) => Ok(PythonInfo {
                platform: platform.clone(),
                version: version.clone(),
            }),
            (version, platform) => {
                let probed = PythonInfo::probe(self.python())?;
                Ok(PythonInfo {
                    platform: platform.clone().unwrap_or(probed.platform),
                    version: version.clone().unwrap_or(probed.version),
                })
            }
        }
    }

    /// Work out directories, names and the pack command for this run
    pub fn resolve(&self) -> PackResult<PackLayout> {
        let entry_path = std::path::absolute(&self.entry)?;
        let entry = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PackError::Config(format!("Invalid entry {}", self.entry.display())))?;
        let source_dir = entry_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| PackError::Config(format!("Invalid entry {}", self.entry.display())))?;

        let (build_dir, setup_script) = match &self.setup {
            None => (source_dir.clone(), "setup.py".to_string()),
            Some(setup) => {
                let setup = std::path::absolute(setup)?;
                let name = setup
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        PackError::Config(format!("Invalid setup script {}", setup.display()))
                    })?;
                let dir = setup.parent().map(Path::to_path_buf).unwrap_or_default();
                (dir, name)
            }
        };

        // Only cx_Freeze names depend on the interpreter
        let python = if self.kind == PackerKind::CxFreeze {
            self.python_info_for()?
        } else {
            PythonInfo {
                platform: String::new(),
                version: String::new(),
            }
        };

        let output = match &self.output {
            None => build_dir.join(self.kind.default_dist_dir(&python)),
            Some(output) if output.is_absolute() => output.clone(),
            Some(output) => build_dir.join(output),
        };

        let mut pack_command: Vec<String> = self
            .kind
            .command_options()
            .iter()
            .map(|s| s.to_string())
            .collect();
        pack_command.push(output.display().to_string());
        pack_command.extend(self.options.iter().cloned());

        Ok(PackLayout {
            kind: self.kind,
            source_dir,
            entry,
            build_dir,
            setup_script,
            output,
            library_name: self.kind.library_name(&python),
            pack_command,
        })
    }
}

/// Resolved paths and command line of one pack run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackLayout {
    pub kind: PackerKind,
    /// Absolute directory of the entry script
    pub source_dir: PathBuf,
    /// Entry script file name, relative to `source_dir`
    pub entry: String,
    /// Directory the setup script runs in
    pub build_dir: PathBuf,
    pub setup_script: String,
    pub output: PathBuf,
    pub library_name: Option<String>,
    /// Pack command options, output directory and extra options included
    pub pack_command: Vec<String>,
}

impl PackLayout {
    pub fn entry_path(&self) -> PathBuf {
        self.source_dir.join(&self.entry)
    }

    pub fn setup_path(&self) -> PathBuf {
        self.build_dir.join(&self.setup_script)
    }

    /// Module name of the entry script
    pub fn entry_module(&self) -> String {
        Path::new(&self.entry)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

//! PyInstaller spec file patching
//!
//! A generated `.spec` is a Python script. Its `Analysis` result `a` holds
//! the entry script in `a.scripts` and pure modules in `a.pure`, both as
//! `(name, path, kind)` triples, and `pyz = PYZ(a.pure, ...)` is where the
//! pure modules get bundled. The patch block goes right before that line
//! and points the entry and every module under the source tree at the
//! protected tree instead.
//!
//! ```text
//! a = Analysis(['/src/hello.py'], ...)
//!                                         <- patch block inserted here
//! pyz = PYZ(a.pure, a.zipped_data, ...)
//! ```

use crate::{PackError, PackResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::LazyLock;

/// Script list of the first `Analysis([...])` call
static ANALYSIS_SCRIPTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Analysis\(\s*\[(.*?)\]").expect("Invalid Analysis regex")
});

/// Single- or double-quoted Python string literal
static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("Invalid string literal regex")
});

/// Prefix of the line that bundles pure modules into the package archive
pub const PYZ_ANCHOR: &str = "pyz = PYZ(a.pure";

/// Finds the line the patch block is inserted before
pub trait SpecAnchor {
    /// Index of the anchor line in `lines`
    fn locate(&self, lines: &[String]) -> PackResult<usize>;
}

/// Anchors on the single `pyz = PYZ(a.pure` line
#[derive(Debug, Clone, Copy, Default)]
pub struct PyzAnchor;

impl SpecAnchor for PyzAnchor {
    fn locate(&self, lines: &[String]) -> PackResult<usize> {
        let mut found = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.starts_with(PYZ_ANCHOR))
            .map(|(i, _)| i);
        match (found.next(), found.next()) {
            (Some(index), None) => Ok(index),
            (None, _) => Err(PackError::UnsupportedSpecFormat(
                "no PYZ line found".to_string(),
            )),
            (Some(_), Some(_)) => Err(PackError::UnsupportedSpecFormat(
                "more than one PYZ line found".to_string(),
            )),
        }
    }
}

/// Redirection applied to a spec
#[derive(Debug, Clone)]
pub struct SpecPatch {
    /// Module name of the entry script (file stem)
    pub module_name: String,
    /// Absolute path of the protected entry script
    pub protected_entry: PathBuf,
    /// Source tree whose modules are redirected
    pub base_path: PathBuf,
    /// Protected tree replacing `base_path`
    pub protected_dir: PathBuf,
}

impl SpecPatch {
    /// Lines of the patch block, without line terminators
    pub fn block(&self) -> Vec<String> {
        let base = py_literal(&dir_prefix(&self.base_path));
        let protected = py_literal(&dir_prefix(&self.protected_dir));
        vec![
            String::new(),
            "# Patched by aurora-packer".to_string(),
            format!(
                "a.scripts[0] = {}, {}, 'PYSOURCE'",
                py_literal(&self.module_name),
                py_literal(&self.protected_entry.display().to_string())
            ),
            "for i in range(len(a.pure)):".to_string(),
            format!("    if a.pure[i][1].startswith({}):", base),
            format!(
                "        a.pure[i] = a.pure[i][0], a.pure[i][1].replace({}, {}, 1), a.pure[i][2]",
                base, protected
            ),
            "# Patch end.".to_string(),
            String::new(),
        ]
    }
}

/// Patches spec files through a pluggable anchor strategy
#[derive(Debug, Clone, Default)]
pub struct SpecPatcher<A = PyzAnchor> {
    anchor: A,
}

impl SpecPatcher<PyzAnchor> {
    pub fn new() -> Self {
        Self { anchor: PyzAnchor }
    }
}

impl<A: SpecAnchor> SpecPatcher<A> {
    pub fn with_anchor(anchor: A) -> Self {
        Self { anchor }
    }

    /// Insert the patch block before the anchor line.
    ///
    /// `lines` keep their terminators; every other line is returned
    /// unchanged and in order.
    pub fn patch_lines(&self, lines: &[String], patch: &SpecPatch) -> PackResult<Vec<String>> {
        check_single_script(lines)?;
        let index = self.anchor.locate(lines)?;

        let newline = if lines[index].ends_with("\r\n") { "\r\n" } else { "\n" };
        let block = patch.block();
        let mut patched = Vec::with_capacity(lines.len() + block.len());
        patched.extend_from_slice(&lines[..index]);
        patched.extend(block.into_iter().map(|line| line + newline));
        patched.extend_from_slice(&lines[index..]);
        Ok(patched)
    }

    pub fn patch_text(&self, text: &str, patch: &SpecPatch) -> PackResult<String> {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
        Ok(self.patch_lines(&lines, patch)?.concat())
    }

    /// Write the patched spec beside `spec` and return its path.
    ///
    /// The input file is never modified.
    pub fn patch_file(&self, spec: &Path, patch: &SpecPatch) -> PackResult<PathBuf> {
        tracing::info!("Patch spec file {}", spec.display());
        let text = fs::read_to_string(spec).map_err(|e| PackError::from_io(spec, e))?;
        let patched = self.patch_text(&text, patch)?;

        let output = patched_spec_path(spec);
        fs::write(&output, patched)?;
        tracing::info!("Patched spec written to {}", output.display());
        Ok(output)
    }
}

/// `hello.spec` -> `hello-patched.spec`
pub fn patched_spec_path(spec: &Path) -> PathBuf {
    let stem = spec
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    spec.with_file_name(format!("{}-patched.spec", stem))
}

/// Only specs built from a single entry script are supported
fn check_single_script(lines: &[String]) -> PackResult<()> {
    let text = lines.concat();
    if let Some(scripts) = ANALYSIS_SCRIPTS.captures(&text).and_then(|c| c.get(1)) {
        let count = STRING_LITERAL.find_iter(scripts.as_str()).count();
        if count > 1 {
            return Err(PackError::UnsupportedSpecFormat(format!(
                "{} scripts in Analysis, only one entry script is supported",
                count
            )));
        }
    }
    Ok(())
}

/// Directory path with a trailing separator, so `/src` never matches `/src2`
fn dir_prefix(dir: &Path) -> String {
    let mut s = dir.display().to_string();
    if !s.ends_with(MAIN_SEPARATOR) {
        s.push(MAIN_SEPARATOR);
    }
    s
}

fn py_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SPEC: &str = "# -*- mode: python -*-\n\
block_cipher = None\n\
a = Analysis(['/src/hello.py'],\n             pathex=['/project'],\n             binaries=[])\n\
pyz = PYZ(a.pure, a.zipped_data,\n             cipher=block_cipher)\n\
exe = EXE(pyz, a.scripts, name='hello')\n";

    fn patch() -> SpecPatch {
        SpecPatch {
            module_name: "hello".to_string(),
            protected_entry: PathBuf::from("/work/dist/hello.py"),
            base_path: PathBuf::from("/src"),
            protected_dir: PathBuf::from("/work/dist"),
        }
    }

    #[test]
    fn test_block_inserted_before_anchor() {
        let patched = SpecPatcher::new().patch_text(SPEC, &patch()).unwrap();
        let lines: Vec<&str> = patched.lines().collect();

        let anchor = lines.iter().position(|l| l.starts_with(PYZ_ANCHOR)).unwrap();
        assert_eq!(lines[anchor - 2], "# Patch end.");
        assert!(lines.contains(&"# Patched by aurora-packer"));

        #[cfg(unix)]
        {
            assert!(lines.contains(&"a.scripts[0] = 'hello', '/work/dist/hello.py', 'PYSOURCE'"));
            assert!(lines.contains(&"    if a.pure[i][1].startswith('/src/'):"));
        }

        // everything else is untouched and in order
        let original: Vec<&str> = SPEC.lines().collect();
        let remaining: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|l| !patch().block().iter().any(|b| b == l))
            .collect();
        assert_eq!(remaining, original);
    }

    #[test]
    fn test_patch_is_deterministic() {
        let patcher = SpecPatcher::new();
        assert_eq!(
            patcher.patch_text(SPEC, &patch()).unwrap(),
            patcher.patch_text(SPEC, &patch()).unwrap()
        );
    }

    #[test]
    fn test_missing_anchor() {
        let spec = "a = Analysis(['hello.py'])\nexe = EXE(a.scripts)\n";
        let result = SpecPatcher::new().patch_text(spec, &patch());
        assert!(matches!(result, Err(PackError::UnsupportedSpecFormat(_))));
    }

    #[test]
    fn test_single_anchor_without_analysis() {
        let spec = "x = 1\npyz = PYZ(a.pure)\n";
        let patched = SpecPatcher::new().patch_text(spec, &patch()).unwrap();
        assert!(patched.starts_with("x = 1\n\n# Patched by aurora-packer\n"));
        assert!(patched.ends_with("# Patch end.\n\npyz = PYZ(a.pure)\n"));
    }

    #[test]
    fn test_ambiguous_anchor() {
        let spec = "pyz = PYZ(a.pure)\npyz = PYZ(a.pure, a.zipped_data)\n";
        let result = SpecPatcher::new().patch_text(spec, &patch());
        assert!(matches!(result, Err(PackError::UnsupportedSpecFormat(_))));
    }

    #[test]
    fn test_multiple_scripts_rejected() {
        let spec = "a = Analysis(\n    ['/src/hello.py', '/src/other.py'],\n)\npyz = PYZ(a.pure)\n";
        let result = SpecPatcher::new().patch_text(spec, &patch());
        assert!(matches!(result, Err(PackError::UnsupportedSpecFormat(_))));
    }

    #[test]
    fn test_crlf_preserved() {
        let spec = "a = Analysis(['hello.py'])\r\npyz = PYZ(a.pure)\r\n";
        let patched = SpecPatcher::new().patch_text(spec, &patch()).unwrap();
        assert!(patched.contains("# Patch end.\r\n\r\npyz = PYZ(a.pure)\r\n"));
    }

    #[test]
    fn test_literal_escaping() {
        assert_eq!(py_literal(r"C:\dist\it's.py"), r"'C:\\dist\\it\'s.py'");
    }

    #[test]
    fn test_patch_file_leaves_original() {
        let temp_dir = TempDir::new().unwrap();
        let spec = temp_dir.path().join("hello.spec");
        fs::write(&spec, SPEC).unwrap();

        let output = SpecPatcher::new().patch_file(&spec, &patch()).unwrap();
        assert_eq!(output, temp_dir.path().join("hello-patched.spec"));
        assert_eq!(fs::read_to_string(&spec).unwrap(), SPEC);
        assert!(fs::read_to_string(&output)
            .unwrap()
            .contains("# Patched by aurora-packer"));
    }

    struct FirstLineAnchor;

    impl SpecAnchor for FirstLineAnchor {
        fn locate(&self, _lines: &[String]) -> PackResult<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_custom_anchor() {
        let patched = SpecPatcher::with_anchor(FirstLineAnchor)
            .patch_text("pyz = PYZ(a.pure)\n", &patch())
            .unwrap();
        assert!(patched.starts_with("\n# Patched by aurora-packer\n"));
    }

    #[test]
    fn test_patch_file_missing_spec() {
        let temp_dir = TempDir::new().unwrap();
        let result = SpecPatcher::new().patch_file(&temp_dir.path().join("nope.spec"), &patch());
        assert!(matches!(result, Err(PackError::FileNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_patch_file_unreadable_spec_keeps_io_error() {
        // a directory named like a spec fails to read with something other than NotFound
        let temp_dir = TempDir::new().unwrap();
        let spec = temp_dir.path().join("hello.spec");
        fs::create_dir(&spec).unwrap();

        let result = SpecPatcher::new().patch_file(&spec, &patch());
        assert!(matches!(result, Err(PackError::Io(_))));
    }
}

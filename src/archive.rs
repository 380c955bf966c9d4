//! Compiled-library archive rewriting
//!
//! Freezing tools such as py2exe and cx_Freeze ship pure modules inside a
//! zip (`library.zip`, `python311.zip`). The rewrite swaps the bytecode of
//! every module that has a protected counterpart while keeping the member
//! list, in order, exactly as the tool produced it.

use crate::bytecode::{is_python_source, SourceCompiler};
use crate::{PackError, PackResult};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// One member of a compiled-library archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Archive-relative path, `/` separated
    pub name: String,
    pub compression: CompressionMethod,
}

impl ArchiveMember {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Summary of a finished rewrite
#[derive(Debug, Clone)]
pub struct RewriteResult {
    pub archive: PathBuf,
    pub members: Vec<ArchiveMember>,
    /// Protected sources that were compiled into the staging tree
    pub compiled: usize,
}

/// Rewrites library archives using protected sources
pub struct ArchiveRewriter<'a> {
    compiler: &'a dyn SourceCompiler,
}

impl<'a> ArchiveRewriter<'a> {
    pub fn new(compiler: &'a dyn SourceCompiler) -> Self {
        Self { compiler }
    }

    /// Replace the members of `archive` with the compiled contents of
    /// `protected_dir`.
    ///
    /// `protected_dir` doubles as the staging area: the original members are
    /// extracted into it, then every source that was already there is
    /// compiled over the extracted bytecode. The archive is only replaced
    /// once the new one is fully written.
    pub fn rewrite(&self, archive: &Path, protected_dir: &Path) -> PackResult<RewriteResult> {
        tracing::info!("Update library {}", archive.display());

        let protected_files = list_files(protected_dir)?;
        let members = extract_members(archive, protected_dir)?;

        let sources: Vec<PathBuf> = protected_files
            .into_iter()
            .filter(|path| is_python_source(path))
            .collect();
        self.compiler.compile_in_place(&sources)?;

        write_archive(archive, protected_dir, &members)?;
        tracing::info!(
            "Rewrote {} members ({} protected sources compiled)",
            members.len(),
            sources.len()
        );

        Ok(RewriteResult {
            archive: archive.to_path_buf(),
            members,
            compiled: sources.len(),
        })
    }
}

/// Member list of `archive` in stored order
pub fn read_members(archive: &Path) -> PackResult<Vec<ArchiveMember>> {
    let mut zip = open_archive(archive)?;
    collect_members(&mut zip, archive)
}

fn open_archive(archive: &Path) -> PackResult<ZipArchive<BufReader<File>>> {
    let file = File::open(archive)
        .map_err(|e| PackError::ArchiveCorrupt(format!("{}: {}", archive.display(), e)))?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|e| PackError::ArchiveCorrupt(format!("{}: {}", archive.display(), e)))
}

fn collect_members(
    zip: &mut ZipArchive<BufReader<File>>,
    archive: &Path,
) -> PackResult<Vec<ArchiveMember>> {
    let mut members = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip
            .by_index_raw(i)
            .map_err(|e| PackError::ArchiveCorrupt(format!("{}: {}", archive.display(), e)))?;
        members.push(ArchiveMember {
            name: entry.name().to_string(),
            compression: entry.compression(),
        });
    }
    Ok(members)
}

fn extract_members(archive: &Path, dest: &Path) -> PackResult<Vec<ArchiveMember>> {
    let mut zip = open_archive(archive)?;
    let members = collect_members(&mut zip, archive)?;
    zip.extract(dest)
        .map_err(|e| PackError::ArchiveCorrupt(format!("{}: {}", archive.display(), e)))?;
    tracing::debug!("Extracted {} members to {}", members.len(), dest.display());
    Ok(members)
}

fn list_files(dir: &Path) -> PackResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn write_archive(archive: &Path, staging: &Path, members: &[ArchiveMember]) -> PackResult<()> {
    let parent = archive
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = tempfile::NamedTempFile::new_in(parent)?;

    let mut zip = ZipWriter::new(BufWriter::new(staged.reopen()?));
    for member in members {
        let options =
            SimpleFileOptions::default().compression_method(writable(member.compression));
        let to_zip_err = |e: zip::result::ZipError| {
            PackError::ArchiveCorrupt(format!("{}: {}", member.name, e))
        };
        if member.is_dir() {
            zip.add_directory(member.name.as_str(), options)
                .map_err(to_zip_err)?;
            continue;
        }
        let source = staging.join(&member.name);
        let mut input = File::open(&source)
            .map_err(|_| PackError::FileNotFound(source.display().to_string()))?;
        zip.start_file(member.name.as_str(), options)
            .map_err(to_zip_err)?;
        io::copy(&mut input, &mut zip)?;
    }
    let mut writer = zip
        .finish()
        .map_err(|e| PackError::ArchiveCorrupt(format!("{}: {}", archive.display(), e)))?;
    io::Write::flush(&mut writer)?;
    drop(writer);

    let permissions = fs::metadata(archive)?.permissions();
    staged.as_file().set_permissions(permissions)?;
    staged
        .persist(archive)
        .map_err(|e| PackError::Io(e.error))?;
    Ok(())
}

/// Methods the writer cannot produce fall back to deflate
fn writable(method: CompressionMethod) -> CompressionMethod {
    match method {
        CompressionMethod::Stored => CompressionMethod::Stored,
        _ => CompressionMethod::Deflated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    /// Writes `compiled:` followed by the source text, like a fake `py_compile`
    struct TaggingCompiler;

    impl SourceCompiler for TaggingCompiler {
        fn compile_in_place(&self, sources: &[PathBuf]) -> PackResult<()> {
            for source in sources {
                let text = fs::read(source)?;
                let mut out = b"compiled:".to_vec();
                out.extend(text);
                fs::write(crate::bytecode::compiled_path(source), out)?;
            }
            Ok(())
        }
    }

    struct FailingCompiler;

    impl SourceCompiler for FailingCompiler {
        fn compile_in_place(&self, _sources: &[PathBuf]) -> PackResult<()> {
            Err(PackError::CompileError("SyntaxError".to_string()))
        }
    }

    fn make_archive_with(path: &Path, members: &[(&str, &[u8], CompressionMethod)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data, method) in members {
            let options = SimpleFileOptions::default().compression_method(*method);
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn make_archive(path: &Path, members: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn read_member(path: &Path, name: &str) -> Vec<u8> {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut file = zip.by_name(name).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        data
    }

    fn names(members: &[ArchiveMember]) -> Vec<&str> {
        members.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_rewrite_substitutes_protected_bytecode() {
        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("lib.zip");
        make_archive(&lib, &[("a.pyc", b"old-a"), ("pkg/b.pyc", b"old-b")]);

        let protected = temp_dir.path().join("dist");
        fs::create_dir_all(protected.join("pkg")).unwrap();
        fs::write(protected.join("a.py"), "A").unwrap();
        fs::write(protected.join("pkg/b.py"), "B").unwrap();

        let result = ArchiveRewriter::new(&TaggingCompiler)
            .rewrite(&lib, &protected)
            .unwrap();

        assert_eq!(result.compiled, 2);
        assert_eq!(names(&read_members(&lib).unwrap()), ["a.pyc", "pkg/b.pyc"]);
        assert_eq!(read_member(&lib, "a.pyc"), b"compiled:A");
        assert_eq!(read_member(&lib, "pkg/b.pyc"), b"compiled:B");
    }

    #[test]
    fn test_rewrite_keeps_unprotected_members_and_order() {
        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("library.zip");
        make_archive(
            &lib,
            &[
                ("zeta.pyc", b"z"),
                ("encodings/utf_8.pyc", b"utf8"),
                ("alpha.pyc", b"old-alpha"),
            ],
        );

        let protected = temp_dir.path().join("dist");
        fs::create_dir_all(&protected).unwrap();
        fs::write(protected.join("alpha.py"), "new").unwrap();
        fs::write(protected.join("license.lic"), "lic").unwrap();

        ArchiveRewriter::new(&TaggingCompiler)
            .rewrite(&lib, &protected)
            .unwrap();

        assert_eq!(
            names(&read_members(&lib).unwrap()),
            ["zeta.pyc", "encodings/utf_8.pyc", "alpha.pyc"]
        );
        assert_eq!(read_member(&lib, "encodings/utf_8.pyc"), b"utf8");
        assert_eq!(read_member(&lib, "alpha.pyc"), b"compiled:new");
    }

    #[test]
    fn test_corrupt_archive() {
        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("library.zip");
        fs::write(&lib, "not a zip").unwrap();

        let result = ArchiveRewriter::new(&TaggingCompiler).rewrite(&lib, temp_dir.path());
        assert!(matches!(result, Err(PackError::ArchiveCorrupt(_))));

        let missing = temp_dir.path().join("missing.zip");
        assert!(matches!(
            read_members(&missing),
            Err(PackError::ArchiveCorrupt(_))
        ));
    }

    #[test]
    fn test_compile_failure_leaves_archive_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("library.zip");
        make_archive(&lib, &[("a.pyc", b"old-a")]);
        let before = fs::read(&lib).unwrap();

        let protected = temp_dir.path().join("dist");
        fs::create_dir_all(&protected).unwrap();
        fs::write(protected.join("a.py"), "broken(").unwrap();

        let result = ArchiveRewriter::new(&FailingCompiler).rewrite(&lib, &protected);
        assert!(matches!(result, Err(PackError::CompileError(_))));
        assert_eq!(fs::read(&lib).unwrap(), before);
    }

    #[test]
    fn test_rewrite_keeps_directories_and_compression() {
        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("library.zip");
        make_archive_with(
            &lib,
            &[
                ("pkg/", b"", CompressionMethod::Stored),
                ("pkg/mod.pyc", b"old-mod", CompressionMethod::Stored),
                ("site.pyc", b"site", CompressionMethod::Deflated),
            ],
        );

        let protected = temp_dir.path().join("dist");
        fs::create_dir_all(protected.join("pkg")).unwrap();
        fs::write(protected.join("pkg/mod.py"), "M").unwrap();

        let result = ArchiveRewriter::new(&TaggingCompiler)
            .rewrite(&lib, &protected)
            .unwrap();
        assert_eq!(names(&result.members), ["pkg/", "pkg/mod.pyc", "site.pyc"]);

        let members = read_members(&lib).unwrap();
        assert_eq!(names(&members), ["pkg/", "pkg/mod.pyc", "site.pyc"]);
        assert!(members[0].is_dir());
        assert_eq!(members[1].compression, CompressionMethod::Stored);
        assert_eq!(members[2].compression, CompressionMethod::Deflated);
        assert_eq!(read_member(&lib, "pkg/mod.pyc"), b"compiled:M");
        assert_eq!(read_member(&lib, "site.pyc"), b"site");
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_archive_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let lib = temp_dir.path().join("library.zip");
        make_archive(&lib, &[("a.pyc", b"old-a")]);
        fs::set_permissions(&lib, fs::Permissions::from_mode(0o644)).unwrap();

        let protected = temp_dir.path().join("dist");
        fs::create_dir_all(&protected).unwrap();
        fs::write(protected.join("a.py"), "A").unwrap();

        ArchiveRewriter::new(&TaggingCompiler)
            .rewrite(&lib, &protected)
            .unwrap();

        let mode = fs::metadata(&lib).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert_eq!(read_member(&lib, "a.pyc"), b"compiled:A");
    }
}

use std::fs;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use zip::{CompressionMethod, ZipWriter};

use crate::docx::package::{write_entries, ZipEntry, ZipPackage};
use crate::error::{io_context, PatchError, Result};

#[derive(Clone, Debug)]
pub struct StagingOptions {
    /// Parent directory for working trees; the system temp dir when unset.
    pub temp_dir: Option<PathBuf>,
    pub prefix: String,
    pub compression: CompressionMethod,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            temp_dir: None,
            prefix: "docx-patcher-".to_string(),
            compression: CompressionMethod::Deflated,
        }
    }
}

/// A package unpacked into an exclusively owned working directory.
///
/// Every edit goes straight to the files of the working tree; [`PackageSession::save`] zips the
/// tree back up. The directory is removed by [`PackageSession::close`] or when the session is
/// dropped, whichever comes first.
pub struct PackageSession {
    source: Option<PathBuf>,
    staging: Option<TempDir>,
    compression: CompressionMethod,
}

impl PackageSession {
    pub fn open(path: &Path, options: &StagingOptions) -> Result<Self> {
        if !path.is_file() {
            return Err(PatchError::not_found("package", path.display().to_string()));
        }
        let pkg = ZipPackage::read(path)?;
        let session = Self::with_staging(Some(path.to_path_buf()), options)?;
        let root = session.root()?;
        for ent in &pkg.entries {
            let rel = safe_relative(&ent.name)
                .ok_or_else(|| PatchError::extraction(path, format!("unsafe entry name: {}", ent.name)))?;
            let dest = root.join(rel);
            if ent.is_dir || ent.name.ends_with('/') {
                fs::create_dir_all(&dest)
                    .map_err(|e| PatchError::extraction(path, format!("{}: {e}", ent.name)))?;
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PatchError::extraction(path, format!("{}: {e}", ent.name)))?;
            }
            fs::write(&dest, &ent.data)
                .map_err(|e| PatchError::extraction(path, format!("{}: {e}", ent.name)))?;
        }
        log::debug!(
            "staged {} entries of {} in {}",
            pkg.entries.len(),
            path.display(),
            root.display()
        );
        Ok(session)
    }

    /// A session over a minimal, valid document with an empty body.
    pub fn create_blank(options: &StagingOptions) -> Result<Self> {
        let session = Self::with_staging(None, options)?;
        session.write_part("[Content_Types].xml", BLANK_CONTENT_TYPES.as_bytes())?;
        session.write_part("_rels/.rels", BLANK_PACKAGE_RELS.as_bytes())?;
        session.write_part("word/document.xml", BLANK_DOCUMENT.as_bytes())?;
        session.write_part("word/_rels/document.xml.rels", BLANK_DOCUMENT_RELS.as_bytes())?;
        Ok(session)
    }

    fn with_staging(source: Option<PathBuf>, options: &StagingOptions) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&options.prefix);
        let dir = match options.temp_dir.as_ref() {
            Some(parent) => {
                fs::create_dir_all(parent)
                    .map_err(io_context(format!("create temp root: {}", parent.display())))?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(io_context("create staging directory"))?;
        Ok(Self {
            source,
            staging: Some(dir),
            compression: options.compression,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn root(&self) -> Result<&Path> {
        self.staging
            .as_ref()
            .map(TempDir::path)
            .ok_or(PatchError::SessionClosed)
    }

    /// Filesystem path of a part name such as `word/charts/chart1.xml`.
    pub fn part_path(&self, part: &str) -> Result<PathBuf> {
        let rel = safe_relative(part)
            .ok_or_else(|| PatchError::Validation(format!("invalid part name: {part}")))?;
        Ok(self.root()?.join(rel))
    }

    pub fn part_exists(&self, part: &str) -> Result<bool> {
        Ok(self.part_path(part)?.is_file())
    }

    pub fn read_part(&self, part: &str) -> Result<Vec<u8>> {
        let path = self.part_path(part)?;
        if !path.is_file() {
            return Err(PatchError::not_found("part", part));
        }
        fs::read(&path).map_err(io_context(format!("read part: {part}")))
    }

    pub fn read_part_string(&self, part: &str) -> Result<String> {
        let bytes = self.read_part(part)?;
        String::from_utf8(bytes).map_err(|_| PatchError::structural(part, "part is not utf-8"))
    }

    pub fn write_part(&self, part: &str, data: &[u8]) -> Result<()> {
        let path = self.part_path(part)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(io_context(format!("create dir for part: {part}")))?;
        }
        fs::write(&path, data).map_err(io_context(format!("write part: {part}")))
    }

    pub fn remove_part(&self, part: &str) -> Result<()> {
        let path = self.part_path(part)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_context(format!("remove part: {part}"))(e)),
        }
    }

    /// Sorted names of the files directly inside a package directory (`word/embeddings`).
    pub fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.part_path(dir)?;
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for ent in fs::read_dir(&path).map_err(io_context(format!("list dir: {dir}")))? {
            let ent = ent.map_err(io_context(format!("list dir: {dir}")))?;
            if ent.path().is_file() {
                names.push(ent.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// All part names of the working tree, sorted.
    pub fn part_names(&self) -> Result<Vec<String>> {
        let root = self.root()?;
        let mut names = Vec::new();
        collect_files(root, root, &mut names)?;
        names.sort();
        Ok(names)
    }

    /// Zips the working tree into `out_path`. The tree is left as is, so saving twice is fine
    /// and produces identical archives.
    pub fn save(&self, out_path: &Path) -> Result<()> {
        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(io_context(format!("create output dir: {}", parent.display())))?;
        }
        let mut entries = Vec::new();
        for name in self.part_names()? {
            let data = self.read_part(&name)?;
            let mut ent = ZipEntry::file(name, data);
            ent.compression = self.compression;
            entries.push(ent);
        }

        let label = out_path.display().to_string();
        let f = File::create(out_path).map_err(io_context(format!("create output: {label}")))?;
        let mut zout = ZipWriter::new(f);
        write_entries(&mut zout, &entries).map_err(|e| PatchError::packaging(&label, e))?;
        zout.finish()
            .map_err(|e| PatchError::packaging(&label, format!("finish zip: {e}")))?;
        log::debug!("saved {} parts to {label}", entries.len());
        Ok(())
    }

    /// Removes the working directory. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.staging.take() {
            let shown = dir.path().display().to_string();
            dir.close()
                .map_err(io_context(format!("remove staging directory: {shown}")))?;
        }
        Ok(())
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for ent in fs::read_dir(dir).map_err(io_context(format!("walk: {}", dir.display())))? {
        let ent = ent.map_err(io_context(format!("walk: {}", dir.display())))?;
        let path = ent.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(name);
        }
    }
    Ok(())
}

/// Relative filesystem path for a zip entry or part name, rejecting names that would leave the
/// working tree.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('\\') {
        return None;
    }
    let rel = Path::new(trimmed);
    rel.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| rel.to_path_buf())
}

const BLANK_CONTENT_TYPES: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
    r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
    r#"<Default Extension="xml" ContentType="application/xml"/>"#,
    r#"<Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>"#,
    r#"</Types>"#
);

const BLANK_PACKAGE_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>"#,
    r#"</Relationships>"#
);

const BLANK_DOCUMENT: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" "#,
    r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
    r#"<w:body><w:p/>"#,
    r#"<w:sectPr><w:pgSz w:w="11906" w:h="16838"/>"#,
    r#"<w:pgMar w:top="1440" w:right="1440" w:bottom="1440" w:left="1440" w:header="708" w:footer="708" w:gutter="0"/>"#,
    r#"</w:sectPr></w:body></w:document>"#
);

const BLANK_DOCUMENT_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"/>"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_package_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = PackageSession::open(&dir.path().join("missing.docx"), &StagingOptions::default())
            .err()
            .expect("error");
        assert!(matches!(err, PatchError::NotFound { what: "package", .. }));
    }

    #[test]
    fn close_is_idempotent_and_removes_tree() {
        let mut session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        let root = session.root().expect("root").to_path_buf();
        assert!(root.join("word/document.xml").is_file());
        session.close().expect("close");
        assert!(!root.exists());
        session.close().expect("close again");
        assert!(matches!(session.read_part("word/document.xml"), Err(PatchError::SessionClosed)));
    }

    #[test]
    fn save_is_repeatable_and_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        let first = dir.path().join("nested/out/a.docx");
        let second = dir.path().join("b.docx");
        session.save(&first).expect("save");
        session.save(&second).expect("save again");
        assert_eq!(
            fs::read(&first).expect("read a"),
            fs::read(&second).expect("read b")
        );

        let reopened = PackageSession::open(&first, &StagingOptions::default()).expect("reopen");
        assert_eq!(
            reopened.part_names().expect("names"),
            vec![
                "[Content_Types].xml",
                "_rels/.rels",
                "word/_rels/document.xml.rels",
                "word/document.xml",
            ]
        );
        assert_eq!(reopened.source(), Some(first.as_path()));
    }

    #[test]
    fn corrupt_package_is_an_extraction_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.docx");
        fs::write(&path, b"PK\x03\x04 definitely not a zip").expect("write");
        let err = PackageSession::open(&path, &StagingOptions::default())
            .err()
            .expect("error");
        assert!(matches!(err, PatchError::Extraction { .. }));
    }

    #[test]
    fn part_names_cannot_escape_the_tree() {
        assert!(safe_relative("../evil.xml").is_none());
        assert!(safe_relative("word/../../evil.xml").is_none());
        assert!(safe_relative("word\\evil.xml").is_none());
        assert_eq!(
            safe_relative("/word/document.xml"),
            Some(PathBuf::from("word/document.xml"))
        );
    }

    #[test]
    fn list_dir_is_sorted_and_tolerates_missing_dirs() {
        let session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        assert!(session.list_dir("word/embeddings").expect("list").is_empty());
        session.write_part("word/embeddings/b.xlsx", b"b").expect("write");
        session.write_part("word/embeddings/a.xlsx", b"a").expect("write");
        assert_eq!(
            session.list_dir("word/embeddings").expect("list"),
            vec!["a.xlsx", "b.xlsx"]
        );
    }
}

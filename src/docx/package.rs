use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{io_context, PatchError, Result};

/// An archive held entirely in memory. Used for the workbooks embedded in a document, which
/// are small and edited as a unit.
#[derive(Clone)]
pub struct ZipPackage {
    pub entries: Vec<ZipEntry>,
}

#[derive(Clone)]
pub struct ZipEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

impl ZipEntry {
    pub fn file(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            compression: CompressionMethod::Deflated,
            last_modified: zip::DateTime::default(),
            unix_mode: None,
            is_dir: false,
        }
    }
}

impl ZipPackage {
    pub fn read(path: &Path) -> Result<Self> {
        let f = File::open(path).map_err(io_context(format!("open package: {}", path.display())))?;
        Self::from_reader(f).map_err(|e| PatchError::extraction(path, e))
    }

    pub fn from_bytes(label: &str, bytes: &[u8]) -> Result<Self> {
        Self::from_reader(Cursor::new(bytes)).map_err(|e| PatchError::packaging(label, e))
    }

    fn from_reader<R: Read + Seek>(reader: R) -> std::result::Result<Self, String> {
        let mut zip = ZipArchive::new(reader).map_err(|e| format!("read zip: {e}"))?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(|e| format!("zip entry {i}: {e}"))?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| format!("read zip entry {}: {e}", file.name()))?;
            entries.push(ZipEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self { entries })
    }

    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.entries.iter().find(|e| !e.is_dir && e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Replaces the data of `name`, keeping its position and options, or appends a new entry.
    pub fn set_entry(&mut self, name: &str, data: Vec<u8>) {
        if let Some(ent) = self.entries.iter_mut().find(|e| !e.is_dir && e.name == name) {
            ent.data = data;
            return;
        }
        self.entries.push(ZipEntry::file(name, data));
    }

    pub fn to_bytes(&self, label: &str) -> Result<Vec<u8>> {
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        write_entries(&mut zout, &self.entries).map_err(|e| PatchError::packaging(label, e))?;
        let cursor = zout
            .finish()
            .map_err(|e| PatchError::packaging(label, format!("finish zip: {e}")))?;
        Ok(cursor.into_inner())
    }
}

pub(crate) fn write_entries<W: Write + Seek>(
    zout: &mut ZipWriter<W>,
    entries: &[ZipEntry],
) -> std::result::Result<(), String> {
    for ent in entries {
        let mut opts = SimpleFileOptions::default()
            .compression_method(ent.compression)
            .last_modified_time(ent.last_modified);
        if let Some(mode) = ent.unix_mode {
            opts = opts.unix_permissions(mode);
        }
        if ent.is_dir || ent.name.ends_with('/') {
            zout.add_directory(ent.name.as_str(), opts)
                .map_err(|e| format!("add zip dir {}: {e}", ent.name))?;
        } else {
            zout.start_file(ent.name.as_str(), opts)
                .map_err(|e| format!("start zip file {}: {e}", ent.name))?;
            zout.write_all(&ent.data)
                .map_err(|e| format!("write zip file {}: {e}", ent.name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_entry_replaces_in_place_and_round_trips() {
        let mut pkg = ZipPackage {
            entries: vec![
                ZipEntry::file("[Content_Types].xml", b"<Types/>".to_vec()),
                ZipEntry::file("xl/workbook.xml", b"<workbook/>".to_vec()),
            ],
        };
        pkg.set_entry("xl/workbook.xml", b"<workbook>1</workbook>".to_vec());
        pkg.set_entry("xl/sharedStrings.xml", b"<sst/>".to_vec());
        let bytes = pkg.to_bytes("test.xlsx").expect("serialize");

        let back = ZipPackage::from_bytes("test.xlsx", &bytes).expect("parse");
        let names: Vec<&str> = back.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["[Content_Types].xml", "xl/workbook.xml", "xl/sharedStrings.xml"]
        );
        assert_eq!(
            back.entry("xl/workbook.xml").map(|e| e.data.as_slice()),
            Some(&b"<workbook>1</workbook>"[..])
        );
    }

    #[test]
    fn garbage_is_a_packaging_error() {
        let err = ZipPackage::from_bytes("nested.xlsx", b"not a zip").err().expect("error");
        assert!(matches!(err, PatchError::Packaging { .. }));
    }
}

//! Pulls the ".shp" and ".dbf" members out of a zip archive.
//!
//! An archive named `towns.zip` must hold `towns.shp` and `towns.dbf`.

use std::fs;
use std::io;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;
use zip::result::ZipError;
use super::shapefile::ShapefileError;

/// Anything that can hand over a named member as bytes.
pub trait ArchiveReader {
    /// Returns the member's bytes, or `ShapefileError::MissingMember`.
    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ShapefileError>;
}

impl<R: io::Read + io::Seek> ArchiveReader for ZipArchive<R> {
    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ShapefileError> {
        let mut file = match self.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(ShapefileError::MissingMember(name.to_string()));
            }
            Err(err) => {
                return Err(ShapefileError::ZipError(err));
            }
        };

        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// The two member buffers of one shapefile.
#[derive(Debug,Clone)]
pub struct ShapefileBuffers {
    pub shp: Vec<u8>,
    pub dbf: Vec<u8>,
}

/// Reads `{base_name}.shp` and `{base_name}.dbf`.
pub fn read_members<A: ArchiveReader>(archive: &mut A, base_name: &str) -> Result<ShapefileBuffers, ShapefileError> {
    let shp = archive.read_member(&format!("{}.shp", base_name))?;
    let dbf = archive.read_member(&format!("{}.dbf", base_name))?;

    debug!("Read {}.shp ({} bytes) and {}.dbf ({} bytes)", base_name, shp.len(), base_name, dbf.len());

    Ok(ShapefileBuffers {
        shp: shp,
        dbf: dbf,
    })
}

/// The archive's file name without its extension: `data/towns.zip` gives
/// `towns`.
pub fn base_name(path: &Path) -> Result<String, ShapefileError> {
    match path.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) => Ok(stem.to_string()),
        None => Err(ShapefileError::IOError(io::Error::new(io::ErrorKind::InvalidInput, format!("{}: cannot derive member names from this path", path.display())))),
    }
}

/// Opens the zip archive at `path` and reads the members named after it.
pub fn open(path: &Path) -> Result<ShapefileBuffers, ShapefileError> {
    let base_name = base_name(path)?;
    let f = fs::File::open(path)?;
    let mut archive = ZipArchive::new(io::BufReader::new(f))?;
    read_members(&mut archive, &base_name)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use std::path::Path;
    use zip::ZipArchive;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;
    use super::*;

    fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for &(name, bytes) in members {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn base_name_strips_directory_and_extension() {
        assert_eq!("towns", base_name(Path::new("data/towns.zip")).unwrap());
    }

    #[test]
    fn read_both_members() {
        let bytes = zip_bytes(&[ ("towns.shp", &b"shp bytes"[..]), ("towns.dbf", &b"dbf bytes"[..]), ("towns.prj", &b"ignored"[..]) ]);
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let buffers = read_members(&mut archive, "towns").unwrap();
        assert_eq!(b"shp bytes".to_vec(), buffers.shp);
        assert_eq!(b"dbf bytes".to_vec(), buffers.dbf);
    }

    #[test]
    fn missing_dbf() {
        let bytes = zip_bytes(&[ ("towns.shp", &b"shp bytes"[..]) ]);
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        match read_members(&mut archive, "towns") {
            Err(ShapefileError::MissingMember(ref name)) => assert_eq!("towns.dbf", &name[..]),
            other => panic!("expected MissingMember, got {:?}", other),
        }
    }

    struct MapArchive(HashMap<String, Vec<u8>>);

    impl ArchiveReader for MapArchive {
        fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ShapefileError> {
            self.0.get(name).cloned().ok_or_else(|| ShapefileError::MissingMember(name.to_string()))
        }
    }

    #[test]
    fn any_archive_reader() {
        let mut members = HashMap::new();
        members.insert("a.shp".to_string(), vec![ 1 ]);
        members.insert("a.dbf".to_string(), vec![ 2 ]);
        let buffers = read_members(&mut MapArchive(members), "a").unwrap();
        assert_eq!(vec![ 1 ], buffers.shp);
        assert_eq!(vec![ 2 ], buffers.dbf);
    }
}

//! Reads ".shp" and accompanying ".dbf" files, usually out of a ".zip".
//!
//! There are two pieces of information ".shp" and ".dbf" files _don't_
//! contain:
//!
//! * The _projection_ isn't specified. Sometimes there's a ".prj" file that
//!   contains that information, but this library ignores it: callers pass a
//!   coordinate translator, such as `geo::twd97_to_wgs84`.
//! * The _text encoding_ of ".dbf" character fields. Callers pick one; Taiwan
//!   government datasets tend to be Big5 or UTF-8.
//!
//! Records are joined by position: ".dbf" row `i` describes ".shp" record
//! `i`. Only Polygon records can be joined.
//!
//! # Examples
//!
//! Read a zip archive into your own type:
//!
//! ```no_run
//! use std::path::Path;
//! use twshape::read::shapefile;
//! use twshape::read::shapefile::{Area, AreaInfo, DbfRecord, ShapefileError};
//!
//! struct Town {
//!     name: String,
//!     areas: Vec<Area>,
//! }
//!
//! impl AreaInfo for Town {
//!     fn from_record(record: DbfRecord) -> Result<Town, ShapefileError> {
//!         let name = record.get_str("TOWNNAME").unwrap_or("").to_string();
//!         Ok(Town { name: name, areas: vec![] })
//!     }
//!
//!     fn set_areas(&mut self, areas: Vec<Area>) {
//!         self.areas = areas;
//!     }
//! }
//!
//! let towns: Vec<Town> = shapefile::read_zip_utf8(Path::new("TOWN_MOI.zip")).unwrap();
//! for town in towns {
//!     println!("{}: {} rings", town.name, town.areas.len());
//! }
//! ```
//!
//! Dump ".shp" records, whatever their shape type:
//!
//! ```no_run
//! use std::path::Path;
//! use twshape::read::shapefile::shp;
//!
//! let reader = shp::open(Path::new("towns.shp")).unwrap();
//! for record in reader {
//!     // record is a Result<ShpRecord, ShpError>
//!     println!("{:?}", record.unwrap());
//! }
//! ```

use std::path::Path;
use encoding;
use geo::twd97_to_wgs84;

pub mod archive;
pub mod dbf;
pub mod shp;
pub mod shapefile;

pub use self::archive::{ArchiveReader, ShapefileBuffers};
pub use self::dbf::{DbfField, DbfReader, DbfRecord, DbfValue};
pub use self::shp::{ShpBoundingBox, ShpPoint, ShpPolygon, ShpReader, ShpRecord, ShpShape};
pub use self::shapefile::{Area, AreaInfo, ShapefileError, ShapefileRecord};
pub use self::shapefile::{read_dbf, read_files, read_records, read_shp, read_zip};

/// Reads a TWD97 shapefile archive with UTF-8 attributes, converting
/// coordinates to WGS84.
pub fn read_zip_utf8<T: AreaInfo>(path: &Path) -> Result<Vec<T>, ShapefileError> {
    read_zip(path, twd97_to_wgs84, encoding::all::UTF_8)
}

/// Reads a TWD97 shapefile archive with Big5 attributes, converting
/// coordinates to WGS84.
pub fn read_zip_big5<T: AreaInfo>(path: &Path) -> Result<Vec<T>, ShapefileError> {
    read_zip(path, twd97_to_wgs84, encoding::all::BIG5_2003)
}

/// Reads a TWD97 shapefile archive with Windows-1252 attributes, converting
/// coordinates to WGS84.
pub fn read_zip_windows1252<T: AreaInfo>(path: &Path) -> Result<Vec<T>, ShapefileError> {
    read_zip(path, twd97_to_wgs84, encoding::all::WINDOWS_1252)
}

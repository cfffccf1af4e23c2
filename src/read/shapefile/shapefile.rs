use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use encoding::EncodingRef;
use zip::result::ZipError;
use super::archive;
use super::dbf;
use super::shp;

#[derive(Debug)]
pub enum ShapefileError {
    ShpError(shp::ShpError),
    DbfError(dbf::DbfError),
    ZipError(ZipError),
    IOError(io::Error),
    MissingMember(String),
    JoinError(String),
    ShapeTypeError(String),
    AttributeError(String),
}

impl error::Error for ShapefileError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ShapefileError::ShpError(ref err) => Some(err),
            ShapefileError::DbfError(ref err) => Some(err),
            ShapefileError::ZipError(ref err) => Some(err),
            ShapefileError::IOError(ref err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ShapefileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ShapefileError::ShpError(ref err) => err.fmt(f),
            ShapefileError::DbfError(ref err) => err.fmt(f),
            ShapefileError::ZipError(ref err) => err.fmt(f),
            ShapefileError::IOError(ref err) => err.fmt(f),
            ShapefileError::MissingMember(ref name) => write!(f, "Archive has no member named {}", name),
            ShapefileError::JoinError(ref description) => write!(f, "Parse error: {}", description),
            ShapefileError::ShapeTypeError(ref description) => write!(f, "Unexpected shape: {}", description),
            ShapefileError::AttributeError(ref description) => write!(f, "Invalid attributes: {}", description),
        }
    }
}

impl From<shp::ShpError> for ShapefileError {
    fn from(err: shp::ShpError) -> ShapefileError {
        ShapefileError::ShpError(err)
    }
}

impl From<dbf::DbfError> for ShapefileError {
    fn from(err: dbf::DbfError) -> ShapefileError {
        ShapefileError::DbfError(err)
    }
}

impl From<ZipError> for ShapefileError {
    fn from(err: ZipError) -> ShapefileError {
        ShapefileError::ZipError(err)
    }
}

impl From<io::Error> for ShapefileError {
    fn from(err: io::Error) -> ShapefileError {
        ShapefileError::IOError(err)
    }
}

/// One polygon ring after coordinate translation.
///
/// `bounding_box` is the polygon's, untranslated.
#[derive(Debug,Clone,PartialEq)]
pub struct Area {
    pub points: Box<[shp::ShpPoint]>,
    pub bounding_box: shp::ShpBoundingBox,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut r = write!(f, "[");
        for (i, &point) in self.points.iter().enumerate() {
            if i > 0 {
                r = r.and_then(|_| write!(f, ","));
            }
            r = r.and_then(|_| write!(f, "{}", point));
        }
        r.and_then(|_| write!(f, "]"))
    }
}

/// A result type `read_records()` can build: one per ".dbf" row, plus that
/// row's polygon rings.
pub trait AreaInfo: Sized {
    /// Builds a result from its attributes.
    fn from_record(record: dbf::DbfRecord) -> Result<Self, ShapefileError>;

    /// Takes the rings of the matching polygon, in part order.
    fn set_areas(&mut self, areas: Vec<Area>);
}

/// Attributes and rings, with no interpretation.
#[derive(Debug,Clone,PartialEq)]
pub struct ShapefileRecord {
    pub data: dbf::DbfRecord,
    pub areas: Vec<Area>,
}

impl AreaInfo for ShapefileRecord {
    fn from_record(record: dbf::DbfRecord) -> Result<ShapefileRecord, ShapefileError> {
        Ok(ShapefileRecord {
            data: record,
            areas: vec![],
        })
    }

    fn set_areas(&mut self, areas: Vec<Area>) {
        self.areas = areas;
    }
}

impl fmt::Display for ShapefileRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Record(")?;
        for (i, (name, value)) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "; {} areas)", self.areas.len())
    }
}

/// Translates each ring of `polygon` into an `Area`.
pub fn polygon_areas<F>(polygon: &shp::ShpPolygon, translator: &F) -> Result<Vec<Area>, ShapefileError>
    where F: Fn(f64, f64) -> (f64, f64)
{
    let rings = polygon.rings()?;

    Ok(rings.into_iter().map(|ring| {
        let points: Vec<shp::ShpPoint> = ring.iter()
            .map(|p| {
                let (x, y) = translator(p.0, p.1);
                shp::ShpPoint(x, y)
            })
            .collect();

        Area {
            points: points.into_boxed_slice(),
            bounding_box: polygon.bounding_box,
        }
    }).collect())
}

/// Reads every ".dbf" row, in order. Any bad row fails the whole read.
pub fn read_dbf<R: io::Read + io::Seek>(r: R, encoding: EncodingRef) -> Result<Vec<dbf::DbfRecord>, dbf::DbfError> {
    let reader = dbf::DbfReader::new(r, encoding)?;

    (0 .. reader.len()).map(|i| reader.read(i)).collect()
}

/// Reads every ".shp" record, in order, as translated polygon rings.
///
/// Returns `ShapeTypeError` on the first record that isn't a Polygon.
pub fn read_shp<R, F>(r: R, size: u64, translator: F) -> Result<Vec<Vec<Area>>, ShapefileError>
    where R: io::Read + io::Seek, F: Fn(f64, f64) -> (f64, f64)
{
    let reader = shp::ShpReader::new(r, size)?;
    let mut polygons = Vec::new();

    for record_result in reader {
        let record = record_result?;

        match record.shape.as_polygon() {
            Some(polygon) => polygons.push(polygon_areas(polygon, &translator)?),
            None => {
                return Err(ShapefileError::ShapeTypeError(format!("Record number {} is a {:?}, expected Polygon", record.record_number, record.shape.shape_type())));
            }
        }
    }

    Ok(polygons)
}

/// Decodes a ".shp" and ".dbf" pair and joins them by position.
///
/// Row `i` of the ".dbf" builds result `i` (via `AreaInfo::from_record()`),
/// which receives the translated rings of polygon `i`. The two files must hold
/// the same number of records. Any error fails the whole read.
///
/// # Example
///
/// ```no_run
/// # extern crate encoding;
/// # extern crate twshape;
/// # fn main() {
/// use std::fs;
/// use twshape::geo::twd97_to_wgs84;
/// use twshape::read::shapefile::{read_records, ShapefileRecord};
///
/// let shp = fs::read("towns.shp").unwrap();
/// let dbf = fs::read("towns.dbf").unwrap();
/// let records: Vec<ShapefileRecord> = read_records(&shp, &dbf, twd97_to_wgs84, encoding::all::BIG5_2003).unwrap();
/// # }
/// ```
pub fn read_records<T, F>(shp_bytes: &[u8], dbf_bytes: &[u8], translator: F, encoding: EncodingRef) -> Result<Vec<T>, ShapefileError>
    where T: AreaInfo, F: Fn(f64, f64) -> (f64, f64)
{
    let dbf_reader = dbf::DbfReader::new(Cursor::new(dbf_bytes), encoding)?;
    let mut results = Vec::new();
    for i in 0 .. dbf_reader.len() {
        let record = dbf_reader.read(i)?;
        results.push(T::from_record(record)?);
    }

    let polygons = read_shp(Cursor::new(shp_bytes), shp_bytes.len() as u64, translator)?;

    if polygons.len() != results.len() {
        return Err(ShapefileError::JoinError(format!("'.shp' file has {} records, but '.dbf' file has {}", polygons.len(), results.len())));
    }

    for (result, areas) in results.iter_mut().zip(polygons.into_iter()) {
        result.set_areas(areas);
    }

    info!("Read {} shapefile records", results.len());

    Ok(results)
}

/// Reads `{name}.shp` and `{name}.dbf` out of the zip archive `{name}.zip`.
pub fn read_zip<T, F>(path: &Path, translator: F, encoding: EncodingRef) -> Result<Vec<T>, ShapefileError>
    where T: AreaInfo, F: Fn(f64, f64) -> (f64, f64)
{
    info!("Reading shapefile archive {}", path.display());
    let buffers = archive::open(path)?;
    read_records(&buffers.shp, &buffers.dbf, translator, encoding)
}

/// Reads a ".shp" file and the ".dbf" file next to it.
pub fn read_files<T, F>(shp_path: &Path, translator: F, encoding: EncodingRef) -> Result<Vec<T>, ShapefileError>
    where T: AreaInfo, F: Fn(f64, f64) -> (f64, f64)
{
    let mut dbf_path = PathBuf::from(shp_path);
    dbf_path.set_extension("dbf");

    info!("Reading shapefile {}", shp_path.display());
    let shp_bytes = fs::read(shp_path)?;
    let dbf_bytes = fs::read(&dbf_path)?;
    read_records(&shp_bytes, &dbf_bytes, translator, encoding)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;
    use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
    use encoding;
    use read::shapefile::dbf::{DbfRecord, DbfValue};
    use read::shapefile::shp::{ShpBoundingBox, ShpPoint, ShpPolygon};
    use super::*;

    fn identity(x: f64, y: f64) -> (f64, f64) {
        (x, y)
    }

    fn shp(shape_type: u32, polygons: &[&[(f64, f64)]]) -> Vec<u8> {
        let mut buf = vec![];
        buf.write_u32::<BigEndian>(9994).unwrap();
        buf.extend_from_slice(&[ 0u8; 24 ]);
        buf.write_u32::<LittleEndian>(1000).unwrap();
        buf.write_u32::<LittleEndian>(shape_type).unwrap();
        buf.extend_from_slice(&[ 0u8; 64 ]);

        for (i, points) in polygons.iter().enumerate() {
            let mut content = vec![];
            content.write_u32::<LittleEndian>(shape_type).unwrap();
            for &v in [ 0., 0., 9., 9. ].iter() {
                content.write_f64::<LittleEndian>(v).unwrap();
            }
            content.write_i32::<LittleEndian>(1).unwrap();
            content.write_i32::<LittleEndian>(points.len() as i32).unwrap();
            content.write_u32::<LittleEndian>(0).unwrap();
            for &(x, y) in points.iter() {
                content.write_f64::<LittleEndian>(x).unwrap();
                content.write_f64::<LittleEndian>(y).unwrap();
            }

            buf.write_u32::<BigEndian>(i as u32 + 1).unwrap();
            buf.write_u32::<BigEndian>((content.len() / 2) as u32).unwrap();
            buf.extend_from_slice(&content);
        }

        let n_words = (buf.len() / 2) as u32;
        BigEndian::write_u32(&mut buf[24..28], n_words);
        buf
    }

    fn dbf(names: &[&str]) -> Vec<u8> {
        let mut buf = vec![ 3u8, 118, 1, 1 ];
        buf.write_u32::<LittleEndian>(names.len() as u32).unwrap();
        buf.write_u16::<LittleEndian>(65).unwrap();
        buf.write_u16::<LittleEndian>(5).unwrap();
        buf.extend_from_slice(&[ 0u8; 20 ]);
        buf.extend_from_slice(b"NAME\0\0\0\0\0\0\0C\0\0\0\0\x04\0");
        buf.extend_from_slice(&[ 0u8; 14 ]);
        buf.push(0x0d);
        for name in names {
            buf.push(b' ');
            buf.extend_from_slice(format!("{:4}", name).as_bytes());
        }
        buf
    }

    const SQUARE: &'static [(f64, f64)] = &[ (0., 0.), (0., 1.), (1., 1.), (0., 0.) ];
    const TRIANGLE: &'static [(f64, f64)] = &[ (5., 5.), (6., 5.), (5., 5.) ];

    #[derive(Debug)]
    struct Town {
        name: String,
        areas: Vec<Area>,
    }

    impl AreaInfo for Town {
        fn from_record(record: DbfRecord) -> Result<Town, ShapefileError> {
            match record.get_str("NAME") {
                Some(name) => Ok(Town { name: name.to_string(), areas: vec![] }),
                None => Err(ShapefileError::AttributeError("missing NAME".to_string())),
            }
        }

        fn set_areas(&mut self, areas: Vec<Area>) {
            self.areas = areas;
        }
    }

    #[test]
    fn join_by_position() {
        let towns: Vec<Town> = read_records(&shp(5, &[ SQUARE, TRIANGLE ]), &dbf(&[ "A", "B" ]), identity, encoding::all::UTF_8).unwrap();

        assert_eq!(2, towns.len());
        assert_eq!("A", towns[0].name);
        assert_eq!(1, towns[0].areas.len());
        assert_eq!(4, towns[0].areas[0].points.len());
        assert_eq!("B", towns[1].name);
        assert_eq!(ShpPoint(6., 5.), towns[1].areas[0].points[1]);
    }

    #[test]
    fn translate_points_but_not_bounding_box() {
        let records: Vec<ShapefileRecord> = read_records(&shp(5, &[ SQUARE ]), &dbf(&[ "A" ]), |x, y| (x + 100., y * 2.), encoding::all::UTF_8).unwrap();

        let area = &records[0].areas[0];
        assert_eq!(ShpPoint(100., 2.), area.points[1]);
        assert_eq!(ShpBoundingBox { min_x: 0., min_y: 0., max_x: 9., max_y: 9. }, area.bounding_box);
        assert_eq!(Some(&DbfValue::Str("A".to_string())), records[0].data.get("NAME"));
    }

    #[test]
    fn display_record() {
        let records: Vec<ShapefileRecord> = read_records(&shp(5, &[ SQUARE ]), &dbf(&[ "A" ]), identity, encoding::all::UTF_8).unwrap();
        assert_eq!("Record(NAME: A; 1 areas)", format!("{}", records[0]));
    }

    #[test]
    fn more_shapes_than_rows() {
        let result: Result<Vec<ShapefileRecord>, _> = read_records(&shp(5, &[ SQUARE, SQUARE ]), &dbf(&[ "A" ]), identity, encoding::all::UTF_8);
        match result {
            Err(ShapefileError::JoinError(_)) => {},
            other => panic!("expected JoinError, got {:?}", other),
        }
    }

    #[test]
    fn more_rows_than_shapes() {
        let result: Result<Vec<ShapefileRecord>, _> = read_records(&shp(5, &[ SQUARE ]), &dbf(&[ "A", "B" ]), identity, encoding::all::UTF_8);
        match result {
            Err(ShapefileError::JoinError(_)) => {},
            other => panic!("expected JoinError, got {:?}", other),
        }
    }

    #[test]
    fn non_polygon_shape() {
        // PolyLine records share the Polygon layout
        let result: Result<Vec<ShapefileRecord>, _> = read_records(&shp(3, &[ SQUARE ]), &dbf(&[ "A" ]), identity, encoding::all::UTF_8);
        match result {
            Err(ShapefileError::ShapeTypeError(_)) => {},
            other => panic!("expected ShapeTypeError, got {:?}", other),
        }
    }

    #[test]
    fn deleted_row_fails_the_batch() {
        let mut dbf_bytes = dbf(&[ "A", "B" ]);
        let second_row = 65 + 5;
        dbf_bytes[second_row] = b'*';
        let result: Result<Vec<ShapefileRecord>, _> = read_records(&shp(5, &[ SQUARE, SQUARE ]), &dbf_bytes, identity, encoding::all::UTF_8);
        match result {
            Err(ShapefileError::DbfError(dbf::DbfError::DeletedRecord(1))) => {},
            other => panic!("expected DeletedRecord, got {:?}", other),
        }
    }

    #[test]
    fn attribute_error_fails_the_batch() {
        struct NeedsPopulation;

        impl AreaInfo for NeedsPopulation {
            fn from_record(record: DbfRecord) -> Result<NeedsPopulation, ShapefileError> {
                record.get_i64("POP")
                    .map(|_| NeedsPopulation)
                    .ok_or_else(|| ShapefileError::AttributeError("missing POP".to_string()))
            }

            fn set_areas(&mut self, _: Vec<Area>) {}
        }

        let result: Result<Vec<NeedsPopulation>, _> = read_records(&shp(5, &[ SQUARE ]), &dbf(&[ "A" ]), identity, encoding::all::UTF_8);
        assert!(result.is_err());
    }

    #[test]
    fn read_all_rows() {
        let records = read_dbf(Cursor::new(dbf(&[ "A", "B", "C" ])), encoding::all::UTF_8).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.get_str("NAME").unwrap()).collect();
        assert_eq!(vec![ "A", "B", "C" ], names);
    }

    #[test]
    fn read_all_polygons() {
        let bytes = shp(5, &[ SQUARE, TRIANGLE ]);
        let size = bytes.len() as u64;
        let polygons = read_shp(Cursor::new(bytes), size, identity).unwrap();
        assert_eq!(2, polygons.len());
        assert_eq!(3, polygons[1][0].points.len());
    }

    #[test]
    fn one_area_per_part() {
        let polygon = ShpPolygon {
            bounding_box: ShpBoundingBox { min_x: 0., min_y: 0., max_x: 4., max_y: 4. },
            num_parts: 2,
            num_points: 7,
            parts: vec![ 0, 4 ].into_boxed_slice(),
            points: vec![
                ShpPoint(0., 0.), ShpPoint(0., 4.), ShpPoint(4., 4.), ShpPoint(0., 0.),
                ShpPoint(1., 1.), ShpPoint(2., 1.), ShpPoint(1., 1.),
            ].into_boxed_slice(),
        };

        let areas = polygon_areas(&polygon, &identity).unwrap();
        assert_eq!(2, areas.len());
        assert_eq!(4, areas[0].points.len());
        assert_eq!(3, areas[1].points.len());
        assert_eq!(&polygon.points[4..], &areas[1].points[..]);
    }
}

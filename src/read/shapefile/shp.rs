/// Reads ESRI ".shp" Shapefile, as per
/// https://www.esri.com/library/whitepapers/pdfs/shapefile.pdf
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::cmp;
use std::iter;
use std::path::Path;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use itertools::Itertools;

const SHP_HEADER_LENGTH: usize = 100;
const SHP_RECORD_HEADER_LENGTH: usize = 8;
const SHP_MAGIC_NUMBER: u32 = 9994;
const SHP_VERSION: u32 = 1000;
const SHP_POINT_LENGTH: usize = 16;

#[derive(Debug)]
pub enum ShpError {
    IOError(io::Error),
    ParseError(String),
}

impl error::Error for ShpError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ShpError::IOError(ref err) => { Some(err) },
            ShpError::ParseError(_) => { None },
        }
    }
}

impl fmt::Display for ShpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ShpError::IOError(ref err) => { err.fmt(f) },
            ShpError::ParseError(ref description) => { write!(f, "Parse error: {}", description) },
        }
    }
}

impl From<io::Error> for ShpError {
    fn from(err: io::Error) -> ShpError {
        ShpError::IOError(err)
    }
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum ShpShapeType {
    Null,
    Point,
    PolyLine,
    Polygon,
    MultiPoint,
    PointZ,
    PolyLineZ,
    PolygonZ,
    MultiPointZ,
    PointM,
    PolyLineM,
    PolygonM,
    MultiPointM,
    MultiPatch,
}

impl ShpShapeType {
    pub fn with_u32(u: u32) -> Option<ShpShapeType> {
        match u {
            0  => Some(ShpShapeType::Null),
            1  => Some(ShpShapeType::Point),
            3  => Some(ShpShapeType::PolyLine),
            5  => Some(ShpShapeType::Polygon),
            8  => Some(ShpShapeType::MultiPoint),
            11 => Some(ShpShapeType::PointZ),
            13 => Some(ShpShapeType::PolyLineZ),
            15 => Some(ShpShapeType::PolygonZ),
            18 => Some(ShpShapeType::MultiPointZ),
            21 => Some(ShpShapeType::PointM),
            23 => Some(ShpShapeType::PolyLineM),
            25 => Some(ShpShapeType::PolygonM),
            28 => Some(ShpShapeType::MultiPointM),
            31 => Some(ShpShapeType::MultiPatch),
            _ => None,
        }
    }
}

#[derive(Debug,Copy,Clone,PartialEq)]
pub struct ShpBoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug,Copy,Clone)]
pub struct ShpHeader {
    pub magic_number: u32,
    pub version: u32,
    /// What the file header claims, in bytes. Not trusted: the reader stops at
    /// the size its caller passed in.
    pub declared_file_n_bytes: u64,
    /// `None` when the header names no known shape type. Each record carries
    /// its own type code, so the file can still be read.
    pub shape_type: Option<ShpShapeType>,
    pub bounding_box: ShpBoundingBox,
}

#[derive(Debug,Clone,Copy,PartialEq,PartialOrd)]
pub struct ShpPoint(pub f64, pub f64);

impl fmt::Display for ShpPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.0, self.1)
    }
}

/// Z or M values: a (min, max) range plus one value per point.
#[derive(Debug,Clone,PartialEq)]
pub struct ShpMeasures {
    pub range: (f64, f64),
    pub values: Box<[f64]>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpPointZ {
    pub point: ShpPoint,
    pub z: f64,
    pub m: Option<f64>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpPointM {
    pub point: ShpPoint,
    pub m: f64,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpMultiPoint {
    pub bounding_box: ShpBoundingBox,
    pub points: Box<[ShpPoint]>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpMultiPointZ {
    pub multi_point: ShpMultiPoint,
    pub z: ShpMeasures,
    pub m: Option<ShpMeasures>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpMultiPointM {
    pub multi_point: ShpMultiPoint,
    pub m: Option<ShpMeasures>,
}

/// Parts and points. PolyLine and Polygon records share this layout.
///
/// `parts[i]` is the index into `points` where part `i` starts. Part `i` ends
/// where part `i + 1` starts; the last part ends at `num_points`.
#[derive(Debug,Clone,PartialEq)]
pub struct ShpPolygon {
    pub bounding_box: ShpBoundingBox,
    pub num_parts: u32,
    pub num_points: u32,
    pub parts: Box<[u32]>,
    pub points: Box<[ShpPoint]>,
}

impl ShpPolygon {
    /// Splits `points` into one slice per part.
    ///
    /// Returns Err if the part offsets are out of order or out of range.
    pub fn rings(&self) -> Result<Vec<&[ShpPoint]>, ShpError> {
        let num_points = self.points.len();
        let mut rings = Vec::with_capacity(self.parts.len());

        let bounds = self.parts.iter()
            .map(|&part| part as usize)
            .chain(iter::once(num_points));

        for (part_start, part_end) in bounds.tuple_windows() {
            if part_end > num_points {
                return Err(ShpError::ParseError(format!("Polygon has a ring with points {}-{}, but there are only {} points", part_start, part_end, num_points)));
            }

            if part_start >= part_end {
                return Err(ShpError::ParseError(format!("Polygon has a ring with points {}-{}, but that's an invalid range", part_start, part_end)));
            }

            rings.push(&self.points[part_start .. part_end]);
        }

        Ok(rings)
    }
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpPolygonZ {
    pub polygon: ShpPolygon,
    pub z: ShpMeasures,
    pub m: Option<ShpMeasures>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpPolygonM {
    pub polygon: ShpPolygon,
    pub m: Option<ShpMeasures>,
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpMultiPatch {
    pub polygon: ShpPolygon,
    pub part_types: Box<[u32]>,
    pub z: ShpMeasures,
    pub m: Option<ShpMeasures>,
}

/// One decoded geometry. Each variant owns its coordinates.
#[derive(Debug,Clone,PartialEq)]
pub enum ShpShape {
    Null,
    Point(ShpPoint),
    PolyLine(ShpPolygon),
    Polygon(ShpPolygon),
    MultiPoint(ShpMultiPoint),
    PointZ(ShpPointZ),
    PolyLineZ(ShpPolygonZ),
    PolygonZ(ShpPolygonZ),
    MultiPointZ(ShpMultiPointZ),
    PointM(ShpPointM),
    PolyLineM(ShpPolygonM),
    PolygonM(ShpPolygonM),
    MultiPointM(ShpMultiPointM),
    MultiPatch(ShpMultiPatch),
}

impl ShpShape {
    pub fn shape_type(&self) -> ShpShapeType {
        match *self {
            ShpShape::Null => ShpShapeType::Null,
            ShpShape::Point(_) => ShpShapeType::Point,
            ShpShape::PolyLine(_) => ShpShapeType::PolyLine,
            ShpShape::Polygon(_) => ShpShapeType::Polygon,
            ShpShape::MultiPoint(_) => ShpShapeType::MultiPoint,
            ShpShape::PointZ(_) => ShpShapeType::PointZ,
            ShpShape::PolyLineZ(_) => ShpShapeType::PolyLineZ,
            ShpShape::PolygonZ(_) => ShpShapeType::PolygonZ,
            ShpShape::MultiPointZ(_) => ShpShapeType::MultiPointZ,
            ShpShape::PointM(_) => ShpShapeType::PointM,
            ShpShape::PolyLineM(_) => ShpShapeType::PolyLineM,
            ShpShape::PolygonM(_) => ShpShapeType::PolygonM,
            ShpShape::MultiPointM(_) => ShpShapeType::MultiPointM,
            ShpShape::MultiPatch(_) => ShpShapeType::MultiPatch,
        }
    }

    /// Returns the polygon iff this is a plain `Polygon` record.
    pub fn as_polygon(&self) -> Option<&ShpPolygon> {
        match *self {
            ShpShape::Polygon(ref polygon) => Some(polygon),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,PartialEq)]
pub struct ShpRecord {
    /// Position in the file, starting at 0. This is the matching ".dbf" row.
    pub index: usize,
    pub record_number: u32,
    pub shape: ShpShape,
}

/// Reads the first 100 bytes of the file.
///
/// Side-effect: leaves the file cursor at byte 100, the first record.
fn read_shp_header<R: Read + Seek>(file: &mut R) -> Result<ShpHeader, ShpError> {
    let mut buf = [ 0u8; SHP_HEADER_LENGTH ];

    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    let magic_number = BigEndian::read_u32(&buf[0..4]);
    let file_len = BigEndian::read_u32(&buf[24..28]);
    let version = LittleEndian::read_u32(&buf[28..32]);
    let shape_type_u32 = LittleEndian::read_u32(&buf[32..36]);
    let bounding_box = ShpBoundingBox {
        min_x: LittleEndian::read_f64(&buf[36..44]),
        min_y: LittleEndian::read_f64(&buf[44..52]),
        max_x: LittleEndian::read_f64(&buf[52..60]),
        max_y: LittleEndian::read_f64(&buf[60..68]),
    };

    if magic_number != SHP_MAGIC_NUMBER || version != SHP_VERSION {
        debug!("Shapefile header has magic number {} and version {}; expected {} and {}", magic_number, version, SHP_MAGIC_NUMBER, SHP_VERSION);
    }

    let shape_type = ShpShapeType::with_u32(shape_type_u32);
    if shape_type.is_none() {
        debug!("Shapefile header has nonexistent data type {}", shape_type_u32);
    }

    Ok(ShpHeader {
        magic_number: magic_number,
        version: version,
        declared_file_n_bytes: file_len as u64 * 2,
        shape_type: shape_type,
        bounding_box: bounding_box,
    })
}

/// A cursor over one record's content, after its shape type.
type Content<'a> = Cursor<&'a [u8]>;

fn n_bytes_remaining(r: &Content) -> usize {
    r.get_ref().len().saturating_sub(r.position() as usize)
}

/// Reads a part or point count and checks the record can hold that many
/// `item_len`-byte items.
fn read_count(r: &mut Content, item_len: usize, what: &str) -> Result<usize, ShpError> {
    let n = r.read_i32::<LittleEndian>()?;
    if n < 0 {
        return Err(ShpError::ParseError(format!("Shape has {} {}", n, what)));
    }

    let n = n as usize;
    if n * item_len > n_bytes_remaining(r) {
        return Err(ShpError::ParseError(format!("Shape has {} {}, but only {} bytes remain in its record", n, what, n_bytes_remaining(r))));
    }

    Ok(n)
}

fn read_point(r: &mut Content) -> Result<ShpPoint, ShpError> {
    let x = r.read_f64::<LittleEndian>()?;
    let y = r.read_f64::<LittleEndian>()?;
    Ok(ShpPoint(x, y))
}

fn read_points(r: &mut Content, n: usize) -> Result<Box<[ShpPoint]>, ShpError> {
    let mut points = Vec::with_capacity(n);
    for _ in 0..n {
        points.push(read_point(r)?);
    }
    Ok(points.into_boxed_slice())
}

fn read_u32s(r: &mut Content, n: usize) -> Result<Box<[u32]>, ShpError> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(r.read_u32::<LittleEndian>()?);
    }
    Ok(values.into_boxed_slice())
}

fn read_bounding_box(r: &mut Content) -> Result<ShpBoundingBox, ShpError> {
    Ok(ShpBoundingBox {
        min_x: r.read_f64::<LittleEndian>()?,
        min_y: r.read_f64::<LittleEndian>()?,
        max_x: r.read_f64::<LittleEndian>()?,
        max_y: r.read_f64::<LittleEndian>()?,
    })
}

fn read_measures(r: &mut Content, n: usize) -> Result<ShpMeasures, ShpError> {
    let min = r.read_f64::<LittleEndian>()?;
    let max = r.read_f64::<LittleEndian>()?;

    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(r.read_f64::<LittleEndian>()?);
    }

    Ok(ShpMeasures {
        range: (min, max),
        values: values.into_boxed_slice(),
    })
}

/// M values are optional: writers may end the record before them.
fn read_optional_measures(r: &mut Content, n: usize) -> Result<Option<ShpMeasures>, ShpError> {
    if n_bytes_remaining(r) == 0 {
        Ok(None)
    } else {
        read_measures(r, n).map(Some)
    }
}

fn read_multi_point(r: &mut Content) -> Result<ShpMultiPoint, ShpError> {
    let bounding_box = read_bounding_box(r)?;
    let num_points = read_count(r, SHP_POINT_LENGTH, "points")?;
    let points = read_points(r, num_points)?;

    Ok(ShpMultiPoint {
        bounding_box: bounding_box,
        points: points,
    })
}

/// Reads box, counts, parts and (if `with_part_types`) part types, then points.
fn read_multi_part(r: &mut Content, with_part_types: bool) -> Result<(ShpPolygon, Box<[u32]>), ShpError> {
    let bounding_box = read_bounding_box(r)?;
    let num_parts = read_count(r, 4, "parts")?;
    let num_points = read_count(r, 0, "points")?;
    let parts = read_u32s(r, num_parts)?;
    let part_types = if with_part_types {
        read_u32s(r, num_parts)?
    } else {
        vec![].into_boxed_slice()
    };

    if num_points * SHP_POINT_LENGTH > n_bytes_remaining(r) {
        return Err(ShpError::ParseError(format!("Shape has {} points, but only {} bytes remain in its record", num_points, n_bytes_remaining(r))));
    }
    let points = read_points(r, num_points)?;

    let polygon = ShpPolygon {
        bounding_box: bounding_box,
        num_parts: num_parts as u32,
        num_points: num_points as u32,
        parts: parts,
        points: points,
    };

    Ok((polygon, part_types))
}

fn read_polygon(r: &mut Content) -> Result<ShpPolygon, ShpError> {
    read_multi_part(r, false).map(|(polygon, _)| polygon)
}

fn read_polygon_z(r: &mut Content) -> Result<ShpPolygonZ, ShpError> {
    let polygon = read_polygon(r)?;
    let n = polygon.points.len();
    let z = read_measures(r, n)?;
    let m = read_optional_measures(r, n)?;
    Ok(ShpPolygonZ { polygon: polygon, z: z, m: m })
}

fn read_polygon_m(r: &mut Content) -> Result<ShpPolygonM, ShpError> {
    let polygon = read_polygon(r)?;
    let n = polygon.points.len();
    let m = read_optional_measures(r, n)?;
    Ok(ShpPolygonM { polygon: polygon, m: m })
}

fn read_shape(shape_type: ShpShapeType, r: &mut Content) -> Result<ShpShape, ShpError> {
    Ok(match shape_type {
        ShpShapeType::Null => ShpShape::Null,
        ShpShapeType::Point => ShpShape::Point(read_point(r)?),
        ShpShapeType::PolyLine => ShpShape::PolyLine(read_polygon(r)?),
        ShpShapeType::Polygon => ShpShape::Polygon(read_polygon(r)?),
        ShpShapeType::MultiPoint => ShpShape::MultiPoint(read_multi_point(r)?),
        ShpShapeType::PointZ => {
            let point = read_point(r)?;
            let z = r.read_f64::<LittleEndian>()?;
            let m = if n_bytes_remaining(r) == 0 { None } else { Some(r.read_f64::<LittleEndian>()?) };
            ShpShape::PointZ(ShpPointZ { point: point, z: z, m: m })
        }
        ShpShapeType::PolyLineZ => ShpShape::PolyLineZ(read_polygon_z(r)?),
        ShpShapeType::PolygonZ => ShpShape::PolygonZ(read_polygon_z(r)?),
        ShpShapeType::MultiPointZ => {
            let multi_point = read_multi_point(r)?;
            let n = multi_point.points.len();
            let z = read_measures(r, n)?;
            let m = read_optional_measures(r, n)?;
            ShpShape::MultiPointZ(ShpMultiPointZ { multi_point: multi_point, z: z, m: m })
        }
        ShpShapeType::PointM => {
            let point = read_point(r)?;
            let m = r.read_f64::<LittleEndian>()?;
            ShpShape::PointM(ShpPointM { point: point, m: m })
        }
        ShpShapeType::PolyLineM => ShpShape::PolyLineM(read_polygon_m(r)?),
        ShpShapeType::PolygonM => ShpShape::PolygonM(read_polygon_m(r)?),
        ShpShapeType::MultiPointM => {
            let multi_point = read_multi_point(r)?;
            let n = multi_point.points.len();
            let m = read_optional_measures(r, n)?;
            ShpShape::MultiPointM(ShpMultiPointM { multi_point: multi_point, m: m })
        }
        ShpShapeType::MultiPatch => {
            let (polygon, part_types) = read_multi_part(r, true)?;
            let n = polygon.points.len();
            let z = read_measures(r, n)?;
            let m = read_optional_measures(r, n)?;
            ShpShape::MultiPatch(ShpMultiPatch { polygon: polygon, part_types: part_types, z: z, m: m })
        }
    })
}

/// Parses one record's content: its shape type, then the shape.
fn parse_record_content(buf: &[u8], record_number: u32) -> Result<ShpShape, ShpError> {
    if buf.len() < 4 {
        return Err(ShpError::ParseError(format!("Record number {} is {} bytes long, too short to hold a shape type", record_number, buf.len())));
    }

    let shape_type_u32 = LittleEndian::read_u32(&buf[0..4]);
    let shape_type = match ShpShapeType::with_u32(shape_type_u32) {
        Some(shape_type) => shape_type,
        None => {
            return Err(ShpError::ParseError(format!("Record number {} has unsupported shape type {}", record_number, shape_type_u32)));
        }
    };

    let mut r = Cursor::new(&buf[4..]);
    read_shape(shape_type, &mut r).map_err(|err| match err {
        ShpError::IOError(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
            ShpError::ParseError(format!("Record number {} is too short for its {:?} shape", record_number, shape_type))
        }
        ShpError::ParseError(description) => {
            ShpError::ParseError(format!("Record number {}: {}", record_number, description))
        }
        err => err,
    })
}

/// Fills `buf`, or returns Ok(false) if the stream ends before its first byte.
fn read_exact_or_eof<R: Read>(file: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut n = 0;
    while n < buf.len() {
        match file.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(n_read) => n += n_read,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {},
            Err(err) => return Err(err),
        }
    }

    if n == 0 {
        Ok(false)
    } else if n < buf.len() {
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("record header is {} bytes, expected {}", n, buf.len())))
    } else {
        Ok(true)
    }
}

/// Reads an ESRI ".shp" Shapefile, following instructions at
/// https://www.esri.com/library/whitepapers/pdfs/shapefile.pdf
///
/// Iterating yields one record per step, in file order. After the first
/// error, iteration stops.
///
/// A reader owns its cursor and needs `&mut self` to advance: it is meant for
/// one consumer. To decode on several threads, open one reader per stream.
#[derive(Debug)]
pub struct ShpReader<R: io::Read + io::Seek> {
    file: R,
    size: u64,
    position: u64,
    n_records_already_read: usize,
    failed: bool,
    pub header: ShpHeader,
}

impl<R: io::Read + io::Seek> ShpReader<R> {
    /// Reads the file header. `size` is the stream's length in bytes; the
    /// length written in the header is ignored.
    ///
    /// Only a stream shorter than the header is an error here. An odd magic
    /// number, version or shape type is logged, and unknown shape types fail
    /// the record that carries them.
    pub fn new(mut file: R, size: u64) -> Result<ShpReader<R>, ShpError> {
        let header = read_shp_header(&mut file)?;

        if header.declared_file_n_bytes != size {
            debug!("Shapefile header claims {} bytes; reading {}", header.declared_file_n_bytes, size);
        }
        debug!("Opened {:?} shapefile with bounding box {:?}", header.shape_type, header.bounding_box);

        Ok(ShpReader {
            file: file,
            size: size,
            position: SHP_HEADER_LENGTH as u64,
            n_records_already_read: 0,
            failed: false,
            header: header,
        })
    }

    pub fn shape_type(&self) -> Option<ShpShapeType> {
        self.header.shape_type
    }

    pub fn bounding_box(&self) -> ShpBoundingBox {
        self.header.bounding_box
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the record at the cursor.
    ///
    /// Side-effect: moves the cursor to the start of the next record, as the
    /// record header describes it, however many bytes the shape used. A
    /// record claiming more bytes than the stream holds is decoded from what
    /// remains, and ends the stream.
    fn read_record(&mut self) -> Result<Option<ShpRecord>, ShpError> {
        let record_start = self.position;
        if record_start >= self.size {
            return Ok(None);
        }

        let mut header_buf = [ 0u8; SHP_RECORD_HEADER_LENGTH ];
        if !read_exact_or_eof(&mut self.file, &mut header_buf)? {
            self.position = self.size;
            return Ok(None);
        }

        let record_number = BigEndian::read_u32(&header_buf[0..4]);
        let content_length = BigEndian::read_u32(&header_buf[4..8]) as u64 * 2;

        let content_start = record_start + SHP_RECORD_HEADER_LENGTH as u64;
        let n_bytes_available = cmp::min(content_length, self.size.saturating_sub(content_start));
        if n_bytes_available < content_length {
            debug!("Record number {} claims {} bytes, but the file ends after {}", record_number, content_length, n_bytes_available);
        }

        // Every content byte is consumed, so the cursor lands on the next
        // record without seeking.
        let mut buf = vec![ 0u8; n_bytes_available as usize ];
        self.file.read_exact(&mut buf)?;
        self.position = content_start + content_length;

        let shape = parse_record_content(&buf[..], record_number)?;

        let index = self.n_records_already_read;
        self.n_records_already_read += 1;

        Ok(Some(ShpRecord {
            index: index,
            record_number: record_number,
            shape: shape,
        }))
    }
}

impl<R: io::Read + io::Seek> Iterator for ShpReader<R> {
    type Item = Result<ShpRecord, ShpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Opens an ESRI ".shp" Shapefile from the filesystem.
pub fn open(path: &Path) -> Result<ShpReader<io::BufReader<fs::File>>, ShpError> {
    let f = fs::File::open(path)?;
    let size = f.metadata()?.len();
    ShpReader::new(io::BufReader::new(f), size)
}

/// Reads xbase ".dbf" file, as per
/// https://www.clicketyclick.dk/databases/xbase/format/dbf.html

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;
use byteorder::{ByteOrder, LittleEndian};
use encoding;
use encoding::{DecoderTrap, Encoding, EncodingRef};

const DBF_HEADER_LENGTH: usize = 32;
const DBF_FIELD_DESCRIPTOR_LENGTH: usize = 32;
const DBF_FIELD_NAME_LENGTH: usize = 11;
const DBF_VERSION: u8 = 0x03;
const DBF_HEADER_TERMINATOR: u8 = 0x0D;
const DBF_RECORD_LIVE: u8 = b' ';
const DBF_RECORD_DELETED: u8 = b'*';

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub enum DbfType {
    Char,
    Numeric,
    Float,
}

impl DbfType {
    fn with_u8(u: u8) -> Option<DbfType> {
        match u {
            b'C' => Some(DbfType::Char),
            b'N' => Some(DbfType::Numeric),
            b'F' => Some(DbfType::Float),
            _ => None,
        }
    }
}

#[derive(Debug,Clone,PartialEq)]
pub struct DbfField {
    pub name: String,
    pub data_type: DbfType,
    /// Informational: most writers leave this zero.
    pub offset: u32,
    pub len: u8,
    pub decimal_count: u8,
}

#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct DbfHeader {
    pub version: u8,
    /// Full year: the file stores an offset from 1900.
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub n_records: usize,
    pub n_header_bytes: usize,
    pub n_bytes_per_record: usize,
}

#[derive(Debug,Clone,PartialEq)]
pub enum DbfValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for DbfValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DbfValue::Str(ref s) => write!(f, "{}", s),
            DbfValue::Int(i) => write!(f, "{}", i),
            DbfValue::Float(x) => write!(f, "{}", x),
        }
    }
}

/// One row: field name to value.
#[derive(Debug,Clone,PartialEq,Default)]
pub struct DbfRecord(BTreeMap<String, DbfValue>);

impl DbfRecord {
    pub fn new() -> DbfRecord {
        DbfRecord(BTreeMap::new())
    }

    pub fn insert(&mut self, name: String, value: DbfValue) -> Option<DbfValue> {
        self.0.insert(name, value)
    }

    pub fn get(&self, name: &str) -> Option<&DbfValue> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(&DbfValue::Str(ref s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(&DbfValue::Int(i)) => Some(i),
            _ => None,
        }
    }

    /// Reads `Float` values, and widens `Int` values.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(&DbfValue::Float(x)) => Some(x),
            Some(&DbfValue::Int(i)) => Some(i as f64),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<String, DbfValue> {
        self.0.iter()
    }

    pub fn into_map(self) -> BTreeMap<String, DbfValue> {
        self.0
    }
}

#[derive(Debug)]
pub enum DbfError {
    IOError(io::Error),
    ParseError(String),
    DeletedRecord(usize),
    LockPoisoned,
}

impl error::Error for DbfError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            DbfError::IOError(ref err) => { Some(err) },
            _ => { None },
        }
    }
}

impl fmt::Display for DbfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DbfError::IOError(ref err) => { err.fmt(f) },
            DbfError::ParseError(ref description) => { write!(f, "Parse error: {}", description) },
            DbfError::DeletedRecord(i) => { write!(f, "Record {} is deleted", i) },
            DbfError::LockPoisoned => { write!(f, "Another reader panicked while holding the .dbf file lock") },
        }
    }
}

impl From<io::Error> for DbfError {
    fn from(err: io::Error) -> DbfError {
        DbfError::IOError(err)
    }
}

fn decode_text(bytes: &[u8], encoding: EncodingRef) -> String {
    match encoding.decode(bytes, DecoderTrap::Replace) {
        Ok(s) => s,
        Err(s) => s.into_owned(),
    }
}

/// Reads the first 32 bytes of the file.
///
/// Side-effect: leaves the file cursor at the first field descriptor.
fn read_dbf_header<R: Read + Seek>(file: &mut R) -> Result<DbfHeader, DbfError> {
    let mut buf = [ 0u8; DBF_HEADER_LENGTH ];

    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    if buf[0] != DBF_VERSION {
        return Err(DbfError::ParseError(format!("File has unexpected version: found {}, expected {}", buf[0], DBF_VERSION)));
    }

    Ok(DbfHeader {
        version: buf[0],
        year: 1900 + buf[1] as u16,
        month: buf[2],
        day: buf[3],
        n_records: LittleEndian::read_u32(&buf[4..]) as usize,
        n_header_bytes: LittleEndian::read_u16(&buf[8..]) as usize,
        n_bytes_per_record: LittleEndian::read_u16(&buf[10..]) as usize,
    })
}

fn parse_dbf_field(buf: &[u8], encoding: EncodingRef) -> Result<DbfField, DbfError> {
    let name_bytes = &buf[0 .. DBF_FIELD_NAME_LENGTH];
    let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(DBF_FIELD_NAME_LENGTH);
    let name = decode_text(&name_bytes[.. name_len], encoding);

    let data_type = match DbfType::with_u8(buf[11]) {
        Some(data_type) => data_type,
        None => {
            return Err(DbfError::ParseError(format!("Field {} has unsupported type '{}'", name, buf[11] as char)));
        }
    };

    Ok(DbfField {
        name: name,
        data_type: data_type,
        offset: LittleEndian::read_u32(&buf[12..16]),
        len: buf[16],
        decimal_count: buf[17],
    })
}

/// Reads all field definitions and the header terminator.
///
/// Call this after read_dbf_header().
fn read_dbf_fields<R: Read>(file: &mut R, dbf_header: &DbfHeader, encoding: EncodingRef) -> Result<Box<[DbfField]>, DbfError> {
    if dbf_header.n_header_bytes <= DBF_HEADER_LENGTH {
        return Err(DbfError::ParseError(format!("Header is {} bytes long, too short to hold field descriptors", dbf_header.n_header_bytes)));
    }

    let mut fields = Vec::<DbfField>::new();
    let mut buf = [ 0u8; DBF_FIELD_DESCRIPTOR_LENGTH ];
    let mut offset = DBF_HEADER_LENGTH;

    while offset < dbf_header.n_header_bytes - 1 {
        file.read_exact(&mut buf)?;
        fields.push(parse_dbf_field(&buf, encoding)?);
        offset += DBF_FIELD_DESCRIPTOR_LENGTH;
    }

    let mut terminator = [ 0u8; 1 ];
    file.read_exact(&mut terminator)?;
    if terminator[0] != DBF_HEADER_TERMINATOR {
        return Err(DbfError::ParseError(format!("Header was supposed to be {} bytes long, but found byte {:#x} at that offset instead of expected byte {:#x}", dbf_header.n_header_bytes, terminator[0], DBF_HEADER_TERMINATOR)));
    }

    Ok(fields.into_boxed_slice())
}

fn parse_dbf_value(field: &DbfField, text: &str, i: usize) -> Result<DbfValue, DbfError> {
    let parse_float = || {
        text.parse::<f64>()
            .map(DbfValue::Float)
            .map_err(|err| DbfError::ParseError(format!("Record {} field {}: cannot parse {:?} as a number: {}", i, field.name, text, err)))
    };

    match field.data_type {
        DbfType::Char => Ok(DbfValue::Str(text.to_string())),
        DbfType::Float | DbfType::Numeric if text.is_empty() => {
            if field.data_type == DbfType::Numeric && field.decimal_count == 0 {
                Ok(DbfValue::Int(0))
            } else {
                Ok(DbfValue::Float(0.))
            }
        }
        DbfType::Float => parse_float(),
        DbfType::Numeric if field.decimal_count > 0 => parse_float(),
        DbfType::Numeric => {
            text.parse::<i64>()
                .map(DbfValue::Int)
                .map_err(|err| DbfError::ParseError(format!("Record {} field {}: cannot parse {:?} as an integer: {}", i, field.name, text, err)))
        }
    }
}

/// Reads an xBase ".dbf" file, following instructions at
/// https://www.clicketyclick.dk/databases/xbase/format/dbf.html
///
/// Rows are read by index. `read()` takes `&self`: a lock around the file
/// makes each seek-and-read atomic, so several threads may share one reader.
///
/// # Example
///
/// ```
/// # extern crate encoding;
/// # extern crate twshape;
/// # fn main() {
/// use std::io::Cursor;
/// use twshape::read::shapefile::dbf::{DbfReader, DbfValue};
///
/// let mut bytes = vec![ 3u8, 124, 1, 2, 1, 0, 0, 0, 65, 0, 6, 0 ];
/// bytes.extend_from_slice(&[ 0u8; 20 ]);
/// bytes.extend_from_slice(b"NAME\0\0\0\0\0\0\0C\0\0\0\0\x05\0");
/// bytes.extend_from_slice(&[ 0u8; 14 ]);
/// bytes.push(0x0d);
/// bytes.extend_from_slice(b" foo  ");
///
/// let reader = DbfReader::new(Cursor::new(bytes), encoding::all::UTF_8).unwrap();
/// assert_eq!(1, reader.len());
///
/// let record = reader.read(0).unwrap();
/// assert_eq!(Some(&DbfValue::Str("foo".to_string())), record.get("NAME"));
/// # }
/// ```
pub struct DbfReader<R: io::Read + io::Seek> {
    file: Mutex<R>,
    header: DbfHeader,
    fields: Box<[DbfField]>,
    encoding: EncodingRef,
}

// encoding::EncodingRef does not implement std::fmt::Debug
impl<R: io::Read + io::Seek> fmt::Debug for DbfReader<R> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("DbfReader")
            .field("header", &self.header)
            .field("fields", &self.fields)
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

impl<R: io::Read + io::Seek> DbfReader<R> {
    pub fn new(mut file: R, encoding: EncodingRef) -> Result<DbfReader<R>, DbfError> {
        let header = read_dbf_header(&mut file)?;
        let fields = read_dbf_fields(&mut file, &header, encoding)?;

        debug!("Opened .dbf file with {} records of {} fields ({})", header.n_records, fields.len(), encoding.name());

        Ok(DbfReader {
            file: Mutex::new(file),
            header: header,
            fields: fields,
            encoding: encoding,
        })
    }

    pub fn header(&self) -> &DbfHeader {
        &self.header
    }

    /// Number of records, according to the header.
    pub fn len(&self) -> usize {
        self.header.n_records
    }

    pub fn is_empty(&self) -> bool {
        self.header.n_records == 0
    }

    /// (year, month, day) of the last modification.
    pub fn modification_date(&self) -> (u16, u8, u8) {
        (self.header.year, self.header.month, self.header.day)
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.fields
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.fields.get(i).map(|field| &field.name[..])
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| &field.name[..]).collect()
    }

    pub fn get_field(&self, name: &str) -> Option<&DbfField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Reads and parses record `i`.
    ///
    /// Returns `DbfError::DeletedRecord` if the record is marked deleted.
    pub fn read(&self, i: usize) -> Result<DbfRecord, DbfError> {
        if i >= self.header.n_records {
            return Err(DbfError::ParseError(format!("Record {} does not exist: the file has {} records", i, self.header.n_records)));
        }

        let mut buf = vec![ 0u8; self.header.n_bytes_per_record.max(1) ];
        {
            let mut file = self.file.lock().map_err(|_| DbfError::LockPoisoned)?;
            let offset = self.header.n_header_bytes as u64 + self.header.n_bytes_per_record as u64 * i as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[0..1])?;

            match buf[0] {
                DBF_RECORD_LIVE => {},
                DBF_RECORD_DELETED => { return Err(DbfError::DeletedRecord(i)); },
                flag => {
                    return Err(DbfError::ParseError(format!("Record {} contained an unexpected value in the deleted flag: {:#x}", i, flag)));
                }
            }

            let n_field_bytes: usize = self.fields.iter().map(|field| field.len as usize).sum();
            if 1 + n_field_bytes > buf.len() {
                buf.resize(1 + n_field_bytes, 0);
            }
            file.read_exact(&mut buf[1 .. 1 + n_field_bytes])?;
        }

        let mut record = DbfRecord::new();
        let mut pos = 1;
        for field in self.fields.iter() {
            let end = pos + field.len as usize;
            let text = decode_text(&buf[pos .. end], self.encoding);
            let value = parse_dbf_value(field, text.trim(), i)?;
            record.insert(field.name.clone(), value);
            pos = end;
        }

        Ok(record)
    }
}

/// Opens an xBase ".dbf" file from the filesystem.
pub fn open(path: &Path, encoding: EncodingRef) -> Result<DbfReader<io::BufReader<fs::File>>, DbfError> {
    let f = fs::File::open(path)?;
    DbfReader::new(io::BufReader::new(f), encoding)
}

/// Opens an xBase ".dbf" file from the filesystem, assuming ASCII text.
pub fn open_ascii(path: &Path) -> Result<DbfReader<io::BufReader<fs::File>>, DbfError> {
    open(path, encoding::all::ASCII)
}

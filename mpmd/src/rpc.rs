//! RPC request/reply framing.
//!
//! Every request starts with a magic pattern, then carries a method name and
//! tagged positional arguments; the reply is a status byte followed by a
//! value or an error string. All integers are network order.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::NetworkEndian;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::proto::{ProtoRead, ProtoWrite, ReadStringError};

pub const MAGIC: [u8; 4] = *b"MPM\x01";

const MAX_ARGS: usize = 16;
const MAX_STRING: usize = 16 * 1024;

#[derive(Debug, FromPrimitive, ToPrimitive)]
enum Tag {
    Void = 0,
    Bool = 1,
    U64 = 2,
    Str = 3,
    StrList = 4,
    U64List = 5,
    Map = 6,
    MapList = 7,
}

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    U64(u64),
    Str(String),
    StrList(Vec<String>),
    U64List(Vec<u64>),
    Map(Vec<(String, String)>),
    MapList(Vec<Vec<(String, String)>>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_u64_list(&self) -> Option<&[u64]> {
        match self {
            Value::U64List(values) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    UnexpectedPattern,
    UnrecognizedTag(u8),
    Utf8,
    TooLarge,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(error) => write!(f, "io error: {}", error),
            Error::UnexpectedPattern => write!(f, "unexpected pattern"),
            Error::UnrecognizedTag(tag) => write!(f, "unrecognized value tag {}", tag),
            Error::Utf8 => write!(f, "malformed UTF-8"),
            Error::TooLarge => write!(f, "oversized request"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<ReadStringError> for Error {
    fn from(error: ReadStringError) -> Self {
        match error {
            ReadStringError::Utf8(_) => Error::Utf8,
            ReadStringError::Other(error) => Error::Io(error),
        }
    }
}

fn read_short_string<R: Read>(stream: &mut R) -> Result<String> {
    let length = stream.read_u32::<NetworkEndian>()? as usize;
    if length > MAX_STRING {
        return Err(Error::TooLarge);
    }
    let mut bytes = vec![0; length];
    stream.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::Utf8)
}

fn read_map<R: Read>(stream: &mut R) -> Result<Vec<(String, String)>> {
    let entries = stream.read_u32::<NetworkEndian>()? as usize;
    if entries > MAX_STRING {
        return Err(Error::TooLarge);
    }
    let mut map = Vec::with_capacity(entries);
    for _ in 0..entries {
        let key = read_short_string(stream)?;
        let value = read_short_string(stream)?;
        map.push((key, value));
    }
    Ok(map)
}

pub fn read_value<R: Read>(stream: &mut R) -> Result<Value> {
    let tag = stream.read_u8()?;
    match Tag::from_u8(tag).ok_or(Error::UnrecognizedTag(tag))? {
        Tag::Void => Ok(Value::Void),
        Tag::Bool => Ok(Value::Bool(stream.read_bool()?)),
        Tag::U64 => Ok(Value::U64(stream.read_u64::<NetworkEndian>()?)),
        Tag::Str => Ok(Value::Str(read_short_string(stream)?)),
        Tag::StrList => {
            let count = stream.read_u32::<NetworkEndian>()? as usize;
            if count > MAX_STRING {
                return Err(Error::TooLarge);
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_short_string(stream)?);
            }
            Ok(Value::StrList(values))
        }
        Tag::U64List => {
            let count = stream.read_u32::<NetworkEndian>()? as usize;
            if count > MAX_STRING {
                return Err(Error::TooLarge);
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(stream.read_u64::<NetworkEndian>()?);
            }
            Ok(Value::U64List(values))
        }
        Tag::Map => Ok(Value::Map(read_map(stream)?)),
        Tag::MapList => {
            let count = stream.read_u32::<NetworkEndian>()? as usize;
            if count > MAX_STRING {
                return Err(Error::TooLarge);
            }
            let mut maps = Vec::with_capacity(count);
            for _ in 0..count {
                maps.push(read_map(stream)?);
            }
            Ok(Value::MapList(maps))
        }
    }
}

fn write_map<W: Write>(stream: &mut W, map: &[(String, String)]) -> Result<()> {
    stream.write_u32::<NetworkEndian>(map.len() as u32)?;
    for (key, value) in map {
        stream.write_string::<NetworkEndian>(key)?;
        stream.write_string::<NetworkEndian>(value)?;
    }
    Ok(())
}

pub fn write_value<W: Write>(stream: &mut W, value: &Value) -> Result<()> {
    let tag = |tag: Tag| tag.to_u8().unwrap_or(0);
    match value {
        Value::Void => stream.write_u8(tag(Tag::Void))?,
        Value::Bool(value) => {
            stream.write_u8(tag(Tag::Bool))?;
            stream.write_bool(*value)?;
        }
        Value::U64(value) => {
            stream.write_u8(tag(Tag::U64))?;
            stream.write_u64::<NetworkEndian>(*value)?;
        }
        Value::Str(value) => {
            stream.write_u8(tag(Tag::Str))?;
            stream.write_string::<NetworkEndian>(value)?;
        }
        Value::StrList(values) => {
            stream.write_u8(tag(Tag::StrList))?;
            stream.write_u32::<NetworkEndian>(values.len() as u32)?;
            for value in values {
                stream.write_string::<NetworkEndian>(value)?;
            }
        }
        Value::U64List(values) => {
            stream.write_u8(tag(Tag::U64List))?;
            stream.write_u32::<NetworkEndian>(values.len() as u32)?;
            for value in values {
                stream.write_u64::<NetworkEndian>(*value)?;
            }
        }
        Value::Map(map) => {
            stream.write_u8(tag(Tag::Map))?;
            write_map(stream, map)?;
        }
        Value::MapList(maps) => {
            stream.write_u8(tag(Tag::MapList))?;
            stream.write_u32::<NetworkEndian>(maps.len() as u32)?;
            for map in maps {
                write_map(stream, map)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
pub struct Request {
    pub method: String,
    pub args: Vec<Value>,
}

/// Reads one request. `Ok(None)` means the peer closed the connection
/// between requests.
pub fn read_request<R: Read>(stream: &mut R) -> Result<Option<Request>> {
    let mut magic = [0; 4];
    match stream.read_exact(&mut magic) {
        Ok(()) => (),
        Err(ref error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    if magic != MAGIC {
        return Err(Error::UnexpectedPattern);
    }
    let method = read_short_string(stream)?;
    let argc = stream.read_u8()? as usize;
    if argc > MAX_ARGS {
        return Err(Error::TooLarge);
    }
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(read_value(stream)?);
    }
    Ok(Some(Request { method, args }))
}

pub fn write_request<W: Write>(stream: &mut W, request: &Request) -> Result<()> {
    stream.write_all(&MAGIC)?;
    stream.write_string::<NetworkEndian>(&request.method)?;
    stream.write_u8(request.args.len() as u8)?;
    for arg in &request.args {
        write_value(stream, arg)?;
    }
    Ok(())
}

pub fn write_reply_ok<W: Write>(stream: &mut W, value: &Value) -> Result<()> {
    stream.write_u8(STATUS_OK)?;
    write_value(stream, value)
}

pub fn write_reply_err<W: Write>(stream: &mut W, message: &str) -> Result<()> {
    stream.write_u8(STATUS_ERROR)?;
    stream.write_string::<NetworkEndian>(message)?;
    Ok(())
}

/// Reads a reply, returning `Ok(value)` or the peer's error string.
pub fn read_reply<R: Read>(stream: &mut R) -> Result<std::result::Result<Value, String>> {
    match stream.read_u8()? {
        STATUS_OK => Ok(Ok(read_value(stream)?)),
        _ => Ok(Err(read_short_string(stream)?)),
    }
}

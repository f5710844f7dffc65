//! Tagged value codec. Each value is a 4-byte BE tag followed by its payload.
//!
//! Integers, identifiers and float bit patterns are big-endian; strings carry a
//! 4-byte BE length. A byte buffer has no length: it swallows the rest of the
//! packet, so the writer refuses anything after it.

use crate::id::Id;

/// Wire tags. The set is closed; anything else on the wire is a decode fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Tag {
    Id = 0,
    Int8 = 1,
    UInt8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,
    Float32 = 9,
    Float64 = 10,
    String = 11,
    Buffer = 12,
}

impl Tag {
    pub fn from_i32(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Tag::Id,
            1 => Tag::Int8,
            2 => Tag::UInt8,
            3 => Tag::Int16,
            4 => Tag::UInt16,
            5 => Tag::Int32,
            6 => Tag::UInt32,
            7 => Tag::Int64,
            8 => Tag::UInt64,
            9 => Tag::Float32,
            10 => Tag::Float64,
            11 => Tag::String,
            12 => Tag::Buffer,
            _ => return None,
        })
    }
}

/// One argument or result.
///
/// `Seq` exists only on the producing side: it is flattened element by element
/// when written and never comes back out of a decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Id(Id),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Buffer(Vec<u8>),
    Seq(Vec<Value>),
}

impl Value {
    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Id(_) => "id",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Seq(_) => "sequence",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident as $name:literal),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl FromValue for $ty {
                const EXPECTED: &'static str = $name;

                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(v.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

/// Typed extraction of a decoded value. Exact variant match only, no widening.
pub trait FromValue: Sized {
    /// Name used when the conversion fails.
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

value_conversions! {
    Id => Id as "id",
    i8 => I8 as "i8",
    u8 => U8 as "u8",
    i16 => I16 as "i16",
    u16 => U16 as "u16",
    i32 => I32 as "i32",
    u32 => U32 as "u32",
    i64 => I64 as "i64",
    u64 => U64 as "u64",
    f32 => F32 as "f32",
    f64 => F64 as "f64",
    String => Str as "string",
    Vec<u8> => Buffer as "buffer",
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Buffer(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

/// Build an argument list from native values: `values![method, 3i32, "name"]`.
#[macro_export]
macro_rules! values {
    ($($v:expr),* $(,)?) => {
        ::std::vec![$($crate::value::Value::from($v)),*]
    };
}

/// Error reading or writing tagged values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown/unimplemented type tag {0}")]
    UnknownTag(i32),
    #[error("packet truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("string of {0} bytes does not fit a 32-bit length")]
    StringTooLong(usize),
    #[error("no value may follow a byte buffer")]
    ValueAfterBuffer,
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

/// Append-only packet. Sealed once a byte buffer has been written.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
    sealed: bool,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put_raw_u8(&mut self, v: u8) -> Result<(), CodecError> {
        self.check_open()?;
        self.buf.push(v);
        Ok(())
    }

    pub(crate) fn put_raw_id(&mut self, id: Id) -> Result<(), CodecError> {
        self.check_open()?;
        self.buf.extend_from_slice(&id.get().to_be_bytes());
        Ok(())
    }

    /// Write one value; sequences are flattened into their elements.
    pub fn put(&mut self, value: &Value) -> Result<(), CodecError> {
        self.check_open()?;
        match value {
            Value::Seq(items) => self.put_all(items),
            Value::Id(id) => self.put_tagged(Tag::Id, &id.get().to_be_bytes()),
            Value::I8(v) => self.put_tagged(Tag::Int8, &v.to_be_bytes()),
            Value::U8(v) => self.put_tagged(Tag::UInt8, &[*v]),
            Value::I16(v) => self.put_tagged(Tag::Int16, &v.to_be_bytes()),
            Value::U16(v) => self.put_tagged(Tag::UInt16, &v.to_be_bytes()),
            Value::I32(v) => self.put_tagged(Tag::Int32, &v.to_be_bytes()),
            Value::U32(v) => self.put_tagged(Tag::UInt32, &v.to_be_bytes()),
            Value::I64(v) => self.put_tagged(Tag::Int64, &v.to_be_bytes()),
            Value::U64(v) => self.put_tagged(Tag::UInt64, &v.to_be_bytes()),
            Value::F32(v) => self.put_tagged(Tag::Float32, &v.to_bits().to_be_bytes()),
            Value::F64(v) => self.put_tagged(Tag::Float64, &v.to_bits().to_be_bytes()),
            Value::Str(s) => {
                let len = u32::try_from(s.len()).map_err(|_| CodecError::StringTooLong(s.len()))?;
                self.put_tagged(Tag::String, &len.to_be_bytes())?;
                self.buf.extend_from_slice(s.as_bytes());
                Ok(())
            }
            Value::Buffer(b) => {
                self.put_tagged(Tag::Buffer, b)?;
                self.sealed = true;
                Ok(())
            }
        }
    }

    fn put_tagged(&mut self, tag: Tag, payload: &[u8]) -> Result<(), CodecError> {
        self.buf.extend_from_slice(&(tag as i32).to_be_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn put_all<'a>(
        &mut self,
        values: impl IntoIterator<Item = &'a Value>,
    ) -> Result<(), CodecError> {
        for v in values {
            self.put(v)?;
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn check_open(&self) -> Result<(), CodecError> {
        if self.sealed {
            Err(CodecError::ValueAfterBuffer)
        } else {
            Ok(())
        }
    }
}

/// Read cursor over a received packet.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn read_raw_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub(crate) fn read_raw_id(&mut self) -> Result<Id, CodecError> {
        Ok(Id::new(u64::from_be_bytes(self.take_array()?)))
    }

    /// Next tagged value, or `None` at the end of the packet.
    pub fn next_value(&mut self) -> Result<Option<Value>, CodecError> {
        if self.is_empty() {
            return Ok(None);
        }
        let raw = i32::from_be_bytes(self.take_array()?);
        let tag = Tag::from_i32(raw).ok_or(CodecError::UnknownTag(raw))?;
        let value = match tag {
            Tag::Id => Value::Id(Id::new(u64::from_be_bytes(self.take_array()?))),
            Tag::Int8 => Value::I8(i8::from_be_bytes(self.take_array()?)),
            Tag::UInt8 => Value::U8(self.read_raw_u8()?),
            Tag::Int16 => Value::I16(i16::from_be_bytes(self.take_array()?)),
            Tag::UInt16 => Value::U16(u16::from_be_bytes(self.take_array()?)),
            Tag::Int32 => Value::I32(i32::from_be_bytes(self.take_array()?)),
            Tag::UInt32 => Value::U32(u32::from_be_bytes(self.take_array()?)),
            Tag::Int64 => Value::I64(i64::from_be_bytes(self.take_array()?)),
            Tag::UInt64 => Value::U64(u64::from_be_bytes(self.take_array()?)),
            Tag::Float32 => Value::F32(f32::from_bits(u32::from_be_bytes(self.take_array()?))),
            Tag::Float64 => Value::F64(f64::from_bits(u64::from_be_bytes(self.take_array()?))),
            Tag::String => {
                let len = u32::from_be_bytes(self.take_array()?) as usize;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Value::Str(s.to_owned())
            }
            Tag::Buffer => Value::Buffer(self.take(self.remaining())?.to_vec()),
        };
        Ok(Some(value))
    }

    /// Decode every remaining value. A buffer ends the packet by construction.
    pub fn read_values(mut self) -> Result<Vec<Value>, CodecError> {
        let mut out = Vec::new();
        while let Some(v) = self.next_value()? {
            out.push(v);
        }
        Ok(out)
    }
}

/// Encode a list of values into a fresh packet.
pub fn encode_values(values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let mut w = PacketWriter::new();
    w.put_all(values)?;
    Ok(w.into_bytes())
}

/// Decode a whole packet.
pub fn decode_values(bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    PacketReader::new(bytes).read_values()
}

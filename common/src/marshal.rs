//! D-Bus marshalling of basic values.
//!
//! Every value is aligned to its natural boundary relative to the start of
//! the frame. The writer inserts zero padding, the reader skips it and
//! refuses non-zero padding bytes.

use crate::{
    config::MAX_ARRAY_SIZE,
    error::{Error, Result},
};

/// Deepest container nesting accepted when stepping over values
const MAX_NESTING: usize = 64;

/// Byte order of a frame, announced by its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    /// `l`
    Little,
    /// `B`
    Big,
}

impl Endianness {
    /// Byte order of the running machine
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Marker byte written at offset 0
    pub const fn to_byte(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    /// Parse the marker byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }

    /// Decode a u32 from the first four bytes of `bytes`
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Self::native()
    }
}

/// A basic (non-container) D-Bus value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Index into the out-of-band file descriptor array
    UnixFd(u32),
}

impl Value {
    /// Single-character type code
    pub fn type_code(&self) -> u8 {
        match self {
            Value::Byte(_) => b'y',
            Value::Boolean(_) => b'b',
            Value::Int16(_) => b'n',
            Value::Uint16(_) => b'q',
            Value::Int32(_) => b'i',
            Value::Uint32(_) => b'u',
            Value::Int64(_) => b'x',
            Value::Uint64(_) => b't',
            Value::Double(_) => b'd',
            Value::String(_) => b's',
            Value::ObjectPath(_) => b'o',
            Value::Signature(_) => b'g',
            Value::UnixFd(_) => b'h',
        }
    }

    /// String payload of `s`, `o` and `g` values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Payload of `u` values
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Alignment of a type code, `None` for codes this transport does not know
pub fn alignment_of(code: u8) -> Option<usize> {
    match code {
        b'y' | b'g' | b'v' => Some(1),
        b'n' | b'q' => Some(2),
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => Some(4),
        b'x' | b't' | b'd' | b'(' | b'{' | b'r' | b'e' => Some(8),
        _ => None,
    }
}

fn is_basic(code: u8) -> bool {
    matches!(
        code,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

/// Check the object path grammar: `/` or `/seg/seg` with `[A-Za-z0-9_]` segments
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// Check that a signature only holds basic types (all this transport marshals)
pub fn is_basic_signature(signature: &str) -> bool {
    signature.len() <= 255 && signature.bytes().all(is_basic)
}

/// Append-only buffer producing aligned wire data
#[derive(Debug)]
pub struct WireWriter {
    buf:    Vec<u8>,
    endian: Endianness,
}

impl WireWriter {
    /// Start an empty buffer positioned at frame offset 0
    pub fn new(endian: Endianness) -> Self {
        Self {
            buf: Vec::new(),
            endian,
        }
    }

    /// Current offset from the start of the frame
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Insert zero bytes up to the next multiple of `alignment`
    pub fn pad_to(&mut self, alignment: usize) {
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + alignment - rem, 0);
        }
    }

    /// Raw bytes, no alignment
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.pad_to(2);
        match self.endian {
            Endianness::Little => self.put_bytes(&v.to_le_bytes()),
            Endianness::Big => self.put_bytes(&v.to_be_bytes()),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        self.pad_to(4);
        match self.endian {
            Endianness::Little => self.put_bytes(&v.to_le_bytes()),
            Endianness::Big => self.put_bytes(&v.to_be_bytes()),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        self.pad_to(8);
        match self.endian {
            Endianness::Little => self.put_bytes(&v.to_le_bytes()),
            Endianness::Big => self.put_bytes(&v.to_be_bytes()),
        }
    }

    /// Overwrite a previously written u32 (used for length back-patching)
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    /// `s`: u32 length, UTF-8 bytes, NUL
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(Error::protocol("string contains a NUL byte"));
        }
        let len = u32::try_from(s.len()).map_err(|_| Error::protocol("string too long"))?;
        self.put_u32(len);
        self.put_bytes(s.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// `g`: u8 length, ASCII type codes, NUL
    pub fn put_signature(&mut self, sig: &str) -> Result<()> {
        if sig.len() > 255 || !sig.is_ascii() {
            return Err(Error::protocol(format!("invalid signature '{sig}'")));
        }
        self.put_u8(sig.len() as u8);
        self.put_bytes(sig.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Marshal one value at its natural alignment
    pub fn put_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_u16(*v as u16),
            Value::Uint16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_u32(*v as u32),
            Value::Uint32(v) | Value::UnixFd(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_u64(*v as u64),
            Value::Uint64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_u64(v.to_bits()),
            Value::String(s) => self.put_string(s)?,
            Value::ObjectPath(p) => {
                if !is_valid_object_path(p) {
                    return Err(Error::protocol(format!("invalid object path '{p}'")));
                }
                self.put_string(p)?;
            }
            Value::Signature(sig) => self.put_signature(sig)?,
        }
        Ok(())
    }

    /// `v`: signature of the contained type followed by the value
    pub fn put_variant(&mut self, value: &Value) -> Result<()> {
        let signature = char::from(value.type_code()).to_string();
        self.put_signature(&signature)?;
        self.put_value(value)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over received wire data
#[derive(Debug)]
pub struct WireReader<'a> {
    buf:    &'a [u8],
    pos:    usize,
    base:   usize,
    endian: Endianness,
}

impl<'a> WireReader<'a> {
    /// Read `buf`, whose first byte sits at frame offset `base`
    pub fn new(buf: &'a [u8], base: usize, endian: Endianness) -> Self {
        Self {
            buf,
            pos: 0,
            base,
            endian,
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "need {n} bytes at offset {}, only {} left",
                self.base + self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip padding up to `alignment`; padding must be zero
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let rem = (self.base + self.pos) % alignment;
        if rem != 0 {
            let pad = self.take(alignment - rem)?;
            if pad.iter().any(|&b| b != 0) {
                return Err(Error::protocol("non-zero alignment padding"));
            }
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take(2)?;
        let b = [b[0], b[1]];
        Ok(match self.endian {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(self.endian.read_u32([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(match self.endian {
            Endianness::Little => u64::from_le_bytes(raw),
            Endianness::Big => u64::from_be_bytes(raw),
        })
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        if self.get_u8()? != 0 {
            return Err(Error::protocol("string is not NUL terminated"));
        }
        if bytes.contains(&0) {
            return Err(Error::protocol("string contains a NUL byte"));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol("string is not UTF-8"))
    }

    pub fn get_signature(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        if self.get_u8()? != 0 {
            return Err(Error::protocol("signature is not NUL terminated"));
        }
        if !bytes.is_ascii() || bytes.contains(&0) {
            return Err(Error::protocol("signature holds invalid bytes"));
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read one value of the given basic type
    pub fn get_value(&mut self, code: u8) -> Result<Value> {
        Ok(match code {
            b'y' => Value::Byte(self.get_u8()?),
            b'b' => match self.get_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(Error::protocol(format!("boolean value {other}"))),
            },
            b'n' => Value::Int16(self.get_u16()? as i16),
            b'q' => Value::Uint16(self.get_u16()?),
            b'i' => Value::Int32(self.get_u32()? as i32),
            b'u' => Value::Uint32(self.get_u32()?),
            b'h' => Value::UnixFd(self.get_u32()?),
            b'x' => Value::Int64(self.get_u64()? as i64),
            b't' => Value::Uint64(self.get_u64()?),
            b'd' => Value::Double(f64::from_bits(self.get_u64()?)),
            b's' => Value::String(self.get_string()?),
            b'o' => {
                let path = self.get_string()?;
                if !is_valid_object_path(&path) {
                    return Err(Error::protocol(format!("invalid object path '{path}'")));
                }
                Value::ObjectPath(path)
            }
            b'g' => Value::Signature(self.get_signature()?),
            other => {
                return Err(Error::protocol(format!(
                    "unsupported type code '{}'",
                    other as char
                )))
            }
        })
    }

    /// Read a variant. A basic value is returned; container contents are
    /// stepped over and yield `None`.
    pub fn get_variant(&mut self) -> Result<Option<Value>> {
        let sig = self.get_signature()?;
        match sig.as_bytes() {
            [code] if is_basic(*code) => self.get_value(*code).map(Some),
            [_, ..] => {
                let len = self.skip_complete(sig.as_bytes(), 1)?;
                if len != sig.len() {
                    return Err(Error::protocol(format!(
                        "variant signature '{sig}' holds more than one type"
                    )));
                }
                Ok(None)
            }
            [] => Err(Error::protocol("empty variant signature")),
        }
    }

    /// Step over one value of the first complete type in `sig`, returning
    /// how many signature bytes that type spans
    fn skip_complete(&mut self, sig: &[u8], depth: usize) -> Result<usize> {
        let len = complete_type_len(sig, depth)?;
        match sig[0] {
            b'a' => {
                let bytes = self.get_u32()?;
                if bytes > MAX_ARRAY_SIZE {
                    return Err(Error::protocol(format!("array of {bytes} bytes exceeds 64 MiB")));
                }
                let element_alignment = alignment_of(sig[1]).unwrap_or(1);
                self.align(element_alignment)?;
                self.take(bytes as usize)?;
            }
            b'(' | b'{' => {
                self.align(8)?;
                let mut inner = &sig[1..len - 1];
                while !inner.is_empty() {
                    let n = self.skip_complete(inner, depth + 1)?;
                    inner = &inner[n..];
                }
            }
            b'v' => {
                let inner = self.get_signature()?;
                let n = self.skip_complete(inner.as_bytes(), depth + 1)?;
                if n != inner.len() {
                    return Err(Error::protocol(format!(
                        "variant signature '{inner}' holds more than one type"
                    )));
                }
            }
            code => {
                self.get_value(code)?;
            }
        }
        Ok(len)
    }
}

/// Signature bytes spanned by the first complete type of `sig`
fn complete_type_len(sig: &[u8], depth: usize) -> Result<usize> {
    if depth > MAX_NESTING {
        return Err(Error::protocol("signature nests too deeply"));
    }
    match sig.first() {
        Some(b'a') => Ok(1 + complete_type_len(&sig[1..], depth + 1)?),
        Some(&open @ (b'(' | b'{')) => {
            let close = if open == b'(' { b')' } else { b'}' };
            let mut i = 1;
            loop {
                match sig.get(i) {
                    Some(&c) if c == close && i > 1 => return Ok(i + 1),
                    Some(_) => i += complete_type_len(&sig[i..], depth + 1)?,
                    None => {
                        return Err(Error::protocol(format!(
                            "unterminated container in signature '{}'",
                            String::from_utf8_lossy(sig)
                        )))
                    }
                }
            }
        }
        Some(&code) if is_basic(code) || code == b'v' => Ok(1),
        _ => Err(Error::protocol(format!(
            "invalid signature '{}'",
            String::from_utf8_lossy(sig)
        ))),
    }
}

/// Marshal `values` as a message body, returning its signature and bytes
///
/// The body always starts on an 8-byte boundary of the frame, so offsets
/// relative to the body start give the same alignment as frame offsets.
pub fn encode_body(endian: Endianness, values: &[Value]) -> Result<(String, Vec<u8>)> {
    let mut writer = WireWriter::new(endian);
    let mut signature = String::with_capacity(values.len());
    for value in values {
        signature.push(value.type_code() as char);
        writer.put_value(value)?;
    }
    if signature.len() > 255 {
        return Err(Error::protocol("body signature longer than 255 types"));
    }
    Ok((signature, writer.into_bytes()))
}

/// Unmarshal a body of basic values described by `signature`
pub fn decode_body(endian: Endianness, signature: &str, body: &[u8]) -> Result<Vec<Value>> {
    if !is_basic_signature(signature) {
        return Err(Error::protocol(format!(
            "body signature '{signature}' holds non-basic types"
        )));
    }
    let mut reader = WireReader::new(body, 0, endian);
    let values = signature
        .bytes()
        .map(|code| reader.get_value(code))
        .collect::<Result<Vec<_>>>()?;
    if !reader.is_empty() {
        return Err(Error::protocol(format!(
            "{} trailing bytes after body",
            reader.remaining()
        )));
    }
    Ok(values)
}

//! D-Bus frames and their reader/writer.
//!
//! Wire layout:
//!
//! ```text
//! 0      1      2      3      4          8          12            16
//! +------+------+------+------+----------+----------+-------------+------------------+-----+------+
//! |endian| type |flags | ver  | body len |  serial  | fields len  | a(yv) fields ... | pad | body |
//! +------+------+------+------+----------+----------+-------------+------------------+-----+------+
//! ```
//!
//! The header (including the field array) is padded to a multiple of 8 so
//! the body always starts 8-aligned.

use std::{
    io::{self, BufReader, Read, Write},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use crate::{
    config::{MAX_ARRAY_SIZE, MAX_MESSAGE_SIZE},
    error::{Error, Result},
    marshal::{decode_body, encode_body, Endianness, Value, WireReader, WireWriter},
};

/// The only major protocol version in existence
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header plus the field array length
const PREFIX_LEN: usize = 16;

/// Most file descriptors one frame may carry (the kernel's SCM_MAX_FD)
pub const MAX_UNIX_FDS: usize = 253;

/// Kind of message carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall   = 1,
    MethodReturn = 2,
    Error        = 3,
    Signal       = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NO_REPLY_EXPECTED: Flags = Flags(0x01);
    pub const NO_AUTO_START: Flags = Flags(0x02);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Flags = Flags(0x04);

    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Raw flag byte; unknown bits are kept as received
    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Well-known header field codes
pub mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;

    /// Type code a well-known field must carry
    pub fn expected_type(code: u8) -> Option<u8> {
        match code {
            PATH => Some(b'o'),
            INTERFACE | MEMBER | ERROR_NAME | DESTINATION | SENDER => Some(b's'),
            REPLY_SERIAL | UNIX_FDS => Some(b'u'),
            SIGNATURE => Some(b'g'),
            _ => None,
        }
    }
}

/// One `(code, variant)` entry of the header field array
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    pub code:  u8,
    pub value: Value,
}

/// One complete D-Bus message: header plus body bytes, and the file
/// descriptors that travel next to it
#[derive(Debug, Clone)]
pub struct Frame {
    endianness:   Endianness,
    message_type: MessageType,
    flags:        Flags,
    version:      u8,
    serial:       u32,
    fields:       Vec<HeaderField>,
    body:         Vec<u8>,
    fds:          Vec<Arc<OwnedFd>>,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.endianness == other.endianness
            && self.message_type == other.message_type
            && self.flags == other.flags
            && self.version == other.version
            && self.serial == other.serial
            && self.fields == other.fields
            && self.body == other.body
            && self.fds.len() == other.fds.len()
            && self
                .fds
                .iter()
                .zip(&other.fds)
                .all(|(a, b)| a.as_raw_fd() == b.as_raw_fd())
    }
}

impl Frame {
    /// Empty frame of the given type in native byte order. The serial is
    /// left at 0 and must be set before the frame is written.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            endianness: Endianness::native(),
            message_type,
            flags: Flags::empty(),
            version: PROTOCOL_VERSION,
            serial: 0,
            fields: Vec::new(),
            body: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Method call addressed to `path` / `member`
    pub fn method_call(path: &str, member: &str) -> Self {
        Self::new(MessageType::MethodCall)
            .with_field(field::PATH, Value::ObjectPath(path.to_string()))
            .with_field(field::MEMBER, Value::String(member.to_string()))
    }

    /// Successful reply to `call`
    pub fn method_return(call: &Frame) -> Self {
        Self::reply_to(MessageType::MethodReturn, call)
    }

    /// Error reply to `call`
    pub fn error(call: &Frame, error_name: &str) -> Self {
        Self::reply_to(MessageType::Error, call)
            .with_field(field::ERROR_NAME, Value::String(error_name.to_string()))
    }

    /// Broadcast signal
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Self::new(MessageType::Signal)
            .with_field(field::PATH, Value::ObjectPath(path.to_string()))
            .with_field(field::INTERFACE, Value::String(interface.to_string()))
            .with_field(field::MEMBER, Value::String(member.to_string()))
    }

    fn reply_to(message_type: MessageType, call: &Frame) -> Self {
        let mut reply = Self::new(message_type)
            .with_endianness(call.endianness)
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_field(field::REPLY_SERIAL, Value::Uint32(call.serial));
        if let Some(sender) = call.sender() {
            reply = reply.with_field(field::DESTINATION, Value::String(sender.to_string()));
        }
        reply
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Set a header field, replacing any field with the same code
    pub fn with_field(mut self, code: u8, value: Value) -> Self {
        match self.fields.iter_mut().find(|f| f.code == code) {
            Some(existing) => existing.value = value,
            None => self.fields.push(HeaderField { code, value }),
        }
        self
    }

    pub fn with_interface(self, interface: &str) -> Self {
        self.with_field(field::INTERFACE, Value::String(interface.to_string()))
    }

    pub fn with_destination(self, destination: &str) -> Self {
        self.with_field(field::DESTINATION, Value::String(destination.to_string()))
    }

    pub fn with_sender(self, sender: &str) -> Self {
        self.with_field(field::SENDER, Value::String(sender.to_string()))
    }

    /// Marshal `values` as the body and record its signature
    pub fn with_body(self, values: &[Value]) -> Result<Self> {
        let (signature, body) = encode_body(self.endianness, values)?;
        Ok(self.with_raw_body(&signature, body))
    }

    /// Use already marshalled body bytes with the given signature
    pub fn with_raw_body(mut self, signature: &str, body: Vec<u8>) -> Self {
        if signature.is_empty() {
            self.fields.retain(|f| f.code != field::SIGNATURE);
        } else {
            self = self.with_field(field::SIGNATURE, Value::Signature(signature.to_string()));
        }
        self.body = body;
        self
    }

    /// Attach file descriptors and announce their number in `UNIX_FDS`.
    /// Body values of type `h` index into this list.
    pub fn with_fds<I, F>(mut self, fds: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Arc<OwnedFd>>,
    {
        self.fds = fds.into_iter().map(Into::into).collect();
        if self.fds.is_empty() {
            self.fields.retain(|f| f.code != field::UNIX_FDS);
            self
        } else {
            let count = self.fds.len() as u32;
            self.with_field(field::UNIX_FDS, Value::Uint32(count))
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Value of the header field `code`, if present
    pub fn field(&self, code: u8) -> Option<&Value> {
        self.fields.iter().find(|f| f.code == code).map(|f| &f.value)
    }

    pub fn path(&self) -> Option<&str> {
        self.field(field::PATH).and_then(Value::as_str)
    }

    pub fn interface(&self) -> Option<&str> {
        self.field(field::INTERFACE).and_then(Value::as_str)
    }

    pub fn member(&self) -> Option<&str> {
        self.field(field::MEMBER).and_then(Value::as_str)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.field(field::ERROR_NAME).and_then(Value::as_str)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.field(field::REPLY_SERIAL).and_then(Value::as_u32)
    }

    pub fn destination(&self) -> Option<&str> {
        self.field(field::DESTINATION).and_then(Value::as_str)
    }

    pub fn sender(&self) -> Option<&str> {
        self.field(field::SENDER).and_then(Value::as_str)
    }

    /// Body signature, empty when the frame has no body
    pub fn signature(&self) -> &str {
        self.field(field::SIGNATURE).and_then(Value::as_str).unwrap_or("")
    }

    /// Descriptor count announced by the header
    pub fn unix_fds(&self) -> Option<u32> {
        self.field(field::UNIX_FDS).and_then(Value::as_u32)
    }

    /// Descriptors carried by this frame
    pub fn fds(&self) -> &[Arc<OwnedFd>] {
        &self.fds
    }

    /// Unmarshal the body as basic values
    pub fn body_values(&self) -> Result<Vec<Value>> {
        decode_body(self.endianness, self.signature(), &self.body)
    }

    /// Check header invariants shared by the reader and the writer
    fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "protocol version {} is unsupported",
                self.version
            )));
        }
        if self.serial == 0 {
            return Err(Error::protocol("serial must not be zero"));
        }

        for (i, f) in self.fields.iter().enumerate() {
            if f.code == 0 {
                return Err(Error::protocol("header field code 0 is invalid"));
            }
            if let Some(expected) = field::expected_type(f.code) {
                if f.value.type_code() != expected {
                    return Err(Error::protocol(format!(
                        "header field {} must have type '{}', got '{}'",
                        f.code,
                        expected as char,
                        f.value.type_code() as char
                    )));
                }
                if self.fields[..i].iter().any(|g| g.code == f.code) {
                    return Err(Error::protocol(format!("duplicate header field {}", f.code)));
                }
            }
        }

        let required: &[u8] = match self.message_type {
            MessageType::MethodCall => &[field::PATH, field::MEMBER],
            MessageType::MethodReturn => &[field::REPLY_SERIAL],
            MessageType::Error => &[field::ERROR_NAME, field::REPLY_SERIAL],
            MessageType::Signal => &[field::PATH, field::INTERFACE, field::MEMBER],
        };
        if let Some(missing) = required.iter().find(|&&code| self.field(code).is_none()) {
            return Err(Error::protocol(format!(
                "{:?} frame is missing header field {missing}",
                self.message_type
            )));
        }

        if !self.body.is_empty() && self.field(field::SIGNATURE).is_none() {
            return Err(Error::protocol("non-empty body without a signature"));
        }

        let announced = self.unix_fds().unwrap_or(0) as usize;
        if announced > MAX_UNIX_FDS {
            return Err(Error::protocol(format!(
                "{announced} file descriptors exceed the limit of {MAX_UNIX_FDS}"
            )));
        }
        if announced != self.fds.len() {
            return Err(Error::protocol(format!(
                "frame announces {announced} file descriptors but carries {}",
                self.fds.len()
            )));
        }
        Ok(())
    }

    /// Serialize into wire bytes, refusing frames larger than `max_size`
    pub fn encode(&self, max_size: u32) -> Result<Vec<u8>> {
        self.validate()?;
        let body_len = u32::try_from(self.body.len()).map_err(|_| Error::FrameTooLarge {
            size: self.body.len() as u64,
            max:  u64::from(max_size),
        })?;

        let mut w = WireWriter::new(self.endianness);
        w.put_u8(self.endianness.to_byte());
        w.put_u8(self.message_type as u8);
        w.put_u8(self.flags.bits());
        w.put_u8(self.version);
        w.put_u32(body_len);
        w.put_u32(self.serial);
        w.put_u32(0);
        for f in &self.fields {
            w.pad_to(8);
            w.put_u8(f.code);
            w.put_variant(&f.value)?;
        }
        let fields_len = w.position() - PREFIX_LEN;
        if fields_len > MAX_ARRAY_SIZE as usize {
            return Err(Error::protocol("header field array exceeds 64 MiB"));
        }
        w.patch_u32(12, fields_len as u32);
        w.pad_to(8);

        let total = w.position() as u64 + u64::from(body_len);
        if total > u64::from(max_size) {
            return Err(Error::FrameTooLarge {
                size: total,
                max:  u64::from(max_size),
            });
        }
        w.put_bytes(&self.body);
        Ok(w.into_bytes())
    }
}

fn padded8(len: u64) -> u64 {
    (len + 7) & !7
}

/// Reads whole frames from a byte stream
pub struct FrameReader<R> {
    inner:            R,
    max_message_size: u32,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_message_size: u32) -> Self {
        Self {
            inner,
            max_message_size: max_message_size.min(MAX_MESSAGE_SIZE),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read exactly one frame, blocking until it is complete. Frames that
    /// announce file descriptors fail here, use
    /// [`read_frame_with_fds`](Self::read_frame_with_fds) on a socket.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let frame = self.read_unchecked()?;
        finish_read(frame)
    }

    fn read_unchecked(&mut self) -> Result<Frame> {
        let mut prefix = [0u8; PREFIX_LEN];
        self.inner.read_exact(&mut prefix)?;

        let endianness = Endianness::from_byte(prefix[0]).ok_or_else(|| {
            Error::protocol(format!("unsupported endianness marker 0x{:02x}", prefix[0]))
        })?;
        let message_type = MessageType::from_u8(prefix[1])
            .ok_or_else(|| Error::protocol(format!("invalid message type {}", prefix[1])))?;
        let flags = Flags::from_bits(prefix[2]);
        let version = prefix[3];
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "protocol version {version} is unsupported"
            )));
        }
        let body_len = endianness.read_u32([prefix[4], prefix[5], prefix[6], prefix[7]]);
        let serial = endianness.read_u32([prefix[8], prefix[9], prefix[10], prefix[11]]);
        let fields_len = endianness.read_u32([prefix[12], prefix[13], prefix[14], prefix[15]]);

        let header_len = padded8(PREFIX_LEN as u64 + u64::from(fields_len));
        let total = header_len + u64::from(body_len);
        if total > u64::from(self.max_message_size) {
            tracing::warn!(
                "Rejecting frame serial={} announcing {} bytes (max {})",
                serial,
                total,
                self.max_message_size
            );
            return Err(Error::FrameTooLarge {
                size: total,
                max:  u64::from(self.max_message_size),
            });
        }
        if fields_len > MAX_ARRAY_SIZE {
            return Err(Error::protocol("header field array exceeds 64 MiB"));
        }

        // bounded by max_message_size above
        let mut rest = vec![0u8; (total - PREFIX_LEN as u64) as usize];
        self.inner.read_exact(&mut rest)?;

        let body_start = (header_len - PREFIX_LEN as u64) as usize;
        let body = rest.split_off(body_start);
        let fields_bytes = &rest[..fields_len as usize];
        if rest[fields_len as usize..].iter().any(|&b| b != 0) {
            return Err(Error::protocol("non-zero header padding"));
        }

        let mut reader = WireReader::new(fields_bytes, PREFIX_LEN, endianness);
        let mut fields = Vec::new();
        while !reader.is_empty() {
            reader.align(8)?;
            let code = reader.get_u8()?;
            match reader.get_variant()? {
                Some(value) => fields.push(HeaderField { code, value }),
                None if field::expected_type(code).is_none() => {
                    tracing::debug!("Skipping header field {} holding a container", code);
                }
                None => {
                    return Err(Error::protocol(format!(
                        "header field {code} holds a container value"
                    )))
                }
            }
        }

        Ok(Frame {
            endianness,
            message_type,
            flags,
            version,
            serial,
            fields,
            body,
            fds: Vec::new(),
        })
    }
}

impl<R: Read + FdSource> FrameReader<R> {
    /// Read one frame and claim the file descriptors it announces from the
    /// descriptors received on the socket
    pub fn read_frame_with_fds(&mut self) -> Result<Frame> {
        let mut frame = self.read_unchecked()?;
        let announced = frame.unix_fds().unwrap_or(0) as usize;
        if announced > 0 && announced <= MAX_UNIX_FDS {
            frame.fds = self
                .inner
                .take_fds(announced)
                .into_iter()
                .map(Arc::new)
                .collect();
        }
        finish_read(frame)
    }
}

fn finish_read(frame: Frame) -> Result<Frame> {
    frame.validate()?;
    tracing::debug!(
        "Received {:?} serial={} body={} bytes fds={}",
        frame.message_type,
        frame.serial,
        frame.body.len(),
        frame.fds.len()
    );
    Ok(frame)
}

/// Writes whole frames to a byte stream
pub struct FrameWriter<W> {
    inner:            W,
    max_message_size: u32,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, max_message_size: u32) -> Self {
        Self {
            inner,
            max_message_size: max_message_size.min(MAX_MESSAGE_SIZE),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Serialize and write one frame; partial writes are retried until the
    /// whole frame is out
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if !frame.fds.is_empty() {
            return Err(Error::protocol(
                "frame carries file descriptors but the stream cannot pass them",
            ));
        }
        let bytes = frame.encode(self.max_message_size)?;
        self.write_all_retrying(&bytes)?;
        self.inner.flush()?;
        tracing::debug!(
            "Sent {:?} serial={} ({} bytes)",
            frame.message_type,
            frame.serial,
            bytes.len()
        );
        Ok(())
    }

    fn write_all_retrying(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.inner.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<W: FdSink> FrameWriter<W> {
    /// Like [`write_frame`](Self::write_frame), but sends the frame's file
    /// descriptors along with its first byte
    pub fn write_frame_with_fds(&mut self, frame: &Frame) -> Result<()> {
        if frame.fds.is_empty() {
            return self.write_frame(frame);
        }
        let bytes = frame.encode(self.max_message_size)?;
        let fds: Vec<BorrowedFd<'_>> = frame.fds.iter().map(|fd| fd.as_fd()).collect();

        let sent = loop {
            match self.inner.write_with_fds(&bytes, &fds) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        self.write_all_retrying(&bytes[sent..])?;
        self.inner.flush()?;
        tracing::debug!(
            "Sent {:?} serial={} ({} bytes, {} fds)",
            frame.message_type,
            frame.serial,
            bytes.len(),
            fds.len()
        );
        Ok(())
    }
}

/// A stream that keeps file descriptors received next to its bytes
pub trait FdSource {
    /// Remove up to `count` received descriptors, oldest first
    fn take_fds(&mut self, count: usize) -> Vec<OwnedFd>;
}

impl<R: FdSource> FdSource for BufReader<R> {
    fn take_fds(&mut self, count: usize) -> Vec<OwnedFd> {
        self.get_mut().take_fds(count)
    }
}

/// A stream that can attach file descriptors to the bytes it writes
pub trait FdSink: Write {
    /// Write a prefix of `buf` with `fds` attached to its first byte
    fn write_with_fds(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;
}

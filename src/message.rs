//! `Message`: the framed unit exchanged with the bus — a 12-byte fixed
//! header, an `a(yv)` array of optional header fields, then the body.
//!
//! Parsing is staged: the first 16 bytes are enough to learn the
//! header-fields length, then the rest of the header, then the body,
//! so a partial buffer reports `Parsed::Incomplete` rather than erroring.
//! Each message type has its own set of required header fields, checked
//! by `validate_required` before serializing.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::arguments::{Arguments, ByteOrderTag};
use crate::dbus_reader::ByteReader;
use crate::dbus_writer::ByteWriter;
use crate::error::{Error, Result};
use crate::fd::OwnedFd;
use crate::names;
use crate::signature;

/// Header fields beyond the 12-byte fixed header are capped generously;
/// this bounds how much we'll buffer while waiting for a full header.
pub const MAX_HEADER_FIELDS_LEN: usize = 64 * 1024 * 1024;
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;
pub const MAX_UNIX_FDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(MessageType::Invalid),
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            _ => Err(Error::MessageType),
        }
    }
}

bitflags! {
    pub struct HeaderFlags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const NO_AUTO_START = 0x02;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x04;
    }
}

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// One entry of the `a(yv)` header-field array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableHeader {
    Path(String),
    Interface(String),
    Member(String),
    ErrorName(String),
    ReplySerial(u32),
    Destination(String),
    Sender(String),
    Signature(String),
    UnixFds(u32),
}

impl VariableHeader {
    fn code(&self) -> u8 {
        match self {
            VariableHeader::Path(_) => FIELD_PATH,
            VariableHeader::Interface(_) => FIELD_INTERFACE,
            VariableHeader::Member(_) => FIELD_MEMBER,
            VariableHeader::ErrorName(_) => FIELD_ERROR_NAME,
            VariableHeader::ReplySerial(_) => FIELD_REPLY_SERIAL,
            VariableHeader::Destination(_) => FIELD_DESTINATION,
            VariableHeader::Sender(_) => FIELD_SENDER,
            VariableHeader::Signature(_) => FIELD_SIGNATURE,
            VariableHeader::UnixFds(_) => FIELD_UNIX_FDS,
        }
    }

    fn encode<T: ByteOrder>(&self, w: &mut ByteWriter) {
        w.align(8);
        w.write_u8(self.code());
        match self {
            VariableHeader::Path(s) => {
                w.write_string8("o");
                w.write_string32::<T>(s);
            }
            VariableHeader::Interface(s)
            | VariableHeader::Member(s)
            | VariableHeader::ErrorName(s)
            | VariableHeader::Destination(s)
            | VariableHeader::Sender(s) => {
                w.write_string8("s");
                w.write_string32::<T>(s);
            }
            VariableHeader::Signature(s) => {
                w.write_string8("g");
                w.write_string8(s);
            }
            VariableHeader::ReplySerial(v) | VariableHeader::UnixFds(v) => {
                w.write_string8("u");
                w.write_u32::<T>(*v);
            }
        }
    }

    fn decode<T: ByteOrder>(r: &mut ByteReader<'_>) -> Result<Self> {
        r.align(8)?;
        let code = r.read_u8()?;
        let sig = r.read_string8()?;
        match (code, sig.as_str()) {
            (FIELD_PATH, "o") => {
                let s = r.read_string32::<T>()?;
                signature::validate_object_path(s.as_bytes())?;
                Ok(VariableHeader::Path(s))
            }
            (FIELD_INTERFACE, "s") => Ok(VariableHeader::Interface(r.read_string32::<T>()?)),
            (FIELD_MEMBER, "s") => Ok(VariableHeader::Member(r.read_string32::<T>()?)),
            (FIELD_ERROR_NAME, "s") => Ok(VariableHeader::ErrorName(r.read_string32::<T>()?)),
            (FIELD_REPLY_SERIAL, "u") => Ok(VariableHeader::ReplySerial(r.read_u32::<T>()?)),
            (FIELD_DESTINATION, "s") => Ok(VariableHeader::Destination(r.read_string32::<T>()?)),
            (FIELD_SENDER, "s") => Ok(VariableHeader::Sender(r.read_string32::<T>()?)),
            (FIELD_SIGNATURE, "g") => {
                let s = r.read_string8()?;
                signature::parse_signature(s.as_bytes())?;
                Ok(VariableHeader::Signature(s))
            }
            (FIELD_UNIX_FDS, "u") => Ok(VariableHeader::UnixFds(r.read_u32::<T>()?)),
            _ => Err(Error::MalformedMessageData),
        }
    }
}

/// Outcome of feeding bytes to `Message::try_parse`.
pub enum Parsed {
    /// Not enough bytes yet; the caller should read more and retry.
    Incomplete,
    Complete { message: Message, consumed: usize },
}

#[derive(Debug)]
pub struct Message {
    pub byte_order: ByteOrderTag,
    pub message_type: MessageType,
    pub flags: HeaderFlags,
    pub protocol_version: u8,
    pub serial: u32,
    pub headers: Vec<VariableHeader>,
    pub body: Arguments,
    fds: Vec<OwnedFd>,
}

impl Message {
    fn new(message_type: MessageType) -> Self {
        Message {
            byte_order: ByteOrderTag::native(),
            message_type,
            flags: HeaderFlags::empty(),
            protocol_version: 1,
            serial: 0,
            headers: Vec::new(),
            body: Arguments::empty(),
            fds: Vec::new(),
        }
    }

    pub fn method_call(path: &str, interface: Option<&str>, method: &str, destination: Option<&str>) -> Result<Self> {
        signature::validate_object_path(path.as_bytes())?;
        if let Some(i) = interface {
            names::InterfaceName::new(i)?;
        }
        names::MemberName::new(method)?;
        if let Some(d) = destination {
            names::BusName::new(d)?;
        }
        let mut m = Message::new(MessageType::MethodCall);
        m.headers.push(VariableHeader::Path(path.to_string()));
        if let Some(i) = interface {
            m.headers.push(VariableHeader::Interface(i.to_string()));
        }
        m.headers.push(VariableHeader::Member(method.to_string()));
        if let Some(d) = destination {
            m.headers.push(VariableHeader::Destination(d.to_string()));
        }
        Ok(m)
    }

    pub fn signal(path: &str, interface: &str, method: &str) -> Result<Self> {
        signature::validate_object_path(path.as_bytes())?;
        names::InterfaceName::new(interface)?;
        names::MemberName::new(method)?;
        let mut m = Message::new(MessageType::Signal);
        m.headers.push(VariableHeader::Path(path.to_string()));
        m.headers.push(VariableHeader::Interface(interface.to_string()));
        m.headers.push(VariableHeader::Member(method.to_string()));
        m.flags.insert(HeaderFlags::NO_REPLY_EXPECTED);
        Ok(m)
    }

    pub fn method_return(reply_serial: u32) -> Self {
        let mut m = Message::new(MessageType::MethodReturn);
        m.headers.push(VariableHeader::ReplySerial(reply_serial));
        m.flags.insert(HeaderFlags::NO_REPLY_EXPECTED);
        m
    }

    pub fn error(error_name: &str, reply_serial: u32) -> Result<Self> {
        names::ErrorName::new(error_name)?;
        let mut m = Message::new(MessageType::Error);
        m.headers.push(VariableHeader::ErrorName(error_name.to_string()));
        m.headers.push(VariableHeader::ReplySerial(reply_serial));
        m.flags.insert(HeaderFlags::NO_REPLY_EXPECTED);
        Ok(m)
    }

    pub fn with_body(mut self, body: Arguments) -> Self {
        if !body.signature.is_empty() {
            self.headers.push(VariableHeader::Signature(body.signature.clone()));
        }
        self.body = body;
        self
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::Path(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn interface(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::Interface(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn member(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::Member(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn error_name(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::ErrorName(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::ReplySerial(v) => Some(*v),
            _ => None,
        })
    }

    pub fn destination(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::Destination(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn sender(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| match h {
            VariableHeader::Sender(s) => Some(s.as_str()),
            _ => None,
        })
    }

    fn validate_required(&self) -> Result<()> {
        match self.message_type {
            MessageType::MethodCall => {
                if self.path().is_none() {
                    return Err(Error::MessagePath);
                }
                if self.member().is_none() {
                    return Err(Error::MessageMethod);
                }
            }
            MessageType::Signal => {
                if self.path().is_none() {
                    return Err(Error::MessagePath);
                }
                if self.interface().is_none() {
                    return Err(Error::MessageInterface);
                }
                if self.member().is_none() {
                    return Err(Error::MessageMethod);
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial().is_none() {
                    return Err(Error::MessageReplySerial);
                }
            }
            MessageType::Error => {
                if self.error_name().is_none() {
                    return Err(Error::MessageErrorName);
                }
                if self.reply_serial().is_none() {
                    return Err(Error::MessageReplySerial);
                }
            }
            MessageType::Invalid => return Err(Error::MessageType),
        }
        Ok(())
    }

    /// Serialize to wire bytes. Validates required headers, the
    /// passed-fd limit, and the 128 MiB total-message ceiling.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.validate_required()?;
        if self.serial == 0 {
            return Err(Error::MessageSerial);
        }
        if self.body.fds.len() > MAX_UNIX_FDS {
            return Err(Error::SendingTooManyUnixFds);
        }

        let mut fields = ByteWriter::new();
        let mut headers = self.headers.clone();
        if !self.body.fds.is_empty() && !headers.iter().any(|h| matches!(h, VariableHeader::UnixFds(_))) {
            headers.push(VariableHeader::UnixFds(self.body.fds.len() as u32));
        }
        match self.byte_order {
            ByteOrderTag::Little => {
                for h in &headers {
                    h.encode::<LittleEndian>(&mut fields);
                }
            }
            ByteOrderTag::Big => {
                for h in &headers {
                    h.encode::<BigEndian>(&mut fields);
                }
            }
        }
        let fields_bytes = fields.into_vec();

        let mut out = ByteWriter::with_capacity(16 + fields_bytes.len() + self.body.body.len());
        out.write_u8(self.byte_order.letter());
        out.write_u8(self.message_type as u8);
        out.write_u8(self.flags.bits());
        out.write_u8(self.protocol_version);
        match self.byte_order {
            ByteOrderTag::Little => {
                out.write_u32::<LittleEndian>(self.body.body.len() as u32);
                out.write_u32::<LittleEndian>(self.serial);
                out.write_u32::<LittleEndian>(fields_bytes.len() as u32);
            }
            ByteOrderTag::Big => {
                out.write_u32::<BigEndian>(self.body.body.len() as u32);
                out.write_u32::<BigEndian>(self.serial);
                out.write_u32::<BigEndian>(fields_bytes.len() as u32);
            }
        }
        out.buf.extend_from_slice(&fields_bytes);
        out.align(8);
        out.buf.extend_from_slice(&self.body.body);

        if out.len() > MAX_MESSAGE_LEN {
            return Err(Error::ArgumentsTooLong);
        }
        Ok(out.into_vec())
    }

    /// Attempt to parse one message from the front of `buf`. `incoming_fds`
    /// are the out-of-band descriptors the transport received alongside
    /// these bytes. Stateless and pure: the same buffer always parses to
    /// the same result, so delivering bytes one at a time and re-calling
    /// this on every new byte is equivalent to delivering them all at
    /// once.
    pub fn try_parse(buf: &[u8], incoming_fds: Vec<OwnedFd>) -> Result<Parsed> {
        if buf.len() < 16 {
            return Ok(Parsed::Incomplete);
        }
        let byte_order = ByteOrderTag::from_letter(buf[0])?;
        let message_type = MessageType::from_u8(buf[1])?;
        let flags = HeaderFlags::from_bits_truncate(buf[2]);
        let protocol_version = buf[3];
        if protocol_version != 1 {
            return Err(Error::MessageProtocolVersion);
        }

        let (body_len, serial, fields_len) = match byte_order {
            ByteOrderTag::Little => {
                (LittleEndian::read_u32(&buf[4..8]), LittleEndian::read_u32(&buf[8..12]), LittleEndian::read_u32(&buf[12..16]))
            }
            ByteOrderTag::Big => {
                (BigEndian::read_u32(&buf[4..8]), BigEndian::read_u32(&buf[8..12]), BigEndian::read_u32(&buf[12..16]))
            }
        };

        let fields_len = fields_len as usize;
        let body_len = body_len as usize;
        if fields_len > MAX_HEADER_FIELDS_LEN {
            return Err(Error::ArrayOrDictTooLong);
        }
        let fields_end = 16 + fields_len;
        let padded_fields_end = (fields_end + 7) / 8 * 8;
        let total_len = padded_fields_end + body_len;
        if total_len > MAX_MESSAGE_LEN {
            return Err(Error::ArgumentsTooLong);
        }
        if buf.len() < total_len {
            return Ok(Parsed::Incomplete);
        }

        let field_bytes = &buf[16..fields_end];
        let mut headers = Vec::new();
        match byte_order {
            ByteOrderTag::Little => {
                let mut r = ByteReader::new(field_bytes);
                while r.remaining() > 0 {
                    headers.push(VariableHeader::decode::<LittleEndian>(&mut r)?);
                }
            }
            ByteOrderTag::Big => {
                let mut r = ByteReader::new(field_bytes);
                while r.remaining() > 0 {
                    headers.push(VariableHeader::decode::<BigEndian>(&mut r)?);
                }
            }
        }

        let signature = headers
            .iter()
            .find_map(|h| match h {
                VariableHeader::Signature(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let body_bytes = buf[padded_fields_end..total_len].to_vec();
        let raw_fds: Vec<std::os::unix::io::RawFd> = incoming_fds.iter().map(|f| f.as_raw_fd()).collect();
        let body = Arguments::from_body(&signature, body_bytes, byte_order, raw_fds)?;

        let message = Message { byte_order, message_type, flags, protocol_version, serial, headers, body, fds: incoming_fds };
        message.validate_required()?;
        if message.serial == 0 {
            return Err(Error::MessageSerial);
        }

        Ok(Parsed::Complete { message, consumed: total_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arguments::Writer;

    #[test]
    fn method_call_serializes_and_parses_back() {
        let mut msg = Message::method_call("/foo", Some("org.bar"), "Ping", None).unwrap();
        msg.set_serial(1);
        let bytes = msg.serialize().unwrap();

        match Message::try_parse(&bytes, Vec::new()).unwrap() {
            Parsed::Complete { message, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(message.path(), Some("/foo"));
                assert_eq!(message.interface(), Some("org.bar"));
                assert_eq!(message.member(), Some("Ping"));
                assert_eq!(message.serial, 1);
                let reserialized = message.serialize().unwrap();
                assert_eq!(reserialized, bytes);
            }
            Parsed::Incomplete => panic!("expected a complete message"),
        }
    }

    #[test]
    fn incremental_delivery_matches_all_at_once() {
        let mut w = Writer::new();
        w.write_string("hello").unwrap();
        let body = w.finish().unwrap();

        let mut msg = Message::method_call("/foo", None, "Echo", None).unwrap().with_body(body);
        msg.set_serial(7);
        let bytes = msg.serialize().unwrap();

        for n in 1..bytes.len() {
            assert!(matches!(Message::try_parse(&bytes[..n], Vec::new()).unwrap(), Parsed::Incomplete));
        }
        match Message::try_parse(&bytes, Vec::new()).unwrap() {
            Parsed::Complete { message, consumed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(message.body.values().len(), 1);
            }
            Parsed::Incomplete => panic!("expected a complete message"),
        }
    }

    #[test]
    fn method_call_without_member_rejected() {
        let mut msg = Message::method_call("/foo", None, "Ping", None).unwrap();
        msg.headers.retain(|h| !matches!(h, VariableHeader::Member(_)));
        msg.set_serial(1);
        assert!(matches!(msg.serialize(), Err(Error::MessageMethod)));
    }

    #[test]
    fn method_return_requires_reply_serial() {
        let mut msg = Message::new(MessageType::MethodReturn);
        msg.set_serial(1);
        assert!(matches!(msg.serialize(), Err(Error::MessageReplySerial)));
    }

    #[test]
    fn header_flags_bits_are_distinct() {
        assert_eq!(HeaderFlags::NO_REPLY_EXPECTED.bits(), 0x01);
        assert_eq!(HeaderFlags::NO_AUTO_START.bits(), 0x02);
        assert_eq!(HeaderFlags::ALLOW_INTERACTIVE_AUTHORIZATION.bits(), 0x04);
    }

    #[test]
    fn zero_serial_rejected() {
        let msg = Message::method_return(1);
        assert!(matches!(msg.serialize(), Err(Error::MessageSerial)));
    }
}

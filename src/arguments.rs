//! The argument codec: `Arguments`, `Writer`, `Reader`.
//!
//! `Writer` assembles a `Value` tree while tracking nesting depth and the
//! signature as arguments are written; `Reader` decodes a complete byte
//! buffer into a tree once, then walks it with a begin/end/read/skip
//! surface for primitives, arrays, structs, dicts, and variants.

use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian, WriteBytesExt};
use std::os::unix::io::RawFd;

use crate::dbus_reader::ByteReader;
use crate::dbus_writer::ByteWriter;
use crate::error::{Error, Result};
use crate::signature::{self, Type, MAX_ARRAY_NESTING, MAX_STRUCT_NESTING, MAX_TOTAL_NESTING};
use crate::value::Value;

pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;
pub const MAX_ARGUMENTS_LEN: usize = 128 * 1024 * 1024;

/// Wire byte order tag as it appears in the message header: `'l'` little, `'B'` big.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrderTag {
    Little,
    Big,
}

impl ByteOrderTag {
    pub fn letter(self) -> u8 {
        match self {
            ByteOrderTag::Little => b'l',
            ByteOrderTag::Big => b'B',
        }
    }

    pub fn from_letter(b: u8) -> Result<Self> {
        match b {
            b'l' => Ok(ByteOrderTag::Little),
            b'B' => Ok(ByteOrderTag::Big),
            _ => Err(Error::MalformedMessageData),
        }
    }

    pub fn native() -> Self {
        #[cfg(target_endian = "little")]
        {
            ByteOrderTag::Little
        }
        #[cfg(target_endian = "big")]
        {
            ByteOrderTag::Big
        }
    }
}

/// A fully decoded/encodable argument list: the payload of a `Message`.
#[derive(Debug, Clone)]
pub struct Arguments {
    pub signature: String,
    pub body: Vec<u8>,
    pub byte_order: ByteOrderTag,
    pub fds: Vec<RawFd>,
    values: Vec<Value>,
}

impl PartialEq for Arguments {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature && self.values == other.values && self.fds.len() == other.fds.len()
    }
}

impl Arguments {
    /// The empty argument list (no body), used e.g. for `Hello`.
    pub fn empty() -> Self {
        Arguments {
            signature: String::new(),
            body: Vec::new(),
            byte_order: ByteOrderTag::native(),
            fds: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Parse `body` bytes according to `signature`, producing the decoded
    /// `Value` tree. Only ever called once the full body is available.
    pub fn from_body(signature: &str, body: Vec<u8>, byte_order: ByteOrderTag, fds: Vec<RawFd>) -> Result<Self> {
        let types = signature::parse_signature(signature.as_bytes())?;
        let values = match byte_order {
            ByteOrderTag::Little => decode_values::<LittleEndian>(&body, &types)?,
            ByteOrderTag::Big => decode_values::<BigEndian>(&body, &types)?,
        };
        Ok(Arguments { signature: signature.to_string(), body, byte_order, fds, values })
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader {
            stack: vec![Frame::Seq(FrameKind::Root, &self.values, 0)],
            nil_array_nesting: 0,
            byte_order: self.byte_order,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Option controlling how `Writer::begin_array`/`begin_dict` behave with
/// respect to an empty aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOption {
    NonEmptyArray,
    WriteTypesOfEmptyArray,
    RestartEmptyArrayToWriteTypes,
}

enum WFrame {
    Root(Vec<Value>),
    Array { items: Vec<Value>, elem_type: Option<Type>, discard: bool },
    Dict { entries: Vec<(Value, Value)>, key_type: Option<Type>, val_type: Option<Type>, pending_key: Option<Value>, discard: bool },
    Struct(Vec<Value>),
    Variant(Option<Value>),
}

/// Streaming argument builder. Stays in an error state once any operation
/// fails; subsequent operations are no-ops that return the same error.
pub struct Writer {
    stack: Vec<WFrame>,
    array_depth: u32,
    struct_depth: u32,
    total_depth: u32,
    discard_depth: u32,
    error: Option<Error>,
    byte_order: ByteOrderTag,
    fds: Vec<RawFd>,
}

impl Writer {
    pub fn new() -> Self {
        Self::with_byte_order(ByteOrderTag::native())
    }

    pub fn with_byte_order(byte_order: ByteOrderTag) -> Self {
        Writer {
            stack: vec![WFrame::Root(Vec::new())],
            array_depth: 0,
            struct_depth: 0,
            total_depth: 0,
            discard_depth: 0,
            error: None,
            byte_order,
            fds: Vec::new(),
        }
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        if self.error.is_none() {
            self.error = Some(clone_error(&e));
        }
        Err(e)
    }

    fn check_ok(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(clone_error(e));
        }
        Ok(())
    }

    fn push_value(&mut self, v: Value) -> Result<()> {
        self.check_ok()?;
        let top = self.stack.last_mut().expect("root frame always present");
        match top {
            WFrame::Root(items) => items.push(v),
            WFrame::Array { items, elem_type, discard } => {
                let t = v.value_type();
                match elem_type {
                    None => *elem_type = Some(t),
                    Some(existing) if *existing == t => {}
                    Some(_) => return self.fail(Error::TypeMismatchInSubsequentArrayIteration),
                }
                if !*discard {
                    items.push(v);
                }
            }
            WFrame::Dict { entries, key_type, val_type, pending_key, discard } => match pending_key.take() {
                None => {
                    if !v.value_type().is_basic() {
                        return self.fail(Error::InvalidKeyTypeInDict);
                    }
                    let t = v.value_type();
                    match key_type {
                        None => *key_type = Some(t),
                        Some(existing) if *existing == t => {}
                        Some(_) => return self.fail(Error::TypeMismatchInSubsequentArrayIteration),
                    }
                    *pending_key = Some(v);
                }
                Some(key) => {
                    let t = v.value_type();
                    match val_type {
                        None => *val_type = Some(t),
                        Some(existing) if *existing == t => {}
                        Some(_) => return self.fail(Error::TypeMismatchInSubsequentArrayIteration),
                    }
                    if !*discard {
                        entries.push((key, v));
                    }
                }
            },
            WFrame::Struct(items) => items.push(v),
            WFrame::Variant(slot) => {
                if slot.is_some() {
                    return self.fail(Error::NotSingleCompleteTypeInVariant);
                }
                *slot = Some(v);
            }
        }
        Ok(())
    }

    pub fn write_byte(&mut self, v: u8) -> Result<()> {
        self.push_value(Value::Byte(v))
    }
    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.push_value(Value::Bool(v))
    }
    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.push_value(Value::I16(v))
    }
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.push_value(Value::U16(v))
    }
    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.push_value(Value::I32(v))
    }
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.push_value(Value::U32(v))
    }
    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.push_value(Value::I64(v))
    }
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.push_value(Value::U64(v))
    }
    pub fn write_double(&mut self, v: f64) -> Result<()> {
        self.push_value(Value::Double(v))
    }
    pub fn write_string(&mut self, v: &str) -> Result<()> {
        self.check_ok()?;
        if self.discard_depth == 0 {
            if let Err(e) = signature::validate_string(v) {
                return self.fail(e);
            }
        }
        self.push_value(Value::String(v.to_string()))
    }
    pub fn write_object_path(&mut self, v: &str) -> Result<()> {
        self.check_ok()?;
        if self.discard_depth == 0 {
            if let Err(e) = signature::validate_object_path(v) {
                return self.fail(e);
            }
        }
        self.push_value(Value::ObjectPath(v.to_string()))
    }
    pub fn write_signature(&mut self, v: &str) -> Result<()> {
        self.check_ok()?;
        if v.len() > 255 {
            return self.fail(Error::SignatureTooLong);
        }
        if self.discard_depth == 0 {
            if let Err(e) = signature::parse_signature(v.as_bytes()) {
                return self.fail(e);
            }
        }
        self.push_value(Value::Signature(v.to_string()))
    }
    pub fn write_unix_fd(&mut self, fd: RawFd) -> Result<()> {
        self.check_ok()?;
        let idx = self.fds.len() as u32;
        self.fds.push(fd);
        self.push_value(Value::UnixFd(idx))
    }

    /// Fast path for `ay`-shaped data: validates length and appends a
    /// ready-made byte array without per-element dispatch overhead.
    pub fn write_primitive_byte_array(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_primitive_array(Type::Byte, bytes)
    }

    /// Fast path for any fixed-size primitive array (`y`, `n`, `q`, `i`,
    /// `u`, `x`, `t`, `d` elements; not `b` or `h`, which don't have a raw
    /// wire representation worth bulk-copying). `bytes` must already be
    /// encoded in this writer's byte order and its length a multiple of
    /// `elem_type`'s size; decodes the whole slice in one pass instead of
    /// dispatching through `write_i32`/`write_u16`/etc per element.
    pub fn write_primitive_array(&mut self, elem_type: Type, bytes: &[u8]) -> Result<()> {
        self.check_ok()?;
        let elem_size = match primitive_array_element_size(&elem_type) {
            Some(size) => size,
            None => return self.fail(Error::InvalidSignature),
        };
        if bytes.len() % elem_size != 0 {
            return self.fail(Error::MalformedMessageData);
        }
        if bytes.len() > MAX_ARRAY_LEN {
            return self.fail(Error::ArrayOrDictTooLong);
        }
        let items = match self.byte_order {
            ByteOrderTag::Little => decode_primitive_chunks::<LittleEndian>(&elem_type, bytes),
            ByteOrderTag::Big => decode_primitive_chunks::<BigEndian>(&elem_type, bytes),
        };
        let items = match items {
            Ok(items) => items,
            Err(e) => return self.fail(e),
        };
        self.begin_array(ArrayOption::NonEmptyArray)?;
        match self.stack.last_mut() {
            Some(WFrame::Array { items: slot, elem_type: et, .. }) => {
                *et = Some(elem_type);
                *slot = items;
            }
            _ => unreachable!("begin_array always pushes a WFrame::Array"),
        }
        self.end_array()
    }

    fn enter_aggregate(&mut self) -> Result<()> {
        self.total_depth += 1;
        if self.total_depth > MAX_TOTAL_NESTING {
            return self.fail(Error::ExcessiveNesting);
        }
        Ok(())
    }

    pub fn begin_array(&mut self, option: ArrayOption) -> Result<()> {
        self.check_ok()?;
        self.enter_aggregate()?;
        self.array_depth += 1;
        if self.array_depth > MAX_ARRAY_NESTING {
            return self.fail(Error::ExcessiveNesting);
        }
        let discard = matches!(option, ArrayOption::WriteTypesOfEmptyArray | ArrayOption::RestartEmptyArrayToWriteTypes);
        if discard {
            self.discard_depth += 1;
        }
        self.stack.push(WFrame::Array { items: Vec::new(), elem_type: None, discard });
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.check_ok()?;
        match self.stack.pop() {
            Some(WFrame::Array { items, elem_type, discard }) => {
                self.array_depth -= 1;
                self.total_depth -= 1;
                if discard {
                    self.discard_depth -= 1;
                }
                let elem_type = elem_type.ok_or(()).unwrap_or(Type::Byte);
                self.push_value(Value::Array { elem_type, items })
            }
            Some(other) => {
                self.stack.push(other);
                self.fail(Error::CannotEndArrayHere)
            }
            None => self.fail(Error::CannotEndArrayHere),
        }
    }

    pub fn begin_dict(&mut self, option: ArrayOption) -> Result<()> {
        self.check_ok()?;
        self.enter_aggregate()?;
        self.array_depth += 1;
        if self.array_depth > MAX_ARRAY_NESTING {
            return self.fail(Error::ExcessiveNesting);
        }
        let discard = matches!(option, ArrayOption::WriteTypesOfEmptyArray | ArrayOption::RestartEmptyArrayToWriteTypes);
        if discard {
            self.discard_depth += 1;
        }
        self.stack.push(WFrame::Dict { entries: Vec::new(), key_type: None, val_type: None, pending_key: None, discard });
        Ok(())
    }

    pub fn end_dict(&mut self) -> Result<()> {
        self.check_ok()?;
        match self.stack.pop() {
            Some(WFrame::Dict { entries, key_type, val_type, pending_key, discard }) => {
                self.array_depth -= 1;
                self.total_depth -= 1;
                if discard {
                    self.discard_depth -= 1;
                }
                if pending_key.is_some() {
                    return self.fail(Error::MalformedMessageData);
                }
                let key_type = key_type.unwrap_or(Type::Byte);
                let val_type = val_type.unwrap_or(Type::Byte);
                self.push_value(Value::Dict { key_type, val_type, entries })
            }
            Some(other) => {
                self.stack.push(other);
                self.fail(Error::CannotEndArrayHere)
            }
            None => self.fail(Error::CannotEndArrayHere),
        }
    }

    pub fn begin_struct(&mut self) -> Result<()> {
        self.check_ok()?;
        self.enter_aggregate()?;
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_NESTING {
            return self.fail(Error::ExcessiveNesting);
        }
        self.stack.push(WFrame::Struct(Vec::new()));
        Ok(())
    }

    pub fn end_struct(&mut self) -> Result<()> {
        self.check_ok()?;
        match self.stack.pop() {
            Some(WFrame::Struct(items)) => {
                self.struct_depth -= 1;
                self.total_depth -= 1;
                if items.is_empty() && self.discard_depth == 0 {
                    return self.fail(Error::EmptyStruct);
                }
                self.push_value(Value::Struct(items))
            }
            Some(other) => {
                self.stack.push(other);
                self.fail(Error::CannotEndStructHere)
            }
            None => self.fail(Error::CannotEndStructHere),
        }
    }

    pub fn begin_variant(&mut self) -> Result<()> {
        self.check_ok()?;
        self.enter_aggregate()?;
        self.stack.push(WFrame::Variant(None));
        Ok(())
    }

    pub fn end_variant(&mut self) -> Result<()> {
        self.check_ok()?;
        match self.stack.pop() {
            Some(WFrame::Variant(inner)) => {
                self.total_depth -= 1;
                match inner {
                    Some(v) => {
                        let inner_type = v.value_type();
                        self.push_value(Value::Variant { inner_type, inner: Box::new(v) })
                    }
                    None => {
                        // An empty variant is only legal when reached
                        // through a nil-array (discarded) path.
                        if self.discard_depth > 0 {
                            self.push_value(Value::Variant { inner_type: Type::Byte, inner: Box::new(Value::Byte(0)) })
                        } else {
                            self.fail(Error::EmptyVariant)
                        }
                    }
                }
            }
            Some(other) => {
                self.stack.push(other);
                self.fail(Error::CannotEndVariantHere)
            }
            None => self.fail(Error::CannotEndVariantHere),
        }
    }

    /// Consume the writer, producing an `Arguments` or an already-failed
    /// one carrying the first error encountered.
    pub fn finish(mut self) -> std::result::Result<Arguments, Error> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        if self.stack.len() != 1 {
            return Err(Error::CannotEndStructHere);
        }
        let values = match self.stack.pop().unwrap() {
            WFrame::Root(items) => items,
            _ => unreachable!("root frame always innermost"),
        };
        let signature: String = values.iter().map(|v| v.value_type().to_signature()).collect();
        if signature.len() > 255 {
            return Err(Error::SignatureTooLong);
        }
        let body = match self.byte_order {
            ByteOrderTag::Little => encode_values::<LittleEndian>(&values)?,
            ByteOrderTag::Big => encode_values::<BigEndian>(&values)?,
        };
        if body.len() > MAX_ARGUMENTS_LEN {
            return Err(Error::ArgumentsTooLong);
        }
        Ok(Arguments { signature, body, byte_order: self.byte_order, fds: self.fds, values })
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_error(e: &Error) -> Error {
    // `Error` carries an `io::Error` variant which isn't `Clone`; every
    // other variant is a plain tag, so re-derive those and fall back to a
    // generic connection error for the I/O case (it is never produced by
    // this writer).
    match e {
        Error::SignatureTooLong => Error::SignatureTooLong,
        Error::ExcessiveNesting => Error::ExcessiveNesting,
        Error::EmptyStruct => Error::EmptyStruct,
        Error::EmptyVariant => Error::EmptyVariant,
        Error::NotSingleCompleteTypeInVariant => Error::NotSingleCompleteTypeInVariant,
        Error::InvalidKeyTypeInDict => Error::InvalidKeyTypeInDict,
        Error::ArrayOrDictTooLong => Error::ArrayOrDictTooLong,
        Error::ArgumentsTooLong => Error::ArgumentsTooLong,
        Error::CannotEndArrayHere => Error::CannotEndArrayHere,
        Error::CannotEndVariantHere => Error::CannotEndVariantHere,
        Error::CannotEndStructHere => Error::CannotEndStructHere,
        Error::TypeMismatchInSubsequentArrayIteration => Error::TypeMismatchInSubsequentArrayIteration,
        Error::InvalidString => Error::InvalidString,
        Error::InvalidObjectPath => Error::InvalidObjectPath,
        Error::InvalidSignature => Error::InvalidSignature,
        Error::InvalidType => Error::InvalidType,
        _ => Error::MalformedMessageData,
    }
}

fn encode_values<T: ByteOrder>(values: &[Value]) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    for v in values {
        write_value::<T>(&mut w, v)?;
    }
    Ok(w.into_vec())
}

fn write_value<T: ByteOrder>(w: &mut ByteWriter, v: &Value) -> Result<()> {
    match v {
        Value::Byte(b) => w.write_u8(*b),
        Value::Bool(b) => w.write_bool::<T>(*b),
        Value::I16(x) => w.write_i16::<T>(*x),
        Value::U16(x) => w.write_u16::<T>(*x),
        Value::I32(x) => w.write_i32::<T>(*x),
        Value::U32(x) => w.write_u32::<T>(*x),
        Value::I64(x) => w.write_i64::<T>(*x),
        Value::U64(x) => w.write_u64::<T>(*x),
        Value::Double(x) => w.write_f64::<T>(*x),
        Value::String(s) => w.write_string32::<T>(s),
        Value::ObjectPath(s) => w.write_string32::<T>(s),
        Value::Signature(s) => w.write_string8(s),
        Value::UnixFd(idx) => w.write_u32::<T>(*idx),
        Value::Array { elem_type, items } => {
            let len_pos = {
                w.align(4);
                w.reserve_u32_placeholder()
            };
            w.align(elem_type.alignment() as usize);
            let data_start = w.len();
            for item in items {
                write_value::<T>(w, item)?;
            }
            let data_len = w.len() - data_start;
            if data_len > MAX_ARRAY_LEN {
                return Err(Error::ArrayOrDictTooLong);
            }
            w.backpatch_u32::<T>(len_pos, data_len as u32);
            Ok(())
        }
        Value::Dict { entries, .. } => {
            let len_pos = {
                w.align(4);
                w.reserve_u32_placeholder()
            };
            w.align(8);
            let data_start = w.len();
            for (k, val) in entries {
                w.align(8);
                write_value::<T>(w, k)?;
                write_value::<T>(w, val)?;
            }
            let data_len = w.len() - data_start;
            if data_len > MAX_ARRAY_LEN {
                return Err(Error::ArrayOrDictTooLong);
            }
            w.backpatch_u32::<T>(len_pos, data_len as u32);
            Ok(())
        }
        Value::Struct(fields) => {
            w.align(8);
            for f in fields {
                write_value::<T>(w, f)?;
            }
            Ok(())
        }
        Value::Variant { inner_type, inner } => {
            w.write_string8(&inner_type.to_signature());
            write_value::<T>(w, inner)
        }
    }
}

/// Wire size of a fixed-size primitive array element, or `None` for
/// `Bool`/`UnixFd` (4-byte wire types with no matching raw Rust
/// representation) and every non-primitive type.
fn primitive_array_element_size(t: &Type) -> Option<usize> {
    match t {
        Type::Byte => Some(1),
        Type::I16 | Type::U16 => Some(2),
        Type::I32 | Type::U32 => Some(4),
        Type::I64 | Type::U64 | Type::Double => Some(8),
        _ => None,
    }
}

fn decode_primitive_chunks<T: ByteOrder>(elem_type: &Type, bytes: &[u8]) -> Result<Vec<Value>> {
    let size = primitive_array_element_size(elem_type).ok_or(Error::InvalidSignature)?;
    bytes
        .chunks_exact(size)
        .map(|c| match elem_type {
            Type::Byte => Ok(Value::Byte(c[0])),
            Type::I16 => Ok(Value::I16(T::read_i16(c))),
            Type::U16 => Ok(Value::U16(T::read_u16(c))),
            Type::I32 => Ok(Value::I32(T::read_i32(c))),
            Type::U32 => Ok(Value::U32(T::read_u32(c))),
            Type::I64 => Ok(Value::I64(T::read_i64(c))),
            Type::U64 => Ok(Value::U64(T::read_u64(c))),
            Type::Double => Ok(Value::Double(T::read_f64(c))),
            _ => Err(Error::InvalidSignature),
        })
        .collect()
}

fn encode_primitive_chunks(elem_type: &Type, items: &[Value], out: &mut Vec<u8>) -> Result<()> {
    for item in items {
        match (elem_type, item) {
            (Type::Byte, Value::Byte(b)) => out.push(*b),
            (Type::I16, Value::I16(v)) => out.write_i16::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::U16, Value::U16(v)) => out.write_u16::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::I32, Value::I32(v)) => out.write_i32::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::U32, Value::U32(v)) => out.write_u32::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::I64, Value::I64(v)) => out.write_i64::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::U64, Value::U64(v)) => out.write_u64::<NativeEndian>(*v).expect("vec write never fails"),
            (Type::Double, Value::Double(v)) => out.write_f64::<NativeEndian>(*v).expect("vec write never fails"),
            _ => return Err(Error::ReadWrongType),
        }
    }
    Ok(())
}

fn decode_values<T: ByteOrder>(body: &[u8], types: &[Type]) -> Result<Vec<Value>> {
    let mut r = ByteReader::new(body);
    let mut values = Vec::with_capacity(types.len());
    for t in types {
        values.push(read_value::<T>(&mut r, t, 0)?);
    }
    if r.remaining() != 0 {
        return Err(Error::MalformedMessageData);
    }
    Ok(values)
}

fn read_value<T: ByteOrder>(r: &mut ByteReader, t: &Type, depth: u32) -> Result<Value> {
    if depth > MAX_TOTAL_NESTING {
        return Err(Error::ExcessiveNesting);
    }
    Ok(match t {
        Type::Byte => Value::Byte(r.read_u8()?),
        Type::Bool => {
            let raw = r.read_u32::<T>()?;
            if raw > 1 {
                return Err(Error::MalformedMessageData);
            }
            Value::Bool(raw != 0)
        }
        Type::I16 => Value::I16(r.read_i16::<T>()?),
        Type::U16 => Value::U16(r.read_u16::<T>()?),
        Type::I32 => Value::I32(r.read_i32::<T>()?),
        Type::U32 => Value::U32(r.read_u32::<T>()?),
        Type::I64 => Value::I64(r.read_i64::<T>()?),
        Type::U64 => Value::U64(r.read_u64::<T>()?),
        Type::Double => Value::Double(r.read_f64::<T>()?),
        Type::String => Value::String(r.read_string32::<T>()?),
        Type::ObjectPath => {
            let s = r.read_string32::<T>()?;
            signature::validate_object_path(&s)?;
            Value::ObjectPath(s)
        }
        Type::Signature => {
            let s = r.read_string8()?;
            signature::parse_signature(s.as_bytes())?;
            Value::Signature(s)
        }
        Type::UnixFd => Value::UnixFd(r.read_u32::<T>()?),
        Type::Array(elem) => {
            let len = r.read_u32::<T>()? as usize;
            if len > MAX_ARRAY_LEN {
                return Err(Error::ArrayOrDictTooLong);
            }
            r.align(elem.alignment() as usize)?;
            let end = r.pos + len;
            if end > r.buf.len() {
                return Err(Error::MalformedMessageData);
            }
            let mut items = Vec::new();
            while r.pos < end {
                items.push(read_value::<T>(r, elem, depth + 1)?);
            }
            if r.pos != end {
                return Err(Error::MalformedMessageData);
            }
            Value::Array { elem_type: (**elem).clone(), items }
        }
        Type::Dict(k, v) => {
            let len = r.read_u32::<T>()? as usize;
            if len > MAX_ARRAY_LEN {
                return Err(Error::ArrayOrDictTooLong);
            }
            r.align(8)?;
            let end = r.pos + len;
            if end > r.buf.len() {
                return Err(Error::MalformedMessageData);
            }
            let mut entries = Vec::new();
            while r.pos < end {
                r.align(8)?;
                let key = read_value::<T>(r, k, depth + 1)?;
                let val = read_value::<T>(r, v, depth + 1)?;
                entries.push((key, val));
            }
            if r.pos != end {
                return Err(Error::MalformedMessageData);
            }
            Value::Dict { key_type: (**k).clone(), val_type: (**v).clone(), entries }
        }
        Type::Struct(fields) => {
            r.align(8)?;
            let mut vals = Vec::with_capacity(fields.len());
            for f in fields {
                vals.push(read_value::<T>(r, f, depth + 1)?);
            }
            Value::Struct(vals)
        }
        Type::Variant => {
            let sig = r.read_string8()?;
            let inner_type = signature::parse_single_complete_type(sig.as_bytes())?;
            let inner = read_value::<T>(r, &inner_type, depth + 1)?;
            Value::Variant { inner_type, inner: Box::new(inner) }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Root,
    Struct,
    Array,
    Variant,
}

enum Frame<'a> {
    Seq(FrameKind, &'a [Value], usize),
    Dict(&'a [(Value, Value)], usize, bool),
}

/// Walks an already-decoded `Arguments`'s `Value` tree with a
/// begin/end/read/skip cursor, one frame per open aggregate.
pub struct Reader<'a> {
    stack: Vec<Frame<'a>>,
    nil_array_nesting: u32,
    byte_order: ByteOrderTag,
}

impl<'a> Reader<'a> {
    pub fn nil_array_nesting(&self) -> u32 {
        self.nil_array_nesting
    }

    fn peek(&self) -> Option<&'a Value> {
        match self.stack.last()? {
            Frame::Seq(_, items, idx) => items.get(*idx),
            Frame::Dict(entries, idx, expecting_key) => {
                entries.get(*idx).map(|(k, v)| if *expecting_key { k } else { v })
            }
        }
    }

    fn take(&mut self) -> Result<&'a Value> {
        let top = self.stack.last_mut().ok_or(Error::MalformedMessageData)?;
        match top {
            Frame::Seq(_, items, idx) => {
                let v = items.get(*idx).ok_or(Error::MalformedMessageData)?;
                *idx += 1;
                Ok(v)
            }
            Frame::Dict(entries, idx, expecting_key) => {
                let (k, v) = entries.get(*idx).ok_or(Error::MalformedMessageData)?;
                let out = if *expecting_key { k } else { v };
                if *expecting_key {
                    *expecting_key = false;
                } else {
                    *expecting_key = true;
                    *idx += 1;
                }
                Ok(out)
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.stack.last(), Some(Frame::Seq(FrameKind::Root, items, idx)) if *idx == items.len())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        match self.take()? {
            Value::Byte(b) => Ok(*b),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.take()? {
            Value::Bool(b) => Ok(*b),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_i16(&mut self) -> Result<i16> {
        match self.take()? {
            Value::I16(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_u16(&mut self) -> Result<u16> {
        match self.take()? {
            Value::U16(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_i32(&mut self) -> Result<i32> {
        match self.take()? {
            Value::I32(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        match self.take()? {
            Value::U32(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_i64(&mut self) -> Result<i64> {
        match self.take()? {
            Value::I64(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_u64(&mut self) -> Result<u64> {
        match self.take()? {
            Value::U64(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_double(&mut self) -> Result<f64> {
        match self.take()? {
            Value::Double(v) => Ok(*v),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_string(&mut self) -> Result<&'a str> {
        match self.take()? {
            Value::String(s) => Ok(s.as_str()),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_object_path(&mut self) -> Result<&'a str> {
        match self.take()? {
            Value::ObjectPath(s) => Ok(s.as_str()),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_signature(&mut self) -> Result<&'a str> {
        match self.take()? {
            Value::Signature(s) => Ok(s.as_str()),
            _ => Err(Error::ReadWrongType),
        }
    }
    pub fn read_unix_fd(&mut self) -> Result<u32> {
        match self.take()? {
            Value::UnixFd(idx) => Ok(*idx),
            _ => Err(Error::ReadWrongType),
        }
    }

    pub fn begin_struct(&mut self) -> Result<()> {
        match self.take()? {
            Value::Struct(fields) => {
                self.stack.push(Frame::Seq(FrameKind::Struct, fields.as_slice(), 0));
                Ok(())
            }
            _ => Err(Error::ReadWrongType),
        }
    }

    pub fn end_struct(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(Frame::Seq(FrameKind::Struct, items, idx)) if idx == items.len() => Ok(()),
            Some(f) => {
                self.stack.push(f);
                Err(Error::StateNotSkippable)
            }
            None => Err(Error::StateNotSkippable),
        }
    }

    /// Returns whether the array has at least one element.
    pub fn begin_array(&mut self) -> Result<bool> {
        match self.take()? {
            Value::Array { items, .. } => {
                let has_data = !items.is_empty();
                if !has_data {
                    self.nil_array_nesting += 1;
                }
                self.stack.push(Frame::Seq(FrameKind::Array, items.as_slice(), 0));
                Ok(has_data)
            }
            _ => Err(Error::ReadWrongType),
        }
    }

    pub fn end_array(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(Frame::Seq(FrameKind::Array, items, idx)) if idx == items.len() => {
                if items.is_empty() {
                    self.nil_array_nesting -= 1;
                }
                Ok(())
            }
            Some(f) => {
                self.stack.push(f);
                Err(Error::StateNotSkippable)
            }
            None => Err(Error::StateNotSkippable),
        }
    }

    /// Fast path mirroring `Writer::write_primitive_array`: consumes the
    /// array at the current position whole and returns its element type
    /// with the raw bytes it decodes to, skipping per-element reads.
    /// Only available for fixed-size, non-`bool`/non-`h` element types,
    /// and only when the buffer's byte order matches the host's; `None`
    /// otherwise; the caller should fall back to
    /// `begin_array`/`read_*`/`end_array` in the latter case.
    pub fn read_primitive_array(&mut self) -> Result<Option<(Type, Vec<u8>)>> {
        let elem_type = match self.peek() {
            Some(Value::Array { elem_type, .. }) => elem_type.clone(),
            Some(_) => return Err(Error::ReadWrongType),
            None => return Err(Error::MalformedMessageData),
        };
        if self.byte_order != ByteOrderTag::native() || primitive_array_element_size(&elem_type).is_none() {
            return Ok(None);
        }
        let items = match self.take()? {
            Value::Array { items, .. } => items,
            _ => unreachable!("peek confirmed an array above"),
        };
        let mut bytes = Vec::with_capacity(items.len() * primitive_array_element_size(&elem_type).unwrap());
        encode_primitive_chunks(&elem_type, items, &mut bytes)?;
        Ok(Some((elem_type, bytes)))
    }

    pub fn begin_dict(&mut self) -> Result<bool> {
        match self.take()? {
            Value::Dict { entries, .. } => {
                let has_data = !entries.is_empty();
                if !has_data {
                    self.nil_array_nesting += 1;
                }
                self.stack.push(Frame::Dict(entries.as_slice(), 0, true));
                Ok(has_data)
            }
            _ => Err(Error::ReadWrongType),
        }
    }

    pub fn end_dict(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(Frame::Dict(entries, idx, true)) if idx == entries.len() => {
                if entries.is_empty() {
                    self.nil_array_nesting -= 1;
                }
                Ok(())
            }
            Some(f) => {
                self.stack.push(f);
                Err(Error::StateNotSkippable)
            }
            None => Err(Error::StateNotSkippable),
        }
    }

    /// Enter a variant, returning the type of its contained value.
    pub fn begin_variant(&mut self) -> Result<Type> {
        match self.take()? {
            Value::Variant { inner_type, inner } => {
                let slice = std::slice::from_ref(inner.as_ref());
                self.stack.push(Frame::Seq(FrameKind::Variant, slice, 0));
                Ok(inner_type.clone())
            }
            _ => Err(Error::ReadWrongType),
        }
    }

    pub fn end_variant(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(Frame::Seq(FrameKind::Variant, items, idx)) if idx == items.len() => Ok(()),
            Some(f) => {
                self.stack.push(f);
                Err(Error::StateNotSkippable)
            }
            None => Err(Error::StateNotSkippable),
        }
    }

    /// Skip the next value wholesale without materializing into it.
    pub fn skip(&mut self) -> Result<()> {
        self.take()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn roundtrip(values: Vec<Value>) -> Arguments {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        for v in &values {
            write_into(&mut w, v);
        }
        w.finish().unwrap()
    }

    fn write_into(w: &mut Writer, v: &Value) {
        match v {
            Value::Byte(b) => w.write_byte(*b).unwrap(),
            Value::I32(i) => w.write_i32(*i).unwrap(),
            _ => unreachable!("test helper only covers the types used here"),
        }
    }

    #[test]
    fn round_trips_single_i32() {
        let args = roundtrip(vec![Value::I32(42)]);
        assert_eq!(args.signature, "i");
        assert_eq!(args.body, vec![0x2A, 0x00, 0x00, 0x00]);
        let decoded = Arguments::from_body("i", args.body.clone(), ByteOrderTag::Little, Vec::new()).unwrap();
        assert_eq!(decoded.values(), args.values());
    }

    #[test]
    fn round_trips_byte_then_i32_with_alignment_padding() {
        let args = roundtrip(vec![Value::Byte(1), Value::I32(2)]);
        assert_eq!(args.signature, "yi");
        assert_eq!(args.body, vec![0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn encodes_array_of_i32() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_array(ArrayOption::NonEmptyArray).unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(2).unwrap();
        w.write_i32(3).unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature, "ai");
        assert_eq!(
            args.body,
            vec![0x0C, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn round_trips_variant_carrying_struct() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_variant().unwrap();
        w.begin_struct().unwrap();
        w.write_byte(0x23).unwrap();
        w.write_signature("ia{iv}").unwrap();
        w.write_double(f64::from_bits(0x0807060504030201)).unwrap();
        w.end_struct().unwrap();
        w.end_variant().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature, "v");
        let decoded = Arguments::from_body("v", args.body.clone(), ByteOrderTag::Little, Vec::new()).unwrap();
        let mut r = decoded.reader();
        let inner_type = r.begin_variant().unwrap();
        assert_eq!(inner_type.to_signature(), "(ygd)");
        r.begin_struct().unwrap();
        assert_eq!(r.read_byte().unwrap(), 0x23);
        assert_eq!(r.read_signature().unwrap(), "ia{iv}");
        assert_eq!(r.read_double().unwrap().to_bits(), 0x0807060504030201);
        r.end_struct().unwrap();
        r.end_variant().unwrap();
    }

    #[test]
    fn empty_array_preserves_element_type() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_array(ArrayOption::WriteTypesOfEmptyArray).unwrap();
        w.write_i32(0).unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();
        assert_eq!(args.signature, "ai");
        assert_eq!(args.body, vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn dict_requires_basic_key() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_dict(ArrayOption::NonEmptyArray).unwrap();
        w.begin_struct().unwrap();
        w.write_byte(1).unwrap();
        // a struct key is rejected as soon as the key value is pushed.
        assert!(matches!(w.end_struct(), Err(Error::InvalidKeyTypeInDict)));
    }

    #[test]
    fn empty_struct_rejected() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_struct().unwrap();
        assert!(matches!(w.end_struct(), Err(Error::EmptyStruct)));
    }

    #[test]
    fn nesting_limit_enforced() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        for _ in 0..MAX_ARRAY_NESTING {
            w.begin_array(ArrayOption::WriteTypesOfEmptyArray).unwrap();
        }
        assert!(w.begin_array(ArrayOption::WriteTypesOfEmptyArray).is_err());
    }

    #[quickcheck]
    fn struct_of_i32_u32_string_round_trips(i: i32, u: u32, s: String) -> bool {
        // Embedded NUL bytes aren't valid D-Bus strings; quickcheck's
        // arbitrary String may produce one, so skip those inputs rather
        // than fail the property on them.
        if s.contains('\0') {
            return true;
        }
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.begin_struct().unwrap();
        w.write_i32(i).unwrap();
        w.write_u32(u).unwrap();
        w.write_string(&s).unwrap();
        w.end_struct().unwrap();
        let args = w.finish().unwrap();

        let decoded = Arguments::from_body(&args.signature, args.body.clone(), ByteOrderTag::Little, Vec::new()).unwrap();
        let mut r = decoded.reader();
        r.begin_struct().unwrap();
        let ok = r.read_i32().unwrap() == i && r.read_u32().unwrap() == u && r.read_string().unwrap() == s;
        r.end_struct().unwrap();
        ok
    }

    #[test]
    fn write_primitive_byte_array_matches_element_by_element() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.write_primitive_byte_array(&[1, 2, 3]).unwrap();
        let fast = w.finish().unwrap();

        let mut w2 = Writer::with_byte_order(ByteOrderTag::Little);
        w2.begin_array(ArrayOption::NonEmptyArray).unwrap();
        w2.write_byte(1).unwrap();
        w2.write_byte(2).unwrap();
        w2.write_byte(3).unwrap();
        w2.end_array().unwrap();
        let slow = w2.finish().unwrap();

        assert_eq!(fast.body, slow.body);
        assert_eq!(fast.signature, "ay");
    }

    #[test]
    fn write_primitive_array_rejects_bool_and_fd() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        assert!(matches!(w.write_primitive_array(Type::Bool, &[0, 0, 0, 0]), Err(Error::InvalidSignature)));
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        assert!(matches!(w.write_primitive_array(Type::UnixFd, &[0, 0, 0, 0]), Err(Error::InvalidSignature)));
    }

    #[test]
    fn write_primitive_array_rejects_misaligned_length() {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        assert!(matches!(w.write_primitive_array(Type::I32, &[0, 0, 0]), Err(Error::MalformedMessageData)));
    }

    #[test]
    fn read_primitive_array_fast_path_matches_per_element_reads() {
        let mut w = Writer::with_byte_order(ByteOrderTag::native());
        w.begin_array(ArrayOption::NonEmptyArray).unwrap();
        w.write_i32(10).unwrap();
        w.write_i32(20).unwrap();
        w.write_i32(30).unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();

        let decoded = Arguments::from_body(&args.signature, args.body.clone(), ByteOrderTag::native(), Vec::new()).unwrap();
        let mut r = decoded.reader();
        let (elem_type, bytes) = r.read_primitive_array().unwrap().expect("native byte order should take the fast path");
        assert_eq!(elem_type, Type::I32);
        assert_eq!(bytes.len(), 12);
        assert!(r.is_finished());
    }

    #[test]
    fn read_primitive_array_falls_back_for_bool_elements() {
        let mut w = Writer::with_byte_order(ByteOrderTag::native());
        w.begin_array(ArrayOption::NonEmptyArray).unwrap();
        w.write_bool(true).unwrap();
        w.end_array().unwrap();
        let args = w.finish().unwrap();

        let decoded = Arguments::from_body(&args.signature, args.body.clone(), ByteOrderTag::native(), Vec::new()).unwrap();
        let mut r = decoded.reader();
        assert!(r.read_primitive_array().unwrap().is_none());
        assert!(r.begin_array().is_ok());
    }

    #[quickcheck]
    fn array_of_i64_round_trips(values: Vec<i64>) -> bool {
        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        let option = if values.is_empty() { ArrayOption::WriteTypesOfEmptyArray } else { ArrayOption::NonEmptyArray };
        w.begin_array(option).unwrap();
        for v in &values {
            w.write_i64(*v).unwrap();
        }
        w.end_array().unwrap();
        let args = w.finish().unwrap();

        let decoded = Arguments::from_body(&args.signature, args.body.clone(), ByteOrderTag::Little, Vec::new()).unwrap();
        let mut r = decoded.reader();
        r.begin_array().unwrap();
        let decoded_values: Vec<i64> = (0..values.len()).map(|_| r.read_i64().unwrap()).collect();
        r.end_array().unwrap();
        decoded_values == values
    }
}

//! The argument `Value` tree: a recursive sum type covering every
//! primitive, container, and variant shape a decoded argument list can
//! hold.

use crate::signature::Type;

/// A single D-Bus value. `Array`/`Dict` additionally carry the element
/// type(s) so an empty array/dict still knows (and can re-emit) its type,
/// and `Variant` carries the type of its contained value alongside it so
/// the inline variant signature can be rendered without re-inspecting the
/// value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Array { elem_type: Type, items: Vec<Value> },
    Dict { key_type: Type, val_type: Type, entries: Vec<(Value, Value)> },
    Struct(Vec<Value>),
    Variant { inner_type: Type, inner: Box<Value> },
}

impl Value {
    /// The `Type` this value encodes as, used to validate that a value
    /// matches the signature position it is being written into.
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::I16(_) => Type::I16,
            Value::U16(_) => Type::U16,
            Value::I32(_) => Type::I32,
            Value::U32(_) => Type::U32,
            Value::I64(_) => Type::I64,
            Value::U64(_) => Type::U64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::UnixFd(_) => Type::UnixFd,
            Value::Array { elem_type, .. } => Type::Array(Box::new(elem_type.clone())),
            Value::Dict { key_type, val_type, .. } => {
                Type::Dict(Box::new(key_type.clone()), Box::new(val_type.clone()))
            }
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::Variant { .. } => Type::Variant,
        }
    }
}

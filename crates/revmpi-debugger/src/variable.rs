use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use revmpi_symbol::{BaseType, DebugModel, Encoding, LocationContext, LocationExpr};

use crate::process::ProcessContext;
use crate::stack::StackFrame;

/// Bytes read for a variable whose type size is unknown.
const DEFAULT_READ_SIZE: u64 = 8;

/// Largest variable read from memory.
const MAX_READ_SIZE: u64 = 64;

/// Decoded value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer.
    Signed(i64),
    /// Unsigned integer (or pointer).
    Unsigned(u64),
    /// Floating-point number.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Raw bytes of a value that cannot be decoded.
    Bytes(Vec<u8>),
}

/// A variable read from the traced process.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableValue {
    /// Variable identifier.
    pub name: String,

    /// Name of the variable type.
    pub type_name: String,

    /// Runtime address of the variable.
    pub addr: u64,

    /// Function declaring the variable (`None` for globals).
    pub scope: Option<String>,

    /// Decoded value.
    pub value: Value,
}

impl Value {
    /// Decodes little-endian bytes according to a base type.
    pub fn decode(bytes: &[u8], ty: &BaseType) -> Self {
        match (ty.encoding, bytes.len()) {
            (Encoding::Signed, 1) => Self::Signed(bytes[0] as i8 as i64),
            (Encoding::Signed, 2) => Self::Signed(LittleEndian::read_i16(bytes) as i64),
            (Encoding::Signed, 4) => Self::Signed(LittleEndian::read_i32(bytes) as i64),
            (Encoding::Signed, 8) => Self::Signed(LittleEndian::read_i64(bytes)),
            (Encoding::Unsigned, 1) => Self::Unsigned(bytes[0] as u64),
            (Encoding::Unsigned, 2) => Self::Unsigned(LittleEndian::read_u16(bytes) as u64),
            (Encoding::Unsigned, 4) => Self::Unsigned(LittleEndian::read_u32(bytes) as u64),
            (Encoding::Unsigned, 8) => Self::Unsigned(LittleEndian::read_u64(bytes)),
            (Encoding::Float, 4) => Self::Float(LittleEndian::read_f32(bytes) as f64),
            (Encoding::Float, 8) => Self::Float(LittleEndian::read_f64(bytes)),
            (Encoding::Boolean, 1..) => Self::Bool(bytes.iter().any(|b| *b != 0)),
            _ => Self::Bytes(bytes.to_vec()),
        }
    }

    /// The value as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Signed(v) => Some(*v),
            Self::Unsigned(v) => i64::try_from(*v).ok(),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signed(v) => write!(f, "{v}"),
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Bytes(bytes) => {
                f.write_str("[")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.type_name)?;

        match &self.scope {
            Some(function) => write!(f, ", local of {function}")?,
            None => f.write_str(", global")?,
        }

        write!(f, ") = {}", self.value)
    }
}

/// Reads a variable visible from the given stack frames.
///
/// Each frame, innermost first, is searched for a local variable then a
/// parameter with that name, before falling back to global variables.
pub fn read_variable(
    process: &ProcessContext,
    model: &DebugModel,
    frames: &[StackFrame],
    name: &str,
) -> crate::Result<VariableValue> {
    for frame in frames {
        let function = model.function(frame.function);

        let found = model
            .lookup_variable_in_function(function, name)
            .map(|v| (&v.base_type, &v.location))
            .or_else(|| function.parameter(name).map(|p| (&p.base_type, &p.location)));

        if let Some((ty, location)) = found {
            let cx = LocationContext {
                frame_base: Some(frame.cfa()),
                cfa: Some(frame.cfa()),
                static_base: process.load_bias(),
            };

            return read_at(process, name, ty, location.as_ref(), &cx, Some(&frame.name));
        }
    }

    read_global(process, model, name)
}

/// Reads a global variable.
pub fn read_global(process: &ProcessContext, model: &DebugModel, name: &str) -> crate::Result<VariableValue> {
    let var = model
        .lookup_global_variable(name)
        .ok_or_else(|| crate::Error::VariableNotFound(name.to_owned()))?;

    let cx = LocationContext {
        static_base: process.load_bias(),
        ..Default::default()
    };

    read_at(process, name, &var.base_type, var.location.as_ref(), &cx, None)
}

fn read_at(
    process: &ProcessContext,
    name: &str,
    ty: &BaseType,
    location: Option<&LocationExpr>,
    cx: &LocationContext,
    scope: Option<&str>,
) -> crate::Result<VariableValue> {
    let Some(location) = location else {
        return Err(crate::Error::VariableNotFound(format!("{name} (no location)")));
    };

    let addr = location.evaluate(cx)?;

    let size = match ty.byte_size {
        0 => DEFAULT_READ_SIZE,
        size => size.min(MAX_READ_SIZE),
    };

    let bytes = process
        .peek_memory(addr, size as usize)
        .map_err(|_| crate::Error::UnreadableVariable {
            name: name.to_owned(),
            addr,
        })?;

    tracing::trace!(name, addr = format_args!("{addr:#x}"), size, "variable read");

    Ok(VariableValue {
        name: name.to_owned(),
        type_name: ty.name.clone(),
        addr,
        scope: scope.map(str::to_owned),
        value: Value::decode(&bytes, ty),
    })
}

#[cfg(test)]
mod tests {
    use revmpi_symbol::{BaseType, Encoding};

    use super::Value;

    fn ty(encoding: Encoding, byte_size: u64) -> BaseType {
        BaseType {
            name: "t".to_owned(),
            byte_size,
            encoding,
        }
    }

    #[test]
    fn decode_integers() {
        assert_eq!(
            Value::decode(&(-5i32).to_le_bytes(), &ty(Encoding::Signed, 4)),
            Value::Signed(-5)
        );
        assert_eq!(Value::decode(&[0xff], &ty(Encoding::Signed, 1)), Value::Signed(-1));
        assert_eq!(Value::decode(&[0xff], &ty(Encoding::Unsigned, 1)), Value::Unsigned(255));
        assert_eq!(
            Value::decode(&0xdead_beefu64.to_le_bytes(), &ty(Encoding::Unsigned, 8)),
            Value::Unsigned(0xdead_beef)
        );
    }

    #[test]
    fn decode_floats_and_bools() {
        assert_eq!(
            Value::decode(&1.5f32.to_le_bytes(), &ty(Encoding::Float, 4)),
            Value::Float(1.5)
        );
        assert_eq!(
            Value::decode(&(-0.25f64).to_le_bytes(), &ty(Encoding::Float, 8)),
            Value::Float(-0.25)
        );
        assert_eq!(Value::decode(&[1], &ty(Encoding::Boolean, 1)), Value::Bool(true));
    }

    #[test]
    fn undecodable_values_keep_bytes() {
        let value = Value::decode(&[1, 2, 3], &ty(Encoding::Signed, 3));
        assert_eq!(value, Value::Bytes(vec![1, 2, 3]));
        assert_eq!(value.to_string(), "[01 02 03]");
        assert_eq!(value.as_i64(), None);

        assert_eq!(Value::Unsigned(7).as_i64(), Some(7));
    }
}

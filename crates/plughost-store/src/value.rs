//! Conversion of caller values into storable JSON.
//!
//! Values are serialized through a formatter that tracks nesting depth. A
//! self-referential `Serialize` impl never terminates on its own, so it is
//! cut off at [`MAX_NESTING`] instead of overflowing the stack; the same
//! limit guarantees that whatever is stored can be parsed back.
//!
//! serde_json writes NaN and infinities as `null`, which would silently
//! change the value, so floats are checked by a separate pass first.

use std::io;

use serde::ser::{self, Serialize, Serializer};
use serde_json::ser::Formatter;
use serde_json::Value;

use crate::error::StoreError;

/// Deepest array/object nesting that serde_json can parse back.
pub const MAX_NESTING: usize = 127;

#[derive(Default)]
struct DepthGuard {
    depth: usize,
}

impl DepthGuard {
    fn enter(&mut self) -> io::Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(io::Error::other("nesting limit exceeded"));
        }
        Ok(())
    }
}

impl Formatter for DepthGuard {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.enter()?;
        writer.write_all(b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth = self.depth.saturating_sub(1);
        writer.write_all(b"]")
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.enter()?;
        writer.write_all(b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.depth = self.depth.saturating_sub(1);
        writer.write_all(b"}")
    }
}

// ─── Float check ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Rejected(String);

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Rejected {}

impl ser::Error for Rejected {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Rejected(msg.to_string())
    }
}

/// Walks a value and fails on the first NaN or infinite float.
#[derive(Clone, Copy)]
struct FiniteFloats;

impl FiniteFloats {
    fn float(v: f64) -> Result<(), Rejected> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(Rejected(format!("{v} has no JSON representation")))
        }
    }
}

macro_rules! accept {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(fn $method(self, _v: $ty) -> Result<(), Rejected> { Ok(()) })*
    };
}

impl Serializer for FiniteFloats {
    type Ok = ();
    type Error = Rejected;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept!(
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
        serialize_char: char,
        serialize_str: &str,
        serialize_bytes: &[u8],
    );

    fn serialize_f32(self, v: f32) -> Result<(), Rejected> {
        Self::float(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<(), Rejected> {
        Self::float(v)
    }

    fn serialize_none(self) -> Result<(), Rejected> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), Rejected> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Rejected> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Rejected> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), Rejected> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), Rejected> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), Rejected> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, Rejected> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, Rejected> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Rejected> {
        key.serialize(*self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = Rejected;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), Rejected> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), Rejected> {
        Ok(())
    }
}

// ─── Conversion ─────────────────────────────────────────────────────────

/// Serialize `value` into a [`Value`] that round-trips through the backend.
///
/// Fails with [`StoreError::Value`] when the serializer rejects the value
/// (non-string map keys, NaN or infinite floats, impls that return errors)
/// and with [`StoreError::NestingTooDeep`] for cyclic or overly deep graphs.
pub fn to_store_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, StoreError> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, DepthGuard::default());
    if let Err(e) = value.serialize(&mut serializer) {
        // The only writer is a Vec, so an io error can only come from the guard.
        if e.is_io() {
            return Err(StoreError::NestingTooDeep);
        }
        return Err(StoreError::Value(e.to_string()));
    }
    // Depth is bounded by now, so this walk terminates.
    value
        .serialize(FiniteFloats)
        .map_err(|Rejected(msg)| StoreError::Value(msg))?;
    serde_json::from_slice(&buf).map_err(|e| StoreError::Value(e.to_string()))
}

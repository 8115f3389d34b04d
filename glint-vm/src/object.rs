//! Garbage-collected object kinds.

pub(crate) mod array;
pub(crate) mod class;
pub(crate) mod function;
pub(crate) mod string;
pub(crate) mod table;

pub use array::{Array, ArrayStore};
pub use class::{Class, FieldDesc, FieldFlags, FieldInfo, Object};
pub use function::{Function, NativeAttr, NativeFn, NativeInfo, NativeOverload, Proto, ProtoDesc};
pub use string::{GcString, StringSet};
pub use table::{Table, TableEntry, SMALL_TABLE_LEN, TABLE_OVERFLOW};

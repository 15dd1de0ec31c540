//! Reading and writing the class file container format
//!
//! The interesting parts of a class file, as far as this crate is concerned, are the constant
//! pool and the `Code` attribute of each method. Everything else (fields, other attributes) is
//! carried as opaque data so that a file can be read, have its method bodies analyzed and
//! rewritten, and be emitted again.

mod attribute;
mod class;
mod codec;
mod constant_pool;
mod version;

pub use attribute::*;
pub use class::*;
pub use codec::*;
pub use constant_pool::*;
pub use version::*;

/// Errors produced while reading or writing the class file format
#[derive(Debug)]
pub enum Error {
    /// Input ended before a value of the expected length could be read
    IoShort { expected: usize },

    /// Underlying I/O failure that is not a short read
    Io(std::io::Error),

    /// The leading 4 bytes were not `0xCAFEBABE`
    BadMagic(u32),

    /// A constant pool slot had a tag byte this library does not know
    UnknownTag { tag: u8, index: u16 },

    /// A constant pool slot used a tag newer than the class file version
    ConstantNotSupported {
        tag: u8,
        index: u16,
        since: Version,
        version: Version,
    },

    /// The pool ran out of `u16` indices
    ConstantPoolOverflow { offset: usize },

    /// An instruction stream contained an opcode this library does not know
    UnknownOpcode { opcode: u8, offset: usize },

    /// A field or method descriptor failed to parse
    BadDescriptor(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::IoShort { expected: 0 },
            _ => Error::Io(err),
        }
    }
}

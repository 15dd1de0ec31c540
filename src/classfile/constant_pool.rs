use super::{
    decode_modified_utf8, encode_modified_utf8, read_bytes, Deserialize, Error, Serialize, Version,
};
use crate::util::{Offset, OffsetResult, OffsetVec, Width};
use crate::verifier::{ErrorKind, Source, Verifier};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Result;

/// Constants as in the constant pool
///
/// Unlike the raw class file format, references between constants are resolved: a
/// [`Constant::Class`] holds its name directly rather than an index to a `Utf8` slot. Cyclic or
/// dangling references (which obfuscators exploit, and which the format technically permits)
/// are cut with the [`Constant::Index`] placeholder.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone)]
pub enum Constant {
    /// Placeholder for a slot that is unresolved, reserved (the upper half of a `Long`/`Double`)
    /// or an intentionally-invalid reference
    Index(u16),

    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (the encoding of the null character
    /// `\u{0000}` and the encoding of supplementary characters is different).
    Utf8(String),

    /// Constant primitive of type `int`
    Integer(i32),

    /// Constant primitive of type `float`
    Float(f32),

    /// Constant primitive of type `long`
    Long(i64),

    /// Constant primitive of type `double`
    Double(f64),

    /// Class or an interface
    Class { name: Box<Constant> },

    /// Constant object of type `java.lang.String`
    String { value: Box<Constant> },

    /// Field
    FieldRef {
        class: Box<Constant>,
        name_and_type: Box<Constant>,
    },

    /// Method on a class
    MethodRef {
        class: Box<Constant>,
        name_and_type: Box<Constant>,
    },

    /// Method on an interface
    InterfaceMethodRef {
        class: Box<Constant>,
        name_and_type: Box<Constant>,
    },

    /// Name and a type (eg. for a field or a method)
    NameAndType {
        name: Box<Constant>,
        descriptor: Box<Constant>,
    },

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle {
        /// Reference kind, 1 through 9
        kind: HandleKind,

        /// Depending on the kind, a `FieldRef` (get/put) or a `[Interface]MethodRef` (invoke)
        reference: Box<Constant>,
    },

    /// Method type
    MethodType { descriptor: Box<Constant> },

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_index: u16,
        name_and_type: Box<Constant>,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        bootstrap_index: u16,
        name_and_type: Box<Constant>,
    },

    /// Module (in a `module-info` class)
    Module { name: Box<Constant> },

    /// Package (in a `module-info` class)
    Package { name: Box<Constant> },
}

impl Constant {
    /// Shorthand for a class constant with the given binary name
    pub fn class(name: &str) -> Constant {
        Constant::Class {
            name: Box::new(Constant::Utf8(name.to_owned())),
        }
    }

    /// Shorthand for a name-and-type constant
    pub fn name_and_type(name: &str, descriptor: &str) -> Constant {
        Constant::NameAndType {
            name: Box::new(Constant::Utf8(name.to_owned())),
            descriptor: Box::new(Constant::Utf8(descriptor.to_owned())),
        }
    }

    /// The UTF-8 payload, if this is a `Utf8` constant
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Utf8(value) => Some(value),
            _ => None,
        }
    }

    /// The class name, if this is a `Class` constant holding a resolved name
    pub fn class_name(&self) -> Option<&str> {
        match self {
            Constant::Class { name } => name.as_str(),
            _ => None,
        }
    }

    /// Name and descriptor strings, if this is a resolved `NameAndType`
    pub fn name_and_descriptor(&self) -> Option<(&str, &str)> {
        match self {
            Constant::NameAndType { name, descriptor } => {
                Some((name.as_str()?, descriptor.as_str()?))
            }
            _ => None,
        }
    }

    /// Member reference parts `(class_name, member_name, descriptor)` for field/method refs
    pub fn member_parts(&self) -> Option<(&str, &str, &str)> {
        match self {
            Constant::FieldRef {
                class,
                name_and_type,
            }
            | Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                let (name, descriptor) = name_and_type.name_and_descriptor()?;
                Some((class.class_name()?, name, descriptor))
            }
            _ => None,
        }
    }

    /// Tag byte this constant is written with
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Index(_) => 0,
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class { .. } => 7,
            Constant::String { .. } => 8,
            Constant::FieldRef { .. } => 9,
            Constant::MethodRef { .. } => 10,
            Constant::InterfaceMethodRef { .. } => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType { .. } => 16,
            Constant::Dynamic { .. } => 17,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Module { .. } => 19,
            Constant::Package { .. } => 20,
        }
    }

    /// First class file version at which a tag is legal
    fn since(tag: u8) -> Option<Version> {
        Some(match tag {
            1 | 3..=12 => Version { major: 45, minor: 0 },
            15 | 16 | 18 => Version::JAVA7,
            17 => Version::JAVA11,
            19 | 20 => Version::JAVA9,
            _ => return None,
        })
    }
}

/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`. Quoting
/// the spec:
///
/// > All 8-byte constants take up two entries in the constant_pool table of the class file. If a
/// > CONSTANT_Long_info or CONSTANT_Double_info structure is the item in the constant_pool table
/// > at index n, then the next usable item in the pool is located at index n+2. The constant_pool
/// > index n+1 must be valid but is considered unusable.
/// >
/// > In retrospect, making 8-byte constants take two constant pool entries was a poor choice.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Structural equality; floats compare by bit pattern so that the pool can dedup NaNs and
/// signed zeros without surprises.
impl PartialEq for Constant {
    fn eq(&self, other: &Constant) -> bool {
        use Constant::*;
        match (self, other) {
            (Index(a), Index(b)) => a == b,
            (Utf8(a), Utf8(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Long(a), Long(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Class { name: a }, Class { name: b }) => a == b,
            (String { value: a }, String { value: b }) => a == b,
            (
                FieldRef {
                    class: c1,
                    name_and_type: n1,
                },
                FieldRef {
                    class: c2,
                    name_and_type: n2,
                },
            ) => c1 == c2 && n1 == n2,
            (
                MethodRef {
                    class: c1,
                    name_and_type: n1,
                },
                MethodRef {
                    class: c2,
                    name_and_type: n2,
                },
            ) => c1 == c2 && n1 == n2,
            (
                InterfaceMethodRef {
                    class: c1,
                    name_and_type: n1,
                },
                InterfaceMethodRef {
                    class: c2,
                    name_and_type: n2,
                },
            ) => c1 == c2 && n1 == n2,
            (
                NameAndType {
                    name: a1,
                    descriptor: d1,
                },
                NameAndType {
                    name: a2,
                    descriptor: d2,
                },
            ) => a1 == a2 && d1 == d2,
            (
                MethodHandle {
                    kind: k1,
                    reference: r1,
                },
                MethodHandle {
                    kind: k2,
                    reference: r2,
                },
            ) => k1 == k2 && r1 == r2,
            (MethodType { descriptor: d1 }, MethodType { descriptor: d2 }) => d1 == d2,
            (
                Dynamic {
                    bootstrap_index: b1,
                    name_and_type: n1,
                },
                Dynamic {
                    bootstrap_index: b2,
                    name_and_type: n2,
                },
            ) => b1 == b2 && n1 == n2,
            (
                InvokeDynamic {
                    bootstrap_index: b1,
                    name_and_type: n1,
                },
                InvokeDynamic {
                    bootstrap_index: b2,
                    name_and_type: n2,
                },
            ) => b1 == b2 && n1 == n2,
            (Module { name: a }, Module { name: b }) => a == b,
            (Package { name: a }, Package { name: b }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use Constant::*;
        state.write_u8(self.tag());
        match self {
            Index(i) => i.hash(state),
            Utf8(value) => value.hash(state),
            Integer(value) => value.hash(state),
            Float(value) => value.to_bits().hash(state),
            Long(value) => value.hash(state),
            Double(value) => value.to_bits().hash(state),
            Class { name } => name.hash(state),
            String { value } => value.hash(state),
            FieldRef {
                class,
                name_and_type,
            }
            | MethodRef {
                class,
                name_and_type,
            }
            | InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                class.hash(state);
                name_and_type.hash(state);
            }
            NameAndType { name, descriptor } => {
                name.hash(state);
                descriptor.hash(state);
            }
            MethodHandle { kind, reference } => {
                kind.hash(state);
                reference.hash(state);
            }
            MethodType { descriptor } => descriptor.hash(state),
            Dynamic {
                bootstrap_index,
                name_and_type,
            }
            | InvokeDynamic {
                bootstrap_index,
                name_and_type,
            } => {
                bootstrap_index.hash(state);
                name_and_type.hash(state);
            }
            Module { name } | Package { name } => name.hash(state),
        }
    }
}

/// Type of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-5.html#jvms-5.4.3.5-220
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn from_byte(byte: u8) -> Option<HandleKind> {
        Some(match byte {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        }
    }
}

/// Raw constant pool slot: tag plus unresolved operand indices
///
/// Phase one of the pool reader produces these; phase two resolves the indices into
/// [`Constant`]s. Splitting the read this way is what makes forward (and cyclic) references
/// work: the file format permits a `Class` at index 1 naming a `Utf8` at index 9.
#[derive(Debug, Clone)]
enum RawConstant {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name: u16 },
    String { value: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: HandleKind, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap_index: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap_index: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
}

/// Class file constant pool
///
/// Indices are 1-based and `u16`; index 0 is reserved to mean "none". `Long` and `Double`
/// constants occupy two consecutive indices. Equal constants deduplicate to a single index, and
/// lookups are O(1) in both directions.
#[derive(Debug)]
pub struct ConstantPool {
    constants: OffsetVec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl ConstantPool {
    /// Make a fresh empty constant pool
    pub fn new() -> ConstantPool {
        ConstantPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            lookup: HashMap::new(),
        }
    }

    /// Number of occupied slots (not counting the reserved halves of wide constants)
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Add a constant, deduplicating by structural equality, and return its index
    ///
    /// Adding an `Index(i)` placeholder is a no-op that returns `i`: placeholders stand for
    /// slots the caller already knows about (or deliberately-invalid references).
    pub fn add(&mut self, constant: Constant) -> std::result::Result<u16, Error> {
        if let Constant::Index(index) = constant {
            return Ok(index);
        }
        if let Some(index) = self.lookup.get(&constant) {
            return Ok(*index);
        }

        let offset = self.constants.offset_len().0;

        // The pool count is a `u16` and indices run 1 through count-1, so no constant (wide
        // constants reserve the following slot too) may advance the next offset past 65535
        if offset + constant.width() > 0xFFFF {
            return Err(Error::ConstantPoolOverflow { offset });
        }

        let index = self.constants.push(constant.clone()).0 as u16;
        self.lookup.insert(constant, index);
        Ok(index)
    }

    /// Shorthand for adding a UTF-8 constant
    pub fn add_utf8(&mut self, value: &str) -> std::result::Result<u16, Error> {
        self.add(Constant::Utf8(value.to_owned()))
    }

    /// Get the constant at an index
    ///
    /// Absent and reserved slots come back as an `Index(i)` placeholder; callers that want to
    /// treat that as an error can match on it.
    pub fn get(&self, index: u16) -> Constant {
        match self.constants.get_offset(Offset(index as usize)) {
            OffsetResult::Ok(_, constant) => constant.clone(),
            _ => Constant::Index(index),
        }
    }

    /// Look up the index of a constant already in the pool
    pub fn index_of(&self, constant: &Constant) -> Option<u16> {
        self.lookup.get(constant).copied()
    }

    /// Iterator over `(index, constant)` pairs in slot order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.constants.iter().map(|(off, _, c)| (off.0 as u16, c))
    }

    /// Read a constant pool
    ///
    /// The read happens in two phases: first every slot is collected raw (tag plus operand
    /// indices), then each slot is resolved by dereferencing its operands. `deref` keeps a
    /// per-resolution visited stack; entering the same index twice reports
    /// [`ErrorKind::RecursiveConstant`] and short-circuits to an `Index(i)` placeholder so the
    /// rest of the pool still resolves.
    pub fn read<R: ReadBytesExt>(
        version: Version,
        reader: &mut R,
        verifier: &mut Verifier,
    ) -> std::result::Result<ConstantPool, Error> {
        let count = u16::deserialize(reader)? as u32;

        let mut raw: HashMap<u16, RawConstant> = HashMap::new();
        let mut index: u32 = 1;
        while index < count {
            let tag = u8::deserialize(reader)?;
            let since = match Constant::since(tag) {
                Some(since) => since,
                None => {
                    return Err(Error::UnknownTag {
                        tag,
                        index: index as u16,
                    })
                }
            };
            if since > version {
                return Err(Error::ConstantNotSupported {
                    tag,
                    index: index as u16,
                    since,
                    version,
                });
            }

            let constant = match tag {
                1 => {
                    let len = u16::deserialize(reader)? as usize;
                    let bytes = read_bytes(reader, len)?;
                    RawConstant::Utf8(decode_modified_utf8(&bytes))
                }
                3 => RawConstant::Integer(i32::deserialize(reader)?),
                4 => RawConstant::Float(f32::deserialize(reader)?),
                5 => RawConstant::Long(i64::deserialize(reader)?),
                6 => RawConstant::Double(f64::deserialize(reader)?),
                7 => RawConstant::Class {
                    name: u16::deserialize(reader)?,
                },
                8 => RawConstant::String {
                    value: u16::deserialize(reader)?,
                },
                9 => RawConstant::FieldRef {
                    class: u16::deserialize(reader)?,
                    name_and_type: u16::deserialize(reader)?,
                },
                10 => RawConstant::MethodRef {
                    class: u16::deserialize(reader)?,
                    name_and_type: u16::deserialize(reader)?,
                },
                11 => RawConstant::InterfaceMethodRef {
                    class: u16::deserialize(reader)?,
                    name_and_type: u16::deserialize(reader)?,
                },
                12 => RawConstant::NameAndType {
                    name: u16::deserialize(reader)?,
                    descriptor: u16::deserialize(reader)?,
                },
                15 => {
                    let kind_byte = u8::deserialize(reader)?;
                    let kind = HandleKind::from_byte(kind_byte).ok_or(Error::UnknownTag {
                        tag,
                        index: index as u16,
                    })?;
                    RawConstant::MethodHandle {
                        kind,
                        reference: u16::deserialize(reader)?,
                    }
                }
                16 => RawConstant::MethodType {
                    descriptor: u16::deserialize(reader)?,
                },
                17 => RawConstant::Dynamic {
                    bootstrap_index: u16::deserialize(reader)?,
                    name_and_type: u16::deserialize(reader)?,
                },
                18 => RawConstant::InvokeDynamic {
                    bootstrap_index: u16::deserialize(reader)?,
                    name_and_type: u16::deserialize(reader)?,
                },
                19 => RawConstant::Module {
                    name: u16::deserialize(reader)?,
                },
                20 => RawConstant::Package {
                    name: u16::deserialize(reader)?,
                },
                _ => unreachable!("tag already validated against the version table"),
            };

            let wide = matches!(constant, RawConstant::Long(_) | RawConstant::Double(_));
            raw.insert(index as u16, constant);
            index += if wide { 2 } else { 1 };
        }

        // Phase two: resolve every slot, cutting cycles with placeholders
        let mut pool = ConstantPool::new();
        let mut index: u32 = 1;
        while index < count {
            let wide = matches!(
                raw.get(&(index as u16)),
                Some(RawConstant::Long(_) | RawConstant::Double(_))
            );
            let mut visiting = Vec::new();
            let constant = resolve(&raw, index as u16, &mut visiting, verifier);
            // Slots resolve in order, so dedup cannot reorder what read produced; but the same
            // logical constant at two file indices keeps only its first index in the lookup.
            pool.push_slot(constant);
            index += if wide { 2 } else { 1 };
        }

        Ok(pool)
    }

    /// Append a constant without deduplicating away the slot (used by the reader, which must
    /// preserve the file's index numbering)
    fn push_slot(&mut self, constant: Constant) {
        let index = self.constants.push(constant.clone()).0 as u16;
        self.lookup.entry(constant).or_insert(index);
    }

    /// Write the pool: count first, then tag + payload per occupied slot in order
    ///
    /// Nested constant references are re-added through [`ConstantPool::add`] by callers ahead
    /// of time; at this point every nested reference must already have an index, which is what
    /// `index_for` resolves.
    pub fn write<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        let count = self.constants.offset_len().0 as u16;
        count.serialize(writer)?;
        for (_, _, constant) in self.constants.iter() {
            self.write_constant(constant, writer)?;
        }
        Ok(())
    }

    fn index_for(&self, constant: &Constant) -> u16 {
        if let Constant::Index(index) = constant {
            return *index;
        }
        self.lookup.get(constant).copied().unwrap_or(0)
    }

    fn write_constant<W: WriteBytesExt>(&self, constant: &Constant, writer: &mut W) -> Result<()> {
        constant.tag().serialize(writer)?;
        match constant {
            Constant::Index(_) => unreachable!("placeholders never occupy pool slots"),
            Constant::Utf8(value) => {
                let buffer = encode_modified_utf8(value);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(value) => value.serialize(writer)?,
            Constant::Float(value) => value.serialize(writer)?,
            Constant::Long(value) => value.serialize(writer)?,
            Constant::Double(value) => value.serialize(writer)?,
            Constant::Class { name } => self.index_for(name).serialize(writer)?,
            Constant::String { value } => self.index_for(value).serialize(writer)?,
            Constant::FieldRef {
                class,
                name_and_type,
            }
            | Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                self.index_for(class).serialize(writer)?;
                self.index_for(name_and_type).serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                self.index_for(name).serialize(writer)?;
                self.index_for(descriptor).serialize(writer)?;
            }
            Constant::MethodHandle { kind, reference } => {
                kind.to_byte().serialize(writer)?;
                self.index_for(reference).serialize(writer)?;
            }
            Constant::MethodType { descriptor } => self.index_for(descriptor).serialize(writer)?,
            Constant::Dynamic {
                bootstrap_index,
                name_and_type,
            }
            | Constant::InvokeDynamic {
                bootstrap_index,
                name_and_type,
            } => {
                bootstrap_index.serialize(writer)?;
                self.index_for(name_and_type).serialize(writer)?;
            }
            Constant::Module { name } | Constant::Package { name } => {
                self.index_for(name).serialize(writer)?;
            }
        }
        Ok(())
    }

    /// Add a constant along with every constant nested inside it, innermost first
    ///
    /// This is what lowering uses: instructions carry resolved constants, and re-emitting them
    /// means ensuring the whole reference chain has pool indices.
    pub fn add_deep(&mut self, constant: &Constant) -> std::result::Result<u16, Error> {
        match constant {
            Constant::Index(index) => return Ok(*index),
            Constant::Class { name } | Constant::Module { name } | Constant::Package { name } => {
                self.add_deep(name)?;
            }
            Constant::String { value } => {
                self.add_deep(value)?;
            }
            Constant::FieldRef {
                class,
                name_and_type,
            }
            | Constant::MethodRef {
                class,
                name_and_type,
            }
            | Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                self.add_deep(class)?;
                self.add_deep(name_and_type)?;
            }
            Constant::NameAndType { name, descriptor } => {
                self.add_deep(name)?;
                self.add_deep(descriptor)?;
            }
            Constant::MethodHandle { reference, .. } => {
                self.add_deep(reference)?;
            }
            Constant::MethodType { descriptor } => {
                self.add_deep(descriptor)?;
            }
            Constant::Dynamic { name_and_type, .. }
            | Constant::InvokeDynamic { name_and_type, .. } => {
                self.add_deep(name_and_type)?;
            }
            _ => {}
        }
        self.add(constant.clone())
    }
}

impl Default for ConstantPool {
    fn default() -> ConstantPool {
        ConstantPool::new()
    }
}

/// Resolve one raw slot into a constant, dereferencing operand indices
///
/// `visiting` is the resolution stack: hitting an index already on it means the pool contains a
/// reference cycle, which is reported and cut with a placeholder.
fn resolve(
    raw: &HashMap<u16, RawConstant>,
    index: u16,
    visiting: &mut Vec<u16>,
    verifier: &mut Verifier,
) -> Constant {
    if visiting.contains(&index) {
        verifier.report(
            ErrorKind::RecursiveConstant,
            Source::None,
            format!("constant pool index {} references itself", index),
        );
        return Constant::Index(index);
    }

    let slot = match raw.get(&index) {
        Some(slot) => slot,
        None => return Constant::Index(index),
    };

    visiting.push(index);
    let mut deref = |operand: u16| Box::new(resolve(raw, operand, visiting, verifier));

    let constant = match slot.clone() {
        RawConstant::Utf8(value) => Constant::Utf8(value),
        RawConstant::Integer(value) => Constant::Integer(value),
        RawConstant::Float(value) => Constant::Float(value),
        RawConstant::Long(value) => Constant::Long(value),
        RawConstant::Double(value) => Constant::Double(value),
        RawConstant::Class { name } => Constant::Class { name: deref(name) },
        RawConstant::String { value } => Constant::String {
            value: deref(value),
        },
        RawConstant::FieldRef {
            class,
            name_and_type,
        } => Constant::FieldRef {
            class: deref(class),
            name_and_type: deref(name_and_type),
        },
        RawConstant::MethodRef {
            class,
            name_and_type,
        } => Constant::MethodRef {
            class: deref(class),
            name_and_type: deref(name_and_type),
        },
        RawConstant::InterfaceMethodRef {
            class,
            name_and_type,
        } => Constant::InterfaceMethodRef {
            class: deref(class),
            name_and_type: deref(name_and_type),
        },
        RawConstant::NameAndType { name, descriptor } => Constant::NameAndType {
            name: deref(name),
            descriptor: deref(descriptor),
        },
        RawConstant::MethodHandle { kind, reference } => Constant::MethodHandle {
            kind,
            reference: deref(reference),
        },
        RawConstant::MethodType { descriptor } => Constant::MethodType {
            descriptor: deref(descriptor),
        },
        RawConstant::Dynamic {
            bootstrap_index,
            name_and_type,
        } => Constant::Dynamic {
            bootstrap_index,
            name_and_type: deref(name_and_type),
        },
        RawConstant::InvokeDynamic {
            bootstrap_index,
            name_and_type,
        } => Constant::InvokeDynamic {
            bootstrap_index,
            name_and_type: deref(name_and_type),
        },
        RawConstant::Module { name } => Constant::Module { name: deref(name) },
        RawConstant::Package { name } => Constant::Package { name: deref(name) },
    };
    visiting.pop();

    constant
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_dedups_and_is_stable() {
        let mut pool = ConstantPool::new();
        let class = Constant::class("java/lang/Object");
        let i1 = pool.add(class.clone()).unwrap();
        let i2 = pool.add(class.clone()).unwrap();
        assert_eq!(i1, i2);
        assert_eq!(pool.get(i1), class);
        assert_eq!(pool.add(Constant::Index(7)).unwrap(), 7);
    }

    #[test]
    fn wide_constants_reserve_two_slots() {
        let mut pool = ConstantPool::new();
        let long = pool.add(Constant::Long(42)).unwrap();
        let next = pool.add_utf8("next").unwrap();
        assert_eq!(long, 1);
        assert_eq!(next, 3);
        assert_eq!(pool.get(2), Constant::Index(2));
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut pool = ConstantPool::new();
        let name = pool.add_utf8("java/lang/String").unwrap();
        let _ = name;
        pool.add_deep(&Constant::class("java/lang/String")).unwrap();
        pool.add(Constant::Double(1.5)).unwrap();
        pool.add_deep(&Constant::MethodRef {
            class: Box::new(Constant::class("java/lang/String")),
            name_and_type: Box::new(Constant::name_and_type("length", "()I")),
        })
        .unwrap();

        let mut bytes = vec![];
        pool.write(&mut bytes).unwrap();

        let mut verifier = Verifier::new(true);
        let read = ConstantPool::read(
            Version::JAVA8,
            &mut std::io::Cursor::new(bytes),
            &mut verifier,
        )
        .unwrap();

        assert!(verifier.errors().is_empty());
        assert_eq!(read.len(), pool.len());
        for (index, constant) in pool.iter() {
            assert_eq!(&read.get(index), constant);
        }
    }

    #[test]
    fn recursive_class_reference_is_cut() {
        // Class at index 1 whose name index points back at itself
        let mut bytes = vec![];
        3u16.serialize(&mut bytes).unwrap(); // count
        7u8.serialize(&mut bytes).unwrap(); // Class
        1u16.serialize(&mut bytes).unwrap(); // name -> itself
        1u8.serialize(&mut bytes).unwrap(); // Utf8
        3u16.serialize(&mut bytes).unwrap();
        bytes.extend_from_slice(b"abc");

        let mut verifier = Verifier::new(false);
        let pool = ConstantPool::read(
            Version::JAVA8,
            &mut std::io::Cursor::new(bytes),
            &mut verifier,
        )
        .unwrap();

        assert_eq!(
            pool.get(1),
            Constant::Class {
                name: Box::new(Constant::Index(1))
            }
        );
        assert_eq!(verifier.errors().len(), 1);
        assert_eq!(verifier.errors()[0].kind, ErrorKind::RecursiveConstant);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = vec![];
        2u16.serialize(&mut bytes).unwrap();
        2u8.serialize(&mut bytes).unwrap(); // tag 2 does not exist

        let mut verifier = Verifier::new(false);
        let result = ConstantPool::read(
            Version::JAVA8,
            &mut std::io::Cursor::new(bytes),
            &mut verifier,
        );
        assert!(matches!(result, Err(Error::UnknownTag { tag: 2, index: 1 })));
    }

    #[test]
    fn newer_tags_are_version_gated() {
        let mut bytes = vec![];
        2u16.serialize(&mut bytes).unwrap();
        17u8.serialize(&mut bytes).unwrap(); // Dynamic needs Java 11
        0u16.serialize(&mut bytes).unwrap();
        2u16.serialize(&mut bytes).unwrap();

        let mut verifier = Verifier::new(false);
        let result = ConstantPool::read(
            Version::JAVA8,
            &mut std::io::Cursor::new(bytes),
            &mut verifier,
        );
        assert!(matches!(
            result,
            Err(Error::ConstantNotSupported { tag: 17, .. })
        ));
    }
}

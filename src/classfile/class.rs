use super::{
    Attribute, AttributeLike, CodeAttribute, Constant, ConstantPool, Deserialize, Error,
    Serialize, Version,
};
use crate::verifier::Verifier;
use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Result;

const MAGIC: u32 = 0xCAFE_BABE;

bitflags! {
    /// Access flags on classes
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.1-200-E.1
    pub struct ClassAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

bitflags! {
    /// Access flags on fields
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.5-200-A.1
    pub struct FieldAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    /// Access flags on methods
    ///
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.6-200-A.1
    pub struct MethodAccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

/// A field as stored in the class file
#[derive(Debug)]
pub struct FieldInfo {
    pub access_flags: FieldAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

/// A method as stored in the class file
#[derive(Debug)]
pub struct MethodInfo {
    pub access_flags: MethodAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn name(&self, pool: &ConstantPool) -> Option<String> {
        pool.get(self.name_index).as_str().map(str::to_owned)
    }

    pub fn descriptor(&self, pool: &ConstantPool) -> Option<String> {
        pool.get(self.descriptor_index).as_str().map(str::to_owned)
    }

    /// Decode this method's `Code` attribute, if it has one
    pub fn code(&self, pool: &ConstantPool) -> std::result::Result<Option<CodeAttribute>, Error> {
        for attribute in &self.attributes {
            if attribute.is_named(CodeAttribute::NAME, pool) {
                let mut cursor = std::io::Cursor::new(attribute.info.as_slice());
                return CodeAttribute::deserialize(&mut cursor).map(Some);
            }
        }
        Ok(None)
    }

    /// Replace (or add) this method's `Code` attribute
    pub fn set_code(
        &mut self,
        code: CodeAttribute,
        pool: &mut ConstantPool,
    ) -> std::result::Result<(), Error> {
        let attribute = code.to_attribute(pool)?;
        self.attributes
            .retain(|existing| !existing.is_named(CodeAttribute::NAME, pool));
        self.attributes.push(attribute);
        Ok(())
    }
}

/// A whole class file
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.1
#[derive(Debug)]
pub struct ClassFile {
    pub version: Version,
    pub pool: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Binary name of this class
    pub fn this_name(&self) -> Option<String> {
        match self.pool.get(self.this_class) {
            Constant::Class { name } => name.as_str().map(str::to_owned),
            _ => None,
        }
    }

    /// Read a class file; recoverable pool problems are reported into `verifier`
    pub fn read<R: ReadBytesExt>(
        reader: &mut R,
        verifier: &mut Verifier,
    ) -> std::result::Result<ClassFile, Error> {
        let magic = u32::deserialize(reader)?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let version = Version::deserialize(reader)?;
        let pool = ConstantPool::read(version, reader, verifier)?;
        let access_flags = ClassAccessFlags::from_bits_truncate(u16::deserialize(reader)?);
        let this_class = u16::deserialize(reader)?;
        let super_class = u16::deserialize(reader)?;
        let interfaces = Vec::deserialize(reader)?;

        let mut fields = vec![];
        for _ in 0..u16::deserialize(reader)? {
            fields.push(FieldInfo {
                access_flags: FieldAccessFlags::from_bits_truncate(u16::deserialize(reader)?),
                name_index: u16::deserialize(reader)?,
                descriptor_index: u16::deserialize(reader)?,
                attributes: Vec::deserialize(reader)?,
            });
        }

        let mut methods = vec![];
        for _ in 0..u16::deserialize(reader)? {
            methods.push(MethodInfo {
                access_flags: MethodAccessFlags::from_bits_truncate(u16::deserialize(reader)?),
                name_index: u16::deserialize(reader)?,
                descriptor_index: u16::deserialize(reader)?,
                attributes: Vec::deserialize(reader)?,
            });
        }

        let attributes = Vec::deserialize(reader)?;

        Ok(ClassFile {
            version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn write<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        MAGIC.serialize(writer)?;
        self.version.serialize(writer)?;
        self.pool.write(writer)?;
        self.access_flags.bits().serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class.serialize(writer)?;
        self.interfaces.serialize(writer)?;

        (self.fields.len() as u16).serialize(writer)?;
        for field in &self.fields {
            field.access_flags.bits().serialize(writer)?;
            field.name_index.serialize(writer)?;
            field.descriptor_index.serialize(writer)?;
            field.attributes.serialize(writer)?;
        }

        (self.methods.len() as u16).serialize(writer)?;
        for method in &self.methods {
            method.access_flags.bits().serialize(writer)?;
            method.name_index.serialize(writer)?;
            method.descriptor_index.serialize(writer)?;
            method.attributes.serialize(writer)?;
        }

        self.attributes.serialize(writer)?;
        Ok(())
    }
}

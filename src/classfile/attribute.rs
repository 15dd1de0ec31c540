use super::{read_bytes, Constant, ConstantPool, Deserialize, Error, Serialize};
use crate::code::Instruction;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Result;

/// Attributes (used on classes, fields, methods, and nested inside other attributes)
///
/// Only `Code` and `StackMapTable` are understood structurally; everything else stays an opaque
/// blob of known length, which is exactly what surviving a rewrite of a class we don't fully
/// model requires.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    /// Does this attribute have the given name (resolved through the pool)?
    pub fn is_named(&self, name: &str, pool: &ConstantPool) -> bool {
        pool.get(self.name_index).as_str() == Some(name)
    }
}

impl Serialize for Attribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.name_index.serialize(writer)?;

        // Attribute info length is 4 bytes
        (self.info.len() as u32).serialize(writer)?;
        writer.write_all(&self.info)?;

        Ok(())
    }
}

impl Deserialize for Attribute {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        let name_index = u16::deserialize(reader)?;
        let length = u32::deserialize(reader)? as usize;
        let info = read_bytes(reader, length)?;
        Ok(Attribute { name_index, info })
    }
}

/// Attributes are all stored in the same way (see [`Attribute`]), but internally they represent
/// very different things. This trait is implemented by things which can be turned into
/// attributes.
pub trait AttributeLike: Serialize {
    /// Name of the attribute
    const NAME: &'static str;

    /// Package up as a raw [`Attribute`], interning the name
    fn to_attribute(&self, pool: &mut ConstantPool) -> std::result::Result<Attribute, Error> {
        let name_index = pool.add_utf8(Self::NAME)?;
        let mut info = vec![];
        self.serialize(&mut info).map_err(Error::Io)?;
        Ok(Attribute { name_index, info })
    }
}

/// One row of a `Code` attribute's exception table
///
/// The handler covers offsets in `[start_pc, end_pc)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,

    /// Pool index of the caught class; 0 catches everything
    pub catch_type: u16,
}

impl Serialize for ExceptionHandler {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        self.catch_type.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for ExceptionHandler {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        Ok(ExceptionHandler {
            start_pc: u16::deserialize(reader)?,
            end_pc: u16::deserialize(reader)?,
            handler_pc: u16::deserialize(reader)?,
            catch_type: u16::deserialize(reader)?,
        })
    }
}

/// The `Code` attribute of a method
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,

    /// Encoded instruction bytes
    pub code: Vec<u8>,

    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    /// Decode the instruction stream into offset-keyed instructions
    pub fn instructions(
        &self,
        pool: &ConstantPool,
    ) -> std::result::Result<BTreeMap<usize, Instruction>, Error> {
        let mut instructions = BTreeMap::new();
        let mut cursor = std::io::Cursor::new(self.code.as_slice());
        while (cursor.position() as usize) < self.code.len() {
            let offset = cursor.position() as usize;
            let instruction = Instruction::read(&mut cursor, offset, pool)?;
            instructions.insert(offset, instruction);
        }
        Ok(instructions)
    }

    /// Caught class of a handler row (`None` for catch-all)
    pub fn catch_type(&self, handler: &ExceptionHandler, pool: &ConstantPool) -> Option<Constant> {
        if handler.catch_type == 0 {
            None
        } else {
            Some(pool.get(handler.catch_type))
        }
    }
}

impl AttributeLike for CodeAttribute {
    const NAME: &'static str = "Code";
}

impl Serialize for CodeAttribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;
        (self.code.len() as u32).serialize(writer)?;
        writer.write_all(&self.code)?;
        self.exception_table.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for CodeAttribute {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        let max_stack = u16::deserialize(reader)?;
        let max_locals = u16::deserialize(reader)?;
        let code_length = u32::deserialize(reader)? as usize;
        let code = read_bytes(reader, code_length)?;
        let exception_table = Vec::deserialize(reader)?;
        let attributes = Vec::deserialize(reader)?;
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }
}

/// A verification type as it appears in a `StackMapTable` attribute
///
/// This is the serialized counterpart of [`crate::verifier::VerificationType`]: object types
/// have become constant pool indices and uninitialized types the offset of their `new`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl Serialize for VerificationTypeInfo {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        match self {
            VerificationTypeInfo::Top => 0u8.serialize(writer)?,
            VerificationTypeInfo::Integer => 1u8.serialize(writer)?,
            VerificationTypeInfo::Float => 2u8.serialize(writer)?,
            VerificationTypeInfo::Double => 3u8.serialize(writer)?,
            VerificationTypeInfo::Long => 4u8.serialize(writer)?,
            VerificationTypeInfo::Null => 5u8.serialize(writer)?,
            VerificationTypeInfo::UninitializedThis => 6u8.serialize(writer)?,
            VerificationTypeInfo::Object(index) => {
                7u8.serialize(writer)?;
                index.serialize(writer)?;
            }
            VerificationTypeInfo::Uninitialized(offset) => {
                8u8.serialize(writer)?;
                offset.serialize(writer)?;
            }
        }
        Ok(())
    }
}

impl Deserialize for VerificationTypeInfo {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        Ok(match u8::deserialize(reader)? {
            0 => VerificationTypeInfo::Top,
            1 => VerificationTypeInfo::Integer,
            2 => VerificationTypeInfo::Float,
            3 => VerificationTypeInfo::Double,
            4 => VerificationTypeInfo::Long,
            5 => VerificationTypeInfo::Null,
            6 => VerificationTypeInfo::UninitializedThis,
            7 => VerificationTypeInfo::Object(u16::deserialize(reader)?),
            8 => VerificationTypeInfo::Uninitialized(u16::deserialize(reader)?),
            tag => {
                return Err(Error::UnknownTag {
                    tag,
                    index: 0,
                })
            }
        })
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se7/html/jvms-4.html#jvms-4.7.4
#[derive(Debug, Clone, PartialEq)]
pub struct StackMapTable(pub Vec<StackMapFrame>);

impl AttributeLike for StackMapTable {
    const NAME: &'static str = "StackMapTable";
}

impl Serialize for StackMapTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for StackMapTable {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        Ok(StackMapTable(Vec::deserialize(reader)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StackMapFrame {
    /// Frame has the same locals as the previous frame and no stack items
    /// Tags: 0-63 or 251
    SameLocalsNoStack { offset_delta: u16 },

    /// Frame has the same locals as the previous frame and one stack item
    /// Tags: 64-127 or 247
    SameLocalsOneStack {
        offset_delta: u16,
        stack: VerificationTypeInfo,
    },

    /// Frame is like the previous frame, but without the last `chopped_k` locals
    ///
    /// Note: `chopped_k` must be in the range 1 to 3 inclusive
    /// Tags: 248-250
    ChopLocalsNoStack { offset_delta: u16, chopped_k: u8 },

    /// Frame is like the previous frame, but with 1-3 extra locals
    /// Tags: 252-254
    AppendLocalsNoStack {
        offset_delta: u16,
        locals: Vec<VerificationTypeInfo>,
    },

    /// Frame has exactly the locals and stack specified
    /// Tag: 255
    Full {
        offset_delta: u16,
        locals: Vec<VerificationTypeInfo>,
        stack: Vec<VerificationTypeInfo>,
    },
}

impl Serialize for StackMapFrame {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        match self {
            // `same_frame` and `same_frame_extended`
            StackMapFrame::SameLocalsNoStack { offset_delta } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8).serialize(writer)?;
                } else {
                    251u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
            }

            // `same_locals_1_stack_item_frame` and `same_locals_1_stack_item_frame_extended`
            StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack,
            } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8 + 64).serialize(writer)?;
                } else {
                    247u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
                stack.serialize(writer)?;
            }

            // `chop_frame`
            StackMapFrame::ChopLocalsNoStack {
                offset_delta,
                chopped_k,
            } => {
                assert!(
                    0 < *chopped_k && *chopped_k < 4,
                    "ChopLocalsNoStack chops 1-3 locals"
                );
                (251 - chopped_k).serialize(writer)?;
                offset_delta.serialize(writer)?;
            }

            // `append_frame`
            StackMapFrame::AppendLocalsNoStack {
                offset_delta,
                locals,
            } => {
                let added_k = locals.len();
                assert!(
                    0 < added_k && added_k < 4,
                    "AppendLocalsNoStack adds 1-3 locals"
                );
                (251 + added_k as u8).serialize(writer)?;
                offset_delta.serialize(writer)?;
                for local in locals {
                    local.serialize(writer)?;
                }
            }

            // `full_frame`
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                255u8.serialize(writer)?;
                offset_delta.serialize(writer)?;
                locals.serialize(writer)?;
                stack.serialize(writer)?;
            }
        }
        Ok(())
    }
}

impl Deserialize for StackMapFrame {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        let tag = u8::deserialize(reader)?;
        Ok(match tag {
            0..=63 => StackMapFrame::SameLocalsNoStack {
                offset_delta: tag as u16,
            },
            64..=127 => StackMapFrame::SameLocalsOneStack {
                offset_delta: (tag - 64) as u16,
                stack: VerificationTypeInfo::deserialize(reader)?,
            },
            247 => StackMapFrame::SameLocalsOneStack {
                offset_delta: u16::deserialize(reader)?,
                stack: VerificationTypeInfo::deserialize(reader)?,
            },
            248..=250 => StackMapFrame::ChopLocalsNoStack {
                offset_delta: u16::deserialize(reader)?,
                chopped_k: 251 - tag,
            },
            251 => StackMapFrame::SameLocalsNoStack {
                offset_delta: u16::deserialize(reader)?,
            },
            252..=254 => {
                let offset_delta = u16::deserialize(reader)?;
                let mut locals = vec![];
                for _ in 0..(tag - 251) {
                    locals.push(VerificationTypeInfo::deserialize(reader)?);
                }
                StackMapFrame::AppendLocalsNoStack {
                    offset_delta,
                    locals,
                }
            }
            255 => StackMapFrame::Full {
                offset_delta: u16::deserialize(reader)?,
                locals: Vec::deserialize(reader)?,
                stack: Vec::deserialize(reader)?,
            },
            tag => return Err(Error::UnknownTag { tag, index: 0 }),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(frame: StackMapFrame) {
        let mut bytes = vec![];
        frame.serialize(&mut bytes).unwrap();
        let read = StackMapFrame::deserialize(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(read, frame);
    }

    #[test]
    fn stack_map_frames_round_trip() {
        round_trip(StackMapFrame::SameLocalsNoStack { offset_delta: 5 });
        round_trip(StackMapFrame::SameLocalsNoStack { offset_delta: 500 });
        round_trip(StackMapFrame::SameLocalsOneStack {
            offset_delta: 63,
            stack: VerificationTypeInfo::Integer,
        });
        round_trip(StackMapFrame::SameLocalsOneStack {
            offset_delta: 64,
            stack: VerificationTypeInfo::Object(3),
        });
        round_trip(StackMapFrame::ChopLocalsNoStack {
            offset_delta: 12,
            chopped_k: 2,
        });
        round_trip(StackMapFrame::AppendLocalsNoStack {
            offset_delta: 9,
            locals: vec![
                VerificationTypeInfo::Long,
                VerificationTypeInfo::Uninitialized(4),
            ],
        });
        round_trip(StackMapFrame::Full {
            offset_delta: 77,
            locals: vec![VerificationTypeInfo::Top, VerificationTypeInfo::Float],
            stack: vec![VerificationTypeInfo::Null],
        });
    }

    #[test]
    fn code_attribute_round_trips() {
        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 3,
            code: vec![0x1a, 0x1b, 0x60, 0xac], // iload_0 iload_1 iadd ireturn
            exception_table: vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 3,
                handler_pc: 3,
                catch_type: 0,
            }],
            attributes: vec![],
        };
        let mut bytes = vec![];
        code.serialize(&mut bytes).unwrap();
        let read = CodeAttribute::deserialize(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(read, code);

        let pool = ConstantPool::new();
        let instructions = read.instructions(&pool).unwrap();
        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[&0], Instruction::ILoad(0));
        assert_eq!(instructions[&3], Instruction::IReturn);
    }
}

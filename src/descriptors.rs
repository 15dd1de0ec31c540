//! Field and method descriptors
//!
//! Only as much descriptor machinery as the bytecode core needs: laying out the initial frame of
//! a method, typing field accesses and invocations, and rendering array/class names back into
//! constants. Generic signatures are out of scope.

use crate::classfile::Error;
use crate::util::Width;
use std::fmt;
use std::str::Chars;

/// Utility trait for converting descriptors to and from string representations
pub trait Descriptor: Sized {
    /// Turn the descriptor into a string
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    /// Parse a descriptor from a string
    fn parse(source: &str) -> Result<Self, Error> {
        let mut chars = source.chars();
        let ret = Descriptor::parse_from(&mut chars)?;
        let rest = chars.as_str();
        if rest.is_empty() {
            Ok(ret)
        } else {
            Err(Error::BadDescriptor(format!(
                "unexpected leftover input '{}'",
                rest
            )))
        }
    }

    /// Write the descriptor to a string
    fn render_to(&self, write_to: &mut String);

    /// Read the descriptor from a character buffer
    fn parse_from(source: &mut Chars) -> Result<Self, Error>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Byte
            | BaseType::Char
            | BaseType::Float
            | BaseType::Int
            | BaseType::Short
            | BaseType::Boolean => 1,
            BaseType::Double | BaseType::Long => 2,
        }
    }
}

impl BaseType {
    /// The `atype` operand byte of `newarray`
    pub fn from_atype(byte: u8) -> Option<BaseType> {
        Some(match byte {
            4 => BaseType::Boolean,
            5 => BaseType::Char,
            6 => BaseType::Float,
            7 => BaseType::Double,
            8 => BaseType::Byte,
            9 => BaseType::Short,
            10 => BaseType::Int,
            11 => BaseType::Long,
            _ => return None,
        })
    }

    pub fn atype(&self) -> u8 {
        match self {
            BaseType::Boolean => 4,
            BaseType::Char => 5,
            BaseType::Float => 6,
            BaseType::Double => 7,
            BaseType::Byte => 8,
            BaseType::Short => 9,
            BaseType::Int => 10,
            BaseType::Long => 11,
        }
    }
}

impl Descriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        let c = match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        };
        write_to.push(c);
    }

    fn parse_from(source: &mut Chars) -> Result<Self, Error> {
        let typ = match source.next() {
            Some('B') => BaseType::Byte,
            Some('C') => BaseType::Char,
            Some('D') => BaseType::Double,
            Some('F') => BaseType::Float,
            Some('I') => BaseType::Int,
            Some('J') => BaseType::Long,
            Some('S') => BaseType::Short,
            Some('Z') => BaseType::Boolean,
            Some(c) => {
                return Err(Error::BadDescriptor(format!(
                    "invalid base type character '{}'",
                    c
                )))
            }
            None => {
                return Err(Error::BadDescriptor(String::from(
                    "missing base type character",
                )))
            }
        };
        Ok(typ)
    }
}

/// Type of a field, parameter, or return value
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType {
    Base(BaseType),

    /// Class or interface, by binary name (eg. `java/lang/Object`)
    Object(String),

    /// Array with `dimensions >= 1` of `element` (the element is never itself an array)
    Array { dimensions: u8, element: Box<FieldType> },
}

impl FieldType {
    pub fn int() -> FieldType {
        FieldType::Base(BaseType::Int)
    }

    pub fn object(name: &str) -> FieldType {
        FieldType::Object(name.to_owned())
    }

    pub fn array(element: FieldType) -> FieldType {
        match element {
            FieldType::Array {
                dimensions,
                element,
            } => FieldType::Array {
                dimensions: dimensions.saturating_add(1),
                element,
            },
            other => FieldType::Array {
                dimensions: 1,
                element: Box::new(other),
            },
        }
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldType::Base(_))
    }
}

impl Width for FieldType {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base) => base.width(),
            _ => 1,
        }
    }
}

impl Descriptor for FieldType {
    fn render_to(&self, write_to: &mut String) {
        match self {
            FieldType::Base(base) => base.render_to(write_to),
            FieldType::Object(name) => {
                write_to.push('L');
                write_to.push_str(name);
                write_to.push(';');
            }
            FieldType::Array {
                dimensions,
                element,
            } => {
                for _ in 0..*dimensions {
                    write_to.push('[');
                }
                element.render_to(write_to);
            }
        }
    }

    fn parse_from(source: &mut Chars) -> Result<Self, Error> {
        let mut dimensions: u8 = 0;
        loop {
            let mut peek = source.clone();
            match peek.next() {
                Some('[') => {
                    *source = peek;
                    dimensions = dimensions.checked_add(1).ok_or_else(|| {
                        Error::BadDescriptor(String::from("too many array dimensions"))
                    })?;
                }
                Some('L') => {
                    *source = peek;
                    let mut name = String::new();
                    loop {
                        match source.next() {
                            Some(';') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::BadDescriptor(String::from(
                                    "unterminated class name",
                                )))
                            }
                        }
                    }
                    let object = FieldType::Object(name);
                    return Ok(if dimensions == 0 {
                        object
                    } else {
                        FieldType::Array {
                            dimensions,
                            element: Box::new(object),
                        }
                    });
                }
                _ => {
                    let base = FieldType::Base(BaseType::parse_from(source)?);
                    return Ok(if dimensions == 0 {
                        base
                    } else {
                        FieldType::Array {
                            dimensions,
                            element: Box::new(base),
                        }
                    });
                }
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Type of a method
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: Option<FieldType>,
}

impl MethodDescriptor {
    /// Size of the parameters, in locals slots (`long`/`double` count for two)
    pub fn parameter_width(&self) -> usize {
        self.parameters.iter().map(Width::width).sum()
    }
}

impl Descriptor for MethodDescriptor {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        match &self.return_type {
            None => write_to.push('V'),
            Some(typ) => typ.render_to(write_to),
        }
    }

    fn parse_from(source: &mut Chars) -> Result<Self, Error> {
        if source.next() != Some('(') {
            return Err(Error::BadDescriptor(String::from(
                "method descriptor must start with '('",
            )));
        }

        let mut parameters = vec![];
        loop {
            let mut peek = source.clone();
            match peek.next() {
                Some(')') => {
                    *source = peek;
                    break;
                }
                Some(_) => parameters.push(FieldType::parse_from(source)?),
                None => {
                    return Err(Error::BadDescriptor(String::from(
                        "method descriptor missing ')'",
                    )))
                }
            }
        }

        let mut peek = source.clone();
        let return_type = if peek.next() == Some('V') {
            *source = peek;
            None
        } else {
            Some(FieldType::parse_from(source)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_render_field_types() {
        for descriptor in ["I", "J", "Ljava/lang/Object;", "[[D", "[Ljava/lang/String;"] {
            let parsed = FieldType::parse(descriptor).unwrap();
            assert_eq!(parsed.render(), descriptor);
        }
    }

    #[test]
    fn parse_method_descriptors() {
        let descriptor = MethodDescriptor::parse("(IJLjava/lang/String;[B)V").unwrap();
        assert_eq!(descriptor.parameters.len(), 4);
        assert_eq!(descriptor.return_type, None);
        assert_eq!(descriptor.parameter_width(), 5);
        assert_eq!(descriptor.render(), "(IJLjava/lang/String;[B)V");

        let descriptor = MethodDescriptor::parse("()Ljava/lang/Object;").unwrap();
        assert_eq!(descriptor.parameters.len(), 0);
        assert_eq!(
            descriptor.return_type,
            Some(FieldType::object("java/lang/Object"))
        );
    }

    #[test]
    fn nested_arrays_flatten_dimensions() {
        let array = FieldType::array(FieldType::array(FieldType::int()));
        assert_eq!(array.render(), "[[I");
    }

    #[test]
    fn junk_descriptors_are_rejected() {
        assert!(FieldType::parse("Q").is_err());
        assert!(FieldType::parse("Ljava/lang/Object").is_err());
        assert!(MethodDescriptor::parse("(I").is_err());
    }
}

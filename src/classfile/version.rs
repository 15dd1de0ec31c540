use super::{Deserialize, Error, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Result;

/// Version of the class file, which is used to verify that the JVM has the necessary features to
/// interpret the class
///
/// Also gates which constant pool tags are legal ([`crate::classfile::ConstantPool::read`]) and
/// whether the assembler computes stack map frames (Java 6 and up).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    /// The first published class file version (Java 1.0.2)
    pub const JAVA1: Version = Version { major: 45, minor: 3 };

    /// Java SE 5, the last version before stack map frames
    pub const JAVA5: Version = Version { major: 49, minor: 0 };

    /// Java SE 6, the first version carrying `StackMapTable` attributes
    pub const JAVA6: Version = Version { major: 50, minor: 0 };

    /// Java SE 7: `invokedynamic`, and `jsr`/`ret` become unverifiable
    pub const JAVA7: Version = Version { major: 51, minor: 0 };

    /// Java SE 8 (released March 2014)
    pub const JAVA8: Version = Version { major: 52, minor: 0 };

    /// Java SE 9: modules
    pub const JAVA9: Version = Version { major: 53, minor: 0 };

    /// Java SE 11: `CONSTANT_Dynamic`
    pub const JAVA11: Version = Version { major: 55, minor: 0 };

    /// Do class files of this version carry (and require) stack map frames?
    pub fn has_stack_maps(&self) -> bool {
        *self >= Version::JAVA6
    }

    /// Are `jsr`/`ret` still verifiable at this version?
    pub fn allows_subroutines(&self) -> bool {
        *self < Version::JAVA7
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor.serialize(writer)?;
        self.major.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        let minor = u16::deserialize(reader)?;
        let major = u16::deserialize(reader)?;
        Ok(Version { major, minor })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_is_major_then_minor() {
        assert!(Version::JAVA1 < Version::JAVA6);
        assert!(Version { major: 50, minor: 1 } > Version::JAVA6);
        assert!(Version::JAVA6.has_stack_maps());
        assert!(!Version::JAVA5.has_stack_maps());
        assert!(Version::JAVA6.allows_subroutines());
        assert!(!Version::JAVA7.allows_subroutines());
    }
}

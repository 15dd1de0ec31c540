use super::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Result;

/// Utility trait for serializing data inside class files
///
/// Java class files have some peculiarities that make it useful to define an extra trait (instead
/// of just using `serde`):
///
///   - tags are always `u8`
///   - when serializing a sequence, the length of the sequence is usually `u16`
///
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

/// Counterpart of [`Serialize`] for reading constructs back out of a class file
///
/// Short reads surface as [`Error::IoShort`] carrying the width of the value that could not be
/// read, so that callers can report how much input was missing.
pub trait Deserialize: Sized {
    /// Deserialize construct from a binary input stream
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error>;
}

fn short(expected: usize) -> impl FnOnce(std::io::Error) -> Error {
    move |err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::IoShort { expected },
        _ => Error::Io(err),
    }
}

macro_rules! primitive_codec {
    ($ty:ty, $width:literal, $write:ident, $read:ident) => {
        impl Serialize for $ty {
            fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
                writer.$write::<BigEndian>(*self)
            }
        }

        impl Deserialize for $ty {
            fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
                reader.$read::<BigEndian>().map_err(short($width))
            }
        }
    };
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Deserialize for u8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        reader.read_u8().map_err(short(1))
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

impl Deserialize for i8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        reader.read_i8().map_err(short(1))
    }
}

primitive_codec!(u16, 2, write_u16, read_u16);
primitive_codec!(u32, 4, write_u32, read_u32);
primitive_codec!(u64, 8, write_u64, read_u64);
primitive_codec!(i16, 2, write_i16, read_i16);
primitive_codec!(i32, 4, write_i32, read_i32);
primitive_codec!(i64, 8, write_i64, read_i64);
primitive_codec!(f32, 4, write_f32, read_f32);
primitive_codec!(f64, 8, write_f64, read_f64);

/// Size in `u16` is the first thing serialized/deserialized
impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u16).serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

impl<A: Deserialize> Deserialize for Vec<A> {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::result::Result<Self, Error> {
        let len = u16::deserialize(reader)? as usize;
        let mut elems = Vec::with_capacity(len.min(0xFFFF));
        for _ in 0..len {
            elems.push(A::deserialize(reader)?);
        }
        Ok(elems)
    }
}

/// Read exactly `len` bytes
pub fn read_bytes<R: ReadBytesExt>(
    reader: &mut R,
    len: usize,
) -> std::result::Result<Vec<u8>, Error> {
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).map_err(short(len))?;
    Ok(buffer)
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u{0000}` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for c in string.chars() {
        // Handle the exception for how `\u{0000}` is represented
        let len: usize = if c == '\u{0000}' { 2 } else { c.len_utf8() };
        let code: u32 = c as u32;

        match len {
            1 => buffer.push(code as u8),
            2 => {
                buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
            3 => {
                buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }

            // Supplementary characters: main divergence from unicode
            _ => {
                buffer.push(0b1110_1101);
                buffer.push(((code >> 16 & 0x0F) as u8).wrapping_sub(1) & 0x0F | 0b1010_0000);
                buffer.push((code >> 10 & 0x3F) as u8 | 0b1000_0000);

                buffer.push(0b1110_1101);
                buffer.push(((code >> 6 & 0x1F) as u8) | 0b1011_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

/// Decode modified UTF-8, skipping ill-formed sequences.
///
/// Obfuscators routinely write junk byte sequences into UTF-8 constants; bytes that fail to
/// decode are dropped rather than failing the whole pool.
pub fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut string = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b0 = bytes[i];

        if b0 & 0b1000_0000 == 0 {
            string.push(b0 as char);
            i += 1;
            continue;
        }

        if b0 & 0b1110_0000 == 0b1100_0000 {
            match bytes.get(i + 1) {
                Some(&b1) if b1 & 0b1100_0000 == 0b1000_0000 => {
                    let code = ((b0 as u32 & 0x1F) << 6) | (b1 as u32 & 0x3F);
                    // `C0 80` is the escaped null character
                    match char::from_u32(code) {
                        Some(c) => string.push(c),
                        None => {}
                    }
                    i += 2;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
        }

        if b0 & 0b1111_0000 == 0b1110_0000 {
            match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(&b1), Some(&b2))
                    if b1 & 0b1100_0000 == 0b1000_0000 && b2 & 0b1100_0000 == 0b1000_0000 =>
                {
                    let code =
                        ((b0 as u32 & 0x0F) << 12) | ((b1 as u32 & 0x3F) << 6) | (b2 as u32 & 0x3F);

                    // High surrogate: try to pair it with a following 3-byte low surrogate
                    if (0xD800..0xDC00).contains(&code) {
                        if let (Some(&c0), Some(&c1), Some(&c2)) =
                            (bytes.get(i + 3), bytes.get(i + 4), bytes.get(i + 5))
                        {
                            if c0 & 0b1111_0000 == 0b1110_0000 {
                                let low = ((c0 as u32 & 0x0F) << 12)
                                    | ((c1 as u32 & 0x3F) << 6)
                                    | (c2 as u32 & 0x3F);
                                if (0xDC00..0xE000).contains(&low) {
                                    let supplementary = 0x10000
                                        + ((code - 0xD800) << 10)
                                        + (low - 0xDC00);
                                    if let Some(c) = char::from_u32(supplementary) {
                                        string.push(c);
                                    }
                                    i += 6;
                                    continue;
                                }
                            }
                        }
                        // Unpaired surrogate, skip it
                        i += 3;
                        continue;
                    }

                    match char::from_u32(code) {
                        Some(c) => string.push(c),
                        None => {}
                    }
                    i += 3;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
        }

        // 0b10xxxxxx continuation byte (or 4-byte standard UTF-8, which modified UTF-8 never
        // produces) with no lead in sight
        i += 1;
    }

    string
}

#[cfg(test)]
mod modified_utf8_tests {
    use super::*;

    #[test]
    fn containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(decode_modified_utf8(&[97, 192, 128, 97]), "a\x00a");
    }

    #[test]
    fn simple_ascii() {
        assert_eq!(encode_modified_utf8("foo"), vec![102, 111, 111]);
        assert_eq!(decode_modified_utf8(b"hel10_World"), "hel10_World");
    }

    #[test]
    fn two_and_three_byte_encodings() {
        let text = "ĄǍǞǠǺȀȂȦȺӐӒ";
        assert_eq!(decode_modified_utf8(&encode_modified_utf8(text)), text);

        let text = "ऄअॲঅਅઅଅஅఅಅഅะະ༁ཨ";
        assert_eq!(decode_modified_utf8(&encode_modified_utf8(text)), text);
    }

    #[test]
    fn supplementary_characters() {
        assert_eq!(
            encode_modified_utf8("\u{10000}\u{dffff}\u{10FFFF}"),
            vec![
                237, 160, 128, 237, 176, 128, 237, 172, 191, 237, 191, 191, 237, 175, 191, 237,
                191, 191
            ]
        );
        let text = "\u{10000}\u{dffff}\u{10FFFF}";
        assert_eq!(decode_modified_utf8(&encode_modified_utf8(text)), text);
    }

    #[test]
    fn ill_formed_sequences_are_skipped() {
        // Lone continuation bytes and a truncated 2-byte sequence
        assert_eq!(decode_modified_utf8(&[0x80, 97, 0xBF, 98, 0xC3]), "ab");

        // Unpaired high surrogate
        assert_eq!(decode_modified_utf8(&[237, 160, 128, 99]), "c");
    }
}

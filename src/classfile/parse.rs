//! Binary `.class` parser producing the in-memory [ClassFile] image.
//!
//! Big-endian throughout, per the class file format.

use std::{
    borrow::Cow,
    io::{self, Read},
    rc::Rc,
};

use byteorder::{ReadBytesExt, BE};
use thiserror::Error;

use super::{
    Attribute, ClassAccessFlags, ClassFile, CpEntry, ExceptionHandler, FieldAccessFlags,
    FieldInfo, MethodAccessFlags, MethodInfo, CLASS_FILE_MAGIC, MAX_MAJOR_VERSION,
};

#[derive(Debug, Error)]
pub enum ClassParseError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("failed to decode a string at constant pool index {index}")]
    BadUtf8 { index: u16 },
    #[error("unknown or unsupported constant pool tag {tag} at index {index}")]
    BadTag { tag: u8, index: u16 },
    #[error("attribute name index {0} does not point at a Utf8 entry")]
    BadAttributeName(u16),
}

impl CpEntry {
    fn read(index: u16, mut read: impl Read) -> Result<Self, ClassParseError> {
        let tag = read.read_u8()?;
        let entry = match tag {
            1 => {
                let length = read.read_u16::<BE>()?;
                let mut bytes = vec![0; length as usize];
                read.read_exact(&mut bytes)?;

                let cow = cesu8::from_java_cesu8(&bytes)
                    .map_err(|_| ClassParseError::BadUtf8 { index })?;

                CpEntry::Utf8(match cow {
                    // from_java_cesu8 only borrows when the input was
                    // plain UTF-8 already
                    Cow::Borrowed(s) => Rc::from(s),
                    Cow::Owned(s) => Rc::from(s.as_str()),
                })
            }
            3 => CpEntry::Integer(read.read_i32::<BE>()?),
            4 => CpEntry::Float(read.read_f32::<BE>()?),
            5 => CpEntry::Long(read.read_i64::<BE>()?),
            6 => CpEntry::Double(read.read_f64::<BE>()?),
            7 => CpEntry::Class {
                name_index: read.read_u16::<BE>()?,
            },
            8 => CpEntry::String {
                string_index: read.read_u16::<BE>()?,
            },
            9 => CpEntry::Fieldref {
                class_index: read.read_u16::<BE>()?,
                name_and_type_index: read.read_u16::<BE>()?,
            },
            10 => CpEntry::Methodref {
                class_index: read.read_u16::<BE>()?,
                name_and_type_index: read.read_u16::<BE>()?,
            },
            11 => CpEntry::InterfaceMethodref {
                class_index: read.read_u16::<BE>()?,
                name_and_type_index: read.read_u16::<BE>()?,
            },
            12 => CpEntry::NameAndType {
                name_index: read.read_u16::<BE>()?,
                descriptor_index: read.read_u16::<BE>()?,
            },
            _ => return Err(ClassParseError::BadTag { tag, index }),
        };
        Ok(entry)
    }

    /// Reads the constant pool from the given reader.
    ///
    /// The count is the number of items plus one, and the first item is
    /// always a `Stub`.  A stub is also inserted after each long and
    /// double so the resulting vector mimics pool indexing exactly.
    fn read_all(count: u16, mut read: impl Read) -> Result<Vec<Self>, ClassParseError> {
        let mut result = Vec::with_capacity(count as usize);
        result.push(CpEntry::Stub);

        while (result.len() as u16) < count {
            match Self::read(result.len() as u16, &mut read)? {
                entry @ (CpEntry::Long(_) | CpEntry::Double(_)) => {
                    result.extend([entry, CpEntry::Stub])
                }
                entry => result.push(entry),
            }
        }
        Ok(result)
    }
}

fn read_attribute(
    pool: &[CpEntry],
    mut read: impl Read,
) -> Result<Attribute, ClassParseError> {
    let name_index = read.read_u16::<BE>()?;
    let length = read.read_u32::<BE>()?;
    let mut data = vec![0; length as usize];
    read.read_exact(&mut data)?;

    let name = match pool.get(name_index as usize) {
        Some(CpEntry::Utf8(s)) => s.as_ref(),
        _ => return Err(ClassParseError::BadAttributeName(name_index)),
    };

    let mut cursor = &data[..];
    let attr = match name {
        "Code" => {
            let max_stack = cursor.read_u16::<BE>()?;
            let max_locals = cursor.read_u16::<BE>()?;
            let code_length = cursor.read_u32::<BE>()?;
            let mut code = vec![0; code_length as usize];
            cursor.read_exact(&mut code)?;

            let handler_count = cursor.read_u16::<BE>()?;
            let mut exception_table = Vec::with_capacity(handler_count as usize);
            for _ in 0..handler_count {
                exception_table.push(ExceptionHandler {
                    start_pc: cursor.read_u16::<BE>()?,
                    end_pc: cursor.read_u16::<BE>()?,
                    handler_pc: cursor.read_u16::<BE>()?,
                    catch_type: cursor.read_u16::<BE>()?,
                });
            }

            // code attributes can nest attributes of their own
            // (LineNumberTable and friends); the engine has no use for
            // them
            let nested = cursor.read_u16::<BE>()?;
            for _ in 0..nested {
                let _name = cursor.read_u16::<BE>()?;
                let len = cursor.read_u32::<BE>()?;
                let mut skip = vec![0; len as usize];
                cursor.read_exact(&mut skip)?;
            }

            Attribute::Code {
                max_stack,
                max_locals,
                code,
                exception_table,
            }
        }
        "ConstantValue" => Attribute::ConstantValue(cursor.read_u16::<BE>()?),
        "Exceptions" => {
            let count = cursor.read_u16::<BE>()?;
            let mut indices = Vec::with_capacity(count as usize);
            for _ in 0..count {
                indices.push(cursor.read_u16::<BE>()?);
            }
            Attribute::Exceptions(indices)
        }
        "SourceFile" => Attribute::SourceFile(cursor.read_u16::<BE>()?),
        _ => Attribute::Other { name_index, data },
    };
    Ok(attr)
}

fn read_attributes(
    pool: &[CpEntry],
    mut read: impl Read,
) -> Result<Vec<Attribute>, ClassParseError> {
    let count = read.read_u16::<BE>()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attributes.push(read_attribute(pool, &mut read)?);
    }
    Ok(attributes)
}

/// Parses a complete class file image from raw bytes.
pub fn parse(bytes: &[u8]) -> Result<ClassFile, ClassParseError> {
    let mut read = bytes;

    let magic = read.read_u32::<BE>()?;
    if magic != CLASS_FILE_MAGIC {
        return Err(ClassParseError::BadMagic(magic));
    }

    let minor_version = read.read_u16::<BE>()?;
    let major_version = read.read_u16::<BE>()?;
    if major_version > MAX_MAJOR_VERSION {
        return Err(ClassParseError::UnsupportedVersion {
            major: major_version,
            minor: minor_version,
        });
    }

    let pool_count = read.read_u16::<BE>()?;
    let constant_pool = CpEntry::read_all(pool_count, &mut read)?;

    let access_flags = ClassAccessFlags::from_bits_retain(read.read_u16::<BE>()?);
    let this_class = read.read_u16::<BE>()?;
    let super_class = read.read_u16::<BE>()?;

    let interface_count = read.read_u16::<BE>()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(read.read_u16::<BE>()?);
    }

    let field_count = read.read_u16::<BE>()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(FieldInfo {
            access_flags: FieldAccessFlags::from_bits_retain(read.read_u16::<BE>()?),
            name_index: read.read_u16::<BE>()?,
            descriptor_index: read.read_u16::<BE>()?,
            attributes: read_attributes(&constant_pool, &mut read)?,
        });
    }

    let method_count = read.read_u16::<BE>()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(MethodInfo {
            access_flags: MethodAccessFlags::from_bits_retain(read.read_u16::<BE>()?),
            name_index: read.read_u16::<BE>()?,
            descriptor_index: read.read_u16::<BE>()?,
            attributes: read_attributes(&constant_pool, &mut read)?,
        });
    }

    let attributes = read_attributes(&constant_pool, &mut read)?;

    Ok(ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::synth::ClassSynth;

    #[test]
    fn bad_magic_is_rejected() {
        let err = parse(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ClassParseError::BadMagic(0xDEADBEEF)));
    }

    #[test]
    fn synthesized_class_round_trips() {
        let cf = ClassSynth::new("demo/Simple")
            .superclass("java/lang/Object")
            .method(
                MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
                "main",
                "([Ljava/lang/String;)V",
                1,
                1,
                vec![0xb1], // return
            )
            .build();

        let bytes = cf.to_bytes();
        let parsed = parse(&bytes).unwrap();

        assert_eq!(parsed.this_class_name().unwrap().as_ref(), "demo/Simple");
        assert_eq!(
            parsed.super_class_name().unwrap().as_ref(),
            "java/lang/Object"
        );
        let (idx, method) = parsed.find_method("main", "([Ljava/lang/String;)V").unwrap();
        assert_eq!(idx, 0);
        let attr = method.code_attr_index().unwrap();
        let (code, ..) = parsed.code_at(0, attr).unwrap();
        assert_eq!(code, [0xb1]);
    }

    #[test]
    fn truncated_pool_is_io_error() {
        let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 49, 0, 5];
        bytes.push(1); // Utf8 tag with no length
        assert!(matches!(
            parse(&bytes).unwrap_err(),
            ClassParseError::Io(_)
        ));
    }
}

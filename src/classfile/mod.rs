//! In-memory form of a parsed `.class` file.
//!
//! Read-only after load; owned by the class table and shared through
//! `Rc` with every object of the class.

use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

use crate::types::BaseType;

pub mod parse;
pub mod synth;

/// Values of the magic bytes of a JVM class file.
pub const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

/// Highest supported major version (Java 6); post-bootstrap constant
/// kinds are rejected at load time.
pub const MAX_MAJOR_VERSION: u16 = 50;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ClassAccessFlags: u16 {
        /// Declared public; may be accessed from outside its package.
        const PUBLIC = 0x0001;
        /// Declared final; no subclasses allowed.
        const FINAL = 0x0010;
        /// Treat superclass methods specially when invoked by the
        /// invokespecial instruction.
        const SUPER = 0x0020;
        /// Is an interface, not a class.
        const INTERFACE = 0x0200;
        /// Declared abstract; must not be instantiated.
        const ABSTRACT = 0x0400;
        /// Declared synthetic; not present in the source code.
        const SYNTHETIC = 0x1000;
        /// Declared as an annotation type.
        const ANNOTATION = 0x2000;
        /// Declared as an enum type.
        const ENUM = 0x4000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FieldAccessFlags: u16 {
        /// Declared public; may be accessed from outside its package.
        const PUBLIC = 0x0001;
        /// Declared private; usable only within the defining class.
        const PRIVATE = 0x0002;
        /// Declared protected; may be accessed within subclasses.
        const PROTECTED = 0x0004;
        /// Declared static.
        const STATIC = 0x0008;
        /// Declared final; never directly assigned to after object
        /// construction.
        const FINAL = 0x0010;
        /// Declared volatile; cannot be cached.
        const VOLATILE = 0x0040;
        /// Declared transient; not written or read by a persistent
        /// object manager.
        const TRANSIENT = 0x0080;
        /// Declared synthetic; not present in the source code.
        const SYNTHETIC = 0x1000;
        /// Declared as an element of an enum.
        const ENUM = 0x4000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MethodAccessFlags: u16 {
        /// Declared public; may be accessed from outside its package.
        const PUBLIC = 0x0001;
        /// Declared private; accessible only within the defining class.
        const PRIVATE = 0x0002;
        /// Declared protected; may be accessed within subclasses.
        const PROTECTED = 0x0004;
        /// Declared static.
        const STATIC = 0x0008;
        /// Declared final; must not be overridden.
        const FINAL = 0x0010;
        /// Declared synchronized; invocation is wrapped by a monitor
        /// use.
        const SYNCHRONIZED = 0x0020;
        /// A bridge method, generated by the compiler.
        const BRIDGE = 0x0040;
        /// Declared with variable number of arguments.
        const VARARGS = 0x0080;
        /// Declared native; implemented outside the bytecode set.
        const NATIVE = 0x0100;
        /// Declared abstract; no implementation is provided.
        const ABSTRACT = 0x0400;
        /// Declared strictfp; floating-point mode is FP-strict.
        const STRICT = 0x0800;
        /// Declared synthetic; not present in the source code.
        const SYNTHETIC = 0x1000;
    }
}

/// One item of the constant pool table.
///
/// Index 0 is always a `Stub`, and a stub follows each long and double
/// so the vector mimics constant-pool indexing exactly.
///
/// Each reference variant keeps its symbolic indices only; the resolved
/// local binding lives in the owning class-table entry so this
/// structure stays read-only after load.
#[derive(Debug, Clone)]
pub enum CpEntry {
    /// Placeholder for index 0 and the second slot of longs/doubles.
    Stub,
    /// A UTF-8 string, decoded from the modified UTF-8 used by Java.
    Utf8(Rc<str>),
    Integer(i32),
    Float(f32),
    /// Always followed by a `Stub`.
    Long(i64),
    /// Always followed by a `Stub`.
    Double(f64),
    /// Class reference: pool index of the fully qualified internal-form
    /// class name.
    Class { name_index: u16 },
    /// String reference: pool index of the string body.
    String { string_index: u16 },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
}

impl CpEntry {
    /// True for the two-slot entries that are followed by a stub.
    pub fn is_wide(&self) -> bool {
        matches!(self, CpEntry::Long(_) | CpEntry::Double(_))
    }
}

/// An entry of a Code attribute's exception table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Pool index of the caught class, or 0 to catch everything.
    pub catch_type: u16,
}

/// A parsed attribute.  Only the attributes the execution engine
/// consumes are structured; the rest are kept raw.
#[derive(Debug, Clone)]
pub enum Attribute {
    Code {
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionHandler>,
    },
    /// Pool index of the initial value of a static field.
    ConstantValue(u16),
    /// Pool indices of the declared thrown classes.
    Exceptions(Vec<u16>),
    SourceFile(u16),
    Other { name_index: u16, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: FieldAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: MethodAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl MethodInfo {
    /// Position of the Code attribute in `attributes`, if any.
    pub fn code_attr_index(&self) -> Option<u16> {
        self.attributes
            .iter()
            .position(|a| matches!(a, Attribute::Code { .. }))
            .map(|i| i as u16)
    }
}

/// The in-memory class file image.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<CpEntry>,
    pub access_flags: ClassAccessFlags,
    /// Pool index of this class's Class entry.
    pub this_class: u16,
    /// Pool index of the superclass's Class entry; 0 for the root.
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    pub fn pool(&self, index: u16) -> Option<&CpEntry> {
        self.constant_pool.get(index as usize)
    }

    pub fn utf8(&self, index: u16) -> Option<&Rc<str>> {
        match self.pool(index)? {
            CpEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Internal-form name behind a Class pool entry.
    pub fn class_name_at(&self, index: u16) -> Option<&Rc<str>> {
        match self.pool(index)? {
            CpEntry::Class { name_index } => self.utf8(*name_index),
            _ => None,
        }
    }

    pub fn name_and_type_at(&self, index: u16) -> Option<(&Rc<str>, &Rc<str>)> {
        match self.pool(index)? {
            CpEntry::NameAndType {
                name_index,
                descriptor_index,
            } => Some((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => None,
        }
    }

    /// This class's own internal-form name.
    pub fn this_class_name(&self) -> Option<&Rc<str>> {
        self.class_name_at(self.this_class)
    }

    /// The superclass's internal-form name, None for the root class.
    pub fn super_class_name(&self) -> Option<&Rc<str>> {
        if self.super_class == 0 {
            return None;
        }
        self.class_name_at(self.super_class)
    }

    pub fn field_name(&self, field: &FieldInfo) -> Option<&Rc<str>> {
        self.utf8(field.name_index)
    }

    pub fn field_descriptor(&self, field: &FieldInfo) -> Option<&Rc<str>> {
        self.utf8(field.descriptor_index)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Option<&Rc<str>> {
        self.utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &MethodInfo) -> Option<&Rc<str>> {
        self.utf8(method.descriptor_index)
    }

    /// Finds a method by name and descriptor in this class only.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<(u16, &MethodInfo)> {
        self.methods.iter().enumerate().find_map(|(i, m)| {
            if self.method_name(m).map(Rc::as_ref) == Some(name)
                && self.method_descriptor(m).map(Rc::as_ref) == Some(descriptor)
            {
                Some((i as u16, m))
            } else {
                None
            }
        })
    }

    /// The Code attribute of a method by the method's attribute index.
    pub fn code_at(
        &self,
        method_index: u16,
        attr_index: u16,
    ) -> Option<(&[u8], u16, u16, &[ExceptionHandler])> {
        let method = self.methods.get(method_index as usize)?;
        match method.attributes.get(attr_index as usize)? {
            Attribute::Code {
                max_stack,
                max_locals,
                code,
                exception_table,
            } => Some((code, *max_stack, *max_locals, exception_table)),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("truncated descriptor {0:?}")]
    Truncated(String),
    #[error("unknown type character {ch:?} in descriptor {descriptor:?}")]
    UnknownType { ch: char, descriptor: String },
    #[error("method descriptor {0:?} does not start with '('")]
    MissingArgs(String),
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub arg_types: Vec<BaseType>,
    /// Operand-stack slots taken by the arguments, not counting `this`;
    /// longs and doubles take two.
    pub arg_slots: u16,
    /// None for `void`.
    pub return_type: Option<BaseType>,
}

/// Value type of a field from its descriptor.
pub fn field_type(descriptor: &str) -> Result<BaseType, DescriptorError> {
    let ch = descriptor
        .bytes()
        .next()
        .ok_or_else(|| DescriptorError::Truncated(descriptor.into()))?;
    BaseType::from_descriptor_char(ch).ok_or_else(|| DescriptorError::UnknownType {
        ch: ch as char,
        descriptor: descriptor.into(),
    })
}

/// Parses a `(args)ret` method descriptor.
pub fn method_descriptor(descriptor: &str) -> Result<MethodDescriptor, DescriptorError> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(DescriptorError::MissingArgs(descriptor.into()));
    }

    let mut arg_types = Vec::new();
    let mut arg_slots = 0u16;
    let mut i = 1;
    loop {
        let ch = *bytes
            .get(i)
            .ok_or_else(|| DescriptorError::Truncated(descriptor.into()))?;
        if ch == b')' {
            i += 1;
            break;
        }
        let tpe = BaseType::from_descriptor_char(ch).ok_or(DescriptorError::UnknownType {
            ch: ch as char,
            descriptor: descriptor.into(),
        })?;
        arg_types.push(tpe);
        arg_slots += if tpe.is_wide() { 2 } else { 1 };
        i = skip_one_type(bytes, i, descriptor)?;
    }

    let ch = *bytes
        .get(i)
        .ok_or_else(|| DescriptorError::Truncated(descriptor.into()))?;
    let return_type = if ch == b'V' {
        None
    } else {
        Some(
            BaseType::from_descriptor_char(ch).ok_or(DescriptorError::UnknownType {
                ch: ch as char,
                descriptor: descriptor.into(),
            })?,
        )
    };

    Ok(MethodDescriptor {
        arg_types,
        arg_slots,
        return_type,
    })
}

/// Advances past one field-type unit starting at `i`.
fn skip_one_type(bytes: &[u8], mut i: usize, descriptor: &str) -> Result<usize, DescriptorError> {
    while bytes.get(i) == Some(&b'[') {
        i += 1;
    }
    match bytes.get(i) {
        Some(b'L') => {
            while let Some(&ch) = bytes.get(i) {
                i += 1;
                if ch == b';' {
                    return Ok(i);
                }
            }
            Err(DescriptorError::Truncated(descriptor.into()))
        }
        Some(_) => Ok(i + 1),
        None => Err(DescriptorError::Truncated(descriptor.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_descriptor_slots() {
        let d = method_descriptor("(IJLjava/lang/String;[[DZ)V").unwrap();
        assert_eq!(d.arg_slots, 1 + 2 + 1 + 1 + 1);
        assert_eq!(
            d.arg_types,
            vec![
                BaseType::Int,
                BaseType::Long,
                BaseType::Reference,
                BaseType::Reference,
                BaseType::Boolean,
            ]
        );
        assert_eq!(d.return_type, None);
    }

    #[test]
    fn method_descriptor_returns() {
        assert_eq!(
            method_descriptor("()J").unwrap().return_type,
            Some(BaseType::Long)
        );
        assert_eq!(
            method_descriptor("()[I").unwrap().return_type,
            Some(BaseType::Reference)
        );
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        assert!(method_descriptor("I)V").is_err());
        assert!(method_descriptor("(Q)V").is_err());
        assert!(method_descriptor("(I").is_err());
        assert!(field_type("").is_err());
    }

    #[test]
    fn field_types() {
        assert_eq!(field_type("I").unwrap(), BaseType::Int);
        assert_eq!(field_type("[I").unwrap(), BaseType::Reference);
        assert_eq!(field_type("Ljava/lang/Object;").unwrap(), BaseType::Reference);
    }
}

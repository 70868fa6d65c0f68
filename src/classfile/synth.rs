//! Programmatic construction and serialization of class file images.
//!
//! The bootstrap class library is synthesized with this builder when
//! the classpath does not provide the handful of `java/lang` classes
//! the machine needs to start; tests assemble fixture classes with it.

use std::collections::HashMap;
use std::rc::Rc;

use super::{
    Attribute, ClassAccessFlags, ClassFile, CpEntry, ExceptionHandler, FieldAccessFlags,
    FieldInfo, MethodAccessFlags, MethodInfo, CLASS_FILE_MAGIC,
};

/// Incremental builder for an in-memory class.
#[derive(Debug)]
pub struct ClassSynth {
    pool: Vec<CpEntry>,
    utf8_cache: HashMap<Rc<str>, u16>,
    class_cache: HashMap<u16, u16>,
    access_flags: ClassAccessFlags,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
}

impl ClassSynth {
    pub fn new(name: &str) -> ClassSynth {
        let mut synth = ClassSynth {
            pool: vec![CpEntry::Stub],
            utf8_cache: HashMap::new(),
            class_cache: HashMap::new(),
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        synth.this_class = synth.cp_class(name);
        synth
    }

    pub fn flags(mut self, access_flags: ClassAccessFlags) -> ClassSynth {
        self.access_flags = access_flags;
        self
    }

    pub fn superclass(mut self, name: &str) -> ClassSynth {
        self.super_class = self.cp_class(name);
        self
    }

    pub fn interface(mut self, name: &str) -> ClassSynth {
        let index = self.cp_class(name);
        self.interfaces.push(index);
        self
    }

    fn push(&mut self, entry: CpEntry) -> u16 {
        let index = self.pool.len() as u16;
        let wide = entry.is_wide();
        self.pool.push(entry);
        if wide {
            self.pool.push(CpEntry::Stub);
        }
        index
    }

    pub fn cp_utf8(&mut self, s: &str) -> u16 {
        if let Some(&index) = self.utf8_cache.get(s) {
            return index;
        }
        let rc: Rc<str> = Rc::from(s);
        let index = self.push(CpEntry::Utf8(rc.clone()));
        self.utf8_cache.insert(rc, index);
        index
    }

    pub fn cp_class(&mut self, name: &str) -> u16 {
        let name_index = self.cp_utf8(name);
        if let Some(&index) = self.class_cache.get(&name_index) {
            return index;
        }
        let index = self.push(CpEntry::Class { name_index });
        self.class_cache.insert(name_index, index);
        index
    }

    pub fn cp_string(&mut self, s: &str) -> u16 {
        let string_index = self.cp_utf8(s);
        self.push(CpEntry::String { string_index })
    }

    pub fn cp_int(&mut self, v: i32) -> u16 {
        self.push(CpEntry::Integer(v))
    }

    pub fn cp_float(&mut self, v: f32) -> u16 {
        self.push(CpEntry::Float(v))
    }

    pub fn cp_long(&mut self, v: i64) -> u16 {
        self.push(CpEntry::Long(v))
    }

    pub fn cp_double(&mut self, v: f64) -> u16 {
        self.push(CpEntry::Double(v))
    }

    fn cp_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.cp_utf8(name);
        let descriptor_index = self.cp_utf8(descriptor);
        self.push(CpEntry::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn cp_fieldref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.cp_class(class);
        let name_and_type_index = self.cp_name_and_type(name, descriptor);
        self.push(CpEntry::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn cp_methodref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.cp_class(class);
        let name_and_type_index = self.cp_name_and_type(name, descriptor);
        self.push(CpEntry::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn cp_interface_methodref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.cp_class(class);
        let name_and_type_index = self.cp_name_and_type(name, descriptor);
        self.push(CpEntry::InterfaceMethodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn field(mut self, access_flags: FieldAccessFlags, name: &str, descriptor: &str) -> Self {
        let name_index = self.cp_utf8(name);
        let descriptor_index = self.cp_utf8(descriptor);
        self.fields.push(FieldInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        self
    }

    pub fn method(
        self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.method_with_handlers(
            access_flags,
            name,
            descriptor,
            max_stack,
            max_locals,
            code,
            Vec::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn method_with_handlers(
        mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionHandler>,
    ) -> Self {
        let name_index = self.cp_utf8(name);
        let descriptor_index = self.cp_utf8(descriptor);
        self.cp_utf8("Code");
        self.methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes: vec![Attribute::Code {
                max_stack,
                max_locals,
                code,
                exception_table,
            }],
        });
        self
    }

    /// A method with no Code attribute: native or abstract.
    pub fn bodyless_method(
        mut self,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
    ) -> Self {
        let name_index = self.cp_utf8(name);
        let descriptor_index = self.cp_utf8(descriptor);
        self.methods.push(MethodInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        self
    }

    pub fn build(self) -> ClassFile {
        ClassFile {
            minor_version: 0,
            major_version: 48,
            constant_pool: self.pool,
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields: self.fields,
            methods: self.methods,
            attributes: Vec::new(),
        }
    }
}

impl ClassFile {
    fn find_utf8(&self, s: &str) -> Option<u16> {
        self.constant_pool.iter().position(|e| match e {
            CpEntry::Utf8(u) => u.as_ref() == s,
            _ => false,
        }).map(|i| i as u16)
    }

    /// Serializes this image back to the binary class file format.
    ///
    /// The inverse of [parse](super::parse::parse); used to place
    /// synthesized classes on a disk or archive classpath.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&(CLASS_FILE_MAGIC).to_be_bytes());
        out.extend_from_slice(&(self.minor_version).to_be_bytes());
        out.extend_from_slice(&(self.major_version).to_be_bytes());

        out.extend_from_slice(&(self.constant_pool.len() as u16).to_be_bytes());
        for entry in &self.constant_pool {
            write_cp_entry(&mut out, entry);
        }

        out.extend_from_slice(&(self.access_flags.bits()).to_be_bytes());
        out.extend_from_slice(&(self.this_class).to_be_bytes());
        out.extend_from_slice(&(self.super_class).to_be_bytes());

        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for &interface in &self.interfaces {
            out.extend_from_slice(&(interface).to_be_bytes());
        }

        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            out.extend_from_slice(&(field.access_flags.bits()).to_be_bytes());
            out.extend_from_slice(&(field.name_index).to_be_bytes());
            out.extend_from_slice(&(field.descriptor_index).to_be_bytes());
            self.write_attributes(&mut out, &field.attributes);
        }

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&(method.access_flags.bits()).to_be_bytes());
            out.extend_from_slice(&(method.name_index).to_be_bytes());
            out.extend_from_slice(&(method.descriptor_index).to_be_bytes());
            self.write_attributes(&mut out, &method.attributes);
        }

        self.write_attributes(&mut out, &self.attributes);
        out
    }

    fn write_attributes(&self, out: &mut Vec<u8>, attributes: &[Attribute]) {
        out.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
        for attr in attributes {
            let (name, body) = match attr {
                Attribute::Code {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                } => {
                    let mut body = Vec::new();
                    body.extend_from_slice(&(*max_stack).to_be_bytes());
                    body.extend_from_slice(&(*max_locals).to_be_bytes());
                    body.extend_from_slice(&(code.len() as u32).to_be_bytes());
                    body.extend_from_slice(code);
                    body.extend_from_slice(&(exception_table.len() as u16).to_be_bytes());
                    for handler in exception_table {
                        body.extend_from_slice(&(handler.start_pc).to_be_bytes());
                        body.extend_from_slice(&(handler.end_pc).to_be_bytes());
                        body.extend_from_slice(&(handler.handler_pc).to_be_bytes());
                        body.extend_from_slice(&(handler.catch_type).to_be_bytes());
                    }
                    body.extend_from_slice(&0u16.to_be_bytes()); // no nested attributes
                    ("Code", body)
                }
                Attribute::ConstantValue(index) => {
                    ("ConstantValue", index.to_be_bytes().to_vec())
                }
                Attribute::Exceptions(indices) => {
                    let mut body = Vec::new();
                    body.extend_from_slice(&(indices.len() as u16).to_be_bytes());
                    for index in indices {
                        body.extend_from_slice(&(*index).to_be_bytes());
                    }
                    ("Exceptions", body)
                }
                Attribute::SourceFile(index) => ("SourceFile", index.to_be_bytes().to_vec()),
                Attribute::Other { name_index, data } => {
                    out.extend_from_slice(&(*name_index).to_be_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                    out.extend_from_slice(data);
                    continue;
                }
            };
            // the builder interns attribute names as it goes, so this
            // lookup only misses on hand-assembled images
            let name_index = self.find_utf8(name).unwrap_or(0);
            out.extend_from_slice(&(name_index).to_be_bytes());
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }
    }
}

fn write_cp_entry(out: &mut Vec<u8>, entry: &CpEntry) {
    match entry {
        CpEntry::Stub => {} // occupies an index, writes nothing
        CpEntry::Utf8(s) => {
            out.push(1);
            let bytes = cesu8::to_java_cesu8(s);
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        CpEntry::Integer(v) => {
            out.push(3);
            out.extend_from_slice(&(*v).to_be_bytes());
        }
        CpEntry::Float(v) => {
            out.push(4);
            out.extend_from_slice(&(*v).to_be_bytes());
        }
        CpEntry::Long(v) => {
            out.push(5);
            out.extend_from_slice(&(*v).to_be_bytes());
        }
        CpEntry::Double(v) => {
            out.push(6);
            out.extend_from_slice(&(*v).to_be_bytes());
        }
        CpEntry::Class { name_index } => {
            out.push(7);
            out.extend_from_slice(&(*name_index).to_be_bytes());
        }
        CpEntry::String { string_index } => {
            out.push(8);
            out.extend_from_slice(&(*string_index).to_be_bytes());
        }
        CpEntry::Fieldref {
            class_index,
            name_and_type_index,
        } => {
            out.push(9);
            out.extend_from_slice(&(*class_index).to_be_bytes());
            out.extend_from_slice(&(*name_and_type_index).to_be_bytes());
        }
        CpEntry::Methodref {
            class_index,
            name_and_type_index,
        } => {
            out.push(10);
            out.extend_from_slice(&(*class_index).to_be_bytes());
            out.extend_from_slice(&(*name_and_type_index).to_be_bytes());
        }
        CpEntry::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => {
            out.push(11);
            out.extend_from_slice(&(*class_index).to_be_bytes());
            out.extend_from_slice(&(*name_and_type_index).to_be_bytes());
        }
        CpEntry::NameAndType {
            name_index,
            descriptor_index,
        } => {
            out.push(12);
            out.extend_from_slice(&(*name_index).to_be_bytes());
            out.extend_from_slice(&(*descriptor_index).to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_entries_are_interned() {
        let mut synth = ClassSynth::new("a/B");
        let one = synth.cp_utf8("hello");
        let two = synth.cp_utf8("hello");
        assert_eq!(one, two);
        let c1 = synth.cp_class("a/C");
        let c2 = synth.cp_class("a/C");
        assert_eq!(c1, c2);
    }

    #[test]
    fn longs_take_two_pool_slots() {
        let mut synth = ClassSynth::new("a/B");
        let long_index = synth.cp_long(7);
        let next = synth.cp_int(1);
        assert_eq!(next, long_index + 2);
    }
}

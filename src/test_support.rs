//! Synthetic class file construction for unit tests.

use crate::bytes::{write_u16, write_u32};
use crate::constant_pool::ConstantPool;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_BRIDGE: u16 = 0x0040;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;

pub(crate) const NOT_NULL: &str = "Lorg/jetbrains/annotations/NotNull;";
pub(crate) const NULLABLE: &str = "Lorg/jetbrains/annotations/Nullable;";

/// Minimal class file writer backed by the crate's own constant pool.
pub(crate) struct ClassFileBuilder {
    major: u16,
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    fields: Vec<[u16; 3]>,
    methods: Vec<Vec<u8>>,
    attributes: Vec<(u16, Vec<u8>)>,
}

/// Method definition for generated class files.
pub(crate) struct MethodSpec {
    access_flags: u16,
    name: String,
    descriptor: String,
    code: Option<CodeSpec>,
    attributes: Vec<(String, Vec<u8>)>,
}

struct CodeSpec {
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    handlers: Vec<[u16; 4]>,
    attributes: Vec<(String, Vec<u8>)>,
}

impl MethodSpec {
    pub(crate) fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
            attributes: Vec::new(),
        }
    }

    pub(crate) fn code(mut self, max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        self.code = Some(CodeSpec {
            max_stack,
            max_locals,
            code,
            handlers: Vec::new(),
            attributes: Vec::new(),
        });
        self
    }

    pub(crate) fn handler(mut self, start: u16, end: u16, handler: u16, catch_type: u16) -> Self {
        if let Some(code) = self.code.as_mut() {
            code.handlers.push([start, end, handler, catch_type]);
        }
        self
    }

    pub(crate) fn code_attribute(mut self, name: &str, info: Vec<u8>) -> Self {
        if let Some(code) = self.code.as_mut() {
            code.attributes.push((name.to_string(), info));
        }
        self
    }

    pub(crate) fn attribute(mut self, name: &str, info: Vec<u8>) -> Self {
        self.attributes.push((name.to_string(), info));
        self
    }
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: &str) -> Self {
        let mut pool = ConstantPool::empty();
        let this_class = pool.class_index(class_name).expect("this class");
        let super_class = pool.class_index(super_name).expect("super class");
        Self {
            major: 52,
            pool,
            this_class,
            super_class,
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub(crate) fn version(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    pub(crate) fn utf8(&mut self, value: &str) -> u16 {
        self.pool.utf8_index(value).expect("utf8")
    }

    pub(crate) fn class(&mut self, name: &str) -> u16 {
        self.pool.class_index(name).expect("class")
    }

    pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.pool
            .method_ref_index(owner, name, descriptor)
            .expect("method ref")
    }

    pub(crate) fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.pool
            .field_ref_index(owner, name, descriptor)
            .expect("field ref")
    }

    /// `RuntimeVisibleAnnotations`-shaped payload without element values.
    pub(crate) fn annotations(&mut self, descriptors: &[&str]) -> Vec<u8> {
        let mut info = Vec::new();
        self.write_annotations(&mut info, descriptors);
        info
    }

    /// `RuntimeVisibleParameterAnnotations`-shaped payload.
    pub(crate) fn parameter_annotations(&mut self, parameters: &[&[&str]]) -> Vec<u8> {
        let mut info = vec![parameters.len() as u8];
        for descriptors in parameters {
            self.write_annotations(&mut info, descriptors);
        }
        info
    }

    /// `InnerClasses` payload; `None` names mark anonymous classes.
    pub(crate) fn inner_classes(&mut self, entries: &[(&str, Option<&str>, Option<&str>)]) -> Vec<u8> {
        let mut info = Vec::new();
        write_u16(&mut info, entries.len() as u16);
        for (inner, outer, simple_name) in entries {
            let inner = self.class(inner);
            let outer = outer.map(|outer| self.class(outer)).unwrap_or(0);
            let simple_name = simple_name.map(|name| self.utf8(name)).unwrap_or(0);
            write_u16(&mut info, inner);
            write_u16(&mut info, outer);
            write_u16(&mut info, simple_name);
            write_u16(&mut info, 0);
        }
        info
    }

    /// `EnclosingMethod` payload naming only the enclosing class.
    pub(crate) fn enclosing_method(&mut self, class_name: &str) -> Vec<u8> {
        let mut info = Vec::new();
        write_u16(&mut info, self.class(class_name));
        write_u16(&mut info, 0);
        info
    }

    fn write_annotations(&mut self, info: &mut Vec<u8>, descriptors: &[&str]) {
        write_u16(info, descriptors.len() as u16);
        for descriptor in descriptors {
            let type_index = self.utf8(descriptor);
            write_u16(info, type_index);
            write_u16(info, 0);
        }
    }

    pub(crate) fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.fields.push([access_flags, name_index, descriptor_index]);
    }

    pub(crate) fn add_method(&mut self, method: MethodSpec) {
        let mut bytes = Vec::new();
        write_u16(&mut bytes, method.access_flags);
        write_u16(&mut bytes, self.utf8(&method.name));
        write_u16(&mut bytes, self.utf8(&method.descriptor));
        let mut attributes = Vec::new();
        if let Some(code) = method.code {
            let mut info = Vec::new();
            write_u16(&mut info, code.max_stack);
            write_u16(&mut info, code.max_locals);
            write_u32(&mut info, code.code.len() as u32);
            info.extend_from_slice(&code.code);
            write_u16(&mut info, code.handlers.len() as u16);
            for handler in &code.handlers {
                for value in handler {
                    write_u16(&mut info, *value);
                }
            }
            write_u16(&mut info, code.attributes.len() as u16);
            for (name, nested) in &code.attributes {
                self.write_attribute(&mut info, name, nested);
            }
            attributes.push(("Code".to_string(), info));
        }
        attributes.extend(method.attributes);
        write_u16(&mut bytes, attributes.len() as u16);
        for (name, info) in &attributes {
            self.write_attribute(&mut bytes, name, info);
        }
        self.methods.push(bytes);
    }

    pub(crate) fn add_attribute(&mut self, name: &str, info: Vec<u8>) {
        let name_index = self.utf8(name);
        self.attributes.push((name_index, info));
    }

    fn write_attribute(&mut self, bytes: &mut Vec<u8>, name: &str, info: &[u8]) {
        write_u16(bytes, self.utf8(name));
        write_u32(bytes, info.len() as u32);
        bytes.extend_from_slice(info);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, 0xCAFEBABE);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.major);
        self.pool.write(&mut bytes);
        write_u16(&mut bytes, 0x0021);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.fields.len() as u16);
        for field in &self.fields {
            for value in field {
                write_u16(&mut bytes, *value);
            }
            write_u16(&mut bytes, 0);
        }
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            bytes.extend_from_slice(method);
        }
        write_u16(&mut bytes, self.attributes.len() as u16);
        for (name_index, info) in &self.attributes {
            write_u16(&mut bytes, *name_index);
            write_u32(&mut bytes, info.len() as u32);
            bytes.extend_from_slice(info);
        }
        bytes
    }
}

pub(crate) fn high(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn low(value: u16) -> u8 {
    (value & 0xff) as u8
}

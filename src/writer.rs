use crate::bytes::{write_u16, write_u32};
use crate::ir::{ClassModel, CodeModel, MethodAttribute, RawAttribute};

const MAGIC: u32 = 0xCAFE_BABE;

/// Serialize a class model. A model that was parsed and left untouched
/// serializes to the bytes it was read from.
pub(crate) fn write_class(class: &ClassModel) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_u32(&mut bytes, MAGIC);
    write_u16(&mut bytes, class.minor_version);
    write_u16(&mut bytes, class.major_version);
    class.constant_pool.write(&mut bytes);
    write_u16(&mut bytes, class.access_flags);
    write_u16(&mut bytes, class.this_class);
    write_u16(&mut bytes, class.super_class);
    write_u16(&mut bytes, class.interfaces.len() as u16);
    for interface in &class.interfaces {
        write_u16(&mut bytes, *interface);
    }

    write_u16(&mut bytes, class.fields.len() as u16);
    for field in &class.fields {
        write_u16(&mut bytes, field.access_flags);
        write_u16(&mut bytes, field.name_index);
        write_u16(&mut bytes, field.descriptor_index);
        write_attributes(&mut bytes, &field.attributes);
    }

    write_u16(&mut bytes, class.methods.len() as u16);
    for method in &class.methods {
        write_u16(&mut bytes, method.access_flags);
        write_u16(&mut bytes, method.name_index);
        write_u16(&mut bytes, method.descriptor_index);
        write_u16(&mut bytes, method.attributes.len() as u16);
        for attribute in &method.attributes {
            match attribute {
                MethodAttribute::Code { name_index, code } => {
                    write_attribute(&mut bytes, *name_index, &encode_code(code));
                }
                MethodAttribute::Other(raw) => write_attribute(&mut bytes, raw.name_index, &raw.info),
            }
        }
    }

    write_attributes(&mut bytes, &class.attributes);
    bytes
}

fn encode_code(code: &CodeModel) -> Vec<u8> {
    let mut info = Vec::with_capacity(code.code.len() + 32);
    write_u16(&mut info, code.max_stack);
    write_u16(&mut info, code.max_locals);
    write_u32(&mut info, code.code.len() as u32);
    info.extend_from_slice(&code.code);
    write_u16(&mut info, code.exception_table.len() as u16);
    for entry in &code.exception_table {
        write_u16(&mut info, entry.start_pc);
        write_u16(&mut info, entry.end_pc);
        write_u16(&mut info, entry.handler_pc);
        write_u16(&mut info, entry.catch_type);
    }
    write_attributes(&mut info, &code.attributes);
    info
}

fn write_attributes(bytes: &mut Vec<u8>, attributes: &[RawAttribute]) {
    write_u16(bytes, attributes.len() as u16);
    for attribute in attributes {
        write_attribute(bytes, attribute.name_index, &attribute.info);
    }
}

fn write_attribute(bytes: &mut Vec<u8>, name_index: u16, info: &[u8]) {
    write_u16(bytes, name_index);
    write_u32(bytes, info.len() as u32);
    bytes.extend_from_slice(info);
}

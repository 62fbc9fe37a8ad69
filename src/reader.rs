use crate::annotations::MethodAnnotations;
use crate::bytes::ByteReader;
use crate::constant_pool::ConstantPool;
use crate::error::{InstrumentError, Result};
use crate::ir::{
    ACC_ENUM, ACC_STATIC, ClassModel, CodeModel, ExceptionEntry, FieldModel, MethodAttribute,
    MethodKind, MethodModel, RawAttribute,
};

const MAGIC: u32 = 0xCAFE_BABE;
const OLDEST_MAJOR_VERSION: u16 = 45;
/// Java 5, the first class file version carrying annotation attributes.
const FIRST_ANNOTATED_MAJOR_VERSION: u16 = 49;

const CODE: &str = "Code";
const INNER_CLASSES: &str = "InnerClasses";
const ENCLOSING_METHOD: &str = "EnclosingMethod";

/// javac field names for the outer instance (`this$0`) and captured locals (`val$name`).
const OUTER_INSTANCE_PREFIX: &str = "this$";
const CAPTURED_VARIABLE_PREFIX: &str = "val$";

/// Outcome of reading a class file.
#[derive(Debug)]
pub(crate) enum ParsedClass {
    /// The class predates annotations; only the header was read.
    Unsupported { major_version: u16 },
    Model(ClassModel),
}

pub(crate) fn parse_class_bytes(data: &[u8]) -> Result<ParsedClass> {
    let mut reader = ByteReader::new(data);
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(InstrumentError::malformed(format!(
            "bad magic number 0x{magic:08x}"
        )));
    }
    let minor_version = reader.read_u16()?;
    let major_version = reader.read_u16()?;
    if major_version < OLDEST_MAJOR_VERSION {
        return Err(InstrumentError::malformed(format!(
            "unknown class file version {major_version}.{minor_version}"
        )));
    }
    if major_version < FIRST_ANNOTATED_MAJOR_VERSION {
        return Ok(ParsedClass::Unsupported { major_version });
    }

    let constant_pool = ConstantPool::parse(&mut reader)?;
    let access_flags = reader.read_u16()?;
    let this_class = reader.read_u16()?;
    let super_class = reader.read_u16()?;
    let name = constant_pool.class_name(this_class)?;
    if super_class != 0 {
        constant_pool.class_name(super_class)?;
    }
    let interface_count = reader.read_u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(reader.read_u16()?);
    }

    let field_count = reader.read_u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(FieldModel {
            access_flags: reader.read_u16()?,
            name_index: reader.read_u16()?,
            descriptor_index: reader.read_u16()?,
            attributes: parse_raw_attributes(&mut reader)?,
        });
    }

    let method_count = reader.read_u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        methods.push(parse_method(&mut reader, &constant_pool)?);
    }

    let attributes = parse_raw_attributes(&mut reader)?;
    if !reader.is_empty() {
        return Err(InstrumentError::malformed(format!(
            "{} trailing bytes after class attributes",
            reader.remaining()
        )));
    }
    let own_entry = own_inner_class_entry(&name, &attributes, &constant_pool)?;
    let is_anonymous = own_entry.is_some_and(|entry| entry.inner_name == 0);
    let field_names = fields
        .iter()
        .map(|field| constant_pool.utf8(field.name_index))
        .collect::<Result<Vec<_>>>()?;
    let synthetic_constructor_parameters = if access_flags & ACC_ENUM != 0 {
        2
    } else {
        match own_entry {
            Some(entry) if entry.access_flags & ACC_STATIC != 0 => 0,
            Some(entry) if entry.outer_class != 0 && entry.inner_name != 0 => 1,
            // Local and anonymous classes.
            Some(_) => {
                let enclosing = enclosing_class_name(&attributes, &constant_pool)?;
                usize::from(has_outer_instance(
                    &field_names,
                    enclosing.as_deref(),
                    &methods,
                ))
            }
            None => 0,
        }
    };
    let captured_constructor_parameters = field_names
        .iter()
        .filter(|field| field.starts_with(CAPTURED_VARIABLE_PREFIX))
        .count();

    Ok(ParsedClass::Model(ClassModel {
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
        name,
        is_anonymous,
        synthetic_constructor_parameters,
        captured_constructor_parameters,
    }))
}

fn parse_method(reader: &mut ByteReader<'_>, constant_pool: &ConstantPool) -> Result<MethodModel> {
    let access_flags = reader.read_u16()?;
    let name_index = reader.read_u16()?;
    let descriptor_index = reader.read_u16()?;
    let name = constant_pool.utf8(name_index)?;
    let descriptor = constant_pool.utf8(descriptor_index)?;
    let mut annotations = MethodAnnotations::default();
    let mut attributes = Vec::new();
    for attribute in parse_raw_attributes(reader)? {
        let attribute_name = constant_pool.utf8(attribute.name_index)?;
        if attribute_name == CODE {
            let code = parse_code(&attribute.info).map_err(|err| match err {
                InstrumentError::MalformedClassFile { reason } => {
                    InstrumentError::malformed(format!("method {name}{descriptor}: {reason}"))
                }
                other => other,
            })?;
            attributes.push(MethodAttribute::Code {
                name_index: attribute.name_index,
                code,
            });
        } else {
            annotations.absorb(&attribute_name, &attribute.info, constant_pool)?;
            attributes.push(MethodAttribute::Other(attribute));
        }
    }
    Ok(MethodModel {
        access_flags,
        name_index,
        descriptor_index,
        name,
        descriptor,
        kind: MethodKind::from_access(access_flags),
        annotations,
        attributes,
    })
}

pub(crate) fn parse_code(info: &[u8]) -> Result<CodeModel> {
    let mut reader = ByteReader::new(info);
    let max_stack = reader.read_u16()?;
    let max_locals = reader.read_u16()?;
    let code_length = reader.read_u32()? as usize;
    if code_length == 0 || code_length > u16::MAX as usize {
        return Err(InstrumentError::malformed(format!(
            "invalid code length {code_length}"
        )));
    }
    let code = reader.read_bytes(code_length)?.to_vec();
    let handler_count = reader.read_u16()?;
    let mut exception_table = Vec::with_capacity(handler_count as usize);
    for _ in 0..handler_count {
        exception_table.push(ExceptionEntry {
            start_pc: reader.read_u16()?,
            end_pc: reader.read_u16()?,
            handler_pc: reader.read_u16()?,
            catch_type: reader.read_u16()?,
        });
    }
    let attributes = parse_raw_attributes(&mut reader)?;
    if !reader.is_empty() {
        return Err(InstrumentError::malformed("trailing bytes in Code attribute"));
    }
    Ok(CodeModel {
        max_stack,
        max_locals,
        code,
        exception_table,
        attributes,
    })
}

fn parse_raw_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<RawAttribute>> {
    let count = reader.read_u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.read_u16()?;
        let length = reader.read_u32()? as usize;
        attributes.push(RawAttribute {
            name_index,
            info: reader.read_bytes(length)?.to_vec(),
        });
    }
    Ok(attributes)
}

/// Entry describing this class in its own `InnerClasses` attribute.
#[derive(Clone, Copy, Debug)]
struct InnerClassEntry {
    outer_class: u16,
    inner_name: u16,
    access_flags: u16,
}

fn own_inner_class_entry(
    name: &str,
    attributes: &[RawAttribute],
    constant_pool: &ConstantPool,
) -> Result<Option<InnerClassEntry>> {
    for attribute in attributes {
        if constant_pool.utf8(attribute.name_index)? != INNER_CLASSES {
            continue;
        }
        let mut reader = ByteReader::new(&attribute.info);
        let count = reader.read_u16()?;
        for _ in 0..count {
            let inner_class = reader.read_u16()?;
            let entry = InnerClassEntry {
                outer_class: reader.read_u16()?,
                inner_name: reader.read_u16()?,
                access_flags: reader.read_u16()?,
            };
            if constant_pool.class_name(inner_class)? == name {
                return Ok(Some(entry));
            }
        }
    }
    Ok(None)
}

fn enclosing_class_name(
    attributes: &[RawAttribute],
    constant_pool: &ConstantPool,
) -> Result<Option<String>> {
    for attribute in attributes {
        if constant_pool.utf8(attribute.name_index)? != ENCLOSING_METHOD {
            continue;
        }
        let class_index = ByteReader::new(&attribute.info).read_u16()?;
        return constant_pool.class_name(class_index).map(Some);
    }
    Ok(None)
}

/// A local or anonymous class declared in an instance context. javac up to 17 always keeps
/// the outer instance in a `this$N` field; later versions may drop the field but still pass
/// the instance first to every constructor.
fn has_outer_instance(
    field_names: &[String],
    enclosing: Option<&str>,
    methods: &[MethodModel],
) -> bool {
    if field_names
        .iter()
        .any(|field| field.starts_with(OUTER_INSTANCE_PREFIX))
    {
        return true;
    }
    let Some(enclosing) = enclosing else {
        return false;
    };
    let outer_parameter = format!("(L{enclosing};");
    let mut constructors = methods.iter().filter(|method| method.is_constructor()).peekable();
    constructors.peek().is_some()
        && constructors.all(|method| method.descriptor.starts_with(&outer_parameter))
}

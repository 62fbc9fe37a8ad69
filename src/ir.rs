use crate::annotations::MethodAnnotations;
use crate::constant_pool::ConstantPool;

pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_ENUM: u16 = 0x4000;
pub(crate) const ACC_BRIDGE: u16 = 0x0040;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;

pub(crate) const CONSTRUCTOR: &str = "<init>";
pub(crate) const CLASS_INITIALIZER: &str = "<clinit>";

/// Intermediate representation of a parsed class file.
#[derive(Clone, Debug)]
pub(crate) struct ClassModel {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<FieldModel>,
    pub(crate) methods: Vec<MethodModel>,
    pub(crate) attributes: Vec<RawAttribute>,
    /// Internal (slash-separated) name of this class.
    pub(crate) name: String,
    /// Anonymous class, whose constructors are compiler-generated.
    pub(crate) is_anonymous: bool,
    /// Leading constructor parameters javac adds ahead of the declared ones.
    pub(crate) synthetic_constructor_parameters: usize,
    /// Captured local variables javac appends after the declared constructor parameters.
    pub(crate) captured_constructor_parameters: usize,
}

impl ClassModel {
    /// Fully-qualified dotted name used for exclusion matching.
    pub(crate) fn qualified_name(&self) -> String {
        self.name.replace('/', ".")
    }
}

/// Attribute kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawAttribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) struct FieldModel {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<RawAttribute>,
}

/// Compiler provenance of a method, derived from its access flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MethodKind {
    Specialized,
    Synthetic,
    Bridge,
}

impl MethodKind {
    pub(crate) fn from_access(access_flags: u16) -> Self {
        if access_flags & ACC_BRIDGE != 0 {
            MethodKind::Bridge
        } else if access_flags & ACC_SYNTHETIC != 0 {
            MethodKind::Synthetic
        } else {
            MethodKind::Specialized
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct MethodModel {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: MethodKind,
    pub(crate) annotations: MethodAnnotations,
    pub(crate) attributes: Vec<MethodAttribute>,
}

impl MethodModel {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }

    pub(crate) fn code(&self) -> Option<&CodeModel> {
        self.attributes.iter().find_map(|attribute| match attribute {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }

    pub(crate) fn code_mut(&mut self) -> Option<&mut CodeModel> {
        self.attributes.iter_mut().find_map(|attribute| match attribute {
            MethodAttribute::Code { code, .. } => Some(code),
            MethodAttribute::Other(_) => None,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum MethodAttribute {
    Code { name_index: u16, code: CodeModel },
    Other(RawAttribute),
}

/// Parsed Code attribute. Nested attributes stay raw until the rewriter needs them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CodeModel {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<RawAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

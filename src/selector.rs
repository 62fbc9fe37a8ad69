use tracing::trace;

use crate::config::Configuration;
use crate::descriptor::{MethodSignature, ValueType};
use crate::error::{InstrumentError, Result};
use crate::ir::{CLASS_INITIALIZER, ClassModel, MethodKind, MethodModel};

/// Why a slot is checked; selects the wording of the exception message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckOrigin {
    Annotation,
    Implicit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ParameterCheck {
    /// Index reported in the message, counting declared parameters only.
    pub(crate) index: usize,
    pub(crate) slot: u16,
    pub(crate) value_type: ValueType,
    pub(crate) origin: CheckOrigin,
}

/// Checks to insert into one method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSelection {
    pub(crate) method_index: usize,
    pub(crate) parameters: Vec<ParameterCheck>,
    pub(crate) return_check: Option<CheckOrigin>,
}

impl MethodSelection {
    fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.return_check.is_none()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ClassSelection {
    Excluded,
    Methods(Vec<MethodSelection>),
}

pub(crate) fn select(class: &ClassModel, config: &Configuration) -> Result<ClassSelection> {
    let qualified_name = class.qualified_name();
    if config.is_excluded(&qualified_name) {
        return Ok(ClassSelection::Excluded);
    }
    let mut selections = Vec::new();
    for (method_index, method) in class.methods.iter().enumerate() {
        let Some(selection) = select_method(class, method_index, method, config)? else {
            continue;
        };
        if !selection.is_empty() {
            selections.push(selection);
        }
    }
    Ok(ClassSelection::Methods(selections))
}

fn select_method(
    class: &ClassModel,
    method_index: usize,
    method: &MethodModel,
    config: &Configuration,
) -> Result<Option<MethodSelection>> {
    if method.kind == MethodKind::Bridge {
        trace!(method = %method.name, "bridge method left unchecked");
        return Ok(None);
    }
    if method.code().is_none() || method.name == CLASS_INITIALIZER {
        return Ok(None);
    }
    if class.is_anonymous && method.is_constructor() && method.annotations.is_empty() {
        trace!(class = %class.name, "anonymous constructor defers to its super constructor");
        return Ok(None);
    }

    let signature = MethodSignature::parse(&method.descriptor)?;
    let implicit = config.implicit() && method.kind == MethodKind::Specialized;
    let annotations = &method.annotations;
    let layout = ParameterLayout::of(class, method, signature.parameters.len())?;
    if let Some(extra) = annotations
        .parameter_annotations
        .iter()
        .enumerate()
        .skip(layout.end() - layout.annotation_offset)
        .find(|(_, names)| !names.is_empty())
    {
        return Err(InstrumentError::invariant(
            method_identity(class, method),
            format!(
                "annotation on parameter {} outside the {} declared parameters",
                extra.0, layout.declared
            ),
        ));
    }

    let slots = signature.parameter_slots(method.is_static());
    let mut parameters = Vec::new();
    for (position, value_type) in signature.parameters.iter().enumerate() {
        if !layout.contains(position) || !value_type.is_reference() {
            continue;
        }
        let index = position - layout.first;
        let annotated = annotations.parameter(position - layout.annotation_offset);
        if let Some(origin) = classify(annotated, implicit, config) {
            parameters.push(ParameterCheck {
                index,
                slot: slots[position],
                value_type: *value_type,
                origin,
            });
        }
    }

    let return_check = if method.is_constructor() || !signature.return_type.is_reference() {
        None
    } else {
        classify(&annotations.return_annotations, implicit, config)
    };

    Ok(Some(MethodSelection {
        method_index,
        parameters,
        return_check,
    }))
}

/// Where the source-level parameters sit in a method descriptor.
///
/// Constructors of inner classes take the outer instance (or, for enums, the name and ordinal)
/// ahead of the declared parameters, and local or anonymous classes append their captured
/// variables after them. Neither kind is ever checked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ParameterLayout {
    /// Descriptor position of declared parameter 0.
    first: usize,
    declared: usize,
    /// Descriptor position of annotation index 0.
    annotation_offset: usize,
}

impl ParameterLayout {
    fn of(class: &ClassModel, method: &MethodModel, descriptor_count: usize) -> Result<Self> {
        let (leading, trailing) = if method.is_constructor() {
            (
                class.synthetic_constructor_parameters.min(descriptor_count),
                class.captured_constructor_parameters,
            )
        } else {
            (0, 0)
        };
        let source_count = descriptor_count.saturating_sub(leading + trailing);
        let layout = match method.annotations.declared_parameter_count {
            Some(declared) if declared > descriptor_count => {
                return Err(InstrumentError::invariant(
                    method_identity(class, method),
                    format!(
                        "{declared} annotated parameters exceed the {descriptor_count} declared in the descriptor"
                    ),
                ));
            }
            // The attribute also counts some of the leading parameters.
            Some(declared) if leading + declared > descriptor_count => ParameterLayout {
                first: leading,
                declared: source_count,
                annotation_offset: descriptor_count - declared,
            },
            Some(declared) => ParameterLayout {
                first: leading,
                declared: declared.min(source_count),
                annotation_offset: leading,
            },
            None => ParameterLayout {
                first: leading,
                declared: source_count,
                annotation_offset: leading,
            },
        };
        Ok(layout)
    }

    fn end(&self) -> usize {
        self.first + self.declared
    }

    fn contains(&self, position: usize) -> bool {
        (self.first..self.end()).contains(&position)
    }
}

fn classify(annotations: &[String], implicit: bool, config: &Configuration) -> Option<CheckOrigin> {
    if annotations.iter().any(|name| config.is_not_null(name)) {
        return Some(CheckOrigin::Annotation);
    }
    if implicit && !annotations.iter().any(|name| config.is_nullable(name)) {
        return Some(CheckOrigin::Implicit);
    }
    None
}

/// `pkg/Class.method`, as used in messages and diagnostics.
pub(crate) fn method_identity(class: &ClassModel, method: &MethodModel) -> String {
    format!("{}.{}", class.name, method.name)
}

use super::{Frame, TraceContext};
use crate::classfile::Constant;
use crate::code::{Instruction, InvokeType};
use crate::descriptors::{BaseType, Descriptor, FieldType, MethodDescriptor};
use crate::class_graph::{ArrayElement, ArrayShape, RefType};
use crate::verifier::{ErrorKind, VerificationType};

/// The type named by a `Class` constant (arrays included), or `Top` with a report
fn class_type<'g>(constant: &Constant, cx: &mut TraceContext<'g, '_>) -> VerificationType<'g> {
    match constant.class_name() {
        Some(name) => {
            VerificationType::Reference(RefType::from_class_name(name, cx.checker.graph))
        }
        None => {
            cx.verifier.report(
                ErrorKind::InvalidType,
                cx.source,
                format!("expected a class constant, got {:?}", constant),
            );
            VerificationType::Top
        }
    }
}

/// The value type of a field reference, or `Top` with a report
fn field_type<'g>(constant: &Constant, cx: &mut TraceContext<'g, '_>) -> VerificationType<'g> {
    let parsed = constant
        .member_parts()
        .and_then(|(_, _, descriptor)| FieldType::parse(descriptor).ok());
    match parsed {
        Some(field_type) => VerificationType::of_field_type(&field_type, cx.checker.graph),
        None => {
            cx.verifier.report(
                ErrorKind::InvalidType,
                cx.source,
                format!("unusable field reference {:?}", constant),
            );
            VerificationType::Top
        }
    }
}

/// `(class name, method name, descriptor)` of a method reference
fn method_parts(constant: &Constant) -> Option<(String, String, MethodDescriptor)> {
    let (class, name, descriptor) = constant.member_parts()?;
    let descriptor = MethodDescriptor::parse(descriptor).ok()?;
    Some((class.to_owned(), name.to_owned(), descriptor))
}

/// Pop a value that must be a reference (`Null` and unresolved `Top` included)
fn pop_reference<'g>(
    frame: &mut Frame<'g>,
    cx: &mut TraceContext<'g, '_>,
) -> super::Entry<'g> {
    let entry = frame.pop(VerificationType::Top, cx);
    if !entry.ty.is_reference() && entry.ty != VerificationType::Top {
        cx.verifier.report(
            ErrorKind::InvalidType,
            cx.source,
            format!("expected a reference, got {}", entry.ty),
        );
    }
    entry
}

/// Pop an array of the given primitive element, pushing nothing
fn pop_primitive_array<'g>(
    frame: &mut Frame<'g>,
    element: BaseType,
    cx: &mut TraceContext<'g, '_>,
) {
    let entry = frame.pop(VerificationType::Top, cx);
    let ok = match entry.ty {
        VerificationType::Null | VerificationType::Top => true,
        VerificationType::Reference(RefType::Array(ArrayShape {
            dimensions: 1,
            element: ArrayElement::Base(base),
        })) => {
            // `baload`/`bastore` accept both byte[] and boolean[]
            base == element
                || (element == BaseType::Byte && base == BaseType::Boolean)
        }
        _ => false,
    };
    if !ok {
        cx.verifier.report(
            ErrorKind::InvalidType,
            cx.source,
            format!("expected a {:?} array, got {}", element, entry.ty),
        );
    }
}

impl Instruction {
    /// Apply this instruction's effect to the frame
    ///
    /// This is the transfer function of the abstract interpretation: every instruction mutates
    /// the frame through the typed `pop`/`push`/`get`/`set`/`dup`/`swap` calculus, reporting
    /// conflicts through the context's verifier and substituting placeholders so that analysis
    /// always runs to completion.
    pub fn trace<'g>(&self, frame: &mut Frame<'g>, cx: &mut TraceContext<'g, '_>) {
        use Instruction::*;
        use VerificationType::*;

        let source = cx.source;

        match self {
            Nop => {}

            AConstNull => frame.push_type(Null, source),
            IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5 => {
                let value = match self {
                    IConstM1 => -1,
                    IConst0 => 0,
                    IConst1 => 1,
                    IConst2 => 2,
                    IConst3 => 3,
                    IConst4 => 4,
                    _ => 5,
                };
                frame.push_value(Int, Constant::Integer(value), source);
            }
            LConst0 => frame.push_value(Long, Constant::Long(0), source),
            LConst1 => frame.push_value(Long, Constant::Long(1), source),
            FConst0 => frame.push_value(Float, Constant::Float(0.0), source),
            FConst1 => frame.push_value(Float, Constant::Float(1.0), source),
            FConst2 => frame.push_value(Float, Constant::Float(2.0), source),
            DConst0 => frame.push_value(Double, Constant::Double(0.0), source),
            DConst1 => frame.push_value(Double, Constant::Double(1.0), source),
            BiPush(value) => {
                frame.push_value(Int, Constant::Integer(*value as i32), source);
            }
            SiPush(value) => {
                frame.push_value(Int, Constant::Integer(*value as i32), source);
            }

            Ldc(constant) => {
                let core = cx.core;
                match constant {
                    Constant::Integer(_) => {
                        frame.push_value(Int, constant.clone(), source);
                    }
                    Constant::Float(_) => {
                        frame.push_value(Float, constant.clone(), source);
                    }
                    Constant::String { .. } => frame.push_value(
                        Reference(RefType::Object(core.string)),
                        constant.clone(),
                        source,
                    ),
                    Constant::Class { .. } => frame.push_value(
                        Reference(RefType::Object(core.class)),
                        constant.clone(),
                        source,
                    ),
                    Constant::MethodHandle { .. } => frame.push_value(
                        Reference(RefType::Object(core.method_handle)),
                        constant.clone(),
                        source,
                    ),
                    Constant::MethodType { .. } => frame.push_value(
                        Reference(RefType::Object(core.method_type)),
                        constant.clone(),
                        source,
                    ),
                    Constant::Dynamic { name_and_type, .. } => {
                        let ty = name_and_type
                            .name_and_descriptor()
                            .and_then(|(_, descriptor)| FieldType::parse(descriptor).ok())
                            .map(|ft| VerificationType::of_field_type(&ft, cx.checker.graph))
                            .unwrap_or(Top);
                        if ty.is_wide() {
                            cx.verifier.report(
                                ErrorKind::InvalidType,
                                source,
                                String::from("ldc of a category 2 dynamic constant"),
                            );
                        }
                        frame.push_type(ty, source);
                    }
                    other => {
                        cx.verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            format!("ldc of unloadable constant {:?}", other),
                        );
                        frame.push_type(Top, source);
                    }
                }
            }
            Ldc2(constant) => match constant {
                Constant::Long(_) => frame.push_value(Long, constant.clone(), source),
                Constant::Double(_) => frame.push_value(Double, constant.clone(), source),
                other => {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("ldc2_w of a non-wide constant {:?}", other),
                    );
                    frame.push_type(Top, source);
                }
            },

            ILoad(index) => {
                let entry = frame.get(*index, Int, cx);
                frame.push(entry);
            }
            LLoad(index) => {
                let entry = frame.get(*index, Long, cx);
                frame.push(entry);
            }
            FLoad(index) => {
                let entry = frame.get(*index, Float, cx);
                frame.push(entry);
            }
            DLoad(index) => {
                let entry = frame.get(*index, Double, cx);
                frame.push(entry);
            }
            ALoad(index) => {
                let entry = frame.get(*index, Top, cx);
                if !entry.ty.is_reference() && entry.ty != Top {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("aload of a non-reference local of type {}", entry.ty),
                    );
                }
                frame.push(entry);
            }

            IALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Int, cx);
                frame.push_type(Int, source);
            }
            LALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Long, cx);
                frame.push_type(Long, source);
            }
            FALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Float, cx);
                frame.push_type(Float, source);
            }
            DALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Double, cx);
                frame.push_type(Double, source);
            }
            AALoad => {
                frame.pop(Int, cx);
                let array = pop_reference(frame, cx);
                let element = match array.ty {
                    Reference(ref_type) => ref_type.strip_dimension().map(Reference),
                    Null | Top => Some(Null),
                    _ => None,
                };
                match element {
                    Some(ty) => frame.push_type(ty, source),
                    None => {
                        cx.verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            format!("aaload of a non-array of type {}", array.ty),
                        );
                        frame.push_type(Top, source);
                    }
                }
            }
            BALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Byte, cx);
                frame.push_type(Int, source);
            }
            CALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Char, cx);
                frame.push_type(Int, source);
            }
            SALoad => {
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Short, cx);
                frame.push_type(Int, source);
            }

            IStore(index) => {
                let entry = frame.pop(Int, cx);
                frame.set(*index, entry, cx);
            }
            LStore(index) => {
                let entry = frame.pop(Long, cx);
                frame.set(*index, entry, cx);
            }
            FStore(index) => {
                let entry = frame.pop(Float, cx);
                frame.set(*index, entry, cx);
            }
            DStore(index) => {
                let entry = frame.pop(Double, cx);
                frame.set(*index, entry, cx);
            }
            AStore(index) => {
                // `astore` also accepts return addresses; that is how subroutines save them
                let entry = frame.pop(Top, cx);
                if !entry.ty.is_reference()
                    && !matches!(entry.ty, ReturnAddress(_))
                    && entry.ty != Top
                {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("astore of a value of type {}", entry.ty),
                    );
                }
                frame.set(*index, entry, cx);
            }

            IAStore => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Int, cx);
            }
            LAStore => {
                frame.pop(Long, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Long, cx);
            }
            FAStore => {
                frame.pop(Float, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Float, cx);
            }
            DAStore => {
                frame.pop(Double, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Double, cx);
            }
            AAStore => {
                pop_reference(frame, cx);
                frame.pop(Int, cx);
                pop_reference(frame, cx);
            }
            BAStore => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Byte, cx);
            }
            CAStore => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Char, cx);
            }
            SAStore => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                pop_primitive_array(frame, BaseType::Short, cx);
            }

            Pop => {
                let entry = frame.pop_slots(1, cx).remove(0);
                if entry.ty.is_wide() {
                    cx.verifier.report(
                        ErrorKind::InvalidTypeCategory,
                        source,
                        String::from("pop of half a category 2 value"),
                    );
                }
            }
            Pop2 => {
                frame.pop_slots(2, cx);
            }
            Dup => frame.dup(1, 0, cx),
            DupX1 => frame.dup(1, 1, cx),
            DupX2 => frame.dup(1, 2, cx),
            Dup2 => frame.dup(2, 0, cx),
            Dup2X1 => frame.dup(2, 1, cx),
            Dup2X2 => frame.dup(2, 2, cx),
            Swap => frame.swap(cx),

            IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                frame.push_type(Int, source);
            }
            LAdd | LSub | LMul | LDiv | LRem | LAnd | LOr | LXor => {
                frame.pop(Long, cx);
                frame.pop(Long, cx);
                frame.push_type(Long, source);
            }
            FAdd | FSub | FMul | FDiv | FRem => {
                frame.pop(Float, cx);
                frame.pop(Float, cx);
                frame.push_type(Float, source);
            }
            DAdd | DSub | DMul | DDiv | DRem => {
                frame.pop(Double, cx);
                frame.pop(Double, cx);
                frame.push_type(Double, source);
            }
            INeg | I2B | I2C | I2S => {
                frame.pop(Int, cx);
                frame.push_type(Int, source);
            }
            LNeg => {
                frame.pop(Long, cx);
                frame.push_type(Long, source);
            }
            FNeg => {
                frame.pop(Float, cx);
                frame.push_type(Float, source);
            }
            DNeg => {
                frame.pop(Double, cx);
                frame.push_type(Double, source);
            }
            ISh(_) => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
                frame.push_type(Int, source);
            }
            LSh(_) => {
                frame.pop(Int, cx);
                frame.pop(Long, cx);
                frame.push_type(Long, source);
            }
            IInc(index, _) => {
                let entry = frame.get(*index, Int, cx);
                let incremented = frame.cast(&entry, Int, source);
                frame.set(*index, incremented, cx);
            }

            I2L => {
                frame.pop(Int, cx);
                frame.push_type(Long, source);
            }
            I2F => {
                frame.pop(Int, cx);
                frame.push_type(Float, source);
            }
            I2D => {
                frame.pop(Int, cx);
                frame.push_type(Double, source);
            }
            L2I => {
                frame.pop(Long, cx);
                frame.push_type(Int, source);
            }
            L2F => {
                frame.pop(Long, cx);
                frame.push_type(Float, source);
            }
            L2D => {
                frame.pop(Long, cx);
                frame.push_type(Double, source);
            }
            F2I => {
                frame.pop(Float, cx);
                frame.push_type(Int, source);
            }
            F2L => {
                frame.pop(Float, cx);
                frame.push_type(Long, source);
            }
            F2D => {
                frame.pop(Float, cx);
                frame.push_type(Double, source);
            }
            D2I => {
                frame.pop(Double, cx);
                frame.push_type(Int, source);
            }
            D2L => {
                frame.pop(Double, cx);
                frame.push_type(Long, source);
            }
            D2F => {
                frame.pop(Double, cx);
                frame.push_type(Float, source);
            }

            LCmp => {
                frame.pop(Long, cx);
                frame.pop(Long, cx);
                frame.push_type(Int, source);
            }
            FCmp(_) => {
                frame.pop(Float, cx);
                frame.pop(Float, cx);
                frame.push_type(Int, source);
            }
            DCmp(_) => {
                frame.pop(Double, cx);
                frame.pop(Double, cx);
                frame.push_type(Int, source);
            }

            If(_, _) => {
                frame.pop(Int, cx);
            }
            IfICmp(_, _) => {
                frame.pop(Int, cx);
                frame.pop(Int, cx);
            }
            IfACmp(_, _) => {
                pop_reference(frame, cx);
                pop_reference(frame, cx);
            }
            IfNull(_, _) => {
                pop_reference(frame, cx);
            }
            Goto(_) | GotoW(_) => {}
            Jsr(_) | JsrW(_) => {
                frame.push_type(ReturnAddress(source), source);
            }
            Ret(index) => {
                let entry = frame.get(*index, Top, cx);
                if !matches!(entry.ty, ReturnAddress(_)) {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("ret of local {} of type {}", index, entry.ty),
                    );
                }
            }

            TableSwitch { .. } | LookupSwitch { .. } => {
                frame.pop(Int, cx);
            }

            IReturn => {
                frame.pop(Int, cx);
            }
            LReturn => {
                frame.pop(Long, cx);
            }
            FReturn => {
                frame.pop(Float, cx);
            }
            DReturn => {
                frame.pop(Double, cx);
            }
            AReturn => {
                pop_reference(frame, cx);
            }
            Return => {}

            AThrow => {
                let entry = pop_reference(frame, cx);
                let throwable_ok = match entry.ty {
                    Null | Top => true,
                    Reference(RefType::Object(class)) => {
                        cx.checker.graph.is_assignable(class, cx.core.throwable)
                    }
                    _ => false,
                };
                if !throwable_ok {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("athrow of a non-throwable of type {}", entry.ty),
                    );
                }
                frame.stack.clear();
                frame.push(entry);
            }

            GetStatic(constant) => {
                let ty = field_type(constant, cx);
                frame.push_type(ty, source);
            }
            PutStatic(constant) => {
                let ty = field_type(constant, cx);
                frame.pop(ty, cx);
            }
            GetField(constant) => {
                let ty = field_type(constant, cx);
                pop_reference(frame, cx);
                frame.push_type(ty, source);
            }
            PutField(constant) => {
                let ty = field_type(constant, cx);
                frame.pop(ty, cx);
                pop_reference(frame, cx);
            }

            Invoke(invoke_type, constant) => {
                let parts = method_parts(constant);
                let (class_name, method_name, descriptor) = match parts {
                    Some(parts) => parts,
                    None => {
                        cx.verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            format!("unusable method reference {:?}", constant),
                        );
                        return;
                    }
                };

                // Arguments come off right to left
                for parameter in descriptor.parameters.iter().rev() {
                    let expect = VerificationType::of_field_type(parameter, cx.checker.graph);
                    frame.pop(expect, cx);
                }

                let is_init = method_name == "<init>";
                if *invoke_type == InvokeType::Special && is_init {
                    let receiver = frame.pop(Top, cx);
                    match receiver.ty {
                        UninitializedThis => {
                            let initialized = cx
                                .this_class
                                .map(Reference)
                                .unwrap_or_else(|| {
                                    Reference(RefType::Object(
                                        cx.checker.graph.get_or_insert(&class_name),
                                    ))
                                });
                            frame.replace(&receiver, initialized, source);
                        }
                        Uninitialized(_) => {
                            let initialized = Reference(RefType::Object(
                                cx.checker.graph.get_or_insert(&class_name),
                            ));
                            frame.replace(&receiver, initialized, source);
                        }
                        Top => {}
                        other => {
                            cx.verifier.report(
                                ErrorKind::InvalidType,
                                source,
                                format!("<init> on an initialized value of type {}", other),
                            );
                        }
                    }
                    if descriptor.return_type.is_some() {
                        cx.verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            String::from("<init> must return void"),
                        );
                    }
                } else {
                    if *invoke_type != InvokeType::Static {
                        let owner = cx.checker.graph.get_or_insert(&class_name);
                        frame.pop(Reference(RefType::Object(owner)), cx);
                    }
                    if let Some(return_type) = &descriptor.return_type {
                        let ty = VerificationType::of_field_type(return_type, cx.checker.graph);
                        frame.push_type(ty, source);
                    }
                }
            }

            InvokeDynamic(constant) => {
                let descriptor = match constant {
                    Constant::InvokeDynamic { name_and_type, .. } => name_and_type
                        .name_and_descriptor()
                        .and_then(|(_, descriptor)| MethodDescriptor::parse(descriptor).ok()),
                    _ => None,
                };
                match descriptor {
                    Some(descriptor) => {
                        for parameter in descriptor.parameters.iter().rev() {
                            let expect =
                                VerificationType::of_field_type(parameter, cx.checker.graph);
                            frame.pop(expect, cx);
                        }
                        if let Some(return_type) = &descriptor.return_type {
                            let ty =
                                VerificationType::of_field_type(return_type, cx.checker.graph);
                            frame.push_type(ty, source);
                        }
                    }
                    None => {
                        cx.verifier.report(
                            ErrorKind::InvalidType,
                            source,
                            format!("unusable invokedynamic constant {:?}", constant),
                        );
                    }
                }
            }

            New(_) => {
                frame.push_type(Uninitialized(source), source);
            }
            NewArray(base) => {
                frame.pop(Int, cx);
                frame.push_type(
                    Reference(RefType::array_of(ArrayElement::Base(*base), 1)),
                    source,
                );
            }
            ANewArray(constant) => {
                frame.pop(Int, cx);
                let element = class_type(constant, cx);
                let ty = match element {
                    Reference(RefType::Object(class)) => {
                        Reference(RefType::array_of(ArrayElement::Object(class), 1))
                    }
                    Reference(RefType::Array(shape)) => Reference(RefType::Array(ArrayShape {
                        dimensions: shape.dimensions.saturating_add(1),
                        element: shape.element,
                    })),
                    _ => Top,
                };
                frame.push_type(ty, source);
            }
            MultiANewArray(constant, dimensions) => {
                for _ in 0..*dimensions {
                    frame.pop(Int, cx);
                }
                let ty = class_type(constant, cx);
                frame.push_type(ty, source);
            }
            ArrayLength => {
                let array = pop_reference(frame, cx);
                if !matches!(
                    array.ty,
                    Reference(RefType::Array(_)) | Null | Top
                ) {
                    cx.verifier.report(
                        ErrorKind::InvalidType,
                        source,
                        format!("arraylength of a non-array of type {}", array.ty),
                    );
                }
                frame.push_type(Int, source);
            }

            CheckCast(constant) => {
                let target = class_type(constant, cx);
                let entry = pop_reference(frame, cx);
                let cast = frame.cast(&entry, target, source);
                frame.push(cast);
            }
            InstanceOf(_) => {
                pop_reference(frame, cx);
                frame.push_type(Int, source);
            }

            MonitorEnter | MonitorExit => {
                pop_reference(frame, cx);
            }
        }
    }
}

//! `java.lang.Class` and `java.lang.ClassLoader`.

use super::{NativeDesc, non_null};
use crate::Vm;
use crate::cell::Ref;
use crate::class::{ClassId, ClassKind};
use crate::classfile::ClassAccess;
use crate::error::{VmError, VmResult};
use crate::invoke::InitStatus;
use crate::natives::{NativeArgs, NativeValue};

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new("java/lang/Class", "getName", "()Ljava/lang/String;", get_name),
    NativeDesc::new(
        "java/lang/Class",
        "forName",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        for_name,
    ),
    NativeDesc::new("java/lang/Class", "newInstance", "()Ljava/lang/Object;", new_instance),
    NativeDesc::new("java/lang/Class", "isInterface", "()Z", is_interface),
    NativeDesc::new("java/lang/Class", "isArray", "()Z", is_array),
    NativeDesc::new("java/lang/Class", "isPrimitive", "()Z", is_primitive),
    NativeDesc::new("java/lang/Class", "isInstance", "(Ljava/lang/Object;)Z", is_instance),
    NativeDesc::new(
        "java/lang/Class",
        "isAssignableFrom",
        "(Ljava/lang/Class;)Z",
        is_assignable_from,
    ),
    NativeDesc::new("java/lang/Class", "getSuperclass", "()Ljava/lang/Class;", get_superclass),
    NativeDesc::new(
        "java/lang/Class",
        "getComponentType",
        "()Ljava/lang/Class;",
        get_component_type,
    ),
    NativeDesc::new(
        "java/lang/Class",
        "getClassLoader",
        "()Ljava/lang/ClassLoader;",
        get_class_loader,
    ),
    NativeDesc::new("java/lang/Class", "desiredAssertionStatus", "()Z", desired_assertion_status),
    NativeDesc::new(
        "java/lang/ClassLoader",
        "getSystemClassLoader",
        "()Ljava/lang/ClassLoader;",
        get_system_class_loader,
    ),
    NativeDesc::new(
        "java/lang/ClassLoader",
        "loadClass",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        load_class,
    ),
];

fn this_class(vm: &Vm, args: &NativeArgs) -> VmResult<ClassId> {
    vm.class_of_mirror(args.reference(vm, 0))
        .ok_or_else(|| VmError::internal("Class object without class data"))
}

fn mirror_or_null(vm: &mut Vm, class: Option<ClassId>) -> VmResult<NativeValue> {
    match class {
        Some(class) => Ok(NativeValue::Ref(vm.mirror_of(class)?)),
        None => Ok(NativeValue::Ref(Ref::NULL)),
    }
}

fn get_name(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let name = vm.classes[class].java_name();
    Ok(NativeValue::Ref(vm.intern(&name)?))
}

/// Loads through the application loader, in either name form. The class
/// is not initialized.
fn find_named(vm: &mut Vm, name: Ref, loader: Ref) -> VmResult<NativeValue> {
    let name = non_null(vm, name)?;
    let dotted = vm.string_value(name);
    match vm.find_class(&dotted.replace('.', "/"), loader)? {
        Some(class) => Ok(NativeValue::Ref(vm.mirror_of(class)?)),
        None => super::throw(vm, "java/lang/ClassNotFoundException", &dotted),
    }
}

fn for_name(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let loader = vm.app_loader;
    find_named(vm, args.reference(vm, 0), loader)
}

fn new_instance(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let c = &vm.classes[class];
    let instantiable = matches!(c.kind, ClassKind::Instance)
        && !c.access.intersects(ClassAccess::INTERFACE | ClassAccess::ABSTRACT);
    if !instantiable {
        let name = c.java_name();
        return super::throw(vm, "java/lang/InstantiationException", &name);
    }
    match vm.ensure_initialized(class)? {
        // the invoke runs again once <clinit> returns
        InitStatus::Pushed => Ok(NativeValue::Frames),
        InitStatus::Blocked => {
            vm.regs.pc = vm.regs.ppc;
            Ok(NativeValue::Frames)
        }
        InitStatus::Ready => {
            vm.regs.sp = args.base;
            vm.construct_from_native(class)
        }
    }
}

fn is_interface(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    Ok(vm.classes[class].is_interface().into())
}

fn is_array(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    Ok(vm.classes[class].is_array().into())
}

fn is_primitive(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    Ok(matches!(vm.classes[class].kind, ClassKind::Primitive(_)).into())
}

fn is_instance(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let object = args.reference(vm, 1);
    Ok((!object.is_null() && vm.instance_of(object, class)).into())
}

fn is_assignable_from(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let other = non_null(vm, args.reference(vm, 1))?;
    let Some(other) = vm.class_of_mirror(other) else {
        return Err(VmError::internal("Class object without class data"));
    };
    let primitive = |c: ClassId| matches!(vm.classes[c].kind, ClassKind::Primitive(_));
    let assignable = if primitive(class) || primitive(other) {
        class == other
    } else {
        vm.is_assignable(other, class)
    };
    Ok(assignable.into())
}

fn get_superclass(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let c = &vm.classes[class];
    let parent = if c.is_interface() { None } else { c.super_class };
    mirror_or_null(vm, parent)
}

fn get_component_type(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    let component = match vm.classes[class].kind {
        ClassKind::Array {
            component: Some(component),
            ..
        } => Some(component),
        ClassKind::Array { elem, .. } => vm
            .known
            .primitives
            .iter()
            .find(|(e, _)| *e == elem)
            .map(|&(_, id)| id),
        _ => None,
    };
    mirror_or_null(vm, component)
}

fn get_class_loader(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = this_class(vm, args)?;
    Ok(NativeValue::Ref(vm.classes[class].loader))
}

fn desired_assertion_status(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    Ok(vm.settings.assertions.into())
}

fn get_system_class_loader(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    Ok(NativeValue::Ref(vm.app_loader))
}

fn load_class(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let loader = args.reference(vm, 0);
    find_named(vm, args.reference(vm, 1), loader)
}

#[cfg(test)]
mod tests {
    use crate::builder::ClassBuilder;
    use crate::cell::Ref;
    use crate::classfile::{ClassAccess, MethodAccess};
    use crate::opcodes::*;
    use crate::testkit;

    #[test]
    fn reflection_reports_names_and_shapes() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.ldc_string("java.lang.String")
                .invokestatic("java/lang/Class", "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
                .invokevirtual("java/lang/Class", "getName", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.iconst(2).newarray(10).astore(1);
            c.aload(1)
                .invokevirtual("java/lang/Object", "getClass", "()Ljava/lang/Class;")
                .astore(2);
            c.aload(2)
                .invokevirtual("java/lang/Class", "getName", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.aload(2)
                .invokevirtual("java/lang/Class", "getComponentType", "()Ljava/lang/Class;")
                .invokevirtual("java/lang/Class", "getName", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.aload(2)
                .invokevirtual("java/lang/Class", "isArray", "()Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "java.lang.String\n[I\nint\n1\n");
    }

    #[test]
    fn for_name_of_a_missing_class_throws() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.ldc_string("p.Missing")
                .invokestatic("java/lang/Class", "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
                .op(POP);
            c.bind(end).op(RETURN);
            c.bind(handler)
                .invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V")
                .op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ClassNotFoundException"));
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "p.Missing\n");
    }

    #[test]
    fn new_instance_runs_static_and_instance_initializers() {
        let (mut vm, out) = testkit::vm();
        let mut made = ClassBuilder::new("p/Made", Some("java/lang/Object"));
        made.method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.iconst(1).invokestatic("t/Out", "print", "(I)V").op(RETURN);
        })
        .method(MethodAccess::PUBLIC, "<init>", "()V", |c| {
            c.aload(0).invokespecial("java/lang/Object", "<init>", "()V");
            c.iconst(2).invokestatic("t/Out", "print", "(I)V").op(RETURN);
        });
        vm.define_class(&made.build(), Ref::NULL).unwrap();
        let mut shape = ClassBuilder::new("p/Shape", Some("java/lang/Object"));
        shape.access(ClassAccess::PUBLIC | ClassAccess::ABSTRACT);
        vm.define_class(&shape.build(), Ref::NULL).unwrap();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.ldc_class("p/Made")
                .invokevirtual("java/lang/Class", "newInstance", "()Ljava/lang/Object;")
                .instanceof("p/Made")
                .invokestatic("t/Out", "print", "(I)V");
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.ldc_class("p/Shape")
                .invokevirtual("java/lang/Class", "newInstance", "()Ljava/lang/Object;")
                .op(POP);
            c.bind(end).op(RETURN);
            c.bind(handler)
                .invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V")
                .op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/InstantiationException"));
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "1\n2\n1\np.Shape\n");
    }
}

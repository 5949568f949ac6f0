//! `java.lang.System`.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{NativeDesc, identity_hash, non_null};
use crate::Vm;
use crate::cell::Ref;
use crate::class::{ClassKind, ElemType};
use crate::error::{VmError, VmResult};
use crate::natives::{NativeArgs, NativeValue};

const SYSTEM: &str = "java/lang/System";

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new(SYSTEM, "currentTimeMillis", "()J", current_time_millis),
    NativeDesc::new(SYSTEM, "nanoTime", "()J", nano_time),
    NativeDesc::new(
        SYSTEM,
        "arraycopy",
        "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        array_copy,
    ),
    NativeDesc::new(SYSTEM, "exit", "(I)V", exit),
    NativeDesc::new(SYSTEM, "gc", "()V", gc),
    NativeDesc::new(SYSTEM, "identityHashCode", "(Ljava/lang/Object;)I", identity_hash_code),
    NativeDesc::new(
        SYSTEM,
        "getProperty",
        "(Ljava/lang/String;)Ljava/lang/String;",
        get_property,
    ),
    NativeDesc::new(
        SYSTEM,
        "getProperty",
        "(Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
        get_property_or,
    ),
];

fn current_time_millis(_vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64);
    Ok(NativeValue::Long(millis))
}

fn nano_time(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    Ok(NativeValue::Long(vm.now_nanos() as i64))
}

fn exit(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    Err(VmError::Exit(args.int(vm, 0)))
}

fn gc(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    vm.collect_garbage();
    Ok(NativeValue::Void)
}

fn identity_hash_code(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let object = args.reference(vm, 0);
    Ok(NativeValue::Int(if object.is_null() { 0 } else { identity_hash(object) }))
}

fn array_copy(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let src = non_null(vm, args.reference(vm, 0))?;
    let src_pos = args.int(vm, 1);
    let dst = non_null(vm, args.reference(vm, 2))?;
    let dst_pos = args.int(vm, 3);
    let length = args.int(vm, 4);

    let shape = |vm: &Vm, array: Ref| match vm.classes[vm.class_of(array)].kind {
        ClassKind::Array { elem, component } => Some((elem, component)),
        _ => None,
    };
    let (Some((src_elem, src_component)), Some((dst_elem, dst_component))) =
        (shape(vm, src), shape(vm, dst))
    else {
        return super::throw(vm, "java/lang/ArrayStoreException", "arraycopy: not an array");
    };
    if src_elem != dst_elem {
        return super::throw(vm, "java/lang/ArrayStoreException", "arraycopy: type mismatch");
    }

    let in_bounds = |pos: i32, array: Ref| {
        pos >= 0 && (pos as i64 + length as i64) <= vm.array_length(array) as i64
    };
    if length < 0 || !in_bounds(src_pos, src) || !in_bounds(dst_pos, dst) {
        let message = format!("arraycopy: last source index {} out of bounds", src_pos as i64 + length as i64);
        return super::throw(vm, "java/lang/ArrayIndexOutOfBoundsException", &message);
    }
    let (src_pos, dst_pos, length) = (src_pos as usize, dst_pos as usize, length as usize);

    let checked = match (src_component, dst_component) {
        (Some(from), Some(to)) if src_elem == ElemType::Reference => !vm.is_assignable(from, to),
        _ => false,
    };
    if !checked {
        vm.array_copy(src, src_pos, dst, dst_pos, length);
        return Ok(NativeValue::Void);
    }
    // element by element, stopping at the first one the target rejects
    let Some(target) = dst_component else {
        return Ok(NativeValue::Void);
    };
    for i in 0..length {
        let value = vm.array_load_ref(src, src_pos + i);
        if !value.is_null() && !vm.instance_of(value, target) {
            let message = format!(
                "arraycopy: element type mismatch, {} cannot be stored in {}",
                vm.classes[vm.class_of(value)].java_name(),
                vm.classes[target].java_name()
            );
            return super::throw(vm, "java/lang/ArrayStoreException", &message);
        }
        vm.array_store_ref(dst, dst_pos + i, value);
    }
    Ok(NativeValue::Void)
}

/// `System.props` holds alternating keys and values.
fn property(vm: &Vm, key: &str) -> Ref {
    let props = vm.static_ref(vm.known.system, "props");
    if props.is_null() {
        return Ref::NULL;
    }
    let length = vm.array_length(props);
    (0..length / 2)
        .find(|&i| vm.string_value(vm.array_load_ref(props, 2 * i)) == key)
        .map_or(Ref::NULL, |i| vm.array_load_ref(props, 2 * i + 1))
}

fn get_property(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let key = non_null(vm, args.reference(vm, 0))?;
    let key = vm.string_value(key);
    Ok(NativeValue::Ref(property(vm, &key)))
}

fn get_property_or(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let key = non_null(vm, args.reference(vm, 0))?;
    let key = vm.string_value(key);
    let value = property(vm, &key);
    Ok(NativeValue::Ref(if value.is_null() { args.reference(vm, 1) } else { value }))
}

#[cfg(test)]
mod tests {
    use crate::config::VmSettings;
    use crate::opcodes::*;
    use crate::testkit;

    #[test]
    fn properties_include_command_line_definitions() {
        let (mut vm, out) = testkit::vm_with(VmSettings {
            properties: vec![("app.mode".into(), "fast".into())],
            ..Default::default()
        });
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.ldc_string("app.mode")
                .invokestatic("java/lang/System", "getProperty", "(Ljava/lang/String;)Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.ldc_string("java.version")
                .invokestatic("java/lang/System", "getProperty", "(Ljava/lang/String;)Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.ldc_string("missing")
                .ldc_string("fallback")
                .invokestatic(
                    "java/lang/System",
                    "getProperty",
                    "(Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
                )
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "fast\n1.6\nfallback\n");
    }

    #[test]
    fn arraycopy_checks_bounds_and_handles_overlap() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            // int[] a = {0, 1, 2, 3, 4}
            c.iconst(5).newarray(10).astore(1);
            for i in 0..5 {
                c.aload(1).iconst(i).iconst(i).op(IASTORE);
            }
            c.aload(1).iconst(0).aload(1).iconst(1).iconst(4);
            c.invokestatic("java/lang/System", "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V");
            for i in 0..5 {
                c.aload(1).iconst(i).op(IALOAD).invokestatic("t/Out", "print", "(I)V");
            }
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.aload(1).iconst(3).aload(1).iconst(0).iconst(3);
            c.invokestatic("java/lang/System", "arraycopy", "(Ljava/lang/Object;ILjava/lang/Object;II)V");
            c.bind(end).op(RETURN);
            c.bind(handler).op(POP).iconst(-1).invokestatic("t/Out", "print", "(I)V").op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ArrayIndexOutOfBoundsException"));
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "0\n0\n1\n2\n3\n-1\n");
    }

    #[test]
    fn exit_status_reaches_the_embedder() {
        let (mut vm, _) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.iconst(3).invokestatic("java/lang/System", "exit", "(I)V").op(RETURN);
        });
        assert_eq!(vm.run_main("p/Main", &[]).code(), 3);
    }
}

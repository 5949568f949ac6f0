//! `java.lang.Object`.

use super::NativeDesc;
use crate::Vm;
use crate::cell::Ref;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new("java/lang/Object", "getClass", "()Ljava/lang/Class;", get_class),
    NativeDesc::new("java/lang/Object", "hashCode", "()I", hash_code),
    NativeDesc::new("java/lang/Object", "toString", "()Ljava/lang/String;", to_string),
    NativeDesc::new("java/lang/Object", "clone", "()Ljava/lang/Object;", clone),
    NativeDesc::new("java/lang/Object", "wait", "(J)V", wait),
    NativeDesc::new("java/lang/Object", "notify", "()V", notify),
    NativeDesc::new("java/lang/Object", "notifyAll", "()V", notify_all),
];

/// Objects never move, so the chunk index is a stable identity.
pub(crate) fn identity_hash(object: Ref) -> i32 {
    object.index() as i32
}

fn get_class(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let class = vm.class_of(args.reference(vm, 0));
    Ok(NativeValue::Ref(vm.mirror_of(class)?))
}

fn hash_code(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    Ok(NativeValue::Int(identity_hash(args.reference(vm, 0))))
}

fn to_string(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let text = format!(
        "{}@{:x}",
        vm.classes[vm.class_of(this)].java_name(),
        identity_hash(this)
    );
    Ok(NativeValue::Ref(vm.new_string(&text)?))
}

fn clone(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let class = vm.class_of(this);
    if !vm.classes[class].is_array() && !vm.is_assignable(class, vm.known.cloneable) {
        let name = vm.classes[class].java_name();
        return super::throw(vm, "java/lang/CloneNotSupportedException", &name);
    }
    Ok(NativeValue::Ref(vm.shallow_clone(this)?))
}

fn wait(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let millis = args.long(vm, 1);
    vm.wait(this, millis)?;
    Ok(NativeValue::Void)
}

fn notify(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.notify(args.reference(vm, 0), false)?;
    Ok(NativeValue::Void)
}

fn notify_all(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.notify(args.reference(vm, 0), true)?;
    Ok(NativeValue::Void)
}

#[cfg(test)]
mod tests {
    use crate::builder::ClassBuilder;
    use crate::cell::Ref;
    use crate::classfile::MethodAccess;
    use crate::opcodes::*;
    use crate::testkit::{self, MAIN};

    #[test]
    fn clone_copies_fields_and_rejects_plain_objects() {
        let (mut vm, out) = testkit::vm();
        let mut point = ClassBuilder::new("p/Point", Some("java/lang/Object"));
        point
            .implements("java/lang/Cloneable")
            .field(Default::default(), "x", "I")
            .default_constructor()
            .method(MethodAccess::PUBLIC, "copy", "()Ljava/lang/Object;", |c| {
                c.aload(0)
                    .invokespecial("java/lang/Object", "clone", "()Ljava/lang/Object;")
                    .op(ARETURN);
            });
        vm.define_class(&point.build(), Ref::NULL).unwrap();
        let mut main = ClassBuilder::new("p/Main", Some("java/lang/Object"));
        main.default_constructor();
        main.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, |c| {
            c.construct("p/Point").astore(1);
            c.aload(1).iconst(7).putfield("p/Point", "x", "I");
            c.aload(1)
                .invokevirtual("p/Point", "copy", "()Ljava/lang/Object;")
                .checkcast("p/Point")
                .astore(2);
            c.aload(1).iconst(8).putfield("p/Point", "x", "I");
            c.aload(2).getfield("p/Point", "x", "I");
            c.invokestatic("t/Out", "print", "(I)V");
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.construct("p/Main")
                .invokevirtual("java/lang/Object", "toString", "()Ljava/lang/String;")
                .op(POP);
            c.construct("p/Main").astore(3);
            c.aload(3)
                .invokespecial("java/lang/Object", "clone", "()Ljava/lang/Object;")
                .op(POP);
            c.bind(end).op(RETURN);
            c.bind(handler)
                .invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V")
                .op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/CloneNotSupportedException"));
        });
        vm.define_class(&main.build(), Ref::NULL).unwrap();
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "7\np.Main\n");
    }
}

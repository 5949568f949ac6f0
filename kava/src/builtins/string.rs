//! `java.lang.String`: the char-array basics the core and tests lean on.

use super::{NativeDesc, non_null};
use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::ElemType;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

const STRING: &str = "java/lang/String";

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new(STRING, "<init>", "([C)V", init_from_chars),
    NativeDesc::new(STRING, "length", "()I", length),
    NativeDesc::new(STRING, "charAt", "(I)C", char_at),
    NativeDesc::new(STRING, "equals", "(Ljava/lang/Object;)Z", equals),
    NativeDesc::new(STRING, "hashCode", "()I", hash_code),
    NativeDesc::new(STRING, "intern", "()Ljava/lang/String;", intern),
    NativeDesc::new(STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;", concat),
    NativeDesc::new(STRING, "toCharArray", "()[C", to_char_array),
    NativeDesc::new(STRING, "valueOf", "(I)Ljava/lang/String;", value_of_int),
    NativeDesc::new(STRING, "valueOf", "(J)Ljava/lang/String;", value_of_long),
    NativeDesc::new(STRING, "valueOf", "(C)Ljava/lang/String;", value_of_char),
    NativeDesc::new(STRING, "valueOf", "(Z)Ljava/lang/String;", value_of_bool),
];

/// `s[0]*31^(n-1) + ... + s[n-1]` in wrapping arithmetic.
pub(crate) fn java_hash(units: &[u16]) -> i32 {
    units
        .iter()
        .fold(0i32, |h, &u| h.wrapping_mul(31).wrapping_add(u as i32))
}

fn string_result(vm: &mut Vm, units: &[u16]) -> VmResult<NativeValue> {
    Ok(NativeValue::Ref(vm.new_string_utf16(units)?))
}

fn char_array(vm: &mut Vm, units: &[u16]) -> VmResult<Ref> {
    let class = vm.known.char_array;
    let array = vm.new_array(class, units.len())?;
    for (i, &unit) in units.iter().enumerate() {
        vm.array_store(array, ElemType::Char, i, Cell::from_int(unit as i32));
    }
    Ok(array)
}

fn init_from_chars(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let chars = non_null(vm, args.reference(vm, 1))?;
    let length = vm.array_length(chars);
    let copy = vm.new_array(vm.known.char_array, length)?;
    vm.array_copy(chars, 0, copy, 0, length);
    vm.set_ref_field(this, vm.known.string_value, copy);
    Ok(NativeValue::Void)
}

fn length(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let value = vm.ref_field(args.reference(vm, 0), vm.known.string_value);
    let length = if value.is_null() { 0 } else { vm.array_length(value) };
    Ok(NativeValue::Int(length as i32))
}

fn char_at(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let units = vm.string_units(args.reference(vm, 0));
    let index = args.int(vm, 1);
    match usize::try_from(index).ok().and_then(|i| units.get(i)) {
        Some(&unit) => Ok(NativeValue::Int(unit as i32)),
        None => super::throw(vm, "java/lang/StringIndexOutOfBoundsException", &index.to_string()),
    }
}

fn equals(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let other = args.reference(vm, 1);
    if other == this {
        return Ok(true.into());
    }
    if other.is_null() || vm.class_of(other) != vm.known.string {
        return Ok(false.into());
    }
    Ok((vm.string_units(this) == vm.string_units(other)).into())
}

fn hash_code(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let units = vm.string_units(args.reference(vm, 0));
    Ok(NativeValue::Int(java_hash(&units)))
}

fn intern(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = vm.string_value(args.reference(vm, 0));
    Ok(NativeValue::Ref(vm.intern(&text)?))
}

fn concat(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    let other = non_null(vm, args.reference(vm, 1))?;
    let tail = vm.string_units(other);
    if tail.is_empty() {
        return Ok(NativeValue::Ref(this));
    }
    let mut units = vm.string_units(this);
    units.extend_from_slice(&tail);
    string_result(vm, &units)
}

fn to_char_array(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let units = vm.string_units(args.reference(vm, 0));
    Ok(NativeValue::Ref(char_array(vm, &units)?))
}

fn value_of_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = args.int(vm, 0).to_string();
    Ok(NativeValue::Ref(vm.new_string(&text)?))
}

fn value_of_long(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = args.long(vm, 0).to_string();
    Ok(NativeValue::Ref(vm.new_string(&text)?))
}

fn value_of_char(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let unit = args.int(vm, 0) as u16;
    string_result(vm, &[unit])
}

fn value_of_bool(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = if args.int(vm, 0) != 0 { "true" } else { "false" };
    Ok(NativeValue::Ref(vm.intern(text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::*;
    use crate::testkit;

    #[test]
    fn hash_matches_java() {
        let units: Vec<u16> = "hello".encode_utf16().collect();
        assert_eq!(java_hash(&units), 99162322);
        assert_eq!(java_hash(&[]), 0);
        // wraps past i32::MAX
        let units: Vec<u16> = "polygenelubricants".encode_utf16().collect();
        assert_eq!(java_hash(&units), i32::MIN);
    }

    #[test]
    fn string_operations_from_bytecode() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.ldc_string("kava")
                .ldc_string("vm")
                .invokevirtual(STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;")
                .astore(1);
            c.aload(1).invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.aload(1)
                .invokevirtual(STRING, "length", "()I")
                .invokestatic("t/Out", "print", "(I)V");
            c.aload(1)
                .iconst(4)
                .invokevirtual(STRING, "charAt", "(I)C")
                .invokestatic("t/Out", "print", "(I)V");
            c.aload(1)
                .ldc_string("kavavm")
                .invokevirtual(STRING, "equals", "(Ljava/lang/Object;)Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.aload(1)
                .invokevirtual(STRING, "intern", "()Ljava/lang/String;")
                .ldc_string("kavavm");
            let same = c.label();
            let done = c.label();
            c.branch(IF_ACMPEQ, same);
            c.iconst(0).goto(done);
            c.bind(same).iconst(1);
            c.bind(done).invokestatic("t/Out", "print", "(I)V");
            c.aload(1)
                .invokevirtual(STRING, "toCharArray", "()[C")
                .astore(2);
            c.new_object(STRING).op(DUP).aload(2);
            c.invokespecial(STRING, "<init>", "([C)V");
            c.invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.iconst(-12)
                .invokestatic(STRING, "valueOf", "(I)Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "kavavm\n6\n118\n1\n1\nkavavm\n-12\n");
    }
}

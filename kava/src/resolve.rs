//! Symbolic reference resolution and method selection.
//!
//! Class, field and method references are resolved against the referring
//! class's runtime constant pool and the result is cached in the entry.
//! Lookup order follows JVMS §5.4.3; virtual selection follows §5.4.5.

use crate::Vm;
use crate::class::{ClassId, ClassKind, Constant, FieldTarget, MethodBody, MethodId};
use crate::classfile::{ClassAccess, FieldAccess, MethodAccess};
use crate::error::{VmError, VmResult};
use crate::natives::NativeFn;

/// Member visibility, shared by fields and methods.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Visibility {
    Public,
    Protected,
    Package,
    Private,
}

impl From<FieldAccess> for Visibility {
    fn from(access: FieldAccess) -> Self {
        if access.contains(FieldAccess::PUBLIC) {
            Visibility::Public
        } else if access.contains(FieldAccess::PRIVATE) {
            Visibility::Private
        } else if access.contains(FieldAccess::PROTECTED) {
            Visibility::Protected
        } else {
            Visibility::Package
        }
    }
}

impl From<MethodAccess> for Visibility {
    fn from(access: MethodAccess) -> Self {
        if access.contains(MethodAccess::PUBLIC) {
            Visibility::Public
        } else if access.contains(MethodAccess::PRIVATE) {
            Visibility::Private
        } else if access.contains(MethodAccess::PROTECTED) {
            Visibility::Protected
        } else {
            Visibility::Package
        }
    }
}

impl Vm {
    // ── access ─────────────────────────────────────────────────────

    /// Same runtime package: same defining loader and package name.
    fn same_package(&self, a: ClassId, b: ClassId) -> bool {
        let (a, b) = (&self.classes[a], &self.classes[b]);
        a.loader == b.loader && a.package() == b.package()
    }

    fn class_accessible(&self, from: ClassId, mut to: ClassId) -> bool {
        while let ClassKind::Array {
            component: Some(component),
            ..
        } = self.classes[to].kind
        {
            to = component;
        }
        let target = &self.classes[to];
        match target.kind {
            ClassKind::Instance => {
                target.access.contains(ClassAccess::PUBLIC) || self.same_package(from, to)
            }
            _ => true,
        }
    }

    fn member_accessible(&self, from: ClassId, declaring: ClassId, visibility: Visibility) -> bool {
        match visibility {
            Visibility::Public => true,
            Visibility::Private => from == declaring,
            Visibility::Protected => {
                self.same_package(from, declaring) || self.classes.is_subclass(from, declaring)
            }
            Visibility::Package => self.same_package(from, declaring),
        }
    }

    fn bad_constant(&mut self, index: u16, expected: &str) -> VmError {
        self.throw_new(
            "java/lang/VerifyError",
            Some(&format!("constant pool entry {index} is not a {expected} reference")),
        )
    }

    /// Finds `name` among the classes `loader` or one of its ancestors has
    /// already loaded. Never loads anything.
    pub(crate) fn loaded_class(&self, name: &str, mut loader: crate::cell::Ref) -> Option<ClassId> {
        loop {
            if let Some(id) = self.classes.lookup(name, loader) {
                return Some(id);
            }
            if loader.is_null() {
                return None;
            }
            loader = self.ref_field(loader, self.known.loader_parent);
        }
    }

    // ── classes ────────────────────────────────────────────────────

    pub(crate) fn resolve_class(&mut self, class: ClassId, index: u16) -> VmResult<ClassId> {
        let name = match self.classes[class].constants.get(index as usize) {
            Some(Constant::Class {
                resolved: Some(id), ..
            }) => return Ok(*id),
            Some(Constant::Class { name, .. }) => name.clone(),
            _ => return Err(self.bad_constant(index, "class")),
        };
        let loader = self.classes[class].loader;
        let target = self.load_class(&name, loader)?;
        if !self.class_accessible(class, target) {
            let message = format!(
                "tried to access class {} from class {}",
                self.classes[target].java_name(),
                self.classes[class].java_name()
            );
            return Err(self.throw_new("java/lang/IllegalAccessError", Some(&message)));
        }
        if let Some(Constant::Class { resolved, .. }) =
            self.classes[class].constants.get_mut(index as usize)
        {
            *resolved = Some(target);
        }
        Ok(target)
    }

    // ── fields ─────────────────────────────────────────────────────

    /// Field lookup: the class itself, then its superinterfaces, then its
    /// superclass chain.
    fn lookup_field(&self, class: ClassId, name: &str, descriptor: &str) -> Option<(FieldTarget, FieldAccess)> {
        let c = &self.classes[class];
        if let Some(field) = c.declared_field(name, descriptor) {
            let target = FieldTarget {
                class,
                slot: field.slot,
                kind: field.kind,
                is_static: field.is_static(),
                is_final: field.access.contains(FieldAccess::FINAL),
            };
            return Some((target, field.access));
        }
        c.interfaces
            .iter()
            .find_map(|&iface| self.lookup_field(iface, name, descriptor))
            .or_else(|| {
                c.super_class
                    .and_then(|s| self.lookup_field(s, name, descriptor))
            })
    }

    pub(crate) fn resolve_field(&mut self, class: ClassId, index: u16) -> VmResult<FieldTarget> {
        let (owner_index, name, descriptor) = match self.classes[class].constants.get(index as usize) {
            Some(Constant::Field {
                resolved: Some(target),
                ..
            }) => return Ok(*target),
            Some(Constant::Field {
                class,
                name,
                descriptor,
                ..
            }) => (*class, name.clone(), descriptor.clone()),
            _ => return Err(self.bad_constant(index, "field")),
        };
        let owner = self.resolve_class(class, owner_index)?;
        let Some((target, access)) = self.lookup_field(owner, &name, &descriptor) else {
            return Err(self.throw_new("java/lang/NoSuchFieldError", Some(&name)));
        };
        if !self.member_accessible(class, target.class, access.into()) {
            let message = format!(
                "tried to access field {}.{} from class {}",
                self.classes[target.class].java_name(),
                name,
                self.classes[class].java_name()
            );
            return Err(self.throw_new("java/lang/IllegalAccessError", Some(&message)));
        }
        if let Some(Constant::Field { resolved, .. }) =
            self.classes[class].constants.get_mut(index as usize)
        {
            *resolved = Some(target);
        }
        Ok(target)
    }

    // ── methods ────────────────────────────────────────────────────

    /// Searches the superinterfaces of `class` and of its superclasses.
    fn lookup_in_interfaces(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            for &iface in &c.interfaces {
                if let Some(index) = self.classes[iface].declared_method(name, descriptor) {
                    return Some(MethodId::new(iface, index));
                }
                if let Some(found) = self.lookup_in_interfaces(iface, name, descriptor) {
                    return Some(found);
                }
            }
            cursor = c.super_class;
        }
        None
    }

    /// Class method lookup: the superclass chain, then superinterfaces.
    fn lookup_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            if let Some(index) = c.declared_method(name, descriptor) {
                return Some(MethodId::new(id, index));
            }
            cursor = c.super_class;
        }
        self.lookup_in_interfaces(class, name, descriptor)
    }

    /// Interface method lookup: the interface, its superinterfaces, then
    /// `java.lang.Object`.
    fn lookup_interface_method(&self, iface: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        if let Some(index) = self.classes[iface].declared_method(name, descriptor) {
            return Some(MethodId::new(iface, index));
        }
        self.lookup_in_interfaces(iface, name, descriptor).or_else(|| {
            self.classes[self.known.object]
                .declared_method(name, descriptor)
                .map(|index| MethodId::new(self.known.object, index))
        })
    }

    /// Method `name` with `descriptor` as seen from `class`, inherited
    /// methods included.
    pub fn find_method(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        self.lookup_method(class, name, descriptor)
    }

    pub(crate) fn resolve_method(&mut self, class: ClassId, index: u16) -> VmResult<MethodId> {
        let (owner_index, name, descriptor, interface) =
            match self.classes[class].constants.get(index as usize) {
                Some(Constant::Method {
                    resolved: Some(method),
                    ..
                }) => return Ok(*method),
                Some(Constant::Method {
                    class,
                    name,
                    descriptor,
                    interface,
                    ..
                }) => (*class, name.clone(), descriptor.clone(), *interface),
                _ => return Err(self.bad_constant(index, "method")),
            };
        let owner = self.resolve_class(class, owner_index)?;
        if self.classes[owner].is_interface() != interface {
            let message = format!(
                "{} {} an interface",
                self.classes[owner].java_name(),
                if interface { "is not" } else { "is" }
            );
            return Err(self.throw_new("java/lang/IncompatibleClassChangeError", Some(&message)));
        }
        let found = if interface {
            self.lookup_interface_method(owner, &name, &descriptor)
        } else {
            self.lookup_method(owner, &name, &descriptor)
        };
        let Some(method) = found else {
            let message = format!("{}.{}{}", self.classes[owner].java_name(), name, descriptor);
            return Err(self.throw_new("java/lang/NoSuchMethodError", Some(&message)));
        };
        let visibility = self.classes.method(method).access.into();
        if !self.member_accessible(class, method.class, visibility) {
            let message = format!(
                "tried to access method {} from class {}",
                self.classes.describe(method),
                self.classes[class].java_name()
            );
            return Err(self.throw_new("java/lang/IllegalAccessError", Some(&message)));
        }
        if let Some(Constant::Method { resolved, .. }) =
            self.classes[class].constants.get_mut(index as usize)
        {
            *resolved = Some(method);
        }
        Ok(method)
    }

    // ── selection ──────────────────────────────────────────────────

    /// First non-static, non-private `name` with `descriptor` on the
    /// superclass chain of `class`.
    pub(crate) fn select_virtual(&self, class: ClassId, name: &str, descriptor: &str) -> Option<MethodId> {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            if let Some(index) = c.declared_method(name, descriptor) {
                let method = &c.methods[index];
                if !method.is_static() && !method.is_private() {
                    return Some(MethodId::new(id, index));
                }
            }
            cursor = c.super_class;
        }
        None
    }

    /// The method a virtual or interface call of `resolved` runs on a
    /// receiver of class `receiver`. Private and final methods are never
    /// overridden; a package-private method is only overridden from its own
    /// runtime package.
    pub(crate) fn select_method(&mut self, resolved: MethodId, receiver: ClassId) -> VmResult<MethodId> {
        let method = self.classes.method(resolved);
        if method.is_private() || method.access.contains(MethodAccess::FINAL) {
            return Ok(resolved);
        }
        let package_private = Visibility::from(method.access) == Visibility::Package;
        let (name, descriptor) = (method.name.clone(), method.descriptor.clone());

        let mut selected = None;
        let mut cursor = Some(receiver);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            if let Some(index) = c.declared_method(&name, &descriptor) {
                let candidate = &c.methods[index];
                let overrides = id == resolved.class
                    || !package_private
                    || self.same_package(id, resolved.class);
                if !candidate.is_static() && !candidate.is_private() && overrides {
                    selected = Some(MethodId::new(id, index));
                    break;
                }
            }
            cursor = c.super_class;
        }
        match selected {
            Some(m) if !self.classes.method(m).is_abstract() => Ok(m),
            _ => {
                let message = format!("{}.{}{}", self.classes[receiver].java_name(), name, descriptor);
                Err(self.throw_new("java/lang/AbstractMethodError", Some(&message)))
            }
        }
    }

    /// `invokespecial` selection: a superclass method named from an
    /// `ACC_SUPER` class is looked up again from the caller's superclass.
    pub(crate) fn select_special(&self, caller: ClassId, resolved: MethodId) -> MethodId {
        let method = self.classes.method(resolved);
        let c = &self.classes[caller];
        if method.name == "<init>"
            || method.is_private()
            || resolved.class == caller
            || !c.access.contains(ClassAccess::SUPER)
            || self.classes[resolved.class].is_interface()
            || !self.classes.is_subclass(caller, resolved.class)
        {
            return resolved;
        }
        c.super_class
            .and_then(|s| self.select_virtual(s, &method.name, &method.descriptor))
            .unwrap_or(resolved)
    }

    /// Binds a native method on first call.
    pub(crate) fn bind_native(&mut self, method: MethodId) -> VmResult<NativeFn> {
        let m = self.classes.method(method);
        if let MethodBody::Native(Some(function)) = &m.body {
            return Ok(*function);
        }
        let class = &self.classes[method.class];
        match self.natives.lookup(&class.name, &m.name, &m.descriptor) {
            Some(function) => {
                self.classes.method_mut(method).body = MethodBody::Native(Some(function));
                Ok(function)
            }
            None => {
                let message = self.classes.describe(method);
                Err(self.throw_new("java/lang/UnsatisfiedLinkError", Some(&message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::cell::Ref;
    use crate::classfile::{FieldAccess, MethodAccess};
    use crate::config::VmSettings;
    use crate::opcodes::{ICONST_1, ICONST_2, IRETURN, RETURN};

    fn vm() -> Vm {
        Vm::new(VmSettings::default()).unwrap()
    }

    fn thrown<T: std::fmt::Debug>(vm: &Vm, result: VmResult<T>) -> String {
        match result {
            Err(VmError::Throw(t)) => vm.classes[vm.class_of(t)].name.clone(),
            other => panic!("expected a throwable, got {other:?}"),
        }
    }

    fn returning(b: &mut ClassBuilder, access: MethodAccess, name: &str, value: u8) {
        b.method(access, name, "()I", |c| {
            c.op(value).op(IRETURN);
        });
    }

    /// p/A { f, private h, package g }, p/B extends A { f, private h },
    /// q/C extends B { g }.
    fn hierarchy(vm: &mut Vm) -> (ClassId, ClassId, ClassId) {
        let mut a = ClassBuilder::new("p/A", Some("java/lang/Object"));
        a.default_constructor();
        returning(&mut a, MethodAccess::PUBLIC, "f", ICONST_1);
        returning(&mut a, MethodAccess::PRIVATE, "h", ICONST_1);
        returning(&mut a, MethodAccess::empty(), "g", ICONST_1);
        let a = vm.define_class(&a.build(), Ref::NULL).unwrap();

        let mut b = ClassBuilder::new("p/B", Some("p/A"));
        returning(&mut b, MethodAccess::PUBLIC, "f", ICONST_2);
        returning(&mut b, MethodAccess::PRIVATE, "h", ICONST_2);
        let b = vm.define_class(&b.build(), Ref::NULL).unwrap();

        let mut c = ClassBuilder::new("q/C", Some("p/B"));
        returning(&mut c, MethodAccess::empty(), "g", ICONST_2);
        let c = vm.define_class(&c.build(), Ref::NULL).unwrap();
        (a, b, c)
    }

    #[test]
    fn virtual_selection_follows_overrides() {
        let mut vm = vm();
        let (a, b, c) = hierarchy(&mut vm);
        let f = vm.find_method(a, "f", "()I").unwrap();
        let b_f = vm.find_method(b, "f", "()I").unwrap();
        assert_eq!(b_f.class, b);
        assert_eq!(vm.select_method(f, b).unwrap(), b_f);
        assert_eq!(vm.select_method(f, c).unwrap(), b_f);
        assert_eq!(vm.select_method(f, a).unwrap(), f);
    }

    #[test]
    fn private_and_package_private_methods_are_not_overridden_across_boundaries() {
        let mut vm = vm();
        let (a, b, c) = hierarchy(&mut vm);
        let h = MethodId::new(a, vm.classes[a].declared_method("h", "()I").unwrap());
        assert_eq!(vm.select_method(h, b).unwrap(), h);
        // q/C.g lives in another package, so A.g stays selected
        let g = vm.find_method(a, "g", "()I").unwrap();
        assert_eq!(vm.select_method(g, c).unwrap(), g);
        assert_eq!(vm.select_virtual(c, "g", "()I").unwrap().class, c);
    }

    #[test]
    fn abstract_selection_throws() {
        let mut vm = vm();
        let mut i = ClassBuilder::interface("p/Shape");
        i.declare(MethodAccess::PUBLIC | MethodAccess::ABSTRACT, "area", "()I");
        let i = vm.define_class(&i.build(), Ref::NULL).unwrap();
        let mut sq = ClassBuilder::new("p/Square", Some("java/lang/Object"));
        sq.implements("p/Shape");
        let sq = vm.define_class(&sq.build(), Ref::NULL).unwrap();
        let area = MethodId::new(i, 0);
        let result = vm.select_method(area, sq);
        assert_eq!(thrown(&vm, result), "java/lang/AbstractMethodError");
    }

    #[test]
    fn method_references_resolve_and_cache() {
        let mut vm = vm();
        let (_, b, _) = hierarchy(&mut vm);
        let mut user = ClassBuilder::new("p/User", Some("java/lang/Object"));
        let f = user.pool().method_ref("p/B", "f", "()I");
        let g = user.pool().method_ref("p/B", "g", "()I");
        let missing = user.pool().method_ref("p/B", "nope", "()V");
        let as_iface = user.pool().interface_method_ref("p/B", "f", "()I");
        let user = vm.define_class(&user.build(), Ref::NULL).unwrap();

        let resolved = vm.resolve_method(user, f).unwrap();
        assert_eq!(resolved.class, b);
        assert!(matches!(
            vm.classes[user].constants[f as usize],
            Constant::Method { resolved: Some(m), .. } if m == resolved
        ));
        // inherited package-private method from the same package
        assert!(vm.resolve_method(user, g).is_ok());
        let result = vm.resolve_method(user, missing);
        assert_eq!(thrown(&vm, result), "java/lang/NoSuchMethodError");
        let result = vm.resolve_method(user, as_iface);
        assert_eq!(thrown(&vm, result), "java/lang/IncompatibleClassChangeError");
    }

    #[test]
    fn private_members_are_not_accessible_from_other_classes() {
        let mut vm = vm();
        let mut owner = ClassBuilder::new("p/Owner", Some("java/lang/Object"));
        owner.field(FieldAccess::PRIVATE, "secret", "I");
        vm.define_class(&owner.build(), Ref::NULL).unwrap();
        let mut other = ClassBuilder::new("p/Other", Some("java/lang/Object"));
        let field = other.pool().field_ref("p/Owner", "secret", "I");
        let other = vm.define_class(&other.build(), Ref::NULL).unwrap();
        let result = vm.resolve_field(other, field);
        assert_eq!(thrown(&vm, result), "java/lang/IllegalAccessError");
    }

    #[test]
    fn fields_resolve_through_interfaces_and_superclasses() {
        use crate::builder::ConstValue;
        let mut vm = vm();
        let mut iface = ClassBuilder::interface("p/Limits");
        iface.constant_field(FieldAccess::PUBLIC, "MAX", "I", ConstValue::Int(9));
        let iface = vm.define_class(&iface.build(), Ref::NULL).unwrap();
        let mut base = ClassBuilder::new("p/Base", Some("java/lang/Object"));
        base.implements("p/Limits");
        base.field(FieldAccess::PUBLIC, "count", "J");
        let base = vm.define_class(&base.build(), Ref::NULL).unwrap();
        let mut derived = ClassBuilder::new("p/Derived", Some("p/Base"));
        let max = derived.pool().field_ref("p/Derived", "MAX", "I");
        let count = derived.pool().field_ref("p/Derived", "count", "J");
        let derived = vm.define_class(&derived.build(), Ref::NULL).unwrap();

        let target = vm.resolve_field(derived, max).unwrap();
        assert_eq!(target.class, iface);
        assert!(target.is_static && target.is_final);
        let target = vm.resolve_field(derived, count).unwrap();
        assert_eq!(target.class, base);
        assert!(!target.is_static);
    }

    #[test]
    fn missing_natives_fail_to_link() {
        let mut vm = vm();
        let mut b = ClassBuilder::new("p/Native", Some("java/lang/Object"));
        b.native(MethodAccess::STATIC, "nothing", "()V");
        b.method(MethodAccess::STATIC, "unused", "()V", |c| {
            c.op(RETURN);
        });
        let class = vm.define_class(&b.build(), Ref::NULL).unwrap();
        let method = vm.find_method(class, "nothing", "()V").unwrap();
        let result = vm.bind_native(method);
        assert_eq!(thrown(&vm, result), "java/lang/UnsatisfiedLinkError");

        fn nothing(_: &mut Vm, _: &crate::natives::NativeArgs) -> VmResult<crate::natives::NativeValue> {
            Ok(crate::natives::NativeValue::Void)
        }
        vm.register_native("p/Native", "nothing", "()V", nothing);
        assert!(vm.bind_native(method).is_ok());
        assert!(matches!(vm.classes.method(method).body, MethodBody::Native(Some(_))));
    }
}

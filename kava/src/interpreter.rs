//! The bytecode interpreter: the scheduling loop, the per-slice execution
//! loop and one big dispatch over opcodes.
//!
//! Every handler leaves `regs.pc` at `regs.ppc` until it has completed, so an
//! instruction that blocks, pushes initializer frames or throws is simply
//! executed again (or unwound) from its own start. Resolving instructions
//! rewrite themselves to a fast form once their constant is resolved and
//! their class initialized, unless a debugger is attached.

use log::trace;

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{ClassId, ClassKind, ClassState, Constant, DATA_STATICS, ElemType, FieldTarget, MethodId};
use crate::debug::DebugEvent;
use crate::error::{VmError, VmResult};
use crate::invoke::InitStatus;
use crate::opcodes::{self, *};

macro_rules! binary {
    ($vm:ident, $pop:ident, $push:ident, |$a:ident, $b:ident| $body:expr) => {{
        let $b = $vm.$pop();
        let $a = $vm.$pop();
        $vm.$push($body);
        $vm.regs.pc += 1;
    }};
}

macro_rules! unary {
    ($vm:ident, $pop:ident, $push:ident, |$a:ident| $body:expr) => {{
        let $a = $vm.$pop();
        $vm.$push($body);
        $vm.regs.pc += 1;
    }};
}

/// `fcmp`/`dcmp`; `nan` is the result when either operand is NaN.
fn compare(a: f64, b: f64, nan: i32) -> i32 {
    if a < b {
        -1
    } else if a > b {
        1
    } else if a == b {
        0
    } else {
        nan
    }
}

/// Offset of the first 4-byte aligned operand after a switch opcode at `pc`.
fn switch_operands(pc: u32) -> usize {
    (pc as usize + 4) & !3
}

impl Vm {
    /// Runs threads until no non-daemon thread is left.
    pub(crate) fn run(&mut self) -> VmResult<()> {
        loop {
            if self.threads.non_daemon == 0 {
                return Ok(());
            }
            if self.timeslice == 0 || !self.threads.is_runnable(self.current) {
                self.switch_thread()?;
            }
            match self.execute() {
                Ok(()) => {}
                Err(VmError::Throw(exception)) => self.throw_exception(exception)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Executes the running thread until its time slice is used up or it
    /// gives up the processor.
    pub(crate) fn execute(&mut self) -> VmResult<()> {
        if let Some(thread) = self.threads.get_mut(self.current) {
            let pending = std::mem::replace(&mut thread.pending, Ref::NULL);
            if !pending.is_null() {
                return Err(VmError::Throw(pending));
            }
        }
        while self.timeslice > 0 {
            self.timeslice -= 1;
            self.step()?;
        }
        Ok(())
    }

    // ── operands ───────────────────────────────────────────────────

    fn code(&self) -> &[u8] {
        self.classes
            .method(self.regs.method)
            .code()
            .map_or(&[], |c| c.bytes.as_slice())
    }

    #[inline]
    fn u1(&self, offset: u32) -> u8 {
        self.code()
            .get((self.regs.ppc + offset) as usize)
            .copied()
            .unwrap_or(0)
    }

    #[inline]
    fn u2(&self, offset: u32) -> u16 {
        (self.u1(offset) as u16) << 8 | self.u1(offset + 1) as u16
    }

    #[inline]
    fn i2(&self, offset: u32) -> i16 {
        self.u2(offset) as i16
    }

    /// Signed 32-bit operand at absolute code offset `at`.
    fn i4_at(&self, at: usize) -> i32 {
        let code = self.code();
        let byte = |i: usize| code.get(at + i).copied().unwrap_or(0);
        i32::from_be_bytes([byte(0), byte(1), byte(2), byte(3)])
    }

    #[inline]
    fn jump(&mut self, offset: i32) {
        self.regs.pc = (self.regs.ppc as i64 + offset as i64) as u32;
    }

    #[inline]
    fn branch_if(&mut self, taken: bool) {
        if taken {
            let offset = self.i2(1) as i32;
            self.jump(offset);
        } else {
            self.regs.pc += 3;
        }
    }

    fn current_class(&self) -> ClassId {
        self.regs.method.class
    }

    /// Rewrites the running instruction to `op`.
    fn rewrite(&mut self, op: u8) {
        if self.debugger.is_some() {
            return;
        }
        let (method, pc) = (self.regs.method, self.regs.ppc as usize);
        if let Some(byte) = self
            .classes
            .method_mut(method)
            .code_mut()
            .and_then(|c| c.bytes.get_mut(pc))
        {
            *byte = op;
        }
    }

    // ── debugger hooks ─────────────────────────────────────────────

    /// Posts step and breakpoint events for the instruction at `ppc`.
    /// Returns the opcode to execute, or `None` when the thread was
    /// suspended and must come back to this instruction.
    fn debug_check(&mut self, op: u8) -> VmResult<Option<u8>> {
        let current = self.current;
        let (stepping, reported) = match self.threads.get(current) {
            Some(t) => (t.single_step, t.at_breakpoint),
            None => return Ok(Some(op)),
        };
        if reported {
            self.threads[current].at_breakpoint = false;
            return self.displaced(op).map(Some);
        }
        let (method, pc) = (self.regs.method, self.regs.ppc);
        if stepping {
            self.post_thread_event(DebugEvent::SingleStep { thread: current, method, pc });
        }
        if op == BREAKPOINT {
            self.post_thread_event(DebugEvent::Breakpoint { thread: current, method, pc });
        }
        if (stepping || op == BREAKPOINT) && !self.threads.is_runnable(current) {
            self.threads[current].at_breakpoint = true;
            self.timeslice = 0;
            return Ok(None);
        }
        self.displaced(op).map(Some)
    }

    fn displaced(&self, op: u8) -> VmResult<u8> {
        if op != BREAKPOINT {
            return Ok(op);
        }
        self.debugger
            .as_ref()
            .and_then(|d| d.displaced(self.regs.method, self.regs.ppc))
            .ok_or_else(|| {
                VmError::internal(format!(
                    "no breakpoint recorded at {}:{}",
                    self.classes.describe(self.regs.method),
                    self.regs.ppc
                ))
            })
    }

    // ── helpers shared by several opcodes ──────────────────────────

    fn null_pointer(&mut self) -> VmError {
        self.throw_new("java/lang/NullPointerException", None)
    }

    /// Pops an array reference and an index below it, checking both.
    fn array_operands(&mut self) -> VmResult<(Ref, usize)> {
        let index = self.pop_int();
        let array = self.pop_ref();
        if array.is_null() {
            return Err(self.null_pointer());
        }
        if index < 0 || index as usize >= self.array_length(array) {
            return Err(self.throw_new(
                "java/lang/ArrayIndexOutOfBoundsException",
                Some(&index.to_string()),
            ));
        }
        Ok((array, index as usize))
    }

    fn array_load_op(&mut self, wide: bool) -> VmResult<()> {
        let (array, index) = self.array_operands()?;
        let elem = self.array_elem(array);
        let value = self.array_load(array, elem, index);
        if wide {
            self.push_wide(value);
        } else {
            self.push(value);
        }
        self.regs.pc += 1;
        Ok(())
    }

    fn array_store_op(&mut self, wide: bool) -> VmResult<()> {
        let value = if wide { self.pop_wide() } else { self.pop() };
        let (array, index) = self.array_operands()?;
        let elem = self.array_elem(array);
        if elem == ElemType::Reference && !value.reference().is_null() {
            let component = match self.classes[self.class_of(array)].kind {
                ClassKind::Array { component: Some(c), .. } => c,
                _ => self.known.object,
            };
            let actual = self.class_of(value.reference());
            if !self.is_assignable(actual, component) {
                let name = self.classes[actual].java_name();
                return Err(self.throw_new("java/lang/ArrayStoreException", Some(&name)));
            }
        }
        self.array_store(array, elem, index, value);
        self.regs.pc += 1;
        Ok(())
    }

    fn negative_size(&mut self, count: i32) -> VmError {
        self.throw_new("java/lang/NegativeArraySizeException", Some(&count.to_string()))
    }

    /// Allocates a (possibly nested) array of `class` with `counts[0]`
    /// elements, each an array of `counts[1]` elements and so on.
    fn new_multi_array(&mut self, class: ClassId, counts: &[i32]) -> VmResult<Ref> {
        let length = counts[0] as usize;
        let array = self.new_array(class, length)?;
        let component = match self.classes[class].kind {
            ClassKind::Array { component: Some(c), .. } if counts.len() > 1 => c,
            _ => return Ok(array),
        };
        self.scoped(|vm| {
            vm.root(array)?;
            for i in 0..length {
                let inner = vm.new_multi_array(component, &counts[1..])?;
                vm.array_store_ref(array, i, inner);
            }
            Ok(array)
        })
    }

    /// Value of an `ldc`-family constant, resolving strings and classes.
    fn load_constant(&mut self, index: u16) -> VmResult<Cell> {
        let class = self.current_class();
        let text = match self.classes[class].constants.get(index as usize) {
            Some(Constant::Int(v)) => return Ok(Cell::from_int(*v)),
            Some(Constant::Float(v)) => return Ok(Cell::from_float(*v)),
            Some(Constant::Long(v)) => return Ok(Cell::from_long(*v)),
            Some(Constant::Double(v)) => return Ok(Cell::from_double(*v)),
            Some(Constant::String { resolved, .. }) if !resolved.is_null() => {
                return Ok(Cell::from_ref(*resolved));
            }
            Some(Constant::String { text, .. }) => Some(text.clone()),
            Some(Constant::Class { .. }) => None,
            _ => return Err(VmError::internal(format!("constant #{index} is not loadable"))),
        };
        match text {
            Some(text) => {
                let string = self.intern(&text)?;
                if let Some(Constant::String { resolved, .. }) =
                    self.classes[class].constants.get_mut(index as usize)
                {
                    *resolved = string;
                }
                Ok(Cell::from_ref(string))
            }
            None => {
                let target = self.resolve_class(class, index)?;
                Ok(Cell::from_ref(self.mirror_of(target)?))
            }
        }
    }

    fn ldc(&mut self, index: u16, length: u32, fast: u8, wide: bool) -> VmResult<()> {
        let value = self.load_constant(index)?;
        if wide {
            self.push_wide(value);
        } else {
            self.push(value);
        }
        self.rewrite(fast);
        self.regs.pc += length;
        Ok(())
    }

    fn static_address(&self, target: &FieldTarget) -> (Ref, usize) {
        (self.classes[target.class].data, DATA_STATICS + target.slot as usize)
    }

    fn get_static(&mut self, target: FieldTarget) {
        let (data, offset) = self.static_address(&target);
        let value = self.heap.field(data, offset);
        if target.kind.cells() == 2 {
            self.push_wide(value);
        } else {
            self.push(value);
        }
        self.regs.pc += 3;
    }

    fn put_static(&mut self, target: FieldTarget) {
        let value = if target.kind.cells() == 2 { self.pop_wide() } else { self.pop() };
        let (data, offset) = self.static_address(&target);
        self.heap.set_field(data, offset, value);
        self.regs.pc += 3;
    }

    fn get_field(&mut self, target: FieldTarget) -> VmResult<()> {
        let object = self.pop_ref();
        if object.is_null() {
            return Err(self.null_pointer());
        }
        let value = self.field_cell(object, target.slot);
        if target.kind.cells() == 2 {
            self.push_wide(value);
        } else {
            self.push(value);
        }
        self.regs.pc += 3;
        Ok(())
    }

    fn put_field(&mut self, target: FieldTarget) -> VmResult<()> {
        let value = if target.kind.cells() == 2 { self.pop_wide() } else { self.pop() };
        let object = self.pop_ref();
        if object.is_null() {
            return Err(self.null_pointer());
        }
        self.set_field_cell(object, target.slot, value);
        self.regs.pc += 3;
        Ok(())
    }

    /// Field target of a get/put instruction, checked for staticness and,
    /// for stores, for writes to final fields from outside their class.
    fn field_operand(&mut self, want_static: bool, store: bool) -> VmResult<FieldTarget> {
        let class = self.current_class();
        let target = self.resolve_field(class, self.u2(1))?;
        if target.is_static != want_static {
            let message = format!(
                "Expected {} field in {}",
                if want_static { "static" } else { "non-static" },
                self.classes[target.class].java_name()
            );
            return Err(self.throw_new("java/lang/IncompatibleClassChangeError", Some(&message)));
        }
        if store && target.is_final && self.settings.binary_compat_checks && target.class != class {
            let message = format!(
                "final field of {} written from {}",
                self.classes[target.class].java_name(),
                self.classes[class].java_name()
            );
            return Err(self.throw_new("java/lang/IllegalAccessError", Some(&message)));
        }
        Ok(target)
    }

    /// Virtual method for `resolved` on `receiver`'s class, through the
    /// call site's one-entry cache.
    fn virtual_target(&mut self, index: u16, resolved: MethodId, receiver: ClassId) -> VmResult<MethodId> {
        let class = self.current_class();
        if let Some(Constant::Method {
            cache: Some((seen, target)),
            ..
        }) = self.classes[class].constants.get(index as usize)
        {
            if *seen == receiver {
                return Ok(*target);
            }
        }
        let target = self.select_method(resolved, receiver)?;
        if let Some(Constant::Method { cache, .. }) = self.classes[class].constants.get_mut(index as usize) {
            *cache = Some((receiver, target));
        }
        Ok(target)
    }

    fn special_target(&self, index: u16) -> Option<MethodId> {
        match self.classes[self.current_class()].constants.get(index as usize) {
            Some(Constant::Method { special, .. }) => *special,
            _ => None,
        }
    }

    fn not_static(&mut self, method: MethodId, expected: bool) -> VmError {
        let message = format!(
            "Expected {} method {}",
            if expected { "static" } else { "non-static" },
            self.classes.describe(method)
        );
        self.throw_new("java/lang/IncompatibleClassChangeError", Some(&message))
    }

    fn is_object_init(&self, method: MethodId) -> bool {
        method.class == self.known.object && self.classes.method(method).name == "<init>"
    }

    /// `invokespecial` once its target is known.
    fn call_special(&mut self, target: MethodId) -> VmResult<()> {
        let arg_cells = self.classes.method(target).arg_cells as usize;
        if self.peek(arg_cells - 1).reference().is_null() {
            return Err(self.null_pointer());
        }
        if self.is_object_init(target) {
            self.regs.sp -= 1;
            self.regs.pc += 3;
            return Ok(());
        }
        let next = self.regs.ppc + 3;
        self.invoke(target, next)
    }

    fn invoke_virtual(&mut self, interface: bool) -> VmResult<()> {
        let class = self.current_class();
        let index = self.u2(1);
        let resolved = self.resolve_method(class, index)?;
        let m = self.classes.method(resolved);
        if m.is_static() {
            return Err(self.not_static(resolved, false));
        }
        let receiver = self.peek(m.arg_cells as usize - 1).reference();
        if receiver.is_null() {
            return Err(self.null_pointer());
        }
        let receiver_class = self.class_of(receiver);
        if interface && !self.is_assignable(receiver_class, resolved.class) {
            let message = format!(
                "Class {} does not implement the requested interface {}",
                self.classes[receiver_class].java_name(),
                self.classes[resolved.class].java_name()
            );
            return Err(self.throw_new("java/lang/IncompatibleClassChangeError", Some(&message)));
        }
        let target = self.virtual_target(index, resolved, receiver_class)?;
        let next = self.regs.ppc + if interface { 5 } else { 3 };
        self.invoke(target, next)
    }

    fn local_index(&self, wide: bool) -> usize {
        if wide { self.u2(2) as usize } else { self.u1(1) as usize }
    }

    // ── dispatch ───────────────────────────────────────────────────

    /// Executes the instruction at `regs.pc`.
    pub(crate) fn step(&mut self) -> VmResult<()> {
        self.regs.ppc = self.regs.pc;
        let Some(&op) = self.code().get(self.regs.pc as usize) else {
            return Err(VmError::internal(format!(
                "pc {} outside the code of {}",
                self.regs.pc,
                self.classes.describe(self.regs.method)
            )));
        };
        let op = if self.debugger.is_some() {
            match self.debug_check(op)? {
                Some(op) => op,
                None => return Ok(()),
            }
        } else {
            op
        };
        if log::log_enabled!(log::Level::Trace) {
            trace!("{}:{} {}", self.classes.describe(self.regs.method), self.regs.ppc, opcodes::name(op));
        }
        self.dispatch(op)
    }

    fn dispatch(&mut self, op: u8) -> VmResult<()> {
        match op {
            NOP => self.regs.pc += 1,
            ACONST_NULL => {
                self.push_ref(Ref::NULL);
                self.regs.pc += 1;
            }
            ICONST_M1..=ICONST_5 => {
                self.push_int(op as i32 - ICONST_0 as i32);
                self.regs.pc += 1;
            }
            LCONST_0 | LCONST_1 => {
                self.push_long((op - LCONST_0) as i64);
                self.regs.pc += 1;
            }
            FCONST_0..=FCONST_2 => {
                self.push_float((op - FCONST_0) as f32);
                self.regs.pc += 1;
            }
            DCONST_0 | DCONST_1 => {
                self.push_double((op - DCONST_0) as f64);
                self.regs.pc += 1;
            }
            BIPUSH => {
                let value = self.u1(1) as i8 as i32;
                self.push_int(value);
                self.regs.pc += 2;
            }
            SIPUSH => {
                let value = self.i2(1) as i32;
                self.push_int(value);
                self.regs.pc += 3;
            }
            LDC | LDC_FAST => {
                let index = self.u1(1) as u16;
                self.ldc(index, 2, LDC_FAST, false)?;
            }
            LDC_W | LDC_W_FAST => {
                let index = self.u2(1);
                self.ldc(index, 3, LDC_W_FAST, false)?;
            }
            LDC2_W | LDC2_W_FAST => {
                let index = self.u2(1);
                self.ldc(index, 3, LDC2_W_FAST, true)?;
            }

            // ── locals ─────────────────────────────────────────────
            ILOAD | FLOAD | ALOAD => {
                let value = self.local(self.local_index(false));
                self.push(value);
                self.regs.pc += 2;
            }
            LLOAD | DLOAD => {
                let value = self.local(self.local_index(false));
                self.push_wide(value);
                self.regs.pc += 2;
            }
            ILOAD_0..=ILOAD_3 | FLOAD_0..=FLOAD_3 | ALOAD_0..=ALOAD_3 => {
                let index = ((op - ILOAD_0) % 4) as usize;
                let value = self.local(index);
                self.push(value);
                self.regs.pc += 1;
            }
            LLOAD_0..=LLOAD_3 | DLOAD_0..=DLOAD_3 => {
                let index = ((op - ILOAD_0) % 4) as usize;
                let value = self.local(index);
                self.push_wide(value);
                self.regs.pc += 1;
            }
            ISTORE | FSTORE | ASTORE => {
                let value = self.pop();
                self.set_local(self.local_index(false), value);
                self.regs.pc += 2;
            }
            LSTORE | DSTORE => {
                let value = self.pop_wide();
                let index = self.local_index(false);
                self.set_local(index, value);
                self.set_local(index + 1, Cell::ZERO);
                self.regs.pc += 2;
            }
            ISTORE_0..=ISTORE_3 | FSTORE_0..=FSTORE_3 | ASTORE_0..=ASTORE_3 => {
                let value = self.pop();
                self.set_local(((op - ISTORE_0) % 4) as usize, value);
                self.regs.pc += 1;
            }
            LSTORE_0..=LSTORE_3 | DSTORE_0..=DSTORE_3 => {
                let value = self.pop_wide();
                let index = ((op - ISTORE_0) % 4) as usize;
                self.set_local(index, value);
                self.set_local(index + 1, Cell::ZERO);
                self.regs.pc += 1;
            }
            IINC => {
                let index = self.local_index(false);
                let delta = self.u1(2) as i8 as i32;
                let value = self.local(index).int().wrapping_add(delta);
                self.set_local(index, Cell::from_int(value));
                self.regs.pc += 3;
            }
            WIDE => {
                let inner = self.u1(1);
                let index = self.local_index(true);
                match inner {
                    ILOAD | FLOAD | ALOAD => {
                        let value = self.local(index);
                        self.push(value);
                    }
                    LLOAD | DLOAD => {
                        let value = self.local(index);
                        self.push_wide(value);
                    }
                    ISTORE | FSTORE | ASTORE => {
                        let value = self.pop();
                        self.set_local(index, value);
                    }
                    LSTORE | DSTORE => {
                        let value = self.pop_wide();
                        self.set_local(index, value);
                        self.set_local(index + 1, Cell::ZERO);
                    }
                    IINC => {
                        let delta = self.i2(4) as i32;
                        let value = self.local(index).int().wrapping_add(delta);
                        self.set_local(index, Cell::from_int(value));
                        self.regs.pc += 6;
                        return Ok(());
                    }
                    RET => {
                        self.regs.pc = self.local(index).int() as u32;
                        return Ok(());
                    }
                    other => {
                        return Err(VmError::internal(format!(
                            "wide applied to {}",
                            opcodes::name(other)
                        )));
                    }
                }
                self.regs.pc += 4;
            }

            // ── arrays ─────────────────────────────────────────────
            IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => self.array_load_op(false)?,
            LALOAD | DALOAD => self.array_load_op(true)?,
            IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => self.array_store_op(false)?,
            LASTORE | DASTORE => self.array_store_op(true)?,
            ARRAYLENGTH => {
                let array = self.pop_ref();
                if array.is_null() {
                    return Err(self.null_pointer());
                }
                let length = self.array_length(array) as i32;
                self.push_int(length);
                self.regs.pc += 1;
            }
            NEWARRAY => {
                let Some(elem) = ElemType::from_atype(self.u1(1)) else {
                    return Err(VmError::internal(format!("bad newarray type {}", self.u1(1))));
                };
                let class = self.primitive_array_class(elem)?;
                let count = self.pop_int();
                if count < 0 {
                    return Err(self.negative_size(count));
                }
                let array = self.new_array(class, count as usize)?;
                self.push_ref(array);
                self.regs.pc += 2;
            }
            ANEWARRAY => {
                let component = self.resolve_class(self.current_class(), self.u2(1))?;
                let class = self.array_class_of(component)?;
                let count = self.pop_int();
                if count < 0 {
                    return Err(self.negative_size(count));
                }
                let array = self.new_ref_array(class, count as usize)?;
                self.push_ref(array);
                self.regs.pc += 3;
            }
            MULTIANEWARRAY => {
                let class = self.resolve_class(self.current_class(), self.u2(1))?;
                let dims = self.u1(3) as usize;
                let counts: Vec<i32> = (0..dims).map(|i| self.peek(dims - 1 - i).int()).collect();
                if let Some(&count) = counts.iter().find(|&&c| c < 0) {
                    return Err(self.negative_size(count));
                }
                // the counts stay on the stack until the arrays exist
                let array = self.new_multi_array(class, &counts)?;
                self.regs.sp -= dims;
                self.push_ref(array);
                self.regs.pc += 4;
            }

            // ── stack ──────────────────────────────────────────────
            POP => {
                self.pop();
                self.regs.pc += 1;
            }
            POP2 => {
                self.regs.sp -= 2;
                self.regs.pc += 1;
            }
            DUP => {
                let v = self.peek(0);
                self.push(v);
                self.regs.pc += 1;
            }
            DUP_X1 => {
                let (v1, v2) = (self.pop(), self.pop());
                self.push(v1);
                self.push(v2);
                self.push(v1);
                self.regs.pc += 1;
            }
            DUP_X2 => {
                let (v1, v2, v3) = (self.pop(), self.pop(), self.pop());
                self.push(v1);
                self.push(v3);
                self.push(v2);
                self.push(v1);
                self.regs.pc += 1;
            }
            DUP2 => {
                let (v1, v2) = (self.peek(0), self.peek(1));
                self.push(v2);
                self.push(v1);
                self.regs.pc += 1;
            }
            DUP2_X1 => {
                let (v1, v2, v3) = (self.pop(), self.pop(), self.pop());
                self.push(v2);
                self.push(v1);
                self.push(v3);
                self.push(v2);
                self.push(v1);
                self.regs.pc += 1;
            }
            DUP2_X2 => {
                let (v1, v2, v3, v4) = (self.pop(), self.pop(), self.pop(), self.pop());
                self.push(v2);
                self.push(v1);
                self.push(v4);
                self.push(v3);
                self.push(v2);
                self.push(v1);
                self.regs.pc += 1;
            }
            SWAP => {
                let (v1, v2) = (self.pop(), self.pop());
                self.push(v1);
                self.push(v2);
                self.regs.pc += 1;
            }

            // ── arithmetic ─────────────────────────────────────────
            IADD => binary!(self, pop_int, push_int, |a, b| a.wrapping_add(b)),
            LADD => binary!(self, pop_long, push_long, |a, b| a.wrapping_add(b)),
            FADD => binary!(self, pop_float, push_float, |a, b| a + b),
            DADD => binary!(self, pop_double, push_double, |a, b| a + b),
            ISUB => binary!(self, pop_int, push_int, |a, b| a.wrapping_sub(b)),
            LSUB => binary!(self, pop_long, push_long, |a, b| a.wrapping_sub(b)),
            FSUB => binary!(self, pop_float, push_float, |a, b| a - b),
            DSUB => binary!(self, pop_double, push_double, |a, b| a - b),
            IMUL => binary!(self, pop_int, push_int, |a, b| a.wrapping_mul(b)),
            LMUL => binary!(self, pop_long, push_long, |a, b| a.wrapping_mul(b)),
            FMUL => binary!(self, pop_float, push_float, |a, b| a * b),
            DMUL => binary!(self, pop_double, push_double, |a, b| a * b),
            FDIV => binary!(self, pop_float, push_float, |a, b| a / b),
            DDIV => binary!(self, pop_double, push_double, |a, b| a / b),
            FREM => binary!(self, pop_float, push_float, |a, b| a % b),
            DREM => binary!(self, pop_double, push_double, |a, b| a % b),
            IDIV | IREM => {
                let (b, a) = (self.pop_int(), self.pop_int());
                if b == 0 {
                    return Err(self.throw_new("java/lang/ArithmeticException", Some("/ by zero")));
                }
                self.push_int(if op == IDIV { a.wrapping_div(b) } else { a.wrapping_rem(b) });
                self.regs.pc += 1;
            }
            LDIV | LREM => {
                let (b, a) = (self.pop_long(), self.pop_long());
                if b == 0 {
                    return Err(self.throw_new("java/lang/ArithmeticException", Some("/ by zero")));
                }
                self.push_long(if op == LDIV { a.wrapping_div(b) } else { a.wrapping_rem(b) });
                self.regs.pc += 1;
            }
            INEG => unary!(self, pop_int, push_int, |a| a.wrapping_neg()),
            LNEG => unary!(self, pop_long, push_long, |a| a.wrapping_neg()),
            FNEG => unary!(self, pop_float, push_float, |a| -a),
            DNEG => unary!(self, pop_double, push_double, |a| -a),
            ISHL => binary!(self, pop_int, push_int, |a, b| a.wrapping_shl(b as u32 & 0x1f)),
            ISHR => binary!(self, pop_int, push_int, |a, b| a >> (b & 0x1f)),
            IUSHR => binary!(self, pop_int, push_int, |a, b| ((a as u32) >> (b & 0x1f)) as i32),
            LSHL | LSHR | LUSHR => {
                let shift = (self.pop_int() & 0x3f) as u32;
                let a = self.pop_long();
                self.push_long(match op {
                    LSHL => a.wrapping_shl(shift),
                    LSHR => a >> shift,
                    _ => ((a as u64) >> shift) as i64,
                });
                self.regs.pc += 1;
            }
            IAND => binary!(self, pop_int, push_int, |a, b| a & b),
            LAND => binary!(self, pop_long, push_long, |a, b| a & b),
            IOR => binary!(self, pop_int, push_int, |a, b| a | b),
            LOR => binary!(self, pop_long, push_long, |a, b| a | b),
            IXOR => binary!(self, pop_int, push_int, |a, b| a ^ b),
            LXOR => binary!(self, pop_long, push_long, |a, b| a ^ b),

            // ── conversions ────────────────────────────────────────
            I2L => unary!(self, pop_int, push_long, |a| a as i64),
            I2F => unary!(self, pop_int, push_float, |a| a as f32),
            I2D => unary!(self, pop_int, push_double, |a| a as f64),
            L2I => unary!(self, pop_long, push_int, |a| a as i32),
            L2F => unary!(self, pop_long, push_float, |a| a as f32),
            L2D => unary!(self, pop_long, push_double, |a| a as f64),
            // `as` saturates and maps NaN to zero, as the JVM requires
            F2I => unary!(self, pop_float, push_int, |a| a as i32),
            F2L => unary!(self, pop_float, push_long, |a| a as i64),
            F2D => unary!(self, pop_float, push_double, |a| a as f64),
            D2I => unary!(self, pop_double, push_int, |a| a as i32),
            D2L => unary!(self, pop_double, push_long, |a| a as i64),
            D2F => unary!(self, pop_double, push_float, |a| a as f32),
            I2B => unary!(self, pop_int, push_int, |a| a as i8 as i32),
            I2C => unary!(self, pop_int, push_int, |a| a as u16 as i32),
            I2S => unary!(self, pop_int, push_int, |a| a as i16 as i32),

            // ── comparisons and branches ───────────────────────────
            LCMP => binary!(self, pop_long, push_int, |a, b| a.cmp(&b) as i32),
            FCMPL => binary!(self, pop_float, push_int, |a, b| compare(a as f64, b as f64, -1)),
            FCMPG => binary!(self, pop_float, push_int, |a, b| compare(a as f64, b as f64, 1)),
            DCMPL => binary!(self, pop_double, push_int, |a, b| compare(a, b, -1)),
            DCMPG => binary!(self, pop_double, push_int, |a, b| compare(a, b, 1)),
            IFEQ..=IFLE => {
                let v = self.pop_int();
                let taken = match op {
                    IFEQ => v == 0,
                    IFNE => v != 0,
                    IFLT => v < 0,
                    IFGE => v >= 0,
                    IFGT => v > 0,
                    _ => v <= 0,
                };
                self.branch_if(taken);
            }
            IF_ICMPEQ..=IF_ICMPLE => {
                let (b, a) = (self.pop_int(), self.pop_int());
                let taken = match op {
                    IF_ICMPEQ => a == b,
                    IF_ICMPNE => a != b,
                    IF_ICMPLT => a < b,
                    IF_ICMPGE => a >= b,
                    IF_ICMPGT => a > b,
                    _ => a <= b,
                };
                self.branch_if(taken);
            }
            IF_ACMPEQ | IF_ACMPNE => {
                let (b, a) = (self.pop_ref(), self.pop_ref());
                self.branch_if((a == b) == (op == IF_ACMPEQ));
            }
            IFNULL | IFNONNULL => {
                let v = self.pop_ref();
                self.branch_if(v.is_null() == (op == IFNULL));
            }
            GOTO => {
                let offset = self.i2(1) as i32;
                self.jump(offset);
            }
            GOTO_W => {
                let offset = self.i4_at(self.regs.ppc as usize + 1);
                self.jump(offset);
            }
            JSR => {
                self.push_int(self.regs.ppc as i32 + 3);
                let offset = self.i2(1) as i32;
                self.jump(offset);
            }
            JSR_W => {
                self.push_int(self.regs.ppc as i32 + 5);
                let offset = self.i4_at(self.regs.ppc as usize + 1);
                self.jump(offset);
            }
            RET => {
                self.regs.pc = self.local(self.local_index(false)).int() as u32;
            }
            TABLESWITCH => {
                let at = switch_operands(self.regs.ppc);
                let key = self.pop_int();
                let (default, low, high) = (self.i4_at(at), self.i4_at(at + 4), self.i4_at(at + 8));
                let offset = if key < low || key > high {
                    default
                } else {
                    self.i4_at(at + 12 + 4 * (key as i64 - low as i64) as usize)
                };
                self.jump(offset);
            }
            LOOKUPSWITCH => {
                let at = switch_operands(self.regs.ppc);
                let key = self.pop_int();
                let default = self.i4_at(at);
                let pairs = self.i4_at(at + 4).max(0) as usize;
                let (mut lo, mut hi) = (0, pairs);
                let mut offset = default;
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let pair = at + 8 + mid * 8;
                    let candidate = self.i4_at(pair);
                    if candidate == key {
                        offset = self.i4_at(pair + 4);
                        break;
                    } else if candidate < key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                self.jump(offset);
            }

            // ── returns ────────────────────────────────────────────
            IRETURN | FRETURN | ARETURN => self.return_value(1)?,
            LRETURN | DRETURN => self.return_value(2)?,
            RETURN => self.return_value(0)?,

            // ── fields ─────────────────────────────────────────────
            GETSTATIC | PUTSTATIC => {
                let target = self.field_operand(true, op == PUTSTATIC)?;
                match self.ensure_initialized(target.class)? {
                    InitStatus::Ready => {}
                    InitStatus::Pushed | InitStatus::Blocked => return Ok(()),
                }
                if op == GETSTATIC {
                    self.get_static(target);
                } else {
                    self.put_static(target);
                }
                if self.classes[target.class].state == ClassState::Initialized {
                    self.rewrite(if op == GETSTATIC { GETSTATIC_FAST } else { PUTSTATIC_FAST });
                }
            }
            GETSTATIC_FAST => {
                let target = self.resolve_field(self.current_class(), self.u2(1))?;
                self.get_static(target);
            }
            PUTSTATIC_FAST => {
                let target = self.resolve_field(self.current_class(), self.u2(1))?;
                self.put_static(target);
            }
            GETFIELD => {
                let target = self.field_operand(false, false)?;
                self.get_field(target)?;
                self.rewrite(GETFIELD_FAST);
            }
            PUTFIELD => {
                let target = self.field_operand(false, true)?;
                self.put_field(target)?;
                self.rewrite(PUTFIELD_FAST);
            }
            GETFIELD_FAST => {
                let target = self.resolve_field(self.current_class(), self.u2(1))?;
                self.get_field(target)?;
            }
            PUTFIELD_FAST => {
                let target = self.resolve_field(self.current_class(), self.u2(1))?;
                self.put_field(target)?;
            }

            // ── objects ────────────────────────────────────────────
            NEW => {
                let class = self.resolve_class(self.current_class(), self.u2(1))?;
                let c = &self.classes[class];
                if c.is_interface() || c.access.contains(crate::classfile::ClassAccess::ABSTRACT) {
                    let name = c.java_name();
                    return Err(self.throw_new("java/lang/InstantiationError", Some(&name)));
                }
                match self.ensure_initialized(class)? {
                    InitStatus::Ready => {}
                    InitStatus::Pushed | InitStatus::Blocked => return Ok(()),
                }
                let object = self.new_object(class)?;
                self.push_ref(object);
                if self.classes[class].state == ClassState::Initialized {
                    self.rewrite(NEW_FAST);
                }
                self.regs.pc += 3;
            }
            NEW_FAST => {
                let class = self.resolve_class(self.current_class(), self.u2(1))?;
                let object = self.new_object(class)?;
                self.push_ref(object);
                self.regs.pc += 3;
            }
            CHECKCAST => {
                let target = self.resolve_class(self.current_class(), self.u2(1))?;
                let object = self.peek(0).reference();
                if !object.is_null() {
                    let actual = self.class_of(object);
                    if !self.is_assignable(actual, target) {
                        let message = format!(
                            "{} cannot be cast to {}",
                            self.classes[actual].java_name(),
                            self.classes[target].java_name()
                        );
                        return Err(self.throw_new("java/lang/ClassCastException", Some(&message)));
                    }
                }
                self.regs.pc += 3;
            }
            INSTANCEOF => {
                let target = self.resolve_class(self.current_class(), self.u2(1))?;
                let object = self.pop_ref();
                let result = !object.is_null() && self.instance_of(object, target);
                self.push_int(result as i32);
                self.regs.pc += 3;
            }
            ATHROW => {
                let throwable = self.pop_ref();
                if throwable.is_null() {
                    return Err(self.null_pointer());
                }
                return Err(VmError::Throw(throwable));
            }
            MONITORENTER => {
                let object = self.peek(0).reference();
                if object.is_null() {
                    return Err(self.null_pointer());
                }
                self.pop();
                self.regs.pc += 1;
                // a blocked thread owns the monitor by the time it runs again
                self.monitor_enter(object, self.current);
            }
            MONITOREXIT => {
                let object = self.pop_ref();
                if object.is_null() {
                    return Err(self.null_pointer());
                }
                self.monitor_exit(object)?;
                self.regs.pc += 1;
            }

            // ── invocation ─────────────────────────────────────────
            INVOKEVIRTUAL => self.invoke_virtual(false)?,
            INVOKEINTERFACE => self.invoke_virtual(true)?,
            INVOKESPECIAL => {
                let class = self.current_class();
                let index = self.u2(1);
                let resolved = self.resolve_method(class, index)?;
                if self.classes.method(resolved).is_static() {
                    return Err(self.not_static(resolved, false));
                }
                let target = self.select_special(class, resolved);
                if let Some(Constant::Method { special, .. }) =
                    self.classes[class].constants.get_mut(index as usize)
                {
                    *special = Some(target);
                }
                // patch before the call pushes the callee's frame
                self.rewrite(INVOKESPECIAL_FAST);
                self.call_special(target)?;
            }
            INVOKESPECIAL_FAST => {
                let index = self.u2(1);
                let target = match self.special_target(index) {
                    Some(target) => target,
                    None => self.resolve_method(self.current_class(), index)?,
                };
                self.call_special(target)?;
            }
            INVOKESTATIC => {
                let method = self.resolve_method(self.current_class(), self.u2(1))?;
                if !self.classes.method(method).is_static() {
                    return Err(self.not_static(method, true));
                }
                match self.ensure_initialized(method.class)? {
                    InitStatus::Ready => {}
                    InitStatus::Pushed | InitStatus::Blocked => return Ok(()),
                }
                if self.classes[method.class].state == ClassState::Initialized {
                    self.rewrite(INVOKESTATIC_FAST);
                }
                let next = self.regs.ppc + 3;
                self.invoke(method, next)?;
            }
            INVOKESTATIC_FAST => {
                let method = self.resolve_method(self.current_class(), self.u2(1))?;
                let next = self.regs.ppc + 3;
                self.invoke(method, next)?;
            }

            BREAKPOINT => {
                return Err(VmError::internal(format!(
                    "breakpoint opcode without a debugger at {}:{}",
                    self.classes.describe(self.regs.method),
                    self.regs.ppc
                )));
            }
            other => {
                return Err(VmError::internal(format!(
                    "illegal opcode 0x{other:02x} at {}:{}",
                    self.classes.describe(self.regs.method),
                    self.regs.ppc
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::classfile::{FieldAccess, MethodAccess};
    use crate::debug::tests::Recorder;
    use crate::error::ExitCode;
    use crate::testkit::{self, MAIN};

    const PRINT: &str = "(I)V";

    #[test]
    fn nan_comparisons_depend_on_the_variant() {
        assert_eq!(compare(f64::NAN, 1.0, -1), -1);
        assert_eq!(compare(1.0, f64::NAN, 1), 1);
        assert_eq!(compare(2.0, 1.0, -1), 1);
        assert_eq!(compare(1.0, 1.0, 1), 0);
    }

    #[test]
    fn switch_operands_are_aligned_from_the_method_start() {
        assert_eq!(switch_operands(0), 4);
        assert_eq!(switch_operands(3), 4);
        assert_eq!(switch_operands(4), 8);
    }

    #[test]
    fn integer_arithmetic_wraps_and_checks_zero_divisors() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Arith", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.iconst(i32::MIN).iconst(-1).op(IDIV).invokestatic("t/Out", "print", PRINT);
            c.iconst(i32::MAX).iconst(1).op(IADD).invokestatic("t/Out", "print", PRINT);
            c.iconst(-7).iconst(2).op(IREM).invokestatic("t/Out", "print", PRINT);
            c.iconst(1).iconst(33).op(ISHL).invokestatic("t/Out", "print", PRINT);
            c.iconst(-1).iconst(28).op(IUSHR).invokestatic("t/Out", "print", PRINT);
            c.iconst(300).op(I2B).invokestatic("t/Out", "print", PRINT);
            c.ldc_float(f32::NAN).op(F2I).invokestatic("t/Out", "print", PRINT);
            c.ldc_double(1e20).op(D2I).invokestatic("t/Out", "print", PRINT);
            c.bind(start);
            c.iconst(1).iconst(0).op(IDIV).invokestatic("t/Out", "print", PRINT);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.op(POP).iconst(-99).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ArithmeticException"));
        });
        assert_eq!(vm.run_main("t/Arith", &[]), ExitCode::Success);
        assert_eq!(
            testkit::output(&out),
            "-2147483648\n-2147483648\n-1\n2\n15\n44\n0\n2147483647\n-99\n"
        );
    }

    #[test]
    fn long_arithmetic_uses_two_slots() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Longs", |c| {
            c.ldc_long(1 << 40).lstore(1);
            c.lload(1).lload(1).op(LADD).invokestatic("t/Out", "print", "(J)V");
            c.lload(1).iconst(65).op(LSHR).invokestatic("t/Out", "print", "(J)V");
            c.lload(1).ldc_long(3).op(LCMP).invokestatic("t/Out", "print", PRINT);
            c.iconst(-5).op(I2L).op(DUP2).op(LMUL).invokestatic("t/Out", "print", "(J)V");
            c.op(RETURN);
            c.max_locals(3);
        });
        assert_eq!(vm.run_main("t/Longs", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "2199023255552\n549755813888\n1\n25\n");
    }

    #[test]
    fn switches_pick_their_targets() {
        let (mut vm, out) = testkit::vm();
        let mut b = ClassBuilder::new("t/Switch", Some("java/lang/Object"));
        b.method(MethodAccess::STATIC, "table", "(I)I", |c| {
            let (default, one, two) = (c.label(), c.label(), c.label());
            c.iload(0).tableswitch(1, default, &[one, two]);
            c.bind(one).iconst(10).op(IRETURN);
            c.bind(two).iconst(20).op(IRETURN);
            c.bind(default).iconst(-1).op(IRETURN);
        });
        b.method(MethodAccess::STATIC, "lookup", "(I)I", |c| {
            let (default, low, high) = (c.label(), c.label(), c.label());
            c.iload(0).lookupswitch(default, &[(-1000, low), (1000, high)]);
            c.bind(low).iconst(1).op(IRETURN);
            c.bind(high).iconst(2).op(IRETURN);
            c.bind(default).iconst(0).op(IRETURN);
        });
        b.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, |c| {
            for key in [1, 2, 3] {
                c.iconst(key).invokestatic("t/Switch", "table", "(I)I");
                c.invokestatic("t/Out", "print", PRINT);
            }
            for key in [-1000, 1000, 7] {
                c.iconst(key).invokestatic("t/Switch", "lookup", "(I)I");
                c.invokestatic("t/Out", "print", PRINT);
            }
            c.op(RETURN);
        });
        vm.define_class(&b.build(), Ref::NULL).unwrap();
        assert_eq!(vm.run_main("t/Switch", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "10\n20\n-1\n1\n2\n0\n");
    }

    #[test]
    fn out_of_bounds_indexes_are_reported() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Bounds", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.iconst(3).newarray(10).iconst(3).op(IALOAD).op(POP);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;");
            c.invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ArrayIndexOutOfBoundsException"));
        });
        assert_eq!(vm.run_main("t/Bounds", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "3\n");
    }

    #[test]
    fn stores_of_the_wrong_type_are_rejected() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Store", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.iconst(1).anewarray("java/lang/Thread");
            c.iconst(0).ldc_string("x").op(AASTORE);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.op(POP).iconst(3).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ArrayStoreException"));
        });
        assert_eq!(vm.run_main("t/Store", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "3\n");
    }

    #[test]
    fn negative_array_sizes_are_rejected() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Negative", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.iconst(-1).newarray(10).op(POP);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.op(POP).iconst(2).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/NegativeArraySizeException"));
        });
        assert_eq!(vm.run_main("t/Negative", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "2\n");
    }

    #[test]
    fn multianewarray_builds_every_level() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Multi", |c| {
            c.iconst(2).iconst(3).multianewarray("[[I", 2).astore(1);
            c.aload(1).op(ARRAYLENGTH).invokestatic("t/Out", "print", PRINT);
            c.aload(1).iconst(1).op(AALOAD).op(ARRAYLENGTH).invokestatic("t/Out", "print", PRINT);
            c.aload(1).iconst(1).op(AALOAD).iconst(2).iconst(9).op(IASTORE);
            c.aload(1).iconst(1).op(AALOAD).iconst(2).op(IALOAD).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
            c.max_locals(2);
        });
        assert_eq!(vm.run_main("t/Multi", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "2\n3\n9\n");
    }

    #[test]
    fn failed_casts_name_both_classes() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Cast", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.op(ACONST_NULL).checkcast("java/lang/Thread").op(POP);
            c.op(ACONST_NULL).instanceof("java/lang/Object").invokestatic("t/Out", "print", PRINT);
            c.bind(start);
            c.ldc_string("s").checkcast("java/lang/Thread").op(POP);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;");
            c.invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/ClassCastException"));
        });
        assert_eq!(vm.run_main("t/Cast", &[]), ExitCode::Success);
        assert_eq!(
            testkit::output(&out),
            "0\njava.lang.String cannot be cast to java.lang.Thread\n"
        );
    }

    fn counter_class(vm: &mut Vm) -> ClassId {
        let mut b = ClassBuilder::new("t/Counter", Some("java/lang/Object"));
        b.field(FieldAccess::STATIC, "count", "I");
        b.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, |c| {
            let top = c.here();
            c.getstatic("t/Counter", "count", "I").iconst(1).op(IADD);
            c.putstatic("t/Counter", "count", "I");
            c.getstatic("t/Counter", "count", "I").iconst(3);
            c.branch(IF_ICMPLT, top);
            c.getstatic("t/Counter", "count", "I").invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
        });
        vm.define_class(&b.build(), Ref::NULL).unwrap()
    }

    #[test]
    fn resolved_instructions_take_their_fast_form() {
        let (mut vm, out) = testkit::vm();
        let class = counter_class(&mut vm);
        assert_eq!(vm.run_main("t/Counter", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "3\n");
        let main = vm.find_method(class, "main", MAIN).unwrap();
        let code = &vm.classes.method(main).code().unwrap().bytes;
        assert_eq!(code[0], GETSTATIC_FAST);
        assert_eq!(code[5], PUTSTATIC_FAST);
    }

    #[test]
    fn debugging_keeps_the_original_opcodes() {
        let (mut vm, out) = testkit::vm();
        vm.attach_debugger(Box::new(Recorder::default()));
        let class = counter_class(&mut vm);
        assert_eq!(vm.run_main("t/Counter", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "3\n");
        let main = vm.find_method(class, "main", MAIN).unwrap();
        assert_eq!(vm.classes.method(main).code().unwrap().bytes[0], GETSTATIC);
    }

    #[test]
    fn breakpoints_report_and_run_the_displaced_instruction() {
        let (mut vm, out) = testkit::vm();
        let recorder = Recorder::default();
        vm.attach_debugger(Box::new(recorder.clone()));
        let class = testkit::main_class(&mut vm, "t/Break", |c| {
            c.iconst(4).iconst(5).op(IMUL).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
        });
        let main = vm.find_method(class, "main", MAIN).unwrap();
        assert!(vm.set_breakpoint(main, 2));
        assert_eq!(vm.run_main("t/Break", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "20\n");
        let hits = recorder
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, DebugEvent::Breakpoint { pc: 2, .. }))
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn single_stepping_reports_every_instruction() {
        let (mut vm, _out) = testkit::vm();
        let recorder = Recorder::default();
        vm.attach_debugger(Box::new(recorder.clone()));
        testkit::main_class(&mut vm, "t/Step", |c| {
            c.iconst(1).op(POP).op(RETURN);
        });
        let main = vm.current;
        vm.set_single_step(main, true);
        assert_eq!(vm.run_main("t/Step", &[]), ExitCode::Success);
        let steps: Vec<u32> = recorder
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DebugEvent::SingleStep { pc, .. } => Some(*pc),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn subroutines_return_through_a_local() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Jsr", |c| {
            let (sub, done) = (c.label(), c.label());
            c.jsr_w(sub);
            c.iconst(2).invokestatic("t/Out", "print", PRINT);
            c.goto(done);
            c.bind(sub);
            c.astore(1);
            c.iconst(1).invokestatic("t/Out", "print", PRINT);
            c.op(RET).op(1);
            c.bind(done);
            c.op(RETURN);
            c.max_locals(2);
        });
        assert_eq!(vm.run_main("t/Jsr", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "1\n2\n");
    }

    #[test]
    fn null_receivers_throw_null_pointer_exceptions() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "t/Null", |c| {
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.op(ACONST_NULL).invokevirtual("java/lang/Object", "hashCode", "()I").op(POP);
            c.bind(end);
            c.op(RETURN);
            c.bind(handler);
            c.op(POP).iconst(5).invokestatic("t/Out", "print", PRINT);
            c.op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/NullPointerException"));
        });
        assert_eq!(vm.run_main("t/Null", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "5\n");
    }

    #[test]
    fn constructors_survive_repeated_instantiation() {
        let (mut vm, out) = testkit::vm();
        let mut point = ClassBuilder::new("p/Point", Some("java/lang/Object"));
        point.default_constructor();
        let point = vm.define_class(&point.build(), Ref::NULL).unwrap();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.construct("p/Point").op(POP);
            c.construct("p/Point").op(POP);
            c.construct("p/Point").instanceof("p/Point");
            c.invokestatic("t/Out", "print", PRINT).op(RETURN);
        });
        assert_eq!(vm.run_main("p/Main", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "1\n");
        let init = vm.find_method(point, "<init>", "()V").unwrap();
        let code = vm.classes.method(init).code().unwrap();
        assert_eq!(code.bytes[0], ALOAD_0);
    }

    #[test]
    fn super_calls_and_virtual_calls_share_a_constant_without_interfering() {
        let (mut vm, out) = testkit::vm();
        let mut base = ClassBuilder::new("p/Base", Some("java/lang/Object"));
        base.default_constructor()
            .method(MethodAccess::PUBLIC, "m", "()V", |c| {
                c.iconst(1).invokestatic("t/Out", "print", PRINT).op(RETURN);
            });
        vm.define_class(&base.build(), Ref::NULL).unwrap();

        let mut sub = ClassBuilder::new("p/Sub", Some("p/Base"));
        sub.default_constructor()
            .method(MethodAccess::PUBLIC, "m", "()V", |c| {
                c.aload(0).invokespecial("p/Base", "m", "()V");
                c.iconst(2).invokestatic("t/Out", "print", PRINT).op(RETURN);
            })
            .method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, |c| {
                c.construct("p/Sub").astore(1);
                c.aload(1).invokevirtual("p/Base", "m", "()V");
                c.iconst(0).invokestatic("t/Out", "print", PRINT);
                c.aload(1).invokevirtual("p/Base", "m", "()V");
                c.op(RETURN);
            });
        vm.define_class(&sub.build(), Ref::NULL).unwrap();

        assert_eq!(vm.run_main("p/Sub", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "1\n2\n0\n1\n2\n");
    }
}

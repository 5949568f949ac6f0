//! Segmented thread stacks and frame push/pop.
//!
//! A stack is a list of heap-allocated segments. Cell 0 of a segment links to
//! the next one; frames start at cell 1. Each frame begins with seven save
//! cells holding the caller's registers, followed by the callee's locals and
//! its operand stack:
//!
//! ```text
//! | caller locals | caller sp | caller ppc | next pc | caller method |
//! | caller segment | monitor | locals ... | operand stack ... |
//! ```

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::MethodId;
use crate::error::{ExitCode, VmError, VmResult};
use crate::heap::{AllocKind, Heap};
use crate::thread::ThreadId;

pub const SAVE_CELLS: usize = 7;
const SAVE_LOCALS: usize = 0;
const SAVE_SP: usize = 1;
const SAVE_PPC: usize = 2;
const SAVE_PC: usize = 3;
const SAVE_METHOD: usize = 4;
const SAVE_SEGMENT: usize = 5;
const SAVE_MONITOR: usize = 6;

/// Next-pc value marking the bottom frame of a thread.
pub const KILL_PC: u32 = u32::MAX;

pub const WEDGE_LOCALS: usize = 2;
pub const WEDGE_STACK: usize = 2;

/// Execution registers. The VM keeps the running thread's copy in
/// [`Vm::regs`]; every other thread keeps its own in its record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Word index of the next free operand stack cell.
    pub sp: usize,
    pub pc: u32,
    /// Start of the instruction being executed.
    pub ppc: u32,
    pub method: MethodId,
    /// Word index of local 0.
    pub locals: usize,
    pub segment: Ref,
}

/// What a callback wedge does when execution returns into it.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Callback {
    ThreadExit = 1,
    ClinitDone = 2,
    NewInstance = 3,
}

impl Callback {
    pub fn from_cell(cell: Cell) -> Option<Self> {
        match cell.int() {
            1 => Some(Callback::ThreadExit),
            2 => Some(Callback::ClinitDone),
            3 => Some(Callback::NewInstance),
            _ => None,
        }
    }
}

/// One activation as seen by stack walkers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub method: MethodId,
    pub locals: usize,
    pub sp: usize,
    /// Instruction the frame is executing (or calling from).
    pub pc: u32,
    pub monitor: Ref,
    /// Where execution resumes in the caller once this frame pops.
    pub return_pc: u32,
}

impl FrameInfo {
    pub fn is_bottom(&self) -> bool {
        self.return_pc == KILL_PC
    }
}

fn caller_in(heap: &Heap, regs: Registers) -> Registers {
    let base = regs.locals - SAVE_CELLS;
    let save = |i: usize| heap.cell(base + i);
    Registers {
        locals: save(SAVE_LOCALS).raw() as usize,
        sp: save(SAVE_SP).raw() as usize,
        ppc: save(SAVE_PPC).raw() as u32,
        pc: save(SAVE_PC).raw() as u32,
        method: MethodId::from_cell(save(SAVE_METHOD)),
        segment: save(SAVE_SEGMENT).reference(),
    }
}

/// Frames of the stack whose top frame has registers `top`. Needs only the
/// heap so that the collector can walk stacks while marking.
pub(crate) fn walk(heap: &Heap, top: Registers) -> Vec<FrameInfo> {
    let mut frames = Vec::new();
    if top.locals == 0 {
        return frames;
    }
    let mut regs = top;
    loop {
        let save = regs.locals - SAVE_CELLS;
        let info = FrameInfo {
            method: regs.method,
            locals: regs.locals,
            sp: regs.sp,
            pc: regs.ppc,
            monitor: heap.cell(save + SAVE_MONITOR).reference(),
            return_pc: heap.cell(save + SAVE_PC).raw() as u32,
        };
        frames.push(info);
        if info.is_bottom() {
            break;
        }
        regs = caller_in(heap, regs);
    }
    frames
}

impl Vm {
    // ── operand stack ──────────────────────────────────────────────

    #[inline]
    pub(crate) fn push(&mut self, value: Cell) {
        self.heap.set_cell(self.regs.sp, value);
        self.regs.sp += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Cell {
        self.regs.sp -= 1;
        self.heap.cell(self.regs.sp)
    }

    #[inline]
    pub(crate) fn push_wide(&mut self, value: Cell) {
        self.heap.set_cell(self.regs.sp, value);
        self.heap.set_cell(self.regs.sp + 1, Cell::ZERO);
        self.regs.sp += 2;
    }

    #[inline]
    pub(crate) fn pop_wide(&mut self) -> Cell {
        self.regs.sp -= 2;
        self.heap.cell(self.regs.sp)
    }

    #[inline]
    pub(crate) fn push_int(&mut self, value: i32) {
        self.push(Cell::from_int(value));
    }

    #[inline]
    pub(crate) fn pop_int(&mut self) -> i32 {
        self.pop().int()
    }

    #[inline]
    pub(crate) fn push_long(&mut self, value: i64) {
        self.push_wide(Cell::from_long(value));
    }

    #[inline]
    pub(crate) fn pop_long(&mut self) -> i64 {
        self.pop_wide().long()
    }

    #[inline]
    pub(crate) fn push_float(&mut self, value: f32) {
        self.push(Cell::from_float(value));
    }

    #[inline]
    pub(crate) fn pop_float(&mut self) -> f32 {
        self.pop().float()
    }

    #[inline]
    pub(crate) fn push_double(&mut self, value: f64) {
        self.push_wide(Cell::from_double(value));
    }

    #[inline]
    pub(crate) fn pop_double(&mut self) -> f64 {
        self.pop_wide().double()
    }

    #[inline]
    pub(crate) fn push_ref(&mut self, value: Ref) {
        self.push(Cell::from_ref(value));
    }

    #[inline]
    pub(crate) fn pop_ref(&mut self) -> Ref {
        self.pop().reference()
    }

    /// Cell `depth` slots below the top of the operand stack.
    #[inline]
    pub(crate) fn peek(&self, depth: usize) -> Cell {
        self.heap.cell(self.regs.sp - 1 - depth)
    }

    #[inline]
    pub(crate) fn local(&self, index: usize) -> Cell {
        self.heap.cell(self.regs.locals + index)
    }

    #[inline]
    pub(crate) fn set_local(&mut self, index: usize, value: Cell) {
        self.heap.set_cell(self.regs.locals + index, value);
    }

    // ── segments ───────────────────────────────────────────────────

    /// Allocates a segment of `cells` usable cells for `thread`, charging it
    /// against the thread's stack limit.
    pub(crate) fn new_stack_segment(&mut self, thread: ThreadId, cells: usize) -> VmResult<Ref> {
        let used = self.threads.get(thread).map_or(0, |t| t.stack_cells);
        if used + cells > self.settings.stack_limit_cells {
            return match self.soe.non_null() {
                Some(soe) => Err(VmError::Throw(soe)),
                None => Err(VmError::fatal(
                    ExitCode::Internal,
                    "stack limit exceeded during startup",
                )),
            };
        }
        let segment = self.allocate(cells + 1, AllocKind::StackSegment)?;
        if let Some(t) = self.threads.get_mut(thread) {
            t.stack_cells += self.heap.payload_words(segment) - 1;
        }
        Ok(segment)
    }

    fn segment_end(&self, segment: Ref) -> usize {
        segment.index() + self.heap.payload_words(segment)
    }

    /// Cells a frame for `method` needs: (arguments, locals, operand stack).
    fn frame_shape(&self, method: MethodId) -> (usize, usize, usize) {
        if method.is_wedge() {
            return (0, WEDGE_LOCALS, WEDGE_STACK);
        }
        let m = self.classes.method(method);
        let args = m.arg_cells as usize;
        (args, (m.max_locals as usize).max(args), m.max_stack as usize)
    }

    // ── push / pop ─────────────────────────────────────────────────

    /// Pushes a frame for `method` above `caller` on `thread`'s stack and
    /// returns the callee's registers. The arguments are the top
    /// `arg_cells` of the caller's operand stack and move into the callee's
    /// locals. `next_pc` is where the caller resumes.
    pub(crate) fn push_frame_on(
        &mut self,
        thread: ThreadId,
        caller: Registers,
        next_pc: u32,
        method: MethodId,
        monitor: Ref,
    ) -> VmResult<Registers> {
        let (args, locals, stack) = self.frame_shape(method);
        let required = SAVE_CELLS + locals + stack;

        let (base, segment) = if caller.sp + required <= self.segment_end(caller.segment) {
            (caller.sp, caller.segment)
        } else {
            let next = self.heap.field(caller.segment, 0).reference();
            if !next.is_null() && self.heap.payload_words(next) > required {
                (next.index() + 1, next)
            } else {
                let cells = self.settings.stack_segment_cells.max(required);
                let fresh = self.new_stack_segment(thread, cells)?;
                let after = self.heap.field(caller.segment, 0);
                self.heap.set_field(fresh, 0, after);
                self.heap
                    .set_field(caller.segment, 0, Cell::from_ref(fresh));
                (fresh.index() + 1, fresh)
            }
        };

        let callee_locals = base + SAVE_CELLS;
        let arg_base = caller.sp - args;
        self.heap.copy_cells(arg_base, callee_locals, args);
        self.heap
            .fill_cells(callee_locals + args, locals - args, Cell::ZERO);

        let save = [
            Cell(caller.locals as u64),
            Cell(arg_base as u64),
            Cell(caller.ppc as u64),
            Cell(next_pc as u64),
            caller.method.to_cell(),
            Cell::from_ref(caller.segment),
            Cell::from_ref(monitor),
        ];
        for (i, cell) in save.into_iter().enumerate() {
            self.heap.set_cell(base + i, cell);
        }

        Ok(Registers {
            sp: callee_locals + locals,
            pc: 0,
            ppc: 0,
            method,
            locals: callee_locals,
            segment,
        })
    }

    /// Pushes a frame on the running thread.
    pub(crate) fn push_frame(&mut self, next_pc: u32, method: MethodId, monitor: Ref) -> VmResult<()> {
        let regs = self.push_frame_on(self.current, self.regs, next_pc, method, monitor)?;
        self.regs = regs;
        Ok(())
    }

    /// Pushes a callback wedge on the running thread.
    pub(crate) fn push_wedge(&mut self, next_pc: u32, callback: Callback, arg: Cell) -> VmResult<()> {
        self.push_frame(next_pc, MethodId::WEDGE, Ref::NULL)?;
        self.set_local(0, Cell::from_int(callback as i32));
        self.set_local(1, arg);
        Ok(())
    }

    /// Restores the caller's registers from the top frame's save cells.
    pub(crate) fn pop_frame(&mut self) {
        self.regs = self.caller_of(self.regs);
    }

    pub(crate) fn caller_of(&self, regs: Registers) -> Registers {
        caller_in(&self.heap, regs)
    }

    /// Monitor held on behalf of the frame whose locals start at `locals`.
    pub(crate) fn frame_monitor(&self, locals: usize) -> Ref {
        self.heap
            .cell(locals - SAVE_CELLS + SAVE_MONITOR)
            .reference()
    }

    pub(crate) fn set_frame_monitor(&mut self, locals: usize, monitor: Ref) {
        self.heap
            .set_cell(locals - SAVE_CELLS + SAVE_MONITOR, Cell::from_ref(monitor));
    }

    /// Walks a stack top-down starting from `top`, ending with the bottom
    /// frame (the one whose return pc is [`KILL_PC`]).
    pub(crate) fn frames_from(&self, top: Registers) -> Vec<FrameInfo> {
        walk(&self.heap, top)
    }

    pub(crate) fn thread_regs(&self, thread: ThreadId) -> Registers {
        if thread == self.current {
            self.regs
        } else {
            self.threads[thread].regs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmSettings;

    fn vm() -> Vm {
        Vm::new(VmSettings {
            stack_segment_cells: 64,
            stack_limit_cells: 1024,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn push_then_pop_restores_caller_registers() {
        let mut vm = vm();
        vm.prepare_thread_stack(vm.current).unwrap();
        vm.push_wedge(KILL_PC, Callback::ThreadExit, Cell::ZERO).unwrap();
        vm.push_int(41);
        vm.push_int(42);
        let caller = vm.regs;

        vm.push_frame(77, MethodId::WEDGE, Ref::NULL).unwrap();
        assert_ne!(vm.regs, caller);
        vm.pop_frame();
        let mut expected = caller;
        expected.pc = 77;
        assert_eq!(vm.regs, expected);
        assert_eq!(vm.pop_int(), 42);
    }

    #[test]
    fn frames_spill_into_new_segments() {
        let mut vm = vm();
        vm.prepare_thread_stack(vm.current).unwrap();
        vm.push_wedge(KILL_PC, Callback::ThreadExit, Cell::ZERO).unwrap();
        let first = vm.regs.segment;
        // wedge frames advance nine cells, so a 64-cell segment fills up
        for _ in 0..8 {
            vm.push_frame(0, MethodId::WEDGE, Ref::NULL).unwrap();
        }
        assert_ne!(vm.regs.segment, first);
        let frames = vm.frames_from(vm.regs);
        assert_eq!(frames.len(), 9);
        assert!(frames.last().unwrap().is_bottom());

        for _ in 0..8 {
            vm.pop_frame();
        }
        assert_eq!(vm.regs.segment, first);
        // popping and pushing again reuses the linked successor
        let used = vm.threads[vm.current].stack_cells;
        for _ in 0..8 {
            vm.push_frame(0, MethodId::WEDGE, Ref::NULL).unwrap();
        }
        assert_eq!(vm.threads[vm.current].stack_cells, used);
    }

    #[test]
    fn stack_limit_raises_stack_overflow() {
        let mut vm = vm();
        vm.prepare_thread_stack(vm.current).unwrap();
        vm.push_wedge(KILL_PC, Callback::ThreadExit, Cell::ZERO).unwrap();
        let soe = vm.soe;
        let mut result = Ok(());
        for _ in 0..200 {
            result = vm.push_frame(0, MethodId::WEDGE, Ref::NULL);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(VmError::Throw(r)) if r == soe));
    }
}

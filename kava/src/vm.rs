use std::mem::size_of;
use std::time::Instant;

use log::{debug, error, info};
use rustc_hash::FxHashMap;

use crate::bootstrap;
use crate::cell::{Cell, Ref};
use crate::class::{ClassId, ClassPool, ElemType};
use crate::config::VmSettings;
use crate::console::Console;
use crate::debug::{DebugEvent, DebugSink, Debugger, LogSink};
use crate::error::{ExitCode, VmError, VmResult};
use crate::frame::{Callback, KILL_PC, Registers};
use crate::heap::{Heap, HeapStats};
use crate::loader::ClassPath;
use crate::monitor::MonitorCache;
use crate::natives::{NativeFn, NativeRegistry};
use crate::roots::Roots;
use crate::thread::{ThreadId, Threads};

/// Bootstrap classes and member slots the core refers to directly.
#[derive(Debug, Default, Clone)]
pub struct KnownClasses {
    pub object: ClassId,
    pub class: ClassId,
    pub string: ClassId,
    pub cloneable: ClassId,
    pub serializable: ClassId,
    pub thread: ClassId,
    pub throwable: ClassId,
    pub error: ClassId,
    pub class_loader: ClassId,
    pub weak_reference: ClassId,
    pub system: ClassId,
    pub char_array: ClassId,
    pub primitives: Vec<(ElemType, ClassId)>,

    pub string_value: u32,
    pub class_data: u32,
    pub thread_name: u32,
    pub thread_priority: u32,
    pub thread_daemon: u32,
    pub thread_target: u32,
    pub thread_eetop: u32,
    pub throwable_message: u32,
    pub throwable_cause: u32,
    pub throwable_backtrace: u32,
    pub loader_classes: u32,
    pub loader_count: u32,
    pub loader_parent: u32,
    pub weak_referent: u32,
}

/// An embeddable VM instance. All state lives here; nothing is global.
pub struct Vm {
    pub(crate) settings: VmSettings,
    pub(crate) heap: Heap,
    pub(crate) roots: Roots,
    pub(crate) classes: ClassPool,
    /// Interned strings; every value is a permanent root.
    pub(crate) strings: FxHashMap<String, Ref>,
    pub(crate) natives: NativeRegistry,
    pub(crate) threads: Threads,
    pub(crate) monitors: MonitorCache,
    /// Registers of the running thread.
    pub(crate) regs: Registers,
    pub(crate) current: ThreadId,
    pub(crate) timeslice: u32,
    pub(crate) classpath: ClassPath,
    pub(crate) boot_classpath: ClassPath,
    pub(crate) console: Console,
    pub(crate) debugger: Option<Debugger>,
    pub(crate) known: KnownClasses,
    pub(crate) app_loader: Ref,
    /// Pre-allocated throwables for resource exhaustion.
    pub(crate) oom: Ref,
    pub(crate) soe: Ref,
    pub(crate) exit_code: ExitCode,
    pub(crate) gc_cycles: usize,
    /// Classes being defined, for circularity detection.
    pub(crate) loading: Vec<(String, Ref)>,
    started: Instant,
}

/// Checks the numeric representations the cell layout depends on.
fn numeric_sanity() -> Result<(), &'static str> {
    if size_of::<Cell>() != 8 || size_of::<u64>() != 8 {
        return Err("cell is not 64 bits wide");
    }
    if size_of::<usize>() < 4 {
        return Err("usize narrower than 32 bits");
    }
    if f32::from_bits(1.5f32.to_bits()) != 1.5 || f64::from_bits(0x3ff8_0000_0000_0000) != 1.5 {
        return Err("floating point is not IEEE 754");
    }
    if (-1i32) as u32 != u32::MAX || (i32::MIN).wrapping_div(-1) != i32::MIN {
        return Err("integers are not two's complement");
    }
    Ok(())
}

impl Vm {
    pub fn new(settings: VmSettings) -> VmResult<Vm> {
        numeric_sanity().map_err(|m| VmError::fatal(ExitCode::NumericSizeSanity, m))?;
        settings
            .validate()
            .map_err(|m| VmError::fatal(ExitCode::Internal, m))?;
        let segments = settings.boot_classpath.len() + settings.classpath.len();
        if segments > settings.max_classpath_segments {
            return Err(VmError::fatal(
                ExitCode::MaxClasspathSegments,
                format!(
                    "{segments} classpath segments exceed the limit of {}",
                    settings.max_classpath_segments
                ),
            ));
        }

        let mut threads = Threads::new();
        let main = threads.create(Ref::NULL);
        threads[main].is_main = true;

        let debugger = settings
            .debug
            .as_ref()
            .map(|transport| {
                info!("debugger enabled (transport {transport})");
                Debugger::new(Box::new(LogSink))
            });

        let mut vm = Vm {
            heap: Heap::new(settings.heap_size),
            roots: Roots::new(settings.permanent_roots, settings.transient_roots),
            classes: ClassPool::with_capacity(settings.class_buckets),
            strings: FxHashMap::with_capacity_and_hasher(settings.intern_buckets, Default::default()),
            natives: NativeRegistry::with_capacity(settings.native_buckets),
            threads,
            monitors: MonitorCache::new(),
            regs: Registers::default(),
            current: main,
            timeslice: settings.quantum,
            classpath: ClassPath::new(&settings.classpath),
            boot_classpath: ClassPath::new(&settings.boot_classpath),
            console: settings.console.clone(),
            debugger,
            known: KnownClasses::default(),
            app_loader: Ref::NULL,
            oom: Ref::NULL,
            soe: Ref::NULL,
            exit_code: ExitCode::Success,
            gc_cycles: 0,
            loading: Vec::new(),
            started: Instant::now(),
            settings,
        };
        bootstrap::bootstrap(&mut vm)?;
        debug!(
            "vm ready: {} classes, {} words free",
            vm.classes.len(),
            vm.heap.stats().free_words
        );
        Ok(vm)
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn gc_cycles(&self) -> usize {
        self.gc_cycles
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Milliseconds since the VM started, the scheduler's clock.
    pub(crate) fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    pub fn register_native(&mut self, class: &str, name: &str, descriptor: &str, function: NativeFn) {
        self.natives.register(class, name, descriptor, function);
    }

    /// Replaces the debugger sink, enabling debugging if it was off.
    pub fn attach_debugger(&mut self, sink: Box<dyn DebugSink>) {
        match &mut self.debugger {
            Some(debugger) => debugger.set_sink(sink),
            None => self.debugger = Some(Debugger::new(sink)),
        }
    }

    pub(crate) fn post_event(&mut self, event: DebugEvent) {
        if let Some(debugger) = &mut self.debugger {
            debugger.post(&event);
        }
    }

    // ── transient scopes ───────────────────────────────────────────

    /// Runs `body` with its own transient-root region, which is released on
    /// every exit path.
    pub fn scoped<T>(&mut self, body: impl FnOnce(&mut Vm) -> VmResult<T>) -> VmResult<T> {
        let depth = self.roots.transient.depth();
        let result = body(self);
        self.roots.transient.truncate(depth);
        result
    }

    /// `try { body } catch (e) { handler }` over Java throwables. Fatal
    /// errors and exits pass through untouched.
    pub fn try_catch<T>(
        &mut self,
        body: impl FnOnce(&mut Vm) -> VmResult<T>,
        handler: impl FnOnce(&mut Vm, Ref) -> VmResult<T>,
    ) -> VmResult<T> {
        match self.scoped(body) {
            Err(VmError::Throw(throwable)) => self.scoped(|vm| {
                vm.root(throwable)?;
                handler(vm, throwable)
            }),
            other => other,
        }
    }

    /// Registers `value` as a transient root of the innermost scope.
    pub fn root(&mut self, value: Ref) -> VmResult<usize> {
        self.roots.transient.push(value)
    }

    pub fn root_permanent(&mut self, value: Ref) -> VmResult<usize> {
        self.roots.permanent.push(value)
    }

    // ── running programs ───────────────────────────────────────────

    /// Runs `main(String[])` of `class` (slashed or dotted name) on the
    /// bootstrap thread and keeps scheduling until the last non-daemon
    /// thread ends.
    pub fn run_main(&mut self, class: &str, args: &[&str]) -> ExitCode {
        let class = class.replace('.', "/");
        self.post_event(DebugEvent::VmStart);
        let code = match self.launch(&class, args).and_then(|()| self.run()) {
            Ok(()) => self.exit_code,
            Err(VmError::Exit(0)) => ExitCode::Success,
            Err(VmError::Exit(status)) => ExitCode::Explicit(status),
            Err(VmError::Fatal { code, message }) => {
                error!("fatal: {message}");
                if self.console.is_present() {
                    self.console.write_line(&format!("kava: {message}"));
                }
                code
            }
            Err(VmError::Throw(throwable)) => {
                let thread = self.threads.get(self.current).map_or(Ref::NULL, |t| t.object);
                self.report_uncaught(thread, throwable);
                ExitCode::Uncaught
            }
        };
        self.post_event(DebugEvent::VmDeath);
        info!("vm exit with status {}", code.code());
        code
    }

    /// Loads the main class, creates the main thread's stack and pushes the
    /// `main` frame, with class initialization scheduled on top of it.
    fn launch(&mut self, class: &str, args: &[&str]) -> VmResult<()> {
        let main = self.current;
        self.prepare_thread_stack(main)?;
        self.attach_main_thread_object()?;
        self.threads.non_daemon += 1;
        self.threads.active += 1;
        self.threads.make_runnable(main);

        let class = self.load_class(class, self.app_loader)?;
        let method = self
            .find_method(class, "main", "([Ljava/lang/String;)V")
            .filter(|&m| self.classes.method(m).is_static());
        let Some(method) = method else {
            return Err(VmError::fatal(
                ExitCode::NoMainMethod,
                format!("no main method in {}", self.classes[class].java_name()),
            ));
        };

        self.push_wedge(KILL_PC, Callback::ThreadExit, Cell::ZERO)?;
        let array = self.scoped(|vm| {
            let string_array = vm.array_class_of(vm.known.string)?;
            let array = vm.new_ref_array(string_array, args.len())?;
            vm.root(array)?;
            for (i, arg) in args.iter().enumerate() {
                let s = vm.new_string(arg)?;
                vm.array_store_ref(array, i, s);
            }
            Ok(array)
        })?;
        self.push_ref(array);
        self.push_frame(0, method, Ref::NULL)?;
        let object = self.threads[main].object;
        self.post_event(DebugEvent::ThreadStart { thread: main });
        debug!("main thread {:?} running {}", object, self.classes.describe(method));
        self.initialize_for_launch(class)
    }
}

use std::path::PathBuf;

use crate::console::Console;
use crate::heap::{MAX_CHUNK_WORDS, WORD_BYTES};

// Startup options. Everything the launcher can set ends up here; the VM reads
// nothing from the environment on its own.
#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Heap size in bytes. Fixed for the VM lifetime.
    pub heap_size: usize,
    /// Default height of a stack segment in cells.
    pub stack_segment_cells: usize,
    /// Upper bound on the cells a single thread may hold across all of its
    /// segments. Exceeding it raises `StackOverflowError`.
    pub stack_limit_cells: usize,
    pub transient_roots: usize,
    pub permanent_roots: usize,
    pub utf_buckets: usize,
    pub intern_buckets: usize,
    pub class_buckets: usize,
    pub native_buckets: usize,
    pub boot_classpath: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub home: Option<PathBuf>,
    pub assertions: bool,
    /// Transport of an attached debugger, if debugging is enabled.
    pub debug: Option<String>,
    /// `-D` properties, forwarded to `java.lang.System`.
    pub properties: Vec<(String, String)>,
    /// Bytecodes per priority level in a timeslice.
    pub quantum: u32,
    /// Enforces binary-compatibility checks such as final field writes.
    pub binary_compat_checks: bool,
    pub max_classpath_segments: usize,
    pub console: Console,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            heap_size: 4 * 1024 * 1024,
            stack_segment_cells: 1024,
            stack_limit_cells: 256 * 1024,
            transient_roots: 4096,
            permanent_roots: 8192,
            utf_buckets: 1024,
            intern_buckets: 256,
            class_buckets: 256,
            native_buckets: 128,
            boot_classpath: Vec::new(),
            classpath: Vec::new(),
            home: None,
            assertions: false,
            debug: None,
            properties: Vec::new(),
            quantum: 200,
            binary_compat_checks: true,
            max_classpath_segments: 64,
            console: Console::Stdout,
        }
    }
}

pub const MIN_HEAP_SIZE: usize = 64 * 1024;
pub const MIN_SEGMENT_CELLS: usize = 64;

impl VmSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size < MIN_HEAP_SIZE {
            return Err("heap size below 64 KiB");
        }
        if self.heap_size / WORD_BYTES > MAX_CHUNK_WORDS {
            return Err("heap size exceeds the chunk size field");
        }
        if self.stack_segment_cells < MIN_SEGMENT_CELLS {
            return Err("stack segment height below 64 cells");
        }
        if self.stack_limit_cells < self.stack_segment_cells {
            return Err("stack limit smaller than one segment");
        }
        if self.transient_roots == 0 || self.permanent_roots == 0 {
            return Err("root stacks need at least one slot");
        }
        if self.quantum == 0 {
            return Err("scheduler quantum must be positive");
        }
        if [
            self.utf_buckets,
            self.intern_buckets,
            self.class_buckets,
            self.native_buckets,
        ]
        .contains(&0)
        {
            return Err("pool bucket counts must be positive");
        }
        Ok(())
    }
}

/// Parses sizes like `512k`, `4m` or `65536`.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, scale) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 1024),
        'm' | 'M' => (&text[..text.len() - 1], 1024 * 1024),
        'g' | 'G' => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(scale)
}

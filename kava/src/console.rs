use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

/// Where Java-level console output goes.
#[derive(Debug, Clone, Default)]
pub enum Console {
    #[default]
    Stdout,
    /// Output is appended to a shared buffer the embedder can inspect.
    Capture(Arc<Mutex<String>>),
    Silent,
}

impl Console {
    pub fn capture() -> (Self, Arc<Mutex<String>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        (Console::Capture(buffer.clone()), buffer)
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Console::Silent)
    }

    pub fn write(&self, text: &str) {
        match self {
            Console::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
            Console::Capture(buffer) => buffer.lock().push_str(text),
            Console::Silent => {}
        }
    }

    pub fn write_line(&self, text: &str) {
        match self {
            Console::Capture(buffer) => {
                let mut buffer = buffer.lock();
                buffer.push_str(text);
                buffer.push('\n');
            }
            _ => {
                self.write(text);
                self.write("\n");
            }
        }
    }
}

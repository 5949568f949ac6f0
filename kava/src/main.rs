use std::path::PathBuf;

use clap::Parser;
use log::error;

use kava::config::parse_size;
use kava::{ExitCode, Vm, VmError, VmSettings};

#[derive(Parser, Debug)]
#[command(name = "kava", about = "Runs a Java 6 main class", version)]
struct Cli {
    /// User classpath, ':' separated.
    #[arg(long = "cp", visible_alias = "classpath", value_name = "PATH")]
    classpath: Option<String>,

    /// Boot classpath, ':' separated.
    #[arg(long = "bootcp", value_name = "PATH")]
    boot_classpath: Option<String>,

    /// Heap size, e.g. 4m or 512k.
    #[arg(long = "Xmx", value_name = "SIZE", value_parser = size)]
    heap: Option<usize>,

    /// Stack segment height in cells.
    #[arg(long = "Xss", value_name = "CELLS", value_parser = size)]
    segment: Option<usize>,

    #[arg(long = "ea")]
    assertions: bool,

    /// System property, repeatable.
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = property)]
    properties: Vec<(String, String)>,

    /// Enable the debugger with the given transport.
    #[arg(long = "debug", value_name = "TRANSPORT")]
    debug: Option<String>,

    #[arg(long = "verbose")]
    verbose: bool,

    /// Main class, dotted or slashed.
    main_class: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn size(text: &str) -> Result<usize, String> {
    parse_size(text).ok_or_else(|| format!("invalid size `{text}`"))
}

fn property(text: &str) -> Result<(String, String), String> {
    let (key, value) = text.split_once('=').unwrap_or((text, ""));
    if key.is_empty() {
        return Err(format!("invalid property `{text}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn paths(list: Option<&str>) -> Vec<PathBuf> {
    list.map(|l| l.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

/// Rewrites java-style single-dash options (`-cp`, `-Xmx4m`, `-ea`) into the
/// double-dash form clap expects. Everything from the main class on is left
/// untouched.
fn java_style(raw: impl IntoIterator<Item = String>) -> Vec<String> {
    const TAKES_VALUE: &[&str] = &["-cp", "-classpath", "-bootcp", "-debug"];
    const FLAGS: &[&str] = &["-ea", "-verbose", "-help", "-version"];
    let mut out = Vec::new();
    let mut raw = raw.into_iter();
    if let Some(program) = raw.next() {
        out.push(program);
    }
    while let Some(arg) = raw.next() {
        if TAKES_VALUE.contains(&arg.as_str()) {
            out.push(format!("-{arg}"));
            out.extend(raw.next());
        } else if FLAGS.contains(&arg.as_str()) {
            out.push(format!("-{arg}"));
        } else if let Some(rest) = arg.strip_prefix("-Xmx").or_else(|| arg.strip_prefix("-Xss")) {
            out.push(format!("-{}", &arg[..4]));
            out.push(rest.to_string());
        } else if arg.starts_with('-') {
            out.push(arg);
        } else {
            out.push(arg);
            out.push("--".to_string());
            out.extend(raw);
            break;
        }
    }
    out
}

fn main() {
    let cli = Cli::parse_from(java_style(std::env::args()));

    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut settings = VmSettings {
        classpath: paths(cli.classpath.as_deref()),
        boot_classpath: paths(cli.boot_classpath.as_deref()),
        assertions: cli.assertions,
        properties: cli.properties,
        debug: cli.debug,
        ..Default::default()
    };
    if let Some(heap) = cli.heap {
        settings.heap_size = heap;
    }
    if let Some(segment) = cli.segment {
        settings.stack_segment_cells = segment;
        settings.stack_limit_cells = settings.stack_limit_cells.max(segment);
    }
    if let Ok(home) = std::env::var("KAVA_HOME") {
        settings.home = Some(PathBuf::from(home));
    }

    let mut vm = match Vm::new(settings) {
        Ok(vm) => vm,
        Err(err) => {
            error!("{err}");
            let code = match err {
                VmError::Fatal { code, .. } => code,
                _ => ExitCode::Internal,
            };
            std::process::exit(code.code());
        }
    };

    let args: Vec<&str> = cli.args.iter().map(String::as_str).collect();
    let code = vm.run_main(&cli.main_class, &args);
    std::process::exit(code.code());
}

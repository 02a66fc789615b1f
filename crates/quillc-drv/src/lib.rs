//! quillc-drv - Command-line driver for the Quill runtime.
//!
//! Usage: `quillc <script-file>`. The driver reads one source file,
//! evaluates it, and prints the value of the trailing top-level expression
//! to stdout. Diagnostics go to stderr; the process exits non-zero on I/O
//! failure, parse error, compile error, or runtime error.

pub mod logging;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use quillc_rt::{Value, Vm};

/// Driver configuration parsed from the command line.
pub struct Config {
    pub script: PathBuf,
}

impl Config {
    /// Parses `argv`. Exactly one positional argument, the script path.
    pub fn from_args(args: impl Iterator<Item = String>) -> Result<Config> {
        let args: Vec<String> = args.skip(1).collect();
        if args.len() != 1 {
            bail!("Usage: quillc <script-file>");
        }
        Ok(Config {
            script: PathBuf::from(&args[0]),
        })
    }
}

/// One evaluation session owning a VM.
pub struct Session {
    vm: Vm,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self { vm: Vm::new() }
    }

    /// Reads and evaluates the configured script, returning the printable
    /// form of its result.
    pub fn run(&mut self, config: &Config) -> Result<String> {
        let source = fs::read_to_string(&config.script)
            .with_context(|| format!("Failed to read file '{}'.", config.script.display()))?;
        let value = quillc_gen::run_source(&mut self.vm, &source)?;
        Ok(self.format_value(value))
    }

    /// Renders a value the way the terminal printer shows it: scalars as
    /// written, numbers as their shortest round-trip decimal, strings as
    /// raw bytes, functions as `<function NAME>`, everything else as
    /// `<object>`.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Number(n) => format!("{n}"),
            Value::Obj(_) => {
                if let Some(chars) = self.vm.string_chars(value) {
                    chars.to_string()
                } else if self.vm.is_function(value) {
                    format!("<function {}>", self.vm.function_name(value).unwrap_or("<fn>"))
                } else {
                    "<object>".to_string()
                }
            }
        }
    }
}

/// Entry point for the `quillc` binary.
pub fn main() -> Result<()> {
    logging::init();
    let config = Config::from_args(std::env::args())?;
    let mut session = Session::new();
    let output = session.run(&config)?;
    println!("{output}");
    Ok(())
}

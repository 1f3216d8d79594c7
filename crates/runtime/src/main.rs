//! Etch CLI driver
//!
//! Thin front end over the compiler and VM: generate cached bytecode,
//! run a program, or dump its disassembly.
//!
//! Exit codes: 0 success, 1 compile error, 2 runtime error.

use clap::Parser as ClapParser;
use etch_runtime::{Context, ContextOptions};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "etch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Etch - a statically typed, safety-first scripting language", long_about = None)]
struct Cli {
    /// Source file (.etch)
    file: PathBuf,

    /// Compile to cached bytecode without running
    #[arg(long)]
    gen: bool,

    /// Compile and run (the default)
    #[arg(long)]
    run: bool,

    /// Print disassembly instead of running
    #[arg(long)]
    dump: bool,

    /// Bypass the bytecode cache
    #[arg(long)]
    force: bool,

    /// Release mode
    #[arg(long)]
    release: bool,

    /// Cycle-collector interval in decrements (0 disables periodic runs)
    #[arg(long = "gc-interval", default_value_t = 1024)]
    gc_interval: u32,

    /// Verbose compiler/VM logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut options = ContextOptions::default();
    options.verbose = cli.verbose;
    options.gc_cycle_interval = cli.gc_interval;
    options.compiler.force = cli.force;
    options.compiler.release = cli.release;

    let mut ctx = Context::new(options);
    if let Err(e) = ctx.compile_file(&cli.file) {
        eprintln!("{}", e);
        process::exit(1);
    }

    if cli.dump {
        match ctx.dump() {
            Some(listing) => print!("{}", listing),
            None => eprintln!("nothing compiled"),
        }
        return;
    }
    if cli.gen && !cli.run {
        println!("compiled {}", cli.file.display());
        return;
    }

    match ctx.execute() {
        Ok(code) => process::exit(code.clamp(0, 255) as i32),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    }
}

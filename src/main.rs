use clap::Parser;
use tracing_subscriber::EnvFilter;

use vesper::loader;
use vesper::opcode;
use vesper::reader;
use vesper::value::{self, Value};
use vesper::vm::Vm;
use vesper::writer;

use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "vesper", version = vesper::VERSION, about = "The Vesper language")]
struct Cli {
    /// Compile each file and print the decompiled code
    #[arg(short, long)]
    compile: bool,

    /// Print timing and trace lines
    #[arg(short, long)]
    verbose: bool,

    /// Print expansion and compilation detail
    #[arg(short, long)]
    debug: bool,

    /// Colon-separated directories prepended to the load path
    #[arg(short, long)]
    path: Option<String>,

    /// Source files to load and execute; none enters the REPL
    files: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "vesper=trace"
    } else if cli.verbose {
        "vesper=debug"
    } else {
        "vesper=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let vm = match Vm::new().init() {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("*** {}", e);
            process::exit(1);
        }
    };
    vm.set_flags(cli.verbose, cli.debug);

    if let Some(path) = &cli.path {
        for dir in path.split(':').rev().filter(|d| !d.is_empty()) {
            let expanded = loader::expand_file_path(dir);
            if loader::is_directory_readable(&expanded) {
                loader::add_path(&vm, &expanded);
                if cli.debug {
                    println!("[added directory to path: '{}']", expanded);
                }
            } else if cli.debug {
                println!("[directory not readable, cannot add to path: '{}']", expanded);
            }
        }
    }

    if cli.files.is_empty() {
        vesper::repl::start(&vm);
        return;
    }

    if cli.compile {
        for file in &cli.files {
            if let Err(e) = compile_file(&vm, file) {
                eprintln!("*** {}", e);
                process::exit(1);
            }
        }
        return;
    }

    for file in &cli.files {
        if let Err(e) = loader::load_file(&vm, file) {
            eprintln!("*** {}", e);
            process::exit(1);
        }
    }
}

/// Compiles every form in the file and prints the decompiled code.
fn compile_file(vm: &Arc<Vm>, file: &str) -> vesper::error::VesperResult<()> {
    let source = loader::slurp_file(file)?;
    let forms = reader::read_all(vm, &source, &Value::Null)?;
    let mut cur = forms;
    while !cur.is_empty_list() {
        let expanded = vesper::expander::macroexpand(vm, &value::car(&cur))?;
        let code = vesper::compiler::compile(vm, &expanded)?;
        println!("{}", writer::write(&opcode::decompile(vm, &code)));
        cur = value::cdr(&cur);
    }
    Ok(())
}

use akmon::{compile_module, CompileOptions};
use anyhow::{Context, Result};
use clap::Parser;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// akmon — compile WebAssembly function bodies into typed SSA graphs.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input WebAssembly binary (.wasm)
    input: PathBuf,

    /// Dump only the graph for this function index
    #[arg(long, short)]
    function: Option<u32>,

    /// Output file (defaults to stdout)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    colog::init();
    let cli = Cli::parse();

    let wasm =
        fs::read(&cli.input).with_context(|| format!("failed to read {}", cli.input.display()))?;
    let compiled = compile_module(&wasm, &CompileOptions::default())
        .with_context(|| format!("compiling {}", cli.input.display()))?;

    let mut dump = String::new();
    for graph in &compiled.graphs {
        if let Some(wanted) = cli.function {
            if graph.func_index != wanted {
                continue;
            }
        }
        writeln!(&mut dump, "{}", graph)?;
    }

    if let Some(output) = cli.output {
        fs::write(&output, dump)
            .with_context(|| format!("failed to write {}", output.display()))?;
    } else {
        print!("{}", dump);
    }
    Ok(())
}

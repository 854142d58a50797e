//! akmon — WebAssembly function-body compiler front-end.
//!
//! Translates wasm bytecode, one function at a time, into a typed SSA
//! control-flow graph. Parsing the surrounding module, validating each
//! body, and lowering its operators into graph nodes happen in a single
//! forward pass per function; the result is ready for a machine backend.

pub mod abi;
pub mod compile;
pub mod decode;
pub mod env;
pub mod mir;
pub mod parser;
pub mod validate;

pub use anyhow::{Context, Result};
use env::{Features, FuncCompileInput, Target};
use mir::MirGraph;
use parser::parse_module;

/// Configuration for a whole-module compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub features: Features,
    pub target: Target,
}

/// The graphs for every defined function, in code-section order.
#[derive(Debug)]
pub struct CompiledCode {
    pub graphs: Vec<MirGraph>,
}

/// Compile every function body in a module binary.
///
/// # Example
/// ```no_run
/// use akmon::{compile_module, CompileOptions};
///
/// let wasm = std::fs::read("input.wasm").unwrap();
/// let compiled = compile_module(&wasm, &CompileOptions::default()).unwrap();
/// for graph in &compiled.graphs {
///     println!("{}", graph);
/// }
/// ```
pub fn compile_module(wasm: &[u8], options: &CompileOptions) -> Result<CompiledCode> {
    let parsed =
        parse_module(wasm, options.features, options.target).context("parsing module")?;

    let mut graphs = Vec::with_capacity(parsed.bodies.len());
    for body in &parsed.bodies {
        let graph = compile::compile_function(
            &parsed.env,
            FuncCompileInput {
                index: body.func_index,
                body: &body.bytes,
                module_offset: body.module_offset,
            },
        )
        .with_context(|| format!("compiling function {}", body.func_index))?;
        graphs.push(graph);
    }
    Ok(CompiledCode { graphs })
}

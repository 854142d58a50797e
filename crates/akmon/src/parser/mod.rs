//! Module-level parsing.
//!
//! Wraps `wasmparser`'s payload stream to build the [`ModuleEnv`] a
//! function-body compilation runs against, and to slice out each code
//! entry as raw bytes (local declarations included) together with its
//! offset in the module, so trap and error messages can point back at
//! the binary.
//!
//! Section-level validation is `wasmparser`'s job; this pass only
//! extracts what the body compiler needs and assigns the TLS slots for
//! imported functions and for globals.

use anyhow::{bail, Context, Result};
use wasmparser::{Parser, Payload, TypeRef};

use crate::env::{
    Features, FuncDesc, FuncType, GlobalDesc, MemoryDesc, ModuleEnv, TableDesc, Target,
};
use crate::mir::ValType;

/// Bytes of TLS reserved for the fixed fields ahead of the slot area.
const TLS_RESERVED_BYTES: u32 = 16;
/// Every TLS slot is pointer-width padded to eight bytes.
const TLS_SLOT_BYTES: u32 = 8;

/// One code-section entry, ready for the body compiler.
#[derive(Debug, Clone)]
pub struct FunctionBodyData {
    /// Index in the full function index space, imports included.
    pub func_index: u32,
    /// Raw body bytes: local declarations followed by the opcodes.
    pub bytes: Vec<u8>,
    /// Byte offset of the body within the module binary.
    pub module_offset: u32,
}

#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub env: ModuleEnv,
    pub bodies: Vec<FunctionBodyData>,
}

fn val_type(ty: wasmparser::ValType) -> Result<ValType> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        wasmparser::ValType::Ref(r) if r.is_func_ref() => Ok(ValType::FuncRef),
        wasmparser::ValType::Ref(_) => Ok(ValType::AnyRef),
        wasmparser::ValType::V128 => bail!("v128 values are not supported"),
    }
}

fn func_type(ty: &wasmparser::FuncType) -> Result<FuncType> {
    if ty.results().len() > 1 {
        bail!("multi-value results are not supported");
    }
    let params = ty
        .params()
        .iter()
        .map(|&p| val_type(p))
        .collect::<Result<Vec<_>>>()?;
    let results = ty
        .results()
        .iter()
        .map(|&r| val_type(r))
        .collect::<Result<Vec<_>>>()?;
    Ok(FuncType::new(params, results))
}

fn table_desc(ty: &wasmparser::TableType) -> Result<TableDesc> {
    let elem_ty = if ty.element_type.is_func_ref() {
        ValType::FuncRef
    } else {
        ValType::AnyRef
    };
    Ok(TableDesc {
        elem_ty,
        initial: u32::try_from(ty.initial).context("table initial size overflows u32")?,
        maximum: match ty.maximum {
            Some(m) => Some(u32::try_from(m).context("table maximum size overflows u32")?),
            None => None,
        },
    })
}

fn memory_desc(ty: &wasmparser::MemoryType) -> MemoryDesc {
    MemoryDesc {
        initial_pages: ty.initial,
        maximum_pages: ty.maximum,
        shared: ty.shared,
    }
}

/// Parse a module binary into the compile environment plus the raw
/// function bodies, in code-section order.
pub fn parse_module(wasm: &[u8], features: Features, target: Target) -> Result<ParsedModule> {
    let mut env = ModuleEnv::new(features, target);
    let mut bodies = Vec::new();
    let mut num_imported_funcs = 0u32;
    let mut next_tls_slot = TLS_RESERVED_BYTES;

    let mut alloc_tls = |next: &mut u32| {
        let offset = *next;
        *next += TLS_SLOT_BYTES;
        offset
    };

    for payload in Parser::new(0).parse_all(wasm) {
        let payload = payload.context("parsing module payload")?;
        match payload {
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    let rec_group = rec_group.context("reading type group")?;
                    for sub_type in rec_group.types() {
                        match &sub_type.composite_type.inner {
                            wasmparser::CompositeInnerType::Func(f) => {
                                env.types.push(func_type(f)?);
                            }
                            _ => bail!("non-function types are not supported"),
                        }
                    }
                }
            }

            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.context("reading import")?;
                    match import.ty {
                        TypeRef::Func(type_index) => {
                            num_imported_funcs += 1;
                            env.funcs.push(FuncDesc {
                                type_index,
                                import_tls_slot: Some(alloc_tls(&mut next_tls_slot)),
                            });
                        }
                        TypeRef::Global(g) => {
                            env.globals.push(GlobalDesc {
                                ty: val_type(g.content_type)?,
                                mutable: g.mutable,
                                // Imported-mutable globals are shared with the
                                // host; the slot holds a pointer to the cell.
                                indirect: g.mutable,
                                tls_offset: alloc_tls(&mut next_tls_slot),
                            });
                        }
                        TypeRef::Memory(m) => {
                            env.memory = Some(memory_desc(&m));
                        }
                        TypeRef::Table(t) => {
                            env.tables.push(table_desc(&t)?);
                        }
                        TypeRef::Tag(_) => bail!("exception tags are not supported"),
                    }
                }
            }

            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let type_index = type_index.context("reading function type index")?;
                    env.funcs.push(FuncDesc {
                        type_index,
                        import_tls_slot: None,
                    });
                }
            }

            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table.context("reading table type")?;
                    env.tables.push(table_desc(&table.ty)?);
                }
            }

            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.context("reading memory type")?;
                    if env.memory.is_some() {
                        bail!("multiple memories are not supported");
                    }
                    env.memory = Some(memory_desc(&memory));
                }
            }

            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.context("reading global")?;
                    env.globals.push(GlobalDesc {
                        ty: val_type(global.ty.content_type)?,
                        mutable: global.ty.mutable,
                        indirect: false,
                        tls_offset: alloc_tls(&mut next_tls_slot),
                    });
                }
            }

            Payload::ElementSection(reader) => {
                env.num_elem_segments = reader.count();
            }

            Payload::DataCountSection { count, .. } => {
                env.num_data_segments = Some(count);
            }

            Payload::CodeSectionEntry(body) => {
                let mut reader = body.get_binary_reader();
                let module_offset =
                    u32::try_from(reader.original_position()).context("body offset overflow")?;
                let remaining = reader.bytes_remaining();
                let bytes = reader.read_bytes(remaining).context("reading body bytes")?;
                bodies.push(FunctionBodyData {
                    func_index: num_imported_funcs + bodies.len() as u32,
                    bytes: bytes.to_vec(),
                    module_offset,
                });
            }

            // Exports, names, data bytes and custom sections play no part
            // in body compilation.
            _ => {}
        }
    }

    if env.funcs.len() - num_imported_funcs as usize != bodies.len() {
        bail!(
            "function section declares {} bodies, code section has {}",
            env.funcs.len() - num_imported_funcs as usize,
            bodies.len()
        );
    }

    Ok(ParsedModule { env, bodies })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(wat_text: &str) -> ParsedModule {
        let wasm = wat::parse_str(wat_text).unwrap();
        parse_module(&wasm, Features::default(), Target::default()).unwrap()
    }

    #[test]
    fn empty_module() {
        let m = parse("(module)");
        assert!(m.env.types.is_empty());
        assert!(m.bodies.is_empty());
        assert!(m.env.memory.is_none());
    }

    #[test]
    fn add_function_body_is_captured() {
        let m = parse(
            r#"(module
                (func (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        assert_eq!(m.env.types.len(), 1);
        assert_eq!(m.env.types[0].params.len(), 2);
        assert_eq!(m.env.funcs.len(), 1);
        assert_eq!(m.bodies.len(), 1);
        assert_eq!(m.bodies[0].func_index, 0);
        // Empty local declarations, then the opcodes ending with `end`.
        assert_eq!(m.bodies[0].bytes[0], 0x00);
        assert_eq!(*m.bodies[0].bytes.last().unwrap(), 0x0B);
        assert!(m.bodies[0].module_offset > 0);
    }

    #[test]
    fn imported_functions_get_distinct_tls_slots() {
        let m = parse(
            r#"(module
                (import "env" "a" (func))
                (import "env" "b" (func))
                (func))"#,
        );
        assert_eq!(m.env.funcs.len(), 3);
        let a = m.env.funcs[0].import_tls_slot.unwrap();
        let b = m.env.funcs[1].import_tls_slot.unwrap();
        assert_ne!(a, b);
        assert!(a >= TLS_RESERVED_BYTES);
        assert!(m.env.funcs[2].import_tls_slot.is_none());
        // The lone local body belongs to function index 2.
        assert_eq!(m.bodies.len(), 1);
        assert_eq!(m.bodies[0].func_index, 2);
    }

    #[test]
    fn imported_mutable_global_is_indirect() {
        let m = parse(
            r#"(module
                (import "env" "g" (global (mut i32)))
                (global i64 (i64.const 7)))"#,
        );
        assert_eq!(m.env.globals.len(), 2);
        assert!(m.env.globals[0].indirect);
        assert!(m.env.globals[0].mutable);
        assert!(!m.env.globals[1].indirect);
        assert_ne!(m.env.globals[0].tls_offset, m.env.globals[1].tls_offset);
    }

    #[test]
    fn memory_limits_and_sharing() {
        let m = parse("(module (memory 2 10))");
        let mem = m.env.memory.unwrap();
        assert_eq!(mem.initial_pages, 2);
        assert_eq!(mem.maximum_pages, Some(10));
        assert!(!mem.shared);
    }

    #[test]
    fn table_declaration() {
        let m = parse("(module (table 4 8 funcref))");
        assert_eq!(m.env.tables.len(), 1);
        assert_eq!(m.env.tables[0].elem_ty, ValType::FuncRef);
        assert_eq!(m.env.tables[0].initial, 4);
        assert_eq!(m.env.tables[0].maximum, Some(8));
    }

    #[test]
    fn multi_value_results_are_rejected() {
        let wasm = wat::parse_str(
            r#"(module
                (func (result i32 i32)
                    i32.const 1
                    i32.const 2))"#,
        )
        .unwrap();
        let err = parse_module(&wasm, Features::default(), Target::default());
        assert!(err.is_err());
    }
}

//! Resolution of relocations and inferred addresses into links.
//!
//! Three entry points cover the three ways a cross-reference arises:
//! a relocation whose target lives in the same module
//! ([`LinkResolver::resolve_internally`]), a relocation or import naming a
//! symbol in some other module ([`LinkResolver::resolve_externally`]), and a
//! jump or call target recovered from decoded operands
//! ([`LinkResolver::resolve_inferred`]).

use crate::elf::{Reloc, RelocType, Symbol, SymbolBind, SymbolType, SymbolVersion};
use crate::error::{Error, Result};
use crate::loader::LoaderEmulator;

use super::link::{make_data_link, make_marker_link};
use super::{ChunkId, Link, LinkScope, Program};

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkResolver;

impl LinkResolver {
    pub fn new() -> LinkResolver {
        LinkResolver
    }

    /// Resolves a relocation against the module it appears in.
    ///
    /// Returns `Ok(None)` when the relocation points outside the module, or
    /// when it names a weak symbol and `weak` resolution was not requested;
    /// a later phase decides what to do with those. Blacklisted relocation
    /// types are a hard error.
    pub fn resolve_internally(
        &self,
        reloc: &Reloc,
        module: ChunkId,
        program: &mut Program,
        weak: bool,
    ) -> Result<Option<Link>> {
        let mut addr = reloc.addend() as u64;

        if let Some(symbol) = reloc.symbol() {
            trace!("(resolve_internally) search for {}", symbol.name());

            if symbol.section_index() == 0 {
                trace!(
                    "relocation target for {:#x} points to an external module",
                    reloc.address()
                );
                return Ok(None);
            }
            if !weak && symbol.bind() == SymbolBind::Weak {
                trace!(
                    "weak symbol {} should be resolved later",
                    symbol.name()
                );
                return Ok(None);
            }
            if symbol.is_marker() {
                trace!(
                    "making marker link {:#x} to {:#x}",
                    reloc.address(),
                    addr
                );
                return Ok(Some(make_marker_link(
                    program,
                    module,
                    symbol.address(),
                    reloc.addend(),
                    Some(symbol),
                )));
            }

            let reloc_type = reloc.reloc_type();
            if reloc_type.is_blacklisted() {
                return Err(Error::UnsupportedRelocation(format!(
                    "{:?} at {:#x}",
                    reloc_type,
                    reloc.address()
                )));
            }

            match reloc_type {
                RelocType::X86Pc32 | RelocType::X86GotPc32 => {
                    let instr = match program
                        .find_instruction_containing(module, reloc.address())
                    {
                        Some(instr) => instr,
                        // maybe from .eh_frame?
                        None => return Ok(None),
                    };
                    // The patched value is S+A-P, relative to the end of the
                    // decoded instruction: S + A + size - (P - instr address).
                    let instr = program.chunk(instr);
                    let offset = reloc.address() - instr.address();
                    addr = addr
                        .wrapping_add(symbol.address())
                        .wrapping_add(instr.size())
                        .wrapping_sub(offset);
                }
                RelocType::X86GlobDat => {
                    // Search the executable's own table first, so that COPY
                    // relocations win over the defining library.
                    if let Some(link) = self.resolve_glob_dat_in_main(symbol, program) {
                        return Ok(Some(link));
                    }
                    addr = symbol.address();
                }
                _ => {
                    addr = addr.wrapping_add(symbol.address());
                }
            }
        }
        trace!("(resolve_internally) search for {:#x}", addr);

        if let Some(func) = program.find_function_containing(module, addr) {
            if program.chunk(func).address() == addr {
                trace!("resolved to a function");
                return Ok(Some(Link::Normal {
                    target: func,
                    scope: LinkScope::WithinModule,
                }));
            }
            if let Some(instruction) = program.find_instruction_containing_in(func, addr) {
                trace!("resolved to an instruction");
                return Ok(Some(Link::Normal {
                    target: instruction,
                    scope: LinkScope::WithinModule,
                }));
            }
        }

        if let Some(dlink) = make_data_link(program, module, addr, true) {
            trace!("resolved to a data");
            return Ok(Some(dlink));
        }

        trace!("resolved to a marker");
        Ok(Some(make_marker_link(program, module, addr, 0, None)))
    }

    fn resolve_glob_dat_in_main(&self, symbol: &Symbol, program: &Program) -> Option<Link> {
        let main = program.main()?;
        let list = program.module(main).elf_space()?.symbol_list()?;
        if list.find(symbol.name()).is_some() {
            return None;
        }
        let version = symbol.version()?;
        let mut versioned_name = String::from(symbol.name());
        versioned_name.push('@');
        if !version.is_hidden() {
            versioned_name.push('@');
        }
        versioned_name.push_str(version.name());
        let s = list.find(&versioned_name)?;
        let dlink = make_data_link(program, main, s.address(), true)?;
        debug!("resolved to a data in the main executable");
        Some(dlink)
    }

    /// Resolves a named symbol against every other module of the program.
    ///
    /// Emulated loader definitions win, then the module's dependencies in
    /// program order, then the module itself (weak local definitions), then
    /// every remaining module (weak references to unrelated libraries).
    pub fn resolve_externally(
        &self,
        name: &str,
        version: Option<&SymbolVersion>,
        module: ChunkId,
        program: &mut Program,
        emulator: &LoaderEmulator,
        weak: bool,
        after_mapping: bool,
    ) -> Option<Link> {
        trace!("(resolve_externally) search for {}, weak? {}", name, weak);

        if let Some(func) = emulator.find_function(name) {
            trace!("    link to emulated function");
            return Some(Link::Normal {
                target: func,
                scope: LinkScope::ExternalCode,
            });
        }
        if let Some(link) = emulator.make_data_link(name, after_mapping, program) {
            trace!("    link to emulated data");
            return Some(link);
        }

        let dependencies = program.module(module).dependencies().clone();
        for candidate in program.modules().to_vec() {
            if candidate == module {
                continue;
            }
            if !dependencies.contains(program.module(candidate).library()) {
                continue;
            }
            if let Some(link) =
                self.resolve_name_as_link(name, version, candidate, program, weak, after_mapping)
            {
                return Some(link);
            }
        }

        // weak definition
        if let Some(link) =
            self.resolve_name_as_link(name, version, module, program, weak, after_mapping)
        {
            trace!(
                "    link to weak definition in {}",
                program.module(module).library()
            );
            return Some(link);
        }

        // weak reference
        for candidate in program.modules().to_vec() {
            if let Some(link) =
                self.resolve_name_as_link(name, version, candidate, program, weak, after_mapping)
            {
                trace!(
                    "    link (weak) to definition in {}",
                    program.module(candidate).library()
                );
                return Some(link);
            }
        }

        // this should only happen for functions in a missing shared library
        trace!("NOT FOUND: failed to make link to {}", name);
        None
    }

    fn resolve_name_as_link(
        &self,
        name: &str,
        version: Option<&SymbolVersion>,
        module: ChunkId,
        program: &mut Program,
        weak: bool,
        after_mapping: bool,
    ) -> Option<Link> {
        if let Some(link) = self.resolve_name_in_space(name, module, program, weak, after_mapping)
        {
            return Some(link);
        }
        // A default versioned symbol needs a link too, though gcc-built
        // binaries and libraries may never exercise this.
        let version = version?;

        let versioned_name = format!("{}@{}", name, version.name());
        if let Some(link) =
            self.resolve_name_in_space(&versioned_name, module, program, weak, after_mapping)
        {
            return Some(link);
        }
        let versioned_name = format!("{}@@{}", name, version.name());
        if let Some(link) =
            self.resolve_name_in_space(&versioned_name, module, program, weak, after_mapping)
        {
            return Some(link);
        }
        None
    }

    fn resolve_name_in_space(
        &self,
        name: &str,
        module: ChunkId,
        program: &mut Program,
        weak: bool,
        after_mapping: bool,
    ) -> Option<Link> {
        let symbol = {
            let space = match program.module(module).elf_space() {
                Some(space) => space,
                None => {
                    trace!("no elf space in {}", program.module(module).library());
                    return None;
                }
            };
            let list = match space.dynamic_symbol_list() {
                Some(list) => list,
                None => {
                    trace!(
                        "no dynamic symbol list in {}",
                        program.module(module).library()
                    );
                    return None;
                }
            };
            match list.find(name) {
                Some(symbol) => symbol.clone(),
                None => {
                    trace!("no symbol in {}", program.module(module).library());
                    return None;
                }
            }
        };
        if !weak && symbol.bind() == SymbolBind::Weak {
            return None;
        }

        if let Some(f) = program.find_named_function(module, name) {
            trace!(
                "    ...found as function! at {:#x}",
                program.chunk(f).address()
            );
            return Some(Link::Normal {
                target: f,
                scope: LinkScope::ExternalCode,
            });
        }

        let space = program.module(module).elf_space()?;
        if let Some(alias) = space.alias_map().find(name) {
            trace!(
                "    ...found as alias! at {:#x}",
                program.chunk(alias).address()
            );
            return Some(Link::Normal {
                target: alias,
                scope: LinkScope::ExternalCode,
            });
        }

        let base_address = space.base_address();
        if symbol.is_marker() {
            return Some(make_marker_link(
                program,
                module,
                base_address + symbol.address(),
                0,
                Some(&symbol),
            ));
        }
        if symbol.address() > 0
            && symbol.symbol_type() != SymbolType::Func
            && symbol.symbol_type() != SymbolType::IFunc
        {
            trace!(
                "    ...found as data ref! at {:#x} in {}",
                symbol.address(),
                program.module(module).library()
            );
            let mut address = symbol.address();
            if after_mapping {
                address += base_address;
            }
            return make_data_link(program, module, address, true);
        }

        None
    }

    /// Resolves a jump or call target discovered by scanning decoded
    /// operands. Always produces a link.
    pub fn resolve_inferred(
        &self,
        address: u64,
        instruction: ChunkId,
        module: ChunkId,
        program: &mut Program,
    ) -> Link {
        let function = program
            .chunk(instruction)
            .parent()
            .and_then(|block| program.chunk(block).parent());

        if let Some(function) = function {
            if let Some(found) = program.find_innermost_at(function, address) {
                trace!(" ==> inside the same function");
                return Link::Normal {
                    target: found,
                    scope: LinkScope::InternalJump,
                };
            }
        }
        if let Some(found) = program.find_function_at(module, address) {
            trace!(" ==> {:?}", program.chunk(found).name());
            return Link::Normal {
                target: found,
                scope: LinkScope::WithinModule,
            };
        }
        if let Some(chunk) = program.find_instruction_containing(module, address) {
            trace!(" --> instruction (literal?)");
            return Link::Normal {
                target: chunk,
                scope: LinkScope::WithinModule,
            };
        }
        if let Some(dlink) = make_data_link(program, module, address, true) {
            trace!(" --> data link");
            return dlink;
        }

        trace!(" --> marker link");
        make_marker_link(program, module, address, 0, None)
    }
}

//! Bridges to the loader runtime.
//!
//! Some symbols are not defined by any analyzed module but by the loader
//! itself. The [`LoaderEmulator`] answers name lookups for those synthetic
//! functions and data, and the [`LoaderBridge`] maps well-known names to
//! runtime addresses for [`crate::chunk::Link::ExternalLoader`] links.

use std::collections::BTreeMap;

use crate::chunk::{make_data_link, ChunkId, Link, Program};

/// Maps well-known loader names to runtime addresses.
#[derive(Debug, Default)]
pub struct LoaderBridge {
    addresses: BTreeMap<String, u64>,
}

impl LoaderBridge {
    pub fn new() -> LoaderBridge {
        LoaderBridge::default()
    }

    pub fn register<S: Into<String>>(&mut self, name: S, address: u64) {
        self.addresses.insert(name.into(), address);
    }

    /// The runtime address of `name`, zero if unregistered.
    pub fn get_address(&self, name: &str) -> u64 {
        self.addresses.get(name).copied().unwrap_or(0)
    }
}

/// Emulated definitions the loader supplies in place of a shared library.
#[derive(Debug, Default)]
pub struct LoaderEmulator {
    module: Option<ChunkId>,
    functions: BTreeMap<String, ChunkId>,
    data: BTreeMap<String, u64>,
}

impl LoaderEmulator {
    pub fn new() -> LoaderEmulator {
        LoaderEmulator::default()
    }

    /// The module owning the emulated data regions.
    pub fn set_module(&mut self, module: ChunkId) {
        self.module = Some(module);
    }

    pub fn register_function<S: Into<String>>(&mut self, name: S, function: ChunkId) {
        self.functions.insert(name.into(), function);
    }

    pub fn register_data<S: Into<String>>(&mut self, name: S, address: u64) {
        self.data.insert(name.into(), address);
    }

    /// A synthetic function registered for `name`.
    pub fn find_function(&self, name: &str) -> Option<ChunkId> {
        self.functions.get(name).copied()
    }

    /// A data link for the synthetic data registered under `name`.
    pub fn make_data_link(
        &self,
        name: &str,
        after_mapping: bool,
        program: &Program,
    ) -> Option<Link> {
        let module = self.module?;
        let mut address = self.data.get(name).copied()?;
        if after_mapping {
            if let Some(space) = program.module(module).elf_space() {
                address += space.base_address();
            }
        }
        make_data_link(program, module, address, true)
    }
}

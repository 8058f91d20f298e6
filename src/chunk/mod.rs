//! The analyzed-entity graph.
//!
//! A chunk is any analyzed entity with an address and a size: a module, a
//! function, a basic block, an instruction, a data section, a PLT trampoline,
//! a jump table, a GS table entry, a marker or a TLS data region. Chunks form
//! a tree by containment and are owned by a [`Program`] arena; everything
//! else refers to them through stable [`ChunkId`] handles, which is what
//! allows links to point back into the graph without ownership cycles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::elf::ElfSpace;
use crate::instr::InstructionSemantic;
use crate::loader::LoaderBridge;

mod link;
mod resolver;

pub use self::link::{
    make_data_link, make_marker_link, make_normal_link, Link, LinkScope,
};
pub use self::resolver::LinkResolver;

/// The address a chunk reports while it has no position assigned.
pub const ABSENT_POSITION: u64 = u64::MAX;

/// A stable handle to a chunk inside a [`Program`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ChunkId(usize);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Payload of a module chunk.
#[derive(Debug, Default)]
pub struct Module {
    library: String,
    dependencies: BTreeSet<String>,
    functions: Vec<ChunkId>,
    function_index: BTreeMap<u64, ChunkId>,
    named_functions: BTreeMap<String, ChunkId>,
    data_regions: Vec<ChunkId>,
    markers: Vec<ChunkId>,
    elf_space: Option<ElfSpace>,
}

impl Module {
    /// The library name this module was loaded as.
    pub fn library(&self) -> &str {
        &self.library
    }

    /// The libraries this module depends on.
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn add_dependency<S: Into<String>>(&mut self, library: S) {
        self.dependencies.insert(library.into());
    }

    pub fn functions(&self) -> &[ChunkId] {
        &self.functions
    }

    pub fn data_regions(&self) -> &[ChunkId] {
        &self.data_regions
    }

    pub fn markers(&self) -> &[ChunkId] {
        &self.markers
    }

    pub fn elf_space(&self) -> Option<&ElfSpace> {
        self.elf_space.as_ref()
    }

    pub fn set_elf_space(&mut self, space: ElfSpace) {
        self.elf_space = Some(space);
    }
}

#[derive(Debug, Default)]
pub struct Function {
    blocks: Vec<ChunkId>,
}

impl Function {
    pub fn blocks(&self) -> &[ChunkId] {
        &self.blocks
    }
}

#[derive(Debug, Default)]
pub struct Block {
    instructions: Vec<ChunkId>,
}

impl Block {
    pub fn instructions(&self) -> &[ChunkId] {
        &self.instructions
    }
}

#[derive(Debug)]
pub struct Instruction {
    semantic: InstructionSemantic,
}

impl Instruction {
    pub fn semantic(&self) -> &InstructionSemantic {
        &self.semantic
    }

    pub fn semantic_mut(&mut self) -> &mut InstructionSemantic {
        &mut self.semantic
    }
}

#[derive(Debug)]
pub struct PltTrampoline {
    external_symbol: Option<String>,
}

impl PltTrampoline {
    pub fn external_symbol(&self) -> Option<&str> {
        self.external_symbol.as_deref()
    }
}

#[derive(Debug)]
pub struct GsTableEntry {
    offset: u64,
    target: ChunkId,
}

impl GsTableEntry {
    /// The table offset a reference through this entry resolves to.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn target(&self) -> ChunkId {
        self.target
    }
}

#[derive(Debug)]
pub struct TlsDataRegion {
    tls_offset: u64,
}

impl TlsDataRegion {
    /// Offset of this region inside the thread-local storage image.
    pub fn tls_offset(&self) -> u64 {
        self.tls_offset
    }
}

/// The kind-specific payload of a chunk.
#[derive(Debug)]
pub enum ChunkKind {
    Module(Module),
    Function(Function),
    Block(Block),
    Instruction(Instruction),
    DataSection,
    PltTrampoline(PltTrampoline),
    JumpTable,
    GsTableEntry(GsTableEntry),
    Marker,
    TlsDataRegion(TlsDataRegion),
}

/// One analyzed entity.
#[derive(Debug)]
pub struct Chunk {
    parent: Option<ChunkId>,
    position: Option<u64>,
    size: u64,
    name: Option<String>,
    kind: ChunkKind,
}

impl Chunk {
    pub fn parent(&self) -> Option<ChunkId> {
        self.parent
    }

    /// The chunk's address, [`ABSENT_POSITION`] if none has been assigned.
    pub fn address(&self) -> u64 {
        self.position.unwrap_or(ABSENT_POSITION)
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = Some(position);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = Some(name.into());
    }

    pub fn kind(&self) -> &ChunkKind {
        &self.kind
    }

    pub fn contains(&self, address: u64) -> bool {
        match self.position {
            Some(position) => address >= position && address < position + self.size,
            None => false,
        }
    }

    /// The instruction semantic, for instruction chunks.
    pub fn semantic(&self) -> Option<&InstructionSemantic> {
        match &self.kind {
            ChunkKind::Instruction(instruction) => Some(instruction.semantic()),
            _ => None,
        }
    }
}

/// The arena owning every chunk of a loaded program.
#[derive(Debug, Default)]
pub struct Program {
    chunks: Vec<Chunk>,
    modules: Vec<ChunkId>,
    main: Option<ChunkId>,
    loader_bridge: LoaderBridge,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    fn new_chunk(&mut self, chunk: Chunk) -> ChunkId {
        let id = ChunkId(self.chunks.len());
        self.chunks.push(chunk);
        id
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.0]
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.chunks[id.0]
    }

    pub fn modules(&self) -> &[ChunkId] {
        &self.modules
    }

    /// The main executable's module.
    pub fn main(&self) -> Option<ChunkId> {
        self.main
    }

    pub fn set_main(&mut self, module: ChunkId) {
        self.main = Some(module);
    }

    pub fn loader_bridge(&self) -> &LoaderBridge {
        &self.loader_bridge
    }

    pub fn loader_bridge_mut(&mut self) -> &mut LoaderBridge {
        &mut self.loader_bridge
    }

    /// The module payload of a module chunk.
    ///
    /// Panics if `id` is not a module; module ids come from
    /// [`Program::add_module`].
    pub fn module(&self, id: ChunkId) -> &Module {
        match &self.chunk(id).kind {
            ChunkKind::Module(module) => module,
            kind => panic!("chunk {:?} is not a module: {:?}", id, kind),
        }
    }

    pub fn module_mut(&mut self, id: ChunkId) -> &mut Module {
        match &mut self.chunk_mut(id).kind {
            ChunkKind::Module(module) => module,
            kind => panic!("chunk is not a module: {:?}", kind),
        }
    }

    pub fn add_module<S: Into<String>>(&mut self, library: S) -> ChunkId {
        let library = library.into();
        let id = self.new_chunk(Chunk {
            parent: None,
            position: Some(0),
            size: 0,
            name: Some(library.clone()),
            kind: ChunkKind::Module(Module {
                library,
                ..Module::default()
            }),
        });
        self.modules.push(id);
        id
    }

    pub fn add_function<S: Into<String>>(
        &mut self,
        module: ChunkId,
        name: S,
        address: u64,
        size: u64,
    ) -> ChunkId {
        let name = name.into();
        let id = self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size,
            name: Some(name.clone()),
            kind: ChunkKind::Function(Function::default()),
        });
        let module = self.module_mut(module);
        module.functions.push(id);
        module.function_index.insert(address, id);
        module.named_functions.insert(name, id);
        id
    }

    pub fn add_block(&mut self, function: ChunkId, address: u64, size: u64) -> ChunkId {
        let id = self.new_chunk(Chunk {
            parent: Some(function),
            position: Some(address),
            size,
            name: None,
            kind: ChunkKind::Block(Block::default()),
        });
        match &mut self.chunk_mut(function).kind {
            ChunkKind::Function(function) => function.blocks.push(id),
            kind => panic!("chunk is not a function: {:?}", kind),
        }
        id
    }

    pub fn add_instruction(
        &mut self,
        block: ChunkId,
        address: u64,
        semantic: InstructionSemantic,
    ) -> ChunkId {
        let size = semantic.size() as u64;
        let id = self.new_chunk(Chunk {
            parent: Some(block),
            position: Some(address),
            size,
            name: None,
            kind: ChunkKind::Instruction(Instruction { semantic }),
        });
        match &mut self.chunk_mut(block).kind {
            ChunkKind::Block(block) => block.instructions.push(id),
            kind => panic!("chunk is not a block: {:?}", kind),
        }
        id
    }

    pub fn add_data_section<S: Into<String>>(
        &mut self,
        module: ChunkId,
        name: S,
        address: u64,
        size: u64,
    ) -> ChunkId {
        let id = self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size,
            name: Some(name.into()),
            kind: ChunkKind::DataSection,
        });
        self.module_mut(module).data_regions.push(id);
        id
    }

    pub fn add_tls_data_region(
        &mut self,
        module: ChunkId,
        address: u64,
        size: u64,
        tls_offset: u64,
    ) -> ChunkId {
        let id = self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size,
            name: None,
            kind: ChunkKind::TlsDataRegion(TlsDataRegion { tls_offset }),
        });
        self.module_mut(module).data_regions.push(id);
        id
    }

    pub fn add_marker(&mut self, module: ChunkId, address: u64) -> ChunkId {
        let id = self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size: 0,
            name: None,
            kind: ChunkKind::Marker,
        });
        self.module_mut(module).markers.push(id);
        id
    }

    /// An existing marker at `address` in `module`, if any.
    pub fn find_marker(&self, module: ChunkId, address: u64) -> Option<ChunkId> {
        self.module(module)
            .markers
            .iter()
            .copied()
            .find(|&marker| self.chunk(marker).position == Some(address))
    }

    pub fn add_plt_trampoline<S: Into<String>>(
        &mut self,
        module: ChunkId,
        address: u64,
        size: u64,
        external_symbol: Option<S>,
    ) -> ChunkId {
        self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size,
            name: None,
            kind: ChunkKind::PltTrampoline(PltTrampoline {
                external_symbol: external_symbol.map(Into::into),
            }),
        })
    }

    pub fn add_jump_table(&mut self, module: ChunkId, address: u64, size: u64) -> ChunkId {
        self.new_chunk(Chunk {
            parent: Some(module),
            position: Some(address),
            size,
            name: None,
            kind: ChunkKind::JumpTable,
        })
    }

    pub fn add_gs_table_entry(&mut self, offset: u64, target: ChunkId) -> ChunkId {
        self.new_chunk(Chunk {
            parent: None,
            position: None,
            size: 0,
            name: None,
            kind: ChunkKind::GsTableEntry(GsTableEntry { offset, target }),
        })
    }

    /// The blocks of a function chunk, empty for any other kind.
    pub fn function_blocks(&self, function: ChunkId) -> &[ChunkId] {
        match &self.chunk(function).kind {
            ChunkKind::Function(function) => &function.blocks,
            _ => &[],
        }
    }

    /// The instructions of a block chunk, empty for any other kind.
    pub fn block_instructions(&self, block: ChunkId) -> &[ChunkId] {
        match &self.chunk(block).kind {
            ChunkKind::Block(block) => &block.instructions,
            _ => &[],
        }
    }

    /// The function of `module` containing `address`, if any.
    pub fn find_function_containing(&self, module: ChunkId, address: u64) -> Option<ChunkId> {
        let (_, &function) = self
            .module(module)
            .function_index
            .range(..=address)
            .next_back()?;
        if self.chunk(function).contains(address) {
            Some(function)
        } else {
            None
        }
    }

    /// The function of `module` whose head is exactly `address`.
    pub fn find_function_at(&self, module: ChunkId, address: u64) -> Option<ChunkId> {
        self.module(module).function_index.get(&address).copied()
    }

    pub fn find_named_function(&self, module: ChunkId, name: &str) -> Option<ChunkId> {
        self.module(module).named_functions.get(name).copied()
    }

    /// The instruction of `function` containing `address`, if any.
    pub fn find_instruction_containing_in(
        &self,
        function: ChunkId,
        address: u64,
    ) -> Option<ChunkId> {
        let blocks = match &self.chunk(function).kind {
            ChunkKind::Function(function) => &function.blocks,
            _ => return None,
        };
        for &block in blocks {
            if !self.chunk(block).contains(address) {
                continue;
            }
            if let ChunkKind::Block(block) = &self.chunk(block).kind {
                for &instruction in &block.instructions {
                    if self.chunk(instruction).contains(address) {
                        return Some(instruction);
                    }
                }
            }
        }
        None
    }

    /// The instruction of any function of `module` containing `address`.
    pub fn find_instruction_containing(&self, module: ChunkId, address: u64) -> Option<ChunkId> {
        let function = self.find_function_containing(module, address)?;
        self.find_instruction_containing_in(function, address)
    }

    /// The innermost chunk of `function` positioned exactly at `address`.
    pub fn find_innermost_at(&self, function: ChunkId, address: u64) -> Option<ChunkId> {
        let instruction = self.find_instruction_containing_in(function, address)?;
        if self.chunk(instruction).position == Some(address) {
            Some(instruction)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::InstructionSemantic;

    fn raw(bytes: &[u8]) -> InstructionSemantic {
        InstructionSemantic::Raw {
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn spatial_function_lookup() {
        let mut program = Program::new();
        let module = program.add_module("libtest.so");
        let f0 = program.add_function(module, "alpha", 0x1000, 0x20);
        let f1 = program.add_function(module, "beta", 0x1040, 0x10);

        assert_eq!(program.find_function_at(module, 0x1000), Some(f0));
        assert_eq!(program.find_function_containing(module, 0x1008), Some(f0));
        assert_eq!(program.find_function_containing(module, 0x1020), None);
        assert_eq!(program.find_function_containing(module, 0x104c), Some(f1));
        assert_eq!(program.find_named_function(module, "beta"), Some(f1));
    }

    #[test]
    fn instruction_lookup_descends_containment() {
        let mut program = Program::new();
        let module = program.add_module("libtest.so");
        let function = program.add_function(module, "alpha", 0x1000, 0x10);
        let block = program.add_block(function, 0x1000, 0x10);
        let i0 = program.add_instruction(block, 0x1000, raw(&[0; 4]));
        let i1 = program.add_instruction(block, 0x1004, raw(&[0; 4]));

        assert_eq!(program.find_instruction_containing(module, 0x1002), Some(i0));
        assert_eq!(program.find_innermost_at(function, 0x1004), Some(i1));
        assert_eq!(program.find_innermost_at(function, 0x1006), None);
        assert_eq!(program.chunk(i1).parent(), Some(block));
    }

    #[test]
    fn absent_position_reports_sentinel() {
        let mut program = Program::new();
        let module = program.add_module("libtest.so");
        let f = program.add_function(module, "f", 0x1000, 4);
        let entry = program.add_gs_table_entry(0x10, f);
        assert_eq!(program.chunk(entry).address(), ABSENT_POSITION);
    }
}

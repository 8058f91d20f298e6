//! The tagged archive codec for instruction semantics and links.
//!
//! Cross-references are written as chunk IDs handed out by an
//! [`ArchiveOperations`] oracle, so an archive never embeds raw pointers or
//! addresses for chunks; readers redirect IDs back to live chunks through
//! the same oracle.

use std::collections::BTreeMap;

use crate::chunk::ChunkId;

mod instr;
mod stream;

pub use self::instr::InstrSerializer;
pub use self::stream::{ArchiveStreamReader, ArchiveStreamWriter};

/// A chunk ID inside an archive.
pub type ArchiveId = u32;

/// The ID written for a null reference.
pub const NONE_ID: ArchiveId = ArchiveId::MAX;

/// Assigns stable archive IDs to chunks and resolves them back.
pub trait ArchiveOperations {
    /// Assigns (or returns the already-assigned) ID for `chunk`;
    /// [`NONE_ID`] for `None`.
    fn assign(&mut self, chunk: Option<ChunkId>) -> ArchiveId;

    /// The chunk behind `id`, if the archive knows it.
    fn lookup(&self, id: ArchiveId) -> Option<ChunkId>;
}

/// A plain in-memory ID table.
#[derive(Debug, Default)]
pub struct FlatIdMap {
    forward: BTreeMap<ChunkId, ArchiveId>,
    backward: BTreeMap<ArchiveId, ChunkId>,
}

impl FlatIdMap {
    pub fn new() -> FlatIdMap {
        FlatIdMap::default()
    }
}

impl ArchiveOperations for FlatIdMap {
    fn assign(&mut self, chunk: Option<ChunkId>) -> ArchiveId {
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => return NONE_ID,
        };
        if let Some(&id) = self.forward.get(&chunk) {
            return id;
        }
        let id = self.forward.len() as ArchiveId;
        self.forward.insert(chunk, id);
        self.backward.insert(id, chunk);
        id
    }

    fn lookup(&self, id: ArchiveId) -> Option<ChunkId> {
        self.backward.get(&id).copied()
    }
}

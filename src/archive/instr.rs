//! The instruction-semantic and link codec.
//!
//! One byte of semantic tag, a length-prefixed copy of the raw instruction
//! bytes, then tag-specific payload: linked instructions carry a serialized
//! link and an operand index, control flow instructions carry a link.
//! Reading mirrors writing, rebuilding semantics by re-disassembling the
//! stored bytes and redirecting link IDs through the oracle. Unknown tags
//! and disassembly failures degrade to placeholders instead of aborting, so
//! newer archives stay loadable.

use crate::chunk::{ChunkId, Link, LinkScope, Program, ABSENT_POSITION};
use crate::error::{Error, Result};
use crate::instr::{disasm, Assembly, InstructionSemantic};

use super::stream::{ArchiveStreamReader, ArchiveStreamWriter};
use super::{ArchiveOperations, NONE_ID};

mod instr_tag {
    pub const RAW: u8 = 1;
    pub const ISOLATED: u8 = 2;
    pub const LINKED: u8 = 3;
    pub const CONTROL_FLOW: u8 = 4;
    pub const RETURN: u8 = 5;
    pub const INDIRECT_JUMP: u8 = 6;
    pub const INDIRECT_CALL: u8 = 7;
    pub const STACK_FRAME: u8 = 8;
    pub const LITERAL: u8 = 9;
    pub const LINKED_LITERAL: u8 = 10;
}

mod link_tag {
    pub const UNKNOWN: u8 = 0;
    pub const EXTERNAL_ABSOLUTE_NORMAL: u8 = 1;
    pub const EXTERNAL_NORMAL: u8 = 2;
    pub const ABSOLUTE_NORMAL: u8 = 3;
    pub const NORMAL: u8 = 4;
    pub const EXTERNAL_OFFSET: u8 = 5;
    pub const OFFSET: u8 = 6;
    pub const PLT: u8 = 7;
    pub const JUMP_TABLE: u8 = 8;
    pub const SYMBOL_ONLY: u8 = 9;
    pub const MARKER: u8 = 10;
    pub const ABSOLUTE_DATA: u8 = 11;
    pub const DATA_OFFSET: u8 = 12;
    pub const TLS_DATA_OFFSET: u8 = 13;
    pub const UNRESOLVED: u8 = 14;
}

/// Serializes instruction semantics against an ID oracle.
pub struct InstrSerializer<'a, T: ArchiveOperations> {
    ops: &'a mut T,
}

impl<'a, T: ArchiveOperations> InstrSerializer<'a, T> {
    pub fn new(ops: &'a mut T) -> InstrSerializer<'a, T> {
        InstrSerializer { ops }
    }

    pub fn serialize(
        &mut self,
        semantic: &InstructionSemantic,
        program: &Program,
        writer: &mut ArchiveStreamWriter,
    ) -> Result<()> {
        let tag = match semantic {
            InstructionSemantic::Raw { .. } => instr_tag::RAW,
            InstructionSemantic::Isolated { .. } => instr_tag::ISOLATED,
            InstructionSemantic::Linked { .. } => instr_tag::LINKED,
            InstructionSemantic::ControlFlow { .. } => instr_tag::CONTROL_FLOW,
            InstructionSemantic::Return { .. } => instr_tag::RETURN,
            InstructionSemantic::IndirectJump { .. } => instr_tag::INDIRECT_JUMP,
            InstructionSemantic::IndirectCall { .. } => instr_tag::INDIRECT_CALL,
            InstructionSemantic::StackFrame { .. } => instr_tag::STACK_FRAME,
            InstructionSemantic::Literal { .. } => instr_tag::LITERAL,
            InstructionSemantic::LinkedLiteral { .. } => instr_tag::LINKED_LITERAL,
        };
        writer.write_u8(tag);
        writer.write_bytes(semantic.bytes())?;

        match semantic {
            InstructionSemantic::Linked { link, index, .. } => {
                self.write_link(link, program, writer);
                writer.write_u8(*index);
            }
            InstructionSemantic::ControlFlow { link, .. } => {
                self.write_link(link, program, writer);
            }
            _ => {}
        }
        Ok(())
    }

    fn write_link(&mut self, link: &Link, program: &Program, writer: &mut ArchiveStreamWriter) {
        match link {
            Link::Normal { target, scope } => {
                let tag = if scope.is_external() {
                    link_tag::EXTERNAL_NORMAL
                } else {
                    link_tag::NORMAL
                };
                writer.write_u8(tag);
                writer.write_id(self.ops.assign(Some(*target)));
            }
            Link::AbsoluteNormal { target, scope } => {
                let tag = if scope.is_external() {
                    link_tag::EXTERNAL_ABSOLUTE_NORMAL
                } else {
                    link_tag::ABSOLUTE_NORMAL
                };
                writer.write_u8(tag);
                writer.write_id(self.ops.assign(Some(*target)));
            }
            Link::Offset { target, .. } => {
                writer.write_u8(link_tag::OFFSET);
                writer.write_id(self.ops.assign(Some(*target)));
                let delta = link.target_address(program) - program.chunk(*target).address();
                writer.write_u64(delta);
            }
            Link::ExternalOffset { target, .. } => {
                writer.write_u8(link_tag::EXTERNAL_OFFSET);
                writer.write_id(self.ops.assign(Some(*target)));
                let delta = link.target_address(program) - program.chunk(*target).address();
                writer.write_u64(delta);
            }
            Link::Plt { trampoline } => {
                writer.write_u8(link_tag::PLT);
                writer.write_id(self.ops.assign(Some(*trampoline)));
            }
            Link::JumpTable { .. } => writer.write_u8(link_tag::JUMP_TABLE),
            Link::SymbolOnly { .. } => writer.write_u8(link_tag::SYMBOL_ONLY),
            Link::Marker { .. } => writer.write_u8(link_tag::MARKER),
            Link::AbsoluteData { .. } => writer.write_u8(link_tag::ABSOLUTE_DATA),
            Link::DataOffset { section, .. } => {
                writer.write_u8(link_tag::DATA_OFFSET);
                writer.write_id(self.ops.assign(Some(*section)));
                let delta = link.target_address(program) - program.chunk(*section).address();
                writer.write_u64(delta);
            }
            Link::TlsDataOffset { .. } => writer.write_u8(link_tag::TLS_DATA_OFFSET),
            Link::Unresolved { .. } => writer.write_u8(link_tag::UNRESOLVED),
            Link::GsTable { .. } | Link::Distance { .. } | Link::ExternalLoader { .. } => {
                writer.write_u8(link_tag::UNKNOWN)
            }
        }
    }

    pub fn deserialize(
        &mut self,
        address: u64,
        reader: &mut ArchiveStreamReader,
        program: &mut Program,
    ) -> Result<InstructionSemantic> {
        let tag = reader.read_u8()?;

        match tag {
            instr_tag::RAW
            | instr_tag::ISOLATED
            | instr_tag::RETURN
            | instr_tag::INDIRECT_JUMP
            | instr_tag::INDIRECT_CALL
            | instr_tag::LINKED_LITERAL => self.default_deserialize(address, reader),
            instr_tag::LINKED => {
                let semantic = self.default_deserialize(address, reader)?;
                let link = self.deserialize_link(reader, program)?;
                let index = reader.read_u8()?;
                Ok(match into_assembly(semantic) {
                    Ok(assembly) => InstructionSemantic::Linked {
                        assembly,
                        link,
                        index,
                    },
                    Err(raw) => raw,
                })
            }
            instr_tag::CONTROL_FLOW => {
                let semantic = self.default_deserialize(address, reader)?;
                let link = self.deserialize_link(reader, program)?;
                Ok(match into_assembly(semantic) {
                    Ok(assembly) => InstructionSemantic::ControlFlow { assembly, link },
                    Err(raw) => raw,
                })
            }
            instr_tag::LITERAL => {
                let bytes = reader.read_bytes()?;
                Ok(InstructionSemantic::Literal { bytes })
            }
            instr_tag::STACK_FRAME => Err(Error::UnsupportedArchiveTag(tag)),
            _ => {
                warn!("unknown instruction tag {} in archive", tag);
                let bytes = reader.read_bytes().unwrap_or_default();
                Ok(InstructionSemantic::Raw { bytes })
            }
        }
    }

    fn default_deserialize(
        &mut self,
        address: u64,
        reader: &mut ArchiveStreamReader,
    ) -> Result<InstructionSemantic> {
        let bytes = reader.read_bytes()?;
        match disasm::disassemble(&bytes, address) {
            Ok(semantic) => Ok(semantic),
            Err(error) => {
                warn!("disassembly error at {:#x}: {}", address, error);
                Ok(InstructionSemantic::Raw { bytes })
            }
        }
    }

    fn deserialize_link(
        &mut self,
        reader: &mut ArchiveStreamReader,
        program: &mut Program,
    ) -> Result<Link> {
        let tag = reader.read_u8()?;

        let link = match tag {
            link_tag::EXTERNAL_ABSOLUTE_NORMAL => {
                match self.deserialize_link_target(reader, program)? {
                    Some(target) => Link::AbsoluteNormal {
                        target,
                        scope: LinkScope::ExternalCode,
                    },
                    None => Link::Unresolved { address: 0 },
                }
            }
            link_tag::EXTERNAL_NORMAL => match self.deserialize_link_target(reader, program)? {
                Some(target) => Link::Normal {
                    target,
                    scope: LinkScope::ExternalCode,
                },
                None => Link::Unresolved { address: 0 },
            },
            link_tag::ABSOLUTE_NORMAL => match self.deserialize_link_target(reader, program)? {
                Some(target) => Link::AbsoluteNormal {
                    target,
                    scope: LinkScope::WithinModule,
                },
                None => Link::Unresolved { address: 0 },
            },
            link_tag::NORMAL => match self.deserialize_link_target(reader, program)? {
                Some(target) => Link::Normal {
                    target,
                    scope: LinkScope::WithinModule,
                },
                None => Link::Unresolved { address: 0 },
            },
            link_tag::EXTERNAL_OFFSET => {
                let target = self.deserialize_link_target(reader, program)?;
                let offset = reader.read_u64()?;
                match target {
                    Some(target) => Link::ExternalOffset { target, offset },
                    None => Link::Unresolved { address: 0 },
                }
            }
            link_tag::OFFSET => {
                let target = self.deserialize_link_target(reader, program)?;
                let offset = reader.read_u64()?;
                match target {
                    Some(target) => Link::Offset { target, offset },
                    None => Link::Unresolved { address: 0 },
                }
            }
            link_tag::PLT => match self.deserialize_link_target(reader, program)? {
                Some(trampoline) => Link::Plt { trampoline },
                None => Link::Unresolved { address: 0 },
            },
            link_tag::DATA_OFFSET => {
                let section = self.deserialize_link_target(reader, program)?;
                let offset = reader.read_u64()?;
                match section {
                    Some(section) => Link::DataOffset {
                        section,
                        offset,
                        addend: 0,
                    },
                    None => Link::Unresolved { address: 0 },
                }
            }
            link_tag::JUMP_TABLE
            | link_tag::SYMBOL_ONLY
            | link_tag::MARKER
            | link_tag::ABSOLUTE_DATA
            | link_tag::TLS_DATA_OFFSET
            | link_tag::UNRESOLVED
            | link_tag::UNKNOWN => Link::Unresolved { address: 0 },
            _ => {
                warn!("unknown link tag {} in archive", tag);
                Link::Unresolved { address: 0 }
            }
        };
        Ok(link)
    }

    /// Reads a link target ID and redirects it to a live chunk.
    ///
    /// A looked-up chunk that has no position yet receives the absent
    /// sentinel; addresses are never fabricated here.
    fn deserialize_link_target(
        &mut self,
        reader: &mut ArchiveStreamReader,
        program: &mut Program,
    ) -> Result<Option<ChunkId>> {
        let id = reader.read_id()?;
        if id == NONE_ID {
            return Ok(None);
        }
        let target = match self.ops.lookup(id) {
            Some(target) => target,
            None => return Ok(None),
        };
        if program.chunk(target).position().is_none() {
            program.chunk_mut(target).set_position(ABSENT_POSITION);
        }
        Ok(Some(target))
    }
}

/// The assembly of a decoded semantic, or the semantic itself (as raw
/// bytes) when there is none to reuse.
fn into_assembly(semantic: InstructionSemantic) -> ::std::result::Result<Assembly, InstructionSemantic> {
    match semantic {
        InstructionSemantic::Isolated { assembly }
        | InstructionSemantic::Linked { assembly, .. }
        | InstructionSemantic::ControlFlow { assembly, .. }
        | InstructionSemantic::Return { assembly }
        | InstructionSemantic::IndirectJump { assembly }
        | InstructionSemantic::IndirectCall { assembly }
        | InstructionSemantic::StackFrame { assembly } => Ok(assembly),
        semantic => Err(semantic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FlatIdMap;
    use crate::chunk::Program;
    use crate::instr::disasm::disassemble;

    const BL_SELF: [u8; 4] = [0x00, 0x00, 0x00, 0x94];
    const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];

    #[test]
    fn control_flow_byte_layout_and_round_trip() {
        let mut program = Program::new();
        let module = program.add_module("m");
        let function = program.add_function(module, "f", 0x1000, 0x40);

        let mut semantic = disassemble(&BL_SELF, 0x2000).unwrap();
        semantic.set_link(Link::Normal {
            target: function,
            scope: LinkScope::WithinModule,
        });

        let mut ops = FlatIdMap::new();
        let mut writer = ArchiveStreamWriter::new();
        InstrSerializer::new(&mut ops)
            .serialize(&semantic, &program, &mut writer)
            .unwrap();

        // tag, length, four instruction bytes, link tag, four ID bytes.
        let data = writer.into_vec();
        assert_eq!(data[0], instr_tag::CONTROL_FLOW);
        assert_eq!(data[1], 4);
        assert_eq!(&data[2..6], &BL_SELF);
        assert_eq!(data[6], link_tag::NORMAL);
        assert_eq!(&data[7..11], &0u32.to_le_bytes());
        assert_eq!(data.len(), 11);

        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x2000, &mut reader, &mut program)
            .unwrap();
        assert!(reader.at_end());
        assert_eq!(rebuilt.bytes(), &BL_SELF);
        match rebuilt {
            InstructionSemantic::ControlFlow { link, .. } => {
                assert_eq!(
                    link,
                    Link::Normal {
                        target: function,
                        scope: LinkScope::WithinModule,
                    }
                );
            }
            other => panic!("expected control flow semantic, got {:?}", other),
        }
    }

    #[test]
    fn offset_links_store_the_delta() {
        let mut program = Program::new();
        let module = program.add_module("m");
        let function = program.add_function(module, "f", 0x1000, 0x40);

        let mut semantic = disassemble(&BL_SELF, 0x2000).unwrap();
        semantic.set_link(Link::Offset {
            target: function,
            offset: 0x18,
        });

        let mut ops = FlatIdMap::new();
        let mut writer = ArchiveStreamWriter::new();
        InstrSerializer::new(&mut ops)
            .serialize(&semantic, &program, &mut writer)
            .unwrap();

        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x2000, &mut reader, &mut program)
            .unwrap();
        match rebuilt {
            InstructionSemantic::ControlFlow { link, .. } => {
                assert_eq!(
                    link,
                    Link::Offset {
                        target: function,
                        offset: 0x18,
                    }
                );
                assert_eq!(link.target_address(&program), 0x1018);
            }
            other => panic!("expected control flow semantic, got {:?}", other),
        }
    }

    #[test]
    fn isolated_round_trip_preserves_bytes() {
        let mut program = Program::new();
        let semantic = disassemble(&NOP, 0x1000).unwrap();

        let mut ops = FlatIdMap::new();
        let mut writer = ArchiveStreamWriter::new();
        InstrSerializer::new(&mut ops)
            .serialize(&semantic, &program, &mut writer)
            .unwrap();
        let data = writer.into_vec();
        assert_eq!(data[0], instr_tag::ISOLATED);

        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x1000, &mut reader, &mut program)
            .unwrap();
        assert!(matches!(rebuilt, InstructionSemantic::Isolated { .. }));
        assert_eq!(rebuilt.bytes(), &NOP);
    }

    #[test]
    fn literal_round_trips_without_disassembly() {
        let mut program = Program::new();
        let semantic = InstructionSemantic::Literal {
            bytes: vec![0xef, 0xbe, 0xad, 0xde],
        };

        let mut ops = FlatIdMap::new();
        let mut writer = ArchiveStreamWriter::new();
        InstrSerializer::new(&mut ops)
            .serialize(&semantic, &program, &mut writer)
            .unwrap();

        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x1000, &mut reader, &mut program)
            .unwrap();
        match rebuilt {
            InstructionSemantic::Literal { bytes } => {
                assert_eq!(bytes, vec![0xef, 0xbe, 0xad, 0xde])
            }
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn undecodable_bytes_degrade_to_raw() {
        let mut program = Program::new();
        let semantic = InstructionSemantic::Raw {
            bytes: vec![0xaa, 0xbb],
        };

        let mut ops = FlatIdMap::new();
        let mut writer = ArchiveStreamWriter::new();
        InstrSerializer::new(&mut ops)
            .serialize(&semantic, &program, &mut writer)
            .unwrap();

        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x1000, &mut reader, &mut program)
            .unwrap();
        match rebuilt {
            InstructionSemantic::Raw { bytes } => assert_eq!(bytes, vec![0xaa, 0xbb]),
            other => panic!("expected raw placeholder, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tags_become_placeholders() {
        let mut program = Program::new();

        // Unknown instruction tag.
        let mut writer = ArchiveStreamWriter::new();
        writer.write_u8(0x7f);
        writer.write_bytes(&NOP).unwrap();
        let data = writer.into_vec();
        let mut ops = FlatIdMap::new();
        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x1000, &mut reader, &mut program)
            .unwrap();
        assert!(matches!(rebuilt, InstructionSemantic::Raw { .. }));

        // Unknown link tag inside a control flow record.
        let mut writer = ArchiveStreamWriter::new();
        writer.write_u8(instr_tag::CONTROL_FLOW);
        writer.write_bytes(&BL_SELF).unwrap();
        writer.write_u8(0x7f);
        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        let rebuilt = InstrSerializer::new(&mut ops)
            .deserialize(0x2000, &mut reader, &mut program)
            .unwrap();
        match rebuilt {
            InstructionSemantic::ControlFlow { link, .. } => {
                assert_eq!(link, Link::Unresolved { address: 0 })
            }
            other => panic!("expected control flow semantic, got {:?}", other),
        }
    }

    #[test]
    fn positionless_targets_receive_the_sentinel() {
        let mut program = Program::new();
        let module = program.add_module("m");
        let function = program.add_function(module, "f", 0x1000, 0x10);
        let entry = program.add_gs_table_entry(0x8, function);
        assert_eq!(program.chunk(entry).position(), None);

        let mut ops = FlatIdMap::new();
        let id = ops.assign(Some(entry));

        let mut writer = ArchiveStreamWriter::new();
        writer.write_u8(link_tag::NORMAL);
        writer.write_id(id);
        let data = writer.into_vec();
        let mut reader = ArchiveStreamReader::new(&data);
        let link = InstrSerializer::new(&mut ops)
            .deserialize_link(&mut reader, &mut program)
            .unwrap();

        assert_eq!(link.target(), Some(entry));
        assert_eq!(program.chunk(entry).position(), Some(ABSENT_POSITION));
    }
}

//! An intra-function control flow graph.
//!
//! Nodes wrap basic blocks; edges follow branch semantics. The use-def
//! engine only ever consumes the graph (node lookup, backward links, block
//! contents), so construction is either driven by a caller that already
//! knows the edges, or recovered from decoded branch semantics with
//! [`ControlFlowGraph::build`].

use crate::chunk::{ChunkId, Program};
use crate::error::{Error, Result};
use crate::instr::disasm::is_conditional_branch;
use crate::instr::InstructionSemantic;
use std::collections::BTreeMap;

pub type NodeId = usize;

/// One node of the graph, wrapping a basic block.
#[derive(Clone, Debug)]
pub struct ControlFlowNode {
    id: NodeId,
    block: ChunkId,
    links: Vec<NodeId>,
    backward_links: Vec<NodeId>,
}

impl ControlFlowNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The basic block chunk this node wraps.
    pub fn block(&self) -> ChunkId {
        self.block
    }

    pub fn links(&self) -> &[NodeId] {
        &self.links
    }

    pub fn backward_links(&self) -> &[NodeId] {
        &self.backward_links
    }
}

#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    nodes: Vec<ControlFlowNode>,
}

impl ControlFlowGraph {
    pub fn new() -> ControlFlowGraph {
        ControlFlowGraph::default()
    }

    pub fn add_node(&mut self, block: ChunkId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(ControlFlowNode {
            id,
            block,
            links: Vec::new(),
            backward_links: Vec::new(),
        });
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if !self.nodes[from].links.contains(&to) {
            self.nodes[from].links.push(to);
            self.nodes[to].backward_links.push(from);
        }
    }

    pub fn get(&self, id: NodeId) -> Result<&ControlFlowNode> {
        self.nodes.get(id).ok_or(Error::GraphNodeNotFound(id))
    }

    pub fn nodes(&self) -> &[ControlFlowNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recovers the graph of `function` from its branch semantics.
    ///
    /// Direct branch targets inside the function become edges; conditional
    /// branches and calls also fall through; returns and indirect jumps
    /// terminate flow.
    pub fn build(program: &Program, function: ChunkId) -> ControlFlowGraph {
        let mut graph = ControlFlowGraph::new();
        let blocks = program.function_blocks(function);

        let mut heads: BTreeMap<u64, NodeId> = BTreeMap::new();
        for &block in blocks {
            let node = graph.add_node(block);
            heads.insert(program.chunk(block).address(), node);
        }

        for (index, &block) in blocks.iter().enumerate() {
            let node = index;
            let last = match program.block_instructions(block).last() {
                Some(&instruction) => instruction,
                None => continue,
            };
            let fallthrough = index + 1 < blocks.len();

            match program.chunk(last).semantic() {
                Some(InstructionSemantic::ControlFlow { assembly, link }) => {
                    let target = link.target_address(program);
                    if let Some(&successor) = heads.get(&target) {
                        graph.add_edge(node, successor);
                    }
                    let falls = is_conditional_branch(assembly.id())
                        || assembly.id() == bad64::Op::BL;
                    if falls && fallthrough {
                        graph.add_edge(node, node + 1);
                    }
                }
                Some(InstructionSemantic::Return { .. })
                | Some(InstructionSemantic::IndirectJump { .. }) => {}
                _ => {
                    if fallthrough {
                        graph.add_edge(node, node + 1);
                    }
                }
            }
        }

        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Link, Program};
    use crate::instr::disasm::disassemble;

    const RET: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];
    const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];

    #[test]
    fn manual_edges_track_backward_links() {
        let mut program = Program::new();
        let module = program.add_module("m");
        let f = program.add_function(module, "f", 0x1000, 0x10);
        let b0 = program.add_block(f, 0x1000, 0x8);
        let b1 = program.add_block(f, 0x1008, 0x8);

        let mut cfg = ControlFlowGraph::new();
        let n0 = cfg.add_node(b0);
        let n1 = cfg.add_node(b1);
        cfg.add_edge(n0, n1);
        cfg.add_edge(n0, n1);

        assert_eq!(cfg.get(n1).unwrap().backward_links(), &[n0]);
        assert_eq!(cfg.get(n0).unwrap().links(), &[n1]);
        assert!(cfg.get(7).is_err());
    }

    #[test]
    fn build_recovers_branch_edges() {
        let mut program = Program::new();
        let module = program.add_module("m");
        let f = program.add_function(module, "f", 0x1000, 0x10);

        // b0 ends in an unconditional branch to b2, skipping b1.
        let b0 = program.add_block(f, 0x1000, 0x4);
        let b1 = program.add_block(f, 0x1004, 0x4);
        let b2 = program.add_block(f, 0x1008, 0x8);

        let mut branch = disassemble(&[0x02, 0x00, 0x00, 0x14], 0x1000).unwrap();
        branch.set_link(Link::Unresolved { address: 0x1008 });
        program.add_instruction(b0, 0x1000, branch);
        program.add_instruction(b1, 0x1004, disassemble(&NOP, 0x1004).unwrap());
        program.add_instruction(b2, 0x1008, disassemble(&NOP, 0x1008).unwrap());
        program.add_instruction(b2, 0x100c, disassemble(&RET, 0x100c).unwrap());

        let cfg = ControlFlowGraph::build(&program, f);
        assert_eq!(cfg.len(), 3);
        assert_eq!(cfg.get(0).unwrap().links(), &[2]);
        assert_eq!(cfg.get(1).unwrap().links(), &[2]);
        assert_eq!(cfg.get(2).unwrap().links(), &[] as &[NodeId]);
        assert_eq!(cfg.get(2).unwrap().backward_links(), &[0, 1]);
    }
}

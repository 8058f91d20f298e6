//! Use-def dataflow analysis over decoded AArch64 instructions.
//!
//! For every analyzed instruction the engine records which symbolic
//! expression each of its outputs takes ([`DefList`]) and which earlier
//! instructions supplied each register and memory value it consumes
//! ([`RefList`], memory reference lists). Definitions still live on exit of
//! a node are propagated forward across edges as "exposed" sets.
//!
//! The driver walks the graph in an order supplied by the caller, grouped
//! into strongly connected regions. Each group is analyzed once, and a group
//! of more than one node is analyzed a second time. This two-pass
//! approximation deliberately bounds analysis time; callers that need a
//! fixed point assert convergence themselves.

use bad64::Op;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

use crate::arch::aarch64::{
    convert_to_physical, width_of, RegId, ARGUMENT_REGISTERS, INVALID_REGISTER, NZCV,
};
use crate::chunk::{ChunkId, Program};
use crate::error::{Error, Result};
use crate::instr::{Assembly, OperandMode};
use crate::tree::{shift_extend, MemLocation, TreeFactory, TreeRef};

use super::control_flow::{ControlFlowGraph, ControlFlowNode, NodeId};

/// Index of a [`UDState`] inside its [`UseDefWorkSet`].
pub type StateId = usize;

/// Register definitions: at most one tree per register.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DefList {
    list: BTreeMap<RegId, Option<TreeRef>>,
}

impl DefList {
    /// Overwrites any previous definition of `reg`.
    pub fn set(&mut self, reg: RegId, tree: Option<TreeRef>) {
        self.list.insert(reg, tree);
    }

    pub fn get(&self, reg: RegId) -> Option<TreeRef> {
        self.list.get(&reg).copied().flatten()
    }

    /// True if `reg` was defined, even to an unknown value.
    pub fn defines(&self, reg: RegId) -> bool {
        self.list.contains_key(&reg)
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegId, Option<TreeRef>)> + '_ {
        self.list.iter().map(|(&reg, &tree)| (reg, tree))
    }

    pub fn dump(&self, trees: &TreeFactory) {
        for (reg, tree) in self.iter() {
            match tree {
                Some(tree) => trace!("R{}:  {}", reg, trees.display(tree)),
                None => trace!("R{}:  -", reg),
            }
        }
    }
}

/// Register references: the states that supplied each register's value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefList {
    list: BTreeMap<RegId, Vec<StateId>>,
}

impl RefList {
    /// Replaces the origin set of `reg` with exactly `origin`.
    pub fn set(&mut self, reg: RegId, origin: StateId) {
        self.list.insert(reg, vec![origin]);
    }

    /// Appends `origin`, deduplicating by state identity.
    pub fn add(&mut self, reg: RegId, origin: StateId) {
        let origins = self.list.entry(reg).or_insert_with(Vec::new);
        if !origins.contains(&origin) {
            origins.push(origin);
        }
    }

    pub fn del(&mut self, reg: RegId) {
        self.list.remove(&reg);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn get(&self, reg: RegId) -> Option<&[StateId]> {
        self.list.get(&reg).map(|origins| origins.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegId, &[StateId])> + '_ {
        self.list
            .iter()
            .map(|(&reg, origins)| (reg, origins.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn dump(&self) {
        for (reg, origins) in self.iter() {
            trace!("R{} <- {:?}", reg, origins);
        }
    }
}

/// One entry of a [`MemOriginList`].
#[derive(Clone, Copy, Debug)]
pub struct MemOrigin {
    pub place: TreeRef,
    pub origin: StateId,
}

/// Memory origins, ordered by insertion, keyed by canonical location.
///
/// `set` is a strong write: it replaces every entry at an equal location
/// with a single new entry at the first one's position. `add` is a weak
/// merge: it appends unless an entry with the same origin and an equal
/// location already exists.
#[derive(Clone, Debug, Default)]
pub struct MemOriginList {
    list: Vec<MemOrigin>,
}

impl MemOriginList {
    pub fn set(&mut self, trees: &TreeFactory, place: TreeRef, origin: StateId) {
        let location = MemLocation::new(trees, place);
        let mut found = false;
        self.list.retain(|entry| {
            if MemLocation::new(trees, entry.place) == location {
                if found {
                    return false;
                }
                found = true;
            }
            true
        });
        if found {
            for entry in self.list.iter_mut() {
                if MemLocation::new(trees, entry.place) == location {
                    *entry = MemOrigin { place, origin };
                    break;
                }
            }
        } else {
            self.list.push(MemOrigin { place, origin });
        }
    }

    pub fn add(&mut self, trees: &TreeFactory, place: TreeRef, origin: StateId) {
        let location = MemLocation::new(trees, place);
        let duplicate = self.list.iter().any(|entry| {
            entry.origin == origin && MemLocation::new(trees, entry.place) == location
        });
        if !duplicate {
            self.list.push(MemOrigin { place, origin });
        }
    }

    pub fn add_list(&mut self, trees: &TreeFactory, other: &MemOriginList) {
        for entry in &other.list {
            self.add(trees, entry.place, entry.origin);
        }
    }

    pub fn del(&mut self, trees: &TreeFactory, place: TreeRef) {
        let location = MemLocation::new(trees, place);
        self.list
            .retain(|entry| MemLocation::new(trees, entry.place) != location);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemOrigin> + '_ {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn dump(&self, trees: &TreeFactory) {
        for entry in &self.list {
            trace!("{} : {}", trees.display(entry.place), entry.origin);
        }
    }
}

/// Per-instruction use-def state.
#[derive(Clone, Debug)]
pub struct UDState {
    instruction: ChunkId,
    address: u64,
    reg_list: DefList,
    reg_ref_list: RefList,
    mem_list: Vec<(RegId, TreeRef)>,
    mem_ref_list: RefList,
}

impl UDState {
    fn new(instruction: ChunkId, address: u64) -> UDState {
        UDState {
            instruction,
            address,
            reg_list: DefList::default(),
            reg_ref_list: RefList::default(),
            mem_list: Vec::new(),
            mem_ref_list: RefList::default(),
        }
    }

    pub fn instruction(&self) -> ChunkId {
        self.instruction
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn add_reg_def(&mut self, reg: RegId, tree: Option<TreeRef>) {
        self.reg_list.set(reg, tree);
    }

    pub fn add_reg_ref(&mut self, reg: RegId, origin: StateId) {
        self.reg_ref_list.add(reg, origin);
    }

    pub fn add_mem_def(&mut self, reg: RegId, place: TreeRef) {
        self.mem_list.push((reg, place));
    }

    pub fn add_mem_ref(&mut self, reg: RegId, origin: StateId) {
        self.mem_ref_list.add(reg, origin);
    }

    pub fn reg_def(&self, reg: RegId) -> Option<TreeRef> {
        self.reg_list.get(reg)
    }

    pub fn reg_defs(&self) -> &DefList {
        &self.reg_list
    }

    pub fn reg_ref(&self, reg: RegId) -> Option<&[StateId]> {
        self.reg_ref_list.get(reg)
    }

    pub fn reg_refs(&self) -> &RefList {
        &self.reg_ref_list
    }

    pub fn mem_defs(&self) -> &[(RegId, TreeRef)] {
        &self.mem_list
    }

    pub fn mem_ref(&self, reg: RegId) -> Option<&[StateId]> {
        self.mem_ref_list.get(reg)
    }

    pub fn mem_refs(&self) -> &RefList {
        &self.mem_ref_list
    }

    pub fn dump(&self, trees: &TreeFactory) {
        trace!("state @ {:#x}", self.address);
        trace!("reg definition list:");
        self.reg_list.dump(trees);
        trace!("reg reference list:");
        self.reg_ref_list.dump();
        trace!("mem definition list:");
        for (reg, place) in &self.mem_list {
            trace!("R{} -> {}", reg, trees.display(*place));
        }
        trace!("mem reference list:");
        self.mem_ref_list.dump();
    }
}

/// Selects which opcodes the analysis interprets.
///
/// A disabled instruction is still walked over but produces no def/use
/// updates.
pub struct UseDefConfiguration<'a> {
    program: &'a Program,
    cfg: &'a ControlFlowGraph,
    enabled: FxHashSet<Op>,
}

impl<'a> UseDefConfiguration<'a> {
    pub fn new(
        program: &'a Program,
        cfg: &'a ControlFlowGraph,
        id_list: &[Op],
    ) -> UseDefConfiguration<'a> {
        UseDefConfiguration {
            program,
            cfg,
            enabled: id_list.iter().copied().collect(),
        }
    }

    /// Every opcode the handler table covers.
    pub fn handled_ops() -> Vec<Op> {
        HANDLERS.iter().map(|&(op, _)| op).collect()
    }

    pub fn program(&self) -> &'a Program {
        self.program
    }

    pub fn cfg(&self) -> &'a ControlFlowGraph {
        self.cfg
    }

    pub fn is_enabled(&self, id: Op) -> bool {
        self.enabled.contains(&id)
    }
}

/// The per-node exposed sets, the per-instruction states, and the working
/// sets of the node currently being analyzed.
#[derive(Debug, Default)]
pub struct UseDefWorkSet {
    states: Vec<UDState>,
    state_index: BTreeMap<ChunkId, StateId>,
    node_reg_exposed: Vec<RefList>,
    node_mem_exposed: Vec<MemOriginList>,
    reg_set: RefList,
    mem_set: MemOriginList,
}

impl UseDefWorkSet {
    /// Creates one state per instruction of `cfg`'s blocks.
    pub fn new(program: &Program, cfg: &ControlFlowGraph) -> UseDefWorkSet {
        let mut work = UseDefWorkSet {
            node_reg_exposed: vec![RefList::default(); cfg.len()],
            node_mem_exposed: vec![MemOriginList::default(); cfg.len()],
            ..UseDefWorkSet::default()
        };
        for node in cfg.nodes() {
            for &instruction in program.block_instructions(node.block()) {
                let id = work.states.len();
                work.states.push(UDState::new(
                    instruction,
                    program.chunk(instruction).address(),
                ));
                work.state_index.insert(instruction, id);
            }
        }
        work
    }

    pub fn state(&self, id: StateId) -> &UDState {
        &self.states[id]
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut UDState {
        &mut self.states[id]
    }

    pub fn state_for(&self, instruction: ChunkId) -> Option<StateId> {
        self.state_index.get(&instruction).copied()
    }

    /// The state for the instruction at `address`, if any.
    pub fn state_at(&self, address: u64) -> Option<StateId> {
        self.states
            .iter()
            .position(|state| state.address() == address)
    }

    pub fn states(&self) -> &[UDState] {
        &self.states
    }

    /// The exposed register definitions of a node, as of its last analysis.
    pub fn node_exposed_reg_set(&self, node: NodeId) -> &RefList {
        &self.node_reg_exposed[node]
    }

    /// The exposed memory origins of a node, as of its last analysis.
    pub fn node_exposed_mem_set(&self, node: NodeId) -> &MemOriginList {
        &self.node_mem_exposed[node]
    }

    /// Resets the working sets and seeds them from every backward-linked
    /// predecessor of `node`.
    pub fn transition_to(&mut self, node: &ControlFlowNode, trees: &TreeFactory) {
        self.reg_set.clear();
        self.mem_set.clear();
        // A node seeds from the sets its predecessors' last analysis left
        // behind; its own slot is cleared first so a self-loop contributes
        // nothing.
        self.node_reg_exposed[node.id()].clear();
        self.node_mem_exposed[node.id()].clear();

        for &link in node.backward_links() {
            for (reg, origins) in self.node_reg_exposed[link].iter() {
                for &origin in origins {
                    self.reg_set.add(reg, origin);
                }
            }
            self.mem_set.add_list(trees, &self.node_mem_exposed[link]);
        }
    }

    /// Stores the working sets as `node`'s exposed sets.
    pub fn commit(&mut self, node: NodeId) {
        self.node_reg_exposed[node] = self.reg_set.clone();
        self.node_mem_exposed[node] = self.mem_set.clone();
    }

    pub fn set_as_reg_set(&mut self, reg: RegId, state: StateId) {
        self.reg_set.set(reg, state);
    }

    pub fn add_to_reg_set(&mut self, reg: RegId, state: StateId) {
        self.reg_set.add(reg, state);
    }

    pub fn reg_set(&self, reg: RegId) -> Option<&[StateId]> {
        self.reg_set.get(reg)
    }

    pub fn set_as_mem_set(&mut self, trees: &TreeFactory, place: TreeRef, state: StateId) {
        self.mem_set.set(trees, place, state);
    }

    pub fn add_to_mem_set(&mut self, trees: &TreeFactory, place: TreeRef, state: StateId) {
        self.mem_set.add(trees, place, state);
    }

    /// Records every use of `reg`'s exposed origins on `state`.
    fn use_reg(&mut self, state: StateId, reg: RegId) {
        let origins = &self.reg_set;
        if let Some(origins) = origins.get(reg) {
            for &origin in origins {
                self.states[state].add_reg_ref(reg, origin);
            }
        }
    }

    /// Records a memory reference on `state` for every exposed origin whose
    /// location equals `place`'s.
    fn copy_from_mem_set_for(
        &mut self,
        trees: &TreeFactory,
        state: StateId,
        reg: RegId,
        place: TreeRef,
    ) {
        let location = MemLocation::new(trees, place);
        for index in 0..self.mem_set.list.len() {
            let entry = self.mem_set.list[index];
            if MemLocation::new(trees, entry.place) == location {
                self.states[state].add_mem_ref(reg, entry.origin);
            }
        }
    }

    pub fn dump_set(&self, trees: &TreeFactory) {
        trace!("REG SET");
        self.reg_set.dump();
        trace!("MEM SET");
        self.mem_set.dump(trees);
    }
}

type Handler = fn(&mut UseDef, StateId, &Assembly) -> Result<()>;

#[rustfmt::skip]
const HANDLERS: &[(Op, Handler)] = &[
    (Op::ADD,   fill_add_or_sub),
    (Op::ADR,   fill_adr),
    (Op::ADRP,  fill_adrp),
    (Op::AND,   fill_and),
    (Op::B,     fill_b),
    (Op::B_AL,  fill_cond_jump),
    (Op::B_CC,  fill_cond_jump),
    (Op::B_CS,  fill_cond_jump),
    (Op::B_EQ,  fill_cond_jump),
    (Op::B_GE,  fill_cond_jump),
    (Op::B_GT,  fill_cond_jump),
    (Op::B_HI,  fill_cond_jump),
    (Op::B_LE,  fill_cond_jump),
    (Op::B_LS,  fill_cond_jump),
    (Op::B_LT,  fill_cond_jump),
    (Op::B_MI,  fill_cond_jump),
    (Op::B_NE,  fill_cond_jump),
    (Op::B_NV,  fill_cond_jump),
    (Op::B_PL,  fill_cond_jump),
    (Op::B_VC,  fill_cond_jump),
    (Op::B_VS,  fill_cond_jump),
    (Op::BL,    fill_bl),
    (Op::BLR,   fill_blr),
    (Op::BR,    fill_br),
    (Op::CBNZ,  fill_cbnz),
    (Op::CBZ,   fill_cbz),
    (Op::CMP,   fill_cmp),
    (Op::CSEL,  fill_csel),
    (Op::LDAXR, fill_ldaxr),
    (Op::LDP,   fill_ldp),
    (Op::LDR,   fill_ldr),
    (Op::LDRB,  fill_ldrb),
    (Op::LDRH,  fill_ldrh),
    (Op::LDRSB, fill_ldrsb),
    (Op::LDRSH, fill_ldrsh),
    (Op::LDRSW, fill_ldrsw),
    (Op::LDUR,  fill_ldur),
    (Op::LSL,   fill_lsl),
    (Op::MOV,   fill_mov),
    (Op::MRS,   fill_mrs),
    (Op::NOP,   fill_nop),
    (Op::RET,   fill_ret),
    (Op::STP,   fill_stp),
    (Op::STR,   fill_str),
    (Op::STRB,  fill_strb),
    (Op::STRH,  fill_strh),
    (Op::SUB,   fill_add_or_sub),
    (Op::SXTW,  fill_sxtw),
];

fn handler_for(id: Op) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|&&(op, _)| op == id)
        .map(|&(_, handler)| handler)
}

/// The analysis driver.
pub struct UseDef<'a> {
    config: &'a UseDefConfiguration<'a>,
    work: &'a mut UseDefWorkSet,
    trees: &'a mut TreeFactory,
}

impl<'a> UseDef<'a> {
    pub fn new(
        config: &'a UseDefConfiguration<'a>,
        work: &'a mut UseDefWorkSet,
        trees: &'a mut TreeFactory,
    ) -> UseDef<'a> {
        UseDef {
            config,
            work,
            trees,
        }
    }

    /// Analyzes groups of nodes in the supplied order.
    ///
    /// Each inner group is a strongly connected region; groups with more
    /// than one node get a second pass.
    pub fn analyze(&mut self, order: &[Vec<NodeId>]) -> Result<()> {
        trace!("full order: {:?}", order);
        for group in order {
            self.analyze_graph(group)?;
            if group.len() > 1 {
                self.analyze_graph(group)?;
            }
        }
        Ok(())
    }

    fn analyze_graph(&mut self, order: &[NodeId]) -> Result<()> {
        trace!("order: {:?}", order);
        let config = self.config;

        for &node_id in order {
            let node = config.cfg().get(node_id)?;
            self.work.transition_to(node, self.trees);

            for &instruction in config.program().block_instructions(node.block()) {
                let state = match self.work.state_for(instruction) {
                    Some(state) => state,
                    None => continue,
                };
                trace!("analyzing state @ {:#x}", self.work.state(state).address());

                let semantic = match config.program().chunk(instruction).semantic() {
                    Some(semantic) => semantic,
                    None => continue,
                };
                if semantic.is_literal() {
                    continue;
                }
                self.fill_state(state, semantic.assembly())?;
            }

            self.work.commit(node_id);
            trace!("final set for node {}", node_id);
            self.work.dump_set(self.trees);
        }
        Ok(())
    }

    fn fill_state(&mut self, state: StateId, assembly: Option<&Assembly>) -> Result<()> {
        let assembly = match assembly {
            Some(assembly) => assembly,
            None => {
                trace!("state has no decoded assembly, skipping");
                return Ok(());
            }
        };
        if assembly.id() == Op::AT {
            return Err(Error::UnsupportedInstruction(
                "AT should be an alias for SYS".to_string(),
            ));
        }

        let handled = self.call_if_enabled(state, assembly)?;
        if handled {
            self.work.state(state).dump(self.trees);
            self.work.dump_set(self.trees);
        }
        Ok(())
    }

    fn call_if_enabled(&mut self, state: StateId, assembly: &Assembly) -> Result<bool> {
        let handler = if self.config.is_enabled(assembly.id()) {
            handler_for(assembly.id())
        } else {
            None
        };
        match handler {
            Some(handler) => {
                handler(self, state, assembly)?;
                Ok(true)
            }
            None => {
                debug!("handler disabled (or not found): {}", assembly.mnemonic());
                debug!("mode: {:?}", assembly.operands().mode());
                Ok(false)
            }
        }
    }

    fn def_reg(&mut self, state: StateId, reg: RegId, tree: Option<TreeRef>) {
        if reg != INVALID_REGISTER {
            self.work.state_mut(state).add_reg_def(reg, tree);
            self.work.set_as_reg_set(reg, state);
        }
    }

    fn use_reg(&mut self, state: StateId, reg: RegId) {
        self.work.use_reg(state, reg);
    }

    fn def_mem(&mut self, state: StateId, place: TreeRef, reg: RegId) {
        self.work.state_mut(state).add_mem_def(reg, place);
        self.work.set_as_mem_set(self.trees, place, state);
    }

    fn use_mem(&mut self, state: StateId, place: TreeRef, reg: RegId) {
        self.work
            .copy_from_mem_set_for(self.trees, state, reg, place);
    }

    /// Kills `reg` with a self-referential definition when no precise model
    /// exists.
    fn havoc_reg(&mut self, state: StateId, reg: RegId, width: usize) {
        let tree = self.trees.phys_reg(reg, width);
        self.def_reg(state, reg, Some(tree));
    }

    fn fill_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let reg0 = convert_to_physical(assembly.operands().reg(0)?);
        self.use_reg(state, reg0);
        Ok(())
    }

    fn fill_reg_to_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        let reg0 = convert_to_physical(operands.reg(0)?);
        let op1 = operands.reg(1)?;
        let reg1 = convert_to_physical(op1);
        let width1 = width_of(op1);

        self.use_reg(state, reg1);
        let tree = self.trees.phys_reg(reg1, width1);
        self.def_reg(state, reg0, Some(tree));
        Ok(())
    }

    fn fill_imm_to_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        let reg0 = convert_to_physical(operands.reg(0)?);
        let imm = operands.imm(1)?;

        let tree = if assembly.id() == Op::ADR || assembly.id() == Op::ADRP {
            self.trees.address(imm)
        } else {
            self.trees.constant(imm)
        };
        self.def_reg(state, reg0, Some(tree));
        Ok(())
    }

    fn fill_reg_imm_to_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        let reg0 = convert_to_physical(operands.reg(0)?);
        let op1 = operands.reg(1)?;
        let reg1 = convert_to_physical(op1);
        let width1 = width_of(op1);
        self.use_reg(state, reg1);

        let reg_tree = self.trees.phys_reg(reg1, width1);

        let imm = operands.imm(2)?;
        let (shift_kind, shift_value) = operands.shift(2);
        let imm_tree = self.trees.constant(imm);
        let imm_tree = shift_extend(self.trees, imm_tree, shift_kind, shift_value)?;

        let tree = match assembly.id() {
            Op::ADD => Some(self.trees.add(reg_tree, imm_tree)),
            Op::AND => Some(self.trees.and(reg_tree, imm_tree)),
            Op::SUB => Some(self.trees.sub(reg_tree, imm_tree)),
            Op::LSL => Some(self.trees.logical_shift_left(reg_tree, imm_tree)),
            _ => {
                debug!("NYI: {}", assembly.mnemonic());
                None
            }
        };
        self.def_reg(state, reg0, tree);
        Ok(())
    }

    fn fill_reg_reg_to_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        let reg0 = convert_to_physical(operands.reg(0)?);
        let op1 = operands.reg(1)?;
        let reg1 = convert_to_physical(op1);
        let width1 = width_of(op1);
        let op2 = operands.reg(2)?;
        let reg2 = convert_to_physical(op2);
        let width2 = width_of(op2);

        self.use_reg(state, reg1);
        self.use_reg(state, reg2);

        let reg1_tree = self.trees.phys_reg(reg1, width1);
        let reg2_tree = self.trees.phys_reg(reg2, width2);

        let (shift_kind, shift_value) = operands.shift(2);
        let reg2_tree = shift_extend(self.trees, reg2_tree, shift_kind, shift_value)?;

        let tree = match assembly.id() {
            Op::ADD => Some(self.trees.add(reg1_tree, reg2_tree)),
            Op::AND => Some(self.trees.and(reg1_tree, reg2_tree)),
            Op::SUB => Some(self.trees.sub(reg1_tree, reg2_tree)),
            Op::LSL => Some(self.trees.logical_shift_left(reg1_tree, reg2_tree)),
            _ => {
                debug!("NYI: {}", assembly.mnemonic());
                None
            }
        };
        self.def_reg(state, reg0, tree);
        Ok(())
    }

    fn fill_mem_to_reg(&mut self, state: StateId, assembly: &Assembly, width: usize) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(!operands.is_post_index());

        let op0 = operands.reg(0)?;
        let reg0 = convert_to_physical(op0);
        let width0 = width_of(op0);

        let mem = operands.mem(1)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        if mem.index.is_some() {
            debug!("NYI: index register");
            self.havoc_reg(state, reg0, width0);
            return Ok(());
        }

        let base_tree = self.trees.phys_reg(base, width_base);
        let disp_tree = self.trees.constant(mem.disp);
        let mem_tree = self.trees.add(base_tree, disp_tree);
        self.use_mem(state, mem_tree, reg0);

        if operands.is_pre_index() {
            self.def_reg(state, base, Some(mem_tree));
        }

        let deref_tree = self.trees.deref(mem_tree, width);
        self.def_reg(state, reg0, Some(deref_tree));
        Ok(())
    }

    fn fill_mem_imm_to_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);

        let mem = operands.mem(1)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        debug_assert!(mem.index.is_none());
        debug_assert_eq!(mem.disp, 0);

        let base_tree = self.trees.phys_reg(base, width_base);

        let width = load_width(assembly, 0b0100_0000);
        let zero = self.trees.constant(0);
        let mem_tree = self.trees.add(base_tree, zero);
        self.use_mem(state, mem_tree, reg0);

        let deref_tree = self.trees.deref(mem_tree, width);
        self.def_reg(state, reg0, Some(deref_tree));

        let imm = operands.imm(2)?;
        let imm_tree = self.trees.constant(imm);
        let write_back = self.trees.add(base_tree, imm_tree);
        self.def_reg(state, base, Some(write_back));
        Ok(())
    }

    fn fill_reg_to_mem(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(!operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);
        self.use_reg(state, reg0);

        let mem = operands.mem(1)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        if mem.index.is_some() {
            debug!("NYI: index register");
            return Ok(());
        }

        let base_tree = self.trees.phys_reg(base, width_base);
        let disp_tree = self.trees.constant(mem.disp);
        let mem_tree = self.trees.add(base_tree, disp_tree);

        if operands.is_pre_index() {
            self.def_reg(state, base, Some(mem_tree));
        }

        self.def_mem(state, mem_tree, reg0);
        Ok(())
    }

    fn fill_mem_to_reg_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(!operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);
        let reg1 = convert_to_physical(operands.reg(1)?);

        let mem = operands.mem(2)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        debug_assert!(mem.index.is_none());

        let base_tree = self.trees.phys_reg(base, width_base);
        let disp_tree = self.trees.constant(mem.disp);
        let mem_tree = self.trees.add(base_tree, disp_tree);
        if operands.is_pre_index() {
            self.def_reg(state, base, Some(mem_tree));
        }

        let width = load_width(assembly, 0b1000_0000);
        let zero = self.trees.constant(0);
        let offset = self.trees.constant(width as i64);
        let mem_tree0 = self.trees.add(mem_tree, zero);
        let mem_tree1 = self.trees.add(mem_tree, offset);
        self.use_mem(state, mem_tree0, reg0);
        self.use_mem(state, mem_tree1, reg1);

        let deref_tree0 = self.trees.deref(mem_tree0, width);
        let deref_tree1 = self.trees.deref(mem_tree1, width);
        self.def_reg(state, reg0, Some(deref_tree0));
        self.def_reg(state, reg1, Some(deref_tree1));
        Ok(())
    }

    fn fill_mem_imm_to_reg_reg(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);
        let reg1 = convert_to_physical(operands.reg(1)?);

        let mem = operands.mem(2)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        debug_assert!(mem.index.is_none());
        debug_assert_eq!(mem.disp, 0);

        let base_tree = self.trees.phys_reg(base, width_base);

        let width = load_width(assembly, 0b1000_0000);
        let zero = self.trees.constant(0);
        let offset = self.trees.constant(width as i64);
        let mem_tree0 = self.trees.add(base_tree, zero);
        let mem_tree1 = self.trees.add(base_tree, offset);
        self.use_mem(state, mem_tree0, reg0);
        self.use_mem(state, mem_tree1, reg1);

        let deref_tree0 = self.trees.deref(mem_tree0, width);
        let deref_tree1 = self.trees.deref(mem_tree1, width);
        self.def_reg(state, reg0, Some(deref_tree0));
        self.def_reg(state, reg1, Some(deref_tree1));

        let imm = operands.imm(3)?;
        let imm_tree = self.trees.constant(imm);
        let write_back = self.trees.add(base_tree, imm_tree);
        self.def_reg(state, base, Some(write_back));
        Ok(())
    }

    fn fill_reg_reg_to_mem(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(!operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);
        let reg1 = convert_to_physical(operands.reg(1)?);
        self.use_reg(state, reg0);
        self.use_reg(state, reg1);

        let mem = operands.mem(2)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);
        debug_assert!(mem.index.is_none());

        let base_tree = self.trees.phys_reg(base, width_base);
        let disp_tree = self.trees.constant(mem.disp);
        let mem_tree = self.trees.add(base_tree, disp_tree);
        if operands.is_pre_index() {
            self.def_reg(state, base, Some(mem_tree));
        }

        let width = load_width(assembly, 0b1000_0000);
        let zero = self.trees.constant(0);
        let offset = self.trees.constant(width as i64);
        let mem_tree0 = self.trees.add(mem_tree, zero);
        let mem_tree1 = self.trees.add(mem_tree, offset);

        self.def_mem(state, mem_tree0, reg0);
        self.def_mem(state, mem_tree1, reg1);
        Ok(())
    }

    fn fill_reg_reg_imm_to_mem(&mut self, state: StateId, assembly: &Assembly) -> Result<()> {
        let operands = assembly.operands();
        debug_assert!(operands.is_post_index());

        let reg0 = convert_to_physical(operands.reg(0)?);
        let reg1 = convert_to_physical(operands.reg(1)?);
        self.use_reg(state, reg0);
        self.use_reg(state, reg1);

        let mem = operands.mem(2)?;
        let base = convert_to_physical(mem.base);
        let width_base = width_of(mem.base);
        self.use_reg(state, base);

        debug_assert!(mem.index.is_none());
        debug_assert_eq!(mem.disp, 0);

        let base_tree = self.trees.phys_reg(base, width_base);

        let width = load_width(assembly, 0b1000_0000);
        let zero = self.trees.constant(0);
        let offset = self.trees.constant(width as i64);
        let mem_tree0 = self.trees.add(base_tree, zero);
        let mem_tree1 = self.trees.add(base_tree, offset);
        self.def_mem(state, mem_tree0, reg0);
        self.def_mem(state, mem_tree1, reg1);

        let imm = operands.imm(3)?;
        let imm_tree = self.trees.constant(imm);
        let write_back = self.trees.add(base_tree, imm_tree);
        self.def_reg(state, base, Some(write_back));
        Ok(())
    }
}

fn fill_compare_imm_then_jump(_ud: &mut UseDef, _state: StateId, _assembly: &Assembly) -> Result<()> {
    // CBZ and CBNZ do not update NZCV, but the compared register may be
    // useful for jumptable detection.
    Ok(())
}

fn fill_cond_jump(_ud: &mut UseDef, _state: StateId, _assembly: &Assembly) -> Result<()> {
    Ok(())
}

fn fill_add_or_sub(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegRegImm => ud.fill_reg_imm_to_reg(state, assembly),
        OperandMode::RegRegReg => ud.fill_reg_reg_to_reg(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_adr(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    ud.fill_imm_to_reg(state, assembly)
}

fn fill_adrp(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    ud.fill_imm_to_reg(state, assembly)
}

fn fill_and(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegRegImm => ud.fill_reg_imm_to_reg(state, assembly),
        OperandMode::RegRegReg => ud.fill_reg_reg_to_reg(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_b(_ud: &mut UseDef, _state: StateId, _assembly: &Assembly) -> Result<()> {
    Ok(())
}

fn fill_bl(ud: &mut UseDef, state: StateId, _assembly: &Assembly) -> Result<()> {
    for reg in 0..ARGUMENT_REGISTERS {
        ud.use_reg(state, reg);
        ud.def_reg(state, reg, None);
    }
    Ok(())
}

fn fill_blr(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    let reg0 = convert_to_physical(assembly.operands().reg(0)?);
    ud.use_reg(state, reg0);

    for reg in 0..ARGUMENT_REGISTERS {
        ud.use_reg(state, reg);
        ud.def_reg(state, reg, None);
    }
    Ok(())
}

fn fill_br(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    ud.fill_reg(state, assembly)
}

fn fill_cbz(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_compare_imm_then_jump(ud, state, assembly)
}

fn fill_cbnz(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_compare_imm_then_jump(ud, state, assembly)
}

fn fill_cmp(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    let operands = assembly.operands();
    let op0 = operands.reg(0)?;
    let reg0 = convert_to_physical(op0);
    let width0 = width_of(op0);
    let imm = operands.imm(1)?;

    let reg_tree = ud.trees.phys_reg(reg0, width0);
    let imm_tree = ud.trees.constant(imm);
    let tree = ud.trees.compare(reg_tree, imm_tree);
    ud.def_reg(state, NZCV, Some(tree));
    Ok(())
}

fn fill_csel(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    let op0 = assembly.operands().reg(0)?;
    let reg0 = convert_to_physical(op0);
    let width0 = width_of(op0);
    ud.havoc_reg(state, reg0, width0);
    debug!("NYI: {}", assembly.mnemonic());
    Ok(())
}

fn fill_ldaxr(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegMem => {
            let width = load_width(assembly, 0b0100_0000);
            ud.fill_mem_to_reg(state, assembly, width)
        }
        mode => Err(Error::UnsupportedInstruction(format!(
            "unknown mode {:?} for LDAXR",
            mode
        ))),
    }
}

fn fill_ldp(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegRegMem => ud.fill_mem_to_reg_reg(state, assembly),
        OperandMode::RegRegMemImm => ud.fill_mem_imm_to_reg_reg(state, assembly),
        mode => Err(Error::UnsupportedInstruction(format!(
            "unknown mode {:?} for LDP",
            mode
        ))),
    }
}

fn fill_ldr(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegMem => {
            let width = load_width(assembly, 0b0100_0000);
            ud.fill_mem_to_reg(state, assembly, width)
        }
        OperandMode::RegMemImm => ud.fill_mem_imm_to_reg(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_sized_load(ud: &mut UseDef, state: StateId, assembly: &Assembly, width: usize) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegMem => ud.fill_mem_to_reg(state, assembly, width),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_ldrh(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_sized_load(ud, state, assembly, 2)
}

fn fill_ldrb(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_sized_load(ud, state, assembly, 1)
}

fn fill_ldrsw(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_sized_load(ud, state, assembly, 4)
}

fn fill_ldrsh(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_sized_load(ud, state, assembly, 2)
}

fn fill_ldrsb(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_sized_load(ud, state, assembly, 1)
}

fn fill_ldur(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegMem => {
            let width = load_width(assembly, 0b0100_0000);
            ud.fill_mem_to_reg(state, assembly, width)
        }
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_lsl(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegRegImm => ud.fill_reg_imm_to_reg(state, assembly),
        OperandMode::RegRegReg => ud.fill_reg_reg_to_reg(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_mov(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegReg => ud.fill_reg_to_reg(state, assembly),
        OperandMode::RegImm => ud.fill_imm_to_reg(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_mrs(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    let op0 = assembly.operands().reg(0)?;
    let reg0 = convert_to_physical(op0);
    let width0 = width_of(op0);
    ud.havoc_reg(state, reg0, width0);
    Ok(())
}

fn fill_nop(_ud: &mut UseDef, _state: StateId, _assembly: &Assembly) -> Result<()> {
    Ok(())
}

fn fill_ret(ud: &mut UseDef, state: StateId, _assembly: &Assembly) -> Result<()> {
    for reg in 0..ARGUMENT_REGISTERS {
        ud.use_reg(state, reg);
    }
    Ok(())
}

fn fill_stp(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegRegMem => ud.fill_reg_reg_to_mem(state, assembly),
        OperandMode::RegRegMemImm => ud.fill_reg_reg_imm_to_mem(state, assembly),
        mode => Err(Error::UnsupportedInstruction(format!(
            "unknown mode {:?} for STP",
            mode
        ))),
    }
}

fn fill_str(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegMem => ud.fill_reg_to_mem(state, assembly),
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

fn fill_strb(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_str(ud, state, assembly)
}

fn fill_strh(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    fill_str(ud, state, assembly)
}

fn fill_sxtw(ud: &mut UseDef, state: StateId, assembly: &Assembly) -> Result<()> {
    match assembly.operands().mode() {
        OperandMode::RegReg => {
            // Sign extension is not modeled; this degrades to a move.
            debug!("NYI fully: {}", assembly.mnemonic());
            ud.fill_reg_to_reg(state, assembly)
        }
        mode => {
            debug!("skipping mode {:?}", mode);
            Ok(())
        }
    }
}

/// The access width encoded in the size bit of a load/store encoding.
fn load_width(assembly: &Assembly, bit: u8) -> usize {
    let wide = assembly
        .bytes()
        .get(3)
        .map_or(false, |byte| byte & bit != 0);
    if wide {
        8
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::SP;
    use crate::chunk::Link;
    use crate::instr::{
        AsmOperand, AsmOperands, InstructionSemantic, MemOperand, OperandKind, Writeback,
    };
    use crate::tree::Tree;
    use bad64::Reg;

    fn reg_op(reg: Reg) -> AsmOperand {
        AsmOperand::new(OperandKind::Reg(reg))
    }

    fn imm_op(imm: i64) -> AsmOperand {
        AsmOperand::new(OperandKind::Imm(imm))
    }

    fn mem_op(base: Reg, disp: i64) -> AsmOperand {
        AsmOperand::new(OperandKind::Mem(MemOperand {
            base,
            index: None,
            disp,
        }))
    }

    fn isolated(
        id: Op,
        mode: OperandMode,
        operands: Vec<AsmOperand>,
        writeback: Writeback,
        bytes: [u8; 4],
    ) -> InstructionSemantic {
        InstructionSemantic::Isolated {
            assembly: Assembly::new(
                id,
                format!("{:?}", id).to_lowercase(),
                bytes.to_vec(),
                AsmOperands::new(mode, operands, writeback),
            ),
        }
    }

    struct Scenario {
        program: Program,
        cfg: ControlFlowGraph,
    }

    impl Scenario {
        /// One function with one block per instruction list given.
        fn new(blocks: &[Vec<InstructionSemantic>]) -> Scenario {
            let mut program = Program::new();
            let module = program.add_module("test");
            let function = program.add_function(module, "f", 0x1000, 0x1000);
            let mut cfg = ControlFlowGraph::new();
            let mut address = 0x1000;
            for semantics in blocks {
                let block = program.add_block(function, address, 4 * semantics.len() as u64);
                for semantic in semantics {
                    program.add_instruction(block, address, semantic.clone());
                    address += 4;
                }
                cfg.add_node(block);
            }
            Scenario { program, cfg }
        }

        fn run(&self, order: &[Vec<NodeId>]) -> (UseDefWorkSet, TreeFactory) {
            self.run_with(order, &UseDefConfiguration::handled_ops())
        }

        fn run_with(&self, order: &[Vec<NodeId>], ops: &[Op]) -> (UseDefWorkSet, TreeFactory) {
            let mut trees = TreeFactory::new();
            let config = UseDefConfiguration::new(&self.program, &self.cfg, ops);
            let mut work = UseDefWorkSet::new(&self.program, &self.cfg);
            UseDef::new(&config, &mut work, &mut trees)
                .analyze(order)
                .unwrap();
            (work, trees)
        }
    }

    #[test]
    fn straight_line_defs_and_refs() {
        // mov x0, #7; add x1, x0, #3; ret
        let scenario = Scenario::new(&[vec![
            isolated(
                Op::MOV,
                OperandMode::RegImm,
                vec![reg_op(Reg::X0), imm_op(7)],
                Writeback::None,
                [0; 4],
            ),
            isolated(
                Op::ADD,
                OperandMode::RegRegImm,
                vec![reg_op(Reg::X1), reg_op(Reg::X0), imm_op(3)],
                Writeback::None,
                [0; 4],
            ),
            isolated(Op::RET, OperandMode::Other, vec![], Writeback::None, [0; 4]),
        ]]);
        let (work, trees) = scenario.run(&[vec![0]]);

        let mov = work.state_at(0x1000).unwrap();
        let add = work.state_at(0x1004).unwrap();
        let ret = work.state_at(0x1008).unwrap();

        let mov_def = work.state(mov).reg_def(0).unwrap();
        assert_eq!(trees.get(mov_def), &Tree::Const(7));

        let add_def = work.state(add).reg_def(1).unwrap();
        match trees.get(add_def) {
            Tree::Add(lhs, rhs) => {
                assert_eq!(trees.get(*lhs), &Tree::PhysReg { reg: 0, width: 8 });
                assert_eq!(trees.get(*rhs), &Tree::Const(3));
            }
            tree => panic!("expected addition, got {:?}", tree),
        }
        assert_eq!(work.state(add).reg_ref(0), Some(&[mov][..]));

        assert_eq!(work.state(ret).reg_ref(0), Some(&[mov][..]));
        assert_eq!(work.state(ret).reg_ref(1), Some(&[add][..]));
    }

    #[test]
    fn pre_and_post_index_write_back() {
        // str x0, [sp, #-16]!; ldr x0, [sp], #16
        let scenario = Scenario::new(&[vec![
            isolated(
                Op::STR,
                OperandMode::RegMem,
                vec![reg_op(Reg::X0), mem_op(Reg::SP, -16)],
                Writeback::Pre,
                [0, 0, 0, 0xf8],
            ),
            isolated(
                Op::LDR,
                OperandMode::RegMemImm,
                vec![reg_op(Reg::X0), mem_op(Reg::SP, 0), imm_op(16)],
                Writeback::Post,
                [0, 0, 0, 0xf8],
            ),
        ]]);
        let (work, trees) = scenario.run(&[vec![0]]);

        let str_state = work.state_at(0x1000).unwrap();
        let ldr_state = work.state_at(0x1004).unwrap();

        // Pre-index: the store writes the effective address back into SP.
        let sp_def = work.state(str_state).reg_def(SP).unwrap();
        match trees.get(sp_def) {
            Tree::Add(lhs, rhs) => {
                assert_eq!(trees.get(*lhs), &Tree::PhysReg { reg: SP, width: 8 });
                assert_eq!(trees.get(*rhs), &Tree::Const(-16));
            }
            tree => panic!("expected write-back tree, got {:?}", tree),
        }
        assert_eq!(work.state(str_state).mem_defs().len(), 1);

        // Post-index: the load reads at the unmodified base, then bumps SP.
        let sp_def = work.state(ldr_state).reg_def(SP).unwrap();
        match trees.get(sp_def) {
            Tree::Add(lhs, rhs) => {
                assert_eq!(trees.get(*lhs), &Tree::PhysReg { reg: SP, width: 8 });
                assert_eq!(trees.get(*rhs), &Tree::Const(16));
            }
            tree => panic!("expected write-back tree, got {:?}", tree),
        }
        let x0_def = work.state(ldr_state).reg_def(0).unwrap();
        assert!(matches!(trees.get(x0_def), Tree::Deref { width: 8, .. }));

        // The store's origin stays exposed at (sp - 16).
        let exposed = work.node_exposed_mem_set(0);
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed.iter().next().unwrap().origin, str_state);
    }

    #[test]
    fn store_then_load_links_through_memory() {
        // str x0, [sp, #-16]; ldr x1, [sp, #-16]
        let scenario = Scenario::new(&[vec![
            isolated(
                Op::STR,
                OperandMode::RegMem,
                vec![reg_op(Reg::X0), mem_op(Reg::SP, -16)],
                Writeback::None,
                [0, 0, 0, 0xf8],
            ),
            isolated(
                Op::LDR,
                OperandMode::RegMem,
                vec![reg_op(Reg::X1), mem_op(Reg::SP, -16)],
                Writeback::None,
                [0, 0, 0, 0xf8],
            ),
        ]]);
        let (work, _trees) = scenario.run(&[vec![0]]);

        let str_state = work.state_at(0x1000).unwrap();
        let ldr_state = work.state_at(0x1004).unwrap();
        assert_eq!(work.state(ldr_state).mem_ref(1), Some(&[str_state][..]));
    }

    #[test]
    fn compare_defines_the_flags_register() {
        // cmp x0, #0; b.eq <somewhere>
        let branch = InstructionSemantic::ControlFlow {
            assembly: Assembly::new(
                Op::B_EQ,
                "b.eq".to_string(),
                [0; 4].to_vec(),
                AsmOperands::new(OperandMode::Imm, vec![imm_op(0x2000)], Writeback::None),
            ),
            link: Link::Unresolved { address: 0x2000 },
        };
        let scenario = Scenario::new(&[vec![
            isolated(
                Op::CMP,
                OperandMode::RegImm,
                vec![reg_op(Reg::X0), imm_op(0)],
                Writeback::None,
                [0; 4],
            ),
            branch,
        ]]);
        let (work, trees) = scenario.run(&[vec![0]]);

        let cmp = work.state_at(0x1000).unwrap();
        let nzcv = work.state(cmp).reg_def(NZCV).unwrap();
        match trees.get(nzcv) {
            Tree::Compare(lhs, rhs) => {
                assert_eq!(trees.get(*lhs), &Tree::PhysReg { reg: 0, width: 8 });
                assert_eq!(trees.get(*rhs), &Tree::Const(0));
            }
            tree => panic!("expected comparison, got {:?}", tree),
        }

        // The branch itself neither defines nor references anything.
        let branch = work.state_at(0x1004).unwrap();
        assert!(work.state(branch).reg_defs().is_empty());
        assert!(work.state(branch).reg_refs().is_empty());
    }

    #[test]
    fn diamond_join_merges_exposed_origins() {
        let mov = |imm| {
            isolated(
                Op::MOV,
                OperandMode::RegImm,
                vec![reg_op(Reg::X0), imm_op(imm)],
                Writeback::None,
                [0; 4],
            )
        };
        let scenario = {
            let mut scenario = Scenario::new(&[
                vec![isolated(Op::NOP, OperandMode::Other, vec![], Writeback::None, [0; 4])],
                vec![mov(1)],
                vec![mov(2)],
                vec![isolated(
                    Op::ADD,
                    OperandMode::RegRegImm,
                    vec![reg_op(Reg::X1), reg_op(Reg::X0), imm_op(0)],
                    Writeback::None,
                    [0; 4],
                )],
            ]);
            scenario.cfg.add_edge(0, 1);
            scenario.cfg.add_edge(0, 2);
            scenario.cfg.add_edge(1, 3);
            scenario.cfg.add_edge(2, 3);
            scenario
        };
        let (work, _trees) = scenario.run(&[vec![0], vec![1], vec![2], vec![3]]);

        let mov1 = work.state_at(0x1004).unwrap();
        let mov2 = work.state_at(0x1008).unwrap();
        let join = work.state_at(0x100c).unwrap();

        assert_eq!(work.state(join).reg_ref(0), Some(&[mov1, mov2][..]));

        let exposed = work.node_exposed_reg_set(3);
        assert_eq!(exposed.get(0), Some(&[mov1, mov2][..]));
        assert_eq!(exposed.get(1), Some(&[join][..]));
    }

    #[test]
    fn call_clobbers_argument_registers() {
        // mov x0, #1; bl somewhere; add x1, x0, #0
        let scenario = Scenario::new(&[vec![
            isolated(
                Op::MOV,
                OperandMode::RegImm,
                vec![reg_op(Reg::X0), imm_op(1)],
                Writeback::None,
                [0; 4],
            ),
            isolated(
                Op::BL,
                OperandMode::Imm,
                vec![imm_op(0x8000)],
                Writeback::None,
                [0; 4],
            ),
            isolated(
                Op::ADD,
                OperandMode::RegRegImm,
                vec![reg_op(Reg::X1), reg_op(Reg::X0), imm_op(0)],
                Writeback::None,
                [0; 4],
            ),
        ]]);
        let (work, _trees) = scenario.run(&[vec![0]]);

        let mov = work.state_at(0x1000).unwrap();
        let bl = work.state_at(0x1004).unwrap();
        let add = work.state_at(0x1008).unwrap();

        // The call reads the argument registers and kills them.
        assert_eq!(work.state(bl).reg_ref(0), Some(&[mov][..]));
        assert!(work.state(bl).reg_defs().defines(0));
        assert_eq!(work.state(bl).reg_defs().get(0), None);

        // After the call, x0 originates from the call, not the mov.
        assert_eq!(work.state(add).reg_ref(0), Some(&[bl][..]));
    }

    #[test]
    fn disabled_opcodes_are_observed_but_inert() {
        let scenario = Scenario::new(&[vec![isolated(
            Op::ADD,
            OperandMode::RegRegImm,
            vec![reg_op(Reg::X1), reg_op(Reg::X0), imm_op(3)],
            Writeback::None,
            [0; 4],
        )]]);
        let (work, _trees) = scenario.run_with(&[vec![0]], &[Op::MOV]);

        let add = work.state_at(0x1000).unwrap();
        assert!(work.state(add).reg_defs().is_empty());
        assert!(work.state(add).reg_refs().is_empty());
    }

    #[test]
    fn literals_are_skipped() {
        let scenario = Scenario::new(&[vec![InstructionSemantic::Literal {
            bytes: vec![0xef, 0xbe, 0xad, 0xde],
        }]]);
        let (work, _trees) = scenario.run(&[vec![0]]);
        let literal = work.state_at(0x1000).unwrap();
        assert!(work.state(literal).reg_defs().is_empty());
    }

    #[test]
    fn at_opcode_is_fatal() {
        let scenario = Scenario::new(&[vec![isolated(
            Op::AT,
            OperandMode::Other,
            vec![],
            Writeback::None,
            [0; 4],
        )]]);
        let mut trees = TreeFactory::new();
        let config = UseDefConfiguration::new(
            &scenario.program,
            &scenario.cfg,
            &UseDefConfiguration::handled_ops(),
        );
        let mut work = UseDefWorkSet::new(&scenario.program, &scenario.cfg);
        let result = UseDef::new(&config, &mut work, &mut trees).analyze(&[vec![0]]);
        assert!(result.is_err());
    }

    #[test]
    fn loop_groups_converge_after_the_second_pass() {
        // Entry defines x0; a two-node loop keeps rewriting it.
        let scenario = {
            let mut scenario = Scenario::new(&[
                vec![isolated(
                    Op::MOV,
                    OperandMode::RegImm,
                    vec![reg_op(Reg::X0), imm_op(1)],
                    Writeback::None,
                    [0; 4],
                )],
                vec![isolated(
                    Op::ADD,
                    OperandMode::RegRegImm,
                    vec![reg_op(Reg::X0), reg_op(Reg::X0), imm_op(1)],
                    Writeback::None,
                    [0; 4],
                )],
                vec![isolated(
                    Op::SUB,
                    OperandMode::RegRegImm,
                    vec![reg_op(Reg::X0), reg_op(Reg::X0), imm_op(1)],
                    Writeback::None,
                    [0; 4],
                )],
            ]);
            scenario.cfg.add_edge(0, 1);
            scenario.cfg.add_edge(1, 2);
            scenario.cfg.add_edge(2, 1);
            scenario
        };
        let order = vec![vec![0], vec![1, 2]];

        let mut trees = TreeFactory::new();
        let config = UseDefConfiguration::new(
            &scenario.program,
            &scenario.cfg,
            &UseDefConfiguration::handled_ops(),
        );
        let mut work = UseDefWorkSet::new(&scenario.program, &scenario.cfg);
        UseDef::new(&config, &mut work, &mut trees)
            .analyze(&order)
            .unwrap();

        let after_second: Vec<RefList> = (0..scenario.cfg.len())
            .map(|node| work.node_exposed_reg_set(node).clone())
            .collect();

        // A third (and fourth) pass over the loop changes nothing.
        UseDef::new(&config, &mut work, &mut trees)
            .analyze(&[vec![1, 2]])
            .unwrap();
        for node in 1..scenario.cfg.len() {
            assert_eq!(work.node_exposed_reg_set(node), &after_second[node]);
        }

        // The add's operand sees both the entry def and the sub's redef.
        let mov = work.state_at(0x1000).unwrap();
        let add = work.state_at(0x1004).unwrap();
        let sub = work.state_at(0x1008).unwrap();
        assert_eq!(work.state(add).reg_ref(0), Some(&[mov, sub][..]));
        assert_eq!(work.state(sub).reg_ref(0), Some(&[add][..]));
    }

    #[test]
    fn mem_origin_list_policies() {
        let mut trees = TreeFactory::new();
        let sp = trees.phys_reg(SP, 8);
        let minus16 = trees.constant(-16);
        let minus8 = trees.constant(-8);
        let place_a = trees.add(sp, minus16);
        let place_b = trees.add(sp, minus16);
        let place_c = trees.add(sp, minus8);

        let mut list = MemOriginList::default();
        list.add(&trees, place_a, 0);
        // Same origin and equal location: rejected.
        list.add(&trees, place_b, 0);
        assert_eq!(list.len(), 1);
        // Different origin at an equal location: kept.
        list.add(&trees, place_b, 1);
        assert_eq!(list.len(), 2);
        list.add(&trees, place_c, 2);
        assert_eq!(list.len(), 3);

        // A strong write collapses every equal location into one entry.
        list.set(&trees, place_a, 3);
        assert_eq!(list.len(), 2);
        let origins: Vec<StateId> = list.iter().map(|entry| entry.origin).collect();
        assert_eq!(origins, vec![3, 2]);

        list.del(&trees, place_c);
        assert_eq!(list.len(), 1);
    }
}

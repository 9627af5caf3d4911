//! Functions, basic blocks, and modules
//!
//! A function exclusively owns its blocks in an arena indexed by `BlockId`;
//! predecessor/successor links are id sets, so removing or emptying a block
//! never dangles. Structural mutation bumps a version counter that analyses
//! use to notice staleness.

use rustc_hash::FxHashMap;

use crate::ir::instr::{Instr, Terminator};
use crate::ir::types::IrType;
use crate::ir::value::{BlockId, FuncId, Value, Vreg};

/// A basic block: an ordered instruction sequence plus one terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
    /// Derived by `build_cfg`; ids only, non-owning
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Loop metadata, filled in by loop detection
    pub loop_header: bool,
    pub loop_depth: u32,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            instrs: Vec::new(),
            terminator: Terminator::None,
            preds: Vec::new(),
            succs: Vec::new(),
            loop_header: false,
            loop_depth: 0,
        }
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    /// Number of leading phi instructions.
    pub fn phi_count(&self) -> usize {
        self.instrs.iter().take_while(|i| i.is_phi()).count()
    }
}

/// Function-level attribute flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnAttrs {
    pub inline_hint: bool,
    pub pure: bool,
    pub no_throw: bool,
    pub hot: bool,
    pub cold: bool,
}

/// A function: arena of blocks (block 0 is the entry), typed parameters,
/// attributes, metadata, and a version counter for analysis caching.
#[derive(Debug, Clone)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    pub params: Vec<IrType>,
    pub ret_ty: IrType,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub attrs: FnAttrs,
    pub metadata: FxHashMap<String, String>,
    vreg_types: FxHashMap<Vreg, IrType>,
    next_vreg: u32,
    version: u64,
    cfg_built: bool,
}

impl Function {
    pub fn new(id: FuncId, name: impl Into<String>, params: Vec<IrType>, ret_ty: IrType) -> Self {
        let entry = BlockId(0);
        Self {
            id,
            name: name.into(),
            params,
            ret_ty,
            blocks: vec![Block::new(entry)],
            entry,
            attrs: FnAttrs::default(),
            metadata: FxHashMap::default(),
            vreg_types: FxHashMap::default(),
            next_vreg: 0,
            version: 0,
            cfg_built: false,
        }
    }

    /// Allocate a fresh virtual register of the given type.
    pub fn alloc_vreg(&mut self, ty: IrType) -> Vreg {
        let r = Vreg(self.next_vreg);
        self.next_vreg += 1;
        self.vreg_types.insert(r, ty);
        r
    }

    pub fn vreg_count(&self) -> u32 {
        self.next_vreg
    }

    /// Append a new empty block to the arena.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        self.touch();
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutable block access. Conservatively treated as a structural
    /// mutation: bumps the version and invalidates the cached CFG.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        self.touch();
        &mut self.blocks[id.index()]
    }

    pub fn add_instr(&mut self, block: BlockId, instr: Instr) {
        self.block_mut(block).push(instr);
    }

    pub fn remove_instr(&mut self, block: BlockId, index: usize) -> Instr {
        self.block_mut(block).instrs.remove(index)
    }

    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.block_mut(block).terminator = term;
    }

    /// Monotonic mutation counter; analyses stamp their results with it.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record a structural mutation.
    pub fn touch(&mut self) {
        self.version += 1;
        self.cfg_built = false;
    }

    pub fn cfg_built(&self) -> bool {
        self.cfg_built
    }

    /// Derive predecessor/successor id sets from terminator targets.
    /// No-op when the CFG is already current.
    pub fn build_cfg(&mut self) {
        if self.cfg_built {
            return;
        }
        for b in &mut self.blocks {
            b.preds.clear();
            b.succs.clear();
        }
        let edges: Vec<(BlockId, Vec<BlockId>)> = self
            .blocks
            .iter()
            .map(|b| (b.id, b.terminator.successors()))
            .collect();
        for (from, succs) in edges {
            for to in succs {
                if to.index() >= self.blocks.len() {
                    continue;
                }
                self.blocks[from.index()].succs.push(to);
                if !self.blocks[to.index()].preds.contains(&from) {
                    self.blocks[to.index()].preds.push(from);
                }
            }
        }
        self.cfg_built = true;
    }

    /// Loop annotations do not change structure; they bypass `touch`.
    pub(crate) fn annotate_loop(&mut self, id: BlockId, header: bool, depth: u32) {
        let b = &mut self.blocks[id.index()];
        b.loop_header = header;
        b.loop_depth = depth;
    }

    pub fn value_type(&self, v: Value) -> IrType {
        match v {
            Value::Reg(r) => self.vreg_types.get(&r).copied().unwrap_or(IrType::Unknown),
            Value::ConstInt(_) => IrType::Int64,
            Value::ConstFloat(_) => IrType::Float64,
            Value::ConstBool(_) => IrType::Bool,
            Value::Arg(i) => self
                .params
                .get(i as usize)
                .copied()
                .unwrap_or(IrType::Unknown),
            Value::Block(_) => IrType::Void,
            Value::Func(_) => IrType::Function,
            Value::Global(_) => IrType::Ptr,
        }
    }

    pub fn vreg_type(&self, r: Vreg) -> IrType {
        self.vreg_types.get(&r).copied().unwrap_or(IrType::Unknown)
    }

    pub fn set_vreg_type(&mut self, r: Vreg, ty: IrType) {
        self.vreg_types.insert(r, ty);
    }

    /// Total instruction count across all blocks (inlining heuristic).
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Blocks reachable from the entry, in discovery order.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut stack = vec![self.entry];
        seen[self.entry.index()] = true;
        while let Some(b) = stack.pop() {
            order.push(b);
            for s in self.blocks[b.index()].terminator.successors() {
                // Malformed targets are the verifier's job to report
                if s.index() >= self.blocks.len() {
                    continue;
                }
                if !seen[s.index()] {
                    seen[s.index()] = true;
                    stack.push(s);
                }
            }
        }
        order
    }

    /// True if any instruction calls this function itself.
    pub fn is_self_recursive(&self) -> bool {
        self.calls_function(self.id)
    }

    pub fn calls_function(&self, target: FuncId) -> bool {
        self.blocks.iter().any(|b| {
            b.instrs.iter().any(|i| {
                matches!(i, Instr::Call { callee: crate::ir::instr::Callee::Func(f), .. } if *f == target)
            })
        })
    }
}

/// A module: exclusively-owned functions plus externally visible globals.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: FxHashMap<String, IrType>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: FxHashMap::default(),
        }
    }

    /// Add a function; its id must match its arena position.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        debug_assert_eq!(func.id, id, "function id must match module slot");
        self.functions.push(func);
        id
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn declare_global(&mut self, name: impl Into<String>, ty: IrType) {
        self.globals.insert(name.into(), ty);
    }
}

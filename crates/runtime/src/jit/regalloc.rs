//! Linear-scan allocation of trace virtual registers to physical x86-64
//! general-purpose registers.
//!
//! The trace's loop variable is always the native loop counter and lives in
//! `rax` for the whole trace; every other local the body touches gets a
//! register dedicated to it for the trace's lifetime (loaded once before the
//! loop, stored once after); everything else — the scratch values an
//! expression produces before being stored — is allocated from a small pool
//! by last-use liveness, same idea as a textbook linear-scan allocator, just
//! sized for traces a few instructions long.

use super::ir::{IrOp, IrProgram, IrType, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

pub const RDI: Reg = Reg(7);
pub const RAX: Reg = Reg(0);
pub const R11: Reg = Reg(11);
/// Reserved purely for the emitter's per-op overflow check (see
/// `emitter::Assembler::guard_fits_i32`); never handed out by this
/// allocator, so it never needs to be tracked as part of `Allocation`.
pub const R12: Reg = Reg(12);

/// rcx, rdx, rsi, r8: up to 4 locals (besides the loop variable) can live in
/// dedicated registers for a trace's lifetime.
const PERSISTENT_POOL: [Reg; 4] = [Reg(1), Reg(2), Reg(6), Reg(8)];

/// r9, r10: scratch registers for expression temporaries.
const SCRATCH_POOL: [Reg; 2] = [Reg(9), Reg(10)];

#[derive(Debug, Clone, Copy)]
pub enum Loc {
    /// Aliases a persistent local register (`rax` for the loop variable, or
    /// one of `PERSISTENT_POOL` for another touched local) — no instruction
    /// is ever emitted to materialise it.
    Alias(Reg),
    /// A scratch register holding an expression temporary.
    Scratch(Reg),
}

pub struct Allocation {
    pub vreg_loc: Vec<Option<Loc>>,
    /// Touched non-loop-variable slots in the order the caller's `regs[]`
    /// buffer lays them out.
    pub slots: Vec<(u8, Reg)>,
    /// The trace's one guard snapshot, built from the same slot list (and in
    /// the same order) as `slots`, so the emitter's shadow stores and the
    /// deopt reconstruction walk that follows a guard exit always agree on
    /// which buffer index holds which local.
    pub snapshot: Snapshot,
}

impl Allocation {
    pub fn reg_of(&self, vreg: u16) -> Reg {
        match self.vreg_loc[vreg as usize].expect("vreg used before being defined") {
            Loc::Alias(r) | Loc::Scratch(r) => r,
        }
    }

    fn reg_for_slot(&self, slot: u8) -> Option<Reg> {
        self.slots.iter().find(|(s, _)| *s == slot).map(|(_, r)| *r)
    }
}

/// Returns `None` if the trace needs more persistent or scratch registers
/// than are available — the loop is then left interpreted.
pub fn allocate(ir: &IrProgram, var_slot: u8, resume_pc: usize) -> Option<Allocation> {
    let mut slots = Vec::new();
    let mut live_slots = Vec::new();
    let mut pool = PERSISTENT_POOL.iter();
    for &slot in &ir.touched_slots {
        if slot == var_slot {
            continue;
        }
        slots.push((slot, *pool.next()?));
        live_slots.push((slot, IrType::Int32));
    }
    let snapshot = Snapshot { resume_pc, live_slots };

    let mut last_use = vec![0usize; ir.vreg_count as usize];
    for (i, op) in ir.ops.iter().enumerate() {
        match *op {
            IrOp::Add { lhs, rhs, .. } | IrOp::Sub { lhs, rhs, .. } | IrOp::Mul { lhs, rhs, .. } => {
                last_use[lhs as usize] = i;
                last_use[rhs as usize] = i;
            }
            IrOp::StoreLocal { src, .. } => last_use[src as usize] = i,
            IrOp::ConstInt { .. } | IrOp::LoadLocal { .. } | IrOp::Loop => {}
        }
    }

    let vreg_loc: Vec<Option<Loc>> = vec![None; ir.vreg_count as usize];
    let mut free: Vec<Reg> = SCRATCH_POOL.to_vec();
    let mut active: Vec<(usize, Reg)> = Vec::new(); // (last_use, reg)

    let mut alloc = Allocation { vreg_loc, slots, snapshot };
    for (i, op) in ir.ops.iter().enumerate() {
        active.retain(|&(lu, reg)| {
            if lu < i {
                free.push(reg);
                false
            } else {
                true
            }
        });
        match *op {
            IrOp::ConstInt { dst, .. } | IrOp::Add { dst, .. } | IrOp::Sub { dst, .. } | IrOp::Mul { dst, .. } => {
                let reg = free.pop()?;
                alloc.vreg_loc[dst as usize] = Some(Loc::Scratch(reg));
                active.push((last_use[dst as usize], reg));
            }
            IrOp::LoadLocal { dst, slot } => {
                let reg = if slot == var_slot { RAX } else { alloc.reg_for_slot(slot)? };
                alloc.vreg_loc[dst as usize] = Some(Loc::Alias(reg));
            }
            IrOp::StoreLocal { .. } | IrOp::Loop => {}
        }
    }
    Some(alloc)
}

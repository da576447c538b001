//! Typed trace IR: a flat list of virtual-register instructions recorded
//! from one counting loop's body, plus the per-vreg type table and the
//! snapshot a guard exit reconstructs interpreter state from.
//!
//! Every vreg in a trace is inferred [`IrType::Int32`] — this JIT never
//! widens a vreg to int64/double the way a general tracing JIT would;
//! instead, `Add`/`Sub`/`Mul` each carry an implicit range guard (emitted by
//! [`super::emitter`]) that exits the trace the moment a result would no
//! longer fit in 32 bits, which is exactly when the interpreter itself would
//! promote to double. Because the recorder only ever linearises one basic
//! block (a single `FOR_COUNT` body, see [`super::recorder::record`]), every
//! guard in a trace shares one [`Snapshot`]: the state as of the start of
//! whichever iteration is currently executing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    Int32,
}

#[derive(Debug, Clone, Copy)]
pub enum IrOp {
    ConstInt { dst: u16, value: i32 },
    LoadLocal { dst: u16, slot: u8 },
    StoreLocal { slot: u8, src: u16 },
    Add { dst: u16, lhs: u16, rhs: u16 },
    Sub { dst: u16, lhs: u16, rhs: u16 },
    Mul { dst: u16, lhs: u16, rhs: u16 },
    /// `IR_LOOP`: marks that recording reached the loop's own back edge
    /// without aborting. Always the last op in a successfully recorded
    /// program; the allocator and emitter both treat it as a no-op.
    Loop,
}

/// What a guard exit needs to hand back to the interpreter: the bytecode pc
/// execution should resume at, and every interpreter-visible local live at
/// that pc, each tagged with its inferred IR type. Built by
/// [`super::regalloc::allocate`] from the same touched-slot list (minus the
/// loop variable, which the allocator aliases to the native loop counter
/// rather than spilling) that determines physical register assignment, so a
/// snapshot's slot order always matches the native code's register layout.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub resume_pc: usize,
    pub live_slots: Vec<(u8, IrType)>,
}

pub struct IrProgram {
    pub ops: Vec<IrOp>,
    pub vreg_count: u16,
    /// Parallel to vreg indices 0..vreg_count; see the module doc for why
    /// every entry is currently `Int32`.
    pub vreg_types: Vec<IrType>,
    /// Local slots the body reads or writes, in order of first appearance.
    /// Includes the loop variable slot, which the allocator special-cases.
    pub touched_slots: Vec<u8>,
}

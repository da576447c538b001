//! Native x86-64 code emission for a compiled counting-loop trace.
//!
//! The emitted function has signature `extern "C" fn(regs: *mut i64, start:
//! i64, end: i64) -> i64`. `regs[i]` holds the current value of
//! `alloc.slots[i]`'s local on entry and exit; the loop counter (and the
//! loop variable it mirrors) lives purely in registers and is returned in
//! `rax`. Past the `n` output cells, `regs` carries `n` shadow cells (one per
//! slot, refreshed at the top of every iteration) plus a shadow counter cell
//! and a deopt-flag cell — the memory-based channel `run_trace` uses to
//! reconstruct interpreter state if a guard fires mid-iteration, without any
//! process-wide mutable state. `r12` is the only callee-saved register this
//! function borrows, so it is pushed on entry and popped before every `ret`.

use super::ir::IrOp;
use super::regalloc::{Allocation, R11, R12, RAX, RDI, Reg};
use crate::jit::ir::IrProgram;

#[derive(Default)]
struct Assembler {
    buf: Vec<u8>,
}

fn reg_low(r: u8) -> u8 {
    r & 0x7
}

fn reg_high(r: u8) -> u8 {
    (r >> 3) & 0x1
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | (reg_low(reg) << 3) | reg_low(rm)
}

fn rex(reg: u8, rm: u8) -> u8 {
    0x48 | (reg_high(reg) << 2) | reg_high(rm)
}

impl Assembler {
    fn mov_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.buf.push(rex(0, dst.0));
        self.buf.push(0xC7);
        self.buf.push(modrm(0b11, 0, dst.0));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(dst.0, src.0));
        self.buf.push(0x8B);
        self.buf.push(modrm(0b11, dst.0, src.0));
    }

    fn load_mem(&mut self, dst: Reg, base: Reg, disp: i8) {
        self.buf.push(rex(dst.0, base.0));
        self.buf.push(0x8B);
        self.buf.push(modrm(0b01, dst.0, base.0));
        self.buf.push(disp as u8);
    }

    fn store_mem(&mut self, base: Reg, disp: i8, src: Reg) {
        self.buf.push(rex(src.0, base.0));
        self.buf.push(0x89);
        self.buf.push(modrm(0b01, src.0, base.0));
        self.buf.push(disp as u8);
    }

    fn add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(src.0, dst.0));
        self.buf.push(0x01);
        self.buf.push(modrm(0b11, src.0, dst.0));
    }

    fn sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(src.0, dst.0));
        self.buf.push(0x29);
        self.buf.push(modrm(0b11, src.0, dst.0));
    }

    fn imul_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(dst.0, src.0));
        self.buf.push(0x0F);
        self.buf.push(0xAF);
        self.buf.push(modrm(0b11, dst.0, src.0));
    }

    fn add_reg_imm32(&mut self, dst: Reg, imm: i32) {
        self.buf.push(rex(0, dst.0));
        self.buf.push(0x81);
        self.buf.push(modrm(0b11, 0, dst.0));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn cmp_reg_reg(&mut self, a: Reg, b: Reg) {
        self.buf.push(rex(b.0, a.0));
        self.buf.push(0x39);
        self.buf.push(modrm(0b11, b.0, a.0));
    }

    /// Sign-extends the low 32 bits of `src` into `dst` (`MOVSXD`). Comparing
    /// the result against the untruncated `src` is the fits-in-i32 test: it
    /// matches `i32::checked_add`/`checked_sub`/`checked_mul` exactly, unlike
    /// x86's own add/sub/imul overflow flag, which only trips on 64-bit
    /// overflow and would never fire for these operands.
    fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.buf.push(rex(dst.0, src.0));
        self.buf.push(0x63);
        self.buf.push(modrm(0b11, dst.0, src.0));
    }

    fn push_reg(&mut self, r: Reg) {
        if reg_high(r.0) != 0 {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 + reg_low(r.0));
    }

    fn pop_reg(&mut self, r: Reg) {
        if reg_high(r.0) != 0 {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 + reg_low(r.0));
    }

    fn jl_rel32(&mut self) -> usize {
        self.buf.push(0x0F);
        self.buf.push(0x8C);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0i32.to_le_bytes());
        pos
    }

    fn jge_rel32(&mut self) -> usize {
        self.buf.push(0x0F);
        self.buf.push(0x8D);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0i32.to_le_bytes());
        pos
    }

    fn jne_rel32(&mut self) -> usize {
        self.buf.push(0x0F);
        self.buf.push(0x85);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0i32.to_le_bytes());
        pos
    }

    fn patch_rel32(&mut self, placeholder: usize, target: usize) {
        let rel = target as i64 - (placeholder as i64 + 4);
        self.buf[placeholder..placeholder + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    fn ret(&mut self) {
        self.buf.push(0xC3);
    }

    /// Emits the range guard for one arithmetic result: bails to a patched-in
    /// target (returned here as a placeholder) the moment `value` no longer
    /// fits in i32, which is exactly when the interpreter would have promoted
    /// the same computation to a double.
    fn guard_fits_i32(&mut self, value: Reg) -> usize {
        self.movsxd(R12, value);
        self.cmp_reg_reg(R12, value);
        self.jne_rel32()
    }
}

fn reg_of(alloc: &Allocation, v: u16) -> Reg {
    alloc.reg_of(v)
}

/// `var_slot` lives in `rax`, the native counter register, for the whole
/// trace: `FOR_COUNT`'s contract is that the loop variable always equals the
/// counter's pre-increment value, so no separate register is needed for it.
pub fn emit(ir: &IrProgram, alloc: &Allocation, var_slot: u8) -> Vec<u8> {
    let mut asm = Assembler::default();
    let n = alloc.slots.len();
    let shadow_base = n;
    let shadow_counter_idx = 2 * n;
    let deopt_flag_idx = 2 * n + 1;

    asm.push_reg(R12);

    // rdx = end -> r11, rsi = start -> rax (System V: arg2=rsi, arg3=rdx).
    asm.mov_reg_reg(R11, Reg(2));
    asm.mov_reg_reg(RAX, Reg(6));

    for (i, &(_, reg)) in alloc.slots.iter().enumerate() {
        asm.load_mem(reg, RDI, (i * 8) as i8);
    }

    // Clear the deopt flag; a guard exit is the only path that sets it.
    asm.mov_reg_imm32(Reg(9), 0);
    asm.store_mem(RDI, (deopt_flag_idx * 8) as i8, Reg(9));

    asm.cmp_reg_reg(RAX, R11);
    let skip = asm.jge_rel32();

    let loop_top = asm.buf.len();

    // Snapshot this iteration's starting state before any arithmetic can
    // change it: if a guard fires partway through the body, these shadow
    // cells hold exactly "locals as of the start of this iteration."
    for (i, &(_, reg)) in alloc.slots.iter().enumerate() {
        asm.store_mem(RDI, ((shadow_base + i) * 8) as i8, reg);
    }
    asm.store_mem(RDI, (shadow_counter_idx * 8) as i8, RAX);

    let mut bail_patches = Vec::new();
    for op in &ir.ops {
        match *op {
            IrOp::ConstInt { dst, value } => asm.mov_reg_imm32(reg_of(alloc, dst), value),
            IrOp::LoadLocal { .. } => {}
            IrOp::StoreLocal { slot, src } => store_local(&mut asm, alloc, var_slot, slot, src),
            IrOp::Add { dst, lhs, rhs } => {
                let (d, l, r) = (reg_of(alloc, dst), reg_of(alloc, lhs), reg_of(alloc, rhs));
                if d != l {
                    asm.mov_reg_reg(d, l);
                }
                asm.add_reg_reg(d, r);
                bail_patches.push(asm.guard_fits_i32(d));
            }
            IrOp::Sub { dst, lhs, rhs } => {
                let (d, l, r) = (reg_of(alloc, dst), reg_of(alloc, lhs), reg_of(alloc, rhs));
                if d != l {
                    asm.mov_reg_reg(d, l);
                }
                asm.sub_reg_reg(d, r);
                bail_patches.push(asm.guard_fits_i32(d));
            }
            IrOp::Mul { dst, lhs, rhs } => {
                let (d, l, r) = (reg_of(alloc, dst), reg_of(alloc, lhs), reg_of(alloc, rhs));
                if d != l {
                    asm.mov_reg_reg(d, l);
                }
                asm.imul_reg_reg(d, r);
                bail_patches.push(asm.guard_fits_i32(d));
            }
            IrOp::Loop => {}
        }
    }
    asm.add_reg_imm32(RAX, 1);
    asm.cmp_reg_reg(RAX, R11);
    let jl = asm.jl_rel32();
    asm.patch_rel32(jl, loop_top);

    let epilogue = asm.buf.len();
    asm.patch_rel32(skip, epilogue);
    for (i, &(_, reg)) in alloc.slots.iter().enumerate() {
        asm.store_mem(RDI, (i * 8) as i8, reg);
    }
    asm.pop_reg(R12);
    asm.ret();

    // Every overflow guard above lands here: leave the output cells alone
    // (they may hold a mid-computation, out-of-range value for this
    // iteration), raise the deopt flag, and return. `run_trace` reads the
    // shadow cells instead of the output cells when this flag is set.
    let bailout = asm.buf.len();
    for p in bail_patches {
        asm.patch_rel32(p, bailout);
    }
    asm.mov_reg_imm32(Reg(9), 1);
    asm.store_mem(RDI, (deopt_flag_idx * 8) as i8, Reg(9));
    asm.pop_reg(R12);
    asm.ret();

    asm.buf
}

fn store_local(asm: &mut Assembler, alloc: &Allocation, var_slot: u8, slot: u8, src: u16) {
    let dst_reg = if slot == var_slot {
        RAX
    } else {
        alloc.slots.iter().find(|(s, _)| *s == slot).map(|(_, r)| *r).expect("store to untouched slot")
    };
    let src_reg = alloc.reg_of(src);
    if dst_reg != src_reg {
        asm.mov_reg_reg(dst_reg, src_reg);
    }
}

//! Records a `FOR_COUNT` loop body into [`IrProgram`], or bails.
//!
//! Only a whitelist of straight-line integer opcodes is supported (no
//! branches, calls, or heap access): anything else aborts recording and the
//! loop stays interpreted. This is deliberately narrower than a general
//! tracing JIT's recorder — see `DESIGN.md` for the scoping rationale. A
//! successful recording always closes with `IrOp::Loop`, the `IR_LOOP`
//! marker for "this is a complete, closed trace."

use lumen_core::{Chunk, OpCode};

use super::ir::{IrOp, IrProgram, IrType};

/// Byte range of a `FOR_COUNT` loop's body, derived purely from the
/// instruction's own encoding (3 slot operands + a 16-bit exit offset,
/// landing just past the matching `LOOP`).
pub fn body_range(chunk: &Chunk, for_count_offset: usize) -> (usize, usize) {
    let exit_rel = chunk.read_u16(for_count_offset + 4) as usize;
    let body_start = for_count_offset + 6;
    let exit_target = for_count_offset + 6 + exit_rel;
    // LOOP is 1 opcode byte + a 16-bit offset = 3 bytes, sitting directly
    // before the exit jump's landing point.
    let body_end = exit_target - 3;
    (body_start, body_end)
}

pub fn record(chunk: &Chunk, start: usize, end: usize, max_len: usize) -> Option<IrProgram> {
    if end <= start {
        return None;
    }
    let mut ops = Vec::new();
    let mut vstack: Vec<u16> = Vec::new();
    let mut touched: Vec<u8> = Vec::new();
    let mut next_vreg: u16 = 0;

    let mut note_touched = |touched: &mut Vec<u8>, slot: u8| {
        if !touched.contains(&slot) {
            touched.push(slot);
        }
    };

    let mut ip = start;
    while ip < end {
        if ops.len() >= max_len {
            return None;
        }
        let op = OpCode::from_u8(chunk.code[ip]);
        ip += 1;
        match op {
            OpCode::GetLocal0 | OpCode::GetLocal1 | OpCode::GetLocal2 | OpCode::GetLocal3 => {
                let slot = op as u8 - OpCode::GetLocal0 as u8;
                note_touched(&mut touched, slot);
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(IrOp::LoadLocal { dst, slot });
                vstack.push(dst);
            }
            OpCode::GetLocal => {
                let slot = chunk.code[ip];
                ip += 1;
                note_touched(&mut touched, slot);
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(IrOp::LoadLocal { dst, slot });
                vstack.push(dst);
            }
            OpCode::SetLocal => {
                let slot = chunk.code[ip];
                ip += 1;
                note_touched(&mut touched, slot);
                let src = *vstack.last()?;
                ops.push(IrOp::StoreLocal { slot, src });
            }
            OpCode::Const0 | OpCode::Const1 | OpCode::Const2 => {
                let value = (op as i32) - (OpCode::Const0 as i32);
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(IrOp::ConstInt { dst, value });
                vstack.push(dst);
            }
            OpCode::Const => {
                let idx = chunk.code[ip] as usize;
                ip += 1;
                let v = chunk.constants[idx];
                if !v.is_int() {
                    return None;
                }
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(IrOp::ConstInt { dst, value: v.as_int() });
                vstack.push(dst);
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul => {
                let rhs = vstack.pop()?;
                let lhs = vstack.pop()?;
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(match op {
                    OpCode::Add => IrOp::Add { dst, lhs, rhs },
                    OpCode::Sub => IrOp::Sub { dst, lhs, rhs },
                    _ => IrOp::Mul { dst, lhs, rhs },
                });
                vstack.push(dst);
            }
            OpCode::Add1 | OpCode::Sub1 => {
                let lhs = vstack.pop()?;
                let one = next_vreg;
                next_vreg += 1;
                ops.push(IrOp::ConstInt { dst: one, value: 1 });
                let dst = next_vreg;
                next_vreg += 1;
                ops.push(if op == OpCode::Add1 {
                    IrOp::Add { dst, lhs, rhs: one }
                } else {
                    IrOp::Sub { dst, lhs, rhs: one }
                });
                vstack.push(dst);
            }
            OpCode::Pop => {
                vstack.pop()?;
            }
            OpCode::Dup => {
                let top = *vstack.last()?;
                vstack.push(top);
            }
            _ => return None,
        }
    }
    ops.push(IrOp::Loop);
    let vreg_types = vec![IrType::Int32; next_vreg as usize];
    Some(IrProgram { ops, vreg_count: next_vreg, vreg_types, touched_slots: touched })
}

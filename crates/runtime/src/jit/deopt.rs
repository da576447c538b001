//! Entry guards and guard-exit state reconstruction for the tracing JIT.
//!
//! A trace records a single basic block (one `FOR_COUNT` body, see
//! `recorder::record`), so every arithmetic guard it contains — the i32
//! range check `emitter::guard_fits_i32` emits after every `Add`/`Sub`/`Mul`
//! — shares one snapshot: the state as of the start of whichever iteration
//! is currently running (see `regalloc::allocate`). `deopt_reconstruct` is
//! this design's answer to restoring interpreter state on guard failure:
//! rather than a process-wide pending-deopt record shared with the emitted
//! code (the reference design in a language with looser aliasing rules),
//! the native function communicates the failure back through an explicit
//! memory channel — shadow cells in the same `regs` buffer it was called
//! with — and `run_trace` threads the reconstructed state back to its
//! caller as a plain return value. At most one guard exit is ever pending at
//! a time because a trace never calls another trace.

use lumen_core::Value;

use super::ir::Snapshot;

/// Every local the trace will manipulate as a native integer must already be
/// an int at the moment the loop is entered. Checked both before the first
/// native entry and before every re-entry into an already-compiled trace,
/// since a slot's type can change between calls — most notably, once a
/// guard exit has promoted it to a double, which naturally keeps that trace
/// from running again until the slot is reassigned back to an int.
pub fn guard_ints(values: &[Value]) -> bool {
    values.iter().all(|v| v.is_int())
}

/// Restores interpreter-visible state from a guard exit. `shadow` holds one
/// `i64` per `snapshot.live_slots` entry — the value that local held at the
/// start of the iteration the trace was executing when a guard failed —
/// and `shadow_counter` holds the loop counter for that same iteration.
///
/// After this call, resuming bytecode execution at `snapshot.resume_pc` (the
/// loop's own `FOR_COUNT` header) re-executes that iteration exactly as the
/// pure interpreter would have, which is what makes a guard exit observably
/// equivalent to a pure-interpreter run from that point on.
pub fn deopt_reconstruct(
    snapshot: &Snapshot,
    shadow: &[i64],
    shadow_counter: i64,
    stack: &mut [Value],
    base: usize,
    counter_slot: u8,
) {
    for (&(slot, _ty), &value) in snapshot.live_slots.iter().zip(shadow) {
        stack[base + slot as usize] = Value::int(value as i32);
    }
    stack[base + counter_slot as usize] = Value::int(shadow_counter as i32);
}

//! The tracing JIT: detects hot `FOR_COUNT` loops, records their body,
//! compiles a native trace, and runs it to completion in place of further
//! interpreted iterations.
//!
//! Scope: this engine traces straight-line integer loop bodies only (see
//! [`recorder::record`]'s whitelist) — no side exits for branches, since the
//! recorder never admits one into a trace in the first place. The guard this
//! JIT does need, and does implement for real, is the i32 range check after
//! every arithmetic op: `run_trace` reads the guard-exit flag a native call
//! leaves behind and, if set, reconstructs interpreter state via
//! [`deopt::deopt_reconstruct`] instead of accepting a truncated result (see
//! [`emitter`] and [`deopt`]). Both the straight-line-only scope and the
//! single-snapshot-per-trace design are recorded in `DESIGN.md`.

pub mod config;
pub mod deopt;
pub mod emitter;
pub mod ir;
pub mod recorder;
pub mod regalloc;

use std::collections::{HashMap, HashSet};

use lumen_core::{Chunk, Value};
use tracing::{debug, trace, warn};

use config::JitConfig;
use ir::Snapshot;

struct CompiledTrace {
    code: *mut libc::c_void,
    len: usize,
    entry: extern "C" fn(*mut i64, i64, i64) -> i64,
    /// `regs[i]` corresponds to the local slot at `slots[i]`, in this order.
    slots: Vec<u8>,
    /// The trace's one guard snapshot; see `regalloc::Allocation::snapshot`.
    snapshot: Snapshot,
}

impl Drop for CompiledTrace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.code, self.len);
        }
    }
}

// `CompiledTrace` owns an executable mmap region and nothing else touches it
// concurrently (the VM is single-threaded), so it is safe to keep across
// calls on the same thread.
unsafe impl Send for CompiledTrace {}

pub struct JitEngine {
    config: JitConfig,
    hot_counts: HashMap<usize, u32>,
    compiled: HashMap<usize, CompiledTrace>,
    blacklisted: HashSet<usize>,
}

impl JitEngine {
    pub fn new(config: JitConfig) -> Self {
        JitEngine { config, hot_counts: HashMap::new(), compiled: HashMap::new(), blacklisted: HashSet::new() }
    }

    /// Called when a backward branch lands back on a `FOR_COUNT` header.
    /// Returns `Some(final_counter)` if a native trace ran the remainder of
    /// the loop to completion (the stack has already been updated to match),
    /// or `None` if the loop should keep being interpreted.
    pub fn on_for_count(
        &mut self,
        offset: usize,
        chunk: &Chunk,
        stack: &mut [Value],
        base: usize,
        counter_slot: u8,
        end_slot: u8,
        var_slot: u8,
    ) -> Option<i32> {
        if !self.config.enabled || self.blacklisted.contains(&offset) {
            return None;
        }

        let counter_v = stack[base + counter_slot as usize];
        let end_v = stack[base + end_slot as usize];
        if !deopt::guard_ints(&[counter_v, end_v]) {
            return None;
        }
        let start = counter_v.as_int();
        let end = end_v.as_int();

        if self.compiled.contains_key(&offset) {
            return self.run_trace(offset, stack, base, counter_slot, var_slot, start, end);
        }

        let count = self.hot_counts.entry(offset).or_insert(0);
        *count += 1;
        if *count < self.config.threshold {
            return None;
        }

        debug!(offset, count = *count, "loop header crossed JIT threshold, attempting to record a trace");
        match self.compile_trace(offset, chunk, var_slot) {
            Some(trace) => {
                self.compiled.insert(offset, trace);
                self.run_trace(offset, stack, base, counter_slot, var_slot, start, end)
            }
            None => {
                debug!(offset, "trace recording or compilation failed, blacklisting loop header");
                self.blacklisted.insert(offset);
                None
            }
        }
    }

    fn compile_trace(&self, offset: usize, chunk: &Chunk, var_slot: u8) -> Option<CompiledTrace> {
        let (body_start, body_end) = recorder::body_range(chunk, offset);
        let program = recorder::record(chunk, body_start, body_end, self.config.max_trace_len)?;
        let alloc = regalloc::allocate(&program, var_slot, offset)?;
        let code_bytes = emitter::emit(&program, &alloc, var_slot);
        let slots: Vec<u8> = alloc.slots.iter().map(|(s, _)| *s).collect();
        let snapshot = alloc.snapshot;

        unsafe {
            let len = code_bytes.len().max(1);
            let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let mapped_len = len.div_ceil(page_size) * page_size;
            let addr = libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                warn!("mmap failed while installing a JIT trace");
                return None;
            }
            std::ptr::copy_nonoverlapping(code_bytes.as_ptr(), addr as *mut u8, code_bytes.len());
            if libc::mprotect(addr, mapped_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(addr, mapped_len);
                warn!("mprotect failed while installing a JIT trace");
                return None;
            }
            let entry: extern "C" fn(*mut i64, i64, i64) -> i64 = std::mem::transmute(addr);
            trace!(offset, bytes = code_bytes.len(), "installed native trace");
            Some(CompiledTrace { code: addr, len: mapped_len, entry, slots, snapshot })
        }
    }

    /// `regs` is laid out as `n` output cells, `n` shadow cells, a shadow
    /// counter cell, and a deopt-flag cell (see `emitter::emit`). On a
    /// normal return the output cells hold the loop's final state; on a
    /// guard exit the flag is set and the shadow cells hold the state as of
    /// the start of the iteration that tripped the guard, which
    /// `deopt::deopt_reconstruct` writes back so the interpreter re-executes
    /// that exact iteration in software.
    fn run_trace(
        &self,
        offset: usize,
        stack: &mut [Value],
        base: usize,
        counter_slot: u8,
        var_slot: u8,
        start: i32,
        end: i32,
    ) -> Option<i32> {
        let trace = self.compiled.get(&offset)?;
        let n = trace.slots.len();
        for &slot in &trace.slots {
            if !deopt::guard_ints(&[stack[base + slot as usize]]) {
                return None;
            }
        }
        let mut regs: Vec<i64> = vec![0; n * 2 + 2];
        for (i, &slot) in trace.slots.iter().enumerate() {
            regs[i] = stack[base + slot as usize].as_int() as i64;
        }

        let final_counter = (trace.entry)(regs.as_mut_ptr(), start as i64, end as i64) as i32;

        if regs[n * 2 + 1] != 0 {
            trace!(offset, "native trace hit an overflow guard, deoptimising to the interpreter");
            let shadow = &regs[n..n * 2];
            deopt::deopt_reconstruct(&trace.snapshot, shadow, regs[n * 2], stack, base, counter_slot);
            return None;
        }

        for (i, &slot) in trace.slots.iter().enumerate() {
            stack[base + slot as usize] = Value::int(regs[i] as i32);
        }
        stack[base + var_slot as usize] = if final_counter > start {
            Value::int(final_counter - 1)
        } else {
            stack[base + var_slot as usize]
        };
        Some(final_counter)
    }
}

//! Compares interpreted and JIT-traced execution of the same counting loop
//! across iteration counts straddling the recording threshold, including the
//! boundary just below and just above it, and an iteration count whose sum
//! overflows i32 so a guard exit is genuinely exercised.
//!
//! The accumulator lives in a function-local, not a top-level `let`: a
//! top-level local compiles to a global (`GET_GLOBAL`/`SET_GLOBAL`), which
//! the recorder bails out of on sight (it only ever records local-slot
//! traffic), so a global accumulator would never actually run on native
//! code and every assertion here would pass vacuously.

use lumen_core::{Heap, ObjString, Value};
use lumen_runtime::{Interpreter, JitConfig, JitEngine};
use proptest::prelude::*;

const THRESHOLD: u32 = 20;

fn global_value(heap: &mut Heap, globals: &[(*mut ObjString, Value)], name: &str) -> Option<Value> {
    let ptr = heap.intern(name);
    globals.iter().find(|(k, _)| *k == ptr).map(|(_, v)| *v)
}

fn sum_loop(n: u32, jit: JitConfig) -> Value {
    let source = format!(
        "fn f()\n  let s = 0\n  for i in 1..{end} do\n    s = s + i\n  end\n  return s\nend\nlet result = f()\n",
        end = n as i64 + 1,
    );
    let mut heap = Heap::new();
    let chunk = lumen_compiler::compile(&source, &mut heap).expect("counting loop always compiles");
    let mut interp = Interpreter::new(chunk, heap, JitEngine::new(jit));
    interp.run().expect("a pure integer sum never raises a runtime error");
    let globals = interp.exportable_globals();
    global_value(&mut interp.heap, &globals, "result").expect("result was just assigned")
}

fn interpreted(n: u32) -> Value {
    sum_loop(n, JitConfig::disabled())
}

fn traced(n: u32) -> Value {
    sum_loop(n, JitConfig { enabled: true, threshold: THRESHOLD, max_trace_len: 256 })
}

fn assert_same_number(n: u32, a: Value, b: Value) {
    assert_eq!(a.is_int(), b.is_int(), "int/double tag mismatch for n={n}: {a:?} vs {b:?}");
    if a.is_int() {
        assert_eq!(a.as_int(), b.as_int(), "n={n}");
    } else {
        assert_eq!(a.as_f64_lossy(), b.as_f64_lossy(), "n={n}");
    }
}

#[test]
fn boundary_just_below_threshold() {
    let n = THRESHOLD - 1;
    assert_same_number(n, interpreted(n), traced(n));
}

#[test]
fn boundary_just_above_threshold() {
    let n = THRESHOLD + 1;
    assert_same_number(n, interpreted(n), traced(n));
}

#[test]
fn zero_iterations() {
    assert_same_number(0, interpreted(0), traced(0));
}

/// `1 + 2 + ... + 1_000_000 = 500_000_500_000`, well past `i32::MAX`. A pure
/// interpreter promotes this sum to a double the moment it overflows; a
/// correct JIT must deoptimise at that same point and land on the same
/// double rather than returning an i32-truncated value.
#[test]
fn overflowing_sum_deoptimises_to_the_same_double() {
    let n = 1_000_000;
    let reference = interpreted(n);
    assert!(!reference.is_int(), "the reference sum should itself have overflowed into a double");
    let jitted = traced(n);
    assert_same_number(n, reference, jitted);
}

proptest! {
    #[test]
    fn traced_matches_interpreted_up_to_ten_times_threshold(n in 0u32..=(THRESHOLD * 10)) {
        let a = interpreted(n);
        let b = traced(n);
        prop_assert_eq!(a.is_int(), b.is_int());
        if a.is_int() {
            prop_assert_eq!(a.as_int(), b.as_int());
        } else {
            prop_assert_eq!(a.as_f64_lossy(), b.as_f64_lossy());
        }
    }
}

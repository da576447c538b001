//! Property: for any arithmetic expression over small ints and doubles built
//! from `+`/`-`/`*`, the interpreter agrees with a reference evaluator that
//! applies the same integer-overflow-promotes-to-double rule.

use lumen_core::{Heap, ObjString, Value};
use lumen_runtime::{Interpreter, JitConfig, JitEngine};
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    Add,
    Sub,
    Mul,
}

impl Op {
    fn token(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
        }
    }
}

#[derive(Clone, Debug)]
enum Expr {
    Int(i32),
    Double(f64),
    Bin(Op, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn render(&self, out: &mut String) {
        match self {
            Expr::Int(n) => out.push_str(&n.to_string()),
            Expr::Double(d) => out.push_str(&format!("{d:?}")),
            Expr::Bin(op, a, b) => {
                out.push('(');
                a.render(out);
                out.push(' ');
                out.push_str(op.token());
                out.push(' ');
                b.render(out);
                out.push(')');
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Num {
    I(i32),
    D(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::I(n) => n as f64,
            Num::D(d) => d,
        }
    }
}

fn eval_ref(e: &Expr) -> Num {
    match e {
        Expr::Int(n) => Num::I(*n),
        Expr::Double(d) => Num::D(*d),
        Expr::Bin(op, a, b) => combine(*op, eval_ref(a), eval_ref(b)),
    }
}

fn combine(op: Op, a: Num, b: Num) -> Num {
    if let (Num::I(x), Num::I(y)) = (a, b) {
        let checked = match op {
            Op::Add => x.checked_add(y),
            Op::Sub => x.checked_sub(y),
            Op::Mul => x.checked_mul(y),
        };
        if let Some(v) = checked {
            return Num::I(v);
        }
    }
    let (x, y) = (a.to_f64(), b.to_f64());
    Num::D(match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Mul => x * y,
    })
}

fn leaf() -> impl Strategy<Value = Expr> {
    prop_oneof![
        (-1000i32..1000).prop_map(Expr::Int),
        (-1000.0f64..1000.0).prop_map(Expr::Double),
    ]
}

fn expr() -> impl Strategy<Value = Expr> {
    let op = prop_oneof![Just(Op::Add), Just(Op::Sub), Just(Op::Mul)];
    leaf().prop_recursive(3, 16, 2, move |inner| {
        (op.clone(), inner.clone(), inner).prop_map(|(op, a, b)| Expr::Bin(op, Box::new(a), Box::new(b)))
    })
}

fn global_value(heap: &mut Heap, globals: &[(*mut ObjString, Value)], name: &str) -> Option<Value> {
    let ptr = heap.intern(name);
    globals.iter().find(|(k, _)| *k == ptr).map(|(_, v)| *v)
}

proptest! {
    #[test]
    fn matches_reference_evaluator(e in expr()) {
        let mut source = String::from("let r = ");
        e.render(&mut source);
        source.push('\n');

        let mut heap = Heap::new();
        let chunk = lumen_compiler::compile(&source, &mut heap).expect("generated expressions are always well-formed");
        let mut interp = Interpreter::new(chunk, heap, JitEngine::new(JitConfig::disabled()));
        interp.run().expect("pure arithmetic never raises a runtime error");

        let globals = interp.exportable_globals();
        let r = global_value(&mut interp.heap, &globals, "r").expect("r was just assigned");

        match eval_ref(&e) {
            Num::I(expected) => {
                prop_assert!(r.is_int(), "expected int {expected}, got {r:?}");
                prop_assert_eq!(r.as_int(), expected);
            }
            Num::D(expected) => {
                prop_assert!(r.is_double(), "expected double {expected}, got {r:?}");
                let actual = r.as_double();
                prop_assert!(
                    (actual - expected).abs() <= expected.abs() * 1e-9 + 1e-9,
                    "expected {expected}, got {actual}"
                );
            }
        }
    }
}

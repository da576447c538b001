//! Throws random sequences of keyword/identifier/literal/operator tokens at
//! the compiler. The only contract under test: `compile` never panics, and
//! whenever it rejects the input it reports at least one line number.

use lumen_core::Heap;
use proptest::prelude::*;

const VOCAB: &[&str] = &[
    "let", "fn", "if", "then", "while", "for", "in", "do", "end", "match", "case", "else",
    "return", "true", "false", "nil", "and", "or", "not",
    "x", "y", "n", "acc", "fact", "0", "1", "2", "10", "-1", "1.5",
    "(", ")", "[", "]", ",", ":", "..",
    "+", "-", "*", "/", "%", "=", "==", "!=", "<", ">", "<=", ">=", "->",
    "\n", "\n\n",
];

fn token() -> impl Strategy<Value = &'static str> {
    prop::sample::select(VOCAB)
}

fn skeleton() -> impl Strategy<Value = String> {
    prop::collection::vec(token(), 0..60).prop_map(|tokens| {
        let mut out = String::new();
        for (i, t) in tokens.iter().enumerate() {
            if i > 0 && *t != "\n" && *t != "\n\n" {
                out.push(' ');
            }
            out.push_str(t);
        }
        out.push('\n');
        out
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn never_panics_and_errors_carry_a_line(source in skeleton()) {
        let mut heap = Heap::new();
        match lumen_compiler::compile(&source, &mut heap) {
            Ok(_) => {}
            Err(errors) => {
                prop_assert!(!errors.is_empty());
                for e in &errors {
                    prop_assert!(e.line >= 1, "compile error with no usable line number: {e}");
                }
            }
        }
    }
}

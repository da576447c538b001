//! Call-frame bookkeeping.

use lumen_core::ObjFunction;

/// One activation record. `base` is the stack index of local slot 0 for this
/// call; every `GET_LOCAL`/`SET_LOCAL` slot operand is relative to it.
pub struct CallFrame {
    /// `None` for the synthetic top-level frame the interpreter starts in.
    pub function: Option<*mut ObjFunction>,
    pub ip: usize,
    pub base: usize,
}

impl CallFrame {
    pub fn top_level() -> Self {
        CallFrame { function: None, ip: 0, base: 0 }
    }

    pub fn for_call(function: *mut ObjFunction, base: usize) -> Self {
        let start = unsafe { (*function).start };
        CallFrame { function: Some(function), ip: start, base }
    }
}

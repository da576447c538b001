//! Heap object layout.
//!
//! Every heap object starts with an [`ObjHeader`] so the collector can walk
//! the heap without knowing a pointer's concrete type: `type tag`, `mark
//! bit`, and `next` form an intrusive singly-linked list of every live
//! allocation, threaded through by [`crate::heap::Heap`].

use crate::value::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    String,
    Array,
    Dict,
    Bytes,
    Range,
    Function,
}

#[repr(C)]
pub struct ObjHeader {
    pub ty: ObjType,
    pub marked: bool,
    pub next: *mut ObjHeader,
}

/// An interned, immutable, length-prefixed string.
#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u64,
    pub chars: Box<str>,
}

/// A contiguous, growable buffer of values with amortised O(1) push/pop.
#[repr(C)]
pub struct ObjArray {
    pub header: ObjHeader,
    pub values: Vec<Value>,
}

/// One slot of the dictionary's open-addressing table.
struct DictEntry {
    key: *mut ObjString,
    value: Value,
}

/// An open-addressed hash table keyed by interned string identity.
///
/// Interning makes key comparison during probing a pointer compare: two
/// `ObjString` pointers are equal iff they were interned from equal content.
#[repr(C)]
pub struct ObjDict {
    pub header: ObjHeader,
    slots: Vec<Option<DictEntry>>,
    pub count: usize,
}

const DICT_MAX_LOAD: f64 = 0.75;

impl ObjDict {
    pub fn new() -> Self {
        ObjDict {
            header: ObjHeader { ty: ObjType::Dict, marked: false, next: std::ptr::null_mut() },
            slots: Vec::new(),
            count: 0,
        }
    }

    fn find_slot(slots: &[Option<DictEntry>], key: *mut ObjString, hash: u64) -> usize {
        let cap = slots.len() as u64;
        let mut index = hash % cap;
        loop {
            match &slots[index as usize] {
                None => return index as usize,
                Some(entry) if entry.key == key => return index as usize,
                _ => index = (index + 1) % cap,
            }
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.slots.is_empty() { 8 } else { self.slots.len() * 2 };
        let mut new_slots: Vec<Option<DictEntry>> = (0..new_cap).map(|_| None).collect();
        for entry in self.slots.drain(..).flatten() {
            let hash = unsafe { (*entry.key).hash };
            let idx = Self::find_slot(&new_slots, entry.key, hash);
            new_slots[idx] = Some(entry);
        }
        self.slots = new_slots;
    }

    pub fn insert(&mut self, key: *mut ObjString, value: Value) {
        if self.slots.is_empty() || (self.count + 1) as f64 > self.slots.len() as f64 * DICT_MAX_LOAD {
            self.grow();
        }
        let hash = unsafe { (*key).hash };
        let idx = Self::find_slot(&self.slots, key, hash);
        if self.slots[idx].is_none() {
            self.count += 1;
        }
        self.slots[idx] = Some(DictEntry { key, value });
    }

    pub fn get(&self, key: *mut ObjString, hash: u64) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.slots, key, hash);
        self.slots[idx].as_ref().map(|e| e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjString, Value)> + '_ {
        self.slots.iter().filter_map(|s| s.as_ref().map(|e| (e.key, e.value)))
    }
}

impl Default for ObjDict {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw byte buffer, used by the `bytes`/encoding/hashing built-ins.
#[repr(C)]
pub struct ObjBytes {
    pub header: ObjHeader,
    pub data: Vec<u8>,
}

/// A half-open `start..end` integer range with a cursor for iteration.
#[repr(C)]
pub struct ObjRange {
    pub header: ObjHeader,
    pub start: i32,
    pub current: i32,
    pub end: i32,
}

/// A compiled function: arity, local-slot count, and the offset into the
/// single program-wide [`crate::chunk::Chunk`] where its body begins.
#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub local_count: u16,
    pub start: usize,
    pub name: Option<*mut ObjString>,
}

impl fmt::Debug for ObjHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjHeader {{ ty: {:?}, marked: {} }}", self.ty, self.marked)
    }
}

/// # Safety
/// `ptr` must point to a live object whose tag matches `T`'s layout
/// (i.e. it was produced by [`crate::heap::Heap::alloc_*`] for that type).
pub unsafe fn header_of<T>(ptr: *const T) -> *const ObjHeader {
    ptr as *const ObjHeader
}

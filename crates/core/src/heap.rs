//! The object heap: allocation, string interning, and a mark-sweep collector.
//!
//! Roots are supplied by the caller (the interpreter knows about the value
//! stack, call frames, constants, and globals; the heap doesn't). Collection
//! is a plain two-phase mark-then-sweep over an intrusive linked list of
//! every live allocation, which is the only approach that reclaims the
//! cycles arrays and dictionaries can form.

use crate::object::{ObjArray, ObjBytes, ObjDict, ObjFunction, ObjHeader, ObjRange, ObjString, ObjType};
use crate::value::Value;
use std::collections::HashMap;

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Starting GC trigger. Doubled after each collection.
const INITIAL_GC_THRESHOLD: usize = 1 << 20;

pub struct Heap {
    objects: *mut ObjHeader,
    strings: HashMap<u64, Vec<*mut ObjString>>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: std::ptr::null_mut(),
            strings: HashMap::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.next_gc
    }

    fn link<T>(&mut self, boxed: Box<T>, ty: ObjType) -> *mut T
    where
        T: HasHeader,
    {
        self.bytes_allocated += std::mem::size_of::<T>();
        let ptr = Box::into_raw(boxed);
        let header = ptr as *mut ObjHeader;
        unsafe {
            debug_assert_eq!((*header).ty as u8, ty as u8);
            (*header).next = self.objects;
        }
        self.objects = header;
        ptr
    }

    /// Interns `s`, returning the canonical `ObjString` pointer for its
    /// content. Calling this twice with equal content returns the same
    /// pointer, which is what makes `EQ` on strings a pointer compare.
    pub fn intern(&mut self, s: &str) -> *mut ObjString {
        let hash = fnv1a(s.as_bytes());
        if let Some(bucket) = self.strings.get(&hash) {
            for &candidate in bucket {
                if unsafe { (*candidate).chars.as_ref() } == s {
                    return candidate;
                }
            }
        }
        let obj = Box::new(ObjString {
            header: ObjHeader { ty: ObjType::String, marked: false, next: std::ptr::null_mut() },
            hash,
            chars: s.to_string().into_boxed_str(),
        });
        let ptr = self.link(obj, ObjType::String);
        self.strings.entry(hash).or_default().push(ptr);
        ptr
    }

    pub fn alloc_array(&mut self, values: Vec<Value>) -> *mut ObjArray {
        let obj = Box::new(ObjArray {
            header: ObjHeader { ty: ObjType::Array, marked: false, next: std::ptr::null_mut() },
            values,
        });
        self.link(obj, ObjType::Array)
    }

    pub fn alloc_dict(&mut self) -> *mut ObjDict {
        let mut obj = Box::new(ObjDict::new());
        obj.header.next = std::ptr::null_mut();
        self.link(obj, ObjType::Dict)
    }

    pub fn alloc_bytes(&mut self, data: Vec<u8>) -> *mut ObjBytes {
        let obj = Box::new(ObjBytes {
            header: ObjHeader { ty: ObjType::Bytes, marked: false, next: std::ptr::null_mut() },
            data,
        });
        self.link(obj, ObjType::Bytes)
    }

    pub fn alloc_range(&mut self, start: i32, end: i32) -> *mut ObjRange {
        let obj = Box::new(ObjRange {
            header: ObjHeader { ty: ObjType::Range, marked: false, next: std::ptr::null_mut() },
            start,
            current: start,
            end,
        });
        self.link(obj, ObjType::Range)
    }

    pub fn alloc_function(
        &mut self,
        arity: u8,
        local_count: u16,
        start: usize,
        name: Option<*mut ObjString>,
    ) -> *mut ObjFunction {
        let obj = Box::new(ObjFunction {
            header: ObjHeader { ty: ObjType::Function, marked: false, next: std::ptr::null_mut() },
            arity,
            local_count,
            start,
            name,
        });
        self.link(obj, ObjType::Function)
    }

    /// Runs one mark-sweep cycle. `roots` must cover every `Value` reachable
    /// without going through the heap itself: the value stack, call-frame
    /// locals, the constant pool, and the globals table.
    pub fn collect<I: IntoIterator<Item = Value>>(&mut self, roots: I) {
        let mut gray: Vec<*mut ObjHeader> = Vec::new();
        for root in roots {
            if root.is_object() {
                gray.push(root.as_object());
            }
        }
        while let Some(obj) = gray.pop() {
            unsafe {
                if (*obj).marked {
                    continue;
                }
                (*obj).marked = true;
                match (*obj).ty {
                    ObjType::Array => {
                        let arr = obj as *mut ObjArray;
                        for v in &(*arr).values {
                            if v.is_object() {
                                gray.push(v.as_object());
                            }
                        }
                    }
                    ObjType::Dict => {
                        let dict = obj as *mut ObjDict;
                        for (key, value) in (*dict).iter() {
                            gray.push(key as *mut ObjHeader);
                            if value.is_object() {
                                gray.push(value.as_object());
                            }
                        }
                    }
                    ObjType::Function => {
                        let func = obj as *mut ObjFunction;
                        if let Some(name) = (*func).name {
                            gray.push(name as *mut ObjHeader);
                        }
                    }
                    ObjType::String | ObjType::Bytes | ObjType::Range => {}
                }
            }
        }
        self.sweep();
        self.next_gc = self.bytes_allocated * 2;
    }

    fn sweep(&mut self) {
        let mut prev: *mut ObjHeader = std::ptr::null_mut();
        let mut obj = self.objects;
        while !obj.is_null() {
            unsafe {
                if (*obj).marked {
                    (*obj).marked = false;
                    prev = obj;
                    obj = (*obj).next;
                } else {
                    let unreached = obj;
                    obj = (*obj).next;
                    if prev.is_null() {
                        self.objects = obj;
                    } else {
                        (*prev).next = obj;
                    }
                    self.free(unreached);
                }
            }
        }
    }

    fn free(&mut self, ptr: *mut ObjHeader) {
        unsafe {
            match (*ptr).ty {
                ObjType::String => {
                    let s = ptr as *mut ObjString;
                    let hash = (*s).hash;
                    if let Some(bucket) = self.strings.get_mut(&hash) {
                        bucket.retain(|&p| p != s);
                    }
                    self.bytes_allocated -= std::mem::size_of::<ObjString>();
                    drop(Box::from_raw(s));
                }
                ObjType::Array => {
                    self.bytes_allocated -= std::mem::size_of::<ObjArray>();
                    drop(Box::from_raw(ptr as *mut ObjArray));
                }
                ObjType::Dict => {
                    self.bytes_allocated -= std::mem::size_of::<ObjDict>();
                    drop(Box::from_raw(ptr as *mut ObjDict));
                }
                ObjType::Bytes => {
                    self.bytes_allocated -= std::mem::size_of::<ObjBytes>();
                    drop(Box::from_raw(ptr as *mut ObjBytes));
                }
                ObjType::Range => {
                    self.bytes_allocated -= std::mem::size_of::<ObjRange>();
                    drop(Box::from_raw(ptr as *mut ObjRange));
                }
                ObjType::Function => {
                    self.bytes_allocated -= std::mem::size_of::<ObjFunction>();
                    drop(Box::from_raw(ptr as *mut ObjFunction));
                }
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut obj = self.objects;
        while !obj.is_null() {
            let next = unsafe { (*obj).next };
            self.free(obj);
            obj = next;
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker for types whose first field is an [`ObjHeader`], satisfied via
/// `#[repr(C)]` layout on every `Obj*` type.
trait HasHeader {}
impl HasHeader for ObjString {}
impl HasHeader for ObjArray {}
impl HasHeader for ObjDict {}
impl HasHeader for ObjBytes {}
impl HasHeader for ObjRange {}
impl HasHeader for ObjFunction {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_canonical() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let mut heap = Heap::new();
        let s = heap.intern("temp");
        let v = Value::object(s as *mut ObjHeader);
        assert!(v.is_object());
        heap.collect(std::iter::empty());
        // `s` was not rooted, so it should have been swept.
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn rooted_objects_survive() {
        let mut heap = Heap::new();
        let s = heap.intern("kept");
        let v = Value::object(s as *mut ObjHeader);
        heap.collect(std::iter::once(v));
        assert!(heap.bytes_allocated() > 0);
    }

    #[test]
    fn array_cycle_is_collected() {
        let mut heap = Heap::new();
        let inner = heap.alloc_array(Vec::new());
        unsafe {
            (*inner).values.push(Value::object(inner as *mut ObjHeader));
        }
        heap.collect(std::iter::empty());
        assert_eq!(heap.bytes_allocated(), 0);
    }
}

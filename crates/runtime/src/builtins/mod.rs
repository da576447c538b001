//! Host built-ins: the fixed table of native routines `OpCode::Builtin`
//! dispatches into, plus the `display` stringifier shared by `print` and
//! string concatenation.
//!
//! Each routine is grounded on the crate named in its section: `std::fs` for
//! file I/O, `serde_json` for JSON, `base64`/`hex` for encoding, `sha2` for
//! hashing, hand-rolled flat-`Vec<f64>` math for the tensor routines (no
//! corpus dependency fits a VM-level matrix op), and `ureq` for HTTP,
//! feature-gated the way the workspace already gates it.

use base64::Engine as _;
use lumen_core::{Heap, ObjArray, ObjBytes, ObjDict, ObjHeader, ObjRange, ObjString, ObjType, Value};
use sha2::Digest;

use crate::error::RuntimeError;

type BResult = Result<Value, RuntimeError>;

pub fn call(builtin: lumen_core::Builtin, args: &[Value], heap: &mut Heap) -> BResult {
    use lumen_core::Builtin::*;
    match builtin {
        Print => print(args[0], heap),
        Len => len(args[0]),
        ReadFile => read_file(args[0], heap),
        WriteFile => write_file(args[0], args[1]),
        FileExists => file_exists(args[0]),
        JsonEncode => json_encode(args[0], heap),
        JsonDecode => json_decode(args[0], heap),
        B64Encode => b64_encode(args[0], heap),
        B64Decode => b64_decode(args[0], heap),
        HexEncode => hex_encode(args[0], heap),
        HexDecode => hex_decode(args[0], heap),
        Sha256 => sha256(args[0], heap),
        MatMul => mat_mul(args[0], args[1], heap),
        MatTranspose => mat_transpose(args[0], heap),
        VecDot => vec_dot(args[0], args[1]),
        HttpGet => http_get(args[0], heap),
        NowMs => now_ms(),
        SleepMs => sleep_ms(args[0]),
    }
}

fn obj_ty(v: Value) -> Option<ObjType> {
    v.is_object().then(|| unsafe { (*v.as_object()).ty })
}

fn as_str(v: Value) -> Option<String> {
    if obj_ty(v) != Some(ObjType::String) {
        return None;
    }
    let s = v.as_object() as *mut ObjString;
    Some(unsafe { (*s).chars.to_string() })
}

fn as_bytes(v: Value) -> Option<Vec<u8>> {
    match obj_ty(v) {
        Some(ObjType::Bytes) => Some(unsafe { (*(v.as_object() as *mut ObjBytes)).data.clone() }),
        Some(ObjType::String) => as_str(v).map(|s| s.as_bytes().to_vec()),
        _ => None,
    }
}

fn string_value(heap: &mut Heap, s: &str) -> Value {
    Value::object(heap.intern(s) as *mut ObjHeader)
}

fn bytes_value(heap: &mut Heap, b: Vec<u8>) -> Value {
    Value::object(heap.alloc_bytes(b) as *mut ObjHeader)
}

// ---- display -------------------------------------------------------------

/// Renders any value the way `print` and `+`-concatenation show it.
pub fn display(v: Value) -> String {
    if v.is_int() {
        return v.as_int().to_string();
    }
    if v.is_double() {
        return format_double(v.as_double());
    }
    if v.is_nil() {
        return "nil".to_string();
    }
    if v.is_bool() {
        return v.as_bool().to_string();
    }
    match obj_ty(v) {
        Some(ObjType::String) => as_str(v).unwrap(),
        Some(ObjType::Array) => {
            let arr = v.as_object() as *mut ObjArray;
            let parts: Vec<String> = unsafe { (*arr).values.iter().map(|&e| display_element(e)).collect() };
            format!("[{}]", parts.join(", "))
        }
        Some(ObjType::Dict) => {
            let dict = v.as_object() as *mut ObjDict;
            let parts: Vec<String> = unsafe {
                (*dict).iter().map(|(k, val)| format!("{}: {}", (*k).chars, display_element(val))).collect()
            };
            format!("{{{}}}", parts.join(", "))
        }
        Some(ObjType::Bytes) => {
            let bytes = v.as_object() as *mut ObjBytes;
            format!("bytes({})", hex::encode(unsafe { &(*bytes).data }))
        }
        Some(ObjType::Range) => {
            let r = v.as_object() as *mut ObjRange;
            format!("{}..{}", unsafe { (*r).start }, unsafe { (*r).end })
        }
        Some(ObjType::Function) => {
            let f = v.as_object() as *mut lumen_core::ObjFunction;
            match unsafe { (*f).name } {
                Some(name) => format!("<fn {}>", unsafe { (*name).chars.clone() }),
                None => "<fn>".to_string(),
            }
        }
        None => unreachable!("every Value is a double, int, singleton, or object"),
    }
}

/// Strings nest in quotes when shown as an array/dict element, matching the
/// `repr`-vs-`display` distinction most scripting languages make for `print`.
fn display_element(v: Value) -> String {
    if obj_ty(v) == Some(ObjType::String) {
        format!("\"{}\"", as_str(v).unwrap())
    } else {
        display(v)
    }
}

fn format_double(d: f64) -> String {
    if d.is_infinite() {
        return if d > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if d.is_nan() {
        return "nan".to_string();
    }
    if d == d.trunc() && d.abs() < 1e15 {
        format!("{d:.1}")
    } else {
        d.to_string()
    }
}

// ---- core ------------------------------------------------------------------

fn print(v: Value, heap: &mut Heap) -> BResult {
    println!("{}", display(v));
    let _ = heap;
    Ok(Value::NIL)
}

fn len(v: Value) -> BResult {
    let n = match obj_ty(v) {
        Some(ObjType::String) => as_str(v).unwrap().chars().count(),
        Some(ObjType::Array) => unsafe { (*(v.as_object() as *mut ObjArray)).values.len() },
        Some(ObjType::Dict) => unsafe { (*(v.as_object() as *mut ObjDict)).count },
        Some(ObjType::Bytes) => unsafe { (*(v.as_object() as *mut ObjBytes)).data.len() },
        Some(ObjType::Range) => {
            let r = v.as_object() as *mut ObjRange;
            unsafe { ((*r).end - (*r).start).max(0) as usize }
        }
        _ => return Err(RuntimeError::TypeMismatch { op: "len", detail: "value has no length".to_string() }),
    };
    Ok(Value::int(n as i32))
}

// ---- filesystem (std::fs) --------------------------------------------------

fn read_file(path: Value, heap: &mut Heap) -> BResult {
    let path = as_str(path).ok_or(RuntimeError::TypeMismatch { op: "read_file", detail: "path must be a string".to_string() })?;
    let contents = std::fs::read_to_string(path).map_err(|e| RuntimeError::Io(e.to_string()))?;
    Ok(string_value(heap, &contents))
}

fn write_file(path: Value, contents: Value) -> BResult {
    let path = as_str(path).ok_or(RuntimeError::TypeMismatch { op: "write_file", detail: "path must be a string".to_string() })?;
    let contents = as_str(contents)
        .ok_or(RuntimeError::TypeMismatch { op: "write_file", detail: "contents must be a string".to_string() })?;
    std::fs::write(path, contents).map_err(|e| RuntimeError::Io(e.to_string()))?;
    Ok(Value::NIL)
}

fn file_exists(path: Value) -> BResult {
    let path = as_str(path).ok_or(RuntimeError::TypeMismatch { op: "file_exists", detail: "path must be a string".to_string() })?;
    Ok(Value::bool(std::path::Path::new(&path).exists()))
}

// ---- json (serde_json) ------------------------------------------------------

fn json_encode(v: Value, heap: &mut Heap) -> BResult {
    let j = to_json(v)?;
    let text = serde_json::to_string(&j).map_err(|e| RuntimeError::Encoding(e.to_string()))?;
    Ok(string_value(heap, &text))
}

fn json_decode(v: Value, heap: &mut Heap) -> BResult {
    let text = as_str(v).ok_or(RuntimeError::TypeMismatch { op: "json_decode", detail: "expected a string".to_string() })?;
    let j: serde_json::Value = serde_json::from_str(&text).map_err(|e| RuntimeError::Encoding(e.to_string()))?;
    Ok(from_json(heap, &j))
}

fn to_json(v: Value) -> Result<serde_json::Value, RuntimeError> {
    if v.is_nil() {
        return Ok(serde_json::Value::Null);
    }
    if v.is_bool() {
        return Ok(serde_json::Value::Bool(v.as_bool()));
    }
    if v.is_int() {
        return Ok(serde_json::Value::from(v.as_int()));
    }
    if v.is_double() {
        return Ok(serde_json::Number::from_f64(v.as_double())
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    match obj_ty(v) {
        Some(ObjType::String) => Ok(serde_json::Value::String(as_str(v).unwrap())),
        Some(ObjType::Array) => {
            let arr = v.as_object() as *mut ObjArray;
            let items: Result<Vec<_>, _> = unsafe { (*arr).values.iter().map(|&e| to_json(e)).collect() };
            Ok(serde_json::Value::Array(items?))
        }
        Some(ObjType::Dict) => {
            let dict = v.as_object() as *mut ObjDict;
            let mut map = serde_json::Map::new();
            for (k, val) in unsafe { (*dict).iter() } {
                map.insert(unsafe { (*k).chars.to_string() }, to_json(val)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        _ => Err(RuntimeError::Encoding("value is not JSON-encodable".to_string())),
    }
}

fn from_json(heap: &mut Heap, j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::NIL,
        serde_json::Value::Bool(b) => Value::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(i) = i32::try_from(i) {
                    return Value::int(i);
                }
            }
            Value::double(n.as_f64().unwrap_or(f64::NAN))
        }
        serde_json::Value::String(s) => string_value(heap, s),
        serde_json::Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(|item| from_json(heap, item)).collect();
            Value::object(heap.alloc_array(values) as *mut ObjHeader)
        }
        serde_json::Value::Object(map) => {
            let ptr = heap.alloc_dict();
            for (k, val) in map {
                let key = heap.intern(k);
                let value = from_json(heap, val);
                unsafe { (*ptr).insert(key, value) };
            }
            Value::object(ptr as *mut ObjHeader)
        }
    }
}

// ---- encoding (base64, hex) -------------------------------------------------

fn b64_encode(v: Value, heap: &mut Heap) -> BResult {
    let bytes = as_bytes(v).ok_or(RuntimeError::TypeMismatch { op: "b64_encode", detail: "expected a string or bytes".to_string() })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(string_value(heap, &encoded))
}

fn b64_decode(v: Value, heap: &mut Heap) -> BResult {
    let s = as_str(v).ok_or(RuntimeError::TypeMismatch { op: "b64_decode", detail: "expected a string".to_string() })?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(s).map_err(|e| RuntimeError::Encoding(e.to_string()))?;
    Ok(bytes_value(heap, decoded))
}

fn hex_encode(v: Value, heap: &mut Heap) -> BResult {
    let bytes = as_bytes(v).ok_or(RuntimeError::TypeMismatch { op: "hex_encode", detail: "expected a string or bytes".to_string() })?;
    Ok(string_value(heap, &hex::encode(bytes)))
}

fn hex_decode(v: Value, heap: &mut Heap) -> BResult {
    let s = as_str(v).ok_or(RuntimeError::TypeMismatch { op: "hex_decode", detail: "expected a string".to_string() })?;
    let decoded = hex::decode(s).map_err(|e| RuntimeError::Encoding(e.to_string()))?;
    Ok(bytes_value(heap, decoded))
}

fn sha256(v: Value, heap: &mut Heap) -> BResult {
    let bytes = as_bytes(v).ok_or(RuntimeError::TypeMismatch { op: "sha256", detail: "expected a string or bytes".to_string() })?;
    let digest = sha2::Sha256::digest(&bytes);
    Ok(string_value(heap, &hex::encode(digest)))
}

// ---- tensor math (hand-rolled, no corpus crate applies) ---------------------

fn to_row_vec(v: Value) -> Result<Vec<f64>, RuntimeError> {
    if obj_ty(v) != Some(ObjType::Array) {
        return Err(RuntimeError::TypeMismatch { op: "mat", detail: "expected an array".to_string() });
    }
    let arr = v.as_object() as *mut ObjArray;
    unsafe { (*arr).values.iter() }
        .map(|&e| {
            if e.is_number() {
                Ok(e.as_f64_lossy())
            } else {
                Err(RuntimeError::TypeMismatch { op: "mat", detail: "matrix elements must be numbers".to_string() })
            }
        })
        .collect()
}

fn to_matrix(v: Value) -> Result<Vec<Vec<f64>>, RuntimeError> {
    if obj_ty(v) != Some(ObjType::Array) {
        return Err(RuntimeError::TypeMismatch { op: "mat", detail: "expected an array of arrays".to_string() });
    }
    let arr = v.as_object() as *mut ObjArray;
    unsafe { (*arr).values.iter() }.map(|&row| to_row_vec(row)).collect()
}

fn matrix_value(heap: &mut Heap, rows: Vec<Vec<f64>>) -> Value {
    let row_values: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let cells: Vec<Value> = row.into_iter().map(Value::double).collect();
            Value::object(heap.alloc_array(cells) as *mut ObjHeader)
        })
        .collect();
    Value::object(heap.alloc_array(row_values) as *mut ObjHeader)
}

fn mat_mul(a: Value, b: Value, heap: &mut Heap) -> BResult {
    let a = to_matrix(a)?;
    let b = to_matrix(b)?;
    let (rows, inner) = (a.len(), a.first().map_or(0, Vec::len));
    let cols = b.first().map_or(0, Vec::len);
    if b.len() != inner {
        return Err(RuntimeError::TypeMismatch { op: "mat_mul", detail: "inner dimensions do not match".to_string() });
    }
    let mut out = vec![vec![0.0; cols]; rows];
    for (i, out_row) in out.iter_mut().enumerate() {
        for (k, &a_ik) in a[i].iter().enumerate() {
            for (j, cell) in out_row.iter_mut().enumerate() {
                *cell += a_ik * b[k][j];
            }
        }
    }
    Ok(matrix_value(heap, out))
}

fn mat_transpose(v: Value, heap: &mut Heap) -> BResult {
    let m = to_matrix(v)?;
    let rows = m.len();
    let cols = m.first().map_or(0, Vec::len);
    let mut out = vec![vec![0.0; rows]; cols];
    for (i, row) in m.iter().enumerate() {
        for (j, &cell) in row.iter().enumerate() {
            out[j][i] = cell;
        }
    }
    Ok(matrix_value(heap, out))
}

fn vec_dot(a: Value, b: Value) -> BResult {
    let a = to_row_vec(a)?;
    let b = to_row_vec(b)?;
    if a.len() != b.len() {
        return Err(RuntimeError::TypeMismatch { op: "vec_dot", detail: "vectors must have equal length".to_string() });
    }
    let dot: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
    Ok(Value::double(dot))
}

// ---- http (ureq, feature-gated) --------------------------------------------

#[cfg(feature = "http")]
fn http_get(v: Value, heap: &mut Heap) -> BResult {
    let url = as_str(v).ok_or(RuntimeError::TypeMismatch { op: "http_get", detail: "expected a url string".to_string() })?;
    let body = ureq::get(&url).call().map_err(|e| RuntimeError::Io(e.to_string()))?.into_string().map_err(|e| RuntimeError::Io(e.to_string()))?;
    Ok(string_value(heap, &body))
}

#[cfg(not(feature = "http"))]
fn http_get(_v: Value, _heap: &mut Heap) -> BResult {
    Err(RuntimeError::Io("http_get is unavailable: built without the \"http\" feature".to_string()))
}

// ---- clock (std::time) -----------------------------------------------------

fn now_ms() -> BResult {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| RuntimeError::Io(e.to_string()))?
        .as_millis();
    Ok(Value::double(millis as f64))
}

fn sleep_ms(v: Value) -> BResult {
    if !v.is_number() {
        return Err(RuntimeError::TypeMismatch { op: "sleep_ms", detail: "expected a number".to_string() });
    }
    let ms = v.as_f64_lossy().max(0.0);
    std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    Ok(Value::NIL)
}

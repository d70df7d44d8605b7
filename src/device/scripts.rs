//! Small MicroPython programs executed in raw mode. Each one prints its result between
//! the begin/end sentinels from a try/except so the end marker is always emitted.

use crate::device::sentinel::{BEGIN, END, ERROR, ERR_PREFIX, META};

/// Bytes read per `f.read()` on the device when streaming a file back.
pub const READ_CHUNK_BYTES: usize = 512;
/// Width of the base64 string literals embedded in write scripts.
pub const WRITE_CHUNK_CHARS: usize = 700;

/// Quotes `value` as a string literal valid in both JSON and Python source.
pub fn py_str(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

fn py_str_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", quoted.join(","))
}

/// Splits `s` into pieces of at most `width` bytes; `s` must be ASCII (base64).
pub fn split_ascii(s: &str, width: usize) -> Vec<&str> {
    let width = width.max(1);
    let mut out = Vec::with_capacity(s.len() / width + 1);
    let mut rest = s;
    while !rest.is_empty() {
        let (head, tail) = rest.split_at(width.min(rest.len()));
        out.push(head);
        rest = tail;
    }
    out
}

pub fn list_dir(path: &str) -> String {
    format!(
        r#"
import uos, ujson
P = {path}
def _join(base, name):
    if base in ("", "/"):
        return "/" + name
    return base.rstrip("/") + "/" + name
def _isdir(mode):
    try:
        return (mode & 0x4000) != 0
    except:
        return False
out = []
try:
    for n in uos.listdir(P):
        p = _join(P, n)
        t = "file"
        sz = None
        try:
            st = uos.stat(p)
            if _isdir(st[0]): t = "dir"
            sz = st[6]
        except:
            pass
        out.append({{"name": n, "path": p, "type": t, "size": sz}})
except Exception as e:
    out = [{{"name": "<error>", "path": P, "type": "error", "size": None, "msg": str(e)}}]
print("{BEGIN}")
print(ujson.dumps(out))
print("{END}")
"#,
        path = py_str(path),
    )
}

pub fn read_file(path: &str) -> String {
    format!(
        r#"
import ubinascii, ujson
P = {path}
print("{BEGIN}")
try:
    with open(P, "rb") as f:
        while True:
            b = f.read({chunk})
            if not b: break
            print(ubinascii.b2a_base64(b).decode().strip())
    print("{META}" + ujson.dumps({{"ok": True, "path": P}}))
except Exception as e:
    print("{ERROR}" + str(e))
print("{END}")
"#,
        path = py_str(path),
        chunk = READ_CHUNK_BYTES,
    )
}

pub fn write_file(path: &str, b64_chunks: &[&str]) -> String {
    format!(
        r#"
import ubinascii
P = {path}
DATA = {data}
print("{BEGIN}")
try:
    with open(P, "wb") as f:
        for s in DATA:
            f.write(ubinascii.a2b_base64(s))
    print("OK")
except Exception as e:
    print("{ERR_PREFIX}" + str(e))
print("{END}")
"#,
        path = py_str(path),
        data = py_str_list(b64_chunks),
    )
}

/// One `uos` call wrapped in the OK / ERR: status convention.
fn uos_call(bindings: &[(&str, &str)], call: &str) -> String {
    let mut script = String::from("\nimport uos\n");
    for (name, value) in bindings {
        script.push_str(&format!("{} = {}\n", name, py_str(value)));
    }
    script.push_str(&format!(
        "print(\"{BEGIN}\")\ntry:\n    {call}; print(\"OK\")\nexcept Exception as e:\n    print(\"{ERR_PREFIX}\" + str(e))\nprint(\"{END}\")\n"
    ));
    script
}

pub fn remove_file(path: &str) -> String {
    uos_call(&[("P", path)], "uos.remove(P)")
}

pub fn remove_dir(path: &str) -> String {
    uos_call(&[("P", path)], "uos.rmdir(P)")
}

pub fn make_dir(path: &str) -> String {
    uos_call(&[("P", path)], "uos.mkdir(P)")
}

pub fn rename(from: &str, to: &str) -> String {
    uos_call(&[("A", from), ("B", to)], "uos.rename(A, B)")
}

fn indent(code: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    code.split('\n')
        .map(|line| format!("{}{}", pad, line.trim_end_matches('\r')))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wraps a user program so that an uncaught exception is printed and the end marker still follows.
pub fn run_program(code: &str) -> String {
    format!(
        "try:\n{body}\n    pass\nexcept Exception as e:\n    import sys\n    sys.print_exception(e)\n\nprint(\"{END}\")\n",
        body = indent(code, 4),
    )
}

/// Stores a program on the device, then executes the stored copy.
pub fn save_and_run(path: &str, b64_chunks: &[&str]) -> String {
    format!(
        r#"
import ubinascii
P = {path}
DATA = {data}
try:
    with open(P, "wb") as f:
        for s in DATA:
            f.write(ubinascii.a2b_base64(s))
    print("Saved: " + P)
    exec(open(P).read(), globals())
except Exception as e:
    import sys
    sys.print_exception(e)
print("{END}")
"#,
        path = py_str(path),
        data = py_str_list(b64_chunks),
    )
}

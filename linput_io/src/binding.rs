//! Script-facing surface of [`LoaderInput`].
//!
//! Scripts see the handle as a class with the methods listed in [`METHODS`].
//! [`call_method`] checks arity, fills in defaults, converts [`Value`]
//! arguments and maps results back:
//!
//! - "no data" becomes `None`
//! - `open` and `open_memory` report failure as `False`
//! - positions, sizes and loader status are `int`
//! - `read` and `readbytes` produce `bytes`, `gets`, `getz` and `filename`
//!   produce `str`
//!
//! Calls on an unopened handle raise `ValueError`.

use crate::error::StreamError;
use crate::loader_input::{LoaderInput, STREAM_CAPSULE_TAG};
use crate::native::{StreamRef, Whence};
use linput_runtime::{RuntimeGuard, Value};
use smallvec::SmallVec;
use thiserror::Error;

/// Seek relative to the start of the stream.
pub const SEEK_SET: i64 = 0;
/// Seek relative to the current position.
pub const SEEK_CUR: i64 = 1;
/// Seek relative to the end of the stream.
pub const SEEK_END: i64 = 2;

/// Error raised into the calling script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("AttributeError: 'LoaderInput' object has no attribute '{0}'")]
    AttributeError(String),

    #[error("ValueError: {0}")]
    ValueError(String),
}

impl From<StreamError> for CallError {
    fn from(e: StreamError) -> Self {
        CallError::ValueError(e.to_string())
    }
}

/// A script-visible method.
#[derive(Debug)]
pub struct MethodDef {
    pub name: &'static str,
    pub signature: &'static str,
    pub doc: &'static str,
    /// Positional arguments the caller must supply.
    pub required: usize,
    /// Values for trailing optional arguments.
    pub defaults: &'static [Value],
}

impl MethodDef {
    #[inline]
    pub fn max_args(&self) -> usize {
        self.required + self.defaults.len()
    }
}

/// Every method scripts can call, in display order.
pub static METHODS: &[MethodDef] = &[
    MethodDef {
        name: "open",
        signature: "open(filename, remote=False) -> bool",
        doc: "Open a file, closing the current one first. With remote set, \
              the name is resolved in the remote namespace.",
        required: 1,
        defaults: &[Value::Bool(false)],
    },
    MethodDef {
        name: "open_memory",
        signature: "open_memory(start, size=0) -> bool",
        doc: "Open a window of process memory at start. A size of 0 reads \
              up to the end of the mapped memory. The current input is kept \
              when this fails.",
        required: 1,
        defaults: &[Value::Int(0)],
    },
    MethodDef {
        name: "set_linput",
        signature: "set_linput(linput) -> None",
        doc: "Attach a stream owned elsewhere. It is never closed through \
              this object.",
        required: 1,
        defaults: &[],
    },
    MethodDef {
        name: "close",
        signature: "close() -> None",
        doc: "Close the input. Attached streams are only detached.",
        required: 0,
        defaults: &[],
    },
    MethodDef {
        name: "seek",
        signature: "seek(pos, whence=SEEK_SET) -> int",
        doc: "Move to pos relative to whence. Returns the new position.",
        required: 1,
        defaults: &[Value::Int(SEEK_SET)],
    },
    MethodDef {
        name: "tell",
        signature: "tell() -> int",
        doc: "Current position.",
        required: 0,
        defaults: &[],
    },
    MethodDef {
        name: "size",
        signature: "size() -> int",
        doc: "Input length, or -1 if unknown.",
        required: 0,
        defaults: &[],
    },
    MethodDef {
        name: "read",
        signature: "read(size) -> bytes | None",
        doc: "Read up to size bytes. None if nothing could be read.",
        required: 1,
        defaults: &[],
    },
    MethodDef {
        name: "gets",
        signature: "gets(len) -> str | None",
        doc: "Read one line of at most len - 1 bytes. None at end of input.",
        required: 1,
        defaults: &[],
    },
    MethodDef {
        name: "getz",
        signature: "getz(sz, fpos=-1) -> str | None",
        doc: "Read a zero-terminated string of at most sz - 1 bytes, after \
              moving to fpos unless it is -1.",
        required: 1,
        defaults: &[Value::Int(-1)],
    },
    MethodDef {
        name: "get_byte",
        signature: "get_byte() -> int | None",
        doc: "Read one byte. None at end of input.",
        required: 0,
        defaults: &[],
    },
    MethodDef {
        name: "readbytes",
        signature: "readbytes(size, big_endian) -> bytes | None",
        doc: "Read size bytes stored in the given byte order. 2, 4 and 8 byte \
              values come back in host order.",
        required: 2,
        defaults: &[],
    },
    MethodDef {
        name: "file2base",
        signature: "file2base(pos, ea1, ea2, patchable) -> int",
        doc: "Load the input from pos into addresses ea1..ea2. With patchable, \
              the file offset of each address is remembered. Returns 1 on \
              success and 0 on a read error.",
        required: 4,
        defaults: &[],
    },
    MethodDef {
        name: "opened",
        signature: "opened() -> bool",
        doc: "Whether an input is open.",
        required: 0,
        defaults: &[],
    },
    MethodDef {
        name: "filename",
        signature: "filename() -> str",
        doc: "Name of the open input.",
        required: 0,
        defaults: &[],
    },
];

/// Find a method by script name.
pub fn lookup(name: &str) -> Option<&'static MethodDef> {
    METHODS.iter().find(|m| m.name == name)
}

/// Method names, as `dir()` would list them.
pub fn dir() -> impl Iterator<Item = &'static str> {
    METHODS.iter().map(|m| m.name)
}

/// Signature and documentation of `name`.
pub fn doc(name: &str) -> Option<String> {
    lookup(name).map(|m| format!("{}\n\n{}", m.signature, m.doc))
}

// =============================================================================
// Dispatch
// =============================================================================

type Args = SmallVec<[Value; 4]>;

/// Call `name` on `input` with positional `args`.
pub fn call_method(
    input: &mut LoaderInput,
    rt: &mut RuntimeGuard<'_>,
    name: &str,
    args: &[Value],
) -> Result<Value, CallError> {
    let def = lookup(name).ok_or_else(|| CallError::AttributeError(name.to_string()))?;
    let args = normalize(def, args)?;
    let a = Arguments { def, args: &args };

    let result = match def.name {
        "open" => {
            let path = a.string(0)?;
            let remote = a.flag(1)?;
            Value::Bool(input.open(rt, path, remote).is_ok())
        }
        "open_memory" => {
            let start = a.address(0)?;
            let size = a.address(1)?;
            Value::Bool(input.open_memory(rt, start, size).is_ok())
        }
        "set_linput" => {
            let stream = a.stream(0)?;
            input.attach(rt, stream);
            Value::None
        }
        "close" => {
            input.close(rt);
            Value::None
        }
        "seek" => {
            let pos = a.int(0)?;
            let whence = a.whence(1)?;
            Value::Int(input.seek(rt, pos, whence)?)
        }
        "tell" => Value::Int(input.tell(rt)?),
        "size" => Value::Int(input.size(rt)?),
        "read" => {
            let n = a.count(0)?;
            let data = input.read(rt, n)?;
            bytes_or_none(rt, data)
        }
        "gets" => {
            let n = a.count(0)?;
            let line = input.read_line(rt, n)?;
            str_or_none(rt, line)
        }
        "getz" => {
            let n = a.count(0)?;
            let pos = match a.int(1)? {
                -1 => None,
                pos => Some(pos),
            };
            let text = input.read_cstring(rt, n, pos)?;
            str_or_none(rt, text)
        }
        "get_byte" => match input.read_byte(rt)? {
            Some(b) => Value::Int(i64::from(b)),
            None => Value::None,
        },
        "readbytes" => {
            let n = a.count(0)?;
            let big_endian = a.flag(1)?;
            let data = input.read_swapped(rt, n, big_endian)?;
            bytes_or_none(rt, data)
        }
        "file2base" => {
            let pos = a.int(0)?;
            let start = a.address(1)?;
            let end = a.address(2)?;
            let patchable = a.flag(3)?;
            Value::Int(i64::from(
                input.copy_range_into_address_space(rt, pos, start, end, patchable)?,
            ))
        }
        "opened" => Value::Bool(input.is_open()),
        "filename" => rt.new_str(input.filename().as_bytes()),
        other => return Err(CallError::AttributeError(other.to_string())),
    };
    Ok(result)
}

/// Check arity and append defaults for omitted trailing arguments.
fn normalize(def: &MethodDef, args: &[Value]) -> Result<Args, CallError> {
    if args.len() < def.required || args.len() > def.max_args() {
        return Err(CallError::TypeError(arity_message(def, args.len())));
    }
    let mut full: Args = args.iter().cloned().collect();
    let supplied_defaults = args.len() - def.required;
    full.extend(def.defaults[supplied_defaults..].iter().cloned());
    Ok(full)
}

fn arity_message(def: &MethodDef, given: usize) -> String {
    let expected = if def.defaults.is_empty() {
        format!("exactly {}", def.required)
    } else {
        format!("from {} to {}", def.required, def.max_args())
    };
    format!(
        "{}() takes {} positional arguments but {} were given",
        def.name, expected, given
    )
}

fn bytes_or_none(rt: &mut RuntimeGuard<'_>, data: Option<Vec<u8>>) -> Value {
    data.map_or(Value::None, |d| rt.new_bytes(&d))
}

fn str_or_none(rt: &mut RuntimeGuard<'_>, data: Option<Vec<u8>>) -> Value {
    data.map_or(Value::None, |d| rt.new_str(&d))
}

/// Typed access to normalized arguments.
struct Arguments<'a> {
    def: &'a MethodDef,
    args: &'a [Value],
}

impl Arguments<'_> {
    fn mismatch(&self, index: usize, expected: &str) -> CallError {
        let got = self.args.get(index).map_or("nothing", Value::type_name);
        CallError::TypeError(format!(
            "{}() argument {} must be {}, not {}",
            self.def.name,
            index + 1,
            expected,
            got
        ))
    }

    fn int(&self, index: usize) -> Result<i64, CallError> {
        self.args
            .get(index)
            .and_then(Value::as_int)
            .ok_or_else(|| self.mismatch(index, "int"))
    }

    fn count(&self, index: usize) -> Result<usize, CallError> {
        let n = self.int(index)?;
        usize::try_from(n).map_err(|_| {
            CallError::TypeError(format!(
                "{}() argument {} must be non-negative, got {}",
                self.def.name,
                index + 1,
                n
            ))
        })
    }

    fn address(&self, index: usize) -> Result<u64, CallError> {
        let n = self.int(index)?;
        u64::try_from(n).map_err(|_| self.mismatch(index, "an address"))
    }

    fn flag(&self, index: usize) -> Result<bool, CallError> {
        self.args
            .get(index)
            .and_then(Value::as_bool)
            .ok_or_else(|| self.mismatch(index, "bool"))
    }

    fn string(&self, index: usize) -> Result<&str, CallError> {
        self.args
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| self.mismatch(index, "str"))
    }

    fn whence(&self, index: usize) -> Result<Whence, CallError> {
        let raw = self.int(index)?;
        Whence::from_raw(raw).ok_or_else(|| {
            CallError::ValueError(format!("invalid whence ({}, should be 0, 1 or 2)", raw))
        })
    }

    /// A stream capsule or a raw non-zero reference.
    fn stream(&self, index: usize) -> Result<StreamRef, CallError> {
        let value = self.args.get(index);
        let from_capsule = value
            .and_then(Value::as_capsule)
            .and_then(|c| c.address_if(STREAM_CAPSULE_TAG))
            .map(StreamRef::new);
        let from_int = value
            .and_then(Value::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .and_then(StreamRef::from_raw);
        from_capsule
            .or(from_int)
            .ok_or_else(|| self.mismatch(index, "a stream capsule"))
    }
}

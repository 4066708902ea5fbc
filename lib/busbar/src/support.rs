use std::io;

pub type BusResult<T> = Result<T, BusError>;

/// Outcome of one nonblocking operation. `Wait` means no progress is
/// possible right now and the caller should poll for readiness; a fault
/// carries the failure kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    Wait,
    Fault(Fault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    InvalidArgument,
    NotConnected,
    ChildProcess,
    NoBufferSpace,
    PermissionDenied,
    Busy,
    TimedOut,
    Protocol,
    AlreadyExists,
    WrongProtocol,
    NotFound,
    NotSupported,
    NoSuchFile,
    ConnectionRefused,
    Wire { name: String, message: String },
    Io(io::ErrorKind),
}

impl From<Fault> for BusError {
    #[inline]
    fn from(fault: Fault) -> Self {
        BusError::Fault(fault)
    }
}

impl From<io::Error> for BusError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => BusError::Wait,
            io::ErrorKind::NotFound => BusError::Fault(Fault::NoSuchFile),
            io::ErrorKind::ConnectionRefused => BusError::Fault(Fault::ConnectionRefused),
            kind => BusError::Fault(Fault::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for BusResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(BusError::Wait) => false,
            _ => true,
        }
    }
}

/// Verdict returned by dispatch callbacks: `Yes` consumes the message and
/// short-circuits the remaining pipeline, `No` passes it on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Handled {
    No,
    Yes,
}

/// Advances a serial counter, skipping the reserved value zero.
#[inline]
pub(crate) fn next_serial(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 {
        *counter = 1;
    }
    *counter
}

const MAX_NAME_LEN: usize = 255;
const MAX_SIGNATURE_LEN: usize = 255;
const MAX_CONTAINER_DEPTH: usize = 32;

/// Validates an absolute, `/`-separated object path.
pub fn object_path_is_valid(path: &str) -> bool {
    if path.is_empty() || path.len() > MAX_NAME_LEN || !path.starts_with('/') {
        return false;
    }

    if path == "/" {
        return true;
    }

    if path.ends_with('/') {
        return false;
    }

    let mut last_sep = true;
    for b in path.bytes().skip(1) {
        match b {
            b'/' => {
                if last_sep {
                    return false;
                }
                last_sep = true;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => last_sep = false,
            _ => return false,
        }
    }

    true
}

/// Validates a dotted interface or error name (at least two elements).
pub fn interface_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let mut elements = 0;
    for element in name.split('.') {
        if element.is_empty() || element.bytes().next().map_or(true, |b| b.is_ascii_digit()) {
            return false;
        }
        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return false;
        }
        elements += 1;
    }

    elements >= 2
}

/// Validates a single member (method, property or signal) name.
pub fn member_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    if name.bytes().next().map_or(true, |b| b.is_ascii_digit()) {
        return false;
    }

    name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Validates a peer name: either a broker-assigned unique name (`:x.y`) or
/// a dotted well-known name.
pub fn bus_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    if let Some(rest) = name.strip_prefix(':') {
        let mut elements = 0;
        for element in rest.split('.') {
            if element.is_empty()
                || !element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            {
                return false;
            }
            elements += 1;
        }
        return elements >= 2;
    }

    let mut elements = 0;
    for element in name.split('.') {
        if element.is_empty() || element.bytes().next().map_or(true, |b| b.is_ascii_digit()) {
            return false;
        }
        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return false;
        }
        elements += 1;
    }

    elements >= 2
}

/// Validates a sequence of complete type signatures.
pub fn signature_is_valid(signature: &str) -> bool {
    if signature.len() > MAX_SIGNATURE_LEN || !signature.is_ascii() {
        return false;
    }

    let bytes = signature.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        match single_type(bytes, pos, 0) {
            Some(next) => pos = next,
            None => return false,
        }
    }

    true
}

/// Splits a signature into its complete single types. Returns `None` when
/// the signature is malformed.
pub fn signature_split(signature: &str) -> Option<Vec<&str>> {
    if signature.len() > MAX_SIGNATURE_LEN || !signature.is_ascii() {
        return None;
    }

    let bytes = signature.as_bytes();
    let mut parts = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let next = single_type(bytes, pos, 0)?;
        parts.push(&signature[pos..next]);
        pos = next;
    }

    Some(parts)
}

/// Scans one complete type starting at `pos`, returning the position one
/// past its end.
fn single_type(bytes: &[u8], pos: usize, depth: usize) -> Option<usize> {
    if depth > MAX_CONTAINER_DEPTH {
        return None;
    }

    match *bytes.get(pos)? {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' | b'v' => Some(pos + 1),
        b'a' => {
            if bytes.get(pos + 1) == Some(&b'{') {
                // Dict entry: basic key followed by one complete value type
                let key = pos + 2;
                match *bytes.get(key)? {
                    b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's'
                    | b'o' | b'g' | b'h' => (),
                    _ => return None,
                }
                let value_end = single_type(bytes, key + 1, depth + 1)?;
                if bytes.get(value_end) == Some(&b'}') {
                    Some(value_end + 1)
                } else {
                    None
                }
            } else {
                single_type(bytes, pos + 1, depth + 1)
            }
        }
        b'(' => {
            let mut inner = pos + 1;
            if bytes.get(inner) == Some(&b')') {
                return None;
            }
            while bytes.get(inner) != Some(&b')') {
                inner = single_type(bytes, inner, depth + 1)?;
            }
            Some(inner + 1)
        }
        _ => None,
    }
}

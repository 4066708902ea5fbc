use std::fs;
use std::io;

#[macro_export]
macro_rules! choose {
    ($cond: expr => $true_val: expr, $false_val: expr) => {{
        if $cond {
            $true_val
        } else {
            $false_val
        }
    }};
}

/// Reads the system machine identifier (32 lowercase hex characters).
pub fn machine_id() -> io::Result<String> {
    parse_machine_id(&fs::read_to_string("/etc/machine-id")?)
}

/// Validates and normalizes a raw machine identifier string.
pub fn parse_machine_id(raw: &str) -> io::Result<String> {
    let id = raw.trim();

    if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed machine id",
        ));
    }

    Ok(id.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_machine_id() {
        let id = parse_machine_id("0123456789abcdef0123456789ABCDEF\n").unwrap();
        assert_eq!(id, "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_parse_machine_id_rejects_short() {
        assert!(parse_machine_id("abcd").is_err());
    }

    #[test]
    fn test_parse_machine_id_rejects_nonhex() {
        assert!(parse_machine_id("0123456789abcdef0123456789abcdeg").is_err());
    }
}

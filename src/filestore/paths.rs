use unicode_normalization::UnicodeNormalization;

use super::error::{FilestoreError, FilestoreResult};

/// Separator between ancestor names in a derived path.
pub const SEPARATOR: char = '/';

/// Characters that may not appear in an entry name.
pub const RESERVED_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Longest accepted name, in bytes after normalization.
pub const MAX_NAME_BYTES: usize = 255;

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

/// Validate an entry name and return its canonical form:
/// - surrounding whitespace trimmed, NFC-normalized
/// - non-empty, at most `MAX_NAME_BYTES`
/// - none of `\ / : * ? " < > |`, no control characters
/// - not `.` or `..`
pub fn validate_name(raw: &str) -> FilestoreResult<String> {
    let invalid = |reason: &'static str| FilestoreError::InvalidName { name: raw.to_string(), reason };
    let name = normalize_nfc(raw.trim());
    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(invalid("name is too long"));
    }
    if name.chars().any(|c| RESERVED_CHARS.contains(&c)) {
        return Err(invalid("name contains a reserved character"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name contains a control character"));
    }
    if name == "." || name == ".." {
        return Err(invalid("'.' and '..' are not allowed as names"));
    }
    Ok(name)
}

/// Join a parent's path and a child name. The root has the empty path, so a root-level
/// entry's path is `/<name>`.
pub fn join_path(parent_path: &str, name: &str) -> String {
    let mut out = String::with_capacity(parent_path.len() + 1 + name.len());
    out.push_str(parent_path);
    out.push(SEPARATOR);
    out.push_str(name);
    out
}

/// Build a path from root-to-self ordered names.
pub fn path_from_names<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().fold(String::new(), |acc, n| join_path(&acc, n))
}

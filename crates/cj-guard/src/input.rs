use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InputError {
    #[error("invalid project name: {0}")]
    ProjectName(String),
    #[error("payload too large ({size} > {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("payload nesting too deep (max {0})")]
    PayloadTooDeep(usize),
    #[error("payload is not valid json: {0}")]
    PayloadInvalid(String),
    #[error("file too large ({size} > {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

const MAX_PROJECT_NAME: usize = 64;
const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
const MAX_PAYLOAD_DEPTH: usize = 32;

/// PEP 503-ish project name: starts alphanumeric, then alphanumerics plus
/// `-`, `_`, `.`.
pub fn validate_project_name(name: &str) -> Result<(), InputError> {
    if name.is_empty() {
        return Err(InputError::ProjectName("empty".into()));
    }
    if name.len() > MAX_PROJECT_NAME {
        return Err(InputError::ProjectName(format!(
            "longer than {MAX_PROJECT_NAME} chars"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("non-empty");
    if !first.is_ascii_alphanumeric() {
        return Err(InputError::ProjectName(
            "must start with a letter or digit".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(InputError::ProjectName(
            "only letters, digits, `-`, `_`, `.` allowed".into(),
        ));
    }
    Ok(())
}

/// Validate an external JSON payload: bounded size, parses, bounded nesting.
pub fn validate_json_payload(raw: &str) -> Result<Value, InputError> {
    if raw.len() > MAX_PAYLOAD_BYTES {
        return Err(InputError::PayloadTooLarge {
            size: raw.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| InputError::PayloadInvalid(e.to_string()))?;
    if depth(&value) > MAX_PAYLOAD_DEPTH {
        return Err(InputError::PayloadTooDeep(MAX_PAYLOAD_DEPTH));
    }
    Ok(value)
}

pub fn validate_file_size(size: u64, max: u64) -> Result<(), InputError> {
    if size > max {
        return Err(InputError::FileTooLarge { size, max });
    }
    Ok(())
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

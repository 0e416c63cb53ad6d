use chrono::NaiveDate;

pub const ARCHIVE_FILE_PREFIX: &str = "capture";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdError {
    reason: String,
}

impl SessionIdError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SessionIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for SessionIdError {}

/// Session ids end up in file names, so they must be a single safe path component.
pub fn validate_session_id(session_id: &str) -> Result<(), SessionIdError> {
    if session_id.trim().is_empty() {
        return Err(SessionIdError::new("session id cannot be empty"));
    }
    if session_id != session_id.trim() {
        return Err(SessionIdError::new(
            "session id cannot have leading or trailing whitespace",
        ));
    }
    if session_id.contains('/') || session_id.contains('\\') {
        return Err(SessionIdError::new(
            "session id cannot contain path separators",
        ));
    }
    if session_id == "." || session_id == ".." {
        return Err(SessionIdError::new("session id cannot be `.` or `..`"));
    }
    if session_id.chars().any(char::is_control) {
        return Err(SessionIdError::new(
            "session id cannot contain control characters",
        ));
    }

    Ok(())
}

/// `capture-<YYYY-MM-DD>-<session>.zip`
pub fn archive_file_name(session_id: &str, date: NaiveDate) -> String {
    format!(
        "{ARCHIVE_FILE_PREFIX}-{}-{session_id}.zip",
        date.format("%Y-%m-%d")
    )
}

pub fn json_file_name(session_id: &str, date: NaiveDate) -> String {
    format!(
        "{ARCHIVE_FILE_PREFIX}-{}-{session_id}.json",
        date.format("%Y-%m-%d")
    )
}

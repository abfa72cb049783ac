use thiserror::Error;

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}

/// Failures on the decode path. These never leave the coordinator; they are
/// logged, counted and the offending frame or header is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The outer envelope is structurally invalid. The whole inbound
    /// message is dropped.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// A header, or the payload it carries, does not parse. Only that header
    /// is dropped. Tags are 0 when the header itself was unreadable.
    #[error("malformed payload for {type_family}/{type_id}: {reason}")]
    MalformedPayload {
        type_family: u32,
        type_id: u32,
        reason: String,
    },
}

impl DecodeError {
    pub fn frame(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub fn payload(type_family: u32, type_id: u32, reason: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            type_family,
            type_id,
            reason: reason.to_string(),
        }
    }
}

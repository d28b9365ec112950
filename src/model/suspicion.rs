//! 诊断结论（suspicion）
//!
//! 级别全序：Info < Warning < Critical < Fatal。

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SuspicionLevel {
    #[default]
    Info,
    Warning,
    Critical,
    Fatal,
}

impl fmt::Display for SuspicionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuspicionLevel::Info => "INFO",
            SuspicionLevel::Warning => "WARNING",
            SuspicionLevel::Critical => "CRITICAL",
            SuspicionLevel::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspicion {
    pub level: SuspicionLevel,
    pub message: String,
}

impl Suspicion {
    pub fn new(level: SuspicionLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for Suspicion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

//! Durability mode configuration
//!
//! Controls how far each journal append is pushed before it returns.

use std::fmt;

/// Sync behaviour of journal appends
///
/// | Mode | per append | Data Loss Window |
/// |------|------------|------------------|
/// | Standard | flush to the OS | OS crash / power loss |
/// | Always | flush + fsync | Zero |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Flush every append to the operating system (the default)
    #[default]
    Standard,
    /// fsync after every append
    ///
    /// Use when data loss is unacceptable even on power failure.
    Always,
}

impl DurabilityMode {
    /// Whether each append is fsynced
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Configuration name of the mode
    pub fn name(&self) -> &'static str {
        match self {
            DurabilityMode::Standard => "standard",
            DurabilityMode::Always => "always",
        }
    }

    /// Parse a configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(DurabilityMode::Standard),
            "always" => Some(DurabilityMode::Always),
            _ => None,
        }
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(DurabilityMode::from_name("always"), Some(DurabilityMode::Always));
        assert_eq!(DurabilityMode::from_name("standard"), Some(DurabilityMode::Standard));
        assert_eq!(DurabilityMode::from_name("cache"), None);
        assert!(DurabilityMode::Always.requires_immediate_fsync());
        assert!(!DurabilityMode::default().requires_immediate_fsync());
    }
}

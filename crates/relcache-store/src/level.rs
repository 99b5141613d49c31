use serde::{Deserialize, Serialize};
use std::fmt;

/// Where and how cached block bytes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLevel {
    pub use_memory: bool,
    pub use_disk: bool,
    /// Keep the in-memory copy as serialized bytes instead of a decoded
    /// block. Disk copies are always serialized.
    pub serialized: bool,
    pub replication: u32,
}

impl StorageLevel {
    pub const MEMORY_ONLY: StorageLevel = StorageLevel {
        use_memory: true,
        use_disk: false,
        serialized: false,
        replication: 1,
    };

    pub const MEMORY_ONLY_SER: StorageLevel = StorageLevel {
        use_memory: true,
        use_disk: false,
        serialized: true,
        replication: 1,
    };

    pub const MEMORY_AND_DISK: StorageLevel = StorageLevel {
        use_memory: true,
        use_disk: true,
        serialized: false,
        replication: 1,
    };

    pub const MEMORY_AND_DISK_SER: StorageLevel = StorageLevel {
        use_memory: true,
        use_disk: true,
        serialized: true,
        replication: 1,
    };

    pub const DISK_ONLY: StorageLevel = StorageLevel {
        use_memory: false,
        use_disk: true,
        serialized: true,
        replication: 1,
    };

    pub fn with_replication(mut self, replication: u32) -> Self {
        self.replication = replication;
        self
    }

    pub fn is_valid(&self) -> bool {
        (self.use_memory || self.use_disk) && self.replication >= 1
    }
}

impl Default for StorageLevel {
    fn default() -> Self {
        StorageLevel::MEMORY_AND_DISK
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tier = match (self.use_memory, self.use_disk) {
            (true, true) => "memory+disk",
            (true, false) => "memory",
            (false, true) => "disk",
            (false, false) => "none",
        };
        let form = if self.serialized {
            "serialized"
        } else {
            "deserialized"
        };
        write!(f, "{} ({}, {}x)", tier, form, self.replication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_valid() {
        for level in [
            StorageLevel::MEMORY_ONLY,
            StorageLevel::MEMORY_ONLY_SER,
            StorageLevel::MEMORY_AND_DISK,
            StorageLevel::MEMORY_AND_DISK_SER,
            StorageLevel::DISK_ONLY,
        ] {
            assert!(level.is_valid(), "{} should be valid", level);
        }
    }

    #[test]
    fn test_invalid_levels() {
        let nowhere = StorageLevel {
            use_memory: false,
            use_disk: false,
            serialized: false,
            replication: 1,
        };
        assert!(!nowhere.is_valid());
        assert!(!StorageLevel::MEMORY_ONLY.with_replication(0).is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StorageLevel::MEMORY_AND_DISK.to_string(),
            "memory+disk (deserialized, 1x)"
        );
    }
}

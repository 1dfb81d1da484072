//! Host memory lookup for percentage-based settings.

use sysinfo::System;

/// Source of the host's total memory
pub trait HostMemory: Send + Sync {
    fn total_bytes(&self) -> u64;
}

/// Reads total memory from the running system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl HostMemory for SystemMemory {
    fn total_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory()
    }
}

/// Fixed amount, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl HostMemory for FixedMemory {
    fn total_bytes(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_memory_is_nonzero() {
        assert!(SystemMemory.total_bytes() > 0);
    }
}

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::instructions::instructions::WordType;

#[derive(Clone, Debug, PartialEq)]
pub enum MemoryInitError {
    InvalidAddress(i64),
    ValueOutOfRange { address: i64, value: i64 },
}

impl Display for MemoryInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryInitError::InvalidAddress(address) => {
                write!(f, "Invalid memory address {}", address)
            }
            MemoryInitError::ValueOutOfRange { address, value } => {
                write!(f, "Value {} at address {} does not fit in 16 bits", value, address)
            }
        }
    }
}

impl Error for MemoryInitError {}

/// Flat word-addressable memory: a sparse map from address to 16-bit value.
/// Unwritten addresses read as 0.
#[derive(Clone, Debug, Default)]
pub struct MemorySubsystem {
    cells: BTreeMap<u32, WordType>,
}

impl MemorySubsystem {
    pub fn new() -> MemorySubsystem {
        MemorySubsystem { cells: BTreeMap::new() }
    }

    pub fn read(&self, address: u16) -> WordType {
        self.cells.get(&(address as u32)).copied().unwrap_or(0)
    }

    pub fn write(&mut self, address: u16, value: WordType) {
        self.cells.insert(address as u32, value);
    }

    /// Replaces the entries given. Every entry is validated before any is
    /// applied so a failing call leaves the memory untouched.
    pub fn init(&mut self, entries: &[(i64, i64)]) -> Result<(), MemoryInitError> {
        for &(address, value) in entries {
            if address < 0 || address > u32::MAX as i64 {
                return Err(MemoryInitError::InvalidAddress(address));
            }
            if !(0..=WordType::MAX as i64).contains(&value) {
                return Err(MemoryInitError::ValueOutOfRange { address, value });
            }
        }
        for &(address, value) in entries {
            self.cells.insert(address as u32, value as WordType);
        }
        Ok(())
    }

    pub fn cells(&self) -> &BTreeMap<u32, WordType> {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_reads_zero() {
        let memory = MemorySubsystem::new();
        assert_eq!(memory.read(0), 0);
        assert_eq!(memory.read(u16::MAX), 0);
    }

    #[test]
    fn test_init_and_read() {
        let mut memory = MemorySubsystem::new();
        memory.init(&[(0, 10), (200, 65535)]).unwrap();
        assert_eq!(memory.read(0), 10);
        assert_eq!(memory.read(200), 65535);
    }

    #[test]
    fn test_init_rejects_negative_address() {
        let mut memory = MemorySubsystem::new();
        let err = memory.init(&[(0, 1), (-1, 2)]).unwrap_err();
        assert_eq!(err, MemoryInitError::InvalidAddress(-1));
        // nothing was applied
        assert_eq!(memory.read(0), 0);
    }

    #[test]
    fn test_init_rejects_wide_value() {
        let mut memory = MemorySubsystem::new();
        let err = memory.init(&[(4, 65536)]).unwrap_err();
        assert_eq!(err, MemoryInitError::ValueOutOfRange { address: 4, value: 65536 });
    }
}

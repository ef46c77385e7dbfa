use crate::instructions::instructions::{RegisterType, RobIndex, GENERAL_REG_CNT};

/// The Register Alias Table. Each architectural register maps either to
/// `None` ("architectural": the committed register file holds the current
/// value) or to the ROB slot that owns the pending write. Issue of a
/// writing instruction overwrites the mapping unconditionally; commit
/// clears it only while it still points at the committing slot.
#[derive(Clone, Debug)]
pub struct RAT {
    table: Vec<Option<RobIndex>>,
}

impl RAT {
    pub fn new() -> RAT {
        RAT { table: vec![None; GENERAL_REG_CNT] }
    }

    pub fn get(&self, reg: RegisterType) -> Option<RobIndex> {
        self.table[reg as usize]
    }

    pub fn update(&mut self, reg: RegisterType, rob_index: RobIndex) {
        self.table[reg as usize] = Some(rob_index);
    }

    pub fn set(&mut self, reg: RegisterType, mapping: Option<RobIndex>) {
        self.table[reg as usize] = mapping;
    }

    /// Resets the mapping back to architectural, but only if it still points
    /// at the given ROB slot.
    pub fn clear_mapping(&mut self, reg: RegisterType, rob_index: RobIndex) {
        if self.table[reg as usize] == Some(rob_index) {
            self.table[reg as usize] = None;
        }
    }

    pub fn flush(&mut self) {
        for entry in &mut self.table {
            *entry = None;
        }
    }

    pub fn table(&self) -> &[Option<RobIndex>] {
        &self.table
    }
}

impl Default for RAT {
    fn default() -> Self {
        Self::new()
    }
}

use std::rc::Rc;

use crate::instructions::instructions::{Instr, Opcode, RegisterType, RobIndex, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ROBSlotState {
    // the initial state
    IDLE,
    // occupied; the instruction is in flight
    ISSUED,
    // the result has been written back; the slot is ready to commit
    EXECUTED,
}

/// Resolved control outcome of a BEQ, CALL or RET.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BranchOutcome {
    pub taken: bool,
    pub target: u16,
    pub return_address: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct ROBSlot {
    pub index: RobIndex,
    // monotonic age; lower is older. Valid while the slot is occupied.
    pub seq: u64,
    pub instr: Option<Rc<Instr>>,
    pub state: ROBSlotState,
    pub dest: Option<RegisterType>,
    pub value: Option<WordType>,
    // address/value pair a STORE applies at commit
    pub store: Option<(u16, WordType)>,
    pub branch: Option<BranchOutcome>,
    pub predicted_next_pc: u16,
    pub speculative: bool,
}

impl ROBSlot {
    fn new(index: RobIndex) -> ROBSlot {
        ROBSlot {
            index,
            seq: 0,
            instr: None,
            state: ROBSlotState::IDLE,
            dest: None,
            value: None,
            store: None,
            branch: None,
            predicted_next_pc: 0,
            speculative: false,
        }
    }

    fn reset(&mut self) {
        self.seq = 0;
        self.instr = None;
        self.state = ROBSlotState::IDLE;
        self.dest = None;
        self.value = None;
        self.store = None;
        self.branch = None;
        self.predicted_next_pc = 0;
        self.speculative = false;
    }

    pub fn opcode(&self) -> Opcode {
        self.instr.as_ref().unwrap().opcode
    }
}

/// Fixed-capacity circular reorder buffer. Head and tail are monotonic
/// sequence numbers; slot indices are `seq % capacity`, so age comparisons
/// never have to reason about wrap-around.
#[derive(Clone, Debug)]
pub struct ROB {
    pub capacity: u8,
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub fn new(capacity: u8) -> ROB {
        let mut slots = Vec::with_capacity(capacity as usize);
        for k in 0..capacity {
            slots.push(ROBSlot::new(k));
        }

        ROB { capacity, head: 0, tail: 0, slots }
    }

    pub fn to_index(&self, seq: u64) -> RobIndex {
        (seq % self.capacity as u64) as RobIndex
    }

    pub fn head_seq(&self) -> u64 {
        self.head
    }

    pub fn tail_seq(&self) -> u64 {
        self.tail
    }

    pub fn head_index(&self) -> RobIndex {
        self.to_index(self.head)
    }

    pub fn get(&self, index: RobIndex) -> &ROBSlot {
        &self.slots[index as usize]
    }

    pub fn get_mut(&mut self, index: RobIndex) -> &mut ROBSlot {
        &mut self.slots[index as usize]
    }

    pub fn size(&self) -> u8 {
        (self.tail - self.head) as u8
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    /// Reserves the slot at the tail. The caller populates it.
    pub fn allocate(&mut self) -> RobIndex {
        debug_assert!(self.has_space(), "ROB: can't allocate when the ROB is full");

        let index = self.to_index(self.tail);
        let seq = self.tail;
        let slot = &mut self.slots[index as usize];
        slot.reset();
        slot.seq = seq;
        self.tail += 1;
        index
    }

    /// Frees the head slot after its commit.
    pub fn deallocate(&mut self) {
        debug_assert!(!self.is_empty(), "ROB: can't deallocate when the ROB is empty");

        let index = self.to_index(self.head) as usize;
        self.slots[index].reset();
        self.head += 1;
    }

    /// Discards every entry strictly younger than `seq` in one step and
    /// returns the freed slot indices.
    pub fn flush_after(&mut self, seq: u64) -> Vec<RobIndex> {
        debug_assert!(seq >= self.head && seq < self.tail);

        let mut discarded = Vec::new();
        for s in (seq + 1)..self.tail {
            let index = self.to_index(s);
            self.slots[index as usize].reset();
            discarded.push(index);
        }
        self.tail = seq + 1;
        discarded
    }

    /// Occupied slots, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = &ROBSlot> {
        (self.head..self.tail).map(|seq| &self.slots[self.to_index(seq) as usize])
    }

    /// True while any in-flight BEQ has not yet reported its outcome.
    pub fn has_unresolved_branch(&self) -> bool {
        self.in_flight().any(|slot| slot.opcode() == Opcode::BEQ && slot.branch.is_none())
    }

    pub fn contains_opcode(&self, opcode: Opcode) -> bool {
        self.in_flight().any(|slot| slot.opcode() == opcode)
    }

    /// The youngest in-flight writer of `reg`, used to rebuild the RAT
    /// after a flush.
    pub fn latest_writer(&self, reg: RegisterType) -> Option<RobIndex> {
        self.in_flight()
            .filter(|slot| slot.dest == Some(reg))
            .max_by_key(|slot| slot.seq)
            .map(|slot| slot.index)
    }

    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.head = 0;
        self.tail = 0;
    }
}

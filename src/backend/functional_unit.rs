use crate::cpu::{Latencies, SimConfig};
use crate::instructions::instructions::{InstrId, OpClass, Opcode, RobIndex, WordType};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FUState {
    IDLE,
    EXECUTING,
    // the result is waiting for its CDB broadcast; the unit is not
    // reusable until the bus frees it
    COMPLETED,
}

/// Outcome of one execution, shaped by instruction class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExecResult {
    Value(WordType),
    Store { address: u16, value: WordType },
    Branch { taken: bool, target: u16 },
    Call { target: u16, return_address: u16 },
    Ret { target: u16 },
}

/// A single timed functional unit. Operands are captured from the feeding
/// reservation station at dispatch.
#[derive(Clone, Debug)]
pub struct FU {
    pub index: usize,
    pub class: OpClass,
    pub state: FUState,
    pub cycles_remaining: u8,
    pub op: Option<Opcode>,
    pub vj: Option<WordType>,
    pub vk: Option<WordType>,
    pub imm: Option<i16>,
    pub pc: u16,
    pub target: Option<u16>,
    pub rs_index: Option<usize>,
    pub dest_rob: Option<RobIndex>,
    pub instr_id: Option<InstrId>,
    pub result: Option<ExecResult>,
}

impl FU {
    fn new(index: usize, class: OpClass) -> FU {
        FU {
            index,
            class,
            state: FUState::IDLE,
            cycles_remaining: 0,
            op: None,
            vj: None,
            vk: None,
            imm: None,
            pc: 0,
            target: None,
            rs_index: None,
            dest_rob: None,
            instr_id: None,
            result: None,
        }
    }

    fn reset(&mut self) {
        self.state = FUState::IDLE;
        self.cycles_remaining = 0;
        self.op = None;
        self.vj = None;
        self.vk = None;
        self.imm = None;
        self.pc = 0;
        self.target = None;
        self.rs_index = None;
        self.dest_rob = None;
        self.instr_id = None;
        self.result = None;
    }

    /// Decrements the countdown; computes the result on the final cycle and
    /// returns true. For LOAD the memory read happens here, at completion.
    pub fn tick(&mut self, memory: &MemorySubsystem) -> bool {
        debug_assert!(self.state == FUState::EXECUTING);
        debug_assert!(self.cycles_remaining > 0);

        self.cycles_remaining -= 1;
        if self.cycles_remaining > 0 {
            return false;
        }

        self.result = Some(self.compute(memory));
        self.state = FUState::COMPLETED;
        true
    }

    fn compute(&self, memory: &MemorySubsystem) -> ExecResult {
        let vj = self.vj.unwrap_or(0);
        let vk = self.vk.unwrap_or(0);
        let imm = self.imm.unwrap_or(0);

        match self.op.unwrap() {
            Opcode::ADD => ExecResult::Value(vj.wrapping_add(vk)),
            Opcode::SUB => ExecResult::Value(vj.wrapping_sub(vk)),
            Opcode::NAND => ExecResult::Value(!(vj & vk)),
            // the low 16 bits of the product
            Opcode::MUL => ExecResult::Value(vj.wrapping_mul(vk)),
            Opcode::LOAD => ExecResult::Value(memory.read(effective_address(vj, imm))),
            Opcode::STORE => ExecResult::Store { address: effective_address(vj, imm), value: vk },
            Opcode::BEQ => {
                let taken = vj == vk;
                let target = if taken {
                    self.pc.wrapping_add(1).wrapping_add(imm as u16)
                } else {
                    self.pc.wrapping_add(1)
                };
                ExecResult::Branch { taken, target }
            }
            Opcode::CALL => ExecResult::Call {
                target: self.target.unwrap(),
                return_address: self.pc.wrapping_add(1),
            },
            Opcode::RET => ExecResult::Ret { target: vj },
        }
    }
}

fn effective_address(base: WordType, imm: i16) -> u16 {
    base.wrapping_add(imm as u16)
}

/// The pool of functional units for a core, sized and timed per class.
#[derive(Clone, Debug)]
pub struct FUTable {
    units: Vec<FU>,
    latencies: Latencies,
}

impl FUTable {
    pub fn new(config: &SimConfig) -> FUTable {
        let counts = [
            (OpClass::AddSub, config.units.add_sub),
            (OpClass::Nand, config.units.nand),
            (OpClass::Mul, config.units.mul),
            (OpClass::Load, config.units.load),
            (OpClass::Store, config.units.store),
            (OpClass::Beq, config.units.beq),
            (OpClass::CallRet, config.units.call_ret),
        ];

        let mut units = Vec::new();
        for (class, count) in counts {
            for _ in 0..count {
                units.push(FU::new(units.len(), class));
            }
        }

        FUTable { units, latencies: config.latencies }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, fu_index: usize) -> &FU {
        &self.units[fu_index]
    }

    pub fn get_mut(&mut self, fu_index: usize) -> &mut FU {
        &mut self.units[fu_index]
    }

    pub fn has_idle(&self, class: OpClass) -> bool {
        self.units.iter().any(|fu| fu.class == class && fu.state == FUState::IDLE)
    }

    /// Claims an idle unit of the class and starts its countdown.
    pub fn allocate(&mut self, class: OpClass) -> Option<usize> {
        let latency = self.latencies.for_class(class);
        let fu = self.units.iter_mut().find(|fu| fu.class == class && fu.state == FUState::IDLE)?;
        fu.state = FUState::EXECUTING;
        fu.cycles_remaining = latency;
        Some(fu.index)
    }

    /// Releases a unit once its result has gone out on the bus.
    pub fn deallocate(&mut self, fu_index: usize) {
        let fu = &mut self.units[fu_index];
        debug_assert!(fu.state == FUState::COMPLETED, "FU freed before its broadcast");
        fu.reset();
    }

    pub fn any_busy(&self) -> bool {
        self.units.iter().any(|fu| fu.state != FUState::IDLE)
    }

    pub fn units(&self) -> &[FU] {
        &self.units
    }

    /// Cancels in-flight work feeding any of the discarded ROB slots.
    pub fn flush_discarded(&mut self, discarded: &[RobIndex]) {
        for fu in &mut self.units {
            if let Some(dest_rob) = fu.dest_rob {
                if discarded.contains(&dest_rob) {
                    fu.reset();
                }
            }
        }
    }

    pub fn flush(&mut self) {
        for fu in &mut self.units {
            fu.reset();
        }
    }
}

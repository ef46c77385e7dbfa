use std::error::Error;
use std::fs::File;

use serde::Deserialize;

use crate::backend::backend::Backend;
use crate::instructions::instructions::{
    InstrId, OpClass, Program, RegisterType, WordType, GENERAL_REG_CNT,
};
use crate::loader::loader::{load_from_string, LoadError};
use crate::memory_subsystem::memory_subsystem::{MemoryInitError, MemorySubsystem};
use crate::snapshot::Snapshot;
use crate::timing::TimingTracker;

/// Per-stage trace switches; each enabled stage prints a line per event.
#[derive(Clone, Copy, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Trace {
    pub issue: bool,
    pub dispatch: bool,
    pub execute: bool,
    pub write_back: bool,
    pub commit: bool,
    pub flush: bool,
    pub cycle: bool,
}

impl Trace {
    pub fn all() -> Trace {
        Trace {
            issue: true,
            dispatch: true,
            execute: true,
            write_back: true,
            commit: true,
            flush: true,
            cycle: true,
        }
    }
}

/// The number of functional units per class.
#[derive(Clone, Copy, Deserialize, Debug)]
#[serde(default)]
pub struct UnitCounts {
    pub add_sub: u8,
    pub nand: u8,
    pub mul: u8,
    pub load: u8,
    pub store: u8,
    pub beq: u8,
    pub call_ret: u8,
}

impl Default for UnitCounts {
    fn default() -> UnitCounts {
        UnitCounts { add_sub: 4, nand: 2, mul: 1, load: 2, store: 1, beq: 2, call_ret: 1 }
    }
}

/// Cycles from dispatch to completion per class. LOAD and STORE spend two
/// cycles on address computation and the rest on the memory access; the
/// split is purely cosmetic timing.
#[derive(Clone, Copy, Deserialize, Debug)]
#[serde(default)]
pub struct Latencies {
    pub add_sub: u8,
    pub nand: u8,
    pub mul: u8,
    pub load: u8,
    pub store: u8,
    pub beq: u8,
    pub call_ret: u8,
}

impl Default for Latencies {
    fn default() -> Latencies {
        Latencies { add_sub: 2, nand: 1, mul: 12, load: 6, store: 6, beq: 1, call_ret: 1 }
    }
}

impl Latencies {
    pub fn for_class(&self, class: OpClass) -> u8 {
        match class {
            OpClass::AddSub => self.add_sub,
            OpClass::Nand => self.nand,
            OpClass::Mul => self.mul,
            OpClass::Load => self.load,
            OpClass::Store => self.store,
            OpClass::Beq => self.beq,
            OpClass::CallRet => self.call_ret,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct SimConfig {
    // the capacity of the reorder buffer
    pub rob_capacity: u8,
    // the number of functional units per class
    pub units: UnitCounts,
    // execution latency per class
    pub latencies: Latencies,
    // cap on the driver's run loop
    pub max_cycles: u64,
    // if processing of the pipeline stages should be traced (printed)
    pub trace: Trace,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            rob_capacity: 8,
            units: UnitCounts::default(),
            latencies: Latencies::default(),
            max_cycles: 10_000,
            trace: Trace::default(),
        }
    }
}

pub fn load_sim_config(file_path: &str) -> Result<SimConfig, Box<dyn Error>> {
    let file = File::open(file_path)?;
    let config = serde_yaml::from_reader(file)?;
    Ok(config)
}

/// The committed architectural register file: 8 registers of 16 bits. R0 is
/// a normal register, not hardwired to zero.
#[derive(Clone, Debug)]
pub struct ArchRegFile {
    registers: [WordType; GENERAL_REG_CNT],
}

impl ArchRegFile {
    fn new() -> ArchRegFile {
        ArchRegFile { registers: [0; GENERAL_REG_CNT] }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.registers[reg as usize]
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.registers[reg as usize] = value;
    }

    pub fn registers(&self) -> [WordType; GENERAL_REG_CNT] {
        self.registers
    }
}

/// The simulator: one owned state aggregate advanced a cycle at a time by
/// `step_cycle`. External observers only ever see deep-copy snapshots;
/// whole-value clones give undo/redo and breakpoints to embedding layers.
#[derive(Clone, Debug)]
pub struct Simulator {
    pub(crate) config: SimConfig,
    pub(crate) program: Program,
    pub(crate) memory: MemorySubsystem,
    pub(crate) arch_reg_file: ArchRegFile,
    pub(crate) backend: Backend,
    pub(crate) timing: TimingTracker,
    pub(crate) cycle: u64,
    pub(crate) last_issued: Option<InstrId>,
    pub(crate) last_committed: Option<InstrId>,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Simulator {
        let backend = Backend::new(&config);
        Simulator {
            config,
            program: Program::default(),
            memory: MemorySubsystem::new(),
            arch_reg_file: ArchRegFile::new(),
            backend,
            timing: TimingTracker::new(),
            cycle: 0,
            last_issued: None,
            last_committed: None,
        }
    }

    /// Parses the assembly source and initializes the core: ROB empty, RAT
    /// all architectural, registers all 0, memory empty, PC = 0. On a parse
    /// failure nothing is mutated.
    pub fn load_program(&mut self, source: &str) -> Result<(), LoadError> {
        let program = load_from_string(source)?;
        self.program = program;
        self.reset();
        Ok(())
    }

    /// Replaces the given memory entries; rejects out-of-range addresses or
    /// values without touching anything.
    pub fn initialize_memory(&mut self, entries: &[(i64, i64)]) -> Result<(), MemoryInitError> {
        self.memory.init(entries)
    }

    /// Clears all core state back to the post-load initial state; the
    /// loaded instructions are retained.
    pub fn reset(&mut self) {
        self.memory = MemorySubsystem::new();
        self.arch_reg_file = ArchRegFile::new();
        self.backend = Backend::new(&self.config);
        self.timing.clear();
        self.cycle = 0;
        self.last_issued = None;
        self.last_committed = None;
    }

    /// Advances the machine exactly one cycle through the fixed phase
    /// sequence and returns the new snapshot. Stepping a completed machine
    /// is a no-op returning the terminal snapshot.
    pub fn step_cycle(&mut self) -> Snapshot {
        if self.is_complete() {
            return self.snapshot();
        }

        self.cycle += 1;
        if self.config.trace.cycle {
            println!("=== Cycle {}", self.cycle);
        }

        self.backend.cdb.begin_cycle();
        self.backend.cycle_write_back(&mut self.timing, self.cycle);
        let completed = self.backend.cycle_fu_tick(&self.memory, &mut self.timing, self.cycle);
        self.backend.cycle_branch_resolution(&completed);
        self.backend.cycle_write_back(&mut self.timing, self.cycle);
        self.backend.cycle_dispatch(&mut self.timing, self.cycle);
        if let Some(instr_id) = self.backend.cycle_commit(
            &mut self.arch_reg_file,
            &mut self.memory,
            &mut self.timing,
            self.cycle,
        ) {
            self.last_committed = Some(instr_id);
        }
        if let Some(instr_id) =
            self.backend.cycle_issue(&self.program, &self.arch_reg_file, &mut self.timing, self.cycle)
        {
            self.last_issued = Some(instr_id);
        }

        self.snapshot()
    }

    /// Deep copy of the public state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self)
    }

    /// True once the ROB is empty, nothing is executing or queued, and the
    /// PC has walked past the last instruction.
    pub fn is_complete(&self) -> bool {
        self.backend.rob.is_empty()
            && self.backend.is_idle()
            && !self.backend.halted
            && self.backend.pc as usize >= self.program.code.len()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn register_value(&self, reg: RegisterType) -> WordType {
        self.arch_reg_file.get_value(reg)
    }

    pub fn memory_value(&self, address: u16) -> WordType {
        self.memory.read(address)
    }
}

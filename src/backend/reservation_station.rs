use crate::instructions::instructions::{InstrId, OpClass, Opcode, RobIndex, WordType};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RSState {
    IDLE,
    BUSY,
}

/// A single reservation station. Source operands are either captured values
/// (Vj/Vk) or tags of the ROB slots that will produce them (Qj/Qk).
#[derive(Clone, Debug)]
pub struct RS {
    pub index: usize,
    pub name: &'static str,
    pub class: OpClass,
    pub state: RSState,
    pub op: Option<Opcode>,
    pub vj: Option<WordType>,
    pub qj: Option<RobIndex>,
    pub vk: Option<WordType>,
    pub qk: Option<RobIndex>,
    // address immediate for LOAD/STORE, displacement for BEQ
    pub a: Option<i16>,
    pub pc: u16,
    // absolute target for CALL
    pub target: Option<u16>,
    pub dest_rob: Option<RobIndex>,
    pub instr_id: Option<InstrId>,
    // claimed by a functional unit; stays busy until write-back frees it
    pub executing: bool,
    // issue age, used to dispatch in program order
    pub age: u64,
    pub dispatched_cycle: Option<u64>,
}

impl RS {
    fn new(index: usize, name: &'static str, class: OpClass) -> RS {
        RS {
            index,
            name,
            class,
            state: RSState::IDLE,
            op: None,
            vj: None,
            qj: None,
            vk: None,
            qk: None,
            a: None,
            pc: 0,
            target: None,
            dest_rob: None,
            instr_id: None,
            executing: false,
            age: 0,
            dispatched_cycle: None,
        }
    }

    fn reset(&mut self) {
        self.state = RSState::IDLE;
        self.op = None;
        self.vj = None;
        self.qj = None;
        self.vk = None;
        self.qk = None;
        self.a = None;
        self.pc = 0;
        self.target = None;
        self.dest_rob = None;
        self.instr_id = None;
        self.executing = false;
        self.age = 0;
        self.dispatched_cycle = None;
    }

    pub fn is_ready(&self) -> bool {
        self.state == RSState::BUSY && !self.executing && self.qj.is_none() && self.qk.is_none()
    }
}

/// The fixed set of 12 named stations, partitioned by instruction class.
#[derive(Clone, Debug)]
pub struct RSTable {
    stations: Vec<RS>,
}

const STATION_LAYOUT: [(&str, OpClass); 12] = [
    ("LOAD1", OpClass::Load),
    ("LOAD2", OpClass::Load),
    ("STORE", OpClass::Store),
    ("BEQ1", OpClass::Beq),
    ("BEQ2", OpClass::Beq),
    ("CALL/RET", OpClass::CallRet),
    ("ADD/SUB1", OpClass::AddSub),
    ("ADD/SUB2", OpClass::AddSub),
    ("ADD/SUB3", OpClass::AddSub),
    ("ADD/SUB4", OpClass::AddSub),
    ("NAND", OpClass::Nand),
    ("MUL", OpClass::Mul),
];

impl RSTable {
    pub fn new() -> RSTable {
        let stations = STATION_LAYOUT
            .iter()
            .enumerate()
            .map(|(index, &(name, class))| RS::new(index, name, class))
            .collect();
        RSTable { stations }
    }

    pub fn get(&self, rs_index: usize) -> &RS {
        &self.stations[rs_index]
    }

    pub fn get_mut(&mut self, rs_index: usize) -> &mut RS {
        &mut self.stations[rs_index]
    }

    pub fn has_idle(&self, class: OpClass) -> bool {
        self.stations.iter().any(|rs| rs.class == class && rs.state == RSState::IDLE)
    }

    pub fn allocate(&mut self, class: OpClass) -> usize {
        let rs = self
            .stations
            .iter_mut()
            .find(|rs| rs.class == class && rs.state == RSState::IDLE)
            .expect("RSTable: no idle station of the requested class");
        rs.state = RSState::BUSY;
        rs.index
    }

    pub fn free(&mut self, rs_index: usize) {
        let rs = &mut self.stations[rs_index];
        debug_assert!(rs.state == RSState::BUSY, "RS {} freed while idle", rs.name);
        rs.reset();
    }

    /// Stations whose operands are all captured and that no functional unit
    /// has claimed yet, in program order (oldest issue first).
    pub fn ready_entries(&self) -> Vec<usize> {
        let mut ready: Vec<usize> =
            self.stations.iter().filter(|rs| rs.is_ready()).map(|rs| rs.index).collect();
        ready.sort_by_key(|&index| self.stations[index].age);
        ready
    }

    /// CDB broadcast: every station waiting on `rob_index` captures the
    /// value and drops the tag.
    pub fn forward(&mut self, rob_index: RobIndex, value: WordType) {
        for rs in &mut self.stations {
            if rs.state != RSState::BUSY {
                continue;
            }
            if rs.qj == Some(rob_index) {
                rs.vj = Some(value);
                rs.qj = None;
            }
            if rs.qk == Some(rob_index) {
                rs.vk = Some(value);
                rs.qk = None;
            }
        }
    }

    pub fn any_busy(&self) -> bool {
        self.stations.iter().any(|rs| rs.state == RSState::BUSY)
    }

    pub fn stations(&self) -> &[RS] {
        &self.stations
    }

    /// Clears every station feeding one of the discarded ROB slots.
    pub fn flush_discarded(&mut self, discarded: &[RobIndex]) {
        for rs in &mut self.stations {
            if let Some(dest_rob) = rs.dest_rob {
                if discarded.contains(&dest_rob) {
                    rs.reset();
                }
            }
        }
    }

    pub fn flush(&mut self) {
        for rs in &mut self.stations {
            rs.reset();
        }
    }
}

impl Default for RSTable {
    fn default() -> Self {
        Self::new()
    }
}

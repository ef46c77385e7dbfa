use serde::Serialize;

use crate::backend::functional_unit::FUState;
use crate::backend::reservation_station::RSState;
use crate::cpu::Simulator;
use crate::instructions::instructions::{InstrId, OpClass, Opcode, RobIndex, WordType};
use crate::timing::StageTiming;

/// Deep copy of the public machine state, captured between cycles. Safe to
/// hand to UIs and test harnesses; mutating it cannot perturb the core.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub cycle: u64,
    pub complete: bool,
    pub pc: u16,
    pub instructions: Vec<InstrView>,
    pub registers: Vec<WordType>,
    pub memory: Vec<MemoryCellView>,
    pub rat: Vec<Option<RobIndex>>,
    pub rob: RobView,
    pub stations: Vec<StationView>,
    pub units: Vec<UnitView>,
    pub cdb: CdbView,
    pub last_issued: Option<InstrId>,
    pub last_committed: Option<InstrId>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstrView {
    pub id: InstrId,
    pub pc: u16,
    pub text: String,
    pub timing: StageTiming,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MemoryCellView {
    pub address: u32,
    pub value: WordType,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RobView {
    pub head: RobIndex,
    pub tail: RobIndex,
    pub size: u8,
    pub entries: Vec<RobEntryView>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RobEntryView {
    pub index: RobIndex,
    pub instr_id: InstrId,
    pub opcode: Opcode,
    pub dest: Option<u8>,
    pub ready: bool,
    pub speculative: bool,
    pub value: Option<WordType>,
    pub store: Option<(u16, WordType)>,
    pub branch_taken: Option<bool>,
    pub branch_target: Option<u16>,
    pub predicted_next_pc: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StationView {
    pub name: String,
    pub class: OpClass,
    pub busy: bool,
    pub op: Option<Opcode>,
    pub vj: Option<WordType>,
    pub qj: Option<RobIndex>,
    pub vk: Option<WordType>,
    pub qk: Option<RobIndex>,
    pub a: Option<i16>,
    pub dest_rob: Option<RobIndex>,
    pub instr_id: Option<InstrId>,
    pub executing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnitView {
    pub class: OpClass,
    pub busy: bool,
    pub cycles_remaining: u8,
    pub op: Option<Opcode>,
    pub dest_rob: Option<RobIndex>,
    pub instr_id: Option<InstrId>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BroadcastView {
    pub rob_index: RobIndex,
    pub opcode: Opcode,
    pub value: Option<WordType>,
    pub instr_id: InstrId,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CdbView {
    pub current: Option<BroadcastView>,
    pub pending: Vec<BroadcastView>,
}

impl Snapshot {
    pub(crate) fn capture(sim: &Simulator) -> Snapshot {
        let backend = &sim.backend;

        let instructions = sim
            .program
            .code
            .iter()
            .map(|instr| InstrView {
                id: instr.id,
                pc: instr.pc,
                text: instr.to_string(),
                timing: sim.timing.get(instr.id),
            })
            .collect();

        let memory = sim
            .memory
            .cells()
            .iter()
            .map(|(&address, &value)| MemoryCellView { address, value })
            .collect();

        let rob_entries = backend
            .rob
            .in_flight()
            .map(|slot| RobEntryView {
                index: slot.index,
                instr_id: slot.instr.as_ref().unwrap().id,
                opcode: slot.opcode(),
                dest: slot.dest,
                ready: slot.state == crate::backend::reorder_buffer::ROBSlotState::EXECUTED,
                speculative: slot.speculative,
                value: slot.value,
                store: slot.store,
                branch_taken: slot.branch.map(|b| b.taken),
                branch_target: slot.branch.map(|b| b.target),
                predicted_next_pc: slot.predicted_next_pc,
            })
            .collect();

        let stations = backend
            .rs_table
            .stations()
            .iter()
            .map(|rs| StationView {
                name: rs.name.to_string(),
                class: rs.class,
                busy: rs.state == RSState::BUSY,
                op: rs.op,
                vj: rs.vj,
                qj: rs.qj,
                vk: rs.vk,
                qk: rs.qk,
                a: rs.a,
                dest_rob: rs.dest_rob,
                instr_id: rs.instr_id,
                executing: rs.executing,
            })
            .collect();

        let units = backend
            .fu_table
            .units()
            .iter()
            .map(|fu| UnitView {
                class: fu.class,
                busy: fu.state != FUState::IDLE,
                cycles_remaining: fu.cycles_remaining,
                op: fu.op,
                dest_rob: fu.dest_rob,
                instr_id: fu.instr_id,
            })
            .collect();

        let broadcast_view = |b: &crate::backend::cdb::CDBBroadcast| BroadcastView {
            rob_index: b.rob_index,
            opcode: b.opcode,
            value: b.forward_value(),
            instr_id: b.instr_id,
        };

        Snapshot {
            cycle: sim.cycle,
            complete: sim.is_complete(),
            pc: backend.pc,
            instructions,
            registers: sim.arch_reg_file.registers().to_vec(),
            memory,
            rat: backend.rat.table().to_vec(),
            rob: RobView {
                head: backend.rob.head_index(),
                tail: backend.rob.to_index(backend.rob.tail_seq()),
                size: backend.rob.size(),
                entries: rob_entries,
            },
            stations,
            units,
            cdb: CdbView {
                current: backend.cdb.current().map(broadcast_view),
                pending: backend.cdb.pending().iter().map(broadcast_view).collect(),
            },
            last_issued: sim.last_issued,
            last_committed: sim.last_committed,
        }
    }
}

use std::rc::Rc;

use super::cdb::{CDBBroadcast, CDB};
use super::functional_unit::{ExecResult, FUState, FUTable};
use super::register_alias_table::RAT;
use super::reorder_buffer::{BranchOutcome, ROBSlotState, ROB};
use super::reservation_station::RSTable;
use crate::cpu::{ArchRegFile, SimConfig, Trace};
use crate::instructions::instructions::{
    InstrId, Opcode, Program, RegisterType, RobIndex, WordType, GENERAL_REG_CNT, LINK_REG,
};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::timing::TimingTracker;

/// The out-of-order engine: reservation stations, reorder buffer, register
/// alias table, functional units and the common data bus, advanced through
/// the per-cycle phases by the step driver.
#[derive(Clone, Debug)]
pub struct Backend {
    pub rs_table: RSTable,
    pub rob: ROB,
    pub rat: RAT,
    pub fu_table: FUTable,
    pub cdb: CDB,
    // fetch index of the next instruction to issue
    pub pc: u16,
    // issue is blocked behind an in-flight RET until it commits
    pub halted: bool,
    trace: Trace,
}

impl Backend {
    pub fn new(config: &SimConfig) -> Backend {
        Backend {
            rs_table: RSTable::new(),
            rob: ROB::new(config.rob_capacity),
            rat: RAT::new(),
            fu_table: FUTable::new(config),
            cdb: CDB::new(),
            pc: 0,
            halted: false,
            trace: config.trace,
        }
    }

    /// True when no station, unit or queued completion remains in flight.
    pub fn is_idle(&self) -> bool {
        !self.rs_table.any_busy() && !self.fu_table.any_busy() && self.cdb.is_idle()
    }

    /// Phases 1 and 4. Promotes at most one pending completion onto the bus
    /// and applies it: the ROB slot becomes ready, waiting stations capture
    /// the value, and the producing station and unit are freed.
    pub(crate) fn cycle_write_back(&mut self, timing: &mut TimingTracker, cycle: u64) {
        let broadcast = match self.cdb.try_promote() {
            Some(broadcast) => broadcast,
            None => return,
        };

        let slot = self.rob.get_mut(broadcast.rob_index);
        debug_assert!(slot.state == ROBSlotState::ISSUED, "broadcast for a slot not in flight");

        match broadcast.result {
            ExecResult::Value(value) => slot.value = Some(value),
            ExecResult::Call { return_address, .. } => slot.value = Some(return_address),
            ExecResult::Store { address, value } => slot.store = Some((address, value)),
            ExecResult::Branch { .. } | ExecResult::Ret { .. } => {}
        }
        slot.state = ROBSlotState::EXECUTED;

        if self.trace.write_back {
            println!("Write-back [{}]", slot.instr.as_ref().unwrap());
        }

        if let Some(value) = broadcast.forward_value() {
            self.rs_table.forward(broadcast.rob_index, value);
        }

        self.fu_table.deallocate(broadcast.fu_index);
        self.rs_table.free(broadcast.rs_index);
        timing.record_write(broadcast.instr_id, cycle);
    }

    /// Phase 2. Every busy unit counts down one cycle; units reaching zero
    /// compute their result. Returns the units that completed this cycle.
    pub(crate) fn cycle_fu_tick(
        &mut self,
        memory: &MemorySubsystem,
        timing: &mut TimingTracker,
        cycle: u64,
    ) -> Vec<usize> {
        let trace = self.trace;
        let mut completed = Vec::new();

        for fu_index in 0..self.fu_table.len() {
            let fu = self.fu_table.get_mut(fu_index);
            if fu.state != FUState::EXECUTING {
                continue;
            }
            if fu.tick(memory) {
                timing.record_finish_exec(fu.instr_id.unwrap(), cycle);
                if trace.execute {
                    println!(
                        "Executed {:?} for ROB[{}]",
                        fu.op.unwrap(),
                        fu.dest_rob.unwrap()
                    );
                }
                completed.push(fu_index);
            }
        }

        completed
    }

    /// Phase 3. Outcomes of branch-class completions are reported to the
    /// ROB before this cycle's broadcast choice. A taken BEQ (the predictor
    /// is always not-taken) flushes everything younger. Surviving
    /// completions then queue for the bus, oldest ROB entry first.
    pub(crate) fn cycle_branch_resolution(&mut self, completed: &[usize]) {
        let mut mispredict: Option<(RobIndex, u64, u16)> = None;

        for &fu_index in completed {
            let (dest_rob, result) = {
                let fu = self.fu_table.get(fu_index);
                (fu.dest_rob.unwrap(), fu.result.unwrap())
            };

            match result {
                ExecResult::Branch { taken, target } => {
                    let seq = {
                        let slot = self.rob.get_mut(dest_rob);
                        slot.branch = Some(BranchOutcome { taken, target, return_address: None });
                        slot.seq
                    };
                    let older = match mispredict {
                        Some((_, best, _)) => seq < best,
                        None => true,
                    };
                    if taken && older {
                        mispredict = Some((dest_rob, seq, target));
                    }
                }
                ExecResult::Call { target, return_address } => {
                    // CALL is unconditional and predicted at issue; it never
                    // mispredicts
                    let slot = self.rob.get_mut(dest_rob);
                    slot.branch = Some(BranchOutcome {
                        taken: true,
                        target,
                        return_address: Some(return_address),
                    });
                }
                ExecResult::Ret { target } => {
                    // issue has been stalled since the RET issued, so nothing
                    // younger exists to flush
                    let slot = self.rob.get_mut(dest_rob);
                    slot.branch = Some(BranchOutcome { taken: true, target, return_address: None });
                }
                _ => {}
            }
        }

        if let Some((branch_index, _, target)) = mispredict {
            self.flush_from(branch_index, target);
        }

        let mut survivors: Vec<(u64, usize)> = completed
            .iter()
            .copied()
            .filter(|&fu_index| self.fu_table.get(fu_index).state == FUState::COMPLETED)
            .map(|fu_index| {
                let fu = self.fu_table.get(fu_index);
                (self.rob.get(fu.dest_rob.unwrap()).seq, fu_index)
            })
            .collect();
        survivors.sort_unstable();

        for (seq, fu_index) in survivors {
            let fu = self.fu_table.get(fu_index);
            self.cdb.enqueue(CDBBroadcast {
                rob_index: fu.dest_rob.unwrap(),
                seq,
                opcode: fu.op.unwrap(),
                result: fu.result.unwrap(),
                instr_id: fu.instr_id.unwrap(),
                fu_index,
                rs_index: fu.rs_index.unwrap(),
            });
        }
    }

    /// Phase 5. Ready stations claim free units of their class in program
    /// order; operands are copied into the unit and the countdown starts.
    pub(crate) fn cycle_dispatch(&mut self, timing: &mut TimingTracker, cycle: u64) {
        let trace = self.trace;

        for rs_index in self.rs_table.ready_entries() {
            let class = self.rs_table.get(rs_index).class;
            let fu_index = match self.fu_table.allocate(class) {
                Some(fu_index) => fu_index,
                None => continue,
            };

            let (op, vj, vk, a, pc, target, dest_rob, instr_id) = {
                let rs = self.rs_table.get_mut(rs_index);
                rs.executing = true;
                rs.dispatched_cycle = Some(cycle);
                (
                    rs.op.unwrap(),
                    rs.vj,
                    rs.vk,
                    rs.a,
                    rs.pc,
                    rs.target,
                    rs.dest_rob.unwrap(),
                    rs.instr_id.unwrap(),
                )
            };

            let fu = self.fu_table.get_mut(fu_index);
            fu.op = Some(op);
            fu.vj = vj;
            fu.vk = vk;
            fu.imm = a;
            fu.pc = pc;
            fu.target = target;
            fu.rs_index = Some(rs_index);
            fu.dest_rob = Some(dest_rob);
            fu.instr_id = Some(instr_id);

            timing.record_start_exec(instr_id, cycle);
            if trace.dispatch {
                println!("Dispatched {:?} to a {:?} unit", op, class);
            }
        }
    }

    /// Phase 7. At most one commit per cycle, strictly at the ROB head. A
    /// slot still flagged speculative may not commit even when ready.
    pub(crate) fn cycle_commit(
        &mut self,
        arch_reg_file: &mut ArchRegFile,
        memory: &mut MemorySubsystem,
        timing: &mut TimingTracker,
        cycle: u64,
    ) -> Option<InstrId> {
        if self.rob.is_empty() {
            return None;
        }

        let head_index = self.rob.head_index();
        let (opcode, instr, dest, value, store, branch) = {
            let slot = self.rob.get(head_index);
            if slot.state != ROBSlotState::EXECUTED || slot.speculative {
                return None;
            }
            (
                slot.opcode(),
                Rc::clone(slot.instr.as_ref().unwrap()),
                slot.dest,
                slot.value,
                slot.store,
                slot.branch,
            )
        };

        match opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL | Opcode::LOAD | Opcode::CALL => {
                let dest = dest.unwrap();
                arch_reg_file.set_value(dest, value.unwrap());
                self.rat.clear_mapping(dest, head_index);
            }
            Opcode::STORE => {
                let (address, value) = store.unwrap();
                memory.write(address, value);
            }
            Opcode::BEQ => {}
            Opcode::RET => {
                // RET's target is data-dependent; the stalled fetch resumes
                // here
                self.pc = branch.unwrap().target;
                self.halted = false;
            }
        }

        if self.trace.commit {
            println!("Committed [{}]", instr);
        }
        timing.record_commit(instr.id, cycle);
        self.rob.deallocate();

        if opcode == Opcode::BEQ {
            self.recompute_speculation();
        }

        Some(instr.id)
    }

    /// Phase 8. Issues at most one instruction: reserve a ROB slot and a
    /// station of the opcode's class, capture operands through the RAT, and
    /// advance the predicted PC. Stalls leave no trace on the state.
    pub(crate) fn cycle_issue(
        &mut self,
        program: &Program,
        arch_reg_file: &ArchRegFile,
        timing: &mut TimingTracker,
        cycle: u64,
    ) -> Option<InstrId> {
        if self.halted || self.pc as usize >= program.code.len() {
            return None;
        }

        let instr = program.get_instr(self.pc as usize);
        let class = instr.opcode.class();
        if !self.rob.has_space() || !self.rs_table.has_idle(class) {
            if self.trace.issue {
                println!("Issue stall [{}]", instr);
            }
            return None;
        }

        let pc = self.pc;
        let speculative = self.rob.has_unresolved_branch();

        // capture sources before the RAT learns about this instruction, so
        // an instruction reading its own destination sees the old mapping
        let none = (None, None);
        let ((vj, qj), (vk, qk)) = match instr.opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL => (
                self.capture_operand(instr.rb.unwrap(), arch_reg_file),
                self.capture_operand(instr.rc.unwrap(), arch_reg_file),
            ),
            Opcode::LOAD => (self.capture_operand(instr.rb.unwrap(), arch_reg_file), none),
            Opcode::STORE => (
                self.capture_operand(instr.rb.unwrap(), arch_reg_file),
                self.capture_operand(instr.ra.unwrap(), arch_reg_file),
            ),
            Opcode::BEQ => (
                self.capture_operand(instr.ra.unwrap(), arch_reg_file),
                self.capture_operand(instr.rb.unwrap(), arch_reg_file),
            ),
            Opcode::CALL => (none, none),
            Opcode::RET => (self.capture_operand(LINK_REG, arch_reg_file), none),
        };

        let rob_index = self.rob.allocate();
        let seq = {
            let slot = self.rob.get_mut(rob_index);
            slot.instr = Some(Rc::clone(&instr));
            slot.state = ROBSlotState::ISSUED;
            slot.dest = instr.dest();
            slot.speculative = speculative;
            slot.predicted_next_pc = match instr.opcode {
                Opcode::CALL => instr.target.unwrap(),
                _ => pc.wrapping_add(1),
            };
            slot.seq
        };

        let rs_index = self.rs_table.allocate(class);
        {
            let rs = self.rs_table.get_mut(rs_index);
            rs.op = Some(instr.opcode);
            rs.vj = vj;
            rs.qj = qj;
            rs.vk = vk;
            rs.qk = qk;
            rs.a = instr.imm;
            rs.pc = pc;
            rs.target = instr.target;
            rs.dest_rob = Some(rob_index);
            rs.instr_id = Some(instr.id);
            rs.age = seq;
        }

        if instr.opcode.writes_register() {
            self.rat.update(instr.dest().unwrap(), rob_index);
        }

        self.pc = match instr.opcode {
            Opcode::CALL => instr.target.unwrap(),
            _ => pc.wrapping_add(1),
        };
        if instr.opcode == Opcode::RET {
            self.halted = true;
        }

        timing.record_issue(instr.id, cycle);
        if self.trace.issue {
            println!("Issued [{}]", instr);
        }

        Some(instr.id)
    }

    /// Looks a source register up through the RAT: the committed register
    /// file value, a ready ROB value, or the tag of the pending producer.
    fn capture_operand(
        &self,
        reg: RegisterType,
        arch_reg_file: &ArchRegFile,
    ) -> (Option<WordType>, Option<RobIndex>) {
        match self.rat.get(reg) {
            None => (Some(arch_reg_file.get_value(reg)), None),
            Some(rob_index) => {
                let slot = self.rob.get(rob_index);
                if slot.state == ROBSlotState::EXECUTED {
                    (Some(slot.value.unwrap()), None)
                } else {
                    (None, Some(rob_index))
                }
            }
        }
    }

    /// Misprediction recovery: atomically discards everything younger than
    /// the branch, rebuilds the RAT from surviving writers and redirects
    /// the fetch PC.
    fn flush_from(&mut self, branch_index: RobIndex, target: u16) {
        let seq = self.rob.get(branch_index).seq;
        let discarded = self.rob.flush_after(seq);

        self.rs_table.flush_discarded(&discarded);
        self.fu_table.flush_discarded(&discarded);
        self.cdb.remove_discarded(&discarded);

        for reg in 0..GENERAL_REG_CNT as RegisterType {
            if let Some(mapped) = self.rat.get(reg) {
                if discarded.contains(&mapped) {
                    self.rat.set(reg, self.rob.latest_writer(reg));
                }
            }
        }

        self.pc = target;
        // an in-flight RET can only have been younger than the branch
        self.halted = self.rob.contains_opcode(Opcode::RET);
        self.recompute_speculation();

        if self.trace.flush {
            println!(
                "Pipeline flush at ROB[{}]: {} entries discarded, redirect to {}",
                branch_index,
                discarded.len(),
                target
            );
        }
    }

    /// Rewrites every in-flight speculative flag as "an older BEQ is still
    /// unresolved", after a branch commits or a flush rewrites the ROB.
    fn recompute_speculation(&mut self) {
        let mut unresolved = false;
        for seq in self.rob.head_seq()..self.rob.tail_seq() {
            let index = self.rob.to_index(seq);
            let slot = self.rob.get_mut(index);
            slot.speculative = unresolved;
            if slot.opcode() == Opcode::BEQ && slot.branch.is_none() {
                unresolved = true;
            }
        }
    }
}

use crate::cpu::{SimConfig, Simulator};
use crate::instructions::instructions::Opcode;
use crate::snapshot::Snapshot;
use crate::timing::StageTiming;

#[cfg(test)]
mod tests {
    use super::*;

    const CYCLE_LIMIT: u64 = 10_000;

    struct TestHarness {
        sim: Simulator,
    }

    impl TestHarness {
        fn default() -> TestHarness {
            TestHarness { sim: Simulator::new(SimConfig::default()) }
        }

        fn load(&mut self, src: &str) {
            if let Err(err) = self.sim.load_program(src) {
                panic!("program failed to load: {}", err);
            }
        }

        fn init_memory(&mut self, entries: &[(i64, i64)]) {
            self.sim.initialize_memory(entries).unwrap();
        }

        fn step(&mut self) -> Snapshot {
            let snapshot = self.sim.step_cycle();
            check_invariants(&snapshot);
            snapshot
        }

        fn run_to_completion(&mut self) {
            for _ in 0..CYCLE_LIMIT {
                if self.sim.is_complete() {
                    return;
                }
                self.step();
            }
            panic!("simulation did not complete within {} cycles", CYCLE_LIMIT);
        }

        fn run_until<F: Fn(&Simulator) -> bool>(&mut self, pred: F) {
            for _ in 0..CYCLE_LIMIT {
                if pred(&self.sim) {
                    return;
                }
                self.step();
            }
            panic!("condition not reached within {} cycles", CYCLE_LIMIT);
        }

        fn timing(&self, instr_id: usize) -> StageTiming {
            self.sim.timing.get(instr_id)
        }

        fn assert_reg_value(&self, reg: u8, value: u16) {
            assert_eq!(self.sim.register_value(reg), value, "R{}", reg);
        }

        fn assert_mem_value(&self, address: u16, value: u16) {
            assert_eq!(self.sim.memory_value(address), value, "Memory[{}]", address);
        }
    }

    /// Structural invariants that must hold in every between-cycle snapshot.
    fn check_invariants(snapshot: &Snapshot) {
        assert_eq!(snapshot.rob.size as usize, snapshot.rob.entries.len());

        let in_flight: Vec<u8> = snapshot.rob.entries.iter().map(|e| e.index).collect();

        // every RAT mapping points at a live ROB entry writing that register
        for (reg, mapping) in snapshot.rat.iter().enumerate() {
            if let Some(rob_index) = mapping {
                let entry = snapshot
                    .rob
                    .entries
                    .iter()
                    .find(|e| e.index == *rob_index)
                    .unwrap_or_else(|| panic!("RAT[{}] points at a dead ROB slot", reg));
                assert_eq!(entry.dest, Some(reg as u8), "RAT[{}] maps to a non-writer", reg);
            }
        }

        // busy stations and units feed live ROB entries
        for station in &snapshot.stations {
            if station.busy {
                assert!(
                    in_flight.contains(&station.dest_rob.unwrap()),
                    "station {} feeds a dead ROB slot",
                    station.name
                );
            } else {
                assert!(!station.executing, "idle station {} marked executing", station.name);
            }
        }
        for unit in &snapshot.units {
            if unit.busy {
                assert!(in_flight.contains(&unit.dest_rob.unwrap()));
            }
        }
        for pending in &snapshot.cdb.pending {
            assert!(in_flight.contains(&pending.rob_index));
        }

        // a speculative entry sits behind an older in-flight BEQ
        for (position, entry) in snapshot.rob.entries.iter().enumerate() {
            if entry.speculative {
                let behind_branch = snapshot.rob.entries[..position]
                    .iter()
                    .any(|older| older.opcode == Opcode::BEQ);
                assert!(behind_branch, "speculative entry with no older branch");
            }
        }
    }

    // dependent ADD starts once both LOAD results are on the
    // bus, and carries the two-cycle ADD latency.
    #[test]
    fn test_add_timing() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
ADD R3, R1, R2
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 10), (4, 5)]);
        harness.run_to_completion();

        harness.assert_reg_value(3, 15);

        let load2 = harness.timing(1);
        let add = harness.timing(2);
        assert_eq!(add.start_exec, load2.write);
        assert_eq!(add.finish_exec.unwrap() - add.start_exec.unwrap(), 2);
        assert!(add.commit.unwrap() > load2.commit.unwrap());
    }

    // MUL occupies its unit for exactly 12 cycles.
    #[test]
    fn test_mul_back_pressure() {
        let src = "
LOAD R1, 0(R0)
MUL R2, R1, R1
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 5)]);
        harness.run_to_completion();

        harness.assert_reg_value(2, 25);
        let mul = harness.timing(1);
        assert_eq!(mul.finish_exec.unwrap() - mul.start_exec.unwrap(), 12);
    }

    // the memory write lands at commit, nowhere earlier.
    #[test]
    fn test_store_to_memory() {
        let src = "
LOAD R1, 0(R0)
STORE R1, 200(R0)
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 99)]);

        harness.run_until(|sim| sim.timing.get(1).write.is_some());
        // written back but not yet committed: memory still untouched
        if harness.timing(1).commit.is_none() {
            harness.assert_mem_value(200, 0);
        }
        harness.run_to_completion();

        harness.assert_mem_value(200, 99);
        harness.assert_mem_value(0, 99);
    }

    // a not-taken BEQ lets the fall-through path commit.
    #[test]
    fn test_beq_not_taken() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
BEQ R1, R2, SKIP
ADD R3, R1, R2
SKIP: STORE R3, 8(R0)
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 1), (4, 2)]);
        harness.run_to_completion();

        harness.assert_reg_value(3, 3);
        harness.assert_mem_value(8, 3);
        assert!(harness.timing(3).commit.is_some());
    }

    // a taken BEQ flushes the speculative fall-through path;
    // the program resumes at the branch target.
    #[test]
    fn test_beq_taken_misprediction_flush() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
BEQ R1, R2, SKIP
ADD R3, R1, R2
SKIP: STORE R3, 8(R0)
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 5), (4, 5)]);
        harness.run_to_completion();

        // the flushed ADD never wrote R3, so the re-issued STORE wrote 0
        harness.assert_reg_value(3, 0);
        harness.assert_mem_value(8, 0);
        assert!(harness.timing(3).commit.is_none(), "flushed ADD must not commit");
        let beq = harness.timing(2);
        let store = harness.timing(4);
        // the redirected fetch path re-issues the STORE no earlier than the
        // cycle the branch commits
        assert!(store.issue.unwrap() >= beq.commit.unwrap());
    }

    // CALL deposits the return address in R1, RET stalls
    // issue until it commits and then resumes at the call site.
    #[test]
    fn test_call_ret() {
        let src = "
LOAD R2, 0(R0)
CALL F
ADD R7, R6, R2
F: ADD R4, R2, R2
RET
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 10)]);

        // the program falls through into F again after the post-return ADD,
        // so run to the first commit of that ADD rather than to completion
        harness.run_until(|sim| sim.timing.get(2).commit.is_some());

        harness.assert_reg_value(4, 20);
        harness.assert_reg_value(1, 2); // program index of `ADD R7, R6, R2`
        harness.assert_reg_value(7, 10); // R6 + R2 = 0 + 10

        // no issue happened between RET's issue and its commit
        let ret = harness.timing(4);
        let after = harness.timing(2);
        assert!(after.issue.unwrap() >= ret.commit.unwrap());
    }

    // two results contest the bus; the older ROB entry
    // broadcasts first and pushes the younger's write stage by a cycle.
    #[test]
    fn test_cdb_arbitration() {
        let src = "
LOAD R1, 0(R0)
ADD R2, R1, R1
ADD R3, R1, R1
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 7)]);
        harness.run_to_completion();

        harness.assert_reg_value(2, 14);
        harness.assert_reg_value(3, 14);

        let older = harness.timing(1);
        let younger = harness.timing(2);
        assert_eq!(older.start_exec, younger.start_exec);
        assert_eq!(older.finish_exec, younger.finish_exec);
        assert_eq!(younger.write.unwrap(), older.write.unwrap() + 1);
    }

    #[test]
    fn test_nand_all_ones() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
NAND R3, R1, R2
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 65535), (4, 65535)]);
        harness.run_to_completion();

        harness.assert_reg_value(3, 0);
    }

    #[test]
    fn test_mul_wraps_low_16_bits() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
MUL R3, R1, R2
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 300), (4, 300)]);
        harness.run_to_completion();

        harness.assert_reg_value(3, (90000u32 & 0xFFFF) as u16);
    }

    // a taken branch to PC+1 still goes through the full flush machinery
    #[test]
    fn test_beq_offset_zero_still_flushes() {
        let src = "
BEQ R0, R0, 0
ADD R1, R0, R0
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.run_to_completion();

        harness.assert_reg_value(1, 0);
        let beq = harness.timing(0);
        let add = harness.timing(1);
        // the speculatively issued ADD was discarded and re-issued once the
        // branch resolved
        assert!(add.issue.unwrap() >= beq.commit.unwrap());
        assert!(add.commit.is_some());
    }

    // an overwritten RAT mapping makes the older write dead-on-arrival for
    // consumers, while both commits still land in order
    #[test]
    fn test_waw_rat_overwrite() {
        let src = "
LOAD R1, 0(R0)
LOAD R1, 4(R0)
ADD R2, R1, R1
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 3), (4, 9)]);
        harness.run_to_completion();

        harness.assert_reg_value(1, 9);
        harness.assert_reg_value(2, 18);
    }

    // only one MUL station exists, so a second MUL stalls at issue until the
    // first station frees at write-back
    #[test]
    fn test_issue_stall_on_busy_station() {
        let src = "
MUL R1, R0, R0
MUL R2, R0, R0
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.run_to_completion();

        let first = harness.timing(0);
        let second = harness.timing(1);
        assert!(second.issue.unwrap() >= first.write.unwrap());
    }

    #[test]
    fn test_step_past_completion_is_noop() {
        let src = "ADD R1, R0, R0\n";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.run_to_completion();

        let terminal = harness.sim.snapshot();
        assert!(terminal.complete);
        let stepped = harness.sim.step_cycle();
        assert_eq!(terminal, stepped);
        assert_eq!(harness.sim.cycle(), terminal.cycle);
    }

    #[test]
    fn test_reset_retains_program() {
        let src = "
LOAD R1, 0(R0)
ADD R2, R1, R1
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 21)]);
        harness.run_to_completion();
        harness.assert_reg_value(2, 42);

        harness.sim.reset();
        let snapshot = harness.sim.snapshot();
        assert_eq!(snapshot.cycle, 0);
        assert_eq!(snapshot.pc, 0);
        assert!(snapshot.rob.entries.is_empty());
        assert!(snapshot.memory.is_empty());
        assert_eq!(snapshot.registers, vec![0u16; 8]);
        assert_eq!(snapshot.instructions.len(), 2);

        // the machine runs again from the retained program
        harness.init_memory(&[(0, 21)]);
        harness.run_to_completion();
        harness.assert_reg_value(2, 42);
    }

    // given the same program and initial state, the per-cycle state sequence
    // is identical across runs
    #[test]
    fn test_deterministic_state_sequence() {
        let src = "
LOAD R1, 0(R0)
LOAD R2, 4(R0)
BEQ R1, R2, SKIP
ADD R3, R1, R2
SKIP: STORE R3, 8(R0)
";
        let mut first = TestHarness::default();
        first.load(src);
        first.init_memory(&[(0, 5), (4, 5)]);
        let mut second = TestHarness::default();
        second.load(src);
        second.init_memory(&[(0, 5), (4, 5)]);

        for _ in 0..CYCLE_LIMIT {
            if first.sim.is_complete() {
                break;
            }
            assert_eq!(first.step(), second.step());
        }
        assert!(first.sim.is_complete() && second.sim.is_complete());
    }

    // whole-value clones are how embedding layers implement undo/redo; a
    // clone is an independent machine with identical future behavior
    #[test]
    fn test_clone_restores_state() {
        let src = "
LOAD R1, 0(R0)
MUL R2, R1, R1
";
        let mut harness = TestHarness::default();
        harness.load(src);
        harness.init_memory(&[(0, 6)]);
        for _ in 0..5 {
            harness.step();
        }

        let mut restored = TestHarness { sim: harness.sim.clone() };
        assert_eq!(harness.sim.snapshot(), restored.sim.snapshot());

        harness.run_to_completion();
        restored.run_to_completion();
        assert_eq!(harness.sim.snapshot(), restored.sim.snapshot());
        restored.assert_reg_value(2, 36);
    }

    #[test]
    fn test_load_failure_leaves_state_untouched() {
        let mut harness = TestHarness::default();
        harness.load("ADD R1, R0, R0\n");
        harness.run_to_completion();
        let before = harness.sim.snapshot();

        assert!(harness.sim.load_program("ADD R1, R9, R0\n").is_err());
        assert_eq!(harness.sim.snapshot(), before);
    }
}

use std::collections::BTreeMap;

use serde::Serialize;

use crate::instructions::instructions::InstrId;

/// Cycle numbers of the pipeline stages one instruction went through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub issue: Option<u64>,
    pub start_exec: Option<u64>,
    pub finish_exec: Option<u64>,
    pub write: Option<u64>,
    pub commit: Option<u64>,
}

/// Records the cycle of each pipeline stage per instruction for reporting.
/// Re-issuing an instruction (after a misprediction flush) starts its row
/// over.
#[derive(Clone, Debug, Default)]
pub struct TimingTracker {
    rows: BTreeMap<InstrId, StageTiming>,
}

impl TimingTracker {
    pub fn new() -> TimingTracker {
        TimingTracker { rows: BTreeMap::new() }
    }

    pub fn record_issue(&mut self, instr_id: InstrId, cycle: u64) {
        self.rows.insert(instr_id, StageTiming { issue: Some(cycle), ..StageTiming::default() });
    }

    pub fn record_start_exec(&mut self, instr_id: InstrId, cycle: u64) {
        self.rows.entry(instr_id).or_default().start_exec = Some(cycle);
    }

    pub fn record_finish_exec(&mut self, instr_id: InstrId, cycle: u64) {
        self.rows.entry(instr_id).or_default().finish_exec = Some(cycle);
    }

    pub fn record_write(&mut self, instr_id: InstrId, cycle: u64) {
        self.rows.entry(instr_id).or_default().write = Some(cycle);
    }

    pub fn record_commit(&mut self, instr_id: InstrId, cycle: u64) {
        self.rows.entry(instr_id).or_default().commit = Some(cycle);
    }

    pub fn get(&self, instr_id: InstrId) -> StageTiming {
        self.rows.get(&instr_id).copied().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_accumulate() {
        let mut tracker = TimingTracker::new();
        tracker.record_issue(3, 1);
        tracker.record_start_exec(3, 2);
        tracker.record_finish_exec(3, 4);
        tracker.record_write(3, 5);
        tracker.record_commit(3, 6);
        let row = tracker.get(3);
        assert_eq!(row.issue, Some(1));
        assert_eq!(row.start_exec, Some(2));
        assert_eq!(row.finish_exec, Some(4));
        assert_eq!(row.write, Some(5));
        assert_eq!(row.commit, Some(6));
    }

    #[test]
    fn test_reissue_restarts_row() {
        let mut tracker = TimingTracker::new();
        tracker.record_issue(0, 1);
        tracker.record_start_exec(0, 2);
        tracker.record_issue(0, 7);
        let row = tracker.get(0);
        assert_eq!(row.issue, Some(7));
        assert_eq!(row.start_exec, None);
    }
}

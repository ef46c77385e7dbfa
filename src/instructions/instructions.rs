use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Display;
use std::rc::Rc;

use serde::Serialize;

pub type WordType = u16;
pub type RegisterType = u8;
pub type RobIndex = u8;
pub type InstrId = usize;

pub const GENERAL_REG_CNT: usize = 8;
// CALL deposits its return address here; RET reads it back.
pub const LINK_REG: RegisterType = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum Opcode {
    ADD,
    SUB,
    NAND,
    MUL,
    LOAD,
    STORE,
    BEQ,
    CALL,
    RET,
}

/// Instruction class; reservation stations and functional units are
/// partitioned by it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum OpClass {
    AddSub,
    Nand,
    Mul,
    Load,
    Store,
    Beq,
    CallRet,
}

impl Opcode {
    pub fn class(self) -> OpClass {
        match self {
            Opcode::ADD | Opcode::SUB => OpClass::AddSub,
            Opcode::NAND => OpClass::Nand,
            Opcode::MUL => OpClass::Mul,
            Opcode::LOAD => OpClass::Load,
            Opcode::STORE => OpClass::Store,
            Opcode::BEQ => OpClass::Beq,
            Opcode::CALL | Opcode::RET => OpClass::CallRet,
        }
    }

    pub fn writes_register(self) -> bool {
        matches!(
            self,
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL | Opcode::LOAD | Opcode::CALL
        )
    }
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::NAND => "NAND",
        Opcode::MUL => "MUL",
        Opcode::LOAD => "LOAD",
        Opcode::STORE => "STORE",
        Opcode::BEQ => "BEQ",
        Opcode::CALL => "CALL",
        Opcode::RET => "RET",
    }
}

pub fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();

    match string.as_str() {
        "ADD" => Some(Opcode::ADD),
        "SUB" => Some(Opcode::SUB),
        "NAND" => Some(Opcode::NAND),
        "MUL" => Some(Opcode::MUL),
        "LOAD" => Some(Opcode::LOAD),
        "STORE" => Some(Opcode::STORE),
        "BEQ" => Some(Opcode::BEQ),
        "CALL" => Some(Opcode::CALL),
        "RET" => Some(Opcode::RET),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// One parsed instruction. Immutable once the loader has produced it; the
/// id is dense, assigned in program order and stable for the whole run.
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    pub id: InstrId,
    pub opcode: Opcode,
    pub ra: Option<RegisterType>,
    pub rb: Option<RegisterType>,
    pub rc: Option<RegisterType>,
    // sign-extended; branch displacement or load/store offset
    pub imm: Option<i16>,
    // absolute program index a label (or CALL immediate) resolved to
    pub target: Option<u16>,
    pub label: Option<String>,
    // program index this instruction sits at
    pub pc: u16,
    pub loc: SourceLocation,
}

impl Instr {
    /// The architectural register this instruction commits to, if any.
    pub fn dest(&self) -> Option<RegisterType> {
        match self.opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL | Opcode::LOAD => self.ra,
            Opcode::CALL => Some(LINK_REG),
            Opcode::STORE | Opcode::BEQ | Opcode::RET => None,
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = mnemonic(self.opcode);
        match self.opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL => {
                write!(
                    f,
                    "{} R{}, R{}, R{}",
                    name,
                    self.ra.unwrap_or(0),
                    self.rb.unwrap_or(0),
                    self.rc.unwrap_or(0)
                )
            }
            Opcode::LOAD | Opcode::STORE => {
                write!(
                    f,
                    "{} R{}, {}(R{})",
                    name,
                    self.ra.unwrap_or(0),
                    self.imm.unwrap_or(0),
                    self.rb.unwrap_or(0)
                )
            }
            Opcode::BEQ => {
                write!(f, "{} R{}, R{}, ", name, self.ra.unwrap_or(0), self.rb.unwrap_or(0))?;
                match &self.label {
                    Some(label) => write!(f, "{}", label),
                    None => write!(f, "{}", self.imm.unwrap_or(0)),
                }
            }
            Opcode::CALL => match &self.label {
                Some(label) => write!(f, "{} {}", name, label),
                None => write!(f, "{} {}", name, self.target.unwrap_or(0)),
            },
            Opcode::RET => write!(f, "{}", name),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub code: Vec<Rc<Instr>>,
    // label name -> program index
    pub labels: HashMap<String, u16>,
}

impl Program {
    pub fn get_instr(&self, pos: usize) -> Rc<Instr> {
        Rc::clone(&self.code[pos])
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Canonical text for this program; parsing the rendered text yields the
    /// same instruction records and label map back.
    pub fn render(&self) -> String {
        let mut labels_at: BTreeMap<u16, Vec<&str>> = BTreeMap::new();
        for (name, index) in &self.labels {
            labels_at.entry(*index).or_default().push(name);
        }
        for names in labels_at.values_mut() {
            names.sort_unstable();
        }

        let mut out = String::new();
        for (index, instr) in self.code.iter().enumerate() {
            if let Some(names) = labels_at.get(&(index as u16)) {
                for name in names {
                    out.push_str(name);
                    out.push_str(":\n");
                }
            }
            out.push_str("    ");
            out.push_str(&instr.to_string());
            out.push('\n');
        }
        if let Some(names) = labels_at.get(&(self.code.len() as u16)) {
            for name in names {
                out.push_str(name);
                out.push_str(":\n");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(opcode: Opcode, ra: u8, rb: u8, rc: u8) -> Instr {
        Instr {
            id: 0,
            opcode,
            ra: Some(ra),
            rb: Some(rb),
            rc: Some(rc),
            imm: None,
            target: None,
            label: None,
            pc: 0,
            loc: SourceLocation::default(),
        }
    }

    #[test]
    fn test_dest_register() {
        assert_eq!(instr(Opcode::ADD, 3, 1, 2).dest(), Some(3));
        assert_eq!(instr(Opcode::STORE, 3, 1, 0).dest(), None);
        assert_eq!(instr(Opcode::CALL, 0, 0, 0).dest(), Some(LINK_REG));
        assert_eq!(instr(Opcode::RET, 0, 0, 0).dest(), None);
    }

    #[test]
    fn test_mnemonic_round_trip() {
        for opcode in [
            Opcode::ADD,
            Opcode::SUB,
            Opcode::NAND,
            Opcode::MUL,
            Opcode::LOAD,
            Opcode::STORE,
            Opcode::BEQ,
            Opcode::CALL,
            Opcode::RET,
        ] {
            assert_eq!(get_opcode(mnemonic(opcode)), Some(opcode));
        }
        assert_eq!(get_opcode("JMP"), None);
    }

    #[test]
    fn test_display_memory_form() {
        let mut load = instr(Opcode::LOAD, 1, 0, 0);
        load.rc = None;
        load.imm = Some(-4);
        assert_eq!(load.to_string(), "LOAD R1, -4(R0)");
    }
}

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::rc::Rc;

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use regex::Regex;

use crate::instructions::instructions::{
    get_opcode, mnemonic, Instr, Opcode, Program, RegisterType, SourceLocation, GENERAL_REG_CNT,
};

#[derive(Parser)]
#[grammar = "loader/assembly.pest"]
struct AssemblyParser;

/// One structured load failure, pointing at the offending source position.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

#[derive(Clone, Debug)]
pub enum LoadError {
    // the grammar rejected the input
    ParseError(Diagnostic),
    // the input parsed but failed semantic checks
    AnalysisError(Vec<Diagnostic>),
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::ParseError(diagnostic) => write!(f, "{}", diagnostic),
            LoadError::AnalysisError(diagnostics) => {
                for (k, diagnostic) in diagnostics.iter().enumerate() {
                    if k > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", diagnostic)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for LoadError {}

enum RawOperand {
    Register(RegisterType),
    Number(i64),
    Mem { offset: i64, base: RegisterType },
    Label(String),
}

struct Loader {
    labels: HashMap<String, u16>,
    code: Vec<Instr>,
    errors: Vec<Diagnostic>,
    instr_cnt: u16,
}

/// Parses assembly text into a program. All diagnostics carry line/column;
/// a failing load produces no program state at all.
pub fn load_from_string(source: &str) -> Result<Program, LoadError> {
    let file = match AssemblyParser::parse(Rule::file, source) {
        Ok(mut pairs) => pairs.next().unwrap(),
        Err(err) => {
            let (line, column) = match err.line_col {
                pest::error::LineColLocation::Pos((line, column)) => (line, column),
                pest::error::LineColLocation::Span((line, column), _) => (line, column),
            };
            return Err(LoadError::ParseError(Diagnostic {
                line,
                column,
                message: err.variant.message().into_owned(),
            }));
        }
    };

    let mut loader =
        Loader { labels: HashMap::new(), code: Vec::new(), errors: Vec::new(), instr_cnt: 0 };

    // first pass: collect labels so forward references resolve
    for line in file.clone().into_inner() {
        if line.as_rule() != Rule::line {
            continue;
        }
        for item in line.into_inner() {
            match item.as_rule() {
                Rule::label_def => loader.scan_label(item),
                Rule::instr => loader.instr_cnt += 1,
                _ => {}
            }
        }
    }

    // second pass: generate the instruction records
    for line in file.into_inner() {
        if line.as_rule() != Rule::line {
            continue;
        }
        for item in line.into_inner() {
            if item.as_rule() == Rule::instr {
                loader.visit_instr(item);
            }
        }
    }

    if loader.errors.is_empty() {
        Ok(Program {
            code: loader.code.into_iter().map(Rc::new).collect(),
            labels: loader.labels,
        })
    } else {
        Err(LoadError::AnalysisError(loader.errors))
    }
}

impl Loader {
    fn scan_label(&mut self, pair: Pair<Rule>) {
        let loc = loc_of(&pair);
        let name = pair.into_inner().next().unwrap().as_str().to_string();

        if !is_valid_label_name(&name) {
            self.error(loc, format!("Illegal label name '{}'", name));
            return;
        }
        if self.labels.contains_key(&name) {
            self.error(loc, format!("Duplicate label '{}'", name));
            return;
        }
        self.labels.insert(name, self.instr_cnt);
    }

    fn visit_instr(&mut self, pair: Pair<Rule>) {
        let loc = loc_of(&pair);
        let mut inner = pair.into_inner();
        let mnemonic_pair = inner.next().unwrap();

        let opcode = match get_opcode(mnemonic_pair.as_str()) {
            Some(opcode) => opcode,
            None => {
                self.error(loc, format!("Unknown mnemonic '{}'", mnemonic_pair.as_str()));
                return;
            }
        };

        let mut operands = Vec::new();
        for operand_pair in inner {
            let operand_loc = loc_of(&operand_pair);
            match self.visit_operand(operand_pair) {
                Some(operand) => operands.push((operand, operand_loc)),
                None => return,
            }
        }

        if let Some(instr) = self.build_instr(opcode, &operands, loc) {
            self.code.push(instr);
        }
    }

    fn visit_operand(&mut self, pair: Pair<Rule>) -> Option<RawOperand> {
        let loc = loc_of(&pair);
        match pair.as_rule() {
            Rule::register => match self.parse_register(&pair) {
                Some(reg) => Some(RawOperand::Register(reg)),
                None => None,
            },
            Rule::number => match pair.as_str().parse::<i64>() {
                Ok(value) => Some(RawOperand::Number(value)),
                Err(_) => {
                    self.error(loc, format!("Number '{}' out of range", pair.as_str()));
                    None
                }
            },
            Rule::mem_operand => {
                let mut inner = pair.into_inner();
                let offset_pair = inner.next().unwrap();
                let register_pair = inner.next().unwrap();
                let offset = match offset_pair.as_str().parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => {
                        self.error(loc, format!("Number '{}' out of range", offset_pair.as_str()));
                        return None;
                    }
                };
                let base = self.parse_register(&register_pair)?;
                Some(RawOperand::Mem { offset, base })
            }
            Rule::ident => Some(RawOperand::Label(pair.as_str().to_string())),
            _ => unreachable!(),
        }
    }

    fn parse_register(&mut self, pair: &Pair<Rule>) -> Option<RegisterType> {
        let loc = loc_of(pair);
        let digits = &pair.as_str()[1..];
        match digits.parse::<u32>() {
            Ok(reg) if (reg as usize) < GENERAL_REG_CNT => Some(reg as RegisterType),
            _ => {
                self.error(loc, format!("Unknown register '{}'", pair.as_str()));
                None
            }
        }
    }

    fn build_instr(
        &mut self,
        opcode: Opcode,
        operands: &[(RawOperand, SourceLocation)],
        loc: SourceLocation,
    ) -> Option<Instr> {
        let pc = self.code.len() as u16;
        let mut instr = Instr {
            id: self.code.len(),
            opcode,
            ra: None,
            rb: None,
            rc: None,
            imm: None,
            target: None,
            label: None,
            pc,
            loc,
        };
        let name = mnemonic(opcode);

        match opcode {
            Opcode::ADD | Opcode::SUB | Opcode::NAND | Opcode::MUL => {
                match operands {
                    [(RawOperand::Register(ra), _), (RawOperand::Register(rb), _), (RawOperand::Register(rc), _)] =>
                    {
                        instr.ra = Some(*ra);
                        instr.rb = Some(*rb);
                        instr.rc = Some(*rc);
                    }
                    _ => {
                        self.error(loc, format!("{} requires 3 register operands (rA, rB, rC)", name));
                        return None;
                    }
                }
            }
            Opcode::LOAD | Opcode::STORE => match operands {
                [(RawOperand::Register(ra), _), (RawOperand::Mem { offset, base }, mem_loc)] => {
                    instr.ra = Some(*ra);
                    instr.rb = Some(*base);
                    match i16::try_from(*offset) {
                        Ok(offset) => instr.imm = Some(offset),
                        Err(_) => {
                            self.error(*mem_loc, format!("Offset {} out of range", offset));
                            return None;
                        }
                    }
                }
                _ => {
                    self.error(loc, format!("{} requires 2 operands (rA, offset(rB))", name));
                    return None;
                }
            },
            Opcode::BEQ => match operands {
                [(RawOperand::Register(ra), _), (RawOperand::Register(rb), _), (target, target_loc)] => {
                    instr.ra = Some(*ra);
                    instr.rb = Some(*rb);
                    match target {
                        RawOperand::Label(label) => {
                            let target = self.resolve_label(label, *target_loc)?;
                            let displacement = target as i64 - (pc as i64 + 1);
                            match i16::try_from(displacement) {
                                Ok(displacement) => instr.imm = Some(displacement),
                                Err(_) => {
                                    self.error(
                                        *target_loc,
                                        format!("Branch displacement {} out of range", displacement),
                                    );
                                    return None;
                                }
                            }
                            instr.target = Some(target);
                            instr.label = Some(label.clone());
                        }
                        RawOperand::Number(offset) => match i16::try_from(*offset) {
                            Ok(offset) => instr.imm = Some(offset),
                            Err(_) => {
                                self.error(*target_loc, format!("Offset {} out of range", offset));
                                return None;
                            }
                        },
                        _ => {
                            self.error(loc, "BEQ requires 3 operands (rA, rB, label)".to_string());
                            return None;
                        }
                    }
                }
                _ => {
                    self.error(loc, "BEQ requires 3 operands (rA, rB, label)".to_string());
                    return None;
                }
            },
            Opcode::CALL => match operands {
                [(RawOperand::Label(label), target_loc)] => {
                    instr.target = Some(self.resolve_label(label, *target_loc)?);
                    instr.label = Some(label.clone());
                }
                [(RawOperand::Number(target), target_loc)] => match u16::try_from(*target) {
                    Ok(target) => instr.target = Some(target),
                    Err(_) => {
                        self.error(*target_loc, format!("Call target {} out of range", target));
                        return None;
                    }
                },
                _ => {
                    self.error(loc, "CALL requires 1 operand (label)".to_string());
                    return None;
                }
            },
            Opcode::RET => {
                if !operands.is_empty() {
                    self.error(loc, "RET takes no operands".to_string());
                    return None;
                }
            }
        }

        Some(instr)
    }

    fn resolve_label(&mut self, label: &str, loc: SourceLocation) -> Option<u16> {
        match self.labels.get(label) {
            Some(target) => Some(*target),
            None => {
                self.error(loc, format!("Unknown label '{}'", label));
                None
            }
        }
    }

    fn error(&mut self, loc: SourceLocation, message: String) {
        self.errors.push(Diagnostic { line: loc.line, column: loc.column, message });
    }
}

fn loc_of(pair: &Pair<Rule>) -> SourceLocation {
    let (line, column) = pair.as_span().start_pos().line_col();
    SourceLocation { line, column }
}

fn is_valid_label_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let re = Regex::new(r"^(?i)R\d+$").unwrap();
    if re.is_match(name) {
        return false;
    }

    // it can't be an existing mnemonic
    get_opcode(name).is_none()
}

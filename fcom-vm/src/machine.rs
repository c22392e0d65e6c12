//! The instruction cycle: fetch, decode, operand gather, dispatch,
//! writeback.

use tracing::debug;

use fcom_asm::{
    effective_opj, instruction_set, lookup_format, operand_shape, plan_regs, Category, Fields,
    FieldsE, FormatCategory, FormatRecord, InstructionRecord, InstructionSet, OpAvail, RegSlot,
    RuUse, Template,
};
use fcom_obj::ObjectFile;
use fcom_types::OperandType;

use crate::error::{fp_exception, nan_payload_f32, nan_payload_f64, EmuError, Interrupt};
use crate::memory::{Memory, Purpose};
use crate::registers::{PerfCounters, Registers};

/// Emulator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum vector length in bytes.
    pub max_vector_length: u32,
    /// Call/data stack reservation.
    pub stack_size: u64,
    /// Heap reservation.
    pub heap_size: u64,
    /// Abort after this many instructions.
    pub step_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_vector_length: 128,
            stack_size: 0x1_0000,
            heap_size: 0x10_0000,
            step_limit: None,
        }
    }
}

/// Why the program stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The outermost function returned; the value of `r0`.
    Returned(u64),
    /// A `sys_call` exit; the value of `r0`.
    SysExit(u64),
}

const MAX_CALL_DEPTH: usize = 4096;

/// The interpreting emulator: one thread, program order, no speculation.
#[derive(Debug)]
pub struct Emulator {
    mem: Memory,
    regs: Registers,
    ip: u64,
    ip_base: u64,
    call_stack: Vec<u64>,
    counters: PerfCounters,
    iset: &'static InstructionSet,
}

impl Emulator {
    /// Map an executable and prepare the register file.
    pub fn new(exe: &ObjectFile, config: &Config) -> Result<Self, EmuError> {
        if !exe.is_executable {
            return Err(EmuError::NotExecutable);
        }
        let iset = instruction_set().map_err(|_| EmuError::NotExecutable)?;
        let (mem, sp) = Memory::from_executable(exe, config.stack_size, config.heap_size)?;
        let mut regs = Registers::new(config.max_vector_length);
        regs.gp[31] = sp;
        regs.datap = exe.datap_base;
        regs.threadp = exe.threadp_base;
        let ip = exe.ip_base + exe.entry;
        debug!(entry = ip, sp, "emulator ready");
        Ok(Self {
            mem,
            regs,
            ip,
            ip_base: exe.ip_base,
            call_stack: Vec::new(),
            counters: PerfCounters::default(),
            iset,
        })
    }

    /// The register file.
    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    /// Mutable register file, for harness setup.
    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Performance counters so far.
    pub fn counters(&self) -> PerfCounters {
        self.counters
    }

    /// Current instruction pointer.
    pub fn ip(&self) -> u64 {
        self.ip
    }

    /// Read emulated memory, for harness checks.
    pub fn read_mem(&mut self, addr: u64, size: u32) -> Result<u64, Interrupt> {
        self.mem.read(addr, size, Purpose::ReadWrite)
    }

    /// Run to completion or the step limit.
    pub fn run(&mut self, config: &Config) -> Result<ExitStatus, EmuError> {
        loop {
            if let Some(limit) = config.step_limit {
                if self.counters.instructions >= limit {
                    return Err(EmuError::StepLimit(limit));
                }
            }
            match self.step() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(interrupt) => {
                    return Err(EmuError::Stopped {
                        interrupt,
                        ip: self.ip,
                    })
                }
            }
        }
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Result<Option<ExitStatus>, Interrupt> {
        let word0 = self.mem.fetch(self.ip)?;
        let fmt = lookup_format(word0).ok_or(Interrupt::UnknownInstruction)?;
        let mut words = vec![word0];
        for w in 1..fmt.word_size() as u64 {
            words.push(self.mem.fetch(self.ip + 4 * w)?);
        }
        let rec = find_record(self.iset, fmt, &words).ok_or(Interrupt::UnknownInstruction)?;
        let next_ip = self.ip + u64::from(fmt.byte_size());

        self.counters.instructions += 1;
        match fmt.exe_table {
            fcom_asm::exe_table::GP => self.counters.gp_instructions += 1,
            fcom_asm::exe_table::VECTOR => self.counters.vector_instructions += 1,
            fcom_asm::exe_table::JUMP => self.counters.jumps += 1,
            _ => self.counters.single_format += 1,
        }

        let status = match fmt.category {
            FormatCategory::Jump => {
                self.exec_jump(rec, fmt, &words, next_ip)?;
                None
            }
            FormatCategory::Single if fmt.tmpl == Template::E => {
                self.exec_single(rec, fmt, &words, next_ip)?
            }
            _ if rec.category == Category::Single => {
                // template A/B singles: nop, return, push, pop
                self.exec_small_single(rec, fmt, &words, next_ip)?
            }
            _ if fmt.vector => {
                self.exec_vector_multi(rec, fmt, &words)?;
                self.ip = next_ip;
                None
            }
            _ => {
                self.exec_gp_multi(rec, fmt, &words)?;
                self.ip = next_ip;
                None
            }
        };
        Ok(status)
    }

    fn ot_of(&self, fmt: &FormatRecord, fields: &Fields) -> OperandType {
        fmt.ot_fixed
            .unwrap_or_else(|| OperandType::from_repr(fields.ot).unwrap_or(OperandType::Int64))
    }

    /// Resolve a base-register code to an address base.
    fn base_value(&self, code: u8) -> u64 {
        match code {
            28 => self.ip_base,
            29 => self.regs.datap,
            30 => self.regs.threadp,
            r => self.regs.gp[r as usize],
        }
    }

    /// Effective address of the memory operand.
    fn mem_address(&self, fmt: &FormatRecord, fields: &Fields, words: &[u32], ot: OperandType) -> u64 {
        let e = FieldsE::decode(words[1]);
        let base = self.base_value(fmt.rs_of(words[0]));
        let raw = read_field(words, fmt.addr_pos, fmt.addr_size);
        let offset = if fmt.scale {
            raw * i64::from(ot.data_size())
        } else {
            raw
        };
        let mut addr = base.wrapping_add(offset as u64);
        if e.im5 & 1 != 0 {
            addr = addr.wrapping_add(
                self.regs.gp[fields.rt as usize].wrapping_mul(u64::from(ot.data_size())),
            );
        }
        addr
    }

    /// Decode the immediate field into the value domain of `ot`.
    fn imm_bits(&self, rec: &InstructionRecord, fmt: &FormatRecord, words: &[u32], ot: OperandType) -> u64 {
        let raw = read_field(words, fmt.imm_pos, fmt.imm_size);
        if ot.is_float() {
            // immediates for float operand types are stored as reduced
            // floats or as small integers to convert
            let value = match fmt.imm_size {
                2 => fcom_asm::f16_to_f64(raw as u16),
                4 => f64::from(f32::from_bits(raw as u32)),
                _ => raw as f64,
            };
            return float_to_bits(value, ot);
        }
        let unsigned = rec.variant.contains(fcom_asm::VariantFlags::U0);
        if unsigned {
            // strip the sign extension added by the field reader
            let bits = u32::from(fmt.imm_size) * 8;
            if bits < 64 {
                return (raw as u64) & ((1 << bits) - 1);
            }
        }
        raw as u64
    }

    // ----- general purpose -----------------------------------------------

    fn exec_gp_multi(
        &mut self,
        rec: &InstructionRecord,
        fmt: &FormatRecord,
        words: &[u32],
    ) -> Result<(), Interrupt> {
        let fields = Fields::decode(words[0]);
        let ot = self.ot_of(fmt, &fields);
        let shape = operand_shape(rec, fmt).ok_or(Interrupt::WrongParameters)?;
        let plan = plan_regs(fmt, shape.n_regs).ok_or(Interrupt::WrongParameters)?;

        let mut ops: Vec<u64> = Vec::with_capacity(3);
        for slot in &plan {
            let r = match slot {
                RegSlot::Rd => fields.rd,
                RegSlot::Rs => fmt.rs_of(words[0]),
                RegSlot::Rt => fields.rt,
            };
            ops.push(truncate(self.regs.gp[r as usize], ot));
        }
        if shape.mem_source {
            let addr = self.mem_address(fmt, &fields, words, ot);
            ops.push(self.mem.read(addr, ot.data_size(), Purpose::ReadWrite)?);
        }
        if shape.has_imm {
            ops.push(truncate(self.imm_bits(rec, fmt, words, ot), ot));
        }

        if shape.mem_dest {
            // store: the single operand is the value
            let addr = self.mem_address(fmt, &fields, words, ot);
            let value = *ops.first().ok_or(Interrupt::WrongParameters)?;
            return self.mem.write(addr, ot.data_size(), value);
        }

        let result = gp_operation(rec.op1, &ops, ot)?;

        // masked general-purpose operations write zero when disabled
        let result = if fmt.has_mask() && fields.mask != 7 {
            if self.regs.gp[fields.mask as usize] & 1 != 0 {
                result
            } else {
                0
            }
        } else {
            result
        };
        self.regs.gp[fields.rd as usize] = truncate(result, ot);
        Ok(())
    }

    // ----- vector --------------------------------------------------------

    fn exec_vector_multi(
        &mut self,
        rec: &InstructionRecord,
        fmt: &FormatRecord,
        words: &[u32],
    ) -> Result<(), Interrupt> {
        let fields = Fields::decode(words[0]);
        let ot = self.ot_of(fmt, &fields);
        let shape = operand_shape(rec, fmt).ok_or(Interrupt::WrongParameters)?;
        let plan = plan_regs(fmt, shape.n_regs).ok_or(Interrupt::WrongParameters)?;
        let size = ot.data_size();

        // vector loads and stores move whole registers under a length
        if shape.mem_dest || shape.mem_source {
            let addr = self.mem_address(fmt, &fields, words, ot);
            let e = FieldsE::decode(words[1]);
            let length = if fmt.ru_use == RuUse::Length && e.ru != 31 {
                (self.regs.gp[e.ru as usize] as u32).min(self.regs.max_vector_length())
            } else if shape.mem_dest {
                self.regs.vector_length(fields.rd)
            } else {
                self.regs.max_vector_length()
            };
            if shape.mem_dest {
                let current = self.regs.vector(fields.rd);
                let n = (length as usize).min(current.len());
                let mut data = current[..n].to_vec();
                data.resize(length as usize, 0);
                return self.mem.write_bytes(addr, &data);
            }
            let mut data = vec![0u8; length as usize];
            self.mem
                .read_bytes_into(addr, &mut data, Purpose::ReadWrite)?;
            self.regs.set_vector(fields.rd, &data);
            return Ok(());
        }

        // element loop over the first vector source's length
        let reg_of = |slot: &RegSlot| match slot {
            RegSlot::Rd => fields.rd,
            RegSlot::Rs => fmt.rs_of(words[0]),
            RegSlot::Rt => fields.rt,
        };
        let length = plan
            .first()
            .map(|s| self.regs.vector_length(reg_of(s)))
            .unwrap_or_else(|| self.regs.vector_length(fields.rd));
        let imm = if shape.has_imm {
            Some(truncate(self.imm_bits(rec, fmt, words, ot), ot))
        } else {
            None
        };
        let e = words.get(1).copied().map(FieldsE::decode);
        let fallback_reg = match (fmt.ru_use, e) {
            (RuUse::Fallback, Some(e)) if e.ru != 31 => Some(e.ru),
            _ => None,
        };
        let mut results = Vec::with_capacity((length / size.max(1)) as usize);
        let mut at = 0u32;
        while at + size <= length {
            let mut ops: Vec<u64> = Vec::with_capacity(3);
            for slot in &plan {
                ops.push(self.regs.vector_element(reg_of(slot), at, size));
            }
            if let Some(v) = imm {
                ops.push(v);
            }
            let mut value = vector_operation(rec.op1, &ops, ot, self.ip)?;
            if fmt.has_mask() && fields.mask != 7 {
                let enabled = self.regs.vector_element(fields.mask, at, size) & 1 != 0;
                if !enabled {
                    value = match fallback_reg {
                        Some(f) => self.regs.vector_element(f, at, size),
                        None => 0,
                    };
                }
            }
            results.push(value);
            at += size;
        }
        self.regs.set_vector_length(fields.rd, length);
        let mut at = 0u32;
        for v in results {
            self.regs.set_vector_element(fields.rd, at, size, v);
            at += size;
        }
        Ok(())
    }

    // ----- jumps ---------------------------------------------------------

    fn exec_jump(
        &mut self,
        rec: &InstructionRecord,
        fmt: &FormatRecord,
        words: &[u32],
        next_ip: u64,
    ) -> Result<(), Interrupt> {
        let fields = Fields::decode(words[0]);
        let ot = self.ot_of(fmt, &fields);
        let opj = effective_opj(fmt, words);
        let offset = read_field(words, fmt.jump_pos, fmt.jump_size) << 2;
        let target = next_ip.wrapping_add(offset as u64);

        // D template: unconditional jump or call
        if fmt.tmpl == Template::D {
            if fmt.key.mode2 == 1 {
                if self.call_stack.len() >= MAX_CALL_DEPTH {
                    return Err(Interrupt::CallStackOverflow);
                }
                self.call_stack.push(next_ip);
                self.counters.calls += 1;
            }
            self.ip = target;
            return Ok(());
        }

        let family = fields.op1;
        let imm = if fmt.imm_size > 0 {
            truncate(self.imm_bits(rec, fmt, words, ot), ot)
        } else {
            0
        };
        // the tested register: RD for the one-word form, RS otherwise
        let reg = if fmt.op_avail.contains(OpAvail::RS) {
            fmt.rs_of(words[0])
        } else {
            fields.rd
        };
        let a = truncate(self.regs.gp[reg as usize], ot);

        let (result, carry, write_back) = match family {
            fcom_asm::op1::JF_CMP_ZERO => (a, false, false),
            fcom_asm::op1::JF_SUB => {
                let r = a.wrapping_sub(imm);
                (truncate(r, ot), a < imm, true)
            }
            fcom_asm::op1::JF_ADD => {
                let r = a.wrapping_add(imm);
                let t = truncate(r, ot);
                (t, t < a, true)
            }
            fcom_asm::op1::JF_TEST_BIT => ((a >> (imm & 63)) & 1, false, false),
            fcom_asm::op1::JF_COMPARE => (a, false, false),
            fcom_asm::op1::JF_INC_CMP => {
                let r = truncate(a.wrapping_add(1), ot);
                (r, r < imm, true)
            }
            _ => return Err(Interrupt::UnknownInstruction),
        };
        if write_back {
            self.regs.gp[fields.rd as usize] = result;
        }

        let signed = |v: u64| sign_of(v, ot);
        let taken = match family {
            fcom_asm::op1::JF_COMPARE => match opj {
                fcom_asm::opj::ZERO => a == imm,
                fcom_asm::opj::NZERO => a != imm,
                fcom_asm::opj::NEG => signed(a) < signed(imm),
                fcom_asm::opj::NNEG => signed(a) >= signed(imm),
                fcom_asm::opj::POS => signed(a) > signed(imm),
                fcom_asm::opj::NPOS => signed(a) <= signed(imm),
                fcom_asm::opj::CARRY => a < imm,
                fcom_asm::opj::NCARRY => a >= imm,
                _ => return Err(Interrupt::WrongParameters),
            },
            fcom_asm::op1::JF_INC_CMP => carry,
            _ => match opj {
                fcom_asm::opj::ZERO => result == 0,
                fcom_asm::opj::NZERO => result != 0,
                fcom_asm::opj::NEG => signed(result) < 0,
                fcom_asm::opj::NNEG => signed(result) >= 0,
                fcom_asm::opj::POS => signed(result) > 0,
                fcom_asm::opj::NPOS => signed(result) <= 0,
                fcom_asm::opj::OVERFLOW => false,
                fcom_asm::opj::NOVERFLOW => true,
                fcom_asm::opj::CARRY => carry,
                fcom_asm::opj::NCARRY => !carry,
                fcom_asm::opj::TRUE => result != 0,
                fcom_asm::opj::FALSE => result == 0,
                fcom_asm::opj::ALWAYS => true,
                _ => return Err(Interrupt::WrongParameters),
            },
        };
        self.ip = if taken { target } else { next_ip };
        Ok(())
    }

    // ----- single format -------------------------------------------------

    fn exec_small_single(
        &mut self,
        rec: &InstructionRecord,
        fmt: &FormatRecord,
        words: &[u32],
        next_ip: u64,
    ) -> Result<Option<ExitStatus>, Interrupt> {
        let fields = Fields::decode(words[0]);
        match rec.op1 {
            fcom_asm::op1::NOP => {
                self.ip = next_ip;
                Ok(None)
            }
            fcom_asm::op1::RETURN => {
                self.counters.calls += 1;
                match self.call_stack.pop() {
                    Some(addr) => {
                        self.ip = addr;
                        Ok(None)
                    }
                    None => Ok(Some(ExitStatus::Returned(self.regs.gp[0]))),
                }
            }
            fcom_asm::op1::PUSH => {
                let value = self.regs.gp[fmt.rs_of(words[0]) as usize];
                let sp = self.regs.gp[31].wrapping_sub(8);
                self.mem.write(sp, 8, value)?;
                self.regs.gp[31] = sp;
                self.ip = next_ip;
                Ok(None)
            }
            fcom_asm::op1::POP => {
                let sp = self.regs.gp[31];
                let value = self.mem.read(sp, 8, Purpose::ReadWrite)?;
                self.regs.gp[fields.rd as usize] = value;
                self.regs.gp[31] = sp.wrapping_add(8);
                self.ip = next_ip;
                Ok(None)
            }
            _ => Err(Interrupt::UnknownInstruction),
        }
    }

    fn exec_single(
        &mut self,
        rec: &InstructionRecord,
        fmt: &FormatRecord,
        words: &[u32],
        next_ip: u64,
    ) -> Result<Option<ExitStatus>, Interrupt> {
        use fcom_asm::op2;

        let fields = Fields::decode(words[0]);
        let e = FieldsE::decode(words[1]);
        let ot = self.ot_of(fmt, &fields);
        let size = ot.data_size();
        let rs = fmt.rs_of(words[0]);
        let rt = fields.rt;
        let rd = fields.rd;

        match e.op2 {
            op2::SET_LEN => {
                let len = (self.regs.gp[rt as usize] as u32).min(self.regs.max_vector_length());
                let data = self.regs.vector(rs).to_vec();
                self.regs.set_vector(rd, &data);
                self.regs.set_vector_length(rd, len);
            }
            op2::GET_LEN => {
                self.regs.gp[rd as usize] = u64::from(self.regs.vector_length(rs));
            }
            op2::BROADCAST => {
                let len = (self.regs.gp[rs as usize] as u32).min(self.regs.max_vector_length());
                let value = truncate(self.imm_bits(rec, fmt, words, ot), ot);
                self.regs.set_vector_length(rd, 0);
                self.regs.set_vector_length(rd, len);
                let mut at = 0;
                while at + size <= len {
                    self.regs.set_vector_element(rd, at, size, value);
                    at += size;
                }
            }
            op2::COMPRESS_SPARSE => {
                // pack elements whose mask element has bit 0 set
                if fields.mask == 7 {
                    return Err(Interrupt::WrongParameters);
                }
                let length = self.regs.vector_length(rs);
                let mut out: Vec<u8> = Vec::with_capacity(length as usize);
                let mut at = 0u32;
                while at + size <= length {
                    if self.regs.vector_element(fields.mask, at, size) & 1 != 0 {
                        let v = self.regs.vector_element(rs, at, size);
                        out.extend_from_slice(&v.to_le_bytes()[..size as usize]);
                    }
                    at += size;
                }
                self.regs.set_vector(rd, &out);
            }
            op2::EXPAND => {
                // inverse of compress: spread packed elements to the mask
                if fields.mask == 7 {
                    return Err(Interrupt::WrongParameters);
                }
                let length = self.regs.max_vector_length();
                let mut src_at = 0u32;
                let mut at = 0u32;
                self.regs.set_vector_length(rd, 0);
                while at + size <= length {
                    let v = if self.regs.vector_element(fields.mask, at, size) & 1 != 0 {
                        let v = self.regs.vector_element(rs, src_at, size);
                        src_at += size;
                        v
                    } else {
                        0
                    };
                    self.regs.set_vector_element(rd, at, size, v);
                    at += size;
                }
            }
            op2::PERMUTE => {
                // index vector in rt selects source elements
                let length = self.regs.vector_length(rs);
                let count = length / size.max(1);
                let mut out = Vec::with_capacity(length as usize);
                let mut at = 0u32;
                while at + size <= length {
                    let index = self.regs.vector_element(rt, at, size) as u32 % count.max(1);
                    let v = self.regs.vector_element(rs, index * size, size);
                    out.extend_from_slice(&v.to_le_bytes()[..size as usize]);
                    at += size;
                }
                self.regs.set_vector(rd, &out);
            }
            op2::INSERT => {
                let pos = read_field(words, fmt.imm_pos, fmt.imm_size) as u32;
                let data = self.regs.vector(rs).to_vec();
                self.regs.set_vector(rd, &data);
                let v = self.regs.vector_element(rt, 0, size);
                self.regs.set_vector_element(rd, pos * size, size, v);
            }
            op2::EXTRACT => {
                let pos = read_field(words, fmt.imm_pos, fmt.imm_size) as u32;
                self.regs.gp[rd as usize] = self.regs.vector_element(rs, pos * size, size);
            }
            op2::SQRT => {
                self.vector_unary_float(rd, rs, ot, |v| {
                    if v < 0.0 {
                        Err(fp_exception::INVALID_SQRT)
                    } else {
                        Ok(v.sqrt())
                    }
                })?;
            }
            op2::FLOAT2INT => {
                let length = self.regs.vector_length(rs);
                self.regs.set_vector_length(rd, length);
                let mut at = 0;
                while at + size <= length {
                    let bits = self.regs.vector_element(rs, at, size);
                    let v = bits_to_float(bits, ot);
                    self.regs
                        .set_vector_element(rd, at, size, truncate(v as i64 as u64, ot));
                    at += size;
                }
            }
            op2::INT2FLOAT => {
                let length = self.regs.vector_length(rs);
                self.regs.set_vector_length(rd, length);
                let mut at = 0;
                while at + size <= length {
                    let v = sign_of(self.regs.vector_element(rs, at, size), ot);
                    self.regs
                        .set_vector_element(rd, at, size, float_to_bits(v as f64, ot));
                    at += size;
                }
            }
            op2::READ_SPEC => {
                let index = self.imm_bits(rec, fmt, words, OperandType::Int64);
                let value = self
                    .regs
                    .read_special(index)
                    .ok_or(Interrupt::WrongParameters)?;
                self.regs.gp[rd as usize] = value;
            }
            op2::WRITE_SPEC => {
                let index = self.imm_bits(rec, fmt, words, OperandType::Int64);
                let value = self.regs.gp[rs as usize];
                if !self.regs.write_special(index, value) {
                    return Err(Interrupt::WrongParameters);
                }
            }
            op2::SYS_CALL => {
                let id = self.imm_bits(rec, fmt, words, OperandType::Int64);
                match id {
                    // exit
                    1 => {
                        self.ip = next_ip;
                        return Ok(Some(ExitStatus::SysExit(self.regs.gp[0])));
                    }
                    _ => return Err(Interrupt::WrongParameters),
                }
            }
            op2::ADDRESS => {
                let offset = read_field(words, fmt.imm_pos, fmt.imm_size);
                self.regs.gp[rd as usize] = self.regs.datap.wrapping_add(offset as u64);
            }
            _ => return Err(Interrupt::UnknownInstruction),
        }
        self.ip = next_ip;
        Ok(None)
    }

    fn vector_unary_float(
        &mut self,
        rd: u8,
        rs: u8,
        ot: OperandType,
        f: impl Fn(f64) -> Result<f64, u32>,
    ) -> Result<(), Interrupt> {
        let size = ot.data_size();
        let length = self.regs.vector_length(rs);
        let ip = self.ip;
        self.regs.set_vector_length(rd, length);
        let mut at = 0;
        while at + size <= length {
            let bits = self.regs.vector_element(rs, at, size);
            let out = if is_nan_bits(bits, ot) {
                bits // NaN inputs propagate untouched
            } else {
                match f(bits_to_float(bits, ot)) {
                    Ok(v) => float_to_bits(v, ot),
                    Err(code) => nan_bits(code, ip, ot),
                }
            };
            self.regs.set_vector_element(rd, at, size, out);
            at += size;
        }
        Ok(())
    }
}

/// Find the instruction record for a decoded word group. The decode path
/// shared with the disassembler: jump records key on (family, OPJ),
/// template-E singles on OP2, everything else on OP1.
fn find_record<'a>(
    iset: &'a InstructionSet,
    fmt: &FormatRecord,
    words: &[u32],
) -> Option<&'a InstructionRecord> {
    let fields = Fields::decode(words[0]);
    match fmt.category {
        FormatCategory::Jump => {
            let opj = effective_opj(fmt, words);
            let family = if fmt.tmpl == Template::D {
                fmt.key.mode2
            } else {
                fields.op1
            };
            iset.find_jump(family, opj)
        }
        FormatCategory::Single if fmt.tmpl == Template::E => {
            let e = FieldsE::decode(words[1]);
            iset.find_single(fields.op1, e.op2)
        }
        _ => {
            let fmt_index = fcom_asm::FORMAT_TABLE
                .iter()
                .position(|f| f.key == fmt.key)?;
            iset.find_multi(fields.op1)
                .filter(|r| r.allows_format(fmt_index))
                .or_else(|| {
                    iset.records().iter().find(|r| {
                        r.category == Category::Single
                            && r.op1 == fields.op1
                            && r.allows_format(fmt_index)
                    })
                })
        }
    }
}

/// Sign-extended little-endian field read over the instruction words.
fn read_field(words: &[u32], pos: u8, size: u8) -> i64 {
    let mut v: u64 = 0;
    for i in 0..size {
        let at = usize::from(pos + i);
        let byte = (words[at / 4] >> ((at % 4) * 8)) & 0xff;
        v |= u64::from(byte) << (8 * i);
    }
    let bits = u32::from(size) * 8;
    if bits == 0 || bits >= 64 {
        return v as i64;
    }
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

/// Zero-extend a value to the operand size.
fn truncate(value: u64, ot: OperandType) -> u64 {
    let bits = ot.data_size() * 8;
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Interpret a truncated value as signed.
fn sign_of(value: u64, ot: OperandType) -> i64 {
    let bits = ot.data_size() * 8;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn bits_to_float(bits: u64, ot: OperandType) -> f64 {
    match ot {
        OperandType::Float => f64::from(f32::from_bits(bits as u32)),
        OperandType::Float16 => fcom_asm::f16_to_f64(bits as u16),
        _ => f64::from_bits(bits),
    }
}

fn float_to_bits(value: f64, ot: OperandType) -> u64 {
    match ot {
        OperandType::Float => u64::from((value as f32).to_bits()),
        OperandType::Float16 => u64::from(fcom_asm::f64_to_f16(value)),
        _ => value.to_bits(),
    }
}

fn is_nan_bits(bits: u64, ot: OperandType) -> bool {
    bits_to_float(bits, ot).is_nan()
}

fn nan_bits(code: u32, ip: u64, ot: OperandType) -> u64 {
    match ot {
        OperandType::Float | OperandType::Float16 => u64::from(nan_payload_f32(code, ip)),
        _ => nan_payload_f64(code, ip),
    }
}

/// Quotient convention for integer division or remainder with a zero
/// divisor: saturate to the largest representable value of the operand
/// type. One rule for `div`, `div_u`, `rem` and the vector forms.
fn div_zero_sentinel(ot: OperandType, unsigned: bool) -> u64 {
    if unsigned {
        mask_of(ot)
    } else {
        mask_of(ot) >> 1
    }
}

/// Dispatch a general-purpose multi-format operation by OP1.
///
/// The sparse two-dimensional handler grid of the dispatch tables is
/// expressed as one match per table; unknown codes trap.
fn gp_operation(
    op1: u8,
    ops: &[u64],
    ot: OperandType,
) -> Result<u64, Interrupt> {
    use fcom_asm::op1 as codes;

    let pair = || match ops {
        [a, b, ..] => Ok((*a, *b)),
        _ => Err(Interrupt::WrongParameters),
    };
    let triple = || match ops {
        [a, b, c] => Ok((*a, *b, *c)),
        _ => Err(Interrupt::WrongParameters),
    };

    Ok(match op1 {
        codes::MOVE => *ops.first().ok_or(Interrupt::WrongParameters)?,
        codes::COMPARE => {
            let (a, b) = pair()?;
            match sign_of(a, ot).cmp(&sign_of(b, ot)) {
                std::cmp::Ordering::Less => -1i64 as u64,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            }
        }
        codes::ADD => {
            let (a, b) = pair()?;
            a.wrapping_add(b)
        }
        codes::SUB => {
            let (a, b) = pair()?;
            a.wrapping_sub(b)
        }
        codes::SUB_REV => {
            let (a, b) = pair()?;
            b.wrapping_sub(a)
        }
        codes::MUL => {
            let (a, b) = pair()?;
            a.wrapping_mul(b)
        }
        codes::MUL_HI => {
            let (a, b) = pair()?;
            let wide = (sign_of(a, ot) as i128) * (sign_of(b, ot) as i128);
            (wide >> (ot.data_size() * 8)) as u64
        }
        codes::DIV => {
            let (a, b) = pair()?;
            if b == 0 {
                div_zero_sentinel(ot, false)
            } else {
                sign_of(a, ot).wrapping_div(sign_of(b, ot)) as u64
            }
        }
        codes::DIV_U => {
            let (a, b) = pair()?;
            if b == 0 {
                div_zero_sentinel(ot, true)
            } else {
                a / b
            }
        }
        codes::REM => {
            let (a, b) = pair()?;
            if b == 0 {
                div_zero_sentinel(ot, false)
            } else {
                sign_of(a, ot).wrapping_rem(sign_of(b, ot)) as u64
            }
        }
        codes::MIN => {
            let (a, b) = pair()?;
            sign_of(a, ot).min(sign_of(b, ot)) as u64
        }
        codes::MAX => {
            let (a, b) = pair()?;
            sign_of(a, ot).max(sign_of(b, ot)) as u64
        }
        codes::AND => {
            let (a, b) = pair()?;
            a & b
        }
        codes::OR => {
            let (a, b) = pair()?;
            a | b
        }
        codes::XOR => {
            let (a, b) = pair()?;
            a ^ b
        }
        codes::SHIFT_LEFT => {
            let (a, b) = pair()?;
            a.wrapping_shl(b as u32)
        }
        codes::ROTATE => {
            // rotate within the operand width
            let (a, b) = pair()?;
            let bits = ot.data_size() * 8;
            let b = (b as u32) % bits;
            if b == 0 {
                a
            } else {
                (a.wrapping_shl(b) | a.wrapping_shr(bits - b)) & mask_of(ot)
            }
        }
        codes::SHIFT_RIGHT_S => {
            let (a, b) = pair()?;
            (sign_of(a, ot) >> (b as u32).min(63)) as u64
        }
        codes::SHIFT_RIGHT_U => {
            let (a, b) = pair()?;
            a.wrapping_shr(b as u32)
        }
        codes::CLEAR_BIT => {
            let (a, b) = pair()?;
            a & !(1u64.wrapping_shl(b as u32))
        }
        codes::SET_BIT => {
            let (a, b) = pair()?;
            a | 1u64.wrapping_shl(b as u32)
        }
        codes::TOGGLE_BIT => {
            let (a, b) = pair()?;
            a ^ 1u64.wrapping_shl(b as u32)
        }
        codes::TEST_BIT => {
            let (a, b) = pair()?;
            (a >> (b & 63)) & 1
        }
        codes::TEST_BITS_AND => {
            let (a, b) = pair()?;
            u64::from(a & b == b)
        }
        codes::TEST_BITS_OR => {
            let (a, b) = pair()?;
            u64::from(a & b != 0)
        }
        codes::MUL_ADD => {
            let (a, b, c) = triple()?;
            a.wrapping_mul(b).wrapping_add(c)
        }
        codes::ADD_ADD => {
            let (a, b, c) = triple()?;
            a.wrapping_add(b).wrapping_add(c)
        }
        codes::SELECT_BITS => {
            let (a, b, c) = triple()?;
            (a & c) | (b & !c)
        }
        _ => return Err(Interrupt::UnknownInstruction),
    })
}

enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Compare,
}

/// Dispatch a per-element vector operation by OP1, covering every
/// mnemonic the instruction table marks vector-capable. Integer operand
/// types reuse the scalar semantics; float types go through the
/// payload-NaN arithmetic. Bitwise operations work on the raw element
/// bits for either class.
fn vector_operation(
    op1: u8,
    ops: &[u64],
    ot: OperandType,
    ip: u64,
) -> Result<u64, Interrupt> {
    use fcom_asm::op1 as codes;
    match op1 {
        codes::MOVE => ops.first().copied().ok_or(Interrupt::WrongParameters),
        codes::COMPARE => float_or_int(ops, ot, ip, FloatOp::Compare),
        codes::ADD => float_or_int(ops, ot, ip, FloatOp::Add),
        codes::SUB => float_or_int(ops, ot, ip, FloatOp::Sub),
        codes::SUB_REV => {
            let (a, b) = match ops {
                [a, b, ..] => (*a, *b),
                _ => return Err(Interrupt::WrongParameters),
            };
            float_or_int(&[b, a], ot, ip, FloatOp::Sub)
        }
        codes::MUL => float_or_int(ops, ot, ip, FloatOp::Mul),
        codes::DIV => float_or_int(ops, ot, ip, FloatOp::Div),
        codes::MIN => float_or_int(ops, ot, ip, FloatOp::Min),
        codes::MAX => float_or_int(ops, ot, ip, FloatOp::Max),
        // bitwise on the raw element bits, meaningful for every class
        codes::AND | codes::OR | codes::XOR | codes::SELECT_BITS => gp_operation(op1, ops, ot),
        // integer-only forms; a float operand type here is malformed
        codes::MUL_HI
        | codes::DIV_U
        | codes::REM
        | codes::SHIFT_LEFT
        | codes::ROTATE
        | codes::SHIFT_RIGHT_S
        | codes::SHIFT_RIGHT_U
        | codes::CLEAR_BIT
        | codes::SET_BIT
        | codes::TOGGLE_BIT
        | codes::TEST_BIT
        | codes::TEST_BITS_AND
        | codes::TEST_BITS_OR => {
            if ot.is_float() {
                Err(Interrupt::WrongParameters)
            } else {
                gp_operation(op1, ops, ot)
            }
        }
        codes::MUL_ADD => {
            if ot.is_float() {
                float_ternary(ops, ot, ip, |x, y, z| x * y + z)
            } else {
                gp_operation(op1, ops, ot)
            }
        }
        codes::ADD_ADD => {
            if ot.is_float() {
                float_ternary(ops, ot, ip, |x, y, z| x + y + z)
            } else {
                gp_operation(op1, ops, ot)
            }
        }
        _ => Err(Interrupt::UnknownInstruction),
    }
}

/// Two-operand arithmetic that dispatches on the operand type: floats
/// propagate payload NaNs, integers wrap. Division and remainder with a
/// zero divisor follow the same conventions as the scalar forms.
fn float_or_int(ops: &[u64], ot: OperandType, ip: u64, op: FloatOp) -> Result<u64, Interrupt> {
    let (a, b) = match ops {
        [a, b, ..] => (*a, *b),
        _ => return Err(Interrupt::WrongParameters),
    };
    if !ot.is_float() {
        return Ok(match op {
            FloatOp::Add => a.wrapping_add(b),
            FloatOp::Sub => a.wrapping_sub(b),
            FloatOp::Mul => a.wrapping_mul(b),
            FloatOp::Div => {
                if b == 0 {
                    div_zero_sentinel(ot, false)
                } else {
                    sign_of(a, ot).wrapping_div(sign_of(b, ot)) as u64
                }
            }
            FloatOp::Min => sign_of(a, ot).min(sign_of(b, ot)) as u64,
            FloatOp::Max => sign_of(a, ot).max(sign_of(b, ot)) as u64,
            FloatOp::Compare => match sign_of(a, ot).cmp(&sign_of(b, ot)) {
                std::cmp::Ordering::Less => -1i64 as u64,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            },
        });
    }
    // NaN inputs win, leftmost first
    if is_nan_bits(a, ot) {
        return Ok(a);
    }
    if is_nan_bits(b, ot) {
        return Ok(b);
    }
    let (x, y) = (bits_to_float(a, ot), bits_to_float(b, ot));
    let value = match op {
        FloatOp::Add => x + y,
        FloatOp::Sub => x - y,
        FloatOp::Mul => x * y,
        FloatOp::Div => {
            if y == 0.0 {
                return Ok(nan_bits(fp_exception::DIV_ZERO, ip, ot));
            }
            x / y
        }
        FloatOp::Min => x.min(y),
        FloatOp::Max => x.max(y),
        FloatOp::Compare => {
            return Ok(match x.partial_cmp(&y) {
                Some(std::cmp::Ordering::Less) => -1i64 as u64,
                Some(std::cmp::Ordering::Equal) => 0,
                Some(std::cmp::Ordering::Greater) => 1,
                None => nan_bits(fp_exception::INVALID, ip, ot),
            })
        }
    };
    if value.is_nan() {
        return Ok(nan_bits(fp_exception::INVALID, ip, ot));
    }
    Ok(float_to_bits(value, ot))
}

/// Three-operand float arithmetic with the same NaN conventions as
/// [`float_or_int`].
fn float_ternary(
    ops: &[u64],
    ot: OperandType,
    ip: u64,
    f: impl Fn(f64, f64, f64) -> f64,
) -> Result<u64, Interrupt> {
    let (a, b, c) = match ops {
        [a, b, c] => (*a, *b, *c),
        _ => return Err(Interrupt::WrongParameters),
    };
    for bits in [a, b, c] {
        if is_nan_bits(bits, ot) {
            return Ok(bits);
        }
    }
    let value = f(
        bits_to_float(a, ot),
        bits_to_float(b, ot),
        bits_to_float(c, ot),
    );
    if value.is_nan() {
        return Ok(nan_bits(fp_exception::INVALID, ip, ot));
    }
    Ok(float_to_bits(value, ot))
}

fn mask_of(ot: OperandType) -> u64 {
    let bits = ot.data_size() * 8;
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

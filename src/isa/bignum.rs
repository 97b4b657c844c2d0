//! Big-number accelerator core: the OTBN-style 256-bit coprocessor extension.
//!
//! The accelerator owns 32 wide data registers (WDRs), 8 wide special-purpose registers (WSRs),
//! two flag groups, a bounded x1 call stack, and a hardware loop stack. The `BN.*` instructions
//! operate on the wide registers; `LOOP`/`LOOPI` drive zero-overhead loops; `ECALL` ends the
//! program. Faults surface as [`Fault`] values and are latched into the [`CoreError`] register
//! the owning MMIO block reports to software.

use log::{debug, error};

use super::set::{CsrFile, InstructionSet};
use super::wide::Wide;
use super::{bits, Fault, InstallError};

pub const WIDE_REGISTER_COUNT: usize = 32;
const CALL_STACK_DEPTH: usize = 8;
const LOOP_STACK_DEPTH: usize = 8;
const FLAG_GROUP_COUNT: usize = 2;

/// Wide special-purpose register indices.
pub mod wsr {
    pub const MOD: usize = 0;
    pub const RND: usize = 1;
    pub const URND: usize = 2;
    pub const ACC: usize = 3;
    pub const KEY_SHARE_0_LOW: usize = 4;
    pub const KEY_SHARE_0_HIGH: usize = 5;
    pub const KEY_SHARE_1_LOW: usize = 6;
    pub const KEY_SHARE_1_HIGH: usize = 7;
    pub const COUNT: usize = 8;
}

/// Custom CSR numbers of the accelerator.
pub mod csr {
    pub const FG0: u16 = 0x7C0;
    pub const FG1: u16 = 0x7C1;
    pub const FLAGS: u16 = 0x7C8;
    /// MOD0..MOD7 are consecutive 32-bit windows into the MOD WSR.
    pub const MOD0: u16 = 0x7D0;
    pub const RND_PREFETCH: u16 = 0x7D8;
    pub const RND: u16 = 0xFC0;
    pub const URND: u16 = 0xFC1;
}

// Big-number opcode patterns.
/* I-type
                                      30        20   15 12    7      0
                                    add|      Imm| WRS|f3| WRD|opcode| */
const BN_ADD_I: &str = "-0---------------100-----0101011";
const BN_SUB_I: &str = "-1---------------100-----0101011";
/* I2-type
                                           25   20   15 12    7      0
                                         Imm|Wrs2|Wrs1|f3| WRD|opcode| */
const BN_RSHI: &str = "------------------11-----1111011";
/* R-type
                                           25   20   15 12    7      0
                                         add| rs2| rs1|f3|  rd|opcode| */
const BN_ADD: &str = "-----------------000-----0101011";
const BN_ADD_C: &str = "-----------------010-----0101011";
const BN_ADD_M: &str = "-0---------------101-----0101011";
const BN_SUB: &str = "-----------------001-----0101011";
const BN_SUB_B: &str = "-----------------011-----0101011";
const BN_SUB_M: &str = "-1---------------101-----0101011";
const BN_MULQACC: &str = "-00----------------------0111011";
const BN_MULQACC_WO: &str = "-01----------------------0111011";
const BN_MULQACC_SO: &str = "-1-----------------------0111011";
const LOOP: &str = "-----------------000-----1111011";
const LOOPI: &str = "-----------------001-----1111011";
const BN_AND: &str = "-----------------010-----1111011";
const BN_OR: &str = "-----------------100-----1111011";
const BN_NOT: &str = "-----------------101-----1111011";
const BN_XOR: &str = "-----------------110-----1111011";
const BN_SEL: &str = "-----------------000-----0001011";
const BN_CMP: &str = "-----------------001-----0001011";
const BN_CMP_B: &str = "-----------------011-----0001011";
const BN_MOV: &str = "0----------------110-----0001011";
/* S-type
                                          25   20    15 12    7      0
                                        off| Grd| Grs1|f3| add|opcode| */
const BN_LID: &str = "-----------------100-----0001011";
const BN_SID: &str = "-----------------101-----0001011";
const BN_MOVR: &str = "1----------------110-----0001011";
/* WSR reg-type
                                        28     20    15 12    7      0
                                      add|   Wsr|  Wrs|f3| Wrd|opcode| */
const BN_WSRR: &str = "0----------------111-----0001011";
const BN_WSRW: &str = "1----------------111-----0001011";
const ECALL: &str = "00000000000000000000000001110011";

/// One 4-bit flag group.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Flags {
    pub carry: bool,
    pub msb: bool,
    pub lsb: bool,
    pub zero: bool,
}

impl Flags {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            carry: bits & 0x1 != 0,
            msb: bits & 0x2 != 0,
            lsb: bits & 0x4 != 0,
            zero: bits & 0x8 != 0,
        }
    }

    pub fn bits(self) -> u8 {
        self.carry as u8 | (self.msb as u8) << 1 | (self.lsb as u8) << 2 | (self.zero as u8) << 3
    }

    /// Flag selected by a 2-bit `BN.SEL` field: carry, MSB, LSB, zero.
    fn select(self, index: u32) -> bool {
        match index {
            0 => self.carry,
            1 => self.msb,
            2 => self.lsb,
            _ => self.zero,
        }
    }
}

/// Flags produced by the arithmetic instructions: carry (or borrow) out, and the MSB/LSB of the
/// 256-bit result. MSB and LSB stay clear for a zero result.
fn flags_for(value: Wide, carry: bool) -> Flags {
    let zero = value.is_zero() && !carry;
    Flags {
        carry,
        msb: !zero && value.bit(255),
        lsb: !zero && value.bit(0),
        zero,
    }
}

/// Error register of the core, read out by the owning MMIO block.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum CoreError {
    #[default]
    None,
    BadInstructionAddress,
    IllegalInstruction,
    BadDataAddress,
    CallStack,
    Loop,
}

impl From<Fault> for CoreError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::IllegalInstruction => Self::IllegalInstruction,
            Fault::BadInstructionAddress => Self::BadInstructionAddress,
            Fault::BadDataAddress => Self::BadDataAddress,
            Fault::CallStackOverflow | Fault::CallStackUnderflow => Self::CallStack,
            Fault::LoopZeroIterations
            | Fault::LoopStackOverflow
            | Fault::LoopStackUnderflow
            | Fault::LoopAtBodyEnd => Self::Loop,
        }
    }
}

impl CoreError {
    /// Classify a RISC-V synchronous exception cause raised while running base-ISA code.
    /// Breakpoints and environment calls are not errors and yield `None`.
    pub fn from_exception_cause(cause: u64) -> Option<Self> {
        match cause {
            0x0 | 0x1 | 0xC => Some(Self::BadInstructionAddress),
            0x2 => Some(Self::IllegalInstruction),
            0x4..=0x7 | 0xD | 0xF => Some(Self::BadDataAddress),
            _ => None,
        }
    }
}

/// Source of the random values served by the RND/URND registers.
///
/// Injected at construction so simulations stay reproducible.
pub trait EntropySource {
    fn next_u64(&mut self) -> u64;

    fn next_wide(&mut self) -> Wide {
        Wide::from_limbs([
            self.next_u64(),
            self.next_u64(),
            self.next_u64(),
            self.next_u64(),
        ])
    }
}

/// Entropy source that serves a fixed 256-bit pattern.
#[derive(Debug, Clone)]
pub struct FixedPattern {
    pattern: Wide,
    next_limb: usize,
}

impl FixedPattern {
    pub fn new(pattern: Wide) -> Self {
        Self {
            pattern,
            next_limb: 0,
        }
    }
}

impl EntropySource for FixedPattern {
    fn next_u64(&mut self) -> u64 {
        let limb = self.pattern.limbs()[self.next_limb];
        self.next_limb = (self.next_limb + 1) % 4;
        limb
    }

    fn next_wide(&mut self) -> Wide {
        self.pattern
    }
}

/// 256-bit data memory interface of the accelerator.
pub trait WideMemory {
    fn read_wide(&mut self, address: u32) -> Result<Wide, Fault>;

    fn write_wide(&mut self, address: u32, value: Wide) -> Result<(), Fault>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct LoopContext {
    start_pc: u32,
    end_pc: u32,
    iterations: u32,
}

/// Architectural state the instruction handlers operate on.
struct State<M> {
    gprs: [u32; 32],
    pc: u32,
    wdrs: [Wide; WIDE_REGISTER_COUNT],
    wsrs: [Wide; wsr::COUNT],
    flag_groups: [Flags; FLAG_GROUP_COUNT],
    x1_stack: Vec<u32>,
    loop_stack: Vec<LoopContext>,
    entropy: Box<dyn EntropySource + Send>,
    fixed_random: Option<Wide>,
    memory: M,
    last_error: CoreError,
    finished: bool,
}

impl<M> State<M> {
    /// Architectural GPR read. Reading x1 pops the call stack.
    fn read_gpr(&mut self, index: u8) -> Result<u32, Fault> {
        let value = self.gprs[index as usize];
        if index == 1 {
            match self.x1_stack.pop() {
                Some(top) => self.gprs[1] = top,
                None => {
                    error!("reading x1 with an empty call stack");
                    self.last_error = CoreError::CallStack;
                    return Err(Fault::CallStackUnderflow);
                }
            }
        }
        Ok(value)
    }

    /// Architectural GPR write. Writing x1 pushes onto the call stack; x0 writes are dropped.
    fn write_gpr(&mut self, index: u8, value: u32) -> Result<(), Fault> {
        if index == 0 {
            return Ok(());
        }
        self.gprs[index as usize] = value;
        if index == 1 {
            if self.x1_stack.len() == CALL_STACK_DEPTH {
                error!("x1 call stack overflow");
                self.last_error = CoreError::CallStack;
                return Err(Fault::CallStackOverflow);
            }
            self.x1_stack.push(value);
        }
        Ok(())
    }

    fn random_wide(&mut self) -> Wide {
        match self.fixed_random {
            Some(pattern) => pattern,
            None => self.entropy.next_wide(),
        }
    }
}

fn wsr_read_only(index: usize) -> bool {
    matches!(
        index,
        wsr::RND
            | wsr::URND
            | wsr::KEY_SHARE_0_LOW
            | wsr::KEY_SHARE_0_HIGH
            | wsr::KEY_SHARE_1_LOW
            | wsr::KEY_SHARE_1_HIGH
    )
}

/// Result of executing a single instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StepOutcome {
    /// A custom instruction was executed and the PC advanced.
    Executed,
    /// An ECALL finished the program.
    Finished,
    /// The opcode is not a custom instruction. The PC has advanced by 4; base-ISA side effects,
    /// including branch targets applied through [`Accelerator::set_pc`], are up to the embedder.
    Unhandled,
}

/// The big-number accelerator core.
///
/// Drive it by setting the PC, feeding fetched opcodes to [`step`](Self::step), and reading
/// [`last_error`](Self::last_error) after a fault.
pub struct Accelerator<M> {
    instructions: InstructionSet<State<M>>,
    csrs: CsrFile<State<M>>,
    state: State<M>,
}

impl<M: WideMemory + Send + 'static> Accelerator<M> {
    pub fn new(memory: M, entropy: Box<dyn EntropySource + Send>) -> Self {
        let mut instructions = InstructionSet::new();
        let mut csrs = CsrFile::new();
        install(&mut instructions, &mut csrs)
            .expect("instruction patterns and CSR numbers are static");
        Self {
            instructions,
            csrs,
            state: State {
                gprs: [0; 32],
                pc: 0,
                wdrs: [Wide::ZERO; WIDE_REGISTER_COUNT],
                wsrs: [Wide::ZERO; wsr::COUNT],
                flag_groups: [Flags::default(); FLAG_GROUP_COUNT],
                x1_stack: Vec::with_capacity(CALL_STACK_DEPTH),
                loop_stack: Vec::with_capacity(LOOP_STACK_DEPTH),
                entropy,
                fixed_random: None,
                memory,
                last_error: CoreError::None,
                finished: false,
            },
        }
    }

    /// Restart the core: PC to 0, stacks and writable wide registers cleared.
    ///
    /// The read-only WSRs (key shares) keep their configured values.
    pub fn reset(&mut self) {
        let state = &mut self.state;
        state.gprs = [0; 32];
        state.pc = 0;
        state.wdrs = [Wide::ZERO; WIDE_REGISTER_COUNT];
        state.x1_stack.clear();
        state.loop_stack.clear();
        for index in 0..wsr::COUNT {
            if !wsr_read_only(index) {
                state.wsrs[index] = Wide::ZERO;
            }
        }
        state.flag_groups = [Flags::default(); FLAG_GROUP_COUNT];
        state.fixed_random = None;
        state.last_error = CoreError::None;
        state.finished = false;
    }

    pub fn pc(&self) -> u32 {
        self.state.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.state.pc = pc;
    }

    /// Direct (non-architectural) view of a GPR; no call-stack side effects.
    pub fn gpr(&self, index: u8) -> u32 {
        self.state.gprs[index as usize]
    }

    /// Architectural GPR read, with the x1 call-stack pop semantics.
    pub fn read_gpr(&mut self, index: u8) -> Result<u32, Fault> {
        self.state.read_gpr(index)
    }

    /// Architectural GPR write, with the x1 call-stack push semantics.
    pub fn write_gpr(&mut self, index: u8, value: u32) -> Result<(), Fault> {
        self.state.write_gpr(index, value)
    }

    pub fn wide_register(&self, index: usize) -> Wide {
        self.state.wdrs[index]
    }

    pub fn set_wide_register(&mut self, index: usize, value: Wide) {
        self.state.wdrs[index] = value;
    }

    pub fn wide_special_register(&self, index: usize) -> Wide {
        self.state.wsrs[index]
    }

    /// Host-side WSR write; ignores the read-only attribute.
    pub fn set_wide_special_register(&mut self, index: usize, value: Wide) {
        self.state.wsrs[index] = value;
    }

    /// Load one of the two sideloaded key shares into its WSR pair.
    pub fn set_key_share(&mut self, share: usize, low: Wide, high: Wide) {
        let base = match share {
            0 => wsr::KEY_SHARE_0_LOW,
            _ => wsr::KEY_SHARE_1_LOW,
        };
        self.state.wsrs[base] = low;
        self.state.wsrs[base + 1] = high;
    }

    /// Override the RND/URND wide reads with a fixed pattern, or restore true entropy.
    pub fn set_fixed_random(&mut self, pattern: Option<Wide>) {
        self.state.fixed_random = pattern;
    }

    pub fn flags(&self, group: usize) -> Flags {
        self.state.flag_groups[group]
    }

    pub fn last_error(&self) -> CoreError {
        self.state.last_error
    }

    pub fn memory(&self) -> &M {
        &self.state.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.state.memory
    }

    pub fn read_csr(&mut self, number: u16) -> u64 {
        self.csrs.read(&mut self.state, number)
    }

    pub fn write_csr(&mut self, number: u16, value: u64) {
        self.csrs.write(&mut self.state, number, value)
    }

    /// Execute the instruction at the current PC and advance it, driving the loop stack.
    ///
    /// On a fault the PC is left at the faulting instruction and the error is latched for
    /// [`last_error`](Self::last_error).
    pub fn step(&mut self, opcode: u32) -> Result<StepOutcome, Fault> {
        self.state.last_error = CoreError::None;
        self.state.finished = false;

        // A context that ran out of iterations here means the loop body never retired.
        if let Some(context) = self.state.loop_stack.last() {
            if context.iterations == 0 {
                error!("unexpected end of loop");
                self.state.loop_stack.pop();
                return Err(self.fail(Fault::LoopStackUnderflow));
            }
        }

        let pc = self.state.pc;
        let outcome = match self.instructions.execute(&mut self.state, opcode as u64) {
            Some(Ok(())) => {
                if self.state.finished {
                    StepOutcome::Finished
                } else {
                    StepOutcome::Executed
                }
            }
            Some(Err(fault)) => return Err(self.fail(fault)),
            None => StepOutcome::Unhandled,
        };
        self.state.pc = pc.wrapping_add(4);
        self.retire(pc);
        Ok(outcome)
    }

    fn fail(&mut self, fault: Fault) -> Fault {
        self.state.last_error = fault.into();
        fault
    }

    /// Loop bookkeeping after the instruction at `pc` completed: at the end of the innermost loop
    /// body, either branch back to the body start or pop the finished context.
    fn retire(&mut self, pc: u32) {
        if let Some(context) = self.state.loop_stack.last_mut() {
            if pc == context.end_pc {
                context.iterations -= 1;
                if context.iterations == 0 {
                    self.state.loop_stack.pop();
                    debug!(depth = self.state.loop_stack.len(); "finished hardware loop");
                } else {
                    self.state.pc = context.start_pc;
                }
            }
        }
    }
}

fn install<M: WideMemory + Send + 'static>(
    instructions: &mut InstructionSet<State<M>>,
    csrs: &mut CsrFile<State<M>>,
) -> Result<(), InstallError> {
    instructions.install(BN_ADD_I, "BN.ADDI", Box::new(immediate_add_sub))?;
    instructions.install(BN_SUB_I, "BN.SUBI", Box::new(immediate_add_sub))?;
    instructions.install(BN_RSHI, "BN.RSHI", Box::new(right_shift_concat))?;
    instructions.install(BN_ADD, "BN.ADD", Box::new(add_sub))?;
    instructions.install(BN_ADD_C, "BN.ADDC", Box::new(add_sub))?;
    instructions.install(BN_ADD_M, "BN.ADDM", Box::new(add_sub))?;
    instructions.install(BN_SUB, "BN.SUB", Box::new(add_sub))?;
    instructions.install(BN_SUB_B, "BN.SUBB", Box::new(add_sub))?;
    instructions.install(BN_SUB_M, "BN.SUBM", Box::new(add_sub))?;
    instructions.install(BN_MULQACC, "BN.MULQACC", Box::new(mul_accumulate))?;
    instructions.install(BN_MULQACC_WO, "BN.MULQACC.WO", Box::new(mul_accumulate_writeback))?;
    instructions.install(BN_MULQACC_SO, "BN.MULQACC.SO", Box::new(mul_accumulate_writeback))?;
    instructions.install(BN_AND, "BN.AND", Box::new(bitwise))?;
    instructions.install(BN_OR, "BN.OR", Box::new(bitwise))?;
    instructions.install(BN_NOT, "BN.NOT", Box::new(bitwise))?;
    instructions.install(BN_XOR, "BN.XOR", Box::new(bitwise))?;
    instructions.install(BN_SEL, "BN.SEL", Box::new(select))?;
    instructions.install(BN_CMP, "BN.CMP", Box::new(compare))?;
    instructions.install(BN_CMP_B, "BN.CMPB", Box::new(compare))?;
    instructions.install(BN_MOV, "BN.MOV", Box::new(move_register))?;
    instructions.install(BN_LID, "BN.LID", Box::new(load_store))?;
    instructions.install(BN_SID, "BN.SID", Box::new(load_store))?;
    instructions.install(BN_MOVR, "BN.MOVR", Box::new(move_indirect))?;
    instructions.install(BN_WSRR, "BN.WSRR", Box::new(wsr_access))?;
    instructions.install(BN_WSRW, "BN.WSRW", Box::new(wsr_access))?;
    instructions.install(ECALL, "ECALL", Box::new(ecall))?;
    instructions.install(LOOP, "LOOP", Box::new(loop_register))?;
    instructions.install(LOOPI, "LOOPI", Box::new(loop_immediate))?;

    csrs.register(
        csr::FG0,
        "FG0",
        Box::new(|state: &mut State<M>| state.flag_groups[0].bits() as u64),
        Box::new(|state, value| state.flag_groups[0] = Flags::from_bits(value as u8)),
    )?;
    csrs.register(
        csr::FG1,
        "FG1",
        Box::new(|state: &mut State<M>| state.flag_groups[1].bits() as u64),
        Box::new(|state, value| state.flag_groups[1] = Flags::from_bits(value as u8)),
    )?;
    csrs.register(
        csr::FLAGS,
        "FLAGS",
        Box::new(|state: &mut State<M>| {
            (state.flag_groups[0].bits() | state.flag_groups[1].bits() << 4) as u64
        }),
        Box::new(|state, value| {
            state.flag_groups[0] = Flags::from_bits(value as u8 & 0xF);
            state.flag_groups[1] = Flags::from_bits((value >> 4) as u8);
        }),
    )?;
    const MOD_NAMES: [&str; 8] = [
        "MOD0", "MOD1", "MOD2", "MOD3", "MOD4", "MOD5", "MOD6", "MOD7",
    ];
    for (index, name) in MOD_NAMES.iter().enumerate() {
        csrs.register(
            csr::MOD0 + index as u16,
            name,
            Box::new(move |state: &mut State<M>| state.wsrs[wsr::MOD].word(index) as u64),
            Box::new(move |state, value| state.wsrs[wsr::MOD].set_word(index, value as u32)),
        )?;
    }
    // Prefetching has no observable effect in simulation.
    csrs.register(
        csr::RND_PREFETCH,
        "RND_PREFETCH",
        Box::new(|_state| 0),
        Box::new(|_state, _value| ()),
    )?;
    // The word-wide RND/URND CSRs always draw from the entropy source; the fixed pattern only
    // overrides the wide WSR reads.
    csrs.register(
        csr::RND,
        "RND",
        Box::new(|state: &mut State<M>| state.entropy.next_u64()),
        Box::new(|_state, _value| ()),
    )?;
    csrs.register(
        csr::URND,
        "URND",
        Box::new(|state: &mut State<M>| state.entropy.next_u64()),
        Box::new(|_state, _value| ()),
    )?;
    Ok(())
}

/// Common R-type field layout of the `BN.*` instructions.
struct RType {
    f3: u32,
    wrd: usize,
    wrs1: usize,
    wrs2: usize,
    shift_bits: u32,
    shift_right: bool,
    flag_group: usize,
}

fn r_type(opcode: u64) -> RType {
    RType {
        f3: bits(opcode, 12, 3),
        wrd: bits(opcode, 7, 5) as usize,
        wrs1: bits(opcode, 15, 5) as usize,
        wrs2: bits(opcode, 20, 5) as usize,
        // the shift amount has byte resolution
        shift_bits: bits(opcode, 25, 5) * 8,
        shift_right: bits(opcode, 30, 1) != 0,
        flag_group: bits(opcode, 31, 1) as usize,
    }
}

/// S-type field layout of the wide load/store and indirect-move instructions.
struct SType {
    f3: u32,
    grs1: u8,
    grd: u8,
    offset: u32,
    increment_rs1: bool,
    increment_rd: bool,
}

fn s_type(opcode: u64) -> SType {
    SType {
        grd: bits(opcode, 20, 5) as u8,
        grs1: bits(opcode, 15, 5) as u8,
        f3: bits(opcode, 12, 3),
        increment_rs1: bits(opcode, 8, 1) != 0,
        increment_rd: bits(opcode, 7, 1) != 0,
        // offset in 32-byte words
        offset: ((bits(opcode, 25, 7) << 3) | bits(opcode, 9, 3)) * 4,
    }
}

fn shifted_rs2<M>(state: &State<M>, fields: &RType) -> Wide {
    let rs2 = state.wdrs[fields.wrs2];
    if fields.shift_bits == 0 {
        rs2
    } else if fields.shift_right {
        rs2.shr(fields.shift_bits)
    } else {
        rs2.shl(fields.shift_bits)
    }
}

/// `BN.ADDI` / `BN.SUBI`: wide add/subtract of a 10-bit immediate.
fn immediate_add_sub<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let immediate = Wide::from_u64(bits(opcode, 20, 10) as u64);
    let add = !fields.shift_right; // bit 30 selects subtraction
    let rs = state.wdrs[fields.wrs1];
    let (result, carry) = if add {
        rs.overflowing_add(immediate)
    } else {
        rs.overflowing_sub(immediate)
    };
    state.flag_groups[fields.flag_group] = flags_for(result, carry);
    state.wdrs[fields.wrd] = result;
    Ok(())
}

/// `BN.ADD`/`BN.SUB` and their carry, borrow, and modular variants, with a shifted rs2.
fn add_sub<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let rs1 = state.wdrs[fields.wrs1];
    let rs2 = shifted_rs2(state, &fields);
    // In the modular encoding, bit 30 selects subtraction instead of a shift direction.
    let add = (fields.f3 == 0b101 && !fields.shift_right) || fields.f3 & 1 == 0;
    let modular = fields.f3 >> 1 == 0b10;
    let with_carry = fields.f3 >> 1 == 0b01;

    if modular {
        let modulus = state.wsrs[wsr::MOD];
        let (value, overflow) = if add {
            rs1.overflowing_add(rs2)
        } else {
            rs1.overflowing_sub(rs2)
        };
        // One conditional correction, as in hardware; flags are untouched.
        state.wdrs[fields.wrd] = if add {
            if overflow || value >= modulus {
                value.wrapping_sub(modulus)
            } else {
                value
            }
        } else if overflow {
            value.wrapping_add(modulus)
        } else {
            value
        };
        return Ok(());
    }

    let carry_in = with_carry && state.flag_groups[fields.flag_group].carry;
    let carry_in = Wide::from_u64(carry_in as u64);
    let (value, first, second);
    if add {
        let (sum, carry) = rs1.overflowing_add(rs2);
        first = carry;
        (value, second) = sum.overflowing_add(carry_in);
    } else {
        let (difference, borrow) = rs1.overflowing_sub(rs2);
        first = borrow;
        (value, second) = difference.overflowing_sub(carry_in);
    }
    state.wdrs[fields.wrd] = value;
    state.flag_groups[fields.flag_group] = flags_for(value, first || second);
    Ok(())
}

/// `BN.CMP` / `BN.CMPB`: flag-only subtraction. The shift fields are not honored.
fn compare<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let rs1 = state.wdrs[fields.wrs1];
    let rs2 = state.wdrs[fields.wrs2];
    let borrow_in = fields.f3 == 0b011 && state.flag_groups[fields.flag_group].carry;
    let (value, first) = rs1.overflowing_sub(rs2);
    let (value, second) = value.overflowing_sub(Wide::from_u64(borrow_in as u64));
    state.flag_groups[fields.flag_group] = flags_for(value, first || second);
    Ok(())
}

fn bitwise<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let rs1 = state.wdrs[fields.wrs1];
    let rs2 = shifted_rs2(state, &fields);
    let result = match fields.f3 {
        0b010 => rs1 & rs2,
        0b100 => rs1 | rs2,
        0b101 => !rs2,
        0b110 => rs1 ^ rs2,
        _ => return Err(Fault::IllegalInstruction),
    };
    state.wdrs[fields.wrd] = result;
    state.flag_groups[fields.flag_group] = flags_for(result, false);
    Ok(())
}

/// `BN.SEL`: pick rs1 or rs2 by a flag of the selected group.
fn select<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let flag_index = bits(opcode, 25, 2);
    let source = if state.flag_groups[fields.flag_group].select(flag_index) {
        fields.wrs1
    } else {
        fields.wrs2
    };
    state.wdrs[fields.wrd] = state.wdrs[source];
    Ok(())
}

fn move_register<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    state.wdrs[fields.wrd] = state.wdrs[fields.wrs1];
    Ok(())
}

/// `BN.MULQACC`: accumulate a shifted 64x64 quarter-word product into ACC.
fn mul_accumulate<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let zero_accumulator = bits(opcode, 12, 1) != 0;
    let shift = bits(opcode, 13, 2) * 64;
    let rs1_quarter = bits(opcode, 25, 2) as usize;
    let rs2_quarter = bits(opcode, 27, 2) as usize;
    let product = state.wdrs[fields.wrs1].quarter(rs1_quarter) as u128
        * state.wdrs[fields.wrs2].quarter(rs2_quarter) as u128;
    let shifted = Wide::from_u128(product).shl(shift);
    state.wsrs[wsr::ACC] = if zero_accumulator {
        shifted
    } else {
        shifted.wrapping_add(state.wsrs[wsr::ACC])
    };
    Ok(())
}

/// `BN.MULQACC.WO` / `BN.MULQACC.SO`: accumulate and write back the whole result, or one 128-bit
/// half of it with the half-word flag rules.
fn mul_accumulate_writeback<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let zero_accumulator = bits(opcode, 12, 1) != 0;
    let shift = bits(opcode, 13, 2) * 64;
    let rs1_quarter = bits(opcode, 25, 2) as usize;
    let rs2_quarter = bits(opcode, 27, 2) as usize;
    let upper_half = bits(opcode, 29, 1) != 0;
    let full_writeback = bits(opcode, 30, 1) == 0;

    if zero_accumulator {
        state.wsrs[wsr::ACC] = Wide::ZERO;
    }

    let product = state.wdrs[fields.wrs1].quarter(rs1_quarter) as u128
        * state.wdrs[fields.wrs2].quarter(rs2_quarter) as u128;
    let shifted = Wide::from_u128(product).shl(shift);
    let (result, carry) = shifted.overflowing_add(state.wsrs[wsr::ACC]);

    if full_writeback {
        state.wsrs[wsr::ACC] = result;
        state.wdrs[fields.wrd] = result;
        state.flag_groups[fields.flag_group] = flags_for(result, carry);
    } else {
        let limbs = result.limbs();
        let low = Wide::from_limbs([limbs[0], limbs[1], 0, 0]);
        let old = state.wdrs[fields.wrd].limbs();
        state.wdrs[fields.wrd] = if upper_half {
            Wide::from_limbs([old[0], old[1], limbs[0], limbs[1]])
        } else {
            Wide::from_limbs([limbs[0], limbs[1], old[2], old[3]])
        };
        // The upper half of the accumulated value stays in ACC; the add's carry out is dropped.
        state.wsrs[wsr::ACC] = Wide::from_limbs([limbs[2], limbs[3], 0, 0]);
        let old_flags = state.flag_groups[fields.flag_group];
        state.flag_groups[fields.flag_group] = half_writeback_flags(old_flags, low, upper_half);
    }
    Ok(())
}

/// Flag update of `BN.MULQACC.SO`: each half-word write back refreshes the flags its half owns
/// and keeps the other half's bits from the previous value.
fn half_writeback_flags(old: Flags, low: Wide, upper_half: bool) -> Flags {
    if upper_half {
        Flags {
            carry: old.carry,
            msb: low.bit(127),
            lsb: old.lsb,
            zero: old.zero && low.is_zero(),
        }
    } else {
        Flags {
            carry: old.carry,
            msb: old.msb,
            lsb: low.bit(0),
            zero: low.is_zero(),
        }
    }
}

/// `BN.RSHI`: right-shift the 512-bit concatenation `rs1:rs2` into rd.
fn right_shift_concat<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = r_type(opcode);
    let amount = (bits(opcode, 25, 7) << 1) | bits(opcode, 14, 1);
    let rs1 = state.wdrs[fields.wrs1];
    let rs2 = state.wdrs[fields.wrs2];
    state.wdrs[fields.wrd] = if amount == 0 {
        rs2
    } else {
        rs2.shr(amount) | rs1.shl(256 - amount)
    };
    Ok(())
}

/// `BN.MOVR`: move between wide registers indexed through GPRs, with optional increment.
fn move_indirect<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = s_type(opcode);
    let increment_rs = bits(opcode, 9, 1) != 0;
    let source_index = state.read_gpr(fields.grs1)?;
    let dest_index = state.read_gpr(fields.grd)?;

    if (increment_rs && fields.increment_rd) || dest_index > 31 || source_index > 31 {
        return Err(Fault::IllegalInstruction);
    }
    if fields.increment_rd {
        state.write_gpr(fields.grd, dest_index + 1)?;
    } else if increment_rs {
        state.write_gpr(fields.grs1, source_index + 1)?;
    }
    state.wdrs[dest_index as usize] = state.wdrs[source_index as usize];
    Ok(())
}

/// `BN.LID` / `BN.SID`: wide load/store with the WDR index taken from a GPR.
fn load_store<M: WideMemory>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let fields = s_type(opcode);
    let load = fields.f3 == 0b100;
    let base = state.read_gpr(fields.grs1)?;
    let index = state.read_gpr(fields.grd)?;
    let address = base.wrapping_add(fields.offset);

    if (fields.increment_rs1 && fields.increment_rd) || index > 31 {
        return Err(Fault::IllegalInstruction);
    }
    if fields.increment_rd {
        state.write_gpr(fields.grd, index + 1)?;
    }
    if fields.increment_rs1 {
        state.write_gpr(fields.grs1, base.wrapping_add(32))?;
    }

    if load {
        state.wdrs[index as usize] = state.memory.read_wide(address)?;
    } else {
        state.memory.write_wide(address, state.wdrs[index as usize])?;
    }
    Ok(())
}

/// `BN.WSRR` / `BN.WSRW`: move between a WDR and a wide special-purpose register.
fn wsr_access<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let write = bits(opcode, 31, 1) != 0;
    let wsr = bits(opcode, 20, 8) as usize;
    let wrd = bits(opcode, 7, 5) as usize;
    let wrs = bits(opcode, 15, 5) as usize;
    if wsr >= wsr::COUNT {
        error!(wsr = wsr; "wide special-purpose register index out of range");
        return Err(Fault::IllegalInstruction);
    }
    if write {
        // writes to read-only WSRs are dropped
        if !wsr_read_only(wsr) {
            state.wsrs[wsr] = state.wdrs[wrs];
        }
    } else if wsr == wsr::RND || wsr == wsr::URND {
        state.wdrs[wrd] = state.random_wide();
    } else {
        state.wdrs[wrd] = state.wsrs[wsr];
    }
    Ok(())
}

fn ecall<M>(state: &mut State<M>, _opcode: u64) -> Result<(), Fault> {
    debug!("ECALL, finishing execution");
    state.finished = true;
    Ok(())
}

/// `LOOP`: iteration count from a GPR, body size from the immediate.
fn loop_register<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let grs = bits(opcode, 15, 5) as u8;
    let body_size = bits(opcode, 20, 12) + 1;
    let iterations = state.read_gpr(grs)?;
    push_loop(state, body_size, iterations)
}

/// `LOOPI`: both the iteration count and the body size from immediates.
fn loop_immediate<M>(state: &mut State<M>, opcode: u64) -> Result<(), Fault> {
    let iterations = (bits(opcode, 15, 5) << 5) | bits(opcode, 7, 5);
    let body_size = bits(opcode, 20, 12) + 1;
    push_loop(state, body_size, iterations)
}

fn push_loop<M>(state: &mut State<M>, body_size: u32, iterations: u32) -> Result<(), Fault> {
    if iterations == 0 {
        error!("loop iteration count cannot be zero");
        return Err(Fault::LoopZeroIterations);
    }
    if state.loop_stack.len() == LOOP_STACK_DEPTH {
        error!("loop stack depth exceeded");
        return Err(Fault::LoopStackOverflow);
    }
    // A loop may not sit on the last instruction of any enclosing loop body.
    if state
        .loop_stack
        .iter()
        .any(|context| context.end_pc == state.pc)
    {
        error!("loop instruction as the last instruction of a loop body");
        return Err(Fault::LoopAtBodyEnd);
    }
    let context = LoopContext {
        // instructions are 4 bytes each
        start_pc: state.pc.wrapping_add(4),
        end_pc: state.pc.wrapping_add(body_size * 4),
        iterations,
    };
    debug!(
        start_pc = context.start_pc,
        end_pc = context.end_pc,
        iterations = iterations;
        "entering hardware loop"
    );
    state.loop_stack.push(context);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct TestMemory(BTreeMap<u32, Wide>);

    impl WideMemory for TestMemory {
        fn read_wide(&mut self, address: u32) -> Result<Wide, Fault> {
            Ok(*self.0.get(&address).unwrap_or(&Wide::ZERO))
        }

        fn write_wide(&mut self, address: u32, value: Wide) -> Result<(), Fault> {
            self.0.insert(address, value);
            Ok(())
        }
    }

    const TEST_PATTERN: Wide = Wide::from_limbs([0x1111, 0x2222, 0x3333, 0x4444]);

    fn accelerator() -> Accelerator<TestMemory> {
        Accelerator::new(
            TestMemory::default(),
            Box::new(FixedPattern::new(TEST_PATTERN)),
        )
    }

    fn r_op(
        opcode7: u32,
        f3: u32,
        wrd: u32,
        wrs1: u32,
        wrs2: u32,
        shift_bytes: u32,
        shift_right: bool,
        flag_group: u32,
    ) -> u32 {
        (flag_group << 31)
            | ((shift_right as u32) << 30)
            | (shift_bytes << 25)
            | (wrs2 << 20)
            | (wrs1 << 15)
            | (f3 << 12)
            | (wrd << 7)
            | opcode7
    }

    fn bn_add(wrd: u32, wrs1: u32, wrs2: u32) -> u32 {
        r_op(0b0101011, 0b000, wrd, wrs1, wrs2, 0, false, 0)
    }

    fn loopi(iterations: u32, body_size: u32) -> u32 {
        ((body_size - 1) << 20)
            | ((iterations >> 5) << 15)
            | (0b001 << 12)
            | ((iterations & 0x1F) << 7)
            | 0b1111011
    }

    #[test]
    fn test_add_sets_carry_without_zero() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::MAX);
        core.set_wide_register(1, Wide::from_u64(1));
        assert_eq!(Ok(StepOutcome::Executed), core.step(bn_add(2, 0, 1)));
        assert_eq!(Wide::ZERO, core.wide_register(2));
        // The 257-bit result is non-zero, so only carry is set.
        assert_eq!(
            Flags {
                carry: true,
                msb: false,
                lsb: false,
                zero: false
            },
            core.flags(0)
        );
    }

    #[test]
    fn test_add_immediate_and_flags() {
        let mut core = accelerator();
        core.set_wide_register(3, Wide::from_u64(0x7FFF_FFFF_FFFF_FFFF));
        // BN.ADDI w4, w3, 1
        let opcode = (1 << 20) | (3 << 15) | (0b100 << 12) | (4 << 7) | 0b0101011;
        core.step(opcode).unwrap();
        assert_eq!(Wide::from_u64(0x8000_0000_0000_0000), core.wide_register(4));
        assert!(!core.flags(0).carry);
        assert!(!core.flags(0).msb);
        assert!(!core.flags(0).lsb);
        // BN.SUBI w4, w4, 1 borrows nothing and sets LSB
        let opcode = (1 << 30) | (1 << 20) | (4 << 15) | (0b100 << 12) | (4 << 7) | 0b0101011;
        core.step(opcode).unwrap();
        assert_eq!(Wide::from_u64(0x7FFF_FFFF_FFFF_FFFF), core.wide_register(4));
        assert!(core.flags(0).lsb);
    }

    #[test]
    fn test_shifted_operand() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::ZERO);
        core.set_wide_register(1, Wide::from_u64(0xFF));
        // BN.ADD w2, w0, w1 << 8 bytes
        core.step(r_op(0b0101011, 0b000, 2, 0, 1, 8, false, 0)).unwrap();
        assert_eq!(Wide::from_limbs([0, 0xFF, 0, 0]), core.wide_register(2));
        // BN.ADD w2, w0, w1 >> 1 byte
        core.step(r_op(0b0101011, 0b000, 2, 0, 1, 1, true, 0)).unwrap();
        assert_eq!(Wide::ZERO, core.wide_register(2));
        assert!(core.flags(0).zero);
    }

    #[test]
    fn test_add_with_carry_chains() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::MAX);
        core.set_wide_register(1, Wide::from_u64(1));
        core.set_wide_register(2, Wide::ZERO);
        core.step(bn_add(3, 0, 1)).unwrap(); // sets carry
        // BN.ADDC w4, w2, w2 consumes the carry
        core.step(r_op(0b0101011, 0b010, 4, 2, 2, 0, false, 0)).unwrap();
        assert_eq!(Wide::from_u64(1), core.wide_register(4));
        assert!(!core.flags(0).carry);
    }

    #[test]
    fn test_flag_groups_are_independent() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::MAX);
        core.set_wide_register(1, Wide::from_u64(1));
        core.step(r_op(0b0101011, 0b000, 2, 0, 1, 0, false, 1)).unwrap();
        assert!(core.flags(1).carry);
        assert!(!core.flags(0).carry);
    }

    #[test]
    fn test_modular_add_and_sub() {
        let mut core = accelerator();
        core.set_wide_special_register(wsr::MOD, Wide::from_u64(7));
        core.set_wide_register(0, Wide::from_u64(5));
        core.set_wide_register(1, Wide::from_u64(4));
        // BN.ADDM w2, w0, w1 = (5 + 4) mod 7
        core.step(r_op(0b0101011, 0b101, 2, 0, 1, 0, false, 0)).unwrap();
        assert_eq!(Wide::from_u64(2), core.wide_register(2));
        // BN.SUBM w3, w1, w0 = (4 - 5) mod 7
        core.step(r_op(0b0101011, 0b101, 3, 1, 0, 0, true, 0)).unwrap();
        assert_eq!(Wide::from_u64(6), core.wide_register(3));
        // Flags stay at reset.
        assert_eq!(Flags::default(), core.flags(0));
    }

    #[test]
    fn test_compare_sets_borrow_flags() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_u64(1));
        core.set_wide_register(1, Wide::from_u64(2));
        // BN.CMP w0, w1
        core.step(r_op(0b0001011, 0b001, 0, 0, 1, 0, false, 0)).unwrap();
        let flags = core.flags(0);
        assert!(flags.carry);
        assert!(flags.msb);
        assert!(flags.lsb);
        assert!(!flags.zero);
        // BN.CMPB w1, w1 subtracts the borrow and underflows again
        core.step(r_op(0b0001011, 0b011, 0, 1, 1, 0, false, 0)).unwrap();
        assert!(core.flags(0).carry);
    }

    #[test]
    fn test_bitwise_and_select() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_u64(0b1100));
        core.set_wide_register(1, Wide::from_u64(0b1010));
        // BN.XOR w2, w0, w1
        core.step(r_op(0b1111011, 0b110, 2, 0, 1, 0, false, 0)).unwrap();
        assert_eq!(Wide::from_u64(0b0110), core.wide_register(2));
        // BN.SEL w3, w0, w1, FG0.Z picks w1 while zero is clear
        core.step(r_op(0b0001011, 0b000, 3, 0, 1, 0b11, false, 0)).unwrap();
        assert_eq!(core.wide_register(1), core.wide_register(3));
    }

    #[test]
    fn test_mulqacc_accumulates() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_u64(3));
        core.set_wide_register(1, Wide::from_u64(4));
        // BN.MULQACC w0.0, w1.0, 0
        let opcode = (1 << 20) | (0 << 15) | (0 << 7) | 0b0111011;
        core.step(opcode).unwrap();
        core.step(opcode).unwrap();
        assert_eq!(Wide::from_u64(24), core.wide_special_register(wsr::ACC));
        // Zeroing variant restarts the accumulation
        core.step(opcode | (1 << 12)).unwrap();
        assert_eq!(Wide::from_u64(12), core.wide_special_register(wsr::ACC));
    }

    #[test]
    fn test_mulqacc_shifted_quarter_words() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_limbs([0, 5, 0, 0]));
        core.set_wide_register(1, Wide::from_u64(3));
        // BN.MULQACC.Z w0.1, w1.0, 64: product 15 shifted one quarter-word up
        let opcode = (1 << 25) | (0b01 << 13) | (1 << 12) | (1 << 20) | 0b0111011;
        core.step(opcode).unwrap();
        assert_eq!(
            Wide::from_limbs([0, 15, 0, 0]),
            core.wide_special_register(wsr::ACC)
        );
    }

    #[test]
    fn test_mulqacc_half_writeback() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_u64(2));
        core.set_wide_register(1, Wide::from_u64(3));
        core.set_wide_register(2, Wide::from_limbs([0xAAAA, 0xBBBB, 0xCCCC, 0xDDDD]));
        // BN.MULQACC.SO.Z w2.U, w0.0, w1.0, 0: 6 lands in the upper half of w2
        let opcode =
            (1 << 30) | (1 << 29) | (1 << 12) | (1 << 20) | (0 << 15) | (2 << 7) | 0b0111011;
        core.step(opcode).unwrap();
        assert_eq!(
            Wide::from_limbs([0xAAAA, 0xBBBB, 6, 0]),
            core.wide_register(2)
        );
        assert_eq!(Wide::ZERO, core.wide_special_register(wsr::ACC));
        // Upper-half writeback owns the MSB flag; 6 has bit 127 clear.
        assert!(!core.flags(0).msb);
    }

    #[test]
    fn test_rshi_concatenates() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::from_u64(1)); // rs1, upper word
        core.set_wide_register(1, Wide::ZERO); // rs2, lower word
        // BN.RSHI w2, w0, w1 >> 1
        let opcode = (1 << 14) | (0b11 << 12) | (1 << 20) | (0 << 15) | (2 << 7) | 0b1111011;
        core.step(opcode).unwrap();
        assert_eq!(Wide::from_u64(1).shl(255), core.wide_register(2));
    }

    #[test]
    fn test_mov_and_movr() {
        let mut core = accelerator();
        core.set_wide_register(7, TEST_PATTERN);
        // BN.MOV w9, w7
        core.step(r_op(0b0001011, 0b110, 9, 7, 0, 0, false, 0)).unwrap();
        assert_eq!(TEST_PATTERN, core.wide_register(9));
        // BN.MOVR x2++, x3 with x2 = 9 (source index), x3 = 11 (dest index)
        core.write_gpr(2, 9).unwrap();
        core.write_gpr(3, 11).unwrap();
        let opcode = (1 << 31) | (3 << 20) | (2 << 15) | (0b110 << 12) | (1 << 9) | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(TEST_PATTERN, core.wide_register(11));
        assert_eq!(10, core.gpr(2));
    }

    #[test]
    fn test_movr_rejects_double_increment() {
        let mut core = accelerator();
        core.write_gpr(2, 0).unwrap();
        core.write_gpr(3, 1).unwrap();
        let opcode =
            (1 << 31) | (3 << 20) | (2 << 15) | (0b110 << 12) | (1 << 9) | (1 << 7) | 0b0001011;
        assert_eq!(Err(Fault::IllegalInstruction), core.step(opcode));
        assert_eq!(CoreError::IllegalInstruction, core.last_error());
    }

    #[test]
    fn test_lid_sid_with_increment() {
        let mut core = accelerator();
        core.memory_mut().0.insert(64, TEST_PATTERN);
        core.write_gpr(2, 32).unwrap(); // base
        core.write_gpr(3, 5).unwrap(); // wide register index
        // BN.LID x3, 32(x2++): offset field 8 words of 4 bytes
        let opcode = (1 << 25) | (3 << 20) | (2 << 15) | (0b100 << 12) | (1 << 8) | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(TEST_PATTERN, core.wide_register(5));
        assert_eq!(64, core.gpr(2));
        // BN.SID x4, 0(x2) stores w6 at the incremented base
        core.set_wide_register(6, Wide::from_u64(0x5A5A));
        core.write_gpr(4, 6).unwrap();
        let opcode = (4 << 20) | (2 << 15) | (0b101 << 12) | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(Ok(Wide::from_u64(0x5A5A)), core.memory_mut().read_wide(64));
    }

    #[test]
    fn test_lid_rejects_bad_index() {
        let mut core = accelerator();
        core.write_gpr(2, 0).unwrap();
        core.write_gpr(3, 32).unwrap(); // not a valid WDR index
        let opcode = (3 << 20) | (2 << 15) | (0b100 << 12) | 0b0001011;
        assert_eq!(Err(Fault::IllegalInstruction), core.step(opcode));
    }

    #[test]
    fn test_wsrr_serves_fixed_random() {
        let mut core = accelerator();
        let fixed = Wide::from_limbs([0xDEAD, 0xBEEF, 0xF00D, 0xCAFE]);
        core.set_fixed_random(Some(fixed));
        // BN.WSRR w4, RND
        let opcode = ((wsr::RND as u32) << 20) | (0b111 << 12) | (4 << 7) | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(fixed, core.wide_register(4));
        // Without the override the entropy source is used.
        core.set_fixed_random(None);
        core.step(opcode).unwrap();
        assert_eq!(TEST_PATTERN, core.wide_register(4));
    }

    #[test]
    fn test_wsrw_to_read_only_is_dropped() {
        let mut core = accelerator();
        core.set_key_share(0, Wide::from_u64(0x11), Wide::from_u64(0x22));
        core.set_wide_register(3, Wide::MAX);
        // BN.WSRW KEY_SHARE_0_LOW, w3
        let opcode = (1u32 << 31)
            | ((wsr::KEY_SHARE_0_LOW as u32) << 20)
            | (3 << 15)
            | (0b111 << 12)
            | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(
            Wide::from_u64(0x11),
            core.wide_special_register(wsr::KEY_SHARE_0_LOW)
        );
        // BN.WSRW MOD, w3 is writable
        let opcode =
            (1u32 << 31) | ((wsr::MOD as u32) << 20) | (3 << 15) | (0b111 << 12) | 0b0001011;
        core.step(opcode).unwrap();
        assert_eq!(Wide::MAX, core.wide_special_register(wsr::MOD));
    }

    #[test]
    fn test_wsr_index_out_of_range() {
        let mut core = accelerator();
        let opcode = (8u32 << 20) | (0b111 << 12) | (4 << 7) | 0b0001011;
        assert_eq!(Err(Fault::IllegalInstruction), core.step(opcode));
    }

    #[test]
    fn test_loopi_repeats_body() {
        let mut core = accelerator();
        core.set_wide_register(0, Wide::ZERO);
        // LOOPI 3, 1 { BN.ADDI w0, w0, 1 }
        let body = (1 << 20) | (0 << 15) | (0b100 << 12) | (0 << 7) | 0b0101011;
        core.step(loopi(3, 1)).unwrap();
        assert_eq!(4, core.pc());
        core.step(body).unwrap();
        assert_eq!(4, core.pc()); // looped back
        core.step(body).unwrap();
        assert_eq!(4, core.pc());
        core.step(body).unwrap();
        assert_eq!(8, core.pc()); // loop finished
        assert_eq!(Wide::from_u64(3), core.wide_register(0));
    }

    #[test]
    fn test_loop_zero_iterations_faults() {
        let mut core = accelerator();
        core.write_gpr(2, 0).unwrap();
        // LOOP x2, 1
        let opcode = (0 << 20) | (2 << 15) | (0b000 << 12) | 0b1111011;
        assert_eq!(Err(Fault::LoopZeroIterations), core.step(opcode));
        assert_eq!(CoreError::Loop, core.last_error());
    }

    #[test]
    fn test_loop_stack_depth_limit() {
        let mut core = accelerator();
        for _ in 0..8 {
            core.step(loopi(2, 1000)).unwrap();
        }
        assert_eq!(Err(Fault::LoopStackOverflow), core.step(loopi(2, 1000)));
        assert_eq!(CoreError::Loop, core.last_error());
    }

    #[test]
    fn test_loop_at_end_of_enclosing_body_faults() {
        let mut core = accelerator();
        // Outer loop body of one instruction ends at PC 4; a loop instruction there is illegal.
        core.step(loopi(2, 1)).unwrap();
        assert_eq!(4, core.pc());
        assert_eq!(Err(Fault::LoopAtBodyEnd), core.step(loopi(2, 1)));
    }

    #[test]
    fn test_call_stack_bounds() {
        let mut core = accelerator();
        for value in 0..8 {
            core.write_gpr(1, value).unwrap();
        }
        assert_eq!(Err(Fault::CallStackOverflow), core.write_gpr(1, 8));
        assert_eq!(CoreError::CallStack, core.last_error());
        for _ in 0..8 {
            core.read_gpr(1).unwrap();
        }
        assert_eq!(Err(Fault::CallStackUnderflow), core.read_gpr(1));
    }

    #[test]
    fn test_ecall_finishes() {
        let mut core = accelerator();
        assert_eq!(Ok(StepOutcome::Finished), core.step(0x0000_0073));
    }

    #[test]
    fn test_base_isa_opcode_is_unhandled() {
        let mut core = accelerator();
        // addi x0, x0, 0
        assert_eq!(Ok(StepOutcome::Unhandled), core.step(0x0000_0013));
        assert_eq!(4, core.pc());
    }

    #[test]
    fn test_flags_and_mod_csr_windows() {
        let mut core = accelerator();
        core.write_csr(csr::FG0, 0b0011);
        core.write_csr(csr::FG1, 0b1000);
        assert_eq!(0b1000_0011, core.read_csr(csr::FLAGS));
        core.write_csr(csr::FLAGS, 0xA5);
        assert_eq!(0x5, core.read_csr(csr::FG0));
        assert_eq!(0xA, core.read_csr(csr::FG1));

        core.write_csr(csr::MOD0 + 2, 0xDEAD_BEEF);
        assert_eq!(
            Wide::from_limbs([0, 0xDEAD_BEEF, 0, 0]),
            core.wide_special_register(wsr::MOD)
        );
        assert_eq!(0xDEAD_BEEF, core.read_csr(csr::MOD0 + 2));
    }

    #[test]
    fn test_rnd_csr_draws_from_entropy() {
        let mut core = accelerator();
        // The fixed override applies to the wide reads only, never the CSR.
        core.set_fixed_random(Some(Wide::ZERO));
        assert_eq!(TEST_PATTERN.limbs()[0], core.read_csr(csr::RND));
        assert_eq!(TEST_PATTERN.limbs()[1], core.read_csr(csr::URND));
        assert_eq!(0, core.read_csr(csr::RND_PREFETCH));
    }

    #[test]
    fn test_reset_preserves_key_shares() {
        let mut core = accelerator();
        core.set_key_share(1, Wide::from_u64(0x77), Wide::from_u64(0x88));
        core.set_wide_register(0, Wide::MAX);
        core.set_wide_special_register(wsr::ACC, Wide::MAX);
        core.write_csr(csr::FG0, 0xF);
        core.set_pc(0x40);
        core.reset();
        assert_eq!(0, core.pc());
        assert_eq!(Wide::ZERO, core.wide_register(0));
        assert_eq!(Wide::ZERO, core.wide_special_register(wsr::ACC));
        assert_eq!(Flags::default(), core.flags(0));
        assert_eq!(
            Wide::from_u64(0x77),
            core.wide_special_register(wsr::KEY_SHARE_1_LOW)
        );
    }

    #[test]
    fn test_exception_cause_classification() {
        assert_eq!(
            Some(CoreError::BadInstructionAddress),
            CoreError::from_exception_cause(0x1)
        );
        assert_eq!(
            Some(CoreError::IllegalInstruction),
            CoreError::from_exception_cause(0x2)
        );
        assert_eq!(
            Some(CoreError::BadDataAddress),
            CoreError::from_exception_cause(0x5)
        );
        // ECALLs and breakpoints are not errors.
        assert_eq!(None, CoreError::from_exception_cause(0x3));
        assert_eq!(None, CoreError::from_exception_cause(0xB));
    }
}

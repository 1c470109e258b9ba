//! x86core — software x86/x86-64 CPU execution core.
//!
//! A complete interpreter core for booting real firmware and kernels:
//!
//! - **Real Mode** (16-bit), **Protected Mode** (16/32-bit), and **Long
//!   Mode** (64-bit and compatibility) with mode transitions driven by
//!   CR0/EFER and the CS descriptor.
//! - A **decode cache**, **translation blocks** with exit-IP chaining, and
//!   a **hot-pattern** tier that replaces recognized instruction sequences
//!   with compiled routines — three dispatch tiers over one interpreter.
//! - A **paged linear memory** subsystem: A20 and mode masking, 2-level /
//!   PAE / 4-level page walks with single-entry page caches, and
//!   executed-page tracking for self-modifying-code protection.
//!
//! # Architecture
//!
//! The crate is layered: `memory/` (physical stream, translator, paged
//! view), `isa/` (instruction handlers and the instruction list), `exec/`
//! (decode cache, blocks, patterns, the executor), with `cpu`, `registers`,
//! `flags`, `interrupts`, and `services` underneath. [`Vm`] ties the pieces
//! together for hosts that do not need to compose them manually.
//!
//! # Example
//!
//! ```
//! use x86core::Vm;
//!
//! let mut vm = Vm::new(1024 * 1024);
//! // Real-mode code at 0x7C00: MOV AX, 0x1234; HLT.
//! vm.load_binary(0x7C00, &[0xB8, 0x34, 0x12, 0xF4]);
//! vm.cpu.regs.load_segment_real(x86core::registers::SegReg::Cs, 0);
//! vm.cpu.regs.rip = 0x7C00;
//! let exit = vm.run(0);
//! assert_eq!(exit, x86core::ExitReason::Halted);
//! assert_eq!(vm.cpu.regs.gpr[0] & 0xFFFF, 0x1234);
//! ```

pub mod cpu;
pub mod error;
pub mod exec;
pub mod flags;
pub mod interrupts;
pub mod isa;
pub mod memory;
pub mod registers;
pub mod services;

pub use cpu::{Cpu, CpuMode};
pub use error::{Result, VmError};
pub use exec::{ExecConfig, ExecStats, ExitReason, Executor};
pub use flags::OperandSize;
pub use interrupts::InterruptController;
pub use isa::{Instruction, InstructionSet, Runtime, Status};
pub use memory::{ByteStream, PagedMemory, Translator};
pub use registers::{RegisterFile, SegReg};
pub use services::{Screen, TickHandler, TickRegistry};

use services::NullScreen;

/// High-level engine combining every core component.
///
/// The individual pieces ([`Cpu`], [`PagedMemory`], [`Executor`],
/// [`InstructionSet`], [`InterruptController`]) remain public for hosts
/// that wire them up differently.
pub struct Vm {
    pub cpu: Cpu,
    pub mem: PagedMemory,
    pub interrupts: InterruptController,
    pub ticks: TickRegistry,
    pub set: InstructionSet,
    pub exec: Executor,
    screen: Box<dyn Screen>,
}

impl Vm {
    /// New machine with `ram_size` bytes of RAM (and an equal-sized
    /// overflow region) and the standard instruction set.
    pub fn new(ram_size: usize) -> Self {
        Self::with_config(ram_size, ram_size * 2, ExecConfig::default())
    }

    /// New machine with explicit memory limits and executor configuration.
    pub fn with_config(ram_size: usize, swap_max: usize, config: ExecConfig) -> Self {
        Vm {
            cpu: Cpu::new(),
            mem: PagedMemory::new(ram_size, swap_max),
            interrupts: InterruptController::new(),
            ticks: TickRegistry::new(),
            set: InstructionSet::standard(),
            exec: Executor::new(config),
            screen: Box::new(NullScreen),
        }
    }

    /// Install a screen back-end flushed at suspension points.
    pub fn set_screen(&mut self, screen: Box<dyn Screen>) {
        self.screen = screen;
    }

    /// Load raw bytes at a guest physical address.
    pub fn load_binary(&mut self, addr: usize, data: &[u8]) {
        self.mem.stream_mut().load_at(addr, data);
    }

    /// Run until an exit condition (`max_instructions` of 0 = unlimited).
    pub fn run(&mut self, max_instructions: u64) -> ExitReason {
        let mut rt = Runtime {
            cpu: &mut self.cpu,
            mem: &mut self.mem,
            interrupts: &mut self.interrupts,
        };
        self.exec.run(
            &mut rt,
            &self.set,
            &mut self.ticks,
            self.screen.as_mut(),
            max_instructions,
        )
    }

    /// Execute one dispatch (a single instruction, a block chain, or a
    /// pattern).
    pub fn step(&mut self) -> Result<Status> {
        let mut rt = Runtime {
            cpu: &mut self.cpu,
            mem: &mut self.mem,
            interrupts: &mut self.interrupts,
        };
        self.exec
            .step(&mut rt, &self.set, &mut self.ticks, self.screen.as_mut())
    }

    /// Ask the run loop to stop at the next instruction boundary.
    pub fn request_stop(&mut self) {
        self.exec.request_stop();
    }

    /// Instructions retired since construction.
    pub fn instruction_count(&self) -> u64 {
        self.exec.instruction_count
    }

    /// Executor statistics.
    pub fn stats(&self) -> ExecStats {
        self.exec.stats()
    }

    /// Flush the decode/block/pattern caches and the translation caches.
    pub fn invalidate_caches(&mut self) {
        self.exec.invalidate_caches();
        self.mem.invalidate_translation();
    }

    /// Flush caches only if `[start, start+len)` overlaps an executed page.
    pub fn invalidate_caches_if_overlap(&mut self, start: u64, len: u64) {
        self.exec.invalidate_caches_if_overlap(&self.mem, start, len);
    }
}

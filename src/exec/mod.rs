//! The instruction executor: tiered dispatch, block chaining, fault
//! routing, hotspot tracking, and the cache invalidation surface.
//!
//! Dispatch order for an IP is fixed: hot patterns first, then an installed
//! translation block, then hotspot accounting (which may build and run a
//! new block), then the single-step interpreter. An active REP iteration
//! forces single-stepping so the last-instruction bookkeeping stays exact.
//!
//! Suspension points — the tick registry, pending-interrupt delivery, and
//! the screen flush — run between single instructions and between chained
//! blocks; the chain loop stops when one of them moves IP and is depth-
//! bounded so control always returns to the outer loop.

pub mod block;
pub mod decode;
pub mod pattern;

use std::collections::HashMap;

use log::{debug, error, trace};

use crate::error::{Result, VmError};
use crate::exec::block::{build_block, BlockArena};
use crate::exec::decode::DecodeCache;
use crate::exec::pattern::PatternRegistry;
use crate::isa::{InstructionSet, Runtime, Status};
use crate::memory::PagedMemory;
use crate::registers::SegReg;
use crate::services::{Screen, TickRegistry};

/// Executor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ExecConfig {
    /// Hits at an IP before a translation block is built (1 = build on the
    /// second touch).
    pub hotspot_threshold: u32,
    /// Occurrences at an IP before pattern signatures are probed.
    pub pattern_probe_threshold: u32,
    /// Block transitions the chain loop may take before yielding.
    pub max_chain_depth: u32,
    /// Instruction cap for one translation block.
    pub max_block_insts: usize,
    /// Consecutive all-zero opcode bytes tolerated before aborting.
    pub zero_run_limit: u32,
    /// Master switch for the hot-pattern tier.
    pub enable_patterns: bool,
    /// Master switch for the translation-block tier.
    pub enable_blocks: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            hotspot_threshold: 1,
            pattern_probe_threshold: 10,
            max_chain_depth: 16,
            max_block_insts: 32,
            zero_run_limit: 255,
            enable_patterns: true,
            enable_blocks: true,
        }
    }
}

/// Why a `run` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// HLT executed.
    Halted,
    /// Unrecoverable fault or emulator error.
    Exception(VmError),
    /// The instruction budget was spent.
    InstructionLimit,
    /// INT3 executed.
    Breakpoint,
    /// `request_stop` was called.
    StopRequested,
}

/// Executor statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStats {
    pub decode_cache_size: usize,
    pub block_count: usize,
    pub block_insts: usize,
    pub chain_edges: usize,
    pub pattern_hits: u64,
    pub pattern_misses: u64,
}

/// The execution core.
pub struct Executor {
    config: ExecConfig,
    decode_cache: DecodeCache,
    blocks: BlockArena,
    patterns: PatternRegistry,
    hit_counts: HashMap<u64, u32>,
    chain_edges: usize,
    zero_run: u32,
    stop_requested: bool,
    /// IP of the most recently dispatched instruction or pattern.
    pub last_ip: u64,
    /// Instructions retired (patterns count as one).
    pub instruction_count: u64,
}

impl Executor {
    pub fn new(config: ExecConfig) -> Self {
        Executor {
            config,
            decode_cache: DecodeCache::new(),
            blocks: BlockArena::new(),
            patterns: PatternRegistry::new(config.pattern_probe_threshold),
            hit_counts: HashMap::new(),
            chain_edges: 0,
            zero_run: 0,
            stop_requested: false,
            last_ip: 0,
            instruction_count: 0,
        }
    }

    /// Ask the outer loop to stop at the next instruction boundary.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Current statistics.
    pub fn stats(&self) -> ExecStats {
        ExecStats {
            decode_cache_size: self.decode_cache.len(),
            block_count: self.blocks.len(),
            block_insts: self.blocks.total_insts(),
            chain_edges: self.chain_edges,
            pattern_hits: self.patterns.hits,
            pattern_misses: self.patterns.misses,
        }
    }

    // ── Invalidation surface ──

    /// Drop the decode cache, hotspot counters, translation blocks, and
    /// pattern caches.
    pub fn invalidate_caches(&mut self) {
        debug!("invalidating decode/block/pattern caches");
        self.decode_cache.clear();
        self.blocks.clear();
        self.patterns.clear();
        self.hit_counts.clear();
        self.zero_run = 0;
    }

    /// Conditional invalidation: only when `[start, start+len)` overlaps a
    /// page that has been executed.
    pub fn invalidate_caches_if_overlap(&mut self, mem: &PagedMemory, start: u64, len: u64) {
        if mem.overlaps_executed(start, len) {
            self.invalidate_caches();
            mem.invalidate_translation();
        }
    }

    fn poll_invalidation(&mut self, rt: &mut Runtime<'_>) {
        if rt.cpu.take_invalidation_request() {
            self.invalidate_caches();
            rt.mem.invalidate_translation();
        }
        if rt.mem.take_smc_pending() {
            debug!("write hit an executed page; flushing caches");
            self.invalidate_caches();
        }
    }

    // ── Outer loop ──

    /// Run until an exit condition, invoking the suspension-point services
    /// between instructions.
    pub fn run(
        &mut self,
        rt: &mut Runtime<'_>,
        set: &InstructionSet,
        ticks: &mut TickRegistry,
        screen: &mut dyn Screen,
        max_instructions: u64,
    ) -> ExitReason {
        loop {
            if self.stop_requested {
                self.stop_requested = false;
                return ExitReason::StopRequested;
            }
            if max_instructions > 0 && self.instruction_count >= max_instructions {
                return ExitReason::InstructionLimit;
            }

            ticks.tick(rt);
            if let Err(e) = rt
                .interrupts
                .deliver_pending_interrupts(rt.cpu, rt.mem)
            {
                self.log_terminal(rt, &e);
                return ExitReason::Exception(e);
            }
            screen.flush_if_needed();

            match self.step(rt, set, ticks, screen) {
                Ok(Status::Success) | Ok(Status::Continue) => {}
                Ok(Status::Halt) => return ExitReason::Halted,
                Ok(Status::Break) => return ExitReason::Breakpoint,
                Err(e) => {
                    self.log_terminal(rt, &e);
                    return ExitReason::Exception(e);
                }
            }
        }
    }

    // ── One dispatch ──

    /// Dispatch at the current IP through the fastest available tier.
    pub fn step(
        &mut self,
        rt: &mut Runtime<'_>,
        set: &InstructionSet,
        ticks: &mut TickRegistry,
        screen: &mut dyn Screen,
    ) -> Result<Status> {
        rt.cpu.sync_compatibility_mode_with_cs();
        self.poll_invalidation(rt);
        rt.mem.sync_context(rt.cpu);

        let ip = rt.mem.translator().mask_linear(rt.cpu.linear_ip());
        rt.mem.note_executed_page(ip >> 12);

        let outcome = self.dispatch(rt, set, ticks, screen, ip);
        self.poll_invalidation(rt);

        match outcome {
            Ok(s) => Ok(s),
            Err(e) => self.handle_fault(rt, e),
        }
    }

    fn dispatch(
        &mut self,
        rt: &mut Runtime<'_>,
        set: &InstructionSet,
        ticks: &mut TickRegistry,
        screen: &mut dyn Screen,
        ip: u64,
    ) -> Result<Status> {
        // An in-flight REP iteration is single-stepped so the last-
        // instruction bookkeeping stays exact. A live prefix chain also
        // forces single-stepping: building or probing ahead would decode
        // under transient override state.
        if rt.cpu.iteration_active() || rt.cpu.has_live_overrides() {
            return self.single_step(rt, set, ip);
        }

        if self.config.enable_patterns {
            if let Some(status) = self.patterns.try_execute(rt, ip)? {
                self.last_ip = ip;
                self.instruction_count += 1;
                return Ok(status);
            }
        }

        if self.config.enable_blocks {
            if let Some(idx) = self.blocks.lookup(ip) {
                return self.run_block_chain(rt, set, ticks, screen, idx);
            }
            let hits = self.hit_counts.entry(ip).or_insert(0);
            *hits += 1;
            if *hits >= self.config.hotspot_threshold {
                if let Some(tb) = build_block(
                    rt.cpu,
                    rt.mem,
                    set,
                    &mut self.decode_cache,
                    ip,
                    self.config.max_block_insts,
                ) {
                    let idx = self.blocks.insert(tb);
                    return self.run_block_chain(rt, set, ticks, screen, idx);
                }
            }
        }

        self.single_step(rt, set, ip)
    }

    // ── Single-step tier ──

    fn single_step(
        &mut self,
        rt: &mut Runtime<'_>,
        set: &InstructionSet,
        ip: u64,
    ) -> Result<Status> {
        // Record the instruction's first byte before anything can fault so
        // fault delivery pushes the right IP even for decode failures.
        rt.cpu.last_exec_ip = ip;
        rt.cpu.last_exec_rip = rt.cpu.regs.rip;
        rt.cpu.last_exec_cs = rt.cpu.regs.seg[SegReg::Cs as usize].selector;
        if !rt.cpu.has_live_overrides() {
            rt.cpu.prefix_chain_start = rt.cpu.regs.rip;
        }

        let inst = self
            .decode_cache
            .get_or_decode(rt.cpu, rt.mem, set, ip)?;
        rt.cpu.last_opcode = inst.bytes[0];

        // Runaway-zero guard: fetching endless 0x00 means we are executing
        // uninitialized memory.
        if inst.opcodes().iter().all(|b| *b == 0) {
            self.zero_run += inst.len as u32;
            if self.zero_run > self.config.zero_run_limit {
                return Err(VmError::RunawayZeroRun { ip, run: self.zero_run });
            }
        } else {
            self.zero_run = 0;
        }

        let expected_next = ip + inst.len as u64;
        rt.cpu.regs.rip = rt.cpu.regs.rip.wrapping_add(inst.len as u64);

        let status = set.handler(inst.handler).process(rt, inst.opcodes())?;

        if status != Status::Continue {
            rt.cpu.clear_transient_overrides();
        }
        if rt.cpu.linear_ip() != expected_next {
            trace!(
                "control flow 0x{:X} -> 0x{:X}",
                ip,
                rt.cpu.linear_ip()
            );
        }

        self.last_ip = ip;
        self.instruction_count += 1;
        Ok(status)
    }

    // ── Block tier with chaining ──

    fn run_block_chain(
        &mut self,
        rt: &mut Runtime<'_>,
        set: &InstructionSet,
        ticks: &mut TickRegistry,
        screen: &mut dyn Screen,
        start_idx: usize,
    ) -> Result<Status> {
        let mut cur_idx = start_idx;
        let mut depth = 0u32;

        loop {
            let mut executed = 0u64;
            let mut last_entry_ip = self.last_ip;
            let mut zero_run = self.zero_run;
            let zero_limit = self.config.zero_run_limit;
            let (status, exit_ip) = {
                let tb = &self.blocks.blocks[cur_idx];
                tb.execute(rt, set, |rt, entry_ip, inst| {
                    rt.mem.note_executed_page(entry_ip >> 12);
                    rt.cpu.last_exec_ip = entry_ip;
                    rt.cpu.last_exec_rip = rt.cpu.regs.rip;
                    rt.cpu.last_exec_cs = rt.cpu.regs.seg[SegReg::Cs as usize].selector;
                    if !rt.cpu.has_live_overrides() {
                        rt.cpu.prefix_chain_start = rt.cpu.regs.rip;
                    }
                    rt.cpu.last_opcode = inst.bytes[0];
                    if inst.opcodes().iter().all(|b| *b == 0) {
                        zero_run += inst.len as u32;
                    } else {
                        zero_run = 0;
                    }
                    executed += 1;
                    last_entry_ip = entry_ip;
                })?
            };
            self.instruction_count += executed;
            self.last_ip = last_entry_ip;
            self.zero_run = zero_run;
            if zero_run > zero_limit {
                return Err(VmError::RunawayZeroRun { ip: last_entry_ip, run: zero_run });
            }

            if status != Status::Success {
                return Ok(status);
            }

            // A write into an executed page invalidates everything we are
            // standing on; leave the chain immediately.
            if rt.mem.take_smc_pending() {
                debug!("self-modifying write during block; flushing caches");
                self.invalidate_caches();
                rt.mem.invalidate_translation();
                return Ok(Status::Success);
            }
            if rt.cpu.take_invalidation_request() {
                self.invalidate_caches();
                rt.mem.invalidate_translation();
                return Ok(Status::Success);
            }

            // Patterns preempt chaining at the exit IP.
            if self.config.enable_patterns {
                if let Some(status) = self.patterns.try_execute(rt, exit_ip)? {
                    self.last_ip = exit_ip;
                    self.instruction_count += 1;
                    return Ok(status);
                }
            }

            // Suspension point between blocks.
            ticks.tick(rt);
            rt.interrupts
                .deliver_pending_interrupts(rt.cpu, rt.mem)?;
            screen.flush_if_needed();
            if rt.cpu.linear_ip() != exit_ip {
                // An interrupt or tick redirected control.
                return Ok(Status::Success);
            }

            depth += 1;
            if depth >= self.config.max_chain_depth {
                return Ok(Status::Success);
            }

            // No self-loop chains.
            if exit_ip == self.blocks.blocks[cur_idx].start_ip {
                return Ok(Status::Success);
            }

            let next_idx = match self.blocks.lookup(exit_ip) {
                Some(i) => i,
                None => {
                    match build_block(
                        rt.cpu,
                        rt.mem,
                        set,
                        &mut self.decode_cache,
                        exit_ip,
                        self.config.max_block_insts,
                    ) {
                        Some(tb) => self.blocks.insert(tb),
                        None => return Ok(Status::Success),
                    }
                }
            };
            if next_idx == cur_idx {
                return Ok(Status::Success);
            }

            // Record the chain edge.
            let chain = &mut self.blocks.blocks[cur_idx].chain;
            if chain.insert(exit_ip, next_idx).is_none() {
                self.chain_edges += 1;
            }

            rt.mem.note_executed_page(exit_ip >> 12);
            cur_idx = next_idx;
        }
    }

    // ── Fault routing ──

    /// Route an error raised during dispatch: architectural faults go to
    /// the interrupt-delivery handler; everything else is terminal.
    fn handle_fault(&mut self, rt: &mut Runtime<'_>, err: VmError) -> Result<Status> {
        let Some(vector) = err.vector() else {
            return Err(err);
        };

        if let VmError::PageFault { address, error_code } = err {
            rt.cpu.regs.cr2 = address;
            debug!(
                "#PF linear=0x{:X} error=0x{:X} cr3=0x{:X} ip=0x{:X}",
                address, error_code, rt.cpu.regs.cr3, rt.cpu.last_exec_ip
            );
        }

        rt.cpu.clear_transient_overrides();
        rt.cpu.iterating = false;

        let fault_rip = rt.cpu.last_exec_rip;
        let delivered =
            rt.interrupts
                .raise_fault(rt.cpu, rt.mem, vector, fault_rip, err.error_code());
        if delivered {
            Ok(Status::Success)
        } else {
            Err(err)
        }
    }

    /// Diagnostic dump emitted once before a run ends on a fatal error.
    fn log_terminal(&self, rt: &Runtime<'_>, err: &VmError) {
        let r = &rt.cpu.regs;
        error!("terminal failure: {}", err);
        error!(
            "  CS=0x{:04X} IP=0x{:X} last=0x{:X} opcode=0x{:02X} mode={:?}",
            r.seg[SegReg::Cs as usize].selector,
            r.rip,
            rt.cpu.last_exec_ip,
            rt.cpu.last_opcode,
            rt.cpu.mode
        );
        error!(
            "  RAX=0x{:016X} RCX=0x{:016X} RDX=0x{:016X} RBX=0x{:016X}",
            r.gpr[0], r.gpr[1], r.gpr[2], r.gpr[3]
        );
        error!(
            "  RSP=0x{:016X} RBP=0x{:016X} RSI=0x{:016X} RDI=0x{:016X}",
            r.gpr[4], r.gpr[5], r.gpr[6], r.gpr[7]
        );
        error!(
            "  CR0=0x{:X} CR2=0x{:X} CR3=0x{:X} CR4=0x{:X} RFLAGS=0x{:X}",
            r.cr0, r.cr2, r.cr3, r.cr4, r.rflags
        );
    }
}

//! End-to-end scenarios driving the full dispatch stack: string
//! operations under REP, prefix runs, pattern-vs-interpreter equivalence,
//! block chaining, self-modifying code, and the terminal guards.

use x86core::flags::{self, OperandSize};
use x86core::registers::{Gpr, SegReg, SegmentDescriptor, CR0_PE};
use x86core::{ExecConfig, ExitReason, Vm};

const RAM: usize = 2 * 1024 * 1024;

/// Flat 32-bit protected-mode machine with code loaded at `at`.
fn vm32_with(config: ExecConfig, at: usize, code: &[u8]) -> Vm {
    let mut vm = Vm::with_config(RAM, RAM, config);
    vm.cpu.regs.cr0 |= CR0_PE;
    vm.cpu.regs.seg[SegReg::Cs as usize] =
        SegmentDescriptor::from_raw(0x08, 0x00CF_9A00_0000_FFFF);
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss, SegReg::Fs, SegReg::Gs] {
        vm.cpu.regs.seg[seg as usize] =
            SegmentDescriptor::from_raw(0x10, 0x00CF_9200_0000_FFFF);
    }
    vm.cpu.regs.gpr[Gpr::Rsp as usize] = 0x1F_0000;
    vm.cpu.update_mode();
    vm.load_binary(at, code);
    vm.cpu.regs.rip = at as u64;
    vm
}

fn vm32(at: usize, code: &[u8]) -> Vm {
    vm32_with(ExecConfig::default(), at, code)
}

/// Real-mode machine with CS=DS=ES=SS=0 and code at `at`.
fn vm_real(at: usize, code: &[u8]) -> Vm {
    let mut vm = Vm::new(RAM);
    for seg in [SegReg::Cs, SegReg::Ds, SegReg::Es, SegReg::Ss] {
        vm.cpu.regs.load_segment_real(seg, 0);
    }
    vm.cpu.regs.gpr[Gpr::Rsp as usize] = 0x7000;
    vm.load_binary(at, code);
    vm.cpu.regs.rip = at as u64;
    vm
}

fn status_flags(vm: &Vm) -> u64 {
    vm.cpu.regs.rflags & flags::STATUS_MASK
}

// ── String operations ──

#[test]
fn rep_movsb_copies_and_advances() {
    // REP MOVSB; HLT
    let mut vm = vm32(0x500, &[0xF3, 0xA4, 0xF4]);
    vm.load_binary(0x1000, &[0x11, 0x22, 0x33, 0x44]);
    vm.cpu.regs.gpr[Gpr::Rsi as usize] = 0x1000;
    vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x8000;
    vm.cpu.regs.gpr[Gpr::Rcx as usize] = 4;

    assert_eq!(vm.run(0), ExitReason::Halted);

    let mut out = [0u8; 4];
    vm.mem.stream().read_bytes(0x8000, &mut out);
    assert_eq!(out, [0x11, 0x22, 0x33, 0x44]);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rcx as usize], 0);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rsi as usize], 0x1004);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rdi as usize], 0x8004);
}

#[test]
fn rep_stosd_with_operand_override_in_real_mode() {
    // Real mode: F3 66 AB = REP STOSD (0x66 promotes to 32-bit); HLT.
    let mut vm = vm_real(0x500, &[0xF3, 0x66, 0xAB, 0xF4]);
    vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x8060;
    vm.cpu.regs.gpr[Gpr::Rax as usize] = 0x1234_5678;
    vm.cpu.regs.gpr[Gpr::Rcx as usize] = 2;

    assert_eq!(vm.run(0), ExitReason::Halted);

    let mut out = [0u8; 8];
    vm.mem.stream().read_bytes(0x8060, &mut out);
    assert_eq!(out, [0x78, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rcx as usize] & 0xFFFF, 0);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rdi as usize] & 0xFFFF, 0x8068);
}

#[test]
fn repne_scasb_finds_marker() {
    // REPNE SCASB; HLT — scan for AL until found or count exhausted.
    let mut vm = vm32(0x500, &[0xF2, 0xAE, 0xF4]);
    vm.load_binary(0xB000, &[0x10, 0x20, 0x30, 0x40, 0x55, 0x60]);
    vm.cpu.regs.gpr[Gpr::Rax as usize] = 0x55;
    vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0xB000;
    vm.cpu.regs.gpr[Gpr::Rcx as usize] = 16;

    assert_eq!(vm.run(0), ExitReason::Halted);

    // Found at 0xB004: EDI one past the match, ZF set, 5 elements consumed.
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rdi as usize], 0xB005);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rcx as usize], 11);
    assert_ne!(vm.cpu.regs.rflags & flags::ZF, 0);
}

#[test]
fn rep_with_zero_count_is_a_nop() {
    let mut vm = vm32(0x500, &[0xF3, 0xA4, 0xF4]);
    vm.cpu.regs.gpr[Gpr::Rsi as usize] = 0x1000;
    vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x8000;
    vm.cpu.regs.gpr[Gpr::Rcx as usize] = 0;

    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rsi as usize], 0x1000);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rdi as usize], 0x8000);
}

// ── Prefix handling ──

#[test]
fn redundant_prefix_run_decodes_past_table_max() {
    // Ten 0x66 prefixes then NOP then HLT.
    let mut code = vec![0x66u8; 10];
    code.extend_from_slice(&[0x90, 0xF4]);
    let mut vm = vm32(0x400, &code);
    assert_eq!(vm.run(0), ExitReason::Halted);
}

#[test]
fn transient_override_scope_is_one_instruction() {
    // 66 B8 34 12: MOV AX, 0x1234 (override narrows to 16-bit);
    // B9 78 56 34 12: MOV ECX, imm32 (override must be gone);
    // HLT.
    let mut vm = vm32(
        0x400,
        &[0x66, 0xB8, 0x34, 0x12, 0xB9, 0x78, 0x56, 0x34, 0x12, 0xF4],
    );
    vm.cpu.regs.gpr[Gpr::Rax as usize] = 0xFFFF_FFFF;

    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rax as usize], 0xFFFF_1234);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rcx as usize], 0x1234_5678);
}

// ── Pattern equivalence ──

fn pattern_config() -> ExecConfig {
    ExecConfig {
        pattern_probe_threshold: 1,
        ..ExecConfig::default()
    }
}

fn no_pattern_config() -> ExecConfig {
    ExecConfig {
        enable_patterns: false,
        ..ExecConfig::default()
    }
}

/// Assert registers, status flags, RIP, and a memory window match between
/// two finished machines.
fn assert_same_state(a: &Vm, b: &Vm, mem_start: u64, mem_len: usize) {
    assert_eq!(a.cpu.regs.gpr, b.cpu.regs.gpr, "GPR mismatch");
    assert_eq!(a.cpu.regs.rip, b.cpu.regs.rip, "RIP mismatch");
    assert_eq!(
        a.cpu.regs.rflags & flags::STATUS_MASK,
        b.cpu.regs.rflags & flags::STATUS_MASK,
        "status flags mismatch"
    );
    let mut ma = vec![0u8; mem_len];
    let mut mb = vec![0u8; mem_len];
    a.mem.stream().read_bytes(mem_start, &mut ma);
    b.mem.stream().read_bytes(mem_start, &mut mb);
    assert_eq!(ma, mb, "memory mismatch");
}

const MEMSET_LOOP: [u8; 13] = [
    0x85, 0xC9, // test ecx, ecx
    0x74, 0x08, // jz done
    0x89, 0x07, // l: mov [edi], eax
    0x83, 0xC7, 0x04, // add edi, 4
    0x49, // dec ecx
    0x75, 0xF8, // jnz l
    0xF4, // done: hlt
];

#[test]
fn memset_dword_pattern_matches_interpreter() {
    for count in [0u64, 3, 4, 30, 32] {
        let mut runs = Vec::new();
        for config in [pattern_config(), no_pattern_config()] {
            let mut vm = vm32_with(config, 0x600, &MEMSET_LOOP);
            vm.cpu.regs.gpr[Gpr::Rax as usize] = 0xAABB_CCDD;
            vm.cpu.regs.gpr[Gpr::Rcx as usize] = count;
            vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x9000;
            assert_eq!(vm.run(0), ExitReason::Halted, "count={}", count);
            runs.push(vm);
        }
        let (with, without) = (&runs[0], &runs[1]);
        assert_same_state(with, without, 0x9000 - 0x10, 0x10 + 33 * 4);
        assert!(with.stats().pattern_hits > 0, "pattern never fired");
    }
}

#[test]
fn rep_movsb_pattern_matches_interpreter() {
    let payload: Vec<u8> = (0..64u8).collect();
    for count in [0u64, 1, 17, 64] {
        let mut runs = Vec::new();
        for config in [pattern_config(), no_pattern_config()] {
            let mut vm = vm32_with(config, 0x500, &[0xF3, 0xA4, 0xF4]);
            vm.load_binary(0x1000, &payload);
            vm.cpu.regs.gpr[Gpr::Rsi as usize] = 0x1000;
            vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x8000;
            vm.cpu.regs.gpr[Gpr::Rcx as usize] = count;
            assert_eq!(vm.run(0), ExitReason::Halted);
            runs.push(vm);
        }
        assert_same_state(&runs[0], &runs[1], 0x8000, 64);
    }
}

#[test]
fn overlapping_rep_movsb_falls_back_to_byte_semantics() {
    // dst = src + 1: the forward byte copy replicates the first byte.
    // The compiled pattern must skip and leave this to the interpreter.
    let mut vm = vm32_with(pattern_config(), 0x500, &[0xF3, 0xA4, 0xF4]);
    vm.load_binary(0x1000, &[0xAB, 0x01, 0x02, 0x03, 0x04]);
    vm.cpu.regs.gpr[Gpr::Rsi as usize] = 0x1000;
    vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x1001;
    vm.cpu.regs.gpr[Gpr::Rcx as usize] = 4;

    assert_eq!(vm.run(0), ExitReason::Halted);
    let mut out = [0u8; 5];
    vm.mem.stream().read_bytes(0x1000, &mut out);
    assert_eq!(out, [0xAB, 0xAB, 0xAB, 0xAB, 0xAB]);
    assert!(vm.stats().pattern_misses > 0);
}

#[test]
fn strcpy_pattern_matches_interpreter() {
    const STRCPY_LOOP: [u8; 11] = [
        0x8A, 0x06, // l: mov al, [esi]
        0x88, 0x07, // mov [edi], al
        0x46, // inc esi
        0x47, // inc edi
        0x84, 0xC0, // test al, al
        0x75, 0xF6, // jnz l
        0xF4, // hlt
    ];
    let mut runs = Vec::new();
    for config in [pattern_config(), no_pattern_config()] {
        let mut vm = vm32_with(config, 0x700, &STRCPY_LOOP);
        vm.load_binary(0x2000, b"boot sequence\0");
        vm.cpu.regs.gpr[Gpr::Rsi as usize] = 0x2000;
        vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0x3000;
        assert_eq!(vm.run(0), ExitReason::Halted);
        runs.push(vm);
    }
    assert_same_state(&runs[0], &runs[1], 0x3000, 16);
    let mut copied = [0u8; 14];
    runs[0].mem.stream().read_bytes(0x3000, &mut copied);
    assert_eq!(&copied, b"boot sequence\0");
}

#[test]
fn stos_fill_pattern_matches_interpreter() {
    // Protected 32-bit: F3 AB = REP STOSD.
    for count in [0u64, 5, 129] {
        let mut runs = Vec::new();
        for config in [pattern_config(), no_pattern_config()] {
            let mut vm = vm32_with(config, 0x500, &[0xF3, 0xAB, 0xF4]);
            vm.cpu.regs.gpr[Gpr::Rax as usize] = 0xDEAD_BEEF;
            vm.cpu.regs.gpr[Gpr::Rdi as usize] = 0xA000;
            vm.cpu.regs.gpr[Gpr::Rcx as usize] = count;
            assert_eq!(vm.run(0), ExitReason::Halted);
            runs.push(vm);
        }
        assert_same_state(&runs[0], &runs[1], 0xA000, 130 * 4);
    }
}

// ── Translation blocks ──

#[test]
fn block_execution_is_transparent() {
    // Straight-line arithmetic ending in a RET, compared against the
    // pure single-step configuration.
    let code = [
        0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0x40, // inc eax
        0x01, 0xC3, // add ebx, eax
        0x31, 0xC9, // xor ecx, ecx
        0x49, // dec ecx
        0xF4, // hlt
    ];
    let blocks_off = ExecConfig {
        enable_blocks: false,
        enable_patterns: false,
        ..ExecConfig::default()
    };
    let mut with = vm32(0x800, &code);
    let mut without = vm32_with(blocks_off, 0x800, &code);
    assert_eq!(with.run(0), ExitReason::Halted);
    assert_eq!(without.run(0), ExitReason::Halted);
    assert_same_state(&with, &without, 0x800, 0x20);
    assert!(with.stats().block_count > 0);
    assert_eq!(without.stats().block_count, 0);
}

#[test]
fn chained_blocks_keep_yielding_to_the_outer_loop() {
    // Two blocks branching into each other forever. The chain depth bound
    // must hand control back so the instruction budget can fire.
    let mut vm = vm32(
        0x400,
        &[
            0x40, 0x40, 0xEB, 0x02, // inc eax; inc eax; jmp 0x406
            0x90, 0x90, // padding (never reached)
            0x48, 0x48, 0xEB, 0xF6, // 0x406: dec; dec; jmp 0x400
        ],
    );
    assert_eq!(vm.run(500), ExitReason::InstructionLimit);
    assert!(vm.stats().chain_edges > 0);
}

// ── Self-modifying code ──

#[test]
fn write_to_executed_page_forces_redecode() {
    let mut vm = vm32(0x610, &[0x40, 0xF4]); // inc eax; hlt
    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rax as usize], 1);

    // Overwrite the INC with DEC from code on the same (executed) page.
    vm.load_binary(0x700, &[0xC6, 0x05, 0x10, 0x06, 0x00, 0x00, 0x48, 0xF4]);
    vm.cpu.regs.rip = 0x700;
    assert_eq!(vm.run(0), ExitReason::Halted);

    // Re-entering 0x610 must decode the new byte, not the cached INC.
    vm.cpu.regs.rip = 0x610;
    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(vm.cpu.regs.gpr[Gpr::Rax as usize], 0);
}

// ── Faults ──

#[test]
fn undefined_opcode_delivers_fault_ip_of_first_byte() {
    // Real mode: 0F FF is undecodable. IVT vector 6 -> handler at 0x800.
    let mut vm = vm_real(0x100, &[0x0F, 0xFF]);
    vm.load_binary(0x800, &[0xF4]); // handler: HLT
    vm.load_binary(6 * 4, &[0x00, 0x08, 0x00, 0x00]); // IVT[6] = 0000:0800

    assert_eq!(vm.run(0), ExitReason::Halted);
    // Frame pushed at SP=0x7000: FLAGS, CS, IP.
    assert_eq!(vm.mem.stream().read_u16(0x6FFA), 0x100);
}

#[test]
fn page_fault_reports_error_code_and_cr2() {
    let mut vm = vm32(0x600, &[0xA1, 0x00, 0x00, 0x40, 0x00, 0xF4]); // mov eax, [0x400000]; hlt
    // Identity-map the low 4 MiB except the page holding 0x400000.
    {
        let s = vm.mem.stream_mut();
        s.write_u32(0x10_0000, 0x10_1000 | 0b11);
        for i in 0..1024u64 {
            s.write_u32(0x10_1000 + i * 4, ((i * 0x1000) as u32) | 0b11);
        }
    }
    vm.cpu.regs.cr3 = 0x10_0000;
    vm.cpu.regs.cr0 |= x86core::registers::CR0_PG;
    vm.cpu.update_mode();

    match vm.run(0) {
        ExitReason::Exception(x86core::VmError::PageFault { address, error_code }) => {
            assert_eq!(address, 0x40_0000);
            assert_eq!(error_code, 0); // not-present read, supervisor
        }
        other => panic!("expected page fault exit, got {:?}", other),
    }
    assert_eq!(vm.cpu.regs.cr2, 0x40_0000);
}

// ── Terminal guards ──

#[test]
fn zero_opcode_run_terminates_with_diagnostic() {
    let mut vm = vm32(0x1000, &[0u8; 600]);
    match vm.run(0) {
        ExitReason::Exception(x86core::VmError::RunawayZeroRun { run, .. }) => {
            assert!(run > 255);
        }
        other => panic!("expected zero-run abort, got {:?}", other),
    }
}

#[test]
fn stop_request_wins_over_execution() {
    let mut vm = vm32(0x400, &[0xEB, 0xFE]); // jmp $
    vm.request_stop();
    assert_eq!(vm.run(0), ExitReason::StopRequested);
}

// ── Statistics ──

#[test]
fn stats_reflect_activity() {
    let mut vm = vm32(
        0x800,
        &[0xB8, 0x01, 0x00, 0x00, 0x00, 0x40, 0x40, 0xF4],
    );
    assert_eq!(vm.run(0), ExitReason::Halted);
    let stats = vm.stats();
    assert!(stats.decode_cache_size > 0);
    assert!(stats.block_count > 0);
    assert!(stats.block_insts >= 2);
    assert_eq!(vm.instruction_count(), 4);
}

// ── Interrupt interaction ──

#[test]
fn pending_interrupt_is_taken_between_instructions() {
    // Real mode loop with IF set; IVT[0x20] points at a HLT handler.
    let mut vm = vm_real(0x100, &[0xEB, 0xFE]); // jmp $
    vm.load_binary(0x900, &[0xF4]);
    vm.load_binary(0x20 * 4, &[0x00, 0x09, 0x00, 0x00]);
    vm.cpu.regs.rflags |= flags::IF;
    vm.interrupts.request_interrupt(0x20);

    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(vm.cpu.regs.rip, 0x900 + 1);
}

#[test]
fn sixteen_bit_wrap_on_word_sized_counters() {
    // DEC on a zero word register wraps and sets SF; sanity for the flag
    // helpers wired through the executor.
    let mut vm = vm_real(0x100, &[0x48, 0xF4]); // dec ax; hlt
    assert_eq!(vm.run(0), ExitReason::Halted);
    assert_eq!(
        vm.cpu.regs.read_sized(Gpr::Rax as u8, OperandSize::Word, false),
        0xFFFF
    );
    assert_ne!(vm.cpu.regs.rflags & flags::SF, 0);
}

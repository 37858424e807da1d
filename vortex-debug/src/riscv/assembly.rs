//! Hand-assembled RV32I instruction words for the injection sequences.
//!
//! Every pattern the backend injects in a hot loop is encoded here once as a
//! `const fn`, so no external toolchain is needed for the built-in
//! operations. Free-form assembly goes through [`super::asm`] instead.

/// RISC-V breakpoint instruction.
pub const EBREAK: u32 = 0b000000000001_00000_000_00000_1110011;

/// Assemble a `lw` instruction (`lw rd, offset(base)`).
pub const fn lw(offset: u32, base: u32, rd: u32) -> u32 {
    let opcode = 0b000_0011;
    let funct3 = 0b010;

    offset << 20 | base << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Assemble a `sw` instruction (`sw src, offset(base)`).
pub const fn sw(offset: u32, base: u32, src: u32) -> u32 {
    let opcode = 0b010_0011;
    let funct3 = 0b010;

    let offset_lower = offset & 0b11111;
    let offset_upper = offset >> 5;

    offset_upper << 25 | src << 20 | base << 15 | funct3 << 12 | offset_lower << 7 | opcode
}

/// Assemble an `addi` instruction (`addi rd, src, imm`).
pub const fn addi(rd: u32, src: u32, immediate: u32) -> u32 {
    let opcode = 0b001_0011;
    let funct3 = 0b000;

    immediate << 20 | src << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Assemble a `csrrw` instruction (`csrrw rd, csr, rs`).
pub const fn csrrw(rd: u32, csr: u32, rs: u32) -> u32 {
    let opcode = 0b111_0011;
    let funct3 = 0b001;

    csr << 20 | rs << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Assemble a `csrrs` instruction (`csrrs rd, csr, rs`).
pub const fn csrrs(rd: u32, csr: u32, rs: u32) -> u32 {
    let opcode = 0b111_0011;
    let funct3 = 0b010;

    csr << 20 | rs << 15 | funct3 << 12 | rd << 7 | opcode
}

/// `csrw csr, rs` pseudo-instruction.
pub const fn csrw(csr: u32, rs: u32) -> u32 {
    csrrw(0, csr, rs)
}

/// `csrr rd, csr` pseudo-instruction.
pub const fn csrr(rd: u32, csr: u32) -> u32 {
    csrrs(rd, csr, 0)
}

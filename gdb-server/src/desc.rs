//! Target description XML served through `qXfer:features:read`.

use std::fmt::Write;

use vortex_debug::riscv::GDB_EXPOSED_CSRS;

/// Builds the target description: the rv32 base register file plus the
/// Vortex CSR block, with explicit register numbers matching the `p`/`P`
/// index mapping (0-31 GPRs, 32 pc, 33.. the exposed CSRs).
pub fn target_xml() -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n\
         <!DOCTYPE target SYSTEM \"gdb-target.dtd\">\n\
         <target version=\"1.0\">\n\
         <architecture>riscv:rv32</architecture>\n\
         <feature name=\"org.gnu.gdb.riscv.cpu\">\n",
    );
    for i in 0..32 {
        writeln!(
            xml,
            "  <reg name=\"x{i}\" bitsize=\"32\" type=\"uint32\" regnum=\"{i}\"/>"
        )
        .unwrap();
    }
    xml.push_str("  <reg name=\"pc\" bitsize=\"32\" type=\"code_ptr\" regnum=\"32\"/>\n");
    xml.push_str("</feature>\n<feature name=\"org.gnu.gdb.riscv.vortex\">\n");
    for (i, name) in GDB_EXPOSED_CSRS.iter().enumerate() {
        writeln!(
            xml,
            "  <reg name=\"{name}\" bitsize=\"32\" type=\"uint32\" regnum=\"{}\"/>",
            33 + i
        )
        .unwrap();
    }
    xml.push_str("</feature>\n</target>\n");
    xml
}

/// Cuts one `qXfer` page out of `data`: `m<chunk>` when more follows,
/// `l<chunk>` for the last page.
pub fn chunk(data: &str, offset: usize, length: usize) -> String {
    let bytes = data.as_bytes();
    if offset >= bytes.len() {
        return "l".to_string();
    }
    let end = (offset + length).min(bytes.len());
    let prefix = if end < bytes.len() { 'm' } else { 'l' };
    format!("{prefix}{}", std::str::from_utf8(&bytes[offset..end]).unwrap())
}

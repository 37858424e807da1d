//! Vortex Debug Module register map.
//!
//! Pure data plus pure functions: the table of DM registers, their bus
//! addresses and bitfield layouts, and the extract/insert helpers used by
//! the field-level accessors in [`crate::backend`].

use std::fmt;

use crate::{DebugError, Result};

/// A bitfield inside a DM register, given as an inclusive `[msb:lsb]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub msb: u8,
    pub lsb: u8,
}

impl Field {
    pub const fn width(&self) -> u32 {
        (self.msb - self.lsb + 1) as u32
    }

    pub const fn mask(&self) -> u32 {
        if self.width() == 32 {
            0xFFFF_FFFF
        } else {
            ((1u32 << self.width()) - 1) << self.lsb
        }
    }
}

const fn field(name: &'static str, msb: u8, lsb: u8) -> Field {
    Field { name, msb, lsb }
}

/// Identifies one DM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DmReg {
    Platform,
    Dconfig,
    Dselect,
    Wmask,
    Wactive,
    Wstatus,
    Dctrl,
    Dpc,
    Dinject,
    Dscratch,
}

/// Static description of a DM register.
#[derive(Debug)]
pub struct RegInfo {
    pub reg: DmReg,
    pub name: &'static str,
    pub addr: u32,
    pub fields: &'static [Field],
}

static PLATFORM_FIELDS: &[Field] = &[
    field("platformid", 31, 28),
    field("numclusters", 27, 21),
    field("numcores", 20, 12),
    field("numwarps", 11, 3),
    field("numthreads", 2, 0),
];

static DCONFIG_FIELDS: &[Field] = &[
    field("ndmresetcyc", 31, 29),
    field("resethaltreqcyc", 28, 26),
    field("ebreakh", 0, 0),
];

static DSELECT_FIELDS: &[Field] = &[
    field("winsel", 31, 22),
    field("warpsel", 21, 7),
    field("threadsel", 6, 0),
];

static WMASK_FIELDS: &[Field] = &[field("mask", 31, 0)];
static WACTIVE_FIELDS: &[Field] = &[field("astatus", 31, 0)];
static WSTATUS_FIELDS: &[Field] = &[field("status", 31, 0)];

static DCTRL_FIELDS: &[Field] = &[
    field("dmactive", 31, 31),
    field("ndmreset", 30, 30),
    field("allhalted", 29, 29),
    field("anyhalted", 28, 28),
    field("allrunning", 27, 27),
    field("anyrunning", 26, 26),
    field("allunavail", 25, 25),
    field("anyunavail", 24, 24),
    field("hacause", 11, 9),
    field("injectstate", 8, 7),
    field("injectreq", 6, 6),
    field("stepstate", 5, 4),
    field("stepreq", 3, 3),
    field("resethaltreq", 2, 2),
    field("resumereq", 1, 1),
    field("haltreq", 0, 0),
];

static DPC_FIELDS: &[Field] = &[field("pc", 31, 0)];
static DINJECT_FIELDS: &[Field] = &[field("instr", 31, 0)];
static DSCRATCH_FIELDS: &[Field] = &[field("data", 31, 0)];

/// The full register table, indexable by [`DmReg`] discriminant order.
pub static DM_REGS: &[RegInfo] = &[
    RegInfo {
        reg: DmReg::Platform,
        name: "platform",
        addr: 0x00,
        fields: PLATFORM_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dconfig,
        name: "dconfig",
        addr: 0x01,
        fields: DCONFIG_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dselect,
        name: "dselect",
        addr: 0x02,
        fields: DSELECT_FIELDS,
    },
    RegInfo {
        reg: DmReg::Wmask,
        name: "wmask",
        addr: 0x03,
        fields: WMASK_FIELDS,
    },
    RegInfo {
        reg: DmReg::Wactive,
        name: "wactive",
        addr: 0x04,
        fields: WACTIVE_FIELDS,
    },
    RegInfo {
        reg: DmReg::Wstatus,
        name: "wstatus",
        addr: 0x05,
        fields: WSTATUS_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dctrl,
        name: "dctrl",
        addr: 0x06,
        fields: DCTRL_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dpc,
        name: "dpc",
        addr: 0x07,
        fields: DPC_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dinject,
        name: "dinject",
        addr: 0x08,
        fields: DINJECT_FIELDS,
    },
    RegInfo {
        reg: DmReg::Dscratch,
        name: "dscratch",
        addr: 0x09,
        fields: DSCRATCH_FIELDS,
    },
];

impl DmReg {
    /// Static description of this register.
    pub fn info(self) -> &'static RegInfo {
        &DM_REGS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Bus address of this register.
    pub fn addr(self) -> u32 {
        self.info().addr
    }

    /// Reverse lookup by register name.
    pub fn from_name(name: &str) -> Option<DmReg> {
        DM_REGS.iter().find(|r| r.name == name).map(|r| r.reg)
    }
}

impl fmt::Display for DmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Looks up a field by name. Unknown names are an [`DebugError::InvalidArg`].
pub fn field_info(reg: DmReg, name: &str) -> Result<&'static Field> {
    reg.info()
        .fields
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| {
            DebugError::InvalidArg(format!(
                "no field '{}' in DM register '{}'",
                name,
                reg.name()
            ))
        })
}

/// Extracts `reg.name` out of a raw register value.
pub fn extract(reg: DmReg, name: &str, value: u32) -> Result<u32> {
    let f = field_info(reg, name)?;
    Ok((value & f.mask()) >> f.lsb)
}

/// Returns `value` with the field `reg.name` replaced by `field_value`.
/// Bits outside the field are preserved.
pub fn insert(reg: DmReg, name: &str, value: u32, field_value: u32) -> Result<u32> {
    let f = field_info(reg, name)?;
    let mask = f.mask();
    Ok((value & !mask) | ((field_value << f.lsb) & mask))
}

/// Why a warp halted, as reported in `DCTRL.hacause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltCause {
    None,
    Ebreak,
    HaltRequested,
    StepRequested,
    ResetHaltRequested,
    Unknown,
}

impl From<u32> for HaltCause {
    fn from(raw: u32) -> Self {
        match raw {
            0 => HaltCause::None,
            1 => HaltCause::Ebreak,
            2 => HaltCause::HaltRequested,
            3 => HaltCause::StepRequested,
            4 => HaltCause::ResetHaltRequested,
            _ => HaltCause::Unknown,
        }
    }
}

impl fmt::Display for HaltCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltCause::None => "None",
            HaltCause::Ebreak => "Ebreak",
            HaltCause::HaltRequested => "Halt Requested",
            HaltCause::StepRequested => "Step Requested",
            HaltCause::ResetHaltRequested => "Reset Halt Requested",
            HaltCause::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_table_is_addressed_in_order() {
        for (i, info) in DM_REGS.iter().enumerate() {
            assert_eq!(info.reg as usize, i);
            assert_eq!(info.addr, i as u32);
            assert_eq!(DmReg::from_name(info.name), Some(info.reg));
        }
        assert_eq!(DmReg::from_name("nosuchreg"), None);
    }

    #[test]
    fn field_masks_match_widths() {
        for info in DM_REGS {
            for f in info.fields {
                assert!(f.msb >= f.lsb, "{}.{}", info.name, f.name);
                assert_eq!(
                    f.mask().count_ones(),
                    f.width(),
                    "{}.{}",
                    info.name,
                    f.name
                );
                if f.width() == 32 {
                    assert_eq!(f.mask(), 0xFFFF_FFFF);
                } else {
                    assert_eq!(f.mask(), ((1u32 << f.width()) - 1) << f.lsb);
                }
            }
        }
    }

    #[test]
    fn insert_extract_roundtrip() {
        for info in DM_REGS {
            for f in info.fields {
                for base in [0u32, 0xFFFF_FFFF, 0xA5A5_5A5A] {
                    // Highest value representable in the field.
                    let max = (f.mask() >> f.lsb) as u64;
                    for v in [0u64, 1, max / 2, max] {
                        let v = v as u32;
                        let word = insert(info.reg, f.name, base, v).unwrap();
                        assert_eq!(extract(info.reg, f.name, word).unwrap(), v);
                        // Bits outside the field are untouched.
                        assert_eq!(word & !f.mask(), base & !f.mask());
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_field_is_invalid_arg() {
        let err = field_info(DmReg::Dctrl, "bogus").unwrap_err();
        assert_eq!(err.code(), -4);
    }

    #[test]
    fn hacause_decodes() {
        assert_eq!(HaltCause::from(1), HaltCause::Ebreak);
        assert_eq!(HaltCause::from(4), HaltCause::ResetHaltRequested);
        assert_eq!(HaltCause::from(7), HaltCause::Unknown);
        assert_eq!(HaltCause::from(2).to_string(), "Halt Requested");
    }
}

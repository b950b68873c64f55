//! Name to Modbus address map for the T7 registers this crate touches.

use crate::error::GalvoError;

/// Data type of a T7 Modbus register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Float32,
    Uint16,
}

impl RegisterType {
    /// Number of 16-bit Modbus words the value occupies
    pub fn words(self) -> u16 {
        match self {
            RegisterType::Float32 => 2,
            RegisterType::Uint16 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub kind: RegisterType,
}

impl Register {
    /// First word address after this register
    pub fn end(&self) -> u16 {
        self.address + self.kind.words()
    }
}

struct RegisterFamily {
    prefix: &'static str,
    base: u16,
    stride: u16,
    count: u16,
    kind: RegisterType,
}

// Longest prefixes first so "TDAC" is not read as "DAC"
#[rustfmt::skip]
const FAMILIES: &[RegisterFamily] = &[
    RegisterFamily { prefix: "TDAC", base: 30000, stride: 2, count: 22, kind: RegisterType::Float32 },
    RegisterFamily { prefix: "AIN", base: 0, stride: 2, count: 14, kind: RegisterType::Float32 },
    RegisterFamily { prefix: "DAC", base: 1000, stride: 2, count: 2, kind: RegisterType::Float32 },
    RegisterFamily { prefix: "FIO", base: 2000, stride: 1, count: 8, kind: RegisterType::Uint16 },
    RegisterFamily { prefix: "EIO", base: 2008, stride: 1, count: 8, kind: RegisterType::Uint16 },
    RegisterFamily { prefix: "CIO", base: 2016, stride: 1, count: 4, kind: RegisterType::Uint16 },
    RegisterFamily { prefix: "MIO", base: 2020, stride: 1, count: 3, kind: RegisterType::Uint16 },
];

/// Resolve a register name such as `"TDAC1"` or `"FIO2"`
pub fn lookup(name: &str) -> Result<Register, GalvoError> {
    let upper = name.trim().to_ascii_uppercase();
    for family in FAMILIES {
        let Some(index) = upper.strip_prefix(family.prefix) else {
            continue;
        };
        let index: u16 = index
            .parse()
            .map_err(|_| GalvoError::UnknownChannel(name.to_string()))?;
        if index >= family.count {
            return Err(GalvoError::UnknownChannel(name.to_string()));
        }
        return Ok(Register {
            address: family.base + index * family.stride,
            kind: family.kind,
        });
    }
    Err(GalvoError::UnknownChannel(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_addresses() {
        assert_eq!(lookup("AIN0").unwrap().address, 0);
        assert_eq!(lookup("AIN1").unwrap().address, 2);
        assert_eq!(lookup("DAC0").unwrap().address, 1000);
        assert_eq!(lookup("TDAC0").unwrap().address, 30000);
        assert_eq!(lookup("TDAC1").unwrap().address, 30002);
        assert_eq!(lookup("FIO2").unwrap().address, 2002);
        assert_eq!(lookup("EIO0").unwrap().address, 2008);
    }

    #[test]
    fn test_register_types() {
        assert_eq!(lookup("TDAC0").unwrap().kind, RegisterType::Float32);
        assert_eq!(lookup("FIO2").unwrap().kind, RegisterType::Uint16);
    }

    #[test]
    fn test_names_are_case_insensitive() {
        assert_eq!(lookup("tdac1").unwrap(), lookup("TDAC1").unwrap());
    }

    #[test]
    fn test_tick_dac_pair_is_contiguous() {
        let x = lookup("TDAC0").unwrap();
        let y = lookup("TDAC1").unwrap();
        assert_eq!(x.end(), y.address);
    }

    #[test]
    fn test_unknown_names() {
        assert!(matches!(lookup("FIO9"), Err(GalvoError::UnknownChannel(_))));
        assert!(matches!(lookup("DACX"), Err(GalvoError::UnknownChannel(_))));
        assert!(matches!(lookup("LED"), Err(GalvoError::UnknownChannel(_))));
    }
}

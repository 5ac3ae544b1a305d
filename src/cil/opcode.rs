//! Opcode families and their byte encodings
//!
//! The instruction set is represented with one enum variant per instruction *family* (see
//! [`crate::cil::Instruction`]); the families that exist in several typed flavours (binary
//! arithmetic, conversions, indirect loads and stores, element access, comparisons) carry one of
//! the small enums below. Keeping the byte tables next to the enums makes the encode and decode
//! matches mirror images of each other.
//!
//! Opcode values are the ones assigned in ECMA-335 §III. Instructions from the extended table
//! are encoded as `0xFE xx`.

/// Escape prefix for the two-byte opcode table
pub const FAT_PREFIX: u8 = 0xFE;

/// Binary numeric and bitwise operations
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

impl BinaryOp {
    pub(crate) fn byte(self) -> u8 {
        match self {
            BinaryOp::Add => 0x58,
            BinaryOp::Sub => 0x59,
            BinaryOp::Mul => 0x5A,
            BinaryOp::Div => 0x5B,
            BinaryOp::DivUn => 0x5C,
            BinaryOp::Rem => 0x5D,
            BinaryOp::RemUn => 0x5E,
            BinaryOp::And => 0x5F,
            BinaryOp::Or => 0x60,
            BinaryOp::Xor => 0x61,
            BinaryOp::Shl => 0x62,
            BinaryOp::Shr => 0x63,
            BinaryOp::ShrUn => 0x64,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<BinaryOp> {
        Some(match byte {
            0x58 => BinaryOp::Add,
            0x59 => BinaryOp::Sub,
            0x5A => BinaryOp::Mul,
            0x5B => BinaryOp::Div,
            0x5C => BinaryOp::DivUn,
            0x5D => BinaryOp::Rem,
            0x5E => BinaryOp::RemUn,
            0x5F => BinaryOp::And,
            0x60 => BinaryOp::Or,
            0x61 => BinaryOp::Xor,
            0x62 => BinaryOp::Shl,
            0x63 => BinaryOp::Shr,
            0x64 => BinaryOp::ShrUn,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::DivUn => "div.un",
            BinaryOp::Rem => "rem",
            BinaryOp::RemUn => "rem.un",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::ShrUn => "shr.un",
        }
    }

    /// Shifts take a shift count rather than a second operand of the same category
    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn)
    }

    /// Bitwise operations only accept integer categories
    pub fn is_integer_only(self) -> bool {
        matches!(
            self,
            BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::ShrUn
                | BinaryOp::DivUn
                | BinaryOp::RemUn
        )
    }
}

/// Unary numeric and bitwise operations
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub(crate) fn byte(self) -> u8 {
        match self {
            UnaryOp::Neg => 0x65,
            UnaryOp::Not => 0x66,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
        }
    }
}

/// Comparison performed by a two-operand conditional branch (`beq` .. `blt.un`)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Comparison {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    NeUn,
    GeUn,
    GtUn,
    LeUn,
    LtUn,
}

impl Comparison {
    /// Opcode of the short (1-byte displacement) branch form; the standard form is at a fixed
    /// distance of `0x0D` above it.
    pub(crate) fn short_byte(self) -> u8 {
        match self {
            Comparison::Eq => 0x2E,
            Comparison::Ge => 0x2F,
            Comparison::Gt => 0x30,
            Comparison::Le => 0x31,
            Comparison::Lt => 0x32,
            Comparison::NeUn => 0x33,
            Comparison::GeUn => 0x34,
            Comparison::GtUn => 0x35,
            Comparison::LeUn => 0x36,
            Comparison::LtUn => 0x37,
        }
    }

    pub(crate) fn long_byte(self) -> u8 {
        self.short_byte() + 0x0D
    }

    pub(crate) fn from_short_byte(byte: u8) -> Option<Comparison> {
        Some(match byte {
            0x2E => Comparison::Eq,
            0x2F => Comparison::Ge,
            0x30 => Comparison::Gt,
            0x31 => Comparison::Le,
            0x32 => Comparison::Lt,
            0x33 => Comparison::NeUn,
            0x34 => Comparison::GeUn,
            0x35 => Comparison::GtUn,
            0x36 => Comparison::LeUn,
            0x37 => Comparison::LtUn,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Comparison::Eq => "beq",
            Comparison::Ge => "bge",
            Comparison::Gt => "bgt",
            Comparison::Le => "ble",
            Comparison::Lt => "blt",
            Comparison::NeUn => "bne.un",
            Comparison::GeUn => "bge.un",
            Comparison::GtUn => "bgt.un",
            Comparison::LeUn => "ble.un",
            Comparison::LtUn => "blt.un",
        }
    }
}

/// Comparison performed by the value-producing compare instructions (extended table)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Eq,
    Gt,
    GtUn,
    Lt,
    LtUn,
}

impl CompareOp {
    pub(crate) fn fat_byte(self) -> u8 {
        match self {
            CompareOp::Eq => 0x01,
            CompareOp::Gt => 0x02,
            CompareOp::GtUn => 0x03,
            CompareOp::Lt => 0x04,
            CompareOp::LtUn => 0x05,
        }
    }

    pub(crate) fn from_fat_byte(byte: u8) -> Option<CompareOp> {
        Some(match byte {
            0x01 => CompareOp::Eq,
            0x02 => CompareOp::Gt,
            0x03 => CompareOp::GtUn,
            0x04 => CompareOp::Lt,
            0x05 => CompareOp::LtUn,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            CompareOp::Eq => "ceq",
            CompareOp::Gt => "cgt",
            CompareOp::GtUn => "cgt.un",
            CompareOp::Lt => "clt",
            CompareOp::LtUn => "clt.un",
        }
    }
}

/// Target representation of a numeric conversion
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConvKind {
    I1,
    I2,
    I4,
    I8,
    R4,
    R8,
    U1,
    U2,
    U4,
    U8,
    I,
    U,
    /// `conv.r.un`: unsigned integer to floating point
    RUn,
}

impl ConvKind {
    pub(crate) fn byte(self) -> u8 {
        match self {
            ConvKind::I1 => 0x67,
            ConvKind::I2 => 0x68,
            ConvKind::I4 => 0x69,
            ConvKind::I8 => 0x6A,
            ConvKind::R4 => 0x6B,
            ConvKind::R8 => 0x6C,
            ConvKind::U4 => 0x6D,
            ConvKind::U8 => 0x6E,
            ConvKind::RUn => 0x76,
            ConvKind::U2 => 0xD1,
            ConvKind::U1 => 0xD2,
            ConvKind::I => 0xD3,
            ConvKind::U => 0xE0,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<ConvKind> {
        Some(match byte {
            0x67 => ConvKind::I1,
            0x68 => ConvKind::I2,
            0x69 => ConvKind::I4,
            0x6A => ConvKind::I8,
            0x6B => ConvKind::R4,
            0x6C => ConvKind::R8,
            0x6D => ConvKind::U4,
            0x6E => ConvKind::U8,
            0x76 => ConvKind::RUn,
            0xD1 => ConvKind::U2,
            0xD2 => ConvKind::U1,
            0xD3 => ConvKind::I,
            0xE0 => ConvKind::U,
            _ => return None,
        })
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ConvKind::I1 => "i1",
            ConvKind::I2 => "i2",
            ConvKind::I4 => "i4",
            ConvKind::I8 => "i8",
            ConvKind::R4 => "r4",
            ConvKind::R8 => "r8",
            ConvKind::U1 => "u1",
            ConvKind::U2 => "u2",
            ConvKind::U4 => "u4",
            ConvKind::U8 => "u8",
            ConvKind::I => "i",
            ConvKind::U => "u",
            ConvKind::RUn => "r.un",
        }
    }
}

/// Element flavour of a typed load (`ldind.*` and the primitive `ldelem.*` forms)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LoadKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    I,
    R4,
    R8,
    Ref,
}

impl LoadKind {
    pub(crate) fn ldind_byte(self) -> u8 {
        match self {
            LoadKind::I1 => 0x46,
            LoadKind::U1 => 0x47,
            LoadKind::I2 => 0x48,
            LoadKind::U2 => 0x49,
            LoadKind::I4 => 0x4A,
            LoadKind::U4 => 0x4B,
            LoadKind::I8 => 0x4C,
            LoadKind::I => 0x4D,
            LoadKind::R4 => 0x4E,
            LoadKind::R8 => 0x4F,
            LoadKind::Ref => 0x50,
        }
    }

    pub(crate) fn from_ldind_byte(byte: u8) -> Option<LoadKind> {
        (0x46..=0x50)
            .contains(&byte)
            .then(|| Self::ORDERED[(byte - 0x46) as usize])
    }

    pub(crate) fn ldelem_byte(self) -> u8 {
        self.ldind_byte() + 0x4A
    }

    pub(crate) fn from_ldelem_byte(byte: u8) -> Option<LoadKind> {
        (0x90..=0x9A)
            .contains(&byte)
            .then(|| Self::ORDERED[(byte - 0x90) as usize])
    }

    const ORDERED: [LoadKind; 11] = [
        LoadKind::I1,
        LoadKind::U1,
        LoadKind::I2,
        LoadKind::U2,
        LoadKind::I4,
        LoadKind::U4,
        LoadKind::I8,
        LoadKind::I,
        LoadKind::R4,
        LoadKind::R8,
        LoadKind::Ref,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            LoadKind::I1 => "i1",
            LoadKind::U1 => "u1",
            LoadKind::I2 => "i2",
            LoadKind::U2 => "u2",
            LoadKind::I4 => "i4",
            LoadKind::U4 => "u4",
            LoadKind::I8 => "i8",
            LoadKind::I => "i",
            LoadKind::R4 => "r4",
            LoadKind::R8 => "r8",
            LoadKind::Ref => "ref",
        }
    }
}

/// Element flavour of a typed store (`stind.*` and the primitive `stelem.*` forms)
///
/// Unlike loads, stores do not distinguish signedness, so this is a strict subset of
/// [`LoadKind`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StoreKind {
    I1,
    I2,
    I4,
    I8,
    I,
    R4,
    R8,
    Ref,
}

impl StoreKind {
    pub(crate) fn stind_byte(self) -> u8 {
        match self {
            StoreKind::Ref => 0x51,
            StoreKind::I1 => 0x52,
            StoreKind::I2 => 0x53,
            StoreKind::I4 => 0x54,
            StoreKind::I8 => 0x55,
            StoreKind::R4 => 0x56,
            StoreKind::R8 => 0x57,
            StoreKind::I => 0xDF,
        }
    }

    pub(crate) fn from_stind_byte(byte: u8) -> Option<StoreKind> {
        Some(match byte {
            0x51 => StoreKind::Ref,
            0x52 => StoreKind::I1,
            0x53 => StoreKind::I2,
            0x54 => StoreKind::I4,
            0x55 => StoreKind::I8,
            0x56 => StoreKind::R4,
            0x57 => StoreKind::R8,
            0xDF => StoreKind::I,
            _ => return None,
        })
    }

    pub(crate) fn stelem_byte(self) -> u8 {
        match self {
            StoreKind::I => 0x9B,
            StoreKind::I1 => 0x9C,
            StoreKind::I2 => 0x9D,
            StoreKind::I4 => 0x9E,
            StoreKind::I8 => 0x9F,
            StoreKind::R4 => 0xA0,
            StoreKind::R8 => 0xA1,
            StoreKind::Ref => 0xA2,
        }
    }

    pub(crate) fn from_stelem_byte(byte: u8) -> Option<StoreKind> {
        Some(match byte {
            0x9B => StoreKind::I,
            0x9C => StoreKind::I1,
            0x9D => StoreKind::I2,
            0x9E => StoreKind::I4,
            0x9F => StoreKind::I8,
            0xA0 => StoreKind::R4,
            0xA1 => StoreKind::R8,
            0xA2 => StoreKind::Ref,
            _ => return None,
        })
    }

    pub fn suffix(self) -> &'static str {
        match self {
            StoreKind::I1 => "i1",
            StoreKind::I2 => "i2",
            StoreKind::I4 => "i4",
            StoreKind::I8 => "i8",
            StoreKind::I => "i",
            StoreKind::R4 => "r4",
            StoreKind::R8 => "r8",
            StoreKind::Ref => "ref",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comparison_long_forms_track_short_forms() {
        for cmp in [
            Comparison::Eq,
            Comparison::Ge,
            Comparison::Gt,
            Comparison::Le,
            Comparison::Lt,
            Comparison::NeUn,
            Comparison::GeUn,
            Comparison::GtUn,
            Comparison::LeUn,
            Comparison::LtUn,
        ] {
            assert_eq!(cmp.long_byte(), cmp.short_byte() + 0x0D);
            assert_eq!(Comparison::from_short_byte(cmp.short_byte()), Some(cmp));
        }
    }

    #[test]
    fn load_kind_tables_are_mirror_images() {
        for kind in LoadKind::ORDERED {
            assert_eq!(LoadKind::from_ldind_byte(kind.ldind_byte()), Some(kind));
            assert_eq!(LoadKind::from_ldelem_byte(kind.ldelem_byte()), Some(kind));
        }
    }

    #[test]
    fn store_kind_tables_are_mirror_images() {
        for kind in [
            StoreKind::I1,
            StoreKind::I2,
            StoreKind::I4,
            StoreKind::I8,
            StoreKind::I,
            StoreKind::R4,
            StoreKind::R8,
            StoreKind::Ref,
        ] {
            assert_eq!(StoreKind::from_stind_byte(kind.stind_byte()), Some(kind));
            assert_eq!(StoreKind::from_stelem_byte(kind.stelem_byte()), Some(kind));
        }
    }
}

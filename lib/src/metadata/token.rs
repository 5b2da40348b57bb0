use std::fmt;

/// Metadata token
///
/// The top byte identifies the table and the low 24 bits hold a 1-based row index, exactly like
/// the tokens embedded in CIL instruction streams. Row `0` is the null token of a table.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Token(pub u32);

/// Tables that tokens can point into
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Table {
    TypeRef,
    TypeDef,
    MethodDef,
    MemberRef,
    StandAloneSig,
    TypeSpec,
    MethodSpec,
    UserString,
    Other(u8),
}

impl Table {
    pub fn tag(self) -> u8 {
        match self {
            Table::TypeRef => 0x01,
            Table::TypeDef => 0x02,
            Table::MethodDef => 0x06,
            Table::MemberRef => 0x0A,
            Table::StandAloneSig => 0x11,
            Table::TypeSpec => 0x1B,
            Table::MethodSpec => 0x2B,
            Table::UserString => 0x70,
            Table::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: u8) -> Table {
        match tag {
            0x01 => Table::TypeRef,
            0x02 => Table::TypeDef,
            0x06 => Table::MethodDef,
            0x0A => Table::MemberRef,
            0x11 => Table::StandAloneSig,
            0x1B => Table::TypeSpec,
            0x2B => Table::MethodSpec,
            0x70 => Table::UserString,
            other => Table::Other(other),
        }
    }
}

impl Token {
    pub const NULL: Token = Token(0);

    /// Token for the 0-based `index` into `table`
    pub fn from_index(table: Table, index: usize) -> Token {
        Token(((table.tag() as u32) << 24) | ((index as u32 + 1) & 0x00FF_FFFF))
    }

    /// Token for a 1-based `row` of the table numbered `table`
    pub fn from_parts(table: u8, row: u32) -> Token {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    pub fn table_id(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn table(self) -> Table {
        Table::from_tag((self.0 >> 24) as u8)
    }

    /// 1-based row (`0` for null tokens)
    pub fn row(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn is_null(self) -> bool {
        self.row() == 0
    }

    /// 0-based index into `table`, if the token points there and isn't null
    pub fn index_in(self, table: Table) -> Option<usize> {
        if self.table() == table && !self.is_null() {
            Some(self.row() as usize - 1)
        } else {
            None
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

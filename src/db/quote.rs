//! Identifier quoting and escaping.
//!
//! Quoting is a pure function of the identifier and the engine's quote
//! characters. Escaping strips everything that cannot appear in a bare
//! identifier before quoting, so user-supplied names can never break out.

/// Wraps identifiers in an engine's quote characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierQuoter {
    open: char,
    close: char,
}

impl IdentifierQuoter {
    /// MySQL-style backticks.
    pub const BACKTICK: Self = Self::new('`', '`');

    /// ANSI double quotes (PostgreSQL, SQLite).
    pub const ANSI: Self = Self::new('"', '"');

    pub const fn new(open: char, close: char) -> Self {
        Self { open, close }
    }

    /// Quote an identifier.
    ///
    /// An empty identifier stays empty (used for expression placeholders).
    /// `table.field` is split at the first `.` and both halves are wrapped.
    pub fn quote(&self, identifier: &str) -> String {
        if identifier.is_empty() {
            return String::new();
        }
        match identifier.split_once('.') {
            Some((table, field)) => format!("{}.{}", self.wrap(table), self.wrap(field)),
            None => self.wrap(identifier),
        }
    }

    fn wrap(&self, part: &str) -> String {
        if part.is_empty() {
            return String::new();
        }
        let mut quoted = String::with_capacity(part.len() + 2);
        quoted.push(self.open);
        quoted.push_str(part);
        quoted.push(self.close);
        quoted
    }
}

/// Keep only characters valid in a table or field reference (`[A-Za-z0-9_.]`).
pub fn strip_table_chars(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}

/// Keep only characters valid in an alias (`[A-Za-z0-9_]`).
pub fn strip_alias_chars(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// True if `name` is a non-empty bare identifier usable without escaping.
pub fn is_bare_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

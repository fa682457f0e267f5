//! The deduplicated string table.
//!
//! Every printable string except object short names lands here exactly
//! once; the assembler emits the encoded bytes after the routine region
//! and resolves each [`StringId`] to a packed address. The table is
//! append-only: ids never change once assigned.

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

use crate::fixup::StringId;

#[derive(Default)]
pub struct StringTable {
    strings: PrimaryMap<StringId, String>,
    index: FxHashMap<String, StringId>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning a stable id.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.index.get(text) {
            return id;
        }
        let id = self.strings.push(text.to_owned());
        self.index.insert(text.to_owned(), id);
        id
    }

    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringId, &str)> {
        self.strings.iter().map(|(id, s)| (id, s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates() {
        let mut t = StringTable::new();
        let a = t.intern("Hello");
        let b = t.intern("world");
        let c = t.intern("Hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a), "Hello");
    }
}

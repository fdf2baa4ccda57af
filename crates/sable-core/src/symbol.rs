//! Process-wide interned tables shared between the compiler and the VM
//!
//! The symbol table maps 64-bit ids (the hash of the spelling) back to
//! strings; symbols in bytecode and object containers are just these ids.
//! The string pool interns string literals so `putstring` payloads are
//! stable `u32` indices. Both tables are populated during compilation and
//! read-mostly afterwards; the VM still interns at runtime when converting
//! a string key into a symbol.

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::Hasher;

/// Interned-string identifier: the hash of the spelling
///
/// Ids keep 60 bits of the hash; the tagged symbol encoding claims the
/// low four bits of the word, so the id must round-trip through
/// `Value::symbol` unchanged.
pub type SymbolId = u64;

/// Mask applied to symbol hashes so ids survive the tagged encoding
pub const SYMBOL_ID_MASK: u64 = (1 << 60) - 1;

/// Hash a spelling into its symbol id
pub fn hash_symbol(name: &str) -> SymbolId {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish() & SYMBOL_ID_MASK
}

/// Map from symbol id to spelling
///
/// Insertion is idempotent; two spellings collide only if their hashes do,
/// in which case the first registration wins.
pub struct SymbolTable {
    entries: RwLock<FxHashMap<SymbolId, String>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a spelling, returning its id
    pub fn intern(&self, name: &str) -> SymbolId {
        let id = hash_symbol(name);
        {
            if self.entries.read().contains_key(&id) {
                return id;
            }
        }
        self.entries.write().entry(id).or_insert_with(|| name.to_string());
        id
    }

    /// Resolve an id back to its spelling
    pub fn get(&self, id: SymbolId) -> Option<String> {
        self.entries.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Interning pool for compiler string literals
///
/// `putstring` payloads index into this pool; the VM copies the pooled
/// bytes into a fresh heap string on execution.
pub struct StringPool {
    strings: RwLock<Vec<String>>,
    index: RwLock<FxHashMap<String, u32>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            strings: RwLock::new(Vec::new()),
            index: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a literal, returning its pool id
    pub fn intern(&self, literal: &str) -> u32 {
        if let Some(&id) = self.index.read().get(literal) {
            return id;
        }
        let mut strings = self.strings.write();
        let mut index = self.index.write();
        if let Some(&id) = index.get(literal) {
            return id;
        }
        let id = strings.len() as u32;
        strings.push(literal.to_string());
        index.insert(literal.to_string(), id);
        id
    }

    /// Look up a pooled literal
    pub fn get(&self, id: u32) -> Option<String> {
        self.strings.read().get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.strings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.read().is_empty()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Well-known symbols the compiler pre-registers
pub mod well_known {
    /// Member symbols resolved by the VM before the class-chain walk
    pub const KLASS: &str = "klass";
    pub const NAME: &str = "name";
    pub const PROTOTYPE: &str = "prototype";
    pub const PARENT_CLASS: &str = "parent_class";
    pub const LENGTH: &str = "length";
    pub const CONSTRUCTOR: &str = "constructor";
}

/// The compiler-owned tables the VM consumes after bootstrap
pub struct CompilerArtifacts {
    pub symtable: SymbolTable,
    pub stringpool: StringPool,
}

impl CompilerArtifacts {
    /// Create the tables and pre-register operator and member symbols
    pub fn new() -> Self {
        let symtable = SymbolTable::new();
        for name in [
            "+", "-", "*", "/", "%", "**", "+@", "-@", "==", "<", ">", "<=", ">=", "<<", ">>",
            "&", "|", "^", "~@",
            well_known::KLASS,
            well_known::NAME,
            well_known::PROTOTYPE,
            well_known::PARENT_CLASS,
            well_known::LENGTH,
            well_known::CONSTRUCTOR,
        ] {
            symtable.intern(name);
        }
        for name in [
            "dead", "integer", "float", "string", "numeric", "boolean", "null", "object",
            "array", "function", "cfunction", "class", "symbol", "frame", "catchtable",
            "instruction_block", "cpointer", "generator",
        ] {
            symtable.intern(name);
        }
        Self {
            symtable,
            stringpool: StringPool::new(),
        }
    }
}

impl Default for CompilerArtifacts {
    fn default() -> Self {
        Self::new()
    }
}

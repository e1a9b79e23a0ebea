//! Kernel symbol lookup
//!
//! The fault classifier only maps an instruction fetch when the target
//! looks like real code: it must lie in kernel or module text and resolve
//! to a known symbol. Symbols generated at run time (BPF programs, ftrace
//! trampolines) are flagged as dynamic and never qualify.

extern crate alloc;

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};

use crate::mm::VirtualAddress;

/// Maximum length of a formatted symbol, terminator included
pub const KSYM_SYMBOL_LEN: usize = 512;

/// Result of a symbol lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolInfo<'a> {
    pub name: &'a str,
    pub start: VirtualAddress,
    pub size: usize,
    /// Offset of the looked up address from the symbol start
    pub offset: usize,
    /// Module the symbol belongs to, `None` for the core kernel
    pub module: Option<&'a str>,
    /// Run-time generated code
    pub dynamic: bool,
}

/// Source of kernel text and symbol information
pub trait SymbolResolver {
    /// Whether `addr` is in kernel or module text
    fn is_text(&self, addr: VirtualAddress) -> bool;

    /// Symbol containing `addr`
    fn lookup(&self, addr: VirtualAddress) -> Option<SymbolInfo<'_>>;
}

#[derive(Debug, Clone)]
struct KernelSymbol {
    name: String,
    start: VirtualAddress,
    size: usize,
    module: Option<String>,
    dynamic: bool,
}

/// Text ranges and symbols of the kernel and its modules
#[derive(Debug, Clone, Default)]
pub struct KernelSymbolTable {
    text: Vec<(VirtualAddress, usize)>,
    /// Sorted by start address
    symbols: Vec<KernelSymbol>,
}

impl KernelSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `[start, start + size)` as kernel or module text
    pub fn add_text(&mut self, start: VirtualAddress, size: usize) {
        self.text.push((start, size));
    }

    pub fn add_symbol(&mut self, name: &str, start: VirtualAddress, size: usize) {
        self.insert(KernelSymbol {
            name: name.to_string(),
            start,
            size,
            module: None,
            dynamic: false,
        });
    }

    pub fn add_module_symbol(&mut self, module: &str, name: &str, start: VirtualAddress, size: usize) {
        self.insert(KernelSymbol {
            name: name.to_string(),
            start,
            size,
            module: Some(module.to_string()),
            dynamic: false,
        });
    }

    /// Add a symbol for run-time generated code
    pub fn add_dynamic_symbol(&mut self, name: &str, start: VirtualAddress, size: usize) {
        self.insert(KernelSymbol {
            name: name.to_string(),
            start,
            size,
            module: None,
            dynamic: true,
        });
    }

    fn insert(&mut self, symbol: KernelSymbol) {
        let pos = self.symbols.partition_point(|s| s.start <= symbol.start);
        self.symbols.insert(pos, symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for KernelSymbolTable {
    fn is_text(&self, addr: VirtualAddress) -> bool {
        self.text.iter().any(|&(start, size)| {
            addr.as_u64() >= start.as_u64() && addr.as_u64() - start.as_u64() < size as u64
        })
    }

    fn lookup(&self, addr: VirtualAddress) -> Option<SymbolInfo<'_>> {
        let idx = self.symbols.partition_point(|s| s.start <= addr);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        let offset = (addr.as_u64() - symbol.start.as_u64()) as usize;
        if offset >= symbol.size {
            return None;
        }
        Some(SymbolInfo {
            name: &symbol.name,
            start: symbol.start,
            size: symbol.size,
            offset,
            module: symbol.module.as_deref(),
            dynamic: symbol.dynamic,
        })
    }
}

/// Format `addr` as `name+0xoff/0xsize [module]`, or as a bare address
/// when no symbol matches. The result is cut to fit [`KSYM_SYMBOL_LEN`].
pub fn format_symbol(resolver: &dyn SymbolResolver, addr: VirtualAddress) -> String {
    let mut s = match resolver.lookup(addr) {
        Some(sym) => match sym.module {
            Some(module) => format!("{}+{:#x}/{:#x} [{}]", sym.name, sym.offset, sym.size, module),
            None => format!("{}+{:#x}/{:#x}", sym.name, sym.offset, sym.size),
        },
        None => format!("{:#x}", addr),
    };
    if s.len() >= KSYM_SYMBOL_LEN {
        let mut end = KSYM_SYMBOL_LEN - 1;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

//! # Symbol Resolution and Address Translation
//!
//! Uprobes attach to a function by **binary path + file offset**, not by its
//! runtime address. Runtime addresses move with every run because of ASLR,
//! so the resolver finds where the symbol lives right now and translates it
//! back into a position inside the file image:
//!
//! ```text
//! Runtime Address = Load Base + File Offset
//! File Offset     = Runtime Address - Load Base
//! ```
//!
//! The load base is the address where offset 0 of the module's file is
//! mapped (what `dladdr` reports as `dli_fbase`).
//!
//! ## Resolvers
//!
//! - [`DlResolver`]: the current process, via `dlsym` + `dladdr`
//! - [`MapsResolver`]: any process, via `/proc/<pid>/maps` + ELF symbol tables

pub mod dl;
pub mod memory_maps;

use std::path::PathBuf;

use crate::domain::{FileOffset, ResolutionError, VirtAddr};

pub use dl::DlResolver;
pub use memory_maps::{parse_memory_maps, LoadedModule, MapsResolver, Mapping};

/// Where a symbol lives in a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolLocation {
    pub virtual_address: VirtAddr,
    pub module_path: PathBuf,
    pub load_base: VirtAddr,
}

impl SymbolLocation {
    /// Translate the runtime address into an attachable file offset
    ///
    /// # Errors
    /// Returns an error if the address lies below the module's load base
    pub fn file_offset(&self) -> Result<FileOffset, ResolutionError> {
        self.virtual_address.0.checked_sub(self.load_base.0).map(FileOffset).ok_or(
            ResolutionError::AddressBelowBase {
                addr: self.virtual_address,
                base: self.load_base,
            },
        )
    }
}

/// Finds a named function in a process's loaded modules
pub trait SymbolResolver {
    /// # Errors
    /// Returns an error if the symbol or its containing module cannot be determined
    fn resolve(&self, symbol: &str) -> Result<SymbolLocation, ResolutionError>;
}

//! Cross-process symbol resolution from `/proc/<pid>/maps`
//!
//! `dlsym` only answers for the calling process. For any other PID we rebuild
//! the same answer from the outside: the maps file tells us which ELF files
//! are loaded and where, and each file's symbol table tells us where the
//! function sits relative to that module's load base.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use object::{Object, ObjectKind, ObjectSymbol};

use super::{SymbolLocation, SymbolResolver};
use crate::domain::{Pid, ResolutionError, VirtAddr};

/// One file-backed line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    /// File offset mapped at `start`
    pub offset: u64,
    pub executable: bool,
    pub path: PathBuf,
}

impl Mapping {
    #[must_use]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.0 >= self.start && addr.0 < self.end
    }
}

/// All mappings of one file, merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    /// Address where file offset 0 is mapped
    pub load_base: VirtAddr,
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub executable: bool,
}

impl LoadedModule {
    #[must_use]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parse the contents of a maps file, keeping only file-backed mappings
///
/// Format: `start-end perms offset dev inode pathname`
#[must_use]
pub fn parse_memory_maps(content: &str) -> Vec<Mapping> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<Mapping> {
    // The first five fields are single-space separated; the pathname is
    // padded and may itself contain spaces
    let mut fields = line.splitn(6, ' ');
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next()?.trim();
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);

    // Anonymous memory, [heap], [stack], [vdso], ...
    if !path.starts_with('/') {
        return None;
    }

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        path: PathBuf::from(path),
    })
}

/// Merge mappings per file, in order of first appearance
#[must_use]
pub fn group_modules(mappings: &[Mapping]) -> Vec<LoadedModule> {
    let mut modules: Vec<LoadedModule> = Vec::new();

    for mapping in mappings {
        let base = VirtAddr(mapping.start.saturating_sub(mapping.offset));
        if let Some(module) = modules.iter_mut().find(|m| m.path == mapping.path) {
            if mapping.start < module.start.0 {
                module.start = VirtAddr(mapping.start);
                module.load_base = base;
            }
            module.end = module.end.max(VirtAddr(mapping.end));
            module.executable |= mapping.executable;
        } else {
            modules.push(LoadedModule {
                path: mapping.path.clone(),
                load_base: base,
                start: VirtAddr(mapping.start),
                end: VirtAddr(mapping.end),
                executable: mapping.executable,
            });
        }
    }

    modules
}

/// Resolves symbols in another process through procfs
#[derive(Debug, Clone)]
pub struct MapsResolver {
    pid: Pid,
    binary: Option<PathBuf>,
}

impl MapsResolver {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid, binary: None }
    }

    /// Only search the module loaded from `binary`
    #[must_use]
    pub fn with_binary(mut self, binary: Option<PathBuf>) -> Self {
        self.binary = binary;
        self
    }

    /// Executable modules of the process, in maps order
    ///
    /// # Errors
    /// Returns an error if `/proc/<pid>/maps` cannot be read
    pub fn modules(&self) -> Result<Vec<LoadedModule>, ResolutionError> {
        let maps_path = format!("/proc/{}/maps", self.pid.0);
        let content = fs::read_to_string(&maps_path)
            .map_err(|e| ResolutionError::MemoryMapsUnreadable(self.pid.0, e))?;
        Ok(group_modules(&parse_memory_maps(&content)).into_iter().filter(|m| m.executable).collect())
    }

    /// Path to `path` as seen from this process (handles other mount namespaces)
    fn host_path(&self, path: &Path) -> PathBuf {
        if self.pid == Pid::current() {
            return path.to_path_buf();
        }
        let mut host = PathBuf::from(format!("/proc/{}/root", self.pid.0));
        host.push(path.strip_prefix("/").unwrap_or(path));
        host
    }
}

impl SymbolResolver for MapsResolver {
    fn resolve(&self, symbol: &str) -> Result<SymbolLocation, ResolutionError> {
        let mut modules = self.modules()?;

        if let Some(ref binary) = self.binary {
            modules.retain(|m| same_file(&m.path, binary));
            if modules.is_empty() {
                return Err(ResolutionError::ModuleNotMapped { pid: self.pid, binary: binary.clone() });
            }
        }

        for module in &modules {
            let host_path = self.host_path(&module.path);
            let found = match find_symbol(&host_path, symbol) {
                Ok(found) => found,
                // An explicitly chosen binary must be readable; otherwise keep looking
                Err(e) if self.binary.is_some() => return Err(e),
                Err(e) => {
                    debug!("Skipping {}: {e}", module.path.display());
                    continue;
                }
            };

            if let Some(sym) = found {
                let virtual_address = if sym.absolute {
                    VirtAddr(sym.address)
                } else {
                    VirtAddr(module.load_base.0 + sym.address)
                };
                info!(
                    "Resolved {symbol} in {} at {virtual_address} (base {})",
                    module.path.display(),
                    module.load_base
                );
                return Ok(SymbolLocation {
                    virtual_address,
                    module_path: host_path,
                    load_base: module.load_base,
                });
            }
        }

        Err(ResolutionError::SymbolNotFound(symbol.to_string()))
    }
}

struct ElfSymbol {
    address: u64,
    /// Non-PIE executables carry absolute addresses
    absolute: bool,
}

/// Look `name` up in the dynamic symbol table, then the static one
fn find_symbol(path: &Path, name: &str) -> Result<Option<ElfSymbol>, ResolutionError> {
    let unreadable = |error: String| ResolutionError::ElfUnreadable { path: path.to_path_buf(), error };

    let data = fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    let file = object::File::parse(&*data).map_err(|e| unreadable(e.to_string()))?;
    let absolute = file.kind() == ObjectKind::Executable;

    let symbol = file
        .dynamic_symbols()
        .chain(file.symbols())
        .find(|s| s.is_definition() && s.name().is_ok_and(|n| n == name));

    Ok(symbol.map(|s| ElfSymbol { address: s.address(), absolute }))
}

fn same_file(a: &Path, b: &Path) -> bool {
    a == b
        || match (fs::canonicalize(a), fs::canonicalize(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
}

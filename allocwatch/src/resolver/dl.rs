//! In-process symbol resolution through the dynamic linker
//!
//! Used when the traced process is allocwatch itself: `dlsym(RTLD_DEFAULT)`
//! finds the live definition the dynamic linker actually bound, and `dladdr`
//! names the module that contains it and where it was loaded.

#![allow(unsafe_code)] // dlsym()/dladdr() require unsafe

use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::path::PathBuf;

use log::debug;

use super::{SymbolLocation, SymbolResolver};
use crate::domain::{ResolutionError, VirtAddr};

/// Resolves symbols in the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct DlResolver;

impl SymbolResolver for DlResolver {
    fn resolve(&self, symbol: &str) -> Result<SymbolLocation, ResolutionError> {
        let name = CString::new(symbol)
            .map_err(|_| ResolutionError::InvalidSymbolName(symbol.to_string()))?;

        // SAFETY: `name` is a valid NUL-terminated string that outlives the call
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if addr.is_null() {
            return Err(ResolutionError::SymbolNotFound(symbol.to_string()));
        }
        let virtual_address = VirtAddr(addr as u64);

        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        // SAFETY: `info` points to writable storage for one Dl_info
        let found = unsafe { libc::dladdr(addr.cast_const(), info.as_mut_ptr()) };
        // SAFETY: zero-initialised, and filled in by dladdr on success
        let info = unsafe { info.assume_init() };

        if found == 0 || info.dli_fname.is_null() || info.dli_fbase.is_null() {
            return Err(ResolutionError::ModuleUnknown {
                symbol: symbol.to_string(),
                addr: virtual_address,
            });
        }

        // SAFETY: dli_fname is a NUL-terminated string owned by the dynamic linker
        let fname = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
        let module_path = module_path_from(&fname)?;
        let load_base = VirtAddr(info.dli_fbase as u64);

        debug!("{symbol} at {virtual_address} in {} (base {load_base})", module_path.display());

        Ok(SymbolLocation { virtual_address, module_path, load_base })
    }
}

/// The dynamic linker reports the main executable by the name it was started
/// with (often relative or empty); attachment needs a real path.
fn module_path_from(fname: &str) -> Result<PathBuf, ResolutionError> {
    let path = PathBuf::from(fname);
    if path.is_absolute() {
        return Ok(path);
    }
    std::fs::read_link("/proc/self/exe").map_err(|e| ResolutionError::ElfUnreadable {
        path: PathBuf::from("/proc/self/exe"),
        error: e.to_string(),
    })
}

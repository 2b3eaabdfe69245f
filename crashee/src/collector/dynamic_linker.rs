// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loaded binary images, and symbol lookup usable from a signal handler.
//!
//! `dl_iterate_phdr` and `dladdr` take the loader's lock, which a suspended thread may be
//! holding. Images are therefore enumerated in normal context by [refresh] into a snapshot, and
//! the crash path only reads the last published snapshot. Symbols are resolved against each
//! image's dynamic symbol table, located at refresh time and read through [copy_safely].

use super::cpu;
use super::memory::{copy_max_possible, copy_safely};
use libc::{c_int, c_void, dl_phdr_info, size_t};
use std::ffi::{CStr, CString};
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Mutex, OnceLock, PoisonError};

const NT_GNU_BUILD_ID: u32 = 3;
const GNU_NOTE_NAME: &[u8] = b"GNU\0";

const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_STRSZ: i64 = 10;
const DT_GNU_HASH: i64 = 0x6fff_fef5;

const SYMBOL_SIZE: usize = 24;
const SYMBOLS_PER_READ: usize = 32;
const STT_TLS: u8 = 6;
const MAX_SYMBOL_NAME: usize = 512;

// The loader reports the main executable with an empty name.
static MAIN_EXECUTABLE_PATH: OnceLock<CString> = OnceLock::new();

// Published snapshots are never freed: a crash handler may be reading one while it is replaced.
static SNAPSHOT: AtomicPtr<Vec<BinaryImage>> = AtomicPtr::new(std::ptr::null_mut());
static REFRESH_LOCK: Mutex<()> = Mutex::new(());

/// Records the main executable's path and takes the first image snapshot.
/// Must run in normal context, since both allocate and take the loader's lock.
pub fn init() {
    let _ = MAIN_EXECUTABLE_PATH.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|path| CString::new(path.into_os_string().into_encoded_bytes()).ok())
            .unwrap_or_default()
    });
    refresh();
}

/// Re-enumerates the loaded images, publishing a new snapshot if they changed.
/// Normal context only. Returns the number of images.
pub fn refresh() -> usize {
    let _guard = REFRESH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let images = loaded_images();
    let count = images.len();
    if snapshot() != images.as_slice() {
        SNAPSHOT.store(Box::into_raw(Box::new(images)), Release);
    }
    count
}

fn snapshot() -> &'static [BinaryImage] {
    // SAFETY: a non-null pointer was published by `refresh` from a leaked box.
    unsafe { SNAPSHOT.load(Acquire).as_ref() }
        .map(Vec::as_slice)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    pub address: usize,
    pub vm_address: usize,
    pub size: usize,
    pub name: CString,
    pub uuid: Option<[u8; 16]>,
    pub cpu_type: i64,
    pub cpu_subtype: i64,
    pub major_version: u64,
    pub minor_version: u64,
    pub revision_version: u64,
    symbols: Option<SymbolTable>,
}

impl BinaryImage {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

/// Calls `f` once per image of the last snapshot, in load order. Signal safe.
pub fn for_each_image<F: FnMut(&BinaryImage)>(f: F) {
    snapshot().iter().for_each(f);
}

/// Where an address lies, as `dladdr` would tell.
#[derive(Debug, Clone, Copy)]
pub struct Symbolication {
    pub image_name: &'static CStr,
    pub image_address: usize,
    pub symbol_name: Option<&'static CStr>,
    pub symbol_address: usize,
}

/// Resolves `address` against the last snapshot. Signal safe.
///
/// Returns `None` if no snapshotted image contains it. The symbol is the closest exported one
/// covering the address, if any.
pub fn symbolicate(address: usize) -> Option<Symbolication> {
    let image = snapshot().iter().find(|image| image.contains(address))?;
    let symbol = image
        .symbols
        .as_ref()
        .and_then(|table| table.symbol_containing(address));
    Some(Symbolication {
        image_name: image.name.as_c_str(),
        image_address: image.address,
        symbol_name: symbol.and_then(|(name, _)| name),
        symbol_address: symbol.map_or(0, |(_, address)| address),
    })
}

/// The dynamic symbol table of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SymbolTable {
    bias: usize,
    symbols: usize,
    count: usize,
    strings: usize,
    strings_size: usize,
}

struct Symbol {
    name: u32,
    info: u8,
    section: u16,
    value: usize,
    size: usize,
}

impl Symbol {
    fn decode(bytes: &[u8]) -> Self {
        let u32_at =
            |at: usize| u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_ne_bytes(word) as usize
        };
        Self {
            name: u32_at(0),
            info: bytes[4],
            section: u16::from_ne_bytes([bytes[6], bytes[7]]),
            value: u64_at(8),
            size: u64_at(16),
        }
    }
}

impl SymbolTable {
    /// The defined symbol with the highest address that covers `address`, and its address.
    fn symbol_containing(&self, address: usize) -> Option<(Option<&'static CStr>, usize)> {
        let mut best: Option<Symbol> = None;
        let mut chunk = [0u8; SYMBOL_SIZE * SYMBOLS_PER_READ];
        let mut index = 0;
        while index < self.count {
            let batch = (self.count - index).min(SYMBOLS_PER_READ);
            let bytes = &mut chunk[..batch * SYMBOL_SIZE];
            if !copy_safely(self.symbols + index * SYMBOL_SIZE, bytes) {
                break;
            }
            for raw in bytes.chunks_exact(SYMBOL_SIZE) {
                let symbol = Symbol::decode(raw);
                if symbol.section == 0 || symbol.value == 0 || symbol.info & 0xf == STT_TLS {
                    continue;
                }
                let start = self.bias.wrapping_add(symbol.value);
                let covers = address == start
                    || (address > start && address - start < symbol.size);
                if covers && best.as_ref().map_or(true, |b| b.value < symbol.value) {
                    best = Some(symbol);
                }
            }
            index += batch;
        }
        let best = best?;
        Some((self.name(best.name), self.bias.wrapping_add(best.value)))
    }

    fn name(&self, offset: u32) -> Option<&'static CStr> {
        let offset = offset as usize;
        if offset >= self.strings_size {
            return None;
        }
        let start = self.strings + offset;
        let mut bytes = [0u8; MAX_SYMBOL_NAME];
        let limit = (self.strings_size - offset).min(MAX_SYMBOL_NAME);
        let copied = copy_max_possible(start, &mut bytes[..limit]);
        let len = bytes[..copied].iter().position(|&b| b == 0)?;
        // SAFETY: the `len + 1` bytes at `start` were just read, and end with the only NUL.
        // Image memory stays mapped while the image is loaded.
        let name = unsafe { std::slice::from_raw_parts(start as *const u8, len + 1) };
        CStr::from_bytes_with_nul(name).ok()
    }
}

fn loaded_images() -> Vec<BinaryImage> {
    let mut images = Vec::new();
    // SAFETY: the data pointer is the vector above, alive for the whole iteration.
    unsafe {
        libc::dl_iterate_phdr(
            Some(visit_image),
            &mut images as *mut Vec<BinaryImage> as *mut c_void,
        );
    }
    images
}

unsafe extern "C" fn visit_image(info: *mut dl_phdr_info, _size: size_t, data: *mut c_void) -> c_int {
    let images = &mut *(data as *mut Vec<BinaryImage>);
    let Some(info) = info.as_ref() else {
        return 0;
    };
    let headers: &[libc::Elf64_Phdr] = if info.dlpi_phdr.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
    };

    let mut low = usize::MAX;
    let mut high = 0;
    for header in headers.iter().filter(|h| h.p_type == libc::PT_LOAD) {
        low = low.min(header.p_vaddr as usize);
        high = high.max((header.p_vaddr + header.p_memsz) as usize);
    }
    if low > high {
        return 0;
    }

    let name = match info.dlpi_name.as_ref() {
        Some(_) if *info.dlpi_name != 0 => CStr::from_ptr(info.dlpi_name).to_owned(),
        _ => MAIN_EXECUTABLE_PATH.get().cloned().unwrap_or_default(),
    };

    let bias = info.dlpi_addr as usize;
    images.push(BinaryImage {
        address: bias + low,
        vm_address: low,
        size: high - low,
        name,
        uuid: build_id(bias, headers),
        cpu_type: cpu::CPU_TYPE,
        cpu_subtype: cpu::CPU_SUBTYPE,
        major_version: 0,
        minor_version: 0,
        revision_version: 0,
        symbols: dynamic_symbols(bias, headers),
    });
    0
}

/// The first 16 bytes of the GNU build-id note, if the image has one.
unsafe fn build_id(base: usize, headers: &[libc::Elf64_Phdr]) -> Option<[u8; 16]> {
    for header in headers.iter().filter(|h| h.p_type == libc::PT_NOTE) {
        let notes = std::slice::from_raw_parts(
            (base + header.p_vaddr as usize) as *const u8,
            header.p_memsz as usize,
        );
        let mut offset = 0;
        // Elf64_Nhdr { n_namesz: u32, n_descsz: u32, n_type: u32 }, then 4-aligned name and desc.
        while offset + 12 <= notes.len() {
            let word = |at: usize| {
                u32::from_ne_bytes([notes[at], notes[at + 1], notes[at + 2], notes[at + 3]])
            };
            let name_size = word(offset) as usize;
            let desc_size = word(offset + 4) as usize;
            let note_type = word(offset + 8);
            let name_start = offset + 12;
            let desc_start = name_start + name_size.next_multiple_of(4);
            let next = desc_start + desc_size.next_multiple_of(4);
            if desc_start + desc_size > notes.len() {
                break;
            }
            if note_type == NT_GNU_BUILD_ID
                && &notes[name_start..name_start + name_size] == GNU_NOTE_NAME
                && desc_size >= 16
            {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&notes[desc_start..desc_start + 16]);
                return Some(uuid);
            }
            offset = next;
        }
    }
    None
}

/// Locates the dynamic symbol table through the `PT_DYNAMIC` segment.
unsafe fn dynamic_symbols(bias: usize, headers: &[libc::Elf64_Phdr]) -> Option<SymbolTable> {
    let dynamic = headers.iter().find(|h| h.p_type == libc::PT_DYNAMIC)?;
    // glibc relocates these entries in place, other loaders and the vDSO leave them as is.
    let relocate = |address: u64| {
        let address = address as usize;
        if address < bias {
            address + bias
        } else {
            address
        }
    };
    let (mut symbols, mut strings, mut strings_size, mut hash, mut gnu_hash) = (0, 0, 0, 0, 0);
    let mut entry = (bias + dynamic.p_vaddr as usize) as *const [u64; 2];
    loop {
        let [tag, value] = entry.read_unaligned();
        match tag as i64 {
            DT_NULL => break,
            DT_SYMTAB => symbols = relocate(value),
            DT_STRTAB => strings = relocate(value),
            DT_STRSZ => strings_size = value as usize,
            DT_HASH => hash = relocate(value),
            DT_GNU_HASH => gnu_hash = relocate(value),
            _ => {}
        }
        entry = entry.add(1);
    }
    let count = if hash != 0 {
        // nbucket, nchain: every symbol has a chain entry.
        *(hash as *const u32).add(1) as usize
    } else if gnu_hash != 0 {
        gnu_hash_symbol_count(gnu_hash)
    } else {
        return None;
    };
    (symbols != 0 && strings != 0).then_some(SymbolTable {
        bias,
        symbols,
        count,
        strings,
        strings_size,
    })
}

/// The GNU hash table does not store the symbol count: it ends with the last chain of the
/// highest bucket.
unsafe fn gnu_hash_symbol_count(table: usize) -> usize {
    let header = table as *const u32;
    let bucket_count = *header as usize;
    let first_symbol = *header.add(1) as usize;
    let bloom_words = *header.add(2) as usize;
    let buckets = (table + 16 + bloom_words * std::mem::size_of::<usize>()) as *const u32;
    let chains = buckets.add(bucket_count);
    let last_bucket = (0..bucket_count)
        .map(|i| *buckets.add(i) as usize)
        .max()
        .unwrap_or(0);
    if last_bucket < first_symbol {
        return first_symbol;
    }
    let mut index = last_bucket;
    while *chains.add(index - first_symbol) & 1 == 0 {
        index += 1;
    }
    index + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_main_executable_contains_own_code() {
        init();
        let here = test_main_executable_contains_own_code as usize;
        let found = symbolicate(here).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(found.image_name.to_str().unwrap(), exe.to_str().unwrap());
        assert!(found.image_address <= here);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_images_are_enumerated_with_sizes() {
        assert!(refresh() > 1);
        let mut count = 0;
        for_each_image(|image| {
            count += 1;
            assert!(image.size > 0);
            assert_eq!(image.cpu_type, cpu::CPU_TYPE);
        });
        assert!(count > 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unchanged_images_keep_the_published_snapshot() {
        init();
        let before = snapshot().as_ptr();
        refresh();
        assert_eq!(snapshot().as_ptr(), before);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_exported_libc_symbol_is_resolved_from_the_snapshot() {
        init();
        let getpid = libc::getpid as usize;
        let found = symbolicate(getpid).unwrap();
        assert!(found.image_name.to_str().unwrap().contains("libc"));
        assert_eq!(found.symbol_address, getpid);
        let name = found.symbol_name.unwrap().to_str().unwrap();
        assert!(name.contains("getpid"), "{name}");

        let inside = symbolicate(getpid + 1).unwrap();
        assert_eq!(inside.symbol_address, getpid);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_unmapped_address_is_not_symbolicated() {
        init();
        assert!(symbolicate(16).is_none());
    }
}

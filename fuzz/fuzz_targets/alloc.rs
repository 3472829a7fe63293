#![no_main]

use std::ptr::NonNull;
use std::sync::Mutex;

use slate::Slate;

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

// Slabs are never unmapped, so one allocator is shared across runs to keep
// the fuzzer's footprint bounded. Every run frees all of its allocations.
static SLATE: Mutex<Slate> = Mutex::new(Slate::new());

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory of the given size and fill it with a marker byte
    Alloc { size: u16 },
    /// Free the ith allocation, checking its contents first
    Free { index: u8 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| {
    let mut slate = SLATE.lock().unwrap();
    let mut allocations: Vec<(NonNull<u8>, usize, u8)> = vec![];

    for action in actions {
        match action {
            Alloc { size } => {
                let size = size as usize;
                let marker = size as u8 | 1;

                if let Ok(ptr) = slate.alloc(size) {
                    unsafe { ptr.as_ptr().write_bytes(marker, size); }
                    allocations.push((ptr, size, marker));
                }
            }
            Free { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, size, marker) = allocations.swap_remove(index as usize);

                for i in 0..size {
                    unsafe { assert_eq!(*ptr.as_ptr().add(i), marker); }
                }
                unsafe { slate.free(ptr).unwrap(); }
            }
        }
    }

    // Free any remaining allocations.
    for (ptr, size, marker) in allocations {
        for i in 0..size {
            unsafe { assert_eq!(*ptr.as_ptr().add(i), marker); }
        }
        unsafe { slate.free(ptr).unwrap(); }
    }
});

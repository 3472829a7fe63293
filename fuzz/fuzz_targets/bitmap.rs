#![no_main]

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

use slate::bitmap::{Bitmap256, BITMAP_BITS};

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Claim the first run of len % 256 + 1 free slots
    Claim { len: u8 },
    /// Release the ith live run
    Release { index: u8 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| {
    let mut map = Bitmap256::FULL;
    let mut model = [true; BITMAP_BITS];
    let mut runs: Vec<(usize, usize)> = vec![];

    for action in actions {
        match action {
            Claim { len } => {
                let len = len as usize + 1;

                // reference first-fit scan over the boolean model
                let expected = model.windows(len).position(|w| w.iter().all(|&free| free));

                match map.claim_run(len) {
                    Some(pos) => {
                        assert_eq!(Some(pos), expected);

                        for slot in &mut model[pos..pos + len] {
                            *slot = false;
                        }
                        runs.push((pos, len));
                    }
                    None => assert_eq!(expected, None),
                }
            }
            Release { index } => {
                if index as usize >= runs.len() { continue; }

                let (pos, len) = runs.swap_remove(index as usize);

                assert!(map.is_run_claimed(pos, len));
                map.release_run(pos, len);

                for slot in &mut model[pos..pos + len] {
                    *slot = true;
                }
            }
        }
    }

    // the bitmap and the model must agree bit for bit
    for pos in 0..BITMAP_BITS {
        assert_eq!(map.get(pos), model[pos]);
    }
});

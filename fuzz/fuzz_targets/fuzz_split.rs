#![no_main]
use libfuzzer_sys::fuzz_target;

use a64_layout::imm::{max_split_value, split_imm24_scaled};

fuzz_target!(|input: (u32, u8)| {
    let (value, shift) = input;
    let shift = u32::from(shift % 5);
    match split_imm24_scaled(value, shift) {
        Ok((hi, lo)) => {
            assert_eq!(hi + (lo << shift), value);
            assert_eq!(hi % 4096, 0);
            assert!(hi <= 0xFFF000 && lo <= 0xFFF);
        }
        Err(_) => {
            assert!(shift > 3 || value > max_split_value(shift) || value % (1 << shift) != 0);
        }
    }
});

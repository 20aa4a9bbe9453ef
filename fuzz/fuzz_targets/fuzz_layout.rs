#![no_main]
use libfuzzer_sys::fuzz_target;

use a64_layout::{Cond, Register, ResourceLimits, UnitBuilder};

const LABELS: [&str; 8] = ["l0", "l1", "l2", "l3", "l4", "l5", "l6", "l7"];

// Each input byte pair drives one builder call; block sizes are scaled up so
// that short inputs still produce out-of-range branches.
fuzz_target!(|data: &[u8]| {
    let mut unit = UnitBuilder::new("fuzz");
    unit.limits(ResourceLimits {
        max_instructions: 4096,
        ..ResourceLimits::default()
    });
    let mut bound = [false; LABELS.len()];

    for pair in data.chunks_exact(2) {
        let (op, arg) = (pair[0], pair[1]);
        let label = LABELS[usize::from(arg) % LABELS.len()];
        match op % 8 {
            0 => {
                let slot = usize::from(arg) % LABELS.len();
                if bound[slot] {
                    continue;
                }
                bound[slot] = true;
                if unit.label(label).is_err() {
                    return;
                }
            }
            1 => {
                unit.b_cond(Cond::from_bits(u32::from(arg)), label);
            }
            2 => {
                unit.cbz(Register::x(arg), label);
            }
            3 => {
                unit.tbnz(Register::w(arg), arg, label);
            }
            4 => {
                unit.b(label);
            }
            5 => {
                unit.align(1 << (arg % 12));
            }
            6 => {
                unit.bytes(&vec![0; usize::from(arg) * 256]);
            }
            _ => {
                unit.nop();
            }
        }
    }
    for (slot, name) in LABELS.iter().enumerate() {
        if !bound[slot] && unit.label(name).is_err() {
            return;
        }
    }

    if let Ok(laid_out) = unit.finish() {
        let bytes = laid_out.emit().expect("converged unit must encode");
        assert_eq!(bytes.len() as u64, laid_out.size());
    }
});

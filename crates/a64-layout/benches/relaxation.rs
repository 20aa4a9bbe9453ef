//! Performance benchmarks for `a64_layout`.
//!
//! Measures:
//! - Layout of straight-line code (single sweep)
//! - Branch-heavy units where many branches need trampolines
//! - Cascading relaxation that needs a third sweep
//! - The immediate splitter
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use a64_layout::imm::split_imm24_scaled;
use a64_layout::{Cond, Register, UnitBuilder};

// ─── Straight-Line Code ─────────────────────────────────────────────────────

fn straight_line(words: usize) -> UnitBuilder {
    let mut unit = UnitBuilder::new("straight");
    for i in 0..words {
        if i % 64 == 0 {
            unit.align(16);
        }
        unit.nop();
    }
    unit
}

fn bench_straight_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("straight_line");
    for words in [1_000usize, 100_000] {
        let unit = straight_line(words);
        group.throughput(Throughput::Elements(words as u64));
        group.bench_function(format!("{}_words", words), |b| {
            b.iter(|| black_box(unit.clone()).finish().unwrap())
        });
    }
    group.finish();
}

// ─── Branch-Heavy Units ──────────────────────────────────────────────────────

/// `branches` test-bit branches to labels spread over `2 * branches` KiB, so
/// roughly half of them are out of TBZ range.
fn branch_heavy(branches: usize) -> UnitBuilder {
    let mut unit = UnitBuilder::new("branchy");
    for i in 0..branches {
        let target = format!("l{}", (i * 7) % branches);
        match i % 3 {
            0 => unit.tbz(Register::x(0), (i % 64) as u8, &target),
            1 => unit.cbnz(Register::w(1), &target),
            _ => unit.b_cond(Cond::from_bits(i as u32), &target),
        };
        unit.label(&format!("l{}", i)).unwrap();
        unit.bytes(&[0; 2048]);
    }
    unit
}

fn bench_branch_heavy(c: &mut Criterion) {
    let mut group = c.benchmark_group("branch_heavy");
    for branches in [64usize, 1024] {
        let unit = branch_heavy(branches);
        group.throughput(Throughput::Elements(branches as u64));
        group.bench_function(format!("{}_branches", branches), |b| {
            b.iter(|| black_box(unit.clone()).finish().unwrap())
        });
    }
    group.finish();
}

// ─── Cascading Relaxation ────────────────────────────────────────────────────

/// `segments` copies of a TBZ whose target sits exactly at the edge of its
/// range, with a far CBZ in between. Relaxing the CBZ pushes the TBZ out, so
/// every unit needs three sweeps.
fn cascade(segments: usize) -> UnitBuilder {
    let max = a64_layout::BranchKind::TestBit.max_disp() as usize;
    let mut unit = UnitBuilder::new("cascade");
    for i in 0..segments {
        let edge = format!("edge{}", i);
        unit.tbz(Register::x(0), 0, &edge)
            .bytes(&vec![0; max - 8])
            .cbz(Register::x(1), "far");
        unit.label(&edge).unwrap();
    }
    unit.bytes(&vec![0; 1 << 20]);
    unit.label("far").unwrap();
    unit
}

fn bench_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("cascade");
    for segments in [4usize, 16] {
        let unit = cascade(segments);
        group.bench_function(format!("{}_segments", segments), |b| {
            b.iter(|| black_box(unit.clone()).finish().unwrap())
        });
    }
    group.finish();
}

// ─── Immediate Splitter ──────────────────────────────────────────────────────

fn bench_split(c: &mut Criterion) {
    c.bench_function("split_imm24_scaled", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for shift in 0..4 {
                for v in (0..0x100_0000u32).step_by(0x1001 << shift) {
                    let v = v & !((1 << shift) - 1);
                    if let Ok((hi, lo)) = split_imm24_scaled(black_box(v), shift) {
                        acc = acc.wrapping_add(hi ^ lo);
                    }
                }
            }
            acc
        })
    });
}

criterion_group!(
    benches,
    bench_straight_line,
    bench_branch_heavy,
    bench_cascade,
    bench_split
);
criterion_main!(benches);

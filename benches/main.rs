use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use mantle::util::constants::BYTES_IN_CARD;
use mantle::{Address, MantleBuilder, Options, WrittenCardFilter};

fn addr(raw: usize) -> Address {
    unsafe { Address::from_usize(raw) }
}

const HEAP_START: usize = 0x10_0000;
const HEAP_BYTES: usize = 0x80_0000;

/// Append/overflow/drain throughput of the written-card log with the inline
/// barrier configuration: every 36 appends one overflow dirties the logged
/// cards in place.
fn bench_inline_append_drain(c: &mut Criterion) {
    let options = Options {
        use_inline_written_card_buffers: true,
        written_card_filter: WrittenCardFilter::None,
        ..Options::default()
    };
    let mantle = MantleBuilder::new(addr(HEAP_START), HEAP_BYTES)
        .options(options)
        .build();
    let thread = mantle.attach_mutator();
    let logs = unsafe { thread.logs_mut() };

    let cards = HEAP_BYTES / BYTES_IN_CARD;
    let mut next = 0usize;
    c.bench_function("inline_append_drain", |b| {
        b.iter(|| {
            for _ in 0..64 {
                logs.log_written_card(&mantle, addr(HEAP_START + next * BYTES_IN_CARD));
                next = (next + 1) % cards;
            }
        })
    });
}

/// Deferred handoff throughput: filled buffers go to the lock-free completed
/// list and are drained back out, card table untouched on the append side.
fn bench_deferred_handoff(c: &mut Criterion) {
    let options = Options {
        defer_dirtying_written_cards: true,
        written_card_buffer_size: 256,
        ..Options::default()
    };
    let mantle = MantleBuilder::new(addr(HEAP_START), HEAP_BYTES)
        .options(options)
        .build();
    let thread = mantle.attach_mutator();
    let logs = unsafe { thread.logs_mut() };
    let wcqs = mantle.written_card_queue_set();

    let cards = HEAP_BYTES / BYTES_IN_CARD;
    let mut next = 0usize;
    c.bench_function("deferred_handoff", |b| {
        b.iter(|| {
            for _ in 0..512 {
                logs.log_written_card(&mantle, addr(HEAP_START + next * BYTES_IN_CARD));
                next = (next + 1) % cards;
            }
            while let Some(buffer) = wcqs.take_completed_buffer() {
                wcqs.allocator().release(buffer);
            }
        })
    });
}

criterion_group!(benches, bench_inline_append_drain, bench_deferred_handoff);
criterion_main!(benches);

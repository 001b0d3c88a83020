//! Microbenchmarks for the control protocol codec hot path.
//!
//! Measures frame building and parsing, the two operations every client
//! message passes through twice (request in, response out).
//!
//! Run with: `cargo bench -p hvaclib -- codec`

#![allow(missing_docs)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hvaclib::message::Message;

fn bench_build(c: &mut Criterion) {
    let ping = Message::ping();
    let status = Message::read_status("BOARD1");
    let cal = Message::set_cal_vals(1, "BOARD1", &[0, 1, 2, 3, 4, 5, 6, 7]);

    c.bench_function("codec/build_ping", |b| {
        b.iter(|| black_box(&ping).to_frame());
    });

    c.bench_function("codec/build_read_status", |b| {
        b.iter(|| black_box(&status).to_frame());
    });

    c.bench_function("codec/build_set_cal", |b| {
        b.iter(|| black_box(&cal).to_frame());
    });
}

fn bench_parse(c: &mut Criterion) {
    let ping = Message::ping().to_frame();
    let cal = Message::set_cal_vals(1, "BOARD1", &[0, 1, 2, 3, 4, 5, 6, 7]).to_frame();

    c.bench_function("codec/parse_ping", |b| {
        b.iter(|| Message::parse(black_box(&ping)).unwrap());
    });

    c.bench_function("codec/parse_set_cal", |b| {
        b.iter(|| Message::parse(black_box(&cal)).unwrap());
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let status = Message::read_status("BOARD1");

    c.bench_function("codec/round_trip", |b| {
        b.iter(|| {
            let frame = black_box(&status).to_frame();
            Message::parse(&frame).unwrap()
        });
    });
}

criterion_group!(benches, bench_build, bench_parse, bench_round_trip);
criterion_main!(benches);

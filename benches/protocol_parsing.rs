//! Benchmarks for the incremental protocol parser
//!
//! Covers the hot paths of the read task:
//! - small and large MSG payloads delivered in one buffer
//! - HMSG with a header block
//! - the same stream split into small reads, forcing payload carry-over
//!
//! Run with: cargo bench --bench protocol_parsing

use divan::{Bencher, black_box};
use nats_core_client::Result;
use nats_core_client::protocol::{MsgArgs, Parser, ProtocolHandler};

fn main() {
    divan::main();
}

/// Counts operations so the optimizer cannot drop the work
#[derive(Default)]
struct Counter {
    msgs: usize,
    bytes: usize,
    other: usize,
}

impl ProtocolHandler for Counter {
    fn process_info(&mut self, _info: &[u8]) -> Result<()> {
        self.other += 1;
        Ok(())
    }

    fn process_msg(&mut self, args: &MsgArgs<'_>, payload: &[u8]) -> Result<()> {
        self.msgs += 1;
        self.bytes += payload.len() + args.subject.len();
        Ok(())
    }

    fn process_ping(&mut self) -> Result<()> {
        self.other += 1;
        Ok(())
    }

    fn process_pong(&mut self) -> Result<()> {
        self.other += 1;
        Ok(())
    }

    fn process_ok(&mut self) -> Result<()> {
        self.other += 1;
        Ok(())
    }

    fn process_err(&mut self, _text: &str) -> Result<()> {
        self.other += 1;
        Ok(())
    }
}

fn msg_stream(count: usize, payload: usize) -> Vec<u8> {
    let body = vec![b'x'; payload];
    let mut out = Vec::new();
    for i in 0..count {
        out.extend_from_slice(format!("MSG orders.eu.{i} {} _INBOX.abc {payload}\r\n", i % 16 + 1).as_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn hmsg_stream(count: usize) -> Vec<u8> {
    let headers = b"NATS/1.0\r\nTrace-Id: 0123456789abcdef\r\nContent-Type: json\r\n\r\n";
    let body = br#"{"id":42,"status":"ok"}"#;
    let mut out = Vec::new();
    for _ in 0..count {
        out.extend_from_slice(
            format!("HMSG events.created 3 {} {}\r\n", headers.len(), headers.len() + body.len())
                .as_bytes(),
        );
        out.extend_from_slice(headers);
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[divan::bench(args = [16, 256, 4096, 65536])]
fn msg_single_buffer(bencher: Bencher, payload: usize) {
    let stream = msg_stream(64, payload);
    bencher
        .counter(divan::counter::BytesCount::of_slice(&stream))
        .bench_local(|| {
            let mut parser = Parser::new();
            let mut counter = Counter::default();
            parser.parse(black_box(&stream), &mut counter).unwrap();
            black_box(counter.msgs)
        });
}

#[divan::bench(args = [64, 512, 4096])]
fn msg_chunked_reads(bencher: Bencher, chunk: usize) {
    let stream = msg_stream(64, 1024);
    bencher
        .counter(divan::counter::BytesCount::of_slice(&stream))
        .bench_local(|| {
            let mut parser = Parser::new();
            let mut counter = Counter::default();
            for part in stream.chunks(chunk) {
                parser.parse(black_box(part), &mut counter).unwrap();
            }
            black_box(counter.bytes)
        });
}

#[divan::bench]
fn hmsg_with_headers(bencher: Bencher) {
    let stream = hmsg_stream(64);
    bencher
        .counter(divan::counter::BytesCount::of_slice(&stream))
        .bench_local(|| {
            let mut parser = Parser::new();
            let mut counter = Counter::default();
            parser.parse(black_box(&stream), &mut counter).unwrap();
            black_box(counter.msgs)
        });
}

#[divan::bench]
fn control_ops(bencher: Bencher) {
    let stream = b"PING\r\nPONG\r\n+OK\r\n".repeat(64);
    bencher.bench_local(|| {
        let mut parser = Parser::new();
        let mut counter = Counter::default();
        parser.parse(black_box(&stream), &mut counter).unwrap();
        black_box(counter.other)
    });
}

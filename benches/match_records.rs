//! Benchmark: compile a record-oriented protocol once, then match a synthetic
//! stream of tagged records. Compares a struct with batched fixed-size members,
//! a case dispatch with dynamic arrays, and a bounded read.

use bpl::Protocol;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const RECORDS: &str = r#"
const ( POINT = 1; LABEL = 2; SAMPLES = 3 )

header = {/C
    uint8    kind
    uint8    flags
    uint16be len
}

record = {
    h header
    read h.len do case h.kind {
        POINT:   { x float32; y float32; z float32 }
        LABEL:   { text cstring }
        SAMPLES: { n uint16; values [n]int16 }
        default: { raw *byte }
    }
}

doc = *[record]
"#;

fn push_record(out: &mut Vec<u8>, kind: u8, body: &[u8]) {
    out.push(kind);
    out.push(0);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

fn synthetic_stream(count: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..count {
        match i % 4 {
            0 => {
                let body: Vec<u8> = [1.0f32, 2.0, i as f32].iter().flat_map(|x| x.to_le_bytes()).collect();
                push_record(&mut out, 1, &body);
            }
            1 => push_record(&mut out, 2, format!("label-{}\0", i).as_bytes()),
            2 => {
                let mut body = 16u16.to_le_bytes().to_vec();
                body.extend((0..16i16).flat_map(|x| x.wrapping_mul(i as i16).to_le_bytes()));
                push_record(&mut out, 3, &body);
            }
            _ => push_record(&mut out, 9, &[0xab; 24]),
        }
    }
    out
}

fn bench_match_records(c: &mut Criterion) {
    let proto = Protocol::from_str(RECORDS, "records.bpl").expect("compile");
    let data = synthetic_stream(4096);
    let records = proto
        .match_buffer(&data)
        .expect("warm-up match")
        .as_list()
        .map(|l| l.len())
        .unwrap_or(0);
    eprintln!("match_records: {} records, {} bytes (one warm-up pass)", records, data.len());

    c.bench_function("compile_records_protocol", |b| {
        b.iter(|| Protocol::from_str(black_box(RECORDS), "records.bpl").expect("compile"));
    });

    c.bench_function("match_records_buffer", |b| {
        b.iter(|| black_box(proto.match_buffer(black_box(&data)).expect("match")));
    });

    c.bench_function("match_records_to_json", |b| {
        b.iter(|| {
            let v = proto.match_buffer(black_box(&data)).expect("match");
            black_box(v.to_json().len())
        });
    });
}

criterion_group!(benches, bench_match_records);
criterion_main!(benches);

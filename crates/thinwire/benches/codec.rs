//! Benchmarks for message encoding and row decoding.
//!
//! Run with: cargo bench --bench codec

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use thinwire::buffer::WriteBuffer;
use thinwire::codec::{
    BindDescriptor, ColumnInfo, DbType, ExecuteOptions, ExecuteRequest, Request, Response, Row,
    Status, Value,
};

fn columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("ID", DbType::Number),
        ColumnInfo::new("NAME", DbType::Varchar),
        ColumnInfo::new("SCORE", DbType::BinaryDouble),
    ]
}

fn encoded_response(rows: usize) -> Vec<u8> {
    let mut response = Response::new(1);
    response.columns = Some(columns());
    response.rows = (0..rows)
        .map(|i| {
            Row::new(vec![
                Value::Number((i as i64).into()),
                Value::from(format!("name-{i}")),
                Value::Double(i as f64 / 3.0),
            ])
        })
        .collect();
    response.status = Some(Status {
        cursor_id: 1,
        row_count: rows as u64,
        end_of_data: true,
        ..Status::default()
    });
    let mut buf = WriteBuffer::default();
    response
        .encode(None, &mut buf)
        .expect("benchmark response encodes");
    buf.as_slice().to_vec()
}

fn benchmark_decode_rows(c: &mut Criterion) {
    let bytes = encoded_response(1000);
    c.bench_function("decode_1000_rows", |b| {
        b.iter(|| Response::decode(black_box(&bytes), None).expect("decodes"));
    });
}

fn benchmark_encode_batch(c: &mut Criterion) {
    let request = Request::Execute(ExecuteRequest {
        sql: Some("INSERT INTO t VALUES (:1, :2)".into()),
        options: ExecuteOptions::PARSE | ExecuteOptions::EXECUTE | ExecuteOptions::BATCH_ERRORS,
        binds: vec![
            BindDescriptor::new(DbType::BinaryInteger),
            BindDescriptor::new(DbType::Varchar),
        ],
        rows: (0..500)
            .map(|i| vec![Value::Integer(i), Value::from(format!("value {i}"))])
            .collect(),
        ..ExecuteRequest::default()
    });
    let mut buf = WriteBuffer::with_capacity(64 * 1024);
    c.bench_function("encode_500_row_batch", |b| {
        b.iter(|| {
            buf.clear();
            black_box(&request)
                .encode(7, &mut buf)
                .expect("encodes");
            black_box(buf.len())
        });
    });
}

criterion_group!(benches, benchmark_decode_rows, benchmark_encode_batch);
criterion_main!(benches);

//! Wire and dispatch throughput.
//!
//! `request_encode` / `reply_decode` measure the typed envelopes over
//! growing bodies; `srv_info` measures a full unary call through a running
//! server (connection, framing, dispatch, version check, worker admission).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rpcmux::ipc::codec::{
    decode_msgpack, encode_msgpack, read_frame, write_frame, WireReply, WireRequest, MSG_REQUEST,
    MSG_RESPONSE,
};
use rpcmux::types::api::Filter;
use rpcmux::types::RpcMetadata;
use rpcmux::{Folders, RpcServer, ServerOptions};
use serde_json::{json, Value};
use std::io::Cursor;

const MAX_FRAME: u32 = 5 * 1024 * 1024;
const ITEM_COUNTS: &[usize] = &[0, 16, 256, 4096];

fn body(items: usize) -> Value {
    let items: Vec<Value> = (0..items)
        .map(|i| json!({"name": format!("item-{i}"), "value": i}))
        .collect();
    json!({ "items": items })
}

fn bench_request_encode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("request_encode");
    for &items in ITEM_COUNTS {
        let request = WireRequest {
            id: "bench".into(),
            service: "config".into(),
            method: "set".into(),
            meta: RpcMetadata::local("bench"),
            body: body(items),
        };
        group.bench_with_input(BenchmarkId::from_parameter(items), &request, |b, r| {
            b.iter(|| {
                rt.block_on(async {
                    let payload = encode_msgpack(black_box(r)).unwrap();
                    let mut buf = Vec::with_capacity(payload.len() + 5);
                    write_frame(&mut buf, MSG_REQUEST, &payload).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_reply_decode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("reply_decode");
    for &items in ITEM_COUNTS {
        let wire = rt.block_on(async {
            let payload = encode_msgpack(&WireReply::success("bench", body(items))).unwrap();
            let mut buf = Vec::new();
            write_frame(&mut buf, MSG_RESPONSE, &payload).await.unwrap();
            buf
        });
        group.bench_with_input(BenchmarkId::from_parameter(items), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    let (_, payload) = read_frame(&mut cursor, MAX_FRAME).await.unwrap().unwrap();
                    decode_msgpack::<WireReply>(&payload).unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_srv_info(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let options = ServerOptions::new(Folders::new(dir.path()))
        .with_bind_host("127.0.0.1")
        .with_cli_value("rpc-shutdown-grace", "0.1");
    let server = rt.block_on(RpcServer::start(options, vec![])).unwrap();
    let srv = server.client().srv();
    let filter = Filter::names(["srv"]);

    c.bench_function("srv_info", |b| {
        b.iter(|| rt.block_on(srv.info(black_box(&filter))).unwrap());
    });

    rt.block_on(server.shutdown()).unwrap();
}

criterion_group!(benches, bench_request_encode, bench_reply_decode, bench_srv_info);
criterion_main!(benches);

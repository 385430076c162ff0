use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use criterion::{criterion_group, criterion_main, Criterion};
use folio_collab::admission::{AdmissionRequest, Gatekeeper, RateLimiter};
use folio_collab::broadcast::{BroadcastGroup, PeerConnection};
use folio_collab::cache::{CacheConfig, LocalCache};
use folio_collab::protocol::SyncFrame;
use folio_collab::reconcile::delete_order;
use folio_core::FileNode;
use uuid::Uuid;

fn peer() -> PeerConnection {
    PeerConnection {
        conn_id: Uuid::new_v4(),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        origin: None,
        connected_at: SystemTime::now(),
    }
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = SyncFrame::update(Uuid::new_v4(), 1, vec![0u8; 64]);
    let encoded = frame.encode().unwrap();

    c.bench_function("frame_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    c.bench_function("frame_decode_64B", |b| {
        b.iter(|| black_box(SyncFrame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_admission(c: &mut Criterion) {
    let gate = Gatekeeper::new(
        RateLimiter::new(Duration::from_secs(60), u32::MAX),
        vec!["http://localhost:5173".into()],
        Some("secret".into()),
    );
    let request = AdmissionRequest {
        ip: "10.0.0.1".into(),
        origin: Some("http://localhost:5173".into()),
        credential: Some("secret".into()),
        room: "thesis".into(),
    };
    c.bench_function("admit_same_ip", |b| {
        b.iter(|| black_box(gate.admit(black_box(&request), Instant::now())))
    });
}

fn bench_relay_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("relay_1000_frames_10_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers = Vec::new();
                for _ in 0..10 {
                    receivers.push(group.add_peer(peer()).await);
                }
                let from = Uuid::new_v4();
                let frame = Arc::new(vec![0u8; 64]);
                for _ in 0..1000 {
                    group.relay(from, frame.clone());
                }
                black_box(receivers.len())
            })
        })
    });
}

fn bench_delete_order(c: &mut Criterion) {
    // Ten folders of a hundred files each.
    let mut nodes = Vec::new();
    for f in 0..10 {
        nodes.push(FileNode::folder(format!("d{f}"), format!("dir{f}"), None));
        for i in 0..100 {
            nodes.push(FileNode::file(format!("d{f}f{i}"), "x.tex", Some(format!("d{f}")), ""));
        }
    }
    c.bench_function("delete_order_1010", |b| {
        b.iter(|| black_box(delete_order(black_box(&nodes))))
    });
}

fn bench_cache_append(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = LocalCache::open(CacheConfig::new(dir.path())).unwrap();
    let update = vec![7u8; 1024];
    c.bench_function("cache_append_1KB", |b| {
        b.iter(|| black_box(cache.append_update("bench", black_box(&update)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_admission,
    bench_relay_1000_frames,
    bench_delete_order,
    bench_cache_append
);
criterion_main!(benches);

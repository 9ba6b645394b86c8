//! End-to-end scenarios S3 and S6 (spec.md §8), exercised over real
//! `UnixStream` socket pairs through the public API only.

use hmac::Mac;
use nestmesh_core::{Broker, Context, Message, Router, Stream};
use sha1::Sha1;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEY: &[u8] = b"0000000000000000";

/// Builds a connected pair of [`Stream`]s plus the raw [`UnixStream`]
/// halves they were built from. `Stream::accept` dup's the descriptors it
/// is handed, so keeping the originals alive and reading/writing them
/// directly lets the test stand in for "a peer process on the other end"
/// without needing any test-only API on `Stream` itself.
fn make_pair(remote_for_a: u32, remote_for_b: u32, broker: &nestmesh_core::BrokerHandle) -> (Arc<Stream>, UnixStream, Arc<Stream>, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    let stream_a = Stream::accept(a.as_raw_fd(), a.as_raw_fd(), remote_for_a, KEY, broker.clone()).unwrap();
    let stream_b = Stream::accept(b.as_raw_fd(), b.as_raw_fd(), remote_for_b, KEY, broker.clone()).unwrap();
    (stream_a, a, stream_b, b)
}

/// Builds a raw, correctly-MAC'd frame the way `Stream::pack_frame` does,
/// for injecting a message as if it arrived from a peer that doesn't go
/// through our own `Stream`.
fn raw_frame(dst_id: u32, src_id: u32, handle: u32, reply_to: u32, payload: &[u8]) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(16);
    suffix.extend_from_slice(&dst_id.to_be_bytes());
    suffix.extend_from_slice(&src_id.to_be_bytes());
    suffix.extend_from_slice(&handle.to_be_bytes());
    suffix.extend_from_slice(&reply_to.to_be_bytes());
    suffix.extend_from_slice(&(payload.len() as u32).to_be_bytes());

    let mut mac = hmac::Hmac::<Sha1>::new_from_slice(KEY).unwrap();
    mac.update(&suffix);
    mac.update(payload);
    let digest = mac.finalize().into_bytes();

    let mut frame = Vec::with_capacity(20 + suffix.len() + payload.len());
    frame.extend_from_slice(&digest);
    frame.extend_from_slice(&suffix);
    frame.extend_from_slice(payload);
    frame
}

/// S3: a parent teaches a child a route, and a later message to that
/// destination is forwarded over the taught route, not dropped.
#[test]
fn add_route_installs_a_forwarding_entry_used_by_later_sends() {
    let broker = Broker::spawn().unwrap();
    let router = Router::new(1, broker.handle());

    // Process 1 (us) talks to process 2 (the parent) and process 3 (a
    // cousin we don't yet have a direct route to).
    let (stream_to_2, _keep_2, _stream_on_2_side, mut raw_2) = make_pair(2, 1, &broker.handle());
    let (stream_to_3, _keep_3, _stream_on_3_side, mut raw_3) = make_pair(3, 1, &broker.handle());
    router.register(2, stream_to_2);
    router.register(3, stream_to_3);

    let parent = Context::new(2, 1, "parent", &router);
    router.set_parent(parent);

    // Process 2 teaches us: "route 7 via 3".
    raw_2.write_all(&raw_frame(1, 2, 103, 0, b"7\x003")).unwrap();
    std::thread::sleep(Duration::from_millis(150));

    // Now route a message addressed to 7; it must go out over the
    // process-3 link, not get dropped.
    router.route(Message::new(7, 1, 500, 0, b"hello-via-3".to_vec()));
    std::thread::sleep(Duration::from_millis(150));

    let mut buf = [0u8; 4096];
    let n = raw_3.read(&mut buf).unwrap();
    assert_eq!(&buf[40..n], b"hello-via-3");

    broker.join();
}

/// S6: concurrent `send`s from multiple threads are each delivered
/// intact and none are torn or merged.
#[test]
fn concurrent_sends_from_many_threads_all_arrive_intact() {
    let broker = Broker::spawn().unwrap();
    let router_a = Router::new(1, broker.handle());
    let (stream_a, _keep_a, stream_b, _keep_b) = make_pair(2, 1, &broker.handle());
    router_a.register(2, stream_a);

    let router_b = Router::new(2, broker.handle());
    router_b.register(1, stream_b);

    let ctx_on_a = Context::new(2, 1, "peer", &router_a);
    router_a.register_context(ctx_on_a.clone());
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let handle = ctx_on_a.add_handler(
        move |msg| received2.lock().unwrap().push(msg.data.clone()),
        None,
        true,
    );

    let ctx_on_b = Context::new(1, 2, "peer", &router_b);
    let threads = 8;
    let per_thread = 20;
    let mut join_handles = Vec::new();
    for t in 0..threads {
        let ctx = ctx_on_b.clone();
        join_handles.push(std::thread::spawn(move || {
            for i in 0..per_thread {
                ctx.send(handle, 0, format!("t{t}-m{i}").into_bytes());
            }
        }));
    }
    for jh in join_handles {
        jh.join().unwrap();
    }

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(received.lock().unwrap().len(), threads * per_thread);

    broker.join();
}

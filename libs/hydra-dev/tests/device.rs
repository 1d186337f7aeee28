//! End-to-end device tests: loopback posting, self-targeted shortcuts,
//! and two-rank one-sided traffic over real sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hydra_dev::wr::{WcOpcode, WcStatus, WorkCompletion};
use hydra_dev::{Cq, Device, DeviceConfig, DeviceHandle, Region};
use hydra_wire::sn::HostRecord;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn config(rank: u16, tnc: u16, dev_port: u16) -> DeviceConfig {
    let hosts = (0..tnc)
        .map(|i| HostRecord::new("127.0.0.1", i as u8))
        .collect();
    DeviceConfig {
        rank,
        tnc,
        hosts,
        dev_port,
        conn_timeout: Duration::from_secs(5),
    }
}

fn poll_one(cq: &Cq, deadline: Duration) -> WorkCompletion {
    let t0 = Instant::now();
    loop {
        if let Some(wc) = cq.poll() {
            return wc;
        }
        assert!(t0.elapsed() < deadline, "no completion within {deadline:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn registered_region(dev: &DeviceHandle, len: usize) -> Arc<Region> {
    let region = Region::alloc(len).unwrap();
    dev.registry().register(region.clone());
    region
}

#[test]
fn test_self_write_posts_one_completion() {
    init_tracing();
    let dev = Device::spawn(config(0, 1, 27400)).unwrap();
    let cq = dev.create_cq(64, false).unwrap();
    let q = dev.create_queue().unwrap();

    let src = registered_region(&dev, 4096);
    let dst = registered_region(&dev, 4096);
    src.write(0, b"one-sided hello");

    q.post_write(42, cq.handle(), 0, src.addr(), dst.addr(), 15)
        .unwrap();

    let wc = poll_one(&cq, Duration::from_secs(2));
    assert_eq!(wc.wr_id, 42);
    assert_eq!(wc.status, WcStatus::Success);
    assert_eq!(wc.opcode, WcOpcode::RdmaWrite);
    assert!(cq.poll().is_none(), "exactly one completion expected");

    let mut out = [0u8; 15];
    dst.read(0, &mut out);
    assert_eq!(&out, b"one-sided hello");
}

#[test]
fn test_self_read_and_atomics() {
    init_tracing();
    let dev = Device::spawn(config(0, 1, 27410)).unwrap();
    let cq = dev.create_cq(64, false).unwrap();
    let q = dev.create_queue().unwrap();

    let mem = registered_region(&dev, 4096);
    let scratch = registered_region(&dev, 4096);

    mem.write(256, &[7u8; 32]);
    q.post_read(1, cq.handle(), 0, scratch.addr(), mem.addr() + 256, 32)
        .unwrap();
    let wc = poll_one(&cq, Duration::from_secs(2));
    assert_eq!((wc.wr_id, wc.opcode), (1, WcOpcode::RdmaRead));
    let mut out = [0u8; 32];
    scratch.read(0, &mut out);
    assert_eq!(out, [7u8; 32]);

    // fetch-and-add returns the previous value
    mem.write(0, &100u64.to_le_bytes());
    q.post_fetch_add(2, cq.handle(), 0, scratch.addr(), mem.addr(), 5)
        .unwrap();
    let wc = poll_one(&cq, Duration::from_secs(2));
    assert_eq!((wc.wr_id, wc.opcode), (2, WcOpcode::FetchAdd));
    let mut old = [0u8; 8];
    scratch.read(0, &mut old);
    assert_eq!(u64::from_le_bytes(old), 100);
    let mut now = [0u8; 8];
    mem.read(0, &mut now);
    assert_eq!(u64::from_le_bytes(now), 105);

    // compare-and-swap, matching compare
    q.post_cmp_swap(3, cq.handle(), 0, scratch.addr(), mem.addr(), 105, 777)
        .unwrap();
    let wc = poll_one(&cq, Duration::from_secs(2));
    assert_eq!((wc.wr_id, wc.opcode), (3, WcOpcode::CmpSwap));
    mem.read(0, &mut now);
    assert_eq!(u64::from_le_bytes(now), 777);
}

#[test]
fn test_self_send_parks_until_recv_posted() {
    init_tracing();
    let dev = Device::spawn(config(0, 1, 27420)).unwrap();
    let send_cq = dev.create_cq(64, false).unwrap();
    let recv_cq = dev.create_cq(64, true).unwrap();
    let q = dev.create_queue().unwrap();

    let src = registered_region(&dev, 4096);
    let dst = registered_region(&dev, 4096);
    src.write(0, b"parked payload");

    // send first; no receive is posted yet
    q.post_send(9, send_cq.handle(), 0, src.addr(), 14).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(send_cq.poll().is_none(), "send must wait for a receive");

    q.post_recv(10, recv_cq.handle(), dst.addr(), 1024).unwrap();

    let swc = poll_one(&send_cq, Duration::from_secs(2));
    assert_eq!((swc.wr_id, swc.opcode), (9, WcOpcode::Send));

    let rwc = poll_one(&recv_cq, Duration::from_secs(2));
    assert_eq!(rwc.opcode, WcOpcode::Recv);
    assert_eq!(rwc.sender, 0);

    let mut out = [0u8; 14];
    dst.read(0, &mut out);
    assert_eq!(&out, b"parked payload");
}

#[test]
fn test_two_ranks_remote_write_and_read() {
    init_tracing();
    let base = 27430;
    let dev1 = Device::spawn(config(1, 2, base)).unwrap();
    let dev0 = Device::spawn(config(0, 2, base)).unwrap();

    let cq0 = dev0.create_cq(64, false).unwrap();
    let q0 = dev0.create_queue().unwrap();

    let local = registered_region(&dev0, 4096);
    let remote = registered_region(&dev1, 4096);

    // remote write: rank 0 -> rank 1
    local.write(0, b"cross-rank write");
    q0.post_write(1, cq0.handle(), 1, local.addr(), remote.addr(), 16)
        .unwrap();
    let wc = poll_one(&cq0, Duration::from_secs(5));
    assert_eq!((wc.wr_id, wc.status), (1, WcStatus::Success));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut out = [0u8; 16];
        remote.read(0, &mut out);
        if &out == b"cross-rank write" {
            break;
        }
        assert!(Instant::now() < deadline, "remote write never landed");
        std::thread::sleep(Duration::from_millis(1));
    }

    // remote read: rank 0 reads back what rank 1 holds
    remote.write(512, b"remote data");
    q0.post_read(2, cq0.handle(), 1, local.addr() + 1024, remote.addr() + 512, 11)
        .unwrap();
    let wc = poll_one(&cq0, Duration::from_secs(5));
    assert_eq!((wc.wr_id, wc.opcode), (2, WcOpcode::RdmaRead));
    let mut out = [0u8; 11];
    local.read(1024, &mut out);
    assert_eq!(&out, b"remote data");
}

#[test]
fn test_two_ranks_remote_atomic_and_send() {
    init_tracing();
    let base = 27440;
    let dev1 = Device::spawn(config(1, 2, base)).unwrap();
    let dev0 = Device::spawn(config(0, 2, base)).unwrap();

    let cq0 = dev0.create_cq(64, false).unwrap();
    let q0 = dev0.create_queue().unwrap();
    let recv_cq1 = dev1.create_cq(64, true).unwrap();
    let q1 = dev1.create_queue().unwrap();

    let local0 = registered_region(&dev0, 4096);
    let mem1 = registered_region(&dev1, 4096);

    // remote fetch-and-add
    mem1.write(0, &40u64.to_le_bytes());
    q0.post_fetch_add(1, cq0.handle(), 1, local0.addr(), mem1.addr(), 2)
        .unwrap();
    let wc = poll_one(&cq0, Duration::from_secs(5));
    assert_eq!((wc.wr_id, wc.opcode), (1, WcOpcode::FetchAdd));
    let mut old = [0u8; 8];
    local0.read(0, &mut old);
    assert_eq!(u64::from_le_bytes(old), 40);

    // send from 0, receive on 1; the send arrives before the receive is
    // posted and must park until it is
    local0.write(128, b"late receiver");
    q0.post_send(2, cq0.handle(), 1, local0.addr() + 128, 13)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    q1.post_recv(3, recv_cq1.handle(), mem1.addr() + 2048, 64)
        .unwrap();

    let swc = poll_one(&cq0, Duration::from_secs(5));
    assert_eq!((swc.wr_id, swc.opcode), (2, WcOpcode::Send));

    let rwc = recv_cq1.wait_recv().unwrap();
    assert_eq!(rwc.opcode, WcOpcode::Recv);
    assert_eq!(rwc.sender, 0);

    let mut out = [0u8; 13];
    mem1.read(2048, &mut out);
    assert_eq!(&out, b"late receiver");
}

#[test]
fn test_dead_peer_yields_error_completion() {
    init_tracing();
    let base = 27450;
    let mut dev1 = Device::spawn(config(1, 2, base)).unwrap();
    let dev0 = Device::spawn(config(0, 2, base)).unwrap();

    let cq0 = dev0.create_cq(64, false).unwrap();
    let q0 = dev0.create_queue().unwrap();
    let local = registered_region(&dev0, 4096);

    // let the registration handshake settle, then kill rank 1
    std::thread::sleep(Duration::from_millis(200));
    dev1.stop().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    q0.post_write(7, cq0.handle(), 1, local.addr(), 0x1000, 64)
        .unwrap();
    let wc = poll_one(&cq0, Duration::from_secs(5));
    assert_eq!(wc.wr_id, 7);
    assert_eq!(wc.status, WcStatus::RemOpError);
}

#[test]
fn test_inlined_write_frees_buffer_once() {
    init_tracing();
    let dev = Device::spawn(config(0, 1, 27460)).unwrap();
    let cq = dev.create_cq(64, false).unwrap();
    let q = dev.create_queue().unwrap();

    let dst = registered_region(&dev, 4096);

    let payload = vec![0xabu8; 300];
    q.post_write_inlined(5, cq.handle(), 0, &payload, dst.addr())
        .unwrap();

    let wc = poll_one(&cq, Duration::from_secs(2));
    assert_eq!((wc.wr_id, wc.status), (5, WcStatus::Success));

    let mut out = vec![0u8; 300];
    dst.read(0, &mut out);
    assert_eq!(out, payload);
}

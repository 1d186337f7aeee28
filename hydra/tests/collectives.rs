//! Whole-job tests: N ranks live in one process, each with its own
//! runtime on distinct localhost ports.

use std::sync::Arc;
use std::time::Duration;

use hydra::{Config, Error, GroupId, Hydra, ReduceOp, Timeout, GROUP_ALL};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Port bases for one test job; each test uses its own block so tests
/// can run in parallel within the binary.
#[derive(Clone, Copy)]
struct Ports {
    sn: u16,
    dev: u16,
    allgather: u16,
}

fn ports(block: u16) -> Ports {
    let base = 29000 + block * 200;
    Ports {
        sn: base,
        dev: base + 100,
        allgather: base + 170,
    }
}

/// Run one closure per rank, each with its own runtime, and collect the
/// per-rank results.
fn run_job<T, F>(tnc: u16, ports: Ports, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Hydra) -> T + Send + Sync + 'static,
{
    init_tracing();
    let f = Arc::new(f);

    let handles: Vec<_> = (0..tnc)
        .map(|rank| {
            let f = f.clone();
            std::thread::spawn(move || {
                let mut config = if rank == 0 {
                    Config::master((0..tnc).map(|i| ("127.0.0.1".into(), i as u8)).collect())
                } else {
                    Config::worker(rank, rank as u8)
                };
                config.sn_port = ports.sn;
                config.dev_port = ports.dev;
                config.allgather_port = ports.allgather;
                config.conn_timeout_ms = 15_000;

                let runtime = Hydra::init(config).expect("init");
                f(runtime)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked"))
        .collect()
}

/// Build and commit the same subgroup on each member rank.
fn subgroup(runtime: &Hydra, members: &[u16]) -> GroupId {
    let g = runtime.group_create().unwrap();
    for &m in members {
        runtime.group_add(g, m).unwrap();
    }
    runtime.group_commit(g, Timeout::from_millis(10_000)).unwrap();
    g
}

#[test]
fn test_barrier_of_four() {
    let results = run_job(4, ports(0), |rt| {
        // two back-to-back barriers: the togle parity must survive both
        rt.barrier(GROUP_ALL, Timeout::from_millis(10_000))?;
        rt.barrier(GROUP_ALL, Timeout::from_millis(10_000))?;
        Ok::<_, Error>(())
    });
    for r in results {
        r.unwrap();
    }
}

#[test]
fn test_allreduce_sum_i32() {
    let results = run_job(4, ports(1), |rt| {
        let send = [i32::from(rt.rank()) + 1; 2];
        let mut recv = [0i32; 2];
        rt.allreduce(&send, &mut recv, ReduceOp::Sum, GROUP_ALL, Timeout::from_millis(10_000))
            .unwrap();
        recv
    });
    for recv in results {
        assert_eq!(recv, [10, 10]);
    }
}

#[test]
fn test_allreduce_min_f64() {
    let results = run_job(4, ports(2), |rt| {
        let r = f64::from(rt.rank());
        let send = [if rt.rank() % 2 == 0 { r } else { -r }];
        let mut recv = [f64::NAN];
        rt.allreduce(&send, &mut recv, ReduceOp::Min, GROUP_ALL, Timeout::from_millis(10_000))
            .unwrap();
        recv[0]
    });
    for min in results {
        assert_eq!(min, -3.0);
    }
}

#[test]
fn test_allreduce_sum_u64_six_ranks() {
    // six ranks: next_pof2 is 4, so the fold-down and redistribute
    // phases around the butterfly are exercised
    let results = run_job(6, ports(3), |rt| {
        let send = [u64::from(rt.rank())];
        let mut recv = [0u64];
        rt.allreduce(&send, &mut recv, ReduceOp::Sum, GROUP_ALL, Timeout::from_millis(15_000))
            .unwrap();
        recv[0]
    });
    for sum in results {
        assert_eq!(sum, 15);
    }
}

#[test]
fn test_allreduce_max_three_ranks() {
    let results = run_job(3, ports(4), |rt| {
        let send = [i64::from(rt.rank()) * 7, -i64::from(rt.rank())];
        let mut recv = [0i64; 2];
        rt.allreduce(&send, &mut recv, ReduceOp::Max, GROUP_ALL, Timeout::from_millis(15_000))
            .unwrap();
        recv
    });
    for recv in results {
        assert_eq!(recv, [14, 0]);
    }
}

#[test]
fn test_allreduce_user_defined() {
    // component-wise sum of (u32 count, u32 weight) pairs
    let results = run_job(4, ports(5), |rt| {
        let rank = u32::from(rt.rank());
        let mut send = Vec::new();
        send.extend_from_slice(&(rank + 1).to_le_bytes());
        send.extend_from_slice(&(rank * 10).to_le_bytes());
        let mut recv = vec![0u8; 8];

        rt.allreduce_user(
            &send,
            &mut recv,
            1,
            8,
            |local, incoming, out| {
                for k in (0..8).step_by(4) {
                    let a = u32::from_le_bytes(local[k..k + 4].try_into().unwrap());
                    let b = u32::from_le_bytes(incoming[k..k + 4].try_into().unwrap());
                    out[k..k + 4].copy_from_slice(&(a + b).to_le_bytes());
                }
                Ok(())
            },
            GROUP_ALL,
            Timeout::from_millis(10_000),
        )
        .unwrap();

        (
            u32::from_le_bytes(recv[0..4].try_into().unwrap()),
            u32::from_le_bytes(recv[4..8].try_into().unwrap()),
        )
    });
    for (count, weight) in results {
        assert_eq!(count, 1 + 2 + 3 + 4);
        assert_eq!(weight, 10 + 20 + 30);
    }
}

#[test]
fn test_barrier_timeout_resumes() {
    let results = run_job(2, ports(6), |rt| {
        if rt.rank() == 1 {
            // hold rank 0 up so its first call runs out of budget
            std::thread::sleep(Duration::from_millis(400));
            rt.barrier(GROUP_ALL, Timeout::from_millis(10_000)).unwrap();
            None
        } else {
            let first = rt.barrier(GROUP_ALL, Timeout::from_millis(50));
            let second = rt.barrier(GROUP_ALL, Timeout::from_millis(10_000));
            Some((first.is_err(), second.is_ok()))
        }
    });

    let (timed_out, resumed) = results[0].expect("rank 0 result");
    assert!(timed_out, "short budget must time out");
    assert!(resumed, "re-entry must complete the same barrier");
}

#[test]
fn test_allreduce_timeout_leaves_recv_untouched() {
    let results = run_job(2, ports(7), |rt| {
        let send = [u32::from(rt.rank()) + 1];
        let mut recv = [0xdead_beefu32];

        if rt.rank() == 1 {
            std::thread::sleep(Duration::from_millis(400));
            rt.allreduce(&send, &mut recv, ReduceOp::Sum, GROUP_ALL, Timeout::from_millis(10_000))
                .unwrap();
            (true, recv[0])
        } else {
            let first =
                rt.allreduce(&send, &mut recv, ReduceOp::Sum, GROUP_ALL, Timeout::from_millis(50));
            assert!(first.is_err());
            // the caller's buffer must not change until success
            assert_eq!(recv[0], 0xdead_beef);

            rt.allreduce(&send, &mut recv, ReduceOp::Sum, GROUP_ALL, Timeout::from_millis(10_000))
                .unwrap();
            (false, recv[0])
        }
    });

    for (_, value) in results {
        assert_eq!(value, 3);
    }
}

#[test]
fn test_subgroups_are_isolated() {
    // two disjoint pairs reduce concurrently without interference
    let results = run_job(4, ports(8), |rt| {
        let members: Vec<u16> = if rt.rank() % 2 == 0 {
            vec![0, 2]
        } else {
            vec![1, 3]
        };
        let g = subgroup(&rt, &members);

        assert_eq!(rt.group_ranks(g).unwrap(), members);
        assert_eq!(rt.group_size(g).unwrap(), 2);

        let send = [u64::from(rt.rank()) + 1];
        let mut recv = [0u64];
        rt.allreduce(&send, &mut recv, ReduceOp::Sum, g, Timeout::from_millis(15_000))
            .unwrap();

        rt.group_delete(g).unwrap();
        assert!(rt.group_size(g).is_err());

        (rt.rank(), recv[0])
    });

    for (rank, sum) in results {
        let expected = if rank % 2 == 0 { 1 + 3 } else { 2 + 4 };
        assert_eq!(sum, expected, "rank {rank}");
    }
}

#[test]
fn test_group_membership_rules() {
    let results = run_job(2, ports(9), |rt| {
        let g = rt.group_create().unwrap();

        // out-of-order adds end up sorted
        rt.group_add(g, 1).unwrap();
        rt.group_add(g, 0).unwrap();
        assert_eq!(rt.group_ranks(g).unwrap(), vec![0, 1]);

        // duplicates are rejected
        assert!(matches!(rt.group_add(g, 1), Err(Error::InvalidRank)));
        // so are ranks outside the job
        assert!(matches!(rt.group_add(g, 9), Err(Error::InvalidRank)));

        rt.group_commit(g, Timeout::from_millis(10_000)).unwrap();
        rt.barrier(g, Timeout::from_millis(10_000)).unwrap();

        // GROUP_ALL cannot be deleted
        assert!(matches!(rt.group_delete(GROUP_ALL), Err(Error::InvalidGroup)));

        rt.group_num()
    });

    for num in results {
        assert_eq!(num, 2);
    }
}

#[test]
fn test_dead_rank_poisons_collectives() {
    let results = run_job(3, ports(10), |rt| {
        let rank = rt.rank();

        // one clean barrier so endpoints and groups are established
        rt.barrier(GROUP_ALL, Timeout::from_millis(15_000)).unwrap();

        if rank == 2 {
            // this rank dies here; its device closes every peer socket
            return (rank, true, true);
        }

        std::thread::sleep(Duration::from_millis(500));

        // the job-wide barrier can no longer complete; rank 1 posts
        // toward the dead rank and must see the device failure
        let mut saw_failure = false;
        for _ in 0..20 {
            match rt.barrier(GROUP_ALL, Timeout::from_millis(100)) {
                Err(Error::Device) => {
                    saw_failure = true;
                    break;
                }
                Err(Error::Timeout) => continue,
                other => panic!("unexpected barrier outcome: {other:?}"),
            }
        }
        if rank == 1 {
            assert!(saw_failure, "rank 1 must observe the dead peer");
            assert!(!rt.queue_healthy(2));
        }

        // survivors regroup and synchronize without the dead rank
        let g = subgroup(&rt, &[0, 1]);
        let ok = rt.barrier(g, Timeout::from_millis(15_000)).is_ok();
        (rank, saw_failure || rank == 0, ok)
    });

    for (rank, observed, regrouped) in results {
        assert!(observed, "rank {rank}");
        assert!(regrouped, "rank {rank}");
    }
}

#[test]
fn test_control_plane_surface() {
    let results = run_job(2, ports(11), |rt| {
        let peer = 1 - rt.rank();

        rt.ping(peer, Timeout::from_millis(10_000)).unwrap();

        // install a descriptor on the peer and wait for ours to arrive
        let desc = hydra::SegmentDesc {
            rank: rt.rank(),
            seg_id: 3,
            addr: 0x1000 + u64::from(rt.rank()),
            size: 4096,
            notif_addr: 0,
        };
        rt.segment_register(peer, desc, Timeout::from_millis(10_000))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let foreign = loop {
            if let Some(d) = rt.segment_lookup(3, peer) {
                break d;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(foreign.addr, 0x1000 + u64::from(peer));

        // a fresh queue, announced job-wide
        let num = rt.queue_create(Timeout::from_millis(10_000)).unwrap();
        assert!(num >= 1);

        // allgather over the side network
        let src = [rt.rank() as u8 + 10];
        let mut recv = [0u8; 2];
        rt.allgather(GROUP_ALL, &src, &mut recv, Timeout::from_millis(10_000))
            .unwrap();
        let mut got = recv.to_vec();
        got.sort_unstable();
        assert_eq!(got, vec![10, 11]);

        rt.barrier(GROUP_ALL, Timeout::from_millis(10_000)).unwrap();
        true
    });

    assert!(results.into_iter().all(|ok| ok));
}

//! Bootstrap topology dissemination.
//!
//! Rank 0 holds the host table; it spreads through the job by recursive
//! doubling: in step `k` (mask `2^k`) a rank whose `mask` bit is set
//! receives from `rank - mask`, everyone else sends to `rank + mask`
//! while that target exists. The handshake runs on its own port
//! (`sn_port + 64 + offset`), one short-lived connection per edge.

use tracing::{debug, info, warn};

use hydra_wire::sn::{
    decode_topology, encode_topology, CdHeader, HostRecord, SnOp, CD_HEADER_SIZE,
};
use hydra_wire::{HOST_RECORD_SIZE, TOPOLOGY_PORT_OFFSET};

use crate::config::Config;
use crate::sn::client::{connect_to_port, read_full, write_full};
use crate::sync::Timeout;
use crate::{Error, Result};

/// The resolved topology: this process's rank, the job size, and one
/// host record per rank.
pub(crate) struct Topology {
    pub rank: u16,
    pub tnc: u16,
    pub hosts: Vec<HostRecord>,
}

/// Run the broadcast. The master enters with the full table; workers
/// receive theirs, then both forward down the tree.
pub(crate) fn broadcast(config: &Config) -> Result<Topology> {
    let rank = config.rank;

    let (tnc, hosts, mut mask) = if rank == 0 {
        if config.hosts.is_empty() {
            return Err(Error::Protocol("master has no host table".into()));
        }

        // An empty host entry means "this host".
        let local = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into());

        let hosts: Vec<HostRecord> = config
            .hosts
            .iter()
            .map(|h| {
                let name = if h.host.is_empty() { &local } else { &h.host };
                HostRecord::new(name.clone(), h.offset)
            })
            .collect();
        let tnc = hosts.len() as u16;

        let mut mask = 1u32;
        while mask <= u32::from(tnc) {
            mask <<= 1;
        }
        (tnc, hosts, mask >> 1)
    } else {
        let (tnc, hosts) = receive(config)?;
        // lowest set bit: the edge we received on
        let mask = u32::from(rank) & u32::from(rank).wrapping_neg();
        (tnc, hosts, mask >> 1)
    };

    while mask > 0 {
        let dst = u32::from(rank) + mask;
        if dst < u32::from(tnc) {
            send(config, &hosts, dst as u16, tnc)?;
        }
        mask >>= 1;
    }

    info!(rank, tnc, "topology resolved");
    Ok(Topology { rank, tnc, hosts })
}

/// Wait for the broadcast on our topology port.
fn receive(config: &Config) -> Result<(u16, Vec<HostRecord>)> {
    let port = config.sn_port + TOPOLOGY_PORT_OFFSET + u16::from(config.local_offset);
    let listener = crate::sn::server::bind(port)?;

    debug!(rank = config.rank, port, "waiting for topology");
    let deadline = Timeout::from_millis(config.conn_timeout_ms).deadline();
    let mut stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if deadline.expired() {
                    return Err(Error::Timeout);
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) => return Err(Error::Io(e)),
        }
    };
    stream.set_nonblocking(false)?;

    let mut hdr = [0u8; CD_HEADER_SIZE];
    read_full(&mut stream, &mut hdr)?;
    let cdh = CdHeader::from_bytes(&hdr)?;

    if cdh.op != SnOp::Topology {
        return Err(Error::Protocol(format!("unexpected op {:?}", cdh.op)));
    }
    if cdh.rank != u32::from(config.rank) {
        warn!(
            expected = config.rank,
            got = cdh.rank,
            "topology names a different rank"
        );
    }

    let tnc = cdh.tnc as usize;
    let mut body = vec![0u8; tnc * HOST_RECORD_SIZE];
    read_full(&mut stream, &mut body)?;
    let hosts = decode_topology(&body, tnc)?;

    Ok((tnc as u16, hosts))
}

/// Push the table to `dst`'s topology port.
fn send(config: &Config, hosts: &[HostRecord], dst: u16, tnc: u16) -> Result<()> {
    let entry = &hosts[dst as usize];
    let port = config.sn_port + TOPOLOGY_PORT_OFFSET + u16::from(entry.port_offset);

    let deadline = Timeout::from_millis(config.conn_timeout_ms).deadline();
    let mut stream = connect_to_port(&entry.hostname, port, &deadline)?;

    let mut cdh = CdHeader::new(SnOp::Topology);
    cdh.op_len = u32::from(tnc) * HOST_RECORD_SIZE as u32;
    cdh.rank = u32::from(dst);
    cdh.tnc = u32::from(tnc);
    write_full(&mut stream, &cdh.to_bytes())?;
    write_full(&mut stream, &encode_topology(hosts))?;

    debug!(rank = config.rank, dst, "topology forwarded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four ranks on localhost; every rank must end with the same table.
    #[test]
    fn test_broadcast_four_ranks() {
        let tnc = 4u16;
        let base_port = 33200;

        let mut configs: Vec<Config> = (0..tnc)
            .map(|r| {
                let mut c = if r == 0 {
                    Config::master(
                        (0..tnc).map(|i| ("127.0.0.1".to_string(), i as u8)).collect(),
                    )
                } else {
                    Config::worker(r, r as u8)
                };
                c.sn_port = base_port;
                c
            })
            .collect();

        // workers first so their listeners are up before the master sends
        let workers: Vec<_> = configs
            .split_off(1)
            .into_iter()
            .map(|c| std::thread::spawn(move || broadcast(&c).unwrap()))
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let master = broadcast(&configs[0]).unwrap();
        assert_eq!(master.rank, 0);
        assert_eq!(master.tnc, tnc);

        for (i, w) in workers.into_iter().enumerate() {
            let topo = w.join().unwrap();
            assert_eq!(topo.rank, i as u16 + 1);
            assert_eq!(topo.tnc, tnc);
            assert_eq!(topo.hosts, master.hosts);
        }
    }
}

//! The side-network server loop.
//!
//! One thread per process accepts short-lived control connections and
//! services them from an epoll loop. Each connection is a header/body
//! state machine: collect a 64-byte [`CdHeader`], act on the op, and for
//! ops with a body collect that too before replying.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};
use tracing::{debug, info, warn};

use hydra_wire::sn::{
    CdHeader, GroupDesc, MsegDesc, RcInfo, SnOp, CD_HEADER_SIZE, RC_INFO_SIZE,
};
use hydra_wire::MAX_GROUPS;

use crate::ctx::{Ctx, SegmentDesc, EP_CONNECTED, EP_DISCONNECTED};
use crate::{Error, Result};

const LISTENER_TOKEN: u64 = u64::MAX;
const WAIT_MS: u16 = 250;

/// How long a group-connect request may wait for the group to appear.
const GRP_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy)]
enum Phase {
    Header,
    Body(SnOp),
}

struct SnConn {
    stream: TcpStream,
    phase: Phase,
    buf: Vec<u8>,
    done: usize,
}

impl SnConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            phase: Phase::Header,
            buf: vec![0u8; CD_HEADER_SIZE],
            done: 0,
        }
    }

    fn expect(&mut self, phase: Phase, len: usize) {
        self.phase = phase;
        self.buf.resize(len, 0);
        self.done = 0;
    }
}

/// Bind the side-network port. Done before spawning so a taken port
/// surfaces as an error at init.
pub(crate) fn bind(port: u16) -> Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(|_| Error::SnPort)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|_| Error::SnPort)?;
    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr).map_err(|_| Error::SnPort)?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(|_| Error::SnPort)?;

    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Spawn the server thread. It runs until `ctx.sn_stop` is raised.
pub(crate) fn spawn(ctx: Arc<Ctx>, listener: TcpListener) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("hydra-sn-{}", ctx.rank))
        .spawn(move || {
            if let Err(e) = serve(&ctx, listener) {
                warn!("side-network loop ended: {e}");
            }
        })
        .expect("spawn side-network thread")
}

fn serve(ctx: &Ctx, listener: TcpListener) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(|_| Error::SnPort)?;
    epoll
        .add(
            listener.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, LISTENER_TOKEN),
        )
        .map_err(|_| Error::SnPort)?;

    let mut conns: Vec<Option<SnConn>> = Vec::new();
    let mut events = [EpollEvent::empty(); 64];

    info!(rank = ctx.rank, "side network ready");

    while !ctx.sn_stop.load(Ordering::Acquire) {
        let n = match epoll.wait(&mut events, EpollTimeout::from(WAIT_MS)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("side-network wait failed: {e}");
                break;
            }
        };

        for ev in events.iter().take(n) {
            let token = ev.data();
            let flags = ev.events();

            if token == LISTENER_TOKEN {
                accept_new(&listener, &epoll, &mut conns);
                continue;
            }

            let slot = token as usize;
            if conns.get(slot).map(|c| c.is_none()).unwrap_or(true) {
                continue;
            }

            let drop_conn = flags
                .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP)
                || (flags.contains(EpollFlags::EPOLLIN) && !advance(ctx, &mut conns, slot));

            if drop_conn {
                if let Some(conn) = conns[slot].take() {
                    let _ = epoll.delete(conn.stream.as_fd());
                }
            }
        }
    }

    Ok(())
}

fn accept_new(listener: &TcpListener, epoll: &Epoll, conns: &mut Vec<Option<SnConn>>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(true).is_err() || stream.set_nodelay(true).is_err() {
                    continue;
                }
                let slot = conns.iter().position(|c| c.is_none()).unwrap_or_else(|| {
                    conns.push(None);
                    conns.len() - 1
                });
                if epoll
                    .add(
                        stream.as_fd(),
                        EpollEvent::new(
                            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
                            slot as u64,
                        ),
                    )
                    .is_ok()
                {
                    conns[slot] = Some(SnConn::new(stream));
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("side-network accept failed: {e}");
                break;
            }
        }
    }
}

/// Pump one connection. Returns false when it should be dropped.
fn advance(ctx: &Ctx, conns: &mut [Option<SnConn>], slot: usize) -> bool {
    loop {
        let conn = conns[slot].as_mut().expect("live connection");
        let remaining = conn.buf.len() - conn.done;

        if remaining > 0 {
            let done = conn.done;
            match conn.stream.read(&mut conn.buf[done..]) {
                Ok(0) => return false,
                Ok(n) => conn.done += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("side-network read failed: {e}");
                    return false;
                }
            }
        }

        let conn = conns[slot].as_mut().expect("live connection");
        if conn.done < conn.buf.len() {
            continue;
        }

        let ok = match conn.phase {
            Phase::Header => on_header(ctx, conn),
            Phase::Body(op) => on_body(ctx, conn, op),
        };
        if !ok {
            return false;
        }
    }
}

fn on_header(ctx: &Ctx, conn: &mut SnConn) -> bool {
    let cdh = match CdHeader::from_bytes(&conn.buf) {
        Ok(cdh) => cdh,
        Err(e) => {
            warn!("bad control header: {e}");
            return false;
        }
    };

    match cdh.op {
        SnOp::ProcKill => {
            warn!(rank = ctx.rank, "kill requested, exiting");
            std::process::exit(255);
        }

        SnOp::ProcPing => {
            conn.expect(Phase::Header, CD_HEADER_SIZE);
            true
        }

        SnOp::Disconnect => {
            let peer = cdh.rank as usize;
            if peer < ctx.tnc as usize
                && ctx.ep_status[peer].load(Ordering::Acquire) == EP_CONNECTED
            {
                ctx.ep_status[peer].store(EP_DISCONNECTED, Ordering::Release);
                debug!(peer, "endpoint disconnected on request");
            }
            conn.expect(Phase::Header, CD_HEADER_SIZE);
            true
        }

        SnOp::Connect => {
            conn.expect(Phase::Body(SnOp::Connect), RC_INFO_SIZE);
            true
        }

        SnOp::QueueCreate => {
            conn.expect(Phase::Body(SnOp::QueueCreate), RC_INFO_SIZE);
            true
        }

        SnOp::GrpCheck => {
            let reply = group_check(ctx, cdh.rank as usize, cdh.tnc as i32);
            if write_reply(conn, &reply.to_bytes()).is_err() {
                return false;
            }
            conn.expect(Phase::Header, CD_HEADER_SIZE);
            true
        }

        SnOp::GrpConnect => {
            let Some(desc) = group_desc(ctx, cdh.ret) else {
                warn!(group = cdh.ret, "group connect for unknown group");
                return false;
            };
            if write_reply(conn, &desc.to_bytes()).is_err() {
                return false;
            }
            conn.expect(Phase::Header, CD_HEADER_SIZE);
            true
        }

        SnOp::SegRegister => {
            let desc = SegmentDesc {
                rank: cdh.rank as u16,
                seg_id: cdh.seg_id as u8,
                addr: cdh.addr,
                size: cdh.size,
                notif_addr: cdh.notif_addr,
            };
            ctx.segments
                .lock()
                .insert((desc.seg_id, desc.rank), desc);

            if write_reply(conn, &0i32.to_le_bytes()).is_err() {
                return false;
            }
            conn.expect(Phase::Header, CD_HEADER_SIZE);
            true
        }

        SnOp::Topology => {
            warn!("topology record on the command port");
            false
        }
    }
}

fn on_body(ctx: &Ctx, conn: &mut SnConn, op: SnOp) -> bool {
    match op {
        SnOp::Connect => {
            let Ok(remote) = RcInfo::from_bytes(&conn.buf) else {
                return false;
            };

            wait_device(ctx);
            if (remote.rank as usize) < ctx.tnc as usize {
                ctx.ep_status[remote.rank as usize].store(EP_CONNECTED, Ordering::Release);
            }

            let local = RcInfo {
                rank: ctx.rank,
                dev_port: ctx.device.local_port(),
            };
            if write_reply(conn, &local.to_bytes()).is_err() {
                return false;
            }
            debug!(peer = remote.rank, "endpoint connected on request");
        }

        SnOp::QueueCreate => {
            wait_device(ctx);
            if write_reply(conn, &0i32.to_le_bytes()).is_err() {
                return false;
            }
        }

        _ => return false,
    }

    conn.expect(Phase::Header, CD_HEADER_SIZE);
    true
}

/// Reply to a group check: our checksum when we hold a matching group,
/// `ret = -1` otherwise (the peer backs off and retries).
fn group_check(ctx: &Ctx, group: usize, tnc_g: i32) -> GroupDesc {
    let mut reply = GroupDesc {
        group: group as i32,
        tnc: tnc_g,
        cs: 0,
        ret: -1,
    };

    if group >= MAX_GROUPS {
        return reply;
    }

    let slot = &ctx.groups[group];
    let _del = slot.del.lock();
    if let Some(state) = slot.state.read().as_ref() {
        if state.members.len() == tnc_g as usize {
            reply.ret = 0;
            reply.cs = state.checksum();
        }
    }
    reply
}

/// Our staging descriptor for `group`, waiting briefly for init races:
/// the peer may commit before our own create has finished.
fn group_desc(ctx: &Ctx, group: i32) -> Option<MsegDesc> {
    if group < 0 || group as usize >= MAX_GROUPS {
        return None;
    }
    let slot = &ctx.groups[group as usize];

    let t0 = std::time::Instant::now();
    loop {
        if ctx.dev_init.load(Ordering::Acquire) {
            if let Some(state) = slot.state.read().as_ref() {
                return Some(MsegDesc {
                    addr: state.local.addr(),
                    size: state.local.len() as u64,
                    notif_addr: 0,
                });
            }
        }
        if t0.elapsed() > GRP_WAIT {
            return None;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn wait_device(ctx: &Ctx) {
    while !ctx.dev_init.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Write a reply to a non-blocking control socket in full.
fn write_reply(conn: &mut SnConn, buf: &[u8]) -> std::io::Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        match conn.stream.write(&buf[done..]) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => done += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::hint::spin_loop();
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

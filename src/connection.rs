//! Per-session protocol engine: SOCKS5 negotiation, outbound dial,
//! bidirectional relay, and deterministic teardown on every exit path.
//!
//! Each `Connection` is reference-counted (`Rc<RefCell<_>>`) because its two
//! fds raise events independently and each event-core callback needs shared
//! access to the same session state; this crate is single-threaded so a
//! `RefCell` is enough, no atomics or mutexes.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::addr::SocketAddress;
use crate::balancer::{Balancer, Family, InterfaceRef};
use crate::error::{self, ErrorKind};
use crate::event::{EventCore, Interest, SourceId};
use crate::socket::SocketHandle;
use crate::socks;

const RELAY_BUF_CAP: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accepted,
    MethodSelect,
    RequestRead,
    Acquire,
    Dialing,
    DialingWait,
    ReplySuccess,
    Relaying,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Upstream,
}

/// A bounded byte queue; `8 KiB` per direction bounds memory per session.
struct RelayBuf {
    data: Vec<u8>,
    cap: usize,
}

impl RelayBuf {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            cap,
        }
    }

    fn is_full(&self) -> bool {
        self.data.len() >= self.cap
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn free_space(&self) -> usize {
        self.cap.saturating_sub(self.data.len())
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn front_slice(&self) -> &[u8] {
        &self.data
    }

    fn consume(&mut self, n: usize) {
        self.data.drain(..n);
    }
}

struct Connection {
    phase: Phase,
    client: Option<SocketHandle>,
    client_source: Option<SourceId>,
    peer: SocketAddress,
    upstream: Option<SocketHandle>,
    upstream_source: Option<SourceId>,
    reserved: Option<InterfaceRef>,

    recv_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// Set while leaving `MethodSelect`: whether to continue to
    /// `RequestRead` or close after the `0x05 0xFF` reply drains.
    method_ok: bool,

    buf_c2u: RelayBuf,
    buf_u2c: RelayBuf,
    c2u_src_eof: bool,
    u2c_src_eof: bool,
    c2u_sink_half_closed: bool,
    u2c_sink_half_closed: bool,

    torn_down: bool,
}

/// Accepts ownership of a freshly-accepted client socket and begins the
/// SOCKS5 handshake. Mirrors the `Accepted` phase's entry action: arm a
/// read on the client fd for the greeting.
pub fn start(
    core: &mut EventCore,
    balancer: Rc<RefCell<Balancer>>,
    client: SocketHandle,
    peer: SocketAddress,
) {
    let conn = Connection {
        phase: Phase::Accepted,
        client: Some(client),
        client_source: None,
        peer,
        upstream: None,
        upstream_source: None,
        reserved: None,
        recv_buf: Vec::with_capacity(64),
        write_buf: Vec::new(),
        write_pos: 0,
        method_ok: false,
        buf_c2u: RelayBuf::new(RELAY_BUF_CAP),
        buf_u2c: RelayBuf::new(RELAY_BUF_CAP),
        c2u_src_eof: false,
        u2c_src_eof: false,
        c2u_sink_half_closed: false,
        u2c_sink_half_closed: false,
        torn_down: false,
    };
    let conn_rc = Rc::new(RefCell::new(conn));
    set_client_interest(&conn_rc, core, &balancer, Interest::READ);
}

fn set_client_interest(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    interest: Interest,
) {
    if interest.is_empty() {
        let id = conn_rc.borrow_mut().client_source.take();
        if let Some(id) = id {
            core.cancel(id);
        }
        return;
    }
    let existing = conn_rc.borrow().client_source;
    if let Some(id) = existing {
        core.reregister(id, interest).expect("reregister client fd");
        return;
    }
    let fd = conn_rc
        .borrow()
        .client
        .as_ref()
        .expect("client fd present while armed")
        .as_raw_fd();
    let conn2 = conn_rc.clone();
    let bal2 = balancer.clone();
    let id = core
        .register(fd, interest, move |core, ready| {
            dispatch(&conn2, core, &bal2, Side::Client, ready);
        })
        .expect("register client fd");
    conn_rc.borrow_mut().client_source = Some(id);
}

fn set_upstream_interest(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    interest: Interest,
) {
    if interest.is_empty() {
        let id = conn_rc.borrow_mut().upstream_source.take();
        if let Some(id) = id {
            core.cancel(id);
        }
        return;
    }
    let existing = conn_rc.borrow().upstream_source;
    if let Some(id) = existing {
        core.reregister(id, interest).expect("reregister upstream fd");
        return;
    }
    let fd = conn_rc
        .borrow()
        .upstream
        .as_ref()
        .expect("upstream fd present while armed")
        .as_raw_fd();
    let conn2 = conn_rc.clone();
    let bal2 = balancer.clone();
    let id = core
        .register(fd, interest, move |core, ready| {
            dispatch(&conn2, core, &bal2, Side::Upstream, ready);
        })
        .expect("register upstream fd");
    conn_rc.borrow_mut().upstream_source = Some(id);
}

fn dispatch(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    side: Side,
    ready: Interest,
) {
    let phase = conn_rc.borrow().phase;
    match phase {
        Phase::Accepted | Phase::RequestRead => on_client_read_phase(conn_rc, core, balancer, phase),
        Phase::MethodSelect | Phase::ReplySuccess => on_client_write_phase(conn_rc, core, balancer),
        Phase::DialingWait => on_dial_writable(conn_rc, core, balancer),
        Phase::Relaying => on_relay_ready(conn_rc, core, balancer, side, ready),
        Phase::Closing => on_closing_writable(conn_rc, core, balancer),
        Phase::Acquire | Phase::Dialing | Phase::Closed => {
            // Synchronous phases never leave a live registration pointing
            // here, and Closed has none at all.
        }
    }
}

fn on_client_read_phase(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    phase: Phase,
) {
    let mut tmp = [0u8; 512];
    loop {
        let res = {
            let conn = conn_rc.borrow();
            conn.client.as_ref().unwrap().read(&mut tmp)
        };
        match res {
            Ok(0) => {
                enter_closing(conn_rc, core, balancer, None);
                return;
            }
            Ok(n) => conn_rc.borrow_mut().recv_buf.extend_from_slice(&tmp[..n]),
            Err(e) if e.kind == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "client read error during handshake");
                enter_closing(conn_rc, core, balancer, None);
                return;
            }
        }
    }
    match phase {
        Phase::Accepted => try_finish_greeting(conn_rc, core, balancer),
        Phase::RequestRead => try_finish_request(conn_rc, core, balancer),
        _ => unreachable!("on_client_read_phase called outside a read phase"),
    }
}

fn try_finish_greeting(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    let parsed = {
        let conn = conn_rc.borrow();
        socks::try_parse_greeting(&conn.recv_buf)
    };
    match parsed {
        None => {} // keep waiting; client_source stays armed for more reads
        Some(Err(())) => {
            warn!("rejected greeting with unsupported SOCKS version");
            enter_closing(conn_rc, core, balancer, None);
        }
        Some(Ok((consumed, no_auth))) => {
            {
                let mut conn = conn_rc.borrow_mut();
                conn.recv_buf.drain(..consumed);
                conn.method_ok = no_auth;
                conn.write_buf = socks::method_reply(no_auth).to_vec();
                conn.write_pos = 0;
                conn.phase = Phase::MethodSelect;
            }
            set_client_interest(conn_rc, core, balancer, Interest::WRITE);
        }
    }
}

fn try_finish_request(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    let parsed = {
        let conn = conn_rc.borrow();
        socks::try_parse_request(&conn.recv_buf)
    };
    match parsed {
        None => {}
        Some(Err(req_err)) => {
            let reply = socks::connect_reply(req_err.reply_code(), socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
        }
        Some(Ok((consumed, dst))) => {
            conn_rc.borrow_mut().recv_buf.drain(..consumed);
            begin_acquire_and_dial(conn_rc, core, balancer, dst);
        }
    }
}

fn on_client_write_phase(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    loop {
        let done = {
            let conn = conn_rc.borrow();
            conn.write_pos >= conn.write_buf.len()
        };
        if done {
            break;
        }
        let res = {
            let conn = conn_rc.borrow();
            conn.client.as_ref().unwrap().write(&conn.write_buf[conn.write_pos..])
        };
        match res {
            Ok(0) => return,
            Ok(n) => conn_rc.borrow_mut().write_pos += n,
            Err(e) if e.kind == ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "client write error during handshake");
                enter_closing(conn_rc, core, balancer, None);
                return;
            }
        }
    }

    let phase = conn_rc.borrow().phase;
    match phase {
        Phase::MethodSelect => {
            let ok = conn_rc.borrow().method_ok;
            if ok {
                {
                    let mut conn = conn_rc.borrow_mut();
                    conn.recv_buf.clear();
                    conn.phase = Phase::RequestRead;
                }
                set_client_interest(conn_rc, core, balancer, Interest::READ);
            } else {
                enter_closing(conn_rc, core, balancer, None);
            }
        }
        Phase::ReplySuccess => start_relaying(conn_rc, core, balancer),
        _ => {}
    }
}

fn begin_acquire_and_dial(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    dst: SocketAddress,
) {
    conn_rc.borrow_mut().phase = Phase::Acquire;
    let family = Family::of(dst.host);
    let iface_ref = balancer.borrow_mut().acquire(family);
    let iface_ref = match iface_ref {
        None => {
            debug!(?family, "no outbound interface of matching family");
            let reply = socks::connect_reply(0x03, socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
            return;
        }
        Some(r) => r,
    };
    let source_host = balancer.borrow().source_of(iface_ref);
    conn_rc.borrow_mut().reserved = Some(iface_ref);
    conn_rc.borrow_mut().phase = Phase::Dialing;

    let local = SocketAddress::new(source_host, 0);
    let bound_socket = match SocketHandle::create_bound(local) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to create outbound socket");
            let code = error::socks_reply_code(e.kind);
            let reply = socks::connect_reply(code, socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
            return;
        }
    };

    match bound_socket.connect(dst) {
        Ok(()) => {
            conn_rc.borrow_mut().upstream = Some(bound_socket);
            finish_dial_success(conn_rc, core, balancer);
        }
        Err(e) if e.kind == ErrorKind::InProgress => {
            conn_rc.borrow_mut().upstream = Some(bound_socket);
            conn_rc.borrow_mut().phase = Phase::DialingWait;
            set_upstream_interest(conn_rc, core, balancer, Interest::WRITE);
        }
        Err(e) => {
            warn!(error = %e, "dial failed immediately");
            let code = error::socks_reply_code(e.kind);
            let reply = socks::connect_reply(code, socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
        }
    }
}

fn on_dial_writable(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    let pending = conn_rc.borrow().upstream.as_ref().unwrap().pending_error();
    match pending {
        Ok(()) => finish_dial_success(conn_rc, core, balancer),
        Err(e) => {
            warn!(error = %e, "dial failed after connect completion");
            let code = error::socks_reply_code(e.kind);
            let reply = socks::connect_reply(code, socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
        }
    }
}

fn finish_dial_success(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    let bound = conn_rc.borrow().upstream.as_ref().unwrap().local_address();
    let bound = match bound {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read bound address of upstream");
            let reply = socks::connect_reply(0x01, socks::unspecified_v4());
            enter_closing(conn_rc, core, balancer, Some(reply));
            return;
        }
    };
    let reply = socks::connect_reply(0x00, bound);
    {
        let mut conn = conn_rc.borrow_mut();
        conn.write_buf = reply;
        conn.write_pos = 0;
        conn.phase = Phase::ReplySuccess;
    }
    set_client_interest(conn_rc, core, balancer, Interest::WRITE);
}

fn start_relaying(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    conn_rc.borrow_mut().phase = Phase::Relaying;
    recompute_relay_interest(conn_rc, core, balancer);
}

fn recompute_relay_interest(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    let (client_interest, upstream_interest, done) = {
        let conn = conn_rc.borrow();
        if conn.phase != Phase::Relaying {
            return;
        }
        let client_interest = Interest {
            readable: !conn.buf_c2u.is_full() && !conn.c2u_src_eof,
            writable: !conn.buf_u2c.is_empty(),
        };
        let upstream_interest = Interest {
            readable: !conn.buf_u2c.is_full() && !conn.u2c_src_eof,
            writable: !conn.buf_c2u.is_empty(),
        };
        let done = conn.c2u_sink_half_closed && conn.u2c_sink_half_closed;
        (client_interest, upstream_interest, done)
    };
    if done {
        enter_closing(conn_rc, core, balancer, None);
        return;
    }
    set_client_interest(conn_rc, core, balancer, client_interest);
    set_upstream_interest(conn_rc, core, balancer, upstream_interest);
}

fn on_relay_ready(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    side: Side,
    ready: Interest,
) {
    if ready.readable && do_relay_read(conn_rc, side).is_err() {
        enter_closing(conn_rc, core, balancer, None);
        return;
    }
    if ready.writable && do_relay_write(conn_rc, side).is_err() {
        enter_closing(conn_rc, core, balancer, None);
        return;
    }
    recompute_relay_interest(conn_rc, core, balancer);
}

fn do_relay_read(conn_rc: &Rc<RefCell<Connection>>, side: Side) -> std::result::Result<(), ()> {
    let mut tmp = [0u8; 4096];
    loop {
        let (space, src_eof) = {
            let conn = conn_rc.borrow();
            match side {
                Side::Client => (conn.buf_c2u.free_space(), conn.c2u_src_eof),
                Side::Upstream => (conn.buf_u2c.free_space(), conn.u2c_src_eof),
            }
        };
        if src_eof || space == 0 {
            break;
        }
        let want = space.min(tmp.len());
        let res = {
            let conn = conn_rc.borrow();
            let handle = match side {
                Side::Client => conn.client.as_ref(),
                Side::Upstream => conn.upstream.as_ref(),
            };
            handle.unwrap().read(&mut tmp[..want])
        };
        match res {
            Ok(0) => {
                let mut conn = conn_rc.borrow_mut();
                match side {
                    Side::Client => conn.c2u_src_eof = true,
                    Side::Upstream => conn.u2c_src_eof = true,
                }
                break;
            }
            Ok(n) => {
                let mut conn = conn_rc.borrow_mut();
                match side {
                    Side::Client => conn.buf_c2u.push(&tmp[..n]),
                    Side::Upstream => conn.buf_u2c.push(&tmp[..n]),
                }
            }
            Err(e) if e.kind == ErrorKind::WouldBlock => break,
            Err(_e) => return Err(()),
        }
    }
    maybe_half_close_sink(conn_rc, side);
    Ok(())
}

fn do_relay_write(conn_rc: &Rc<RefCell<Connection>>, side: Side) -> std::result::Result<(), ()> {
    loop {
        let write_result = {
            let conn = conn_rc.borrow();
            let (buf, handle) = match side {
                Side::Client => (&conn.buf_u2c, conn.client.as_ref()),
                Side::Upstream => (&conn.buf_c2u, conn.upstream.as_ref()),
            };
            if buf.is_empty() {
                None
            } else {
                Some(handle.unwrap().write(buf.front_slice()))
            }
        };
        match write_result {
            None => break,
            Some(Ok(0)) => break,
            Some(Ok(n)) => {
                let mut conn = conn_rc.borrow_mut();
                match side {
                    Side::Client => conn.buf_u2c.consume(n),
                    Side::Upstream => conn.buf_c2u.consume(n),
                }
            }
            Some(Err(e)) if e.kind == ErrorKind::WouldBlock => break,
            Some(Err(_e)) => return Err(()),
        }
    }
    // The sink we just drained belongs to the *other* direction's source.
    let sink_owner = match side {
        Side::Client => Side::Upstream,
        Side::Upstream => Side::Client,
    };
    maybe_half_close_sink(conn_rc, sink_owner);
    Ok(())
}

/// Once a direction's source has hit EOF and its buffer has fully drained,
/// shuts down the write half of its sink so the peer EOF is forwarded.
fn maybe_half_close_sink(conn_rc: &Rc<RefCell<Connection>>, src_side: Side) {
    let mut conn = conn_rc.borrow_mut();
    match src_side {
        Side::Client => {
            if conn.c2u_src_eof && conn.buf_c2u.is_empty() && !conn.c2u_sink_half_closed {
                if let Some(up) = conn.upstream.as_ref() {
                    let _ = up.shutdown_write();
                }
                conn.c2u_sink_half_closed = true;
            }
        }
        Side::Upstream => {
            if conn.u2c_src_eof && conn.buf_u2c.is_empty() && !conn.u2c_sink_half_closed {
                if let Some(c) = conn.client.as_ref() {
                    let _ = c.shutdown_write();
                }
                conn.u2c_sink_half_closed = true;
            }
        }
    }
}

fn on_closing_writable(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
) {
    loop {
        let done = {
            let conn = conn_rc.borrow();
            conn.write_pos >= conn.write_buf.len()
        };
        if done {
            break;
        }
        let res = {
            let conn = conn_rc.borrow();
            conn.client.as_ref().unwrap().write(&conn.write_buf[conn.write_pos..])
        };
        match res {
            Ok(0) => break,
            Ok(n) => conn_rc.borrow_mut().write_pos += n,
            Err(e) if e.kind == ErrorKind::WouldBlock => return,
            Err(_e) => break,
        }
    }
    teardown(conn_rc, core, balancer);
}

/// Transitions to `Closing`. `reply`, if given, is flushed over the client
/// socket (best-effort) before teardown; `None` means close immediately.
fn enter_closing(
    conn_rc: &Rc<RefCell<Connection>>,
    core: &mut EventCore,
    balancer: &Rc<RefCell<Balancer>>,
    reply: Option<Vec<u8>>,
) {
    {
        let mut conn = conn_rc.borrow_mut();
        if conn.phase == Phase::Closing || conn.phase == Phase::Closed {
            return;
        }
        conn.phase = Phase::Closing;
    }
    let upstream_id = conn_rc.borrow_mut().upstream_source.take();
    if let Some(id) = upstream_id {
        core.cancel(id);
    }

    let has_client = conn_rc.borrow().client.is_some();
    match reply {
        Some(bytes) if !bytes.is_empty() && has_client => {
            {
                let mut conn = conn_rc.borrow_mut();
                conn.write_buf = bytes;
                conn.write_pos = 0;
            }
            set_client_interest(conn_rc, core, balancer, Interest::WRITE);
        }
        _ => teardown(conn_rc, core, balancer),
    }
}

/// Closes both fds and releases any outstanding reservation, exactly once.
fn teardown(conn_rc: &Rc<RefCell<Connection>>, core: &mut EventCore, balancer: &Rc<RefCell<Balancer>>) {
    let mut conn = conn_rc.borrow_mut();
    if conn.torn_down {
        return;
    }
    if let Some(id) = conn.client_source.take() {
        core.cancel(id);
    }
    if let Some(id) = conn.upstream_source.take() {
        core.cancel(id);
    }
    if let Some(client) = conn.client.take() {
        client.close();
    }
    if let Some(upstream) = conn.upstream.take() {
        upstream.close();
    }
    if let Some(iface_ref) = conn.reserved.take() {
        balancer.borrow_mut().release(iface_ref);
    }
    debug!(peer = %conn.peer, "connection closed");
    conn.phase = Phase::Closed;
    conn.torn_down = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_buf_bounds_capacity() {
        let mut b = RelayBuf::new(4);
        assert!(!b.is_full());
        b.push(&[1, 2, 3, 4]);
        assert!(b.is_full());
        assert_eq!(b.free_space(), 0);
        b.consume(2);
        assert_eq!(b.free_space(), 2);
        assert_eq!(b.front_slice(), &[3, 4]);
    }

    #[test]
    fn relay_buf_empty_after_full_consume() {
        let mut b = RelayBuf::new(8);
        b.push(&[9, 9]);
        assert!(!b.is_empty());
        b.consume(2);
        assert!(b.is_empty());
    }
}

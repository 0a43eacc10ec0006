//! Inbound endpoint: binds a SOCKS5 listen socket and spawns a `Connection`
//! per accepted client.

use std::cell::RefCell;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use tracing::{info, warn};

use crate::addr::SocketAddress;
use crate::balancer::Balancer;
use crate::connection;
use crate::error::{ErrorKind, Result};
use crate::event::{EventCore, Interest};
use crate::socket::SocketHandle;

/// Keeps the listening fd alive for the process lifetime; the accept
/// closure registered with the event core holds its own clone.
pub struct Listener {
    _handle: Rc<SocketHandle>,
}

impl Listener {
    /// Binds `local` and arms the accept loop on the event core.
    pub fn bind(core: &mut EventCore, balancer: Rc<RefCell<Balancer>>, local: SocketAddress) -> Result<Listener> {
        let handle = Rc::new(SocketHandle::create_listener(local)?);
        let fd = handle.as_raw_fd();
        let handle2 = handle.clone();
        core.register(fd, Interest::READ, move |core, _ready| {
            accept_loop(&handle2, core, &balancer, local);
        })
        .map_err(crate::error::Error::from)?;
        info!(addr = %local, "listening");
        Ok(Listener { _handle: handle })
    }
}

fn accept_loop(listener: &Rc<SocketHandle>, core: &mut EventCore, balancer: &Rc<RefCell<Balancer>>, local: SocketAddress) {
    loop {
        match listener.accept() {
            Ok((client, peer)) => {
                info!(%peer, listen = %local, "accepted connection");
                connection::start(core, balancer.clone(), client, peer);
            }
            Err(e) if e.kind == ErrorKind::WouldBlock => break,
            Err(e) => {
                // Transient accept failures (e.g. EMFILE/ENFILE) are logged
                // and dropped; the listener stays armed for the next readable.
                warn!(error = %e, listen = %local, "accept error");
                break;
            }
        }
    }
}

//! Startup wiring: builds the interface pool, binds the configured listen
//! endpoints, then hands control to the event core until it runs dry.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::addr::{self, HostAddress, SocketAddress};
use crate::balancer::{Balancer, Interface, InterfacePool};
use crate::error::{Error, ErrorKind, Result};
use crate::event::EventCore;
use crate::listener::Listener;

pub struct Supervisor {
    core: EventCore,
    balancer: Rc<RefCell<Balancer>>,
    listeners: Vec<Listener>,
}

impl Supervisor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: EventCore::new().map_err(Error::from)?,
            balancer: Rc::new(RefCell::new(Balancer::new(InterfacePool::new()))),
            listeners: Vec::new(),
        })
    }

    pub fn add_interface(&mut self, source: HostAddress, metric: u32) {
        info!(
            source = %addr::format_host(source),
            metric,
            "configured outbound interface"
        );
        self.balancer.borrow_mut().add(Interface::new(source, metric));
    }

    pub fn bind(&mut self, local: SocketAddress) -> Result<()> {
        let listener = Listener::bind(&mut self.core, self.balancer.clone(), local)?;
        self.listeners.push(listener);
        Ok(())
    }

    /// Runs the event core until every connection and listener is gone.
    /// Listeners never cancel themselves, so in practice this runs forever.
    pub fn run(mut self) -> Result<()> {
        if self.balancer.borrow().pool().is_empty() {
            return Err(Error::new(
                ErrorKind::Generic,
                "no outbound interfaces configured",
            ));
        }
        if self.listeners.is_empty() {
            return Err(Error::new(ErrorKind::Generic, "no listen endpoints bound"));
        }
        self.core.run().map_err(Error::from)
    }
}

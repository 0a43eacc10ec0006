//! Single-threaded, cooperative, readiness-based event core.
//!
//! Wraps `mio::Poll` the way monoio's legacy driver wraps it for its
//! `LegacyDriver`, but dispatches plain callbacks instead of waking async
//! tasks: `register` files a closure under the fd's source id, `run` loops
//! `mio::Poll::poll` and invokes callbacks serially until no sources remain.
//! One fd carries at most one registration (mio's epoll backend rejects a
//! second `register` on the same fd), so a single callback fields both
//! read- and write-readiness for a socket that needs both.

use std::io;
use std::os::unix::io::RawFd;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use rustc_hash::FxHashMap;

use crate::slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn both() -> Interest {
        Interest {
            readable: true,
            writable: true,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    fn to_mio(self) -> Option<mio::Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub type SourceId = usize;

type Callback = Box<dyn FnMut(&mut EventCore, Interest)>;

struct Source {
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

/// The process-wide scheduler, owned by the Supervisor and threaded through
/// explicitly rather than kept behind a global.
pub struct EventCore {
    poll: Poll,
    events: Events,
    sources: Slab<Source>,
    by_fd: FxHashMap<RawFd, SourceId>,
    cancelled_this_pass: Vec<SourceId>,
}

impl EventCore {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            sources: Slab::new(),
            by_fd: FxHashMap::default(),
            cancelled_this_pass: Vec::new(),
        })
    }

    /// Registers `fd` for `interest`, invoking `callback` on matching
    /// readiness. Calling this again for an already-registered `fd` replaces
    /// both its interest and its callback and returns the same source id.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(&mut EventCore, Interest) + 'static,
    ) -> io::Result<SourceId> {
        if let Some(&id) = self.by_fd.get(&fd) {
            let source = self.sources.get_mut(id).expect("fd map out of sync");
            source.interest = interest;
            source.callback = Box::new(callback);
            if let Some(mio_interest) = interest.to_mio() {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(id), mio_interest)?;
            }
            return Ok(id);
        }

        let id = self.sources.insert(Source {
            fd,
            interest,
            callback: Box::new(callback),
        });
        if let Some(mio_interest) = interest.to_mio() {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(id), mio_interest)?;
        }
        self.by_fd.insert(fd, id);
        Ok(id)
    }

    /// Replaces the interest for an existing source without touching its
    /// callback.
    pub fn reregister(&mut self, id: SourceId, interest: Interest) -> io::Result<()> {
        let fd = {
            let source = self
                .sources
                .get_mut(id)
                .unwrap_or_else(|| panic!("reregister of unknown source {id}"));
            source.interest = interest;
            source.fd
        };
        if let Some(mio_interest) = interest.to_mio() {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), Token(id), mio_interest)?;
        }
        Ok(())
    }

    /// Removes the callback for `id`. Guaranteed not to fire after this
    /// returns, even if already queued in the current `poll` batch.
    pub fn cancel(&mut self, id: SourceId) {
        if let Some(source) = self.sources.try_remove(id) {
            let _ = self.poll.registry().deregister(&mut SourceFd(&source.fd));
            self.by_fd.remove(&source.fd);
        }
        self.cancelled_this_pass.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Loops until no sources remain, dispatching callbacks one at a time.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.sources.is_empty() {
            self.turn()?;
        }
        Ok(())
    }

    /// Runs a single poll-and-dispatch cycle; exposed for tests.
    pub fn turn(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, None)?;
        self.cancelled_this_pass.clear();

        let ready: Vec<(Token, Interest)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    Interest {
                        readable: e.is_readable(),
                        writable: e.is_writable(),
                    },
                )
            })
            .collect();

        for (Token(id), fired) in ready {
            if self.cancelled_this_pass.contains(&id) {
                continue;
            }
            let mut callback = match self.sources.get_mut(id) {
                Some(source) => std::mem::replace(&mut source.callback, Box::new(|_, _| {})),
                None => continue,
            };
            callback(self, fired);
            if self.cancelled_this_pass.contains(&id) {
                continue;
            }
            if let Some(source) = self.sources.get_mut(id) {
                source.callback = callback;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    #[test]
    fn fires_callback_on_readable_and_can_be_cancelled() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let mut core = EventCore::new().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let fired2 = fired.clone();
        let id = core
            .register(fd, Interest::READ, move |_core, ready| {
                assert!(ready.readable);
                *fired2.borrow_mut() += 1;
            })
            .unwrap();

        a.write_all(b"x").unwrap();
        core.turn().unwrap();
        assert_eq!(*fired.borrow(), 1);
        core.cancel(id);
        assert!(core.is_empty());
    }

    #[test]
    fn reregistering_same_fd_reuses_source_id() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let mut core = EventCore::new().unwrap();
        let id1 = core.register(fd, Interest::READ, |_, _| {}).unwrap();
        let id2 = core.register(fd, Interest::both(), |_, _| {}).unwrap();
        assert_eq!(id1, id2);

        a.write_all(b"x").unwrap();
        core.turn().unwrap();
        core.cancel(id1);
        assert!(core.is_empty());
    }

    #[test]
    fn run_returns_once_last_source_is_cancelled() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let mut core = EventCore::new().unwrap();
        let id_cell: Rc<RefCell<Option<SourceId>>> = Rc::new(RefCell::new(None));
        let id_cell2 = id_cell.clone();
        let id = core
            .register(fd, Interest::READ, move |core, _ready| {
                let id = id_cell2.borrow().unwrap();
                core.cancel(id);
            })
            .unwrap();
        *id_cell.borrow_mut() = Some(id);

        a.write_all(b"x").unwrap();
        core.run().unwrap();
        assert!(core.is_empty());
    }
}

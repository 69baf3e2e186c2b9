//! The poll-based event loop.
//!
//! One serving thread owns the listening socket, every connection, and
//! the keyspace. Each tick builds a poll set from what the connections
//! want (read or write), blocks until readiness or the nearest timer,
//! then services sockets, reaps expired keys, and tears down timed-out
//! connections. Connections live on exactly one of three timeout queues
//! matching their current expectation; the queues are FIFO by last
//! activity, so each front is the next deadline.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::poll::{PollFd, PollFlags, poll};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::buf::Buf;
use crate::clock::now_ms;
use crate::commands::{Shared, dispatch};
use crate::list::{DList, LinkId};
use crate::protocol::{parse_request, peek_frame};

const BACKLOG: i32 = 128;
const READ_CHUNK: usize = 64 * 1024;

const IDLE_TIMEOUT_MS: u64 = 5000;
const READ_TIMEOUT_MS: u64 = 5000;
const WRITE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            threads: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Idle,
    Read,
    Write,
}

impl Queue {
    fn timeout_ms(self) -> u64 {
        match self {
            Queue::Idle => IDLE_TIMEOUT_MS,
            Queue::Read => READ_TIMEOUT_MS,
            Queue::Write => WRITE_TIMEOUT_MS,
        }
    }
}

/// The three timeout queues, indexed by [`Queue`].
#[derive(Default)]
struct Queues {
    idle: DList<RawFd>,
    read: DList<RawFd>,
    write: DList<RawFd>,
}

impl Queues {
    fn list_mut(&mut self, queue: Queue) -> &mut DList<RawFd> {
        match queue {
            Queue::Idle => &mut self.idle,
            Queue::Read => &mut self.read,
            Queue::Write => &mut self.write,
        }
    }

    fn list(&self, queue: Queue) -> &DList<RawFd> {
        match queue {
            Queue::Idle => &self.idle,
            Queue::Read => &self.read,
            Queue::Write => &self.write,
        }
    }
}

struct Conn {
    socket: Socket,

    // What the event loop should poll for next.
    want_read: bool,
    want_write: bool,
    want_close: bool,

    incoming: Buf,
    outgoing: Buf,

    last_active_ms: u64,
    queue: Queue,
    link: LinkId,
}

impl Conn {
    fn new(socket: Socket, now: u64) -> Self {
        Self {
            socket,
            want_read: true,
            want_write: false,
            want_close: false,
            incoming: Buf::new(),
            outgoing: Buf::new(),
            last_active_ms: now,
            queue: Queue::Idle,
            link: LinkId::default(),
        }
    }

    fn events(&self) -> PollFlags {
        let mut events = PollFlags::POLLERR;
        if self.want_read {
            events |= PollFlags::POLLIN;
        }
        if self.want_write {
            events |= PollFlags::POLLOUT;
        }
        events
    }
}

pub struct Server {
    listener: Socket,
    conns: HashMap<RawFd, Conn>,
    queues: Queues,
    shared: Shared,
}

impl Server {
    pub fn new(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.set_nonblocking(true)?;
        listener.listen(BACKLOG)?;
        info!(%addr, threads = config.threads, "listening");

        Ok(Self {
            listener,
            conns: HashMap::new(),
            queues: Queues::default(),
            shared: Shared::new(config.threads),
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.tick()?;
        }
    }

    /// One event-loop iteration: poll, service sockets, run timers.
    pub fn tick(&mut self) -> io::Result<()> {
        // Poll borrows the sockets, so clone handles out of the map
        // first; the clones share the underlying descriptors.
        let entries: Vec<(RawFd, Socket, PollFlags)> = self
            .conns
            .iter()
            .map(|(&fd, conn)| Ok((fd, conn.socket.try_clone()?, conn.events())))
            .collect::<io::Result<_>>()?;

        let mut poll_fds = Vec::with_capacity(entries.len() + 1);
        poll_fds.push(PollFd::new(&self.listener, PollFlags::POLLIN));
        for (_, socket, events) in &entries {
            poll_fds.push(PollFd::new(socket, *events));
        }

        let timeout_ms = self.next_timer_ms(now_ms());
        if let Err(e) = poll(&mut poll_fds, timeout_ms) {
            if e == nix::errno::Errno::EINTR {
                return Ok(());
            }
            return Err(io::Error::from(e));
        }

        let server_fd = self.listener.as_raw_fd();
        let ready: Vec<(RawFd, PollFlags)> = poll_fds
            .iter()
            .map(|p| {
                (
                    p.as_fd().as_raw_fd(),
                    p.revents().unwrap_or(PollFlags::empty()),
                )
            })
            .collect();
        drop(poll_fds);

        let now = now_ms();
        for (fd, revents) in ready {
            if fd == server_fd {
                if revents.intersects(PollFlags::POLLIN) {
                    self.accept_all(now)?;
                }
                continue;
            }
            if revents.is_empty() {
                continue;
            }
            let Some(conn) = self.conns.get_mut(&fd) else {
                continue;
            };
            if revents.intersects(PollFlags::POLLIN) && conn.want_read {
                handle_read(conn, &mut self.shared, now);
            }
            if revents.intersects(PollFlags::POLLOUT) && conn.want_write {
                handle_write(conn);
            }
            if revents.intersects(PollFlags::POLLERR) {
                conn.want_close = true;
            }
            if conn.want_close {
                self.teardown(fd);
            } else {
                self.requeue(fd, now);
            }
        }

        self.process_timers(now);
        Ok(())
    }

    fn accept_all(&mut self, now: u64) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    socket.set_nonblocking(true)?;
                    let fd = socket.as_raw_fd();
                    let mut conn = Conn::new(socket, now);
                    conn.link = self.queues.idle.push_back(fd);
                    debug!(fd, peer = ?peer.as_socket(), "accepted connection");
                    self.conns.insert(fd, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    /// Refresh a connection's timeout: move it to the queue matching
    /// its current expectation and stamp the activity time.
    fn requeue(&mut self, fd: RawFd, now: u64) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        let target = if conn.want_write {
            Queue::Write
        } else {
            Queue::Read
        };
        self.queues.list_mut(conn.queue).detach(conn.link);
        conn.link = self.queues.list_mut(target).push_back(fd);
        conn.queue = target;
        conn.last_active_ms = now;
    }

    fn teardown(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(&fd) {
            self.queues.list_mut(conn.queue).detach(conn.link);
            debug!(fd, "closing connection");
            // The socket drops here, closing the descriptor.
        }
    }

    /// Poll timeout: soonest of the three queue fronts and the nearest
    /// key expiry. -1 blocks indefinitely.
    fn next_timer_ms(&self, now: u64) -> i32 {
        let mut next = u64::MAX;
        for queue in [Queue::Idle, Queue::Read, Queue::Write] {
            if let Some((_, &fd)) = self.queues.list(queue).front() {
                next = next.min(self.conns[&fd].last_active_ms + queue.timeout_ms());
            }
        }
        if let Some(at) = self.shared.db.next_expiry() {
            next = next.min(at);
        }
        if next == u64::MAX {
            -1
        } else {
            next.saturating_sub(now).min(i32::MAX as u64) as i32
        }
    }

    /// Tear down timed-out connections and reap expired keys.
    fn process_timers(&mut self, now: u64) {
        for queue in [Queue::Idle, Queue::Read, Queue::Write] {
            let timeout = queue.timeout_ms();
            while let Some((_, &fd)) = self.queues.list(queue).front() {
                if self.conns[&fd].last_active_ms + timeout > now {
                    break;
                }
                info!(fd, ?queue, "connection timed out");
                self.teardown(fd);
            }
        }

        for entry in self.shared.db.process_expirations(now) {
            debug!(key = ?String::from_utf8_lossy(&entry.key), "key expired");
            self.shared.dispose(entry);
        }
    }
}

fn handle_read(conn: &mut Conn, shared: &mut Shared, now: u64) {
    let mut chunk = [0u8; READ_CHUNK];
    match conn.socket.read(&mut chunk) {
        Ok(0) => {
            conn.want_close = true;
            return;
        }
        Ok(n) => conn.incoming.append(&chunk[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!(error = %e, "read failed");
            conn.want_close = true;
            return;
        }
    }

    // Pipelining: drain every complete frame before going back to poll.
    loop {
        let (parsed, consumed) = match peek_frame(&conn.incoming) {
            Ok(None) => break,
            Ok(Some(payload)) => (parse_request(payload), 4 + payload.len()),
            Err(e) => {
                warn!(error = %e, "dropping connection");
                conn.want_close = true;
                return;
            }
        };
        conn.incoming.consume(consumed);
        match parsed {
            Ok(args) => dispatch(shared, &args, now, &mut conn.outgoing),
            Err(e) => {
                warn!(error = %e, "dropping connection");
                conn.want_close = true;
                return;
            }
        }
    }

    if !conn.outgoing.is_empty() {
        conn.want_read = false;
        conn.want_write = true;
        // The socket is likely writable right now; skip one poll round.
        handle_write(conn);
    }
}

fn handle_write(conn: &mut Conn) {
    match conn.socket.write(conn.outgoing.data()) {
        Ok(0) => conn.want_close = true,
        Ok(n) => {
            conn.outgoing.consume(n);
            if conn.outgoing.is_empty() {
                conn.want_write = false;
                conn.want_read = true;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            warn!(error = %e, "write failed");
            conn.want_close = true;
        }
    }
}

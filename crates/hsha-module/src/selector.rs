//! # Selector: the asynchronous half
//!
//! One thread, one epoll set, every connection. The selector:
//! 1. Accepts connections on the listening socket
//! 2. Reads length-prefixed request frames, never past the current frame
//! 3. Hands each complete frame to a `FrameDispatch` as a `PendingFrame`
//!    and stops reading that connection
//! 4. Drains the completion queue that workers fill, writes responses,
//!    and re-arms reads once a response is fully written
//!
//! Per-connection state machine:
//!
//! ```text
//!   ReadingHeader ──4 bytes──▶ ReadingFrame ──len bytes──▶ Awaiting
//!         ▲                                                   │ worker posts response
//!         └──────────── response fully written ◀── Writing ◀──┘
//! ```
//!
//! Since reads stop while a frame is `Awaiting`, a connection never has
//! two invocations in flight. Workers touch nothing but the completion
//! queue and the eventfd.

use crate::epoll::{self, Epoll};
use crate::eventfd_notifier::EventFdNotifier;
use crate::framed::{decode_len, encode_frame, FRAME_HEADER_LEN};

use hsha_core::config::ServerConfig;
use hsha_core::dispatch::FrameDispatch;
use hsha_core::error::{HshaError, Result};
use hsha_core::frame::{ConnToken, FrameUnit};
use hsha_core::notifier::Notifier;
use hsha_core::processor::Processor;
use hsha_core::{log_debug, log_error, log_info, log_trace, log_warn};

use crossbeam_queue::SegQueue;

use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// epoll keys for the two non-connection descriptors. Connection keys
/// are `ConnToken` values, whose slot half never reaches these.
const LISTENER_KEY: u64 = u64::MAX;
const NOTIFIER_KEY: u64 = u64::MAX - 1;

const CONN_READ_INTEREST: u32 = epoll::READABLE | epoll::PEER_CLOSED;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub max_frame_size: usize,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub max_events: usize,
}

impl From<&ServerConfig> for SelectorConfig {
    fn from(c: &ServerConfig) -> Self {
        Self {
            max_frame_size: c.max_frame_size,
            max_connections: c.max_connections,
            poll_timeout: c.poll_timeout,
            max_events: c.max_events,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::new())
    }
}

/// What a worker leaves behind for the selector.
enum Completion {
    Respond(ConnToken, Vec<u8>),
    Close(ConnToken),
}

/// State shared between the selector thread, workers and stop callers.
struct Shared {
    completions: SegQueue<Completion>,
    notifier: EventFdNotifier,
    stop: AtomicBool,
}

impl Shared {
    fn complete(&self, completion: Completion) {
        self.completions.push(completion);
        if let Err(e) = self.notifier.notify() {
            // The poll timeout still bounds how long the response waits.
            log_warn!("selector wakeup failed: {}", e);
        }
    }
}

/// Cloneable, thread-safe stop switch for a running selector.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<Shared>,
}

impl SelectorHandle {
    /// Ask the selector loop to exit. Idempotent, never blocks.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            log_debug!("selector stop requested");
        }
        let _ = self.shared.notifier.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

/// The frame unit the selector hands to its dispatcher.
pub struct PendingFrame {
    token: ConnToken,
    request: Vec<u8>,
    processor: Arc<dyn Processor>,
    shared: Arc<Shared>,
    completed: bool,
}

impl FrameUnit for PendingFrame {
    fn invoke(mut self: Box<Self>) {
        let mut response = Vec::new();
        let completion = match self.processor.process(&self.request, &mut response) {
            Ok(()) => Completion::Respond(self.token, response),
            Err(e) => {
                log_warn!("processor failed, closing connection {:?}: {}", self.token, e);
                Completion::Close(self.token)
            }
        };
        self.completed = true;
        self.shared.complete(completion);
    }

    fn token(&self) -> ConnToken {
        self.token
    }
}

impl Drop for PendingFrame {
    /// Never invoked (rejected, abandoned) or the processor panicked:
    /// release the connection instead of leaving it waiting.
    fn drop(&mut self) {
        if !self.completed {
            self.shared.complete(Completion::Close(self.token));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ReadingHeader,
    ReadingFrame,
    /// Frame dispatched, no reads until the response is written.
    Awaiting,
    Writing,
}

enum ReadOutcome {
    Pending,
    Frame(Vec<u8>),
    Eof,
    /// Framing violation; the connection must close.
    Invalid(HshaError),
    Failed(io::Error),
}

enum WriteOutcome {
    Done,
    Pending,
    Failed(io::Error),
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    token: ConnToken,
    state: ConnState,
    header: [u8; FRAME_HEADER_LEN],
    header_read: usize,
    frame: Vec<u8>,
    frame_read: usize,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// Peer hung up while a frame was in flight.
    peer_closed: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, token: ConnToken) -> Self {
        Self {
            stream,
            peer,
            token,
            state: ConnState::ReadingHeader,
            header: [0; FRAME_HEADER_LEN],
            header_read: 0,
            frame: Vec::new(),
            frame_read: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            peer_closed: false,
        }
    }

    /// Read until a whole frame is buffered or the socket would block.
    fn read_frame(&mut self, max_frame_size: usize) -> ReadOutcome {
        loop {
            match self.state {
                ConnState::ReadingHeader => {
                    match self.stream.read(&mut self.header[self.header_read..]) {
                        Ok(0) => return ReadOutcome::Eof,
                        Ok(n) => {
                            self.header_read += n;
                            if self.header_read == FRAME_HEADER_LEN {
                                let len = decode_len(self.header);
                                if len > max_frame_size {
                                    return ReadOutcome::Invalid(HshaError::FrameTooLarge(len));
                                }
                                self.frame = vec![0; len];
                                self.frame_read = 0;
                                self.state = ConnState::ReadingFrame;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Pending,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return ReadOutcome::Failed(e),
                    }
                }
                ConnState::ReadingFrame => {
                    if self.frame_read == self.frame.len() {
                        self.header_read = 0;
                        self.state = ConnState::Awaiting;
                        return ReadOutcome::Frame(mem::take(&mut self.frame));
                    }
                    match self.stream.read(&mut self.frame[self.frame_read..]) {
                        Ok(0) => return ReadOutcome::Eof,
                        Ok(n) => self.frame_read += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Pending,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return ReadOutcome::Failed(e),
                    }
                }
                ConnState::Awaiting | ConnState::Writing => return ReadOutcome::Pending,
            }
        }
    }

    /// Write as much of the pending response as the socket takes.
    fn flush(&mut self) -> WriteOutcome {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return WriteOutcome::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return WriteOutcome::Failed(e),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        self.state = ConnState::ReadingHeader;
        WriteOutcome::Done
    }
}

pub struct Selector {
    epoll: Epoll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    dispatcher: Arc<dyn FrameDispatch>,
    processor: Arc<dyn Processor>,
    config: SelectorConfig,
    slots: Vec<Option<Connection>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    open: usize,
}

impl Selector {
    /// Wrap an already-bound listener. Nothing is accepted until `run()`.
    pub fn new(
        listener: TcpListener,
        dispatcher: Arc<dyn FrameDispatch>,
        processor: Arc<dyn Processor>,
        config: SelectorConfig,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let epoll = Epoll::new()?;
        let notifier = EventFdNotifier::create()?;
        epoll.add(listener.as_raw_fd(), epoll::READABLE, LISTENER_KEY)?;
        epoll.add(notifier.as_raw_fd(), epoll::READABLE, NOTIFIER_KEY)?;

        Ok(Self {
            epoll,
            listener: Some(listener),
            local_addr,
            shared: Arc::new(Shared {
                completions: SegQueue::new(),
                notifier,
                stop: AtomicBool::new(false),
            }),
            dispatcher,
            processor,
            config,
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            open: 0,
        })
    }

    pub fn handle(&self) -> SelectorHandle {
        SelectorHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn open_connections(&self) -> usize {
        self.open
    }

    /// The selector loop. Returns when stopped, or with an error when
    /// the multiplexer itself fails.
    pub fn run(&mut self) -> Result<()> {
        log_info!("selector listening on {}", self.local_addr);
        let mut events = epoll::event_buffer(self.config.max_events);

        while !self.shared.stop.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, self.config.poll_timeout) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log_error!("epoll_wait failed, selector exiting: {}", e);
                    return Err(e.into());
                }
            };

            for ev in &events[..n] {
                let key = ev.u64;
                let flags = ev.events;
                match key {
                    LISTENER_KEY => self.accept_all(),
                    NOTIFIER_KEY => {
                        self.shared.notifier.drain();
                    }
                    _ => self.handle_event(ConnToken(key), flags),
                }
            }

            self.process_completions();
        }

        log_debug!("selector loop exited with {} open connections", self.open);
        Ok(())
    }

    /// Write out responses that workers posted after the loop exited,
    /// and push on responses the loop left half written. One
    /// non-blocking attempt per connection.
    pub fn flush_completed(&mut self) {
        let partial: Vec<ConnToken> = self
            .slots
            .iter()
            .flatten()
            .filter(|c| c.state == ConnState::Writing)
            .map(|c| c.token)
            .collect();
        for token in partial {
            self.on_writable(token);
        }
        self.process_completions();
    }

    /// Close the listening socket and every connection.
    pub fn close_all(&mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = self.epoll.delete(listener.as_raw_fd());
            log_debug!("stopped listening on {}", self.local_addr);
        }
        let tokens: Vec<ConnToken> = self
            .slots
            .iter()
            .filter_map(|s| s.as_ref().map(|c| c.token))
            .collect();
        for token in tokens {
            self.close(token);
        }
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => self.register(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: retry on the next readiness event.
                    log_warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.open >= self.config.max_connections {
            log_warn!("refusing {}: {} connections open", peer, self.open);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            log_warn!("refusing {}: set_nonblocking: {}", peer, e);
            return;
        }
        let _ = stream.set_nodelay(true);

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        let token = ConnToken::new(slot, self.generations[slot as usize]);

        if let Err(e) = self.epoll.add(stream.as_raw_fd(), CONN_READ_INTEREST, token.0) {
            log_warn!("refusing {}: epoll add: {}", peer, e);
            self.free.push(slot);
            return;
        }
        log_trace!("accepted {} as {:?}", peer, token);
        self.slots[slot as usize] = Some(Connection::new(stream, peer, token));
        self.open += 1;
    }

    fn conn_mut(&mut self, token: ConnToken) -> Option<&mut Connection> {
        self.slots
            .get_mut(token.slot() as usize)?
            .as_mut()
            .filter(|c| c.token == token)
    }

    fn set_interest(&mut self, token: ConnToken, interest: u32) -> io::Result<()> {
        let fd = match self.conn_mut(token) {
            Some(c) => c.stream.as_raw_fd(),
            None => return Ok(()),
        };
        self.epoll.modify(fd, interest, token.0)
    }

    fn handle_event(&mut self, token: ConnToken, flags: u32) {
        let (state, fd) = match self.conn_mut(token) {
            Some(c) => (c.state, c.stream.as_raw_fd()),
            None => return,
        };

        if flags & epoll::ERROR != 0 {
            self.close(token);
            return;
        }

        match state {
            ConnState::ReadingHeader | ConnState::ReadingFrame => {
                if flags & (epoll::READABLE | epoll::PEER_CLOSED) != 0 {
                    self.on_readable(token);
                }
            }
            ConnState::Awaiting => {
                if flags & epoll::PEER_CLOSED != 0 {
                    // Level-triggered HUP would fire every cycle; park the
                    // fd until the worker's completion arrives.
                    let _ = self.epoll.delete(fd);
                    if let Some(c) = self.conn_mut(token) {
                        c.peer_closed = true;
                    }
                }
            }
            ConnState::Writing => {
                if flags & epoll::WRITABLE != 0 {
                    self.on_writable(token);
                } else if flags & epoll::PEER_CLOSED != 0 {
                    self.close(token);
                }
            }
        }
    }

    fn on_readable(&mut self, token: ConnToken) {
        let max = self.config.max_frame_size;
        let (outcome, peer) = match self.conn_mut(token) {
            Some(c) => (c.read_frame(max), c.peer),
            None => return,
        };
        match outcome {
            ReadOutcome::Pending => {}
            ReadOutcome::Frame(request) => self.dispatch(token, request),
            ReadOutcome::Eof => {
                log_trace!("{} closed the connection", peer);
                self.close(token);
            }
            ReadOutcome::Invalid(e) => {
                log_warn!("{}: {} (limit {}), closing", peer, e, max);
                self.close(token);
            }
            ReadOutcome::Failed(e) => {
                log_debug!("{}: read failed: {}", peer, e);
                self.close(token);
            }
        }
    }

    fn dispatch(&mut self, token: ConnToken, request: Vec<u8>) {
        if let Err(e) = self.set_interest(token, 0) {
            log_warn!("{:?}: could not pause reads: {}", token, e);
            self.close(token);
            return;
        }
        let frame = Box::new(PendingFrame {
            token,
            request,
            processor: Arc::clone(&self.processor),
            shared: Arc::clone(&self.shared),
            completed: false,
        });
        if let Err(e) = self.dispatcher.dispatch(frame) {
            // The dropped frame already queued a close for this connection.
            log_error!("frame for {:?} rejected, connection will close: {}", token, e);
        }
    }

    fn on_writable(&mut self, token: ConnToken) {
        let outcome = match self.conn_mut(token) {
            Some(c) => c.flush(),
            None => return,
        };
        self.after_flush(token, outcome);
    }

    fn after_flush(&mut self, token: ConnToken, outcome: WriteOutcome) {
        let result = match outcome {
            WriteOutcome::Done => self.set_interest(token, CONN_READ_INTEREST),
            WriteOutcome::Pending => self.set_interest(token, epoll::WRITABLE | epoll::PEER_CLOSED),
            WriteOutcome::Failed(e) => Err(e),
        };
        if let Err(e) = result {
            log_debug!("{:?}: write failed: {}", token, e);
            self.close(token);
        }
    }

    fn process_completions(&mut self) {
        while let Some(completion) = self.shared.completions.pop() {
            match completion {
                Completion::Respond(token, payload) => self.respond(token, payload),
                Completion::Close(token) => self.close(token),
            }
        }
    }

    fn respond(&mut self, token: ConnToken, payload: Vec<u8>) {
        let frame = match encode_frame(&payload) {
            Ok(f) => f,
            Err(e) => {
                log_warn!("{:?}: cannot frame response: {}", token, e);
                self.close(token);
                return;
            }
        };
        let outcome = match self.conn_mut(token) {
            Some(c) if c.peer_closed => None,
            Some(c) => {
                c.write_buf = frame;
                c.write_pos = 0;
                c.state = ConnState::Writing;
                Some(c.flush())
            }
            None => {
                log_trace!("dropping response for closed connection {:?}", token);
                return;
            }
        };
        match outcome {
            Some(outcome) => self.after_flush(token, outcome),
            None => self.close(token),
        }
    }

    fn close(&mut self, token: ConnToken) {
        let slot = token.slot() as usize;
        let conn = match self.slots.get_mut(slot) {
            Some(s) if s.as_ref().map(|c| c.token) == Some(token) => s.take(),
            _ => None,
        };
        if let Some(conn) = conn {
            let _ = self.epoll.delete(conn.stream.as_raw_fd());
            self.generations[slot] = self.generations[slot].wrapping_add(1);
            self.free.push(slot as u32);
            self.open -= 1;
            log_trace!("closed {} ({:?})", conn.peer, token);
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        self.close_all();
    }
}

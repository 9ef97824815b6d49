//! Core state and identity types.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, receive loop not yet started.
    NotStarted = 0,
    /// Idle between reads, or waiting for an outbound connect to finish.
    WaitingForIo = 1,
    /// One read is outstanding.
    Receiving = 2,
    /// Halt requested while a read is outstanding.
    Halting = 3,
    /// Receive loop stopped.
    Halted = 4,
    /// Socket closed and close rendezvous completed.
    Closed = 5,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::WaitingForIo,
            2 => Self::Receiving,
            3 => Self::Halting,
            4 => Self::Halted,
            _ => Self::Closed,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> Self {
        state as u8
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::WaitingForIo => write!(f, "waiting_for_io"),
            Self::Receiving => write!(f, "receiving"),
            Self::Halting => write!(f, "halting"),
            Self::Halted => write!(f, "halted"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle of an acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AcceptorState {
    /// Socket opened, not bound.
    Opened = 0,
    /// Bind in progress.
    Connecting = 1,
    /// Bound and ready to accept.
    Connected = 2,
    /// Accepting stopped.
    Halted = 3,
    /// Underlying handle released.
    Closed = 4,
}

impl From<u8> for AcceptorState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Opened,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Halted,
            _ => Self::Closed,
        }
    }
}

impl From<AcceptorState> for u8 {
    fn from(state: AcceptorState) -> Self {
        state as u8
    }
}

impl fmt::Display for AcceptorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Halted => write!(f, "halted"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Atomic cell holding a small `u8`-backed state enum.
pub struct StateCell<S> {
    value: AtomicU8,
    _state: PhantomData<fn() -> S>,
}

impl<S> StateCell<S>
where
    S: Copy + From<u8> + Into<u8>,
{
    /// Creates a cell holding `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.into()),
            _state: PhantomData,
        }
    }

    /// Current state.
    pub fn load(&self) -> S {
        S::from(self.value.load(Ordering::Acquire))
    }

    /// Unconditionally replaces the state.
    pub fn store(&self, state: S) {
        self.value.store(state.into(), Ordering::Release);
    }

    /// Moves from `current` to `new`; returns false if the state was not `current`.
    pub fn transition(&self, current: S, new: S) -> bool {
        self.value
            .compare_exchange(
                current.into(),
                new.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl<S> fmt::Debug for StateCell<S>
where
    S: Copy + From<u8> + Into<u8> + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.load()).finish()
    }
}

/// Which side of the security handshake a socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandshakeRole {
    /// Initiates the handshake (outbound connections).
    #[default]
    Client,
    /// Answers the handshake (accepted connections).
    Server,
}

/// First identifier handed out; lower values are reserved.
const FIRST_CONNECTION_ID: u64 = 10;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(FIRST_CONNECTION_ID);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Issues the next identifier from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

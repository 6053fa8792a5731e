//! Byte relay between two stream endpoints.
//!
//! A tunnel takes ownership of the endpoints of two connected connections
//! and copies whatever arrives on one to the other, until either side closes
//! or its idle timeout fires.

use std::fmt;
use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::inet::TcpEndpoint;
use crate::pool::Handle;

const RELAY_CHUNK: usize = 4096;

/// Handle of a pooled tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(pub(crate) Handle);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tun {}", self.0)
    }
}

/// Outcome of one relay pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Bytes were moved
    Active(usize),
    /// Nothing to move
    Idle,
    /// One side closed or failed; the tunnel should be shut down
    Closed,
}

struct Direction {
    pending: Vec<u8>,
    eof: bool,
}

impl Direction {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            eof: false,
        }
    }
}

/// Two endpoints joined into one pipe
pub struct Tunnel<T> {
    ends: [Option<T>; 2],
    directions: [Direction; 2],
    idle_timeout: Duration,
}

impl<T: TcpEndpoint> Tunnel<T> {
    /// Join two endpoints, applying the idle timeout to both
    pub fn new(mut a: T, mut b: T, idle_timeout: Duration) -> io::Result<Self> {
        let applied = a
            .set_idle_timeout(idle_timeout)
            .and_then(|_| b.set_idle_timeout(idle_timeout));
        if let Err(err) = applied {
            a.abort();
            b.abort();
            return Err(err);
        }
        Ok(Self {
            ends: [Some(a), Some(b)],
            directions: [Direction::new(), Direction::new()],
            idle_timeout,
        })
    }

    /// Idle timeout applied to both endpoints
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether both endpoints are still owned
    pub fn is_open(&self) -> bool {
        self.ends.iter().all(Option::is_some)
    }

    /// Move available bytes in both directions
    pub fn relay(&mut self) -> RelayStatus {
        let mut moved = 0;
        for from in 0..2 {
            match self.relay_direction(from) {
                Ok(n) => moved += n,
                Err(err) => {
                    debug!(error = %err, side = from, "tunnel endpoint failed");
                    return RelayStatus::Closed;
                }
            }
        }

        if self.directions.iter().any(|d| d.eof && d.pending.is_empty()) {
            return RelayStatus::Closed;
        }
        if moved > 0 {
            RelayStatus::Active(moved)
        } else {
            RelayStatus::Idle
        }
    }

    fn relay_direction(&mut self, from: usize) -> io::Result<usize> {
        let [first, second] = &mut self.ends;
        let (src, dst) = if from == 0 { (first, second) } else { (second, first) };
        let (Some(src), Some(dst)) = (src.as_mut(), dst.as_mut()) else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let direction = &mut self.directions[from];

        let mut moved = 0;
        let mut chunk = [0u8; RELAY_CHUNK];
        while !direction.eof && direction.pending.len() < RELAY_CHUNK {
            match src.recv(&mut chunk)? {
                None => break,
                Some(0) => direction.eof = true,
                Some(n) => direction.pending.extend_from_slice(&chunk[..n]),
            }
        }

        while !direction.pending.is_empty() {
            let n = dst.send(&direction.pending)?;
            if n == 0 {
                break;
            }
            direction.pending.drain(..n);
            moved += n;
        }
        if moved > 0 {
            trace!(bytes = moved, side = from, "tunnel relayed");
        }
        Ok(moved)
    }

    /// Close both endpoints gracefully
    pub fn shutdown(&mut self) {
        for end in self.ends.iter_mut() {
            if let Some(mut endpoint) = end.take() {
                endpoint.close();
            }
        }
    }

    /// Close both endpoints immediately
    pub fn abort(&mut self) {
        for end in self.ends.iter_mut() {
            if let Some(mut endpoint) = end.take() {
                endpoint.abort();
            }
        }
    }
}

impl<T> fmt::Debug for Tunnel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("open", &self.ends.iter().filter(|e| e.is_some()).count())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

//! Typed channels.
//!
//! A bounded queue guarded by a mutex and condvar. Unbuffered channels
//! rendezvous: the sender parks until a receiver has taken the value.
//! Blocking operations poll a caller-supplied check so cancellation and
//! deadlines interrupt them at the next wake-up.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{PanicEntry, PanicError, RuntimeError};
use crate::vm::value::Value;

const PARK: Duration = Duration::from_millis(1);

struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    recv_waiting: usize,
}

pub struct Channel {
    cap: usize,
    state: Mutex<ChanState>,
    cond: Condvar,
}

/// Outcome of a non-blocking send.
#[derive(Debug)]
pub enum SendTry {
    Sent,
    Full(Value),
    Closed(Value),
}

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum RecvTry {
    Received(Value),
    Empty,
    Closed,
}

impl PartialEq for RecvTry {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RecvTry::Received(a), RecvTry::Received(b)) => crate::vm::value::value_eq(a, b),
            (RecvTry::Empty, RecvTry::Empty) => true,
            (RecvTry::Closed, RecvTry::Closed) => true,
            _ => false,
        }
    }
}

fn closed_send_panic() -> RuntimeError {
    RuntimeError::Panic(PanicError {
        chain: vec![PanicEntry { message: "send on closed channel".to_string(), recovered: false }],
    })
}

impl Channel {
    pub fn new(cap: usize) -> Channel {
        Channel {
            cap,
            state: Mutex::new(ChanState {
                queue: VecDeque::new(),
                closed: false,
                recv_waiting: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn try_send(&self, v: Value) -> SendTry {
        let mut s = self.state.lock();
        if s.closed {
            return SendTry::Closed(v);
        }
        if self.cap == 0 {
            // Rendezvous: only with a parked receiver.
            if s.recv_waiting > s.queue.len() {
                s.queue.push_back(v);
                self.cond.notify_all();
                return SendTry::Sent;
            }
            return SendTry::Full(v);
        }
        if s.queue.len() < self.cap {
            s.queue.push_back(v);
            self.cond.notify_all();
            return SendTry::Sent;
        }
        SendTry::Full(v)
    }

    pub fn try_recv(&self) -> RecvTry {
        let mut s = self.state.lock();
        match s.queue.pop_front() {
            Some(v) => {
                self.cond.notify_all();
                RecvTry::Received(v)
            }
            None if s.closed => RecvTry::Closed,
            None => RecvTry::Empty,
        }
    }

    /// Blocking send; `check` interrupts the wait with an error.
    pub fn send(
        &self,
        v: Value,
        check: &dyn Fn() -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let mut pending = v;
        loop {
            check()?;
            match self.try_send(pending) {
                SendTry::Sent => break,
                SendTry::Closed(_) => return Err(closed_send_panic()),
                SendTry::Full(v) => {
                    pending = v;
                    let mut s = self.state.lock();
                    self.cond.wait_for(&mut s, PARK);
                }
            }
        }
        // Unbuffered: wait until the value has been taken.
        if self.cap == 0 {
            loop {
                check()?;
                let mut s = self.state.lock();
                if s.queue.is_empty() || s.closed {
                    break;
                }
                self.cond.wait_for(&mut s, PARK);
            }
        }
        Ok(())
    }

    /// Blocking receive. Returns `None` when the channel is closed and
    /// drained.
    pub fn recv(
        &self,
        check: &dyn Fn() -> Result<(), RuntimeError>,
    ) -> Result<Option<Value>, RuntimeError> {
        loop {
            check()?;
            let mut s = self.state.lock();
            if let Some(v) = s.queue.pop_front() {
                self.cond.notify_all();
                return Ok(Some(v));
            }
            if s.closed {
                return Ok(None);
            }
            s.recv_waiting += 1;
            self.cond.wait_for(&mut s, PARK);
            s.recv_waiting -= 1;
        }
    }

    /// Closes the channel. Returns false when it was already closed.
    pub fn close(&self) -> bool {
        let mut s = self.state.lock();
        if s.closed {
            return false;
        }
        s.closed = true;
        self.cond.notify_all();
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan(cap {})", self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn no_check() -> Result<(), RuntimeError> {
        Ok(())
    }

    #[test]
    fn buffered_send_recv() {
        let ch = Channel::new(2);
        assert!(matches!(ch.try_send(Value::Int(1)), SendTry::Sent));
        assert!(matches!(ch.try_send(Value::Int(2)), SendTry::Sent));
        assert!(matches!(ch.try_send(Value::Int(3)), SendTry::Full(_)));
        assert!(matches!(ch.try_recv(), RecvTry::Received(Value::Int(1))));
        assert!(matches!(ch.try_recv(), RecvTry::Received(Value::Int(2))));
        assert_eq!(ch.try_recv(), RecvTry::Empty);
    }

    #[test]
    fn close_drains_then_reports() {
        let ch = Channel::new(1);
        let _ = ch.try_send(Value::Int(1));
        assert!(ch.close());
        assert!(!ch.close());
        assert!(matches!(ch.try_recv(), RecvTry::Received(Value::Int(1))));
        assert_eq!(ch.try_recv(), RecvTry::Closed);
        assert!(matches!(ch.recv(&no_check), Ok(None)));
    }

    #[test]
    fn send_on_closed_panics() {
        let ch = Channel::new(1);
        ch.close();
        assert!(matches!(ch.send(Value::Int(1), &no_check), Err(RuntimeError::Panic(_))));
    }

    #[test]
    fn cross_thread_transfer() {
        let ch = Arc::new(Channel::new(0));
        let tx = ch.clone();
        let t = std::thread::spawn(move || {
            tx.send(Value::Int(42), &no_check).unwrap();
        });
        let got = ch.recv(&no_check).unwrap();
        t.join().unwrap();
        assert!(matches!(got, Some(Value::Int(42))));
    }
}

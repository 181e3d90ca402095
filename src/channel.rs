//! # Channel Module
//!
//! Typed, optionally-buffered FIFO channels plus the `go` task spawn.
//! Buffer size zero is a rendezvous: a send completes only when a
//! receiver takes the value. Close is idempotent; subsequent sends
//! fail and receives drain buffered values then return null.

use crate::value::Value;
use crate::vm::Vm;

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A channel value. The sender slot empties on close; the receiver
/// stays so buffered values can still drain.
pub struct ChannelObj {
    pub name: String,
    pub bufsize: usize,
    sender: Mutex<Option<SyncSender<Value>>>,
    receiver: Mutex<Receiver<Value>>,
}

impl ChannelObj {
    pub fn new(name: String, bufsize: usize) -> Self {
        let (sender, receiver) = std::sync::mpsc::sync_channel(bufsize);
        Self {
            name,
            bufsize,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
        }
    }

    /// Idempotent: dropping the sender wakes blocked peers.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap().is_none()
    }

    pub fn describe(&self) -> String {
        let mut s = String::from("#[channel");
        if !self.name.is_empty() {
            s.push(' ');
            s.push_str(&self.name);
        }
        if self.bufsize > 0 {
            s.push_str(&format!(" [{}]", self.bufsize));
        }
        if self.is_closed() {
            s.push_str(" CLOSED");
        }
        s.push(']');
        s
    }
}

/// Sends a value. Timeout zero is a non-blocking try, positive waits
/// up to that many seconds, negative blocks forever. Returns true on
/// success, false on timeout, full, or closed.
pub fn send(ch: &ChannelObj, val: Value, timeout: f64) -> bool {
    let sender = match ch.sender.lock().unwrap().clone() {
        Some(s) => s,
        None => return false,
    };
    if timeout == 0.0 {
        match sender.try_send(val) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    } else if timeout > 0.0 {
        // No bounded-wait send in std mpsc; poll until the deadline.
        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        let mut val = val;
        loop {
            match sender.try_send(val) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(v)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    val = v;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    } else {
        sender.send(val).is_ok()
    }
}

/// Receives a value, symmetric with `send`. Returns null on timeout,
/// empty, or closed-and-drained.
pub fn recv(ch: &ChannelObj, timeout: f64) -> Value {
    let receiver = ch.receiver.lock().unwrap();
    if timeout == 0.0 {
        receiver.try_recv().unwrap_or(Value::Null)
    } else if timeout > 0.0 {
        match receiver.recv_timeout(Duration::from_secs_f64(timeout)) {
            Ok(v) => v,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Value::Null,
        }
    } else {
        receiver.recv().unwrap_or(Value::Null)
    }
}

/// Spawns a new task running the callable to completion in its own
/// execution context over the shared VM.
pub fn spawn_task(vm: &Arc<Vm>, fun: Value, args: Vec<Value>) {
    let vm = vm.clone();
    std::thread::spawn(move || {
        if let Err(err) = vm.exec_call(&fun, &args) {
            eprintln!("*** error in task: {}", err);
        }
    });
}

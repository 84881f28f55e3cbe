//! In-memory [`Transport`] implementation used by tests (C10).
//!
//! Grounded on the original Go test doubles (`manager_test.go`,
//! `deviceparameters_test.go`), which fake the `sfconnection`/
//! `moteconnection` interfaces the same way: a channel standing in for the
//! wire, with a helper to inject device replies.
//!
//! Gated behind the `test-util` feature, the way `tokio` itself exposes a
//! `test-util` feature for its own mock clock/runtime scaffolding — a
//! familiar ecosystem pattern for "only compile this for my own tests, but
//! let downstream crates opt in too".

use crate::transport::{Addr, Packet, Registration, Selector, Transport, TransportMode};
use std::sync::Mutex;
use std::sync::mpsc::Sender;

struct Subscription {
    selector: Selector,
    queue: Sender<Packet>,
    registration: Registration,
}

struct Inner {
    subs: Vec<Subscription>,
    sent: Vec<Packet>,
    next_reg: u64,
}

/// A fake transport that records sent packets and lets a test inject
/// "received" packets that get dispatched to matching subscribers.
pub struct MockTransport {
    mode: TransportMode,
    inner: Mutex<Inner>,
}

impl MockTransport {
    /// Create a mock transport in the given addressing mode.
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                subs: Vec::new(),
                sent: Vec::new(),
                next_reg: 0,
            }),
        }
    }

    /// Snapshot of every packet handed to [`Transport::send`] so far, in
    /// order.
    pub fn sent(&self) -> Vec<Packet> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Deliver `packet` to every subscriber whose selector matches it, as
    /// if it had just arrived over the wire.
    pub fn inject(&self, mut packet: Packet) {
        if let TransportMode::ActiveMessage { .. } = self.mode {
            // Devices reply from themselves; tests set `source` on the
            // packet before injecting if they need source filtering
            // exercised. Leave as-is otherwise.
            let _ = &mut packet;
        }
        let inner = self.inner.lock().unwrap();
        for sub in &inner.subs {
            if selector_matches(&sub.selector, &packet) {
                // A disconnected receiver (session already closed) is not
                // an error for the transport; just skip it.
                let _ = sub.queue.send(packet.clone());
            }
        }
    }

    /// Convenience: inject a packet as if it came from `source`.
    pub fn inject_from(&self, mut packet: Packet, source: Addr) {
        packet.set_source(source);
        self.inject(packet);
    }
}

fn selector_matches(selector: &Selector, packet: &Packet) -> bool {
    match *selector {
        Selector::RawType(_) => true,
        Selector::ActiveMessage { amid, .. } => packet.amid() == Some(amid),
    }
}

impl Transport for MockTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn send(&self, packet: Packet) -> crate::error::Result<()> {
        self.inner.lock().unwrap().sent.push(packet);
        Ok(())
    }

    fn subscribe(&self, selector: Selector, queue: Sender<Packet>) -> Registration {
        let mut inner = self.inner.lock().unwrap();
        let reg = Registration(inner.next_reg);
        inner.next_reg += 1;
        inner.subs.push(Subscription {
            selector,
            queue,
            registration: reg,
        });
        reg
    }

    fn unsubscribe(&self, registration: Registration) {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.retain(|s| s.registration != registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Frame;
    use std::sync::mpsc::channel;

    #[test]
    fn sent_packets_are_recorded() {
        let t = MockTransport::new(TransportMode::SerialRaw);
        let mut p = t.new_packet();
        p.set_payload(Frame::GetBySeqnum { seqnum: 0 }.encode().unwrap());
        t.send(p).unwrap();
        assert_eq!(t.sent().len(), 1);
    }

    #[test]
    fn injected_packet_reaches_subscriber() {
        let t = MockTransport::new(TransportMode::SerialRaw);
        let (tx, rx) = channel();
        t.subscribe(Selector::RawType(0x80), tx);
        let mut p = Packet::default();
        p.set_payload(vec![1, 2, 3]);
        t.inject(p);
        let got = rx.recv().unwrap();
        assert_eq!(got.get_payload(), &[1, 2, 3]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let t = MockTransport::new(TransportMode::SerialRaw);
        let (tx, rx) = channel();
        let reg = t.subscribe(Selector::RawType(0x80), tx);
        t.unsubscribe(reg);
        t.inject(Packet::default());
        assert!(rx.try_recv().is_err());
    }
}

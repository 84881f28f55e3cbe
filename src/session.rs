//! DPPE: the request/response protocol engine against one target (C4).
//!
//! Ground truth: `examples/original_source/manager.go`. The Go source
//! hands the receive channel between a background goroutine and whichever
//! user operation is active via a `done chan bool` interrupt; we fold both
//! roles into a single worker thread that owns one combined event stream
//! (packets relayed from the transport, commands from the session handle).
//! Because only one thread ever reads that stream, the "pre-empt the
//! background receiver" handoff spec.md §4.4 asks for is free: there is no
//! window in which a frame could be consumed twice or dropped between
//! roles, since there is only ever one reader (spec.md §8: "the receive
//! queue has exactly one consumer at any instant").
//!
//! Per spec.md §9's resolution of the "stale reply" open question, we take
//! the stricter, recommended option: an error frame correlated by the
//! right addressing mode (id or seqnum) but naming a *different* id/seqnum
//! than the in-flight request is treated as a protocol violation, not
//! silently swallowed.

use crate::error::{DppeError, Result};
use crate::packet::Frame;
use crate::transport::{
    AMID_DEVICE_PARAMETERS, Addr, Packet, Selector, TOS_SERIAL_DEVICE_PARAMETERS_ID, Transport,
    TransportMode,
};
use crate::types::{Parameter, ParameterType};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

enum Command {
    GetValue {
        name: String,
        reply: Sender<Result<Parameter>>,
    },
    SetValue {
        name: String,
        value: Vec<u8>,
        reply: Sender<Result<Parameter>>,
    },
    GetList {
        delivery: SyncSender<Parameter>,
    },
    Close,
}

enum WorkerMsg {
    Pkt(Packet),
    Cmd(Command),
}

/// One DPPE session, bound to exactly one target (or to the bus, in
/// sniffing mode, if `destination` is `None`).
///
/// `close()` is idempotent and only valid when no other call to
/// [`DppeSession::get_value`], [`DppeSession::set_value`], or
/// [`DppeSession::get_list`] is outstanding.
pub struct DppeSession {
    cmd_tx: Sender<WorkerMsg>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl DppeSession {
    /// Bind a new session to `destination` (or `None` for bus-attached
    /// broadcast/sniffing mode) over `transport`, with the given
    /// per-attempt timeout and additional-retry count.
    pub fn new(
        transport: Arc<dyn Transport>,
        destination: Option<Addr>,
        timeout: Duration,
        retries: u8,
    ) -> Self {
        let (cmd_tx, worker_rx) = mpsc::channel::<WorkerMsg>();
        let (pkt_tx, pkt_rx) = mpsc::channel::<Packet>();

        let selector = match transport.mode() {
            TransportMode::SerialRaw => Selector::RawType(TOS_SERIAL_DEVICE_PARAMETERS_ID),
            TransportMode::ActiveMessage { group, local } => Selector::ActiveMessage {
                group,
                local,
                amid: AMID_DEVICE_PARAMETERS,
            },
        };
        let registration = transport.subscribe(selector, pkt_tx);

        // Relay received packets into the same stream commands arrive on,
        // so the worker thread below is the single reader spec.md §8
        // requires.
        let relay_tx = cmd_tx.clone();
        std::thread::spawn(move || {
            for p in pkt_rx {
                if relay_tx.send(WorkerMsg::Pkt(p)).is_err() {
                    break;
                }
            }
        });

        let worker = std::thread::spawn(move || {
            let mut state = EngineState {
                transport,
                destination,
                timeout,
                retries,
                heartbeat: None,
                devstart: None,
                values: HashMap::new(),
            };
            loop {
                match worker_rx.recv() {
                    Ok(WorkerMsg::Pkt(p)) => state.observe_background(p),
                    Ok(WorkerMsg::Cmd(Command::GetValue { name, reply })) => {
                        let result = state.get_value(&worker_rx, &name);
                        let _ = reply.send(result);
                    }
                    Ok(WorkerMsg::Cmd(Command::SetValue { name, value, reply })) => {
                        let result = state.set_value(&worker_rx, &name, value);
                        let _ = reply.send(result);
                    }
                    Ok(WorkerMsg::Cmd(Command::GetList { delivery })) => {
                        state.get_list(&worker_rx, &delivery);
                    }
                    Ok(WorkerMsg::Cmd(Command::Close)) => break,
                    Err(_) => break,
                }
            }
            state.transport.unsubscribe(registration);
        });

        Self {
            cmd_tx,
            worker: Some(worker),
            closed: false,
        }
    }

    /// Issue a `get` for `name`. See spec.md §4.4 for the full procedure.
    pub fn get_value(&self, name: &str) -> Result<Parameter> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .send(WorkerMsg::Cmd(Command::GetValue {
                name: name.to_string(),
                reply: reply_tx,
            }))
            .map_err(|_| DppeError::TransportClosed)?;
        reply_rx.recv().map_err(|_| DppeError::TransportClosed)?
    }

    /// Issue a `set` of `value` for `name`. See spec.md §4.4.
    pub fn set_value(&self, name: &str, value: Vec<u8>) -> Result<Parameter> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.cmd_tx
            .send(WorkerMsg::Cmd(Command::SetValue {
                name: name.to_string(),
                value,
                reply: reply_tx,
            }))
            .map_err(|_| DppeError::TransportClosed)?;
        reply_rx.recv().map_err(|_| DppeError::TransportClosed)?
    }

    /// Enumerate every parameter on the device, lazily. Each entry is
    /// produced only once the engine completes the corresponding request;
    /// the sequence terminates on the first `ErrorBySeqnum{exists=false}`
    /// or after 256 entries.
    pub fn get_list(&self) -> Result<ParameterList> {
        // Rendezvous channel: the worker blocks on send, so it only issues
        // the next seqnum's request once the caller has consumed the
        // previous one.
        let (delivery_tx, delivery_rx) = mpsc::sync_channel(0);
        self.cmd_tx
            .send(WorkerMsg::Cmd(Command::GetList {
                delivery: delivery_tx,
            }))
            .map_err(|_| DppeError::TransportClosed)?;
        Ok(ParameterList { rx: delivery_rx })
    }

    /// Close the session, unregistering from the transport. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.cmd_tx.send(WorkerMsg::Cmd(Command::Close));
        if let Some(j) = self.worker.take() {
            let _ = j.join();
        }
        Ok(())
    }
}

impl Drop for DppeSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Lazy sequence of parameters produced by [`DppeSession::get_list`].
pub struct ParameterList {
    rx: Receiver<Parameter>,
}

impl Iterator for ParameterList {
    type Item = Parameter;
    fn next(&mut self) -> Option<Parameter> {
        self.rx.recv().ok()
    }
}

/// State owned exclusively by the session's worker thread.
struct EngineState {
    transport: Arc<dyn Transport>,
    destination: Option<Addr>,
    timeout: Duration,
    retries: u8,
    heartbeat: Option<SystemTime>,
    devstart: Option<SystemTime>,
    /// Last value successfully written per parameter name, cached for
    /// diagnostics (spec.md §3's `DppeSession` data model).
    values: HashMap<String, Vec<u8>>,
}

/// Outcome of waiting for one correlated reply.
enum WaitOutcome {
    Parameter(Parameter),
    ErrorById { exists: bool, err: u8 },
    ErrorBySeqnum { exists: bool, err: u8 },
}

impl EngineState {
    fn build_packet(&self, payload: Vec<u8>) -> Packet {
        let mut p = self.transport.new_packet();
        p.set_payload(payload);
        if let (Some(dest), TransportMode::ActiveMessage { .. }) =
            (self.destination, self.transport.mode())
        {
            p.set_destination(dest);
            p.set_type(AMID_DEVICE_PARAMETERS);
        }
        p
    }

    fn send(&self, frame: &Frame) {
        if let Ok(bytes) = frame.encode() {
            let packet = self.build_packet(bytes);
            // Best-effort: the engine retries regardless of send success.
            let _ = self.transport.send(packet);
        }
    }

    /// Drain one received packet when no user operation is active: update
    /// heartbeat state, discard anything else.
    fn observe_background(&mut self, packet: Packet) {
        self.try_observe_heartbeat(&packet);
    }

    fn try_observe_heartbeat(&mut self, packet: &Packet) -> bool {
        if let Ok(Frame::Heartbeat { uptime_secs, .. }) = Frame::decode(packet.get_payload()) {
            let now = SystemTime::now();
            self.heartbeat = Some(now);
            self.devstart = now.checked_sub(Duration::from_secs(uptime_secs as u64));
            true
        } else {
            false
        }
    }

    /// Drop a received packet if it is AM-addressed and not from our bound
    /// destination.
    fn from_bound_destination(&self, packet: &Packet) -> bool {
        match (self.destination, self.transport.mode()) {
            (Some(dest), TransportMode::ActiveMessage { .. }) => packet.source() == Some(dest),
            _ => true,
        }
    }

    fn wait_for_id(
        &mut self,
        rx: &Receiver<WorkerMsg>,
        name: &str,
        deadline: Instant,
    ) -> Result<WaitOutcome> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DppeError::Timeout);
            }
            match rx.recv_timeout(remaining) {
                Ok(WorkerMsg::Pkt(packet)) => {
                    if !self.from_bound_destination(&packet) {
                        continue;
                    }
                    if self.try_observe_heartbeat(&packet) {
                        continue;
                    }
                    match Frame::decode(packet.get_payload()) {
                        Ok(Frame::Parameter {
                            ty,
                            seqnum,
                            id,
                            value,
                        }) => {
                            if id == name.as_bytes() {
                                return Ok(WaitOutcome::Parameter(Parameter {
                                    name: name.to_string(),
                                    ty: ParameterType::from_code(ty)?,
                                    seqnum,
                                    value,
                                    timestamp: SystemTime::now(),
                                    error: None,
                                }));
                            }
                            // Uncorrelated reply for a different request;
                            // keep waiting.
                        }
                        Ok(Frame::ErrorById { exists, err, id }) => {
                            if id == name.as_bytes() {
                                return Ok(WaitOutcome::ErrorById { exists, err });
                            }
                            return Err(DppeError::MalformedFrame(format!(
                                "received error reply for unexpected parameter (expected {name})"
                            )));
                        }
                        _ => {}
                    }
                }
                Ok(WorkerMsg::Cmd(Command::Close)) => return Err(DppeError::TransportClosed),
                Ok(WorkerMsg::Cmd(_)) => {
                    // A second operation arrived while this one is in
                    // flight. The public API serializes calls through one
                    // blocking round trip per session handle, so this
                    // would only happen under misuse; dropping it here is
                    // the least surprising response.
                }
                Err(RecvTimeoutError::Timeout) => return Err(DppeError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(DppeError::TransportClosed),
            }
        }
    }

    fn wait_for_seqnum(
        &mut self,
        rx: &Receiver<WorkerMsg>,
        seqnum: u8,
        deadline: Instant,
    ) -> Result<WaitOutcome> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DppeError::Timeout);
            }
            match rx.recv_timeout(remaining) {
                Ok(WorkerMsg::Pkt(packet)) => {
                    if !self.from_bound_destination(&packet) {
                        continue;
                    }
                    if self.try_observe_heartbeat(&packet) {
                        continue;
                    }
                    match Frame::decode(packet.get_payload()) {
                        Ok(Frame::Parameter {
                            ty,
                            seqnum: s,
                            id,
                            value,
                        }) => {
                            if s == seqnum {
                                return Ok(WaitOutcome::Parameter(Parameter {
                                    name: String::from_utf8_lossy(&id).into_owned(),
                                    ty: ParameterType::from_code(ty)?,
                                    seqnum: s,
                                    value,
                                    timestamp: SystemTime::now(),
                                    error: None,
                                }));
                            }
                        }
                        Ok(Frame::ErrorBySeqnum {
                            exists,
                            err,
                            seqnum: s,
                        }) => {
                            if s == seqnum {
                                return Ok(WaitOutcome::ErrorBySeqnum { exists, err });
                            }
                            return Err(DppeError::MalformedFrame(format!(
                                "received error reply for unexpected seqnum (expected {seqnum})"
                            )));
                        }
                        _ => {}
                    }
                }
                Ok(WorkerMsg::Cmd(Command::Close)) => return Err(DppeError::TransportClosed),
                Ok(WorkerMsg::Cmd(_)) => {}
                Err(RecvTimeoutError::Timeout) => return Err(DppeError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(DppeError::TransportClosed),
            }
        }
    }

    /// Map a device error code into the crate's error taxonomy. Shared by
    /// the by-id and by-seqnum paths; `exists=false` always means
    /// "parameter not found" regardless of addressing mode.
    fn classify_device_error(exists: bool, err: u8) -> DppeError {
        if !exists {
            DppeError::ParameterNotFound
        } else if err == 6 {
            DppeError::InvalidValue
        } else {
            DppeError::DeviceError(err)
        }
    }

    /// `get_value`: retries only on timeout, per spec.md §4.4.
    fn get_value(&mut self, rx: &Receiver<WorkerMsg>, name: &str) -> Result<Parameter> {
        let mut attempt = 0u8;
        loop {
            self.send(&Frame::GetById {
                id: name.as_bytes().to_vec(),
            });
            let deadline = Instant::now() + self.timeout;
            match self.wait_for_id(rx, name, deadline) {
                Ok(WaitOutcome::Parameter(p)) => return Ok(p),
                Ok(WaitOutcome::ErrorById { exists, err }) => {
                    return Err(Self::classify_device_error(exists, err));
                }
                Ok(WaitOutcome::ErrorBySeqnum { .. }) => {
                    unreachable!("get-by-id never replies by seqnum")
                }
                Err(e) => {
                    if e.retryable() && attempt < self.retries {
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `set_value`: retries only on timeout; a reply whose value differs
    /// from what was requested is terminal (`ValueMismatch`), never
    /// retried, per spec.md §4.4.
    fn set_value(
        &mut self,
        rx: &Receiver<WorkerMsg>,
        name: &str,
        value: Vec<u8>,
    ) -> Result<Parameter> {
        let mut attempt = 0u8;
        loop {
            self.send(&Frame::SetById {
                id: name.as_bytes().to_vec(),
                value: value.clone(),
            });
            let deadline = Instant::now() + self.timeout;
            match self.wait_for_id(rx, name, deadline) {
                Ok(WaitOutcome::Parameter(p)) => {
                    if p.value == value {
                        self.values.insert(name.to_string(), p.value.clone());
                        return Ok(p);
                    }
                    return Err(DppeError::ValueMismatch {
                        requested: value,
                        actual: p.value,
                    });
                }
                Ok(WaitOutcome::ErrorById { exists, err }) => {
                    return Err(Self::classify_device_error(exists, err));
                }
                Ok(WaitOutcome::ErrorBySeqnum { .. }) => {
                    unreachable!("set-by-id never replies by seqnum")
                }
                Err(e) => {
                    if e.retryable() && attempt < self.retries {
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// `get_list`: walks seqnums `0..256`, retrying any error other than
    /// `exists=false` up to `retries` additional times per seqnum before
    /// emitting an error row and moving on; `exists=false` ends the whole
    /// sequence immediately (matches `director.go`'s `getList` loop).
    fn get_list(&mut self, rx: &Receiver<WorkerMsg>, delivery: &SyncSender<Parameter>) {
        for seqnum in 0u16..256 {
            let seqnum = seqnum as u8;
            let mut attempt = 0u8;
            let mut last_err: Option<DppeError> = None;
            let mut got: Option<Parameter> = None;
            loop {
                self.send(&Frame::GetBySeqnum { seqnum });
                let deadline = Instant::now() + self.timeout;
                match self.wait_for_seqnum(rx, seqnum, deadline) {
                    Ok(WaitOutcome::Parameter(p)) => {
                        got = Some(p);
                        break;
                    }
                    Ok(WaitOutcome::ErrorBySeqnum { exists: false, .. }) => return,
                    Ok(WaitOutcome::ErrorBySeqnum { exists: true, err }) => {
                        last_err = Some(Self::classify_device_error(true, err));
                        if attempt < self.retries {
                            attempt += 1;
                            continue;
                        }
                        break;
                    }
                    Ok(WaitOutcome::ErrorById { .. }) => {
                        unreachable!("get-by-seqnum never replies by id")
                    }
                    Err(e) => {
                        last_err = Some(e);
                        if attempt < self.retries {
                            attempt += 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            let row = match got {
                Some(p) => p,
                None => Parameter {
                    name: String::new(),
                    ty: ParameterType::Nil,
                    seqnum,
                    value: Vec::new(),
                    timestamp: SystemTime::now(),
                    error: last_err,
                },
            };
            if delivery.send(row).is_err() {
                return;
            }
        }
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;

    fn session_over(mock: Arc<MockTransport>) -> DppeSession {
        DppeSession::new(mock, None, Duration::from_millis(200), 1)
    }

    /// Wait until `mock` has recorded at least `expect` sent packets, then
    /// inject `frame` as the device's reply.
    fn respond_once_sent(mock: &MockTransport, expect: usize, frame: Frame) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while mock.sent().len() < expect && Instant::now() < deadline {
            std::thread::yield_now();
        }
        let mut p = Packet::default();
        p.set_payload(frame.encode().unwrap());
        mock.inject(p);
    }

    #[test]
    fn get_value_returns_parameter_on_reply() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let session = session_over(mock.clone());
        let handle = std::thread::spawn({
            let mock = mock.clone();
            move || {
                respond_once_sent(
                    &mock,
                    1,
                    Frame::Parameter {
                        ty: ParameterType::Uint8.code(),
                        seqnum: 0,
                        id: b"chan".to_vec(),
                        value: vec![7],
                    },
                );
            }
        });
        let p = session.get_value("chan").unwrap();
        handle.join().unwrap();
        assert_eq!(p.value, vec![7]);
        assert_eq!(p.ty, ParameterType::Uint8);
    }

    #[test]
    fn get_value_times_out_without_reply() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let session = DppeSession::new(mock, None, Duration::from_millis(30), 0);
        let err = session.get_value("missing").unwrap_err();
        assert!(matches!(err, DppeError::Timeout));
    }

    #[test]
    fn set_value_mismatch_is_terminal() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let session = session_over(mock.clone());
        let handle = std::thread::spawn({
            let mock = mock.clone();
            move || {
                respond_once_sent(
                    &mock,
                    1,
                    Frame::Parameter {
                        ty: ParameterType::Uint8.code(),
                        seqnum: 0,
                        id: b"chan".to_vec(),
                        value: vec![9],
                    },
                );
            }
        });
        let err = session.set_value("chan", vec![1]).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, DppeError::ValueMismatch { .. }));
    }

    #[test]
    fn get_value_not_found_is_not_retried() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let session = session_over(mock.clone());
        let handle = std::thread::spawn({
            let mock = mock.clone();
            move || {
                respond_once_sent(
                    &mock,
                    1,
                    Frame::ErrorById {
                        exists: false,
                        err: 0,
                        id: b"chan".to_vec(),
                    },
                );
            }
        });
        let err = session.get_value("chan").unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, DppeError::ParameterNotFound));
        // Only one request should have been sent; ParameterNotFound is
        // never retried.
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn get_list_terminates_on_not_found() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let session = session_over(mock.clone());
        let mut list = session.get_list().unwrap();
        let responder = std::thread::spawn({
            let mock = mock.clone();
            move || {
                respond_once_sent(
                    &mock,
                    1,
                    Frame::Parameter {
                        ty: ParameterType::Uint8.code(),
                        seqnum: 0,
                        id: b"a".to_vec(),
                        value: vec![1],
                    },
                );
                respond_once_sent(
                    &mock,
                    2,
                    Frame::ErrorBySeqnum {
                        exists: false,
                        err: 0,
                        seqnum: 1,
                    },
                );
            }
        });
        let first = list.next().unwrap();
        assert_eq!(first.value, vec![1]);
        assert!(list.next().is_none());
        responder.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let mock = Arc::new(MockTransport::new(TransportMode::SerialRaw));
        let mut session = session_over(mock);
        session.close().unwrap();
        session.close().unwrap();
    }
}

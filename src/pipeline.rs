//! Request pipeline (C10): per-connection state machine and opcode dispatch
//! on top of the KV index (C4) and backend chain (C6).
//!
//! The wire-level RDMA/TCP transport framing is out of scope (§1); this
//! module starts from the control-plane surface the transport is assumed
//! to hand it — a decoded request header plus sgl targets already resolved
//! to local memory — and ends at a response header.

use std::sync::Arc;
use std::time::Instant;

use log::warn;

use crate::backend::BackendDevice;
use crate::error::Status;
use crate::index::KvIndex;
use crate::metrics::Metrics;

/// Handshake defaults and hard caps (SPEC_FULL.md §3.1), grounded in
/// `examples/original_source/server/rdma.h`.
pub const DEFAULT_MAX_SGL: u8 = 4;
pub const MAX_SGL_CAP: u8 = 8;
pub const DEFAULT_MAX_INFLIGHT_COMMAND: u32 = 128;
pub const MAX_INFLIGHT_COMMAND_CAP: u32 = 4096;
pub const DEFAULT_MAX_KEY_LENGTH: u16 = 128;
pub const MAX_KEY_LENGTH_CAP: u16 = 1024;

/// An op whose completion fires later than this after submission is logged
/// at `warn` and counted in `Metrics::slow_ops`.
pub const SLOW_OP_THRESHOLD_US: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get,
    Set,
    Del,
    Test,
    Expire,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub key_length: u16,
    pub flags: u8,
    pub timeout_ns: u64,
    pub correlation_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub correlation_id: u64,
    pub status: Status,
    pub value_length: u64,
}

/// Per-connection negotiated limits and state, owned by a single I/O
/// thread.
pub struct Session {
    state: SessionState,
    max_sgl: u8,
    max_key_length: u16,
    max_inflight_command: u32,
}

impl Session {
    pub fn new(server_max_sgl: u8, server_max_key_length: u16, server_max_inflight: u32) -> Self {
        debug_assert!(server_max_sgl <= MAX_SGL_CAP, "server_max_sgl exceeds hard cap");
        debug_assert!(server_max_key_length <= MAX_KEY_LENGTH_CAP, "server_max_key_length exceeds hard cap");
        debug_assert!(
            server_max_inflight <= MAX_INFLIGHT_COMMAND_CAP,
            "server_max_inflight exceeds hard cap"
        );
        Session {
            state: SessionState::Connecting,
            max_sgl: server_max_sgl,
            max_key_length: server_max_key_length,
            max_inflight_command: server_max_inflight,
        }
    }

    /// A new session bound to this server's compiled-in defaults, as a
    /// transport would construct one before negotiating a client's
    /// handshake request against them.
    pub fn with_server_defaults() -> Self {
        Session::new(DEFAULT_MAX_SGL, DEFAULT_MAX_KEY_LENGTH, DEFAULT_MAX_INFLIGHT_COMMAND)
    }

    /// CONNECTING → READY: clamp the client's requested limits to this
    /// server's, refusing only when the client asks for more than the
    /// server will ever support.
    pub fn negotiate(
        &mut self,
        requested_max_sgl: u8,
        requested_max_key_length: u16,
        requested_max_inflight: u32,
        server_max_sgl: u8,
        server_max_key_length: u16,
        server_max_inflight: u32,
    ) -> Result<(), Status> {
        if requested_max_sgl > server_max_sgl
            || requested_max_key_length > server_max_key_length
            || requested_max_inflight > server_max_inflight
        {
            return Err(Status::Error);
        }
        self.max_sgl = requested_max_sgl.min(server_max_sgl);
        self.max_key_length = requested_max_key_length.min(server_max_key_length);
        self.max_inflight_command = requested_max_inflight.min(server_max_inflight);
        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn begin_draining(&mut self) {
        self.state = SessionState::Draining;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn validate_request(&self, key_length: u16, sgl_count: u8) -> Result<(), Status> {
        if self.state != SessionState::Ready {
            return Err(Status::Error);
        }
        if key_length > self.max_key_length || sgl_count > self.max_sgl {
            return Err(Status::Error);
        }
        Ok(())
    }
}

/// Binds a KV index to an optional backend chain and dispatches requests by
/// opcode.
pub struct Pipeline {
    index: KvIndex,
    backend: Option<BackendDevice>,
}

impl Pipeline {
    pub fn new(index: KvIndex, backend: Option<BackendDevice>) -> Self {
        Pipeline { index, backend }
    }

    fn metrics(&self) -> &Metrics {
        self.index.metrics()
    }

    /// Log and count an op whose completion callback fired later than
    /// `SLOW_OP_THRESHOLD_US` after submission (§3.1).
    fn track_slow_op(&self, opcode: &str, started: Instant) {
        let micros = started.elapsed().as_micros() as u64;
        if micros > SLOW_OP_THRESHOLD_US {
            self.metrics().inc_slow_op();
            warn!("{opcode}: completion took {micros}us (threshold {SLOW_OP_THRESHOLD_US}us)");
        }
    }

    /// GET: consult the local index first; on miss, fall through to the
    /// backend chain and, on a backend hit, populate the index for the
    /// next read.
    pub fn get(&mut self, session: &Session, req: &RequestHeader, key: &[u8], sgl: &mut [&mut [u8]]) -> ResponseHeader {
        let started = Instant::now();
        let resp = self.get_inner(session, req, key, sgl);
        self.track_slow_op("GET", started);
        resp
    }

    fn get_inner(&mut self, session: &Session, req: &RequestHeader, key: &[u8], sgl: &mut [&mut [u8]]) -> ResponseHeader {
        if let Err(status) = session.validate_request(req.key_length, sgl.len() as u8) {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status,
                value_length: 0,
            };
        }

        let (status, length) = self.index.get(key, sgl);
        if status != Status::NotFound {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status,
                value_length: length,
            };
        }

        let metrics = Arc::clone(self.index.metrics());
        let Some(backend) = self.backend.as_mut() else {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status: Status::NotFound,
                value_length: 0,
            };
        };

        metrics.inc_backend_get();
        let (backend_status, value) = backend.get(key, &metrics);
        if !backend_status.is_ok() {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status: backend_status,
                value_length: 0,
            };
        }

        self.index.set(key, &value, 0);
        let (status, length) = self.index.get(key, sgl);
        ResponseHeader {
            correlation_id: req.correlation_id,
            status,
            value_length: length,
        }
    }

    pub fn set(&mut self, session: &Session, req: &RequestHeader, key: &[u8], value: &[u8]) -> ResponseHeader {
        let started = Instant::now();
        let resp = self.set_inner(session, req, key, value);
        self.track_slow_op("SET", started);
        resp
    }

    fn set_inner(&mut self, session: &Session, req: &RequestHeader, key: &[u8], value: &[u8]) -> ResponseHeader {
        if let Err(status) = session.validate_request(req.key_length, 1) {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status,
                value_length: 0,
            };
        }
        let status = self.index.set(key, value, req.timeout_ns);
        ResponseHeader {
            correlation_id: req.correlation_id,
            status,
            value_length: value.len() as u64,
        }
    }

    pub fn del(&mut self, session: &Session, req: &RequestHeader, key: &[u8]) -> ResponseHeader {
        let started = Instant::now();
        let resp = self.del_inner(session, req, key);
        self.track_slow_op("DEL", started);
        resp
    }

    fn del_inner(&mut self, session: &Session, req: &RequestHeader, key: &[u8]) -> ResponseHeader {
        if let Err(status) = session.validate_request(req.key_length, 0) {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status,
                value_length: 0,
            };
        }
        let status = self.index.del(key);
        ResponseHeader {
            correlation_id: req.correlation_id,
            status,
            value_length: 0,
        }
    }

    pub fn test(&mut self, session: &Session, req: &RequestHeader, key: &[u8]) -> ResponseHeader {
        let started = Instant::now();
        let resp = self.test_inner(session, req, key);
        self.track_slow_op("TEST", started);
        resp
    }

    fn test_inner(&mut self, session: &Session, req: &RequestHeader, key: &[u8]) -> ResponseHeader {
        if let Err(status) = session.validate_request(req.key_length, 0) {
            return ResponseHeader {
                correlation_id: req.correlation_id,
                status,
                value_length: 0,
            };
        }
        let status = self.index.test(key);
        ResponseHeader {
            correlation_id: req.correlation_id,
            status,
            value_length: 0,
        }
    }

    pub fn expire_tick(&mut self, batch: usize) {
        self.index.expire_sweep(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::metrics::Metrics;
    use crate::policy::LruPolicy;
    use std::sync::Arc;

    fn ready_session() -> Session {
        let mut session = Session::new(4, 128, 128);
        session.negotiate(2, 64, 16, 4, 128, 128).unwrap();
        session
    }

    fn pipeline_without_backend() -> Pipeline {
        let arena = Arena::anonymous(64, 8, 64, 8).unwrap();
        let index = KvIndex::new(arena, Box::new(LruPolicy::new()), Arc::new(Metrics::new()));
        Pipeline::new(index, None)
    }

    fn request(opcode: Opcode, key_length: u16) -> RequestHeader {
        RequestHeader {
            opcode,
            key_length,
            flags: 0,
            timeout_ns: 0,
            correlation_id: 7,
        }
    }

    #[test]
    fn connecting_session_rejects_requests() {
        let session = Session::new(4, 128, 128);
        let mut pipeline = pipeline_without_backend();
        let req = request(Opcode::Get, 1);
        let mut buf = vec![0u8; 8];
        let mut targets: Vec<&mut [u8]> = vec![&mut buf];
        let resp = pipeline.get(&session, &req, b"k", &mut targets);
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.correlation_id, 7);
    }

    #[test]
    fn set_then_get_through_pipeline() {
        let session = ready_session();
        let mut pipeline = pipeline_without_backend();
        let set_req = request(Opcode::Set, 1);
        let resp = pipeline.set(&session, &set_req, b"k", b"value");
        assert_eq!(resp.status, Status::Ok);

        let get_req = request(Opcode::Get, 1);
        let mut buf = vec![0u8; 5];
        let mut targets: Vec<&mut [u8]> = vec![&mut buf];
        let resp = pipeline.get(&session, &get_req, b"k", &mut targets);
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(&buf, b"value");
    }

    #[test]
    fn get_falls_through_to_backend_and_repopulates_index() {
        let session = ready_session();
        let arena = Arena::anonymous(64, 8, 64, 8).unwrap();
        let index = KvIndex::new(arena, Box::new(LruPolicy::new()), Arc::new(Metrics::new()));
        let registry = crate::backend::BackendRegistry::with_builtins();
        let mut backend = crate::backend::BackendDevice::open("memcache:origin", &registry).unwrap();
        backend.set(b"k", b"from-origin", 0);
        let mut pipeline = Pipeline::new(index, Some(backend));

        let get_req = request(Opcode::Get, 1);
        let mut buf = vec![0u8; 16];
        let mut targets: Vec<&mut [u8]> = vec![&mut buf];
        let resp = pipeline.get(&session, &get_req, b"k", &mut targets);
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(&buf[..11], b"from-origin");

        // Second GET must now be served from the index alone.
        pipeline.backend = None;
        let mut buf2 = vec![0u8; 16];
        let mut targets2: Vec<&mut [u8]> = vec![&mut buf2];
        let resp2 = pipeline.get(&session, &get_req, b"k", &mut targets2);
        assert_eq!(resp2.status, Status::Ok);
        assert_eq!(&buf2[..11], b"from-origin");
    }

    #[test]
    fn backend_fallthrough_counts_as_a_backend_get() {
        let session = ready_session();
        let arena = Arena::anonymous(64, 8, 64, 8).unwrap();
        let index = KvIndex::new(arena, Box::new(LruPolicy::new()), Arc::new(Metrics::new()));
        let registry = crate::backend::BackendRegistry::with_builtins();
        let mut backend = crate::backend::BackendDevice::open("memcache:origin", &registry).unwrap();
        backend.set(b"k", b"v", 0);
        let mut pipeline = Pipeline::new(index, Some(backend));

        let get_req = request(Opcode::Get, 1);
        let mut buf = vec![0u8; 4];
        let mut targets: Vec<&mut [u8]> = vec![&mut buf];
        pipeline.get(&session, &get_req, b"k", &mut targets);

        assert_eq!(
            pipeline
                .metrics()
                .backend_get_ops
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn oversized_key_is_rejected_with_error() {
        let session = ready_session();
        let mut pipeline = pipeline_without_backend();
        let req = request(Opcode::Get, 200); // exceeds negotiated max_key_length of 64
        let mut buf = vec![0u8; 8];
        let mut targets: Vec<&mut [u8]> = vec![&mut buf];
        let resp = pipeline.get(&session, &req, b"k", &mut targets);
        assert_eq!(resp.status, Status::Error);
    }

    #[test]
    fn server_defaults_match_wire_constants() {
        let session = Session::with_server_defaults();
        assert_eq!(session.max_sgl, DEFAULT_MAX_SGL);
        assert_eq!(session.max_key_length, DEFAULT_MAX_KEY_LENGTH);
        assert_eq!(session.max_inflight_command, DEFAULT_MAX_INFLIGHT_COMMAND);
    }

    #[test]
    fn fast_ops_do_not_count_as_slow() {
        let session = ready_session();
        let mut pipeline = pipeline_without_backend();
        let set_req = request(Opcode::Set, 1);
        pipeline.set(&session, &set_req, b"k", b"value");
        assert_eq!(pipeline.metrics().slow_ops.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn draining_session_rejects_new_requests() {
        let mut session = ready_session();
        session.begin_draining();
        let mut pipeline = pipeline_without_backend();
        let req = request(Opcode::Test, 1);
        let resp = pipeline.test(&session, &req, b"k");
        assert_eq!(resp.status, Status::Error);
    }
}

//! Message channel to the parent process.
//!
//! The parent hands the VM process one end of a Unix stream socket. Every
//! message is a fixed 16-byte little-endian header followed by `len` bytes of
//! payload:
//!
//! ```text
//! 0       4       8        12      16
//! ┌───────┬───────┬────────┬───────┬────────────┐
//! │ kind  │ len   │ peer   │ pid   │ payload... │
//! └───────┴───────┴────────┴───────┴────────────┘
//! ```
//!
//! `peer` identifies the requester on the parent side and is echoed in the
//! response. A file descriptor (the migration target of a send request)
//! travels with the header as `SCM_RIGHTS` ancillary data.

use crate::hypervisor::VmId;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, LevelFilter};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use thiserror::Error;
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

pub const HEADER_LEN: usize = 16;

/// Largest payload accepted from the parent.
const MAX_PAYLOAD: u32 = 4096;

// Parent -> VM.
const MSG_VERBOSE: u32 = 1;
const MSG_SHUTDOWN: u32 = 2;
const MSG_REBOOT: u32 = 3;
const MSG_PAUSE: u32 = 4;
const MSG_UNPAUSE: u32 = 5;
const MSG_SEND_VM: u32 = 6;
const MSG_ADDR_RESPONSE: u32 = 7;

// VM -> parent.
const MSG_CREATED: u32 = 100;
const MSG_VM_SHUTDOWN: u32 = 102;
const MSG_VM_REBOOT: u32 = 103;
const MSG_PAUSE_RESPONSE: u32 = 104;
const MSG_UNPAUSE_RESPONSE: u32 = 105;
const MSG_SEND_VM_RESPONSE: u32 = 106;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to receive control message: {0}")]
    Recv(#[source] io::Error),

    #[error("Failed to send control message: {0}")]
    Send(#[source] io::Error),

    #[error("Unknown control message kind {0}")]
    UnknownKind(u32),

    #[error("Malformed control message kind {kind} ({len} byte payload)")]
    BadLength { kind: u32, len: u32 },

    #[error("Send request without a target descriptor")]
    MissingFd,
}

impl ControlError {
    /// Whether the error breaks the protocol rather than the transport.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ControlError::UnknownKind(_) | ControlError::BadLength { .. } | ControlError::MissingFd
        )
    }
}

/// Fixed header of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u32,
    pub len: u32,
    pub peer_id: u32,
    pub pid: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.kind);
        LittleEndian::write_u32(&mut buf[4..8], self.len);
        LittleEndian::write_u32(&mut buf[8..12], self.peer_id);
        LittleEndian::write_u32(&mut buf[12..16], self.pid);
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            kind: LittleEndian::read_u32(&buf[0..4]),
            len: LittleEndian::read_u32(&buf[4..8]),
            peer_id: LittleEndian::read_u32(&buf[8..12]),
            pid: LittleEndian::read_u32(&buf[12..16]),
        }
    }
}

/// A request from the parent.
#[derive(Debug)]
pub enum Request {
    /// New log verbosity (0 = warnings only).
    Verbose(i32),
    Shutdown,
    Reboot,
    Pause,
    Unpause,
    /// Dump the VM to the given descriptor.
    SendVm(File),
    /// Host MAC address resolved for a NIC.
    AddrResponse { nic: u32, mac: [u8; 6] },
}

impl Request {
    fn decode(header: &Header, payload: &[u8], fd: Option<File>) -> Result<Self, ControlError> {
        let bad = || ControlError::BadLength {
            kind: header.kind,
            len: header.len,
        };
        let mut r = payload;
        let req = match header.kind {
            MSG_VERBOSE => Request::Verbose(r.read_i32::<LittleEndian>().map_err(|_| bad())?),
            MSG_SHUTDOWN => Request::Shutdown,
            MSG_REBOOT => Request::Reboot,
            MSG_PAUSE => Request::Pause,
            MSG_UNPAUSE => Request::Unpause,
            MSG_SEND_VM => Request::SendVm(fd.ok_or(ControlError::MissingFd)?),
            MSG_ADDR_RESPONSE => {
                let nic = r.read_u32::<LittleEndian>().map_err(|_| bad())?;
                let mut mac = [0u8; 6];
                r.read_exact(&mut mac).map_err(|_| bad())?;
                Request::AddrResponse { nic, mac }
            }
            kind => return Err(ControlError::UnknownKind(kind)),
        };
        Ok(req)
    }
}

/// Map a verbosity message onto a log level.
pub fn verbosity_level(verbose: i32) -> LevelFilter {
    match verbose {
        i32::MIN..=0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// A message to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// VM creation finished; `vm_id` is 0 if the kernel refused it.
    Created { vm_id: VmId, result: i32 },
    /// The guest acknowledged a shutdown request.
    VmShutdown { vm_id: VmId },
    /// The guest acknowledged a reboot request.
    VmReboot { vm_id: VmId },
    Pause { vm_id: VmId, result: i32 },
    Unpause { vm_id: VmId, result: i32 },
    SendVm { vm_id: VmId, result: i32 },
}

impl Reply {
    fn encode(&self) -> (u32, Vec<u8>) {
        let (kind, vm_id, result) = match *self {
            Reply::Created { vm_id, result } => (MSG_CREATED, vm_id, result),
            Reply::VmShutdown { vm_id } => (MSG_VM_SHUTDOWN, vm_id, 0),
            Reply::VmReboot { vm_id } => (MSG_VM_REBOOT, vm_id, 0),
            Reply::Pause { vm_id, result } => (MSG_PAUSE_RESPONSE, vm_id, result),
            Reply::Unpause { vm_id, result } => (MSG_UNPAUSE_RESPONSE, vm_id, result),
            Reply::SendVm { vm_id, result } => (MSG_SEND_VM_RESPONSE, vm_id, result),
        };
        let mut payload = Vec::with_capacity(8);
        // Writes into a Vec cannot fail.
        let _ = payload.write_u32::<LittleEndian>(vm_id);
        let _ = payload.write_i32::<LittleEndian>(result);
        (kind, payload)
    }
}

/// The VM process end of the parent socket.
pub struct ControlChannel {
    stream: UnixStream,
    pid: u32,
}

impl ControlChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            pid: std::process::id(),
        }
    }

    /// Receive one message.
    ///
    /// Returns `Ok(None)` when the parent has closed its end.
    fn recv_message(&self) -> Result<Option<(Header, Vec<u8>, Option<File>)>, ControlError> {
        let mut buf = [0u8; HEADER_LEN];
        let (n, fd) = self
            .stream
            .recv_with_fd(&mut buf)
            .map_err(|e| ControlError::Recv(io::Error::from_raw_os_error(e.errno())))?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            (&self.stream)
                .read_exact(&mut buf[n..])
                .map_err(ControlError::Recv)?;
        }

        let header = Header::decode(&buf);
        if header.len > MAX_PAYLOAD {
            return Err(ControlError::BadLength {
                kind: header.kind,
                len: header.len,
            });
        }
        let mut payload = vec![0u8; header.len as usize];
        (&self.stream)
            .read_exact(&mut payload)
            .map_err(ControlError::Recv)?;
        Ok(Some((header, payload, fd)))
    }

    /// Receive the next request. Returns `Ok(None)` on EOF.
    pub fn recv(&self) -> Result<Option<(Header, Request)>, ControlError> {
        let Some((header, payload, fd)) = self.recv_message()? else {
            return Ok(None);
        };
        let req = Request::decode(&header, &payload, fd)?;
        debug!("control: received {:?} from peer {}", req, header.peer_id);
        Ok(Some((header, req)))
    }

    fn send_message(
        &self,
        kind: u32,
        peer_id: u32,
        payload: &[u8],
        fd: Option<RawFd>,
    ) -> Result<(), ControlError> {
        let header = Header {
            kind,
            len: payload.len() as u32,
            peer_id,
            pid: self.pid,
        }
        .encode();
        match fd {
            Some(fd) => {
                let n = self
                    .stream
                    .send_with_fd(&header[..], fd)
                    .map_err(|e| ControlError::Send(io::Error::from_raw_os_error(e.errno())))?;
                if n < HEADER_LEN {
                    (&self.stream)
                        .write_all(&header[n..])
                        .map_err(ControlError::Send)?;
                }
            }
            None => (&self.stream)
                .write_all(&header)
                .map_err(ControlError::Send)?,
        }
        (&self.stream)
            .write_all(payload)
            .map_err(ControlError::Send)
    }

    pub fn send(&self, peer_id: u32, reply: Reply) -> Result<(), ControlError> {
        debug!("control: sending {:?} to peer {}", reply, peer_id);
        let (kind, payload) = reply.encode();
        self.send_message(kind, peer_id, &payload, None)
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Seek;
    use std::time::Duration;

    /// The parent's end of the socket.
    pub(crate) struct Parent(pub ControlChannel);

    impl Parent {
        pub(crate) fn pair() -> (Parent, ControlChannel) {
            let (a, b) = UnixStream::pair().unwrap();
            a.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            (Parent(ControlChannel::new(a)), ControlChannel::new(b))
        }

        pub(crate) fn request(&self, peer_id: u32, kind: u32, payload: &[u8]) {
            self.0.send_message(kind, peer_id, payload, None).unwrap();
        }

        pub(crate) fn send_vm(&self, peer_id: u32, target: &File) {
            self.0
                .send_message(MSG_SEND_VM, peer_id, &[], Some(target.as_raw_fd()))
                .unwrap();
        }

        pub(crate) fn reply(&self) -> (Header, Reply) {
            let (header, payload, _) = self.0.recv_message().unwrap().unwrap();
            let mut r = payload.as_slice();
            let vm_id = r.read_u32::<LittleEndian>().unwrap();
            let result = r.read_i32::<LittleEndian>().unwrap();
            let reply = match header.kind {
                MSG_CREATED => Reply::Created { vm_id, result },
                MSG_VM_SHUTDOWN => Reply::VmShutdown { vm_id },
                MSG_VM_REBOOT => Reply::VmReboot { vm_id },
                MSG_PAUSE_RESPONSE => Reply::Pause { vm_id, result },
                MSG_UNPAUSE_RESPONSE => Reply::Unpause { vm_id, result },
                MSG_SEND_VM_RESPONSE => Reply::SendVm { vm_id, result },
                kind => panic!("unexpected reply kind {}", kind),
            };
            (header, reply)
        }
    }

    pub(crate) const PAUSE: u32 = MSG_PAUSE;
    pub(crate) const UNPAUSE: u32 = MSG_UNPAUSE;
    pub(crate) const SHUTDOWN: u32 = MSG_SHUTDOWN;
    pub(crate) const VERBOSE: u32 = MSG_VERBOSE;

    #[test]
    fn test_header_layout() {
        let h = Header {
            kind: MSG_PAUSE_RESPONSE,
            len: 8,
            peer_id: 3,
            pid: 0x1234,
        };
        let buf = h.encode();
        assert_eq!(&buf[..8], &[104, 0, 0, 0, 8, 0, 0, 0]);
        assert_eq!(Header::decode(&buf), h);
    }

    #[test]
    fn test_requests_decode() {
        let (parent, vm) = Parent::pair();
        parent.request(9, MSG_VERBOSE, &2i32.to_le_bytes());
        parent.request(9, MSG_PAUSE, &[]);
        let mut addr = 1u32.to_le_bytes().to_vec();
        addr.extend_from_slice(&[0xfe, 0xe1, 0xba, 0xd0, 0x00, 0x02]);
        parent.request(9, MSG_ADDR_RESPONSE, &addr);

        let (header, req) = vm.recv().unwrap().unwrap();
        assert_eq!(header.peer_id, 9);
        assert!(matches!(req, Request::Verbose(2)));
        assert!(matches!(vm.recv().unwrap().unwrap().1, Request::Pause));
        assert!(matches!(
            vm.recv().unwrap().unwrap().1,
            Request::AddrResponse {
                nic: 1,
                mac: [0xfe, 0xe1, 0xba, 0xd0, 0x00, 0x02]
            }
        ));
    }

    #[test]
    fn test_send_request_carries_descriptor() {
        let (parent, vm) = Parent::pair();
        let target = tempfile();
        parent.send_vm(4, &target);

        let (_, req) = vm.recv().unwrap().unwrap();
        let Request::SendVm(mut file) = req else {
            panic!("expected send request");
        };
        file.write_all(b"dump").unwrap();
        file.rewind().unwrap();
        let mut back = String::new();
        file.read_to_string(&mut back).unwrap();
        assert_eq!(back, "dump");
    }

    #[test]
    fn test_send_request_without_descriptor_is_rejected() {
        let (parent, vm) = Parent::pair();
        parent.request(4, MSG_SEND_VM, &[]);
        let err = vm.recv().unwrap_err();
        assert!(matches!(err, ControlError::MissingFd));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        let (parent, vm) = Parent::pair();
        parent.request(1, 77, &[]);
        let err = vm.recv().unwrap_err();
        assert!(matches!(err, ControlError::UnknownKind(77)));
        assert!(err.is_protocol());
    }

    #[test]
    fn test_short_payload_is_protocol_error() {
        let (parent, vm) = Parent::pair();
        parent.request(1, MSG_VERBOSE, &[1, 0]);
        assert!(matches!(
            vm.recv(),
            Err(ControlError::BadLength {
                kind: MSG_VERBOSE,
                len: 2
            })
        ));
    }

    #[test]
    fn test_eof() {
        let (parent, vm) = Parent::pair();
        drop(parent);
        assert!(vm.recv().unwrap().is_none());
    }

    #[test]
    fn test_reply_echoes_peer() {
        let (parent, vm) = Parent::pair();
        vm.send(5, Reply::Pause { vm_id: 2, result: 0 }).unwrap();
        let (header, reply) = parent.reply();
        assert_eq!(header.peer_id, 5);
        assert_eq!(header.pid, std::process::id());
        assert_eq!(reply, Reply::Pause { vm_id: 2, result: 0 });
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_level(-1), LevelFilter::Warn);
        assert_eq!(verbosity_level(1), LevelFilter::Info);
        assert_eq!(verbosity_level(5), LevelFilter::Trace);
    }

    pub(crate) fn tempfile() -> File {
        let path = std::env::temp_dir().join(format!(
            "carbon-vm-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file
    }
}

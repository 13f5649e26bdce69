//! nftables set access over a persistent nfnetlink socket.
//!
//! Set queries are answered immediately. Element additions are queued and
//! sent to the kernel as one `BATCH_BEGIN … BATCH_END` transaction on
//! [`SetConn::flush`].

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use super::SetConn;
use crate::error::TransportError;
use crate::set::{KeyType, SetFlags, SetId, SetInfo};

// Netlink header constants
const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_CREATE: u16 = 0x400;
const NLA_HDRLEN: usize = 4;
const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = !(0x8000 | 0x4000);

// nfnetlink
const NFGENMSG_LEN: usize = 4;
const NFNETLINK_V0: u8 = 0;
const NFNL_SUBSYS_NFTABLES: u16 = 10;
const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
const NFNL_MSG_BATCH_END: u16 = 0x11;
const NFPROTO_INET: u8 = 1;

// nftables message types
const NFT_MSG_NEWSET: u16 = 9;
const NFT_MSG_GETSET: u16 = 10;
const NFT_MSG_NEWSETELEM: u16 = 12;

// nftables set attributes
const NFTA_SET_TABLE: u16 = 1;
const NFTA_SET_NAME: u16 = 2;
const NFTA_SET_FLAGS: u16 = 3;
const NFTA_SET_KEY_TYPE: u16 = 4;

// nftables set element attributes
const NFTA_SET_ELEM_LIST_TABLE: u16 = 1;
const NFTA_SET_ELEM_LIST_SET: u16 = 2;
const NFTA_SET_ELEM_LIST_ELEMENTS: u16 = 3;
const NFTA_LIST_ELEM: u16 = 1;
const NFTA_SET_ELEM_KEY: u16 = 1;
const NFTA_DATA_VALUE: u16 = 1;

/// Elements per NEWSETELEM message; keeps the nested list under the
/// 16-bit attribute length limit.
const ELEMENTS_PER_MSG: usize = 1024;

/// Bytes one element adds to a NEWSETELEM message.
const ELEMENT_LEN: usize = 4 * NLA_HDRLEN;

/// Large enough for an error ack echoing a full NEWSETELEM chunk, in case
/// the kernel ignores `NETLINK_CAP_ACK`.
const RECV_BUF_SIZE: usize = 2 * ELEMENTS_PER_MSG * ELEMENT_LEN + 4096;

fn nft_msg_type(cmd: u16) -> u16 {
    (NFNL_SUBSYS_NFTABLES << 8) | cmd
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// NftConn is a lasting nftables connection.
pub struct NftConn {
    socket: Option<Socket>,
    seq: u32,
    /// Queued NEWSETELEM messages
    batch: MsgBuffer,
    /// Sequence numbers of queued messages, each expecting an ack
    queued: Vec<u32>,
    recv_buf: Vec<u8>,
}

impl NftConn {
    /// Open a netfilter netlink socket.
    pub fn open() -> Result<Self, TransportError> {
        Ok(Self::with_socket(Socket::open()?))
    }

    fn with_socket(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            seq: 0,
            batch: MsgBuffer::new(),
            queued: Vec::new(),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}

impl SetConn for NftConn {
    fn get_set_by_name(&mut self, id: &SetId) -> Result<SetInfo, TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::Closed);
        }
        let seq = self.next_seq();

        let mut msg = MsgBuffer::new();
        let start = msg.begin(nft_msg_type(NFT_MSG_GETSET), NLM_F_REQUEST | NLM_F_ACK, seq);
        msg.put_nfgenmsg(NFPROTO_INET, 0);
        msg.put_attr_strz(NFTA_SET_TABLE, id.table());
        msg.put_attr_strz(NFTA_SET_NAME, id.name());
        msg.finish(start);

        let Self {
            socket, recv_buf, ..
        } = self;
        let socket = socket.as_ref().ok_or(TransportError::Closed)?;
        socket.send(msg.as_slice())?;

        let mut info = None;
        let res = receive_acks(socket, recv_buf, seq, 1, None, |ty, payload| {
            if ty == nft_msg_type(NFT_MSG_NEWSET) {
                info = Some(parse_set(payload)?);
            }
            Ok(())
        });

        match res {
            Ok(()) => info.ok_or(TransportError::Malformed("ack without set description")),
            Err(TransportError::Netlink(libc::ENOENT)) => {
                Err(TransportError::SetNotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn add_elements(&mut self, id: &SetId, elements: &[Ipv4Addr]) -> Result<(), TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::Closed);
        }

        for chunk in elements.chunks(ELEMENTS_PER_MSG) {
            let seq = self.next_seq();
            let msg = &mut self.batch;

            let start = msg.begin(
                nft_msg_type(NFT_MSG_NEWSETELEM),
                NLM_F_REQUEST | NLM_F_CREATE | NLM_F_ACK,
                seq,
            );
            msg.put_nfgenmsg(NFPROTO_INET, 0);
            msg.put_attr_strz(NFTA_SET_ELEM_LIST_SET, id.name());
            msg.put_attr_strz(NFTA_SET_ELEM_LIST_TABLE, id.table());

            let list = msg.begin_nested(NFTA_SET_ELEM_LIST_ELEMENTS);
            for ip in chunk {
                let elem = msg.begin_nested(NFTA_LIST_ELEM);
                let key = msg.begin_nested(NFTA_SET_ELEM_KEY);
                msg.put_attr(NFTA_DATA_VALUE, &ip.octets());
                msg.end_nested(key);
                msg.end_nested(elem);
            }
            msg.end_nested(list);
            msg.finish(start);

            self.queued.push(seq);
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::Closed);
        }

        // Queued messages are dropped whatever the outcome.
        let body = mem::take(&mut self.batch);
        let queued = mem::take(&mut self.queued);
        let Some(&first) = queued.first() else {
            return Ok(());
        };

        let begin_seq = self.next_seq();
        let end_seq = self.next_seq();

        let mut msg = MsgBuffer::new();
        let start = msg.begin(NFNL_MSG_BATCH_BEGIN, NLM_F_REQUEST, begin_seq);
        msg.put_nfgenmsg(libc::AF_UNSPEC as u8, NFNL_SUBSYS_NFTABLES);
        msg.finish(start);
        msg.extend(&body);
        let start = msg.begin(NFNL_MSG_BATCH_END, NLM_F_REQUEST, end_seq);
        msg.put_nfgenmsg(libc::AF_UNSPEC as u8, NFNL_SUBSYS_NFTABLES);
        msg.finish(start);

        let Self {
            socket, recv_buf, ..
        } = self;
        let socket = socket.as_ref().ok_or(TransportError::Closed)?;
        socket.send(msg.as_slice())?;

        // A rejected batch is answered on BATCH_BEGIN instead of the
        // element messages.
        receive_acks(
            socket,
            recv_buf,
            first,
            queued.len(),
            Some(begin_seq),
            |_, _| Ok(()),
        )
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let socket = self.socket.take().ok_or(TransportError::Closed)?;
        self.batch = MsgBuffer::new();
        self.queued.clear();
        socket.close()?;
        Ok(())
    }
}

/// Read replies until `acks` acknowledgements for the consecutive sequence
/// numbers starting at `first_seq` arrive.
///
/// An error reply for `batch_seq` fails the whole exchange. Replies for any
/// other sequence number are leftovers of earlier failed exchanges and are
/// skipped.
fn receive_acks<F>(
    socket: &Socket,
    buf: &mut [u8],
    first_seq: u32,
    acks: usize,
    batch_seq: Option<u32>,
    mut on_msg: F,
) -> Result<(), TransportError>
where
    F: FnMut(u16, &[u8]) -> Result<(), TransportError>,
{
    let span = acks.saturating_sub(1) as u32;
    let mut pending = acks;

    while pending > 0 {
        let n = socket.recv(buf)?;
        for msg in Messages::new(&buf[..n]) {
            let msg = msg?;
            if Some(msg.seq) == batch_seq && msg.ty == NLMSG_ERROR {
                let errno = read_i32(msg.payload)?;
                if errno != 0 {
                    return Err(TransportError::Netlink(-errno));
                }
                continue;
            }
            if msg.seq.wrapping_sub(first_seq) > span {
                continue;
            }

            match msg.ty {
                NLMSG_ERROR => {
                    let errno = read_i32(msg.payload)?;
                    if errno != 0 {
                        return Err(TransportError::Netlink(-errno));
                    }
                    pending = pending.saturating_sub(1);
                }
                NLMSG_DONE => {}
                ty => on_msg(ty, msg.payload)?,
            }
        }
    }

    Ok(())
}

/// Decode a NEWSET message payload.
fn parse_set(payload: &[u8]) -> Result<SetInfo, TransportError> {
    let attrs = payload
        .get(NFGENMSG_LEN..)
        .ok_or(TransportError::Malformed("short nfgenmsg"))?;

    let mut key_type = None;
    let mut flags = SetFlags::empty();
    for attr in Attrs::new(attrs) {
        let (ty, value) = attr?;
        match ty {
            NFTA_SET_KEY_TYPE => key_type = Some(KeyType::from_u32(read_be_u32(value)?)),
            NFTA_SET_FLAGS => flags = SetFlags::from_bits_retain(read_be_u32(value)?),
            _ => {}
        }
    }

    let key_type = key_type.ok_or(TransportError::Malformed("set without key type"))?;
    Ok(SetInfo { key_type, flags })
}

fn read_i32(b: &[u8]) -> Result<i32, TransportError> {
    b.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_ne_bytes)
        .ok_or(TransportError::Malformed("short error message"))
}

fn read_be_u32(b: &[u8]) -> Result<u32, TransportError> {
    b.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(TransportError::Malformed("short u32 attribute"))
}

/// A decoded netlink message.
struct Message<'a> {
    ty: u16,
    seq: u32,
    payload: &'a [u8],
}

/// Iterator over the netlink messages in a datagram.
struct Messages<'a> {
    buf: &'a [u8],
}

impl<'a> Messages<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<Message<'a>, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }

        let b = self.buf;
        let len = u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as usize;
        if len < NLMSG_HDRLEN || len > b.len() {
            self.buf = &[];
            return Some(Err(TransportError::Malformed("bad message length")));
        }

        let msg = Message {
            ty: u16::from_ne_bytes([b[4], b[5]]),
            seq: u32::from_ne_bytes([b[8], b[9], b[10], b[11]]),
            payload: &b[NLMSG_HDRLEN..len],
        };
        self.buf = &b[align4(len).min(b.len())..];

        Some(Ok(msg))
    }
}

/// Iterator over netlink attributes as `(type, value)`.
struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Result<(u16, &'a [u8]), TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }

        let b = self.buf;
        let len = u16::from_ne_bytes([b[0], b[1]]) as usize;
        if len < NLA_HDRLEN || len > b.len() {
            self.buf = &[];
            return Some(Err(TransportError::Malformed("bad attribute length")));
        }

        let ty = u16::from_ne_bytes([b[2], b[3]]) & NLA_TYPE_MASK;
        let value = &b[NLA_HDRLEN..len];
        self.buf = &b[align4(len).min(b.len())..];

        Some(Ok((ty, value)))
    }
}

/// Builder for netlink messages.
#[derive(Default)]
struct MsgBuffer {
    buf: Vec<u8>,
}

impl MsgBuffer {
    fn new() -> Self {
        Self::default()
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn extend(&mut self, other: &MsgBuffer) {
        self.buf.extend_from_slice(&other.buf);
    }

    /// Start a message; returns its offset for [`MsgBuffer::finish`].
    fn begin(&mut self, ty: u16, flags: u16, seq: u32) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&seq.to_ne_bytes());
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        start
    }

    fn finish(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&len.to_ne_bytes());
    }

    fn put_nfgenmsg(&mut self, family: u8, res_id: u16) {
        self.buf.push(family);
        self.buf.push(NFNETLINK_V0);
        self.buf.extend_from_slice(&res_id.to_be_bytes());
    }

    fn put_attr(&mut self, ty: u16, value: &[u8]) {
        let len = (NLA_HDRLEN + value.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.pad();
    }

    fn put_attr_strz(&mut self, ty: u16, value: &str) {
        let len = (NLA_HDRLEN + value.len() + 1) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self.pad();
    }

    fn begin_nested(&mut self, ty: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        start
    }

    fn end_nested(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn pad(&mut self) {
        self.buf.resize(align4(self.buf.len()), 0);
    }
}

/// Raw `NETLINK_NETFILTER` socket.
struct Socket {
    fd: OwnedFd,
}

impl Socket {
    fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // SAFETY: `addr` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Error acks carry only the request header, not the whole request.
        let cap_ack: libc::c_int = 1;
        // SAFETY: `cap_ack` outlives the call and the length matches its type.
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_NETLINK,
                libc::NETLINK_CAP_ACK,
                &cap_ack as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::debug!(
                "NETLINK_CAP_ACK unavailable: {}",
                io::Error::last_os_error()
            );
        }

        Ok(Self { fd })
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        loop {
            // SAFETY: `buf` is a valid readable slice for its whole length.
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n as usize != buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short netlink send",
                ));
            }
            return Ok(());
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is a valid writable slice for its whole length.
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }

    /// Close the descriptor, reporting the close(2) result.
    fn close(self) -> io::Result<()> {
        let raw = self.fd.into_raw_fd();
        // SAFETY: `raw` was owned by `self` and is closed exactly once here.
        if unsafe { libc::close(raw) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

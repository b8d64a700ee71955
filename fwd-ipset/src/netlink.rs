//! Netlink plumbing for the ipset subsystem.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

const _: () = assert!(mem::size_of::<NlMsgHdr>() == 16);
const _: () = assert!(mem::size_of::<NfGenMsg>() == 4);

pub const NETLINK_NETFILTER: i32 = 12;

// Netlink message header flags
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

// Netlink message types
pub const NLMSG_ERROR: u16 = 0x02;

// Netlink attribute flags
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const NFNL_SUBSYS_IPSET: u8 = 6;

const NLA_ALIGNTO: usize = 4;

/// Kernel replies are never waited on longer than this
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

const RETRIES: usize = 3;

#[inline]
pub fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// struct nlmsghdr
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    pub const SIZE: usize = mem::size_of::<NlMsgHdr>();

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let u32_at = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u16_at = |at: usize| u16::from_ne_bytes([buf[at], buf[at + 1]]);
        Some(Self {
            nlmsg_len: u32_at(0),
            nlmsg_type: u16_at(4),
            nlmsg_flags: u16_at(6),
            nlmsg_seq: u32_at(8),
            nlmsg_pid: u32_at(12),
        })
    }
}

/// struct nfgenmsg
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NfGenMsg {
    pub nfgen_family: u8,
    pub version: u8,
    pub res_id: u16,
}

impl NfGenMsg {
    pub const SIZE: usize = mem::size_of::<NfGenMsg>();
}

fn retryable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EINTR)
    ) || err.raw_os_error() == Some(libc::EWOULDBLOCK)
}

fn kernel_addr() -> libc::sockaddr_nl {
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr
}

/// A NETLINK_NETFILTER socket bound to the kernel.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                NETLINK_NETFILTER,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let socket = Self { fd };

        let addr = kernel_addr();
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let timeout = libc::timeval {
            tv_sec: RECV_TIMEOUT.as_secs() as libc::time_t,
            tv_usec: 0,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as u32,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(socket)
    }

    /// Send one request and read one reply datagram.
    pub fn send_recv(&self, msg: &[u8], recv_buf: &mut [u8]) -> io::Result<usize> {
        let addr = kernel_addr();

        let sent = with_retry(|| unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        })?;
        if sent != msg.len() {
            return Err(io::Error::other("incomplete netlink send"));
        }

        with_retry(|| unsafe {
            libc::recv(
                self.fd,
                recv_buf.as_mut_ptr() as *mut libc::c_void,
                recv_buf.len(),
                0,
            )
        })
    }
}

fn with_retry(mut op: impl FnMut() -> isize) -> io::Result<usize> {
    let mut retries = RETRIES;
    loop {
        let ret = op();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if retries == 0 || !retryable(&err) {
            return Err(err);
        }
        retries -= 1;
        std::thread::sleep(Duration::from_millis(10));
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Builder for one netfilter netlink request.
pub struct MsgBuffer {
    data: Vec<u8>,
}

impl MsgBuffer {
    /// Start a request with the netlink and nfgenmsg headers in place.
    pub fn request(msg_type: u16, flags: u16, seq: u32, family: u8) -> Self {
        let mut buf = Self {
            data: Vec::with_capacity(256),
        };
        buf.put_u32(0); // length, patched by finish()
        buf.put_u16(msg_type);
        buf.put_u16(flags);
        buf.put_u32(seq);
        buf.put_u32(0);
        buf.data.push(family);
        buf.data.push(0); // NFNETLINK_V0
        buf.data.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    fn put_u16(&mut self, val: u16) {
        self.data.extend_from_slice(&val.to_ne_bytes());
    }

    fn put_u32(&mut self, val: u32) {
        self.data.extend_from_slice(&val.to_ne_bytes());
    }

    fn align(&mut self) {
        let aligned = nla_align(self.data.len());
        self.data.resize(aligned, 0);
    }

    /// Attribute with an arbitrary payload.
    pub fn put_attr(&mut self, attr_type: u16, payload: &[u8]) {
        self.put_u16((4 + payload.len()) as u16);
        self.put_u16(attr_type);
        self.data.extend_from_slice(payload);
        self.align();
    }

    pub fn put_attr_u8(&mut self, attr_type: u16, val: u8) {
        self.put_attr(attr_type, &[val]);
    }

    /// Host-order u32 attribute.
    pub fn put_attr_u32(&mut self, attr_type: u16, val: u32) {
        self.put_attr(attr_type, &val.to_ne_bytes());
    }

    /// Network-order u32 attribute, flagged as such.
    pub fn put_attr_u32_be(&mut self, attr_type: u16, val: u32) {
        self.put_attr(attr_type | NLA_F_NET_BYTEORDER, &val.to_be_bytes());
    }

    /// NUL-terminated string attribute.
    pub fn put_attr_str(&mut self, attr_type: u16, val: &str) {
        let mut payload = Vec::with_capacity(val.len() + 1);
        payload.extend_from_slice(val.as_bytes());
        payload.push(0);
        self.put_attr(attr_type, &payload);
    }

    /// Open a nested attribute, returning the offset to close it with.
    pub fn start_nested(&mut self, attr_type: u16) -> usize {
        let offset = self.data.len();
        self.put_u16(0);
        self.put_u16(attr_type | NLA_F_NESTED);
        offset
    }

    pub fn end_nested(&mut self, offset: usize) {
        let len = (self.data.len() - offset) as u16;
        self.data[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    /// Patch the message length and hand out the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.data.len() as u32;
        self.data[0..4].copy_from_slice(&len.to_ne_bytes());
        self.data
    }
}

/// One message out of a reply datagram.
#[derive(Debug)]
pub struct NlMsg<'a> {
    pub header: NlMsgHdr,
    pub payload: &'a [u8],
}

impl NlMsg<'_> {
    /// Errno carried by an NLMSG_ERROR message, 0 for an ACK.
    pub fn error(&self) -> Option<i32> {
        if self.header.nlmsg_type != NLMSG_ERROR || self.payload.len() < 4 {
            return None;
        }
        let code = i32::from_ne_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Some(-code)
    }

    /// Attributes following the nfgenmsg header.
    pub fn attrs(&self) -> AttrIter<'_> {
        AttrIter {
            buf: self.payload.get(NfGenMsg::SIZE..).unwrap_or_default(),
        }
    }
}

/// Iterate the messages packed into a reply datagram.
pub fn messages(buf: &[u8]) -> impl Iterator<Item = NlMsg<'_>> {
    let mut rest = buf;
    std::iter::from_fn(move || {
        let header = NlMsgHdr::parse(rest)?;
        let len = header.nlmsg_len as usize;
        if len < NlMsgHdr::SIZE || len > rest.len() {
            return None;
        }
        let msg = NlMsg {
            header,
            payload: &rest[NlMsgHdr::SIZE..len],
        };
        rest = rest.get(nla_align(len)..).unwrap_or_default();
        Some(msg)
    })
}

/// Iterator over (type, payload) pairs of a flat attribute list.
pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let attr_type = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        if len < 4 || len > self.buf.len() {
            return None;
        }
        let payload = &self.buf[4..len];
        self.buf = self.buf.get(nla_align(len)..).unwrap_or_default();
        Some((attr_type, payload))
    }
}

//! ipset commands over a netfilter netlink socket.

use std::net::IpAddr;

use crate::netlink::{messages, MsgBuffer, NetlinkSocket, NFNL_SUBSYS_IPSET, NLM_F_ACK, NLM_F_REQUEST};
use crate::{validate_set_name, IpSetCreateOptions, IpSetError, IpSetFamily, Result, SetHeader};

// ipset protocol constants
const IPSET_PROTOCOL: u8 = 7;

// ipset commands
const IPSET_CMD_CREATE: u8 = 2;
const IPSET_CMD_DESTROY: u8 = 3;
const IPSET_CMD_ADD: u8 = 9;
const IPSET_CMD_TEST: u8 = 11;
const IPSET_CMD_HEADER: u8 = 12;

// ipset attributes at command level
const IPSET_ATTR_PROTOCOL: u16 = 1;
const IPSET_ATTR_SETNAME: u16 = 2;
const IPSET_ATTR_TYPENAME: u16 = 3;
const IPSET_ATTR_REVISION: u16 = 4;
const IPSET_ATTR_FAMILY: u16 = 5;
const IPSET_ATTR_DATA: u16 = 7;
const IPSET_ATTR_LINENO: u16 = 9;

// ipset CADT attributes (inside IPSET_ATTR_DATA)
const IPSET_ATTR_IP: u16 = 1;
const IPSET_ATTR_TIMEOUT: u16 = 6;

// IP address attributes (inside IPSET_ATTR_IP)
const IPSET_ATTR_IPADDR_IPV4: u16 = 1;
const IPSET_ATTR_IPADDR_IPV6: u16 = 2;

// Kernel error codes, include/uapi/linux/netfilter/ipset/ip_set.h
const IPSET_ERR_PROTOCOL: i32 = 4097;
const IPSET_ERR_EXIST: i32 = 4103;

/// Revision of hash:ip that supports timeouts
const HASH_IP_REVISION: u8 = 4;

const RECV_BUF_SZ: usize = 4096;

fn ipset_msg_type(cmd: u8) -> u16 {
    ((NFNL_SUBSYS_IPSET as u16) << 8) | (cmd as u16)
}

fn family_u8(family: IpSetFamily) -> u8 {
    match family {
        IpSetFamily::Inet => libc::AF_INET as u8,
        IpSetFamily::Inet6 => libc::AF_INET6 as u8,
    }
}

fn family_from_u8(family: u8) -> Option<IpSetFamily> {
    match family as i32 {
        libc::AF_INET => Some(IpSetFamily::Inet),
        libc::AF_INET6 => Some(IpSetFamily::Inet6),
        _ => None,
    }
}

/// Read a NUL-terminated attribute string
fn attr_str(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// An open connection to the kernel's ipset subsystem.
///
/// Requests are synchronous; callers on an async runtime should keep
/// batches small or move them to a blocking thread.
pub struct IpsetConn {
    socket: NetlinkSocket,
    seq: u32,
}

impl IpsetConn {
    /// Open the netlink socket.
    ///
    /// Fails with a degraded error (see [`IpSetError::is_degraded`]) when the
    /// process lacks CAP_NET_ADMIN or the kernel has no netfilter netlink.
    pub fn open() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new()?,
            seq: 0,
        })
    }

    fn request(&mut self, cmd: u8, flags: u16, family: u8, setname: &str) -> MsgBuffer {
        self.seq = self.seq.wrapping_add(1);
        let mut buf = MsgBuffer::request(ipset_msg_type(cmd), NLM_F_REQUEST | flags, self.seq, family);
        buf.put_attr_u8(IPSET_ATTR_PROTOCOL, IPSET_PROTOCOL);
        buf.put_attr_str(IPSET_ATTR_SETNAME, setname);
        buf
    }

    /// Send a request that is answered by a bare ACK.
    fn execute(&mut self, buf: MsgBuffer, cmd: u8, setname: &str) -> Result<()> {
        let mut recv_buf = [0u8; RECV_BUF_SZ];
        let len = self.socket.send_recv(&buf.finish(), &mut recv_buf)?;

        let error = messages(&recv_buf[..len])
            .find_map(|msg| msg.error())
            .ok_or(IpSetError::ProtocolError("missing netlink ack"))?;

        match error {
            0 => Ok(()),
            libc::ENOENT => Err(IpSetError::SetNotFound(setname.to_string())),
            IPSET_ERR_EXIST if cmd == IPSET_CMD_TEST => Err(IpSetError::ElementNotFound),
            IPSET_ERR_EXIST | libc::EEXIST => Err(IpSetError::ElementExists),
            IPSET_ERR_PROTOCOL => Err(IpSetError::ProtocolError("kernel rejected ipset protocol")),
            code => Err(IpSetError::NetlinkError(code)),
        }
    }

    fn entry(&mut self, cmd: u8, setname: &str, ip: IpAddr) -> Result<()> {
        validate_set_name(setname)?;

        let (family, addr_type, addr_bytes) = match ip {
            IpAddr::V4(v4) => (IpSetFamily::Inet, IPSET_ATTR_IPADDR_IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (IpSetFamily::Inet6, IPSET_ATTR_IPADDR_IPV6, v6.octets().to_vec()),
        };

        let mut buf = self.request(cmd, NLM_F_ACK, family_u8(family), setname);
        let data = buf.start_nested(IPSET_ATTR_DATA);
        let ip_attr = buf.start_nested(IPSET_ATTR_IP);
        buf.put_attr(addr_type | crate::netlink::NLA_F_NET_BYTEORDER, &addr_bytes);
        buf.end_nested(ip_attr);
        buf.put_attr_u32(IPSET_ATTR_LINENO, 0);
        buf.end_nested(data);

        self.execute(buf, cmd, setname)
    }

    /// Look up a set's type and address family.
    pub fn header(&mut self, setname: &str) -> Result<SetHeader> {
        validate_set_name(setname)?;

        let buf = self.request(IPSET_CMD_HEADER, 0, libc::AF_INET as u8, setname);
        let mut recv_buf = [0u8; RECV_BUF_SZ];
        let len = self.socket.send_recv(&buf.finish(), &mut recv_buf)?;

        for msg in messages(&recv_buf[..len]) {
            match msg.error() {
                Some(libc::ENOENT) => return Err(IpSetError::SetNotFound(setname.to_string())),
                Some(0) => continue,
                Some(code) => return Err(IpSetError::NetlinkError(code)),
                None => {}
            }

            if msg.header.nlmsg_type != ipset_msg_type(IPSET_CMD_HEADER) {
                continue;
            }

            let mut type_name = None;
            let mut family = None;
            for (attr_type, payload) in msg.attrs() {
                match attr_type {
                    IPSET_ATTR_TYPENAME => type_name = Some(attr_str(payload)),
                    IPSET_ATTR_FAMILY => family = payload.first().copied().and_then(family_from_u8),
                    _ => {}
                }
            }

            return match (type_name, family) {
                (Some(type_name), Some(family)) => Ok(SetHeader {
                    name: setname.to_string(),
                    type_name,
                    family,
                }),
                _ => Err(IpSetError::ProtocolError("incomplete set header")),
            };
        }

        Err(IpSetError::ProtocolError("no set header in reply"))
    }

    /// Add an address to a set. Adding an existing member is `ElementExists`.
    pub fn add(&mut self, setname: &str, ip: IpAddr) -> Result<()> {
        self.entry(IPSET_CMD_ADD, setname, ip)
    }

    /// Test whether an address is in a set.
    pub fn test(&mut self, setname: &str, ip: IpAddr) -> Result<bool> {
        match self.entry(IPSET_CMD_TEST, setname, ip) {
            Ok(()) => Ok(true),
            Err(IpSetError::ElementNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a `hash:ip` set.
    pub fn create(&mut self, setname: &str, options: &IpSetCreateOptions) -> Result<()> {
        validate_set_name(setname)?;

        let family = family_u8(options.family);
        let mut buf = self.request(IPSET_CMD_CREATE, NLM_F_ACK, family, setname);
        buf.put_attr_str(IPSET_ATTR_TYPENAME, "hash:ip");
        buf.put_attr_u8(IPSET_ATTR_REVISION, HASH_IP_REVISION);
        buf.put_attr_u8(IPSET_ATTR_FAMILY, family);

        let data = buf.start_nested(IPSET_ATTR_DATA);
        if let Some(timeout) = options.timeout {
            buf.put_attr_u32_be(IPSET_ATTR_TIMEOUT, timeout);
        }
        buf.end_nested(data);

        self.execute(buf, IPSET_CMD_CREATE, setname)
    }

    /// Destroy a set.
    pub fn destroy(&mut self, setname: &str) -> Result<()> {
        validate_set_name(setname)?;

        let buf = self.request(IPSET_CMD_DESTROY, NLM_F_ACK, libc::AF_INET as u8, setname);
        self.execute(buf, IPSET_CMD_DESTROY, setname)
    }
}

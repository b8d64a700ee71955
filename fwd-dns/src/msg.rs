//! Message helpers shared by the client and its callers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::{Error, Result};

/// Reverse-lookup name for an IP address
///
/// `192.168.1.5` becomes `5.1.168.192.in-addr.arpa.`, IPv6 addresses expand
/// to one nibble per label under `ip6.arpa.`.
pub fn reverse_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", d, c, b, a)
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(73);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

/// Build a recursive query for `name` with a random message ID
pub fn build_query(name: &str, record_type: RecordType) -> Result<Message> {
    let name = Name::from_str(name)
        .map_err(|e| Error::Dns(format!("invalid query name '{}': {}", name, e)))?;

    let mut message = Message::new();
    message.set_id(rand::random::<u16>());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    Ok(message)
}

/// IP addresses carried in the answer section of a response
#[derive(Debug, Clone, Default)]
pub struct ResolvedIps {
    /// The queried domain name
    pub domain: String,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl ResolvedIps {
    /// Collect A and AAAA answers, `None` when there are none
    pub fn from_message(message: &Message) -> Option<Self> {
        let domain = message
            .queries()
            .first()
            .map(|q| q.name().to_ascii())
            .unwrap_or_default();

        let mut resolved = ResolvedIps {
            domain,
            ..Default::default()
        };

        for answer in message.answers() {
            match answer.data() {
                RData::A(a) => resolved.ipv4.push(a.0),
                RData::AAAA(aaaa) => resolved.ipv6.push(aaaa.0),
                _ => {}
            }
        }

        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    }

    /// Parse a raw response and collect its addresses
    pub fn from_bytes(response: &[u8]) -> Option<Self> {
        Message::from_vec(response)
            .ok()
            .and_then(|message| Self::from_message(&message))
    }

    /// All addresses, IPv4 first
    pub fn all_ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::with_capacity(self.ipv4.len() + self.ipv6.len());
        ips.extend(self.ipv4.iter().map(|ip| IpAddr::V4(*ip)));
        ips.extend(self.ipv6.iter().map(|ip| IpAddr::V6(*ip)));
        ips
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, AAAA, PTR};
    use hickory_proto::rr::Record;

    #[test]
    fn test_reverse_addr_v4() {
        assert_eq!(
            reverse_addr("192.168.1.5".parse().unwrap()),
            "5.1.168.192.in-addr.arpa."
        );
    }

    #[test]
    fn test_reverse_addr_v6() {
        let name = reverse_addr("2001:db8::1".parse().unwrap());
        assert!(name.starts_with("1.0.0.0.0.0.0.0."));
        assert!(name.ends_with("8.b.d.0.1.0.0.2.ip6.arpa."));
        // 32 nibbles plus "ip6" and "arpa"
        assert_eq!(name.trim_end_matches('.').split('.').count(), 34);
    }

    #[test]
    fn test_build_query() {
        let message = build_query("5.1.168.192.in-addr.arpa.", RecordType::PTR).unwrap();
        assert!(message.recursion_desired());
        assert_eq!(message.message_type(), MessageType::Query);
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::PTR);
    }

    #[test]
    fn test_resolved_ips_from_message() {
        let name = Name::from_str("example.com.").unwrap();
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);
        message.add_query(Query::query(name.clone(), RecordType::A));
        message.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        message.add_answer(Record::from_rdata(
            name.clone(),
            300,
            RData::AAAA(AAAA(Ipv6Addr::new(0x2606, 0x2800, 0x220, 1, 0, 0, 0, 1))),
        ));

        let resolved = ResolvedIps::from_message(&message).unwrap();
        assert_eq!(resolved.domain, "example.com.");
        assert_eq!(resolved.ipv4, vec![Ipv4Addr::new(93, 184, 216, 34)]);
        assert_eq!(resolved.all_ips().len(), 2);
    }

    #[test]
    fn test_resolved_ips_ignores_other_records() {
        let name = Name::from_str("5.1.168.192.in-addr.arpa.").unwrap();
        let mut message = Message::new();
        message.add_query(Query::query(name.clone(), RecordType::PTR));
        message.add_answer(Record::from_rdata(
            name,
            300,
            RData::PTR(PTR(Name::from_str("printer.lan.").unwrap())),
        ));

        assert!(ResolvedIps::from_message(&message).is_none());
    }
}

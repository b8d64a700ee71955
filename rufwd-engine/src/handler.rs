//! What happens to one inbound query
//!
//! A prepared [`Generation`] carries everything the pipeline needs. Queries
//! hold an `Arc` to the generation they started with, so a reconfiguration
//! never tears resources out from under them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use fwd_dns::{DnsClient, ResolvedIps};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::access::AccessPolicy;
use crate::autohost::AutohostTable;
use crate::classify::SubnetClassifier;
use crate::config::{BlockingMode, ServerConfig};
use crate::ipset::IpsetBinder;
use crate::ratelimit::RateLimiter;
use crate::rdns::ReverseRouter;
use crate::resolvers::LocalResolvers;

/// TTL of answers synthesized from DHCP leases
const AUTOHOST_TTL: u32 = 60;

/// Everything built by one successful prepare
pub struct Generation {
    pub conf: ServerConfig,
    /// Forwards served queries, with the response cache
    pub upstream: DnsClient,
    /// Internal lookups, never cached and never listening
    pub internal: DnsClient,
    pub local: LocalResolvers,
    pub access: AccessPolicy,
    pub ratelimit: RateLimiter,
    pub ipset: Arc<IpsetBinder>,
    pub self_addrs: Vec<String>,
    pub classifier: Arc<dyn SubnetClassifier>,
    pub autohost: Arc<AutohostTable>,
}

impl Generation {
    pub fn reverse_router(&self) -> ReverseRouter<'_> {
        ReverseRouter {
            classifier: self.classifier.as_ref(),
            local: &self.local,
            upstream: &self.internal,
        }
    }

    /// Answer a raw query from `client`
    ///
    /// `None` means the query is dropped without a reply: refused clients,
    /// clients over the rate limit and unparseable packets.
    pub async fn handle_query(&self, query: &[u8], client: IpAddr) -> Option<Vec<u8>> {
        if let Some(reason) = self.access.blocked_ip(client) {
            log::debug!("Dropping query from {}: {}", client, reason);
            return None;
        }

        if !self.ratelimit.allow(client) {
            log::debug!("Rate limit exceeded for {}", client);
            return None;
        }

        let request = match Message::from_vec(query) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Malformed query from {}: {}", client, e);
                return None;
            }
        };

        let Some(question) = request.queries().first() else {
            return encode(&reply(&request, ResponseCode::FormErr, Vec::new()));
        };
        let qname = question.name().to_ascii().to_ascii_lowercase();
        let qtype = question.query_type();

        if self.access.is_blocked_host(&qname) {
            log::debug!("Blocked host {} queried by {}", qname, client);
            return encode(&self.blocked_reply(&request, question.name(), qtype));
        }

        if let Some(response) = self.answer_locally(&request, question.name(), &qname, qtype).await {
            return encode(&response);
        }

        let response = match self.upstream.query(query).await {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Upstream failed for {} {}: {}", qname, qtype, e);
                return encode(&reply(&request, ResponseCode::ServFail, Vec::new()));
            }
        };

        if let Some(resolved) = ResolvedIps::from_bytes(&response) {
            self.ipset.process(&resolved.domain, &resolved.all_ips());
        }

        Some(response)
    }

    /// Answers that never reach the upstreams: DHCP hostnames and reverse
    /// lookups of locally-served addresses
    async fn answer_locally(
        &self,
        request: &Message,
        name: &Name,
        qname: &str,
        qtype: RecordType,
    ) -> Option<Message> {
        match qtype {
            RecordType::A | RecordType::AAAA => {
                let ip = self.autohost.ip_for_host(qname)?;
                let answers = match (qtype, ip) {
                    (RecordType::A, IpAddr::V4(v4)) => vec![record(name, RData::A(A(v4)), AUTOHOST_TTL)],
                    (RecordType::AAAA, IpAddr::V6(v6)) => {
                        vec![record(name, RData::AAAA(AAAA(v6)), AUTOHOST_TTL)]
                    }
                    _ => Vec::new(),
                };
                Some(reply(request, ResponseCode::NoError, answers))
            }
            RecordType::PTR => {
                let ip = parse_arpa(qname)?;

                if let Some(host) = self.autohost.host_for_ip(ip) {
                    let target = Name::from_str(&host).ok()?;
                    let answer = record(name, RData::PTR(PTR(target)), AUTOHOST_TTL);
                    return Some(reply(request, ResponseCode::NoError, vec![answer]));
                }

                if !self.classifier.is_locally_served(ip) {
                    return None;
                }

                match self.local.exchange(request).await {
                    Ok(mut response) => {
                        response.set_id(request.id());
                        Some(response)
                    }
                    Err(e) => {
                        log::debug!("Local PTR lookup for {} failed: {}", qname, e);
                        Some(reply(request, ResponseCode::ServFail, Vec::new()))
                    }
                }
            }
            _ => None,
        }
    }

    fn blocked_reply(&self, request: &Message, name: &Name, qtype: RecordType) -> Message {
        let conf = &self.conf;
        let ttl = conf.blocked_response_ttl;

        let address = |v4: Ipv4Addr, v6: Ipv6Addr| match qtype {
            RecordType::A => vec![record(name, RData::A(A(v4)), ttl)],
            RecordType::AAAA => vec![record(name, RData::AAAA(AAAA(v6)), ttl)],
            _ => Vec::new(),
        };

        match conf.blocking_mode {
            BlockingMode::Refused => reply(request, ResponseCode::Refused, Vec::new()),
            BlockingMode::Nxdomain => reply(request, ResponseCode::NXDomain, Vec::new()),
            BlockingMode::Default => match qtype {
                RecordType::A | RecordType::AAAA => reply(
                    request,
                    ResponseCode::NoError,
                    address(Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED),
                ),
                _ => reply(request, ResponseCode::NXDomain, Vec::new()),
            },
            BlockingMode::NullIp => reply(
                request,
                ResponseCode::NoError,
                address(Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED),
            ),
            BlockingMode::CustomIp => reply(
                request,
                ResponseCode::NoError,
                address(
                    conf.blocking_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    conf.blocking_ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED),
                ),
            ),
        }
    }
}

/// Response skeleton echoing the request's ID, flags and question
pub(crate) fn reply(request: &Message, code: ResponseCode, answers: Vec<Record>) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response.insert_answers(answers);
    response
}

fn record(name: &Name, data: RData, ttl: u32) -> Record {
    Record::from_rdata(name.clone(), ttl, data)
}

fn encode(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("Failed to encode DNS response: {}", e);
            None
        }
    }
}

/// Address named by an `in-addr.arpa.` or `ip6.arpa.` name
pub fn parse_arpa(name: &str) -> Option<IpAddr> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();

    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let labels: Vec<&str> = rest.split('.').collect();
        if labels.len() != 4 {
            return None;
        }
        for (i, label) in labels.iter().rev().enumerate() {
            octets[i] = label.parse().ok()?;
        }
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }

    if let Some(rest) = name.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, nibble) in nibbles.iter().rev().enumerate() {
            if nibble.len() != 1 {
                return None;
            }
            let value = u8::from_str_radix(nibble, 16).ok()?;
            bytes[i / 2] |= if i % 2 == 0 { value << 4 } else { value };
        }
        return Some(IpAddr::V6(Ipv6Addr::from(bytes)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwd_dns::reverse_addr;

    #[test]
    fn test_parse_arpa_v4() {
        assert_eq!(
            parse_arpa("5.1.168.192.in-addr.arpa."),
            Some("192.168.1.5".parse().unwrap())
        );
        assert_eq!(parse_arpa("1.168.192.in-addr.arpa."), None);
        assert_eq!(parse_arpa("x.1.168.192.in-addr.arpa."), None);
        assert_eq!(parse_arpa("example.org."), None);
    }

    #[test]
    fn test_parse_arpa_v6_matches_reverse_addr() {
        for ip in ["2001:db8::1", "fe80::1234:5678:9abc:def0", "::1"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert_eq!(parse_arpa(&reverse_addr(ip)), Some(ip));
        }
        assert_eq!(parse_arpa("1.0.ip6.arpa."), None);
    }

    #[test]
    fn test_reply_echoes_question() {
        let request = fwd_dns::build_query("example.org.", RecordType::A).unwrap();
        let response = reply(&request, ResponseCode::Refused, Vec::new());

        assert_eq!(response.id(), request.id());
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(response.queries(), request.queries());
        assert!(response.recursion_desired());
    }
}

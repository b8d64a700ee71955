//! Reverse lookups of client addresses

use std::net::IpAddr;
use std::time::Instant;

use fwd_dns::{build_query, reverse_addr, DnsClient};
use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};

use crate::classify::SubnetClassifier;
use crate::error::{Error, Result};
use crate::resolvers::LocalResolvers;

/// Paths a PTR query can take
pub struct ReverseRouter<'a> {
    pub classifier: &'a dyn SubnetClassifier,
    pub local: &'a LocalResolvers,
    pub upstream: &'a DnsClient,
}

impl ReverseRouter<'_> {
    /// Hostname for `ip`, without the trailing dot
    ///
    /// Locally-served addresses only go to the local resolvers. Transport
    /// errors are returned as they are.
    pub async fn lookup(&self, ip: IpAddr) -> Result<String> {
        let arpa = reverse_addr(ip);
        let request = build_query(&arpa, RecordType::PTR)?;

        let response = if self.classifier.is_locally_served(ip) {
            self.local.exchange(&request).await?
        } else {
            let started = Instant::now();
            let response = self.upstream.exchange(&request).await?;
            log::debug!("PTR {} resolved upstream in {:?}", arpa, started.elapsed());
            response
        };

        ptr_target(&response, &arpa)
    }
}

/// Target of the first answer, which must be a PTR record
pub fn ptr_target(response: &Message, arpa: &str) -> Result<String> {
    let first = response.answers().first().ok_or_else(|| Error::EmptyAnswer {
        arpa: arpa.to_string(),
    })?;

    match first.data() {
        RData::PTR(ptr) => {
            let target = ptr.0.to_ascii();
            Ok(target.strip_suffix('.').unwrap_or(&target).to_string())
        }
        _ => Err(Error::NotPtr),
    }
}

//! Server tests against fake upstreams on the loopback interface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

use rufwd_engine::{
    ArchClass, BlockReason, BlockingMode, Error, HookRegistry, HostNetwork, IpsetBackend, Lease,
    MemoryHookRegistry, Server, ServerConfig, StaticLeases, DEFAULT_HOOK_ID,
};

/// How the fake upstream answers PTR queries
#[derive(Clone, Copy)]
enum PtrAnswer {
    Name(&'static str),
    Empty,
    NotPtr,
}

/// Fake upstream: A gets 192.0.2.1, AAAA gets ::1, PTR per `ptr`
async fn spawn_upstream(ptr: PtrAnswer) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let request = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.set_response_code(ResponseCode::NoError);

            for q in request.queries() {
                response.add_query(q.clone());
                let rdata = match (q.query_type(), ptr) {
                    (RecordType::A, _) => RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
                    (RecordType::AAAA, _) => RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
                    (RecordType::PTR, PtrAnswer::Name(target)) => {
                        RData::PTR(PTR(Name::from_str(target).unwrap()))
                    }
                    (RecordType::PTR, PtrAnswer::NotPtr) => RData::A(A(Ipv4Addr::new(192, 0, 2, 2))),
                    _ => continue,
                };
                response.add_answer(Record::from_rdata(q.name().clone(), 300, rdata));
            }

            let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
        }
    });

    (addr, hits)
}

struct FakeNetwork {
    ifaces: Vec<IpAddr>,
    resolvers: Vec<String>,
}

impl HostNetwork for FakeNetwork {
    fn interface_addrs(&self) -> rufwd_engine::Result<Vec<IpAddr>> {
        Ok(self.ifaces.clone())
    }

    fn system_resolvers(&self) -> rufwd_engine::Result<Vec<String>> {
        Ok(self.resolvers.clone())
    }
}

fn loopback() -> Arc<FakeNetwork> {
    Arc::new(FakeNetwork {
        ifaces: vec!["127.0.0.1".parse().unwrap()],
        resolvers: Vec::new(),
    })
}

fn server() -> Server {
    Server::builder()
        .network(loopback())
        .arch(ArchClass::Standard)
        .build()
        .unwrap()
}

fn conf(upstream: SocketAddr, local: SocketAddr) -> ServerConfig {
    ServerConfig {
        udp_listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
        tcp_listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
        upstream_dns: vec![upstream.to_string()],
        local_ptr_resolvers: vec![local.to_string()],
        upstream_timeout: 2,
        ratelimit: 0,
        ..Default::default()
    }
}

fn query(name: &str, qtype: RecordType) -> Vec<u8> {
    fwd_dns::build_query(name, qtype).unwrap().to_vec().unwrap()
}

fn client() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

async fn serve(server: &Server, name: &str, qtype: RecordType) -> Message {
    let response = server.serve_dns(&query(name, qtype), client()).await.unwrap();
    Message::from_vec(&response).unwrap()
}

/// Ask the server's UDP listener
async fn ask_udp(server_addr: SocketAddr, name: &str) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&query(name, RecordType::A), server_addr).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no reply from server")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

fn first_a(message: &Message) -> Option<Ipv4Addr> {
    message.answers().iter().find_map(|r| match r.data() {
        RData::A(a) => Some(a.0),
        _ => None,
    })
}

#[tokio::test]
async fn test_exchange_disabled_is_not_attempted() {
    let (upstream, hits) = spawn_upstream(PtrAnswer::Name("host.example.com.")).await;
    let server = server();
    let conf = ServerConfig {
        resolve_clients: false,
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();

    for ip in ["8.8.8.8", "192.168.1.5", "::1"] {
        assert_eq!(server.exchange(ip.parse().unwrap()).await.unwrap(), None);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exchange_strips_trailing_dot() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Name("host.example.com.")).await;
    let server = server();
    server.prepare(conf(upstream, upstream)).await.unwrap();

    let host = server.exchange("8.8.8.8".parse().unwrap()).await.unwrap();
    assert_eq!(host.as_deref(), Some("host.example.com"));
}

#[tokio::test]
async fn test_exchange_empty_answer() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    server.prepare(conf(upstream, upstream)).await.unwrap();

    let err = server.exchange("8.8.8.8".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::EmptyAnswer { ref arpa } if arpa == "8.8.8.8.in-addr.arpa."));
}

#[tokio::test]
async fn test_exchange_not_ptr() {
    let (upstream, _) = spawn_upstream(PtrAnswer::NotPtr).await;
    let server = server();
    server.prepare(conf(upstream, upstream)).await.unwrap();

    let err = server.exchange("8.8.8.8".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::NotPtr));
}

#[tokio::test]
async fn test_exchange_routes_by_locality() {
    let (upstream, upstream_hits) = spawn_upstream(PtrAnswer::Name("public.example.")).await;
    let (local, local_hits) = spawn_upstream(PtrAnswer::Name("nas.home.")).await;
    let server = server();
    server.prepare(conf(upstream, local)).await.unwrap();

    let private = server.exchange("192.168.1.5".parse().unwrap()).await.unwrap();
    assert_eq!(private.as_deref(), Some("nas.home"));
    assert_eq!(local_hits.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_hits.load(Ordering::SeqCst), 0);

    let public = server.exchange("8.8.8.8".parse().unwrap()).await.unwrap();
    assert_eq!(public.as_deref(), Some("public.example"));
    assert_eq!(local_hits.load(Ordering::SeqCst), 1);
    assert_eq!(upstream_hits.load(Ordering::SeqCst), 1);

    let (resolvers, resolve_clients) = server.rdns_settings().await;
    assert_eq!(resolvers, vec![local.to_string()]);
    assert!(resolve_clients);
}

#[tokio::test]
async fn test_exchange_without_local_resolvers() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Name("public.example.")).await;
    let server = server();
    let conf = ServerConfig {
        local_ptr_resolvers: Vec::new(),
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();

    let err = server.exchange("10.0.0.1".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::Dns(fwd_dns::Error::NoUpstreams)));
}

#[tokio::test]
async fn test_resolve_works_before_start() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();

    assert!(matches!(server.resolve("example.org").await, Err(Error::NotPrepared)));

    server.prepare(conf(upstream, upstream)).await.unwrap();
    let ips = server.resolve("example.org").await.unwrap();
    assert!(ips.contains(&"192.0.2.1".parse().unwrap()));
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_self_addresses_excluded_from_system_resolvers() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let network = Arc::new(FakeNetwork {
        ifaces: vec!["2.2.2.2".parse().unwrap()],
        resolvers: vec!["1.1.1.1".into(), "2.2.2.2".into()],
    });

    let conf = ServerConfig {
        udp_listen_addrs: vec!["2.2.2.2:53".parse().unwrap()],
        tcp_listen_addrs: Vec::new(),
        ..conf(upstream, upstream)
    };

    let self_addrs = rufwd_engine::collect_self_addrs(&conf, network.as_ref()).unwrap();
    assert_eq!(self_addrs, vec!["2.2.2.2"]);

    let local = rufwd_engine::LocalResolvers::setup(&[], &self_addrs, network.as_ref()).unwrap();
    assert_eq!(local.addrs().to_vec(), vec!["1.1.1.1".to_string()]);
}

#[tokio::test]
async fn test_wildcard_listen_expands_to_interfaces() {
    let network = FakeNetwork {
        ifaces: vec!["127.0.0.1".parse().unwrap(), "192.168.7.1".parse().unwrap(), "fe80::1".parse().unwrap()],
        resolvers: Vec::new(),
    };
    let conf = ServerConfig {
        udp_listen_addrs: vec!["0.0.0.0:53".parse().unwrap()],
        ..Default::default()
    };

    let addrs = rufwd_engine::collect_self_addrs(&conf, &network).unwrap();
    assert_eq!(addrs, vec!["127.0.0.1", "192.168.7.1", "fe80::1"]);
    assert!(!addrs.contains(&"0.0.0.0".to_string()));
}

#[test]
fn test_set_subtract() {
    let a: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let mut diff = rufwd_engine::set_subtract(&a, &["b".to_string()]);
    diff.sort();
    assert_eq!(diff, vec!["a", "c"]);
}

#[tokio::test]
async fn test_failed_reconfigure_leaves_server_stopped() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    let bad = ServerConfig {
        blocking_mode: BlockingMode::CustomIp,
        blocking_ipv4: Some(Ipv4Addr::new(192, 0, 2, 9)),
        ..conf(upstream, upstream)
    };

    assert!(!server.is_running().await);
    let err = server.reconfigure(bad.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Reconfigure(_)));
    assert!(err.is_config_error());
    assert!(err.to_string().starts_with("could not reconfigure the server: "));
    assert!(!server.is_running().await);

    server.prepare(conf(upstream, upstream)).await.unwrap();
    server.start().await.unwrap();
    assert!(server.is_running().await);

    assert!(server.reconfigure(bad).await.is_err());
    assert!(!server.is_running().await);
    assert!(server.local_addrs().await.is_empty());
}

#[tokio::test]
async fn test_reconfigure_applies_new_config() {
    let (first, _) = spawn_upstream(PtrAnswer::Name("first.example.")).await;
    let (second, _) = spawn_upstream(PtrAnswer::Name("second.example.")).await;
    let server = server();

    server.prepare(conf(first, first)).await.unwrap();
    server.start().await.unwrap();
    assert_eq!(
        server.exchange("8.8.8.8".parse().unwrap()).await.unwrap().as_deref(),
        Some("first.example")
    );

    server.reconfigure(conf(second, second)).await.unwrap();
    assert!(server.is_running().await);
    assert_eq!(
        server.exchange("8.8.8.8".parse().unwrap()).await.unwrap().as_deref(),
        Some("second.example")
    );

    let udp = server.local_addrs().await[0];
    assert_eq!(first_a(&ask_udp(udp, "example.org.").await), Some(Ipv4Addr::new(192, 0, 2, 1)));

    server.close().await;
}

#[tokio::test]
async fn test_start_stop_start_serves_each_time() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    server.prepare(conf(upstream, upstream)).await.unwrap();

    for _ in 0..2 {
        server.start().await.unwrap();
        assert!(server.is_running().await);

        let udp = server.local_addrs().await[0];
        let response = ask_udp(udp, "example.org.").await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(192, 0, 2, 1)));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
    }
}

#[tokio::test]
async fn test_bind_failure_keeps_server_stopped() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server = server();
    let conf = ServerConfig {
        udp_listen_addrs: vec![taken.local_addr().unwrap()],
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_access_policy() {
    let (upstream, hits) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    let deny = ServerConfig {
        disallowed_clients: vec!["192.168.1.0/24".into()],
        ..conf(upstream, upstream)
    };
    server.prepare(deny).await.unwrap();

    let banned: IpAddr = "192.168.1.66".parse().unwrap();
    assert_eq!(
        server.is_blocked_ip(banned).await,
        Some(BlockReason::Disallowed("192.168.1.0/24".into()))
    );
    assert_eq!(server.is_blocked_ip(client()).await, None);

    assert!(server.serve_dns(&query("example.org.", RecordType::A), banned).await.is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Dual-stack listeners see IPv4 clients as IPv4-mapped IPv6
    let mapped: IpAddr = "::ffff:192.168.1.66".parse().unwrap();
    assert_eq!(
        server.is_blocked_ip(mapped).await,
        Some(BlockReason::Disallowed("192.168.1.0/24".into()))
    );
    assert!(server.serve_dns(&query("example.org.", RecordType::A), mapped).await.is_none());

    let server = self::server();
    let allow = ServerConfig {
        allowed_clients: vec!["10.0.0.0/8".into()],
        ..conf(upstream, upstream)
    };
    server.prepare(allow).await.unwrap();
    assert_eq!(server.is_blocked_ip(client()).await, Some(BlockReason::NotAllowed));
    assert_eq!(server.is_blocked_ip("10.1.2.3".parse().unwrap()).await, None);
    assert_eq!(server.is_blocked_ip("::ffff:10.1.2.3".parse().unwrap()).await, None);
}

#[tokio::test]
async fn test_fingerprint_hosts_follow_blocking_mode() {
    let (upstream, hits) = spawn_upstream(PtrAnswer::Empty).await;

    let cases = [
        (BlockingMode::Refused, ResponseCode::Refused, None),
        (BlockingMode::Nxdomain, ResponseCode::NXDomain, None),
        (BlockingMode::NullIp, ResponseCode::NoError, Some(Ipv4Addr::UNSPECIFIED)),
        (BlockingMode::CustomIp, ResponseCode::NoError, Some(Ipv4Addr::new(192, 0, 2, 99))),
    ];

    for (mode, code, address) in cases {
        let server = server();
        let conf = ServerConfig {
            blocking_mode: mode,
            blocking_ipv4: Some(Ipv4Addr::new(192, 0, 2, 99)),
            blocking_ipv6: Some("2001:db8::99".parse().unwrap()),
            blocked_response_ttl: 42,
            ..conf(upstream, upstream)
        };
        server.prepare(conf).await.unwrap();

        let response = serve(&server, "version.bind.", RecordType::A).await;
        assert_eq!(response.response_code(), code, "{:?}", mode);
        assert_eq!(first_a(&response), address, "{:?}", mode);
        if address.is_some() {
            assert_eq!(response.answers()[0].ttl(), 42);
        }
    }

    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_autohost_answers_without_upstream() {
    let (upstream, hits) = spawn_upstream(PtrAnswer::Name("public.example.")).await;
    let leases = Arc::new(StaticLeases::new(vec![Lease::new(
        "printer",
        "192.168.1.20".parse().unwrap(),
    )]));

    let server = Server::builder()
        .network(loopback())
        .dhcp(leases.clone())
        .build()
        .unwrap();
    server.prepare(conf(upstream, upstream)).await.unwrap();

    let response = serve(&server, "printer.lan.", RecordType::A).await;
    assert_eq!(first_a(&response), Some(Ipv4Addr::new(192, 168, 1, 20)));

    let response = serve(&server, "20.1.168.192.in-addr.arpa.", RecordType::PTR).await;
    match response.answers()[0].data() {
        RData::PTR(ptr) => assert_eq!(ptr.0.to_ascii(), "printer.lan."),
        other => panic!("unexpected answer {:?}", other),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    leases.upsert(Lease::new("tv", "192.168.1.21".parse().unwrap()));
    let response = serve(&server, "tv.lan.", RecordType::A).await;
    assert_eq!(first_a(&response), Some(Ipv4Addr::new(192, 168, 1, 21)));

    leases.replace(Vec::new());
    assert!(server.autohost().is_empty());
    assert_eq!(server.autohost().host_for_ip("192.168.1.20".parse().unwrap()), None);

    let response = serve(&server, "printer.lan.", RecordType::A).await;
    assert_eq!(first_a(&response), Some(Ipv4Addr::new(192, 0, 2, 1)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    let conf = ServerConfig {
        ratelimit: 1,
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();

    let q = query("example.org.", RecordType::A);
    assert!(server.serve_dns(&q, client()).await.is_some());
    assert!(server.serve_dns(&q, client()).await.is_none());
}

#[derive(Default)]
struct FakeKernel {
    sets: Vec<&'static str>,
    adds: Arc<Mutex<Vec<(String, IpAddr)>>>,
}

impl IpsetBackend for FakeKernel {
    fn header(&mut self, set: &str) -> fwd_ipset::Result<fwd_ipset::SetHeader> {
        if self.sets.contains(&set) {
            Ok(fwd_ipset::SetHeader {
                name: set.to_string(),
                type_name: "hash:ip".to_string(),
                family: fwd_ipset::IpSetFamily::Inet,
            })
        } else {
            Err(fwd_ipset::IpSetError::SetNotFound(set.to_string()))
        }
    }

    fn add(&mut self, set: &str, ip: IpAddr) -> fwd_ipset::Result<()> {
        self.adds.lock().unwrap().push((set.to_string(), ip));
        Ok(())
    }
}

#[tokio::test]
async fn test_ipset_degraded_is_not_fatal() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = Server::builder()
        .network(loopback())
        .ipset_opener(Arc::new(|| Err(fwd_ipset::IpSetError::UnsupportedPlatform)))
        .build()
        .unwrap();

    let conf = ServerConfig {
        ipset: vec!["example.org/vpn".into()],
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();
}

#[tokio::test]
async fn test_ipset_missing_set_is_fatal() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = Server::builder()
        .network(loopback())
        .ipset_opener(Arc::new(|| {
            Ok(Box::new(FakeKernel::default()) as Box<dyn IpsetBackend>)
        }))
        .build()
        .unwrap();

    let conf = ServerConfig {
        ipset: vec!["example.org/vpn".into()],
        ..conf(upstream, upstream)
    };
    assert!(matches!(server.prepare(conf).await, Err(Error::Ipset(_))));
}

#[tokio::test]
async fn test_ipset_receives_resolved_addresses() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let adds = Arc::new(Mutex::new(Vec::new()));

    let sink = adds.clone();
    let server = Server::builder()
        .network(loopback())
        .ipset_opener(Arc::new(move || {
            Ok(Box::new(FakeKernel {
                sets: vec!["vpn"],
                adds: sink.clone(),
            }) as Box<dyn IpsetBackend>)
        }))
        .build()
        .unwrap();

    let conf = ServerConfig {
        ipset: vec!["example.org/vpn".into()],
        ..conf(upstream, upstream)
    };
    server.prepare(conf).await.unwrap();

    serve(&server, "www.example.org.", RecordType::A).await;
    serve(&server, "example.net.", RecordType::A).await;

    // Closing lets the ipset worker flush its queue and exit
    server.close().await;
    for _ in 0..100 {
        if !adds.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let adds = adds.lock().unwrap();
    assert_eq!(*adds, vec![("vpn".to_string(), "192.0.2.1".parse().unwrap())]);
}

#[tokio::test]
async fn test_serve_dns_after_close() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let server = server();
    server.prepare(conf(upstream, upstream)).await.unwrap();
    assert!(server.serve_dns(&query("example.org.", RecordType::A), client()).await.is_some());

    server.close().await;
    assert!(server.serve_dns(&query("example.org.", RecordType::A), client()).await.is_none());
    assert!(matches!(server.start().await, Err(Error::NotPrepared)));
}

#[tokio::test]
async fn test_hook_registered_once_across_servers() {
    let (upstream, _) = spawn_upstream(PtrAnswer::Empty).await;
    let registry = Arc::new(MemoryHookRegistry::new());

    let first = Server::builder()
        .network(loopback())
        .hook_registry(registry.clone(), DEFAULT_HOOK_ID)
        .build()
        .unwrap();
    let second = Server::builder()
        .network(loopback())
        .hook_registry(registry.clone(), DEFAULT_HOOK_ID)
        .build()
        .unwrap();

    first.prepare(conf(upstream, upstream)).await.unwrap();
    second.prepare(conf(upstream, upstream)).await.unwrap();
    first.reconfigure(conf(upstream, upstream)).await.unwrap();
    assert_eq!(registry.len(), 1);

    let hook = registry.get(DEFAULT_HOOK_ID).unwrap();
    let q = query("example.org.", RecordType::A);
    assert!(hook.serve_dns(&q, client()).await.is_some());

    // The hook follows the first server, not the second
    first.close().await;
    assert!(hook.serve_dns(&q, client()).await.is_none());
    assert!(second.serve_dns(&q, client()).await.is_some());

    // A registry the servers do not know about is untouched
    let other = MemoryHookRegistry::new();
    assert!(other.is_empty());
    assert!(other.register(DEFAULT_HOOK_ID, hook));
}

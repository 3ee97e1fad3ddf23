use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, info, warn};

use crate::cache::{self, Cache};
use crate::client::Exchanger;
use crate::config::HijackMode;
use crate::dnsutil;
use crate::hosts::Matcher;
use crate::querylog::QueryLog;

/// TTL of synthesized hijack answers.
const HIJACK_TTL: u32 = 3600;

/// A finished reply plus the log record that becomes visible once the reply
/// has been written. Call [`Proxy::record`] after the socket write so the
/// reply is always observable before its log entry.
pub struct Answer {
    pub bytes: Bytes,
    log: Option<LogParts>,
}

impl Answer {
    fn unlogged(bytes: Bytes) -> Answer {
        Answer { bytes, log: None }
    }
}

struct LogParts {
    remote_addr: IpAddr,
    hijacked: bool,
    qtype: u16,
    question: String,
    answers: Vec<String>,
}

/// Per-query pipeline: hijack policy, cache, upstream forwarding and request
/// logging.
pub struct Proxy {
    hijack_mode: HijackMode,
    matcher: Matcher,
    cache: Arc<Cache>,
    client: Arc<dyn Exchanger>,
    querylog: Arc<QueryLog>,
}

impl Proxy {
    pub fn new(
        hijack_mode: HijackMode,
        matcher: Matcher,
        cache: Arc<Cache>,
        client: Arc<dyn Exchanger>,
        querylog: Arc<QueryLog>,
    ) -> Proxy {
        Proxy {
            hijack_mode,
            matcher,
            cache,
            client,
            querylog,
        }
    }

    /// Synchronous fast path: hijacked names and cache hits are answered
    /// without spawning. Returns None when the query needs the async path.
    pub fn handle_packet_fast(&self, packet: &[u8], peer: SocketAddr) -> Option<Answer> {
        let req = dnsutil::decode(packet).ok()?;
        if req.queries().len() != 1 {
            debug!(client_ip = %peer.ip(), "rejecting query with bad question count");
            return dnsutil::servfail(packet).map(Answer::unlogged);
        }
        self.answer_local(&req, peer)
    }

    /// Full pipeline, used when the fast path declined: parse, hijack,
    /// cache, forward, SERVFAIL on failure. Returns None only when not even
    /// an error reply can be produced.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Option<Answer> {
        let req = match dnsutil::decode(packet) {
            Ok(req) => req,
            Err(err) => {
                debug!(client_ip = %peer.ip(), error = %err, "dropping unparseable query");
                return dnsutil::servfail(packet).map(Answer::unlogged);
            }
        };
        if req.queries().len() != 1 {
            debug!(client_ip = %peer.ip(), "rejecting query with bad question count");
            return dnsutil::servfail(packet).map(Answer::unlogged);
        }
        if let Some(answer) = self.answer_local(&req, peer) {
            return Some(answer);
        }

        let question = req.queries().first()?;
        let fqdn = question.name().to_lowercase().to_string();
        let qtype = u16::from(question.query_type());
        let key = cache::new_key(&fqdn, qtype, u16::from(question.query_class()));

        match self.client.exchange(&req).await {
            Ok(reply) => {
                self.cache.set(key, reply.clone()).await;
                let bytes = dnsutil::encode(&reply).ok()?;
                Some(Answer {
                    bytes,
                    log: Some(LogParts {
                        remote_addr: peer.ip(),
                        hijacked: false,
                        qtype,
                        question: fqdn,
                        answers: dnsutil::answers(&reply),
                    }),
                })
            }
            Err(err) => {
                warn!(qname = %fqdn, client_ip = %peer.ip(), error = %err, "forwarding failed");
                dnsutil::servfail(packet).map(Answer::unlogged)
            }
        }
    }

    /// Enqueues the log record of an answer. Must run after the reply was
    /// written to the client.
    pub fn record(&self, answer: Answer) {
        if let Some(log) = answer.log {
            self.querylog.record(
                log.remote_addr,
                log.hijacked,
                log.qtype,
                log.question,
                log.answers,
            );
        }
    }

    /// Answers that need no upstream: hijacked names and cache hits. Shared
    /// by the synchronous fast path and the forwarding path.
    fn answer_local(&self, req: &Message, peer: SocketAddr) -> Option<Answer> {
        let question = req.queries().first()?;
        let fqdn = question.name().to_lowercase().to_string();
        let bare = fqdn.strip_suffix('.').unwrap_or(&fqdn);
        let qtype = u16::from(question.query_type());

        if let Some(answers) = self.hijack(question.name(), bare, question.query_type()) {
            let mut reply = dnsutil::reply_to(req);
            for answer in answers {
                reply.add_answer(answer);
            }
            let bytes = dnsutil::encode(&reply).ok()?;
            info!(qname = %fqdn, client_ip = %peer.ip(), "hijacking request");
            return Some(Answer {
                bytes,
                log: Some(LogParts {
                    remote_addr: peer.ip(),
                    hijacked: true,
                    qtype,
                    question: fqdn,
                    answers: dnsutil::answers(&reply),
                }),
            });
        }

        let key = cache::new_key(&fqdn, qtype, u16::from(question.query_class()));
        if let Some(mut msg) = self.cache.get(key) {
            msg.set_id(req.id());
            let bytes = dnsutil::encode(&msg).ok()?;
            return Some(Answer {
                bytes,
                log: Some(LogParts {
                    remote_addr: peer.ip(),
                    hijacked: false,
                    qtype,
                    question: fqdn,
                    answers: dnsutil::answers(&msg),
                }),
            });
        }
        None
    }

    /// The synthesized answer records for a hijacked name, or None when the
    /// request should be forwarded instead. Answer records carry the
    /// question's owner name as sent.
    fn hijack(&self, name: &Name, bare_name: &str, qtype: RecordType) -> Option<Vec<Record>> {
        let ips = self.matcher.lookup(bare_name)?;
        match self.hijack_mode {
            HijackMode::Zero => match qtype {
                RecordType::A => Some(vec![a_record(name, Ipv4Addr::UNSPECIFIED)]),
                RecordType::AAAA => Some(vec![aaaa_record(name, Ipv6Addr::UNSPECIFIED)]),
                _ => None,
            },
            HijackMode::Empty => Some(Vec::new()),
            HijackMode::Hosts => match qtype {
                RecordType::A => Some(
                    ips.iter()
                        .filter_map(|ip| match ip {
                            IpAddr::V4(v4) => Some(a_record(name, *v4)),
                            IpAddr::V6(_) => None,
                        })
                        .collect(),
                ),
                RecordType::AAAA => Some(
                    ips.iter()
                        .filter_map(|ip| match ip {
                            IpAddr::V6(v6) => Some(aaaa_record(name, *v6)),
                            IpAddr::V4(_) => None,
                        })
                        .collect(),
                ),
                _ => None,
            },
        }
    }
}

fn a_record(name: &Name, ip: Ipv4Addr) -> Record {
    Record::from_rdata(name.clone(), HIJACK_TTL, RData::A(A(ip)))
}

fn aaaa_record(name: &Name, ip: Ipv6Addr) -> Record {
    Record::from_rdata(name.clone(), HIJACK_TTL, RData::AAAA(AAAA(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Resolver;
    use crate::config::ResolverProtocol;
    use crate::hosts;
    use crate::querylog::LogMode;
    use crate::sql::Store;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::DNSClass;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn peer() -> SocketAddr {
        "10.1.2.3:53000".parse().unwrap()
    }

    fn query(id: u16, name: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_utf8(name).unwrap());
        q.set_query_type(qtype);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn canned_reply(req: &Message, ip: &str, ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_recursion_available(true);
        let q = req.queries().first().unwrap();
        msg.add_query(q.clone());
        msg.add_answer(Record::from_rdata(
            q.name().clone(),
            ttl,
            RData::A(A(ip.parse().unwrap())),
        ));
        msg
    }

    struct CountingExchanger {
        ip: &'static str,
        ttl: u32,
        calls: AtomicUsize,
    }

    impl CountingExchanger {
        fn new(ip: &'static str, ttl: u32) -> Arc<Self> {
            Arc::new(Self {
                ip,
                ttl,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Exchanger for CountingExchanger {
        async fn exchange(&self, msg: &Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(canned_reply(msg, self.ip, self.ttl))
        }
    }

    struct FailingExchanger;

    #[async_trait]
    impl Exchanger for FailingExchanger {
        async fn exchange(&self, _msg: &Message) -> Result<Message> {
            bail!("all upstreams down")
        }
    }

    fn matcher_with(entries: &str) -> Matcher {
        let matcher = Matcher::empty();
        matcher.install(hosts::parse(Cursor::new(entries)).unwrap());
        matcher
    }

    fn proxy(
        mode: HijackMode,
        matcher: Matcher,
        client: Arc<dyn Exchanger>,
        querylog: Arc<QueryLog>,
    ) -> Proxy {
        Proxy::new(mode, matcher, Arc::new(Cache::new(128, None)), client, querylog)
    }

    fn discard_log() -> Arc<QueryLog> {
        Arc::new(QueryLog::new(None, LogMode::Discard, Duration::ZERO))
    }

    #[tokio::test]
    async fn hijack_a_with_zero_mode() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let querylog = Arc::new(QueryLog::new(
            Some(Arc::clone(&store)),
            LogMode::All,
            Duration::ZERO,
        ));
        let p = proxy(
            HijackMode::Zero,
            matcher_with("192.0.2.1 badhost1\n"),
            CountingExchanger::new("192.0.2.9", 60),
            Arc::clone(&querylog),
        );

        let req = query(0x4242, "badhost1.", RecordType::A);
        let answer = p
            .handle_packet_fast(&req.to_vec().unwrap(), peer())
            .expect("hijacked answer");
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.id(), 0x4242);
        assert!(reply.recursion_available());
        assert_eq!(reply.answers().len(), 1);
        let record = &reply.answers()[0];
        assert_eq!(record.ttl(), HIJACK_TTL);
        assert_eq!(record.data(), Some(&RData::A(A(Ipv4Addr::UNSPECIFIED))));

        p.record(answer);
        querylog.close().await;
        let entries = querylog.read(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].hijacked);
        assert_eq!(entries[0].qtype, u16::from(RecordType::A));
        assert_eq!(entries[0].question, "badhost1.");
        assert_eq!(entries[0].answers, vec!["0.0.0.0"]);
    }

    #[tokio::test]
    async fn hijack_hosts_mode_splits_families() {
        let p = proxy(
            HijackMode::Hosts,
            matcher_with("192.0.2.1 badhost1\n2001:db8::1 badhost1\n"),
            CountingExchanger::new("192.0.2.9", 60),
            discard_log(),
        );

        let req = query(1, "badhost1.", RecordType::AAAA);
        let answer = p.handle_packet_fast(&req.to_vec().unwrap(), peer()).unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(dnsutil::answers(&reply), vec!["2001:db8::1"]);

        let req = query(2, "badhost1.", RecordType::A);
        let answer = p.handle_packet_fast(&req.to_vec().unwrap(), peer()).unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(dnsutil::answers(&reply), vec!["192.0.2.1"]);
    }

    #[tokio::test]
    async fn hijack_empty_mode_answers_any_qtype_with_no_records() {
        let p = proxy(
            HijackMode::Empty,
            matcher_with("192.0.2.1 badhost1\n"),
            CountingExchanger::new("192.0.2.9", 60),
            discard_log(),
        );
        let req = query(7, "badhost1.", RecordType::MX);
        let answer = p.handle_packet_fast(&req.to_vec().unwrap(), peer()).unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn zero_mode_forwards_other_qtypes() {
        let exchanger = CountingExchanger::new("192.0.2.9", 60);
        let p = proxy(
            HijackMode::Zero,
            matcher_with("192.0.2.1 badhost1\n"),
            exchanger.clone(),
            discard_log(),
        );
        let req = query(7, "badhost1.", RecordType::MX);
        assert!(p.handle_packet_fast(&req.to_vec().unwrap(), peer()).is_none());
        let answer = p.handle_packet(&req.to_vec().unwrap(), peer()).await.unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn case_is_ignored_when_matching_hijacked_names() {
        let p = proxy(
            HijackMode::Zero,
            matcher_with("192.0.2.1 badhost1\n"),
            CountingExchanger::new("192.0.2.9", 60),
            discard_log(),
        );
        let req = query(1, "BadHost1.", RecordType::A);
        assert!(p.handle_packet_fast(&req.to_vec().unwrap(), peer()).is_some());
    }

    #[tokio::test]
    async fn cache_hit_preserves_request_identity() {
        let exchanger = CountingExchanger::new("192.0.2.1", 60);
        let p = proxy(
            HijackMode::Zero,
            Matcher::empty(),
            exchanger.clone(),
            discard_log(),
        );

        let first = query(0x1234, "example.com.", RecordType::A);
        let packet = first.to_vec().unwrap();
        assert!(p.handle_packet_fast(&packet, peer()).is_none());
        let answer = p.handle_packet(&packet, peer()).await.unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.id(), 0x1234);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);

        // Second request for the same question hits the cache: same answer,
        // new id, no upstream call.
        let second = query(0x5678, "example.com.", RecordType::A);
        let answer = p
            .handle_packet_fast(&second.to_vec().unwrap(), peer())
            .expect("cache hit");
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.id(), 0x5678);
        assert_eq!(dnsutil::answers(&reply), vec!["192.0.2.1"]);
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multi_question_queries_get_servfail() {
        let p = proxy(
            HijackMode::Zero,
            Matcher::empty(),
            CountingExchanger::new("192.0.2.1", 60),
            discard_log(),
        );
        let mut req = query(0x9999, "example.com.", RecordType::A);
        let mut extra = Query::new();
        extra.set_name(Name::from_utf8("other.example.").unwrap());
        extra.set_query_type(RecordType::A);
        extra.set_query_class(DNSClass::IN);
        req.add_query(extra);

        let answer = p
            .handle_packet_fast(&req.to_vec().unwrap(), peer())
            .expect("servfail");
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.id(), 0x9999);
        assert!(answer.log.is_none());
    }

    #[tokio::test]
    async fn upstream_failure_becomes_servfail() {
        let p = proxy(
            HijackMode::Zero,
            Matcher::empty(),
            Arc::new(FailingExchanger),
            discard_log(),
        );
        let req = query(0x0404, "example.com.", RecordType::A);
        let answer = p.handle_packet(&req.to_vec().unwrap(), peer()).await.unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.id(), 0x0404);
        assert!(answer.log.is_none());
    }

    #[tokio::test]
    async fn racing_resolvers_end_to_end() {
        // Two loopback upstreams: the slow one answers 192.0.2.1 after a
        // delay, the fast one answers 192.0.2.2 immediately.
        async fn spawn_upstream(ip: &'static str, delay: Duration) -> SocketAddr {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        return;
                    };
                    let req = Message::from_vec(&buf[..len]).unwrap();
                    let reply = canned_reply(&req, ip, 60);
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&reply.to_vec().unwrap(), from).await;
                }
            });
            addr
        }

        let slow = spawn_upstream("192.0.2.1", Duration::from_millis(300)).await;
        let fast = spawn_upstream("192.0.2.2", Duration::ZERO).await;
        let resolver = |addr: SocketAddr| {
            Arc::new(
                Resolver::new(&addr.to_string(), ResolverProtocol::Udp, Duration::from_secs(2))
                    .unwrap(),
            )
        };
        let mux = Arc::new(crate::client::Mux::new(vec![resolver(slow), resolver(fast)]));
        let p = proxy(HijackMode::Zero, Matcher::empty(), mux, discard_log());

        let req = query(0x7777, "example.com.", RecordType::A);
        let answer = p.handle_packet(&req.to_vec().unwrap(), peer()).await.unwrap();
        let reply = Message::from_vec(&answer.bytes).unwrap();
        assert_eq!(dnsutil::answers(&reply), vec!["192.0.2.2"]);
    }
}

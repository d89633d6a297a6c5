//! End-to-end scenarios over an in-memory network of endpoints.
//!
//! Every endpoint gets one or more channel connections; a pump task
//! per connection routes (message, destination) pairs to the
//! endpoint listening on that address. Destinations nobody listens
//! on are black holes, which is how unreachable hosts are modelled.

use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, StatusCode};
use sipflow::auth::md5_hex;
use sipflow::config::{Plugin, ServiceConfig};
use sipflow::endpoint::Endpoint;
use sipflow::outbound;
use sipflow::registrar::decode_route_param;
use sipflow::rsip_ext::reason_text;
use sipflow::service::{ProcessReply, RouteReply, SipReply, SipService};
use sipflow::transaction::{RequestOpts, UacEvent, UacReceiver};
use sipflow::transport::{ChannelConnection, IncomingMessage, SipAddr, TransportHandle};
use sipflow::EndpointBuilder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{sleep, timeout};

type Entry = (Arc<Endpoint>, Vec<(TransportHandle, Option<SipAddr>)>);
type Registry = Arc<Mutex<HashMap<String, Entry>>>;

struct Net {
    registry: Registry,
}

#[allow(dead_code)]
struct Peer {
    endpoint: Arc<Endpoint>,
    addr: SipAddr,
    handle: TransportHandle,
}

impl Net {
    fn new() -> Self {
        tracing_subscriber::fmt().try_init().ok();
        Net {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn addr(port: u16, transport: rsip::transport::Transport) -> SipAddr {
        let socket: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let mut addr = SipAddr::from(socket);
        addr.r#type = Some(transport);
        addr
    }

    /// Spawn an endpoint with one connection listening on `port`.
    fn peer(
        &self,
        port: u16,
        config: ServiceConfig,
        service: Option<Arc<dyn SipService>>,
        reliable: bool,
    ) -> Peer {
        let mut builder = EndpointBuilder::new();
        builder.with_config(config);
        if let Some(service) = service {
            builder.with_service(service);
        }
        let endpoint = Arc::new(builder.build());
        let serve_ref = endpoint.clone();
        tokio::spawn(async move { serve_ref.serve().await });

        let transport = if reliable {
            rsip::transport::Transport::Tcp
        } else {
            rsip::transport::Transport::Udp
        };
        let addr = Self::addr(port, transport);
        let handle = self.link(&endpoint, addr.clone(), None, reliable);
        Peer {
            endpoint,
            addr,
            handle,
        }
    }

    /// Add a connection to an endpoint, optionally pinned to a remote
    /// peer the way an accepted TCP connection would be. Inbound
    /// delivery picks the connection whose remote matches the sender.
    fn link(
        &self,
        endpoint: &Arc<Endpoint>,
        local: SipAddr,
        remote: Option<SipAddr>,
        reliable: bool,
    ) -> TransportHandle {
        let (sink, mut rx) = unbounded_channel();
        let conn = ChannelConnection::new(local.clone(), remote.clone(), reliable, sink);
        let handle = endpoint.add_connection(conn.into());
        {
            let mut registry = self.registry.lock().unwrap();
            let entry = registry
                .entry(local.addr.to_string())
                .or_insert_with(|| (endpoint.clone(), Vec::new()));
            entry.1.push((handle, remote));
        }

        let registry = self.registry.clone();
        let source = local;
        tokio::spawn(async move {
            while let Some((message, dest)) = rx.recv().await {
                let dest = match dest {
                    Some(dest) => dest,
                    None => continue,
                };
                let target = registry
                    .lock()
                    .unwrap()
                    .get(&dest.addr.to_string())
                    .map(|(endpoint, conns)| {
                        let handle = conns
                            .iter()
                            .find(|(_, remote)| {
                                remote
                                    .as_ref()
                                    .map(|remote| remote.addr == source.addr)
                                    .unwrap_or(false)
                            })
                            .or_else(|| conns.first())
                            .map(|(handle, _)| *handle);
                        (endpoint.clone(), handle)
                    });
                if let Some((endpoint, Some(handle))) = target {
                    endpoint
                        .inject(IncomingMessage {
                            message,
                            connection: handle,
                            source: source.clone(),
                        })
                        .ok();
                }
            }
        });
        handle
    }
}

async fn final_response(receiver: &mut UacReceiver) -> rsip::Response {
    loop {
        match timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for final response")
            .expect("response channel closed")
        {
            UacEvent::Final(resp) => return resp,
            UacEvent::Provisional(_) => continue,
        }
    }
}

fn fast_timers(config: ServiceConfig) -> ServiceConfig {
    config.with_timer_t1(Duration::from_millis(10))
}

// ---- services ------------------------------------------------------

/// Answers INVITE with a fixed code, records the last request seen.
struct Answer {
    invite_status: StatusCode,
    last: Arc<Mutex<Option<rsip::Request>>>,
}

impl SipService for Answer {
    fn sip_process(&self, req: &rsip::Request) -> ProcessReply {
        *self.last.lock().unwrap() = Some(req.clone());
        match req.method {
            Method::Invite => ProcessReply::Reply(SipReply::new(self.invite_status.clone())),
            _ => ProcessReply::NoReply,
        }
    }
}

/// Rings forever; counts the CANCELs it is told about.
struct RingOnly {
    cancelled: Arc<AtomicUsize>,
    cancel_reason: Arc<Mutex<Option<String>>>,
}

impl SipService for RingOnly {
    fn sip_process(&self, req: &rsip::Request) -> ProcessReply {
        match req.method {
            Method::Invite => ProcessReply::Reply(SipReply::new(StatusCode::Ringing)),
            _ => ProcessReply::NoReply,
        }
    }

    fn sip_cancel(&self, _invite: &rsip::Request, cancel: &rsip::Request) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        *self.cancel_reason.lock().unwrap() = reason_text(&cancel.headers);
    }
}

/// Proxies everything that is not a REGISTER to a shared target set.
struct ProxyService {
    uriset: Arc<Mutex<Vec<Vec<rsip::Uri>>>>,
    opts: RequestOpts,
}

impl SipService for ProxyService {
    fn sip_route(
        &self,
        _scheme: Option<&rsip::Scheme>,
        _user: &str,
        _host: &str,
        req: &rsip::Request,
    ) -> RouteReply {
        if req.method == Method::Register {
            return RouteReply::Process;
        }
        RouteReply::Proxy {
            uriset: self.uriset.lock().unwrap().clone(),
            opts: self.opts.clone(),
        }
    }
}

// ---- scenarios -----------------------------------------------------

#[tokio::test]
async fn test_options_roundtrip() {
    let net = Net::new();
    let _ua_b = net.peer(5061, ServiceConfig::default().with_name("b"), None, false);
    let ua_a = net.peer(5060, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:b@127.0.0.1:5061").unwrap();
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Options, uri, RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);
}

#[tokio::test]
async fn test_outbound_contact_tagging() {
    // an INVITE supporting outbound carries `ob` in its Contact, a
    // non-dialog-forming OPTIONS does not, and dropping outbound from
    // Supported suppresses it entirely
    let net = Net::new();
    let last = Arc::new(Mutex::new(None));
    let _ua_b = net.peer(
        5071,
        ServiceConfig::default().with_name("b"),
        Some(Arc::new(Answer {
            invite_status: StatusCode::Decline,
            last: last.clone(),
        })),
        false,
    );
    let ua_a = net.peer(5070, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:b@127.0.0.1:5071").unwrap();
    let opts = RequestOpts {
        contact: true,
        supported: vec!["outbound".to_string()],
        ..Default::default()
    };
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri.clone(), opts.clone())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::Decline);

    let invite = last.lock().unwrap().clone().unwrap();
    let contact = invite.contact_header().unwrap().typed().unwrap();
    assert!(outbound::contact_param(&contact, "ob").is_some());

    // OPTIONS is not dialog-forming
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Options, uri.clone(), opts)
        .await
        .unwrap();
    final_response(&mut rx).await;
    let options = last.lock().unwrap().clone().unwrap();
    assert_eq!(options.method, Method::Options);
    let contact = options.contact_header().unwrap().typed().unwrap();
    assert!(outbound::contact_param(&contact, "ob").is_none());

    // no outbound in Supported, no ob even on INVITE
    let opts = RequestOpts {
        contact: true,
        ..Default::default()
    };
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri, opts)
        .await
        .unwrap();
    final_response(&mut rx).await;
    let invite = last.lock().unwrap().clone().unwrap();
    let contact = invite.contact_header().unwrap().typed().unwrap();
    assert!(outbound::contact_param(&contact, "ob").is_none());
}

#[tokio::test]
async fn test_timer_f_timeout() {
    let net = Net::new();
    let ua = net.peer(
        5080,
        fast_timers(ServiceConfig::default().with_name("a")),
        None,
        false,
    );

    let uri = rsip::Uri::try_from("sip:nobody@127.0.0.1:59980").unwrap();
    let (_, mut rx) = ua
        .endpoint
        .send_request(Method::Options, uri, RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::RequestTimeout);
    assert_eq!(reason_text(&resp.headers).as_deref(), Some("Timer F Timeout"));
}

#[tokio::test]
async fn test_timer_b_timeout() {
    let net = Net::new();
    let ua = net.peer(
        5081,
        fast_timers(ServiceConfig::default().with_name("a")),
        None,
        false,
    );

    let uri = rsip::Uri::try_from("sip:nobody@127.0.0.1:59981").unwrap();
    let (_, mut rx) = ua
        .endpoint
        .send_request(Method::Invite, uri, RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::RequestTimeout);
    assert_eq!(reason_text(&resp.headers).as_deref(), Some("Timer B Timeout"));
}

#[tokio::test]
async fn test_timer_c_on_stalled_invite() {
    // the proxy INVITE branch is answered 180 and then stalled; the
    // branch's Timer C cancels it and reports 408. The source
    // tolerated Timer B winning the race; with C armed instead of B
    // on proxy branches that should no longer happen, but the
    // tolerance is kept.
    let net = Net::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let _ua_b = net.peer(
        5092,
        ServiceConfig::default().with_name("b"),
        Some(Arc::new(RingOnly {
            cancelled: cancelled.clone(),
            cancel_reason: Arc::new(Mutex::new(None)),
        })),
        false,
    );
    let uriset = Arc::new(Mutex::new(vec![vec![rsip::Uri::try_from(
        "sip:b@127.0.0.1:5092",
    )
    .unwrap()]]));
    let _proxy = net.peer(
        5091,
        ServiceConfig::default()
            .with_name("p")
            .with_timer_c(Duration::from_millis(300)),
        Some(Arc::new(ProxyService {
            uriset,
            opts: RequestOpts::default(),
        })),
        false,
    );
    let ua_a = net.peer(5090, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:b@127.0.0.1:5091").unwrap();
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri, RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::RequestTimeout);
    let reason = reason_text(&resp.headers);
    assert!(
        matches!(reason.as_deref(), Some("Timer C Timeout") | Some("Timer B Timeout")),
        "unexpected reason {:?}",
        reason
    );
    // the ringing branch was cancelled
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_source_matching() {
    // a CANCEL only matches its INVITE when branch AND source agree
    let net = Net::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let ua_b = net.peer(
        5100,
        ServiceConfig::default().with_name("b"),
        Some(Arc::new(RingOnly {
            cancelled: cancelled.clone(),
            cancel_reason: Arc::new(Mutex::new(None)),
        })),
        false,
    );

    // capture everything b sends
    let (sink, mut out) = unbounded_channel();
    let capture_addr = Net::addr(5101, rsip::transport::Transport::Udp);
    let conn = ChannelConnection::new(capture_addr, None, false, sink);
    let handle = ua_b.endpoint.add_connection(conn.into());

    let source1 = Net::addr(6001, rsip::transport::Transport::Udp);
    let source2 = Net::addr(6002, rsip::transport::Transport::Udp);

    let invite = rsip::Request {
        method: Method::Invite,
        uri: rsip::Uri::try_from("sip:b@127.0.0.1:5101").unwrap(),
        headers: vec![
            rsip::headers::Via::new("SIP/2.0/UDP 127.0.0.1:6001;branch=z9hG4bKcancel1").into(),
            rsip::headers::CSeq::new("1 INVITE").into(),
            rsip::headers::From::new("<sip:a@127.0.0.1:6001>;tag=ctag1").into(),
            rsip::headers::To::new("<sip:b@127.0.0.1:5101>").into(),
            rsip::headers::CallId::new("cancel-match@test").into(),
            rsip::headers::Contact::new("<sip:a@127.0.0.1:6001>").into(),
            rsip::headers::MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    };
    let mut cancel = invite.clone();
    cancel.method = Method::Cancel;
    cancel.headers.retain(|h| !matches!(h, Header::CSeq(_)));
    cancel.headers.push(rsip::headers::CSeq::new("1 CANCEL").into());

    ua_b.endpoint
        .inject(IncomingMessage {
            message: invite.into(),
            connection: handle,
            source: source1.clone(),
        })
        .unwrap();

    // 100 then 180
    let mut codes = vec![];
    for _ in 0..2 {
        let (msg, _) = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
        if let rsip::SipMessage::Response(resp) = msg {
            codes.push(u16::from(resp.status_code));
        }
    }
    assert_eq!(codes, vec![100, 180]);

    // CANCEL from the wrong source: no matching transaction
    ua_b.endpoint
        .inject(IncomingMessage {
            message: cancel.clone().into(),
            connection: handle,
            source: source2,
        })
        .unwrap();
    let (msg, _) = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
    match msg {
        rsip::SipMessage::Response(resp) => {
            assert_eq!(u16::from(resp.status_code), 481);
            assert_eq!(resp.cseq_header().unwrap().method().unwrap(), Method::Cancel);
        }
        _ => panic!("expected response"),
    }
    assert_eq!(cancelled.load(Ordering::SeqCst), 0);

    // CANCEL from the right source: 200 to it, 487 to the INVITE
    ua_b.endpoint
        .inject(IncomingMessage {
            message: cancel.into(),
            connection: handle,
            source: source1,
        })
        .unwrap();
    let mut answers = vec![];
    for _ in 0..2 {
        let (msg, _) = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
        if let rsip::SipMessage::Response(resp) = msg {
            answers.push((
                u16::from(resp.status_code),
                resp.cseq_header().unwrap().method().unwrap(),
            ));
        }
    }
    assert!(answers.contains(&(200, Method::Cancel)));
    assert!(answers.contains(&(487, Method::Invite)));
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fork_2xx_wins() {
    // four parallel targets; the winner's 200 goes upstream exactly
    // once, the rest are cancelled with "Call completed elsewhere"
    let net = Net::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let cancel_reason = Arc::new(Mutex::new(None));
    for port in [5111u16, 5113, 5114] {
        net.peer(
            port,
            ServiceConfig::default().with_name("ring"),
            Some(Arc::new(RingOnly {
                cancelled: cancelled.clone(),
                cancel_reason: cancel_reason.clone(),
            })),
            false,
        );
    }
    let _winner = net.peer(
        5112,
        ServiceConfig::default().with_name("win"),
        Some(Arc::new(Answer {
            invite_status: StatusCode::OK,
            last: Arc::new(Mutex::new(None)),
        })),
        false,
    );

    let targets = vec![vec![
        rsip::Uri::try_from("sip:b1@127.0.0.1:5111").unwrap(),
        rsip::Uri::try_from("sip:b2@127.0.0.1:5112").unwrap(),
        rsip::Uri::try_from("sip:b3@127.0.0.1:5113").unwrap(),
        rsip::Uri::try_from("sip:b4@127.0.0.1:5114").unwrap(),
    ]];
    let _proxy = net.peer(
        5110,
        ServiceConfig::default().with_name("p"),
        Some(Arc::new(ProxyService {
            uriset: Arc::new(Mutex::new(targets)),
            opts: RequestOpts::default(),
        })),
        false,
    );
    let ua_a = net.peer(5109, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:anyone@127.0.0.1:5110").unwrap();
    let (_, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri, RequestOpts::default())
        .await
        .unwrap();

    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);

    // give the CANCELs a moment to land
    for _ in 0..50 {
        if cancelled.load(Ordering::SeqCst) == 3 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    assert_eq!(
        cancel_reason.lock().unwrap().as_deref(),
        Some("Call completed elsewhere")
    );

    // upstream saw exactly one final
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_register_flow_path_and_flow_failure() {
    // REGISTER over a reliable connection gets a Path with an NkF
    // flow token; proxying back to the stored contact reuses that
    // connection, and killing it turns the next request into 430
    let net = Net::new();
    let uriset = Arc::new(Mutex::new(vec![]));
    let registrar = net.peer(
        5120,
        ServiceConfig::default()
            .with_name("registrar")
            .with_plugin(Plugin::Registrar)
            .with_plugin(Plugin::Outbound),
        Some(Arc::new(ProxyService {
            uriset: uriset.clone(),
            opts: RequestOpts::default(),
        })),
        true,
    );
    let ua1 = net.peer(
        5121,
        ServiceConfig::default().with_name("ua1"),
        None,
        true,
    );
    let ua2 = net.peer(
        5122,
        ServiceConfig::default().with_name("ua2"),
        None,
        true,
    );
    // accepted TCP connections at the registrar, one per UA
    let ua1_flow = net.link(
        &registrar.endpoint,
        registrar.addr.clone(),
        Some(ua1.addr.clone()),
        true,
    );
    net.link(
        &registrar.endpoint,
        registrar.addr.clone(),
        Some(ua2.addr.clone()),
        true,
    );

    // ua1 registers
    let uri = rsip::Uri::try_from("sip:ua1@127.0.0.1:5120").unwrap();
    let opts = RequestOpts {
        contact: true,
        supported: vec!["path".to_string(), "outbound".to_string()],
        expires: Some(600),
        ..Default::default()
    };
    let (_, mut rx) = ua1
        .endpoint
        .send_request(Method::Register, uri, opts)
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);
    // no reg-id used, so no Require: outbound
    assert!(!sipflow::rsip_ext::header_contains_token(
        &resp.headers,
        "Require",
        "outbound"
    ));

    let aor = "sip:ua1@127.0.0.1";
    let bindings = registrar.endpoint.registrar().bindings(aor);
    assert_eq!(bindings.len(), 1);
    assert!(matches!(
        bindings[0].index,
        sipflow::registrar::ContactIndex::Generic { ref transport, port, .. }
            if transport == "tcp" && port == 5121
    ));
    assert_eq!(bindings[0].path.len(), 1);
    assert!(bindings[0].path[0].contains("sip:NkF"));
    assert!(bindings[0].path[0].contains(";ob"));
    assert_eq!(bindings[0].connection, Some(ua1_flow));

    // ua2 reaches ua1 through the stored flow
    *uriset.lock().unwrap() = vec![registrar.endpoint.registrar().find(aor)];
    let uri = rsip::Uri::try_from("sip:ua1@127.0.0.1:5120").unwrap();
    let (_, mut rx) = ua2
        .endpoint
        .send_request(Method::Options, uri.clone(), RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);

    // the flow dies; the binding replays to 430 until refreshed
    let flow = bindings[0].connection.unwrap();
    registrar.endpoint.close_connection(flow);
    let (_, mut rx) = ua2
        .endpoint
        .send_request(Method::Options, uri, RequestOpts::default())
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(u16::from(resp.status_code), 430);
}

fn register_request(
    aor_user: &str,
    contact: &str,
    call_id: &str,
    cseq: u32,
    vias: &[&str],
    paths: &[&str],
) -> rsip::Request {
    let mut headers: Vec<Header> = vec![];
    for via in vias {
        headers.push(rsip::headers::Via::new(*via).into());
    }
    headers.push(rsip::headers::CSeq::new(format!("{} REGISTER", cseq)).into());
    headers.push(rsip::headers::From::new(format!("<sip:{}@example.com>;tag=rt1", aor_user)).into());
    headers.push(rsip::headers::To::new(format!("<sip:{}@example.com>", aor_user)).into());
    headers.push(rsip::headers::CallId::new(call_id).into());
    headers.push(Header::Other("Supported".into(), "path, outbound".into()));
    headers.push(rsip::headers::Contact::new(contact).into());
    for path in paths {
        headers.push(Header::Other("Path".into(), path.to_string()));
    }
    rsip::Request {
        method: Method::Register,
        uri: rsip::Uri::try_from("sip:example.com").unwrap(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

fn registrar_fixture() -> (sipflow::registrar::Registrar, ServiceConfig, sipflow::transport::TransportPool, TransportHandle) {
    let registrar = sipflow::registrar::Registrar::new();
    let config = ServiceConfig::default()
        .with_plugin(Plugin::Registrar)
        .with_plugin(Plugin::Outbound);
    let pool = sipflow::transport::TransportPool::new();
    let (sink, _rx) = unbounded_channel();
    let addr = Net::addr(5130, rsip::transport::Transport::Tcp);
    let handle = pool.add(ChannelConnection::new(addr, None, true, sink).into());
    (registrar, config, pool, handle)
}

#[tokio::test]
async fn test_register_several_reg_ids_rejected() {
    let (registrar, config, pool, handle) = registrar_fixture();
    let mut request = register_request(
        "alice",
        "<sip:alice@10.0.0.1:5062>;reg-id=1;+sip.instance=\"<urn:uuid:inst-1>\"",
        "regid@test",
        1,
        &["SIP/2.0/TCP 10.0.0.1:5062;branch=z9hG4bKr1"],
        &[],
    );
    request.headers.push(
        rsip::headers::Contact::new(
            "<sip:alice@10.0.0.2:5062>;reg-id=2;+sip.instance=\"<urn:uuid:inst-1>\"",
        )
        .into(),
    );
    let reply = registrar.process_register(&config, &pool, &request, handle);
    assert_eq!(reply.status, StatusCode::BadRequest);
    assert_eq!(reply.reason.as_deref(), Some("Several 'reg-id' Options"));
}

#[tokio::test]
async fn test_register_outbound_binding_indexing() {
    // one binding per (instance hash, reg-id); refresh replaces and
    // moves to the front
    let (registrar, config, pool, handle) = registrar_fixture();
    let sends = [
        ("inst-1", 1u32, "r1@test"),
        ("inst-1", 2u32, "r2@test"),
        ("inst-2", 1u32, "r3@test"),
    ];
    for (instance, reg_id, call_id) in sends {
        let contact = format!(
            "<sip:alice@10.0.0.9:5062>;reg-id={};+sip.instance=\"<urn:uuid:{}>\"",
            reg_id, instance
        );
        let request = register_request(
            "alice",
            &contact,
            call_id,
            1,
            &["SIP/2.0/TCP 10.0.0.9:5062;branch=z9hG4bKr2"],
            &[],
        );
        let reply = registrar.process_register(&config, &pool, &request, handle);
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply
            .headers
            .iter()
            .any(|h| matches!(h, Header::Other(name, value) if name == "Require" && value.contains("outbound"))));
    }

    let bindings = registrar.bindings("sip:alice@example.com");
    assert_eq!(bindings.len(), 3);
    let index_of = |instance: &str, reg_id: u32| sipflow::registrar::ContactIndex::Outbound {
        instance: md5_hex(format!("<urn:uuid:{}>", instance).as_bytes()),
        reg_id,
    };
    assert_eq!(bindings[0].index, index_of("inst-2", 1));
    assert_eq!(bindings[1].index, index_of("inst-1", 2));
    assert_eq!(bindings[2].index, index_of("inst-1", 1));

    // refreshing (inst-1, 2) replaces it and reorders to the front
    let request = register_request(
        "alice",
        "<sip:alice@10.0.0.9:5062>;reg-id=2;+sip.instance=\"<urn:uuid:inst-1>\"",
        "r4@test",
        1,
        &["SIP/2.0/TCP 10.0.0.9:5062;branch=z9hG4bKr3"],
        &[],
    );
    let reply = registrar.process_register(&config, &pool, &request, handle);
    assert_eq!(reply.status, StatusCode::OK);

    let bindings = registrar.bindings("sip:alice@example.com");
    assert_eq!(bindings.len(), 3);
    assert_eq!(bindings[0].index, index_of("inst-1", 2));
}

#[tokio::test]
async fn test_register_first_hop_without_ob_is_439() {
    // two Vias mean we are not the first hop; the Path chain must
    // carry ob from whoever was
    let (registrar, config, pool, handle) = registrar_fixture();
    let request = register_request(
        "alice",
        "<sip:alice@10.0.0.1:5062>;reg-id=1;+sip.instance=\"<urn:uuid:inst-9>\"",
        "chain@test",
        1,
        &[
            "SIP/2.0/TCP 10.0.0.7:5062;branch=z9hG4bKp2hop",
            "SIP/2.0/TCP 10.0.0.1:5062;branch=z9hG4bKr9",
        ],
        &["<sip:NkQabcdef@10.0.0.7:5062;lr>"],
    );
    let reply = registrar.process_register(&config, &pool, &request, handle);
    assert_eq!(u16::from(reply.status), 439);

    // with ob on the first hop the binding is accepted as outbound
    let request = register_request(
        "alice",
        "<sip:alice@10.0.0.1:5062>;reg-id=1;+sip.instance=\"<urn:uuid:inst-9>\"",
        "chain2@test",
        1,
        &[
            "SIP/2.0/TCP 10.0.0.7:5062;branch=z9hG4bKp2hop2",
            "SIP/2.0/TCP 10.0.0.1:5062;branch=z9hG4bKr10",
        ],
        &["<sip:NkFsometoken@10.0.0.7:5062;lr;ob>"],
    );
    let reply = registrar.process_register(&config, &pool, &request, handle);
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply
        .headers
        .iter()
        .any(|h| matches!(h, Header::Other(name, value) if name == "Require" && value.contains("outbound"))));
}

#[tokio::test]
async fn test_register_path_replay_roundtrip() {
    let paths = vec![
        "<sip:NkFtok1@10.0.0.7:5062;lr>".to_string(),
        "<sip:NkFtok2@10.0.0.8:5062;lr;ob>".to_string(),
    ];
    let encoded = sipflow::registrar::encode_route_param(&paths);
    assert!(!encoded.contains('<'));
    assert_eq!(decode_route_param(&encoded), paths);
}

#[tokio::test]
async fn test_dialog_establish_and_bye() {
    let net = Net::new();
    let _ua_b = net.peer(
        5171,
        ServiceConfig::default().with_name("b"),
        Some(Arc::new(Answer {
            invite_status: StatusCode::OK,
            last: Arc::new(Mutex::new(None)),
        })),
        false,
    );
    let ua_a = net.peer(5170, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:b@127.0.0.1:5171").unwrap();
    let opts = RequestOpts {
        contact: true,
        ..Default::default()
    };
    let (handle, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri, opts)
        .await
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);

    let dialog_id = sipflow::dialog::DialogId::try_from(&resp).unwrap();
    // the ACK went out with the 2xx; the dialog confirms
    let mut confirmed = false;
    for _ in 0..50 {
        if let Some(info) = ua_a
            .endpoint
            .apply_to_dialog(&handle.call_id, dialog_id.clone())
            .await
            .unwrap()
        {
            if info.invite_status == sipflow::dialog::InviteStatus::Confirmed {
                confirmed = true;
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(confirmed, "dialog never confirmed");

    // BYE rides the dialog and tears it down on both sides
    let mut rx = ua_a
        .endpoint
        .send_in_dialog(dialog_id.clone(), Method::Bye, RequestOpts::default())
        .unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::OK);

    let mut gone = false;
    for _ in 0..50 {
        if ua_a
            .endpoint
            .apply_to_dialog(&handle.call_id, dialog_id.clone())
            .await
            .unwrap()
            .is_none()
        {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "dialog survived the BYE");
}

#[tokio::test]
async fn test_crash_work_item() {
    let net = Net::new();
    let ua = net.peer(5140, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:nobody@127.0.0.1:59940").unwrap();
    let (handle, mut rx) = ua
        .endpoint
        .send_request(Method::Options, uri, RequestOpts::default())
        .await
        .unwrap();
    ua.endpoint.crash_call(&handle.call_id).unwrap();

    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::ServerInternalError);
    assert_eq!(reason_text(&resp.headers).as_deref(), Some("Internal Error"));
}

#[tokio::test]
async fn test_max_calls_overflow() {
    let net = Net::new();
    let ua = net.peer(
        5150,
        ServiceConfig::default().with_name("a").with_max_calls(1),
        None,
        false,
    );

    let uri = rsip::Uri::try_from("sip:nobody@127.0.0.1:59950").unwrap();
    let first = ua
        .endpoint
        .send_request(Method::Options, uri.clone(), RequestOpts::default())
        .await;
    assert!(first.is_ok());

    let second = ua
        .endpoint
        .send_request(Method::Options, uri, RequestOpts::default())
        .await;
    assert!(matches!(second, Err(sipflow::Error::TooManyCalls)));
}

#[tokio::test]
async fn test_send_cancel_after_provisional() {
    let net = Net::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let _ua_b = net.peer(
        5161,
        ServiceConfig::default().with_name("b"),
        Some(Arc::new(RingOnly {
            cancelled: cancelled.clone(),
            cancel_reason: Arc::new(Mutex::new(None)),
        })),
        false,
    );
    let ua_a = net.peer(5160, ServiceConfig::default().with_name("a"), None, false);

    let uri = rsip::Uri::try_from("sip:b@127.0.0.1:5161").unwrap();
    let (handle, mut rx) = ua_a
        .endpoint
        .send_request(Method::Invite, uri, RequestOpts::default())
        .await
        .unwrap();

    // wait for the 180
    match timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
        Some(UacEvent::Provisional(resp)) => {
            assert_eq!(resp.status_code, StatusCode::Ringing)
        }
        other => panic!("expected provisional, got {:?}", other),
    }

    ua_a.endpoint.send_cancel(&handle).await.unwrap();
    let resp = final_response(&mut rx).await;
    assert_eq!(resp.status_code, StatusCode::RequestTerminated);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

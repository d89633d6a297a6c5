use super::{ChannelConnection, SipAddr, SipConnection, TransportPool};
use tokio::sync::mpsc::unbounded_channel;

fn addr(spec: &str) -> SipAddr {
    let socket: std::net::SocketAddr = spec.parse().unwrap();
    let mut addr = SipAddr::from(socket);
    addr.r#type = Some(rsip::transport::Transport::Udp);
    addr
}

fn channel(local: &str) -> (SipConnection, tokio::sync::mpsc::UnboundedReceiver<(rsip::SipMessage, Option<SipAddr>)>) {
    let (sink, rx) = unbounded_channel();
    (
        ChannelConnection::new(addr(local), None, false, sink).into(),
        rx,
    )
}

#[test]
fn test_pool_handles_are_epoch_guarded() {
    let pool = TransportPool::new();
    let (conn, _rx) = channel("127.0.0.1:5060");
    let first = pool.add(conn);
    assert!(pool.is_alive(first));

    pool.close(first);
    assert!(!pool.is_alive(first));
    assert!(pool.get(first).is_none());

    // slot is reused with a bumped epoch, so the old handle stays dead
    let (conn, _rx) = channel("127.0.0.1:5061");
    let second = pool.add(conn);
    assert_eq!(second.index, first.index);
    assert_ne!(second.epoch, first.epoch);
    assert!(!pool.is_alive(first));
    assert!(pool.is_alive(second));
}

#[test]
fn test_pool_lookup_by_local_addr() {
    let pool = TransportPool::new();
    let (conn_a, _rx_a) = channel("127.0.0.1:5060");
    let (conn_b, _rx_b) = channel("127.0.0.1:5070");
    pool.add(conn_a);
    let handle_b = pool.add(conn_b);

    assert_eq!(pool.lookup(&addr("127.0.0.1:5070")), Some(handle_b));
    assert_eq!(pool.lookup(&addr("127.0.0.1:9999")), None);
}

#[tokio::test]
async fn test_channel_connection_sink() -> crate::Result<()> {
    let (sink, mut rx) = unbounded_channel();
    let conn: SipConnection =
        ChannelConnection::new(addr("127.0.0.1:5060"), None, false, sink).into();

    let request = rsip::Request {
        method: rsip::Method::Options,
        uri: rsip::Uri::try_from("sip:bob@example.com")?,
        headers: rsip::Headers::default(),
        version: rsip::Version::V2,
        body: vec![],
    };
    conn.send(request.into(), Some(&addr("127.0.0.1:5070"))).await?;

    let (msg, dest) = rx.recv().await.unwrap();
    assert!(matches!(msg, rsip::SipMessage::Request(_)));
    assert_eq!(dest, Some(addr("127.0.0.1:5070")));
    Ok(())
}

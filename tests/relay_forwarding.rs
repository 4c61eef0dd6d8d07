//! Recursive relay over real UDP sockets

use dnsway::dns::{DnsMessage, DnsRecord, RecordType, RCODE_NOERROR, RCODE_NXDOMAIN};
use dnsway::{
    DownstreamMode, OtpAuthorizer, RecursiveRelay, SegmentCodec, Session, SessionState,
    TunnelContext, TunnelGuard, TunnelResponder, UdpExchange,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const LIMIT: Duration = Duration::from_secs(10);

/// Upstream resolver answering every A query with a CNAME, reporting what it saw
async fn fake_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let packet = buf[..n].to_vec();
            let reply = match DnsMessage::parse(&packet) {
                Ok(query) => {
                    let mut reply = query.response(RCODE_NOERROR);
                    reply.push_answer(DnsRecord::new_cname(
                        &query.questions[0].qname,
                        "cdn.example.net",
                        300,
                    ));
                    reply.to_bytes()
                }
                // Echo what it cannot parse, flagged as a response
                Err(_) => {
                    let mut echo = packet.clone();
                    echo[2] |= 0x80;
                    echo
                }
            };
            let _ = tx.send(packet);
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    (addr, rx)
}

async fn start_relay(relay: RecursiveRelay, cancel: CancellationToken) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(Arc::new(relay).serve(socket, cancel));
    addr
}

async fn ask(relay: SocketAddr, query: &DnsMessage) -> Vec<u8> {
    ask_raw(relay, &query.to_bytes()).await
}

async fn ask_raw(relay: SocketAddr, packet: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(packet, relay).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(LIMIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_ordinary_queries_forwarded_verbatim() {
    let (upstream, mut seen) = fake_upstream().await;
    let codec = Arc::new(SegmentCodec::new("t.example.com").unwrap());
    let cancel = CancellationToken::new();
    let relay = start_relay(
        RecursiveRelay::new(
            Arc::clone(&codec),
            Arc::new(TunnelGuard::new(Arc::clone(&codec))),
            Some(upstream),
            Duration::from_secs(2),
        ),
        cancel.clone(),
    )
    .await;

    let query = DnsMessage::new_query("www.example.org", RecordType::A, 0x1234);
    let reply = ask(relay, &query).await;

    let forwarded = seen.recv().await.unwrap();
    assert_eq!(forwarded, query.to_bytes());

    let reply = DnsMessage::parse(&reply).unwrap();
    assert_eq!(reply.header.id, 0x1234);
    assert_eq!(reply.header.rcode(), RCODE_NOERROR);
    assert_eq!(reply.answers.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_unparsable_foreign_query_forwarded() {
    let (upstream, mut seen) = fake_upstream().await;
    let codec = Arc::new(SegmentCodec::new("t.example.com").unwrap());
    let cancel = CancellationToken::new();
    let relay = start_relay(
        RecursiveRelay::new(
            Arc::clone(&codec),
            Arc::new(TunnelGuard::new(Arc::clone(&codec))),
            Some(upstream),
            Duration::from_secs(2),
        ),
        cancel.clone(),
    )
    .await;

    // Binary first label, which the message parser rejects
    let mut packet = vec![0x42, 0x42, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
    packet.extend_from_slice(b"\x03\xff\xfe\xfd\x07example\x03org\x00\x00\x01\x00\x01");
    assert!(DnsMessage::parse(&packet).is_err());

    let reply = ask_raw(relay, &packet).await;
    assert_eq!(seen.recv().await.unwrap(), packet);
    assert_eq!(&reply[..2], &[0x42, 0x42]);
    assert_eq!(reply[2] & 0x80, 0x80);
    assert_eq!(&reply[3..], &packet[3..]);

    cancel.cancel();
}

#[tokio::test]
async fn test_tunnel_names_never_forwarded() {
    let (upstream, mut seen) = fake_upstream().await;
    let codec = Arc::new(SegmentCodec::new("t.example.com").unwrap());
    let cancel = CancellationToken::new();
    let relay = start_relay(
        RecursiveRelay::new(
            Arc::clone(&codec),
            Arc::new(TunnelGuard::new(Arc::clone(&codec))),
            Some(upstream),
            Duration::from_secs(2),
        ),
        cancel.clone(),
    )
    .await;

    let name = codec.encode_upstream(7, 3, b"hello").unwrap();
    let query = DnsMessage::new_query(&name, RecordType::Txt, 77);
    let reply = DnsMessage::parse(&ask(relay, &query).await).unwrap();
    assert_eq!(reply.header.id, 77);
    assert_eq!(reply.header.rcode(), RCODE_NXDOMAIN);

    // An ordinary query afterwards is the first thing upstream sees
    let ordinary = DnsMessage::new_query("example.org", RecordType::A, 78);
    ask(relay, &ordinary).await;
    assert_eq!(seen.recv().await.unwrap(), ordinary.to_bytes());
    assert!(seen.try_recv().is_err());

    cancel.cancel();
}

#[tokio::test]
async fn test_session_over_udp_responder() {
    let codec = SegmentCodec::new("t.example.com").unwrap();
    let cancel = CancellationToken::new();

    let (tx, mut accepted) = mpsc::unbounded_channel();
    let responder = Arc::new(TunnelResponder::new(
        codec.clone(),
        OtpAuthorizer::new(b"udp secret"),
        Arc::new(tx),
    ));
    let relay = start_relay(
        RecursiveRelay::new(
            Arc::new(codec.clone()),
            responder,
            None,
            Duration::from_secs(1),
        ),
        cancel.clone(),
    )
    .await;

    let ctx = TunnelContext::new(
        codec,
        OtpAuthorizer::new(b"udp secret"),
        Arc::new(UdpExchange::new(relay, Duration::from_millis(500))),
        DownstreamMode::Alias,
    )
    .with_timing(Duration::from_millis(5), Duration::from_secs(2))
    .with_cancel(cancel.clone());

    let session = Session::spawn(&ctx, 0x0bad).unwrap();
    let remote = timeout(LIMIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(remote.id, 0x0bad);
    let mut remote = remote.stream;

    timeout(LIMIT, session.wait_established())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.state(), SessionState::Established);

    session.write(b"ping over udp").await.unwrap();
    let mut buf = [0u8; 13];
    timeout(LIMIT, remote.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping over udp");

    remote.write_all(b"pong").await.unwrap();
    let mut reply = [0u8; 4];
    let mut got = 0;
    while got < reply.len() {
        got += timeout(LIMIT, session.read(&mut reply[got..]))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(&reply, b"pong");

    session.close();
    cancel.cancel();
}

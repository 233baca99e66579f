//! Striped-transport tests over loopback UDP: end-to-end delivery through
//! a real client and server, FEC recovery from a lost shard, the return
//! path through the connection table, and the auth trailer.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use braid::fec::{frame_shard, FecEncoder};
use braid::server::ConnectionTable;
use braid::stripe::client::{StripeClientConn, StripeClientParams};
use braid::stripe::{
    register_payload, PacketType, StripeAuth, StripeHeader, StripeServer, HEADER_LEN,
};
use braid::transport::DatagramConn;
use braid::tun::ChannelTun;

const TUN_IP: Ipv4Addr = Ipv4Addr::new(10, 200, 17, 2);

fn udp_packet(tag: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 32];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&32u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&TUN_IP.octets());
    pkt[16..20].copy_from_slice(&[10, 200, 17, 1]);
    pkt[20..22].copy_from_slice(&(40000 + u16::from(tag)).to_be_bytes());
    pkt[22..24].copy_from_slice(&53u16.to_be_bytes());
    pkt[31] = tag;
    pkt
}

struct ServerHarness {
    server: Arc<StripeServer>,
    table: Arc<ConnectionTable>,
    tun_out: mpsc::Receiver<bytes::Bytes>,
    cancel: CancellationToken,
}

async fn start_server(
    data_shards: usize,
    parity_shards: usize,
    auth: Option<StripeAuth>,
) -> ServerHarness {
    let cancel = CancellationToken::new();
    let table = ConnectionTable::new();
    let (tun, _tun_in, tun_out) = ChannelTun::new(256);
    let server = StripeServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        data_shards,
        parity_shards,
        auth,
        Arc::clone(&table),
        Arc::new(tun),
        cancel.child_token(),
    )
    .await
    .unwrap();
    tokio::spawn(Arc::clone(&server).run());
    ServerHarness {
        server,
        table,
        tun_out,
        cancel,
    }
}

async fn recv_packets(rx: &mut mpsc::Receiver<bytes::Bytes>, count: usize) -> HashSet<Vec<u8>> {
    let mut got = HashSet::new();
    for _ in 0..count {
        let pkt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("packet within timeout")
            .expect("channel open");
        got.insert(pkt.to_vec());
    }
    got
}

#[tokio::test(flavor = "multi_thread")]
async fn full_groups_deliver_end_to_end() {
    let mut h = start_server(4, 2, None).await;
    let addr = h.server.local_addr().unwrap();

    let client = StripeClientConn::connect(
        StripeClientParams {
            path_name: "dish".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            server_addr: addr,
            tun_ip: TUN_IP,
            pipes: 2,
            data_shards: 4,
            parity_shards: 2,
            auth: None,
        },
        &h.cancel,
    )
    .await
    .unwrap();

    // Two full FEC groups.
    let sent: Vec<Vec<u8>> = (0..8).map(udp_packet).collect();
    for pkt in &sent {
        client.send_datagram(pkt).await.unwrap();
    }

    let got = recv_packets(&mut h.tun_out, 8).await;
    let expected: HashSet<Vec<u8>> = sent.into_iter().collect();
    assert_eq!(got, expected);

    // The session registered itself in the connection table under the
    // session-id pseudo address.
    let pseudo = Ipv4Addr::from(client.session_id());
    assert_eq!(h.table.path_count(pseudo), 1);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_group_flushes_without_waiting_for_k() {
    let mut h = start_server(10, 2, None).await;
    let addr = h.server.local_addr().unwrap();

    let client = StripeClientConn::connect(
        StripeClientParams {
            path_name: "dish".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            server_addr: addr,
            tun_ip: TUN_IP,
            pipes: 2,
            data_shards: 10,
            parity_shards: 2,
            auth: None,
        },
        &h.cancel,
    )
    .await
    .unwrap();

    // Far fewer packets than K: only the 5 ms flush can deliver them.
    client.send_datagram(&udp_packet(1)).await.unwrap();
    client.send_datagram(&udp_packet(2)).await.unwrap();

    let got = recv_packets(&mut h.tun_out, 2).await;
    assert_eq!(got.len(), 2);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn return_path_stripes_to_registered_pipes() {
    let h = start_server(4, 2, None).await;
    let addr = h.server.local_addr().unwrap();

    let client = StripeClientConn::connect(
        StripeClientParams {
            path_name: "dish".into(),
            bind_ip: "127.0.0.1".parse().unwrap(),
            server_addr: addr,
            tun_ip: TUN_IP,
            pipes: 2,
            data_shards: 4,
            parity_shards: 2,
            auth: None,
        },
        &h.cancel,
    )
    .await
    .unwrap();

    // Dispatch a TUN packet toward the stripe peer through the table,
    // exactly like the server TUN reader would.
    let pseudo = Ipv4Addr::from(client.session_id());
    let pkt = udp_packet(9);
    assert!(h.table.dispatch(pseudo.into(), &pkt));

    let got = tokio::time::timeout(Duration::from_secs(5), client.recv_datagram(&h.cancel))
        .await
        .expect("return packet within timeout")
        .unwrap();
    assert_eq!(got.as_ref(), pkt.as_slice());

    drop(h.tun_out);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_data_shard_recovered_by_parity() {
    let mut h = start_server(4, 2, None).await;
    let addr = h.server.local_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = 0xAABB_CCDD;

    // Register one pipe by hand.
    let reg = StripeHeader {
        packet_type: PacketType::Register,
        session_id: session,
        group_seq: 0,
        shard_idx: 0,
        group_data_n: 0,
        data_len: 6,
    }
    .to_packet(&register_payload(session, 0, 1));
    socket.send_to(&reg, addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Build one full group and lose data shard 2 in "transit".
    let packets: Vec<Vec<u8>> = (0..4).map(udp_packet).collect();
    let framed: Vec<Vec<u8>> = packets.iter().map(|p| frame_shard(p)).collect();
    let encoder = FecEncoder::new(4, 2).unwrap();
    let (data, parity) = encoder.encode_group(&framed).unwrap();
    assert_eq!(parity.len(), 2);

    for (idx, shard) in data.iter().enumerate() {
        if idx == 2 {
            continue; // dropped on the floor
        }
        let pkt = StripeHeader {
            packet_type: PacketType::Data,
            session_id: session,
            group_seq: 7,
            shard_idx: idx as u8,
            group_data_n: 4,
            data_len: u16::from_be_bytes([framed[idx][0], framed[idx][1]]),
        }
        .to_packet(shard);
        socket.send_to(&pkt, addr).await.unwrap();
    }
    let parity_pkt = StripeHeader {
        packet_type: PacketType::Parity,
        session_id: session,
        group_seq: 7,
        shard_idx: 4,
        group_data_n: 4,
        data_len: 0,
    }
    .to_packet(&parity[0]);
    socket.send_to(&parity_pkt, addr).await.unwrap();

    // All four packets arrive despite the lost shard.
    let got = recv_packets(&mut h.tun_out, 4).await;
    let expected: HashSet<Vec<u8>> = packets.into_iter().collect();
    assert_eq!(got, expected);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_rejects_tampering_and_replay() {
    let auth = StripeAuth::new(b"integration-key".to_vec(), Duration::from_secs(3600));
    let mut h = start_server(4, 2, Some(auth.clone())).await;
    let addr = h.server.local_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = 0x0102_0304;

    let mut reg = StripeHeader {
        packet_type: PacketType::Register,
        session_id: session,
        group_seq: 0,
        shard_idx: 0,
        group_data_n: 0,
        data_len: 6,
    }
    .to_packet(&register_payload(session, 0, 1));
    auth.seal(session, 0, &mut reg);
    socket.send_to(&reg, addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One authentic partial-group DATA packet.
    let packet = udp_packet(7);
    let framed = frame_shard(&packet);
    let mut data = StripeHeader {
        packet_type: PacketType::Data,
        session_id: session,
        group_seq: 1,
        shard_idx: 0,
        group_data_n: 1,
        data_len: packet.len() as u16,
    }
    .to_packet(&framed);
    auth.seal(session, 1, &mut data);

    // Tampered copy: flip one payload byte after sealing.
    let mut tampered = data.clone();
    let flip = HEADER_LEN + 3;
    tampered[flip] ^= 0x01;

    socket.send_to(&tampered, addr).await.unwrap();
    socket.send_to(&data, addr).await.unwrap();
    socket.send_to(&data, addr).await.unwrap(); // replay

    // Exactly one delivery: the tampered and replayed copies are dropped.
    let got = tokio::time::timeout(Duration::from_secs(5), h.tun_out.recv())
        .await
        .expect("authentic packet delivered")
        .unwrap();
    assert_eq!(got.as_ref(), packet.as_slice());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.tun_out.try_recv().is_err(), "no second delivery");
    h.cancel.cancel();
}

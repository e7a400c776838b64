//! Scripted MQTT 3.1.1 broker on a loopback socket, just enough protocol to
//! drive a real rumqttc client through connect, subscribe, publish and
//! disconnect.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const CONNECT: u8 = 0x1;
pub const PUBLISH: u8 = 0x3;
pub const SUBSCRIBE: u8 = 0x8;
pub const DISCONNECT: u8 = 0xE;

pub async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

pub struct Session {
    stream: TcpStream,
}

impl Session {
    /// Accept the next client and answer its CONNECT with a successful CONNACK.
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("accept client");
        let mut session = Self { stream };
        session.wait_for(CONNECT).await.expect("CONNECT");
        session.write(&[0x20, 0x02, 0x00, 0x00]).await;
        session
    }

    /// Next packet as (packet type, body), or `None` once the client hangs up.
    pub async fn read_packet(&mut self) -> Option<(u8, Vec<u8>)> {
        let header = self.stream.read_u8().await.ok()?;

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = self.stream.read_u8().await.ok()?;
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0; remaining];
        self.stream.read_exact(&mut body).await.ok()?;
        Some((header >> 4, body))
    }

    /// Skip packets until one of `packet_type` arrives.
    pub async fn wait_for(&mut self, packet_type: u8) -> Option<Vec<u8>> {
        loop {
            let (kind, body) = self.read_packet().await?;
            if kind == packet_type {
                return Some(body);
            }
        }
    }

    /// Wait for a SUBSCRIBE, grant every filter at QoS 0 and return the filters.
    pub async fn expect_subscribe(&mut self) -> Vec<String> {
        let body = self.wait_for(SUBSCRIBE).await.expect("SUBSCRIBE");
        let mut filters = Vec::new();
        let mut at = 2;
        while at < body.len() {
            let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
            filters.push(String::from_utf8(body[at + 2..at + 2 + len].to_vec()).expect("utf8 filter"));
            at += 2 + len + 1;
        }

        let mut suback = vec![0x90, (2 + filters.len()) as u8, body[0], body[1]];
        suback.extend(std::iter::repeat(0x00).take(filters.len()));
        self.write(&suback).await;
        filters
    }

    /// Send a QoS 0 PUBLISH to the client.
    pub async fn publish(&mut self, topic: &str, payload: &str) {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128, "single-byte remaining length only");
        let mut packet = vec![0x30, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload.as_bytes());
        self.write(&packet).await;
    }

    /// Wait for a QoS 0 PUBLISH from the client and return (topic, payload).
    pub async fn expect_publish(&mut self) -> (String, String) {
        let body = self.wait_for(PUBLISH).await.expect("PUBLISH");
        let len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let topic = String::from_utf8(body[2..2 + len].to_vec()).expect("utf8 topic");
        let payload = String::from_utf8(body[2 + len..].to_vec()).expect("utf8 payload");
        (topic, payload)
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to client");
    }
}

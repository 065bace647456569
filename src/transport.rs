//! 전송 계층
//!
//! 네 가지 경로(TCP 유니캐스트, UDP 유니캐스트 / 멀티캐스트 / 브로드캐스트)를
//! `송신 = send(bytes)`, `수신 = recv_packet()` 최소 능력으로 통일한다.
//! UDP는 데이터그램 하나가 곧 패킷 하나, TCP는 헤더의 payload_len으로
//! 경계를 복원한다.

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};

use crate::{Error, Result, PACKET_HEADER_LEN};

/// 비정상 payload_len 방어 상한 (16 MiB)
const MAX_PACKET_PAYLOAD: usize = 16 * 1024 * 1024;

/// 스트리밍 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    TcpUnicast,
    UdpUnicast,
    UdpMulticast,
    UdpBroadcast,
}

impl StreamMode {
    /// CLI 문자열 파싱: "tcp" | "udp" | "multicast" | "broadcast"
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "tcp" => Some(StreamMode::TcpUnicast),
            "udp" => Some(StreamMode::UdpUnicast),
            "multicast" => Some(StreamMode::UdpMulticast),
            "broadcast" => Some(StreamMode::UdpBroadcast),
            _ => None,
        }
    }

    pub fn is_udp(self) -> bool {
        !matches!(self, StreamMode::TcpUnicast)
    }
}

/// UDP 계열 송신 경로
pub struct UdpEmitter {
    socket: UdpSocket,
    target: std::net::SocketAddr,
}

impl UdpEmitter {
    /// 모드에 맞는 송신 소켓 준비
    pub async fn bind(mode: StreamMode, host: &str, port: u16) -> Result<Self> {
        let target = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        match mode {
            StreamMode::UdpMulticast => {
                match target.ip() {
                    std::net::IpAddr::V4(ip) if ip.is_multicast() => {}
                    _ => return Err(Error::InvalidAddress(format!("{host}는 멀티캐스트 그룹이 아님"))),
                }
                socket.set_multicast_ttl_v4(2)?;
            }
            StreamMode::UdpBroadcast => {
                socket.set_broadcast(true)?;
            }
            StreamMode::UdpUnicast => {}
            StreamMode::TcpUnicast => {
                return Err(Error::InvalidAddress("TCP는 UdpEmitter 대상이 아님".to_string()))
            }
        }
        Ok(Self { socket, target })
    }

    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        self.socket.send_to(packet, self.target).await?;
        Ok(())
    }
}

/// 수신 경로
pub enum RecvTransport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl RecvTransport {
    /// 모드에 맞는 수신 전송 열기
    ///
    /// - TCP: `host:port`로 접속
    /// - UDP 유니캐스트/브로드캐스트: `0.0.0.0:port` 바인드
    /// - UDP 멀티캐스트: 바인드 후 `host` 그룹 가입
    pub async fn open(mode: StreamMode, host: &str, port: u16) -> Result<Self> {
        match mode {
            StreamMode::TcpUnicast => {
                let stream = TcpStream::connect((host, port)).await?;
                Ok(RecvTransport::Tcp(stream))
            }
            StreamMode::UdpUnicast | StreamMode::UdpBroadcast => {
                let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
                Ok(RecvTransport::Udp(socket))
            }
            StreamMode::UdpMulticast => {
                let group: Ipv4Addr = host
                    .parse()
                    .map_err(|_| Error::InvalidAddress(host.to_string()))?;
                if !group.is_multicast() {
                    return Err(Error::InvalidAddress(format!(
                        "{group}는 멀티캐스트 그룹이 아님"
                    )));
                }
                let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
                socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
                Ok(RecvTransport::Udp(socket))
            }
        }
    }

    /// 패킷 하나 수신. 상대가 닫으면 `TransportClosed`.
    pub async fn recv_packet(&mut self, scratch: &mut [u8]) -> Result<Bytes> {
        match self {
            RecvTransport::Tcp(stream) => {
                let mut header = [0u8; PACKET_HEADER_LEN];
                read_exact_or_closed(stream, &mut header).await?;

                let payload_len = u32::from_be_bytes([header[18], header[19], header[20], header[21]]) as usize;
                if payload_len > MAX_PACKET_PAYLOAD {
                    return Err(Error::LengthMismatch {
                        expected: MAX_PACKET_PAYLOAD,
                        got: payload_len,
                    });
                }

                let mut packet = vec![0u8; PACKET_HEADER_LEN + payload_len + 4];
                packet[..PACKET_HEADER_LEN].copy_from_slice(&header);
                read_exact_or_closed(stream, &mut packet[PACKET_HEADER_LEN..]).await?;
                Ok(Bytes::from(packet))
            }
            RecvTransport::Udp(socket) => {
                let (len, _addr) = socket.recv_from(scratch).await?;
                Ok(Bytes::copy_from_slice(&scratch[..len]))
            }
        }
    }
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::TransportClosed),
        Err(e) => Err(e.into()),
    }
}

/// TCP 송신측: 패킷 바이트를 그대로 흘린다 (페이싱은 백프레셔)
pub async fn tcp_send(stream: &mut TcpStream, packet: &[u8]) -> Result<()> {
    stream.write_all(packet).await?;
    Ok(())
}

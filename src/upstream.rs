use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// 一个命名上游：一个或多个端点，出错时按序改试下一个。
#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub endpoints: Vec<SocketAddr>,
}

/// UDP 上游交换客户端。
/// 每次交换使用独立的已连接套接字并核对事务 ID，并发扇出互不串包。
#[derive(Debug, Clone)]
pub struct Exchanger {
    timeout: Duration,
    recv_size: usize,
}

impl Exchanger {
    pub fn new(timeout: Duration, udp_size: usize) -> Exchanger {
        Exchanger {
            timeout,
            recv_size: udp_size.max(512),
        }
    }

    /// 依次尝试各端点，先成功者胜；全部失败时带回最后一个错误。
    pub async fn exchange(&self, packet: &[u8], upstream: &Upstream) -> Result<Bytes> {
        let mut last_err = None;
        for (i, addr) in upstream.endpoints.iter().enumerate() {
            match self.exchange_one(packet, *addr).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        upstream = %upstream.name,
                        endpoint = %addr,
                        attempt = i + 1,
                        error = %err,
                        "endpoint exchange failed",
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("upstream {} has no endpoints", upstream.name)))
    }

    async fn exchange_one(&self, packet: &[u8], addr: SocketAddr) -> Result<Bytes> {
        if packet.len() < 2 {
            bail!("dns packet too short");
        }
        let (domain, bind_any): (Domain, SocketAddr) = if addr.is_ipv4() {
            (Domain::IPV4, "0.0.0.0:0".parse().expect("ipv4 any"))
        } else {
            (Domain::IPV6, "[::]:0".parse().expect("ipv6 any"))
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_any.into()).context("bind")?;
        let sock = UdpSocket::from_std(socket.into()).context("from_std")?;
        sock.connect(addr).await.context("connect")?;
        sock.send(packet).await.context("send")?;

        let mut buf = vec![0u8; self.recv_size];
        let recv = timeout(self.timeout, async {
            loop {
                let size = sock.recv(&mut buf).await?;
                // 已连接套接字只收该端点的包；事务 ID 不符的一律丢弃重等
                if size >= 2 && buf[0] == packet[0] && buf[1] == packet[1] {
                    return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
                }
            }
        })
        .await;

        match recv {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(err),
            Err(_) => bail!("upstream timeout: {addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // 起一个只回显请求字节的假上游
    async fn spawn_echo_server() -> SocketAddr {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind"));
        let addr = sock.local_addr().expect("local addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    return;
                };
                let _ = sock.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn exchange_matches_transaction_id() {
        let addr = spawn_echo_server().await;
        let ex = Exchanger::new(Duration::from_secs(1), 512);
        let upstream = Upstream {
            name: "echo".to_string(),
            endpoints: vec![addr],
        };
        let packet = [0xAB, 0xCD, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        let got = ex.exchange(&packet, &upstream).await.expect("exchange");
        assert_eq!(&got[..], &packet[..]);
    }

    #[tokio::test]
    async fn exchange_fails_over_to_next_endpoint() {
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let live = spawn_echo_server().await;
        let ex = Exchanger::new(Duration::from_millis(200), 512);
        let upstream = Upstream {
            name: "pair".to_string(),
            endpoints: vec![dead, live],
        };
        let packet = [0x01, 0x02, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        let got = ex.exchange(&packet, &upstream).await.expect("failover");
        assert_eq!(&got[..], &packet[..]);
    }

    #[tokio::test]
    async fn exchange_times_out_without_listener() {
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let ex = Exchanger::new(Duration::from_millis(100), 512);
        let upstream = Upstream {
            name: "dead".to_string(),
            endpoints: vec![dead],
        };
        let packet = [0x01, 0x02, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        assert!(ex.exchange(&packet, &upstream).await.is_err());
    }
}

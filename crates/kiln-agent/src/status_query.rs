use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
/// Protocol version sent in the handshake; -1 asks for a status reply regardless of version.
const STATUS_PROTOCOL_VERSION: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub online: u32,
    pub max: u32,
    pub version: Option<String>,
}

/// Occupancy query against an instance's network endpoint.
pub trait StatusProbe: Send + Sync + 'static {
    fn query(&self, addr: SocketAddr) -> impl Future<Output = anyhow::Result<ServerStatus>> + Send;
}

/// Server List Ping client.
#[derive(Debug, Clone)]
pub struct SlpProbe {
    timeout: Duration,
}

impl SlpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl StatusProbe for SlpProbe {
    async fn query(&self, addr: SocketAddr) -> anyhow::Result<ServerStatus> {
        tokio::time::timeout(self.timeout, ping(addr))
            .await
            .with_context(|| format!("status query to {addr} timed out"))?
    }
}

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let b = r.read_u8().await.context("read varint")?;
        value |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    anyhow::bail!("varint too long")
}

fn packet(id: i32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 1);
    write_varint(&mut payload, id);
    payload.extend_from_slice(body);

    let mut out = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut out, payload.len() as i32);
    out.extend_from_slice(&payload);
    out
}

fn encode_handshake(host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, STATUS_PROTOCOL_VERSION);
    write_varint(&mut body, host.len() as i32);
    body.extend_from_slice(host.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    // Next state: status.
    write_varint(&mut body, 1);
    packet(0x00, &body)
}

#[derive(Debug, serde::Deserialize)]
struct StatusJson {
    #[serde(default)]
    version: Option<VersionJson>,
    players: PlayersJson,
}

#[derive(Debug, serde::Deserialize)]
struct VersionJson {
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct PlayersJson {
    max: u32,
    online: u32,
}

fn parse_status_json(raw: &str) -> anyhow::Result<ServerStatus> {
    let s: StatusJson = serde_json::from_str(raw).context("parse status response")?;
    Ok(ServerStatus {
        online: s.players.online,
        max: s.players.max,
        version: s.version.map(|v| v.name),
    })
}

async fn ping(addr: SocketAddr) -> anyhow::Result<ServerStatus> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;

    let mut req = encode_handshake(&addr.ip().to_string(), addr.port());
    req.extend_from_slice(&packet(0x00, &[]));
    stream.write_all(&req).await.context("send status request")?;

    let len = read_varint(&mut stream).await?;
    let len = usize::try_from(len).context("negative packet length")?;
    if len == 0 || len > MAX_RESPONSE_BYTES {
        anyhow::bail!("status response length out of range: {len}");
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .context("read status response")?;

    let mut cursor = payload.as_slice();
    let id = read_varint(&mut cursor).await?;
    if id != 0x00 {
        anyhow::bail!("unexpected packet id {id:#x}");
    }
    let json_len = usize::try_from(read_varint(&mut cursor).await?)
        .context("negative string length")?;
    let json = cursor
        .get(..json_len)
        .context("truncated status response")?;
    parse_status_json(std::str::from_utf8(json).context("status response is not utf-8")?)
}

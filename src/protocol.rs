//! MySQL 클라이언트/서버 프로토콜 패킷 처리 및 인증
//!
//! 패킷 형식: 3 바이트 길이 + 1 바이트 시퀀스 + 본문
//! 인증은 mysql_native_password만 지원합니다.

use crate::error::{Result, WatchError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// 분할 패킷 기준 최대 본문 길이
const MAX_PACKET_LEN: usize = 0xff_ff_ff;

const COM_QUERY: u8 = 0x03;
const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 시퀀스 번호를 관리하는 패킷 채널
pub struct PacketChannel {
    stream: TcpStream,
    sequence: u8,
}

impl PacketChannel {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WatchError::SourceUnavailable(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| {
                WatchError::SourceUnavailable(format!("Failed to connect to {}: {}", addr, e))
            })?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);
        Ok(PacketChannel {
            stream,
            sequence: 0,
        })
    }

    /// 패킷 읽기 (16MB 이상으로 분할된 패킷은 이어 붙임)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if length < MAX_PACKET_LEN {
                return Ok(payload);
            }
        }
    }

    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut chunks = payload.chunks(MAX_PACKET_LEN).peekable();
        if chunks.peek().is_none() {
            return self.write_chunk(&[]).await;
        }
        while let Some(chunk) = chunks.next() {
            self.write_chunk(chunk).await?;
            if chunk.len() == MAX_PACKET_LEN && chunks.peek().is_none() {
                self.write_chunk(&[]).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let len = (chunk.len() as u32).to_le_bytes();
        let header = [len[0], len[1], len[2], self.sequence];
        self.sequence = self.sequence.wrapping_add(1);

        self.stream.write_all(&header).await?;
        self.stream.write_all(chunk).await?;
        Ok(())
    }

    /// 새 명령 전송 (시퀀스 0부터 시작)
    pub async fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.sequence = 0;
        self.write_packet(payload).await
    }

    /// 결과셋이 없는 쿼리 실행
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        self.send_command(&payload).await?;

        let response = self.read_packet().await?;
        if is_error_packet(&response) {
            let err = ErrPacket::parse(&response)?;
            return Err(WatchError::QueryError(format!("{}: {}", sql, err)));
        }
        Ok(())
    }
}

/// 서버 Greeting (HandshakeV10) 패킷
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub auth_plugin: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_inner(data)
            .map_err(|e| WatchError::ProtocolError(format!("Malformed greeting packet: {}", e)))
    }

    fn parse_inner(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8()?;
        let server_version = read_null_terminated(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>()?;

        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble)?;
        cursor.read_u8()?; // filler

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let server_collation = cursor.read_u8()?;
        let _status = cursor.read_u16::<LittleEndian>()?;
        let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8()?;
        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved)?;

        // part 2 길이는 최소 13 바이트, 마지막은 null
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        cursor.read_exact(&mut part2)?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin = if server_capabilities & capabilities::PLUGIN_AUTH != 0 {
            read_null_terminated(&mut cursor).unwrap_or_default()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            auth_plugin,
        })
    }
}

/// ERR 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 || data[0] != 0xff {
            return Err(WatchError::ProtocolError("Not an error packet".to_string()));
        }
        let code = u16::from_le_bytes([data[1], data[2]]);
        // '#' + 5 바이트 SQL state 생략
        let message_start = if data.get(3) == Some(&b'#') { 9 } else { 3 };
        let message = data
            .get(message_start..)
            .map(|m| String::from_utf8_lossy(m).to_string())
            .unwrap_or_default();

        Ok(ErrPacket { code, message })
    }
}

impl std::fmt::Display for ErrPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

/// Greeting 수신부터 인증 완료까지 처리
pub async fn authenticate(channel: &mut PacketChannel, username: &str, password: &str) -> Result<GreetingPacket> {
    let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
    info!(
        "MySQL server version: {}, thread id: {}",
        greeting.server_version, greeting.thread_id
    );

    let response = create_handshake_response(username, password, &greeting.scramble, greeting.server_collation)?;
    channel.write_packet(&response).await?;

    let mut result = channel.read_packet().await?;

    // Auth switch request: 0xfe + plugin 이름 + 새 scramble
    if result.first() == Some(&0xfe) {
        let mut cursor = Cursor::new(&result[1..]);
        let plugin = read_null_terminated(&mut cursor)?;
        if plugin != NATIVE_PASSWORD_PLUGIN {
            return Err(WatchError::SourceUnavailable(format!(
                "Unsupported authentication plugin: {}",
                plugin
            )));
        }
        let mut scramble = result[1 + cursor.position() as usize..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }
        channel.write_packet(&scramble_native_password(password, &scramble)).await?;
        result = channel.read_packet().await?;
    }

    if is_error_packet(&result) {
        let err = ErrPacket::parse(&result)?;
        return Err(WatchError::SourceUnavailable(format!("Authentication failed: {}", err)));
    }
    if !is_ok_packet(&result) {
        return Err(WatchError::ProtocolError(format!(
            "Unexpected authentication response: 0x{:02x}",
            result.first().copied().unwrap_or_default()
        )));
    }

    info!("Authentication successful");
    Ok(greeting)
}

/// Native password 인증 응답
///
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn scramble_native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(&stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(&stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// HandshakeResponse41 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    scramble: &[u8],
    collation: u8,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::PLUGIN_AUTH;
    buffer.write_u32::<LittleEndian>(flags)?;
    buffer.write_u32::<LittleEndian>(0)?; // max packet size (기본값)
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth = scramble_native_password(password, scramble);
    buffer.write_u8(auth.len() as u8)?;
    buffer.write_all(&auth)?;

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

fn read_null_terminated<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        match reader.read_u8()? {
            0 => break,
            byte => bytes.push(byte),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xff)
}

pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&0x00)
}

/// EOF 패킷 (0xfe, 9 바이트 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xfe) && data.len() < 9
}

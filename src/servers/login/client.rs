//! Client-facing protocol dispatcher: login, keepalive, version query,
//! MD5 key request, and promotion to a char-server link.

use super::auth::{self, AuthOutcome, AuthRequest, PasswdEnc};
use super::charlink;
use super::packet::{self, CharServerRow, FrameLen};
use super::LoginEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn frame_len(opcode: u16) -> Option<FrameLen> {
    packet::client_frame_len(opcode)
}

fn fixed_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

fn peer_ip(peer: SocketAddr) -> Option<std::net::Ipv4Addr> {
    match peer.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(_) => None,
    }
}

pub async fn handle_connection(engine: Arc<LoginEngine>, mut stream: TcpStream, peer: SocketAddr) {
    let Some(ip) = peer_ip(peer) else {
        return;
    };

    if engine.ban_store.is_banned(ip, auth::now_unix()).await {
        tracing::info!("[login] [ip_banned] ip={}", ip);
        return;
    }

    loop {
        let frame = match packet::read_frame(&mut stream, frame_len).await {
            Ok(f) => f,
            Err(_) => return,
        };
        let opcode = u16::from_le_bytes([frame[0], frame[1]]);
        tracing::debug!("[login] [packet_in] ip={} opcode={:04x}", ip, opcode);

        match opcode {
            packet::C_LOGIN_PLAIN => handle_login(&engine, &mut stream, &frame, peer, ip, PasswdEnc::None).await,
            packet::C_LOGIN_MD5 => handle_login(&engine, &mut stream, &frame, peer, ip, PasswdEnc::Md5Mode1).await,
            packet::C_LOGIN_EXT => handle_login(&engine, &mut stream, &frame, peer, ip, PasswdEnc::None).await,
            packet::C_KEEPALIVE | packet::C_KEEPALIVE_ENC => { /* discard */ }
            packet::C_REQUEST_MD5_KEY => {
                let reply = packet::build_md5_key(&engine.md5_salt);
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
            packet::C_CHARSERVER_HELLO => {
                charlink::promote(engine, stream, frame).await;
                return;
            }
            packet::C_VERSION_PROBE => {
                let reply = packet::build_version_reply(0, (1, 0, 0));
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
            packet::C_GRACEFUL_CLOSE => {
                let _ = stream.write_all(&packet::build_server_closed(0)).await;
                return;
            }
            _ => return,
        }
    }
}

async fn handle_login(
    engine: &LoginEngine,
    stream: &mut TcpStream,
    frame: &[u8],
    peer: SocketAddr,
    ip: std::net::Ipv4Addr,
    encrypted_variant: PasswdEnc,
) {
    let min_len = match encrypted_variant {
        PasswdEnc::Md5Mode1 => 46,
        _ => 54,
    };
    if frame.len() < min_len {
        return;
    }
    let version = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let username = fixed_field(&frame[6..30]);

    let (password_bytes, passwd_enc) = match encrypted_variant {
        PasswdEnc::Md5Mode1 => (frame[30..46].to_vec(), PasswdEnc::Md5Mode1),
        _ => {
            let end = (30 + 24).min(frame.len());
            let pw = fixed_field(&frame[30..end]);
            (pw.into_bytes(), PasswdEnc::None)
        }
    };

    let req = AuthRequest {
        username,
        password_bytes,
        client_version: version,
        passwd_enc,
        peer_ip: ip,
        for_char_server: false,
    };

    match auth::authenticate(engine, req).await {
        AuthOutcome::GrantedClient { account_id, token, sex, last_login } => {
            let rows = char_server_rows(engine, peer.ip()).await;
            let last_login_str = format_timestamp(&engine.config.date_format, last_login);
            let reply = packet::build_login_accepted(
                token.login_id1,
                account_id,
                token.login_id2,
                &last_login_str,
                auth::sex_to_wire(sex),
                &rows,
            );
            let _ = stream.write_all(&reply).await;
        }
        AuthOutcome::GrantedCharServer { .. } => {
            // A char-server identity must authenticate via 0x2710, not a
            // client login opcode.
            let reply = packet::build_login_refused(auth::RC_REJECTED, "");
            let _ = stream.write_all(&reply).await;
        }
        AuthOutcome::Rejected { rcode, ban_until } => {
            let date = ban_until
                .map(|ts| format_timestamp(&engine.config.date_format, ts))
                .unwrap_or_default();
            let reply = packet::build_login_refused(rcode, &date);
            let _ = stream.write_all(&reply).await;
        }
    }
}

async fn char_server_rows(engine: &LoginEngine, peer: std::net::IpAddr) -> Vec<CharServerRow> {
    let table = engine.charservers.lock().await;
    table
        .iter()
        .map(|(_, entry)| {
            let advertised = match peer {
                std::net::IpAddr::V4(v4) => engine.lanmap.rewrite_char_ip(v4).unwrap_or(entry.ip),
                std::net::IpAddr::V6(_) => entry.ip,
            };
            CharServerRow {
                ip: advertised.octets(),
                port: entry.port,
                name: entry.name.clone(),
                user_count: entry.user_count,
                maintenance: entry.maintenance as u16,
                is_new: entry.is_new as u16,
            }
        })
        .collect()
}

fn format_timestamp(fmt: &str, ts: i64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_field_trims_at_first_nul() {
        let mut buf = [0u8; 10];
        buf[..5].copy_from_slice(b"alice");
        assert_eq!(fixed_field(&buf), "alice");
    }

    #[test]
    fn peer_ip_rejects_v6() {
        let addr: SocketAddr = "[::1]:1234".parse().unwrap();
        assert_eq!(peer_ip(addr), None);
    }
}

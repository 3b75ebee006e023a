//! Wire framing and packet construction for both the client-facing and
//! char-link protocols.
//!
//! Every opcode is a 2-byte little-endian tag. A recognized opcode maps
//! to either a fixed total frame length or a length that follows in a
//! 2-byte field right after the opcode; an unrecognized opcode is the
//! caller's cue to close the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Peer protocol errors: malformed opcode, truncated frame, or an opcode
/// not recognized on the current connection's dispatch table. The
/// caller's only valid response to any of these is to close the peer.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unrecognized opcode {opcode:04x}")]
    UnrecognizedOpcode { opcode: u16 },
    #[error("degenerate fixed length {len} for opcode {opcode:04x}")]
    DegenerateFixedLength { opcode: u16, len: usize },
    #[error("length-prefixed frame for opcode {opcode:04x} shorter than its own header: {len}")]
    TruncatedHeader { opcode: u16, len: usize },
    #[error("connection closed or reset while reading a frame")]
    Io(#[from] std::io::Error),
}

// ── Client-facing opcodes ────────────────────────────────────────────
pub const C_LOGIN_PLAIN: u16 = 0x0064;
pub const C_LOGIN_MD5: u16 = 0x01dd;
pub const C_LOGIN_EXT: u16 = 0x0277;
pub const C_KEEPALIVE: u16 = 0x0200;
pub const C_KEEPALIVE_ENC: u16 = 0x0204;
pub const C_REQUEST_MD5_KEY: u16 = 0x01db;
pub const C_CHARSERVER_HELLO: u16 = 0x2710;
pub const C_VERSION_PROBE: u16 = 0x7530;
pub const C_GRACEFUL_CLOSE: u16 = 0x7532;

pub const S_LOGIN_REFUSED: u16 = 0x006a;
pub const S_LOGIN_ACCEPTED: u16 = 0x0069;
pub const S_SERVER_CLOSED: u16 = 0x0081;
pub const S_MD5_KEY: u16 = 0x01dc;
pub const S_CHARSERVER_RESULT: u16 = 0x2711;
pub const S_VERSION_REPLY: u16 = 0x7531;

// ── Char-link opcodes (promoted connections only) ────────────────────
pub const L_GM_RELOAD_REQUEST: u16 = 0x2709;
pub const L_TOKEN_VALIDATE: u16 = 0x2712;
pub const L_TOKEN_RESULT: u16 = 0x2713;
pub const L_USERCOUNT_REPORT: u16 = 0x2714;
pub const L_USERCOUNT_ACK: u16 = 0x2718;
pub const L_EMAIL_FETCH: u16 = 0x2716;
pub const L_EMAIL_INFO: u16 = 0x2717;
pub const L_GM_CHANGE: u16 = 0x2720;
pub const L_GM_CHANGE_RESULT: u16 = 0x2721;
pub const L_EMAIL_CHANGE: u16 = 0x2722;
pub const L_SEX_TOGGLE_BROADCAST: u16 = 0x2723;
pub const L_STATE_SET: u16 = 0x2724;
pub const L_BAN_ADD: u16 = 0x2725;
pub const L_SEX_TOGGLE: u16 = 0x2727;
pub const L_VARS_REPLACE: u16 = 0x2728;
pub const L_VARS_BROADCAST: u16 = 0x2729;
pub const L_BAN_CLEAR: u16 = 0x272a;
pub const L_PRESENCE_ONLINE: u16 = 0x272b;
pub const L_PRESENCE_OFFLINE: u16 = 0x272c;
pub const L_PRESENCE_SNAPSHOT: u16 = 0x272d;
pub const L_VARS_FETCH: u16 = 0x272e;
pub const L_GM_LIST_BROADCAST: u16 = 0x2732;
pub const L_STATE_OR_BAN_BROADCAST: u16 = 0x2731;
pub const L_KICK_GHOST_BROADCAST: u16 = 0x2734;
pub const L_WAN_IP_UPDATE: u16 = 0x2736;
pub const L_MARK_ALL_OFFLINE: u16 = 0x2737;

/// Expected length of the remainder of a frame, once the 2-byte opcode
/// has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// The whole frame (including the 2-byte opcode) is exactly this long.
    Fixed(usize),
    /// A 2-byte little-endian total-length field follows the opcode.
    LengthPrefixed,
}

/// Length table for opcodes accepted on a pre-promotion client socket.
pub fn client_frame_len(opcode: u16) -> Option<FrameLen> {
    use FrameLen::Fixed;
    match opcode {
        C_LOGIN_PLAIN => Some(Fixed(55)),
        C_LOGIN_MD5 => Some(Fixed(47)),
        C_LOGIN_EXT => Some(Fixed(84)),
        C_KEEPALIVE => Some(Fixed(26)),
        C_KEEPALIVE_ENC => Some(Fixed(18)),
        C_REQUEST_MD5_KEY => Some(Fixed(2)),
        C_CHARSERVER_HELLO => Some(Fixed(86)),
        C_VERSION_PROBE => Some(Fixed(2)),
        C_GRACEFUL_CLOSE => Some(Fixed(2)),
        _ => None,
    }
}

/// Length table for opcodes accepted on a promoted char-link socket.
pub fn charlink_frame_len(opcode: u16) -> Option<FrameLen> {
    use FrameLen::Fixed;
    match opcode {
        L_GM_RELOAD_REQUEST => Some(Fixed(2)),
        L_TOKEN_VALIDATE => Some(Fixed(19)),
        L_USERCOUNT_REPORT => Some(Fixed(6)),
        L_EMAIL_FETCH => Some(Fixed(6)),
        L_GM_CHANGE => Some(Fixed(10)),
        L_EMAIL_CHANGE => Some(Fixed(86)),
        L_STATE_SET => Some(Fixed(10)),
        L_BAN_ADD => Some(Fixed(18)),
        L_SEX_TOGGLE => Some(Fixed(6)),
        L_VARS_REPLACE => Some(FrameLen::LengthPrefixed),
        L_BAN_CLEAR => Some(Fixed(6)),
        L_PRESENCE_ONLINE => Some(Fixed(6)),
        L_PRESENCE_OFFLINE => Some(Fixed(6)),
        L_PRESENCE_SNAPSHOT => Some(FrameLen::LengthPrefixed),
        L_VARS_FETCH => Some(Fixed(6)),
        L_WAN_IP_UPDATE => Some(Fixed(6)),
        L_MARK_ALL_OFFLINE => Some(Fixed(2)),
        _ => None,
    }
}

/// Reads one complete frame, given a length table for the current
/// protocol state. Returns the full frame bytes including the opcode.
/// Generic over the reader so it serves both a fresh `TcpStream` (the
/// pre-promotion client socket) and an `OwnedReadHalf` (a promoted
/// char-link socket, split so its writer half can run concurrently).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    frame_len: impl Fn(u16) -> Option<FrameLen>,
) -> Result<Vec<u8>, PacketError> {
    let mut op_bytes = [0u8; 2];
    reader.read_exact(&mut op_bytes).await?;
    let opcode = u16::from_le_bytes(op_bytes);

    match frame_len(opcode) {
        Some(FrameLen::Fixed(total)) => {
            if total < 2 {
                return Err(PacketError::DegenerateFixedLength { opcode, len: total });
            }
            let mut buf = vec![0u8; total];
            buf[..2].copy_from_slice(&op_bytes);
            reader.read_exact(&mut buf[2..]).await?;
            Ok(buf)
        }
        Some(FrameLen::LengthPrefixed) => {
            let mut len_bytes = [0u8; 2];
            reader.read_exact(&mut len_bytes).await?;
            let total = u16::from_le_bytes(len_bytes) as usize;
            if total < 4 {
                return Err(PacketError::TruncatedHeader { opcode, len: total });
            }
            let mut buf = vec![0u8; total];
            buf[..2].copy_from_slice(&op_bytes);
            buf[2..4].copy_from_slice(&len_bytes);
            reader.read_exact(&mut buf[4..]).await?;
            Ok(buf)
        }
        None => Err(PacketError::UnrecognizedOpcode { opcode }),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), PacketError> {
    writer.write_all(bytes).await?;
    Ok(())
}

/// One char-server advertisement row in a login-accepted reply: 4 IP,
/// 2 port, 20 name (NUL-padded), 2 user count, 2 maintenance, 2 new flag.
pub struct CharServerRow {
    pub ip: [u8; 4],
    pub port: u16,
    pub name: String,
    pub user_count: u16,
    pub maintenance: u16,
    pub is_new: u16,
}

fn put_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// Builds 0x006a: rcode (1 byte) + 20-byte date string, NUL-padded.
pub fn build_login_refused(rcode: u8, ban_until: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 2 + 1 + 20];
    buf[0..2].copy_from_slice(&S_LOGIN_REFUSED.to_le_bytes());
    buf[2] = rcode;
    put_fixed_str(&mut buf[3..23], ban_until);
    buf
}

/// Builds 0x0069: login-id-1, account-id, login-id-2, 4 reserved zero
/// bytes, 24-byte last-login string, 1-byte sex, then one 32-byte row
/// per connected char-server.
pub fn build_login_accepted(
    login_id1: u32,
    account_id: u32,
    login_id2: u32,
    last_login: &str,
    sex: u8,
    servers: &[CharServerRow],
) -> Vec<u8> {
    let body_len = 4 + 4 + 4 + 4 + 24 + 1 + servers.len() * 32;
    let total = 2 + 2 + body_len;
    let mut buf = vec![0u8; total];
    buf[0..2].copy_from_slice(&S_LOGIN_ACCEPTED.to_le_bytes());
    buf[2..4].copy_from_slice(&(total as u16).to_le_bytes());
    let mut off = 4;
    buf[off..off + 4].copy_from_slice(&login_id1.to_le_bytes());
    off += 4;
    buf[off..off + 4].copy_from_slice(&account_id.to_le_bytes());
    off += 4;
    buf[off..off + 4].copy_from_slice(&login_id2.to_le_bytes());
    off += 4;
    off += 4; // reserved zero
    put_fixed_str(&mut buf[off..off + 24], last_login);
    off += 24;
    buf[off] = sex;
    off += 1;
    for row in servers {
        buf[off..off + 4].copy_from_slice(&row.ip);
        buf[off + 4..off + 6].copy_from_slice(&row.port.to_le_bytes());
        put_fixed_str(&mut buf[off + 6..off + 26], &row.name);
        buf[off + 26..off + 28].copy_from_slice(&row.user_count.to_le_bytes());
        buf[off + 28..off + 30].copy_from_slice(&row.maintenance.to_le_bytes());
        buf[off + 30..off + 32].copy_from_slice(&row.is_new.to_le_bytes());
        off += 32;
    }
    buf
}

/// Builds 0x0081: the login process is shutting this connection down.
pub fn build_server_closed(reason: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    buf[0..2].copy_from_slice(&S_SERVER_CLOSED.to_le_bytes());
    buf[2] = reason;
    buf
}

/// Builds 0x01dc: length-prefixed MD5 salt key.
pub fn build_md5_key(key: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + key.len()];
    buf[0..2].copy_from_slice(&S_MD5_KEY.to_le_bytes());
    buf[2..4].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[4..].copy_from_slice(key);
    buf
}

/// Builds 0x2711: char-server handshake result (0 ok, 3 refused).
pub fn build_charserver_result(status: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    buf[0..2].copy_from_slice(&S_CHARSERVER_RESULT.to_le_bytes());
    buf[2] = status;
    buf
}

/// Builds 0x7531: fixed 10-byte version-info reply (protocol tag, 3
/// version component bytes, 5 reserved bytes).
pub fn build_version_reply(protocol_tag: u8, version: (u8, u8, u8)) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0..2].copy_from_slice(&S_VERSION_REPLY.to_le_bytes());
    buf[2] = protocol_tag;
    buf[3] = version.0;
    buf[4] = version.1;
    buf[5] = version.2;
    buf
}

/// Builds 0x2713: token validation result. `result` 0 = ok, 1 = already
/// consumed / not found.
pub fn build_token_result(account_id: u32, result: u8, email: &str, connect_until: i64) -> Vec<u8> {
    let mut buf = vec![0u8; 2 + 4 + 1 + 40 + 4];
    buf[0..2].copy_from_slice(&L_TOKEN_RESULT.to_le_bytes());
    buf[2..6].copy_from_slice(&account_id.to_le_bytes());
    buf[6] = result;
    put_fixed_str(&mut buf[7..47], email);
    buf[47..51].copy_from_slice(&(connect_until as u32).to_le_bytes());
    buf
}

/// Builds 0x2718: user-count report acknowledgment.
pub fn build_usercount_ack() -> Vec<u8> {
    L_USERCOUNT_ACK.to_le_bytes().to_vec()
}

/// Builds 0x2717: email + connect-until for one account.
pub fn build_email_info(account_id: u32, email: &str, connect_until: i64) -> Vec<u8> {
    let mut buf = vec![0u8; 2 + 4 + 40 + 4];
    buf[0..2].copy_from_slice(&L_EMAIL_INFO.to_le_bytes());
    buf[2..6].copy_from_slice(&account_id.to_le_bytes());
    put_fixed_str(&mut buf[6..46], email);
    buf[46..50].copy_from_slice(&(connect_until as u32).to_le_bytes());
    buf
}

/// Builds 0x2721: GM-change result. Always carries `new_acc = 0` — the
/// opcode is deprecated and implemented as always-fail.
pub fn build_gm_change_result() -> Vec<u8> {
    let mut buf = vec![0u8; 6];
    buf[0..2].copy_from_slice(&L_GM_CHANGE_RESULT.to_le_bytes());
    buf
}

/// Builds 0x2731: state-code (kind 0) or ban (kind 1) change broadcast.
pub fn build_state_or_ban_broadcast(account_id: u32, kind: u8, value: i64) -> Vec<u8> {
    let mut buf = vec![0u8; 2 + 4 + 1 + 4];
    buf[0..2].copy_from_slice(&L_STATE_OR_BAN_BROADCAST.to_le_bytes());
    buf[2..6].copy_from_slice(&account_id.to_le_bytes());
    buf[6] = kind;
    buf[7..11].copy_from_slice(&(value as u32).to_le_bytes());
    buf
}

/// Builds 0x2723: sex-toggle broadcast.
pub fn build_sex_toggle_broadcast(account_id: u32, new_sex: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 2 + 4 + 1];
    buf[0..2].copy_from_slice(&L_SEX_TOGGLE_BROADCAST.to_le_bytes());
    buf[2..6].copy_from_slice(&account_id.to_le_bytes());
    buf[6] = new_sex;
    buf
}

/// Builds 0x2729: global-variable broadcast/reply, one (key, value) pair
/// per entry, length-prefixed overall.
pub fn build_vars_broadcast(account_id: u32, vars: &[(String, String)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&account_id.to_le_bytes());
    for (k, v) in vars {
        let mut krow = [0u8; 32];
        put_fixed_str(&mut krow, k);
        body.extend_from_slice(&krow);
        let mut vrow = [0u8; 256];
        put_fixed_str(&mut vrow, v);
        body.extend_from_slice(&vrow);
    }
    let total = 4 + body.len();
    let mut buf = vec![0u8; total];
    buf[0..2].copy_from_slice(&L_VARS_BROADCAST.to_le_bytes());
    buf[2..4].copy_from_slice(&(total as u16).to_le_bytes());
    buf[4..].copy_from_slice(&body);
    buf
}

/// Builds 0x2734: ghost-kick broadcast for a concurrent-login conflict.
pub fn build_kick_ghost_broadcast(account_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 6];
    buf[0..2].copy_from_slice(&L_KICK_GHOST_BROADCAST.to_le_bytes());
    buf[2..6].copy_from_slice(&account_id.to_le_bytes());
    buf
}

/// Maximum payload size per [`build_gm_list_chunks`] flush before a
/// packet is cut and a new one started.
pub const GM_LIST_CHUNK_THRESHOLD: usize = 32_000;

/// Builds one or more 0x2732 broadcasts for the GM list, flushing a
/// packet once the accumulated row payload would exceed
/// [`GM_LIST_CHUNK_THRESHOLD`].
pub fn build_gm_list_chunks(gm_list: &[(u32, u8)]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut rows = Vec::new();

    for &(account_id, level) in gm_list {
        if rows.len() * 5 + 5 > GM_LIST_CHUNK_THRESHOLD {
            chunks.push(finish_gm_chunk(&rows));
            rows.clear();
        }
        rows.push((account_id, level));
    }
    if !rows.is_empty() || chunks.is_empty() {
        chunks.push(finish_gm_chunk(&rows));
    }
    chunks
}

fn finish_gm_chunk(rows: &[(u32, u8)]) -> Vec<u8> {
    let body_len = rows.len() * 5;
    let total = 4 + body_len;
    let mut buf = vec![0u8; total];
    buf[0..2].copy_from_slice(&L_GM_LIST_BROADCAST.to_le_bytes());
    buf[2..4].copy_from_slice(&(total as u16).to_le_bytes());
    let mut off = 4;
    for &(account_id, level) in rows {
        buf[off..off + 4].copy_from_slice(&account_id.to_le_bytes());
        buf[off + 4] = level;
        off += 5;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_refused_layout() {
        let pkt = build_login_refused(1, "2030-01-01 00:00:00");
        assert_eq!(pkt.len(), 23);
        assert_eq!(u16::from_le_bytes([pkt[0], pkt[1]]), S_LOGIN_REFUSED);
        assert_eq!(pkt[2], 1);
    }

    #[test]
    fn login_accepted_grows_with_server_count() {
        let rows = vec![CharServerRow {
            ip: [10, 0, 0, 1],
            port: 6121,
            name: "Server1".to_string(),
            user_count: 3,
            maintenance: 0,
            is_new: 0,
        }];
        let pkt = build_login_accepted(1, 2000000, 2, "2026-01-01 00:00:00", 0, &rows);
        assert_eq!(pkt.len(), 4 + 4 + 4 + 4 + 4 + 24 + 1 + 32);
        assert_eq!(u16::from_le_bytes([pkt[0], pkt[1]]), S_LOGIN_ACCEPTED);
    }

    #[test]
    fn client_frame_len_table_matches_known_opcode_lengths() {
        assert_eq!(client_frame_len(C_LOGIN_PLAIN), Some(FrameLen::Fixed(55)));
        assert_eq!(client_frame_len(C_LOGIN_MD5), Some(FrameLen::Fixed(47)));
        assert_eq!(client_frame_len(C_LOGIN_EXT), Some(FrameLen::Fixed(84)));
        assert_eq!(client_frame_len(C_CHARSERVER_HELLO), Some(FrameLen::Fixed(86)));
        assert_eq!(client_frame_len(0x9999), None);
    }

    #[test]
    fn gm_list_chunking_splits_on_threshold() {
        let gm_list: Vec<(u32, u8)> = (0..10_000).map(|i| (i, 50)).collect();
        let chunks = build_gm_list_chunks(&gm_list);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= GM_LIST_CHUNK_THRESHOLD + 32);
        }
    }

    #[test]
    fn gm_list_chunking_emits_one_empty_chunk_for_empty_list() {
        let chunks = build_gm_list_chunks(&[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4);
    }
}

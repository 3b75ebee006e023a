//! Char-link protocol: the per-char-server dispatcher active once a
//! connection has promoted past the 0x2710 handshake.

use super::auth::{self, AuthOutcome, AuthRequest, PasswdEnc};
use super::charserver::CharServerEntry;
use super::packet::{self, FrameLen};
use super::LoginEngine;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn frame_len(opcode: u16) -> Option<FrameLen> {
    packet::charlink_frame_len(opcode)
}

fn fixed_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Parses and authenticates the 0x2710 handshake already read by
/// [`super::client::handle_connection`]; on success, promotes the
/// connection into the char-link dispatch loop for its lifetime.
pub async fn promote(engine: Arc<LoginEngine>, mut stream: TcpStream, frame: Vec<u8>) {
    if frame.len() < 86 {
        let _ = stream.write_all(&packet::build_charserver_result(3)).await;
        return;
    }

    let username = fixed_field(&frame[2..26]);
    let password = fixed_field(&frame[26..50]);
    let ip = Ipv4Addr::new(frame[50], frame[51], frame[52], frame[53]);
    let port = u16::from_le_bytes([frame[54], frame[55]]);
    let name = fixed_field(&frame[56..76]);
    let maintenance = u16::from_le_bytes([frame[76], frame[77]]) != 0;
    let is_new = u16::from_le_bytes([frame[78], frame[79]]) != 0;

    let req = AuthRequest {
        username,
        password_bytes: password.into_bytes(),
        client_version: 0,
        passwd_enc: PasswdEnc::None,
        peer_ip: ip,
        for_char_server: true,
    };

    let account_id = match auth::authenticate(&engine, req).await {
        AuthOutcome::GrantedCharServer { account_id } => account_id,
        _ => {
            let _ = stream.write_all(&packet::build_charserver_result(3)).await;
            return;
        }
    };

    let slot = {
        let table = engine.charservers.lock().await;
        table.find_free_slot()
    };
    let Some(slot) = slot else {
        let _ = stream.write_all(&packet::build_charserver_result(3)).await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
    {
        let mut table = engine.charservers.lock().await;
        table.insert(slot, CharServerEntry {
            name: name.clone(),
            ip,
            port,
            user_count: 0,
            maintenance,
            is_new,
            tx,
        });
    }

    engine.account_store.sstatus_connect(slot as u32, &name).await;
    tracing::info!("[charlink] [connected] slot={} name={} account_id={}", slot, name, account_id);

    if stream.write_all(&packet::build_charserver_result(0)).await.is_err() {
        cleanup(&engine, slot).await;
        return;
    }

    let gm_list = engine.gm_list.lock().await.clone();
    for chunk in packet::build_gm_list_chunks(&gm_list) {
        if stream.write_all(&chunk).await.is_err() {
            cleanup(&engine, slot).await;
            return;
        }
    }

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half.write_all(&msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = match packet::read_frame(&mut read_half, frame_len).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("[charlink] [frame_error] slot={} err={}", slot, e);
                break;
            }
        };
        if !dispatch(&engine, slot, &frame).await {
            break;
        }
    }

    writer.abort();
    cleanup(&engine, slot).await;
    tracing::info!("[charlink] [disconnected] slot={}", slot);
}

async fn cleanup(engine: &LoginEngine, slot: usize) {
    engine.charservers.lock().await.remove(slot);
    engine.presence.lock().await.mark_all_offline_from(slot as i32);
}

/// Handles one frame on a promoted link. Returns false to close the link.
async fn dispatch(engine: &LoginEngine, slot: usize, frame: &[u8]) -> bool {
    let opcode = u16::from_le_bytes([frame[0], frame[1]]);
    let tx = {
        let table = engine.charservers.lock().await;
        match table.get(slot) {
            Some(e) => e.tx.clone(),
            None => return false,
        }
    };

    match opcode {
        packet::L_GM_RELOAD_REQUEST => {
            let fresh = engine.account_store.load_gm_list().await;
            *engine.gm_list.lock().await = fresh.clone();
            let table = engine.charservers.lock().await;
            for chunk in packet::build_gm_list_chunks(&fresh) {
                table.broadcast_except(None, chunk).await;
            }
        }
        packet::L_TOKEN_VALIDATE => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let login_id1 = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
            let login_id2 = u32::from_le_bytes([frame[10], frame[11], frame[12], frame[13]]);
            let sex = frame[14];
            let ip = Ipv4Addr::new(frame[15], frame[16], frame[17], frame[18]);

            let consumed = engine.tokens.lock().await.consume(account_id, login_id1, login_id2, sex, ip);
            let reply = if consumed {
                let account = engine.account_store.lookup_by_id(account_id).await;
                let (email, connect_until) = account
                    .map(|a| (a.email, a.connect_until))
                    .unwrap_or_default();
                packet::build_token_result(account_id, 0, &email, connect_until)
            } else {
                packet::build_token_result(account_id, 1, "", 0)
            };
            let _ = tx.send(reply).await;
        }
        packet::L_USERCOUNT_REPORT => {
            let count = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            engine.account_store.sstatus_update_count(slot as u32, count).await;
            if let Some(entry) = engine.charservers.lock().await.get_mut(slot) {
                entry.user_count = count.min(u16::MAX as u32) as u16;
            }
            let _ = tx.send(packet::build_usercount_ack()).await;
        }
        packet::L_EMAIL_FETCH => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let account = engine.account_store.lookup_by_id(account_id).await;
            let (email, connect_until) = account.map(|a| (a.email, a.connect_until)).unwrap_or_default();
            let _ = tx.send(packet::build_email_info(account_id, &email, connect_until)).await;
        }
        packet::L_GM_CHANGE => {
            // Deprecated: GM level changes now happen out of band; this
            // handler only exists to answer the request with a failure.
            let _ = tx.send(packet::build_gm_change_result()).await;
        }
        packet::L_EMAIL_CHANGE => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let current = fixed_field(&frame[6..46]);
            let new_email = fixed_field(&frame[46..86]);
            engine.account_store.set_email(account_id, &current, &new_email).await;
        }
        packet::L_STATE_SET => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let state = i32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]);
            let previous = engine.account_store.lookup_by_id(account_id).await.map(|a| a.state);
            engine.account_store.set_state(account_id, state).await;
            if previous != Some(state) {
                let bytes = packet::build_state_or_ban_broadcast(account_id, 0, state as i64);
                let table = engine.charservers.lock().await;
                table.broadcast_except(Some(slot), bytes).await;
            }
        }
        packet::L_BAN_ADD => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let years = u16::from_le_bytes([frame[6], frame[7]]) as i64;
            let months = u16::from_le_bytes([frame[8], frame[9]]) as i64;
            let days = u16::from_le_bytes([frame[10], frame[11]]) as i64;
            let hours = u16::from_le_bytes([frame[12], frame[13]]) as i64;
            let minutes = u16::from_le_bytes([frame[14], frame[15]]) as i64;
            let seconds = u16::from_le_bytes([frame[16], frame[17]]) as i64;
            let delta = seconds + minutes * 60 + hours * 3600 + days * 86400 + months * 2_592_000 + years * 31_536_000;
            let base = engine.account_store.lookup_by_id(account_id).await.map(|a| a.ban_until).unwrap_or(0);
            let new_until = (if base > auth::now_unix() { base } else { auth::now_unix() }) + delta;
            engine.account_store.set_ban_until(account_id, new_until).await;
            let bytes = packet::build_state_or_ban_broadcast(account_id, 1, new_until);
            let table = engine.charservers.lock().await;
            table.broadcast_except(Some(slot), bytes).await;
        }
        packet::L_SEX_TOGGLE => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            if let Some(account) = engine.account_store.lookup_by_id(account_id).await {
                // Toggle is one-directional: M flips to M (no-op) and
                // every other value collapses to F. F never becomes M.
                let new_sex = if account.sex == 'M' { 'M' } else { 'F' };
                engine.account_store.set_sex(account_id, new_sex).await;
                let bytes = packet::build_sex_toggle_broadcast(account_id, new_sex as u8);
                let table = engine.charservers.lock().await;
                table.broadcast_except(Some(slot), bytes).await;
            }
        }
        packet::L_VARS_REPLACE => {
            if frame.len() < 8 {
                return true;
            }
            let account_id = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let mut vars = std::collections::HashMap::new();
            let mut off = 8;
            while off + 32 + 256 <= frame.len() {
                let key = fixed_field(&frame[off..off + 32]);
                let value = fixed_field(&frame[off + 32..off + 32 + 256]);
                if !key.is_empty() {
                    vars.insert(key, value);
                }
                off += 32 + 256;
            }
            engine.account_store.replace_variables(account_id, vars.clone()).await;
            let pairs: Vec<(String, String)> = vars.into_iter().collect();
            let bytes = packet::build_vars_broadcast(account_id, &pairs);
            let table = engine.charservers.lock().await;
            table.broadcast_except(Some(slot), bytes).await;
        }
        packet::L_BAN_CLEAR => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            engine.account_store.set_ban_until(account_id, 0).await;
        }
        packet::L_PRESENCE_ONLINE => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            engine.presence.lock().await.mark_online(account_id, slot as i32);
        }
        packet::L_PRESENCE_OFFLINE => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            engine.presence.lock().await.mark_offline(account_id);
        }
        packet::L_PRESENCE_SNAPSHOT => {
            let mut ids = Vec::new();
            let mut off = 4;
            while off + 4 <= frame.len() {
                ids.push(u32::from_le_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]]));
                off += 4;
            }
            engine.presence.lock().await.snapshot_for_char_server(slot as i32, &ids);
        }
        packet::L_VARS_FETCH => {
            let account_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
            let vars = engine.account_store.read_variables(account_id).await;
            let pairs: Vec<(String, String)> = vars.into_iter().collect();
            let _ = tx.send(packet::build_vars_broadcast(account_id, &pairs)).await;
        }
        packet::L_WAN_IP_UPDATE => {
            let ip = Ipv4Addr::new(frame[2], frame[3], frame[4], frame[5]);
            if let Some(entry) = engine.charservers.lock().await.get_mut(slot) {
                entry.ip = ip;
            }
        }
        packet::L_MARK_ALL_OFFLINE => {
            engine.presence.lock().await.mark_all_offline_from(slot as i32);
        }
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_field_trims_at_nul() {
        let mut buf = [0u8; 24];
        buf[..2].copy_from_slice(b"s1");
        assert_eq!(fixed_field(&buf), "s1");
    }
}

//! Credential verification, state-code translation, auto-registration,
//! and token minting — the fail-fast 11-step algorithm.

use super::LoginEngine;
use super::token::Token;
use md5::{Digest, Md5};
use rand::Rng;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// How the password field on the wire was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswdEnc {
    None,
    Md5Mode1,
    Md5Mode2,
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub username: String,
    /// Raw wire bytes: the plaintext password for [`PasswdEnc::None`],
    /// or a 16-byte MD5 digest for the salted modes.
    pub password_bytes: Vec<u8>,
    pub client_version: u32,
    pub passwd_enc: PasswdEnc,
    pub peer_ip: Ipv4Addr,
    pub for_char_server: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    GrantedClient { account_id: u32, token: Token, sex: char, last_login: i64 },
    GrantedCharServer { account_id: u32 },
    Rejected { rcode: u8, ban_until: Option<i64> },
}

// Login-refused rcode values, sent back verbatim in 0x006a's body.
pub const RC_UNREGISTERED: u8 = 0;
pub const RC_BAD_PASSWORD: u8 = 1;
pub const RC_EXPIRED: u8 = 2;
pub const RC_REJECTED: u8 = 3;
pub const RC_BLOCKED_BY_GM: u8 = 4;
pub const RC_CLIENT_TOO_OLD: u8 = 5;
pub const RC_BANNED: u8 = 6;
pub const RC_ERASED: u8 = 99;

/// Wire encoding of an account's sex byte: F=0, M=1, S=2 — the
/// convention the original login/char-server pair has always used
/// (0x0069's sex field, the token's sex field, 0x2712's sex byte).
pub fn sex_to_wire(sex: char) -> u8 {
    match sex {
        'S' => 2,
        'M' => 1,
        _ => 0,
    }
}

fn reject(rcode: u8) -> AuthOutcome {
    AuthOutcome::Rejected { rcode, ban_until: None }
}

fn reject_banned(ban_until: i64) -> AuthOutcome {
    AuthOutcome::Rejected { rcode: RC_BANNED, ban_until: Some(ban_until) }
}

/// `digest(compose(salt, stored))` for the two historical salting modes.
fn md5_compose(salt: &[u8], stored: &[u8], mode: PasswdEnc) -> [u8; 16] {
    let mut hasher = Md5::new();
    match mode {
        PasswdEnc::Md5Mode1 => {
            hasher.update(salt);
            hasher.update(stored);
        }
        PasswdEnc::Md5Mode2 => {
            hasher.update(stored);
            hasher.update(salt);
        }
        PasswdEnc::None => unreachable!("md5_compose only called for salted modes"),
    }
    hasher.finalize().into()
}

fn auto_register_hint(username: &str) -> Option<(String, char)> {
    if username.len() < 4 {
        return None;
    }
    let (prefix, suffix) = username.split_at(username.len() - 2);
    if prefix.len() < 4 {
        return None;
    }
    match suffix.to_ascii_lowercase().as_str() {
        "_m" => Some((prefix.to_string(), 'M')),
        "_f" => Some((prefix.to_string(), 'F')),
        _ => None,
    }
}

/// Rolling-window registration flood brake: at most `allowed` successful
/// creations within any `window_secs` window.
pub struct RegistrationBrake {
    allowed: u32,
    window_secs: i64,
    recent: Mutex<VecDeque<i64>>,
}

impl RegistrationBrake {
    pub fn new(allowed: u32, window_secs: u64) -> Self {
        RegistrationBrake { allowed, window_secs: window_secs as i64, recent: Mutex::new(VecDeque::new()) }
    }

    /// Returns true (and records the attempt) if under the cap.
    pub async fn try_register(&self, now: i64) -> bool {
        let mut recent = self.recent.lock().await;
        while matches!(recent.front(), Some(&t) if t <= now - self.window_secs) {
            recent.pop_front();
        }
        if recent.len() as u32 >= self.allowed {
            return false;
        }
        recent.push_back(now);
        true
    }
}

/// Runs the fail-fast authentication algorithm against `engine`'s tables.
pub async fn authenticate(engine: &LoginEngine, req: AuthRequest) -> AuthOutcome {
    let now = now_unix();
    let cfg = &engine.config;

    // 1. DNSBL gate.
    if cfg.use_dnsbl && crate::network::ipban::dnsbl_hit(req.peer_ip, &cfg.dnsbl_servers).await {
        tracing::warn!("[auth] [dnsbl_hit] ip={}", req.peer_ip);
        return reject(RC_REJECTED);
    }

    // 2. Auto-registration via _M/_F suffix.
    if cfg.new_account && req.passwd_enc == PasswdEnc::None {
        if let Some((base_name, sex_hint)) = auto_register_hint(&req.username) {
            if req.password_bytes.len() >= 4 {
                if !engine.registration_brake.try_register(now).await {
                    return reject(RC_REJECTED);
                }
                let password = String::from_utf8_lossy(&req.password_bytes).to_string();
                if let Err(e) = engine.account_store.create(&base_name, &password, sex_hint).await {
                    tracing::warn!("[auth] [auto_register_failed] user={} err={}", base_name, e);
                    return reject(RC_REJECTED);
                }
            }
        }
    }

    // 3. Load account.
    let Some(account) = engine.account_store.lookup(&req.username, cfg.case_sensitive).await else {
        return reject(RC_UNREGISTERED);
    };

    // 4. Client version gate.
    if cfg.check_client_version && req.client_version != cfg.client_version_to_connect {
        return reject(RC_CLIENT_TOO_OLD);
    }

    // 5. Administrative hard states.
    if account.state == -3 {
        return reject(RC_BANNED);
    }
    if account.state == -2 {
        engine
            .ban_store
            .record_dynamic_ban(
                req.peer_ip,
                now,
                cfg.dynamic_pass_failure_ban_duration * 60,
                &format!("dynamic ban: {}", account.username),
            )
            .await;
        return reject(RC_REJECTED);
    }

    // 6. Password check.
    let password_ok = match req.passwd_enc {
        PasswdEnc::None => {
            String::from_utf8_lossy(&req.password_bytes).as_ref() == account.password
        }
        PasswdEnc::Md5Mode1 | PasswdEnc::Md5Mode2 => {
            if req.password_bytes.len() != 16 {
                false
            } else {
                let candidate = md5_compose(&engine.md5_salt, account.password.as_bytes(), req.passwd_enc);
                let matched = candidate[..] == req.password_bytes[..];
                if !matched {
                    tracing::debug!(
                        "[login] [md5_mismatch] user={} expected={} got={}",
                        account.username,
                        hex::encode(candidate),
                        hex::encode(&req.password_bytes),
                    );
                }
                matched
            }
        }
    };
    if !password_ok {
        engine
            .account_store
            .append_audit(now, &req.peer_ip.to_string(), &account.username, RC_BAD_PASSWORD as i32, "password error")
            .await;
        if cfg.log_login && cfg.dynamic_pass_failure_ban {
            let ip_str = req.peer_ip.to_string();
            let window_secs = cfg.dynamic_pass_failure_ban_interval * 60;
            let count = engine.account_store.count_recent_bad_password(&ip_str, now, window_secs).await;
            if count >= cfg.dynamic_pass_failure_ban_limit {
                engine
                    .ban_store
                    .record_dynamic_ban(
                        req.peer_ip,
                        now,
                        cfg.dynamic_pass_failure_ban_duration * 60,
                        &format!("Password error ban: {}", account.username),
                    )
                    .await;
            }
        }
        return reject(RC_BAD_PASSWORD);
    }

    // 7. Ban-until.
    let mut ban_until = account.ban_until;
    if ban_until != 0 {
        if ban_until > now {
            return reject_banned(ban_until);
        }
        engine.account_store.set_ban_until(account.id, 0).await;
        ban_until = 0;
    }
    let _ = ban_until;

    // 8. Remaining state codes.
    if account.state != 0 {
        if (1..=16).contains(&account.state) || (100..=104).contains(&account.state) {
            return reject((account.state - 1) as u8);
        }
        return reject(RC_ERASED);
    }

    // 9. Connect-until expiry.
    if account.connect_until != 0 && account.connect_until < now {
        return reject(RC_EXPIRED);
    }

    if req.for_char_server {
        if account.sex != 'S' {
            return reject(RC_REJECTED);
        }
        return AuthOutcome::GrantedCharServer { account_id: account.id };
    }

    // 10. Online-check duplicate-login policy.
    if cfg.online_check {
        let already_online = {
            let presence = engine.presence.lock().await;
            matches!(presence.owner_of(account.id), Some(owner) if owner >= 0)
        };
        if already_online {
            let bytes = super::packet::build_kick_ghost_broadcast(account.id);
            {
                let table = engine.charservers.lock().await;
                table.broadcast_except(None, bytes).await;
            }
            let account_id = account.id;
            let presence_arc = engine.presence.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                let mut presence = presence_arc.lock().await;
                presence.mark_offline(account_id);
            });
            return reject(RC_REJECTED);
        }
    }

    // 11. Grant.
    let mut rng = rand::rng();
    let login_id1: u32 = rng.random();
    let login_id2: u32 = rng.random();
    engine.account_store.update_login_stats(account.id, &req.peer_ip.to_string(), now).await;
    engine
        .account_store
        .append_audit(now, &req.peer_ip.to_string(), &account.username, 0, "login ok")
        .await;

    let token = Token {
        account_id: account.id,
        login_id1,
        login_id2,
        sex: sex_to_wire(account.sex),
        client_ip: req.peer_ip,
        consumed: false,
    };
    engine.tokens.lock().await.allocate(token);

    AuthOutcome::GrantedClient {
        account_id: account.id,
        token,
        sex: account.sex,
        last_login: account.last_login,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::login::LoginEngine;

    async fn request(username: &str, password: &str, ip: &str) -> AuthRequest {
        AuthRequest {
            username: username.to_string(),
            password_bytes: password.as_bytes().to_vec(),
            client_version: 20,
            passwd_enc: PasswdEnc::None,
            peer_ip: ip.parse().unwrap(),
            for_char_server: false,
        }
    }

    #[tokio::test]
    async fn happy_path_login_grants_token() {
        let engine = LoginEngine::test_only();
        engine.account_store.create("alice", "alicepw", 'F').await.unwrap();

        let outcome = authenticate(&engine, request("alice", "alicepw", "10.0.0.5").await).await;
        match outcome {
            AuthOutcome::GrantedClient { sex, token, .. } => {
                assert_eq!(sex, 'F');
                // Wire convention is F=0, M=1, S=2 — not sex == 'M' ? 0 : 1.
                assert_eq!(token.sex, 0);
            }
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[test]
    fn sex_to_wire_matches_f0_m1_s2_convention() {
        assert_eq!(sex_to_wire('F'), 0);
        assert_eq!(sex_to_wire('M'), 1);
        assert_eq!(sex_to_wire('S'), 2);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_with_audit_row() {
        let engine = LoginEngine::test_only();
        engine.account_store.create("alice", "alicepw", 'F').await.unwrap();

        let outcome = authenticate(&engine, request("alice", "WRONG", "10.0.0.5").await).await;
        assert_eq!(outcome, AuthOutcome::Rejected { rcode: RC_BAD_PASSWORD, ban_until: None });
        let count = engine.account_store.count_recent_bad_password("10.0.0.5", now_unix(), 600).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn sixth_failure_triggers_dynamic_ban() {
        let engine = LoginEngine::test_only();
        engine.account_store.create("alice", "alicepw", 'F').await.unwrap();

        for _ in 0..5 {
            authenticate(&engine, request("alice", "WRONG", "10.0.0.9").await).await;
        }
        let outcome = authenticate(&engine, request("alice", "WRONG", "10.0.0.9").await).await;
        assert_eq!(outcome, AuthOutcome::Rejected { rcode: RC_BAD_PASSWORD, ban_until: None });
        assert!(engine.ban_store.is_banned("10.0.0.9".parse().unwrap(), now_unix()).await);
    }

    #[tokio::test]
    async fn already_online_rejects_with_code_3() {
        let engine = LoginEngine::test_only();
        let id = engine.account_store.create("alice", "alicepw", 'F').await.unwrap();
        engine.presence.lock().await.mark_online(id, 0);

        let outcome = authenticate(&engine, request("alice", "alicepw", "10.0.0.5").await).await;
        assert_eq!(outcome, AuthOutcome::Rejected { rcode: RC_REJECTED, ban_until: None });
    }

    #[tokio::test]
    async fn char_server_handshake_requires_sex_s() {
        let engine = LoginEngine::test_only();
        engine.account_store.create("s1", "s1pw", 'S').await.unwrap();

        let mut req = request("s1", "s1pw", "127.0.0.1").await;
        req.for_char_server = true;
        let outcome = authenticate(&engine, req).await;
        assert!(matches!(outcome, AuthOutcome::GrantedCharServer { .. }));
    }

    #[tokio::test]
    async fn banned_account_rejects_with_ban_until() {
        let engine = LoginEngine::test_only();
        let id = engine.account_store.create("alice", "alicepw", 'F').await.unwrap();
        engine.account_store.set_ban_until(id, now_unix() + 3600).await;

        let outcome = authenticate(&engine, request("alice", "alicepw", "10.0.0.5").await).await;
        match outcome {
            AuthOutcome::Rejected { rcode, ban_until: Some(_) } => assert_eq!(rcode, RC_BANNED),
            other => panic!("expected ban rejection, got {:?}", other),
        }
    }
}

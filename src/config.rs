//! Server configuration module
//!
//! The login authority reads a plain-text `key: value` grammar (with
//! `import: path` for includes) rather than a standard serialization
//! format — this mirrors the ad-hoc `key: value` grammar login config
//! files have always shipped with, hand-rolled here because no format
//! crate fits it. `LoginConfig` still derives `serde::{Serialize,
//! Deserialize}` so it stays diffable/round-trippable in tests, but the
//! primary read path is the custom parser below, not serde.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// One `subnet: mask:char_ip:map_ip` row from the LAN configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanSubnet {
    pub mask: Ipv4Addr,
    pub char_ip: Ipv4Addr,
    pub map_ip: Ipv4Addr,
}

/// Main login-server configuration, assembled from `key: value` lines.
///
/// Defaults follow the historical `login_set_defaults` values, not
/// Rust's usual `Default::default()` zeroes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    // ── Listener ──────────────────────────────────────────────────────
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_login_port")]
    pub login_port: u16,

    // ── IP-ban gate ───────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub ipban: bool,
    #[serde(default = "default_true")]
    pub dynamic_pass_failure_ban: bool,
    #[serde(default = "default_ban_interval")]
    pub dynamic_pass_failure_ban_interval: i64,
    #[serde(default = "default_ban_limit")]
    pub dynamic_pass_failure_ban_limit: i64,
    #[serde(default = "default_ban_duration")]
    pub dynamic_pass_failure_ban_duration: i64,
    #[serde(default)]
    pub use_dnsbl: bool,
    #[serde(default)]
    pub dnsbl_servers: Vec<String>,

    // ── Auth engine ───────────────────────────────────────────────────
    #[serde(default)]
    pub new_account: bool,
    #[serde(default)]
    pub check_client_version: bool,
    #[serde(default = "default_client_version")]
    pub client_version_to_connect: u32,
    #[serde(default)]
    pub use_md5_passwords: bool,
    #[serde(default)]
    pub min_level_to_connect: i32,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default = "default_allowed_regs")]
    pub allowed_regs: u32,
    #[serde(default = "default_time_allowed")]
    pub time_allowed: u64,
    #[serde(default = "default_account_id_floor")]
    pub new_account_id_floor: u32,

    // ── Presence registry ─────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub online_check: bool,

    // ── Audit log ─────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub log_login: bool,

    // ── Scheduler ─────────────────────────────────────────────────────
    #[serde(default)]
    pub ip_sync_interval: u32,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: i64,

    // ── GM list ───────────────────────────────────────────────────────
    #[serde(default = "default_gm_read_method")]
    pub gm_read_method: String,

    // ── DB connection ─────────────────────────────────────────────────
    pub login_server_ip: String,
    #[serde(default = "default_sql_port")]
    pub login_server_port: u16,
    pub login_server_id: String,
    pub login_server_pw: String,
    pub login_server_db: String,

    // ── Table name overrides ──────────────────────────────────────────
    #[serde(default = "default_login_db")]
    pub login_db: String,
    #[serde(default = "default_loginlog_db")]
    pub loginlog_db: String,
    #[serde(default = "default_ipban_db")]
    pub ipban_db: String,
    #[serde(default = "default_reg_db")]
    pub reg_db: String,
    #[serde(default = "default_sstatus_db")]
    pub sstatus_db: String,

    /// Parsed `subnet:` rows from the LAN support file, if any was loaded.
    #[serde(default)]
    pub lan_subnets: Vec<LanSubnet>,
}

fn default_bind_ip() -> String { "0.0.0.0".to_string() }
fn default_login_port() -> u16 { 6900 }
fn default_true() -> bool { true }
fn default_ban_interval() -> i64 { 5 }
fn default_ban_limit() -> i64 { 7 }
fn default_ban_duration() -> i64 { 5 }
fn default_client_version() -> u32 { 20 }
fn default_date_format() -> String { "%Y-%m-%d %H:%M:%S".to_string() }
fn default_allowed_regs() -> u32 { 1 }
fn default_time_allowed() -> u64 { 10 }
fn default_account_id_floor() -> u32 { 2_000_000 }
fn default_wait_timeout() -> i64 { 28800 }
fn default_gm_read_method() -> String { "sql".to_string() }
fn default_sql_port() -> u16 { 3306 }
fn default_login_db() -> String { "login".to_string() }
fn default_loginlog_db() -> String { "loginlog".to_string() }
fn default_ipban_db() -> String { "ipbanlist".to_string() }
fn default_reg_db() -> String { "global_reg_value".to_string() }
fn default_sstatus_db() -> String { "sstatus".to_string() }

impl LoginConfig {
    /// Parses a `key: value` config file, following `import:` directives.
    /// Later keys (including those pulled in by a later `import:`)
    /// override earlier ones.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut raw = HashMap::new();
        read_into(path.as_ref(), &mut raw)?;
        Self::from_raw(raw)
    }

    /// Parses config text already in memory (used by tests), with no
    /// `import:` support since there is no base path to resolve against.
    pub fn from_str(content: &str) -> Result<Self> {
        let mut raw = HashMap::new();
        apply_lines(content, &mut raw, None)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| raw.get(k).cloned();
        let get_switch = |k: &str, default: bool| {
            raw.get(k).map(|v| config_switch(v)).unwrap_or(default)
        };
        let get_int = |k: &str, default: i64| {
            raw.get(k).and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(default)
        };

        let login_server_ip = get("login_server_ip")
            .context("missing required config key: login_server_ip")?;
        let login_server_id = get("login_server_id")
            .context("missing required config key: login_server_id")?;
        let login_server_pw = get("login_server_pw")
            .context("missing required config key: login_server_pw")?;
        let login_server_db = get("login_server_db")
            .context("missing required config key: login_server_db")?;

        Ok(LoginConfig {
            bind_ip: get("bind_ip").unwrap_or_else(default_bind_ip),
            login_port: get_int("login_port", default_login_port() as i64) as u16,
            ipban: get_switch("ipban", true),
            dynamic_pass_failure_ban: get_switch("dynamic_pass_failure_ban", true),
            dynamic_pass_failure_ban_interval: get_int("dynamic_pass_failure_ban_interval", default_ban_interval()),
            dynamic_pass_failure_ban_limit: get_int("dynamic_pass_failure_ban_limit", default_ban_limit()),
            dynamic_pass_failure_ban_duration: get_int("dynamic_pass_failure_ban_duration", default_ban_duration()),
            use_dnsbl: get_switch("use_dnsbl", false),
            dnsbl_servers: get("dnsbl_servers")
                .map(|s| s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect())
                .unwrap_or_default(),
            new_account: get_switch("new_account", false),
            check_client_version: get_switch("check_client_version", false),
            client_version_to_connect: get_int("client_version_to_connect", default_client_version() as i64) as u32,
            use_md5_passwords: get_switch("use_MD5_passwords", false),
            min_level_to_connect: get_int("min_level_to_connect", 0) as i32,
            date_format: get("date_format").unwrap_or_else(default_date_format),
            case_sensitive: get_switch("case_sensitive", true),
            allowed_regs: get_int("allowed_regs", default_allowed_regs() as i64) as u32,
            time_allowed: get_int("time_allowed", default_time_allowed() as i64) as u64,
            new_account_id_floor: get_int("new_account_id_floor", default_account_id_floor() as i64) as u32,
            online_check: get_switch("online_check", true),
            log_login: get_switch("log_login", true),
            ip_sync_interval: get_int("ip_sync_interval", 0) as u32,
            wait_timeout: get_int("wait_timeout", default_wait_timeout()),
            gm_read_method: get("gm_read_method").unwrap_or_else(default_gm_read_method),
            login_server_ip,
            login_server_port: get_int("login_server_port", default_sql_port() as i64) as u16,
            login_server_id,
            login_server_pw,
            login_server_db,
            login_db: get("login_db").unwrap_or_else(default_login_db),
            loginlog_db: get("loginlog_db").unwrap_or_else(default_loginlog_db),
            ipban_db: get("ipban_db").unwrap_or_else(default_ipban_db),
            reg_db: get("reg_db").unwrap_or_else(default_reg_db),
            sstatus_db: get("sstatus_db").unwrap_or_else(default_sstatus_db),
            lan_subnets: Vec::new(),
        })
    }

    /// Parses a LAN support file (`subnet: mask:char_ip:map_ip` lines)
    /// and validates that `char_ip & mask == map_ip & mask` on every row,
    /// dropping and warning on any row that fails it.
    pub fn load_lan_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read LAN config: {}", path.as_ref().display()))?;
        self.lan_subnets = parse_lan_subnets(&content);
        Ok(())
    }
}

fn parse_lan_subnets(content: &str) -> Vec<LanSubnet> {
    let mut subnets = Vec::new();
    for line in content.lines() {
        let line = strip_control_chars(line.trim());
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((key, rest)) = line.split_once(':') else { continue };
        if key.trim().to_ascii_lowercase() != "subnet" {
            continue;
        }
        let fields: Vec<&str> = rest.trim().splitn(3, ':').collect();
        if fields.len() != 3 {
            tracing::warn!("[config] [lan_subnet_malformed] line={:?}", line);
            continue;
        }
        let parsed = (
            fields[0].trim().parse::<Ipv4Addr>(),
            fields[1].trim().parse::<Ipv4Addr>(),
            fields[2].trim().parse::<Ipv4Addr>(),
        );
        let (mask, char_ip, map_ip) = match parsed {
            (Ok(m), Ok(c), Ok(p)) => (m, c, p),
            _ => {
                tracing::warn!("[config] [lan_subnet_unparseable] line={:?}", line);
                continue;
            }
        };
        let m = u32::from(mask);
        if u32::from(char_ip) & m != u32::from(map_ip) & m {
            tracing::warn!(
                "[config] [lan_subnet_invariant_violated] mask={} char_ip={} map_ip={}",
                mask, char_ip, map_ip
            );
            continue;
        }
        subnets.push(LanSubnet { mask, char_ip, map_ip });
    }
    subnets
}

/// Recursively reads `path`'s `key: value` lines into `out`, following
/// `import:` directives depth-first as they are encountered (later wins).
fn read_into(path: &Path, out: &mut HashMap<String, String>) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config: {}", path.display()))?;
    let base_dir = path.parent().map(Path::to_path_buf);
    apply_lines(&content, out, base_dir.as_deref())
}

fn apply_lines(content: &str, out: &mut HashMap<String, String>, base_dir: Option<&Path>) -> Result<()> {
    for line in content.lines() {
        let line = strip_control_chars(line.trim());
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((key, value)) = split_key_value(&line) else { continue };
        let key_lc = key.trim().to_ascii_lowercase();
        if key_lc == "import" {
            let rel = value.trim();
            let import_path: PathBuf = match base_dir {
                Some(dir) => dir.join(rel),
                None => PathBuf::from(rel),
            };
            read_into(&import_path, out)?;
            continue;
        }
        out.insert(key_lc, value.trim().to_string());
    }
    Ok(())
}

/// Mirrors `sscanf("%[^:]: %[^\r\n]", w1, w2)`: key is everything up to
/// the first `:`, value is everything after the following `: `.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, rest) = line.split_once(':')?;
    Some((key, rest.strip_prefix(' ').unwrap_or(rest)))
}

fn strip_control_chars(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

/// `config_switch`: `"1"/"on"/"yes"` (case-insensitive) → true,
/// `"0"/"off"/"no"` → false, otherwise parsed as an integer and
/// non-zero is true.
pub fn config_switch(value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" => true,
        "0" | "off" | "no" | "false" => false,
        other => other.parse::<i64>().map(|n| n != 0).unwrap_or(false),
    }
}

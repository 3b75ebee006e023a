use anyhow::{Context, Result};
use ragnalogin::config::LoginConfig;
use ragnalogin::core::{create_server_state, spawn_signal_listener};
use ragnalogin::servers::login::LoginEngine;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/login_athena.conf".to_string();
    let mut lan_file: Option<String> = Some("conf/subnet_athena.conf".to_string());

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" | "-?" => {
                println!("Usage: login_server [--conf FILE] [--lan FILE | --no-lan]");
                return Ok(());
            }
            "--conf" => {
                i += 1;
                conf_file = args
                    .get(i)
                    .cloned()
                    .context("--conf requires a FILE argument")?;
            }
            "--lan" => {
                i += 1;
                lan_file = Some(args.get(i).cloned().context("--lan requires a FILE argument")?);
            }
            "--no-lan" => lan_file = None,
            _ => {}
        }
        i += 1;
    }

    let mut config = LoginConfig::from_file(&conf_file)
        .with_context(|| format!("cannot read config: {conf_file}"))?;
    if let Some(lan_file) = &lan_file {
        if std::path::Path::new(lan_file).exists() {
            config.load_lan_file(lan_file)?;
        }
    }

    let db_url = format!(
        "mysql://{}:{}@{}:{}/{}",
        config.login_server_id,
        config.login_server_pw,
        config.login_server_ip,
        config.login_server_port,
        config.login_server_db,
    );
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .with_context(|| format!("cannot connect to DB at {}", config.login_server_ip))?;

    tracing::info!("[login] [started] login authority starting");

    let bind = format!("{}:{}", config.bind_ip, config.login_port);
    let engine = Arc::new(LoginEngine::new(config, Some(pool)));
    engine.refresh_gm_list().await;
    engine.start_scheduler().await;

    let server_state = create_server_state();
    server_state.lock().unwrap().set_term_func(|| {
        tracing::info!("[login] [shutdown] signal received, exiting");
        std::process::exit(0);
    });
    spawn_signal_listener(server_state);

    let exit = engine.run(&bind).await;
    if let Err(e) = exit {
        tracing::error!("[login] [fatal] {}", e);
        std::process::exit(1);
    }
    Ok(())
}

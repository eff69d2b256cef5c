use std::sync::Arc;
use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use tracing_subscriber::EnvFilter;
use hubd::config::ServerConfig;
use hubd::servers::hub::db::MySqlStore;
use hubd::servers::hub::HubState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/hub.yaml".to_string();
    let mut migrate = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: hub_server [--conf FILE] [--migrate]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    return Err(anyhow::anyhow!("--conf requires a FILE argument"));
                }
            }
            "--migrate" => migrate = true,
            other => tracing::warn!("[hub] ignoring unknown argument {}", other),
        }
        i += 1;
    }

    let config: ServerConfig = {
        let content = std::fs::read_to_string(&conf_file)
            .with_context(|| format!("Cannot read config: {}", conf_file))?;
        ServerConfig::from_str(&content)
            .with_context(|| format!("Cannot parse config: {}", conf_file))?
    };

    let pool = {
        let db_url = format!(
            "mysql://{}:{}@{}:{}/{}",
            config.sql_id, config.sql_pw, config.sql_ip, config.sql_port, config.sql_db
        );
        MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .with_context(|| format!(
                "Cannot connect to MySQL (host={}:{} db={} user={})",
                config.sql_ip, config.sql_port, config.sql_db, config.sql_id
            ))?
    };

    let store = MySqlStore::new(pool);
    if migrate {
        store.migrate().await.context("Cannot apply migrations")?;
        tracing::info!("[hub] [migrate] schema up to date");
    }

    tracing::info!("[hub] [started] Hub Server Started.");

    let bind_addr = format!("{}:{}", config.hub_ip, config.hub_port);
    let (state, events) = HubState::new(Arc::new(store), config);
    let state = Arc::new(state);

    // Spawn login server reconnect loop
    {
        let s = Arc::clone(&state);
        tokio::spawn(async move {
            hubd::servers::hub::login::connect_to_login(s).await;
        });
    }

    tokio::select! {
        res = HubState::run(Arc::clone(&state), events, &bind_addr) => res,
        _ = tokio::signal::ctrl_c() => {
            state.shutdown().await;
            Ok(())
        }
    }
}

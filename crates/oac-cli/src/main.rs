use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use oac_flightvars::{
    doctor, load_config, ClientConfig, FlightVarsClient, FlightVarsConfig, FlightVarsServer, MemoryBackend,
};
use oac_proto::{VariableId, VariableValue};

#[derive(Debug, Parser)]
#[command(name = "flightvars", version, about = "FlightVars - simulator variable pub/sub over TCP")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Serve the variables listed under [server.vars].
    Serve,
    /// Print every update of the given variables until the session ends.
    Watch {
        /// Variables as `<group>-><name>`.
        #[arg(required = true)]
        vars: Vec<String>,
    },
    /// Write one value to a variable.
    Set {
        var: String,
        /// boolean, byte, word, dword or float
        #[arg(value_name = "TYPE")]
        kind: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor_cmd(&cfg)?,
        Command::Serve => serve(&cfg).await?,
        Command::Watch { vars } => watch(&cfg, &vars).await?,
        Command::Set { var, kind, value } => set(&cfg, &var, &kind, &value).await?,
    }
    Ok(())
}

fn doctor_cmd(cfg: &FlightVarsConfig) -> Result<()> {
    info!("doctor: starting");
    anyhow::ensure!(
        cfg.client.is_some() || cfg.server.is_some(),
        "config needs a [client] or [server] section"
    );
    if let Some(client) = &cfg.client {
        doctor::check_client(client).context("client")?;
    }
    if let Some(server) = &cfg.server {
        doctor::check_server(server).context("server")?;
        info!("doctor: server table holds {} variables", server.vars.len());
    }
    info!("doctor: OK");
    Ok(())
}

async fn serve(cfg: &FlightVarsConfig) -> Result<()> {
    let server_cfg = cfg.server.clone().context("config has no [server] section")?;
    doctor::check_server(&server_cfg)?;

    let backend = MemoryBackend::with_vars(server_cfg.vars.iter().map(|e| (e.id.clone(), e.value)));
    let server = FlightVarsServer::bind(server_cfg, Arc::new(backend)).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("serve: cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

fn client_config(cfg: &FlightVarsConfig) -> Result<ClientConfig> {
    let client_cfg = cfg.client.clone().context("config has no [client] section")?;
    doctor::check_client(&client_cfg)?;
    Ok(client_cfg)
}

fn parse_vars(vars: &[String]) -> Result<Vec<VariableId>> {
    vars.iter().map(|v| v.parse().context("variable id")).collect()
}

async fn watch(cfg: &FlightVarsConfig, vars: &[String]) -> Result<()> {
    let vars = parse_vars(vars)?;
    let client = FlightVarsClient::new(client_config(cfg)?);
    client.connect().await.with_context(|| format!("connect {}", client.config().endpoint()))?;

    for var in &vars {
        let id = client
            .subscribe(var, |var, value| {
                let ts_unix_ms = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
                println!("{} {} = {} ({})", ts_unix_ms, var, value, value.type_name());
            })
            .await
            .with_context(|| format!("subscribe {}", var))?;
        info!("watch: {} is subscription {}", var, id);
    }

    let ended = client.disconnection();
    tokio::select! {
        outcome = ended => outcome.context("session ended")?,
        _ = tokio::signal::ctrl_c() => {
            info!("watch: interrupted");
            client.disconnect("interrupted").await.context("disconnect")?;
        }
    }
    Ok(())
}

async fn set(cfg: &FlightVarsConfig, var: &str, kind: &str, value: &str) -> Result<()> {
    let var: VariableId = var.parse().context("variable id")?;
    let value = VariableValue::parse_typed(kind, value)
        .with_context(|| format!("{:?} is not a valid {} value", value, kind))?;

    let client = FlightVarsClient::new(client_config(cfg)?);
    let id = client
        .subscribe(&var, |_, _| {})
        .await
        .with_context(|| format!("subscribe {}", var))?;
    client.update(id, value).await.with_context(|| format!("update {}", var))?;
    info!("set: {} = {}", var, value);
    client.disconnect("done").await.context("disconnect")?;
    Ok(())
}

use std::sync::Arc;

use clap::{Parser, Subcommand};
use fses::models::Record;
use fses::{ApiContext, ApiError, ClientConfig, ConfigError, Credentials, EndpointStyle, Resource, ResourceKind, SessionManager};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("client setup failed: {0}")]
    Api(#[from] ApiError),
    #[error("missing credentials; pass --username/--password or set FSES_USERNAME/FSES_PASSWORD")]
    MissingCredentials,
    #[error("unknown resource `{0}`; expected students, lecturers, departments, nominations or postponements")]
    UnknownResource(String),
    #[error("{0}")]
    Rejected(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "fses-cli", about = "FSES session and resource CLI")]
struct Cli {
    /// Overrides `FSES_BASE_URL`.
    #[arg(long)]
    base_url: Option<String>,

    /// Overrides `FSES_API_PREFIX`.
    #[arg(long)]
    api_prefix: Option<String>,

    /// `action` or `rest`; overrides `FSES_ENDPOINT_STYLE`.
    #[arg(long)]
    endpoint_style: Option<String>,

    #[arg(long, env = "FSES_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "FSES_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether the server sees an authenticated session.
    Status,
    /// Log in and print the user and landing page.
    Whoami,
    /// Log in and complete the first-time password change.
    ChangePassword {
        #[arg(long, env = "FSES_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    List {
        resource: String,
    },
    Create {
        resource: String,
        #[arg(long)]
        data: String,
    },
    Update {
        resource: String,
        id: i64,
        #[arg(long)]
        data: String,
    },
    Delete {
        resource: String,
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let ctx = Arc::new(ApiContext::new(config)?);
    let session = SessionManager::new(ctx.clone());

    match cli.command {
        Command::Status => {
            let state = session.check_status().await;
            print_json(&json!({ "authenticated": state.is_authenticated(), "user": state.user }))
        }
        Command::Whoami => {
            let user = login(&session, cli.username, cli.password).await?;
            let result = print_json(&json!({ "user": user, "landing": fses::landing_path(&user) }));
            logout(&session).await;
            result
        }
        Command::ChangePassword { new_password } => {
            login(&session, cli.username, cli.password).await?;
            let result = session.change_password(&new_password, &new_password).await;
            logout(&session).await;
            let user = result.map_err(CliError::Rejected)?;
            print_json(&json!({ "user": user, "landing": fses::landing_path(&user) }))
        }
        Command::List { resource } => {
            let records = records(&ctx, &resource)?;
            with_login(&session, cli.username, cli.password, async {
                records.fetch_all().await.map_err(CliError::Rejected)?;
                print_json(&serde_json::to_value(records.items())?)
            })
            .await
        }
        Command::Create { resource, data } => {
            let records = records(&ctx, &resource)?;
            let payload = parse_data(&data)?;
            with_login(&session, cli.username, cli.password, async {
                let created = records.create(&payload).await.map_err(CliError::Rejected)?;
                print_json(&serde_json::to_value(created)?)
            })
            .await
        }
        Command::Update { resource, id, data } => {
            let records = records(&ctx, &resource)?;
            let payload = parse_data(&data)?;
            with_login(&session, cli.username, cli.password, async {
                let updated = records.update(&id, &payload).await.map_err(CliError::Rejected)?;
                print_json(&serde_json::to_value(updated)?)
            })
            .await
        }
        Command::Delete { resource, id } => {
            let records = records(&ctx, &resource)?;
            with_login(&session, cli.username, cli.password, async {
                records.delete(&id).await.map_err(CliError::Rejected)?;
                print_json(&json!({ "deleted": id }))
            })
            .await
        }
    }
}

fn build_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let env = ClientConfig::from_env()?;
    let style = match cli.endpoint_style.as_deref() {
        Some(raw) => EndpointStyle::parse(raw)?,
        None => env.endpoint_style,
    };
    Ok(ClientConfig::new(
        cli.base_url.as_deref().unwrap_or(&env.base_url),
        cli.api_prefix.as_deref().unwrap_or(&env.api_prefix),
        style,
        env.timeouts,
    )?)
}

fn records(ctx: &Arc<ApiContext>, resource: &str) -> Result<Resource<Record>, CliError> {
    let kind = ResourceKind::parse(resource).ok_or_else(|| CliError::UnknownResource(resource.to_owned()))?;
    Ok(Resource::new(ctx.clone(), kind))
}

fn parse_data(data: &str) -> Result<Value, CliError> {
    Ok(serde_json::from_str::<Value>(data)?)
}

async fn login(
    session: &SessionManager,
    username: Option<String>,
    password: Option<String>,
) -> Result<fses::UserRecord, CliError> {
    let (Some(username), Some(password)) = (username, password) else {
        return Err(CliError::MissingCredentials);
    };
    session.login(&Credentials::new(username, password)).await.map_err(CliError::Rejected)
}

async fn logout(session: &SessionManager) {
    if let Err(message) = session.logout().await {
        tracing::warn!(%message, "logout failed");
    }
}

/// Run `op` inside a login/logout pair. Logout runs even when `op` fails.
async fn with_login(
    session: &SessionManager,
    username: Option<String>,
    password: Option<String>,
    op: impl Future<Output = Result<(), CliError>>,
) -> Result<(), CliError> {
    login(session, username, password).await?;
    let result = op.await;
    logout(session).await;
    result
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_with_payload() {
        let cli = Cli::try_parse_from(["fses-cli", "update", "students", "4", "--data", r#"{"name":"A"}"#]).unwrap();
        match cli.command {
            Command::Update { resource, id, data } => {
                assert_eq!(resource, "students");
                assert_eq!(id, 4);
                assert_eq!(parse_data(&data).unwrap(), json!({ "name": "A" }));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let ctx = Arc::new(ApiContext::new(ClientConfig::default()).unwrap());
        assert!(matches!(records(&ctx, "rooms"), Err(CliError::UnknownResource(_))));
        assert_eq!(records(&ctx, "Lecturer").unwrap().kind(), ResourceKind::LECTURERS);
    }

    #[test]
    fn create_requires_data_flag() {
        assert!(Cli::try_parse_from(["fses-cli", "create", "departments"]).is_err());
    }
}

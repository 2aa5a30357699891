use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;
use udf_auth::CredentialStore;
use udf_core::{Engine, Mode, RemotePayload, Shape, UdfData};
use udf_dispatch::{DispatchRouter, RunOutcome, RunRequest};

mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "udf")]
#[command(about = "Log in to the UDF service and run UDFs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in through the browser and persist the credential.
    Login {
        /// Print the login URL and read the resulting code from stdin instead of listening on
        /// a loopback port.
        #[arg(long)]
        two_step: bool,
    },

    /// Forget the stored credential.
    Logout,

    /// Show the signed-in user.
    Whoami,

    /// Run a saved UDF (`owner/name` or `name`) or a shared token.
    Run {
        reference: String,

        /// UDF name, when `reference` is the owner's email.
        name: Option<String>,

        #[arg(long)]
        x: Option<u32>,
        #[arg(long)]
        y: Option<u32>,
        #[arg(long)]
        z: Option<u32>,

        #[arg(long)]
        shape: Option<Shape>,

        #[arg(long)]
        engine: Option<Engine>,

        /// `key=value`; values that parse as JSON are sent as JSON.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Run on a background task and wait for it.
        #[arg(long = "async")]
        run_async: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = CliConfig::from_env().context("load cli config")?;
    tracing::debug!(config = ?cfg, "loaded config");

    let store = Arc::new(CredentialStore::new(cfg.auth()));

    match cli.command {
        Command::Login { two_step } => login(&store, two_step).await,
        Command::Logout => {
            let logout_url = store.logout().await?;
            println!("Logged out. To end the browser session too, visit {logout_url}");
            Ok(())
        }
        Command::Whoami => {
            let router = DispatchRouter::new(cfg.router(), store)?;
            let user = router.client().whoami().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Command::Run {
            reference,
            name,
            x,
            y,
            z,
            shape,
            engine,
            params,
            run_async,
        } => {
            let mut req = RunRequest::new(reference).coordinates(x, y, z);
            if let Some(name) = name {
                req = req.arg(name);
            }
            if let Some(shape) = shape {
                req = req.shape(shape);
            }
            if let Some(engine) = engine {
                req = req.engine(engine);
            }
            if run_async {
                req = req.mode(Mode::Async);
            }
            for (key, value) in params {
                req = req.param(key, value);
            }

            let router = DispatchRouter::new(cfg.router(), store)?;
            let run = router.run(req).await?;
            for warning in &run.warnings {
                eprintln!("warning: {warning}");
            }
            let outcome = match run.outcome {
                RunOutcome::Pending(pending) => pending.wait().await?,
                outcome => outcome,
            };
            print_outcome(&outcome)
        }
    }
}

async fn login(store: &CredentialStore, two_step: bool) -> anyhow::Result<()> {
    let creds = if two_step {
        let pending = store.begin_login()?;
        println!("Open this URL to log in, then paste the code shown:\n{}", pending.url);
        let mut line = String::new();
        tokio::io::BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("read login code from stdin")?;
        store.finalize_login(&pending, &line).await?
    } else {
        store.authenticate().await?
    };

    let email = creds.id_claims().ok().and_then(|claims| claims.email);
    match email {
        Some(email) => println!("Logged in as {email}"),
        None => println!("Logged in"),
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Job(job) => println!("{}", serde_json::to_string_pretty(job)?),
        RunOutcome::Pending(_) => println!("still running"),
        RunOutcome::Data(_) | RunOutcome::Rich(_) => match outcome.data() {
            None => println!("(no data)"),
            Some(UdfData::Json(value)) => println!("{}", serde_json::to_string_pretty(value)?),
            Some(UdfData::Table(table)) => {
                for record in table.to_records() {
                    println!("{record}");
                }
            }
            Some(UdfData::Payload(payload)) => println!("{}", describe_payload(payload)),
        },
    }
    Ok(())
}

fn describe_payload(payload: &RemotePayload) -> String {
    match payload {
        RemotePayload::Columnar(bytes) => format!("columnar payload, {} bytes", bytes.len()),
        RemotePayload::Image { dims, shape, bytes } => {
            format!("image {dims:?} {shape:?}, {} bytes", bytes.len())
        }
        RemotePayload::GeoRaster { bytes, layout, .. } => {
            format!("raster payload as {layout:?}, {} bytes", bytes.len())
        }
        RemotePayload::Raw {
            content_type,
            bytes,
        } => format!(
            "{} payload, {} bytes",
            content_type.as_deref().unwrap_or("untyped"),
            bytes.len()
        ),
    }
}

fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in {s:?}"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_prefer_json() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_param("bbox=[1,2,3,4]").unwrap(),
            ("bbox".to_string(), json!([1, 2, 3, 4]))
        );
        assert_eq!(
            parse_param("label=hello world").unwrap(),
            ("label".to_string(), json!("hello world"))
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn run_accepts_owner_and_name_positionals() {
        let cli = Cli::parse_from([
            "udf", "run", "me@example.com", "my_udf", "--x", "1", "--y", "2", "--z", "3", "--param",
            "n=5",
        ]);
        let Command::Run {
            reference,
            name,
            z,
            params,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(reference, "me@example.com");
        assert_eq!(name.as_deref(), Some("my_udf"));
        assert_eq!(z, Some(3));
        assert_eq!(params, vec![("n".to_string(), json!(5))]);
    }
}

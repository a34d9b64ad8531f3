//!
//! tka CLI binary
//! --------------
//! Signs the caller in through the tailnet-served API, waits for the cluster
//! identity to be provisioned and writes a kubeconfig for kubectl.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use tka::api::LogoutState;
use tka::cli::{self, output, ApiClient, PollOptions, DEFAULT_SERVER};
use tka::config::{arg_value, has_flag};
use tka::signin::parse_period;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} signin [--role <role>] [--timeout <dur>] [--interval <dur>] [--no-wait] [--dir <path>]\n  {program} status\n  {program} kubeconfig [--timeout <dur>] [--dir <path>]   (also: get kubeconfig)\n  {program} signout                                       (also: logout)\n\nGlobal flags:\n  --server <url>     API endpoint (env: TKA_SERVER, default {DEFAULT_SERVER})\n  -h, --help         Show this help\n\nOn success signin and kubeconfig print a line for the shell:\n  eval \"$({program} signin)\"\n"
    );
}

fn duration_flag(args: &[String], name: &str, default: Duration) -> Result<Duration> {
    match arg_value(args, name) {
        Some(v) => parse_period(&v).ok_or_else(|| anyhow!("{} expects a duration like 30s or 2m, got {:?}", name, v)),
        None => Ok(default),
    }
}

fn poll_options(args: &[String]) -> Result<PollOptions> {
    let defaults = PollOptions::default();
    Ok(PollOptions {
        interval: duration_flag(args, "--interval", defaults.interval)?,
        deadline: duration_flag(args, "--timeout", defaults.deadline)?,
    })
}

/// Arguments that are neither flags nor flag values.
fn positionals(args: &[String]) -> Vec<&str> {
    const VALUED: [&str; 6] = ["--server", "--role", "--timeout", "--interval", "--dir", "--request-timeout"];
    let mut out = Vec::new();
    let mut i = 1;
    while i < args.len() {
        let a = args[i].as_str();
        if VALUED.contains(&a) {
            i += 2;
            continue;
        }
        if !a.starts_with('-') {
            out.push(a);
        }
        i += 1;
    }
    out
}

async fn run(args: &[String]) -> Result<()> {
    let program = args.first().map(String::as_str).unwrap_or("tka");
    let words = positionals(args);
    if has_flag(args, "--help") || has_flag(args, "-h") || words.is_empty() {
        print_usage(program);
        return Ok(());
    }

    let server = arg_value(args, "--server")
        .or_else(|| env::var("TKA_SERVER").ok())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let request_timeout = duration_flag(args, "--request-timeout", Duration::from_secs(10))?;
    let client = ApiClient::new(&server, request_timeout)?;
    let dir = arg_value(args, "--dir").map(PathBuf::from);

    match words.as_slice() {
        ["signin"] | ["login"] => {
            let role = arg_value(args, "--role");
            if has_flag(args, "--no-wait") {
                let (view, created) = client.signin(role.as_deref()).await?;
                eprintln!("{}", if created { "signin submitted" } else { "already signed in" });
                eprintln!("{}", output::render_status(&view, chrono::Utc::now()));
                return Ok(());
            }
            let opts = poll_options(args)?;
            let profile = cli::signin_and_fetch(&client, role.as_deref(), &opts).await?;
            let path = cli::write_kubeconfig(&profile, dir.as_deref())?;
            eprintln!("{}", output::render_profile(&profile));
            println!("{}", output::export_line(&path));
        }
        ["status"] => {
            let view = client.status().await?;
            println!("{}", output::render_status(&view, chrono::Utc::now()));
        }
        ["kubeconfig"] | ["get", "kubeconfig"] => {
            let opts = poll_options(args)?;
            let client = &client;
            let profile = cli::poll_until(&opts, "kubeconfig", move || client.kubeconfig()).await?;
            let path = cli::write_kubeconfig(&profile, dir.as_deref())?;
            eprintln!("{}", output::render_profile(&profile));
            println!("{}", output::export_line(&path));
        }
        ["signout"] | ["logout"] => match client.signout().await? {
            LogoutState::Pending => eprintln!("signed out; cluster access is being removed"),
            LogoutState::Absent => eprintln!("not signed in"),
        },
        other => {
            print_usage(program);
            return Err(anyhow!("unknown command: {}", other.join(" ")));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args: Vec<String> = env::args().collect();
    match run(&args).await.context("tka") {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

//! SafeSignal - Main Entry Point
//!
//! Headless console client: signs in, shares location on demand and shows
//! which trusted contacts are sharing.

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use safesignal::{
    api::{NewContact, RegisterRequest},
    channel::WsConnector,
    commands,
    config::AppConfig,
    fake_call::SpoolAudioSink,
    logging,
    storage::FileCredentialStore,
    telemetry::SimulatedWalk,
    AppState,
};

const HELP: &str = "\
commands:
  login <email> <password>
  register <username> <email> <password> [phone]
  logout
  sos                      start emergency sharing
  stop                     stop sharing
  status
  contacts
  contact add <name> [phone]
  contact rm <id>
  history                  past sharing sessions
  call | answer | hangup   fake incoming call
  quit";

fn print<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to render result: {e}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    logging::init(&config.log_dir())?;
    info!("SafeSignal starting...");

    let state = AppState::new(
        &config,
        Arc::new(WsConnector::default()),
        Arc::new(SimulatedWalk::new(config.sim_start, config.sim_step)),
        Arc::new(FileCredentialStore::new(config.credentials_dir())),
        Arc::new(SpoolAudioSink::new(config.audio_dir())),
    )?;

    match commands::restore_session(&state).await {
        Some(session) => println!("Signed in as {} ({})", session.username, session.user_id),
        None => println!("Not signed in. Type `help` for commands."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [] => continue,
            ["quit" | "exit"] => break,
            ["help"] => println!("{HELP}"),
            ["login", email, password] => print(&commands::login(&state, email, password).await),
            ["register", username, email, password, rest @ ..] => {
                let request = RegisterRequest {
                    username: username.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                    phone: rest.first().map(|p| p.to_string()),
                };
                print(&commands::register(&state, &request).await);
            }
            ["logout"] => match commands::logout(&state).await {
                Ok(()) => println!("Signed out"),
                Err(e) => println!("Logout failed: {e}"),
            },
            ["sos"] => print(&commands::start_sharing(&state).await),
            ["stop"] => print(&commands::stop_sharing(&state)),
            ["status"] => print(&commands::sharing_status(&state)),
            ["contacts"] => print(&commands::list_contacts(&state).await),
            ["contact", "add", name, rest @ ..] => {
                let contact = NewContact {
                    contact_name: name.to_string(),
                    contact_phone: rest.first().map(|p| p.to_string()),
                    contact_email: None,
                };
                print(&commands::add_contact(&state, &contact).await);
            }
            ["contact", "rm", id] => match id.parse::<i64>() {
                Ok(id) => match commands::delete_contact(&state, id).await {
                    Ok(()) => println!("Removed contact {id}"),
                    Err(e) => println!("Failed to remove contact: {e}"),
                },
                Err(_) => println!("Contact id must be a number"),
            },
            ["history"] => match commands::session_history(&state).await {
                Ok(sessions) => print(&sessions),
                Err(e) => println!("Failed to fetch sessions: {e}"),
            },
            ["call"] => print(&commands::start_fake_call(&state)),
            ["answer"] => match commands::answer_fake_call(&state) {
                Ok(status) => print(&status),
                Err(e) => println!("{e}"),
            },
            ["hangup"] => print(&commands::end_fake_call(&state).await),
            _ => println!("Unknown command. Type `help` for commands."),
        }
    }

    info!("SafeSignal shutting down");
    state.sharing.stop_sharing();
    state.fake_call.end_call().await;
    state.channel.teardown();
    Ok(())
}

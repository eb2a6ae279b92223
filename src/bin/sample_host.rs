//! Sample host embedding the server core.
//!
//! Registers, in dispatch order:
//! - `sessions`: attaches a cookie session to every request
//! - `api`: a small in-memory people API plus a visit counter
//! - `chat`: a broadcast chat room on `/chat`
//! - `static`: files below the `--root` directory
//!
//! Ctrl+C (or SIGTERM) stops the server gracefully.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use clap::Parser;
use serde::{Deserialize, Serialize};

use switchyard::config::ServerConfig;
use switchyard::lifecycle::signals::trigger_on_signal;
use switchyard::modules::channel_url;
use switchyard::observability::{logging, metrics};
use switchyard::{
    ChannelEvent, ChatRoom, Context, DuplexModule, Server, SessionModule, Shutdown,
    StaticFilesModule, Verb, WebModule,
};

#[derive(Parser)]
#[command(name = "sample-host")]
#[command(about = "Embeds the switchyard server with sessions, an API, chat and static files", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory served by the static files module
    #[arg(short, long, default_value = "./public")]
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Person {
    id: u32,
    name: String,
    email: String,
}

fn people() -> Arc<Vec<Person>> {
    Arc::new(vec![
        Person {
            id: 1,
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
        },
        Person {
            id: 2,
            name: "Grace Hopper".into(),
            email: "grace@example.com".into(),
        },
        Person {
            id: 3,
            name: "Edsger Dijkstra".into(),
            email: "edsger@example.com".into(),
        },
    ])
}

fn api_module() -> Result<WebModule, switchyard::ServerError> {
    let list = people();
    let by_id = Arc::clone(&list);

    WebModule::new("api")
        .with_handler("/api/people", Verb::Get, move |ctx: Context| {
            let list = Arc::clone(&list);
            async move { Ok(ctx.json(&*list)) }
        })?
        .with_handler("/api/people/{id:[0-9]+}", Verb::Get, move |ctx: Context| {
            let list = Arc::clone(&by_id);
            async move {
                let id = ctx.param("id").and_then(|id| id.parse::<u32>().ok());
                match list.iter().find(|person| Some(person.id) == id) {
                    Some(person) => Ok(ctx.json(person)),
                    None => Ok(ctx.status(StatusCode::NOT_FOUND)),
                }
            }
        })?
        .with_handler("/api/visits", Verb::Get, |ctx: Context| async move {
            let visits = match ctx.session() {
                Some(session) => {
                    let visits = session.get_as::<u64>("visits").unwrap_or(0) + 1;
                    session.set("visits", visits);
                    visits
                }
                None => 0,
            };
            Ok(ctx.json(&serde_json::json!({ "visits": visits })))
        })
}

fn chat_module(room: ChatRoom) -> Result<DuplexModule, switchyard::ServerError> {
    DuplexModule::new("chat").on_channel("/chat", move |mut channel| {
        let room = room.clone();
        async move {
            room.join(&channel);
            let id = channel.id();
            while let Some(event) = channel.recv().await {
                match event {
                    ChannelEvent::Message(text) => {
                        room.broadcast_except(id, &text).await;
                    }
                    ChannelEvent::Closed(reason) => {
                        tracing::debug!(channel_id = %id, reason = ?reason, "Chat member left");
                    }
                }
            }
            room.leave(id);
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => switchyard::config::load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.listener.bind_address = format!("0.0.0.0:{}", port);
    }

    logging::init_logging(&config.observability)?;
    tracing::info!("sample-host v0.1.0 starting");

    if let Some(address) = &config.observability.metrics_address {
        match address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(metrics_address = %address, error = %e, "Failed to parse metrics address"),
        }
    }

    let server = Server::new(config);
    server.register_module(Arc::new(SessionModule::new(&server.config().sessions)))?;
    server.register_module(Arc::new(api_module()?))?;
    server.register_module(Arc::new(chat_module(ChatRoom::new())?))?;
    server.register_module(Arc::new(StaticFilesModule::new(cli.root.clone())))?;

    let shutdown = Shutdown::new();
    trigger_on_signal(shutdown.clone());

    let task = server.start(shutdown.subscribe()).await?;
    let chat = channel_url(task.local_addr(), "/chat", false)?;
    tracing::info!(
        address = %task.local_addr(),
        chat = %chat,
        modules = ?server.modules(),
        "Listening for connections"
    );

    let cancelled = task.await?;
    tracing::info!(
        forced_connections = cancelled.forced_connections,
        "sample-host stopped"
    );
    Ok(())
}

//! Line-oriented relay host.
//!
//! Reads one JSON command per line on stdin, renders session output as plain
//! lines on stdout and reports outbound requests and errors as JSON lines on
//! stderr. Point `KERNEL_RELAY_LOG_FILE` somewhere to keep logs out of stderr.
//!
//! Run with: cargo run -p stdio-relay
//!
//! ```text
//! {"cmd":"start","identity":"1","argv":["--existing","kernel-1.json"]}
//! {"cmd":"execute","identity":"1","code":"1 + 1"}
//! {"cmd":"message","identity":"1","channel":"iopub","msg":{"header":{"msg_type":"status"}}}
//! {"cmd":"stop","identity":"1"}
//! ```

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use futures::StreamExt;
use kernel_relay_core::{
    Channel, RelayConfig, SessionArgs, SessionIdentity, Sink, SinkRole, logging::init_logging,
};
use kernel_relay_session::{ErrorRecord, SessionContainer, sinks::WriterSink};
use kernel_relay_transport::{ChannelConnector, InboundFeed, OutboundRequest};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

/// Command read from stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum HostCommand {
    Start {
        identity: SessionIdentity,
        #[serde(default)]
        argv: Vec<String>,
    },
    Stop {
        identity: SessionIdentity,
    },
    /// Switch the current session, or report it when `identity` is absent.
    Current {
        #[serde(default)]
        identity: Option<SessionIdentity>,
    },
    Execute {
        identity: SessionIdentity,
        code: String,
    },
    /// Raw kernel message received on `channel`.
    Message {
        identity: SessionIdentity,
        channel: String,
        msg: serde_json::Value,
    },
}

/// Event written to stderr.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostEvent {
    Started { identity: SessionIdentity },
    Stopped { identity: SessionIdentity, existed: bool },
    Current { identity: Option<SessionIdentity> },
    Outbound { identity: SessionIdentity, request: OutboundRequest },
    Error { identity: SessionIdentity, record: ErrorRecord },
    Failed { message: String },
}

struct Host {
    container: Arc<SessionContainer<ChannelConnector>>,
    feeds: HashMap<SessionIdentity, InboundFeed>,
    stdout: Arc<dyn Sink>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl Host {
    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    async fn run(&mut self, command: HostCommand) -> anyhow::Result<()> {
        match command {
            HostCommand::Start { identity, argv } => {
                let session = self
                    .container
                    .start(identity.clone(), SessionArgs::new(argv))
                    .await
                    .with_context(|| format!("starting session {identity}"))?;
                session.register_output_sinks([Arc::clone(&self.stdout)]);

                let mut errors = session.error_stream();
                let events = self.events.clone();
                let owner = identity.clone();
                tokio::spawn(async move {
                    while let Some(record) = errors.next().await {
                        let _ = events.send(HostEvent::Error {
                            identity: owner.clone(),
                            record,
                        });
                    }
                });

                let feed = InboundFeed::spawn(Arc::clone(&self.container), identity.clone());
                self.feeds.insert(identity.clone(), feed);
                self.emit(HostEvent::Started { identity });
            }
            HostCommand::Stop { identity } => {
                if let Some(feed) = self.feeds.remove(&identity) {
                    feed.shutdown().await;
                }
                if let Some(session) = self.container.get(&identity).await {
                    session.flush().await;
                }
                let existed = self.container.stop(&identity).await;
                self.emit(HostEvent::Stopped { identity, existed });
            }
            HostCommand::Current { identity } => {
                if let Some(identity) = identity {
                    self.container.set_current(&identity).await?;
                }
                let current = self.container.current().await;
                self.emit(HostEvent::Current {
                    identity: current.map(|s| s.identity().clone()),
                });
            }
            HostCommand::Execute { identity, code } => {
                self.container
                    .execute(&identity, &code)
                    .await
                    .with_context(|| format!("executing in session {identity}"))?;
            }
            HostCommand::Message {
                identity,
                channel,
                msg,
            } => {
                let channel: Channel = channel.parse()?;
                let feed = self
                    .feeds
                    .get(&identity)
                    .with_context(|| format!("no session {identity}"))?;
                feed.push(channel, msg.to_string())?;
            }
        }
        Ok(())
    }

    /// Deliver everything already queued, then stop every session.
    async fn shutdown(mut self) {
        for (_, feed) in self.feeds.drain() {
            feed.shutdown().await;
        }
        for identity in self.container.identities().await {
            if let Some(session) = self.container.get(&identity).await {
                session.flush().await;
            }
        }
        let stopped = self.container.stop_all().await;
        tracing::info!(stopped, "Relay shut down");
    }
}

async fn write_events(mut rx: mpsc::UnboundedReceiver<HostEvent>) {
    let mut stderr = tokio::io::stderr();
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize event: {e}");
                continue;
            }
        };
        line.push('\n');
        if stderr.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_logging(&config.log)?;

    let (connector, mut outbound) = ChannelConnector::new();
    let (events, event_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(event_rx));

    // Stands in for the kernel sockets: requests are handed to whoever drives stdin.
    let forward = {
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                let _ = events.send(HostEvent::Outbound {
                    identity: request.identity,
                    request: request.request,
                });
            }
        })
    };

    let mut host = Host {
        container: Arc::new(SessionContainer::new(connector, &config)),
        feeds: HashMap::new(),
        stdout: Arc::new(WriterSink::new("stdout", tokio::io::stdout())),
        events,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<HostCommand>(&line) {
            Ok(command) => host.run(command).await,
            Err(e) => Err(e).context("parsing command"),
        };
        if let Err(e) = result {
            tracing::warn!("{e:#}");
            host.emit(HostEvent::Failed {
                message: format!("{e:#}"),
            });
        }
    }

    host.shutdown().await;
    // Every outbound sender lives in the dropped sessions, so both tasks wind down.
    forward.await?;
    writer.await?;
    Ok(())
}

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use lapin::Consumer;
use tracing::{debug, error, info, warn};

use followgraph_common::Credentials;

use crate::error::ControlError;
use crate::queue::ReplyPublisher;
use crate::worker::Worker;

/// Target that addresses every worker.
pub const BROADCAST_TARGET: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Credentials,
    Unknown(String),
}

impl Command {
    pub fn parse(s: &str) -> Self {
        match s {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "status" => Self::Status,
            "credentials" => Self::Credentials,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Status => write!(f, "status"),
            Self::Credentials => write!(f, "credentials"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// A control message: `target` and `command` come from headers, the body is
/// command specific.
#[derive(Debug, Clone)]
pub struct ControlCommand {
    pub target: String,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl ControlCommand {
    pub fn new(target: &str, command: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: target.to_string(),
            command: Command::parse(command),
            payload: payload.into(),
        }
    }

    /// Missing headers read as empty strings, which match no worker.
    pub fn from_headers(headers: Option<&FieldTable>, payload: Vec<u8>) -> Self {
        let target = headers.and_then(|h| header_str(h, "target")).unwrap_or_default();
        let command = headers.and_then(|h| header_str(h, "command")).unwrap_or_default();
        Self::new(&target, &command, payload)
    }

    pub fn addressed_to(&self, name: &str) -> bool {
        self.target == name || self.target == BROADCAST_TARGET
    }
}

fn header_str(headers: &FieldTable, key: &str) -> Option<String> {
    headers
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .and_then(|(_, v)| match v {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
            _ => None,
        })
}

/// Applies control commands to one worker.
pub struct ControlChannel {
    worker: Arc<Worker>,
    replies: Arc<dyn ReplyPublisher>,
}

impl ControlChannel {
    pub fn new(worker: Arc<Worker>, replies: Arc<dyn ReplyPublisher>) -> Self {
        Self { worker, replies }
    }

    /// Apply `cmd`. Returns false if it was addressed elsewhere or not understood.
    pub async fn dispatch(&self, cmd: ControlCommand) -> Result<bool, ControlError> {
        if !cmd.addressed_to(self.worker.name()) {
            debug!(
                command_target = cmd.target.as_str(),
                command = %cmd.command,
                "Command for another worker"
            );
            return Ok(false);
        }

        info!(command = %cmd.command, "Control command received");
        match cmd.command {
            Command::Start => {
                self.worker.start().await?;
            }
            Command::Stop => {
                self.worker.stop().await?;
            }
            Command::Status => {
                let status = self.worker.status();
                self.replies.publish_status(&status).await?;
            }
            Command::Credentials => {
                let credentials = Credentials::from_json(&cmd.payload)?;
                self.worker.set_credentials(credentials).await?;
            }
            Command::Unknown(other) => {
                warn!(command = other.as_str(), "Ignoring unknown control command");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Consume control messages until the consumer ends. A failed command is
    /// logged and does not stop the loop.
    pub async fn run(self, mut consumer: Consumer) {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, "Control consumer failed");
                    break;
                }
            };

            let cmd =
                ControlCommand::from_headers(delivery.properties.headers().as_ref(), delivery.data);
            if let Err(e) = self.dispatch(cmd).await {
                error!(error = %e, "Control command failed");
            }
        }
        info!("Control channel closed");
    }
}

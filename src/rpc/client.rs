//! Client side of the daemon's RPC surface.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;

use super::protocol::{JOB_UPDATE, Request, Response, RpcError, ServerMessage};
use crate::core::FlashJob;

pub struct RpcClient {
    addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("Daemon closed the connection")]
    Closed,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<BufReader<OwnedReadHalf>, ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let mut request_json =
            serde_json::to_string(&Request::new(method, params, 1)).map_err(ClientError::Serialize)?;
        request_json.push('\n');
        writer.write_all(request_json.as_bytes()).await?;

        Ok(BufReader::new(reader))
    }

    /// Call a method and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let mut reader = self.send(method, params).await?;
        let response = read_response(&mut reader).await?;
        decode(response)
    }

    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    /// Follow a job until it is terminal, calling `on_update` with every state.
    ///
    /// Returns the last state seen, also when the job is dismissed mid-stream.
    pub async fn watch_job(
        &self,
        job_id: &str,
        mut on_update: impl FnMut(&FlashJob),
    ) -> Result<FlashJob, ClientError> {
        let mut reader = self.send("jobs.subscribe", Some(json!({ "id": job_id }))).await?;
        let mut job: FlashJob = decode(read_response(&mut reader).await?)?;
        on_update(&job);

        while !job.is_terminal() {
            let message = match read_message(&mut reader).await {
                Ok(message) => message,
                Err(ClientError::Closed) => break,
                Err(e) => return Err(e),
            };
            match message {
                ServerMessage::Notification(note) if note.method == JOB_UPDATE => {
                    job = serde_json::from_value(note.params).map_err(ClientError::Parse)?;
                    on_update(&job);
                }
                ServerMessage::Notification(_) => {}
                ServerMessage::Response(response) => return decode(response),
            }
        }
        Ok(job)
    }
}

async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<ServerMessage, ClientError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(ClientError::Closed);
    }
    serde_json::from_str(&line).map_err(ClientError::Parse)
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Response, ClientError> {
    loop {
        if let ServerMessage::Response(response) = read_message(reader).await? {
            return Ok(response);
        }
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let result = response.into_result().map_err(ClientError::Rpc)?;
    serde_json::from_value(result).map_err(ClientError::Parse)
}

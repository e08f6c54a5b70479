//! Network front end. The original benchmark speaks to clients over a pair
//! of ZeroMQ ROUTER sockets (one for requests, one for the multi-client
//! warmup barrier); nothing in this codebase's dependency stack provides a
//! ZeroMQ binding, so the same two-socket shape is expressed over plain
//! TCP with length-delimited framing, in the style of
//! `sweetmcp::daemon`'s tokio-util transport.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    pub query_id: u64,
    pub tenant_id: String,
    pub input: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientResponse {
    pub query_id: u64,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BarrierRequest {
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BarrierResponse {
    pub all_ready: bool,
}

/// What the server calls into for every request. Implemented by whatever
/// wraps a `RunnerPool` + pipeline for the deployment's model.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, tenant_id: &str, input: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<Option<T>, ServerError> {
    match framed.next().await {
        Some(Ok(bytes)) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| ServerError::Malformed(e.to_string()))?;
            Ok(Some(value))
        }
        Some(Err(e)) => Err(ServerError::Io(e)),
        None => Ok(None),
    }
}

async fn write_frame<T: Serialize>(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    value: &T,
) -> Result<(), ServerError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ServerError::Malformed(e.to_string()))?;
    framed.send(Bytes::from(bytes)).await.map_err(ServerError::Io)
}

/// Serve client requests on `addr` until the listener errors or the
/// process is asked to stop. Each connection is handled on its own task;
/// `handler` is invoked on a blocking thread since dispatch itself may
/// block on worker availability.
pub async fn serve_requests(addr: &str, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "client socket listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "client connected");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client_connection(stream, handler).await {
                warn!(%peer, error = %e, "client connection ended with error");
            }
        });
    }
}

async fn handle_client_connection(stream: TcpStream, handler: Arc<dyn RequestHandler>) -> Result<(), ServerError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(req) = read_frame::<ClientRequest>(&mut framed).await? {
        let handler = handler.clone();
        let result = tokio::task::spawn_blocking(move || handler.handle(&req.tenant_id, req.input))
            .await
            .map_err(|e| ServerError::Malformed(format!("handler task panicked: {e}")));

        let response = match result {
            Ok(Ok(output)) => ClientResponse {
                query_id: req.query_id,
                output,
                error: None,
            },
            Ok(Err(e)) => ClientResponse {
                query_id: req.query_id,
                output: Vec::new(),
                error: Some(e.to_string()),
            },
            Err(e) => ClientResponse {
                query_id: req.query_id,
                output: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        write_frame(&mut framed, &response).await?;
    }
    Ok(())
}

/// Block new requests until `num_clients` distinct clients have checked in
/// on `addr`, then release all of them at once. Mirrors the warmup
/// barrier `nShot` uses to make sure every client has finished its warmup
/// passes before timing begins.
pub async fn run_warmup_barrier(addr: &str, num_clients: usize) -> Result<(), ServerError> {
    if num_clients == 0 {
        return Ok(());
    }
    let listener = TcpListener::bind(addr).await?;
    info!(addr, num_clients, "barrier socket listening");

    let mut seen = HashSet::new();
    let mut pending: Vec<Framed<TcpStream, LengthDelimitedCodec>> = Vec::new();

    while seen.len() < num_clients {
        let (stream, peer) = listener.accept().await?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        match read_frame::<BarrierRequest>(&mut framed).await? {
            Some(req) => {
                debug!(%peer, client_id = %req.client_id, "barrier check-in");
                seen.insert(req.client_id);
                pending.push(framed);
            }
            None => {
                warn!(%peer, "barrier connection closed before check-in");
            }
        }
    }

    for mut framed in pending {
        if let Err(e) = write_frame(&mut framed, &BarrierResponse { all_ready: true }).await {
            error!(error = %e, "failed to release a client from the warmup barrier");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;
    impl RequestHandler for EchoHandler {
        fn handle(&self, _tenant_id: &str, input: Vec<u8>) -> anyhow::Result<Vec<u8>> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn client_roundtrip_echoes_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let addr_str = addr.to_string();

        let handler = Arc::new(EchoHandler);
        let server_addr = addr_str.clone();
        let server = tokio::spawn(async move {
            let _ = serve_requests(&server_addr, handler).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stream = TcpStream::connect(&addr_str).await.unwrap();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        write_frame(
            &mut framed,
            &ClientRequest {
                query_id: 1,
                tenant_id: "t".to_string(),
                input: vec![1, 2, 3],
            },
        )
        .await
        .unwrap();
        let resp: ClientResponse = read_frame(&mut framed).await.unwrap().unwrap();
        assert_eq!(resp.output, vec![1, 2, 3]);
        assert_eq!(resp.query_id, 1);
        server.abort();
    }
}

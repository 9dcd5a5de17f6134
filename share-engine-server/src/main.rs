use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;

use async_trait::async_trait;
use clap::Parser;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use share_lifecycle::engine::wire::{EngineReply, EngineRequest, bad_request, dispatch};
use share_lifecycle::engine::{
    DealerEngine, EngineContext, EngineError, MintedShare, Notification, RemoteShareEngine,
};
use share_lifecycle::{Curve, PrivateKey, ShareMaterial};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the trusted-dealer share engine over WebSocket", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9100")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let engine: Arc<dyn RemoteShareEngine> = Arc::new(DevDealer::new());
    let listener = TcpListener::bind(args.bind).await?;
    info!(addr = %args.bind, "share engine listening");

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    };

    let server = async {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(engine, stream, peer).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    };

    tokio::select! {
        _ = server => {},
        _ = shutdown_signal => {},
    }

    info!("server has shut down");
    Ok(())
}

/// Dealer that logs the custodian half of every backup split it issues, so
/// `share_node eject --custodian-share` can be run against this server.
/// Development only: the custodian half is key material.
struct DevDealer {
    dealer: DealerEngine,
}

impl DevDealer {
    fn new() -> Self {
        Self {
            dealer: DealerEngine::new(),
        }
    }

    fn announce(&self, share: &ShareMaterial) {
        if let Some(custodian) = self.dealer.custodian_share(&share.share_pair_id) {
            info!(
                share_pair_id = %share.share_pair_id,
                "custodian share for eject: --custodian-share {}",
                custodian_arg(share.curve, &custodian)
            );
        }
    }
}

/// `curve=share` as `share_node eject` expects it
fn custodian_arg(curve: Curve, custodian_share: &str) -> String {
    format!("{}={}", curve, custodian_share)
}

#[async_trait]
impl RemoteShareEngine for DevDealer {
    async fn generate(&self, ctx: &EngineContext, curve: Curve) -> Result<MintedShare, EngineError> {
        self.dealer.generate(ctx, curve).await
    }

    async fn backup(&self, ctx: &EngineContext, signing_share: &ShareMaterial) -> Result<ShareMaterial, EngineError> {
        let share = self.dealer.backup(ctx, signing_share).await?;
        self.announce(&share);
        Ok(share)
    }

    async fn recover_signing(&self, ctx: &EngineContext, backup_share: &ShareMaterial) -> Result<MintedShare, EngineError> {
        self.dealer.recover_signing(ctx, backup_share).await
    }

    async fn recover_backup(&self, ctx: &EngineContext, backup_share: &ShareMaterial) -> Result<ShareMaterial, EngineError> {
        let share = self.dealer.recover_backup(ctx, backup_share).await?;
        self.announce(&share);
        Ok(share)
    }

    async fn notify(&self, ctx: &EngineContext, notification: &Notification) -> Result<(), EngineError> {
        self.dealer.notify(ctx, notification).await
    }

    async fn eject(&self, client_backup_share: &ShareMaterial, custodian_backup_share: &str) -> Result<PrivateKey, EngineError> {
        self.dealer.eject(client_backup_share, custodian_backup_share).await
    }
}

async fn serve_connection(
    engine: Arc<dyn RemoteShareEngine>,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    debug!(%peer, "client connected");

    // Replies may finish out of order; one task owns the sink
    let ws_sink_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(%peer, error = %e, "websocket error");
                break;
            }
        };

        let engine = engine.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = handle_frame(engine.as_ref(), text.as_str()).await;
            match serde_json::to_string(&reply) {
                Ok(json) => {
                    let _ = tx.send(Message::Text(json.into()));
                }
                Err(e) => warn!(error = %e, "failed to encode reply"),
            }
        });
    }

    drop(tx);
    debug!(%peer, "client disconnected");
    let _ = ws_sink_task.await;
    Ok(())
}

/// Parses one request frame and serves it. Frames that are not a valid
/// request still get a reply, addressed to their `id` when one is present.
async fn handle_frame(engine: &dyn RemoteShareEngine, text: &str) -> EngineReply {
    match serde_json::from_str::<EngineRequest>(text) {
        Ok(request) => {
            debug!(id = request.id, "serving request");
            dispatch(engine, request).await
        }
        Err(e) => {
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                .unwrap_or(0);
            warn!(id, error = %e, "invalid request frame");
            bad_request(id, &e.to_string())
        }
    }
}

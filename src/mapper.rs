use crate::config::{BrokerConfig, RuleSet};
use crate::router::{Outcome, Router};
use crate::transport::{subscriptions, ConnectionError, InboundMessage, MqttTransport};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, info_span, warn, Instrument, Span};

/// How long shutdown waits for queued publishes and the DISCONNECT to be sent.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Connects to the broker and feeds every delivered message through the router.
pub struct Mapper {
    rules: Arc<RuleSet>,
    broker: BrokerConfig,
    span: Span,
}

impl Mapper {
    pub fn new(rules: RuleSet, broker: BrokerConfig) -> Self {
        let span = info_span!("mapper", broker = %broker.broker, port = broker.port);
        Self {
            rules: Arc::new(rules),
            broker,
            span,
        }
    }

    /// Connect, then process messages until `shutdown` resolves. A failed
    /// initial connect, or the transport ceasing to deliver, is an error.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ConnectionError>
    where
        F: Future<Output = ()>,
    {
        let span = self.span.clone();
        async move {
            let (transport, inbound) =
                MqttTransport::connect(&self.broker, subscriptions(&self.rules)).await?;
            info!("Listening on {} topic(s).", self.rules.len());

            let router = Router::new(self.rules.clone(), Arc::new(transport.clone()));

            match serve(&router, inbound, shutdown).await {
                Exit::Shutdown => {
                    info!("Shutdown requested.");
                    if let Err(e) = transport.shutdown(DISCONNECT_GRACE).await {
                        warn!("{}", e);
                    }
                    Ok(())
                }
                Exit::TransportClosed { published } => {
                    let state = transport.state().await;
                    error!(?state, published, "Transport stopped delivering messages.");
                    Err(ConnectionError::EventLoopStopped)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Shutdown,
    TransportClosed { published: usize },
}

async fn serve<F>(router: &Router, inbound: mpsc::Receiver<InboundMessage>, shutdown: F) -> Exit
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => Exit::Shutdown,
        published = receive_loop(router, inbound) => Exit::TransportClosed { published },
    }
}

/// Handle messages strictly one at a time, in delivery order.
async fn receive_loop(router: &Router, mut inbound: mpsc::Receiver<InboundMessage>) -> usize {
    let mut published = 0;
    while let Some(message) = inbound.recv().await {
        if let Outcome::Published(_) = router.handle(message) {
            published += 1;
        }
    }
    published
}

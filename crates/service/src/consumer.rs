use tokio::sync::watch;
use tokio::task::JoinHandle;
use tradetrace_store::TradeRepository;

use crate::broker::Receiver;
use crate::resolver::CausalityResolver;

/// Processes deliveries from `receiver` one at a time until `shutdown` flips
/// to `true` or its sender goes away. A delivery already being handled is
/// finished before the loop exits.
pub async fn run_consumer<R: TradeRepository>(
    receiver: Receiver,
    resolver: CausalityResolver<R>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(queue = receiver.queue(), "consumer started");
    let mut handled = 0u64;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let delivery = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = receiver.receive() => received,
        };
        match delivery {
            Ok(delivery) => {
                resolver.handle_delivery(delivery).await;
                handled += 1;
            }
            Err(err) => {
                tracing::error!(
                    queue = receiver.queue(),
                    error = %err,
                    "receive failed; stopping consumer"
                );
                break;
            }
        }
    }
    tracing::info!(queue = receiver.queue(), handled, "consumer stopped");
}

pub fn spawn_consumer<R: TradeRepository>(
    receiver: Receiver,
    resolver: CausalityResolver<R>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_consumer(receiver, resolver, shutdown))
}

// Dispatch task: consumes decoded frames in wire order, runs subscription
// handlers, answers PINGs, and resolves flush waiters.
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tern_wire::{ClientOp, ServerOp};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::registry::{Delivery, Message};
use super::{Command, Shared};
use crate::error::Error;
use crate::events::ClientEvent;

pub(crate) async fn run_dispatch(
    shared: Arc<Shared>,
    mut frames: mpsc::Receiver<ServerOp>,
    commands: mpsc::UnboundedSender<Command>,
) {
    while let Some(op) = frames.recv().await {
        match op {
            ServerOp::Msg(message) => deliver(&shared, message),
            ServerOp::Ping => {
                let _ = commands.send(Command::Op(ClientOp::Pong));
            }
            ServerOp::Pong => shared.pop_pong(),
            ServerOp::Info(info) => {
                debug!(server_id = %info.server_id, max_payload = info.max_payload, "server info updated");
                *shared.server_info.lock() = Some(*info);
            }
            ServerOp::Ok => {}
            ServerOp::Err(message) => {
                warn!(%message, "server error");
                shared.events.error(Error::Server(message));
            }
        }
    }
    debug!("dispatch task finished");
}

fn deliver(shared: &Shared, message: Message) {
    let sid = message.sid;
    let delivery = shared.registry.lock().dispatch(message);
    let Some(Delivery {
        handler,
        message,
        expired,
    }) = delivery
    else {
        t_counter!("tern_client_dropped_msgs_total").increment(1);
        debug!(%sid, "no live subscription for message");
        return;
    };
    t_counter!("tern_client_msgs_in_total").increment(1);
    if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
        warn!(%sid, "subscription handler panicked");
    }
    if let Some(subject) = expired {
        debug!(%sid, %subject, "subscription reached its max");
        shared.events.emit(ClientEvent::Unsubscribe { sid, subject });
    }
}

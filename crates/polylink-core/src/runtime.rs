//! Wiring between the interface, the dispatch queue and a [`NodeServer`].
//!
//! The network task only decodes and enqueues. Every inbound item, control
//! messages included, is handled by the single consumer thread, which takes
//! the lock on the shared [`NodeServer`] once per item.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::controller::NodeServer;
use crate::error::{PolyError, PolyResult};
use crate::protocol::Inbound;
use crate::queue::{dispatch_queue, DispatchSender};
use crate::transport::Interface;

/// A node server shared between the consumer and integration code.
pub type SharedNodeServer = Arc<Mutex<NodeServer>>;

/// A running NodeServer.
#[derive(Debug)]
pub struct Running {
    server: SharedNodeServer,
    sender: DispatchSender,
    consumer: JoinHandle<usize>,
}

impl Running {
    pub fn server(&self) -> &SharedNodeServer {
        &self.server
    }

    /// Producer handle for commands originating on this side.
    pub fn sender(&self) -> &DispatchSender {
        &self.sender
    }

    /// Block the calling thread until the consumer exits.
    ///
    /// The consumer only exits once every producer is gone, so for a live
    /// interface this is the process run loop.
    pub fn join(self) -> PolyResult<usize> {
        drop(self.sender);
        self.consumer
            .join()
            .map_err(|_| PolyError::State("dispatch consumer panicked".into()))
    }
}

/// Attach `server` to `interface`, start the consumer and connect.
///
/// Must be called from within a tokio runtime.
pub fn serve(interface: &Arc<Interface>, server: NodeServer) -> PolyResult<Running> {
    let runtime = Handle::try_current()
        .map_err(|e| PolyError::Transport(format!("no async runtime: {}", e)))?;
    let (sender, receiver) = dispatch_queue();

    let server = Arc::new(Mutex::new(server));
    server
        .lock()
        .controller_mut()
        .attach_queue(sender.clone(), runtime);

    let producer = sender.clone();
    interface.on_message(move |item: Inbound| {
        if let Err(e) = producer.push(item) {
            error!("{}", e);
        }
    });

    let consumer_server = Arc::clone(&server);
    let consumer = receiver
        .spawn(move |item| consumer_server.lock().handle(item))
        .map_err(|e| PolyError::State(format!("failed to spawn dispatch consumer: {}", e)))?;
    info!("Dispatch consumer started");

    interface.start()?;
    Ok(Running {
        server,
        sender,
        consumer,
    })
}

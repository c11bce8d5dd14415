use std::sync::Arc;

use crate::core::handler::Handler;

/// Background watcher started for every registered handler.
///
/// Implementations must stop on their own once the handler's shutdown token
/// is cancelled.
pub trait HandlerMonitor: Send + Sync + 'static {
    fn watch(&self, handler: Arc<Handler>);
}

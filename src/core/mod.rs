pub mod context;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod stats;
pub mod strategy;
pub mod target;

pub use context::{Middleware, RequestContext};
pub use error::{ProxyError, ProxyResult};
pub use handler::{Handler, HandlerDefinition, HandlerSettings};
pub use router::RouteTree;
pub use server::ProxyServer;
pub use stats::{InMemoryStats, NoopStats, StatsCollector};
pub use strategy::{Strategy, StrategyRegistry};
pub use target::{Target, TargetSpec};

//! Built-in decorators. Each module exposes a `NAME` and a `descriptor` constructor
//! used by [`HandlerRegistration`](crate::handler::HandlerRegistration).

pub mod circuit_breaker;
pub mod inbox;
pub mod logging;
pub mod monitor;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::CircuitBreakerDecorator;
pub use inbox::{InboxCheck, InboxDecorator, OnceOnlyAction};
pub use logging::RequestLoggingDecorator;
pub use monitor::MonitorDecorator;
pub use retry::RetryDecorator;
pub use timeout::TimeoutDecorator;

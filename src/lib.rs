pub mod common;
pub mod config;
pub mod config_validation;
pub mod dialer;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod logging;
pub mod monitoring;
pub mod parse;
pub mod prebuffered;
pub mod proxy;
pub mod relay;
pub mod tls;
pub mod tunnel;

pub use config::{Config, UpstreamSpec};
pub use dialer::{Dialer, DialerSelector, SelectDialer};
pub use dispatch::Dispatcher;
pub use error::ProxyError;
pub use proxy::ProxyServer;
